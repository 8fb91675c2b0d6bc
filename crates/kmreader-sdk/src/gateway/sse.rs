//! SSE 事件类型与 wire 解析
//!
//! Komga 的推送通道按 `event:` / `data:` 行帧发送 JSON 载荷。
//! `SseFrameParser` 做增量行解析（跨 chunk 安全），`parse_event`
//! 把 (type, data) 帧转成强类型事件；未知类型丢弃。

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeriesSse {
    pub series_id: String,
    pub library_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookSse {
    pub book_id: String,
    pub series_id: String,
    pub library_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionSse {
    pub collection_id: String,
    #[serde(default)]
    pub series_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadListSse {
    pub read_list_id: String,
    #[serde(default)]
    pub book_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadProgressSse {
    pub book_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadProgressSeriesSse {
    pub series_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThumbnailBookSse {
    pub book_id: String,
    pub series_id: String,
    #[serde(default)]
    pub selected: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThumbnailSeriesSse {
    pub series_id: String,
    #[serde(default)]
    pub selected: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThumbnailCollectionSse {
    pub collection_id: String,
    #[serde(default)]
    pub selected: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThumbnailReadListSse {
    pub read_list_id: String,
    #[serde(default)]
    pub selected: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskQueueSse {
    #[serde(default)]
    pub count: i64,
    #[serde(default)]
    pub count_by_type: HashMap<String, i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionExpiredSse {
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookImportSse {
    pub book_id: Option<String>,
    #[serde(default)]
    pub source_file: String,
    #[serde(default)]
    pub success: bool,
    pub message: Option<String>,
}

/// 服务端推送事件（类型受控枚举，与服务端事件名一一对应）
#[derive(Debug, Clone)]
pub enum SseEvent {
    SeriesAdded(SeriesSse),
    SeriesChanged(SeriesSse),
    SeriesDeleted(SeriesSse),
    BookAdded(BookSse),
    BookChanged(BookSse),
    BookDeleted(BookSse),
    BookImported(BookImportSse),
    CollectionAdded(CollectionSse),
    CollectionChanged(CollectionSse),
    CollectionDeleted(CollectionSse),
    ReadListAdded(ReadListSse),
    ReadListChanged(ReadListSse),
    ReadListDeleted(ReadListSse),
    ReadProgressChanged(ReadProgressSse),
    ReadProgressDeleted(ReadProgressSse),
    ReadProgressSeriesChanged(ReadProgressSeriesSse),
    ReadProgressSeriesDeleted(ReadProgressSeriesSse),
    ThumbnailBookAdded(ThumbnailBookSse),
    ThumbnailBookDeleted(ThumbnailBookSse),
    ThumbnailSeriesAdded(ThumbnailSeriesSse),
    ThumbnailSeriesDeleted(ThumbnailSeriesSse),
    ThumbnailCollectionAdded(ThumbnailCollectionSse),
    ThumbnailCollectionDeleted(ThumbnailCollectionSse),
    ThumbnailReadListAdded(ThumbnailReadListSse),
    ThumbnailReadListDeleted(ThumbnailReadListSse),
    TaskQueueStatus(TaskQueueSse),
    SessionExpired(SessionExpiredSse),
}

/// 解析一帧 (event, data)；未知事件或载荷解码失败返回 None
pub fn parse_event(event_type: &str, data: &str) -> Option<SseEvent> {
    fn decode<T: serde::de::DeserializeOwned>(data: &str) -> Option<T> {
        match serde_json::from_str(data) {
            Ok(value) => Some(value),
            Err(e) => {
                debug!("SSE 载荷解码失败: {}", e);
                None
            }
        }
    }

    let event = match event_type {
        "SeriesAdded" => SseEvent::SeriesAdded(decode(data)?),
        "SeriesChanged" => SseEvent::SeriesChanged(decode(data)?),
        "SeriesDeleted" => SseEvent::SeriesDeleted(decode(data)?),
        "BookAdded" => SseEvent::BookAdded(decode(data)?),
        "BookChanged" => SseEvent::BookChanged(decode(data)?),
        "BookDeleted" => SseEvent::BookDeleted(decode(data)?),
        "BookImported" => SseEvent::BookImported(decode(data)?),
        "CollectionAdded" => SseEvent::CollectionAdded(decode(data)?),
        "CollectionChanged" => SseEvent::CollectionChanged(decode(data)?),
        "CollectionDeleted" => SseEvent::CollectionDeleted(decode(data)?),
        "ReadListAdded" => SseEvent::ReadListAdded(decode(data)?),
        "ReadListChanged" => SseEvent::ReadListChanged(decode(data)?),
        "ReadListDeleted" => SseEvent::ReadListDeleted(decode(data)?),
        "ReadProgressChanged" => SseEvent::ReadProgressChanged(decode(data)?),
        "ReadProgressDeleted" => SseEvent::ReadProgressDeleted(decode(data)?),
        "ReadProgressSeriesChanged" => SseEvent::ReadProgressSeriesChanged(decode(data)?),
        "ReadProgressSeriesDeleted" => SseEvent::ReadProgressSeriesDeleted(decode(data)?),
        "ThumbnailBookAdded" => SseEvent::ThumbnailBookAdded(decode(data)?),
        "ThumbnailBookDeleted" => SseEvent::ThumbnailBookDeleted(decode(data)?),
        "ThumbnailSeriesAdded" => SseEvent::ThumbnailSeriesAdded(decode(data)?),
        "ThumbnailSeriesDeleted" => SseEvent::ThumbnailSeriesDeleted(decode(data)?),
        "ThumbnailSeriesCollectionAdded" => SseEvent::ThumbnailCollectionAdded(decode(data)?),
        "ThumbnailSeriesCollectionDeleted" => SseEvent::ThumbnailCollectionDeleted(decode(data)?),
        "ThumbnailReadListAdded" => SseEvent::ThumbnailReadListAdded(decode(data)?),
        "ThumbnailReadListDeleted" => SseEvent::ThumbnailReadListDeleted(decode(data)?),
        "TaskQueueStatus" => SseEvent::TaskQueueStatus(decode(data)?),
        "SessionExpired" => SseEvent::SessionExpired(decode(data)?),
        other => {
            debug!("未知 SSE 事件类型: {}", other);
            return None;
        }
    };
    Some(event)
}

/// 增量帧解析器：feed 任意大小的字节块，产出完整的 (event, data) 帧
#[derive(Debug, Default)]
pub struct SseFrameParser {
    line_buffer: String,
    event_type: Option<String>,
    data: Option<String>,
}

impl SseFrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<(String, String)> {
        let mut frames = Vec::new();
        for &byte in chunk {
            if byte == b'\n' {
                let line = std::mem::take(&mut self.line_buffer);
                if let Some(frame) = self.process_line(line.trim_end_matches('\r')) {
                    frames.push(frame);
                }
            } else {
                // 非 UTF-8 字节按替换字符处理；事件载荷始终是 ASCII JSON
                self.line_buffer
                    .push(char::from_u32(byte as u32).unwrap_or('\u{FFFD}'));
            }
        }
        frames
    }

    fn process_line(&mut self, line: &str) -> Option<(String, String)> {
        if line.is_empty() {
            // 空行 = 一帧结束
            let event_type = self.event_type.take();
            let data = self.data.take();
            if let (Some(event_type), Some(data)) = (event_type, data) {
                return Some((event_type, data));
            }
            return None;
        }
        if line.starts_with(':') {
            // 注释行（心跳），只说明连接还活着
            return None;
        }
        if let Some(rest) = line.strip_prefix("event:") {
            self.event_type = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("data:") {
            let rest = rest.trim();
            match &mut self.data {
                None => self.data = Some(rest.to_string()),
                // 多行 data
                Some(existing) => {
                    existing.push('\n');
                    existing.push_str(rest);
                }
            }
        }
        // id: / retry: 行忽略
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parser_handles_split_chunks() {
        let mut parser = SseFrameParser::new();
        let frames = parser.feed(b"event: BookAdded\ndata: {\"bookId\":\"b1\",");
        assert!(frames.is_empty());
        let frames = parser.feed(b"\"seriesId\":\"s1\",\"libraryId\":\"l1\"}\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].0, "BookAdded");

        let event = parse_event(&frames[0].0, &frames[0].1).unwrap();
        match event {
            SseEvent::BookAdded(dto) => {
                assert_eq!(dto.book_id, "b1");
                assert_eq!(dto.series_id, "s1");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn parser_ignores_comments_and_unknown_fields() {
        let mut parser = SseFrameParser::new();
        let frames = parser.feed(b": heartbeat\nid: 7\nretry: 1000\n\n");
        assert!(frames.is_empty());
    }

    #[test]
    fn multi_line_data_is_joined() {
        let mut parser = SseFrameParser::new();
        let frames = parser.feed(b"event: X\ndata: line1\ndata: line2\n\n");
        assert_eq!(frames[0].1, "line1\nline2");
    }

    #[test]
    fn unknown_event_type_is_dropped() {
        assert!(parse_event("SomethingNew", "{}").is_none());
    }

    #[test]
    fn task_queue_payload_decodes() {
        let event = parse_event(
            "TaskQueueStatus",
            r#"{"count":3,"countByType":{"SCAN":2,"ANALYZE":1}}"#,
        )
        .unwrap();
        match event {
            SseEvent::TaskQueueStatus(dto) => {
                assert_eq!(dto.count, 3);
                assert_eq!(dto.count_by_type.get("SCAN"), Some(&2));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
