use std::fmt;

use rusqlite;

/// HTTP 错误响应正文最多保留的字符数（用于诊断展示）
const MAX_RESPONSE_SNIPPET: usize = 500;

#[derive(Debug)]
pub enum KMReaderError {
    SqliteError(rusqlite::Error),
    JsonError(String),
    KvStore(String),
    IO(String),
    Database(String),
    Migration(String),
    NotInitialized(String),
    InvalidUrl(String),
    /// 无网络 / 当前处于离线模式
    Offline,
    Timeout(String),
    Cancelled,
    /// 传输层错误（连接失败、TLS、流中断等）
    Transport(String),
    /// HTTP 语义错误（400/401/403/404/429/5xx），保留 URL 与截断后的响应正文
    Http {
        status: u16,
        message: String,
        url: Option<String>,
        body: Option<String>,
    },
    /// 解码 / schema 错误
    Decode {
        message: String,
        url: Option<String>,
    },
    InvalidInput(String),
    Validation(String),
    NotFound(String),
    ShuttingDown(String),
}

impl fmt::Display for KMReaderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KMReaderError::SqliteError(e) => write!(f, "SQLite error: {}", e),
            KMReaderError::JsonError(e) => write!(f, "JSON error: {}", e),
            KMReaderError::KvStore(e) => write!(f, "KV store error: {}", e),
            KMReaderError::IO(e) => write!(f, "IO error: {}", e),
            KMReaderError::Database(e) => write!(f, "Database error: {}", e),
            KMReaderError::Migration(e) => write!(f, "Migration error: {}", e),
            KMReaderError::NotInitialized(e) => write!(f, "Not initialized: {}", e),
            KMReaderError::InvalidUrl(e) => write!(f, "Invalid URL: {}", e),
            KMReaderError::Offline => write!(f, "Offline"),
            KMReaderError::Timeout(e) => write!(f, "Timeout: {}", e),
            KMReaderError::Cancelled => write!(f, "Cancelled"),
            KMReaderError::Transport(e) => write!(f, "Transport error: {}", e),
            KMReaderError::Http {
                status,
                message,
                url,
                body,
            } => {
                write!(f, "Server error ({}): {}", status, message)?;
                if let Some(url) = url {
                    write!(f, "\nURL: {}", url)?;
                }
                if let Some(body) = body {
                    write!(f, "\nResponse: {}", body)?;
                }
                Ok(())
            }
            KMReaderError::Decode { message, url } => {
                write!(f, "Decoding error: {}", message)?;
                if let Some(url) = url {
                    write!(f, "\nURL: {}", url)?;
                }
                Ok(())
            }
            KMReaderError::InvalidInput(e) => write!(f, "Invalid input: {}", e),
            KMReaderError::Validation(e) => write!(f, "Validation error: {}", e),
            KMReaderError::NotFound(e) => write!(f, "Not found: {}", e),
            KMReaderError::ShuttingDown(e) => write!(f, "Shutting down: {}", e),
        }
    }
}

impl std::error::Error for KMReaderError {}

impl From<rusqlite::Error> for KMReaderError {
    fn from(error: rusqlite::Error) -> Self {
        KMReaderError::SqliteError(error)
    }
}

impl From<serde_json::Error> for KMReaderError {
    fn from(error: serde_json::Error) -> Self {
        KMReaderError::JsonError(error.to_string())
    }
}

impl From<std::io::Error> for KMReaderError {
    fn from(error: std::io::Error) -> Self {
        KMReaderError::IO(error.to_string())
    }
}

impl From<reqwest::Error> for KMReaderError {
    fn from(error: reqwest::Error) -> Self {
        let url = error.url().map(|u| u.to_string());
        if error.is_timeout() {
            KMReaderError::Timeout(url.unwrap_or_default())
        } else if error.is_decode() {
            KMReaderError::Decode {
                message: error.to_string(),
                url,
            }
        } else if error.is_connect() {
            KMReaderError::Transport(format!("连接失败: {}", error))
        } else {
            KMReaderError::Transport(error.to_string())
        }
    }
}

impl KMReaderError {
    /// 从 HTTP 状态码 + 响应正文构造语义错误（正文截断后保留）
    pub fn from_status(status: u16, url: impl Into<String>, body: &str) -> Self {
        let message = match status {
            400 => "Bad request".to_string(),
            401 => "Unauthorized".to_string(),
            403 => "Forbidden".to_string(),
            404 => "Not found".to_string(),
            429 => "Too many requests".to_string(),
            500..=599 => "Internal server error".to_string(),
            _ => format!("Unexpected status {}", status),
        };
        KMReaderError::Http {
            status,
            message,
            url: Some(url.into()),
            body: Self::truncate_body(body),
        }
    }

    fn truncate_body(body: &str) -> Option<String> {
        if body.is_empty() {
            return None;
        }
        if body.chars().count() <= MAX_RESPONSE_SNIPPET {
            return Some(body.to_string());
        }
        let snippet: String = body.chars().take(MAX_RESPONSE_SNIPPET).collect();
        Some(format!("{}...", snippet))
    }

    /// HTTP 404（实体已在服务端被删除时触发本地删除）
    pub fn is_not_found(&self) -> bool {
        matches!(self, KMReaderError::Http { status: 404, .. })
    }

    /// 是否属于网络类错误：下载中断时保持 pending 而不是标记 failed
    pub fn is_network_related(&self) -> bool {
        matches!(
            self,
            KMReaderError::Offline
                | KMReaderError::Timeout(_)
                | KMReaderError::Cancelled
                | KMReaderError::Transport(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, KMReaderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_status_truncates_body() {
        let body = "x".repeat(600);
        let err = KMReaderError::from_status(500, "http://demo/api", &body);
        match err {
            KMReaderError::Http { status, body, .. } => {
                assert_eq!(status, 500);
                let body = body.unwrap();
                assert!(body.ends_with("..."));
                assert_eq!(body.chars().count(), MAX_RESPONSE_SNIPPET + 3);
            }
            _ => panic!("expected http error"),
        }
    }

    #[test]
    fn test_network_related_classification() {
        assert!(KMReaderError::Offline.is_network_related());
        assert!(KMReaderError::Timeout("t".into()).is_network_related());
        assert!(!KMReaderError::from_status(500, "http://demo", "").is_network_related());
        assert!(KMReaderError::from_status(404, "http://demo", "").is_not_found());
    }
}
