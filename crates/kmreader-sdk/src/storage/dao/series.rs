//! 系列数据访问层
//!
//! upsert 覆盖服务端字段（last-writer-wins）；offline_policy / download_* /
//! pinned / collection_ids 属于本地状态，同步永不触碰。

use rusqlite::{params, Connection, Row};

use crate::error::Result;
use crate::gateway::SeriesDto;
use crate::identity::composite_id;
use crate::storage::dao::{
    decode_json, encode_json, from_millis, from_opt_millis, opt_millis, to_millis, order_by_ids,
    SeriesFilter, Sort,
};
use crate::storage::entities::{
    KomgaSeries, SeriesDownloadStatus, SeriesLocalState, SeriesMetadata, SeriesOfflinePolicy,
};

/// 系列数据访问对象
pub struct SeriesDao<'a> {
    conn: &'a Connection,
}

impl<'a> SeriesDao<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// 插入或按复合主键整体覆盖服务端字段
    pub fn upsert(&self, instance_id: &str, dto: &SeriesDto) -> Result<()> {
        let sql = "INSERT INTO series (
            id, instance_id, series_id, library_id, name,
            meta_title, meta_title_lock, meta_title_sort, meta_title_sort_lock,
            meta_status, meta_status_lock, meta_summary, meta_summary_lock,
            meta_publisher, meta_publisher_lock, meta_language, meta_language_lock,
            meta_age_rating, meta_age_rating_lock, meta_total_book_count,
            books_count, books_read_count, books_unread_count, books_in_progress_count,
            created, last_modified, deleted, oneshot
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                  ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28)
        ON CONFLICT(id) DO UPDATE SET
            library_id = excluded.library_id,
            name = excluded.name,
            meta_title = excluded.meta_title,
            meta_title_lock = excluded.meta_title_lock,
            meta_title_sort = excluded.meta_title_sort,
            meta_title_sort_lock = excluded.meta_title_sort_lock,
            meta_status = excluded.meta_status,
            meta_status_lock = excluded.meta_status_lock,
            meta_summary = excluded.meta_summary,
            meta_summary_lock = excluded.meta_summary_lock,
            meta_publisher = excluded.meta_publisher,
            meta_publisher_lock = excluded.meta_publisher_lock,
            meta_language = excluded.meta_language,
            meta_language_lock = excluded.meta_language_lock,
            meta_age_rating = excluded.meta_age_rating,
            meta_age_rating_lock = excluded.meta_age_rating_lock,
            meta_total_book_count = excluded.meta_total_book_count,
            books_count = excluded.books_count,
            books_read_count = excluded.books_read_count,
            books_unread_count = excluded.books_unread_count,
            books_in_progress_count = excluded.books_in_progress_count,
            created = excluded.created,
            last_modified = excluded.last_modified,
            deleted = excluded.deleted,
            oneshot = excluded.oneshot";

        self.conn.execute(
            sql,
            params![
                composite_id(instance_id, &dto.id),
                instance_id,
                dto.id,
                dto.library_id,
                dto.name,
                dto.metadata.title,
                dto.metadata.title_lock,
                dto.metadata.title_sort,
                dto.metadata.title_sort_lock,
                dto.metadata.status,
                dto.metadata.status_lock,
                dto.metadata.summary,
                dto.metadata.summary_lock,
                dto.metadata.publisher,
                dto.metadata.publisher_lock,
                dto.metadata.language,
                dto.metadata.language_lock,
                dto.metadata.age_rating,
                dto.metadata.age_rating_lock,
                dto.metadata.total_book_count,
                dto.books_count,
                dto.books_read_count,
                dto.books_unread_count,
                dto.books_in_progress_count,
                to_millis(&dto.created),
                to_millis(&dto.last_modified),
                dto.deleted,
                dto.oneshot,
            ],
        )?;
        Ok(())
    }

    pub fn upsert_list(&self, instance_id: &str, dtos: &[SeriesDto]) -> Result<()> {
        for dto in dtos {
            self.upsert(instance_id, dto)?;
        }
        Ok(())
    }

    pub fn delete(&self, instance_id: &str, series_id: &str) -> Result<bool> {
        let affected = self.conn.execute(
            "DELETE FROM series WHERE id = ?1",
            params![composite_id(instance_id, series_id)],
        )?;
        Ok(affected > 0)
    }

    pub fn get(&self, instance_id: &str, series_id: &str) -> Result<Option<KomgaSeries>> {
        let mut stmt = self.conn.prepare("SELECT * FROM series WHERE id = ?1")?;
        let mut rows = stmt.query_map(params![composite_id(instance_id, series_id)], |row| {
            Self::row_to_series(row)
        })?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// 分页取 remote id；过滤 + 排序语义见 `SeriesFilter` / `Sort`
    pub fn fetch_ids(
        &self,
        instance_id: &str,
        filter: &SeriesFilter,
        sort: &Sort,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<String>> {
        let mut sql = String::from("SELECT series_id FROM series WHERE instance_id = ?1");
        let mut args: Vec<rusqlite::types::Value> = vec![instance_id.to_string().into()];

        if !filter.library_ids.is_empty() {
            let placeholders = vec!["?"; filter.library_ids.len()].join(", ");
            sql.push_str(&format!(" AND library_id IN ({})", placeholders));
            for id in &filter.library_ids {
                args.push(id.clone().into());
            }
        }
        if let Some(search) = filter.search.as_deref().filter(|s| !s.is_empty()) {
            sql.push_str(" AND (name LIKE '%' || ? || '%' OR meta_title LIKE '%' || ? || '%')");
            args.push(search.to_string().into());
            args.push(search.to_string().into());
        }
        if filter.offline_only {
            sql.push_str(" AND (downloaded_books > 0 OR pending_books > 0 OR download_status = 'downloaded')");
        }

        sql.push_str(&format!(
            " ORDER BY {} LIMIT ? OFFSET ?",
            sort.series_order_clause()
        ));
        args.push((limit as i64).into());
        args.push((offset as i64).into());

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), |row| {
            row.get::<_, String>(0)
        })?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    /// 按调用方给定顺序返回实体（上一页 fetch_ids 的结果顺序）
    pub fn fetch_by_ids(&self, instance_id: &str, ids: &[String]) -> Result<Vec<KomgaSeries>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "SELECT * FROM series WHERE instance_id = ? AND series_id IN ({})",
            placeholders
        );
        let mut args: Vec<rusqlite::types::Value> = vec![instance_id.to_string().into()];
        for id in ids {
            args.push(id.clone().into());
        }
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), |row| {
            Self::row_to_series(row)
        })?;
        let mut series = Vec::new();
        for row in rows {
            series.push(row?);
        }
        Ok(order_by_ids(series, ids, |s| s.series_id.as_str()))
    }

    pub fn update_offline_policy(
        &self,
        instance_id: &str,
        series_id: &str,
        policy: SeriesOfflinePolicy,
    ) -> Result<bool> {
        let affected = self.conn.execute(
            "UPDATE series SET offline_policy = ?1 WHERE id = ?2",
            params![policy.as_str(), composite_id(instance_id, series_id)],
        )?;
        Ok(affected > 0)
    }

    pub fn set_pinned(&self, instance_id: &str, series_id: &str, pinned: bool) -> Result<()> {
        self.conn.execute(
            "UPDATE series SET pinned = ?1 WHERE id = ?2",
            params![pinned, composite_id(instance_id, series_id)],
        )?;
        Ok(())
    }

    pub fn update_collection_ids(
        &self,
        instance_id: &str,
        series_id: &str,
        collection_ids: &[String],
    ) -> Result<()> {
        self.conn.execute(
            "UPDATE series SET collection_ids = ?1 WHERE id = ?2",
            params![
                encode_json(&collection_ids),
                composite_id(instance_id, series_id)
            ],
        )?;
        Ok(())
    }

    /// 写回聚合下载状态（由 db_actor 扫描成员书目后计算）
    pub fn update_download_aggregates(
        &self,
        instance_id: &str,
        series_id: &str,
        status: SeriesDownloadStatus,
        downloaded_books: i64,
        pending_books: i64,
        downloaded_size: i64,
        download_at: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<()> {
        self.conn.execute(
            "UPDATE series SET download_status = ?1, downloaded_books = ?2,
                    pending_books = ?3, downloaded_size = ?4, download_at = ?5
             WHERE id = ?6",
            params![
                status.as_raw(),
                downloaded_books,
                pending_books,
                downloaded_size,
                opt_millis(&download_at),
                composite_id(instance_id, series_id)
            ],
        )?;
        Ok(())
    }

    pub fn count(&self, instance_id: &str) -> Result<i64> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM series WHERE instance_id = ?1",
            params![instance_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn clear_instance(&self, instance_id: &str) -> Result<()> {
        self.conn.execute(
            "DELETE FROM series WHERE instance_id = ?1",
            params![instance_id],
        )?;
        Ok(())
    }

    fn row_to_series(row: &Row) -> rusqlite::Result<KomgaSeries> {
        let policy_raw: String = row.get("offline_policy")?;
        let downloaded_books: i64 = row.get("downloaded_books")?;
        let pending_books: i64 = row.get("pending_books")?;
        let books_count: i64 = row.get("books_count")?;
        let collection_ids_raw: String = row.get("collection_ids")?;
        Ok(KomgaSeries {
            id: row.get("id")?,
            instance_id: row.get("instance_id")?,
            series_id: row.get("series_id")?,
            library_id: row.get("library_id")?,
            name: row.get("name")?,
            metadata: SeriesMetadata {
                title: row.get("meta_title")?,
                title_lock: row.get("meta_title_lock")?,
                title_sort: row.get("meta_title_sort")?,
                title_sort_lock: row.get("meta_title_sort_lock")?,
                status: row.get("meta_status")?,
                status_lock: row.get("meta_status_lock")?,
                summary: row.get("meta_summary")?,
                summary_lock: row.get("meta_summary_lock")?,
                publisher: row.get("meta_publisher")?,
                publisher_lock: row.get("meta_publisher_lock")?,
                language: row.get("meta_language")?,
                language_lock: row.get("meta_language_lock")?,
                age_rating: row.get("meta_age_rating")?,
                age_rating_lock: row.get("meta_age_rating_lock")?,
                total_book_count: row.get("meta_total_book_count")?,
            },
            books_count,
            books_read_count: row.get("books_read_count")?,
            books_unread_count: row.get("books_unread_count")?,
            books_in_progress_count: row.get("books_in_progress_count")?,
            created: from_millis(row.get("created")?),
            last_modified: from_millis(row.get("last_modified")?),
            deleted: row.get("deleted")?,
            oneshot: row.get("oneshot")?,
            collection_ids: decode_json(&collection_ids_raw),
            local: SeriesLocalState {
                offline_policy: SeriesOfflinePolicy::from_raw(&policy_raw),
                download_status: SeriesDownloadStatus::from_counts(
                    downloaded_books,
                    pending_books,
                    books_count,
                ),
                downloaded_books,
                pending_books,
                downloaded_size: row.get("downloaded_size")?,
                download_at: from_opt_millis(row.get("download_at")?),
                pinned: row.get("pinned")?,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::dao::test_util::test_conn;
    use crate::storage::dao::SortField;
    use chrono::{TimeZone, Utc};

    fn dto(id: &str, title_sort: &str) -> SeriesDto {
        SeriesDto {
            id: id.to_string(),
            library_id: "lib-1".to_string(),
            name: title_sort.to_string(),
            books_count: 3,
            books_read_count: 0,
            books_unread_count: 3,
            books_in_progress_count: 0,
            metadata: crate::gateway::SeriesMetadataDto {
                title: title_sort.to_string(),
                title_sort: title_sort.to_string(),
                ..Default::default()
            },
            created: Utc.timestamp_millis_opt(1_000).unwrap(),
            last_modified: Utc.timestamp_millis_opt(2_000).unwrap(),
            deleted: false,
            oneshot: false,
        }
    }

    #[test]
    fn upsert_is_idempotent() {
        let conn = test_conn();
        let dao = SeriesDao::new(&conn);

        dao.upsert_list("inst", &[dto("s1", "Akira"), dto("s2", "Blame")])
            .unwrap();
        assert_eq!(dao.count("inst").unwrap(), 2);

        // 第二次相同同步不产生新行
        dao.upsert_list("inst", &[dto("s1", "Akira"), dto("s2", "Blame")])
            .unwrap();
        assert_eq!(dao.count("inst").unwrap(), 2);

        let series = dao.get("inst", "s1").unwrap().unwrap();
        assert_eq!(series.id, "inst_s1");
        assert_eq!(series.metadata.title_sort, "Akira");
    }

    #[test]
    fn upsert_preserves_local_state() {
        let conn = test_conn();
        let dao = SeriesDao::new(&conn);

        dao.upsert("inst", &dto("s1", "Akira")).unwrap();
        dao.update_offline_policy("inst", "s1", SeriesOfflinePolicy::UnreadOnly)
            .unwrap();
        dao.set_pinned("inst", "s1", true).unwrap();

        // 再次同步覆盖服务端字段，但本地状态保留
        let mut updated = dto("s1", "Akira Vol.2");
        updated.books_count = 4;
        dao.upsert("inst", &updated).unwrap();

        let series = dao.get("inst", "s1").unwrap().unwrap();
        assert_eq!(series.books_count, 4);
        assert_eq!(series.metadata.title_sort, "Akira Vol.2");
        assert_eq!(series.local.offline_policy, SeriesOfflinePolicy::UnreadOnly);
        assert!(series.local.pinned);
    }

    #[test]
    fn same_remote_id_on_two_instances_stays_separate() {
        let conn = test_conn();
        let dao = SeriesDao::new(&conn);
        dao.upsert("inst-a", &dto("s1", "Akira")).unwrap();
        dao.upsert("inst-b", &dto("s1", "Akira")).unwrap();
        assert_eq!(dao.count("inst-a").unwrap(), 1);
        assert_eq!(dao.count("inst-b").unwrap(), 1);
    }

    #[test]
    fn fetch_ids_pagination_is_stable() {
        let conn = test_conn();
        let dao = SeriesDao::new(&conn);
        for (i, title) in ["Akira", "Blame", "Claymore", "Dorohedoro"].iter().enumerate() {
            dao.upsert("inst", &dto(&format!("s{}", i), title)).unwrap();
        }

        let filter = SeriesFilter::default();
        let sort = Sort::default();
        let first = dao.fetch_ids("inst", &filter, &sort, 0, 2).unwrap();
        let second = dao.fetch_ids("inst", &filter, &sort, 2, 2).unwrap();
        let whole = dao.fetch_ids("inst", &filter, &sort, 0, 4).unwrap();

        let mut windows = first.clone();
        windows.extend(second);
        // 两次窗口拼接与一次整页一致：无重复、无缺口
        assert_eq!(windows, whole);
        assert_eq!(whole.len(), 4);
    }

    #[test]
    fn fetch_ids_search_and_library_filter() {
        let conn = test_conn();
        let dao = SeriesDao::new(&conn);
        dao.upsert("inst", &dto("s1", "Akira")).unwrap();
        let mut other = dto("s2", "Blame");
        other.library_id = "lib-2".to_string();
        dao.upsert("inst", &other).unwrap();

        let filter = SeriesFilter {
            search: Some("kir".to_string()),
            ..Default::default()
        };
        let ids = dao
            .fetch_ids("inst", &filter, &Sort::default(), 0, 10)
            .unwrap();
        assert_eq!(ids, vec!["s1"]);

        let filter = SeriesFilter {
            library_ids: vec!["lib-2".to_string()],
            ..Default::default()
        };
        let ids = dao
            .fetch_ids("inst", &filter, &Sort::default(), 0, 10)
            .unwrap();
        assert_eq!(ids, vec!["s2"]);
    }

    #[test]
    fn fetch_by_ids_keeps_request_order() {
        let conn = test_conn();
        let dao = SeriesDao::new(&conn);
        dao.upsert("inst", &dto("s1", "Akira")).unwrap();
        dao.upsert("inst", &dto("s2", "Blame")).unwrap();
        dao.upsert("inst", &dto("s3", "Claymore")).unwrap();

        let ids = vec!["s3".to_string(), "s1".to_string(), "s2".to_string()];
        let series = dao.fetch_by_ids("inst", &ids).unwrap();
        let got: Vec<&str> = series.iter().map(|s| s.series_id.as_str()).collect();
        assert_eq!(got, vec!["s3", "s1", "s2"]);
    }

    #[test]
    fn sort_by_books_count_desc() {
        let conn = test_conn();
        let dao = SeriesDao::new(&conn);
        let mut a = dto("s1", "Akira");
        a.books_count = 1;
        let mut b = dto("s2", "Blame");
        b.books_count = 9;
        dao.upsert("inst", &a).unwrap();
        dao.upsert("inst", &b).unwrap();

        let sort = Sort::new(SortField::BooksCount, false);
        let ids = dao
            .fetch_ids("inst", &SeriesFilter::default(), &sort, 0, 10)
            .unwrap();
        assert_eq!(ids, vec!["s2", "s1"]);
    }
}
