//! 书目数据访问层
//!
//! 服务端字段（含服务端权威的阅读进度）整体覆盖；
//! download_* / read_list_ids / pages 为本地状态，同步不触碰。

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::Result;
use crate::gateway::BookDto;
use crate::identity::composite_id;
use crate::storage::dao::{
    decode_json, encode_json, from_millis, from_opt_millis, opt_millis, order_by_ids, to_millis,
};
use crate::storage::entities::{
    BookDownloadState, BookMetadata, BookPage, DownloadStatus, KomgaBook, ReadProgress,
};

/// 书目数据访问对象
pub struct BookDao<'a> {
    conn: &'a Connection,
}

impl<'a> BookDao<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn upsert(&self, instance_id: &str, dto: &BookDto) -> Result<()> {
        let sql = "INSERT INTO book (
            id, instance_id, book_id, series_id, library_id, name,
            size_bytes, page_count, media_profile,
            meta_title, meta_title_lock, meta_number, meta_number_lock,
            meta_number_sort, meta_number_sort_lock, meta_summary, meta_summary_lock,
            meta_release_date, meta_release_date_lock, meta_isbn, meta_isbn_lock,
            meta_authors, meta_authors_lock, meta_tags, meta_tags_lock,
            meta_links, meta_links_lock,
            progress_page, progress_completed, progress_read_date,
            progress_created, progress_last_modified,
            created, last_modified, deleted, oneshot
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                  ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29, ?30,
                  ?31, ?32, ?33, ?34, ?35, ?36)
        ON CONFLICT(id) DO UPDATE SET
            series_id = excluded.series_id,
            library_id = excluded.library_id,
            name = excluded.name,
            size_bytes = excluded.size_bytes,
            page_count = excluded.page_count,
            media_profile = excluded.media_profile,
            meta_title = excluded.meta_title,
            meta_title_lock = excluded.meta_title_lock,
            meta_number = excluded.meta_number,
            meta_number_lock = excluded.meta_number_lock,
            meta_number_sort = excluded.meta_number_sort,
            meta_number_sort_lock = excluded.meta_number_sort_lock,
            meta_summary = excluded.meta_summary,
            meta_summary_lock = excluded.meta_summary_lock,
            meta_release_date = excluded.meta_release_date,
            meta_release_date_lock = excluded.meta_release_date_lock,
            meta_isbn = excluded.meta_isbn,
            meta_isbn_lock = excluded.meta_isbn_lock,
            meta_authors = excluded.meta_authors,
            meta_authors_lock = excluded.meta_authors_lock,
            meta_tags = excluded.meta_tags,
            meta_tags_lock = excluded.meta_tags_lock,
            meta_links = excluded.meta_links,
            meta_links_lock = excluded.meta_links_lock,
            progress_page = excluded.progress_page,
            progress_completed = excluded.progress_completed,
            progress_read_date = excluded.progress_read_date,
            progress_created = excluded.progress_created,
            progress_last_modified = excluded.progress_last_modified,
            created = excluded.created,
            last_modified = excluded.last_modified,
            deleted = excluded.deleted,
            oneshot = excluded.oneshot";

        let progress = dto.read_progress.as_ref();
        self.conn.execute(
            sql,
            params![
                composite_id(instance_id, &dto.id),
                instance_id,
                dto.id,
                dto.series_id,
                dto.library_id,
                dto.name,
                dto.size_bytes,
                dto.media.pages_count,
                dto.media.media_profile,
                dto.metadata.title,
                dto.metadata.title_lock,
                dto.metadata.number,
                dto.metadata.number_lock,
                dto.metadata.number_sort,
                dto.metadata.number_sort_lock,
                dto.metadata.summary,
                dto.metadata.summary_lock,
                dto.metadata.release_date,
                dto.metadata.release_date_lock,
                dto.metadata.isbn,
                dto.metadata.isbn_lock,
                encode_json(&dto.metadata.authors),
                dto.metadata.authors_lock,
                encode_json(&dto.metadata.tags),
                dto.metadata.tags_lock,
                encode_json(&dto.metadata.links),
                dto.metadata.links_lock,
                progress.map(|p| p.page),
                progress.map(|p| p.completed),
                progress.and_then(|p| opt_millis(&p.read_date)),
                progress.and_then(|p| opt_millis(&p.created)),
                progress.and_then(|p| opt_millis(&p.last_modified)),
                to_millis(&dto.created),
                to_millis(&dto.last_modified),
                dto.deleted,
                dto.oneshot,
            ],
        )?;
        Ok(())
    }

    pub fn upsert_list(&self, instance_id: &str, dtos: &[BookDto]) -> Result<()> {
        for dto in dtos {
            self.upsert(instance_id, dto)?;
        }
        Ok(())
    }

    pub fn delete(&self, instance_id: &str, book_id: &str) -> Result<bool> {
        let affected = self.conn.execute(
            "DELETE FROM book WHERE id = ?1",
            params![composite_id(instance_id, book_id)],
        )?;
        Ok(affected > 0)
    }

    pub fn get(&self, instance_id: &str, book_id: &str) -> Result<Option<KomgaBook>> {
        let mut stmt = self.conn.prepare("SELECT * FROM book WHERE id = ?1")?;
        let mut rows = stmt.query_map(params![composite_id(instance_id, book_id)], |row| {
            Self::row_to_book(row)
        })?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// 一个系列的全部书目（策略评估、聚合状态重算用），按 number_sort 排序
    pub fn fetch_for_series(&self, instance_id: &str, series_id: &str) -> Result<Vec<KomgaBook>> {
        let mut stmt = self.conn.prepare(
            "SELECT * FROM book WHERE instance_id = ?1 AND series_id = ?2
             ORDER BY meta_number_sort ASC",
        )?;
        let rows = stmt.query_map(params![instance_id, series_id], |row| {
            Self::row_to_book(row)
        })?;
        let mut books = Vec::new();
        for row in rows {
            books.push(row?);
        }
        Ok(books)
    }

    /// 一个系列的书目 id 分页
    pub fn fetch_series_book_ids(
        &self,
        instance_id: &str,
        series_id: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT book_id FROM book WHERE instance_id = ?1 AND series_id = ?2
             ORDER BY meta_number_sort ASC LIMIT ?3 OFFSET ?4",
        )?;
        let rows = stmt.query_map(
            params![instance_id, series_id, limit as i64, offset as i64],
            |row| row.get::<_, String>(0),
        )?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    pub fn fetch_by_ids(&self, instance_id: &str, ids: &[String]) -> Result<Vec<KomgaBook>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "SELECT * FROM book WHERE instance_id = ? AND book_id IN ({})",
            placeholders
        );
        let mut args: Vec<rusqlite::types::Value> = vec![instance_id.to_string().into()];
        for id in ids {
            args.push(id.clone().into());
        }
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), |row| {
            Self::row_to_book(row)
        })?;
        let mut books = Vec::new();
        for row in rows {
            books.push(row?);
        }
        Ok(order_by_ids(books, ids, |b| b.book_id.as_str()))
    }

    /// 下载状态写回；Downloading 落盘为 pending（重启后自动恢复排队）
    pub fn update_download_status(
        &self,
        instance_id: &str,
        book_id: &str,
        status: &DownloadStatus,
        downloaded_size: Option<i64>,
        download_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let affected = self.conn.execute(
            "UPDATE book SET download_status = ?1, download_error = ?2,
                    downloaded_size = COALESCE(?3, downloaded_size),
                    download_at = COALESCE(?4, download_at)
             WHERE id = ?5",
            params![
                status.as_raw(),
                status.error(),
                downloaded_size,
                opt_millis(&download_at),
                composite_id(instance_id, book_id)
            ],
        )?;
        Ok(affected > 0)
    }

    /// 取消下载时清空本地下载痕迹
    pub fn reset_download_state(&self, instance_id: &str, book_id: &str) -> Result<bool> {
        let affected = self.conn.execute(
            "UPDATE book SET download_status = 'notDownloaded', download_error = NULL,
                    downloaded_size = 0, download_at = NULL
             WHERE id = ?1",
            params![composite_id(instance_id, book_id)],
        )?;
        Ok(affected > 0)
    }

    pub fn update_pages(
        &self,
        instance_id: &str,
        book_id: &str,
        pages: &[BookPage],
    ) -> Result<()> {
        self.conn.execute(
            "UPDATE book SET pages = ?1 WHERE id = ?2",
            params![encode_json(&pages), composite_id(instance_id, book_id)],
        )?;
        Ok(())
    }

    pub fn update_read_list_ids(
        &self,
        instance_id: &str,
        book_id: &str,
        read_list_ids: &[String],
    ) -> Result<()> {
        self.conn.execute(
            "UPDATE book SET read_list_ids = ?1 WHERE id = ?2",
            params![
                encode_json(&read_list_ids),
                composite_id(instance_id, book_id)
            ],
        )?;
        Ok(())
    }

    /// 本地写入阅读进度（离线时服务端尚未确认）
    pub fn update_read_progress(
        &self,
        instance_id: &str,
        book_id: &str,
        page: i64,
        completed: bool,
        read_date: DateTime<Utc>,
    ) -> Result<bool> {
        let affected = self.conn.execute(
            "UPDATE book SET progress_page = ?1, progress_completed = ?2,
                    progress_read_date = ?3,
                    progress_created = COALESCE(progress_created, ?3),
                    progress_last_modified = ?3
             WHERE id = ?4",
            params![
                page,
                completed,
                to_millis(&read_date),
                composite_id(instance_id, book_id)
            ],
        )?;
        Ok(affected > 0)
    }

    /// 排队中的书，按入队时间先后
    pub fn fetch_pending(&self, instance_id: &str, limit: usize) -> Result<Vec<KomgaBook>> {
        let mut stmt = self.conn.prepare(
            "SELECT * FROM book WHERE instance_id = ?1 AND download_status = 'pending'
             ORDER BY download_at ASC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![instance_id, limit as i64], |row| {
            Self::row_to_book(row)
        })?;
        let mut books = Vec::new();
        for row in rows {
            books.push(row?);
        }
        Ok(books)
    }

    pub fn fetch_downloaded(&self, instance_id: &str) -> Result<Vec<KomgaBook>> {
        let mut stmt = self.conn.prepare(
            "SELECT * FROM book WHERE instance_id = ?1 AND download_status = 'downloaded'",
        )?;
        let rows = stmt.query_map(params![instance_id], |row| Self::row_to_book(row))?;
        let mut books = Vec::new();
        for row in rows {
            books.push(row?);
        }
        Ok(books)
    }

    pub fn pending_count(&self, instance_id: &str) -> Result<i64> {
        self.status_count(instance_id, "pending")
    }

    pub fn failed_count(&self, instance_id: &str) -> Result<i64> {
        self.status_count(instance_id, "failed")
    }

    fn status_count(&self, instance_id: &str, status: &str) -> Result<i64> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM book WHERE instance_id = ?1 AND download_status = ?2",
            params![instance_id, status],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// failed → pending（显式重试入口）
    pub fn retry_failed(&self, instance_id: &str, now: DateTime<Utc>) -> Result<usize> {
        let affected = self.conn.execute(
            "UPDATE book SET download_status = 'pending', download_error = NULL, download_at = ?2
             WHERE instance_id = ?1 AND download_status = 'failed'",
            params![instance_id, to_millis(&now)],
        )?;
        Ok(affected)
    }

    /// failed → notDownloaded（放弃重试）
    pub fn cancel_failed(&self, instance_id: &str) -> Result<usize> {
        let affected = self.conn.execute(
            "UPDATE book SET download_status = 'notDownloaded', download_error = NULL,
                    downloaded_size = 0, download_at = NULL
             WHERE instance_id = ?1 AND download_status = 'failed'",
            params![instance_id],
        )?;
        Ok(affected)
    }

    /// 当前的持久化下载状态
    pub fn download_status(&self, instance_id: &str, book_id: &str) -> Result<DownloadStatus> {
        let row: Option<(String, Option<String>)> = self
            .conn
            .query_row(
                "SELECT download_status, download_error FROM book WHERE id = ?1",
                params![composite_id(instance_id, book_id)],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(match row {
            Some((raw, error)) => DownloadStatus::from_raw(&raw, error),
            None => DownloadStatus::NotDownloaded,
        })
    }

    pub fn count(&self, instance_id: &str) -> Result<i64> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM book WHERE instance_id = ?1",
            params![instance_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn clear_instance(&self, instance_id: &str) -> Result<()> {
        self.conn.execute(
            "DELETE FROM book WHERE instance_id = ?1",
            params![instance_id],
        )?;
        Ok(())
    }

    fn row_to_book(row: &Row) -> rusqlite::Result<KomgaBook> {
        let status_raw: String = row.get("download_status")?;
        let error: Option<String> = row.get("download_error")?;
        let progress_page: Option<i64> = row.get("progress_page")?;
        let authors_raw: String = row.get("meta_authors")?;
        let tags_raw: String = row.get("meta_tags")?;
        let links_raw: String = row.get("meta_links")?;
        let read_list_ids_raw: String = row.get("read_list_ids")?;
        let pages_raw: String = row.get("pages")?;

        let read_progress = match progress_page {
            Some(page) => Some(ReadProgress {
                page,
                completed: row
                    .get::<_, Option<bool>>("progress_completed")?
                    .unwrap_or(false),
                read_date: from_opt_millis(row.get("progress_read_date")?),
                created: from_opt_millis(row.get("progress_created")?),
                last_modified: from_opt_millis(row.get("progress_last_modified")?),
            }),
            None => None,
        };

        Ok(KomgaBook {
            id: row.get("id")?,
            instance_id: row.get("instance_id")?,
            book_id: row.get("book_id")?,
            series_id: row.get("series_id")?,
            library_id: row.get("library_id")?,
            name: row.get("name")?,
            size_bytes: row.get("size_bytes")?,
            page_count: row.get("page_count")?,
            media_profile: row.get("media_profile")?,
            metadata: BookMetadata {
                title: row.get("meta_title")?,
                title_lock: row.get("meta_title_lock")?,
                number: row.get("meta_number")?,
                number_lock: row.get("meta_number_lock")?,
                number_sort: row.get("meta_number_sort")?,
                number_sort_lock: row.get("meta_number_sort_lock")?,
                summary: row.get("meta_summary")?,
                summary_lock: row.get("meta_summary_lock")?,
                release_date: row.get("meta_release_date")?,
                release_date_lock: row.get("meta_release_date_lock")?,
                isbn: row.get("meta_isbn")?,
                isbn_lock: row.get("meta_isbn_lock")?,
                authors: decode_json(&authors_raw),
                authors_lock: row.get("meta_authors_lock")?,
                tags: decode_json(&tags_raw),
                tags_lock: row.get("meta_tags_lock")?,
                links: decode_json(&links_raw),
                links_lock: row.get("meta_links_lock")?,
            },
            read_progress,
            created: from_millis(row.get("created")?),
            last_modified: from_millis(row.get("last_modified")?),
            deleted: row.get("deleted")?,
            oneshot: row.get("oneshot")?,
            read_list_ids: decode_json(&read_list_ids_raw),
            download: BookDownloadState {
                status: DownloadStatus::from_raw(&status_raw, error),
                downloaded_size: row.get("downloaded_size")?,
                download_at: from_opt_millis(row.get("download_at")?),
            },
            pages: decode_json(&pages_raw),
        })
    }
}
