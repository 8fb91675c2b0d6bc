//! 阅读列表数据访问层
//!
//! 下载计数列是派生物化视图：成员书目状态变化后由 db_actor 重算写回。

use rusqlite::{params, Connection, Row};

use crate::error::Result;
use crate::gateway::ReadListDto;
use crate::identity::composite_id;
use crate::storage::dao::{decode_json, encode_json, from_millis, to_millis, Sort, SortField};
use crate::storage::entities::KomgaReadList;

/// 阅读列表数据访问对象
pub struct ReadListDao<'a> {
    conn: &'a Connection,
}

impl<'a> ReadListDao<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn upsert(&self, instance_id: &str, dto: &ReadListDto) -> Result<()> {
        let sql = "INSERT INTO read_list (
            id, instance_id, read_list_id, name, summary, ordered, book_ids,
            created, last_modified
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            summary = excluded.summary,
            ordered = excluded.ordered,
            book_ids = excluded.book_ids,
            created = excluded.created,
            last_modified = excluded.last_modified";
        self.conn.execute(
            sql,
            params![
                composite_id(instance_id, &dto.id),
                instance_id,
                dto.id,
                dto.name,
                dto.summary,
                dto.ordered,
                encode_json(&dto.book_ids),
                to_millis(&dto.created_date),
                to_millis(&dto.last_modified_date),
            ],
        )?;
        Ok(())
    }

    pub fn upsert_list(&self, instance_id: &str, dtos: &[ReadListDto]) -> Result<()> {
        for dto in dtos {
            self.upsert(instance_id, dto)?;
        }
        Ok(())
    }

    pub fn delete(&self, instance_id: &str, read_list_id: &str) -> Result<bool> {
        let affected = self.conn.execute(
            "DELETE FROM read_list WHERE id = ?1",
            params![composite_id(instance_id, read_list_id)],
        )?;
        Ok(affected > 0)
    }

    pub fn get(&self, instance_id: &str, read_list_id: &str) -> Result<Option<KomgaReadList>> {
        let mut stmt = self.conn.prepare("SELECT * FROM read_list WHERE id = ?1")?;
        let mut rows = stmt.query_map(params![composite_id(instance_id, read_list_id)], |row| {
            Self::row_to_read_list(row)
        })?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// 分页取 remote id；置顶优先于任何请求排序
    pub fn fetch_ids(
        &self,
        instance_id: &str,
        search: Option<&str>,
        sort: &Sort,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<String>> {
        let order = Self::order_clause(sort);
        let mut sql = format!(
            "SELECT read_list_id FROM read_list WHERE instance_id = ?1{}",
            if search.is_some() {
                " AND name LIKE '%' || ?2 || '%'"
            } else {
                ""
            }
        );
        sql.push_str(&format!(
            " ORDER BY pinned DESC, {} LIMIT ? OFFSET ?",
            order
        ));

        let mut args: Vec<rusqlite::types::Value> = vec![instance_id.to_string().into()];
        if let Some(search) = search {
            args.push(search.to_string().into());
        }
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

    pub fn set_pinned(&self, instance_id: &str, read_list_id: &str, pinned: bool) -> Result<()> {
        self.conn.execute(
            "UPDATE read_list SET pinned = ?1 WHERE id = ?2",
            params![pinned, composite_id(instance_id, read_list_id)],
        )?;
        Ok(())
    }

    /// 写回派生下载计数
    pub fn update_download_counters(
        &self,
        instance_id: &str,
        read_list_id: &str,
        downloaded_books: i64,
        pending_books: i64,
        downloaded_size: i64,
    ) -> Result<()> {
        self.conn.execute(
            "UPDATE read_list SET downloaded_books = ?1, pending_books = ?2, downloaded_size = ?3
             WHERE id = ?4",
            params![
                downloaded_books,
                pending_books,
                downloaded_size,
                composite_id(instance_id, read_list_id)
            ],
        )?;
        Ok(())
    }

    /// 包含某本书的所有阅读列表（成员变化后重算计数用）
    pub fn fetch_containing_book(
        &self,
        instance_id: &str,
        book_id: &str,
    ) -> Result<Vec<KomgaReadList>> {
        let mut stmt = self
            .conn
            .prepare("SELECT * FROM read_list WHERE instance_id = ?1")?;
        let rows = stmt.query_map(params![instance_id], |row| Self::row_to_read_list(row))?;
        let mut lists = Vec::new();
        for row in rows {
            let list = row?;
            if list.book_ids.iter().any(|id| id == book_id) {
                lists.push(list);
            }
        }
        Ok(lists)
    }

    pub fn count(&self, instance_id: &str) -> Result<i64> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM read_list WHERE instance_id = ?1",
            params![instance_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn clear_instance(&self, instance_id: &str) -> Result<()> {
        self.conn.execute(
            "DELETE FROM read_list WHERE instance_id = ?1",
            params![instance_id],
        )?;
        Ok(())
    }

    fn order_clause(sort: &Sort) -> String {
        let dir = if sort.ascending { "ASC" } else { "DESC" };
        match sort.field {
            SortField::Created => format!("created {}", dir),
            SortField::LastModified => format!("last_modified {}", dir),
            SortField::Random => "RANDOM()".to_string(),
            _ => format!("name COLLATE NOCASE {}", dir),
        }
    }

    fn row_to_read_list(row: &Row) -> rusqlite::Result<KomgaReadList> {
        let book_ids_raw: String = row.get("book_ids")?;
        Ok(KomgaReadList {
            id: row.get("id")?,
            instance_id: row.get("instance_id")?,
            read_list_id: row.get("read_list_id")?,
            name: row.get("name")?,
            summary: row.get("summary")?,
            ordered: row.get("ordered")?,
            book_ids: decode_json(&book_ids_raw),
            pinned: row.get("pinned")?,
            created: from_millis(row.get("created")?),
            last_modified: from_millis(row.get("last_modified")?),
            downloaded_books: row.get("downloaded_books")?,
            pending_books: row.get("pending_books")?,
            downloaded_size: row.get("downloaded_size")?,
        })
    }
}
