//! 待回放阅读进度数据访问层
//!
//! 每 (instance, book) 只保留一条最新待回放记录；自增 id 保留首次
//! 写入的顺序，重连后按 id 升序回放，服务端确认后删除。

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};

use crate::error::Result;
use crate::storage::dao::{from_millis, to_millis};
use crate::storage::entities::PendingProgress;

/// 待回放进度数据访问对象
pub struct PendingProgressDao<'a> {
    conn: &'a Connection,
}

impl<'a> PendingProgressDao<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// 记录一次尚未被服务端确认的进度更新；
    /// 同一本书的旧记录被新值覆盖（id 不变，回放顺序保持首次写入顺序）。
    pub fn upsert(
        &self,
        instance_id: &str,
        book_id: &str,
        page: i64,
        completed: bool,
        position: Option<&str>,
        created: DateTime<Utc>,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO pending_progress (instance_id, book_id, page, completed, position, created)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(instance_id, book_id) DO UPDATE SET
                 page = excluded.page,
                 completed = excluded.completed,
                 position = excluded.position,
                 created = excluded.created",
            params![
                instance_id,
                book_id,
                page,
                completed,
                position,
                to_millis(&created)
            ],
        )?;
        Ok(())
    }

    /// 待回放记录，按写入顺序
    pub fn list(&self, instance_id: &str) -> Result<Vec<PendingProgress>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, instance_id, book_id, page, completed, position, created
             FROM pending_progress WHERE instance_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![instance_id], |row| Self::row_to_pending(row))?;
        let mut items = Vec::new();
        for row in rows {
            items.push(row?);
        }
        Ok(items)
    }

    /// 服务端确认后删除
    pub fn delete(&self, id: i64) -> Result<bool> {
        let affected = self
            .conn
            .execute("DELETE FROM pending_progress WHERE id = ?1", params![id])?;
        Ok(affected > 0)
    }

    pub fn count(&self, instance_id: &str) -> Result<i64> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM pending_progress WHERE instance_id = ?1",
            params![instance_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn clear_instance(&self, instance_id: &str) -> Result<()> {
        self.conn.execute(
            "DELETE FROM pending_progress WHERE instance_id = ?1",
            params![instance_id],
        )?;
        Ok(())
    }

    fn row_to_pending(row: &Row) -> rusqlite::Result<PendingProgress> {
        Ok(PendingProgress {
            id: row.get(0)?,
            instance_id: row.get(1)?,
            book_id: row.get(2)?,
            page: row.get(3)?,
            completed: row.get(4)?,
            position: row.get(5)?,
            created: from_millis(row.get(6)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::dao::test_util::test_conn;

    #[test]
    fn replay_order_follows_first_write() {
        let conn = test_conn();
        let dao = PendingProgressDao::new(&conn);
        let now = Utc::now();

        dao.upsert("inst", "b1", 3, false, None, now).unwrap();
        dao.upsert("inst", "b2", 7, false, None, now).unwrap();
        // b1 再次更新：值被覆盖，但回放顺序仍然在 b2 之前
        dao.upsert("inst", "b1", 5, true, None, now).unwrap();

        let items = dao.list("inst").unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].book_id, "b1");
        assert_eq!(items[0].page, 5);
        assert!(items[0].completed);
        assert_eq!(items[1].book_id, "b2");
    }

    #[test]
    fn delete_after_confirmation() {
        let conn = test_conn();
        let dao = PendingProgressDao::new(&conn);
        dao.upsert("inst", "b1", 3, false, None, Utc::now()).unwrap();

        let items = dao.list("inst").unwrap();
        assert!(dao.delete(items[0].id).unwrap());
        assert_eq!(dao.count("inst").unwrap(), 0);
        assert!(!dao.delete(items[0].id).unwrap());
    }

    #[test]
    fn position_blob_round_trip() {
        let conn = test_conn();
        let dao = PendingProgressDao::new(&conn);
        let position = r#"{"href":"chapter3.xhtml","progression":0.42}"#;
        dao.upsert("inst", "b1", 0, false, Some(position), Utc::now())
            .unwrap();

        let items = dao.list("inst").unwrap();
        assert_eq!(items[0].position.as_deref(), Some(position));
    }
}
