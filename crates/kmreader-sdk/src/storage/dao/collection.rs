//! 合集数据访问层
//!
//! 置顶（pinned）是本地状态；列表查询无论请求什么排序，
//! 置顶条目总排在未置顶之前。

use rusqlite::{params, Connection, Row};

use crate::error::Result;
use crate::gateway::CollectionDto;
use crate::identity::composite_id;
use crate::storage::dao::{decode_json, encode_json, from_millis, to_millis, Sort, SortField};
use crate::storage::entities::KomgaCollection;

/// 合集数据访问对象
pub struct CollectionDao<'a> {
    conn: &'a Connection,
}

impl<'a> CollectionDao<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn upsert(&self, instance_id: &str, dto: &CollectionDto) -> Result<()> {
        let sql = "INSERT INTO collection (
            id, instance_id, collection_id, name, ordered, series_ids, filtered,
            created, last_modified
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            ordered = excluded.ordered,
            series_ids = excluded.series_ids,
            filtered = excluded.filtered,
            created = excluded.created,
            last_modified = excluded.last_modified";
        self.conn.execute(
            sql,
            params![
                composite_id(instance_id, &dto.id),
                instance_id,
                dto.id,
                dto.name,
                dto.ordered,
                encode_json(&dto.series_ids),
                dto.filtered,
                to_millis(&dto.created_date),
                to_millis(&dto.last_modified_date),
            ],
        )?;
        Ok(())
    }

    pub fn upsert_list(&self, instance_id: &str, dtos: &[CollectionDto]) -> Result<()> {
        for dto in dtos {
            self.upsert(instance_id, dto)?;
        }
        Ok(())
    }

    pub fn delete(&self, instance_id: &str, collection_id: &str) -> Result<bool> {
        let affected = self.conn.execute(
            "DELETE FROM collection WHERE id = ?1",
            params![composite_id(instance_id, collection_id)],
        )?;
        Ok(affected > 0)
    }

    pub fn get(&self, instance_id: &str, collection_id: &str) -> Result<Option<KomgaCollection>> {
        let mut stmt = self.conn.prepare("SELECT * FROM collection WHERE id = ?1")?;
        let mut rows = stmt.query_map(params![composite_id(instance_id, collection_id)], |row| {
            Self::row_to_collection(row)
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
            "SELECT collection_id FROM collection WHERE instance_id = ?1{}",
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

    pub fn set_pinned(&self, instance_id: &str, collection_id: &str, pinned: bool) -> Result<()> {
        self.conn.execute(
            "UPDATE collection SET pinned = ?1 WHERE id = ?2",
            params![pinned, composite_id(instance_id, collection_id)],
        )?;
        Ok(())
    }

    pub fn count(&self, instance_id: &str) -> Result<i64> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM collection WHERE instance_id = ?1",
            params![instance_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn clear_instance(&self, instance_id: &str) -> Result<()> {
        self.conn.execute(
            "DELETE FROM collection WHERE instance_id = ?1",
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

    fn row_to_collection(row: &Row) -> rusqlite::Result<KomgaCollection> {
        let series_ids_raw: String = row.get("series_ids")?;
        Ok(KomgaCollection {
            id: row.get("id")?,
            instance_id: row.get("instance_id")?,
            collection_id: row.get("collection_id")?,
            name: row.get("name")?,
            ordered: row.get("ordered")?,
            series_ids: decode_json(&series_ids_raw),
            filtered: row.get("filtered")?,
            pinned: row.get("pinned")?,
            created: from_millis(row.get("created")?),
            last_modified: from_millis(row.get("last_modified")?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::dao::test_util::test_conn;
    use chrono::{TimeZone, Utc};

    fn dto(id: &str, name: &str) -> CollectionDto {
        CollectionDto {
            id: id.to_string(),
            name: name.to_string(),
            ordered: true,
            series_ids: vec!["s1".to_string(), "s2".to_string()],
            filtered: false,
            created_date: Utc.timestamp_millis_opt(1_000).unwrap(),
            last_modified_date: Utc.timestamp_millis_opt(2_000).unwrap(),
        }
    }

    #[test]
    fn upsert_keeps_member_order() {
        let conn = test_conn();
        let dao = CollectionDao::new(&conn);
        dao.upsert("inst", &dto("c1", "Favorites")).unwrap();

        let collection = dao.get("inst", "c1").unwrap().unwrap();
        assert!(collection.ordered);
        assert_eq!(collection.series_ids, vec!["s1", "s2"]);
    }

    #[test]
    fn pinned_entries_come_first_for_any_sort() {
        let conn = test_conn();
        let dao = CollectionDao::new(&conn);
        dao.upsert("inst", &dto("c1", "Alpha")).unwrap();
        dao.upsert("inst", &dto("c2", "Beta")).unwrap();
        dao.upsert("inst", &dto("c3", "Gamma")).unwrap();
        dao.set_pinned("inst", "c3", true).unwrap();

        // 名称升序：置顶的 Gamma 仍然在最前
        let ids = dao
            .fetch_ids("inst", None, &Sort::default(), 0, 10)
            .unwrap();
        assert_eq!(ids, vec!["c3", "c1", "c2"]);

        // 名称降序也一样
        let desc = Sort::new(SortField::Name, false);
        let ids = dao.fetch_ids("inst", None, &desc, 0, 10).unwrap();
        assert_eq!(ids[0], "c3");
    }

    #[test]
    fn search_filters_by_name() {
        let conn = test_conn();
        let dao = CollectionDao::new(&conn);
        dao.upsert("inst", &dto("c1", "Seinen")).unwrap();
        dao.upsert("inst", &dto("c2", "Shounen")).unwrap();

        let ids = dao
            .fetch_ids("inst", Some("einen"), &Sort::default(), 0, 10)
            .unwrap();
        assert_eq!(ids, vec!["c1"]);
    }

    #[test]
    fn pinned_survives_resync() {
        let conn = test_conn();
        let dao = CollectionDao::new(&conn);
        dao.upsert("inst", &dto("c1", "Favorites")).unwrap();
        dao.set_pinned("inst", "c1", true).unwrap();
        dao.upsert("inst", &dto("c1", "Favorites Renamed")).unwrap();

        let collection = dao.get("inst", "c1").unwrap().unwrap();
        assert!(collection.pinned);
        assert_eq!(collection.name, "Favorites Renamed");
    }
}
