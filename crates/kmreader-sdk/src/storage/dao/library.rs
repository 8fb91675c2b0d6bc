//! 库数据访问层 - 每次同步整体替换

use rusqlite::{params, Connection};

use crate::error::Result;
use crate::gateway::LibraryDto;
use crate::identity::composite_id;
use crate::storage::entities::KomgaLibrary;

/// 库数据访问对象
pub struct LibraryDao<'a> {
    conn: &'a Connection,
}

impl<'a> LibraryDao<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// 服务端库列表是小而全的，直接整体替换
    pub fn replace_all(&self, instance_id: &str, libraries: &[LibraryDto]) -> Result<()> {
        self.conn.execute(
            "DELETE FROM library WHERE instance_id = ?1",
            params![instance_id],
        )?;
        for library in libraries {
            self.conn.execute(
                "INSERT INTO library (id, instance_id, library_id, name) VALUES (?1, ?2, ?3, ?4)",
                params![
                    composite_id(instance_id, &library.id),
                    instance_id,
                    library.id,
                    library.name
                ],
            )?;
        }
        Ok(())
    }

    pub fn fetch(&self, instance_id: &str) -> Result<Vec<KomgaLibrary>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, instance_id, library_id, name FROM library
             WHERE instance_id = ?1 ORDER BY name COLLATE NOCASE ASC",
        )?;
        let rows = stmt.query_map(params![instance_id], |row| {
            Ok(KomgaLibrary {
                id: row.get(0)?,
                instance_id: row.get(1)?,
                library_id: row.get(2)?,
                name: row.get(3)?,
            })
        })?;
        let mut libraries = Vec::new();
        for row in rows {
            libraries.push(row?);
        }
        Ok(libraries)
    }

    pub fn clear_instance(&self, instance_id: &str) -> Result<()> {
        self.conn.execute(
            "DELETE FROM library WHERE instance_id = ?1",
            params![instance_id],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::dao::test_util::test_conn;

    #[test]
    fn replace_all_removes_stale_rows() {
        let conn = test_conn();
        let dao = LibraryDao::new(&conn);

        dao.replace_all(
            "inst",
            &[
                LibraryDto {
                    id: "l1".to_string(),
                    name: "Manga".to_string(),
                },
                LibraryDto {
                    id: "l2".to_string(),
                    name: "Comics".to_string(),
                },
            ],
        )
        .unwrap();
        assert_eq!(dao.fetch("inst").unwrap().len(), 2);

        dao.replace_all(
            "inst",
            &[LibraryDto {
                id: "l1".to_string(),
                name: "Manga Renamed".to_string(),
            }],
        )
        .unwrap();

        let libraries = dao.fetch("inst").unwrap();
        assert_eq!(libraries.len(), 1);
        assert_eq!(libraries[0].name, "Manga Renamed");
        assert_eq!(libraries[0].id, "inst_l1");
    }
}
