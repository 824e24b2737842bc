use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

const SCHEMA_SQL: &str = include_str!("storage/schema.sql");

#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Integrity: {0}")]
    IntegrityCheckFailed(String),
}

pub type DbResult<T> = Result<T, DbError>;

/// A persisted user record.
///
/// Created lazily on first sighting; never deleted by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub qq_id: i64,
    pub nickname: Option<String>,
    pub is_privileged: bool,
    /// Category id -> selected command set id.
    pub selected_styles: HashMap<String, String>,
}

impl UserRecord {
    pub fn new(qq_id: i64) -> Self {
        UserRecord {
            qq_id,
            nickname: None,
            is_privileged: false,
            selected_styles: HashMap::new(),
        }
    }
}

pub struct Db {
    conn: Connection,
}

impl Db {
    pub fn open(path: &Path) -> DbResult<Self> {
        let c = Connection::open(path)?;
        let d = Self { conn: c };
        d.apply_pragmas()?;
        d.apply_schema()?;
        Ok(d)
    }

    pub fn open_in_memory() -> DbResult<Self> {
        let c = Connection::open_in_memory()?;
        let d = Self { conn: c };
        d.apply_pragmas()?;
        d.apply_schema()?;
        Ok(d)
    }

    pub fn integrity_check(&self) -> DbResult<()> {
        let r: String = self
            .conn
            .pragma_query_value(None, "integrity_check", |row| row.get(0))?;
        if r != "ok" {
            return Err(DbError::IntegrityCheckFailed(r));
        }
        Ok(())
    }

    pub fn load_user(&self, qq_id: i64) -> DbResult<Option<UserRecord>> {
        let mut s = self.conn.prepare(
            "SELECT qq_id, nickname, is_privileged, selected_styles FROM users WHERE qq_id = ?1",
        )?;
        let mut rows = s.query_map([qq_id], |r| {
            Ok((
                r.get::<_, i64>(0)?,
                r.get::<_, Option<String>>(1)?,
                r.get::<_, i64>(2)?,
                r.get::<_, String>(3)?,
            ))
        })?;
        match rows.next().transpose()? {
            None => Ok(None),
            Some((qq_id, nickname, privileged, styles_json)) => Ok(Some(UserRecord {
                qq_id,
                nickname,
                is_privileged: privileged != 0,
                selected_styles: serde_json::from_str(&styles_json)?,
            })),
        }
    }

    pub fn save_user(&self, user: &UserRecord) -> DbResult<()> {
        let styles_json = serde_json::to_string(&user.selected_styles)?;
        self.conn.execute(
            "INSERT INTO users (qq_id, nickname, is_privileged, selected_styles)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(qq_id) DO UPDATE SET
                 nickname = excluded.nickname,
                 is_privileged = excluded.is_privileged,
                 selected_styles = excluded.selected_styles",
            rusqlite::params![
                user.qq_id,
                user.nickname,
                i64::from(user.is_privileged),
                styles_json
            ],
        )?;
        Ok(())
    }

    pub fn list_users(&self) -> DbResult<Vec<UserRecord>> {
        let mut s = self
            .conn
            .prepare("SELECT qq_id, nickname, is_privileged, selected_styles FROM users ORDER BY qq_id")?;
        let rows = s.query_map([], |r| {
            Ok((
                r.get::<_, i64>(0)?,
                r.get::<_, Option<String>>(1)?,
                r.get::<_, i64>(2)?,
                r.get::<_, String>(3)?,
            ))
        })?;
        let mut users = Vec::new();
        for row in rows {
            let (qq_id, nickname, privileged, styles_json) = row?;
            users.push(UserRecord {
                qq_id,
                nickname,
                is_privileged: privileged != 0,
                selected_styles: serde_json::from_str(&styles_json)?,
            });
        }
        Ok(users)
    }

    fn apply_pragmas(&self) -> DbResult<()> {
        self.conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;",
        )?;
        Ok(())
    }

    fn apply_schema(&self) -> DbResult<()> {
        self.conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }
}
