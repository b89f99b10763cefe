use rusqlite::OptionalExtension;
use tracing::instrument;

use switchboard_core::{ProxyConfig, Session, SessionId, SessionStatus};

use crate::database::Database;
use crate::error::StoreError;
use crate::columns::{stamp, Columns};

/// Durable storage of session records.
///
/// Each call is atomic for a single record; there are no multi-record
/// transactions, and concurrent `update`s of one record are last-write-wins.
pub trait SessionRepository: Send + Sync {
    fn create(&self, session: &Session) -> Result<(), StoreError>;
    fn get_by_id(&self, id: &SessionId) -> Result<Session, StoreError>;
    fn get_by_name(&self, name: &str) -> Result<Session, StoreError>;
    fn update(&self, session: &Session) -> Result<(), StoreError>;
    fn delete(&self, id: &SessionId) -> Result<(), StoreError>;
    fn list(&self, limit: u32, offset: u32) -> Result<Vec<Session>, StoreError>;
    fn get_by_status(
        &self,
        status: SessionStatus,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Session>, StoreError>;
    fn get_active_count(&self) -> Result<u64, StoreError>;
    fn count(&self) -> Result<u64, StoreError>;
    fn exists(&self, id: &SessionId) -> Result<bool, StoreError>;
    fn exists_by_name(&self, name: &str) -> Result<bool, StoreError>;
}

const SELECT_COLUMNS: &str = "SELECT id, name, status, external_id, qr_code, proxy_url,
        is_active, created_at, updated_at
 FROM sessions";

pub struct SessionRepo {
    db: Database,
}

impl SessionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    fn query_sessions(
        &self,
        sql: &str,
        params: &[&dyn rusqlite::types::ToSql],
    ) -> Result<Vec<Session>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let mut rows = stmt.query(params)?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_session(row)?);
            }
            Ok(results)
        })
    }

    fn query_one(&self, sql: &str, key: &str, what: &str) -> Result<Session, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let mut rows = stmt.query([key])?;
            match rows.next()? {
                Some(row) => row_to_session(row),
                None => Err(StoreError::NotFound(format!("session {what} {key}"))),
            }
        })
    }

    fn scalar_count(&self, sql: &str) -> Result<u64, StoreError> {
        self.db.with_conn(|conn| {
            let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
            Ok(n.max(0) as u64)
        })
    }
}

impl SessionRepository for SessionRepo {
    #[instrument(skip(self, session), fields(session_id = %session.id, name = %session.name))]
    fn create(&self, session: &Session) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions (id, name, status, external_id, qr_code, proxy_url,
                                       is_active, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                rusqlite::params![
                    session.id.as_str(),
                    session.name,
                    session.status.to_string(),
                    session.external_id,
                    session.qr_code,
                    session.proxy_url(),
                    session.is_active,
                    stamp(&session.created_at),
                    stamp(&session.updated_at),
                ],
            )?;
            Ok(())
        })
    }

    #[instrument(skip(self), fields(session_id = %id))]
    fn get_by_id(&self, id: &SessionId) -> Result<Session, StoreError> {
        self.query_one(&format!("{SELECT_COLUMNS} WHERE id = ?1"), id.as_str(), "id")
    }

    #[instrument(skip(self))]
    fn get_by_name(&self, name: &str) -> Result<Session, StoreError> {
        self.query_one(&format!("{SELECT_COLUMNS} WHERE name = ?1"), name, "name")
    }

    /// Writes every mutable column. `NotFound` when the row is gone.
    #[instrument(skip(self, session), fields(session_id = %session.id, status = %session.status))]
    fn update(&self, session: &Session) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE sessions SET
                    name = ?1,
                    status = ?2,
                    external_id = ?3,
                    qr_code = ?4,
                    proxy_url = ?5,
                    is_active = ?6,
                    updated_at = ?7
                 WHERE id = ?8",
                rusqlite::params![
                    session.name,
                    session.status.to_string(),
                    session.external_id,
                    session.qr_code,
                    session.proxy_url(),
                    session.is_active,
                    stamp(&session.updated_at),
                    session.id.as_str(),
                ],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("session id {}", session.id)));
            }
            Ok(())
        })
    }

    #[instrument(skip(self), fields(session_id = %id))]
    fn delete(&self, id: &SessionId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute("DELETE FROM sessions WHERE id = ?1", [id.as_str()])?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("session id {id}")));
            }
            Ok(())
        })
    }

    /// Oldest first.
    #[instrument(skip(self))]
    fn list(&self, limit: u32, offset: u32) -> Result<Vec<Session>, StoreError> {
        self.query_sessions(
            &format!("{SELECT_COLUMNS} ORDER BY created_at ASC, id ASC LIMIT ?1 OFFSET ?2"),
            &[&limit, &offset],
        )
    }

    #[instrument(skip(self), fields(status = %status))]
    fn get_by_status(
        &self,
        status: SessionStatus,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Session>, StoreError> {
        let status = status.to_string();
        self.query_sessions(
            &format!(
                "{SELECT_COLUMNS} WHERE status = ?1 ORDER BY created_at ASC, id ASC LIMIT ?2 OFFSET ?3"
            ),
            &[&status, &limit, &offset],
        )
    }

    fn get_active_count(&self) -> Result<u64, StoreError> {
        self.scalar_count("SELECT COUNT(*) FROM sessions WHERE is_active = 1")
    }

    fn count(&self) -> Result<u64, StoreError> {
        self.scalar_count("SELECT COUNT(*) FROM sessions")
    }

    fn exists(&self, id: &SessionId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let found = conn
                .query_row("SELECT 1 FROM sessions WHERE id = ?1", [id.as_str()], |_| Ok(()))
                .optional()?;
            Ok(found.is_some())
        })
    }

    fn exists_by_name(&self, name: &str) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let found = conn
                .query_row("SELECT 1 FROM sessions WHERE name = ?1", [name], |_| Ok(()))
                .optional()?;
            Ok(found.is_some())
        })
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> Result<Session, StoreError> {
    let cols = Columns::new(row, "sessions");
    let proxy = cols
        .value::<Option<String>>("proxy_url")?
        .filter(|raw| !raw.is_empty())
        .map(|raw| ProxyConfig::parse(&raw).map_err(|e| cols.corrupt("proxy_url", e)))
        .transpose()?;

    Ok(Session {
        id: SessionId::from_raw(cols.value::<String>("id")?),
        name: cols.value("name")?,
        status: cols.parsed("status")?,
        external_id: cols.value("external_id")?,
        qr_code: cols.value("qr_code")?,
        proxy,
        is_active: cols.value("is_active")?,
        created_at: cols.timestamp("created_at")?,
        updated_at: cols.timestamp("updated_at")?,
    })
}
