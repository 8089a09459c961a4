//! Relational adapter over SQLite.
//!
//! Every table shares one `records` table keyed by `(tbl, id)` with the row
//! body stored as JSON; filters are pushed down through `json_extract`.
//! Credentials live in `accounts`.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use secrecy::SecretString;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info};

use super::edge::{self, AccountStore};
use super::{
    created_at, merge_patch, normalize_email, password_digest, prepare_insert, AuthError, Backend,
    BackendError, BackendOptions, ChangeBus, ChangeEvent, ChangeFeed, Connect, Filter, NewAccount,
    Row,
};
use crate::config::BackendTarget;
use crate::event::UserId;
use crate::model::{Table, UnixTimeMs, UserProfile};

const SCHEMA: &str = r"
    CREATE TABLE IF NOT EXISTS records (
        tbl TEXT NOT NULL,
        id TEXT NOT NULL,
        data TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        PRIMARY KEY (tbl, id)
    );

    CREATE INDEX IF NOT EXISTS idx_records_order ON records(tbl, created_at, id);

    CREATE TABLE IF NOT EXISTS accounts (
        id TEXT PRIMARY KEY,
        email TEXT NOT NULL UNIQUE,
        salt TEXT NOT NULL,
        password_hash TEXT NOT NULL,
        confirmed INTEGER NOT NULL DEFAULT 0
    );
";

fn storage(e: rusqlite::Error) -> BackendError {
    BackendError::Storage(e.to_string())
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Bind value for `json_extract`, which yields 1/0 for JSON booleans.
fn sql_value(value: &Value) -> Option<SqlValue> {
    match value {
        Value::Null => None,
        Value::Bool(b) => Some(SqlValue::Integer(i64::from(*b))),
        Value::Number(n) => n
            .as_i64()
            .map(SqlValue::Integer)
            .or_else(|| n.as_f64().map(SqlValue::Real)),
        Value::String(s) => Some(SqlValue::Text(s.clone())),
        other => Some(SqlValue::Text(other.to_string())),
    }
}

struct Server {
    conn: Mutex<Connection>,
    bus: ChangeBus,
    options: BackendOptions,
}

/// One client of a shared SQLite database. [`SqliteBackend::client`] opens
/// another client (another tab) on the same connection.
pub struct SqliteBackend {
    server: Arc<Server>,
    session: watch::Sender<Option<UserProfile>>,
}

impl SqliteBackend {
    pub fn open(path: impl AsRef<Path>, options: BackendOptions) -> Result<Self, BackendError> {
        let conn = Connection::open(path).map_err(storage)?;
        Self::from_connection(conn, options)
    }

    pub fn open_in_memory() -> Result<Self, BackendError> {
        Self::open_in_memory_with(BackendOptions::default())
    }

    pub fn open_in_memory_with(options: BackendOptions) -> Result<Self, BackendError> {
        let conn = Connection::open_in_memory().map_err(storage)?;
        Self::from_connection(conn, options)
    }

    fn from_connection(conn: Connection, options: BackendOptions) -> Result<Self, BackendError> {
        conn.execute_batch(SCHEMA).map_err(storage)?;
        let server = Server {
            conn: Mutex::new(conn),
            bus: ChangeBus::new(options.feed_capacity),
            options,
        };
        Ok(Self::attach(Arc::new(server)))
    }

    fn attach(server: Arc<Server>) -> Self {
        let (session, _) = watch::channel(None);
        Self { server, session }
    }

    #[must_use]
    pub fn client(&self) -> Self {
        Self::attach(Arc::clone(&self.server))
    }

    pub fn confirm_email(&self, email: &str) -> Result<bool, BackendError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE accounts SET confirmed = 1 WHERE email = ?1",
                params![normalize_email(email)],
            )
            .map_err(storage)?;
        Ok(changed > 0)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.server.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn require_session(&self) -> Result<(), BackendError> {
        if self.session.borrow().is_none() {
            return Err(BackendError::Unauthorized);
        }
        Ok(())
    }

    fn query(&self, table: Table, filter: &Filter) -> Result<Vec<Row>, BackendError> {
        let mut sql = String::from("SELECT data FROM records WHERE tbl = ?1");
        let mut binds = vec![SqlValue::Text(table.as_str().to_string())];
        for (column, value) in filter.clauses() {
            binds.push(SqlValue::Text(format!("$.{column}")));
            let path = binds.len();
            match sql_value(value) {
                Some(v) => {
                    binds.push(v);
                    sql.push_str(&format!(" AND json_extract(data, ?{path}) = ?{}", path + 1));
                }
                None => sql.push_str(&format!(" AND json_extract(data, ?{path}) IS NULL")),
            }
        }
        sql.push_str(" ORDER BY created_at, id");

        let conn = self.conn();
        let mut stmt = conn.prepare(&sql).map_err(storage)?;
        let rows = stmt
            .query_map(params_from_iter(binds), |r| r.get::<_, String>(0))
            .map_err(storage)?;
        let rows = rows
            .map(|data| {
                let data = data.map_err(storage)?;
                serde_json::from_str(&data).map_err(BackendError::from)
            })
            .collect::<Result<Vec<Row>, _>>()?;
        Ok(rows)
    }
}

fn load(conn: &Connection, table: Table, id: &str) -> Result<Option<Row>, BackendError> {
    let data: Option<String> = conn
        .query_row(
            "SELECT data FROM records WHERE tbl = ?1 AND id = ?2",
            params![table.as_str(), id],
            |r| r.get(0),
        )
        .optional()
        .map_err(storage)?;
    data.map(|d| serde_json::from_str(&d).map_err(BackendError::from))
        .transpose()
}

fn load_profile(conn: &Connection, id: &str) -> Result<Option<UserProfile>, BackendError> {
    load(conn, Table::Profiles, id)?
        .map(|row| serde_json::from_value(row).map_err(BackendError::from))
        .transpose()
}

#[async_trait]
impl Backend for SqliteBackend {
    async fn sign_in(&self, email: &str, password: &SecretString) -> Result<UserProfile, AuthError> {
        let profile = {
            let conn = self.conn();
            let account: Option<(String, String, String, bool)> = conn
                .query_row(
                    "SELECT id, salt, password_hash, confirmed FROM accounts WHERE email = ?1",
                    params![normalize_email(email)],
                    |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
                )
                .optional()
                .map_err(|e| AuthError::Provider(e.to_string()))?;
            let (id, salt, stored, confirmed) = account.ok_or(AuthError::InvalidCredentials)?;
            let stored = blake3::Hash::from_hex(stored.as_bytes())
                .map_err(|e| AuthError::Provider(e.to_string()))?;
            if password_digest(&salt, password) != stored {
                return Err(AuthError::InvalidCredentials);
            }
            if !confirmed {
                return Err(AuthError::EmailNotConfirmed);
            }
            load_profile(&conn, &id)?.ok_or_else(|| AuthError::Provider("profile missing".into()))?
        };
        debug!(user = %profile.id, "signed in");
        self.session.send_replace(Some(profile.clone()));
        Ok(profile)
    }

    async fn sign_up(&self, account: NewAccount<'_>) -> Result<UserProfile, AuthError> {
        let confirmed = !self.server.options.require_email_confirmation;
        let profile = self.create_account(account, confirmed).await?;
        if confirmed {
            self.session.send_replace(Some(profile.clone()));
        }
        Ok(profile)
    }

    async fn sign_out(&self) -> Result<(), BackendError> {
        self.session.send_replace(None);
        Ok(())
    }

    fn auth_state(&self) -> watch::Receiver<Option<UserProfile>> {
        self.session.subscribe()
    }

    async fn select(&self, table: Table, filter: &Filter) -> Result<Vec<Row>, BackendError> {
        self.require_session()?;
        self.query(table, filter)
    }

    async fn insert(&self, table: Table, row: Row) -> Result<Row, BackendError> {
        self.require_session()?;
        let (id, object) = prepare_insert(row)?;
        let row = Value::Object(object);
        {
            let conn = self.conn();
            let inserted = conn
                .execute(
                    "INSERT OR IGNORE INTO records (tbl, id, data, created_at) VALUES (?1, ?2, ?3, ?4)",
                    params![table.as_str(), id, row.to_string(), to_i64(created_at(&row))],
                )
                .map_err(storage)?;
            if inserted == 0 {
                return Err(BackendError::Conflict(format!("{table} {id} already exists")));
            }
        }
        self.server.bus.publish(ChangeEvent::insert(table, &row));
        Ok(row)
    }

    async fn update(&self, table: Table, id: &str, patch: Row) -> Result<Row, BackendError> {
        self.require_session()?;
        let (before, after) = {
            let mut conn = self.conn();
            let tx = conn.transaction().map_err(storage)?;
            let before = load(&tx, table, id)?.ok_or_else(|| BackendError::NotFound {
                table,
                id: id.to_string(),
            })?;
            let after = merge_patch(&before, patch)?;
            tx.execute(
                "UPDATE records SET data = ?3 WHERE tbl = ?1 AND id = ?2",
                params![table.as_str(), id, after.to_string()],
            )
            .map_err(storage)?;
            tx.commit().map_err(storage)?;
            (before, after)
        };
        self.server.bus.publish(ChangeEvent::update(table, &before, &after));
        Ok(after)
    }

    async fn delete(&self, table: Table, id: &str) -> Result<(), BackendError> {
        self.require_session()?;
        let removed = {
            let mut conn = self.conn();
            let tx = conn.transaction().map_err(storage)?;
            let row = load(&tx, table, id)?;
            if row.is_some() {
                tx.execute(
                    "DELETE FROM records WHERE tbl = ?1 AND id = ?2",
                    params![table.as_str(), id],
                )
                .map_err(storage)?;
            }
            tx.commit().map_err(storage)?;
            row
        };
        if let Some(row) = removed {
            self.server.bus.publish(ChangeEvent::delete(table, &row));
        }
        Ok(())
    }

    fn subscribe(&self, table: Table, filter: Option<Filter>) -> Result<ChangeFeed, BackendError> {
        self.require_session()?;
        Ok(self.server.bus.subscribe(table, filter))
    }

    async fn invoke(&self, function: &str, payload: Value) -> Result<Value, BackendError> {
        edge::invoke(self, function, payload).await
    }
}

/// The store runs in-process, so every target resolves to it.
impl Connect for SqliteBackend {
    type Client = SqliteBackend;

    fn connect(&self, target: &BackendTarget) -> Result<Self::Client, BackendError> {
        debug!(endpoint = target.endpoint(), secondary = target.is_override(), "relational client opened");
        Ok(self.client())
    }
}

#[async_trait]
impl AccountStore for SqliteBackend {
    fn caller(&self) -> Option<UserProfile> {
        self.session.borrow().clone()
    }

    async fn rows(&self, table: Table, filter: &Filter) -> Result<Vec<Row>, BackendError> {
        self.query(table, filter)
    }

    async fn find_account(&self, email: &str) -> Result<Option<UserProfile>, BackendError> {
        let conn = self.conn();
        let id: Option<String> = conn
            .query_row(
                "SELECT id FROM accounts WHERE email = ?1",
                params![normalize_email(email)],
                |r| r.get(0),
            )
            .optional()
            .map_err(storage)?;
        match id {
            Some(id) => load_profile(&conn, &id),
            None => Ok(None),
        }
    }

    async fn create_account(
        &self,
        account: NewAccount<'_>,
        confirmed: bool,
    ) -> Result<UserProfile, AuthError> {
        let profile = UserProfile {
            id: UserId::generate(),
            email: normalize_email(account.email),
            name: account.name.trim().to_string(),
            role: account.role,
            is_available: account.role.is_staff(),
            created_at: UnixTimeMs::now(),
        };
        let row = serde_json::to_value(&profile).map_err(|e| AuthError::Provider(e.to_string()))?;
        let salt = uuid::Uuid::new_v4().to_string();
        let digest = password_digest(&salt, account.password);
        {
            let mut conn = self.conn();
            let tx = conn
                .transaction()
                .map_err(|e| AuthError::Provider(e.to_string()))?;
            let inserted = tx
                .execute(
                    "INSERT OR IGNORE INTO accounts (id, email, salt, password_hash, confirmed)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        profile.id.as_str(),
                        profile.email,
                        salt,
                        digest.to_hex().as_str(),
                        confirmed
                    ],
                )
                .map_err(|e| AuthError::Provider(e.to_string()))?;
            if inserted == 0 {
                return Err(AuthError::EmailTaken);
            }
            tx.execute(
                "INSERT INTO records (tbl, id, data, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![
                    Table::Profiles.as_str(),
                    profile.id.as_str(),
                    row.to_string(),
                    to_i64(profile.created_at.as_millis())
                ],
            )
            .map_err(|e| AuthError::Provider(e.to_string()))?;
            tx.commit().map_err(|e| AuthError::Provider(e.to_string()))?;
        }
        info!(user = %profile.id, role = profile.role.as_str(), "account created");
        self.server.bus.publish(ChangeEvent::insert(Table::Profiles, &row));
        Ok(profile)
    }

    async fn delete_accounts(&self, ids: &[UserId]) -> Result<usize, BackendError> {
        let removed = {
            let mut conn = self.conn();
            let tx = conn.transaction().map_err(storage)?;
            let mut removed = Vec::with_capacity(ids.len());
            for id in ids {
                let gone = tx
                    .execute("DELETE FROM accounts WHERE id = ?1", params![id.as_str()])
                    .map_err(storage)?;
                if gone == 0 {
                    // Dropping `tx` rolls back the accounts already removed.
                    return Err(BackendError::NotFound {
                        table: Table::Profiles,
                        id: id.to_string(),
                    });
                }
                if let Some(row) = load(&tx, Table::Profiles, id.as_str())? {
                    tx.execute(
                        "DELETE FROM records WHERE tbl = ?1 AND id = ?2",
                        params![Table::Profiles.as_str(), id.as_str()],
                    )
                    .map_err(storage)?;
                    removed.push(row);
                }
            }
            tx.commit().map_err(storage)?;
            removed
        };
        for row in &removed {
            self.server.bus.publish(ChangeEvent::delete(Table::Profiles, row));
        }
        Ok(removed.len())
    }
}
