//! Storage abstraction: auth, row CRUD, change feeds and privileged edge
//! functions behind one trait.
//!
//! Rows travel as JSON objects. Every row carries a string `id` plus
//! `created_at`/`updated_at` millisecond timestamps, filled in on insert when
//! the caller leaves them out. Two adapters ship with the crate:
//! [`SqliteBackend`] (relational) and [`DocumentBackend`] (in-memory document
//! collections). Both split into a shared "server" and per-tab clients so
//! several sessions can race against the same data.

mod edge;
mod memory;
#[cfg(not(target_arch = "wasm32"))]
mod sqlite;
#[cfg(test)]
pub(crate) mod testing;

use async_trait::async_trait;
use secrecy::SecretString;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tracing::{trace, warn};

pub use edge::{
    AssignedAgent, AutoAssignResponse, CreateUserRequest, DeleteUsersRequest, DeleteUsersResponse,
    ProvisionRequest, ProvisionResponse, ProvisionUser, AUTO_ASSIGN, CREATE_USER, DELETE_USERS,
    PROVISION_INITIAL_USERS,
};
pub use memory::DocumentBackend;
#[cfg(not(target_arch = "wasm32"))]
pub use sqlite::SqliteBackend;

use crate::config::BackendTarget;
use crate::model::{Role, Table, UnixTimeMs, UserProfile};
use crate::{AppError, ErrorKind};

pub type Row = Value;

/// Decodes what it can; malformed rows are logged and skipped.
pub(crate) fn decode_rows<T: DeserializeOwned>(table: Table, rows: Vec<Row>) -> Vec<T> {
    rows.into_iter()
        .filter_map(|row| match serde_json::from_value(row) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(%table, error = %e, "skipping malformed row");
                None
            }
        })
        .collect()
}

/// Conjunction of column equalities.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    clauses: Vec<(String, Value)>,
}

impl Filter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn column_eq(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.clauses.push((column.into(), value.into()));
        self
    }

    #[must_use]
    pub fn clauses(&self) -> &[(String, Value)] {
        &self.clauses
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// Missing columns compare equal to `null`.
    #[must_use]
    pub fn matches(&self, row: &Row) -> bool {
        self.clauses
            .iter()
            .all(|(column, value)| row.get(column).unwrap_or(&Value::Null) == value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

/// One committed row change. `before` is absent on inserts and may be absent
/// on updates when the store does not keep the old image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub table: Table,
    pub op: ChangeOp,
    pub before: Option<Row>,
    pub after: Option<Row>,
}

impl ChangeEvent {
    pub fn insert<T: Serialize>(table: Table, row: &T) -> Self {
        Self {
            table,
            op: ChangeOp::Insert,
            before: None,
            after: serde_json::to_value(row).ok(),
        }
    }

    pub fn update<T: Serialize>(table: Table, before: &T, after: &T) -> Self {
        Self {
            table,
            op: ChangeOp::Update,
            before: serde_json::to_value(before).ok(),
            after: serde_json::to_value(after).ok(),
        }
    }

    pub fn delete<T: Serialize>(table: Table, row: &T) -> Self {
        Self {
            table,
            op: ChangeOp::Delete,
            before: serde_json::to_value(row).ok(),
            after: None,
        }
    }

    #[must_use]
    pub fn before<T: DeserializeOwned>(&self) -> Option<T> {
        decode_image(self.table, self.before.as_ref())
    }

    #[must_use]
    pub fn after<T: DeserializeOwned>(&self) -> Option<T> {
        decode_image(self.table, self.after.as_ref())
    }

    #[must_use]
    pub fn row_id(&self) -> Option<&str> {
        self.after
            .as_ref()
            .or(self.before.as_ref())
            .and_then(row_id)
    }

    fn matches(&self, table: Table, filter: Option<&Filter>) -> bool {
        if self.table != table {
            return false;
        }
        let Some(filter) = filter else {
            return true;
        };
        [self.after.as_ref(), self.before.as_ref()]
            .into_iter()
            .flatten()
            .any(|row| filter.matches(row))
    }
}

fn decode_image<T: DeserializeOwned>(table: Table, image: Option<&Row>) -> Option<T> {
    let row = image?;
    match serde_json::from_value(row.clone()) {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(%table, error = %e, "change image could not be decoded");
            None
        }
    }
}

#[must_use]
pub fn row_id(row: &Row) -> Option<&str> {
    row.get("id").and_then(Value::as_str)
}

/// What a subscriber sees on its feed.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedItem {
    Change(ChangeEvent),
    /// Events were dropped; the subscriber should refetch authoritatively.
    Resync,
}

/// Fan-out of committed changes to every client of one store.
#[derive(Debug, Clone)]
pub(crate) struct ChangeBus {
    tx: broadcast::Sender<ChangeEvent>,
}

impl ChangeBus {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub(crate) fn publish(&self, event: ChangeEvent) {
        trace!(table = %event.table, op = ?event.op, subscribers = self.tx.receiver_count(), "publish change");
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    pub(crate) fn subscribe(&self, table: Table, filter: Option<Filter>) -> ChangeFeed {
        ChangeFeed {
            rx: self.tx.subscribe(),
            table,
            filter,
        }
    }
}

/// A table-scoped, optionally filtered view of the change bus.
#[derive(Debug)]
pub struct ChangeFeed {
    rx: broadcast::Receiver<ChangeEvent>,
    table: Table,
    filter: Option<Filter>,
}

impl ChangeFeed {
    #[must_use]
    pub fn table(&self) -> Table {
        self.table
    }

    /// Next matching item, or `None` once the store has gone away.
    pub async fn recv(&mut self) -> Option<FeedItem> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.matches(self.table, self.filter.as_ref()) => {
                    return Some(FeedItem::Change(event));
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(table = %self.table, skipped, "change feed lagged");
                    return Some(FeedItem::Resync);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("network error: {0}")]
    Network(String),

    #[error("{table} row not found: {id}")]
    NotFound { table: Table, id: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("rejected: {0}")]
    Rejected(String),

    #[error("not signed in")]
    Unauthorized,

    #[error("malformed row: {0}")]
    Serialization(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl From<serde_json::Error> for BackendError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<BackendError> for AppError {
    fn from(e: BackendError) -> Self {
        let detail = e.to_string();
        let err = match e {
            BackendError::Network(_) => {
                AppError::new(ErrorKind::Network, "Unable to reach the server")
            }
            BackendError::NotFound { .. } => AppError::not_found("Record not found"),
            BackendError::Conflict(_) => {
                AppError::new(ErrorKind::Conflict, "The record was changed by someone else")
            }
            BackendError::Rejected(message) => AppError::new(ErrorKind::Authorization, message),
            BackendError::Unauthorized => {
                AppError::new(ErrorKind::Authentication, "Please sign in again")
            }
            BackendError::Serialization(_) => {
                AppError::new(ErrorKind::Serialization, "Received malformed data")
            }
            BackendError::Storage(_) => AppError::new(ErrorKind::Storage, "Storage error"),
        };
        err.with_detail(detail)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("Invalid email or password")]
    InvalidCredentials,

    #[error("Please confirm your email address before signing in")]
    EmailNotConfirmed,

    #[error("An account with this email already exists")]
    EmailTaken,

    #[error("Authentication failed: {0}")]
    Provider(String),
}

impl From<BackendError> for AuthError {
    fn from(e: BackendError) -> Self {
        Self::Provider(e.to_string())
    }
}

impl From<AuthError> for AppError {
    fn from(e: AuthError) -> Self {
        let kind = match e {
            AuthError::EmailTaken => ErrorKind::Conflict,
            _ => ErrorKind::Authentication,
        };
        AppError::new(kind, e.to_string())
    }
}

/// Input for account creation, already validated.
#[derive(Debug)]
pub struct NewAccount<'a> {
    pub email: &'a str,
    pub password: &'a SecretString,
    pub name: &'a str,
    pub role: Role,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendOptions {
    /// Self-service sign-ups must confirm their email before signing in.
    pub require_email_confirmation: bool,
    pub feed_capacity: usize,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            require_email_confirmation: false,
            feed_capacity: crate::CHANGE_FEED_CAPACITY,
        }
    }
}

#[async_trait]
pub trait Backend: Send + Sync + 'static {
    async fn sign_in(&self, email: &str, password: &SecretString) -> Result<UserProfile, AuthError>;

    async fn sign_up(&self, account: NewAccount<'_>) -> Result<UserProfile, AuthError>;

    async fn sign_out(&self) -> Result<(), BackendError>;

    /// Current auth state of this client; updates on sign-in and sign-out.
    fn auth_state(&self) -> watch::Receiver<Option<UserProfile>>;

    /// Rows matching `filter`, oldest first by `(created_at, id)`.
    async fn select(&self, table: Table, filter: &Filter) -> Result<Vec<Row>, BackendError>;

    /// Inserts and returns the stored row with `id` and timestamps filled in.
    async fn insert(&self, table: Table, row: Row) -> Result<Row, BackendError>;

    /// Shallow-merges `patch` into the row and bumps `updated_at`.
    async fn update(&self, table: Table, id: &str, patch: Row) -> Result<Row, BackendError>;

    /// Deleting a missing row is not an error.
    async fn delete(&self, table: Table, id: &str) -> Result<(), BackendError>;

    fn subscribe(&self, table: Table, filter: Option<Filter>) -> Result<ChangeFeed, BackendError>;

    /// Runs a privileged server-side function.
    async fn invoke(&self, function: &str, payload: Value) -> Result<Value, BackendError>;

    fn current_user(&self) -> Option<UserProfile> {
        self.auth_state().borrow().clone()
    }
}

/// Opens signed-out clients against a configured backend.
pub trait Connect {
    type Client: Backend;

    fn connect(&self, target: &BackendTarget) -> Result<Self::Client, BackendError>;
}

pub(crate) fn prepare_insert(row: Row) -> Result<(String, Map<String, Value>), BackendError> {
    let Value::Object(mut object) = row else {
        return Err(BackendError::Serialization("row must be a JSON object".into()));
    };
    let id = match object.get("id").and_then(Value::as_str) {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => uuid::Uuid::new_v4().to_string(),
    };
    object.insert("id".into(), Value::String(id.clone()));
    let now = UnixTimeMs::now().as_millis();
    object.entry("created_at").or_insert_with(|| Value::from(now));
    object.entry("updated_at").or_insert_with(|| Value::from(now));
    Ok((id, object))
}

/// `id` and `created_at` are immutable.
pub(crate) fn merge_patch(existing: &Row, patch: Row) -> Result<Row, BackendError> {
    let Value::Object(patch) = patch else {
        return Err(BackendError::Serialization("patch must be a JSON object".into()));
    };
    let mut merged = existing.as_object().cloned().unwrap_or_default();
    for (key, value) in patch {
        if key == "id" || key == "created_at" {
            continue;
        }
        merged.insert(key, value);
    }
    merged.insert("updated_at".into(), Value::from(UnixTimeMs::now().as_millis()));
    Ok(Value::Object(merged))
}

pub(crate) fn created_at(row: &Row) -> u64 {
    row.get("created_at").and_then(Value::as_u64).unwrap_or(0)
}

pub(crate) fn sort_rows(rows: &mut [Row]) {
    rows.sort_by(|a, b| {
        created_at(a)
            .cmp(&created_at(b))
            .then_with(|| row_id(a).cmp(&row_id(b)))
    });
}

/// Salted password digest stored by both adapters.
pub(crate) fn password_digest(salt: &str, password: &SecretString) -> blake3::Hash {
    use secrecy::ExposeSecret;
    let mut hasher = blake3::Hasher::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.expose_secret().as_bytes());
    hasher.finalize()
}

pub(crate) fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}
