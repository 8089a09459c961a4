//! Headless core of a multi-role helpdesk (admin / agent / customer).
//!
//! The crate is split the way a Crux application is split:
//!
//! - [`app`] is the pure core: events in, [`Model`] mutated, effects out,
//!   [`ViewModel`] derived on demand.
//! - [`session`] is the Rust shell around it. It owns backend I/O, the
//!   change-feed subscriptions, the notification dispatcher and the
//!   execution of effects.
//! - [`backend`] is the storage abstraction with a relational (SQLite) and a
//!   document-store adapter.

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]

pub mod app;
pub mod backend;
pub mod capabilities;
pub mod config;
pub mod dispatch;
pub mod event;
pub mod fetch;
pub mod model;
pub mod session;
#[cfg(not(target_arch = "wasm32"))]
pub mod settings;
pub mod subscription;
pub mod view;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use app::App;
pub use capabilities::{Capabilities, Effect};
pub use event::Event;
pub use model::Model;
pub use view::ViewModel;

pub const MAX_VISIBLE_TOASTS: usize = 5;
pub const MAX_NOTIFICATION_HISTORY: usize = 50;
pub const MESSAGE_PREVIEW_LENGTH: usize = 80;
pub const DEFAULT_NAME_CACHE_SIZE: usize = 256;
pub const RECENT_ACTIVITY_LIMIT: usize = 20;
pub const CHANGE_FEED_CAPACITY: usize = 256;

pub const UNKNOWN_CUSTOMER: &str = "Unknown Customer";
pub const UNKNOWN_AGENT: &str = "Support Agent";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorSeverity {
    Transient,
    Permanent,
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Network,
    Authentication,
    Authorization,
    Validation,
    NotFound,
    Conflict,
    Storage,
    Serialization,
    InvalidState,
    Internal,
}

impl ErrorKind {
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Network => "NETWORK_ERROR",
            Self::Authentication => "AUTH_ERROR",
            Self::Authorization => "FORBIDDEN",
            Self::Validation => "VALIDATION_ERROR",
            Self::NotFound => "NOT_FOUND",
            Self::Conflict => "CONFLICT",
            Self::Storage => "STORAGE_ERROR",
            Self::Serialization => "SERIALIZATION_ERROR",
            Self::InvalidState => "INVALID_STATE",
            Self::Internal => "INTERNAL_ERROR",
        }
    }

    #[must_use]
    pub const fn default_severity(self) -> ErrorSeverity {
        match self {
            Self::Network | Self::Conflict | Self::Storage => ErrorSeverity::Transient,

            Self::Serialization | Self::Internal | Self::InvalidState => ErrorSeverity::Fatal,

            Self::Authentication | Self::Authorization | Self::Validation | Self::NotFound => {
                ErrorSeverity::Permanent
            }
        }
    }

    /// Auth failures are never retried automatically.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Network | Self::Storage | Self::Conflict)
    }
}

/// The one error type that reaches users. Module errors convert into it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppError {
    pub kind: ErrorKind,
    pub severity: ErrorSeverity,
    pub message: String,
    /// Diagnostic detail for logs; never shown to the user.
    pub detail: Option<String>,
}

impl AppError {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity: kind.default_severity(),
            message: message.into(),
            detail: None,
        }
    }

    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    #[must_use]
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidState, message)
    }

    #[must_use]
    pub fn user_message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.kind.code(), self.message)
    }
}

impl std::error::Error for AppError {}

pub type AppResult<T> = Result<T, AppError>;

impl From<event::ValidationError> for AppError {
    fn from(e: event::ValidationError) -> Self {
        AppError::new(ErrorKind::Validation, e.to_string())
    }
}

impl From<model::TransitionError> for AppError {
    fn from(e: model::TransitionError) -> Self {
        AppError::new(ErrorKind::Validation, e.to_string())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RowError {
    #[error("row in {table} could not be decoded: {reason}")]
    Decode { table: &'static str, reason: String },
    #[error("value could not be encoded: {0}")]
    Encode(String),
}

impl From<RowError> for AppError {
    fn from(e: RowError) -> Self {
        AppError::new(ErrorKind::Serialization, "Received malformed data").with_detail(e.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToastMessage {
    /// Assigned by [`Model::push_toast`].
    pub id: u64,
    pub title: Option<String>,
    pub message: String,
    pub kind: ToastKind,
    pub created_at_ms: u64,
    pub duration_ms: u64,
}

impl ToastMessage {
    #[must_use]
    pub fn new(message: impl Into<String>, kind: ToastKind) -> Self {
        Self {
            id: 0,
            title: None,
            message: message.into(),
            kind,
            created_at_ms: get_current_time_ms(),
            duration_ms: kind.default_duration_ms(),
        }
    }

    #[must_use]
    pub fn titled(title: impl Into<String>, message: impl Into<String>, kind: ToastKind) -> Self {
        Self {
            title: Some(title.into()),
            ..Self::new(message, kind)
        }
    }

    #[must_use]
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.created_at_ms) > self.duration_ms
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ToastKind {
    #[default]
    Info,
    Success,
    Warning,
    Error,
}

impl ToastKind {
    #[must_use]
    pub const fn default_duration_ms(self) -> u64 {
        match self {
            Self::Info => 3000,
            Self::Success => 2000,
            Self::Warning => 4000,
            Self::Error => 5000,
        }
    }
}

#[must_use]
pub fn get_current_time_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// First `max_chars` characters of `text`, with an ellipsis when cut.
#[must_use]
pub fn preview(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= max_chars {
        return trimmed.to_string();
    }
    let mut out: String = trimmed.chars().take(max_chars.saturating_sub(1)).collect();
    out.push('…');
    out
}
