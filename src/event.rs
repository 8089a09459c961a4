use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::capabilities::PermissionState;
use crate::dispatch::Notification;
use crate::model::{
    Activity, ChatMessage, ChatRoom, ModelLimits, Priority, Role, Table, Ticket, UnixTimeMs,
    UserProfile,
};
use crate::view::TicketFilter;
use crate::AppError;

pub const MIN_PASSWORD_LENGTH: usize = 6;
pub const MAX_TITLE_LENGTH: usize = 200;
pub const MAX_BODY_LENGTH: usize = 10_000;

// --- Typed IDs ---

macro_rules! typed_id {
    ($name:ident) => {
        #[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }
            pub fn generate() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

typed_id!(UserId);
typed_id!(TicketId);
typed_id!(RoomId);
typed_id!(MessageId);
typed_id!(ActivityId);

// --- Form validation ---

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("{field} is required")]
    Required { field: &'static str },
    #[error("please enter a valid email address")]
    InvalidEmail,
    #[error("password must be at least {min} characters")]
    PasswordTooShort { min: usize },
    #[error("please select a role")]
    RoleRequired,
    #[error("{field} is too long ({len} > {max})")]
    TooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },
}

fn required(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::Required { field });
    }
    Ok(())
}

fn bounded(field: &'static str, value: &str, max: usize) -> Result<(), ValidationError> {
    let len = value.chars().count();
    if len > max {
        return Err(ValidationError::TooLong { field, len, max });
    }
    Ok(())
}

/// Loose structural check: one `@`, non-empty local part, dotted domain.
pub fn validate_email(email: &str) -> Result<(), ValidationError> {
    let email = email.trim();
    required("email", email)?;
    if email.chars().any(char::is_whitespace) {
        return Err(ValidationError::InvalidEmail);
    }
    let mut parts = email.split('@');
    let (Some(local), Some(domain), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(ValidationError::InvalidEmail);
    };
    if local.is_empty()
        || domain.len() < 3
        || !domain.contains('.')
        || domain.starts_with('.')
        || domain.ends_with('.')
    {
        return Err(ValidationError::InvalidEmail);
    }
    Ok(())
}

pub fn validate_password(password: &SecretString) -> Result<(), ValidationError> {
    let secret = password.expose_secret();
    if secret.is_empty() {
        return Err(ValidationError::Required { field: "password" });
    }
    if secret.chars().count() < MIN_PASSWORD_LENGTH {
        return Err(ValidationError::PasswordTooShort {
            min: MIN_PASSWORD_LENGTH,
        });
    }
    Ok(())
}

#[derive(Debug)]
pub struct SignInForm {
    pub email: String,
    pub password: SecretString,
}

impl SignInForm {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: SecretString::new(password.into()),
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_email(&self.email)?;
        if self.password.expose_secret().is_empty() {
            return Err(ValidationError::Required { field: "password" });
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct SignUpForm {
    pub email: String,
    pub password: SecretString,
    pub name: String,
    pub role: Option<Role>,
}

impl SignUpForm {
    pub fn new(
        email: impl Into<String>,
        password: impl Into<String>,
        name: impl Into<String>,
        role: Option<Role>,
    ) -> Self {
        Self {
            email: email.into(),
            password: SecretString::new(password.into()),
            name: name.into(),
            role,
        }
    }

    pub fn validate(&self) -> Result<Role, ValidationError> {
        required("name", &self.name)?;
        validate_email(&self.email)?;
        validate_password(&self.password)?;
        self.role.ok_or(ValidationError::RoleRequired)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TicketDraft {
    pub title: String,
    pub description: String,
    pub priority: Priority,
    pub category: String,
}

impl TicketDraft {
    pub fn validate(&self) -> Result<(), ValidationError> {
        required("title", &self.title)?;
        required("description", &self.description)?;
        required("category", &self.category)?;
        bounded("title", &self.title, MAX_TITLE_LENGTH)?;
        bounded("description", &self.description, MAX_BODY_LENGTH)?;
        Ok(())
    }
}

pub fn validate_message_body(body: &str) -> Result<(), ValidationError> {
    required("message", body)?;
    bounded("message", body, MAX_BODY_LENGTH)
}

// --- Event enum: large variants boxed ---

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub enum Event {
    // Session
    SessionStarted {
        user: UserProfile,
        desktop_permission: PermissionState,
        limits: ModelLimits,
    },
    SessionEnded,
    DesktopPermissionChanged(PermissionState),

    // Authoritative fetches
    FetchStarted {
        table: Table,
        seq: u64,
    },
    TicketsFetched {
        seq: u64,
        tickets: Vec<Ticket>,
    },
    RoomsFetched {
        seq: u64,
        rooms: Vec<ChatRoom>,
    },
    MessagesFetched {
        seq: u64,
        messages: Vec<ChatMessage>,
    },
    ActivitiesFetched {
        seq: u64,
        activities: Vec<Activity>,
    },
    FetchFailed {
        table: Table,
        seq: u64,
        error: AppError,
    },

    // Ticket list controls
    FilterSelected(TicketFilter),
    SearchChanged(String),
    TicketDraftChanged(TicketDraft),

    // Chat
    RoomOpened {
        room_id: RoomId,
        at: UnixTimeMs,
    },

    // Notifications
    NotificationRaised(Box<Notification>),
    DesktopNotificationFailed {
        notification: Box<Notification>,
        reason: String,
    },
    ToastDismissed {
        id: u64,
    },

    // Command outcomes
    CommandSucceeded {
        message: String,
        clears_draft: bool,
    },
    CommandFailed {
        error: AppError,
    },
}

impl Event {
    /// Stable name for log fields.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::SessionStarted { .. } => "session_started",
            Self::SessionEnded => "session_ended",
            Self::DesktopPermissionChanged(_) => "desktop_permission_changed",
            Self::FetchStarted { .. } => "fetch_started",
            Self::TicketsFetched { .. } => "tickets_fetched",
            Self::RoomsFetched { .. } => "rooms_fetched",
            Self::MessagesFetched { .. } => "messages_fetched",
            Self::ActivitiesFetched { .. } => "activities_fetched",
            Self::FetchFailed { .. } => "fetch_failed",
            Self::FilterSelected(_) => "filter_selected",
            Self::SearchChanged(_) => "search_changed",
            Self::TicketDraftChanged(_) => "ticket_draft_changed",
            Self::RoomOpened { .. } => "room_opened",
            Self::NotificationRaised(_) => "notification_raised",
            Self::DesktopNotificationFailed { .. } => "desktop_notification_failed",
            Self::ToastDismissed { .. } => "toast_dismissed",
            Self::CommandSucceeded { .. } => "command_succeeded",
            Self::CommandFailed { .. } => "command_failed",
        }
    }
}
