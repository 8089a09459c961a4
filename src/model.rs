use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;

use crate::capabilities::PermissionState;
use crate::dispatch::Notification;
use crate::event::{ActivityId, MessageId, RoomId, TicketDraft, TicketId, UserId};
use crate::view::TicketFilter;
use crate::{AppError, ToastMessage};

/// Explicit timestamp unit.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    #[must_use]
    pub fn now() -> Self {
        Self(crate::get_current_time_ms())
    }

    #[must_use]
    pub const fn as_millis(self) -> u64 {
        self.0
    }
}

/// Declaration order is the order collections are reported in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Profiles,
    Tickets,
    ChatRooms,
    ChatMessages,
    Activities,
}

impl Table {
    pub const ALL: [Table; 5] = [
        Self::Profiles,
        Self::Tickets,
        Self::ChatRooms,
        Self::ChatMessages,
        Self::Activities,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Profiles => "profiles",
            Self::Tickets => "tickets",
            Self::ChatRooms => "chat_rooms",
            Self::ChatMessages => "chat_messages",
            Self::Activities => "activities",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Agent,
    Customer,
}

impl Role {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Agent => "agent",
            Self::Customer => "customer",
        }
    }

    /// Admins and agents work tickets; customers only see their own.
    #[must_use]
    pub const fn is_staff(self) -> bool {
        matches!(self, Self::Admin | Self::Agent)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: UserId,
    pub email: String,
    pub name: String,
    pub role: Role,
    #[serde(default)]
    pub is_available: bool,
    #[serde(default)]
    pub created_at: UnixTimeMs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    #[default]
    Unassigned,
    Assigned,
    InProgress,
    Resolved,
    Closed,
}

impl TicketStatus {
    #[must_use]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "unassigned" | "open" => Some(Self::Unassigned),
            "assigned" => Some(Self::Assigned),
            "in_progress" | "inprogress" => Some(Self::InProgress),
            "resolved" => Some(Self::Resolved),
            "closed" => Some(Self::Closed),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unassigned => "unassigned",
            Self::Assigned => "assigned",
            Self::InProgress => "in_progress",
            Self::Resolved => "resolved",
            Self::Closed => "closed",
        }
    }

    #[must_use]
    pub const fn display_name(self) -> &'static str {
        match self {
            Self::Unassigned => "Unassigned",
            Self::Assigned => "Assigned",
            Self::InProgress => "In Progress",
            Self::Resolved => "Resolved",
            Self::Closed => "Closed",
        }
    }

    /// Tickets an agent still has to work on.
    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(self, Self::Unassigned | Self::Assigned | Self::InProgress)
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Closed)
    }

    /// Forward edges of the ticket lifecycle. Only consulted under
    /// [`TransitionPolicy::Strict`].
    #[must_use]
    pub fn valid_transitions(self) -> Vec<Self> {
        match self {
            Self::Unassigned => vec![Self::Assigned],
            Self::Assigned => vec![Self::InProgress],
            Self::InProgress => vec![Self::Resolved, Self::Closed],
            Self::Resolved => vec![Self::Closed],
            Self::Closed => vec![],
        }
    }

    #[must_use]
    pub fn can_transition_to(self, to: Self) -> bool {
        self.valid_transitions().contains(&to)
    }

    pub fn validate_transition(self, to: Self, policy: TransitionPolicy) -> Result<(), TransitionError> {
        match policy {
            TransitionPolicy::Permissive => Ok(()),
            TransitionPolicy::Strict => {
                if self == to {
                    return Err(TransitionError::SameStatus);
                }
                if self.is_terminal() {
                    return Err(TransitionError::FromTerminalStatus { status: self });
                }
                if !self.can_transition_to(to) {
                    return Err(TransitionError::InvalidTransition { from: self, to });
                }
                Ok(())
            }
        }
    }
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// How status writes are checked before they reach the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionPolicy {
    /// Any role-permitted actor may set any status (reopening included).
    #[default]
    Permissive,
    /// unassigned → assigned → in_progress → {resolved, closed}, resolved → closed.
    Strict,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("Cannot transition to the same status")]
    SameStatus,
    #[error("Cannot transition from terminal status: {status}")]
    FromTerminalStatus { status: TicketStatus },
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: TicketStatus, to: TicketStatus },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

impl Priority {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }

    #[must_use]
    pub const fn display_name(self) -> &'static str {
        match self {
            Self::Low => "Low",
            Self::Medium => "Medium",
            Self::High => "High",
            Self::Urgent => "Urgent",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    pub id: TicketId,
    pub title: String,
    pub description: String,
    pub status: TicketStatus,
    pub priority: Priority,
    pub category: String,
    pub customer_id: UserId,
    /// Denormalized display name; absent on rows written without a join.
    #[serde(default)]
    pub customer_name: Option<String>,
    #[serde(default)]
    pub assigned_to: Option<UserId>,
    /// Display name of the assignee. The "assigned to me" filter matches on this.
    #[serde(default)]
    pub assignee_name: Option<String>,
    pub created_at: UnixTimeMs,
    pub updated_at: UnixTimeMs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RoomStatus {
    #[default]
    Waiting,
    Active,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRoom {
    pub id: RoomId,
    pub customer_id: UserId,
    #[serde(default)]
    pub agent_id: Option<UserId>,
    pub status: RoomStatus,
    pub created_at: UnixTimeMs,
    pub updated_at: UnixTimeMs,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub room_id: RoomId,
    /// Owner of the room, copied onto every message.
    pub customer_id: UserId,
    pub sender_id: UserId,
    pub body: String,
    pub created_at: UnixTimeMs,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activity {
    pub id: ActivityId,
    pub message: String,
    #[serde(default)]
    pub user_id: Option<UserId>,
    pub created_at: UnixTimeMs,
}

/// Per-collection bookkeeping for the stale-result guard.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchState {
    /// Highest sequence number handed out for this collection.
    pub requested: u64,
    /// Sequence number of the result currently held in the model.
    pub applied: u64,
    pub error: Option<AppError>,
}

impl FetchState {
    #[must_use]
    pub fn is_loading(&self) -> bool {
        self.requested > self.applied && self.error.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelLimits {
    pub toasts: usize,
    pub notification_history: usize,
}

impl Default for ModelLimits {
    fn default() -> Self {
        Self {
            toasts: crate::MAX_VISIBLE_TOASTS,
            notification_history: crate::MAX_NOTIFICATION_HISTORY,
        }
    }
}

/// Session-scoped state held by the core. Nothing here is persisted; unread
/// and filter counts are always derived from the raw lists.
#[derive(Debug, Clone, Default)]
pub struct Model {
    pub user: Option<UserProfile>,
    pub desktop_permission: PermissionState,
    pub limits: ModelLimits,

    // Raw entity lists, replaced wholesale by authoritative fetches
    pub tickets: Vec<Ticket>,
    pub rooms: Vec<ChatRoom>,
    pub messages: Vec<ChatMessage>,
    pub activities: Vec<Activity>,
    pub fetches: BTreeMap<Table, FetchState>,

    // Ticket list controls
    pub filter: TicketFilter,
    pub search: String,

    // Read watermarks, in-memory only
    pub watermarks: HashMap<RoomId, UnixTimeMs>,

    // Feedback
    pub toasts: VecDeque<ToastMessage>,
    pub next_toast_id: u64,
    pub notifications: VecDeque<Notification>,
    pub ticket_draft: Option<TicketDraft>,
}

impl Model {
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.user.is_some()
    }

    pub fn fetch_state_mut(&mut self, table: Table) -> &mut FetchState {
        self.fetches.entry(table).or_default()
    }

    /// Queue a toast, evicting the oldest once the visible limit is reached.
    pub fn push_toast(&mut self, mut toast: ToastMessage) -> u64 {
        self.next_toast_id += 1;
        toast.id = self.next_toast_id;
        while self.toasts.len() >= self.limits.toasts.max(1) {
            self.toasts.pop_front();
        }
        self.toasts.push_back(toast);
        self.next_toast_id
    }

    pub fn record_notification(&mut self, notification: Notification) {
        while self.notifications.len() >= self.limits.notification_history.max(1) {
            self.notifications.pop_front();
        }
        self.notifications.push_back(notification);
    }

    /// Drop everything tied to the signed-in user.
    pub fn reset(&mut self) {
        let permission = self.desktop_permission;
        *self = Self::default();
        self.desktop_permission = permission;
    }
}
