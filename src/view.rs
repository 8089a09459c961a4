//! Derived views: filtered ticket lists, per-bucket counts and unread badges.
//!
//! Everything here is a pure function of the raw lists in [`Model`]. Counts
//! and filtered lists go through the same predicates, so they cannot
//! disagree.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::dispatch::Notification;
use crate::event::{RoomId, TicketDraft, TicketId, UserId};
use crate::model::{
    Activity, ChatMessage, Model, Priority, Role, RoomStatus, Ticket, TicketStatus, UnixTimeMs,
    UserProfile,
};
use crate::{preview, ToastMessage, MESSAGE_PREVIEW_LENGTH, RECENT_ACTIVITY_LIMIT, UNKNOWN_CUSTOMER};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TicketFilter {
    #[default]
    All,
    Unassigned,
    /// Assigned to the current user, matched by display name.
    Assigned,
    InProgress,
    Resolved,
    /// Closed tickets.
    Archive,
}

impl TicketFilter {
    pub const ALL: [TicketFilter; 6] = [
        Self::All,
        Self::Unassigned,
        Self::Assigned,
        Self::InProgress,
        Self::Resolved,
        Self::Archive,
    ];

    #[must_use]
    pub fn matches(self, ticket: &Ticket, me: &UserProfile) -> bool {
        match self {
            Self::All => true,
            Self::Unassigned => ticket.status == TicketStatus::Unassigned,
            Self::Assigned => {
                ticket.status == TicketStatus::Assigned
                    && ticket.assignee_name.as_deref() == Some(me.name.as_str())
            }
            Self::InProgress => ticket.status == TicketStatus::InProgress,
            Self::Resolved => ticket.status == TicketStatus::Resolved,
            Self::Archive => ticket.status == TicketStatus::Closed,
        }
    }
}

/// Case-insensitive substring match over title, description and customer name.
#[must_use]
pub fn matches_search(ticket: &Ticket, query: &str) -> bool {
    let needle = query.trim().to_lowercase();
    if needle.is_empty() {
        return true;
    }
    let haystacks = [
        Some(ticket.title.as_str()),
        Some(ticket.description.as_str()),
        ticket.customer_name.as_deref(),
    ];
    haystacks
        .into_iter()
        .flatten()
        .any(|h| h.to_lowercase().contains(&needle))
}

/// Tickets passing both the filter and the search, newest first.
#[must_use]
pub fn filter_tickets<'a>(
    tickets: &'a [Ticket],
    filter: TicketFilter,
    search: &str,
    me: &UserProfile,
) -> Vec<&'a Ticket> {
    let mut out: Vec<&Ticket> = tickets
        .iter()
        .filter(|t| filter.matches(t, me) && matches_search(t, search))
        .collect();
    out.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FilterCounts {
    pub all: usize,
    pub unassigned: usize,
    pub assigned: usize,
    pub in_progress: usize,
    pub resolved: usize,
    pub archive: usize,
}

impl FilterCounts {
    #[must_use]
    pub const fn get(&self, filter: TicketFilter) -> usize {
        match filter {
            TicketFilter::All => self.all,
            TicketFilter::Unassigned => self.unassigned,
            TicketFilter::Assigned => self.assigned,
            TicketFilter::InProgress => self.in_progress,
            TicketFilter::Resolved => self.resolved,
            TicketFilter::Archive => self.archive,
        }
    }

    fn slot(&mut self, filter: TicketFilter) -> &mut usize {
        match filter {
            TicketFilter::All => &mut self.all,
            TicketFilter::Unassigned => &mut self.unassigned,
            TicketFilter::Assigned => &mut self.assigned,
            TicketFilter::InProgress => &mut self.in_progress,
            TicketFilter::Resolved => &mut self.resolved,
            TicketFilter::Archive => &mut self.archive,
        }
    }
}

#[must_use]
pub fn filter_counts(tickets: &[Ticket], me: &UserProfile) -> FilterCounts {
    let mut counts = FilterCounts::default();
    for ticket in tickets {
        for filter in TicketFilter::ALL {
            if filter.matches(ticket, me) {
                *counts.slot(filter) += 1;
            }
        }
    }
    counts
}

/// Messages in `room` newer than the watermark that someone else sent.
#[must_use]
pub fn unread_count(
    messages: &[ChatMessage],
    room: &RoomId,
    watermark: Option<UnixTimeMs>,
    me: &UserId,
) -> usize {
    messages
        .iter()
        .filter(|m| &m.room_id == room && &m.sender_id != me)
        .filter(|m| watermark.map_or(true, |w| m.created_at > w))
        .count()
}

#[must_use]
pub fn unread_by_room(model: &Model) -> HashMap<RoomId, usize> {
    let Some(me) = model.user.as_ref() else {
        return HashMap::new();
    };
    model
        .rooms
        .iter()
        .map(|room| {
            let unread = unread_count(
                &model.messages,
                &room.id,
                model.watermarks.get(&room.id).copied(),
                &me.id,
            );
            (room.id.clone(), unread)
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketItem {
    pub id: TicketId,
    pub title: String,
    pub status: TicketStatus,
    pub priority: Priority,
    pub category: String,
    pub customer_name: String,
    pub assignee_name: Option<String>,
    pub updated_at: UnixTimeMs,
}

impl From<&Ticket> for TicketItem {
    fn from(t: &Ticket) -> Self {
        Self {
            id: t.id.clone(),
            title: t.title.clone(),
            status: t.status,
            priority: t.priority,
            category: t.category.clone(),
            customer_name: t
                .customer_name
                .clone()
                .unwrap_or_else(|| UNKNOWN_CUSTOMER.to_string()),
            assignee_name: t.assignee_name.clone(),
            updated_at: t.updated_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomItem {
    pub id: RoomId,
    pub customer_id: UserId,
    pub agent_id: Option<UserId>,
    pub status: RoomStatus,
    pub unread: usize,
    pub last_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ViewModel {
    pub signed_in: bool,
    pub user_name: Option<String>,
    pub role: Option<Role>,

    pub filter: TicketFilter,
    pub search: String,
    pub tickets: Vec<TicketItem>,
    pub counts: FilterCounts,

    pub rooms: Vec<RoomItem>,
    pub total_unread: usize,
    pub recent_activity: Vec<Activity>,

    pub loading: bool,
    /// Latest read failure. Lists above keep their last good contents.
    pub error: Option<String>,
    pub toasts: Vec<ToastMessage>,
    pub notifications: Vec<Notification>,
    pub ticket_draft: Option<TicketDraft>,
}

#[must_use]
pub fn build_view(model: &Model) -> ViewModel {
    let Some(me) = model.user.as_ref() else {
        return ViewModel {
            toasts: model.toasts.iter().cloned().collect(),
            ..ViewModel::default()
        };
    };

    let tickets = filter_tickets(&model.tickets, model.filter, &model.search, me)
        .into_iter()
        .map(TicketItem::from)
        .collect();

    let unread = unread_by_room(model);
    let mut rooms: Vec<RoomItem> = model
        .rooms
        .iter()
        .map(|room| RoomItem {
            id: room.id.clone(),
            customer_id: room.customer_id.clone(),
            agent_id: room.agent_id.clone(),
            status: room.status,
            unread: unread.get(&room.id).copied().unwrap_or(0),
            last_message: model
                .messages
                .iter()
                .filter(|m| m.room_id == room.id)
                .max_by_key(|m| m.created_at)
                .map(|m| preview(&m.body, MESSAGE_PREVIEW_LENGTH)),
        })
        .collect();
    rooms.sort_by(|a, b| b.unread.cmp(&a.unread).then_with(|| a.id.cmp(&b.id)));

    let mut recent_activity = model.activities.clone();
    recent_activity.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    recent_activity.truncate(RECENT_ACTIVITY_LIMIT);

    let error = model
        .fetches
        .values()
        .filter_map(|f| f.error.as_ref())
        .map(|e| e.user_message().to_string())
        .next();

    ViewModel {
        signed_in: true,
        user_name: Some(me.name.clone()),
        role: Some(me.role),
        filter: model.filter,
        search: model.search.clone(),
        tickets,
        counts: filter_counts(&model.tickets, me),
        total_unread: rooms.iter().map(|r| r.unread).sum(),
        rooms,
        recent_activity,
        loading: model.fetches.values().any(crate::model::FetchState::is_loading),
        error,
        toasts: model.toasts.iter().cloned().collect(),
        notifications: model.notifications.iter().cloned().collect(),
        ticket_draft: model.ticket_draft.clone(),
    }
}
