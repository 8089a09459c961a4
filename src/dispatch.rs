//! Maps one change event, seen by one user, to zero or one notification.
//!
//! Lookups that the payload does not carry (display names, room ownership,
//! the ticket's state before an update) go through [`Directory`]. A failed
//! lookup degrades to a generic name; it never suppresses the notification.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backend::{ChangeEvent, ChangeOp};
use crate::capabilities::DesktopNotification;
use crate::event::{RoomId, TicketId, UserId};
use crate::model::{ChatMessage, ChatRoom, Role, RoomStatus, Table, Ticket, TicketStatus, UnixTimeMs, UserProfile};
use crate::{preview, MESSAGE_PREVIEW_LENGTH, UNKNOWN_AGENT, UNKNOWN_CUSTOMER};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    NewTicket,
    TicketAssigned,
    TicketStatusChanged,
    ChatMessage,
    AgentConnected,
}

impl NotificationKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NewTicket => "new_ticket",
            Self::TicketAssigned => "ticket_assigned",
            Self::TicketStatusChanged => "ticket_status_changed",
            Self::ChatMessage => "chat_message",
            Self::AgentConnected => "agent_connected",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub recipient: UserId,
    pub entity_id: String,
    pub title: String,
    pub body: String,
    pub created_at: UnixTimeMs,
}

impl Notification {
    fn new(
        kind: NotificationKind,
        recipient: &UserId,
        entity_id: impl Into<String>,
        title: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            recipient: recipient.clone(),
            entity_id: entity_id.into(),
            title: title.into(),
            body: body.into(),
            created_at: UnixTimeMs::now(),
        }
    }

    #[must_use]
    pub fn tag(&self) -> String {
        format!("{}:{}", self.kind.as_str(), self.entity_id)
    }

    #[must_use]
    pub fn to_desktop(&self) -> DesktopNotification {
        DesktopNotification {
            title: self.title.clone(),
            body: self.body.clone(),
            tag: Some(self.tag()),
        }
    }
}

/// Secondary lookups for the dispatcher.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn display_name(&self, user: &UserId) -> Option<String>;

    /// Current room, looked up live when the session has not seen it yet.
    async fn room(&self, room: &RoomId) -> Option<ChatRoom>;

    /// Room as last known to the session, i.e. before the change being dispatched.
    async fn previous_room(&self, room: &RoomId) -> Option<ChatRoom>;

    /// Ticket as last known to the session, for feeds that omit `before`.
    async fn previous_ticket(&self, ticket: &TicketId) -> Option<Ticket>;
}

/// Per-status text shown to the ticket's owner. Statuses without text are
/// not announced.
#[must_use]
pub fn customer_status_message(status: TicketStatus, title: &str) -> Option<String> {
    match status {
        TicketStatus::Assigned => Some(format!(
            "Your ticket \"{title}\" has been assigned to a support agent."
        )),
        TicketStatus::InProgress => Some(format!("Your ticket \"{title}\" is now being worked on.")),
        TicketStatus::Resolved => Some(format!("Your ticket \"{title}\" has been resolved.")),
        TicketStatus::Closed => Some(format!("Your ticket \"{title}\" has been closed.")),
        TicketStatus::Unassigned => None,
    }
}

pub async fn dispatch(
    change: &ChangeEvent,
    me: &UserProfile,
    directory: &dyn Directory,
) -> Option<Notification> {
    let notification = match (change.table, change.op) {
        (Table::Tickets, ChangeOp::Insert) => ticket_inserted(change, me, directory).await,
        (Table::Tickets, ChangeOp::Update) => ticket_updated(change, me, directory).await,
        (Table::ChatMessages, ChangeOp::Insert) => message_inserted(change, me, directory).await,
        (Table::ChatRooms, ChangeOp::Update) => room_updated(change, me, directory).await,
        _ => None,
    };
    if let Some(n) = &notification {
        debug!(kind = n.kind.as_str(), entity = %n.entity_id, "notification dispatched");
    }
    notification
}

async fn ticket_inserted(
    change: &ChangeEvent,
    me: &UserProfile,
    directory: &dyn Directory,
) -> Option<Notification> {
    if !me.role.is_staff() {
        return None;
    }
    let ticket: Ticket = change.after()?;
    let customer = match ticket.customer_name.clone() {
        Some(name) => name,
        None => directory
            .display_name(&ticket.customer_id)
            .await
            .unwrap_or_else(|| UNKNOWN_CUSTOMER.to_string()),
    };
    Some(Notification::new(
        NotificationKind::NewTicket,
        &me.id,
        ticket.id.as_str(),
        "New ticket",
        format!(
            "{customer} · {} priority · {}",
            ticket.priority.display_name(),
            ticket.title
        ),
    ))
}

async fn ticket_updated(
    change: &ChangeEvent,
    me: &UserProfile,
    directory: &dyn Directory,
) -> Option<Notification> {
    let ticket: Ticket = change.after()?;
    let before = match change.before::<Ticket>() {
        Some(before) => Some(before),
        None => directory.previous_ticket(&ticket.id).await,
    };
    let previous = before.map(|t| t.status);
    if previous == Some(ticket.status) {
        return None;
    }

    let became_assigned =
        ticket.status == TicketStatus::Assigned && previous != Some(TicketStatus::Assigned);
    if became_assigned && ticket.assigned_to.as_ref() == Some(&me.id) {
        return Some(Notification::new(
            NotificationKind::TicketAssigned,
            &me.id,
            ticket.id.as_str(),
            "Ticket Assigned",
            format!("\"{}\" has been assigned to you.", ticket.title),
        ));
    }

    if me.role == Role::Customer && ticket.customer_id == me.id {
        let body = customer_status_message(ticket.status, &ticket.title)?;
        return Some(Notification::new(
            NotificationKind::TicketStatusChanged,
            &me.id,
            ticket.id.as_str(),
            "Ticket Update",
            body,
        ));
    }
    None
}

async fn message_inserted(
    change: &ChangeEvent,
    me: &UserProfile,
    directory: &dyn Directory,
) -> Option<Notification> {
    let message: ChatMessage = change.after()?;
    if message.sender_id == me.id {
        return None;
    }
    let from_customer = message.sender_id == message.customer_id;
    if me.role.is_staff() {
        if !from_customer {
            return None;
        }
        let room = directory.room(&message.room_id).await;
        if room
            .and_then(|room| room.agent_id)
            .is_some_and(|agent| agent != me.id)
        {
            return None;
        }
    } else if message.customer_id != me.id {
        return None;
    }

    let sender = directory
        .display_name(&message.sender_id)
        .await
        .unwrap_or_else(|| {
            let fallback = if from_customer { UNKNOWN_CUSTOMER } else { UNKNOWN_AGENT };
            fallback.to_string()
        });
    Some(Notification::new(
        NotificationKind::ChatMessage,
        &me.id,
        message.room_id.as_str(),
        "New message",
        format!("{sender}: {}", preview(&message.body, MESSAGE_PREVIEW_LENGTH)),
    ))
}

async fn room_updated(
    change: &ChangeEvent,
    me: &UserProfile,
    directory: &dyn Directory,
) -> Option<Notification> {
    let room: ChatRoom = change.after()?;
    if room.customer_id != me.id || room.status != RoomStatus::Active {
        return None;
    }
    let agent = room.agent_id.clone()?;
    let before = match change.before::<ChatRoom>() {
        Some(before) => Some(before),
        None => directory.previous_room(&room.id).await,
    };
    if before.and_then(|b| b.agent_id).as_ref() == Some(&agent) {
        return None;
    }
    let name = directory
        .display_name(&agent)
        .await
        .unwrap_or_else(|| UNKNOWN_AGENT.to_string());
    Some(Notification::new(
        NotificationKind::AgentConnected,
        &me.id,
        room.id.as_str(),
        "Support agent connected",
        format!("{name} has joined your chat."),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::MessageId;
    use crate::model::Priority;
    use proptest::prelude::*;
    use std::collections::HashMap;

    #[derive(Default)]
    struct StubDirectory {
        names: HashMap<UserId, String>,
        rooms: HashMap<RoomId, ChatRoom>,
        tickets: HashMap<TicketId, Ticket>,
    }

    #[async_trait]
    impl Directory for StubDirectory {
        async fn display_name(&self, user: &UserId) -> Option<String> {
            self.names.get(user).cloned()
        }
        async fn room(&self, room: &RoomId) -> Option<ChatRoom> {
            self.rooms.get(room).cloned()
        }
        async fn previous_room(&self, room: &RoomId) -> Option<ChatRoom> {
            self.rooms.get(room).cloned()
        }
        async fn previous_ticket(&self, ticket: &TicketId) -> Option<Ticket> {
            self.tickets.get(ticket).cloned()
        }
    }

    fn user(id: &str, name: &str, role: Role) -> UserProfile {
        UserProfile {
            id: UserId::new(id),
            email: format!("{id}@example.com"),
            name: name.into(),
            role,
            is_available: true,
            created_at: UnixTimeMs(0),
        }
    }

    fn ticket(status: TicketStatus, assigned: Option<&str>) -> Ticket {
        Ticket {
            id: TicketId::new("t-1"),
            title: "Cannot log in".into(),
            description: "Password reset loops".into(),
            status,
            priority: Priority::High,
            category: "Technical".into(),
            customer_id: UserId::new("cust"),
            customer_name: None,
            assigned_to: assigned.map(UserId::new),
            assignee_name: None,
            created_at: UnixTimeMs(1),
            updated_at: UnixTimeMs(1),
        }
    }

    fn room(agent: Option<&str>, status: RoomStatus) -> ChatRoom {
        ChatRoom {
            id: RoomId::new("r-1"),
            customer_id: UserId::new("cust"),
            agent_id: agent.map(UserId::new),
            status,
            created_at: UnixTimeMs(1),
            updated_at: UnixTimeMs(1),
        }
    }

    fn message(sender: &str) -> ChatMessage {
        ChatMessage {
            id: MessageId::new("m-1"),
            room_id: RoomId::new("r-1"),
            customer_id: UserId::new("cust"),
            sender_id: UserId::new(sender),
            body: "Hello there".into(),
            created_at: UnixTimeMs(5),
        }
    }

    fn run<F: std::future::Future>(f: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(f)
    }

    #[test]
    fn new_ticket_goes_to_staff_with_looked_up_name() {
        let mut dir = StubDirectory::default();
        dir.names.insert(UserId::new("cust"), "Ana".into());
        let change = ChangeEvent::insert(Table::Tickets, &ticket(TicketStatus::Unassigned, None));

        let agent = user("agent", "Bo", Role::Agent);
        let n = run(dispatch(&change, &agent, &dir)).unwrap();
        assert_eq!(n.kind, NotificationKind::NewTicket);
        assert_eq!(n.title, "New ticket");
        assert_eq!(n.body, "Ana · High priority · Cannot log in");

        let customer = user("cust", "Ana", Role::Customer);
        assert!(run(dispatch(&change, &customer, &dir)).is_none());
    }

    #[test]
    fn new_ticket_falls_back_to_unknown_customer() {
        let change = ChangeEvent::insert(Table::Tickets, &ticket(TicketStatus::Unassigned, None));
        let admin = user("admin", "Root", Role::Admin);
        let n = run(dispatch(&change, &admin, &StubDirectory::default())).unwrap();
        assert!(n.body.starts_with("Unknown Customer · "));
    }

    #[test]
    fn assignment_notifies_only_the_assignee() {
        let before = ticket(TicketStatus::Unassigned, None);
        let after = ticket(TicketStatus::Assigned, Some("agent"));
        let change = ChangeEvent::update(Table::Tickets, &before, &after);
        let dir = StubDirectory::default();

        let n = run(dispatch(&change, &user("agent", "Bo", Role::Agent), &dir)).unwrap();
        assert_eq!(n.title, "Ticket Assigned");
        assert!(run(dispatch(&change, &user("other", "Cy", Role::Agent), &dir)).is_none());
    }

    #[test]
    fn customer_gets_status_specific_text() {
        let customer = user("cust", "Ana", Role::Customer);
        let dir = StubDirectory::default();
        let steps = [
            (TicketStatus::Unassigned, TicketStatus::Assigned, "assigned to a support agent"),
            (TicketStatus::Assigned, TicketStatus::InProgress, "being worked on"),
            (TicketStatus::InProgress, TicketStatus::Resolved, "has been resolved"),
            (TicketStatus::Resolved, TicketStatus::Closed, "has been closed"),
        ];
        for (from, to, text) in steps {
            let change = ChangeEvent::update(Table::Tickets, &ticket(from, None), &ticket(to, None));
            let n = run(dispatch(&change, &customer, &dir)).unwrap();
            assert_eq!(n.kind, NotificationKind::TicketStatusChanged);
            assert!(n.body.contains(text), "{} missing {text}", n.body);
        }

        let reopened = ChangeEvent::update(
            Table::Tickets,
            &ticket(TicketStatus::Closed, None),
            &ticket(TicketStatus::Unassigned, None),
        );
        assert!(run(dispatch(&reopened, &customer, &dir)).is_none());
    }

    #[test]
    fn no_op_update_is_silent() {
        let mut before = ticket(TicketStatus::InProgress, None);
        before.title = "old title".into();
        let after = ticket(TicketStatus::InProgress, None);
        let change = ChangeEvent::update(Table::Tickets, &before, &after);
        let customer = user("cust", "Ana", Role::Customer);
        assert!(run(dispatch(&change, &customer, &StubDirectory::default())).is_none());
    }

    #[test]
    fn missing_before_uses_last_known_ticket() {
        let mut dir = StubDirectory::default();
        dir.tickets
            .insert(TicketId::new("t-1"), ticket(TicketStatus::Assigned, None));
        let mut change = ChangeEvent::insert(Table::Tickets, &ticket(TicketStatus::Assigned, None));
        change.op = ChangeOp::Update;
        let customer = user("cust", "Ana", Role::Customer);
        assert!(run(dispatch(&change, &customer, &dir)).is_none());

        dir.tickets
            .insert(TicketId::new("t-1"), ticket(TicketStatus::Unassigned, None));
        assert!(run(dispatch(&change, &customer, &dir)).is_some());
    }

    #[test]
    fn customer_only_hears_about_own_rooms() {
        let change = ChangeEvent::insert(Table::ChatMessages, &message("agent"));
        let owner = user("cust", "Ana", Role::Customer);
        let stranger = user("cust-2", "Dee", Role::Customer);

        // The message names its room's owner, so no room lookup is needed.
        let dir = StubDirectory::default();
        let n = run(dispatch(&change, &owner, &dir)).unwrap();
        assert_eq!(n.body, "Support Agent: Hello there");
        assert!(run(dispatch(&change, &stranger, &dir)).is_none());
    }

    #[test]
    fn staff_hear_customer_messages_in_their_rooms() {
        let change = ChangeEvent::insert(Table::ChatMessages, &message("cust"));
        let mut dir = StubDirectory::default();
        dir.names.insert(UserId::new("cust"), "Ana".into());
        dir.rooms.insert(RoomId::new("r-1"), room(Some("agent"), RoomStatus::Active));

        let n = run(dispatch(&change, &user("agent", "Bo", Role::Agent), &dir)).unwrap();
        assert_eq!(n.body, "Ana: Hello there");
        assert!(run(dispatch(&change, &user("agent-2", "Cy", Role::Agent), &dir)).is_none());

        let from_colleague = ChangeEvent::insert(Table::ChatMessages, &message("agent-2"));
        assert!(run(dispatch(&from_colleague, &user("agent", "Bo", Role::Agent), &dir)).is_none());

        // Unknown room: every agent hears it.
        let unknown = StubDirectory::default();
        assert!(run(dispatch(&change, &user("agent-2", "Cy", Role::Agent), &unknown)).is_some());
    }

    #[test]
    fn agent_joining_notifies_customer() {
        let before = room(None, RoomStatus::Waiting);
        let after = room(Some("agent"), RoomStatus::Active);
        let change = ChangeEvent::update(Table::ChatRooms, &before, &after);
        let customer = user("cust", "Ana", Role::Customer);

        let n = run(dispatch(&change, &customer, &StubDirectory::default())).unwrap();
        assert_eq!(n.title, "Support agent connected");
        assert_eq!(n.body, "Support Agent has joined your chat.");

        let same_agent = ChangeEvent::update(Table::ChatRooms, &after, &after);
        assert!(run(dispatch(&same_agent, &customer, &StubDirectory::default())).is_none());
    }

    proptest! {
        #[test]
        fn own_messages_never_notify(
            sender in "[a-z]{1,8}",
            role in prop_oneof![Just(Role::Admin), Just(Role::Agent), Just(Role::Customer)],
            body in ".{0,200}",
        ) {
            let me = user(&sender, "Me", role);
            let mut msg = message(&sender);
            msg.body = body;
            msg.customer_id = UserId::new(&sender);
            let change = ChangeEvent::insert(Table::ChatMessages, &msg);
            let mut dir = StubDirectory::default();
            dir.rooms.insert(RoomId::new("r-1"), ChatRoom { customer_id: UserId::new(&sender), ..room(None, RoomStatus::Waiting) });
            prop_assert!(run(dispatch(&change, &me, &dir)).is_none());
        }
    }
}
