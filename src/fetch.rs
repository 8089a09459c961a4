//! Role-scoped entity reads and the write commands built on them.
//!
//! Customers only ever read tickets and rooms where `customer_id` is their
//! own id; staff read everything. Every command validates its input before
//! the first backend call.

use std::sync::Arc;

use secrecy::ExposeSecret;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};

use crate::backend::{
    decode_rows, AssignedAgent, AutoAssignResponse, Backend, BackendError, DeleteUsersRequest,
    DeleteUsersResponse, Filter, ProvisionResponse, Row, AUTO_ASSIGN, CREATE_USER, DELETE_USERS,
    PROVISION_INITIAL_USERS,
};
use crate::event::{
    validate_email, validate_message_body, ActivityId, MessageId, RoomId, SignUpForm,
    TicketDraft, TicketId, UserId,
};
use crate::model::{
    Activity, ChatMessage, ChatRoom, Role, RoomStatus, Table, Ticket, TicketStatus,
    TransitionPolicy, UnixTimeMs, UserProfile,
};
use crate::{AppError, AppResult, ErrorKind, RowError};

fn decode_row<T: DeserializeOwned>(table: Table, row: Row) -> AppResult<T> {
    serde_json::from_value(row).map_err(|e| {
        RowError::Decode {
            table: table.as_str(),
            reason: e.to_string(),
        }
        .into()
    })
}

fn encode<T: Serialize>(value: &T) -> AppResult<Row> {
    serde_json::to_value(value).map_err(|e| RowError::Encode(e.to_string()).into())
}

/// Each customer's room lives under one key, so concurrent creators collide
/// on insert instead of producing siblings.
#[must_use]
pub fn customer_room_id(customer: &UserId) -> RoomId {
    RoomId::new(format!("room-{customer}"))
}

#[must_use]
pub fn deleted_users_message(count: usize) -> String {
    if count == 1 {
        "1 user deleted successfully".to_string()
    } else {
        format!("{count} users deleted successfully")
    }
}

pub struct EntityFetcher<B: ?Sized> {
    backend: Arc<B>,
    me: UserProfile,
    policy: TransitionPolicy,
}

impl<B: Backend + ?Sized> EntityFetcher<B> {
    pub fn new(backend: Arc<B>, me: UserProfile) -> Self {
        Self {
            backend,
            me,
            policy: TransitionPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_policy(mut self, policy: TransitionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn me(&self) -> &UserProfile {
        &self.me
    }

    fn scope(&self) -> Filter {
        match self.me.role {
            Role::Customer => Filter::new().column_eq("customer_id", self.me.id.as_str()),
            Role::Admin | Role::Agent => Filter::new(),
        }
    }

    fn require_staff(&self, action: &str) -> AppResult<()> {
        if self.me.role.is_staff() {
            return Ok(());
        }
        Err(AppError::new(
            ErrorKind::Authorization,
            format!("Only support staff can {action}"),
        ))
    }

    fn require_admin(&self, action: &str) -> AppResult<()> {
        if self.me.role == Role::Admin {
            return Ok(());
        }
        Err(AppError::new(
            ErrorKind::Authorization,
            format!("Only administrators can {action}"),
        ))
    }

    async fn select<T: DeserializeOwned>(&self, table: Table, filter: &Filter) -> AppResult<Vec<T>> {
        let rows = self.backend.select(table, filter).await?;
        Ok(decode_rows(table, rows))
    }

    async fn insert<T: Serialize + DeserializeOwned>(&self, table: Table, value: &T) -> AppResult<T> {
        let row = self.backend.insert(table, encode(value)?).await?;
        decode_row(table, row)
    }

    async fn update<T: DeserializeOwned>(&self, table: Table, id: &str, patch: Value) -> AppResult<T> {
        let row = self.backend.update(table, id, patch).await?;
        decode_row(table, row)
    }

    // --- Reads ---

    #[instrument(skip(self), fields(user = %self.me.id))]
    pub async fn tickets(&self) -> AppResult<Vec<Ticket>> {
        self.select(Table::Tickets, &self.scope()).await
    }

    #[instrument(skip(self), fields(user = %self.me.id))]
    pub async fn chat_rooms(&self) -> AppResult<Vec<ChatRoom>> {
        self.select(Table::ChatRooms, &self.scope()).await
    }

    /// Messages of every room this user can see.
    #[instrument(skip(self), fields(user = %self.me.id))]
    pub async fn messages(&self) -> AppResult<Vec<ChatMessage>> {
        self.select(Table::ChatMessages, &self.scope()).await
    }

    pub async fn room_messages(&self, room: &RoomId) -> AppResult<Vec<ChatMessage>> {
        let room = self.room(room).await?;
        self.select(
            Table::ChatMessages,
            &Filter::new().column_eq("room_id", room.id.as_str()),
        )
        .await
    }

    /// The activity log is staff-only; customers get an empty list.
    #[instrument(skip(self), fields(user = %self.me.id))]
    pub async fn activities(&self) -> AppResult<Vec<Activity>> {
        if !self.me.role.is_staff() {
            return Ok(Vec::new());
        }
        self.select(Table::Activities, &Filter::new()).await
    }

    pub async fn profiles(&self) -> AppResult<Vec<UserProfile>> {
        self.select(Table::Profiles, &Filter::new()).await
    }

    pub async fn profile(&self, id: &UserId) -> AppResult<Option<UserProfile>> {
        let found: Vec<UserProfile> = self
            .select(Table::Profiles, &Filter::new().column_eq("id", id.as_str()))
            .await?;
        Ok(found.into_iter().next())
    }

    pub async fn profile_by_email(&self, email: &str) -> AppResult<Option<UserProfile>> {
        let email = email.trim().to_lowercase();
        let found: Vec<UserProfile> = self
            .select(Table::Profiles, &Filter::new().column_eq("email", email))
            .await?;
        Ok(found.into_iter().next())
    }

    pub async fn ticket(&self, id: &TicketId) -> AppResult<Ticket> {
        let found: Vec<Ticket> = self
            .select(Table::Tickets, &Filter::new().column_eq("id", id.as_str()))
            .await?;
        let ticket = found
            .into_iter()
            .next()
            .ok_or_else(|| AppError::not_found("Ticket not found"))?;
        if self.me.role == Role::Customer && ticket.customer_id != self.me.id {
            return Err(AppError::not_found("Ticket not found"));
        }
        Ok(ticket)
    }

    pub async fn room(&self, id: &RoomId) -> AppResult<ChatRoom> {
        let found: Vec<ChatRoom> = self
            .select(Table::ChatRooms, &Filter::new().column_eq("id", id.as_str()))
            .await?;
        let room = found
            .into_iter()
            .next()
            .ok_or_else(|| AppError::not_found("Chat room not found"))?;
        if self.me.role == Role::Customer && room.customer_id != self.me.id {
            return Err(AppError::not_found("Chat room not found"));
        }
        Ok(room)
    }

    // --- Chat ---

    /// Returns the customer's open room, creating it when there is none.
    /// Safe to call concurrently from several clients.
    #[instrument(skip(self), fields(user = %self.me.id))]
    pub async fn ensure_chat_room(&self) -> AppResult<ChatRoom> {
        if self.me.role != Role::Customer {
            return Err(AppError::new(
                ErrorKind::Validation,
                "Only customers have a support chat room",
            ));
        }

        let open: Vec<ChatRoom> = self
            .chat_rooms()
            .await?
            .into_iter()
            .filter(|room| room.status != RoomStatus::Closed)
            .collect();
        if let Some((oldest, extra)) = open.split_first() {
            for duplicate in extra {
                warn!(room = %duplicate.id, keep = %oldest.id, "closing duplicate chat room");
                self.backend
                    .update(
                        Table::ChatRooms,
                        duplicate.id.as_str(),
                        json!({ "status": RoomStatus::Closed }),
                    )
                    .await?;
            }
            return Ok(oldest.clone());
        }

        let now = UnixTimeMs::now();
        let room = ChatRoom {
            id: customer_room_id(&self.me.id),
            customer_id: self.me.id.clone(),
            agent_id: None,
            status: RoomStatus::Waiting,
            created_at: now,
            updated_at: now,
        };
        match self.insert(Table::ChatRooms, &room).await {
            Ok(created) => {
                info!(room = %created.id, "chat room created");
                Ok(created)
            }
            Err(e) if e.kind == ErrorKind::Conflict => {
                let existing = self.room(&room.id).await?;
                if existing.status != RoomStatus::Closed {
                    debug!(room = %existing.id, "chat room created concurrently");
                    return Ok(existing);
                }
                info!(room = %existing.id, "reopening chat room");
                self.update(
                    Table::ChatRooms,
                    existing.id.as_str(),
                    json!({ "status": RoomStatus::Waiting, "agent_id": Value::Null }),
                )
                .await
            }
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self, body), fields(user = %self.me.id))]
    pub async fn send_message(&self, room: &RoomId, body: &str) -> AppResult<ChatMessage> {
        validate_message_body(body)?;
        let target = self.room(room).await?;
        if target.status == RoomStatus::Closed {
            return Err(AppError::invalid_state("This chat has been closed"));
        }
        let message = ChatMessage {
            id: MessageId::generate(),
            room_id: target.id,
            customer_id: target.customer_id,
            sender_id: self.me.id.clone(),
            body: body.trim().to_string(),
            created_at: UnixTimeMs::now(),
        };
        self.insert(Table::ChatMessages, &message).await
    }

    /// Claims a room for the calling agent.
    #[instrument(skip(self), fields(user = %self.me.id))]
    pub async fn join_room(&self, room: &RoomId) -> AppResult<ChatRoom> {
        self.require_staff("join chats")?;
        let target = self.room(room).await?;
        if let Some(agent) = &target.agent_id {
            if agent != &self.me.id && target.status == RoomStatus::Active {
                return Err(AppError::new(
                    ErrorKind::Conflict,
                    "This chat has already been taken by another agent",
                ));
            }
        }
        self.update(
            Table::ChatRooms,
            room.as_str(),
            json!({ "agent_id": self.me.id, "status": RoomStatus::Active }),
        )
        .await
    }

    #[instrument(skip(self), fields(user = %self.me.id))]
    pub async fn close_room(&self, room: &RoomId) -> AppResult<ChatRoom> {
        let target = self.room(room).await?;
        self.update(
            Table::ChatRooms,
            target.id.as_str(),
            json!({ "status": RoomStatus::Closed }),
        )
        .await
    }

    // --- Tickets ---

    #[instrument(skip(self, draft), fields(user = %self.me.id))]
    pub async fn create_ticket(&self, draft: &TicketDraft) -> AppResult<Ticket> {
        draft.validate()?;
        if self.me.role != Role::Customer {
            return Err(AppError::new(
                ErrorKind::Validation,
                "Staff must pick a customer for new tickets",
            ));
        }
        let me = self.me.clone();
        self.open_ticket(&me, draft).await
    }

    /// Staff-created ticket on behalf of a customer.
    #[instrument(skip(self, draft), fields(user = %self.me.id))]
    pub async fn create_ticket_for(&self, customer_email: &str, draft: &TicketDraft) -> AppResult<Ticket> {
        draft.validate()?;
        validate_email(customer_email)?;
        self.require_staff("create tickets for customers")?;
        let customer = self
            .profile_by_email(customer_email)
            .await?
            .filter(|p| p.role == Role::Customer)
            .ok_or_else(|| AppError::not_found("Customer not found"))?;
        self.open_ticket(&customer, draft).await
    }

    async fn open_ticket(&self, customer: &UserProfile, draft: &TicketDraft) -> AppResult<Ticket> {
        let agent = self.pick_agent().await?;
        let now = UnixTimeMs::now();
        let ticket = Ticket {
            id: TicketId::generate(),
            title: draft.title.trim().to_string(),
            description: draft.description.trim().to_string(),
            status: if agent.is_some() {
                TicketStatus::Assigned
            } else {
                TicketStatus::Unassigned
            },
            priority: draft.priority,
            category: draft.category.trim().to_string(),
            customer_id: customer.id.clone(),
            customer_name: Some(customer.name.clone()),
            assigned_to: agent.as_ref().map(|a| a.id.clone()),
            assignee_name: agent.map(|a| a.name),
            created_at: now,
            updated_at: now,
        };
        let ticket: Ticket = self.insert(Table::Tickets, &ticket).await?;
        info!(ticket = %ticket.id, status = ticket.status.as_str(), "ticket created");

        let message = format!(
            "created {} ticket #{}: {}",
            ticket.category, ticket.id, ticket.title
        );
        if let Err(e) = self.log_activity(message).await {
            warn!(ticket = %ticket.id, error = %e, "activity not recorded");
        }
        Ok(ticket)
    }

    /// Least-loaded available agent, chosen server-side so customers never
    /// read other people's tickets.
    async fn pick_agent(&self) -> AppResult<Option<AssignedAgent>> {
        let response = self.backend.invoke(AUTO_ASSIGN, json!({})).await?;
        let response: AutoAssignResponse = decode_row(Table::Profiles, response)?;
        Ok(response.agent)
    }

    #[instrument(skip(self), fields(user = %self.me.id))]
    pub async fn update_ticket_status(&self, id: &TicketId, status: TicketStatus) -> AppResult<Ticket> {
        self.require_staff("change ticket status")?;
        let current = self.ticket(id).await?;
        current.status.validate_transition(status, self.policy)?;
        self.update(Table::Tickets, id.as_str(), json!({ "status": status }))
            .await
    }

    #[instrument(skip(self), fields(user = %self.me.id))]
    pub async fn assign_ticket(&self, id: &TicketId, assignee: &UserId) -> AppResult<Ticket> {
        self.require_staff("assign tickets")?;
        let agent = self
            .profile(assignee)
            .await?
            .filter(|p| p.role.is_staff())
            .ok_or_else(|| AppError::new(ErrorKind::Validation, "Tickets can only be assigned to support staff"))?;
        let current = self.ticket(id).await?;
        let status = if current.status == TicketStatus::Unassigned {
            current.status.validate_transition(TicketStatus::Assigned, self.policy)?;
            TicketStatus::Assigned
        } else {
            current.status
        };
        self.update(
            Table::Tickets,
            id.as_str(),
            json!({
                "assigned_to": agent.id,
                "assignee_name": agent.name,
                "status": status,
            }),
        )
        .await
    }

    // --- Profiles and activity ---

    pub async fn set_availability(&self, available: bool) -> AppResult<UserProfile> {
        self.require_staff("change availability")?;
        self.update(
            Table::Profiles,
            self.me.id.as_str(),
            json!({ "is_available": available }),
        )
        .await
    }

    pub async fn log_activity(&self, message: String) -> AppResult<Activity> {
        let activity = Activity {
            id: ActivityId::generate(),
            message,
            user_id: Some(self.me.id.clone()),
            created_at: UnixTimeMs::now(),
        };
        self.insert(Table::Activities, &activity).await
    }

    // --- Privileged user management ---

    #[instrument(skip(self, form), fields(user = %self.me.id))]
    pub async fn create_user(&self, form: &SignUpForm) -> AppResult<UserProfile> {
        let role = form.validate()?;
        self.require_admin("create users")?;
        let payload = json!({
            "email": form.email.trim(),
            "password": form.password.expose_secret(),
            "name": form.name.trim(),
            "role": role,
        });
        let created = self.backend.invoke(CREATE_USER, payload).await?;
        decode_row(Table::Profiles, created)
    }

    /// All-or-nothing: a rejected batch deletes nobody.
    #[instrument(skip(self, ids), fields(user = %self.me.id, count = ids.len()))]
    pub async fn delete_users(&self, ids: &[UserId]) -> AppResult<String> {
        if ids.is_empty() {
            return Err(AppError::new(ErrorKind::Validation, "Select at least one user"));
        }
        self.require_admin("delete users")?;
        let request = DeleteUsersRequest {
            user_ids: ids.to_vec(),
        };
        let response = match self.backend.invoke(DELETE_USERS, encode(&request)?).await {
            Ok(response) => response,
            Err(BackendError::NotFound { id, .. }) => {
                return Err(AppError::not_found(
                    "Some selected users no longer exist; no users were deleted",
                )
                .with_detail(id));
            }
            Err(e) => return Err(e.into()),
        };
        let response: DeleteUsersResponse = decode_row(Table::Profiles, response)?;
        info!(deleted = response.deleted, "users deleted");
        Ok(deleted_users_message(response.deleted))
    }

    /// Seeds accounts; existing emails are left alone.
    pub async fn provision_initial_users(&self, users: &[SignUpForm]) -> AppResult<ProvisionResponse> {
        let mut entries = Vec::with_capacity(users.len());
        for form in users {
            let role = form.validate()?;
            entries.push(json!({
                "email": form.email.trim(),
                "password": form.password.expose_secret(),
                "name": form.name.trim(),
                "role": role,
            }));
        }
        let response = self
            .backend
            .invoke(PROVISION_INITIAL_USERS, json!({ "users": entries }))
            .await?;
        decode_row(Table::Profiles, response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::FlakyBackend;
    use crate::backend::{DocumentBackend, NewAccount, SqliteBackend};
    use crate::model::Priority;
    use proptest::prelude::*;
    use secrecy::SecretString;

    const PASSWORD: &str = "secret123";

    async fn account<B: Backend>(backend: &B, email: &str, name: &str, role: Role) -> UserProfile {
        let password = SecretString::new(PASSWORD.to_string());
        backend
            .sign_up(NewAccount {
                email,
                password: &password,
                name,
                role,
            })
            .await
            .unwrap()
    }

    async fn sign_in<B: Backend>(backend: &B, email: &str) -> UserProfile {
        backend
            .sign_in(email, &SecretString::new(PASSWORD.to_string()))
            .await
            .unwrap()
    }

    fn draft() -> TicketDraft {
        TicketDraft {
            title: "Cannot log in".into(),
            description: "Password reset loops".into(),
            priority: Priority::High,
            category: "Technical".into(),
        }
    }

    #[tokio::test]
    async fn customer_ticket_without_agents_stays_unassigned() {
        let backend = Arc::new(DocumentBackend::new());
        let me = account(&*backend, "ana@example.com", "Ana", Role::Customer).await;
        let fetcher = EntityFetcher::new(Arc::clone(&backend), me);

        let ticket = fetcher.create_ticket(&draft()).await.unwrap();
        assert_eq!(ticket.status, TicketStatus::Unassigned);
        assert_eq!(ticket.customer_name.as_deref(), Some("Ana"));

        let log: Vec<Activity> = fetcher
            .select(Table::Activities, &Filter::new())
            .await
            .unwrap();
        assert_eq!(
            log[0].message,
            format!("created Technical ticket #{}: Cannot log in", ticket.id)
        );
    }

    #[tokio::test]
    async fn auto_assign_prefers_least_loaded_available_agent() {
        let server = DocumentBackend::new();
        let busy = account(&server, "busy@example.com", "Busy", Role::Agent).await;
        let idle = account(&server, "idle@example.com", "Idle", Role::Agent).await;
        let away = account(&server, "away@example.com", "Away", Role::Agent).await;
        server
            .update(Table::Profiles, away.id.as_str(), json!({"is_available": false}))
            .await
            .unwrap();
        server
            .insert(
                Table::Tickets,
                json!({
                    "title": "old", "description": "d", "status": "in_progress",
                    "priority": "low", "category": "Billing", "customer_id": "x",
                    "assigned_to": busy.id, "created_at": 1, "updated_at": 1
                }),
            )
            .await
            .unwrap();

        let tab = Arc::new(server.client());
        let me = account(&*tab, "ana@example.com", "Ana", Role::Customer).await;
        let ticket = EntityFetcher::new(tab, me).create_ticket(&draft()).await.unwrap();
        assert_eq!(ticket.status, TicketStatus::Assigned);
        assert_eq!(ticket.assigned_to, Some(idle.id));
        assert_eq!(ticket.assignee_name.as_deref(), Some("Idle"));
    }

    #[tokio::test]
    async fn staff_ticket_for_unknown_customer_is_blocked() {
        let backend = Arc::new(DocumentBackend::new());
        let me = account(&*backend, "bo@example.com", "Bo", Role::Agent).await;
        let fetcher = EntityFetcher::new(Arc::clone(&backend), me);
        let err = fetcher
            .create_ticket_for("nobody@example.com", &draft())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
        assert_eq!(err.message, "Customer not found");
        assert!(fetcher.tickets().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn invalid_draft_never_reaches_backend() {
        let backend = Arc::new(FlakyBackend::new(DocumentBackend::new()));
        let me = account(&*backend, "ana@example.com", "Ana", Role::Customer).await;
        backend.set_fail_selects(true);
        let err = EntityFetcher::new(backend, me)
            .create_ticket(&TicketDraft::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
    }

    #[tokio::test]
    async fn customers_only_see_their_own_tickets() {
        let server = DocumentBackend::new();
        let ana_tab = Arc::new(server.client());
        let ana = account(&*ana_tab, "ana@example.com", "Ana", Role::Customer).await;
        let dee_tab = Arc::new(server.client());
        let dee = account(&*dee_tab, "dee@example.com", "Dee", Role::Customer).await;
        let ana_fetcher = EntityFetcher::new(ana_tab, ana);
        let dee_fetcher = EntityFetcher::new(dee_tab, dee);

        let ticket = ana_fetcher.create_ticket(&draft()).await.unwrap();
        assert_eq!(ana_fetcher.tickets().await.unwrap().len(), 1);
        assert!(dee_fetcher.tickets().await.unwrap().is_empty());
        assert_eq!(
            dee_fetcher.ticket(&ticket.id).await.unwrap_err().kind,
            ErrorKind::NotFound
        );
        assert!(dee_fetcher.activities().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn strict_policy_rejects_skipping_states() {
        let server = DocumentBackend::new();
        let customer_tab = Arc::new(server.client());
        let ana = account(&*customer_tab, "ana@example.com", "Ana", Role::Customer).await;
        let ticket = EntityFetcher::new(customer_tab, ana)
            .create_ticket(&draft())
            .await
            .unwrap();

        let bo_tab = Arc::new(server.client());
        let bo = account(&*bo_tab, "bo@example.com", "Bo", Role::Agent).await;
        let fetcher = EntityFetcher::new(Arc::clone(&bo_tab), bo.clone());
        let strict = EntityFetcher::new(bo_tab, bo).with_policy(TransitionPolicy::Strict);
        let err = strict
            .update_ticket_status(&ticket.id, TicketStatus::Resolved)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
        let closed = fetcher
            .update_ticket_status(&ticket.id, TicketStatus::Closed)
            .await
            .unwrap();
        assert_eq!(closed.status, TicketStatus::Closed);
    }

    #[tokio::test]
    async fn customers_cannot_change_ticket_status() {
        let backend = Arc::new(FlakyBackend::new(DocumentBackend::new()));
        let me = account(&*backend, "ana@example.com", "Ana", Role::Customer).await;
        let fetcher = EntityFetcher::new(Arc::clone(&backend), me);
        let ticket = fetcher.create_ticket(&draft()).await.unwrap();

        backend.set_fail_selects(true);
        let err = fetcher
            .update_ticket_status(&ticket.id, TicketStatus::Resolved)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Authorization);
        backend.set_fail_selects(false);
        assert_eq!(
            fetcher.ticket(&ticket.id).await.unwrap().status,
            TicketStatus::Unassigned
        );
    }

    #[tokio::test]
    async fn assignment_requires_staff_assignee() {
        let server = DocumentBackend::new();
        let customer_tab = Arc::new(server.client());
        let ana = account(&*customer_tab, "ana@example.com", "Ana", Role::Customer).await;
        let ticket = EntityFetcher::new(customer_tab, ana.clone())
            .create_ticket(&draft())
            .await
            .unwrap();

        let admin_tab = Arc::new(server.client());
        let admin = account(&*admin_tab, "root@example.com", "Root", Role::Admin).await;
        let fetcher = EntityFetcher::new(admin_tab, admin.clone());
        let err = fetcher.assign_ticket(&ticket.id, &ana.id).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);

        let assigned = fetcher.assign_ticket(&ticket.id, &admin.id).await.unwrap();
        assert_eq!(assigned.status, TicketStatus::Assigned);
        assert_eq!(assigned.assignee_name.as_deref(), Some("Root"));
    }

    #[tokio::test]
    async fn agents_cannot_take_claimed_rooms() {
        let server = DocumentBackend::new();
        let customer_tab = Arc::new(server.client());
        let ana = account(&*customer_tab, "ana@example.com", "Ana", Role::Customer).await;
        let room = EntityFetcher::new(customer_tab, ana).ensure_chat_room().await.unwrap();

        let bo_tab = Arc::new(server.client());
        let bo = account(&*bo_tab, "bo@example.com", "Bo", Role::Agent).await;
        let cy_tab = Arc::new(server.client());
        let cy = account(&*cy_tab, "cy@example.com", "Cy", Role::Agent).await;

        let joined = EntityFetcher::new(bo_tab, bo.clone()).join_room(&room.id).await.unwrap();
        assert_eq!(joined.status, RoomStatus::Active);
        assert_eq!(joined.agent_id, Some(bo.id));
        let err = EntityFetcher::new(cy_tab, cy).join_room(&room.id).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn bulk_delete_reports_count_or_fails_whole_batch() {
        let server = DocumentBackend::new();
        let admin_tab = Arc::new(server.client());
        let admin = account(&*admin_tab, "root@example.com", "Root", Role::Admin).await;
        let mut ids = Vec::new();
        for i in 0..3 {
            let tab = server.client();
            ids.push(account(&tab, &format!("u{i}@example.com"), "User", Role::Customer).await.id);
        }
        let fetcher = EntityFetcher::new(admin_tab, admin.clone());

        let mut with_ghost = ids.clone();
        with_ghost.push(UserId::new("ghost"));
        let err = fetcher.delete_users(&with_ghost).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
        assert_eq!(fetcher.profiles().await.unwrap().len(), 4);

        assert_eq!(
            fetcher.delete_users(&ids).await.unwrap(),
            "3 users deleted successfully"
        );
        assert_eq!(fetcher.profiles().await.unwrap().len(), 1);

        let self_delete = fetcher.delete_users(&[admin.id]).await.unwrap_err();
        assert_eq!(self_delete.kind, ErrorKind::Authorization);
    }

    #[tokio::test]
    async fn provisioning_is_idempotent() {
        let backend = Arc::new(SqliteBackend::open_in_memory().unwrap());
        let admin = account(&*backend, "root@example.com", "Root", Role::Admin).await;
        let fetcher = EntityFetcher::new(backend, admin);
        let seed = || {
            vec![
                SignUpForm::new("bo@example.com", PASSWORD, "Bo", Some(Role::Agent)),
                SignUpForm::new("ana@example.com", PASSWORD, "Ana", Some(Role::Customer)),
            ]
        };
        let first = fetcher.provision_initial_users(&seed()).await.unwrap();
        assert_eq!(first.created.len(), 2);
        let second = fetcher.provision_initial_users(&seed()).await.unwrap();
        assert!(second.created.is_empty());
        assert_eq!(second.existing.len(), 2);
        assert_eq!(fetcher.profiles().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn legacy_duplicate_rooms_are_reconciled() {
        let backend = Arc::new(DocumentBackend::new());
        let me = account(&*backend, "ana@example.com", "Ana", Role::Customer).await;
        for (id, at) in [("b", 2), ("a", 2), ("c", 1)] {
            backend
                .insert(
                    Table::ChatRooms,
                    json!({"id": id, "customer_id": me.id, "status": "waiting", "created_at": at, "updated_at": at}),
                )
                .await
                .unwrap();
        }
        let fetcher = EntityFetcher::new(backend, me);
        let room = fetcher.ensure_chat_room().await.unwrap();
        assert_eq!(room.id.as_str(), "c");
        let open: Vec<_> = fetcher
            .chat_rooms()
            .await
            .unwrap()
            .into_iter()
            .filter(|r| r.status != RoomStatus::Closed)
            .collect();
        assert_eq!(open.len(), 1);
    }

    /// Runs `ensure_chat_room` from every client at once.
    async fn provision_race<B: Backend>(clients: Vec<B>, me: UserProfile) -> (Vec<RoomId>, usize) {
        let mut tasks = tokio::task::JoinSet::new();
        let mut fetchers = Vec::new();
        for client in clients {
            let backend = Arc::new(FlakyBackend::new(client));
            fetchers.push(Arc::clone(&backend));
            let fetcher = EntityFetcher::new(backend, me.clone());
            tasks.spawn(async move { fetcher.ensure_chat_room().await });
        }
        let mut ids = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            ids.push(joined.unwrap().unwrap().id);
        }
        let rooms: Vec<ChatRoom> = EntityFetcher::new(Arc::clone(&fetchers[0]), me)
            .chat_rooms()
            .await
            .unwrap();
        let open = rooms.iter().filter(|r| r.status != RoomStatus::Closed).count();
        (ids, open)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn concurrent_provisioning_yields_one_room(
            tabs in 2usize..6,
            relational in any::<bool>(),
            previously_closed in any::<bool>(),
        ) {
            let rt = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .build()
                .unwrap();
            let (ids, open) = rt.block_on(async {
                if relational {
                    let server = SqliteBackend::open_in_memory().unwrap();
                    let me = account(&server, "ana@example.com", "Ana", Role::Customer).await;
                    if previously_closed {
                        let fetcher = EntityFetcher::new(Arc::new(server.client()), me.clone());
                        sign_in(&*fetcher.backend, "ana@example.com").await;
                        let room = fetcher.ensure_chat_room().await.unwrap();
                        fetcher.close_room(&room.id).await.unwrap();
                    }
                    let mut clients = Vec::new();
                    for _ in 0..tabs {
                        let client = server.client();
                        sign_in(&client, "ana@example.com").await;
                        clients.push(client);
                    }
                    provision_race(clients, me).await
                } else {
                    let server = DocumentBackend::new();
                    let me = account(&server, "ana@example.com", "Ana", Role::Customer).await;
                    if previously_closed {
                        let fetcher = EntityFetcher::new(Arc::new(server.client()), me.clone());
                        sign_in(&*fetcher.backend, "ana@example.com").await;
                        let room = fetcher.ensure_chat_room().await.unwrap();
                        fetcher.close_room(&room.id).await.unwrap();
                    }
                    let mut clients = Vec::new();
                    for _ in 0..tabs {
                        let client = server.client();
                        sign_in(&client, "ana@example.com").await;
                        clients.push(client);
                    }
                    provision_race(clients, me).await
                }
            });
            prop_assert_eq!(ids.len(), tabs);
            prop_assert!(ids.iter().all(|id| id == &ids[0]));
            prop_assert_eq!(open, 1);
        }
    }
}
