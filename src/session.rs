//! The session context: everything one signed-in user owns.
//!
//! A [`HelpdeskSession`] is the Rust shell around the Crux core. It holds the
//! backend client, the subscription guards, the change inbox, a display-name
//! cache and the fetch sequence counters. Nothing here is global; dropping
//! the session or calling [`HelpdeskSession::teardown`] releases it all.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use crux_core::Core;
use lru::LruCache;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::backend::{Backend, ChangeOp, Connect, FeedItem, Filter, NewAccount, ProvisionResponse};
use crate::capabilities::{
    Capabilities, DesktopNotification, NotifyError, NotifyOperation, PermissionState,
};
use crate::config::{BackendTarget, SessionConfig};
use crate::dispatch::{dispatch, Directory, Notification};
use crate::event::{RoomId, SignInForm, SignUpForm, TicketDraft, TicketId, UserId};
use crate::fetch::EntityFetcher;
use crate::model::{
    ChatMessage, ChatRoom, Role, Table, Ticket, TicketStatus, UnixTimeMs, UserProfile,
};
use crate::subscription::{SubscriptionGuard, SubscriptionKey, SubscriptionRegistry};
use crate::view::{TicketFilter, ViewModel};
use crate::{App, AppError, AppResult, Effect, ErrorKind, Event};

/// Platform side of desktop notifications.
pub trait NotificationShell: Send + Sync {
    fn desktop_permission(&self) -> PermissionState;

    fn show_desktop(&self, notification: &DesktopNotification) -> Result<(), NotifyError>;
}

/// Shell without a desktop: records what it was asked to show and can be
/// told to fail.
#[derive(Debug, Default)]
pub struct RecordingShell {
    permission: Mutex<PermissionState>,
    failure: Mutex<Option<NotifyError>>,
    shown: Mutex<Vec<DesktopNotification>>,
}

impl RecordingShell {
    #[must_use]
    pub fn new(permission: PermissionState) -> Self {
        Self {
            permission: Mutex::new(permission),
            ..Self::default()
        }
    }

    pub fn set_permission(&self, permission: PermissionState) {
        *self.permission.lock().unwrap_or_else(PoisonError::into_inner) = permission;
    }

    pub fn fail_with(&self, failure: Option<NotifyError>) {
        *self.failure.lock().unwrap_or_else(PoisonError::into_inner) = failure;
    }

    #[must_use]
    pub fn shown(&self) -> Vec<DesktopNotification> {
        self.shown.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl NotificationShell for RecordingShell {
    fn desktop_permission(&self) -> PermissionState {
        *self.permission.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn show_desktop(&self, notification: &DesktopNotification) -> Result<(), NotifyError> {
        if let Some(failure) = self.failure.lock().unwrap_or_else(PoisonError::into_inner).clone() {
            return Err(failure);
        }
        self.shown
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(notification.clone());
        Ok(())
    }
}

/// What handling one inbox item did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeOutcome {
    pub table: Table,
    /// `None` when the feed asked for a resync.
    pub op: Option<ChangeOp>,
    pub notification: Option<Notification>,
}

pub enum SignUpOutcome<B: Backend + ?Sized> {
    SignedIn(Box<HelpdeskSession<B>>),
    /// The account exists but the email address must be confirmed first.
    ConfirmationRequired { email: String },
}

type NameCache = Mutex<LruCache<UserId, String>>;

/// Lookups for the dispatcher, answered from the state the session held
/// before the change arrived. Rooms missing from that state are fetched and
/// kept in `fetched` for the session to absorb.
struct SessionDirectory<'a, B: ?Sized> {
    fetcher: &'a EntityFetcher<B>,
    names: &'a NameCache,
    tickets: &'a HashMap<TicketId, Ticket>,
    rooms: &'a HashMap<RoomId, ChatRoom>,
    fetched: Mutex<Vec<ChatRoom>>,
}

impl<B: ?Sized> SessionDirectory<'_, B> {
    fn into_fetched(self) -> Vec<ChatRoom> {
        self.fetched.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl<B: Backend + ?Sized> Directory for SessionDirectory<'_, B> {
    async fn display_name(&self, user: &UserId) -> Option<String> {
        let cached = self.names.lock().unwrap_or_else(PoisonError::into_inner).get(user).cloned();
        if cached.is_some() {
            return cached;
        }
        match self.fetcher.profile(user).await {
            Ok(Some(profile)) => {
                self.names
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .put(user.clone(), profile.name.clone());
                Some(profile.name)
            }
            Ok(None) => None,
            Err(e) => {
                debug!(%user, error = %e, "name lookup failed");
                None
            }
        }
    }

    async fn room(&self, room: &RoomId) -> Option<ChatRoom> {
        if let Some(known) = self.rooms.get(room) {
            return Some(known.clone());
        }
        match self.fetcher.room(room).await {
            Ok(found) => {
                self.fetched
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(found.clone());
                Some(found)
            }
            Err(e) => {
                debug!(%room, error = %e, "room lookup failed");
                None
            }
        }
    }

    async fn previous_room(&self, room: &RoomId) -> Option<ChatRoom> {
        self.rooms.get(room).cloned()
    }

    async fn previous_ticket(&self, ticket: &TicketId) -> Option<Ticket> {
        self.tickets.get(ticket).cloned()
    }
}

pub struct HelpdeskSession<B: Backend + ?Sized> {
    backend: Arc<B>,
    fetcher: EntityFetcher<B>,
    core: Core<Effect, App>,
    shell: Arc<dyn NotificationShell>,
    config: SessionConfig,

    registry: SubscriptionRegistry,
    guards: Vec<SubscriptionGuard>,
    inbox_tx: mpsc::UnboundedSender<(Table, FeedItem)>,
    inbox: mpsc::UnboundedReceiver<(Table, FeedItem)>,

    names: NameCache,
    known_tickets: HashMap<TicketId, Ticket>,
    known_rooms: HashMap<RoomId, ChatRoom>,
    seq: HashMap<Table, u64>,
    target: Option<BackendTarget>,
    ended: bool,
}

impl<B: Backend> HelpdeskSession<B> {
    /// Opens a client on `target` and signs in through it.
    #[instrument(skip_all)]
    pub async fn connect<C>(
        connector: &C,
        target: BackendTarget,
        form: &SignInForm,
        shell: Arc<dyn NotificationShell>,
        config: SessionConfig,
    ) -> AppResult<Self>
    where
        C: Connect<Client = B>,
    {
        form.validate()?;
        let backend = Arc::new(connector.connect(&target)?);
        info!(endpoint = target.endpoint(), secondary = target.is_override(), "backend client opened");
        let mut session = Self::sign_in(backend, form, shell, config).await?;
        session.target = Some(target);
        Ok(session)
    }
}

impl<B: Backend + ?Sized> HelpdeskSession<B> {
    #[instrument(skip_all)]
    pub async fn sign_in(
        backend: Arc<B>,
        form: &SignInForm,
        shell: Arc<dyn NotificationShell>,
        config: SessionConfig,
    ) -> AppResult<Self> {
        form.validate()?;
        config.validate()?;
        let user = backend.sign_in(form.email.trim(), &form.password).await?;
        info!(user = %user.id, role = user.role.as_str(), "signed in");
        Ok(Self::open(backend, user, shell, config))
    }

    #[instrument(skip_all)]
    pub async fn sign_up(
        backend: Arc<B>,
        form: &SignUpForm,
        shell: Arc<dyn NotificationShell>,
        config: SessionConfig,
    ) -> AppResult<SignUpOutcome<B>> {
        let role = form.validate()?;
        config.validate()?;
        let user = backend
            .sign_up(NewAccount {
                email: form.email.trim(),
                password: &form.password,
                name: form.name.trim(),
                role,
            })
            .await?;

        if backend.current_user().is_some_and(|current| current.id == user.id) {
            info!(user = %user.id, role = role.as_str(), "signed up");
            return Ok(SignUpOutcome::SignedIn(Box::new(Self::open(backend, user, shell, config))));
        }
        info!(user = %user.id, "sign-up awaiting email confirmation");
        Ok(SignUpOutcome::ConfirmationRequired { email: user.email })
    }

    /// Wraps a client that already holds an auth session.
    pub fn resume(backend: Arc<B>, shell: Arc<dyn NotificationShell>, config: SessionConfig) -> AppResult<Self> {
        config.validate()?;
        let user = backend
            .current_user()
            .ok_or_else(|| AppError::new(ErrorKind::Authentication, "Please sign in again"))?;
        Ok(Self::open(backend, user, shell, config))
    }

    fn open(backend: Arc<B>, user: UserProfile, shell: Arc<dyn NotificationShell>, config: SessionConfig) -> Self {
        let (inbox_tx, inbox) = mpsc::unbounded_channel();
        let cache_size = NonZeroUsize::new(config.name_cache_size).unwrap_or(NonZeroUsize::MIN);
        let fetcher = EntityFetcher::new(Arc::clone(&backend), user).with_policy(config.transition_policy);
        Self {
            backend,
            fetcher,
            core: Core::new::<Capabilities>(),
            shell,
            config,
            registry: SubscriptionRegistry::new(),
            guards: Vec::new(),
            inbox_tx,
            inbox,
            names: Mutex::new(LruCache::new(cache_size)),
            known_tickets: HashMap::new(),
            known_rooms: HashMap::new(),
            seq: HashMap::new(),
            target: None,
            ended: false,
        }
    }

    #[must_use]
    pub fn user(&self) -> &UserProfile {
        self.fetcher.me()
    }

    /// Set when the session was opened through [`HelpdeskSession::connect`].
    #[must_use]
    pub fn backend_target(&self) -> Option<&BackendTarget> {
        self.target.as_ref()
    }

    #[must_use]
    pub fn fetcher(&self) -> &EntityFetcher<B> {
        &self.fetcher
    }

    #[must_use]
    pub fn view(&self) -> ViewModel {
        self.core.view()
    }

    #[must_use]
    pub fn is_ended(&self) -> bool {
        self.ended
    }

    #[must_use]
    pub fn active_subscriptions(&self) -> Vec<SubscriptionKey> {
        self.registry.active()
    }

    fn ensure_live(&self) -> AppResult<()> {
        if self.ended {
            return Err(AppError::invalid_state("Session has ended"));
        }
        Ok(())
    }

    /// Feeds one event to the core and executes the effects it asks for.
    fn apply(&mut self, event: Event) {
        let raised = match &event {
            Event::NotificationRaised(notification) => Some(notification.clone()),
            _ => None,
        };

        for effect in self.core.process_event(event) {
            match effect {
                Effect::Render(_) => {}
                Effect::Notify(request) => {
                    let NotifyOperation::Show(desktop) = &request.operation;
                    let Err(error) = self.shell.show_desktop(desktop) else {
                        continue;
                    };
                    warn!(%error, "desktop notification failed");
                    if error == NotifyError::PermissionDenied {
                        self.apply(Event::DesktopPermissionChanged(PermissionState::Denied));
                    }
                    if let Some(notification) = raised.clone() {
                        self.apply(Event::DesktopNotificationFailed {
                            notification,
                            reason: error.to_string(),
                        });
                    }
                }
            }
        }
    }

    /// Publishes the session to the core, opens the change feeds and loads
    /// every collection. Calling it again re-subscribes without duplicates.
    #[instrument(skip(self), fields(user = %self.fetcher.me().id))]
    pub async fn start(&mut self) -> AppResult<()> {
        self.ensure_live()?;
        self.apply(Event::SessionStarted {
            user: self.fetcher.me().clone(),
            desktop_permission: self.shell.desktop_permission(),
            limits: self.config.limits,
        });
        self.subscribe_all()?;
        self.refresh_all().await;
        info!(subscriptions = self.guards.len(), "session started");
        Ok(())
    }

    fn subscribe_all(&mut self) -> AppResult<()> {
        self.guards.clear();

        let me = self.fetcher.me();
        let (scope, names) = if me.role.is_staff() {
            (None, None)
        } else {
            (
                Some(Filter::new().column_eq("customer_id", me.id.as_str())),
                Some(Filter::new().column_eq("role", Role::Agent.as_str())),
            )
        };
        let mut plan = vec![
            (Table::Tickets, "tickets", scope.clone()),
            (Table::ChatRooms, "rooms", scope.clone()),
            (Table::ChatMessages, "messages", scope),
            (Table::Profiles, "names", names),
        ];
        if me.role.is_staff() {
            plan.push((Table::Activities, "activity", None));
        }

        for (table, purpose, filter) in plan {
            let key = SubscriptionKey::new(me.id.clone(), table, purpose);
            let inbox = self.inbox_tx.clone();
            let guard = self.registry.acquire(self.backend.as_ref(), key, filter, move |item| {
                // The receiver only closes when the session is gone.
                let _ = inbox.send((table, item));
            })?;
            self.guards.push(guard);
        }
        Ok(())
    }

    fn next_seq(&mut self, table: Table) -> u64 {
        let seq = self.seq.entry(table).or_insert(0);
        *seq += 1;
        *seq
    }

    /// Authoritative refetch of one collection. A failure keeps what the
    /// core already shows and sets its error indicator.
    #[instrument(skip(self), fields(user = %self.fetcher.me().id))]
    pub async fn refresh(&mut self, table: Table) {
        if self.ended || table == Table::Profiles {
            return;
        }
        let seq = self.next_seq(table);
        self.apply(Event::FetchStarted { table, seq });

        let completed = match table {
            Table::Tickets => self.fetcher.tickets().await.map(|tickets| {
                self.known_tickets = tickets.iter().map(|t| (t.id.clone(), t.clone())).collect();
                Event::TicketsFetched { seq, tickets }
            }),
            Table::ChatRooms => self.fetcher.chat_rooms().await.map(|rooms| {
                self.known_rooms = rooms.iter().map(|r| (r.id.clone(), r.clone())).collect();
                Event::RoomsFetched { seq, rooms }
            }),
            Table::ChatMessages => self
                .fetcher
                .messages()
                .await
                .map(|messages| Event::MessagesFetched { seq, messages }),
            Table::Activities => self
                .fetcher
                .activities()
                .await
                .map(|activities| Event::ActivitiesFetched { seq, activities }),
            Table::Profiles => return,
        };

        // Teardown may have happened while the fetch was in flight.
        if self.ended {
            debug!(%table, seq, "fetch finished after teardown");
            return;
        }
        let event = completed.unwrap_or_else(|error| Event::FetchFailed { table, seq, error });
        self.apply(event);
    }

    pub async fn refresh_all(&mut self) {
        for table in [Table::Tickets, Table::ChatRooms, Table::ChatMessages, Table::Activities] {
            self.refresh(table).await;
        }
    }

    /// Waits for the next change-feed item and handles it: notify first,
    /// from the state held before the change, then refetch. Returns `None`
    /// once the session has ended.
    pub async fn next_change(&mut self) -> Option<ChangeOutcome> {
        if self.ended {
            return None;
        }
        let (table, item) = self.inbox.recv().await?;
        Some(self.handle(table, item).await)
    }

    /// Handles whatever the feeds have already delivered, without waiting.
    pub async fn drain_changes(&mut self) -> Vec<ChangeOutcome> {
        tokio::task::yield_now().await;
        let mut outcomes = Vec::new();
        while !self.ended {
            let Ok((table, item)) = self.inbox.try_recv() else {
                break;
            };
            outcomes.push(self.handle(table, item).await);
        }
        outcomes
    }

    #[instrument(skip(self, item), fields(user = %self.fetcher.me().id))]
    async fn handle(&mut self, table: Table, item: FeedItem) -> ChangeOutcome {
        let change = match item {
            FeedItem::Change(change) => change,
            FeedItem::Resync => {
                info!("change feed lagged, refetching");
                self.refresh(table).await;
                return ChangeOutcome {
                    table,
                    op: None,
                    notification: None,
                };
            }
        };

        let (notification, fetched) = {
            let directory = SessionDirectory {
                fetcher: &self.fetcher,
                names: &self.names,
                tickets: &self.known_tickets,
                rooms: &self.known_rooms,
                fetched: Mutex::default(),
            };
            let notification = dispatch(&change, self.fetcher.me(), &directory).await;
            (notification, directory.into_fetched())
        };
        for room in fetched {
            self.known_rooms.entry(room.id.clone()).or_insert(room);
        }

        if table == Table::Profiles {
            if let Some(id) = change.row_id() {
                self.names
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .pop(&UserId::new(id));
            }
        }
        if let Some(notification) = &notification {
            self.apply(Event::NotificationRaised(Box::new(notification.clone())));
        }
        self.refresh(table).await;

        ChangeOutcome {
            table,
            op: Some(change.op),
            notification,
        }
    }

    // --- UI state ---

    pub fn select_filter(&mut self, filter: TicketFilter) {
        self.apply(Event::FilterSelected(filter));
    }

    pub fn search(&mut self, query: impl Into<String>) {
        self.apply(Event::SearchChanged(query.into()));
    }

    pub fn edit_ticket_draft(&mut self, draft: TicketDraft) {
        self.apply(Event::TicketDraftChanged(draft));
    }

    /// Marks everything in `room` up to now as read.
    pub fn open_room(&mut self, room: &RoomId) {
        self.apply(Event::RoomOpened {
            room_id: room.clone(),
            at: UnixTimeMs::now(),
        });
    }

    pub fn dismiss_toast(&mut self, id: u64) {
        self.apply(Event::ToastDismissed { id });
    }

    pub fn set_desktop_permission(&mut self, permission: PermissionState) {
        self.apply(Event::DesktopPermissionChanged(permission));
    }

    // --- Commands ---
    //
    // Commands never touch the lists directly; the change feed delivers the
    // result and the refetch applies it.

    fn report<T>(&mut self, outcome: AppResult<T>, success: Option<String>, clears_draft: bool) -> AppResult<T> {
        match &outcome {
            Ok(_) => {
                if let Some(message) = success {
                    self.apply(Event::CommandSucceeded { message, clears_draft });
                }
            }
            Err(error) => self.apply(Event::CommandFailed { error: error.clone() }),
        }
        outcome
    }

    pub async fn create_ticket(&mut self, draft: &TicketDraft) -> AppResult<Ticket> {
        self.ensure_live()?;
        let outcome = self.fetcher.create_ticket(draft).await;
        self.report(outcome, Some("Ticket created successfully".into()), true)
    }

    pub async fn create_ticket_for(&mut self, customer_email: &str, draft: &TicketDraft) -> AppResult<Ticket> {
        self.ensure_live()?;
        let outcome = self.fetcher.create_ticket_for(customer_email, draft).await;
        self.report(outcome, Some("Ticket created successfully".into()), true)
    }

    pub async fn update_ticket_status(&mut self, id: &TicketId, status: TicketStatus) -> AppResult<Ticket> {
        self.ensure_live()?;
        let outcome = self.fetcher.update_ticket_status(id, status).await;
        self.report(outcome, Some(format!("Ticket marked as {status}")), false)
    }

    pub async fn assign_ticket(&mut self, id: &TicketId, assignee: &UserId) -> AppResult<Ticket> {
        self.ensure_live()?;
        let outcome = self.fetcher.assign_ticket(id, assignee).await;
        self.report(outcome, Some("Ticket assigned".into()), false)
    }

    /// The customer's chat room, created on first use.
    pub async fn open_chat(&mut self) -> AppResult<ChatRoom> {
        self.ensure_live()?;
        let outcome = self.fetcher.ensure_chat_room().await;
        if let Ok(room) = &outcome {
            self.open_room(&room.id);
        }
        self.report(outcome, None, false)
    }

    pub async fn send_message(&mut self, room: &RoomId, body: &str) -> AppResult<ChatMessage> {
        self.ensure_live()?;
        let outcome = self.fetcher.send_message(room, body).await;
        self.report(outcome, None, false)
    }

    pub async fn join_room(&mut self, room: &RoomId) -> AppResult<ChatRoom> {
        self.ensure_live()?;
        let outcome = self.fetcher.join_room(room).await;
        if outcome.is_ok() {
            self.open_room(room);
        }
        self.report(outcome, Some("You joined the chat".into()), false)
    }

    pub async fn close_room(&mut self, room: &RoomId) -> AppResult<ChatRoom> {
        self.ensure_live()?;
        let outcome = self.fetcher.close_room(room).await;
        self.report(outcome, Some("Chat closed".into()), false)
    }

    pub async fn set_availability(&mut self, available: bool) -> AppResult<UserProfile> {
        self.ensure_live()?;
        let outcome = self.fetcher.set_availability(available).await;
        let message = if available {
            "You are now available"
        } else {
            "You are now away"
        };
        self.report(outcome, Some(message.into()), false)
    }

    pub async fn create_user(&mut self, form: &SignUpForm) -> AppResult<UserProfile> {
        self.ensure_live()?;
        let outcome = self.fetcher.create_user(form).await;
        self.report(outcome, Some("User created successfully".into()), false)
    }

    /// One toast for the whole batch, success or failure.
    pub async fn delete_users(&mut self, ids: &[UserId]) -> AppResult<String> {
        self.ensure_live()?;
        let outcome = self.fetcher.delete_users(ids).await;
        let message = outcome.as_ref().ok().cloned();
        self.report(outcome, message, false)
    }

    pub async fn provision_initial_users(&mut self, users: &[SignUpForm]) -> AppResult<ProvisionResponse> {
        self.ensure_live()?;
        let outcome = self.fetcher.provision_initial_users(users).await;
        let message = outcome
            .as_ref()
            .ok()
            .map(|r| format!("{} users created, {} already existed", r.created.len(), r.existing.len()));
        self.report(outcome, message, false)
    }

    /// Logout: cancels every subscription, signs the client out and clears
    /// the core. Fetches still in flight are ignored when they land.
    #[instrument(skip(self), fields(user = %self.fetcher.me().id))]
    pub async fn teardown(&mut self) -> AppResult<()> {
        if self.ended {
            return Ok(());
        }
        self.ended = true;
        let cancelled = self.registry.cancel_all();
        self.guards.clear();
        while self.inbox.try_recv().is_ok() {}

        let signed_out = self.backend.sign_out().await;
        self.apply(Event::SessionEnded);
        info!(cancelled, "session ended");
        signed_out.map_err(AppError::from)
    }
}

impl<B: Backend + ?Sized> Drop for HelpdeskSession<B> {
    fn drop(&mut self) {
        let cancelled = self.registry.cancel_all();
        if cancelled > 0 {
            debug!(cancelled, "session dropped with live subscriptions");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::FlakyBackend;
    use crate::backend::DocumentBackend;
    use crate::model::{Priority, Role};
    use std::time::Duration;

    fn shell() -> Arc<RecordingShell> {
        Arc::new(RecordingShell::new(PermissionState::Denied))
    }

    async fn session_on<B: Backend>(backend: Arc<B>, email: &str, name: &str, role: Role) -> HelpdeskSession<B> {
        let form = SignUpForm::new(email, "secret123", name, Some(role));
        let outcome = HelpdeskSession::sign_up(backend, &form, shell(), SessionConfig::default())
            .await
            .unwrap();
        let SignUpOutcome::SignedIn(mut session) = outcome else {
            panic!("expected a signed-in session");
        };
        session.start().await.unwrap();
        *session
    }

    async fn next<B: Backend>(session: &mut HelpdeskSession<B>) -> ChangeOutcome {
        tokio::time::timeout(Duration::from_secs(2), session.next_change())
            .await
            .expect("change within timeout")
            .expect("session still open")
    }

    fn draft() -> TicketDraft {
        TicketDraft {
            title: "Cannot log in".into(),
            description: "Password reset loops".into(),
            priority: Priority::High,
            category: "Account".into(),
        }
    }

    #[tokio::test]
    async fn invalid_sign_in_never_reaches_backend() {
        let backend = Arc::new(DocumentBackend::new());
        let form = SignInForm::new("not-an-email", "secret123");
        let err = HelpdeskSession::sign_in(backend, &form, shell(), SessionConfig::default())
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind, ErrorKind::Validation);
    }

    #[tokio::test]
    async fn connect_signs_in_through_the_saved_target() {
        use crate::config::{BackendConfig, BackendOverride};
        use crate::settings::SettingsStore;
        use secrecy::SecretString;

        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::new(dir.path().join("settings.bin"));
        let deployment =
            BackendConfig::new("https://desk.example.com", SecretString::new("prod-anon".into())).unwrap();
        let secondary = BackendOverride::new(
            "https://docs.example.com/",
            SecretString::new("docs-key".into()),
            Some(&deployment),
        )
        .unwrap();
        store.set_override(Some(secondary)).unwrap();

        let server = DocumentBackend::new();
        let _ana = session_on(Arc::new(server.client()), "ana@example.com", "Ana", Role::Customer).await;
        let form = SignInForm::new("ana@example.com", "secret123");
        let session = HelpdeskSession::connect(
            &server,
            store.backend_target(deployment.clone()),
            &form,
            shell(),
            SessionConfig::default(),
        )
        .await
        .unwrap();
        assert_eq!(session.user().name, "Ana");
        let target = session.backend_target().unwrap();
        assert!(target.is_override());
        assert_eq!(target.endpoint(), "https://docs.example.com");

        store.set_override(None).unwrap();
        let bad = SignInForm::new("ana@example.com", "wrong-password");
        let err = HelpdeskSession::connect(&server, store.backend_target(deployment), &bad, shell(), SessionConfig::default())
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind, ErrorKind::Authentication);
    }

    #[tokio::test]
    async fn wrong_password_is_an_auth_error() {
        let server = DocumentBackend::new();
        let _ana = session_on(Arc::new(server.client()), "ana@example.com", "Ana", Role::Customer).await;
        let form = SignInForm::new("ana@example.com", "wrong-password");
        let err = HelpdeskSession::sign_in(Arc::new(server.client()), &form, shell(), SessionConfig::default())
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind, ErrorKind::Authentication);
        assert_eq!(err.message, "Invalid email or password");
    }

    #[tokio::test]
    async fn restart_keeps_one_subscription_per_key() {
        let server = DocumentBackend::new();
        let mut session = session_on(Arc::new(server.client()), "bo@example.com", "Bo", Role::Agent).await;
        assert_eq!(session.active_subscriptions().len(), 5);
        session.start().await.unwrap();
        assert_eq!(session.active_subscriptions().len(), 5);
    }

    #[tokio::test]
    async fn customer_subscriptions_are_scoped() {
        let server = DocumentBackend::new();
        let ana = session_on(Arc::new(server.client()), "ana@example.com", "Ana", Role::Customer).await;
        let keys = ana.active_subscriptions();
        assert_eq!(keys.len(), 4);
        assert!(keys.iter().all(|k| k.table != Table::Activities));
    }

    #[tokio::test]
    async fn reply_reaches_customer_before_rooms_are_known() {
        let server = DocumentBackend::new();
        let mut bo = session_on(Arc::new(server.client()), "bo@example.com", "Bo", Role::Agent).await;
        let flaky = Arc::new(FlakyBackend::new(server.client()));
        let mut ana = session_on(Arc::clone(&flaky), "ana@example.com", "Ana", Role::Customer).await;

        let room = ana.open_chat().await.unwrap();
        flaky.set_fail_selects(true);
        let outcome = next(&mut ana).await;
        assert_eq!(outcome.table, Table::ChatRooms);
        assert!(ana.view().rooms.is_empty());
        flaky.set_fail_selects(false);

        bo.send_message(&room.id, "Hi Ana, how can I help?").await.unwrap();
        let outcome = next(&mut ana).await;
        assert_eq!(outcome.table, Table::ChatMessages);
        let reply = outcome.notification.expect("reply should notify");
        assert_eq!(reply.body, "Bo: Hi Ana, how can I help?");
        assert_eq!(ana.view().notifications.len(), 1);
    }

    #[tokio::test]
    async fn unknown_room_is_looked_up_before_notifying_staff() {
        let server = DocumentBackend::new();
        let flaky = Arc::new(FlakyBackend::new(server.client()));
        let mut bo = session_on(Arc::clone(&flaky), "bo@example.com", "Bo", Role::Agent).await;
        let mut cy = session_on(Arc::new(server.client()), "cy@example.com", "Cy", Role::Agent).await;
        let mut ana = session_on(Arc::new(server.client()), "ana@example.com", "Ana", Role::Customer).await;

        let room = ana.open_chat().await.unwrap();
        cy.join_room(&room.id).await.unwrap();
        flaky.set_fail_selects(true);
        while let Ok(Some(_)) = tokio::time::timeout(Duration::from_millis(150), bo.next_change()).await {}
        flaky.set_fail_selects(false);
        assert!(bo.view().rooms.is_empty());

        ana.send_message(&room.id, "Still there?").await.unwrap();
        let outcome = loop {
            let outcome = next(&mut bo).await;
            if outcome.table == Table::ChatMessages {
                break outcome;
            }
        };
        // Cy owns the room, so Bo stays quiet.
        assert!(outcome.notification.is_none());
    }

    #[tokio::test]
    async fn failed_refresh_keeps_the_last_good_list() {
        let server = DocumentBackend::new();
        let flaky = Arc::new(FlakyBackend::new(server.client()));
        let mut ana = session_on(Arc::clone(&flaky), "ana@example.com", "Ana", Role::Customer).await;

        ana.create_ticket(&draft()).await.unwrap();
        let outcome = next(&mut ana).await;
        assert_eq!(outcome.table, Table::Tickets);
        assert_eq!(ana.view().tickets.len(), 1);

        flaky.set_fail_selects(true);
        ana.refresh(Table::Tickets).await;
        let view = ana.view();
        assert_eq!(view.tickets.len(), 1);
        assert_eq!(view.error.as_deref(), Some("Unable to reach the server"));

        flaky.set_fail_selects(false);
        ana.refresh(Table::Tickets).await;
        assert!(ana.view().error.is_none());
    }

    #[tokio::test]
    async fn command_failure_raises_error_toast_and_keeps_draft() {
        let server = DocumentBackend::new();
        let mut bo = session_on(Arc::new(server.client()), "bo@example.com", "Bo", Role::Agent).await;
        bo.edit_ticket_draft(draft());

        let err = bo.create_ticket_for("ghost@example.com", &draft()).await.unwrap_err();
        assert_eq!(err.message, "Customer not found");

        let view = bo.view();
        assert_eq!(view.ticket_draft, Some(draft()));
        let toast = view.toasts.last().unwrap();
        assert_eq!(toast.message, "Customer not found");
        assert_eq!(toast.kind, crate::ToastKind::Error);
    }

    #[tokio::test]
    async fn teardown_cancels_everything_and_ignores_late_work() {
        let server = DocumentBackend::new();
        let mut ana = session_on(Arc::new(server.client()), "ana@example.com", "Ana", Role::Customer).await;
        assert!(!ana.active_subscriptions().is_empty());

        ana.teardown().await.unwrap();
        assert!(ana.is_ended());
        assert!(ana.active_subscriptions().is_empty());
        assert!(!ana.view().signed_in);
        assert!(ana.next_change().await.is_none());

        ana.refresh(Table::Tickets).await;
        assert!(ana.view().tickets.is_empty());
        let err = ana.create_ticket(&draft()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidState);
        ana.teardown().await.unwrap();
    }
}
