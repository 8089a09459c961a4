//! Document-store adapter: schemaless JSON collections held in memory.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use secrecy::SecretString;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info};

use super::edge::{self, AccountStore};
use super::{
    merge_patch, normalize_email, password_digest, prepare_insert, sort_rows, AuthError, Backend,
    BackendError, BackendOptions, ChangeBus, ChangeEvent, ChangeFeed, Connect, Filter, NewAccount,
    Row,
};
use crate::config::BackendTarget;
use crate::event::UserId;
use crate::model::{Table, UnixTimeMs, UserProfile};

struct Account {
    profile: UserProfile,
    salt: String,
    digest: blake3::Hash,
    confirmed: bool,
}

#[derive(Default)]
struct Documents {
    collections: HashMap<Table, BTreeMap<String, Row>>,
    /// Keyed by normalized email.
    accounts: HashMap<String, Account>,
}

impl Documents {
    fn collection(&mut self, table: Table) -> &mut BTreeMap<String, Row> {
        self.collections.entry(table).or_default()
    }
}

struct Store {
    docs: Mutex<Documents>,
    bus: ChangeBus,
    options: BackendOptions,
}

/// One client of a shared in-memory document store. [`DocumentBackend::client`]
/// opens another client (another tab) on the same data.
pub struct DocumentBackend {
    store: Arc<Store>,
    session: watch::Sender<Option<UserProfile>>,
}

impl Default for DocumentBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::with_options(BackendOptions::default())
    }

    #[must_use]
    pub fn with_options(options: BackendOptions) -> Self {
        let store = Store {
            docs: Mutex::new(Documents::default()),
            bus: ChangeBus::new(options.feed_capacity),
            options,
        };
        Self::attach(Arc::new(store))
    }

    fn attach(store: Arc<Store>) -> Self {
        let (session, _) = watch::channel(None);
        Self { store, session }
    }

    /// A signed-out client sharing this store.
    #[must_use]
    pub fn client(&self) -> Self {
        Self::attach(Arc::clone(&self.store))
    }

    /// Marks a pending sign-up as confirmed. Returns whether the account exists.
    pub fn confirm_email(&self, email: &str) -> bool {
        let mut docs = self.docs();
        match docs.accounts.get_mut(&normalize_email(email)) {
            Some(account) => {
                account.confirmed = true;
                true
            }
            None => false,
        }
    }

    fn docs(&self) -> MutexGuard<'_, Documents> {
        self.store.docs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn require_session(&self) -> Result<(), BackendError> {
        if self.session.borrow().is_none() {
            return Err(BackendError::Unauthorized);
        }
        Ok(())
    }

    fn query(&self, table: Table, filter: &Filter) -> Vec<Row> {
        let mut rows: Vec<Row> = {
            let mut docs = self.docs();
            docs.collection(table)
                .values()
                .filter(|row| filter.matches(row))
                .cloned()
                .collect()
        };
        sort_rows(&mut rows);
        rows
    }
}

#[async_trait]
impl Backend for DocumentBackend {
    async fn sign_in(&self, email: &str, password: &SecretString) -> Result<UserProfile, AuthError> {
        let profile = {
            let docs = self.docs();
            let account = docs
                .accounts
                .get(&normalize_email(email))
                .ok_or(AuthError::InvalidCredentials)?;
            if password_digest(&account.salt, password) != account.digest {
                return Err(AuthError::InvalidCredentials);
            }
            if !account.confirmed {
                return Err(AuthError::EmailNotConfirmed);
            }
            account.profile.clone()
        };
        debug!(user = %profile.id, "signed in");
        self.session.send_replace(Some(profile.clone()));
        Ok(profile)
    }

    async fn sign_up(&self, account: NewAccount<'_>) -> Result<UserProfile, AuthError> {
        let confirmed = !self.store.options.require_email_confirmation;
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
        Ok(self.query(table, filter))
    }

    async fn insert(&self, table: Table, row: Row) -> Result<Row, BackendError> {
        self.require_session()?;
        let (id, object) = prepare_insert(row)?;
        let row = Value::Object(object);
        {
            let mut docs = self.docs();
            let collection = docs.collection(table);
            if collection.contains_key(&id) {
                return Err(BackendError::Conflict(format!("{table} {id} already exists")));
            }
            collection.insert(id, row.clone());
        }
        self.store.bus.publish(ChangeEvent::insert(table, &row));
        Ok(row)
    }

    async fn update(&self, table: Table, id: &str, patch: Row) -> Result<Row, BackendError> {
        self.require_session()?;
        let (before, after) = {
            let mut docs = self.docs();
            let slot = docs
                .collection(table)
                .get_mut(id)
                .ok_or_else(|| BackendError::NotFound {
                    table,
                    id: id.to_string(),
                })?;
            let after = merge_patch(slot, patch)?;
            let before = std::mem::replace(slot, after.clone());
            (before, after)
        };
        self.store.bus.publish(ChangeEvent::update(table, &before, &after));
        Ok(after)
    }

    async fn delete(&self, table: Table, id: &str) -> Result<(), BackendError> {
        self.require_session()?;
        let removed = self.docs().collection(table).remove(id);
        if let Some(row) = removed {
            self.store.bus.publish(ChangeEvent::delete(table, &row));
        }
        Ok(())
    }

    fn subscribe(&self, table: Table, filter: Option<Filter>) -> Result<ChangeFeed, BackendError> {
        self.require_session()?;
        Ok(self.store.bus.subscribe(table, filter))
    }

    async fn invoke(&self, function: &str, payload: Value) -> Result<Value, BackendError> {
        edge::invoke(self, function, payload).await
    }
}

/// The store runs in-process, so every target resolves to it.
impl Connect for DocumentBackend {
    type Client = DocumentBackend;

    fn connect(&self, target: &BackendTarget) -> Result<Self::Client, BackendError> {
        debug!(endpoint = target.endpoint(), secondary = target.is_override(), "document client opened");
        Ok(self.client())
    }
}

#[async_trait]
impl AccountStore for DocumentBackend {
    fn caller(&self) -> Option<UserProfile> {
        self.session.borrow().clone()
    }

    async fn rows(&self, table: Table, filter: &Filter) -> Result<Vec<Row>, BackendError> {
        Ok(self.query(table, filter))
    }

    async fn find_account(&self, email: &str) -> Result<Option<UserProfile>, BackendError> {
        Ok(self
            .docs()
            .accounts
            .get(&normalize_email(email))
            .map(|a| a.profile.clone()))
    }

    async fn create_account(
        &self,
        account: NewAccount<'_>,
        confirmed: bool,
    ) -> Result<UserProfile, AuthError> {
        let email = normalize_email(account.email);
        let profile = UserProfile {
            id: UserId::generate(),
            email: email.clone(),
            name: account.name.trim().to_string(),
            role: account.role,
            is_available: account.role.is_staff(),
            created_at: UnixTimeMs::now(),
        };
        let row = serde_json::to_value(&profile).map_err(|e| AuthError::Provider(e.to_string()))?;
        {
            let mut docs = self.docs();
            if docs.accounts.contains_key(&email) {
                return Err(AuthError::EmailTaken);
            }
            let salt = uuid::Uuid::new_v4().to_string();
            let digest = password_digest(&salt, account.password);
            docs.accounts.insert(
                email,
                Account {
                    profile: profile.clone(),
                    salt,
                    digest,
                    confirmed,
                },
            );
            docs.collection(Table::Profiles)
                .insert(profile.id.as_str().to_string(), row.clone());
        }
        info!(user = %profile.id, role = profile.role.as_str(), "account created");
        self.store.bus.publish(ChangeEvent::insert(Table::Profiles, &row));
        Ok(profile)
    }

    async fn delete_accounts(&self, ids: &[UserId]) -> Result<usize, BackendError> {
        let removed = {
            let mut docs = self.docs();
            let emails = ids
                .iter()
                .map(|id| {
                    docs.accounts
                        .iter()
                        .find(|(_, a)| &a.profile.id == id)
                        .map(|(email, _)| email.clone())
                        .ok_or_else(|| BackendError::NotFound {
                            table: Table::Profiles,
                            id: id.to_string(),
                        })
                })
                .collect::<Result<Vec<_>, _>>()?;
            let mut removed = Vec::with_capacity(emails.len());
            for email in emails {
                if let Some(account) = docs.accounts.remove(&email) {
                    let row = docs.collection(Table::Profiles).remove(account.profile.id.as_str());
                    removed.push(row.unwrap_or_else(|| {
                        serde_json::to_value(&account.profile).unwrap_or(Value::Null)
                    }));
                }
            }
            removed
        };
        for row in &removed {
            self.store.bus.publish(ChangeEvent::delete(Table::Profiles, row));
        }
        Ok(removed.len())
    }
}
