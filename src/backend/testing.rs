use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use secrecy::SecretString;
use serde_json::Value;
use tokio::sync::watch;

use super::{AuthError, Backend, BackendError, ChangeFeed, Filter, NewAccount, Row};
use crate::model::{Table, UserProfile};

/// Wraps a backend, yielding to the scheduler before every call so
/// concurrent tasks interleave, with switchable read failures.
pub(crate) struct FlakyBackend<B> {
    inner: B,
    fail_selects: AtomicBool,
}

impl<B: Backend> FlakyBackend<B> {
    pub(crate) fn new(inner: B) -> Self {
        Self {
            inner,
            fail_selects: AtomicBool::new(false),
        }
    }

    pub(crate) fn set_fail_selects(&self, fail: bool) {
        self.fail_selects.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl<B: Backend> Backend for FlakyBackend<B> {
    async fn sign_in(&self, email: &str, password: &SecretString) -> Result<UserProfile, AuthError> {
        tokio::task::yield_now().await;
        self.inner.sign_in(email, password).await
    }

    async fn sign_up(&self, account: NewAccount<'_>) -> Result<UserProfile, AuthError> {
        tokio::task::yield_now().await;
        self.inner.sign_up(account).await
    }

    async fn sign_out(&self) -> Result<(), BackendError> {
        self.inner.sign_out().await
    }

    fn auth_state(&self) -> watch::Receiver<Option<UserProfile>> {
        self.inner.auth_state()
    }

    async fn select(&self, table: Table, filter: &Filter) -> Result<Vec<Row>, BackendError> {
        tokio::task::yield_now().await;
        if self.fail_selects.load(Ordering::SeqCst) {
            return Err(BackendError::Network("Injected failure".into()));
        }
        self.inner.select(table, filter).await
    }

    async fn insert(&self, table: Table, row: Row) -> Result<Row, BackendError> {
        tokio::task::yield_now().await;
        let row = self.inner.insert(table, row).await;
        tokio::task::yield_now().await;
        row
    }

    async fn update(&self, table: Table, id: &str, patch: Row) -> Result<Row, BackendError> {
        tokio::task::yield_now().await;
        self.inner.update(table, id, patch).await
    }

    async fn delete(&self, table: Table, id: &str) -> Result<(), BackendError> {
        tokio::task::yield_now().await;
        self.inner.delete(table, id).await
    }

    fn subscribe(&self, table: Table, filter: Option<Filter>) -> Result<ChangeFeed, BackendError> {
        self.inner.subscribe(table, filter)
    }

    async fn invoke(&self, function: &str, payload: Value) -> Result<Value, BackendError> {
        tokio::task::yield_now().await;
        self.inner.invoke(function, payload).await
    }
}
