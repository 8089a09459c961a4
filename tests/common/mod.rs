#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use helpdesk_core::backend::{Backend, DocumentBackend, SqliteBackend};
use helpdesk_core::capabilities::PermissionState;
use helpdesk_core::config::SessionConfig;
use helpdesk_core::dispatch::Notification;
use helpdesk_core::event::{SignUpForm, TicketDraft};
use helpdesk_core::model::{Priority, Role};
use helpdesk_core::session::{ChangeOutcome, HelpdeskSession, RecordingShell, SignUpOutcome};

/// A shared backend that hands out independent clients, one per tab.
pub trait Server {
    type Client: Backend;

    fn client(&self) -> Self::Client;
}

impl Server for DocumentBackend {
    type Client = DocumentBackend;

    fn client(&self) -> DocumentBackend {
        DocumentBackend::client(self)
    }
}

impl Server for SqliteBackend {
    type Client = SqliteBackend;

    fn client(&self) -> SqliteBackend {
        SqliteBackend::client(self)
    }
}

/// Runs each listed scenario once per adapter.
macro_rules! on_both_backends {
    ($($scenario:ident),* $(,)?) => {
        mod document {
            $(
                #[tokio::test]
                async fn $scenario() {
                    super::$scenario(helpdesk_core::backend::DocumentBackend::new()).await;
                }
            )*
        }

        mod relational {
            $(
                #[tokio::test]
                async fn $scenario() {
                    let server = helpdesk_core::backend::SqliteBackend::open_in_memory().unwrap();
                    super::$scenario(server).await;
                }
            )*
        }
    };
}

pub struct Tab<B: Backend> {
    pub session: HelpdeskSession<B>,
    pub shell: Arc<RecordingShell>,
}

pub async fn sign_up<S: Server>(
    server: &S,
    email: &str,
    name: &str,
    role: Role,
    permission: PermissionState,
) -> Tab<S::Client> {
    let shell = Arc::new(RecordingShell::new(permission));
    let form = SignUpForm::new(email, "secret123", name, Some(role));
    let outcome = HelpdeskSession::sign_up(
        Arc::new(server.client()),
        &form,
        shell.clone(),
        SessionConfig::default(),
    )
    .await
    .unwrap();
    let SignUpOutcome::SignedIn(session) = outcome else {
        panic!("{email} should be signed in right away");
    };
    let mut session = *session;
    session.start().await.unwrap();
    Tab { session, shell }
}

pub async fn next<B: Backend>(session: &mut HelpdeskSession<B>) -> ChangeOutcome {
    tokio::time::timeout(Duration::from_secs(2), session.next_change())
        .await
        .expect("a change within two seconds")
        .expect("session still open")
}

/// Handles changes until one of them raises a notification.
pub async fn next_notification<B: Backend>(session: &mut HelpdeskSession<B>) -> Notification {
    loop {
        if let Some(notification) = next(session).await.notification {
            return notification;
        }
    }
}

/// Handles changes until the feeds go quiet; returns what was raised.
pub async fn settle<B: Backend>(session: &mut HelpdeskSession<B>) -> Vec<Notification> {
    let mut raised = Vec::new();
    while let Ok(Some(outcome)) = tokio::time::timeout(Duration::from_millis(150), session.next_change()).await {
        raised.extend(outcome.notification);
    }
    raised
}

pub fn draft(title: &str) -> TicketDraft {
    TicketDraft {
        title: title.into(),
        description: "Password reset link loops back to the login page".into(),
        priority: Priority::High,
        category: "Account".into(),
    }
}
