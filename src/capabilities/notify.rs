use crux_core::capability::{Capability, CapabilityContext, Operation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Desktop notification permission as reported by the shell.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum PermissionState {
    #[default]
    NotDetermined,
    Denied,
    Granted,
}

impl PermissionState {
    #[must_use]
    pub const fn is_granted(self) -> bool {
        matches!(self, Self::Granted)
    }

    #[must_use]
    pub const fn is_denied(self) -> bool {
        matches!(self, Self::Denied)
    }

    #[must_use]
    pub const fn needs_request(self) -> bool {
        matches!(self, Self::NotDetermined)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DesktopNotification {
    pub title: String,
    pub body: String,
    /// Lets the platform collapse repeated notifications about one entity.
    pub tag: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "op", content = "data")]
pub enum NotifyOperation {
    Show(DesktopNotification),
}

impl Operation for NotifyOperation {
    type Output = ();
}

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum NotifyError {
    #[error("desktop notifications not available on this platform")]
    NotAvailable,

    #[error("permission denied by user")]
    PermissionDenied,

    #[error("platform error: {message}")]
    Platform { message: String },
}

/// Fire-and-forget desktop notifications. The shell reports failures back as
/// [`crate::Event::DesktopNotificationFailed`] so the core can fall back to a toast.
#[derive(Clone)]
pub struct Notify<Ev> {
    context: CapabilityContext<NotifyOperation, Ev>,
}

impl<Ev> Capability<Ev> for Notify<Ev> {
    type Operation = NotifyOperation;
    type MappedSelf<MappedEv> = Notify<MappedEv>;

    fn map_event<F, NewEv>(&self, f: F) -> Self::MappedSelf<NewEv>
    where
        F: Fn(NewEv) -> Ev + Send + Sync + 'static,
        Ev: 'static,
        NewEv: 'static + Send,
    {
        Notify::new(self.context.map_event(f))
    }
}

impl<Ev> Notify<Ev>
where
    Ev: 'static,
{
    pub fn new(context: CapabilityContext<NotifyOperation, Ev>) -> Self {
        Self { context }
    }

    pub fn show(&self, notification: DesktopNotification) {
        let ctx = self.context.clone();
        self.context.spawn(async move {
            ctx.notify_shell(NotifyOperation::Show(notification)).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_state_checks() {
        assert!(PermissionState::Granted.is_granted());
        assert!(!PermissionState::Denied.is_granted());
        assert!(!PermissionState::NotDetermined.is_granted());
        assert!(PermissionState::Denied.is_denied());
        assert!(PermissionState::NotDetermined.needs_request());
        assert_eq!(PermissionState::default(), PermissionState::NotDetermined);
    }

    #[test]
    fn operation_wire_shape() {
        let op = NotifyOperation::Show(DesktopNotification {
            title: "New ticket".into(),
            body: "Ana · High priority · Cannot log in".into(),
            tag: Some("ticket:t-1".into()),
        });
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["op"], "Show");
        assert_eq!(json["data"]["title"], "New ticket");
    }
}
