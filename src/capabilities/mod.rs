//! Capabilities of the helpdesk core.
//!
//! Crux's built-in Render capability covers view updates as-is; desktop
//! notifications are a custom fire-and-forget capability.
mod notify;

pub use self::notify::{
    DesktopNotification, Notify, NotifyError, NotifyOperation, PermissionState,
};
pub use crux_core::render::Render;

use crux_core::macros::Effect;

use crate::event::Event;

#[derive(Effect)]
#[effect(app = "crate::app::App")]
pub struct Capabilities {
    pub render: Render<Event>,
    pub notify: Notify<Event>,
}
