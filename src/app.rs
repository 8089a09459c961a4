use crux_core::App as CruxApp;
use tracing::{debug, warn};

use crate::capabilities::Capabilities;
use crate::dispatch::Notification;
use crate::event::Event;
use crate::model::{Model, Table};
use crate::view::{build_view, ViewModel};
use crate::{ToastKind, ToastMessage};

#[derive(Default)]
pub struct App;

impl App {
    /// Replaces `list` with a completed fetch unless the session ended or a
    /// newer result is already applied.
    fn apply_fetch<T>(model: &mut Model, table: Table, seq: u64, data: Vec<T>, list: fn(&mut Model) -> &mut Vec<T>) -> bool {
        if !model.is_active() {
            debug!(%table, seq, "fetch result after session end ignored");
            return false;
        }
        let state = model.fetch_state_mut(table);
        if seq <= state.applied {
            debug!(%table, seq, applied = state.applied, "stale fetch result ignored");
            return false;
        }
        state.applied = seq;
        state.requested = state.requested.max(seq);
        state.error = None;
        *list(model) = data;
        true
    }

    fn toast_for(model: &mut Model, notification: &Notification) {
        model.push_toast(ToastMessage::titled(
            notification.title.clone(),
            notification.body.clone(),
            ToastKind::Info,
        ));
    }

    fn deliver(model: &mut Model, notification: Notification, caps: &Capabilities) {
        if model.desktop_permission.is_granted() {
            caps.notify.show(notification.to_desktop());
        } else {
            Self::toast_for(model, &notification);
        }
        model.record_notification(notification);
    }
}

impl CruxApp for App {
    type Event = Event;
    type Model = Model;
    type ViewModel = ViewModel;
    type Capabilities = Capabilities;

    fn update(&self, event: Event, model: &mut Model, caps: &Capabilities) {
        debug!(event = event.name(), "update");

        match event {
            Event::SessionStarted {
                user,
                desktop_permission,
                limits,
            } => {
                model.reset();
                model.user = Some(user);
                model.desktop_permission = desktop_permission;
                model.limits = limits;
            }

            Event::SessionEnded => model.reset(),

            Event::DesktopPermissionChanged(permission) => {
                model.desktop_permission = permission;
            }

            Event::FetchStarted { table, seq } => {
                if !model.is_active() {
                    return;
                }
                let state = model.fetch_state_mut(table);
                state.requested = state.requested.max(seq);
            }

            Event::TicketsFetched { seq, tickets } => {
                if !Self::apply_fetch(model, Table::Tickets, seq, tickets, |m| &mut m.tickets) {
                    return;
                }
            }

            Event::RoomsFetched { seq, rooms } => {
                if !Self::apply_fetch(model, Table::ChatRooms, seq, rooms, |m| &mut m.rooms) {
                    return;
                }
            }

            Event::MessagesFetched { seq, messages } => {
                if !Self::apply_fetch(model, Table::ChatMessages, seq, messages, |m| &mut m.messages) {
                    return;
                }
            }

            Event::ActivitiesFetched { seq, activities } => {
                if !Self::apply_fetch(model, Table::Activities, seq, activities, |m| &mut m.activities) {
                    return;
                }
            }

            Event::FetchFailed { table, seq, error } => {
                if !model.is_active() {
                    return;
                }
                let state = model.fetch_state_mut(table);
                if seq < state.applied {
                    return;
                }
                warn!(%table, seq, error = %error, "fetch failed, keeping previous data");
                state.error = Some(error);
            }

            Event::FilterSelected(filter) => model.filter = filter,

            Event::SearchChanged(search) => model.search = search,

            Event::TicketDraftChanged(draft) => model.ticket_draft = Some(draft),

            Event::RoomOpened { room_id, at } => {
                let watermark = model.watermarks.entry(room_id).or_insert(at);
                *watermark = (*watermark).max(at);
            }

            Event::NotificationRaised(notification) => {
                let Some(me) = model.user.as_ref() else {
                    return;
                };
                if notification.recipient != me.id {
                    debug!(kind = notification.kind.as_str(), "notification for another user dropped");
                    return;
                }
                Self::deliver(model, *notification, caps);
            }

            Event::DesktopNotificationFailed {
                notification,
                reason,
            } => {
                warn!(%reason, "desktop notification failed, falling back to toast");
                if !model.is_active() {
                    return;
                }
                Self::toast_for(model, &notification);
            }

            Event::ToastDismissed { id } => model.toasts.retain(|t| t.id != id),

            Event::CommandSucceeded {
                message,
                clears_draft,
            } => {
                if !model.is_active() {
                    return;
                }
                if clears_draft {
                    model.ticket_draft = None;
                }
                model.push_toast(ToastMessage::new(message, ToastKind::Success));
            }

            Event::CommandFailed { error } => {
                if !model.is_active() {
                    return;
                }
                warn!(code = error.kind.code(), detail = ?error.detail, "command failed");
                model.push_toast(ToastMessage::new(error.message, ToastKind::Error));
            }
        }

        caps.render.render();
    }

    fn view(&self, model: &Model) -> ViewModel {
        build_view(model)
    }
}
