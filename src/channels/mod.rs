//! Manager/worker signaling surfaces.
//!
//! Workers and the manager share no memory. Everything a worker wants the
//! manager (or a human) to see goes through the notification log here, or
//! through its status document in [`crate::status`].

pub mod notification;

pub use notification::{
    JsonlNotificationSink, NotificationEvent, NotificationKind, NotificationSink, TailCursor,
};
