use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::{Appointment, WaitlistEntry};

const CHANNEL_CAPACITY: usize = 256;

/// Post-commit event for clients and operators. Never part of a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    AppointmentBooked { appointment: Appointment },
    AppointmentMoved { appointment: Appointment },
    AppointmentStatusChanged { appointment: Appointment },
    WaitlistJoined { entry: WaitlistEntry },
    WaitlistNotified { entry: WaitlistEntry },
    WaitlistSeated { entry: WaitlistEntry, appointment: Appointment },
    WaitlistRemoved { entry: WaitlistEntry },
    WaitlistReordered { entry: WaitlistEntry },
}

impl Notification {
    pub fn location_id(&self) -> Ulid {
        match self {
            Notification::AppointmentBooked { appointment }
            | Notification::AppointmentMoved { appointment }
            | Notification::AppointmentStatusChanged { appointment } => appointment.location_id,
            Notification::WaitlistJoined { entry }
            | Notification::WaitlistNotified { entry }
            | Notification::WaitlistSeated { entry, .. }
            | Notification::WaitlistRemoved { entry }
            | Notification::WaitlistReordered { entry } => entry.location_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Notification::AppointmentBooked { .. } => "appointment_booked",
            Notification::AppointmentMoved { .. } => "appointment_moved",
            Notification::AppointmentStatusChanged { .. } => "appointment_status_changed",
            Notification::WaitlistJoined { .. } => "waitlist_joined",
            Notification::WaitlistNotified { .. } => "waitlist_notified",
            Notification::WaitlistSeated { .. } => "waitlist_seated",
            Notification::WaitlistRemoved { .. } => "waitlist_removed",
            Notification::WaitlistReordered { .. } => "waitlist_reordered",
        }
    }
}

/// Broadcast hub feeding the dispatcher.
pub struct NotifyHub {
    all: broadcast::Sender<Notification>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            all: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<Notification> {
        self.all.subscribe()
    }

    /// No-op if nobody is listening.
    pub fn publish(&self, notification: Notification) {
        let _ = self.all.send(notification);
    }
}

#[derive(Debug, thiserror::Error)]
#[error("delivery failed: {0}")]
pub struct DeliveryError(pub String);

/// Outbound SMS/webhook/etc.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, notification: &Notification) -> Result<(), DeliveryError>;
}

/// Default sink: structured log line per notification.
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn deliver(&self, notification: &Notification) -> Result<(), DeliveryError> {
        tracing::info!(
            kind = notification.kind(),
            location = %notification.location_id(),
            "notification"
        );
        Ok(())
    }
}

/// Drains a hub subscription into a sink until the hub is dropped. Failures
/// are counted and logged; they never reach the commit that produced the
/// notification.
pub async fn run_dispatcher(
    mut rx: broadcast::Receiver<Notification>,
    sink: Arc<dyn NotificationSink>,
) {
    loop {
        match rx.recv().await {
            Ok(notification) => {
                if let Err(e) = sink.deliver(&notification).await {
                    metrics::counter!(crate::observability::NOTIFICATION_FAILURES_TOTAL,
                        "kind" => notification.kind())
                    .increment(1);
                    tracing::warn!(kind = notification.kind(), "{e}");
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                metrics::counter!(crate::observability::NOTIFICATION_FAILURES_TOTAL,
                    "kind" => "lagged")
                .increment(n);
                tracing::warn!("dispatcher lagged, dropped {n} notifications");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
