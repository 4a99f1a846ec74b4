//! Notification events and sinks.
//!
//! The engine emits structured events; delivery (chat, email) belongs to
//! whoever consumes them.

use gridbot_core::{BotId, ClientOrderId};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Event emitted to the notification collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BotEvent {
    BotStopped {
        bot_id: BotId,
        reason: String,
    },
    CircuitBreakerTriggered {
        bot_id: BotId,
        kind: String,
        detail: String,
    },
    OrderError {
        bot_id: BotId,
        order_id: ClientOrderId,
        detail: String,
    },
    ReconciliationConflict {
        bot_id: BotId,
        order_id: ClientOrderId,
        detail: String,
    },
}

impl BotEvent {
    pub fn bot_id(&self) -> BotId {
        match self {
            Self::BotStopped { bot_id, .. }
            | Self::CircuitBreakerTriggered { bot_id, .. }
            | Self::OrderError { bot_id, .. }
            | Self::ReconciliationConflict { bot_id, .. } => *bot_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::BotStopped { .. } => "bot_stopped",
            Self::CircuitBreakerTriggered { .. } => "circuit_breaker_triggered",
            Self::OrderError { .. } => "order_error",
            Self::ReconciliationConflict { .. } => "reconciliation_conflict",
        }
    }
}

/// Receives engine events. Must not block.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, event: BotEvent);
}

/// Drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullNotifier;

impl NotificationSink for NullNotifier {
    fn notify(&self, _event: BotEvent) {}
}

/// Writes events to the tracing log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl NotificationSink for LogNotifier {
    fn notify(&self, event: BotEvent) {
        let bot_id = event.bot_id();
        match &event {
            BotEvent::BotStopped { reason, .. } => {
                info!(%bot_id, event = event.name(), %reason, "Bot stopped");
            }
            BotEvent::CircuitBreakerTriggered { kind, detail, .. } => {
                error!(%bot_id, event = event.name(), %kind, %detail, "Circuit breaker triggered");
            }
            BotEvent::OrderError {
                order_id, detail, ..
            } => {
                warn!(%bot_id, event = event.name(), %order_id, %detail, "Order error");
            }
            BotEvent::ReconciliationConflict {
                order_id, detail, ..
            } => {
                warn!(%bot_id, event = event.name(), %order_id, %detail, "Reconciliation conflict");
            }
        }
    }
}

/// Forwards events to an unbounded channel for an external consumer.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<BotEvent>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<BotEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl NotificationSink for ChannelNotifier {
    fn notify(&self, event: BotEvent) {
        if self.tx.send(event).is_err() {
            warn!("Notification receiver dropped");
        }
    }
}
