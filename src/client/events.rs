//! Typed transport events and the listener registry.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kameo::Reply;

use crate::core::InboundMessage;

/// Everything the transport reports to its listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The socket opened; the reconnect counter is back at zero.
    Connected,
    /// A classified inbound data frame.
    Message(InboundMessage),
    /// A reconnect has been scheduled after an abnormal close or failed attempt.
    Reconnecting { attempt: u32, delay: Duration },
    /// Final: no further attempts will be made without another `connect()`.
    Disconnected { reason: String, exhausted: bool },
    Error(TransportErrorEvent),
}

impl TransportEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            TransportEvent::Connected => EventKind::Connected,
            TransportEvent::Message(_) => EventKind::Message,
            TransportEvent::Reconnecting { .. } => EventKind::Reconnecting,
            TransportEvent::Disconnected { .. } => EventKind::Disconnected,
            TransportEvent::Error(_) => EventKind::Error,
        }
    }

    pub(crate) fn error(content: impl Into<String>) -> Self {
        TransportEvent::Error(TransportErrorEvent {
            content: content.into(),
            timestamp: Utc::now(),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransportErrorEvent {
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connected,
    Message,
    Reconnecting,
    Disconnected,
    Error,
}

/// Receiver of transport events.
///
/// Listeners run inside the transport actor: they must not block and must not wait on the
/// transport (forward to a channel instead).
pub trait EventListener: Send + Sync + 'static {
    fn on_event(&self, event: &TransportEvent);
}

impl<F> EventListener for F
where
    F: Fn(&TransportEvent) + Send + Sync + 'static,
{
    fn on_event(&self, event: &TransportEvent) {
        self(event)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Reply)]
pub struct ListenerId(u64);

struct Registration {
    id: ListenerId,
    kind: EventKind,
    listener: Arc<dyn EventListener>,
}

/// Ordered listener registry keyed by event kind.
#[derive(Default)]
pub struct ListenerRegistry {
    next_id: u64,
    registrations: Vec<Registration>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, kind: EventKind, listener: Arc<dyn EventListener>) -> ListenerId {
        self.next_id = self.next_id.wrapping_add(1);
        let id = ListenerId(self.next_id);
        self.registrations.push(Registration { id, kind, listener });
        id
    }

    pub fn remove(&mut self, id: ListenerId) -> bool {
        let before = self.registrations.len();
        self.registrations.retain(|reg| reg.id != id);
        self.registrations.len() != before
    }

    pub fn clear(&mut self) {
        self.registrations.clear();
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Invoke every listener registered for the event's kind, in registration order.
    pub fn emit(&self, event: &TransportEvent) -> usize {
        let kind = event.kind();
        let mut delivered = 0;
        for reg in self.registrations.iter().filter(|reg| reg.kind == kind) {
            reg.listener.on_event(event);
            delivered += 1;
        }
        delivered
    }
}
