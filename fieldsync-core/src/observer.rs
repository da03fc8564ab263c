//! Observer registry. Each observer runs inside its own error boundary.

use std::panic::{self, AssertUnwindSafe};

use crate::hash::ContentHash;
use crate::identity::PeerId;
use crate::protocol::FieldCode;

/// Notification emitted by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A field changed. `peer` is the local id for local commits; `content: None` means cleared.
    FieldUpdated {
        peer: PeerId,
        code: FieldCode,
        content: Option<String>,
        hash: Option<ContentHash>,
    },
    MessageFullyReceived {
        peer: PeerId,
    },
    TransportError {
        peer: PeerId,
    },
    PeerFirstSeen {
        peer: PeerId,
    },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::FieldUpdated { .. } => EventKind::FieldUpdated,
            Event::MessageFullyReceived { .. } => EventKind::MessageFullyReceived,
            Event::TransportError { .. } => EventKind::TransportError,
            Event::PeerFirstSeen { .. } => EventKind::PeerFirstSeen,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    FieldUpdated,
    MessageFullyReceived,
    TransportError,
    PeerFirstSeen,
}

pub type Observer = Box<dyn FnMut(&Event) -> anyhow::Result<()> + Send>;

#[derive(Default)]
pub struct Observers {
    entries: Vec<(EventKind, Observer)>,
}

impl Observers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, kind: EventKind, observer: F)
    where
        F: FnMut(&Event) -> anyhow::Result<()> + Send + 'static,
    {
        self.entries.push((kind, Box::new(observer)));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Deliver to every observer of this kind. Returns how many failed.
    pub fn emit(&mut self, event: &Event) -> usize {
        let kind = event.kind();
        let mut failures = 0;
        for (k, observer) in self.entries.iter_mut() {
            if *k != kind {
                continue;
            }
            match panic::catch_unwind(AssertUnwindSafe(|| observer(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failures += 1;
                    tracing::warn!(event = ?kind, error = %e, "observer failed");
                }
                Err(_) => {
                    failures += 1;
                    tracing::warn!(event = ?kind, "observer panicked");
                }
            }
        }
        failures
    }
}
