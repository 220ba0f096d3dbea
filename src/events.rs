//! Domain events raised by aggregates and held until the aggregate is saved.

use std::fmt;

use serde::Serialize;

/// A fact raised by an aggregate during a state change.
///
/// The logical type name defaults to the full Rust path of the event type,
/// e.g. `research::events::ProposalSubmittedEvent`. The routing key is
/// derived from its last segment.
pub trait DomainEvent: Serialize + Send + Sync + 'static {
    fn event_type() -> &'static str {
        std::any::type_name::<Self>()
    }
}

trait RaisedEvent: Send + Sync {
    fn type_name(&self) -> &'static str;
    fn to_json(&self) -> serde_json::Result<String>;
}

impl<E: DomainEvent> RaisedEvent for E {
    fn type_name(&self) -> &'static str {
        E::event_type()
    }

    fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Events an aggregate has raised and not yet handed to the outbox.
#[derive(Default)]
pub struct DomainEvents {
    events: Vec<Box<dyn RaisedEvent>>,
}

impl DomainEvents {
    pub fn raise<E: DomainEvent>(&mut self, event: E) {
        self.events.push(Box::new(event));
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn event_types(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.events.iter().map(|e| e.type_name())
    }

    /// Serializes every pending event as `(event_type, json)`, in raise order.
    pub fn serialize_all(&self) -> Result<Vec<(&'static str, String)>, (&'static str, serde_json::Error)> {
        self.events
            .iter()
            .map(|e| e.to_json().map(|json| (e.type_name(), json)).map_err(|err| (e.type_name(), err)))
            .collect()
    }
}

impl fmt::Debug for DomainEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.event_types()).finish()
    }
}

/// Implemented by aggregates that raise domain events.
pub trait HasDomainEvents {
    fn domain_events(&self) -> &DomainEvents;
    fn domain_events_mut(&mut self) -> &mut DomainEvents;
}
