//! Transactional outbox for domain events.
//!
//! Business code saves aggregates through [`capture::save_changes_with_outbox`],
//! which stores each raised [`events::DomainEvent`] as an outbox record in the
//! same transaction. The dispatcher service then publishes pending records to
//! a RabbitMQ topic exchange on a fixed schedule.

pub mod capture;
pub mod clients;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod messaging;
pub mod models;
pub mod outbox;
pub mod retry;
pub mod scheduler;

pub use capture::{capture_domain_events, save_changes_with_outbox, Aggregate};
pub use dispatcher::{DispatchOptions, DispatchReport, Dispatcher};
pub use error::{CaptureError, DispatchError, PublishError};
pub use events::{DomainEvent, DomainEvents, HasDomainEvents};
pub use messaging::{routing_key, AmqpPublisher, BrokerMessage, BrokerSettings, Publisher};
pub use models::OutboxRecord;
