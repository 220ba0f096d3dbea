//! Writes the domain events of modified aggregates to the outbox in the same
//! transaction as the aggregates themselves.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgConnection, PgPool};
use tracing::{debug, instrument};

use crate::error::CaptureError;
use crate::events::{DomainEvents, HasDomainEvents};
use crate::models::OutboxRecord;
use crate::outbox;

/// An aggregate that knows how to write its own business rows.
#[async_trait]
pub trait Aggregate: HasDomainEvents + Send + Sync {
    /// Persists pending changes on `conn` and returns the rows affected.
    async fn save(&self, conn: &mut PgConnection) -> Result<u64, sqlx::Error>;
}

fn to_outbox_records(events: &DomainEvents) -> Result<Vec<OutboxRecord>, CaptureError> {
    let serialized = events
        .serialize_all()
        .map_err(|(event_type, source)| CaptureError::Serialization { event_type, source })?;

    Ok(serialized
        .into_iter()
        .map(|(event_type, content)| OutboxRecord::new(event_type, content, Utc::now()))
        .collect())
}

/// Saves every aggregate and its pending domain events in one transaction.
///
/// Returns the number of business rows affected. On any error the whole
/// transaction is rolled back and the aggregates keep their events, so a
/// retried save captures them again exactly once.
#[instrument(skip_all, fields(aggregates = aggregates.len(), events_captured = 0))]
pub async fn save_changes_with_outbox(
    pool: &PgPool,
    aggregates: &mut [&mut dyn Aggregate],
) -> Result<u64, CaptureError> {
    let mut tx = pool.begin().await?;

    let mut rows_affected = 0;
    let mut records = Vec::new();
    for aggregate in aggregates.iter() {
        rows_affected += aggregate.save(&mut tx).await?;
        records.extend(to_outbox_records(aggregate.domain_events())?);
    }

    outbox::insert_messages(&mut tx, &records).await?;
    tx.commit().await?;

    for aggregate in aggregates.iter_mut() {
        aggregate.domain_events_mut().clear();
    }

    tracing::Span::current().record("events_captured", records.len());
    debug!(rows_affected, events_captured = records.len(), "Saved aggregates with outbox");

    Ok(rows_affected)
}

/// Writes the pending events of `aggregates` on a connection whose
/// transaction the caller owns, then clears them from the aggregates.
///
/// The caller commits. If that commit fails the events are gone from the
/// aggregates as well as from the store.
pub async fn capture_domain_events(
    conn: &mut PgConnection,
    aggregates: &mut [&mut dyn HasDomainEvents],
) -> Result<usize, CaptureError> {
    let mut records = Vec::new();
    for aggregate in aggregates.iter() {
        records.extend(to_outbox_records(aggregate.domain_events())?);
    }

    outbox::insert_messages(conn, &records).await?;

    for aggregate in aggregates.iter_mut() {
        aggregate.domain_events_mut().clear();
    }

    debug!(events_captured = records.len(), "Captured domain events into outbox");
    Ok(records.len())
}
