use chrono::Utc;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn, Span};

use crate::error::{DispatchError, PublishError};
use crate::messaging::{BrokerMessage, Publisher};
use crate::models::OutboxRecord;
use crate::outbox;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchOptions {
    pub batch_size: i64,
    pub max_retries: i32,
    pub retry: RetryPolicy,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            batch_size: 20,
            max_retries: 3,
            retry: RetryPolicy::default(),
        }
    }
}

/// Outcome of one dispatch tick.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    pub fetched: usize,
    pub published: usize,
    pub failed: usize,
    /// Failed records that reached the retry limit during this tick.
    pub exhausted: usize,
}

/// Publishes pending outbox records and writes their outcome back.
///
/// Owns the publisher, and with it the broker connection, for its whole
/// lifetime. Runs must not overlap; the scheduler guarantees that.
pub struct Dispatcher<P> {
    pool: PgPool,
    publisher: P,
    options: DispatchOptions,
}

impl<P: Publisher> Dispatcher<P> {
    pub fn new(pool: PgPool, publisher: P, options: DispatchOptions) -> Self {
        Self {
            pool,
            publisher,
            options,
        }
    }

    pub fn options(&self) -> &DispatchOptions {
        &self.options
    }

    /// Runs one tick: fetch a batch, publish each record, save all outcomes
    /// in one write.
    ///
    /// A record that fails to publish does not stop the rest of the batch.
    /// On cancellation no further records are attempted; outcomes already
    /// decided are still saved and then `DispatchError::Cancelled` is
    /// returned.
    #[instrument(skip_all, fields(messages_found = 0))]
    pub async fn dispatch(&mut self, cancel: &CancellationToken) -> Result<DispatchReport, DispatchError> {
        info!("Processing outbox messages...");

        let connected = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DispatchError::Cancelled),
            result = self.publisher.ensure_connected() => result,
        };
        if let Err(e) = connected {
            warn!("Broker unavailable at start of tick: {}", e);
        }

        let messages = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DispatchError::Cancelled),
            result = outbox::get_pending_messages(&self.pool, self.options.batch_size, self.options.max_retries) => result?,
        };

        let mut report = DispatchReport {
            fetched: messages.len(),
            ..Default::default()
        };
        if messages.is_empty() {
            debug!("No outbox messages to process");
            return Ok(report);
        }
        info!(messages_found = report.fetched, "Found outbox messages to process");
        Span::current().record("messages_found", report.fetched);

        let mut settled: Vec<OutboxRecord> = Vec::with_capacity(messages.len());
        let mut cancelled = false;
        for mut message in messages {
            match self.publish_with_retry(&message, cancel).await {
                Ok(()) => {
                    message.mark_processed(Utc::now());
                    report.published += 1;
                    info!(
                        message_id = %message.id,
                        event_type = %message.event_type,
                        "Successfully processed outbox message"
                    );
                }
                Err(PublishError::Cancelled) => {
                    cancelled = true;
                    break;
                }
                Err(e) => {
                    message.record_failure(&e.to_string());
                    report.failed += 1;
                    error!(
                        message_id = %message.id,
                        retry_count = message.retry_count,
                        "Failed to process outbox message: {}", e
                    );
                    if message.is_exhausted(self.options.max_retries) {
                        report.exhausted += 1;
                        error!(message_id = %message.id, "Outbox message exceeded max retries and will be skipped");
                    }
                }
            }
            settled.push(message);
        }

        outbox::save_message_states(&self.pool, &settled).await?;

        if cancelled {
            warn!(
                published = report.published,
                failed = report.failed,
                "Outbox processing cancelled; remaining messages left pending"
            );
            return Err(DispatchError::Cancelled);
        }

        info!(
            published = report.published,
            failed = report.failed,
            exhausted = report.exhausted,
            "Outbox processing completed"
        );
        Ok(report)
    }

    async fn publish_with_retry(&mut self, record: &OutboxRecord, cancel: &CancellationToken) -> Result<(), PublishError> {
        if cancel.is_cancelled() {
            return Err(PublishError::Cancelled);
        }
        let message = BrokerMessage::try_from(record)?;

        let mut attempt = 1;
        loop {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(PublishError::Cancelled),
                result = self.publisher.publish(&message) => result,
            };

            let error = match result {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= self.options.retry.max_attempts => return Err(e),
                Err(e) => e,
            };

            let delay = self.options.retry.backoff(attempt);
            warn!(
                message_id = %message.message_id,
                attempt,
                retry_delay_ms = delay.as_millis() as u64,
                "Retry attempt after publish failure: {}", error
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(PublishError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    /// Closes the broker connection.
    pub async fn close(&mut self) {
        self.publisher.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::testing::RecordingPublisher;
    use crate::outbox::test_support::seed_pending;
    use crate::outbox::{ensure_schema, get_message, get_pending_messages};

    fn options(batch_size: i64, max_retries: i32) -> DispatchOptions {
        DispatchOptions {
            batch_size,
            max_retries,
            retry: RetryPolicy::immediate(3),
        }
    }

    async fn setup(pool: &PgPool) {
        ensure_schema(pool).await.expect("Failed to create schema");
    }

    #[sqlx::test(migrations = false)]
    async fn test_dispatch_publishes_and_marks_processed(pool: PgPool) {
        setup(&pool).await;
        let seeded = seed_pending(&pool, 1).await;
        let broker = RecordingPublisher::new();
        let mut dispatcher = Dispatcher::new(pool.clone(), broker.clone(), options(20, 3));

        let report = dispatcher.dispatch(&CancellationToken::new()).await.unwrap();

        assert_eq!(report, DispatchReport { fetched: 1, published: 1, failed: 0, exhausted: 0 });
        let stored = get_message(&pool, seeded[0].id).await.unwrap().unwrap();
        assert!(stored.processed_on_utc.is_some(), "Message was not marked as processed");

        let published = broker.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].message_id, seeded[0].id);
        assert_eq!(published[0].routing_key, "proposal.submitted");
        assert_eq!(published[0].event_type, "ProposalSubmittedEvent");
        assert_eq!(published[0].body, stored.content.as_bytes());
    }

    #[sqlx::test(migrations = false)]
    async fn test_dispatch_with_no_messages(pool: PgPool) {
        setup(&pool).await;
        let broker = RecordingPublisher::new();
        let mut dispatcher = Dispatcher::new(pool.clone(), broker.clone(), options(20, 3));

        let report = dispatcher.dispatch(&CancellationToken::new()).await.unwrap();

        assert_eq!(report, DispatchReport::default());
        assert_eq!(broker.attempts(), 0);
        assert_eq!(broker.connects(), 1, "Connection should still be checked");
    }

    #[sqlx::test(migrations = false)]
    async fn test_processed_messages_are_never_redelivered(pool: PgPool) {
        setup(&pool).await;
        seed_pending(&pool, 2).await;
        let broker = RecordingPublisher::new();
        let mut dispatcher = Dispatcher::new(pool.clone(), broker.clone(), options(20, 3));

        dispatcher.dispatch(&CancellationToken::new()).await.unwrap();
        let second = dispatcher.dispatch(&CancellationToken::new()).await.unwrap();

        assert_eq!(second.fetched, 0);
        assert_eq!(broker.published().len(), 2);
    }

    #[sqlx::test(migrations = false)]
    async fn test_one_tick_is_bounded_by_batch_size(pool: PgPool) {
        setup(&pool).await;
        let seeded = seed_pending(&pool, 45).await;
        let broker = RecordingPublisher::new();
        let mut dispatcher = Dispatcher::new(pool.clone(), broker.clone(), options(20, 3));

        let report = dispatcher.dispatch(&CancellationToken::new()).await.unwrap();

        assert_eq!(report.published, 20);
        assert_eq!(get_pending_messages(&pool, 100, 3).await.unwrap().len(), 25);

        let published: Vec<_> = broker.published().iter().map(|m| m.message_id).collect();
        let oldest: Vec<_> = seeded.iter().take(20).map(|m| m.id).collect();
        assert_eq!(published, oldest, "Batch must be published oldest first");
    }

    #[sqlx::test(migrations = false)]
    async fn test_failure_is_isolated_per_record(pool: PgPool) {
        setup(&pool).await;
        let seeded = seed_pending(&pool, 3).await;
        let broker = RecordingPublisher::new();
        broker.reject(seeded[0].id);
        let mut dispatcher = Dispatcher::new(pool.clone(), broker.clone(), options(20, 3));

        let report = dispatcher.dispatch(&CancellationToken::new()).await.unwrap();

        assert_eq!(report.published, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(broker.attempts(), 3 + 2, "Failing record gets all in-tick attempts");

        let failed = get_message(&pool, seeded[0].id).await.unwrap().unwrap();
        assert_eq!(failed.retry_count, 1);
        assert_eq!(failed.processed_on_utc, None);
        assert!(failed.error.unwrap().contains("did not acknowledge"));

        for record in &seeded[1..] {
            let stored = get_message(&pool, record.id).await.unwrap().unwrap();
            assert!(stored.processed_on_utc.is_some());
        }
    }

    #[sqlx::test(migrations = false)]
    async fn test_retry_count_is_capped_at_max_retries(pool: PgPool) {
        setup(&pool).await;
        let seeded = seed_pending(&pool, 1).await;
        let broker = RecordingPublisher::new();
        broker.set_reachable(false);
        let mut dispatcher = Dispatcher::new(pool.clone(), broker.clone(), options(20, 3));

        let mut exhausted = 0;
        for _ in 0..5 {
            exhausted += dispatcher.dispatch(&CancellationToken::new()).await.unwrap().exhausted;
        }

        let stored = get_message(&pool, seeded[0].id).await.unwrap().unwrap();
        assert_eq!(stored.retry_count, 3);
        assert_eq!(exhausted, 1);
        assert!(stored.error.is_some());
        assert!(get_pending_messages(&pool, 20, 3).await.unwrap().is_empty());
        assert_eq!(broker.attempts(), 3 * 3, "Exhausted record must not be attempted again");
    }

    #[sqlx::test(migrations = false)]
    async fn test_delivery_after_broker_recovers(pool: PgPool) {
        setup(&pool).await;
        let seeded = seed_pending(&pool, 1).await;
        let broker = RecordingPublisher::new();
        broker.set_reachable(false);
        let mut dispatcher = Dispatcher::new(pool.clone(), broker.clone(), options(20, 5));

        for tick in 1..=3 {
            dispatcher.dispatch(&CancellationToken::new()).await.unwrap();
            let stored = get_message(&pool, seeded[0].id).await.unwrap().unwrap();
            assert_eq!(stored.retry_count, tick);
            assert_eq!(stored.processed_on_utc, None);
        }

        broker.set_reachable(true);
        let report = dispatcher.dispatch(&CancellationToken::new()).await.unwrap();

        assert_eq!(report.published, 1);
        let stored = get_message(&pool, seeded[0].id).await.unwrap().unwrap();
        assert_eq!(stored.retry_count, 3);
        assert!(stored.processed_on_utc.is_some());
        assert_eq!(broker.published().len(), 1);
    }

    #[sqlx::test(migrations = false)]
    async fn test_unroutable_event_type_counts_as_failure(pool: PgPool) {
        setup(&pool).await;
        let record = OutboxRecord::new("Event", "{}", Utc::now());
        let mut conn = pool.acquire().await.unwrap();
        outbox::insert_messages(&mut conn, std::slice::from_ref(&record)).await.unwrap();
        drop(conn);

        let broker = RecordingPublisher::new();
        let mut dispatcher = Dispatcher::new(pool.clone(), broker.clone(), options(20, 3));
        let report = dispatcher.dispatch(&CancellationToken::new()).await.unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(broker.attempts(), 0, "Nothing is sent without a routing key");
        let stored = get_message(&pool, record.id).await.unwrap().unwrap();
        assert_eq!(stored.retry_count, 1);
        assert!(stored.error.unwrap().contains("routing key"));
    }

    #[sqlx::test(migrations = false)]
    async fn test_cancelled_tick_leaves_records_untouched(pool: PgPool) {
        setup(&pool).await;
        seed_pending(&pool, 3).await;
        let broker = RecordingPublisher::new();
        let mut dispatcher = Dispatcher::new(pool.clone(), broker.clone(), options(20, 3));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = dispatcher.dispatch(&cancel).await;

        assert!(matches!(result, Err(DispatchError::Cancelled)));
        assert_eq!(broker.attempts(), 0);
        let pending = get_pending_messages(&pool, 20, 3).await.unwrap();
        assert_eq!(pending.len(), 3);
        assert!(pending.iter().all(|m| m.retry_count == 0 && m.error.is_none()));
    }

    #[sqlx::test(migrations = false)]
    async fn test_cancel_mid_batch_keeps_progress_and_leaves_rest_pending(pool: PgPool) {
        setup(&pool).await;
        let seeded = seed_pending(&pool, 3).await;
        let broker = RecordingPublisher::new();
        let cancel = CancellationToken::new();
        broker.cancel_after_publish(cancel.clone());
        let mut dispatcher = Dispatcher::new(pool.clone(), broker.clone(), options(20, 3));

        let result = dispatcher.dispatch(&cancel).await;

        assert!(matches!(result, Err(DispatchError::Cancelled)));
        assert_eq!(broker.attempts(), 1, "No record is attempted after cancellation");
        let first = get_message(&pool, seeded[0].id).await.unwrap().unwrap();
        assert!(first.processed_on_utc.is_some(), "The published record must be saved as processed");

        let pending = get_pending_messages(&pool, 20, 3).await.unwrap();
        let ids: Vec<_> = pending.iter().map(|m| m.id).collect();
        assert_eq!(ids, [seeded[1].id, seeded[2].id]);
        assert!(pending.iter().all(|m| m.retry_count == 0 && m.error.is_none()));
    }

    #[sqlx::test(migrations = false)]
    async fn test_store_errors_end_the_tick(pool: PgPool) {
        // No schema: the pending scan fails.
        let broker = RecordingPublisher::new();
        let mut dispatcher = Dispatcher::new(pool.clone(), broker.clone(), options(20, 3));

        let result = dispatcher.dispatch(&CancellationToken::new()).await;

        assert!(matches!(result, Err(DispatchError::Database(_))));
        assert_eq!(broker.attempts(), 0);
    }
}
