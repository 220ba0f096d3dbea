use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

/// Longest failure description kept in `error`; matches the column width.
pub const MAX_ERROR_LENGTH: usize = 2000;

/// One domain event awaiting (or done with) publication.
///
/// `processed_on_utc` is set once, when a publish succeeds; a processed record
/// is terminal. A record whose `retry_count` reached the retry limit stays in
/// the table but is never selected again.
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct OutboxRecord {
    pub id: Uuid,
    pub event_type: String,
    pub content: String,
    pub occurred_on_utc: DateTime<Utc>,
    pub processed_on_utc: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub retry_count: i32,
}

impl OutboxRecord {
    pub fn new(event_type: impl Into<String>, content: impl Into<String>, occurred_on_utc: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            content: content.into(),
            occurred_on_utc,
            processed_on_utc: None,
            error: None,
            retry_count: 0,
        }
    }

    pub fn is_processed(&self) -> bool {
        self.processed_on_utc.is_some()
    }

    pub fn is_exhausted(&self, max_retries: i32) -> bool {
        self.retry_count >= max_retries
    }

    /// Whether the pending scan would select this record.
    pub fn is_pending(&self, max_retries: i32) -> bool {
        !self.is_processed() && !self.is_exhausted(max_retries)
    }

    pub fn mark_processed(&mut self, at: DateTime<Utc>) {
        if self.processed_on_utc.is_none() {
            self.processed_on_utc = Some(at);
        }
    }

    /// Counts a failed publish and overwrites the last error.
    pub fn record_failure(&mut self, error: &str) {
        self.retry_count += 1;
        self.error = Some(error.chars().take(MAX_ERROR_LENGTH).collect());
    }
}
