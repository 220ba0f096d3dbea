use crate::models::OutboxRecord;
use sqlx::{query_as, PgConnection, PgPool};
use uuid::Uuid;

const SCHEMA_SQL: &str = include_str!("../schema.sql");

/// Creates the outbox schema, table and indexes if they are missing.
pub async fn ensure_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(SCHEMA_SQL).execute(pool).await?;
    Ok(())
}

/// Writes new outbox records.
///
/// This function must be called on the connection of the transaction that
/// also writes the business rows, so both commit or roll back together.
pub async fn insert_messages(
    conn: &mut PgConnection,
    records: &[OutboxRecord],
) -> Result<u64, sqlx::Error> {
    let mut inserted = 0;
    for record in records {
        inserted += sqlx::query(
            r#"
            INSERT INTO outbox.outbox_messages
                (id, event_type, content, occurred_on_utc, processed_on_utc, error, retry_count)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
            .bind(record.id)
            .bind(&record.event_type)
            .bind(&record.content)
            .bind(record.occurred_on_utc)
            .bind(record.processed_on_utc)
            .bind(&record.error)
            .bind(record.retry_count)
            .execute(&mut *conn)
            .await?
            .rows_affected();
    }

    Ok(inserted)
}

/// Fetches the oldest pending records: not processed and still under the
/// retry limit. Records with the same timestamp come back in insert order.
pub async fn get_pending_messages(
    pool: &PgPool,
    batch_size: i64,
    max_retries: i32,
) -> Result<Vec<OutboxRecord>, sqlx::Error> {
    let messages = query_as::<_, OutboxRecord>(
        r#"
        SELECT id, event_type, content, occurred_on_utc, processed_on_utc, error, retry_count
        FROM outbox.outbox_messages
        WHERE processed_on_utc IS NULL
            AND retry_count < $2
        ORDER BY occurred_on_utc, seq_no
        LIMIT $1
        "#,
    )
        .bind(batch_size)
        .bind(max_retries)
        .fetch_all(pool)
        .await?;

    Ok(messages)
}

/// Persists the state of every given record in a single transaction.
///
/// Either all updates land or none do, so a failed save leaves the store as
/// the next tick expects to find it.
pub async fn save_message_states(
    pool: &PgPool,
    records: &[OutboxRecord],
) -> Result<(), sqlx::Error> {
    if records.is_empty() {
        return Ok(());
    }

    let mut tx = pool.begin().await?;
    for record in records {
        sqlx::query(
            r#"
            UPDATE outbox.outbox_messages
            SET processed_on_utc = $2, error = $3, retry_count = $4
            WHERE id = $1
            "#,
        )
            .bind(record.id)
            .bind(record.processed_on_utc)
            .bind(&record.error)
            .bind(record.retry_count)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;

    Ok(())
}

pub async fn get_message(pool: &PgPool, id: Uuid) -> Result<Option<OutboxRecord>, sqlx::Error> {
    query_as::<_, OutboxRecord>(
        r#"
        SELECT id, event_type, content, occurred_on_utc, processed_on_utc, error, retry_count
        FROM outbox.outbox_messages
        WHERE id = $1
        "#,
    )
        .bind(id)
        .fetch_optional(pool)
        .await
}

/// Records that used up their retry budget and are no longer dispatched.
pub async fn get_exhausted_messages(
    pool: &PgPool,
    max_retries: i32,
    limit: i64,
) -> Result<Vec<OutboxRecord>, sqlx::Error> {
    query_as::<_, OutboxRecord>(
        r#"
        SELECT id, event_type, content, occurred_on_utc, processed_on_utc, error, retry_count
        FROM outbox.outbox_messages
        WHERE processed_on_utc IS NULL
            AND retry_count >= $1
        ORDER BY occurred_on_utc, seq_no
        LIMIT $2
        "#,
    )
        .bind(max_retries)
        .bind(limit)
        .fetch_all(pool)
        .await
}
