use crate::config::Config;
use crate::messaging::AmqpPublisher;
use sqlx::{postgres::PgPoolOptions, PgPool};

/// Creates and returns a new database connection pool.
pub async fn setup_db_pool(config: &Config) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .connect(&config.database_url)
        .await
}

/// Creates the broker publisher. No connection is opened until first use.
pub fn setup_publisher(config: &Config) -> AmqpPublisher {
    AmqpPublisher::new(config.broker_settings())
}
