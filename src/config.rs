use std::time::Duration;

use serde::Deserialize;

use crate::dispatcher::DispatchOptions;
use crate::messaging::BrokerSettings;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database_url: String,
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,
    #[serde(default = "default_true")]
    pub apply_schema: bool,
    #[serde(default = "default_dispatch_interval")]
    pub dispatch_interval_ms: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: i64,
    #[serde(default = "default_max_retries")]
    pub max_retries: i32,
    #[serde(default = "default_publish_attempts")]
    pub publish_attempts: u32,
    #[serde(default = "default_publish_base_delay")]
    pub publish_base_delay_ms: u64,
    #[serde(default = "default_publish_max_delay")]
    pub publish_max_delay_ms: u64,
    #[serde(default = "default_rabbitmq_host")]
    pub rabbitmq_host: String,
    #[serde(default = "default_rabbitmq_port")]
    pub rabbitmq_port: u16,
    #[serde(default = "default_rabbitmq_credential")]
    pub rabbitmq_username: String,
    #[serde(default = "default_rabbitmq_credential")]
    pub rabbitmq_password: String,
    #[serde(default = "default_rabbitmq_virtual_host")]
    pub rabbitmq_virtual_host: String,
    #[serde(default = "default_rabbitmq_exchange")]
    pub rabbitmq_exchange: String,
    #[serde(default = "default_rabbitmq_exchange_type")]
    pub rabbitmq_exchange_type: String,
    #[serde(default = "default_health_port")]
    pub health_port: u16,
    pub sentry_dsn: Option<String>,
}

fn default_db_max_connections() -> u32 {
    5
}

fn default_true() -> bool {
    true
}

fn default_dispatch_interval() -> u64 {
    10_000 // Default to 10 seconds
}

fn default_batch_size() -> i64 {
    20
}

fn default_max_retries() -> i32 {
    3
}

fn default_publish_attempts() -> u32 {
    3
}

fn default_publish_base_delay() -> u64 {
    1_000
}

fn default_publish_max_delay() -> u64 {
    30_000
}

fn default_rabbitmq_host() -> String {
    "localhost".to_string()
}

fn default_rabbitmq_port() -> u16 {
    5672
}

fn default_rabbitmq_credential() -> String {
    "admin".to_string()
}

fn default_rabbitmq_virtual_host() -> String {
    "/".to_string()
}

fn default_rabbitmq_exchange() -> String {
    "arap.events".to_string()
}

fn default_rabbitmq_exchange_type() -> String {
    "topic".to_string()
}

fn default_health_port() -> u16 {
    8080
}

impl Config {
    pub fn load() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();

        envy::from_env::<Config>()
    }

    /// Builds a config from explicit key/value pairs instead of the process
    /// environment. Keys use the same upper-case names as the env vars.
    pub fn from_env_iter<I>(vars: I) -> Result<Self, envy::Error>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        envy::from_iter(vars)
    }

    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_millis(self.dispatch_interval_ms)
    }

    pub fn dispatch_options(&self) -> DispatchOptions {
        DispatchOptions {
            batch_size: self.batch_size,
            max_retries: self.max_retries,
            retry: RetryPolicy {
                max_attempts: self.publish_attempts,
                base_delay: Duration::from_millis(self.publish_base_delay_ms),
                max_delay: Duration::from_millis(self.publish_max_delay_ms),
                jitter: true,
            },
        }
    }

    pub fn broker_settings(&self) -> BrokerSettings {
        BrokerSettings {
            host: self.rabbitmq_host.clone(),
            port: self.rabbitmq_port,
            username: self.rabbitmq_username.clone(),
            password: self.rabbitmq_password.clone(),
            virtual_host: self.rabbitmq_virtual_host.clone(),
            exchange: self.rabbitmq_exchange.clone(),
            exchange_type: self.rabbitmq_exchange_type.clone(),
        }
    }
}
