use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lapin::options::{BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions};
use lapin::types::FieldTable;
use lapin::uri::{AMQPAuthority, AMQPUri, AMQPUserInfo};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::error::PublishError;
use crate::models::OutboxRecord;

pub const CONTENT_TYPE: &str = "application/json";

/// AMQP delivery mode for messages that survive a broker restart.
const PERSISTENT: u8 = 2;

/// Derives the topic routing key from an event type name.
///
/// Only the last `::`- or `.`-separated segment of the name is used. A
/// trailing `Event` is stripped and every inner uppercase letter starts a new
/// dot-separated word: `ProposalSubmittedEvent` becomes `proposal.submitted`.
/// Returns `None` when nothing is left, or when the name holds characters
/// that cannot appear in a type identifier (generic brackets, spaces).
pub fn routing_key(event_type: &str) -> Option<String> {
    let name = event_type.rsplit("::").next().unwrap_or(event_type);
    let name = name.rsplit('.').next().unwrap_or(name);
    let name = name.strip_suffix("Event").unwrap_or(name);

    if name.is_empty() || !name.chars().all(|c| c.is_alphanumeric() || c == '_') {
        return None;
    }

    let mut key = String::with_capacity(name.len() + 4);
    for (i, c) in name.chars().enumerate() {
        if i > 0 && c.is_uppercase() {
            key.push('.');
        }
        key.extend(c.to_lowercase());
    }
    Some(key)
}

/// What goes on the wire for one outbox record.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerMessage {
    pub message_id: Uuid,
    pub routing_key: String,
    pub event_type: String,
    pub occurred_at: DateTime<Utc>,
    pub body: Vec<u8>,
}

impl TryFrom<&OutboxRecord> for BrokerMessage {
    type Error = PublishError;

    fn try_from(record: &OutboxRecord) -> Result<Self, Self::Error> {
        let routing_key = routing_key(&record.event_type)
            .ok_or_else(|| PublishError::InvalidEventType(record.event_type.clone()))?;

        Ok(Self {
            message_id: record.id,
            routing_key,
            event_type: record.event_type.clone(),
            occurred_at: record.occurred_on_utc,
            body: record.content.as_bytes().to_vec(),
        })
    }
}

/// Sends outbox messages to a broker.
///
/// Implementations own their connection and reopen it lazily; callers never
/// touch it concurrently.
#[async_trait]
pub trait Publisher: Send {
    /// Opens the connection if it is not open already.
    async fn ensure_connected(&mut self) -> Result<(), PublishError>;

    /// Publishes one message. Returns once the broker has confirmed it.
    async fn publish(&mut self, message: &BrokerMessage) -> Result<(), PublishError>;

    /// Releases the connection.
    async fn close(&mut self) {}
}

#[derive(Clone)]
pub struct BrokerSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub virtual_host: String,
    pub exchange: String,
    pub exchange_type: String,
}

impl BrokerSettings {
    pub fn uri(&self) -> AMQPUri {
        AMQPUri {
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: self.username.clone(),
                    password: self.password.clone(),
                },
                host: self.host.clone(),
                port: self.port,
            },
            vhost: self.virtual_host.clone(),
            ..Default::default()
        }
    }

    pub fn exchange_kind(&self) -> ExchangeKind {
        match self.exchange_type.to_ascii_lowercase().as_str() {
            "topic" => ExchangeKind::Topic,
            "direct" => ExchangeKind::Direct,
            "fanout" => ExchangeKind::Fanout,
            "headers" => ExchangeKind::Headers,
            _ => ExchangeKind::Custom(self.exchange_type.clone()),
        }
    }
}

impl fmt::Debug for BrokerSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("virtual_host", &self.virtual_host)
            .field("exchange", &self.exchange)
            .field("exchange_type", &self.exchange_type)
            .finish()
    }
}

/// Runs lapin's I/O and background tasks on the current tokio runtime.
fn connection_properties() -> ConnectionProperties {
    ConnectionProperties::default()
        .with_executor(tokio_executor_trait::Tokio::current())
        .with_reactor(tokio_reactor_trait::Tokio)
}

/// RabbitMQ publisher holding one connection and one confirm-mode channel.
pub struct AmqpPublisher {
    settings: BrokerSettings,
    connection: Option<Connection>,
    channel: Option<Channel>,
}

impl AmqpPublisher {
    pub fn new(settings: BrokerSettings) -> Self {
        Self {
            settings,
            connection: None,
            channel: None,
        }
    }

    fn is_open(&self) -> bool {
        self.channel
            .as_ref()
            .is_some_and(|channel| channel.status().connected())
    }

    /// Returns the open channel, reconnecting first if it was closed.
    async fn open_channel(&mut self) -> Result<Channel, PublishError> {
        if !self.is_open() {
            self.connect().await?;
        }
        self.channel.clone().ok_or(PublishError::ChannelClosed)
    }

    #[instrument(skip_all, fields(host = %self.settings.host, port = self.settings.port))]
    async fn connect(&mut self) -> Result<(), PublishError> {
        self.close().await;

        info!(
            user = %self.settings.username,
            vhost = %self.settings.virtual_host,
            "Attempting RabbitMQ connection"
        );

        let connection = Connection::connect_uri(self.settings.uri(), connection_properties())
            .await
            .inspect_err(|e| error!("Failed to establish RabbitMQ connection: {}", e))?;
        let channel = connection.create_channel().await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        channel
            .exchange_declare(
                &self.settings.exchange,
                self.settings.exchange_kind(),
                ExchangeDeclareOptions {
                    durable: true,
                    auto_delete: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        info!(exchange = %self.settings.exchange, "RabbitMQ connection established");
        self.connection = Some(connection);
        self.channel = Some(channel);
        Ok(())
    }
}

#[async_trait]
impl Publisher for AmqpPublisher {
    async fn ensure_connected(&mut self) -> Result<(), PublishError> {
        self.open_channel().await.map(|_| ())
    }

    #[instrument(skip_all, fields(message_id = %message.message_id, routing_key = %message.routing_key))]
    async fn publish(&mut self, message: &BrokerMessage) -> Result<(), PublishError> {
        let channel = self.open_channel().await?;

        let properties = BasicProperties::default()
            .with_delivery_mode(PERSISTENT)
            .with_message_id(message.message_id.to_string().into())
            .with_timestamp(u64::try_from(message.occurred_at.timestamp()).unwrap_or_default())
            .with_content_type(CONTENT_TYPE.into())
            .with_type(message.event_type.clone().into());

        let confirmation = channel
            .basic_publish(
                &self.settings.exchange,
                &message.routing_key,
                BasicPublishOptions::default(),
                &message.body,
                properties,
            )
            .await?
            .await?;

        if confirmation.is_nack() {
            return Err(PublishError::Nacked(message.message_id));
        }

        debug!(
            event_type = %message.event_type,
            exchange = %self.settings.exchange,
            "Published message"
        );
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(channel) = self.channel.take() {
            if channel.status().connected() {
                if let Err(e) = channel.close(200, "closing").await {
                    warn!("Failed to close RabbitMQ channel: {}", e);
                }
            }
        }
        if let Some(connection) = self.connection.take() {
            if connection.status().connected() {
                if let Err(e) = connection.close(200, "closing").await {
                    warn!("Failed to close RabbitMQ connection: {}", e);
                }
            }
        }
    }
}
