//! Поток и durable pull-консьюмер очереди удаления.

use crate::config::Config;
use async_nats::jetstream::{self, consumer, stream};
use std::time::Duration;

const STREAM_MAX_BYTES: i64 = 300 * 1024 * 1024;
const STREAM_MAX_MESSAGE_SIZE: i32 = 10 * 1024 * 1024;
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

pub async fn connect_nats(
    servers: &[String],
) -> Result<(async_nats::Client, jetstream::Context), anyhow::Error> {
    let client = async_nats::ConnectOptions::new()
        .name("keypurge")
        .retry_on_initial_connect()
        .reconnect_delay_callback(|_attempts| RECONNECT_DELAY)
        .connect(servers)
        .await
        .map_err(|e| anyhow::anyhow!("Не удалось подключиться к NATS {:?}: {}", servers, e))?;
    let js = jetstream::new(client.clone());
    Ok((client, js))
}

#[derive(Debug, Clone)]
pub struct QueueTopology {
    pub stream: String,
    pub subject: String,
    pub durable_name: String,
    pub ack_wait: Duration,
    pub max_deliver: i64,
}

impl QueueTopology {
    pub fn from_config(config: &Config) -> Self {
        Self {
            stream: config.remove_stream.clone(),
            subject: config.remove_subject.clone(),
            durable_name: config.remove_durable_name.clone(),
            ack_wait: config.ack_wait(),
            max_deliver: config.max_deliver,
        }
    }

    pub fn stream_config(&self) -> stream::Config {
        stream::Config {
            name: self.stream.clone(),
            subjects: vec![self.subject.clone()],
            retention: stream::RetentionPolicy::Limits,
            storage: stream::StorageType::File,
            max_bytes: STREAM_MAX_BYTES,
            max_message_size: STREAM_MAX_MESSAGE_SIZE,
            allow_direct: true,
            ..Default::default()
        }
    }

    pub fn consumer_config(&self) -> consumer::pull::Config {
        consumer::pull::Config {
            durable_name: Some(self.durable_name.clone()),
            filter_subject: self.subject.clone(),
            ack_policy: consumer::AckPolicy::Explicit,
            ack_wait: self.ack_wait,
            max_deliver: self.max_deliver,
            ..Default::default()
        }
    }

    /// Создаёт поток и консьюмер, если их ещё нет.
    pub async fn ensure(&self, js: &jetstream::Context) -> Result<consumer::PullConsumer, anyhow::Error> {
        let stream = js
            .get_or_create_stream(self.stream_config())
            .await
            .map_err(|e| anyhow::anyhow!("Поток {}: {}", self.stream, e))?;
        let consumer = stream
            .get_or_create_consumer(&self.durable_name, self.consumer_config())
            .await
            .map_err(|e| anyhow::anyhow!("Консьюмер {}: {}", self.durable_name, e))?;
        tracing::info!(
            stream = %self.stream,
            subject = %self.subject,
            durable = %self.durable_name,
            ack_wait_secs = self.ack_wait.as_secs(),
            max_deliver = self.max_deliver,
            "Removal queue topology ready"
        );
        Ok(consumer)
    }
}
