use super::{RemovalRequest, RemovalStore, delete_on_panel, forget_unresolved, refresh_space};
use crate::panel::PanelConnector;
use async_nats::jetstream::AckKind;
use async_nats::jetstream::consumer::PullConsumer;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Что сделать с сообщением после обработки.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Nak(Duration),
    /// Сообщение никогда не будет обработано успешно.
    Term,
}

impl From<Disposition> for AckKind {
    fn from(disposition: Disposition) -> Self {
        match disposition {
            Disposition::Ack => AckKind::Ack,
            Disposition::Nak(delay) => AckKind::Nak(Some(delay)),
            Disposition::Term => AckKind::Term,
        }
    }
}

/// Воркер очереди удаления: забирает по одному сообщению и повторяет удаление.
pub struct RemovalWorker {
    store: Arc<dyn RemovalStore>,
    connector: Arc<dyn PanelConnector>,
    redelivery_delay: Duration,
    max_deliver: i64,
}

impl RemovalWorker {
    pub fn new(
        store: Arc<dyn RemovalStore>,
        connector: Arc<dyn PanelConnector>,
        redelivery_delay: Duration,
        max_deliver: i64,
    ) -> Self {
        Self {
            store,
            connector,
            redelivery_delay,
            max_deliver,
        }
    }

    pub async fn run(
        mut self,
        consumer: PullConsumer,
        fetch_timeout: Duration,
        shutdown: CancellationToken,
    ) -> anyhow::Result<()> {
        // Существующий durable возвращается брокером без изменений, поэтому
        // последняя доставка определяется по его настройке, а не по конфигу.
        self.max_deliver =
            effective_max_deliver(self.max_deliver, consumer.cached_info().config.max_deliver);
        tracing::info!(
            max_deliver = self.max_deliver,
            redelivery_delay_secs = self.redelivery_delay.as_secs(),
            "Remove key consumer started"
        );
        loop {
            let batch = tokio::select! {
                _ = shutdown.cancelled() => break,
                batch = consumer.fetch().max_messages(1).expires(fetch_timeout).messages() => batch,
            };
            let mut batch = match batch {
                Ok(batch) => batch,
                Err(error) => {
                    tracing::warn!(error = %error, "Fetch from removal stream failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(fetch_timeout) => continue,
                    }
                }
            };

            // пустой батч после expires — обычный таймаут опроса
            while let Some(message) = batch.next().await {
                let message = match message {
                    Ok(message) => message,
                    Err(error) => {
                        tracing::warn!(error = %error, "Broken message in removal batch");
                        continue;
                    }
                };
                let delivered = message.info().map(|info| info.delivered).unwrap_or(1);
                let disposition = self.handle_payload(&message.payload, delivered).await;
                if let Err(error) = message.ack_with(disposition.into()).await {
                    tracing::warn!(error = %error, ?disposition, "Failed to acknowledge removal message");
                }
            }
        }
        tracing::info!("Remove key consumer stopped");
        Ok(())
    }

    pub async fn handle_payload(&self, payload: &[u8], delivered: i64) -> Disposition {
        match RemovalRequest::from_payload(payload) {
            Ok(request) => self.process(&request, delivered).await,
            Err(error) => {
                tracing::warn!(
                    error = %error,
                    payload = %String::from_utf8_lossy(payload),
                    "Dropping malformed removal message"
                );
                Disposition::Term
            }
        }
    }

    pub async fn process(&self, request: &RemovalRequest, delivered: i64) -> Disposition {
        let server = match self.store.resolve_server(request.server_id).await {
            Ok(Some(server)) => server,
            Ok(None) => {
                tracing::info!(
                    name_key = %request.name_key,
                    key_id = request.key_id,
                    server_id = request.server_id,
                    "Server for queued removal not found, dropping"
                );
                return Disposition::Ack;
            }
            Err(error) => {
                tracing::error!(
                    error = %error,
                    server_id = request.server_id,
                    delivered,
                    "Failed to resolve server for queued removal"
                );
                if self.attempts_exhausted(delivered) {
                    self.record_exhausted(request, delivered).await;
                }
                return Disposition::Nak(self.redelivery_delay);
            }
        };

        match delete_on_panel(self.connector.as_ref(), &server, request).await {
            Ok(panel) => {
                tracing::info!(
                    name_key = %request.name_key,
                    key_id = request.key_id,
                    server_id = server.id,
                    delivered,
                    "Key deleted from server by queue"
                );
                forget_unresolved(self.store.as_ref(), request).await;
                refresh_space(self.store.as_ref(), &*panel, server.id).await;
                Disposition::Ack
            }
            Err(error) if self.attempts_exhausted(delivered) => {
                tracing::error!(error = %error, server_id = server.id, "Queued removal failed");
                self.record_exhausted(request, delivered).await;
                Disposition::Nak(self.redelivery_delay)
            }
            Err(error) => {
                tracing::error!(
                    error = %error,
                    name_key = %request.name_key,
                    key_id = request.key_id,
                    server_id = server.id,
                    delivered,
                    next_attempt_secs = self.redelivery_delay.as_secs(),
                    "Queued removal failed"
                );
                Disposition::Nak(self.redelivery_delay)
            }
        }
    }

    fn attempts_exhausted(&self, delivered: i64) -> bool {
        delivered >= self.max_deliver
    }

    async fn record_exhausted(&self, request: &RemovalRequest, delivered: i64) {
        tracing::error!(
            name_key = %request.name_key,
            key_id = request.key_id,
            server_id = request.server_id,
            delivered,
            max_deliver = self.max_deliver,
            "Removal attempts exhausted, leaving for manual reconciliation"
        );
        if let Err(error) = self.store.record_unresolved(request).await {
            tracing::error!(error = %error, "Failed to record unresolved deletion");
        }
    }
}

/// Лимит доставок брокера; при неограниченном (`-1`/`0`) остаётся значение из конфига.
fn effective_max_deliver(configured: i64, broker: i64) -> i64 {
    if broker <= 0 {
        tracing::warn!(
            configured,
            "Consumer has unlimited max_deliver, using configured value for exhaustion"
        );
        return configured;
    }
    if broker != configured {
        tracing::warn!(
            configured,
            broker,
            "Consumer max_deliver differs from config, following the broker"
        );
    }
    broker
}
