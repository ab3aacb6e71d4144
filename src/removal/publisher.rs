use super::direct::try_direct_delete;
use super::{RemovalRequest, RemovalStore};
use crate::panel::PanelConnector;
use async_nats::jetstream;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Отправка сериализованного запроса в очередь.
#[async_trait]
pub trait RemovalPublisher: Send + Sync {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> anyhow::Result<()>;
}

#[async_trait]
impl RemovalPublisher for jetstream::Context {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> anyhow::Result<()> {
        let ack = jetstream::Context::publish(self, subject.to_string(), payload.into()).await?;
        ack.await?;
        Ok(())
    }
}

/// Чем закончилась обработка запроса на удаление.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalOutcome {
    /// Прямая попытка удалила ключ (или удалять было нечего).
    Deleted,
    /// Прямая попытка не удалась, запрос ушёл в очередь.
    Queued,
    /// Не удалось ни удалить, ни опубликовать.
    Lost,
}

/// Точка входа для всех, кто удаляет ключи с серверов.
#[derive(Clone)]
pub struct KeyRemover {
    store: Arc<dyn RemovalStore>,
    connector: Arc<dyn PanelConnector>,
    publisher: Arc<dyn RemovalPublisher>,
    subject: String,
}

impl KeyRemover {
    pub fn new(
        store: Arc<dyn RemovalStore>,
        connector: Arc<dyn PanelConnector>,
        publisher: Arc<dyn RemovalPublisher>,
        subject: impl Into<String>,
    ) -> Self {
        Self {
            store,
            connector,
            publisher,
            subject: subject.into(),
        }
    }

    /// Запускает удаление и сразу возвращает управление.
    ///
    /// Прямая попытка идёт в отдельной задаче; если она вернула `false` или
    /// упала, запрос публикуется в очередь. Возвращённый handle можно не ждать.
    pub fn remove_key_server(
        &self,
        name_key: &str,
        key_id: i64,
        server_id: i64,
        wg_public_key: Option<&str>,
    ) -> JoinHandle<RemovalOutcome> {
        let request = RemovalRequest::new(name_key, key_id, server_id, wg_public_key);

        let direct = {
            let store = self.store.clone();
            let connector = self.connector.clone();
            let request = request.clone();
            tokio::spawn(async move {
                try_direct_delete(store.as_ref(), connector.as_ref(), &request).await
            })
        };

        let payload = request.to_payload();
        let publisher = self.publisher.clone();
        let subject = self.subject.clone();

        tokio::spawn(async move {
            let must_publish = match direct.await {
                Ok(deleted) => !deleted,
                Err(error) => {
                    tracing::error!(
                        error = %error,
                        name_key = %request.name_key,
                        key_id = request.key_id,
                        "Direct delete task crashed, publishing anyway"
                    );
                    true
                }
            };
            if !must_publish {
                return RemovalOutcome::Deleted;
            }

            let payload = match payload {
                Ok(payload) => payload,
                Err(error) => {
                    tracing::error!(error = %error, "Failed to serialize removal request");
                    return RemovalOutcome::Lost;
                }
            };
            match publisher.publish(&subject, payload).await {
                Ok(()) => {
                    tracing::info!(
                        name_key = %request.name_key,
                        key_id = request.key_id,
                        server_id = request.server_id,
                        subject = %subject,
                        "Published removal task to queue"
                    );
                    RemovalOutcome::Queued
                }
                Err(error) => {
                    tracing::error!(
                        error = %error,
                        name_key = %request.name_key,
                        key_id = request.key_id,
                        server_id = request.server_id,
                        "Failed to publish removal task"
                    );
                    RemovalOutcome::Lost
                }
            }
        })
    }
}
