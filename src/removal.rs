//! Доставка удаления ключей с панелей: прямая попытка, затем очередь JetStream.
//!
//! Любой, кто решил, что ключ должен исчезнуть с сервера, вызывает
//! [`KeyRemover::remove_key_server`]. Прямая попытка выполняется в отдельной
//! задаче; если она не удалась, запрос публикуется в поток, откуда его
//! забирает [`RemovalWorker`] и повторяет с задержкой до исчерпания
//! `max_deliver`. Все операции идемпотентны: отсутствующий клиент или
//! отсутствующий сервер считаются успешным удалением.

mod consumer;
mod direct;
mod publisher;
#[cfg(test)]
mod testing;
mod topology;

pub use consumer::RemovalWorker;
pub use publisher::{KeyRemover, RemovalOutcome};
pub use topology::{QueueTopology, connect_nats};

use crate::db::Db;
use crate::panel::{PanelClient, PanelConnector, PanelError, ServerDescriptor};
use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};

/// Запрос на удаление ключа; он же сообщение в очереди.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemovalRequest {
    pub name_key: String,
    pub key_id: i64,
    pub server_id: i64,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub wg_public_key: String,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

impl RemovalRequest {
    pub fn new(
        name_key: impl Into<String>,
        key_id: i64,
        server_id: i64,
        wg_public_key: Option<&str>,
    ) -> Self {
        Self {
            name_key: name_key.into(),
            key_id,
            server_id,
            wg_public_key: wg_public_key.unwrap_or_default().to_string(),
        }
    }

    pub fn to_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }

    /// На WireGuard клиент ищется по публичному ключу, на остальных панелях по имени.
    pub fn identity_for(&self, server: &ServerDescriptor) -> &str {
        if server.kind.deletes_by_public_key() {
            &self.wg_public_key
        } else {
            &self.name_key
        }
    }
}

/// Персистентность, нужная ядру удаления. Каждый вызов — отдельная короткая операция.
#[async_trait]
pub trait RemovalStore: Send + Sync {
    async fn resolve_server(&self, server_id: i64) -> anyhow::Result<Option<ServerDescriptor>>;

    async fn update_space(&self, server_id: i64, count: i64) -> anyhow::Result<bool>;

    async fn record_unresolved(&self, request: &RemovalRequest) -> anyhow::Result<()>;

    async fn clear_unresolved(&self, name_key: &str, key_id: i64, server_id: i64)
    -> anyhow::Result<bool>;
}

#[async_trait]
impl RemovalStore for Db {
    async fn resolve_server(&self, server_id: i64) -> anyhow::Result<Option<ServerDescriptor>> {
        self.get_server(server_id).await
    }

    async fn update_space(&self, server_id: i64, count: i64) -> anyhow::Result<bool> {
        Db::update_space(self, server_id, count).await
    }

    async fn record_unresolved(&self, request: &RemovalRequest) -> anyhow::Result<()> {
        Db::record_unresolved(
            self,
            &request.name_key,
            request.key_id,
            request.server_id,
            &request.wg_public_key,
        )
        .await
    }

    async fn clear_unresolved(
        &self,
        name_key: &str,
        key_id: i64,
        server_id: i64,
    ) -> anyhow::Result<bool> {
        Db::clear_unresolved(self, name_key, key_id, server_id).await
    }
}

/// Логин и удаление клиента. Отсутствие клиента на панели — тоже успех.
async fn delete_on_panel(
    connector: &dyn PanelConnector,
    server: &ServerDescriptor,
    request: &RemovalRequest,
) -> Result<Box<dyn PanelClient>, PanelError> {
    tracing::debug!(
        server_id = server.id,
        server_name = %server.name,
        address = %server.address,
        kind = ?server.kind,
        "Connecting to panel"
    );
    let mut panel = connector.connect(server)?;
    panel.login().await?;
    let deleted = panel
        .delete_client(request.identity_for(server), request.key_id)
        .await?;
    if !deleted {
        tracing::info!(
            name_key = %request.name_key,
            key_id = request.key_id,
            server_id = server.id,
            "Client already absent on panel"
        );
    }
    Ok(panel)
}

async fn forget_unresolved(store: &dyn RemovalStore, request: &RemovalRequest) {
    if let Err(error) = store
        .clear_unresolved(&request.name_key, request.key_id, request.server_id)
        .await
    {
        tracing::warn!(
            error = %error,
            name_key = %request.name_key,
            key_id = request.key_id,
            server_id = request.server_id,
            "Failed to clear unresolved deletion"
        );
    }
}

/// Пересчёт занятых мест после удачного удаления; ошибки только логируются.
async fn refresh_space(store: &dyn RemovalStore, panel: &dyn PanelClient, server_id: i64) {
    let count = match panel.list_clients().await {
        Ok(count) => count,
        Err(error) => {
            tracing::error!(error = %error, server_id, "Failed to list panel clients");
            return;
        }
    };
    match store.update_space(server_id, count as i64).await {
        Ok(true) => tracing::info!(server_id, space = count, "Server space updated"),
        Ok(false) => tracing::warn!(server_id, "Server vanished before space update"),
        Err(error) => tracing::error!(error = %error, server_id, "Failed to update server space"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::panel::PanelKind;

    #[test]
    fn null_or_missing_public_key_becomes_empty() {
        let request = RemovalRequest::new("5001.42.ou", 42, 7, None);
        let decoded = RemovalRequest::from_payload(&request.to_payload().unwrap()).unwrap();
        assert_eq!(decoded.wg_public_key, "");
        assert_eq!(decoded, request);

        let explicit_null = br#"{"name_key":"a","key_id":1,"server_id":2,"wg_public_key":null}"#;
        assert_eq!(RemovalRequest::from_payload(explicit_null).unwrap().wg_public_key, "");

        let missing = br#"{"name_key":"a","key_id":1,"server_id":2}"#;
        assert_eq!(RemovalRequest::from_payload(missing).unwrap().wg_public_key, "");
    }

    #[test]
    fn public_key_survives_wire_format() {
        let request = RemovalRequest::new("5001.42.wg", 42, 7, Some("abcXYZ=="));
        let json: serde_json::Value = serde_json::from_slice(&request.to_payload().unwrap()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "name_key": "5001.42.wg",
                "key_id": 42,
                "server_id": 7,
                "wg_public_key": "abcXYZ=="
            })
        );
        let decoded = RemovalRequest::from_payload(&request.to_payload().unwrap()).unwrap();
        assert_eq!(decoded.wg_public_key, "abcXYZ==");
    }

    #[test]
    fn identity_depends_on_panel_family() {
        let request = RemovalRequest::new("5001.42.wg", 42, 7, Some("abcXYZ=="));
        let mut server = testing::server(7, PanelKind::WireGuard);
        assert_eq!(request.identity_for(&server), "abcXYZ==");
        server.kind = PanelKind::Vless;
        assert_eq!(request.identity_for(&server), "5001.42.wg");
    }

    #[tokio::test]
    async fn configured_server_is_resolved_and_failure_recorded() {
        use testing::{PanelBehavior, StubConnector};

        let db = Db::open_in_memory().await.unwrap();
        db.load_registry(&[crate::db::server_entry(7, 1)]).await.unwrap();
        let connector = StubConnector::new(PanelBehavior::Unreachable);
        let request = RemovalRequest::new("5001.42.vl", 42, 7, None);

        assert!(!direct::try_direct_delete(&db, &connector, &request).await);
        assert_eq!(connector.connects(), 1);
        assert_eq!(db.count_unresolved().await.unwrap(), 1);

        connector.set_behavior(PanelBehavior::Delete);
        assert!(direct::try_direct_delete(&db, &connector, &request).await);
        assert_eq!(db.count_unresolved().await.unwrap(), 0);
        assert_eq!(db.actual_space(7).await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn db_store_keeps_public_key_in_ledger() {
        let db = Db::open_in_memory().await.unwrap();
        let request = RemovalRequest::new("5001.42.wg", 42, 7, Some("abcXYZ=="));
        RemovalStore::record_unresolved(&db, &request).await.unwrap();

        let rows = db.list_unresolved(10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].wg_public_key, "abcXYZ==");
        assert!(RemovalStore::clear_unresolved(&db, "5001.42.wg", 42, 7).await.unwrap());
    }
}
