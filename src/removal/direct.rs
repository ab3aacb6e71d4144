use super::{RemovalRequest, RemovalStore, delete_on_panel, forget_unresolved, refresh_space};
use crate::panel::PanelConnector;

/// Прямая попытка удалить ключ. `true` — удалять больше нечего.
///
/// Неудача записывается в журнал неудалённых ключей, удача очищает его.
pub async fn try_direct_delete(
    store: &dyn RemovalStore,
    connector: &dyn PanelConnector,
    request: &RemovalRequest,
) -> bool {
    let server = match store.resolve_server(request.server_id).await {
        Ok(Some(server)) => server,
        Ok(None) => {
            tracing::info!(
                name_key = %request.name_key,
                key_id = request.key_id,
                server_id = request.server_id,
                "Server not found, nothing to delete"
            );
            return true;
        }
        Err(error) => {
            tracing::error!(
                error = %error,
                server_id = request.server_id,
                "Failed to resolve server for direct delete"
            );
            return false;
        }
    };

    match delete_on_panel(connector, &server, request).await {
        Ok(panel) => {
            tracing::info!(
                name_key = %request.name_key,
                key_id = request.key_id,
                server_id = server.id,
                "Key deleted from server directly"
            );
            forget_unresolved(store, request).await;
            refresh_space(store, &*panel, server.id).await;
            true
        }
        Err(error) => {
            tracing::error!(
                error = %error,
                name_key = %request.name_key,
                key_id = request.key_id,
                server_id = server.id,
                "Direct delete failed"
            );
            if let Err(error) = store.record_unresolved(request).await {
                tracing::error!(error = %error, "Failed to record unresolved deletion");
            }
            false
        }
    }
}
