//! keypurge — надёжное удаление VPN-ключей с панелей серверов.

mod bot;
mod config;
mod db;
mod panel;
mod removal;

use panel::{HttpPanelConnector, PanelConnector};
use removal::{KeyRemover, QueueTopology, RemovalStore, RemovalWorker};
use std::path::PathBuf;
use std::sync::Arc;
use teloxide::dispatching::Dispatcher;
use teloxide::prelude::*;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/etc/keypurge.toml"));
    tracing::info!("Starting keypurge with config {}", config_path.display());

    let config = Arc::new(config::Config::load(&config_path)?);
    tracing::info!(
        db_path = %config.db_path.display(),
        nats_servers = ?config.nats_servers,
        subject = %config.remove_subject,
        stream = %config.remove_stream,
        durable = %config.remove_durable_name,
        delay_remove_key_secs = config.delay_remove_key_secs,
        bot_enabled = config.bot_token.is_some(),
        admin_count = config.admin_ids.len(),
        configured_servers = config.servers.len(),
        "Configuration loaded"
    );

    let db = Arc::new(db::Db::open(&config.db_path).await?);
    let registered = db.load_registry(&config.servers).await?;
    tracing::info!(servers = registered, "Server registry ready");
    let store: Arc<dyn RemovalStore> = db.clone();
    let connector: Arc<dyn PanelConnector> =
        Arc::new(HttpPanelConnector::new(config.panel_timeout()));

    let (nats, js) = removal::connect_nats(&config.nats_servers).await?;
    let consumer = QueueTopology::from_config(&config).ensure(&js).await?;

    let shutdown = CancellationToken::new();
    let worker = RemovalWorker::new(
        store.clone(),
        connector.clone(),
        config.redelivery_delay(),
        config.max_deliver,
    );
    let worker_task = tokio::spawn(worker.run(
        consumer,
        config.fetch_timeout(),
        shutdown.clone(),
    ));

    if config.bot_token.is_some() {
        let bot = Bot::new(config.bot_token()?);
        let remover = KeyRemover::new(
            store,
            connector,
            Arc::new(js),
            config.remove_subject.clone(),
        );
        let state = bot::handlers::BotState {
            config: config.clone(),
            db,
            remover,
        };
        tracing::info!("Dispatcher initialized, bot is ready");

        Dispatcher::builder(bot, bot::handlers::schema())
            .dependencies(dptree::deps![state])
            .enable_ctrlc_handler()
            .build()
            .dispatch()
            .await;
    } else {
        tracing::info!("bot_token not set, running queue worker only");
        tokio::signal::ctrl_c().await?;
    }

    tracing::info!("Shutting down");
    shutdown.cancel();
    match worker_task.await {
        Ok(Ok(())) => {}
        Ok(Err(error)) => tracing::error!(error = %error, "Remove key consumer failed"),
        Err(error) => tracing::error!(error = %error, "Remove key consumer panicked"),
    }
    if let Err(error) = nats.flush().await {
        tracing::warn!(error = %error, "Failed to flush NATS connection");
    }

    Ok(())
}
