//! Конфигурация сервиса удаления ключей: TOML-файл плюс переопределения из окружения.

use crate::panel::PanelKind;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Не удалось прочитать конфиг {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Некорректный TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Некорректное значение {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
    #[error("Токен бота не задан (bot_token или TG_TOKEN)")]
    MissingBotToken,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("/var/lib/keypurge/keypurge.db")
}

fn default_nats_servers() -> Vec<String> {
    vec!["nats://nats:4222".to_string()]
}

fn default_remove_subject() -> String {
    "aiogram.remove.key".to_string()
}

fn default_remove_stream() -> String {
    "DeleteKeyStream".to_string()
}

fn default_remove_durable_name() -> String {
    "remove_key_consumer".to_string()
}

fn default_delay_remove_key_secs() -> u64 {
    300
}

fn default_ack_wait_secs() -> u64 {
    300
}

fn default_max_deliver() -> i64 {
    10
}

fn default_fetch_timeout_secs() -> u64 {
    5
}

fn default_panel_timeout_secs() -> u64 {
    30
}

fn default_unresolved_page_size() -> i64 {
    20
}

/// Сервер из секции `[[servers]]`. `id` совпадает с `server_id` в запросах на удаление.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerEntry {
    pub id: i64,
    pub name: String,
    pub type_vpn: i64,
    pub address: String,
    #[serde(default)]
    pub login: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub outline_link: Option<String>,
    #[serde(default)]
    pub inbound_id: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_nats_servers")]
    pub nats_servers: Vec<String>,
    #[serde(default = "default_remove_subject")]
    pub remove_subject: String,
    #[serde(default = "default_remove_stream")]
    pub remove_stream: String,
    #[serde(default = "default_remove_durable_name")]
    pub remove_durable_name: String,
    /// Задержка повторной доставки после nak.
    #[serde(default = "default_delay_remove_key_secs")]
    pub delay_remove_key_secs: u64,
    #[serde(default = "default_ack_wait_secs")]
    pub ack_wait_secs: u64,
    #[serde(default = "default_max_deliver")]
    pub max_deliver: i64,
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    #[serde(default = "default_panel_timeout_secs")]
    pub panel_timeout_secs: u64,
    #[serde(default)]
    pub bot_token: Option<String>,
    #[serde(default)]
    pub admin_ids: Vec<i64>,
    #[serde(default = "default_unresolved_page_size")]
    pub unresolved_page_size: i64,
    /// Реестр серверов. Пустой список оставляет таблицу `servers` как есть.
    #[serde(default)]
    pub servers: Vec<ServerEntry>,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml(&raw)?;
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// NATS_SERVERS имеет приоритет над NATS_URL; пустые значения игнорируются.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(servers) = non_empty("NATS_SERVERS") {
            let parsed = parse_csv_urls(&servers);
            if !parsed.is_empty() {
                self.nats_servers = parsed;
            }
        } else if let Some(url) = non_empty("NATS_URL") {
            self.nats_servers = vec![url.trim().to_string()];
        }

        if let Some(token) = non_empty("TG_TOKEN") {
            self.bot_token = Some(token);
        }

        if let Some(delay) = non_empty("DELAY_REMOVE_KEY") {
            match delay.trim().parse::<u64>() {
                Ok(secs) => self.delay_remove_key_secs = secs,
                Err(_) => tracing::warn!(value = %delay, "Ignoring non-numeric DELAY_REMOVE_KEY"),
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.nats_servers.is_empty() {
            return Err(ConfigError::Invalid {
                key: "nats_servers",
                reason: "список серверов пуст".to_string(),
            });
        }
        if self.delay_remove_key_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "delay_remove_key_secs",
                reason: "должно быть больше нуля".to_string(),
            });
        }
        if self.ack_wait_secs == 0 || self.fetch_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "ack_wait_secs/fetch_timeout_secs",
                reason: "должно быть больше нуля".to_string(),
            });
        }
        if self.max_deliver < 1 {
            return Err(ConfigError::Invalid {
                key: "max_deliver",
                reason: format!("{} < 1", self.max_deliver),
            });
        }
        if self.unresolved_page_size < 1 {
            return Err(ConfigError::Invalid {
                key: "unresolved_page_size",
                reason: format!("{} < 1", self.unresolved_page_size),
            });
        }
        self.validate_servers()
    }

    fn validate_servers(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for server in &self.servers {
            if !seen.insert(server.id) {
                return Err(ConfigError::Invalid {
                    key: "servers",
                    reason: format!("повторяющийся id {}", server.id),
                });
            }
            match PanelKind::from_code(server.type_vpn) {
                PanelKind::Unknown(code) => {
                    return Err(ConfigError::Invalid {
                        key: "servers",
                        reason: format!("сервер {}: неизвестный type_vpn {}", server.id, code),
                    });
                }
                PanelKind::Outline if server.outline_link.is_none() => {
                    return Err(ConfigError::Invalid {
                        key: "servers",
                        reason: format!("сервер {}: для Outline нужен outline_link", server.id),
                    });
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn is_admin(&self, user_id: i64) -> bool {
        self.admin_ids.contains(&user_id)
    }

    pub fn bot_token(&self) -> Result<String, ConfigError> {
        self.bot_token
            .clone()
            .filter(|token| !token.trim().is_empty())
            .ok_or(ConfigError::MissingBotToken)
    }

    pub fn redelivery_delay(&self) -> Duration {
        Duration::from_secs(self.delay_remove_key_secs)
    }

    pub fn ack_wait(&self) -> Duration {
        Duration::from_secs(self.ack_wait_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn panel_timeout(&self) -> Duration {
        Duration::from_secs(self.panel_timeout_secs)
    }
}

fn parse_csv_urls(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(str::to_string)
        .collect()
}
