//! Панели VPN-серверов: описание сервера и единый интерфейс клиента панели.

mod outline;
mod pinned_tls;

use outline::OutlinePanel;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Тип панели, как он хранится в `servers.type_vpn`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PanelKind {
    Outline,
    Vless,
    Shadowsocks,
    WireGuard,
    AmneziaWg,
    Trojan,
    Remnawave,
    Unknown(i64),
}

impl PanelKind {
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => Self::Outline,
            1 => Self::Vless,
            2 => Self::Shadowsocks,
            3 => Self::WireGuard,
            4 => Self::AmneziaWg,
            5 => Self::Trojan,
            6 => Self::Remnawave,
            other => Self::Unknown(other),
        }
    }

    #[cfg(test)]
    pub fn code(self) -> i64 {
        match self {
            Self::Outline => 0,
            Self::Vless => 1,
            Self::Shadowsocks => 2,
            Self::WireGuard => 3,
            Self::AmneziaWg => 4,
            Self::Trojan => 5,
            Self::Remnawave => 6,
            Self::Unknown(code) => code,
        }
    }

    /// Клиент на такой панели идентифицируется публичным ключом, а не именем.
    pub fn deletes_by_public_key(self) -> bool {
        matches!(self, Self::WireGuard)
    }
}

/// Параметры подключения к серверу; только для чтения.
#[derive(Debug, Clone)]
pub struct ServerDescriptor {
    pub id: i64,
    pub name: String,
    pub kind: PanelKind,
    pub address: String,
    /// JSON `{"apiUrl": ..., "certSha256": ...}` для Outline.
    pub outline_link: Option<String>,
}

#[derive(Debug, Error)]
pub enum PanelError {
    #[error("HTTP: {0}")]
    Http(#[from] reqwest::Error),
    #[error("TLS: {0}")]
    Tls(#[from] rustls::Error),
    #[error("Некорректные параметры подключения сервера {server_id}: {reason}")]
    BadDescriptor { server_id: i64, reason: String },
    #[error("Тип панели {0:?} не поддерживается")]
    Unsupported(PanelKind),
    #[error("Панель ответила {status} на {operation}")]
    UnexpectedStatus { operation: &'static str, status: u16 },
    #[error("Вход в панель не выполнен")]
    NotLoggedIn,
}

/// Клиент панели конкретного сервера.
#[async_trait]
pub trait PanelClient: Send + Sync {
    async fn login(&mut self) -> Result<(), PanelError>;

    /// `Ok(false)` означает, что клиента на панели уже нет.
    async fn delete_client(&self, identity: &str, key_id: i64) -> Result<bool, PanelError>;

    /// Возвращает количество клиентов на панели.
    async fn list_clients(&self) -> Result<usize, PanelError>;
}

/// Создаёт клиента панели по описанию сервера.
pub trait PanelConnector: Send + Sync {
    fn connect(&self, server: &ServerDescriptor) -> Result<Box<dyn PanelClient>, PanelError>;
}

/// Подключение к реальным панелям по HTTP.
#[derive(Debug, Clone)]
pub struct HttpPanelConnector {
    timeout: Duration,
}

impl HttpPanelConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl PanelConnector for HttpPanelConnector {
    fn connect(&self, server: &ServerDescriptor) -> Result<Box<dyn PanelClient>, PanelError> {
        match server.kind {
            PanelKind::Outline => Ok(Box::new(OutlinePanel::from_descriptor(
                server,
                self.timeout,
            )?)),
            other => Err(PanelError::Unsupported(other)),
        }
    }
}
