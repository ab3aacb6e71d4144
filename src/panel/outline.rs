//! Outline management API: `/server`, `/access-keys`.

use super::pinned_tls::{Fingerprint, parse_fingerprint, pinned_client_config};
use super::{PanelClient, PanelError, ServerDescriptor};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OutlineLink {
    api_url: String,
    cert_sha256: String,
}

/// Суффикс имени ключа Outline: `{name}.{key_id}.ou`.
const KEY_POSTFIX: &str = "ou";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccessKeys {
    access_keys: Vec<AccessKey>,
}

#[derive(Debug, Deserialize)]
struct AccessKey {
    id: String,
    #[serde(default)]
    name: String,
}

pub struct OutlinePanel {
    api_url: String,
    cert_sha256: Fingerprint,
    timeout: Duration,
    http: Option<reqwest::Client>,
}

impl OutlinePanel {
    pub fn from_descriptor(server: &ServerDescriptor, timeout: Duration) -> Result<Self, PanelError> {
        let raw = server
            .outline_link
            .as_deref()
            .ok_or_else(|| PanelError::BadDescriptor {
                server_id: server.id,
                reason: "outline_link не задан".to_string(),
            })?;
        let link: OutlineLink =
            serde_json::from_str(raw).map_err(|err| PanelError::BadDescriptor {
                server_id: server.id,
                reason: err.to_string(),
            })?;
        let cert_sha256 =
            parse_fingerprint(&link.cert_sha256).ok_or_else(|| PanelError::BadDescriptor {
                server_id: server.id,
                reason: "certSha256 не является SHA-256 в hex".to_string(),
            })?;
        Ok(Self {
            api_url: link.api_url.trim_end_matches('/').to_string(),
            cert_sha256,
            timeout,
            http: None,
        })
    }

    fn http(&self) -> Result<&reqwest::Client, PanelError> {
        self.http.as_ref().ok_or(PanelError::NotLoggedIn)
    }

    async fn access_keys(&self) -> Result<Vec<AccessKey>, PanelError> {
        let response = self
            .http()?
            .get(format!("{}/access-keys", self.api_url))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(PanelError::UnexpectedStatus {
                operation: "list access-keys",
                status: response.status().as_u16(),
            });
        }
        Ok(response.json::<AccessKeys>().await?.access_keys)
    }
}

/// Имя ключа может прийти как готовое `{name}.{key_id}.ou`, так и как исходный `{name}`.
fn matches_identity(key_name: &str, identity: &str, key_id: i64) -> bool {
    key_name == identity
        || key_name == format!("{}.{}.{}", identity, key_id, KEY_POSTFIX)
}

#[async_trait]
impl PanelClient for OutlinePanel {
    async fn login(&mut self) -> Result<(), PanelError> {
        // Сертификат Outline самоподписанный, доверяем только отпечатку из outline_link.
        let http = reqwest::Client::builder()
            .timeout(self.timeout)
            .tls_backend_preconfigured(pinned_client_config(self.cert_sha256)?)
            .build()?;
        let response = http.get(format!("{}/server", self.api_url)).send().await?;
        if !response.status().is_success() {
            return Err(PanelError::UnexpectedStatus {
                operation: "login",
                status: response.status().as_u16(),
            });
        }
        self.http = Some(http);
        Ok(())
    }

    async fn delete_client(&self, identity: &str, key_id: i64) -> Result<bool, PanelError> {
        let keys = self.access_keys().await?;
        let Some(key) = keys
            .iter()
            .find(|key| matches_identity(&key.name, identity, key_id))
        else {
            return Ok(false);
        };

        let response = self
            .http()?
            .delete(format!("{}/access-keys/{}", self.api_url, key.id))
            .send()
            .await?;
        match response.status().as_u16() {
            200..=299 => Ok(true),
            404 => Ok(false),
            status => Err(PanelError::UnexpectedStatus {
                operation: "delete access-key",
                status,
            }),
        }
    }

    async fn list_clients(&self) -> Result<usize, PanelError> {
        Ok(self.access_keys().await?.len())
    }
}
