//! Заглушки хранилища, панели и очереди для тестов ядра удаления.

use super::publisher::RemovalPublisher;
use super::{RemovalRequest, RemovalStore};
use crate::panel::{PanelClient, PanelConnector, PanelError, PanelKind, ServerDescriptor};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub fn server(id: i64, kind: PanelKind) -> ServerDescriptor {
    ServerDescriptor {
        id,
        name: format!("server-{}", id),
        kind,
        address: "10.0.0.1".to_string(),
        outline_link: None,
    }
}

#[derive(Default)]
pub struct MemoryStore {
    servers: Mutex<HashMap<i64, ServerDescriptor>>,
    ledger: Mutex<Vec<(String, i64, i64)>>,
    space: Mutex<HashMap<i64, i64>>,
    pub fail_space: Mutex<bool>,
    pub fail_resolve: Mutex<bool>,
}

impl MemoryStore {
    pub fn with_server(server: ServerDescriptor) -> Self {
        let store = Self::default();
        store.servers.lock().unwrap().insert(server.id, server);
        store
    }

    pub fn ledger(&self) -> Vec<(String, i64, i64)> {
        self.ledger.lock().unwrap().clone()
    }

    pub fn space(&self, server_id: i64) -> Option<i64> {
        self.space.lock().unwrap().get(&server_id).copied()
    }
}

#[async_trait]
impl RemovalStore for MemoryStore {
    async fn resolve_server(&self, server_id: i64) -> anyhow::Result<Option<ServerDescriptor>> {
        if *self.fail_resolve.lock().unwrap() {
            anyhow::bail!("database is locked");
        }
        Ok(self.servers.lock().unwrap().get(&server_id).cloned())
    }

    async fn update_space(&self, server_id: i64, count: i64) -> anyhow::Result<bool> {
        if *self.fail_space.lock().unwrap() {
            anyhow::bail!("database is locked");
        }
        self.space.lock().unwrap().insert(server_id, count);
        Ok(true)
    }

    async fn record_unresolved(&self, request: &RemovalRequest) -> anyhow::Result<()> {
        self.ledger.lock().unwrap().push((
            request.name_key.clone(),
            request.key_id,
            request.server_id,
        ));
        Ok(())
    }

    async fn clear_unresolved(
        &self,
        name_key: &str,
        key_id: i64,
        server_id: i64,
    ) -> anyhow::Result<bool> {
        let mut ledger = self.ledger.lock().unwrap();
        let before = ledger.len();
        ledger.retain(|(name, key, server)| {
            !(name == name_key && *key == key_id && *server == server_id)
        });
        Ok(ledger.len() != before)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PanelBehavior {
    Delete,
    AlreadyAbsent,
    Unreachable,
    HangOnLogin,
}

/// Панель, поведение которой меняется между вызовами.
#[derive(Clone)]
pub struct StubConnector {
    behavior: Arc<Mutex<PanelBehavior>>,
    pub deleted: Arc<Mutex<Vec<(String, i64)>>>,
    connects: Arc<AtomicUsize>,
    clients_left: usize,
}

impl StubConnector {
    pub fn new(behavior: PanelBehavior) -> Self {
        Self {
            behavior: Arc::new(Mutex::new(behavior)),
            deleted: Arc::new(Mutex::new(Vec::new())),
            connects: Arc::new(AtomicUsize::new(0)),
            clients_left: 3,
        }
    }

    pub fn set_behavior(&self, behavior: PanelBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn deleted(&self) -> Vec<(String, i64)> {
        self.deleted.lock().unwrap().clone()
    }
}

struct StubPanel {
    behavior: PanelBehavior,
    deleted: Arc<Mutex<Vec<(String, i64)>>>,
    clients_left: usize,
}

impl PanelConnector for StubConnector {
    fn connect(&self, _server: &ServerDescriptor) -> Result<Box<dyn PanelClient>, PanelError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(StubPanel {
            behavior: *self.behavior.lock().unwrap(),
            deleted: self.deleted.clone(),
            clients_left: self.clients_left,
        }))
    }
}

#[async_trait]
impl PanelClient for StubPanel {
    async fn login(&mut self) -> Result<(), PanelError> {
        if self.behavior == PanelBehavior::HangOnLogin {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn delete_client(&self, identity: &str, key_id: i64) -> Result<bool, PanelError> {
        match self.behavior {
            PanelBehavior::Unreachable => Err(PanelError::UnexpectedStatus {
                operation: "delete",
                status: 502,
            }),
            PanelBehavior::AlreadyAbsent => Ok(false),
            _ => {
                self.deleted
                    .lock()
                    .unwrap()
                    .push((identity.to_string(), key_id));
                Ok(true)
            }
        }
    }

    async fn list_clients(&self) -> Result<usize, PanelError> {
        Ok(self.clients_left)
    }
}

#[derive(Default)]
pub struct RecordingPublisher {
    pub published: Mutex<Vec<(String, Vec<u8>)>>,
    pub fail: Mutex<bool>,
}

impl RecordingPublisher {
    pub fn requests(&self) -> Vec<RemovalRequest> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .map(|(_, payload)| RemovalRequest::from_payload(payload).unwrap())
            .collect()
    }

    pub fn subjects(&self) -> Vec<String> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .map(|(subject, _)| subject.clone())
            .collect()
    }
}

#[async_trait]
impl RemovalPublisher for RecordingPublisher {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> anyhow::Result<()> {
        if *self.fail.lock().unwrap() {
            anyhow::bail!("no responders");
        }
        self.published
            .lock()
            .unwrap()
            .push((subject.to_string(), payload));
        Ok(())
    }
}
