// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Registry of slave sessions.

use super::{SessionState, SlaveSession};
use crate::error::Result;
use crate::state_store::ReplKeyStore;
use crate::transport::SlaveTransport;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::info;

/// Slave sessions keyed by name.
pub struct SessionManager {
    sessions: DashMap<String, Arc<SlaveSession>>,
    transport: Arc<dyn SlaveTransport>,
    store: Arc<ReplKeyStore>,
}

impl SessionManager {
    pub fn new(transport: Arc<dyn SlaveTransport>, store: Arc<ReplKeyStore>) -> Self {
        Self {
            sessions: DashMap::new(),
            transport,
            store,
        }
    }

    /// Register `name` for (re)synchronization from `master`.
    ///
    /// A live session is returned as is. A cancelled one is replaced by a
    /// fresh session that keeps the persisted max replKey.
    pub async fn register(&self, name: &str, master: &str, topic: &str) -> Arc<SlaveSession> {
        if let Some(existing) = self.get(name) {
            if existing.state().await != SessionState::Cancelled {
                return existing;
            }
        }
        let session = Arc::new(
            SlaveSession::new(name, master, topic, Arc::clone(&self.transport))
                .with_store(Arc::clone(&self.store))
                .await,
        );
        self.sessions.insert(name.to_string(), Arc::clone(&session));
        info!(slave = %name, master = %master, topic = %topic, "Registered slave session");
        session
    }

    pub fn get(&self, name: &str) -> Option<Arc<SlaveSession>> {
        self.sessions.get(name).map(|s| Arc::clone(s.value()))
    }

    /// Cancel and forget a session.
    pub async fn remove(&self, name: &str) -> Result<Option<Arc<SlaveSession>>> {
        let Some((_, session)) = self.sessions.remove(name) else {
            return Ok(None);
        };
        session.cancel_initial_update().await?;
        info!(slave = %name, "Removed slave session");
        Ok(Some(session))
    }

    pub fn all(&self) -> Vec<Arc<SlaveSession>> {
        let mut all: Vec<_> = self.sessions.iter().map(|e| Arc::clone(e.value())).collect();
        all.sort_by(|a, b| a.name().cmp(b.name()));
        all
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
