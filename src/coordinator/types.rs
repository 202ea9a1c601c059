// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Agent state types.
//!
//! # State Transitions
//!
//! ```text
//!                  start()
//! Created ───────────────────→ Starting
//!    │                              │
//!    │ shutdown()                   │ (pools open, bootstrap done,
//!    ↓                              │  scheduler spawned)
//! Stopped                           ↓
//!    ↑                          Running
//!    │                              │
//!    │                    shutdown()│
//!    │                              ↓
//!    └────────────────── ShuttingDown
//!
//! Starting ──(config, database or bootstrap error)──→ Failed
//! ```
//!
//! - **Created**: after `ReplicationAgent::new()`. Nothing is open.
//! - **Starting**: `start()` called; pools, bootstrap and watched tables.
//! - **Running**: the scheduler converts changes (master) and the apply
//!   engine accepts messages (slave).
//! - **ShuttingDown**: `shutdown()` called; background tasks are draining.
//! - **Stopped**: pools closed, high-water marks flushed.
//! - **Failed**: startup failed. Check the logs.

/// State of the replication agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Created,
    Starting,
    Running,
    ShuttingDown,
    Stopped,
    Failed,
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentState::Created => write!(f, "Created"),
            AgentState::Starting => write!(f, "Starting"),
            AgentState::Running => write!(f, "Running"),
            AgentState::ShuttingDown => write!(f, "ShuttingDown"),
            AgentState::Stopped => write!(f, "Stopped"),
            AgentState::Failed => write!(f, "Failed"),
        }
    }
}
