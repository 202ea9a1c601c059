// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-slave initial-sync protocol.
//!
//! # State Machine
//!
//! ```text
//!  new ──▶ PREPARING ──request_initial_data──▶ REQUESTING ──reactivate_destination──▶ ACTIVE
//!              │                                   │                                   │ ▲
//!              │                                   │                              pause│ │resume
//!              ▼                                   ▼                                   ▼ │
//!          CANCELLED ◀────────────── cancel (from any state) ──────────────────────── PAUSED
//! ```
//!
//! `prepare_for_request` performs the PREPARING side effects: clear the
//! slave's queue, broadcast `dbInitStart`, stop live delivery and install a
//! hold filter on the data topic. Live changes arriving meanwhile are held by
//! the session. `reactivate_destination` merges the snapshot with the held
//! changes, removes the filter and restarts delivery. Cancelling before
//! ACTIVE reverts those side effects.
//!
//! After reactivation the session is *in transition*: delivered entries older
//! than the snapshot's `min_repl_key` are dropped until an end-of-transition
//! marker or a replKey above `max_repl_key` arrives.

mod manager;

pub use manager::SessionManager;

use crate::error::{ReplicationError, Result};
use crate::message::{Action, ChangeMessage, Command};
use crate::metrics;
use crate::state_store::ReplKeyStore;
use crate::transport::{InitialDataRequest, SlaveTransport, STATUS_INITIAL_SYNC_START};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Protocol state of a slave session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Preparing,
    Requesting,
    Active,
    Paused,
    Cancelled,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Preparing => "PREPARING",
            Self::Requesting => "REQUESTING",
            Self::Active => "ACTIVE",
            Self::Paused => "PAUSED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
struct SessionInner {
    state: SessionState,
    prepared: bool,
    delivery_active: bool,
    filter_installed: bool,
    in_transition: bool,
    min_repl_key: i64,
    max_repl_key: i64,
    status_text: String,
    last_sql_response: Option<String>,
    held: Vec<ChangeMessage>,
}

/// One destination taking part in replication.
pub struct SlaveSession {
    name: String,
    master: String,
    topic: String,
    transport: Arc<dyn SlaveTransport>,
    store: Option<Arc<ReplKeyStore>>,
    inner: Mutex<SessionInner>,
}

impl fmt::Debug for SlaveSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlaveSession")
            .field("name", &self.name)
            .field("master", &self.master)
            .field("topic", &self.topic)
            .finish()
    }
}

impl SlaveSession {
    /// A new session in PREPARING. Nothing has been touched yet.
    pub fn new(name: &str, master: &str, topic: &str, transport: Arc<dyn SlaveTransport>) -> Self {
        Self {
            name: name.to_string(),
            master: master.to_string(),
            topic: topic.to_string(),
            transport,
            store: None,
            inner: Mutex::new(SessionInner {
                state: SessionState::Preparing,
                prepared: false,
                delivery_active: true,
                filter_installed: false,
                in_transition: false,
                min_repl_key: -1,
                max_repl_key: -1,
                status_text: "created".to_string(),
                last_sql_response: None,
                held: Vec::new(),
            }),
        }
    }

    /// Persist the max replKey through `store` and restore the last one.
    pub async fn with_store(mut self, store: Arc<ReplKeyStore>) -> Self {
        if let Some(max) = store.get(&Self::store_key(&self.name)).await {
            self.inner.get_mut().max_repl_key = max;
        }
        self.store = Some(store);
        self
    }

    fn store_key(name: &str) -> String {
        format!("{}.maxReplKey", name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn master(&self) -> &str {
        &self.master
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.state
    }

    pub async fn status_text(&self) -> String {
        self.inner.lock().await.status_text.clone()
    }

    pub async fn min_repl_key(&self) -> i64 {
        self.inner.lock().await.min_repl_key
    }

    pub async fn max_repl_key(&self) -> i64 {
        self.inner.lock().await.max_repl_key
    }

    pub async fn is_delivery_active(&self) -> bool {
        self.inner.lock().await.delivery_active
    }

    pub async fn is_in_transition(&self) -> bool {
        self.inner.lock().await.in_transition
    }

    pub async fn held_count(&self) -> usize {
        self.inner.lock().await.held.len()
    }

    pub async fn last_sql_response(&self) -> Option<String> {
        self.inner.lock().await.last_sql_response.clone()
    }

    pub async fn set_last_sql_response(&self, response: Option<String>) {
        self.inner.lock().await.last_sql_response = response;
    }

    fn transition(&self, inner: &mut SessionInner, to: SessionState) {
        let from = inner.state;
        inner.state = to;
        metrics::record_session_transition(from.as_str(), to.as_str());
        info!(slave = %self.name, from = %from, to = %to, "Session state changed");
    }

    fn invalid(expected: &str, actual: SessionState) -> ReplicationError {
        ReplicationError::InvalidState {
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Initial sync
    // ═══════════════════════════════════════════════════════════════════════

    /// Perform the PREPARING side effects.
    pub async fn prepare_for_request(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.state != SessionState::Preparing || inner.prepared {
            return Err(Self::invalid("PREPARING (unprepared)", inner.state));
        }

        let cleared = self.transport.clear_queue(&self.name).await?;
        info!(slave = %self.name, cleared, "Cleared slave queue before initial update");
        inner.held.clear();

        self.transport
            .broadcast_status(&self.name, STATUS_INITIAL_SYNC_START)
            .await?;

        self.transport.set_delivery_active(&self.name, false).await?;
        inner.delivery_active = false;

        self.transport.install_hold_filter(&self.name, &self.topic).await?;
        inner.filter_installed = true;

        inner.prepared = true;
        inner.status_text = "initial update: preparing".to_string();
        Ok(())
    }

    /// Ask the master for the snapshot and enter REQUESTING.
    pub async fn request_initial_data(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.state != SessionState::Preparing || !inner.prepared {
            return Err(Self::invalid("PREPARING (prepared)", inner.state));
        }
        self.transport
            .request_initial_data(InitialDataRequest {
                master: self.master.clone(),
                slave: self.name.clone(),
                topic: self.topic.clone(),
            })
            .await?;
        inner.status_text = "initial update: requested".to_string();
        self.transition(&mut inner, SessionState::Requesting);
        Ok(())
    }

    /// Enter ACTIVE with the snapshot covering `[min_repl_key, max_repl_key]`.
    ///
    /// Returns the messages to apply, in order: the snapshot followed by the
    /// held live changes it does not already contain. A cancelled session
    /// returns nothing.
    pub async fn reactivate_destination(
        &self,
        min_repl_key: i64,
        max_repl_key: i64,
        snapshot: Vec<ChangeMessage>,
    ) -> Result<Vec<ChangeMessage>> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            SessionState::Requesting => {}
            SessionState::Cancelled => {
                warn!(slave = %self.name, "Initial update was cancelled, not reactivating");
                return Ok(Vec::new());
            }
            other => return Err(Self::invalid("REQUESTING", other)),
        }

        info!(slave = %self.name, min_repl_key, max_repl_key, "Initial update completed");
        let held = std::mem::take(&mut inner.held);
        let held_len = held.len();
        let merged = merge_snapshot(snapshot, held, min_repl_key);

        self.transport.remove_hold_filter(&self.name, &self.topic).await?;
        inner.filter_installed = false;
        self.transport.set_delivery_active(&self.name, true).await?;
        inner.delivery_active = true;

        inner.min_repl_key = min_repl_key;
        inner.max_repl_key = inner.max_repl_key.max(max_repl_key);
        inner.in_transition = true;
        inner.status_text = "initial update: transition".to_string();
        self.transition(&mut inner, SessionState::Active);
        debug!(slave = %self.name, held = held_len, merged = merged.len(), "Merged snapshot with held changes");
        Ok(merged)
    }

    /// Filter a batch of delivered entries.
    ///
    /// - entries tagged `alreadyProcessed` are dropped
    /// - while PREPARING, REQUESTING or PAUSED everything is held, nothing returned
    /// - once ACTIVE, entries held during a pause come out first, ahead of `entries`
    /// - in transition, entries with a replKey below `min_repl_key` are dropped
    pub async fn check(&self, entries: Vec<ChangeMessage>) -> Vec<ChangeMessage> {
        let mut inner = self.inner.lock().await;
        let batch = if inner.state == SessionState::Active && !inner.held.is_empty() {
            let mut released = std::mem::take(&mut inner.held);
            debug!(slave = %self.name, released = released.len(), "Releasing entries held while paused");
            released.extend(entries);
            released
        } else {
            entries
        };
        let mut out = Vec::with_capacity(batch.len());

        for msg in batch {
            if msg.is_already_processed() {
                warn!(slave = %self.name, range = ?msg.repl_key_range(), "Dropping entry already processed");
                continue;
            }
            match inner.state {
                SessionState::Preparing | SessionState::Requesting | SessionState::Paused => {
                    inner.held.push(msg);
                    continue;
                }
                SessionState::Active | SessionState::Cancelled => {}
            }

            if inner.in_transition {
                if msg.is_end_of_transition() {
                    info!(slave = %self.name, "End of transition, back to normal operation");
                    inner.in_transition = false;
                    inner.status_text = "running".to_string();
                } else if let Some((lo, hi)) = msg.repl_key_range() {
                    if hi < inner.min_repl_key {
                        debug!(slave = %self.name, repl_key = hi, min = inner.min_repl_key, "Dropping entry covered by snapshot");
                        continue;
                    }
                    if lo > inner.max_repl_key {
                        inner.in_transition = false;
                        inner.status_text = "running".to_string();
                    }
                }
            }
            out.push(msg);
        }
        out
    }

    /// Record that an entry up to `repl_key` reached the destination.
    pub async fn record_applied(&self, repl_key: i64) {
        let mut inner = self.inner.lock().await;
        if repl_key > inner.max_repl_key {
            inner.max_repl_key = repl_key;
            if let Some(store) = &self.store {
                store.advance(&Self::store_key(&self.name), repl_key).await;
            }
        }
    }

    /// Whether the local replica state for `repl_key` is obsolete and may be
    /// torn down.
    ///
    /// True when the session is cancelled, while an initial update is being
    /// prepared or requested (the snapshot replaces everything), and in
    /// transition for keys below the snapshot. Held entries for the key are
    /// discarded in those cases.
    pub async fn check_for_destroy(&self, repl_key: i64) -> bool {
        let mut inner = self.inner.lock().await;
        let destroy = match inner.state {
            SessionState::Cancelled | SessionState::Preparing | SessionState::Requesting => true,
            SessionState::Active => inner.in_transition && repl_key < inner.min_repl_key,
            SessionState::Paused => false,
        };
        if destroy {
            inner.held.retain(|m| match m.repl_key_range() {
                Some((lo, hi)) => repl_key < lo || repl_key > hi,
                None => true,
            });
        }
        destroy
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Runtime control
    // ═══════════════════════════════════════════════════════════════════════

    /// ACTIVE → PAUSED: stop live delivery.
    pub async fn pause(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.state != SessionState::Active {
            return Err(Self::invalid("ACTIVE", inner.state));
        }
        self.transport.set_delivery_active(&self.name, false).await?;
        inner.delivery_active = false;
        inner.status_text = "paused".to_string();
        self.transition(&mut inner, SessionState::Paused);
        Ok(())
    }

    /// PAUSED → ACTIVE. Returns what was held while paused.
    pub async fn resume(&self) -> Result<Vec<ChangeMessage>> {
        let mut inner = self.inner.lock().await;
        if inner.state != SessionState::Paused {
            return Err(Self::invalid("PAUSED", inner.state));
        }
        self.transport.set_delivery_active(&self.name, true).await?;
        inner.delivery_active = true;
        inner.status_text = "running".to_string();
        self.transition(&mut inner, SessionState::Active);
        Ok(std::mem::take(&mut inner.held))
    }

    /// Flip between ACTIVE and PAUSED. Returns whether delivery is now active.
    pub async fn toggle_active(&self) -> Result<bool> {
        let state = self.state().await;
        match state {
            SessionState::Active => {
                self.pause().await?;
                Ok(false)
            }
            SessionState::Paused => {
                // Put back what was held; the next check releases it first.
                let held = self.resume().await?;
                let mut inner = self.inner.lock().await;
                let arrived = std::mem::replace(&mut inner.held, held);
                inner.held.extend(arrived);
                Ok(true)
            }
            other => Err(Self::invalid("ACTIVE or PAUSED", other)),
        }
    }

    /// Cancel from any state, reverting PREPARING/REQUESTING side effects.
    pub async fn cancel(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let from = inner.state;
        if from == SessionState::Cancelled {
            return Ok(());
        }

        if from == SessionState::Requesting {
            self.transport.cancel_initial_data(&self.master, &self.name).await?;
        }
        if inner.filter_installed {
            self.transport.remove_hold_filter(&self.name, &self.topic).await?;
            inner.filter_installed = false;
        }
        if !inner.delivery_active {
            self.transport.set_delivery_active(&self.name, true).await?;
            inner.delivery_active = true;
        }
        let dropped = inner.held.len();
        inner.held.clear();
        inner.in_transition = false;
        inner.status_text = "initial update interrupted".to_string();
        self.transition(&mut inner, SessionState::Cancelled);
        if dropped > 0 {
            warn!(slave = %self.name, dropped, "Held entries discarded on cancel");
        }
        Ok(())
    }

    /// Cancel a running initial update. No-op (false) once ACTIVE or PAUSED.
    pub async fn cancel_initial_update(&self) -> Result<bool> {
        match self.state().await {
            SessionState::Active | SessionState::Paused => Ok(false),
            _ => {
                self.cancel().await?;
                Ok(true)
            }
        }
    }
}

/// Merge a snapshot with the live changes held while it was taken.
///
/// Held rows older than `min_repl_key` are contained in the snapshot and are
/// dropped. Held INSERTs of a row (guid) the snapshot already carries are
/// dropped too. Duplicated deliveries (same guid and replKey) are kept once.
/// Non-row messages are dropped only when their replKey is below the
/// snapshot.
pub fn merge_snapshot(
    snapshot: Vec<ChangeMessage>,
    held: Vec<ChangeMessage>,
    min_repl_key: i64,
) -> Vec<ChangeMessage> {
    let snapshot_guids: HashSet<(String, String)> = snapshot
        .iter()
        .flat_map(|m| {
            m.rows.iter().filter_map(move |r| {
                let table = m.row_attr(r, crate::message::attr::TABLE_NAME)?;
                Some((table.to_ascii_lowercase(), r.guid()?.to_string()))
            })
        })
        .collect();

    let mut seen: HashSet<(Option<String>, i64)> = HashSet::new();
    let mut merged = snapshot;

    for mut msg in held {
        if msg.is_already_processed() {
            continue;
        }
        if !matches!(msg.command(), Ok(Command::Replication)) || msg.rows.is_empty() {
            match msg.repl_key_range() {
                Some((_, hi)) if hi < min_repl_key => {}
                _ => merged.push(msg),
            }
            continue;
        }

        let rows = std::mem::take(&mut msg.rows);
        let kept: Vec<_> = rows
            .into_iter()
            .filter(|row| {
                let Some(key) = row.repl_key() else {
                    return true;
                };
                if key < min_repl_key {
                    return false;
                }
                if !seen.insert((row.guid().map(str::to_string), key)) {
                    return false;
                }
                let is_insert = msg
                    .row_attr(row, crate::message::attr::ACTION)
                    .and_then(Action::parse)
                    == Some(Action::Insert);
                let in_snapshot = match (msg.row_attr(row, crate::message::attr::TABLE_NAME), row.guid()) {
                    (Some(t), Some(g)) => snapshot_guids.contains(&(t.to_ascii_lowercase(), g.to_string())),
                    _ => false,
                };
                !(is_insert && in_snapshot)
            })
            .collect();
        if !kept.is_empty() {
            msg.rows = kept;
            merged.push(msg);
        }
    }
    merged
}
