// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Boundary to the publish/subscribe transport.
//!
//! The transport that moves messages between master and slave is an external
//! collaborator. This module defines exactly what the engine needs from it:
//!
//! - [`ChangePublisher`]: the master hands every converted [`ChangeMessage`]
//!   over, in replKey order. The transport must deliver in order per
//!   subscription.
//! - [`SlaveTransport`]: the side effects a slave session drives while it
//!   runs the initial-sync protocol (queue clearing, delivery on/off,
//!   persistent filters, snapshot requests).
//!
//! [`ChannelPublisher`] is an in-process transport over a tokio channel,
//! used for embedding master and slave in one process and in tests.
//!
//! # Example
//!
//! ```rust,no_run
//! use db_replication::transport::{BoxFuture, ChangePublisher};
//! use db_replication::message::ChangeMessage;
//!
//! struct LogPublisher;
//!
//! impl ChangePublisher for LogPublisher {
//!     fn publish(&self, msg: ChangeMessage) -> BoxFuture<'_, ()> {
//!         Box::pin(async move {
//!             println!("{} rows", msg.rows.len());
//!             Ok(())
//!         })
//!     }
//! }
//! ```

use crate::error::{ReplicationError, Result};
use crate::message::{self, ChangeMessage};
use std::future::Future;
use std::pin::Pin;
use tokio::sync::mpsc;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Well-known administrative topic status broadcasts are addressed to.
pub const ADMIN_STATUS_TOPIC: &str = "__replication.status";

/// Status text broadcast when a slave starts its initial sync.
pub const STATUS_INITIAL_SYNC_START: &str = "dbInitStart";

/// Master-side sink for converted changes.
pub trait ChangePublisher: Send + Sync + 'static {
    /// Publish one message. Returning an error leaves the staged rows in
    /// place so the next check publishes them again.
    fn publish(&self, msg: ChangeMessage) -> BoxFuture<'_, ()>;
}

/// Request for a bulk snapshot, sent from a slave session to the master.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitialDataRequest {
    /// Replication (master) name.
    pub master: String,
    /// Requesting slave session.
    pub slave: String,
    /// Topic the slave consumes.
    pub topic: String,
}

/// Side effects a slave session needs from the transport.
pub trait SlaveTransport: Send + Sync + 'static {
    /// Drop everything queued for delivery to `slave`. Returns the number of
    /// discarded entries.
    fn clear_queue(&self, slave: &str) -> BoxFuture<'_, u64>;

    /// Broadcast a status notification on [`ADMIN_STATUS_TOPIC`].
    fn broadcast_status(&self, slave: &str, status: &str) -> BoxFuture<'_, ()>;

    /// Switch live delivery to `slave` on or off.
    fn set_delivery_active(&self, slave: &str, active: bool) -> BoxFuture<'_, ()>;

    /// Install a persistent, slave-tagged filter on `topic` so live changes
    /// are held instead of delivered.
    fn install_hold_filter(&self, slave: &str, topic: &str) -> BoxFuture<'_, ()>;

    /// Remove the filter installed by [`install_hold_filter`](Self::install_hold_filter).
    fn remove_hold_filter(&self, slave: &str, topic: &str) -> BoxFuture<'_, ()>;

    /// Ask the master for a bulk snapshot.
    fn request_initial_data(&self, request: InitialDataRequest) -> BoxFuture<'_, ()>;

    /// Tell the master to abandon a running snapshot for `slave`.
    fn cancel_initial_data(&self, master: &str, slave: &str) -> BoxFuture<'_, ()>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// Implementations
// ═══════════════════════════════════════════════════════════════════════════════

/// A no-op implementation for testing/standalone mode.
///
/// Logs operations but doesn't move anything.
#[derive(Clone, Default)]
pub struct NoOpTransport;

impl ChangePublisher for NoOpTransport {
    fn publish(&self, msg: ChangeMessage) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            tracing::debug!(
                command = %msg.description.command,
                rows = msg.rows.len(),
                "NoOp: would publish message"
            );
            Ok(())
        })
    }
}

impl SlaveTransport for NoOpTransport {
    fn clear_queue(&self, slave: &str) -> BoxFuture<'_, u64> {
        let slave = slave.to_string();
        Box::pin(async move {
            tracing::debug!(slave = %slave, "NoOp: would clear queue");
            Ok(0)
        })
    }

    fn broadcast_status(&self, slave: &str, status: &str) -> BoxFuture<'_, ()> {
        let slave = slave.to_string();
        let status = status.to_string();
        Box::pin(async move {
            tracing::debug!(slave = %slave, status = %status, "NoOp: would broadcast status");
            Ok(())
        })
    }

    fn set_delivery_active(&self, slave: &str, active: bool) -> BoxFuture<'_, ()> {
        let slave = slave.to_string();
        Box::pin(async move {
            tracing::debug!(slave = %slave, active, "NoOp: would toggle delivery");
            Ok(())
        })
    }

    fn install_hold_filter(&self, _slave: &str, _topic: &str) -> BoxFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }

    fn remove_hold_filter(&self, _slave: &str, _topic: &str) -> BoxFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }

    fn request_initial_data(&self, request: InitialDataRequest) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            tracing::debug!(slave = %request.slave, "NoOp: would request initial data");
            Ok(())
        })
    }

    fn cancel_initial_data(&self, _master: &str, _slave: &str) -> BoxFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}

/// In-process publisher: encodes each message and sends it down a channel.
#[derive(Clone)]
pub struct ChannelPublisher {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    compress_threshold: usize,
}

impl ChannelPublisher {
    /// Create the publisher and the receiving end the slave side drains.
    pub fn new(compress_threshold: usize) -> (Self, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                compress_threshold,
            },
            rx,
        )
    }
}

impl ChangePublisher for ChannelPublisher {
    fn publish(&self, msg: ChangeMessage) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let bytes = message::encode(&msg, self.compress_threshold)?;
            self.tx
                .send(bytes)
                .map_err(|_| ReplicationError::Transport("receiver dropped".to_string()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{attr, ChangeMessage, Command};

    #[tokio::test]
    async fn test_noop_publish() {
        let t = NoOpTransport;
        assert!(t.publish(ChangeMessage::statement("SELECT 1")).await.is_ok());
    }

    #[tokio::test]
    async fn test_noop_slave_transport() {
        let t = NoOpTransport;
        assert_eq!(t.clear_queue("slave1").await.unwrap(), 0);
        t.broadcast_status("slave1", STATUS_INITIAL_SYNC_START)
            .await
            .unwrap();
        t.set_delivery_active("slave1", false).await.unwrap();
        t.request_initial_data(InitialDataRequest {
            master: "m".into(),
            slave: "slave1".into(),
            topic: "t".into(),
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_channel_publisher_roundtrip() {
        let (publisher, mut rx) = ChannelPublisher::new(0);
        let mut msg = ChangeMessage::statement("UPDATE t SET a = 1");
        msg.set_attr(attr::REPL_KEY, "7");
        publisher.publish(msg.clone()).await.unwrap();

        let bytes = rx.recv().await.unwrap();
        let decoded = crate::message::decode(&bytes).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.command().unwrap(), Command::Statement);
    }

    #[tokio::test]
    async fn test_channel_publisher_receiver_dropped() {
        let (publisher, rx) = ChannelPublisher::new(0);
        drop(rx);
        let err = publisher
            .publish(ChangeMessage::statement("SELECT 1"))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
