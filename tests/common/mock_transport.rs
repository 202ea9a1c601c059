//! Recording transport for testing.
//!
//! Records every publish and every slave-side transport call for assertions.
//! Publishing can be made to fail to exercise the converter's retry path.

use db_replication::transport::BoxFuture;
use db_replication::{
    ChangeMessage, ChangePublisher, InitialDataRequest, ReplicationError, SlaveTransport,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;

/// Mock transport that records everything it is asked to do.
///
/// # Example
/// ```rust,ignore
/// let transport = Arc::new(RecordingTransport::new());
/// transport.fail_next_publishes(1);
///
/// // Use in tests...
///
/// assert_eq!(transport.published().await.len(), 3);
/// assert!(transport.calls().await.contains(&"clear_queue:s1".to_string()));
/// ```
#[derive(Default)]
pub struct RecordingTransport {
    published: RwLock<Vec<ChangeMessage>>,
    calls: RwLock<Vec<String>>,
    requests: RwLock<Vec<InitialDataRequest>>,
    /// Publishes still to fail
    fail_publishes: AtomicUsize,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` publishes fail with a transport error.
    pub fn fail_next_publishes(&self, n: usize) {
        self.fail_publishes.store(n, Ordering::SeqCst);
    }

    pub async fn published(&self) -> Vec<ChangeMessage> {
        self.published.read().await.clone()
    }

    pub async fn take_published(&self) -> Vec<ChangeMessage> {
        std::mem::take(&mut *self.published.write().await)
    }

    pub async fn calls(&self) -> Vec<String> {
        self.calls.read().await.clone()
    }

    pub async fn requests(&self) -> Vec<InitialDataRequest> {
        self.requests.read().await.clone()
    }

    async fn record(&self, call: String) {
        self.calls.write().await.push(call);
    }
}

impl ChangePublisher for RecordingTransport {
    fn publish(&self, msg: ChangeMessage) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let remaining = self.fail_publishes.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_publishes.store(remaining - 1, Ordering::SeqCst);
                return Err(ReplicationError::Transport("simulated publish failure".to_string()));
            }
            self.published.write().await.push(msg);
            Ok(())
        })
    }
}

impl SlaveTransport for RecordingTransport {
    fn clear_queue(&self, slave: &str) -> BoxFuture<'_, u64> {
        let call = format!("clear_queue:{}", slave);
        Box::pin(async move {
            self.record(call).await;
            Ok(0)
        })
    }

    fn broadcast_status(&self, slave: &str, status: &str) -> BoxFuture<'_, ()> {
        let call = format!("broadcast:{}:{}", slave, status);
        Box::pin(async move {
            self.record(call).await;
            Ok(())
        })
    }

    fn set_delivery_active(&self, slave: &str, active: bool) -> BoxFuture<'_, ()> {
        let call = format!("delivery:{}:{}", slave, active);
        Box::pin(async move {
            self.record(call).await;
            Ok(())
        })
    }

    fn install_hold_filter(&self, slave: &str, topic: &str) -> BoxFuture<'_, ()> {
        let call = format!("install_filter:{}:{}", slave, topic);
        Box::pin(async move {
            self.record(call).await;
            Ok(())
        })
    }

    fn remove_hold_filter(&self, slave: &str, topic: &str) -> BoxFuture<'_, ()> {
        let call = format!("remove_filter:{}:{}", slave, topic);
        Box::pin(async move {
            self.record(call).await;
            Ok(())
        })
    }

    fn request_initial_data(&self, request: InitialDataRequest) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.record(format!("request:{}", request.slave)).await;
            self.requests.write().await.push(request);
            Ok(())
        })
    }

    fn cancel_initial_data(&self, master: &str, slave: &str) -> BoxFuture<'_, ()> {
        let call = format!("cancel:{}:{}", master, slave);
        Box::pin(async move {
            self.record(call).await;
            Ok(())
        })
    }
}
