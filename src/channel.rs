//! Transport between the two execution contexts.
//!
//! [`WorkerPort`] is the raw one-way primitive: it posts a serialized message and never waits.
//! [`AcknowledgedChannel`] builds request/acknowledge flow control on top of it: `send` posts a
//! message with a fresh id and hands back a [`PendingAck`] that completes once a
//! `WorkerCallbackSync` referring to that id has been fed to [`AcknowledgedChannel::acknowledge`].
//!
//! A pending acknowledgment never fails. If the channel is torn down first it simply never
//! completes; termination is reported through its own message, not through the channel.

use std::future::IntoFuture;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::protocol::{Message, MessageId, ProtocolError, WorkerCallbackSync};

/// Failures when posting across a context boundary.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("the other execution context is gone")]
    Closed,
}

/// Sending half of a context boundary; only serialized JSON crosses it.
#[derive(Clone, Debug)]
pub struct WorkerPort {
    tx: mpsc::UnboundedSender<String>,
}

/// Receiving half matching a [`WorkerPort`].
pub type PortReceiver = mpsc::UnboundedReceiver<String>;

/// Creates a connected port and receiver.
pub fn port_pair() -> (WorkerPort, PortReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (WorkerPort { tx }, rx)
}

impl WorkerPort {
    pub fn post(&self, message: &Message) -> Result<(), ChannelError> {
        let encoded = message.encode()?;
        debug!(message_type = message.message_type(), id = %message.id(), "post");
        self.tx.send(encoded).map_err(|_| ChannelError::Closed)
    }

    /// True once the receiving context has dropped its end.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Request/acknowledge wrapper around a [`WorkerPort`].
///
/// The correlation table belongs to the channel instance and is emptied by [`teardown`].
///
/// [`teardown`]: AcknowledgedChannel::teardown
pub struct AcknowledgedChannel {
    port: WorkerPort,
    pending: DashMap<MessageId, oneshot::Sender<()>>,
    closed: AtomicBool,
}

impl AcknowledgedChannel {
    pub fn new(port: WorkerPort) -> Self {
        Self {
            port,
            pending: DashMap::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Posts `message` and returns the acknowledgment to await before continuing.
    ///
    /// Only encoding failures are errors. A message posted into a closed transport yields an
    /// acknowledgment that never completes.
    pub fn send(&self, message: impl Into<Message>) -> Result<PendingAck, ChannelError> {
        let message = message.into();
        let id = message.id();
        let (tx, rx) = oneshot::channel();

        if self.closed.load(Ordering::Acquire) {
            debug!(%id, "send after teardown, acknowledgment will never arrive");
            return Ok(PendingAck { rx });
        }

        self.pending.insert(id, tx);
        match self.port.post(&message) {
            Ok(()) => Ok(PendingAck { rx }),
            Err(ChannelError::Closed) => {
                debug!(%id, "transport closed, acknowledgment will never arrive");
                Ok(PendingAck { rx })
            }
            Err(err) => {
                self.pending.remove(&id);
                Err(err)
            }
        }
    }

    /// Posts without expecting an acknowledgment.
    pub fn post(&self, message: impl Into<Message>) -> Result<(), ChannelError> {
        self.port.post(&message.into())
    }

    /// Completes the acknowledgment `callback` refers to; returns whether one was outstanding.
    pub fn acknowledge(&self, callback: &WorkerCallbackSync) -> bool {
        match self.pending.remove(&callback.original_id) {
            Some((_, tx)) => {
                let _ = tx.send(());
                true
            }
            None => {
                debug!(original_id = %callback.original_id, "acknowledgment without pending message");
                false
            }
        }
    }

    /// Drops every outstanding acknowledgment; their waiters stay suspended forever.
    pub fn teardown(&self) {
        self.closed.store(true, Ordering::Release);
        self.pending.clear();
    }

    /// Number of sent messages still waiting for their acknowledgment.
    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }
}

/// Acknowledgment of one sent message. Await it (or call [`PendingAck::wait`]).
#[must_use = "an unawaited acknowledgment removes the backpressure it exists for"]
pub struct PendingAck {
    rx: oneshot::Receiver<()>,
}

impl PendingAck {
    pub async fn wait(self) {
        if self.rx.await.is_err() {
            // Torn down before the acknowledgment arrived.
            std::future::pending::<()>().await;
        }
    }
}

impl IntoFuture for PendingAck {
    type Output = ();
    type IntoFuture = BoxFuture<'static, ()>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.wait())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;
    use crate::protocol::{Level, UiSync};

    #[tokio::test]
    async fn resolves_on_matching_callback_only() {
        let (port, mut rx) = port_pair();
        let channel = Arc::new(AcknowledgedChannel::new(port));

        let pending = channel.send(UiSync::log("hello", Level::Info)).unwrap();
        let sent = Message::decode(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(channel.outstanding(), 1);

        assert!(!channel.acknowledge(&WorkerCallbackSync::acknowledging(MessageId::generate())));
        assert!(channel.acknowledge(&WorkerCallbackSync::acknowledging(sent.id())));

        timeout(Duration::from_secs(1), pending)
            .await
            .expect("acknowledged send completes");
        assert_eq!(channel.outstanding(), 0);
    }

    #[tokio::test]
    async fn teardown_leaves_waiters_suspended() {
        let (port, _rx) = port_pair();
        let channel = AcknowledgedChannel::new(port);

        let pending = channel.send(UiSync::log("stalled", Level::Warning)).unwrap();
        channel.teardown();

        assert_eq!(channel.outstanding(), 0);
        assert!(timeout(Duration::from_millis(50), pending).await.is_err());
    }

    #[tokio::test]
    async fn closed_transport_is_not_an_error() {
        let (port, rx) = port_pair();
        drop(rx);
        let channel = AcknowledgedChannel::new(port);

        let pending = channel.send(UiSync::log("lost", Level::Info)).expect("send still succeeds");
        assert!(timeout(Duration::from_millis(50), pending).await.is_err());
        assert!(matches!(channel.post(UiSync::log("x", Level::Info)), Err(ChannelError::Closed)));
    }
}
