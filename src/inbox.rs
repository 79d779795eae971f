//! Per-type listener registries.
//!
//! An inbox is handed *every* inbound message; it ignores anything that is not its own type and
//! dispatches matching messages to its listeners in registration order. Listeners are async and
//! awaited one after the other, so a listener that animates the cube finishes before the next one
//! (and before the next message) is looked at.

use std::marker::PhantomData;
use std::sync::{Arc, RwLock};

use futures::future::BoxFuture;

use crate::protocol::{Message, MessageData};

type MessageListener<M> = Arc<dyn Fn(M) -> BoxFuture<'static, ()> + Send + Sync>;

pub struct MessageInbox<M: MessageData> {
    listeners: RwLock<Vec<MessageListener<M>>>,
    _message: PhantomData<fn(M)>,
}

impl<M: MessageData> MessageInbox<M> {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
            _message: PhantomData,
        }
    }

    pub fn message_type(&self) -> &'static str {
        M::TYPE
    }

    /// Registers an async listener.
    pub fn on<F>(&self, listener: F)
    where
        F: Fn(M) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        self.listeners
            .write()
            .expect("inbox listeners poisoned")
            .push(Arc::new(listener));
    }

    /// Registers a listener that does all its work synchronously.
    pub fn on_sync<F>(&self, listener: F)
    where
        F: Fn(M) + Send + Sync + 'static,
    {
        self.on(move |message| {
            listener(message);
            Box::pin(async {})
        });
    }

    /// Relays `message` to every listener if it carries this inbox's type.
    ///
    /// Returns whether the message matched.
    pub async fn try_relay(&self, message: &Message) -> bool {
        let Some(data) = M::from_message(message) else {
            return false;
        };
        let listeners = self.listeners.read().expect("inbox listeners poisoned").clone();
        for listener in listeners {
            listener(data.clone()).await;
        }
        true
    }
}

impl<M: MessageData> Default for MessageInbox<M> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::protocol::{Level, MessageId, UiSync, WorkerCallbackSync};

    #[tokio::test]
    async fn ignores_foreign_types() {
        let inbox = MessageInbox::<UiSync>::new();
        let hits = Arc::new(Mutex::new(0));
        let counter = hits.clone();
        inbox.on_sync(move |_| *counter.lock().unwrap() += 1);

        let foreign: Message = WorkerCallbackSync::acknowledging(MessageId::generate()).into();
        assert!(!inbox.try_relay(&foreign).await);
        assert!(inbox.try_relay(&UiSync::log("hi", Level::Info).into()).await);

        assert_eq!(*hits.lock().unwrap(), 1);
        assert_eq!(inbox.message_type(), "UiSync");
    }

    #[tokio::test]
    async fn awaits_listeners_in_registration_order() {
        let inbox = MessageInbox::<UiSync>::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let slow = order.clone();
        inbox.on(move |_| {
            let slow = slow.clone();
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                slow.lock().unwrap().push("slow");
            })
        });
        let fast = order.clone();
        inbox.on_sync(move |_| fast.lock().unwrap().push("fast"));

        inbox.try_relay(&UiSync::log("x", Level::Info).into()).await;

        assert_eq!(*order.lock().unwrap(), vec!["slow", "fast"]);
    }
}
