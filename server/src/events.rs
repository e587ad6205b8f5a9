//! In-process event bus for module lifecycle hooks
//!
//! Subscribers are called in subscription order, once per published event.
//! The subscriber list is copied before delivery, so a subscriber may
//! subscribe further callbacks without deadlocking; those only see later
//! events.

use std::future::Future;
use std::sync::{Arc, Mutex};

use crate::BoxFuture;

type Subscriber<E> = Arc<dyn Fn(E) -> BoxFuture<()> + Send + Sync>;

pub struct EventBus<E> {
    subscribers: Mutex<Vec<Subscriber<E>>>,
}

impl<E: Clone + Send + 'static> EventBus<E> {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe<F, Fut>(&self, callback: F)
    where
        F: Fn(E) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let subscriber: Subscriber<E> = Arc::new(move |event| Box::pin(callback(event)));
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(subscriber);
    }

    /// Delivers `event` to every current subscriber, awaiting each in turn
    pub async fn publish(&self, event: E) {
        let subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        for subscriber in subscribers {
            subscriber(event.clone()).await;
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

impl<E: Clone + Send + 'static> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}
