//! Debounced flush scheduling
//!
//! Every `(owner, pipeline)` pair is either idle or armed. The first trigger
//! arms a timer; further triggers while armed are ignored, so the delay is
//! measured from the first change and never extended. When the timer expires a
//! [`FlushRequest`] is sent on the flush channel, and whoever performs the flush
//! calls [`DebounceScheduler::fire`] to return the slot to idle before doing
//! any I/O. A change made during that I/O arms a fresh cycle.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, trace};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// The two independent flush destinations of a profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pipeline {
    /// Full snapshot to the profile store
    Persist,
    /// Incremental update to the connected peer
    Push,
}

impl fmt::Display for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pipeline::Persist => f.write_str("persist"),
            Pipeline::Push => f.write_str("push"),
        }
    }
}

/// Emitted when an armed timer expires
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushRequest<K> {
    pub owner: K,
    pub pipeline: Pipeline,
    generation: u64,
}

/// Debounce delays per pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delays {
    pub persist: Duration,
    pub push: Duration,
}

impl Delays {
    pub fn of(&self, pipeline: Pipeline) -> Duration {
        match pipeline {
            Pipeline::Persist => self.persist,
            Pipeline::Push => self.push,
        }
    }
}

struct Armed {
    generation: u64,
    timer: JoinHandle<()>,
}

struct Slots<K> {
    armed: HashMap<(K, Pipeline), Armed>,
    next_generation: u64,
}

pub struct DebounceScheduler<K> {
    delays: Delays,
    slots: Arc<Mutex<Slots<K>>>,
    flush_tx: mpsc::UnboundedSender<FlushRequest<K>>,
}

impl<K> DebounceScheduler<K>
where
    K: Clone + Eq + Hash + fmt::Debug + Send + 'static,
{
    /// Creates a scheduler and the receiving end of its flush channel
    pub fn new(delays: Delays) -> (Self, mpsc::UnboundedReceiver<FlushRequest<K>>) {
        let (flush_tx, flush_rx) = mpsc::unbounded_channel();
        let scheduler = Self {
            delays,
            slots: Arc::new(Mutex::new(Slots {
                armed: HashMap::new(),
                next_generation: 0,
            })),
            flush_tx,
        };
        (scheduler, flush_rx)
    }

    pub fn delays(&self) -> Delays {
        self.delays
    }

    /// Arms the pipeline for `owner` unless it is already armed
    ///
    /// Returns true when a new timer was started.
    pub fn trigger(&self, owner: &K, pipeline: Pipeline) -> bool {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let slot = (owner.clone(), pipeline);
        if slots.armed.contains_key(&slot) {
            trace!("{} for {:?} already armed", pipeline, owner);
            return false;
        }

        let generation = slots.next_generation;
        slots.next_generation += 1;

        let delay = self.delays.of(pipeline);
        let flush_tx = self.flush_tx.clone();
        let request = FlushRequest {
            owner: owner.clone(),
            pipeline,
            generation,
        };
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // the receiver is gone only during shutdown
            let _ = flush_tx.send(request);
        });

        debug!("Armed {} for {:?} ({:?})", pipeline, owner, delay);
        slots.armed.insert(slot, Armed { generation, timer });
        true
    }

    /// Returns the slot of `request` to idle
    ///
    /// Returns false for requests whose timer was cancelled or superseded;
    /// those must not be flushed.
    pub fn fire(&self, request: &FlushRequest<K>) -> bool {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let slot = (request.owner.clone(), request.pipeline);
        let current = slots.armed.get(&slot).map(|armed| armed.generation);
        if current == Some(request.generation) {
            slots.armed.remove(&slot);
            return true;
        }

        debug!(
            "Dropping stale {} flush for {:?}",
            request.pipeline, request.owner
        );
        false
    }

    pub fn is_armed(&self, owner: &K, pipeline: Pipeline) -> bool {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.armed.contains_key(&(owner.clone(), pipeline))
    }

    /// Cancels both pipelines of `owner`
    pub fn cancel(&self, owner: &K) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        for pipeline in [Pipeline::Persist, Pipeline::Push] {
            if let Some(armed) = slots.armed.remove(&(owner.clone(), pipeline)) {
                armed.timer.abort();
                debug!("Cancelled {} for {:?}", pipeline, owner);
            }
        }
    }

    pub fn armed_count(&self) -> usize {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.armed.len()
    }
}

impl<K> Drop for DebounceScheduler<K> {
    fn drop(&mut self) {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        for armed in slots.armed.values() {
            armed.timer.abort();
        }
    }
}
