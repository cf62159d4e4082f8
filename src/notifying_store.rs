use std::{
    collections::HashMap,
    mem,
    pin::pin,
    sync::{Arc, Mutex, PoisonError},
    task::Poll,
};

use futures::executor::block_on;

use crate::notify::{Detached, NotificationSink};

/// Key-value store without expiry that reports every write to a single
/// subscriber.
///
/// Publishing happens after the map write and may block: a sink with a
/// blocking delivery policy stalls `set` until its receiver catches up or the
/// sink is replaced. Writers publish one at a time, so a slow subscriber
/// stalls every writer. Readers and `subscribe`/`unsubscribe` are never held
/// up by it.
pub struct NotifyingStore {
    entries: Mutex<HashMap<String, String>>,
    // Fair, so writers publish in the order they queued up for it.
    publishing: tokio::sync::Mutex<()>,
    sink: Mutex<Arc<dyn NotificationSink>>,
}

impl Default for NotifyingStore {
    fn default() -> Self {
        NotifyingStore {
            entries: Mutex::default(),
            publishing: tokio::sync::Mutex::new(()),
            sink: Mutex::new(Arc::new(Detached)),
        }
    }
}

impl NotifyingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: &str, value: &str) {
        let turn = block_on(async {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            entries.insert(key.to_string(), value.to_string());
            // Join the publishing queue before the next writer can touch the
            // map, then wait for our turn without holding it.
            let mut queued = pin!(self.publishing.lock());
            let ready = futures::poll!(queued.as_mut());
            drop(entries);
            match ready {
                Poll::Ready(turn) => turn,
                Poll::Pending => queued.await,
            }
        });
        self.current_sink().publish(key);
        drop(turn);
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Route notifications to `sink` from now on.
    ///
    /// The previous sink is retired, not closed: a publish blocked on it gives
    /// up, and its receiver stays open but never sees another key.
    pub fn subscribe(&self, sink: impl NotificationSink + 'static) {
        self.replace_sink(Arc::new(sink)).retire();
    }

    /// Close the current sink and fall back to one that discards keys.
    pub fn unsubscribe(&self) {
        self.replace_sink(Arc::new(Detached)).close();
    }

    fn current_sink(&self) -> Arc<dyn NotificationSink> {
        Arc::clone(&self.sink.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn replace_sink(&self, sink: Arc<dyn NotificationSink>) -> Arc<dyn NotificationSink> {
        let mut slot = self.sink.lock().unwrap_or_else(PoisonError::into_inner);
        mem::replace(&mut *slot, sink)
    }
}
