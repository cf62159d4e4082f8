//! Notification sinks for [`NotifyingStore`](crate::notifying_store::NotifyingStore).
//!
//! A sink receives the key of every successful write. How a key travels from
//! the store to whoever is listening (a rendezvous, a bounded queue that
//! drops, a plain discard) is decided by the sink, not by the store.
//!
//! The store is synchronous, so the channel halves here wait on tokio's
//! runtime-agnostic channels with `futures::executor::block_on`.

use clap::ValueEnum;
use futures::executor::block_on;
use tokio::sync::{
    broadcast,
    mpsc::{self, error::TrySendError},
    oneshot, watch,
};
use tracing::{debug, warn};

/// Destination for change notifications.
pub trait NotificationSink: Send + Sync {
    /// Deliver `key`. May block, depending on the sink's delivery policy.
    fn publish(&self, key: &str);

    /// The store has moved on to another sink. Any publish still waiting
    /// gives up and later ones are ignored, but the receiver stays open.
    fn retire(&self) {}

    /// Close the sink, waking any receiver with an end-of-stream signal once
    /// it has taken what is already queued.
    fn close(&self) {}
}

/// Sink that discards everything it is given.
#[derive(Debug, Default)]
pub struct Detached;

impl NotificationSink for Detached {
    fn publish(&self, _key: &str) {}
}

/// What a [`ChannelSink`] does when its queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Overflow {
    /// Wait for the receiver to make room.
    Blocking,
    /// Evict the oldest queued key.
    DropOldest,
    /// Discard the new key.
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub overflow: Overflow,
    /// Maximum number of queued keys. Zero only makes sense with
    /// [`Overflow::Blocking`], where it means "wait until the key is taken".
    /// [`Overflow::DropOldest`] rounds it up to a power of two.
    pub capacity: usize,
}

impl Delivery {
    pub fn blocking(capacity: usize) -> Self {
        Delivery {
            overflow: Overflow::Blocking,
            capacity,
        }
    }

    pub fn drop_oldest(capacity: usize) -> Self {
        Delivery {
            overflow: Overflow::DropOldest,
            capacity,
        }
    }

    pub fn reject(capacity: usize) -> Self {
        Delivery {
            overflow: Overflow::Reject,
            capacity,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SinkState {
    Open,
    Retired,
    Closed,
}

/// A queued key. `taken` is fired once the receiver has it, for rendezvous
/// delivery.
struct Note {
    key: String,
    taken: Option<oneshot::Sender<()>>,
}

impl Note {
    fn take(self) -> String {
        if let Some(taken) = self.taken {
            let _ = taken.send(());
        }
        self.key
    }
}

enum Outlet {
    Queue {
        tx: mpsc::Sender<Note>,
        overflow: Overflow,
        rendezvous: bool,
    },
    Ring(broadcast::Sender<String>),
}

enum Inlet {
    // Each receiver keeps a sender of its own, so the channel only ends when
    // the sink is explicitly closed, never because the sink was dropped.
    Queue {
        rx: mpsc::Receiver<Note>,
        _keepalive: mpsc::Sender<Note>,
    },
    Ring {
        rx: broadcast::Receiver<String>,
        _keepalive: broadcast::Sender<String>,
    },
}

/// Create a sink and the receiving end it feeds.
pub fn channel(delivery: Delivery) -> (ChannelSink, Notifications) {
    let Delivery { overflow, capacity } = delivery;
    let (outlet, inlet) = match overflow {
        Overflow::DropOldest => {
            let (tx, rx) = broadcast::channel(capacity.max(1));
            let inlet = Inlet::Ring {
                rx,
                _keepalive: tx.clone(),
            };
            (Outlet::Ring(tx), inlet)
        }
        Overflow::Blocking | Overflow::Reject => {
            let (tx, rx) = mpsc::channel(capacity.max(1));
            let inlet = Inlet::Queue {
                rx,
                _keepalive: tx.clone(),
            };
            let outlet = Outlet::Queue {
                tx,
                overflow,
                rendezvous: overflow == Overflow::Blocking && capacity == 0,
            };
            (outlet, inlet)
        }
    };
    let (state, state_rx) = watch::channel(SinkState::Open);
    (
        ChannelSink { outlet, state },
        Notifications {
            inlet,
            state: state_rx,
        },
    )
}

/// Sending half of [`channel`]. Dropping it neither closes the channel nor
/// wakes the receiver; only [`NotificationSink::close`] does.
pub struct ChannelSink {
    outlet: Outlet,
    state: watch::Sender<SinkState>,
}

impl ChannelSink {
    fn is_open(&self) -> bool {
        *self.state.borrow() == SinkState::Open
    }

    /// Wait until the key is queued (or taken, for a rendezvous). `Err` if
    /// the receiver is gone.
    async fn deliver(tx: &mpsc::Sender<Note>, key: &str, rendezvous: bool) -> Result<(), ()> {
        let (taken, taken_rx) = if rendezvous {
            let (taken, taken_rx) = oneshot::channel();
            (Some(taken), Some(taken_rx))
        } else {
            (None, None)
        };
        let note = Note {
            key: key.to_string(),
            taken,
        };
        tx.send(note).await.map_err(|_| ())?;
        match taken_rx {
            Some(taken_rx) => taken_rx.await.map_err(|_| ()),
            None => Ok(()),
        }
    }
}

impl NotificationSink for ChannelSink {
    fn publish(&self, key: &str) {
        if !self.is_open() {
            return;
        }
        let delivered = match &self.outlet {
            Outlet::Ring(tx) => tx.send(key.to_string()).is_ok(),
            Outlet::Queue {
                tx,
                overflow: Overflow::Reject,
                ..
            } => match tx.try_send(Note {
                key: key.to_string(),
                taken: None,
            }) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    warn!(key, "notification queue full, rejected");
                    true
                }
                Err(TrySendError::Closed(_)) => false,
            },
            Outlet::Queue { tx, rendezvous, .. } => {
                let mut state = self.state.subscribe();
                block_on(async {
                    tokio::select! {
                        biased;
                        _ = state.wait_for(|state| *state != SinkState::Open) => {
                            debug!(key, "sink retired while publishing");
                            true
                        }
                        delivered = Self::deliver(tx, key, *rendezvous) => delivered.is_ok(),
                    }
                })
            }
        };
        if !delivered {
            debug!(key, "notification receiver is gone");
        }
    }

    fn retire(&self) {
        self.state.send_if_modified(|state| {
            let open = *state == SinkState::Open;
            if open {
                *state = SinkState::Retired;
            }
            open
        });
    }

    fn close(&self) {
        self.state.send_replace(SinkState::Closed);
    }
}

/// Receiving half of [`channel`]. Iterating blocks until a key arrives and
/// ends once the sink is closed and every queued key has been taken. A
/// receiver whose sink was retired or dropped without being closed simply
/// never sees another key.
pub struct Notifications {
    inlet: Inlet,
    state: watch::Receiver<SinkState>,
}

impl Inlet {
    async fn recv(&mut self) -> Option<String> {
        match self {
            Inlet::Queue { rx, .. } => rx.recv().await.map(Note::take),
            Inlet::Ring { rx, .. } => loop {
                match rx.recv().await {
                    Ok(key) => return Some(key),
                    Err(broadcast::error::RecvError::Lagged(dropped)) => {
                        warn!(dropped, "notification queue full, dropped oldest");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            },
        }
    }

    fn try_recv(&mut self) -> Option<String> {
        match self {
            Inlet::Queue { rx, .. } => rx.try_recv().ok().map(Note::take),
            Inlet::Ring { rx, .. } => loop {
                match rx.try_recv() {
                    Ok(key) => return Some(key),
                    Err(broadcast::error::TryRecvError::Lagged(dropped)) => {
                        warn!(dropped, "notification queue full, dropped oldest");
                    }
                    Err(_) => return None,
                }
            },
        }
    }
}

impl Iterator for Notifications {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        let Notifications { inlet, state } = self;
        block_on(async {
            let closed = tokio::select! {
                biased;
                key = inlet.recv() => return key,
                closed = state.wait_for(|state| *state == SinkState::Closed) => closed.is_ok(),
            };
            if closed {
                inlet.try_recv()
            } else {
                // The sink is gone without closing: nothing will ever arrive.
                inlet.recv().await
            }
        })
    }
}
