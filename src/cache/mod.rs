//! Shared, ref-counted projections over event subscriptions.
//!
//! A cache is memoized on the [`Connection`]: however many listeners attach,
//! it holds one set of server subscriptions and one snapshot. A driver task
//! owns the subscriptions, applies events, and refetches after every
//! reconnect. The last listener to detach tears everything down.

pub mod config;
pub mod entities;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::error::{CacheInit, Error, Kind};
use crate::types::{Event, Sequenced};
use crate::ws::LifecycleEvent;
use crate::ws::connection::{Connection, ConnectionInner, expire};
use crate::ws::router::SubscriptionKey;

/// Callback invoked with every new snapshot.
pub type Listener<S> = Arc<dyn Fn(&Arc<S>) + Send + Sync>;

/// How a snapshot is loaded and kept current.
#[async_trait]
pub(crate) trait Projection: Sized + Send + Sync + 'static {
    type Snapshot: Send + Sync + 'static;

    /// Event types the cache subscribes to, one subscription each.
    const EVENT_TYPES: &'static [&'static str];

    /// Full load, tagged with the sequence number of the last frame it reflects.
    async fn fetch(connection: &Connection) -> Result<Sequenced<Self::Snapshot>>;

    /// Next snapshot after `event`, or `None` if the event changes nothing.
    fn apply(snapshot: &Self::Snapshot, event: &Event) -> Option<Self::Snapshot>;

    /// Memo slot on the connection.
    fn slot(inner: &ConnectionInner) -> &Mutex<Option<Arc<SharedCache<Self>>>>;
}

#[derive(Clone)]
enum InitState {
    Pending,
    Ready,
    Failed(CacheInit),
}

struct CacheState<S> {
    snapshot: Option<Arc<S>>,
    listeners: Vec<(u64, Listener<S>)>,
    next_listener: u64,
    /// Set once the cache is being torn down; nothing may attach afterwards
    closed: bool,
}

pub(crate) struct SharedCache<P: Projection> {
    state: Mutex<CacheState<P::Snapshot>>,
    /// Serializes listener invocations so each listener sees snapshots in order
    dispatch: Mutex<()>,
    init: watch::Sender<InitState>,
    cancel: CancellationToken,
    owner: Weak<ConnectionInner>,
}

/// Registration of one cache listener.
///
/// Detaches on [`ListenerHandle::unsubscribe`] or when dropped. The cache
/// cancels its server subscriptions once its last listener is gone.
#[must_use = "dropping the handle detaches the listener"]
pub struct ListenerHandle {
    cache: Arc<dyn Detach>,
    id: u64,
    detached: AtomicBool,
}

impl ListenerHandle {
    /// Detach the listener. Calling this more than once is a no-op.
    pub fn unsubscribe(&self) {
        if !self.detached.swap(true, Ordering::AcqRel) {
            self.cache.detach(self.id);
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

trait Detach: Send + Sync {
    fn detach(&self, id: u64);
}

impl<P: Projection> Detach for SharedCache<P> {
    fn detach(&self, id: u64) {
        let emptied = {
            let mut state = lock(&self.state);
            let before = state.listeners.len();
            state.listeners.retain(|(listener, _)| *listener != id);

            let emptied =
                state.listeners.len() < before && state.listeners.is_empty() && !state.closed;
            if emptied {
                state.closed = true;
            }
            emptied
        };

        if emptied {
            #[cfg(feature = "tracing")]
            tracing::debug!(
                event_types = ?P::EVENT_TYPES,
                "last listener detached, tearing cache down"
            );
            self.shutdown();
        }
    }
}

impl<P: Projection> SharedCache<P> {
    fn new(owner: Weak<ConnectionInner>) -> Self {
        Self {
            state: Mutex::new(CacheState {
                snapshot: None,
                listeners: Vec::new(),
                next_listener: 0,
                closed: false,
            }),
            dispatch: Mutex::new(()),
            init: watch::Sender::new(InitState::Pending),
            cancel: CancellationToken::new(),
            owner,
        }
    }

    fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    fn snapshot(&self) -> Option<Arc<P::Snapshot>> {
        lock(&self.state).snapshot.clone()
    }

    /// Returns the listener id, or `None` if the cache is shutting down.
    fn add_listener(&self, listener: &Listener<P::Snapshot>) -> Option<u64> {
        let _dispatch = lock(&self.dispatch);

        let (id, snapshot) = {
            let mut state = lock(&self.state);
            if state.closed {
                return None;
            }
            let id = state.next_listener;
            state.next_listener += 1;
            state.listeners.push((id, Arc::clone(listener)));
            (id, state.snapshot.clone())
        };

        if let Some(snapshot) = snapshot {
            listener(&snapshot);
        }
        Some(id)
    }

    fn publish(&self, snapshot: P::Snapshot) {
        let _dispatch = lock(&self.dispatch);

        let snapshot = Arc::new(snapshot);
        let listeners: Vec<Listener<P::Snapshot>> = {
            let mut state = lock(&self.state);
            if state.closed {
                return;
            }
            state.snapshot = Some(Arc::clone(&snapshot));
            state
                .listeners
                .iter()
                .map(|(_, listener)| Arc::clone(listener))
                .collect()
        };

        for listener in listeners {
            listener(&snapshot);
        }
    }

    fn apply(&self, event: &Event) {
        let Some(current) = self.snapshot() else {
            return;
        };
        if let Some(next) = P::apply(&current, event) {
            self.publish(next);
        }
    }

    fn fail(&self, error: &Error) {
        lock(&self.state).closed = true;
        self.init.send_replace(InitState::Failed(CacheInit {
            kind: error.kind(),
            reason: error.to_string(),
        }));
        self.shutdown();
    }

    /// Stop the driver and free the memo slot if it still points here.
    fn shutdown(&self) {
        self.cancel.cancel();

        let Some(owner) = self.owner.upgrade() else {
            return;
        };
        let mut slot = lock(P::slot(&owner));
        if slot
            .as_ref()
            .is_some_and(|cache| std::ptr::eq(Arc::as_ptr(cache), self))
        {
            *slot = None;
        }
    }
}

/// Attach `listener` to the cache of `P`, starting it if needed, and wait for
/// the first snapshot.
pub(crate) async fn attach<P: Projection>(
    connection: &Connection,
    listener: Listener<P::Snapshot>,
) -> Result<ListenerHandle> {
    loop {
        let cache = get_or_start::<P>(connection);
        let Some(id) = cache.add_listener(&listener) else {
            // Lost a race with the last detach; the next lookup starts afresh
            continue;
        };

        let handle = ListenerHandle {
            cache: Arc::clone(&cache) as Arc<dyn Detach>,
            id,
            detached: AtomicBool::new(false),
        };

        let mut init = cache.init.subscribe();
        let outcome = init
            .wait_for(|state| !matches!(state, InitState::Pending))
            .await
            .map(|state| state.clone());

        return match outcome {
            Ok(InitState::Failed(e)) => Err(e.into()),
            Ok(_) => Ok(handle),
            Err(_) => Err(Error::connection_lost()),
        };
    }
}

/// Latest snapshot of `P`, if its cache is live.
pub(crate) fn current<P: Projection>(inner: &ConnectionInner) -> Option<Arc<P::Snapshot>> {
    let cache = lock(P::slot(inner)).clone()?;
    cache.snapshot()
}

fn get_or_start<P: Projection>(connection: &Connection) -> Arc<SharedCache<P>> {
    let inner = connection.inner();
    let mut slot = lock(P::slot(inner));

    if let Some(cache) = slot.as_ref()
        && !cache.is_closed()
    {
        return Arc::clone(cache);
    }

    let cache = Arc::new(SharedCache::new(Arc::downgrade(inner)));
    *slot = Some(Arc::clone(&cache));
    tokio::spawn(drive(Arc::clone(&cache), connection.clone()));
    cache
}

/// Driver task of one cache instance.
async fn drive<P: Projection>(cache: Arc<SharedCache<P>>, connection: Connection) {
    let (sink, mut events) = mpsc::unbounded_channel();
    let mut lifecycle = connection.lifecycle();
    let mut keys = Vec::new();

    let initial = tokio::select! {
        () = cache.cancel.cancelled() => None,
        result = setup::<P>(&connection, &sink, &mut keys) => Some(result),
    };

    let mut fence = match initial {
        Some(Ok(Sequenced { seq, value })) => {
            cache.publish(value);
            cache.init.send_replace(InitState::Ready);
            seq
        }
        Some(Err(e)) => {
            #[cfg(feature = "tracing")]
            tracing::warn!(error = %e, event_types = ?P::EVENT_TYPES, "cache initialization failed");
            cache.fail(&e);
            release(&connection, keys);
            return;
        }
        None => {
            release(&connection, keys);
            return;
        }
    };

    // Set after a refetch the server refused; a lost socket waits for `ready`
    let mut retry: Option<Instant> = None;

    loop {
        let refetch = tokio::select! {
            () = cache.cancel.cancelled() => break,

            Some(event) = events.recv() => {
                // Already part of the last fetch
                if event.seq > fence {
                    cache.apply(&event.value);
                }
                false
            }

            () = expire(retry) => true,

            notification = lifecycle.recv() => match notification {
                Ok(LifecycleEvent::Ready) | Err(RecvError::Lagged(_)) => true,
                Ok(LifecycleEvent::Closed) | Err(RecvError::Closed) => {
                    cache.fail(&Error::connection_lost());
                    break;
                }
                Ok(_) => false,
            },
        };
        if !refetch {
            continue;
        }

        retry = None;
        let fetched = tokio::select! {
            () = cache.cancel.cancelled() => break,
            fetched = P::fetch(&connection) => fetched,
        };
        match fetched {
            Ok(Sequenced { seq, value }) => {
                fence = seq;
                cache.publish(value);
            }
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %e, event_types = ?P::EVENT_TYPES, "cache refetch failed");
                if e.kind() != Kind::ConnectionLost {
                    retry = Some(Instant::now() + connection.retry_delay());
                }
            }
        }
    }

    release(&connection, keys);
}

async fn setup<P: Projection>(
    connection: &Connection,
    sink: &mpsc::UnboundedSender<Sequenced<Event>>,
    keys: &mut Vec<SubscriptionKey>,
) -> Result<Sequenced<P::Snapshot>> {
    for event_type in P::EVENT_TYPES {
        let key = connection
            .subscribe_with_sink(Some(event_type), sink.clone())
            .await?;
        keys.push(key);
    }
    P::fetch(connection).await
}

fn release(connection: &Connection, keys: Vec<SubscriptionKey>) {
    for key in keys {
        connection.release(key);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
