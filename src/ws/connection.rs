#![expect(
    clippy::module_name_repetitions,
    reason = "Connection types expose their domain in the name for clarity"
)]

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use backoff::backoff::Backoff as _;
use futures::{SinkExt as _, StreamExt as _};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{self, Interval, sleep};
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use super::config::{Config, ReconnectBackoff};
use super::error::WsError;
use super::handshake::{self, WsStream};
use super::router::{Command, EventSink, Router, SubscriptionKey};
use super::subscription::EventSubscription;
use crate::cache::config::{ConfigProjection, ConfigSnapshot};
use crate::cache::entities::EntityProjection;
use crate::cache::{self, ListenerHandle, SharedCache};
use crate::error::Error;
use crate::serde_helpers::deserialize_with_warnings;
use crate::types::request::Request;
use crate::types::{CoreConfig, Entities, Entity, Panels, Sequenced, Services};
use crate::Result;

/// Broadcast channel capacity for lifecycle notifications.
const LIFECYCLE_CAPACITY: usize = 16;

/// Connection state tracking.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Running a handshake
    Connecting,
    /// Authenticated and serving commands
    Open {
        /// When the current socket was authenticated
        since: Instant,
    },
    /// Waiting to reconnect after the socket dropped
    Disconnected {
        /// Consecutive failed reconnection attempts so far
        attempt: u32,
    },
    /// Closed for good, either on request or after a terminal failure
    Closed,
}

impl ConnectionState {
    /// Check if the connection is currently active.
    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(self, Self::Open { .. })
    }
}

/// Notifications fired by the connection task.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
pub enum LifecycleEvent {
    /// A socket was authenticated, on first connect and after every reconnect.
    /// Subscriptions have been re-sent by the time this fires.
    Ready,
    /// The socket dropped. Fires once per loss, after which every pending
    /// command has been rejected.
    Disconnected,
    /// The connection will not reconnect anymore
    Closed,
}

/// Handle to an authenticated, self-healing connection.
///
/// Cloning is cheap and every clone talks to the same background task. The
/// task owns the socket: it correlates command ids, replays event subscriptions
/// after a reconnect and reconnects with a capped linear backoff.
///
/// # Example
///
/// ```no_run
/// use hass_ws_client::ws::{Config, Connection};
///
/// # async fn run() -> hass_ws_client::Result<()> {
/// let config = Config::builder().auth_token("my-password".to_owned()).build();
/// let connection = Connection::connect("ws://localhost:8123/api/websocket", config).await?;
///
/// let states = connection.get_states().await?;
/// println!("{} entities", states.len());
///
/// connection.close();
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

pub(crate) struct ConnectionInner {
    commands: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
    lifecycle_tx: broadcast::Sender<LifecycleEvent>,
    retry_delay: Duration,
    pub(crate) entities: Mutex<Option<Arc<SharedCache<EntityProjection>>>>,
    pub(crate) config: Mutex<Option<Arc<SharedCache<ConfigProjection>>>>,
}

impl Connection {
    /// Authenticate against `endpoint` and start the connection task.
    ///
    /// Fails with [`crate::error::Kind::CannotConnect`] once the handshake
    /// retries are exhausted and with [`crate::error::Kind::InvalidAuth`] when
    /// the credentials are rejected.
    pub async fn connect(endpoint: &str, config: Config) -> Result<Self> {
        let url = Url::parse(endpoint)?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(Error::validation(format!(
                "unsupported scheme {}, expected ws or wss",
                url.scheme()
            )));
        }

        let socket = handshake::connect(endpoint, &config).await?;

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Open {
            since: Instant::now(),
        });
        let (lifecycle_tx, _) = broadcast::channel(LIFECYCLE_CAPACITY);

        let retry_delay = config.retry_delay;
        let mut task = ConnectionTask {
            endpoint: endpoint.to_owned(),
            backoff: ReconnectBackoff::from(&config.reconnect),
            config,
            router: Router::new(),
            commands: command_rx,
            state_tx,
            lifecycle_tx: lifecycle_tx.clone(),
        };
        // Announced before anyone can listen, so the first `ready` is never
        // mistaken for a reconnect
        let replay = task.begin_session();
        tokio::spawn(task.run(socket, replay));

        Ok(Self {
            inner: Arc::new(ConnectionInner {
                commands,
                state_rx,
                lifecycle_tx,
                retry_delay,
                entities: Mutex::new(None),
                config: Mutex::new(None),
            }),
        })
    }

    /// Stop reconnecting and close the socket.
    ///
    /// Pending commands fail with `ConnectionLost`, and so does anything sent
    /// afterwards. Live caches stop and [`Connection::entities`] and
    /// [`Connection::config`] return `None` from then on.
    pub fn close(&self) {
        _ = self.inner.commands.send(Command::Close);
    }

    /// Get the current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state_rx.borrow()
    }

    /// Subscribe to connection state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_rx.clone()
    }

    /// Subscribe to `ready`/`disconnected` notifications.
    ///
    /// Only notifications fired after this call are received.
    #[must_use]
    pub fn lifecycle(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.inner.lifecycle_tx.subscribe()
    }

    /// Send a command and wait for its `result` payload.
    ///
    /// Fails with `ConnectionLost` if the socket is down when the command is
    /// issued or drops before the result arrives, and with `Server` if the
    /// server reports a failure.
    pub async fn send(&self, request: Request) -> Result<Value> {
        Ok(self.request_sequenced(request).await?.value)
    }

    /// All current entity states.
    pub async fn get_states(&self) -> Result<Vec<Entity>> {
        Ok(self.fetch(Request::GetStates).await?.value)
    }

    /// Core configuration, including the loaded components.
    pub async fn get_config(&self) -> Result<CoreConfig> {
        Ok(self.fetch(Request::GetConfig).await?.value)
    }

    /// Registered services, keyed by domain.
    pub async fn get_services(&self) -> Result<Services> {
        Ok(self.fetch(Request::GetServices).await?.value)
    }

    /// Registered frontend panels.
    pub async fn get_panels(&self) -> Result<Panels> {
        Ok(self.fetch(Request::GetPanels).await?.value)
    }

    /// Call `domain.service`, returning whatever the server puts in `result`.
    pub async fn call_service(
        &self,
        domain: &str,
        service: &str,
        service_data: Option<Value>,
    ) -> Result<Value> {
        self.send(Request::call_service(domain, service, service_data))
            .await
    }

    /// Round trip a `ping`.
    pub async fn ping(&self) -> Result<()> {
        self.send(Request::Ping).await.map(drop)
    }

    /// Open an independent server-side subscription.
    ///
    /// `None` subscribes to every event type.
    pub async fn subscribe_events(&self, event_type: Option<&str>) -> Result<EventSubscription> {
        let (sink, events) = mpsc::unbounded_channel();
        let key = self.subscribe_with_sink(event_type, sink).await?;
        Ok(EventSubscription::new(
            key,
            events,
            self.inner.commands.clone(),
        ))
    }

    /// Register `listener` with the shared entity cache.
    ///
    /// The first listener starts the cache: one `state_changed` subscription
    /// and one `get_states` fetch, shared by every later listener. `listener`
    /// runs with each new snapshot, and right away if one is already loaded.
    /// It must not register further listeners on the same cache.
    ///
    /// After a reconnect the states are fetched again. A fetch the server
    /// refuses is retried every `retry_delay` until one succeeds. Once the
    /// connection closes the cache stops and new listeners are refused with
    /// `ConnectionLost`.
    pub async fn subscribe_entities<F>(&self, listener: F) -> Result<ListenerHandle>
    where
        F: Fn(&Arc<Entities>) + Send + Sync + 'static,
    {
        cache::attach::<EntityProjection>(self, Arc::new(listener)).await
    }

    /// Register `listener` with the shared configuration cache.
    ///
    /// Same contract as [`Connection::subscribe_entities`], backed by
    /// `get_config`, `get_services` and `get_panels`.
    pub async fn subscribe_config<F>(&self, listener: F) -> Result<ListenerHandle>
    where
        F: Fn(&Arc<ConfigSnapshot>) + Send + Sync + 'static,
    {
        cache::attach::<ConfigProjection>(self, Arc::new(listener)).await
    }

    /// Latest entity snapshot, if the entity cache is live.
    #[must_use]
    pub fn entities(&self) -> Option<Arc<Entities>> {
        cache::current::<EntityProjection>(&self.inner)
    }

    /// Latest configuration snapshot, if the configuration cache is live.
    #[must_use]
    pub fn config(&self) -> Option<Arc<ConfigSnapshot>> {
        cache::current::<ConfigProjection>(&self.inner)
    }

    /// Pause before a cache retries a fetch the server refused.
    pub(crate) fn retry_delay(&self) -> Duration {
        self.inner.retry_delay
    }

    pub(crate) fn inner(&self) -> &Arc<ConnectionInner> {
        &self.inner
    }

    pub(crate) async fn request_sequenced(&self, request: Request) -> Result<Sequenced<Value>> {
        let (reply, rx) = oneshot::channel();
        self.inner
            .commands
            .send(Command::Request { request, reply })
            .map_err(|_e| WsError::ConnectionClosed)?;
        rx.await.map_err(|_e| WsError::ConnectionClosed)?
    }

    pub(crate) async fn fetch<T: DeserializeOwned>(&self, request: Request) -> Result<Sequenced<T>> {
        let Sequenced { seq, value } = self.request_sequenced(request).await?;
        Ok(Sequenced {
            seq,
            value: deserialize_with_warnings(value)?,
        })
    }

    pub(crate) async fn subscribe_with_sink(
        &self,
        event_type: Option<&str>,
        sink: EventSink,
    ) -> Result<SubscriptionKey> {
        let (reply, rx) = oneshot::channel();
        self.inner
            .commands
            .send(Command::Subscribe {
                event_type: event_type.map(str::to_owned),
                sink,
                reply,
            })
            .map_err(|_e| WsError::ConnectionClosed)?;
        rx.await.map_err(|_e| WsError::ConnectionClosed)?
    }

    /// Fire-and-forget unsubscribe.
    pub(crate) fn release(&self, key: SubscriptionKey) {
        _ = self
            .inner
            .commands
            .send(Command::Unsubscribe { key, reply: None });
    }
}

/// Why [`ConnectionTask::serve`] returned.
enum Exit {
    Lost,
    Close,
}

/// The background task that owns the socket.
struct ConnectionTask {
    endpoint: String,
    config: Config,
    backoff: ReconnectBackoff,
    router: Router,
    commands: mpsc::UnboundedReceiver<Command>,
    state_tx: watch::Sender<ConnectionState>,
    lifecycle_tx: broadcast::Sender<LifecycleEvent>,
}

impl ConnectionTask {
    async fn run(mut self, mut socket: WsStream, mut replay: Vec<String>) {
        loop {
            if let Exit::Close = self.serve(socket, replay).await {
                break;
            }

            #[cfg(feature = "tracing")]
            tracing::debug!("connection lost");
            _ = self.lifecycle_tx.send(LifecycleEvent::Disconnected);
            self.router.fail_pending();

            match self.reconnect().await {
                Some(next) => {
                    socket = next;
                    replay = self.begin_session();
                }
                None => break,
            }
        }

        self.commands.close();
        self.router.fail_pending();
        _ = self.state_tx.send(ConnectionState::Closed);
        _ = self.lifecycle_tx.send(LifecycleEvent::Closed);
    }

    /// Reset the router for a new socket and fire `ready`.
    ///
    /// Returns the subscription replay, which [`ConnectionTask::serve`] writes
    /// before it reads any command, so commands issued in reaction to `ready`
    /// always reach the server after the replay.
    fn begin_session(&mut self) -> Vec<String> {
        let replay = self.router.begin_session();
        _ = self.state_tx.send(ConnectionState::Open {
            since: Instant::now(),
        });
        _ = self.lifecycle_tx.send(LifecycleEvent::Ready);
        replay
    }

    /// Drive one authenticated socket until it drops or a close is requested.
    async fn serve(&mut self, socket: WsStream, replay: Vec<String>) -> Exit {
        let (mut write, mut read) = socket.split();

        for frame in replay {
            if write.send(Message::Text(frame.into())).await.is_err() {
                return Exit::Lost;
            }
        }

        let mut heartbeat = self
            .config
            .heartbeat_interval
            .map(|period| time::interval_at(time::Instant::now() + period, period));
        let mut ping: Option<(time::Instant, oneshot::Receiver<Result<Sequenced<Value>>>)> = None;

        loop {
            let mut outgoing = Vec::new();

            tokio::select! {
                message = read.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            #[cfg(feature = "tracing")]
                            tracing::trace!(%text, "Received WebSocket text message");
                            outgoing = self.router.handle_text(&text);
                        }
                        Some(Ok(Message::Close(_))) | None => return Exit::Lost,
                        Some(Err(e)) => {
                            #[cfg(feature = "tracing")]
                            tracing::warn!(error = %e, "WebSocket read failed");
                            #[cfg(not(feature = "tracing"))]
                            let _ = &e;
                            return Exit::Lost;
                        }
                        Some(Ok(_)) => {
                            // Binary and control frames carry nothing for us
                        }
                    }
                }

                command = self.commands.recv() => {
                    match command {
                        None | Some(Command::Close) => {
                            _ = write.send(Message::Close(None)).await;
                            return Exit::Close;
                        }
                        Some(command) => outgoing.extend(self.router.handle_command(command)),
                    }
                }

                () = tick(heartbeat.as_mut()) => {
                    let answered = ping.as_mut().is_none_or(|(_, rx)| rx.try_recv().is_ok());
                    if answered && let Some((frame, rx)) = self.router.ping() {
                        ping = Some((time::Instant::now() + self.config.heartbeat_timeout, rx));
                        outgoing.push(frame);
                    }
                }

                () = expire(ping.as_ref().map(|(deadline, _)| *deadline)) => {
                    if let Some((_, mut rx)) = ping.take()
                        && rx.try_recv().is_err()
                    {
                        #[cfg(feature = "tracing")]
                        tracing::warn!(
                            "Heartbeat timeout: no pong received within {:?}",
                            self.config.heartbeat_timeout
                        );
                        return Exit::Lost;
                    }
                }
            }

            for frame in outgoing {
                if write.send(Message::Text(frame.into())).await.is_err() {
                    return Exit::Lost;
                }
            }
        }
    }

    /// Handshake until a new socket is authenticated.
    ///
    /// Commands arriving meanwhile are rejected right away. Returns `None` when
    /// the connection should close instead.
    async fn reconnect(&mut self) -> Option<WsStream> {
        let endpoint = self.endpoint.clone();
        let token = self.config.auth_token.clone();
        let state_tx = self.state_tx.clone();

        loop {
            let failures = self.backoff.attempt();
            if let Some(max) = self.config.reconnect.max_attempts
                && failures >= max
            {
                #[cfg(feature = "tracing")]
                tracing::error!(attempts = failures, "giving up reconnecting");
                return None;
            }

            _ = self.state_tx.send(ConnectionState::Disconnected { attempt: failures });
            let delay = self.backoff.next_backoff()?;

            let attempt = async {
                sleep(delay).await;
                _ = state_tx.send(ConnectionState::Connecting);
                handshake::attempt(&endpoint, token.as_ref()).await
            };
            tokio::pin!(attempt);

            let result = loop {
                tokio::select! {
                    result = &mut attempt => break result,
                    command = self.commands.recv() => match command {
                        None | Some(Command::Close) => return None,
                        Some(command) => self.router.reject_offline(command),
                    },
                }
            };

            match result {
                Ok(socket) => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(attempts = self.backoff.attempt(), "reconnected");
                    self.backoff.reset();
                    return Some(socket);
                }
                Err(e) if e.is_terminal() => {
                    #[cfg(feature = "tracing")]
                    tracing::error!(error = %e, "reconnect rejected");
                    #[cfg(not(feature = "tracing"))]
                    let _ = &e;
                    return None;
                }
                Err(e) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(error = %e, "Unable to reconnect");
                    #[cfg(not(feature = "tracing"))]
                    let _ = &e;
                }
            }
        }
    }
}

async fn tick(heartbeat: Option<&mut Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

pub(crate) async fn expire(deadline: Option<time::Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
