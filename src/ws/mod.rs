//! Connection to the websocket API.
//!
//! # Architecture
//!
//! - [`Connection`]: cloneable handle to a background task that owns the socket
//! - `handshake`: opens a socket and runs the `auth` exchange, with retries
//! - `router`: command-id correlation, event routing and subscription replay
//! - [`EventSubscription`]: a stream of server-pushed events
//!
//! # Example
//!
//! ```no_run
//! use futures::StreamExt as _;
//! use hass_ws_client::ws::{Config, Connection};
//!
//! # async fn run() -> hass_ws_client::Result<()> {
//! let connection = Connection::connect("ws://localhost:8123/api/websocket", Config::default()).await?;
//! let mut events = connection.subscribe_events(Some("state_changed")).await?;
//! while let Some(event) = events.next().await {
//!     println!("{}", event.data["entity_id"]);
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub(crate) mod handshake;
pub(crate) mod router;
pub mod subscription;

pub use config::{Config, ReconnectConfig};
pub use connection::{Connection, ConnectionState, LifecycleEvent};
#[expect(
    clippy::module_name_repetitions,
    reason = "WsError includes module name for clarity when used outside this module"
)]
pub use error::WsError;
pub use subscription::EventSubscription;
