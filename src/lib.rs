#![cfg_attr(doc, doc = include_str!("../README.md"))]

pub mod cache;
pub mod error;
pub(crate) mod serde_helpers;
pub mod types;
pub mod views;
pub mod ws;

use crate::error::Error;

pub use crate::cache::ListenerHandle;
pub use crate::cache::config::ConfigSnapshot;
pub use crate::types::request::Request;
pub use crate::types::{Entities, Entity, Event};
pub use crate::ws::{Config, Connection, ConnectionState, LifecycleEvent};

pub type Result<T> = std::result::Result<T, Error>;
