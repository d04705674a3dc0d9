use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Deserialize;

use super::{Projection, SharedCache};
use crate::Result;
use crate::types::request::Request;
use crate::types::{CoreConfig, Event, Panels, Sequenced, ServiceDescriptor, Services};
use crate::ws::connection::{Connection, ConnectionInner};

/// Server configuration as seen by the frontend.
#[non_exhaustive]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigSnapshot {
    pub core: CoreConfig,
    pub services: Services,
    pub panels: Panels,
}

#[derive(Deserialize)]
struct ComponentLoaded {
    component: String,
}

#[derive(Deserialize)]
struct ServiceChange {
    domain: String,
    service: String,
}

pub(crate) struct ConfigProjection;

#[async_trait]
impl Projection for ConfigProjection {
    type Snapshot = ConfigSnapshot;

    const EVENT_TYPES: &'static [&'static str] =
        &["component_loaded", "service_registered", "service_removed"];

    async fn fetch(connection: &Connection) -> Result<Sequenced<ConfigSnapshot>> {
        let (core, services, panels) = futures::try_join!(
            connection.fetch::<CoreConfig>(Request::GetConfig),
            connection.fetch::<Services>(Request::GetServices),
            connection.fetch::<Panels>(Request::GetPanels),
        )?;

        // Events after the earliest of the three are replayed on top; every
        // fold below is idempotent so overlap with later results is harmless
        let seq = core.seq.min(services.seq).min(panels.seq);
        Ok(Sequenced {
            seq,
            value: ConfigSnapshot {
                core: core.value,
                services: services.value,
                panels: panels.value,
            },
        })
    }

    fn apply(snapshot: &ConfigSnapshot, event: &Event) -> Option<ConfigSnapshot> {
        let mut next = snapshot.clone();

        match event.event_type.as_str() {
            "component_loaded" => {
                let loaded = decode::<ComponentLoaded>(event)?;
                next.core.components.insert(loaded.component);
            }
            "service_registered" => {
                let change = decode::<ServiceChange>(event)?;
                next.services
                    .entry(change.domain)
                    .or_default()
                    .entry(change.service)
                    .or_insert_with(ServiceDescriptor::default);
            }
            "service_removed" => {
                let change = decode::<ServiceChange>(event)?;
                if let Some(services) = next.services.get_mut(&change.domain) {
                    services.remove(&change.service);
                    if services.is_empty() {
                        next.services.remove(&change.domain);
                    }
                }
            }
            _ => return None,
        }

        Some(next)
    }

    fn slot(inner: &ConnectionInner) -> &Mutex<Option<Arc<SharedCache<Self>>>> {
        &inner.config
    }
}

fn decode<T: serde::de::DeserializeOwned>(event: &Event) -> Option<T> {
    serde_json::from_value(event.data.clone())
        .inspect_err(|e| {
            #[cfg(feature = "tracing")]
            tracing::warn!(error = %e, event_type = %event.event_type, "malformed event");
            #[cfg(not(feature = "tracing"))]
            let _ = e;
        })
        .ok()
}
