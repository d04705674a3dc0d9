use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{Projection, SharedCache};
use crate::Result;
use crate::types::request::Request;
use crate::types::{Entities, Entity, Event, Sequenced, StateChanged};
use crate::ws::connection::{Connection, ConnectionInner};

/// Entity states keyed by id, kept current by `state_changed`.
pub(crate) struct EntityProjection;

#[async_trait]
impl Projection for EntityProjection {
    type Snapshot = Entities;

    const EVENT_TYPES: &'static [&'static str] = &["state_changed"];

    async fn fetch(connection: &Connection) -> Result<Sequenced<Entities>> {
        let Sequenced { seq, value } = connection.fetch::<Vec<Entity>>(Request::GetStates).await?;
        let entities = value
            .into_iter()
            .map(|entity| (entity.entity_id.clone(), entity))
            .collect();
        Ok(Sequenced {
            seq,
            value: entities,
        })
    }

    fn apply(snapshot: &Entities, event: &Event) -> Option<Entities> {
        let change = match serde_json::from_value::<StateChanged>(event.data.clone()) {
            Ok(change) => change,
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %e, data = %event.data, "malformed state_changed event");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
                return None;
            }
        };

        let mut next = snapshot.clone();
        match change.new_state {
            Some(entity) => {
                next.insert(entity.entity_id.clone(), entity);
            }
            None => {
                next.remove(&change.entity_id);
            }
        }
        Some(next)
    }

    fn slot(inner: &ConnectionInner) -> &Mutex<Option<Arc<SharedCache<Self>>>> {
        &inner.entities
    }
}
