//! Grouping and dashboard-view helpers over an entity snapshot.
//!
//! All functions are pure: they read a snapshot (usually the one handed to an
//! entity cache listener) and return owned results.

use std::cmp::Ordering;
use std::collections::HashSet;

use crate::types::{DEFAULT_VIEW_ENTITY_ID, Entities, Entity};

pub use crate::types::{extract_domain, extract_object_id};

/// Result of [`split_by_groups`].
#[non_exhaustive]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupSplit {
    /// Group entities, ascending by `order`
    pub groups: Vec<Entity>,
    /// Every non-group entity that no group lists as a member
    pub ungrouped: Entities,
}

/// Members of `group` that exist in `entities`.
#[must_use]
pub fn get_group_entities(entities: &Entities, group: &Entity) -> Entities {
    group
        .member_ids()
        .filter_map(|id| entities.get(id))
        .map(|entity| (entity.entity_id.clone(), entity.clone()))
        .collect()
}

/// Partition `entities` into groups and the entities that belong to none.
#[must_use]
pub fn split_by_groups(entities: &Entities) -> GroupSplit {
    let (mut groups, mut ungrouped): (Vec<Entity>, Vec<Entity>) =
        entities.values().cloned().partition(Entity::is_group);

    groups.sort_by(by_order);

    let members: HashSet<&str> = groups.iter().flat_map(Entity::member_ids).collect();
    ungrouped.retain(|entity| !members.contains(entity.entity_id.as_str()));

    GroupSplit {
        ungrouped: ungrouped
            .into_iter()
            .map(|entity| (entity.entity_id.clone(), entity))
            .collect(),
        groups,
    }
}

/// Everything shown on `view`: its visible members, with nested groups
/// expanded recursively.
///
/// Hidden entities are left out together with anything reachable only
/// through them. A group that lists itself, directly or through another
/// group, is expanded once.
#[must_use]
pub fn get_view_entities(entities: &Entities, view: &Entity) -> Entities {
    let mut result = Entities::new();
    let mut visited = HashSet::from([view.entity_id.as_str()]);
    let mut stack: Vec<&Entity> = vec![view];

    while let Some(group) = stack.pop() {
        for id in group.member_ids() {
            let Some(entity) = entities.get(id) else {
                continue;
            };
            if entity.is_hidden() {
                continue;
            }
            result.insert(entity.entity_id.clone(), entity.clone());
            if entity.is_group() && visited.insert(entity.entity_id.as_str()) {
                stack.push(entity);
            }
        }
    }

    result
}

/// All view entities, default view first, then ascending by `order`.
#[must_use]
pub fn extract_views(entities: &Entities) -> Vec<Entity> {
    let mut views: Vec<Entity> = entities
        .values()
        .filter(|entity| entity.is_view())
        .cloned()
        .collect();

    views.sort_by(|a, b| {
        match (
            a.entity_id == DEFAULT_VIEW_ENTITY_ID,
            b.entity_id == DEFAULT_VIEW_ENTITY_ID,
        ) {
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            _ => by_order(a, b),
        }
    });
    views
}

/// Ascending `order`; entities without one go last, ties broken by id so the
/// result does not depend on map iteration order.
fn by_order(a: &Entity, b: &Entity) -> Ordering {
    let order = match (a.order(), b.order()) {
        (Some(a), Some(b)) => a.total_cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    order.then_with(|| a.entity_id.cmp(&b.entity_id))
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};

    use super::*;

    fn entity(entity_id: &str, attributes: &Value) -> (String, Entity) {
        let mut entity = Entity::new(entity_id, "on");
        if let Value::Object(map) = attributes {
            entity.attributes = map.clone();
        }
        (entity_id.to_owned(), entity)
    }

    fn ids(entities: &[Entity]) -> Vec<&str> {
        entities.iter().map(|e| e.entity_id.as_str()).collect()
    }

    fn sorted_keys(entities: &Entities) -> Vec<&str> {
        let mut keys: Vec<&str> = entities.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    #[test]
    fn default_view_comes_first() {
        let entities: Entities = [
            entity("group.default_view", &json!({"view": true, "order": 5})),
            entity("group.kitchen", &json!({"view": true, "order": 1})),
            entity("group.office", &json!({"view": true, "order": 2})),
            entity("group.not_a_view", &json!({"order": 0})),
        ]
        .into();

        assert_eq!(
            ids(&extract_views(&entities)),
            ["group.default_view", "group.kitchen", "group.office"]
        );
    }

    #[test]
    fn views_without_order_sort_last() {
        let entities: Entities = [
            entity("group.b", &json!({"view": true})),
            entity("group.a", &json!({"view": true, "order": 9})),
        ]
        .into();

        assert_eq!(ids(&extract_views(&entities)), ["group.a", "group.b"]);
    }

    #[test]
    fn split_removes_group_members() {
        let entities: Entities = [
            entity("group.g1", &json!({"entity_id": ["light.a"]})),
            entity("light.a", &json!({})),
            entity("light.b", &json!({})),
        ]
        .into();

        let split = split_by_groups(&entities);
        assert_eq!(ids(&split.groups), ["group.g1"]);
        assert_eq!(sorted_keys(&split.ungrouped), ["light.b"]);
    }

    #[test]
    fn split_sorts_groups_by_order() {
        let entities: Entities = [
            entity("group.late", &json!({"order": 3})),
            entity("group.early", &json!({"order": 1.5})),
        ]
        .into();

        assert_eq!(
            ids(&split_by_groups(&entities).groups),
            ["group.early", "group.late"]
        );
    }

    #[test]
    fn group_entities_skip_missing_members() {
        let (_, group) = entity("group.g", &json!({"entity_id": ["light.a", "light.gone"]}));
        let entities: Entities = [entity("light.a", &json!({}))].into();

        assert_eq!(sorted_keys(&get_group_entities(&entities, &group)), ["light.a"]);
    }

    #[test]
    fn view_entities_expand_nested_groups_and_skip_hidden() {
        let (_, view) = entity(
            "group.default_view",
            &json!({"view": true, "entity_id": ["group.lights", "sensor.secret"]}),
        );
        let entities: Entities = [
            entity("group.lights", &json!({"entity_id": ["light.a", "group.inner"]})),
            entity("group.inner", &json!({"entity_id": ["light.b", "light.hidden", "group.lights"]})),
            entity("light.a", &json!({})),
            entity("light.b", &json!({})),
            entity("light.hidden", &json!({"hidden": true})),
            entity("sensor.secret", &json!({"hidden": true})),
        ]
        .into();

        assert_eq!(
            sorted_keys(&get_view_entities(&entities, &view)),
            ["group.inner", "group.lights", "light.a", "light.b"]
        );
    }

    #[test]
    fn reexported_id_helpers() {
        assert_eq!(extract_domain("group.kitchen"), "group");
        assert_eq!(extract_object_id("group.kitchen"), "kitchen");
    }
}
