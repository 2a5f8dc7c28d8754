//! Map overlay store: an unordered identity map plus named layer groups.
//!
//! Group visibility is remembered even while a group holds nothing. Hiding or
//! showing an unknown group only records the wish; the first item added to it
//! materializes the group in the last recorded state, defaulting to visible.

use crate::error::{RegistryConflict, Result};
use crate::protocol::{MapItemPayload, Shape};
use crate::registry::KeyedRegistry;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GroupVisibility {
    /// Never touched.
    #[default]
    Absent,
    Hidden,
    Visible,
}

/// Where an item is attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    Primary,
    Groups(BTreeSet<String>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct MapItem {
    pub shape: Shape,
    pub properties: Map<String, Value>,
    pub popup_text: Option<String>,
    pub placement: Placement,
}

#[derive(Debug, Default)]
struct LayerGroup {
    visibility: GroupVisibility,
    /// `None` until the first item joins.
    members: Option<BTreeSet<String>>,
}

#[derive(Debug)]
pub struct LayeredItems {
    items: KeyedRegistry<MapItem>,
    primary: BTreeSet<String>,
    groups: BTreeMap<String, LayerGroup>,
}

impl LayeredItems {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            items: KeyedRegistry::new(label),
            primary: BTreeSet::new(),
            groups: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.items.contains(key)
    }

    pub fn get(&self, key: &str) -> Option<&MapItem> {
        self.items.get(key)
    }

    /// Register an item decoded from an `ADD_MARKER`/`ADD_LINE` envelope.
    pub fn add_payload(&mut self, payload: MapItemPayload) -> Result<Placement> {
        let groups = payload.groups();
        self.add(
            &payload.key,
            payload.shape,
            payload.properties,
            payload.popup_text,
            groups.as_deref().unwrap_or_default(),
        )
    }

    /// Register `key` into the given groups, or the primary layer when `groups`
    /// is empty.
    pub fn add(
        &mut self,
        key: &str,
        shape: Shape,
        properties: Map<String, Value>,
        popup_text: Option<String>,
        groups: &[String],
    ) -> Result<Placement> {
        if self.items.contains(key) {
            return Err(RegistryConflict::DuplicateKey(key.to_string()).into());
        }
        let placement = if groups.is_empty() {
            Placement::Primary
        } else {
            Placement::Groups(groups.iter().cloned().collect())
        };
        match &placement {
            Placement::Primary => {
                self.primary.insert(key.to_string());
            }
            Placement::Groups(names) => {
                for name in names {
                    self.join(name, key);
                }
            }
        }
        self.items.add(
            key,
            MapItem {
                shape,
                properties,
                popup_text,
                placement: placement.clone(),
            },
        );
        debug!(widget = %self.items.label(), key, "map item added");
        Ok(placement)
    }

    /// Remove `key` from whichever layers currently hold it.
    pub fn remove(&mut self, key: &str) -> Result<MapItem> {
        if !self.items.contains(key) {
            return Err(RegistryConflict::MissingKey(key.to_string()).into());
        }
        let item = self
            .items
            .remove(key)
            .ok_or_else(|| RegistryConflict::MissingKey(key.to_string()))?;
        match &item.placement {
            Placement::Primary => {
                self.primary.remove(key);
            }
            Placement::Groups(names) => {
                for name in names {
                    if let Some(members) = self
                        .groups
                        .get_mut(name)
                        .and_then(|group| group.members.as_mut())
                    {
                        members.remove(key);
                    }
                }
            }
        }
        debug!(widget = %self.items.label(), key, "map item removed");
        Ok(item)
    }

    pub fn hide_group(&mut self, name: &str) {
        self.groups.entry(name.to_string()).or_default().visibility = GroupVisibility::Hidden;
    }

    pub fn show_group(&mut self, name: &str) {
        self.groups.entry(name.to_string()).or_default().visibility = GroupVisibility::Visible;
    }

    pub fn visibility(&self, name: &str) -> GroupVisibility {
        self.groups
            .get(name)
            .map_or(GroupVisibility::Absent, |group| group.visibility)
    }

    pub fn is_materialized(&self, name: &str) -> bool {
        self.groups
            .get(name)
            .is_some_and(|group| group.members.is_some())
    }

    pub fn group_len(&self, name: &str) -> usize {
        self.groups
            .get(name)
            .and_then(|group| group.members.as_ref())
            .map_or(0, BTreeSet::len)
    }

    pub fn primary_len(&self) -> usize {
        self.primary.len()
    }

    /// Whether `key` is on screen: in the primary layer or in at least one
    /// visible group.
    pub fn is_attached(&self, key: &str) -> bool {
        match self.items.get(key).map(|item| &item.placement) {
            None => false,
            Some(Placement::Primary) => true,
            Some(Placement::Groups(names)) => names
                .iter()
                .any(|name| self.visibility(name) == GroupVisibility::Visible),
        }
    }

    /// Drop every item of one group. Items also in other groups stay
    /// registered there.
    pub fn clear_group(&mut self, name: &str) {
        let Some(members) = self
            .groups
            .get_mut(name)
            .and_then(|group| group.members.as_mut())
            .map(std::mem::take)
        else {
            return;
        };
        for key in members {
            let orphaned = match self.items.get_mut(&key).map(|item| &mut item.placement) {
                Some(Placement::Groups(names)) => {
                    names.remove(name);
                    names.is_empty()
                }
                _ => false,
            };
            if orphaned {
                self.items.remove(&key);
            }
        }
    }

    /// Remove every item from every layer. Group visibility is kept.
    pub fn clear(&mut self) {
        let removed = self.items.drain().count();
        self.primary.clear();
        for group in self.groups.values_mut() {
            if let Some(members) = group.members.as_mut() {
                members.clear();
            }
        }
        debug!(widget = %self.items.label(), removed, "map layers cleared");
    }

    fn join(&mut self, name: &str, key: &str) {
        let group = self.groups.entry(name.to_string()).or_default();
        if group.visibility == GroupVisibility::Absent {
            group.visibility = GroupVisibility::Visible;
        }
        group
            .members
            .get_or_insert_with(BTreeSet::new)
            .insert(key.to_string());
    }
}
