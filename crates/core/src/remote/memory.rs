//! In-process control plane used for rehearsals and tests.
//!
//! It keeps a scene/group/source layout in memory, records every visibility
//! change and can be told to refuse connections or fail individual lookups.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Instant,
};

use super::{Connector, ItemId, Lookup, VisibilityClient};
use crate::{Result, VoiceLayerError};

/// One recorded `set_visible` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisibilityChange {
    pub container: String,
    pub item: ItemId,
    pub visible: bool,
    pub at: Instant,
}

#[derive(Debug, Default)]
struct PlaneState {
    scenes: Vec<(String, Vec<String>)>,
    items: BTreeMap<(String, String), ItemId>,
    visibility: HashMap<(String, ItemId), bool>,
    failing: HashSet<(String, String)>,
    refuse_connections: bool,
    next_id: i64,
    connects: usize,
    disconnects: usize,
    lookups: usize,
    changes: Vec<VisibilityChange>,
    session_log: Option<Arc<Mutex<Vec<String>>>>,
}

impl PlaneState {
    fn log_session(&self, event: &str) {
        if let Some(log) = &self.session_log {
            log.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(event.to_string());
        }
    }
}

/// Shared handle to the in-memory layout. Clones observe the same state.
#[derive(Debug, Clone, Default)]
pub struct MemoryControlPlane {
    state: Arc<Mutex<PlaneState>>,
}

impl MemoryControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_scene(&self, scene: &str) {
        let mut state = self.lock();
        if !state.scenes.iter().any(|(name, _)| name == scene) {
            state.scenes.push((scene.to_string(), Vec::new()));
        }
    }

    pub fn add_group(&self, scene: &str, group: &str) {
        self.add_scene(scene);
        let mut state = self.lock();
        if let Some((_, groups)) = state.scenes.iter_mut().find(|(name, _)| name == scene) {
            if !groups.iter().any(|g| g == group) {
                groups.push(group.to_string());
            }
        }
    }

    /// Registers a source inside `container`, initially visible.
    pub fn add_source(&self, container: &str, name: &str) -> ItemId {
        let mut state = self.lock();
        state.next_id += 1;
        let id = ItemId(state.next_id);
        state
            .items
            .insert((container.to_string(), name.to_string()), id);
        state.visibility.insert((container.to_string(), id), true);
        id
    }

    /// Makes every lookup of `name` in `container` fail in transport.
    pub fn fail_lookup(&self, container: &str, name: &str) {
        self.lock()
            .failing
            .insert((container.to_string(), name.to_string()));
    }

    pub fn heal_lookups(&self) {
        self.lock().failing.clear();
    }

    /// Appends "connected"/"disconnected" to `log`, which callers may share
    /// with other components to check teardown order.
    pub fn log_sessions_to(&self, log: Arc<Mutex<Vec<String>>>) {
        self.lock().session_log = Some(log);
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.lock().refuse_connections = refuse;
    }

    pub fn is_visible(&self, container: &str, item: ItemId) -> Option<bool> {
        self.lock()
            .visibility
            .get(&(container.to_string(), item))
            .copied()
    }

    /// Items in `container` that are currently shown.
    pub fn visible_items(&self, container: &str) -> Vec<ItemId> {
        let state = self.lock();
        let mut shown: Vec<ItemId> = state
            .visibility
            .iter()
            .filter(|((c, _), visible)| c == container && **visible)
            .map(|((_, id), _)| *id)
            .collect();
        shown.sort();
        shown
    }

    pub fn changes(&self) -> Vec<VisibilityChange> {
        self.lock().changes.clone()
    }

    pub fn lookup_count(&self) -> usize {
        self.lock().lookups
    }

    pub fn connect_count(&self) -> usize {
        self.lock().connects
    }

    pub fn disconnect_count(&self) -> usize {
        self.lock().disconnects
    }

    fn lock(&self) -> MutexGuard<'_, PlaneState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Connector for MemoryControlPlane {
    fn client(&self) -> Box<dyn VisibilityClient> {
        Box::new(MemoryClient {
            plane: self.clone(),
            connected: false,
        })
    }
}

struct MemoryClient {
    plane: MemoryControlPlane,
    connected: bool,
}

impl VisibilityClient for MemoryClient {
    fn connect(&mut self) -> Result<()> {
        let mut state = self.plane.lock();
        if state.refuse_connections {
            return Err(VoiceLayerError::Connection("connection refused".into()));
        }
        state.connects += 1;
        state.log_session("connected");
        self.connected = true;
        Ok(())
    }

    fn disconnect(&mut self) {
        if self.connected {
            self.connected = false;
            let mut state = self.plane.lock();
            state.disconnects += 1;
            state.log_session("disconnected");
        }
    }

    fn list_scenes(&mut self) -> Vec<String> {
        if !self.connected {
            return Vec::new();
        }
        self.plane
            .lock()
            .scenes
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn list_groups_in_scene(&mut self, scene: &str) -> Vec<String> {
        if !self.connected {
            return Vec::new();
        }
        self.plane
            .lock()
            .scenes
            .iter()
            .find(|(name, _)| name == scene)
            .map(|(_, groups)| groups.clone())
            .unwrap_or_default()
    }

    fn resolve_item_id(&mut self, container: &str, name: &str) -> Lookup {
        if !self.connected {
            return Lookup::Failed("not connected".into());
        }
        let mut state = self.plane.lock();
        state.lookups += 1;
        let key = (container.to_string(), name.to_string());
        if state.failing.contains(&key) {
            return Lookup::Failed("injected transport failure".into());
        }
        match state.items.get(&key) {
            Some(id) => Lookup::Found(*id),
            None => Lookup::Absent,
        }
    }

    fn set_visible(&mut self, container: &str, item: ItemId, visible: bool) {
        if !self.connected {
            tracing::warn!(container, %item, "set_visible on a closed session");
            return;
        }
        let mut state = self.plane.lock();
        state
            .visibility
            .insert((container.to_string(), item), visible);
        state.changes.push(VisibilityChange {
            container: container.to_string(),
            item,
            visible,
            at: Instant::now(),
        });
    }
}
