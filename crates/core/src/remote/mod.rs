//! Remote control plane contract.
//!
//! The loop and the discovery code only ever need four operations: list
//! scenes, list the group containers of a scene, resolve a source to an
//! item identifier and toggle an item's visibility.

pub mod memory;
mod obs;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::Result;

pub use memory::MemoryControlPlane;
pub use obs::{ObsClient, ObsConnector};

/// Opaque identifier addressing one item inside a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub i64);

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Outcome of resolving a source name inside a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Found(ItemId),
    /// The control plane answered and the source does not exist.
    Absent,
    /// The question never got a trustworthy answer.
    Failed(String),
}

impl Lookup {
    pub fn item(&self) -> Option<ItemId> {
        match self {
            Lookup::Found(id) => Some(*id),
            _ => None,
        }
    }
}

/// Session with the remote composition tool.
pub trait VisibilityClient: Send {
    /// Opens the session. A failure is reported once and never retried here.
    fn connect(&mut self) -> Result<()>;

    /// Closes the session. Safe to call on a closed client.
    fn disconnect(&mut self);

    /// Scene names in control plane order, empty on failure.
    fn list_scenes(&mut self) -> Vec<String>;

    /// Group-type containers inside `scene`, empty on failure.
    fn list_groups_in_scene(&mut self, scene: &str) -> Vec<String>;

    fn resolve_item_id(&mut self, container: &str, name: &str) -> Lookup;

    /// Fire-and-forget. Failures are logged by the implementation and
    /// never reach the caller.
    fn set_visible(&mut self, container: &str, item: ItemId, visible: bool);
}

/// Produces fresh, unconnected clients so every run and every discovery can
/// own its session exclusively.
pub trait Connector: Send + Sync {
    fn client(&self) -> Box<dyn VisibilityClient>;
}

/// Connected client that disconnects when dropped.
pub struct Connection {
    client: Box<dyn VisibilityClient>,
}

impl Connection {
    pub fn open(connector: &dyn Connector) -> Result<Self> {
        let mut client = connector.client();
        client.connect()?;
        Ok(Self { client })
    }

    pub fn client(&mut self) -> &mut dyn VisibilityClient {
        self.client.as_mut()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.client.disconnect();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection").finish()
    }
}
