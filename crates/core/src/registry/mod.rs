//! Source discovery and the per-container catalog cache.
//!
//! Sources are found by probing numbered candidate names inside a group
//! container. Whatever a probe pass finds, including nothing at all, is
//! cached under its `(scene, group)` key. Probes that failed in transport
//! are counted separately so a flaky connection cannot pass for an empty
//! group.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock},
};

use serde::{Deserialize, Serialize};

use crate::{
    remote::{Connection, Connector, ItemId, Lookup, VisibilityClient},
    Result, SelectionRange, VoiceLayerError,
};

/// Highest candidate number probed per group.
pub const MAX_PROBE: u32 = 1000;

/// Identifies one group container inside one scene.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CatalogKey {
    pub scene: String,
    pub group: String,
}

impl CatalogKey {
    /// Key for `group` inside `scene`.
    pub fn new(scene: &str, group: &str) -> Self {
        Self {
            scene: scene.to_string(),
            group: group.to_string(),
        }
    }
}

impl fmt::Display for CatalogKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.scene, self.group)
    }
}

/// Template turning a probe number into a candidate source name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamePattern {
    template: String,
}

impl NamePattern {
    /// Pattern used when none is configured.
    pub const DEFAULT: &'static str = "{n}.png";
    const PLACEHOLDER: &'static str = "{n}";

    /// Fails when `template` has no `{n}` placeholder.
    pub fn new(template: &str) -> Result<Self> {
        if !template.contains(Self::PLACEHOLDER) {
            return Err(VoiceLayerError::config(format!(
                "name pattern `{template}` has no `{{n}}` placeholder"
            )));
        }
        Ok(Self {
            template: template.to_string(),
        })
    }

    /// Candidate source name for probe `number`.
    pub fn name(&self, number: u32) -> String {
        self.template
            .replace(Self::PLACEHOLDER, &number.to_string())
    }
}

impl Default for NamePattern {
    fn default() -> Self {
        Self {
            template: Self::DEFAULT.to_string(),
        }
    }
}

/// The number embedded in a source name: all of its digits, in order.
pub fn numeric_suffix(name: &str) -> Option<u32> {
    let digits: String = name.chars().filter(char::is_ascii_digit).collect();
    digits.parse().ok()
}

/// One discovered source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogSource {
    pub name: String,
    pub number: u32,
    pub item: ItemId,
}

/// Sources of one group, ordered by number.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupCatalog {
    sources: Vec<CatalogSource>,
    failed: usize,
}

impl GroupCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a catalog from `(name, item)` pairs, numbering each source by
    /// the digits in its name. Names without digits are skipped.
    pub fn from_named(entries: impl IntoIterator<Item = (String, ItemId)>) -> Self {
        let mut catalog = Self::new();
        for (name, item) in entries {
            if let Some(number) = numeric_suffix(&name) {
                catalog.insert(CatalogSource { name, number, item });
            }
        }
        catalog
    }

    pub fn insert(&mut self, source: CatalogSource) {
        match self
            .sources
            .binary_search_by_key(&source.number, |existing| existing.number)
        {
            Ok(index) => self.sources[index] = source,
            Err(index) => self.sources.insert(index, source),
        }
    }

    /// Discovered sources in ascending number order.
    pub fn sources(&self) -> &[CatalogSource] {
        &self.sources
    }

    /// Numbers of the discovered sources, ascending.
    pub fn numbers(&self) -> Vec<u32> {
        self.sources.iter().map(|source| source.number).collect()
    }

    /// Count of discovered sources.
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Probes that never got an answer.
    pub fn failed(&self) -> usize {
        self.failed
    }

    /// True when every probe was answered, so the entry can be trusted.
    pub fn is_complete(&self) -> bool {
        self.failed == 0
    }
}

/// Ordered, non-empty selection of sources the loop switches between.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisualState {
    key: CatalogKey,
    members: Vec<CatalogSource>,
}

impl VisualState {
    /// Catalog key the selection was taken from.
    pub fn key(&self) -> &CatalogKey {
        &self.key
    }

    /// Container the member items live in.
    pub fn container(&self) -> &str {
        &self.key.group
    }

    /// Selected sources; a state index addresses this slice.
    pub fn members(&self) -> &[CatalogSource] {
        &self.members
    }

    /// Source shown for state `index`.
    pub fn get(&self, index: usize) -> Option<&CatalogSource> {
        self.members.get(index)
    }

    /// Number of visual states.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Which containers a discovery pass walks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryScope {
    AllScenes,
    Scene(String),
    Group(CatalogKey),
}

impl DiscoveryScope {
    pub fn covers(&self, key: &CatalogKey) -> bool {
        match self {
            DiscoveryScope::AllScenes => true,
            DiscoveryScope::Scene(scene) => *scene == key.scene,
            DiscoveryScope::Group(group) => group == key,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryMode {
    /// Probe every group in scope again.
    Refresh,
    /// Serve complete cached entries without probing.
    UseCache,
}

/// Outcome for one group of a discovery pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupReport {
    pub key: CatalogKey,
    pub found: usize,
    pub failed: usize,
    pub from_cache: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiscoveryReport {
    pub groups: Vec<GroupReport>,
}

impl DiscoveryReport {
    pub fn total_found(&self) -> usize {
        self.groups.iter().map(|group| group.found).sum()
    }

    pub fn total_failed(&self) -> usize {
        self.groups.iter().map(|group| group.failed).sum()
    }
}

#[derive(Debug, Default)]
struct Claims {
    discovery: Option<DiscoveryScope>,
    run: Option<CatalogKey>,
}

fn lock_claims(claims: &Mutex<Claims>) -> MutexGuard<'_, Claims> {
    claims.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Held while a discovery pass runs.
#[derive(Debug)]
pub struct DiscoveryGuard {
    claims: Arc<Mutex<Claims>>,
}

impl Drop for DiscoveryGuard {
    fn drop(&mut self) {
        lock_claims(&self.claims).discovery = None;
    }
}

/// Held by the control loop for as long as it reads a catalog key.
#[derive(Debug)]
pub struct RunClaim {
    claims: Arc<Mutex<Claims>>,
    key: CatalogKey,
}

impl RunClaim {
    pub fn key(&self) -> &CatalogKey {
        &self.key
    }
}

impl Drop for RunClaim {
    fn drop(&mut self) {
        lock_claims(&self.claims).run = None;
    }
}

/// Discovers sources and caches them per `(scene, group)`.
#[derive(Debug)]
pub struct SourceRegistry {
    pattern: NamePattern,
    probe_limit: u32,
    catalog: RwLock<HashMap<CatalogKey, GroupCatalog>>,
    claims: Arc<Mutex<Claims>>,
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self::new(NamePattern::default())
    }
}

impl SourceRegistry {
    pub fn new(pattern: NamePattern) -> Self {
        Self::with_probe_limit(pattern, MAX_PROBE)
    }

    pub fn with_probe_limit(pattern: NamePattern, probe_limit: u32) -> Self {
        Self {
            pattern,
            probe_limit,
            catalog: RwLock::new(HashMap::new()),
            claims: Arc::new(Mutex::new(Claims::default())),
        }
    }

    /// Reserves the registry for a discovery pass over `scope`.
    pub fn begin_discovery(&self, scope: &DiscoveryScope) -> Result<DiscoveryGuard> {
        let mut claims = lock_claims(&self.claims);
        if claims.discovery.is_some() {
            return Err(VoiceLayerError::Busy("a discovery is already running".into()));
        }
        if let Some(key) = claims.run.as_ref().filter(|key| scope.covers(key)) {
            return Err(VoiceLayerError::Busy(format!(
                "the control loop is running on {key}"
            )));
        }
        claims.discovery = Some(scope.clone());
        Ok(DiscoveryGuard {
            claims: self.claims.clone(),
        })
    }

    /// Reserves `key` for a control loop run.
    pub fn claim_run(&self, key: &CatalogKey) -> Result<RunClaim> {
        let mut claims = lock_claims(&self.claims);
        if claims.discovery.is_some() {
            return Err(VoiceLayerError::Busy("a discovery is running".into()));
        }
        if let Some(active) = &claims.run {
            return Err(VoiceLayerError::Busy(format!(
                "another run already holds {active}"
            )));
        }
        claims.run = Some(key.clone());
        Ok(RunClaim {
            claims: self.claims.clone(),
            key: key.clone(),
        })
    }

    pub fn is_discovering(&self) -> bool {
        lock_claims(&self.claims).discovery.is_some()
    }

    /// Opens a short-lived session through `connector` and discovers `scope`.
    pub fn discover_with(
        &self,
        connector: &dyn Connector,
        scope: DiscoveryScope,
        mode: DiscoveryMode,
    ) -> Result<DiscoveryReport> {
        let _guard = self.begin_discovery(&scope)?;
        let mut connection = Connection::open(connector)?;
        Ok(self.walk(connection.client(), &scope, mode))
    }

    /// Discovers `scope` over an already connected client.
    pub fn discover(
        &self,
        client: &mut dyn VisibilityClient,
        scope: DiscoveryScope,
        mode: DiscoveryMode,
    ) -> Result<DiscoveryReport> {
        let _guard = self.begin_discovery(&scope)?;
        Ok(self.walk(client, &scope, mode))
    }

    fn walk(
        &self,
        client: &mut dyn VisibilityClient,
        scope: &DiscoveryScope,
        mode: DiscoveryMode,
    ) -> DiscoveryReport {
        let keys: Vec<CatalogKey> = match scope {
            DiscoveryScope::AllScenes => {
                let mut keys = Vec::new();
                for scene in client.list_scenes() {
                    for group in client.list_groups_in_scene(&scene) {
                        keys.push(CatalogKey::new(&scene, &group));
                    }
                }
                keys
            }
            DiscoveryScope::Scene(scene) => client
                .list_groups_in_scene(scene)
                .into_iter()
                .map(|group| CatalogKey::new(scene, &group))
                .collect(),
            DiscoveryScope::Group(key) => vec![key.clone()],
        };

        let mut report = DiscoveryReport::default();
        for key in keys {
            if mode == DiscoveryMode::UseCache {
                if let Some(cached) = self.lookup(&key).filter(GroupCatalog::is_complete) {
                    tracing::debug!(%key, found = cached.len(), "serving catalog from cache");
                    report.groups.push(GroupReport {
                        key,
                        found: cached.len(),
                        failed: 0,
                        from_cache: true,
                    });
                    continue;
                }
            }

            let catalog = self.probe_group(client, &key);
            report.groups.push(GroupReport {
                key: key.clone(),
                found: catalog.len(),
                failed: catalog.failed(),
                from_cache: false,
            });
            self.store(key, catalog);
        }

        tracing::info!(
            groups = report.groups.len(),
            found = report.total_found(),
            failed = report.total_failed(),
            "discovery finished"
        );
        report
    }

    fn probe_group(&self, client: &mut dyn VisibilityClient, key: &CatalogKey) -> GroupCatalog {
        let mut catalog = GroupCatalog::new();
        for number in 1..=self.probe_limit {
            let name = self.pattern.name(number);
            match client.resolve_item_id(&key.group, &name) {
                Lookup::Found(item) => catalog.insert(CatalogSource { name, number, item }),
                Lookup::Absent => {}
                Lookup::Failed(reason) => {
                    tracing::debug!(%key, %name, %reason, "probe failed");
                    catalog.failed += 1;
                }
            }
        }

        if !catalog.is_complete() {
            tracing::warn!(%key, failed = catalog.failed, "some probes failed, entry marked incomplete");
        }
        catalog
    }

    /// Writes an entry, replacing whatever was cached for `key`.
    pub fn store(&self, key: CatalogKey, catalog: GroupCatalog) {
        self.catalog
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, catalog);
    }

    /// Cached entry for `key`. `None` means never probed, an empty catalog
    /// means probed and nothing found.
    pub fn lookup(&self, key: &CatalogKey) -> Option<GroupCatalog> {
        self.catalog
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Discovered-source counts for every cached key.
    pub fn counts(&self) -> BTreeMap<CatalogKey, usize> {
        self.catalog
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(key, catalog)| (key.clone(), catalog.len()))
            .collect()
    }

    /// Builds the visual state for the sources of `key` numbered within
    /// `range`.
    pub fn select(&self, key: &CatalogKey, range: SelectionRange) -> Result<VisualState> {
        let catalog = self.lookup(key).ok_or_else(|| {
            VoiceLayerError::config(format!("no sources discovered for {key}, run discovery first"))
        })?;

        let members: Vec<CatalogSource> = catalog
            .sources()
            .iter()
            .filter(|source| range.contains(source.number))
            .cloned()
            .collect();

        if members.is_empty() {
            return Err(VoiceLayerError::config(format!(
                "no sources of {key} fall within {}..={}",
                range.start(),
                range.end()
            )));
        }

        Ok(VisualState {
            key: key.clone(),
            members,
        })
    }
}
