//! Aggregates action definitions from local entity types, peer nodes and
//! static registrations.
//!
//! Only plain data is cached: the list of local type ids and each peer's
//! translated listing. A failed listing is cached as empty until the TTL
//! ends. Local schemas are derived from the capability on every discovery
//! pass.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use serde::Serialize;
use tracing::{debug, warn};

use parley_core::capability::{EntityCapability, EntityRegistry};
use parley_core::config::{CatalogConfig, PeerConfig};
use parley_core::domain::action::{ActionDefinition, ActionOrigin, ExecutorKind, PeerRef};

use crate::peer::{peer_ref, PeerCapability, PeerTransport};

const LOCAL_TYPES_KEY: &str = "local";

pub struct ActionCatalog {
    registry: Arc<EntityRegistry>,
    transport: Arc<dyn PeerTransport>,
    peers: Vec<PeerConfig>,
    static_actions: BTreeMap<String, ActionDefinition>,
    type_ids: Cache<&'static str, Arc<Vec<String>>>,
    peer_listings: Cache<String, Arc<Vec<ActionDefinition>>>,
}

impl ActionCatalog {
    pub fn new(
        registry: Arc<EntityRegistry>,
        transport: Arc<dyn PeerTransport>,
        config: &CatalogConfig,
    ) -> Self {
        let ttl = Duration::from_secs(config.type_cache_ttl_secs.max(1));
        Self {
            registry,
            transport,
            peers: config.peers.clone(),
            static_actions: BTreeMap::new(),
            type_ids: Cache::builder().max_capacity(1).time_to_live(ttl).build(),
            peer_listings: Cache::builder()
                .max_capacity(config.peers.len().max(1) as u64)
                .time_to_live(ttl)
                .build(),
        }
    }

    /// Registers a static action. Re-registering an id replaces it.
    pub fn register(&mut self, definition: ActionDefinition) {
        let definition = definition.normalized();
        self.static_actions.insert(definition.id.clone(), definition);
    }

    pub fn registry(&self) -> &Arc<EntityRegistry> {
        &self.registry
    }

    /// Drops cached type ids and peer listings.
    pub fn invalidate(&self) {
        self.type_ids.invalidate_all();
        self.peer_listings.invalidate_all();
    }

    /// Merges local, remote and static actions. Later origins win on id
    /// collisions. A failing origin is logged and skipped.
    pub async fn discover(&self) -> DiscoveredCatalog {
        let mut actions = BTreeMap::new();

        for definition in self.local_actions().await {
            actions.insert(definition.id.clone(), definition);
        }
        for peer in &self.peers {
            for definition in self.peer_actions(peer).await.iter() {
                actions.insert(definition.id.clone(), definition.clone());
            }
        }
        for (id, definition) in &self.static_actions {
            actions.insert(id.clone(), definition.clone());
        }

        debug!(
            event_name = "agent.catalog.discovered",
            actions = actions.len(),
            peers = self.peers.len(),
            "action catalog discovered"
        );
        DiscoveredCatalog { actions }
    }

    async fn local_actions(&self) -> Vec<ActionDefinition> {
        let registry = Arc::clone(&self.registry);
        let type_ids = self
            .type_ids
            .get_with(LOCAL_TYPES_KEY, async move { Arc::new(registry.type_ids()) })
            .await;

        let mut actions = Vec::with_capacity(type_ids.len());
        for entity_type in type_ids.iter() {
            match self.registry.get(entity_type) {
                Some(capability) => actions.push(derive_local_action(capability.as_ref())),
                None => warn!(
                    event_name = "agent.catalog.type_skipped",
                    entity_type = %entity_type,
                    "cached entity type is no longer registered"
                ),
            }
        }
        actions
    }

    async fn peer_actions(&self, peer: &PeerConfig) -> Arc<Vec<ActionDefinition>> {
        if let Some(cached) = self.peer_listings.get(&peer.node_id).await {
            return cached;
        }

        let reference = peer_ref(peer);
        match self.transport.capabilities(&reference).await {
            Ok(capabilities) => {
                let actions = Arc::new(
                    capabilities
                        .iter()
                        .map(|capability| derive_remote_action(&reference, capability))
                        .collect::<Vec<_>>(),
                );
                self.peer_listings.insert(peer.node_id.clone(), Arc::clone(&actions)).await;
                actions
            }
            Err(error) => {
                warn!(
                    event_name = "agent.catalog.peer_skipped",
                    node_id = %peer.node_id,
                    error_class = error.error_class(),
                    error = %error,
                    "peer capability listing failed"
                );
                let empty = Arc::new(Vec::new());
                self.peer_listings.insert(peer.node_id.clone(), Arc::clone(&empty)).await;
                empty
            }
        }
    }
}

/// A type with a bound guided workflow yields a workflow-backed action named
/// after that workflow; anything else yields `create_<type>`.
pub fn derive_local_action(capability: &dyn EntityCapability) -> ActionDefinition {
    let entity_type = capability.entity_type();
    let label = capability.label();
    let base = match capability.bound_workflow() {
        Some(workflow_id) => {
            ActionDefinition::new(workflow_id.clone(), ExecutorKind::Workflow)
                .with_workflow(workflow_id)
        }
        None => ActionDefinition::new(format!("create_{entity_type}"), ExecutorKind::LocalCreate),
    };

    let mut definition = base
        .with_label(format!("Create {}", label.to_lowercase()))
        .with_description(capability.description())
        .with_triggers(capability.triggers())
        .for_entity(entity_type);
    definition.fields = capability.field_schema();
    definition.origin = ActionOrigin::Local;
    definition.normalized()
}

pub fn derive_remote_action(peer: &PeerRef, capability: &PeerCapability) -> ActionDefinition {
    let label = capability
        .label
        .clone()
        .unwrap_or_else(|| parley_core::domain::action::humanize(&capability.entity_type));
    let triggers = if capability.triggers.is_empty() {
        let noun = label.to_lowercase();
        vec![format!("create {noun}"), format!("add {noun}")]
    } else {
        capability.triggers.clone()
    };

    let mut definition = ActionDefinition::new(
        format!("remote.{}.{}", peer.node_id, capability.entity_type),
        ExecutorKind::RemoteCreate,
    )
    .with_label(format!("Create {} on {}", label.to_lowercase(), peer.node_id))
    .with_description(
        capability.description.clone().unwrap_or_else(|| format!("Create a {label}")),
    )
    .with_triggers(triggers)
    .for_entity(capability.entity_type.clone());
    definition.fields = capability.fields.clone();
    definition.required_params = capability.required.clone();
    definition.peer = Some(peer.clone());
    definition.origin = ActionOrigin::Remote { node_id: peer.node_id.clone() };
    definition.normalized()
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CatalogStats {
    pub total: usize,
    pub enabled: usize,
    pub by_origin: BTreeMap<String, usize>,
    pub by_executor: BTreeMap<String, usize>,
}

/// Read-only snapshot produced by one discovery pass.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DiscoveredCatalog {
    actions: BTreeMap<String, ActionDefinition>,
}

impl DiscoveredCatalog {
    pub fn from_actions<I>(actions: I) -> Self
    where
        I: IntoIterator<Item = ActionDefinition>,
    {
        Self {
            actions: actions
                .into_iter()
                .map(ActionDefinition::normalized)
                .map(|definition| (definition.id.clone(), definition))
                .collect(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&ActionDefinition> {
        self.actions.get(id)
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ActionDefinition> {
        self.actions.values()
    }

    pub fn by_trigger(&self, keyword: &str) -> Vec<&ActionDefinition> {
        let keyword = keyword.trim().to_lowercase();
        self.actions
            .values()
            .filter(|definition| definition.triggers.iter().any(|trigger| *trigger == keyword))
            .collect()
    }

    pub fn by_entity_type(&self, entity_type: &str) -> Vec<&ActionDefinition> {
        self.actions
            .values()
            .filter(|definition| definition.entity_type.as_deref() == Some(entity_type))
            .collect()
    }

    pub fn enabled(&self) -> Vec<&ActionDefinition> {
        self.actions.values().filter(|definition| definition.enabled).collect()
    }

    /// Enabled actions whose trigger occurs in the message, or every enabled
    /// action when nothing triggers.
    pub fn candidates(&self, message: &str) -> Vec<&ActionDefinition> {
        let enabled = self.enabled();
        let triggered: Vec<_> = enabled
            .iter()
            .copied()
            .filter(|definition| definition.is_triggered_by(message))
            .collect();
        if triggered.is_empty() {
            enabled
        } else {
            triggered
        }
    }

    pub fn stats(&self) -> CatalogStats {
        let mut stats = CatalogStats { total: self.actions.len(), ..CatalogStats::default() };
        for definition in self.actions.values() {
            if definition.enabled {
                stats.enabled += 1;
            }
            *stats.by_origin.entry(definition.origin.label().to_string()).or_default() += 1;
            *stats.by_executor.entry(definition.executor.as_str().to_string()).or_default() += 1;
        }
        stats
    }
}
