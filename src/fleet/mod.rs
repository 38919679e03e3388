//! Fleet registry
//!
//! Keyed collection of live connections plus the last daemon-reported state of
//! each entity. Dashboards read snapshots from here; per-entity detail views
//! can grab the [`LiveConnection`] itself.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use futures_util::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info};

use crate::live::{
    ConnectOutcome, ConnectionStatus, LiveConnection, LiveDeps, LiveSink, LiveUpdate, Liveness,
    MetricsSample,
};

/// Last known daemon-side state of one entity
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LiveSnapshot {
    /// Daemon-reported status (`running`, `offline`, ...), not socket state
    pub status: Option<String>,
    pub metrics: Option<MetricsSample>,
    /// Epoch ms of the last update
    pub last_update: Option<i64>,
}

impl LiveSnapshot {
    fn apply(&mut self, update: LiveUpdate) {
        if let Some(status) = update.status {
            self.status = Some(status);
        }
        if let Some(metrics) = update.metrics {
            self.metrics = Some(metrics);
        }
        self.last_update = Some(update.at_ms);
    }
}

#[derive(Default)]
struct FleetState {
    connections: HashMap<String, LiveConnection>,
    snapshots: HashMap<String, LiveSnapshot>,
}

/// Routes machine updates into the registry snapshots
struct RegistrySink {
    state: Weak<RwLock<FleetState>>,
}

impl LiveSink for RegistrySink {
    fn publish(&self, entity_id: &str, update: LiveUpdate) {
        let Some(state) = self.state.upgrade() else {
            return;
        };
        let mut state = state.write();
        // A late event must not resurrect a removed entity
        if !state.connections.contains_key(entity_id) {
            return;
        }
        state
            .snapshots
            .entry(entity_id.to_string())
            .or_default()
            .apply(update);
    }
}

#[derive(Clone)]
pub struct FleetRegistry {
    deps: LiveDeps,
    state: Arc<RwLock<FleetState>>,
}

impl FleetRegistry {
    /// Empty registry; entities are added on first connect
    pub fn init(deps: LiveDeps) -> Self {
        Self {
            deps,
            state: Arc::new(RwLock::new(FleetState::default())),
        }
    }

    /// Existing connection for `entity_id`, or a fresh idle one
    fn ensure(&self, entity_id: &str) -> LiveConnection {
        if let Some(conn) = self.state.read().connections.get(entity_id) {
            return conn.clone();
        }

        let mut state = self.state.write();
        // Raced with another caller
        if let Some(conn) = state.connections.get(entity_id) {
            return conn.clone();
        }

        let sink: Arc<dyn LiveSink> = Arc::new(RegistrySink {
            state: Arc::downgrade(&self.state),
        });
        let conn = LiveConnection::spawn_with_sink(entity_id, self.deps.clone(), Some(sink));
        state
            .connections
            .insert(entity_id.to_string(), conn.clone());
        debug!(entity = %entity_id, "entity_registered");
        conn
    }

    pub fn connection(&self, entity_id: &str) -> Option<LiveConnection> {
        self.state.read().connections.get(entity_id).cloned()
    }

    pub async fn connect(&self, entity_id: &str) -> ConnectOutcome {
        let conn = self.ensure(entity_id);
        conn.connect().await
    }

    /// Fan out; every entity's outcome is independent
    pub async fn connect_many<I, S>(&self, entity_ids: I) -> Vec<(String, ConnectOutcome)>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let attempts = entity_ids.into_iter().map(|id| {
            let id = id.as_ref().to_string();
            let conn = self.ensure(&id);
            async move {
                let outcome = conn.connect().await;
                (id, outcome)
            }
        });
        let results = join_all(attempts).await;

        let connected = results.iter().filter(|(_, o)| o.is_connected()).count();
        info!(total = results.len(), connected, "fleet_connect");
        results
    }

    /// Tear down one entity's session and timers; the snapshot is kept
    pub fn disconnect(&self, entity_id: &str) -> bool {
        match self.connection(entity_id) {
            Some(conn) => conn.disconnect(),
            None => false,
        }
    }

    pub fn disconnect_all(&self) {
        let conns: Vec<LiveConnection> = self.state.read().connections.values().cloned().collect();
        for conn in conns {
            conn.disconnect();
        }
    }

    /// Disconnect, stop the actor and forget the entity entirely
    pub async fn remove(&self, entity_id: &str) -> bool {
        let removed = {
            let mut state = self.state.write();
            state.snapshots.remove(entity_id);
            state.connections.remove(entity_id)
        };

        match removed {
            Some(conn) => {
                conn.shutdown().await;
                debug!(entity = %entity_id, "entity_removed");
                true
            }
            None => false,
        }
    }

    /// Empty snapshot for ids never seen
    pub fn snapshot(&self, entity_id: &str) -> LiveSnapshot {
        self.state
            .read()
            .snapshots
            .get(entity_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn snapshots(&self) -> HashMap<String, LiveSnapshot> {
        self.state.read().snapshots.clone()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state.read().connections.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn status(&self, entity_id: &str) -> ConnectionStatus {
        self.connection(entity_id)
            .map(|c| c.status())
            .unwrap_or_default()
    }

    pub fn is_connected(&self, entity_id: &str) -> bool {
        self.status(entity_id) == ConnectionStatus::Connected
    }

    pub fn is_connecting(&self, entity_id: &str) -> bool {
        self.status(entity_id) == ConnectionStatus::Connecting
    }

    pub fn is_daemon_healthy(&self, entity_id: &str) -> bool {
        self.connection(entity_id)
            .map_or(false, |c| c.liveness() == Liveness::Healthy)
    }

    pub async fn request_metrics(&self, entity_id: &str) -> bool {
        match self.connection(entity_id) {
            Some(conn) => conn.request_metrics().await,
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.state.read().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop every actor and clear both maps
    pub async fn teardown(&self) {
        let conns: Vec<LiveConnection> = {
            let mut state = self.state.write();
            state.snapshots.clear();
            state.connections.drain().map(|(_, c)| c).collect()
        };

        let count = conns.len();
        join_all(conns.iter().map(|c| c.shutdown())).await;
        info!(entities = count, "fleet_teardown");
    }
}
