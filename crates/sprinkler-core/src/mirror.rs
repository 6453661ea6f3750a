//! Bridge between local actuator/scenario state and the remote store.
//!
//! # Outbound
//!
//! Components publish through a cloneable [`MirrorHandle`]. Writes are queued
//! to one worker task, so control paths never wait on the network and the
//! store sees writes in publish order. Store failures are logged and dropped.
//!
//! # Inbound
//!
//! [`RemoteMirror::listen`] subscribes to both collections and turns remote
//! edits into the same `set_state` calls local commands use. Two guards keep
//! the loop from feeding itself:
//!
//! 1. A notification whose `version` is older than the local entity's is a
//!    late echo and is discarded.
//! 2. A notification whose desired state already matches local state is an
//!    echo of our own publish and is discarded.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::actuator::{ActuatorController, ActuatorId, ActuatorUpdate};
use crate::config::Environment;
use crate::error::Result;
use crate::scenario::{ScenarioCommand, ScenarioEngine, ScenarioId, ScenarioState};
use crate::store::{ChildChange, Fields, RecordRef, SharedStore};

// ---------------------------------------------------------------------------
// Collections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collections {
    pub actuators: String,
    pub scenarios: String,
    pub events: String,
}

impl Collections {
    pub fn for_environment(env: Environment) -> Self {
        Self {
            actuators: env.collection("sprinklers"),
            scenarios: env.collection("scenarios"),
            events: env.collection("events"),
        }
    }
}

// ---------------------------------------------------------------------------
// MirrorHandle
// ---------------------------------------------------------------------------

enum Outbound {
    Update { record: RecordRef, fields: Fields },
    Append { collection: String, fields: Fields },
    Flush(oneshot::Sender<()>),
}

/// Publish side of the mirror, handed to the controller, engine and event log.
#[derive(Clone)]
pub struct MirrorHandle {
    tx: mpsc::UnboundedSender<Outbound>,
    events: Arc<str>,
}

impl MirrorHandle {
    /// Queue a partial update. Entities not yet registered remotely have no
    /// record and publish nothing.
    pub fn publish(&self, record: Option<&RecordRef>, fields: Fields) {
        let Some(record) = record else {
            return;
        };
        self.send(Outbound::Update {
            record: record.clone(),
            fields,
        });
    }

    pub fn append_event(&self, fields: Fields) {
        self.send(Outbound::Append {
            collection: self.events.to_string(),
            fields,
        });
    }

    /// Wait until every write queued before this call has been attempted.
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        self.send(Outbound::Flush(done));
        let _ = wait.await;
    }

    fn send(&self, msg: Outbound) {
        if self.tx.send(msg).is_err() {
            debug!("mirror worker gone, dropping write");
        }
    }
}

async fn run_outbound(store: SharedStore, mut rx: mpsc::UnboundedReceiver<Outbound>) {
    while let Some(msg) = rx.recv().await {
        match msg {
            Outbound::Update { record, fields } => {
                if let Err(e) = store.update(&record, fields).await {
                    warn!(record = %record, error = %e, "mirror update failed");
                }
            }
            Outbound::Append { collection, fields } => {
                if let Err(e) = store.create_record(&collection, fields).await {
                    warn!(collection = %collection, error = %e, "mirror append failed");
                }
            }
            Outbound::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

// ---------------------------------------------------------------------------
// RemoteMirror
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Routes {
    actuators: HashMap<String, ActuatorId>,
    scenarios: HashMap<String, ScenarioId>,
}

/// First delay before retrying a failed registration; doubles up to
/// [`CONNECT_RETRY_MAX`].
const CONNECT_RETRY_INITIAL: Duration = Duration::from_secs(5);
const CONNECT_RETRY_MAX: Duration = Duration::from_secs(300);

#[derive(Clone)]
pub struct RemoteMirror {
    store: SharedStore,
    collections: Collections,
    handle: MirrorHandle,
    routes: Arc<Mutex<Routes>>,
}

impl RemoteMirror {
    /// Create the mirror and spawn its outbound worker. Requires a Tokio runtime.
    pub fn new(store: SharedStore, collections: Collections) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_outbound(store.clone(), rx));
        let handle = MirrorHandle {
            tx,
            events: Arc::from(collections.events.as_str()),
        };
        Self {
            store,
            collections,
            handle,
            routes: Arc::default(),
        }
    }

    pub fn handle(&self) -> MirrorHandle {
        self.handle.clone()
    }

    pub fn collections(&self) -> &Collections {
        &self.collections
    }

    /// Replace the remote actuator collection with one fresh record per
    /// actuator and attach the record handles to the controller.
    pub async fn register_actuators(&self, controller: &ActuatorController) -> Result<()> {
        let collection = &self.collections.actuators;
        self.store.remove_collection(collection).await?;
        self.lock_routes().actuators.clear();
        for id in controller.ids() {
            let record = self
                .store
                .create_record(collection, controller.remote_fields(id).await?)
                .await?;
            controller.attach_remote(id, record.clone()).await?;
            self.lock_routes().actuators.insert(record.key, id);
        }
        info!(collection = %collection, count = controller.ids().len(), "registered actuators remotely");
        Ok(())
    }

    /// Purge and re-create scenario records, like [`register_actuators`](Self::register_actuators).
    pub async fn register_scenarios(&self, engine: &ScenarioEngine) -> Result<()> {
        let collection = &self.collections.scenarios;
        self.store.remove_collection(collection).await?;
        self.lock_routes().scenarios.clear();
        for id in engine.ids() {
            let record = self
                .store
                .create_record(collection, engine.remote_fields(id).await?)
                .await?;
            engine.attach_remote(id, record.clone()).await?;
            self.lock_routes().scenarios.insert(record.key, id);
        }
        info!(collection = %collection, count = engine.ids().len(), "registered scenarios remotely");
        Ok(())
    }

    /// Subscribe to remote edits of both collections. Each subscription is
    /// served by its own task for the life of the process.
    pub async fn listen(&self, controller: ActuatorController, engine: ScenarioEngine) -> Result<()> {
        let mut actuator_rx = self.store.subscribe(&self.collections.actuators).await?;
        let mut scenario_rx = self.store.subscribe(&self.collections.scenarios).await?;

        let routes = self.routes.clone();
        tokio::spawn(async move {
            while let Some(change) = actuator_rx.recv().await {
                let id = route(&routes, &change, |r| &r.actuators);
                if let Some(id) = id {
                    apply_actuator_change(&controller, id, &change.value).await;
                }
            }
            debug!("actuator subscription closed");
        });

        let routes = self.routes.clone();
        tokio::spawn(async move {
            while let Some(change) = scenario_rx.recv().await {
                let id = route(&routes, &change, |r| &r.scenarios);
                if let Some(id) = id {
                    apply_scenario_change(&engine, id, &change.value).await;
                }
            }
            debug!("scenario subscription closed");
        });
        Ok(())
    }

    /// Register both collections, then listen. Safe to repeat after a
    /// failure: registration replaces whatever an earlier attempt left.
    pub async fn connect(&self, controller: &ActuatorController, engine: &ScenarioEngine) -> Result<()> {
        self.register_actuators(controller).await?;
        self.register_scenarios(engine).await?;
        self.listen(controller.clone(), engine.clone()).await
    }

    /// Connect now, or keep retrying in the background with exponential
    /// backoff until the store is reachable. Local control never waits.
    pub async fn connect_or_retry(&self, controller: &ActuatorController, engine: &ScenarioEngine) {
        let Err(e) = self.connect(controller, engine).await else {
            return;
        };
        warn!(error = %e, retry_in = ?CONNECT_RETRY_INITIAL, "remote mirror unavailable");

        let this = self.clone();
        let controller = controller.clone();
        let engine = engine.clone();
        tokio::spawn(async move {
            let mut delay = CONNECT_RETRY_INITIAL;
            loop {
                tokio::time::sleep(delay).await;
                match this.connect(&controller, &engine).await {
                    Ok(()) => {
                        info!("remote mirror connected");
                        return;
                    }
                    Err(e) => {
                        delay = (delay * 2).min(CONNECT_RETRY_MAX);
                        warn!(error = %e, retry_in = ?delay, "remote mirror still unavailable");
                    }
                }
            }
        });
    }

    fn lock_routes(&self) -> std::sync::MutexGuard<'_, Routes> {
        self.routes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn route(
    routes: &Mutex<Routes>,
    change: &ChildChange,
    table: impl Fn(&Routes) -> &HashMap<String, u64>,
) -> Option<u64> {
    let routes = routes.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let id = table(&routes).get(&change.record.key).copied();
    if id.is_none() {
        debug!(record = %change.record, "change for unknown record ignored");
    }
    id
}

fn remote_version(value: &serde_json::Value) -> Option<u64> {
    value.get("version").and_then(serde_json::Value::as_u64)
}

pub(crate) async fn apply_actuator_change(
    controller: &ActuatorController,
    id: ActuatorId,
    value: &serde_json::Value,
) {
    let Ok(local) = controller.query(id).await else {
        return;
    };
    if remote_version(value).is_some_and(|v| v < local.version) {
        debug!(actuator = id, "stale remote actuator change discarded");
        return;
    }

    let mut update = ActuatorUpdate::default();
    if let Some(state) = value.get("state").and_then(serde_json::Value::as_str) {
        let wanted = matches!(state, "activating" | "on");
        if wanted != local.is_active {
            update.is_active = Some(wanted);
        }
    }
    if let Some(name) = value.get("name").and_then(serde_json::Value::as_str) {
        if name != local.name {
            update.name = Some(name.to_string());
        }
    }
    if update.is_empty() {
        return;
    }

    info!(actuator = id, "applying remote actuator change");
    if let Err(e) = controller.set_state(id, update).await {
        warn!(actuator = id, error = %e, "remote actuator change failed");
    }
}

pub(crate) async fn apply_scenario_change(
    engine: &ScenarioEngine,
    id: ScenarioId,
    value: &serde_json::Value,
) {
    let Ok(local) = engine.query(id).await else {
        return;
    };
    if remote_version(value).is_some_and(|v| v < local.version) {
        debug!(scenario = id, "stale remote scenario change discarded");
        return;
    }
    let Some(state) = value.get("state").and_then(serde_json::Value::as_str) else {
        return;
    };

    let command = match state {
        "start" | "running" if local.state == ScenarioState::Stopped => ScenarioCommand::Start,
        // Only an explicit "stop" cancels a pending daily repeat.
        "stop" if local.state != ScenarioState::Stopped || local.next_run_at.is_some() => {
            ScenarioCommand::Stop
        }
        "stopping" | "stopped" if local.state == ScenarioState::Running => ScenarioCommand::Stop,
        _ => return,
    };

    info!(scenario = id, command = ?command, "applying remote scenario change");
    if let Err(e) = engine.set_state(id, command).await {
        warn!(scenario = id, error = %e, "remote scenario change failed");
    }
}
