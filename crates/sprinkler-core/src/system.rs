//! Command surface over the whole controller.
//!
//! [`SprinklerSystem`] wires the components together at boot and exposes
//! the operations the HTTP layer (and CLI) call. Every operation returns a
//! [`Result`]; [`SprinklerError::status`] gives the caller-facing tag.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::actuator::{ActuatorController, ActuatorId, ActuatorSnapshot, ActuatorUpdate};
use crate::clock::{SharedClock, SystemClock};
use crate::config::{Config, HardwareConfig, RemoteConfig};
use crate::error::{Result, SprinklerError};
use crate::event_log::{CompletedRun, EventLog, RunStore};
use crate::hardware::{MockLineDriver, SharedDriver, SysfsLineDriver};
use crate::mirror::{Collections, RemoteMirror};
use crate::scenario::{ScenarioCommand, ScenarioEngine, ScenarioId, ScenarioSnapshot, ScenarioState};
use crate::store::{FirebaseStore, MemoryStore, SharedStore};

pub struct SprinklerSystem {
    actuators: ActuatorController,
    scenarios: ScenarioEngine,
    events: EventLog,
    mirror: RemoteMirror,
}

/// Line driver selected by the `hardware` config section.
pub fn driver_for(config: &HardwareConfig) -> SharedDriver {
    match config {
        HardwareConfig::Sysfs { root } => Arc::new(SysfsLineDriver::new(root.clone())),
        HardwareConfig::Mock => Arc::new(MockLineDriver::new()),
    }
}

/// Remote store selected by the `remote` config section.
pub fn store_for(config: &RemoteConfig) -> SharedStore {
    match config {
        RemoteConfig::Memory => Arc::new(MemoryStore::new()),
        RemoteConfig::Firebase {
            database_url,
            auth_token,
        } => Arc::new(FirebaseStore::new(database_url.clone(), auth_token.clone())),
    }
}

impl SprinklerSystem {
    /// Boot from config with the configured driver, store and on-disk event log.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let runs = RunStore::open(&config.event_log_path)?;
        Self::boot(
            config,
            driver_for(&config.hardware),
            store_for(&config.remote),
            runs,
            Arc::new(SystemClock),
        )
        .await
    }

    /// Build every component and register with the remote store. An
    /// unreachable store is retried in the background; local control works
    /// without it.
    pub async fn boot(
        config: &Config,
        driver: SharedDriver,
        store: SharedStore,
        runs: RunStore,
        clock: SharedClock,
    ) -> Result<Self> {
        let mirror = RemoteMirror::new(store, Collections::for_environment(config.environment));
        let events = EventLog::new(runs, mirror.handle());
        let actuators = ActuatorController::new(
            &config.actuators,
            driver,
            mirror.handle(),
            events.clone(),
            clock.clone(),
        )
        .await?;
        let scenarios =
            ScenarioEngine::new(&config.scenarios, actuators.clone(), mirror.handle(), clock)?;

        mirror.connect_or_retry(&actuators, &scenarios).await;

        info!(
            environment = ?config.environment,
            actuators = actuators.ids().len(),
            scenarios = scenarios.ids().len(),
            "sprinkler system ready"
        );
        Ok(Self {
            actuators,
            scenarios,
            events,
            mirror,
        })
    }

    pub fn actuators(&self) -> &ActuatorController {
        &self.actuators
    }

    pub fn scenarios(&self) -> &ScenarioEngine {
        &self.scenarios
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    // -----------------------------------------------------------------------
    // Actuators
    // -----------------------------------------------------------------------

    pub async fn list_actuators(&self) -> Vec<ActuatorSnapshot> {
        self.actuators.query_all().await
    }

    pub async fn get_actuator(&self, id: ActuatorId) -> Result<ActuatorSnapshot> {
        self.actuators.query(id).await
    }

    /// Apply a loose JSON payload. Unknown fields are ignored; a payload with
    /// no recognised field at all is a bad request.
    pub async fn set_actuator_state(
        &self,
        id: ActuatorId,
        payload: &serde_json::Value,
    ) -> Result<ActuatorSnapshot> {
        if !self.actuators.contains(id) {
            return Err(SprinklerError::ActuatorNotFound(id));
        }
        let update = ActuatorUpdate::from_payload(payload);
        if update.is_empty() {
            return Err(SprinklerError::BadRequest(
                "No processable payload in request body".into(),
            ));
        }
        Ok(self.actuators.set_state(id, update).await?.into_snapshot())
    }

    // -----------------------------------------------------------------------
    // Scenarios
    // -----------------------------------------------------------------------

    pub async fn list_scenarios(&self) -> Vec<ScenarioSnapshot> {
        self.scenarios.query_all().await
    }

    pub async fn get_scenario(&self, id: ScenarioId) -> Result<ScenarioSnapshot> {
        self.scenarios.query(id).await
    }

    /// `{"state": "start" | "stop"}`. Returns the scenario as it stands once
    /// the command has been applied.
    pub async fn set_scenario_state(
        &self,
        id: ScenarioId,
        payload: &serde_json::Value,
    ) -> Result<ScenarioSnapshot> {
        if !self.scenarios.contains(id) {
            return Err(SprinklerError::ScenarioNotFound(id));
        }
        let Some(state) = payload.get("state").and_then(serde_json::Value::as_str) else {
            return Err(SprinklerError::BadRequest("Missing state property".into()));
        };
        let command = ScenarioCommand::parse(state)
            .ok_or_else(|| SprinklerError::BadRequest(format!("Unknown state '{state}'")))?;
        self.scenarios.set_state(id, command).await?;
        self.scenarios.query(id).await
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    pub async fn list_events(
        &self,
        actuator: Option<ActuatorId>,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<CompletedRun>> {
        let Some(id) = actuator else {
            return Err(SprinklerError::BadRequest("Missing sprinkler parameter".into()));
        };
        if !self.actuators.contains(id) {
            return Err(SprinklerError::ActuatorNotFound(id));
        }
        self.events.query(id, from, to).await
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    /// Stop scenarios, turn every actuator off and drain the event log and
    /// mirror queues.
    pub async fn shutdown(&self) {
        for scenario in self.scenarios.query_all().await {
            if scenario.state != ScenarioState::Stopped || scenario.next_run_at.is_some() {
                if let Err(e) = self.scenarios.stop(scenario.id).await {
                    warn!(scenario = scenario.id, error = %e, "failed to stop scenario");
                }
            }
        }
        for id in self.actuators.ids() {
            if let Err(e) = self.actuators.deactivate(id).await {
                warn!(actuator = id, error = %e, "failed to turn actuator off");
            }
        }
        self.events.flush().await;
        self.mirror.handle().flush().await;
        info!("sprinkler system shut down");
    }
}
