//! Scenario engine.
//!
//! A scenario is an ordered timeline of `(actuator, duration)` steps, run
//! one step at a time against the [`ActuatorController`], optionally
//! repeated every day at a fixed local time.
//!
//! Each start spawns one execution task and bumps the scenario's
//! `generation`. The task re-checks its generation and the live state under
//! the scenario lock before every step, and stop aborts it outright, so a
//! stop lands mid-sleep instead of after the current step. Lock order is
//! always scenario, then actuator.

use std::collections::{HashMap, HashSet};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tracing::{error, info, warn};

use crate::actuator::{ActuatorController, ActuatorId};
use crate::clock::SharedClock;
use crate::config::{DailyTime, ScenarioConfig, TimelineStep};
use crate::error::{Result, SprinklerError};
use crate::mirror::MirrorHandle;
use crate::store::{fields, Fields, RecordRef};

pub type ScenarioId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioState {
    Stopped,
    Running,
    Stopping,
}

impl ScenarioState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Running => "running",
            Self::Stopping => "stopping",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioCommand {
    Start,
    Stop,
}

impl ScenarioCommand {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "start" => Some(Self::Start),
            "stop" => Some(Self::Stop),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioOutcome {
    Started,
    /// Start requested while already running; nothing changed.
    AlreadyRunning,
    Stopped,
}

#[derive(Debug, Clone)]
struct Scenario {
    id: ScenarioId,
    name: String,
    timeline: Vec<TimelineStep>,
    run_daily: Option<DailyTime>,
    state: ScenarioState,
    current_step: Option<usize>,
    run_history: Vec<DateTime<Utc>>,
    next_run_at: Option<DateTime<Utc>>,
    remote_ref: Option<RecordRef>,
    version: u64,
    generation: u64,
}

impl Scenario {
    fn current_actuator(&self) -> Option<ActuatorId> {
        self.current_step
            .and_then(|idx| self.timeline.get(idx))
            .map(|step| step.actuator_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioSnapshot {
    pub uri: String,
    pub id: ScenarioId,
    pub name: String,
    pub state: ScenarioState,
    pub timeline: Vec<TimelineStep>,
    pub run_daily: Option<DailyTime>,
    pub current_step_index: Option<usize>,
    pub current_actuator: Option<ActuatorId>,
    pub run_history: Vec<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub version: u64,
    pub remote_path: Option<String>,
}

// ---------------------------------------------------------------------------
// ScenarioEngine
// ---------------------------------------------------------------------------

struct Slot {
    scenario: Scenario,
    /// Execution task: running the timeline or waiting for the next daily run.
    task: Option<AbortHandle>,
}

struct Inner {
    order: Vec<ScenarioId>,
    slots: HashMap<ScenarioId, Arc<Mutex<Slot>>>,
    actuators: ActuatorController,
    mirror: MirrorHandle,
    clock: SharedClock,
}

#[derive(Clone)]
pub struct ScenarioEngine {
    inner: Arc<Inner>,
}

impl ScenarioEngine {
    pub fn new(
        configs: &[ScenarioConfig],
        actuators: ActuatorController,
        mirror: MirrorHandle,
        clock: SharedClock,
    ) -> Result<Self> {
        let mut order = Vec::with_capacity(configs.len());
        let mut slots = HashMap::with_capacity(configs.len());
        let mut seen = HashSet::new();

        for cfg in configs {
            if !seen.insert(cfg.id) {
                return Err(SprinklerError::InvalidConfig(format!(
                    "duplicate scenario id {}",
                    cfg.id
                )));
            }
            if cfg.timeline.is_empty() {
                return Err(SprinklerError::InvalidConfig(format!(
                    "scenario {} has an empty timeline",
                    cfg.id
                )));
            }
            if let Some(step) = cfg
                .timeline
                .iter()
                .find(|s| !actuators.contains(s.actuator_id))
            {
                return Err(SprinklerError::InvalidConfig(format!(
                    "scenario {} references unknown actuator {}",
                    cfg.id, step.actuator_id
                )));
            }

            order.push(cfg.id);
            slots.insert(
                cfg.id,
                Arc::new(Mutex::new(Slot {
                    scenario: Scenario {
                        id: cfg.id,
                        name: cfg.name.clone(),
                        timeline: cfg.timeline.clone(),
                        run_daily: cfg.run_daily,
                        state: ScenarioState::Stopped,
                        current_step: None,
                        run_history: Vec::new(),
                        next_run_at: None,
                        remote_ref: None,
                        version: 0,
                        generation: 0,
                    },
                    task: None,
                })),
            );
        }

        Ok(Self {
            inner: Arc::new(Inner {
                order,
                slots,
                actuators,
                mirror,
                clock,
            }),
        })
    }

    pub fn ids(&self) -> Vec<ScenarioId> {
        self.inner.order.clone()
    }

    pub fn contains(&self, id: ScenarioId) -> bool {
        self.inner.slots.contains_key(&id)
    }

    fn slot(&self, id: ScenarioId) -> Result<Arc<Mutex<Slot>>> {
        self.inner
            .slots
            .get(&id)
            .cloned()
            .ok_or(SprinklerError::ScenarioNotFound(id))
    }

    pub async fn query(&self, id: ScenarioId) -> Result<ScenarioSnapshot> {
        let slot = self.slot(id)?;
        let slot = slot.lock().await;
        Ok(snapshot(&slot.scenario))
    }

    pub async fn query_all(&self) -> Vec<ScenarioSnapshot> {
        let mut all = Vec::with_capacity(self.inner.order.len());
        for id in &self.inner.order {
            if let Ok(s) = self.query(*id).await {
                all.push(s);
            }
        }
        all
    }

    pub async fn set_state(&self, id: ScenarioId, command: ScenarioCommand) -> Result<ScenarioOutcome> {
        match command {
            ScenarioCommand::Start => self.start(id).await,
            ScenarioCommand::Stop => self.stop(id).await,
        }
    }

    /// Begin executing the timeline in the background. A scenario that is
    /// already running is left alone.
    pub async fn start(&self, id: ScenarioId) -> Result<ScenarioOutcome> {
        let slot = self.slot(id)?;
        let mut slot = slot.lock().await;
        if slot.scenario.state != ScenarioState::Stopped {
            info!(scenario = id, "start ignored, scenario already running");
            return Ok(ScenarioOutcome::AlreadyRunning);
        }
        // A pending daily wait is superseded by this run.
        if let Some(task) = slot.task.take() {
            task.abort();
        }

        let s = &mut slot.scenario;
        s.generation += 1;
        s.current_step = None;
        s.next_run_at = None;
        s.state = ScenarioState::Running;
        s.version += 1;
        self.publish(s, running_fields(s.version));
        info!(scenario = id, name = %s.name, "scenario started");

        let generation = s.generation;
        let this = self.clone();
        let task = tokio::spawn(async move { this.execute(id, generation).await });
        slot.task = Some(task.abort_handle());
        Ok(ScenarioOutcome::Started)
    }

    /// Abort the execution task and tear down: the current step's actuator
    /// is turned off before this returns. Also cancels a pending daily run.
    pub async fn stop(&self, id: ScenarioId) -> Result<ScenarioOutcome> {
        let slot = self.slot(id)?;
        let mut slot = slot.lock().await;
        if slot.scenario.state == ScenarioState::Stopped && slot.scenario.next_run_at.is_none() {
            return Err(SprinklerError::InvalidState(format!(
                "scenario {id} is already stopped"
            )));
        }
        if let Some(task) = slot.task.take() {
            task.abort();
        }
        slot.scenario.generation += 1;
        self.teardown(&mut slot).await;
        info!(scenario = id, "scenario stopped");
        Ok(ScenarioOutcome::Stopped)
    }

    pub async fn attach_remote(&self, id: ScenarioId, record: RecordRef) -> Result<()> {
        let slot = self.slot(id)?;
        slot.lock().await.scenario.remote_ref = Some(record);
        Ok(())
    }

    /// Full remote record for (re)registration.
    pub async fn remote_fields(&self, id: ScenarioId) -> Result<Fields> {
        let slot = self.slot(id)?;
        let slot = slot.lock().await;
        let s = &slot.scenario;
        Ok(fields(json!({
            "id": s.id,
            "name": s.name,
            "state": s.state.as_str(),
            "timeline": s.timeline,
            "runDaily": s.run_daily,
            "version": s.version,
        })))
    }

    // -----------------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------------

    async fn execute(self, id: ScenarioId, generation: u64) {
        let Ok(slot) = self.slot(id) else {
            return;
        };
        loop {
            if self.run_timeline(&slot, generation).await.is_break() {
                return;
            }

            let next = {
                let mut guard = slot.lock().await;
                if guard.scenario.generation != generation {
                    return;
                }
                self.teardown(&mut guard).await;
                info!(scenario = id, "scenario run finished");

                let Some(daily) = guard.scenario.run_daily else {
                    guard.task = None;
                    return;
                };
                let now = self.inner.clock.now().with_timezone(&Local);
                let Some(next) = daily.next_after(&now).map(|t| t.with_timezone(&Utc)) else {
                    error!(scenario = id, "could not compute next daily run");
                    guard.task = None;
                    return;
                };
                let s = &mut guard.scenario;
                s.next_run_at = Some(next);
                s.version += 1;
                self.publish(
                    s,
                    fields(json!({ "nextRunAt": next.timestamp_millis(), "version": s.version })),
                );
                info!(scenario = id, next_run = %next, "next daily run scheduled");
                next
            };

            let wait = (next - self.inner.clock.now())
                .to_std()
                .unwrap_or(Duration::ZERO);
            tokio::time::sleep(wait).await;

            let mut guard = slot.lock().await;
            let s = &mut guard.scenario;
            if s.generation != generation
                || s.state != ScenarioState::Stopped
                || s.next_run_at.is_none()
            {
                return;
            }
            s.next_run_at = None;
            s.current_step = None;
            s.state = ScenarioState::Running;
            s.version += 1;
            self.publish(s, running_fields(s.version));
            info!(scenario = id, "daily run starting");
        }
    }

    async fn run_timeline(&self, slot: &Mutex<Slot>, generation: u64) -> ControlFlow<()> {
        let steps = {
            let mut guard = slot.lock().await;
            let s = &mut guard.scenario;
            if s.generation != generation || s.state != ScenarioState::Running {
                return ControlFlow::Break(());
            }
            s.run_history.push(self.inner.clock.now());
            s.version += 1;
            let history: Vec<i64> = s.run_history.iter().map(|t| t.timestamp_millis()).collect();
            self.publish(s, fields(json!({ "runHistory": history, "version": s.version })));
            s.timeline.clone()
        };

        for (idx, step) in steps.iter().enumerate() {
            {
                let mut guard = slot.lock().await;
                let s = &mut guard.scenario;
                // Live state, not a copy from loop start: stop may have landed.
                if s.generation != generation || s.state != ScenarioState::Running {
                    return ControlFlow::Break(());
                }
                s.current_step = Some(idx);
                s.version += 1;
                self.publish(
                    s,
                    fields(json!({
                        "currentStepIndex": idx,
                        "currentActuator": step.actuator_id,
                        "version": s.version,
                    })),
                );
                if let Err(e) = self.inner.actuators.activate(step.actuator_id).await {
                    warn!(scenario = s.id, step = idx, actuator = step.actuator_id, error = %e, "step skipped");
                    s.current_step = None;
                    continue;
                }
            }

            tokio::time::sleep(Duration::from_secs(step.duration_seconds)).await;

            let mut guard = slot.lock().await;
            if guard.scenario.generation != generation {
                return ControlFlow::Break(());
            }
            if let Err(e) = self.inner.actuators.deactivate(step.actuator_id).await {
                error!(scenario = guard.scenario.id, actuator = step.actuator_id, error = %e, "step shutoff failed");
            }
            guard.scenario.current_step = None;
        }
        ControlFlow::Continue(())
    }

    /// `stopping`, current actuator off, `stopped`. Observers always see the
    /// terminating `stopped`.
    async fn teardown(&self, slot: &mut Slot) {
        let s = &mut slot.scenario;
        s.state = ScenarioState::Stopping;
        s.version += 1;
        self.publish(
            s,
            fields(json!({ "state": ScenarioState::Stopping.as_str(), "version": s.version })),
        );

        if let Some(actuator) = s.current_actuator() {
            if let Err(e) = self.inner.actuators.deactivate(actuator).await {
                error!(scenario = s.id, actuator, error = %e, "failed to turn off current step");
            }
        }

        s.current_step = None;
        s.next_run_at = None;
        s.state = ScenarioState::Stopped;
        s.version += 1;
        self.publish(
            s,
            fields(json!({
                "state": ScenarioState::Stopped.as_str(),
                "currentStepIndex": null,
                "currentActuator": null,
                "nextRunAt": null,
                "version": s.version,
            })),
        );
    }

    fn publish(&self, scenario: &Scenario, fields: Fields) {
        self.inner
            .mirror
            .publish(scenario.remote_ref.as_ref(), fields);
    }
}

fn running_fields(version: u64) -> Fields {
    fields(json!({
        "state": ScenarioState::Running.as_str(),
        "currentStepIndex": null,
        "currentActuator": null,
        "nextRunAt": null,
        "version": version,
    }))
}

fn snapshot(s: &Scenario) -> ScenarioSnapshot {
    ScenarioSnapshot {
        uri: format!("/scenarios/{}", s.id),
        id: s.id,
        name: s.name.clone(),
        state: s.state,
        timeline: s.timeline.clone(),
        run_daily: s.run_daily,
        current_step_index: s.current_step,
        current_actuator: s.current_actuator(),
        run_history: s.run_history.clone(),
        next_run_at: s.next_run_at,
        version: s.version,
        remote_path: s.remote_ref.as_ref().map(RecordRef::path),
    }
}
