//! Actuator controller.
//!
//! Owns every actuator, the output lines behind them and their auto-shutoff
//! timers. Per actuator the published status walks
//!
//! ```text
//!   off -> activating -> on -> shutdown -> off
//! ```
//!
//! where `activating` and `shutdown` bracket the hardware write.
//!
//! Each actuator sits behind its own `tokio::sync::Mutex`. Commands, timer
//! firings and remote notifications all take that lock, and no transition
//! awaits while holding it, so a transition is never interleaved with another
//! one and never cut short by task cancellation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use serde_json::json;
use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tracing::{error, info, warn};

use crate::clock::SharedClock;
use crate::config::{ActuatorConfig, MAX_AUTO_SHUT_OFF_SECONDS};
use crate::error::{Result, SprinklerError};
use crate::event_log::EventLog;
use crate::hardware::{Level, SharedDriver};
use crate::mirror::MirrorHandle;
use crate::store::{fields, Fields, RecordRef};

pub type ActuatorId = u64;

/// Delay before retrying a shutoff whose line write failed.
const SHUTOFF_RETRY: Duration = Duration::from_secs(5);

const RANDOM_ID_RANGE: std::ops::Range<u64> = 100_000_000..10_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActuatorStatus {
    Off,
    Activating,
    On,
    Shutdown,
}

impl ActuatorStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Activating => "activating",
            Self::On => "on",
            Self::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Clone)]
struct Actuator {
    id: ActuatorId,
    name: String,
    line: u32,
    active_low: bool,
    rate_liters_per_second: f64,
    auto_shut_off_seconds: u64,
    is_active: bool,
    started_at: Option<DateTime<Utc>>,
    auto_ends_at: Option<DateTime<Utc>>,
    version: u64,
    remote_ref: Option<RecordRef>,
}

impl Actuator {
    fn status(&self) -> ActuatorStatus {
        if self.is_active {
            ActuatorStatus::On
        } else {
            ActuatorStatus::Off
        }
    }

    fn ends_at(&self, started_at: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        if self.auto_shut_off_seconds == 0 {
            return Ok(None);
        }
        i64::try_from(self.auto_shut_off_seconds)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .and_then(|d| started_at.checked_add_signed(d))
            .map(Some)
            .ok_or_else(|| {
                SprinklerError::InvalidConfig(format!(
                    "actuator {}: autoShutOffSeconds {} is out of range",
                    self.id, self.auto_shut_off_seconds
                ))
            })
    }
}

/// Point-in-time view of one actuator, as served to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActuatorSnapshot {
    pub uri: String,
    pub id: ActuatorId,
    pub name: String,
    pub line: u32,
    pub is_active: bool,
    pub rate_liters_per_second: f64,
    pub auto_shut_off_seconds: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub auto_ends_at: Option<DateTime<Utc>>,
    pub remaining_seconds: Option<u64>,
    /// Logical state read back from the line; `None` if the read failed.
    pub line_active: Option<bool>,
    pub version: u64,
    pub remote_path: Option<String>,
}

/// Partial update accepted by [`ActuatorController::set_state`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActuatorUpdate {
    pub is_active: Option<bool>,
    pub name: Option<String>,
}

impl ActuatorUpdate {
    pub fn activate(active: bool) -> Self {
        Self {
            is_active: Some(active),
            name: None,
        }
    }

    /// Pick the recognised fields out of a loose JSON payload. Anything
    /// else is ignored. `isActive` counts as true only when it is `true`.
    pub fn from_payload(payload: &serde_json::Value) -> Self {
        let is_active = payload
            .get("isActive")
            .or_else(|| payload.get("isactive"))
            .map(|v| v.as_bool() == Some(true));
        let name = payload
            .get("name")
            .and_then(serde_json::Value::as_str)
            .map(str::to_string);
        Self { is_active, name }
    }

    pub fn is_empty(&self) -> bool {
        self.is_active.is_none() && self.name.is_none()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SetOutcome {
    Updated(ActuatorSnapshot),
    /// The request matched current state; nothing was written.
    Unchanged(ActuatorSnapshot),
}

impl SetOutcome {
    pub fn snapshot(&self) -> &ActuatorSnapshot {
        match self {
            Self::Updated(s) | Self::Unchanged(s) => s,
        }
    }

    pub fn into_snapshot(self) -> ActuatorSnapshot {
        match self {
            Self::Updated(s) | Self::Unchanged(s) => s,
        }
    }
}

// ---------------------------------------------------------------------------
// ActuatorController
// ---------------------------------------------------------------------------

struct Slot {
    actuator: Actuator,
    timer: Option<AbortHandle>,
    /// Bumped whenever the timer is cancelled or re-armed; a firing timer
    /// carrying an older value is ignored.
    timer_generation: u64,
}

struct Inner {
    order: Vec<ActuatorId>,
    slots: HashMap<ActuatorId, Arc<Mutex<Slot>>>,
    driver: SharedDriver,
    mirror: MirrorHandle,
    events: EventLog,
    clock: SharedClock,
}

#[derive(Clone)]
pub struct ActuatorController {
    inner: Arc<Inner>,
}

impl ActuatorController {
    /// Claim every configured line and drive it to its default level.
    /// Actuators that default to active start their run (and timer) now.
    pub async fn new(
        configs: &[ActuatorConfig],
        driver: SharedDriver,
        mirror: MirrorHandle,
        events: EventLog,
        clock: SharedClock,
    ) -> Result<Self> {
        let mut order = Vec::with_capacity(configs.len());
        let mut slots = HashMap::with_capacity(configs.len());
        let now = clock.now();

        for cfg in configs {
            if cfg.auto_shut_off_seconds > MAX_AUTO_SHUT_OFF_SECONDS {
                return Err(SprinklerError::InvalidConfig(format!(
                    "actuator on line {}: autoShutOffSeconds {} exceeds {MAX_AUTO_SHUT_OFF_SECONDS}",
                    cfg.line, cfg.auto_shut_off_seconds
                )));
            }
            let id = match cfg.id {
                Some(id) if slots.contains_key(&id) => {
                    return Err(SprinklerError::InvalidConfig(format!(
                        "duplicate actuator id {id}"
                    )));
                }
                Some(id) => id,
                None => random_id(&slots),
            };

            driver.setup(cfg.line)?;
            driver.write(
                cfg.line,
                Level::for_state(cfg.is_active_by_default, cfg.active_low),
            )?;

            let mut actuator = Actuator {
                id,
                name: cfg.name.clone(),
                line: cfg.line,
                active_low: cfg.active_low,
                rate_liters_per_second: cfg.rate_liters_per_second,
                auto_shut_off_seconds: cfg.auto_shut_off_seconds,
                is_active: cfg.is_active_by_default,
                started_at: None,
                auto_ends_at: None,
                version: 0,
                remote_ref: None,
            };
            if actuator.is_active {
                actuator.started_at = Some(now);
                actuator.auto_ends_at = actuator.ends_at(now)?;
            }
            info!(actuator = id, line = cfg.line, active = actuator.is_active, "actuator ready");

            order.push(id);
            slots.insert(
                id,
                Arc::new(Mutex::new(Slot {
                    actuator,
                    timer: None,
                    timer_generation: 0,
                })),
            );
        }

        let controller = Self {
            inner: Arc::new(Inner {
                order,
                slots,
                driver,
                mirror,
                events,
                clock,
            }),
        };

        for id in &controller.inner.order {
            let slot = controller.slot(*id)?;
            let mut slot = slot.lock().await;
            if slot.actuator.is_active && slot.actuator.auto_shut_off_seconds > 0 {
                let secs = slot.actuator.auto_shut_off_seconds;
                controller.arm_timer(&mut slot, Duration::from_secs(secs));
            }
        }
        Ok(controller)
    }

    /// Actuator ids in configuration order.
    pub fn ids(&self) -> Vec<ActuatorId> {
        self.inner.order.clone()
    }

    pub fn contains(&self, id: ActuatorId) -> bool {
        self.inner.slots.contains_key(&id)
    }

    fn slot(&self, id: ActuatorId) -> Result<Arc<Mutex<Slot>>> {
        self.inner
            .slots
            .get(&id)
            .cloned()
            .ok_or(SprinklerError::ActuatorNotFound(id))
    }

    pub async fn query(&self, id: ActuatorId) -> Result<ActuatorSnapshot> {
        let slot = self.slot(id)?;
        let slot = slot.lock().await;
        Ok(self.snapshot(&slot.actuator, true))
    }

    pub async fn query_all(&self) -> Vec<ActuatorSnapshot> {
        let mut all = Vec::with_capacity(self.inner.order.len());
        for id in &self.inner.order {
            if let Ok(s) = self.query(*id).await {
                all.push(s);
            }
        }
        all
    }

    /// Apply a partial update. Requesting the current `is_active` value is
    /// a no-op: no line write, no timer change, no run recorded.
    pub async fn set_state(&self, id: ActuatorId, update: ActuatorUpdate) -> Result<SetOutcome> {
        let slot = self.slot(id)?;
        let mut slot = slot.lock().await;
        let mut changed = false;

        if let Some(active) = update.is_active {
            if active != slot.actuator.is_active {
                if active {
                    self.activate_locked(&mut slot)?;
                } else {
                    self.deactivate_locked(&mut slot)?;
                }
                changed = true;
            }
        }

        if let Some(name) = update.name {
            if name != slot.actuator.name {
                info!(actuator = id, name = %name, "actuator renamed");
                let a = &mut slot.actuator;
                a.version += 1;
                self.publish(a, fields(json!({ "name": name, "version": a.version })));
                a.name = name;
                changed = true;
            }
        }

        let snapshot = self.snapshot(&slot.actuator, false);
        Ok(if changed {
            SetOutcome::Updated(snapshot)
        } else {
            SetOutcome::Unchanged(snapshot)
        })
    }

    pub async fn activate(&self, id: ActuatorId) -> Result<SetOutcome> {
        self.set_state(id, ActuatorUpdate::activate(true)).await
    }

    pub async fn deactivate(&self, id: ActuatorId) -> Result<SetOutcome> {
        self.set_state(id, ActuatorUpdate::activate(false)).await
    }

    pub async fn attach_remote(&self, id: ActuatorId, record: RecordRef) -> Result<()> {
        let slot = self.slot(id)?;
        slot.lock().await.actuator.remote_ref = Some(record);
        Ok(())
    }

    /// Full remote record for (re)registration.
    pub async fn remote_fields(&self, id: ActuatorId) -> Result<Fields> {
        let slot = self.slot(id)?;
        let slot = slot.lock().await;
        let a = &slot.actuator;
        Ok(fields(json!({
            "id": a.id,
            "name": a.name,
            "line": a.line,
            "state": a.status().as_str(),
            "rateLitersPerSecond": a.rate_liters_per_second,
            "autoShutOffSeconds": a.auto_shut_off_seconds,
            "startedAt": a.started_at.map(|t| t.timestamp_millis()),
            "autoEndsAt": a.auto_ends_at.map(|t| t.timestamp_millis()),
            "version": a.version,
        })))
    }

    // -----------------------------------------------------------------------
    // Transitions (caller holds the slot lock)
    // -----------------------------------------------------------------------

    fn activate_locked(&self, slot: &mut Slot) -> Result<()> {
        let now = self.inner.clock.now();
        // Before any side effect.
        let auto_ends_at = slot.actuator.ends_at(now)?;
        Self::cancel_timer(slot);
        let a = &mut slot.actuator;
        a.version += 1;
        self.publish(a, status_fields(ActuatorStatus::Activating, a.version));

        if let Err(e) = self
            .inner
            .driver
            .write(a.line, Level::for_state(true, a.active_low))
        {
            error!(actuator = a.id, error = %e, "activation failed, actuator stays off");
            self.publish(a, status_fields(ActuatorStatus::Off, a.version));
            return Err(e);
        }

        a.is_active = true;
        a.started_at = Some(now);
        a.auto_ends_at = auto_ends_at;
        let mut update = status_fields(ActuatorStatus::On, a.version);
        update.insert("startedAt".into(), json!(now.timestamp_millis()));
        update.insert(
            "autoEndsAt".into(),
            json!(a.auto_ends_at.map(|t| t.timestamp_millis())),
        );
        self.publish(a, update);
        info!(actuator = a.id, auto_shut_off = a.auto_shut_off_seconds, "actuator on");

        let secs = a.auto_shut_off_seconds;
        if secs > 0 {
            self.arm_timer(slot, Duration::from_secs(secs));
        }
        Ok(())
    }

    fn deactivate_locked(&self, slot: &mut Slot) -> Result<()> {
        Self::cancel_timer(slot);
        let now = self.inner.clock.now();
        let a = &mut slot.actuator;
        a.version += 1;
        self.publish(a, status_fields(ActuatorStatus::Shutdown, a.version));

        if let Err(e) = self
            .inner
            .driver
            .write(a.line, Level::for_state(false, a.active_low))
        {
            error!(actuator = a.id, error = %e, "shutoff failed, actuator stays on");
            self.publish(a, status_fields(ActuatorStatus::On, a.version));
            // Keep the safety net: retry when the run was due to end anyway.
            let retry = a.auto_ends_at.map(|end| {
                (end - now)
                    .to_std()
                    .unwrap_or(Duration::ZERO)
                    .max(SHUTOFF_RETRY)
            });
            if let Some(delay) = retry {
                self.arm_timer(slot, delay);
            }
            return Err(e);
        }

        let started_at = a.started_at.take();
        a.auto_ends_at = None;
        a.is_active = false;
        let mut update = status_fields(ActuatorStatus::Off, a.version);
        update.insert("startedAt".into(), serde_json::Value::Null);
        update.insert("autoEndsAt".into(), serde_json::Value::Null);
        self.publish(a, update);
        info!(actuator = a.id, "actuator off");

        if let Some(started_at) = started_at {
            self.inner
                .events
                .record(a.id, a.rate_liters_per_second, started_at, now);
        }
        Ok(())
    }

    fn arm_timer(&self, slot: &mut Slot, after: Duration) {
        slot.timer_generation += 1;
        let generation = slot.timer_generation;
        let id = slot.actuator.id;
        let this = self.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            this.auto_shut_off(id, generation).await;
        });
        slot.timer = Some(task.abort_handle());
    }

    fn cancel_timer(slot: &mut Slot) {
        slot.timer_generation += 1;
        if let Some(timer) = slot.timer.take() {
            timer.abort();
        }
    }

    async fn auto_shut_off(&self, id: ActuatorId, generation: u64) {
        let Ok(slot) = self.slot(id) else {
            return;
        };
        let mut slot = slot.lock().await;
        if slot.timer_generation != generation || !slot.actuator.is_active {
            return;
        }
        // This task is the timer; drop its handle so cancel_timer leaves it be.
        slot.timer = None;
        warn!(actuator = id, "auto-shutoff reached, turning actuator off");
        if let Err(e) = self.deactivate_locked(&mut slot) {
            error!(actuator = id, error = %e, "auto-shutoff failed");
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn publish(&self, actuator: &Actuator, fields: Fields) {
        self.inner
            .mirror
            .publish(actuator.remote_ref.as_ref(), fields);
    }

    fn snapshot(&self, a: &Actuator, read_back: bool) -> ActuatorSnapshot {
        let line_active = if read_back {
            match self.inner.driver.read(a.line) {
                Ok(level) => {
                    let line_active = level.is_active(a.active_low);
                    if line_active != a.is_active {
                        warn!(
                            actuator = a.id,
                            line = a.line,
                            line_active,
                            "line level disagrees with actuator state"
                        );
                    }
                    Some(line_active)
                }
                Err(e) => {
                    warn!(actuator = a.id, error = %e, "line read-back failed");
                    None
                }
            }
        } else {
            None
        };
        let now = self.inner.clock.now();
        ActuatorSnapshot {
            uri: format!("/sprinklers/{}", a.id),
            id: a.id,
            name: a.name.clone(),
            line: a.line,
            is_active: a.is_active,
            rate_liters_per_second: a.rate_liters_per_second,
            auto_shut_off_seconds: a.auto_shut_off_seconds,
            started_at: a.started_at,
            auto_ends_at: a.auto_ends_at,
            remaining_seconds: a
                .auto_ends_at
                .map(|end| (end - now).num_seconds().max(0) as u64),
            line_active,
            version: a.version,
            remote_path: a.remote_ref.as_ref().map(RecordRef::path),
        }
    }
}

fn status_fields(status: ActuatorStatus, version: u64) -> Fields {
    fields(json!({ "state": status.as_str(), "version": version }))
}

fn random_id<V>(taken: &HashMap<ActuatorId, V>) -> ActuatorId {
    let mut rng = rand::thread_rng();
    loop {
        let id = rng.gen_range(RANDOM_ID_RANGE);
        if !taken.contains_key(&id) {
            return id;
        }
    }
}
