//! Completed-run log.
//!
//! # Table design
//!
//! A single `RUNS` table keyed by a 24-byte composite:
//! ```text
//! [ started_at_ms: u64 big-endian (8 bytes) | run uuid: 16 bytes ]
//! ```
//!
//! Byte order equals start-time order, so a window query is one range scan.
//!
//! [`EventLog`] is the fire-and-forget front: `record` queues the run for a
//! worker that writes it to redb and appends it to the remote `events`
//! collection. Failures on either path are logged, never returned.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, SprinklerError};
use crate::mirror::MirrorHandle;
use crate::store::{fields, Fields};

const RUNS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("runs");

/// One finished activation interval. Written once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedRun {
    pub id: Uuid,
    pub actuator_id: u64,
    pub volume_liters: f64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

impl CompletedRun {
    pub fn new(
        actuator_id: u64,
        rate_liters_per_second: f64,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
    ) -> Self {
        let elapsed = (ended_at - started_at).num_milliseconds().max(0) as f64 / 1000.0;
        Self {
            id: Uuid::new_v4(),
            actuator_id,
            volume_liters: rate_liters_per_second * elapsed,
            started_at,
            ended_at,
        }
    }

    pub fn duration_seconds(&self) -> f64 {
        (self.ended_at - self.started_at).num_milliseconds() as f64 / 1000.0
    }

    /// Shape of the record in the remote `events` collection.
    pub fn remote_fields(&self) -> Fields {
        fields(json!({
            "sprinkler": self.actuator_id,
            "start": self.started_at.timestamp_millis(),
            "end": self.ended_at.timestamp_millis(),
            "volumeInLiters": self.volume_liters,
        }))
    }
}

// ---------------------------------------------------------------------------
// Key helpers
// ---------------------------------------------------------------------------

fn bound_key(ts: DateTime<Utc>, fill: u8) -> [u8; 24] {
    let mut key = [fill; 24];
    let ms = ts.timestamp_millis().max(0) as u64;
    key[..8].copy_from_slice(&ms.to_be_bytes());
    key
}

fn run_key(run: &CompletedRun) -> [u8; 24] {
    let mut key = bound_key(run.started_at, 0);
    key[8..].copy_from_slice(run.id.as_bytes());
    key
}

// ---------------------------------------------------------------------------
// RunStore
// ---------------------------------------------------------------------------

/// Durable store for [`CompletedRun`] records.
pub struct RunStore {
    db: Database,
}

impl RunStore {
    /// Open or create the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path).map_err(SprinklerError::event_log)?;
        Self::with_db(db)
    }

    /// A store that lives only as long as the process.
    pub fn in_memory() -> Result<Self> {
        let db = Database::builder()
            .create_with_backend(redb::backends::InMemoryBackend::new())
            .map_err(SprinklerError::event_log)?;
        Self::with_db(db)
    }

    fn with_db(db: Database) -> Result<Self> {
        let wt = db.begin_write().map_err(SprinklerError::event_log)?;
        wt.open_table(RUNS).map_err(SprinklerError::event_log)?;
        wt.commit().map_err(SprinklerError::event_log)?;
        Ok(Self { db })
    }

    pub fn append(&self, run: &CompletedRun) -> Result<()> {
        let key = run_key(run);
        let value = serde_json::to_vec(run)?;
        let wt = self.db.begin_write().map_err(SprinklerError::event_log)?;
        {
            let mut table = wt.open_table(RUNS).map_err(SprinklerError::event_log)?;
            table
                .insert(key.as_slice(), value.as_slice())
                .map_err(SprinklerError::event_log)?;
        }
        wt.commit().map_err(SprinklerError::event_log)?;
        Ok(())
    }

    /// Runs of `actuator_id` that started within `[from, to]`, oldest first.
    pub fn query(
        &self,
        actuator_id: u64,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<CompletedRun>> {
        let lower = from.map(|ts| bound_key(ts, 0)).unwrap_or([0; 24]);
        let upper = to.map(|ts| bound_key(ts, 0xff)).unwrap_or([0xff; 24]);
        if lower > upper {
            return Ok(Vec::new());
        }
        let rt = self.db.begin_read().map_err(SprinklerError::event_log)?;
        let table = rt.open_table(RUNS).map_err(SprinklerError::event_log)?;

        let mut result = Vec::new();
        for entry in table
            .range(lower.as_slice()..=upper.as_slice())
            .map_err(SprinklerError::event_log)?
        {
            let (_, v) = entry.map_err(SprinklerError::event_log)?;
            let run: CompletedRun = serde_json::from_slice(v.value())?;
            if run.actuator_id == actuator_id {
                result.push(run);
            }
        }
        Ok(result)
    }

    /// Every stored run, oldest first.
    pub fn list_all(&self) -> Result<Vec<CompletedRun>> {
        let rt = self.db.begin_read().map_err(SprinklerError::event_log)?;
        let table = rt.open_table(RUNS).map_err(SprinklerError::event_log)?;
        let mut result = Vec::new();
        for entry in table.iter().map_err(SprinklerError::event_log)? {
            let (_, v) = entry.map_err(SprinklerError::event_log)?;
            result.push(serde_json::from_slice(v.value())?);
        }
        Ok(result)
    }
}

// ---------------------------------------------------------------------------
// EventLog
// ---------------------------------------------------------------------------

enum LogCommand {
    Record(CompletedRun),
    Flush(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct EventLog {
    tx: mpsc::UnboundedSender<LogCommand>,
    runs: Arc<RunStore>,
}

impl EventLog {
    /// Spawn the log worker. Requires a Tokio runtime.
    pub fn new(runs: RunStore, mirror: MirrorHandle) -> Self {
        let runs = Arc::new(runs);
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_worker(runs.clone(), mirror, rx));
        Self { tx, runs }
    }

    /// Queue one completed interval. Never fails from the caller's side.
    pub fn record(
        &self,
        actuator_id: u64,
        rate_liters_per_second: f64,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
    ) {
        let run = CompletedRun::new(actuator_id, rate_liters_per_second, started_at, ended_at);
        info!(
            actuator = actuator_id,
            seconds = run.duration_seconds(),
            liters = run.volume_liters,
            "run completed"
        );
        if self.tx.send(LogCommand::Record(run)).is_err() {
            warn!(actuator = actuator_id, "event log worker gone, run dropped");
        }
    }

    /// Wait until every run recorded before this call is stored and queued
    /// for the mirror.
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.tx.send(LogCommand::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }

    pub async fn query(
        &self,
        actuator_id: u64,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<CompletedRun>> {
        let runs = self.runs.clone();
        tokio::task::spawn_blocking(move || runs.query(actuator_id, from, to))
            .await
            .map_err(SprinklerError::event_log)?
    }
}

async fn run_worker(
    runs: Arc<RunStore>,
    mirror: MirrorHandle,
    mut rx: mpsc::UnboundedReceiver<LogCommand>,
) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            LogCommand::Record(run) => {
                let store = runs.clone();
                let stored = run.clone();
                match tokio::task::spawn_blocking(move || store.append(&stored)).await {
                    Ok(Ok(())) => debug!(run = %run.id, "run stored"),
                    Ok(Err(e)) => warn!(run = %run.id, error = %e, "failed to store run"),
                    Err(e) => warn!(run = %run.id, error = %e, "run store task failed"),
                }
                mirror.append_event(run.remote_fields());
            }
            LogCommand::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}
