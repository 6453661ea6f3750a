//! Output-line drivers.
//!
//! The actuator controller is the only caller. A line carries a raw
//! [`Level`]; which level means "watering" is decided per actuator
//! (`active_low`), not here.

use crate::error::{Result, SprinklerError};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Low,
    High,
}

impl Level {
    pub fn as_bit(self) -> u8 {
        match self {
            Self::Low => 0,
            Self::High => 1,
        }
    }

    pub fn from_bit(bit: u8) -> Self {
        if bit == 0 {
            Self::Low
        } else {
            Self::High
        }
    }

    /// Level that puts a line in the requested logical state.
    pub fn for_state(active: bool, active_low: bool) -> Self {
        match (active, active_low) {
            (true, true) | (false, false) => Self::Low,
            (true, false) | (false, true) => Self::High,
        }
    }

    /// Logical state a line at this level represents.
    pub fn is_active(self, active_low: bool) -> bool {
        (self == Self::Low) == active_low
    }
}

pub trait LineDriver: Send + Sync {
    /// Claim the line as an output. Called once per actuator at boot.
    fn setup(&self, line: u32) -> Result<()>;

    fn write(&self, line: u32, level: Level) -> Result<()>;

    fn read(&self, line: u32) -> Result<Level>;
}

pub type SharedDriver = Arc<dyn LineDriver>;

// ---------------------------------------------------------------------------
// SysfsLineDriver
// ---------------------------------------------------------------------------

/// Driver for the Linux sysfs GPIO interface (`/sys/class/gpio`).
#[derive(Debug, Clone)]
pub struct SysfsLineDriver {
    root: PathBuf,
}

pub const DEFAULT_SYSFS_ROOT: &str = "/sys/class/gpio";

impl SysfsLineDriver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn line_dir(&self, line: u32) -> PathBuf {
        self.root.join(format!("gpio{line}"))
    }

    fn write_file(path: &Path, data: &str, line: u32) -> Result<()> {
        std::fs::write(path, data).map_err(|e| SprinklerError::HardwareWrite {
            line,
            message: format!("{}: {e}", path.display()),
        })
    }
}

impl Default for SysfsLineDriver {
    fn default() -> Self {
        Self::new(DEFAULT_SYSFS_ROOT)
    }
}

impl LineDriver for SysfsLineDriver {
    fn setup(&self, line: u32) -> Result<()> {
        let dir = self.line_dir(line);
        if !dir.exists() {
            Self::write_file(&self.root.join("export"), &line.to_string(), line)?;
        }
        Self::write_file(&dir.join("direction"), "out", line)
    }

    fn write(&self, line: u32, level: Level) -> Result<()> {
        Self::write_file(
            &self.line_dir(line).join("value"),
            &level.as_bit().to_string(),
            line,
        )
    }

    fn read(&self, line: u32) -> Result<Level> {
        let path = self.line_dir(line).join("value");
        let raw = std::fs::read_to_string(&path).map_err(|e| SprinklerError::HardwareRead {
            line,
            message: format!("{}: {e}", path.display()),
        })?;
        match raw.trim() {
            "0" => Ok(Level::Low),
            "1" => Ok(Level::High),
            other => Err(SprinklerError::HardwareRead {
                line,
                message: format!("unexpected value '{other}'"),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// MockLineDriver
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct MockState {
    levels: HashMap<u32, Level>,
    writes: Vec<(u32, Level)>,
    failing: HashSet<u32>,
}

/// In-memory driver used in development mode and tests.
///
/// Every successful write is journaled; lines marked with
/// [`fail_line`](Self::fail_line) reject writes.
#[derive(Debug, Default)]
pub struct MockLineDriver {
    state: Mutex<MockState>,
}

impl MockLineDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_line(&self, line: u32) {
        self.lock().failing.insert(line);
    }

    pub fn heal_line(&self, line: u32) {
        self.lock().failing.remove(&line);
    }

    pub fn level(&self, line: u32) -> Option<Level> {
        self.lock().levels.get(&line).copied()
    }

    pub fn writes(&self) -> Vec<(u32, Level)> {
        self.lock().writes.clone()
    }

    pub fn writes_to(&self, line: u32) -> usize {
        self.lock().writes.iter().filter(|(l, _)| *l == line).count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl LineDriver for MockLineDriver {
    fn setup(&self, line: u32) -> Result<()> {
        self.lock().levels.entry(line).or_insert(Level::Low);
        Ok(())
    }

    fn write(&self, line: u32, level: Level) -> Result<()> {
        let mut state = self.lock();
        if state.failing.contains(&line) {
            return Err(SprinklerError::HardwareWrite {
                line,
                message: "mock line configured to fail".into(),
            });
        }
        tracing::debug!(line, level = ?level, "mock line write");
        state.levels.insert(line, level);
        state.writes.push((line, level));
        Ok(())
    }

    fn read(&self, line: u32) -> Result<Level> {
        self.lock()
            .levels
            .get(&line)
            .copied()
            .ok_or_else(|| SprinklerError::HardwareRead {
                line,
                message: "line was never set up".into(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn active_low_drives_line_low_when_watering() {
        assert_eq!(Level::for_state(true, true), Level::Low);
        assert_eq!(Level::for_state(false, true), Level::High);
        assert_eq!(Level::for_state(true, false), Level::High);
        assert!(Level::Low.is_active(true));
        assert!(!Level::Low.is_active(false));
    }

    #[test]
    fn sysfs_setup_sets_direction_for_exported_line() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("gpio17")).unwrap();
        let driver = SysfsLineDriver::new(dir.path());

        driver.setup(17).unwrap();

        let direction = std::fs::read_to_string(dir.path().join("gpio17/direction")).unwrap();
        assert_eq!(direction, "out");
        assert!(!dir.path().join("export").exists());
    }

    #[test]
    fn sysfs_setup_exports_missing_line() {
        let dir = TempDir::new().unwrap();
        let driver = SysfsLineDriver::new(dir.path());

        // Without a kernel behind it the export write succeeds but the line
        // directory never appears.
        let err = driver.setup(4).unwrap_err();

        assert_eq!(
            std::fs::read_to_string(dir.path().join("export")).unwrap(),
            "4"
        );
        assert!(matches!(err, SprinklerError::HardwareWrite { line: 4, .. }));
    }

    #[test]
    fn sysfs_write_then_read_round_trips_value_file() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("gpio22")).unwrap();
        let driver = SysfsLineDriver::new(dir.path());

        driver.write(22, Level::High).unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("gpio22/value")).unwrap(),
            "1"
        );
        std::fs::write(dir.path().join("gpio22/value"), "0\n").unwrap();
        assert_eq!(driver.read(22).unwrap(), Level::Low);
    }

    #[test]
    fn sysfs_read_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("gpio9")).unwrap();
        std::fs::write(dir.path().join("gpio9/value"), "x").unwrap();
        let driver = SysfsLineDriver::new(dir.path());

        assert!(matches!(
            driver.read(9),
            Err(SprinklerError::HardwareRead { line: 9, .. })
        ));
    }

    #[test]
    fn mock_driver_journals_writes_and_injects_failures() {
        let driver = MockLineDriver::new();
        driver.setup(2).unwrap();
        driver.write(2, Level::High).unwrap();
        driver.fail_line(2);
        assert!(driver.write(2, Level::Low).is_err());
        assert_eq!(driver.level(2), Some(Level::High));
        assert_eq!(driver.writes(), vec![(2, Level::High)]);

        driver.heal_line(2);
        driver.write(2, Level::Low).unwrap();
        assert_eq!(driver.writes_to(2), 2);
    }
}
