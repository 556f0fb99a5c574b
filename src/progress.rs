//! Progress reporting hooks
//!
//! Units emit step transitions to a [`ProgressReporter`]. Reporters are
//! purely informational: an error from one is logged and otherwise ignored.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use parking_lot::Mutex;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Progress reporter failed: {0}")]
pub struct ReporterError(pub String);

/// Identity of one unit within a run
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UnitId {
    pub id: Uuid,
    pub label: String,
}

impl UnitId {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            label: label.into(),
        }
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}

/// Receives step transition events
pub trait ProgressReporter: Send + Sync {
    /// A run of `total_units` units is starting
    fn start(&self, total_units: usize) -> Result<(), ReporterError>;

    /// A unit has finished its `completed_steps`-th step (or was registered
    /// with `0`) out of `total_steps`
    fn advance(&self, unit: &UnitId, completed_steps: usize, total_steps: usize) -> Result<(), ReporterError>;

    fn fail(&self, unit: &UnitId, message: &str) -> Result<(), ReporterError>;

    fn done(&self, unit: &UnitId) -> Result<(), ReporterError>;

    /// The run is over; every unit has reported
    fn stop(&self) -> Result<(), ReporterError>;
}

/// Reporter that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReporter;

impl ProgressReporter for NoopReporter {
    fn start(&self, _total_units: usize) -> Result<(), ReporterError> {
        Ok(())
    }

    fn advance(&self, _unit: &UnitId, _completed: usize, _total: usize) -> Result<(), ReporterError> {
        Ok(())
    }

    fn fail(&self, _unit: &UnitId, _message: &str) -> Result<(), ReporterError> {
        Ok(())
    }

    fn done(&self, _unit: &UnitId) -> Result<(), ReporterError> {
        Ok(())
    }

    fn stop(&self) -> Result<(), ReporterError> {
        Ok(())
    }
}

/// Reporter that turns events into `tracing` records
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl ProgressReporter for TracingReporter {
    fn start(&self, total_units: usize) -> Result<(), ReporterError> {
        tracing::info!(units = total_units, "Run started");
        Ok(())
    }

    fn advance(&self, unit: &UnitId, completed: usize, total: usize) -> Result<(), ReporterError> {
        tracing::debug!(unit = %unit, id = %unit.id, completed, total, "Unit progressed");
        Ok(())
    }

    fn fail(&self, unit: &UnitId, message: &str) -> Result<(), ReporterError> {
        tracing::warn!(unit = %unit, id = %unit.id, error = message, "Unit failed");
        Ok(())
    }

    fn done(&self, unit: &UnitId) -> Result<(), ReporterError> {
        tracing::info!(unit = %unit, id = %unit.id, "Unit done");
        Ok(())
    }

    fn stop(&self) -> Result<(), ReporterError> {
        tracing::info!("Run finished");
        Ok(())
    }
}

/// One terminal progress bar per unit
pub struct BarReporter {
    multi: MultiProgress,
    style: ProgressStyle,
    bars: Mutex<HashMap<Uuid, ProgressBar>>,
}

impl BarReporter {
    pub fn new() -> Result<Self, ReporterError> {
        Self::with_target(ProgressDrawTarget::stderr())
    }

    pub fn with_target(target: ProgressDrawTarget) -> Result<Self, ReporterError> {
        let style = ProgressStyle::default_bar()
            .template("{prefix:>28} [{bar:30.cyan/blue}] {pos}/{len} {msg}")
            .map_err(|e| ReporterError(e.to_string()))?
            .progress_chars("=> ");
        Ok(Self {
            multi: MultiProgress::with_draw_target(target),
            style,
            bars: Mutex::new(HashMap::new()),
        })
    }

    fn bar(&self, unit: &UnitId) -> Result<ProgressBar, ReporterError> {
        self.bars
            .lock()
            .get(&unit.id)
            .cloned()
            .ok_or_else(|| ReporterError(format!("unknown unit {unit}")))
    }
}

impl ProgressReporter for BarReporter {
    fn start(&self, _total_units: usize) -> Result<(), ReporterError> {
        Ok(())
    }

    fn advance(&self, unit: &UnitId, completed: usize, total: usize) -> Result<(), ReporterError> {
        let mut bars = self.bars.lock();
        let bar = bars.entry(unit.id).or_insert_with(|| {
            let bar = self.multi.add(ProgressBar::new(total as u64));
            bar.set_style(self.style.clone());
            bar.set_prefix(unit.label.clone());
            bar
        });
        bar.set_length(total as u64);
        bar.set_position(completed as u64);
        Ok(())
    }

    fn fail(&self, unit: &UnitId, message: &str) -> Result<(), ReporterError> {
        self.bar(unit)?.abandon_with_message(format!("failed: {message}"));
        Ok(())
    }

    fn done(&self, unit: &UnitId) -> Result<(), ReporterError> {
        self.bar(unit)?.finish_with_message("done");
        Ok(())
    }

    fn stop(&self) -> Result<(), ReporterError> {
        self.multi.clear().map_err(|e| ReporterError(e.to_string()))
    }
}

/// Forwards events to a reporter, logging and dropping its errors
#[derive(Clone)]
pub struct Progress {
    inner: Arc<dyn ProgressReporter>,
}

impl Progress {
    pub fn new(reporter: Arc<dyn ProgressReporter>) -> Self {
        Self { inner: reporter }
    }

    pub fn noop() -> Self {
        Self::new(Arc::new(NoopReporter))
    }

    fn swallow(event: &str, result: Result<(), ReporterError>) {
        if let Err(e) = result {
            tracing::warn!(event, error = %e, "Ignoring progress reporter failure");
        }
    }

    pub fn start(&self, total_units: usize) {
        Self::swallow("start", self.inner.start(total_units));
    }

    pub fn advance(&self, unit: &UnitId, completed: usize, total: usize) {
        Self::swallow("advance", self.inner.advance(unit, completed, total));
    }

    pub fn fail(&self, unit: &UnitId, message: &str) {
        Self::swallow("fail", self.inner.fail(unit, message));
    }

    pub fn done(&self, unit: &UnitId) {
        Self::swallow("done", self.inner.done(unit));
    }

    pub fn stop(&self) {
        Self::swallow("stop", self.inner.stop());
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self::noop()
    }
}

impl fmt::Debug for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Progress").finish_non_exhaustive()
    }
}

/// Records every event so tests can assert on reporter traffic
#[cfg(test)]
#[derive(Debug, Default)]
pub struct RecordingReporter {
    events: Mutex<Vec<String>>,
    fail_all: bool,
}

#[cfg(test)]
impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record events but return an error from every call
    pub fn failing() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            fail_all: true,
        }
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    fn record(&self, event: String) -> Result<(), ReporterError> {
        self.events.lock().push(event);
        if self.fail_all {
            Err(ReporterError("reporter offline".into()))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
impl ProgressReporter for RecordingReporter {
    fn start(&self, total_units: usize) -> Result<(), ReporterError> {
        self.record(format!("start {total_units}"))
    }

    fn advance(&self, unit: &UnitId, completed: usize, total: usize) -> Result<(), ReporterError> {
        self.record(format!("advance {unit} {completed}/{total}"))
    }

    fn fail(&self, unit: &UnitId, message: &str) -> Result<(), ReporterError> {
        self.record(format!("fail {unit}: {message}"))
    }

    fn done(&self, unit: &UnitId) -> Result<(), ReporterError> {
        self.record(format!("done {unit}"))
    }

    fn stop(&self) -> Result<(), ReporterError> {
        self.record("stop".to_string())
    }
}
