//! Accumulate scenario outcomes and persist them as one CSV dataset.
//!
//! Outcomes are held in memory until [Recorder::persist] is called at the end of a run. A run
//! that dies before then loses every outcome it produced.

use crate::{scenario::Outcome, Error};
use std::{fs, path::Path};
use tracing::{info, warn};

/// Ordered list of completed scenario outcomes.
#[derive(Default)]
pub struct Recorder {
    outcomes: Vec<Outcome>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the outcome of a completed scenario.
    pub fn record(&mut self, outcome: Outcome) {
        info!(
            scenario = %outcome.scenario,
            availability = outcome.availability,
            recovery_time = outcome.recovery_time,
            sync_complete = outcome.sync_complete,
            data_consistent = outcome.data_consistent,
            "recorded outcome"
        );
        self.outcomes.push(outcome);
    }

    /// Returns every recorded outcome in completion order.
    pub fn outcomes(&self) -> &[Outcome] {
        &self.outcomes
    }

    /// Write every recorded outcome to `path` (with a header row), replacing any existing file.
    ///
    /// Nothing is written if no outcomes were recorded.
    pub fn persist(&self, path: &Path) -> Result<(), Error> {
        if self.outcomes.is_empty() {
            warn!(path = ?path, "no outcomes recorded, skipping persistence");
            return Ok(());
        }
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut writer = csv::Writer::from_path(path)?;
        for outcome in &self.outcomes {
            writer.serialize(outcome)?;
        }
        writer.flush()?;
        info!(path = ?path, rows = self.outcomes.len(), "persisted outcomes");
        Ok(())
    }
}
