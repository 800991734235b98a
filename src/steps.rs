//! Calibration steps and the groups they are run in.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::register::CALIBRATION_UNLOCK;

/// One calibration step, run against every active meter of a socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub description: String,
    /// Written to the command register when present.
    #[serde(default)]
    pub code: Option<u32>,
    /// Pause after each write of `code`.
    #[serde(default)]
    pub wait_ms: u64,
    /// The operator has to change the applied input before this step.
    #[serde(default)]
    pub input_change: bool,
    /// The meters go busy and must be polled until ready.
    #[serde(default)]
    pub busy_poll: bool,
}

/// What running a [`Step`] means on the wire. The operator gate of `input_change` comes first
/// and is independent of this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepAction {
    /// Optionally write a code, then wait and poll every meter until ready.
    BusyPoll { code: Option<u32> },
    /// Write a code to every meter.
    Write { code: u32 },
    /// Nothing to send.
    Placeholder,
}

impl Step {
    fn new(description: &str) -> Self {
        Self {
            description: description.into(),
            code: None,
            wait_ms: 0,
            input_change: false,
            busy_poll: false,
        }
    }

    fn write(description: &str, code: u32, wait: Duration) -> Self {
        Self {
            code: Some(code),
            wait_ms: wait.as_millis() as u64,
            ..Self::new(description)
        }
    }

    fn busy(description: &str, code: u32, wait: Duration) -> Self {
        Self {
            busy_poll: true,
            ..Self::write(description, code, wait)
        }
    }

    pub fn wait(&self) -> Duration {
        Duration::from_millis(self.wait_ms)
    }

    pub fn action(&self) -> StepAction {
        match (self.busy_poll, self.code) {
            (true, code) => StepAction::BusyPoll { code },
            (false, Some(code)) => StepAction::Write { code },
            (false, None) => StepAction::Placeholder,
        }
    }
}

/// An ordered list of steps cut into contiguous groups, numbered from 1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalibrationPlan {
    pub name: String,
    pub steps: Vec<Step>,
    /// Half-open `[start, end)` step index bounds of each group.
    pub groups: Vec<[usize; 2]>,
}

impl CalibrationPlan {
    /// The 3P4W quantization compensation sequence.
    pub fn quant_compensation_3p4w() -> Self {
        let second = Duration::from_secs(1);
        Self {
            name: "3P4W quant compensation".into(),
            steps: vec![
                Step::new("Change Connection per 3P4W"),
                Step::new("Turn ON Calmet - Input Step 1"),
                Step::write("Unlock Calibration", CALIBRATION_UNLOCK, Duration::ZERO),
                Step::busy("Import Energy Quantization", 904, second),
                Step::new("Apply Input Step 2"),
                Step::busy("Export Energy Quantization", 905, second),
                Step::new("Apply Input Step 3"),
                Step::busy("Import Current Quantization", 906, second),
                Step::new("Apply Input Step 4"),
                Step::busy("Export Current Quantization", 907, second),
                Step::busy("Export Voltage Quantization", 908, second),
                Step::write("Save Coefficient in EEPROM", 909, 2 * second),
            ],
            groups: vec![[0, 4], [4, 6], [6, 8], [8, 12]],
        }
    }

    /// Groups must tile the step list exactly, in order and without gaps.
    pub fn validate(&self) -> Result<()> {
        if self.groups.is_empty() {
            return Err(Error::Configuration(format!("plan '{}' has no groups", self.name)));
        }
        let mut expected_start = 0;
        for (index, [start, end]) in self.groups.iter().copied().enumerate() {
            if start != expected_start || end <= start {
                return Err(Error::Configuration(format!(
                    "plan '{}': group {} spans [{}, {}), expected a non-empty group starting at {}",
                    self.name,
                    index + 1,
                    start,
                    end,
                    expected_start
                )));
            }
            expected_start = end;
        }
        if expected_start != self.steps.len() {
            return Err(Error::Configuration(format!(
                "plan '{}': groups cover {} of {} steps",
                self.name,
                expected_start,
                self.steps.len()
            )));
        }
        Ok(())
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Steps of group `group`, counted from 1.
    pub fn group(&self, group: usize) -> Option<&[Step]> {
        let [start, end] = *self.groups.get(group.checked_sub(1)?)?;
        self.steps.get(start..end)
    }
}

impl Default for CalibrationPlan {
    fn default() -> Self {
        Self::quant_compensation_3p4w()
    }
}
