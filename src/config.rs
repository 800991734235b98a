//! Run configuration.
//!
//! Built once by the binary, from defaults overlaid with an optional YAML file and command line
//! flags, then passed by reference to whatever needs it. Durations are plain `*_ms` integers.

use std::fs;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::client::ClientTiming;
use crate::codec::Encoder;
use crate::error::{Error, Result};
use crate::params::ParameterTable;
use crate::poll::PollConfig;
use crate::state::StateStore;
use crate::steps::CalibrationPlan;
use crate::topology::{Socket, Topology};
use crate::transport::{StreamTiming, TcpConnector, Terminator};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Meters on the bench. Has to be set; there is no sensible default.
    pub meter_count: u16,
    pub meters_per_socket: u16,
    /// Visit order; socket `i` serves globals `i * meters_per_socket + 1 ..`.
    pub sockets: Vec<Socket>,
    pub slave_id: u8,
    pub state_dir: PathBuf,
    pub link: LinkConfig,
    pub calibration: CalibrationConfig,
    /// Inclusive register ranges whose floats travel low word first.
    pub word_swap_ranges: Vec<[u16; 2]>,
    /// Sent to every gateway by `init`.
    pub init_commands: Vec<String>,
    pub init_gap_ms: u64,
    /// Replaces the built-in plan when set.
    pub plan: Option<CalibrationPlan>,
    pub parameters: ParameterTable,
    pub cal_done: CalDoneConfig,
    pub programming: ProgrammingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            meter_count: 0,
            meters_per_socket: 10,
            sockets: vec![
                Socket::new("192.168.100.100", 12345),
                Socket::new("192.168.100.101", 12345),
            ],
            slave_id: 1,
            state_dir: PathBuf::from("."),
            link: LinkConfig::default(),
            calibration: CalibrationConfig::default(),
            word_swap_ranges: Vec::new(),
            init_commands: ["VER", "MCO0,3", "MCP0,9600,N,8,1", "MCSP0,1,2", "MCSU0,1"]
                .into_iter()
                .map(String::from)
                .collect(),
            init_gap_ms: 50,
            plan: None,
            parameters: ParameterTable::measurements(),
            cal_done: CalDoneConfig::default(),
            programming: ProgrammingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub connect_timeout_ms: u64,
    pub reply_timeout_ms: u64,
    pub post_send_ms: u64,
    pub grace_ms: u64,
    pub trailing_ms: u64,
    pub terminator: Terminator,
    pub read_retries: u32,
    pub retry_gap_ms: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 2000,
            reply_timeout_ms: 2000,
            post_send_ms: 100,
            grace_ms: 500,
            trailing_ms: 200,
            terminator: Terminator::Cr,
            read_retries: 3,
            retry_gap_ms: 200,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Settle time between writing a busy code and the first poll.
    pub busy_settle_ms: u64,
    /// Pause before opening each socket after the first.
    pub socket_switch_ms: u64,
    pub poll_round_delay_ms: u64,
    pub poll_first_phase_ms: u64,
    pub poll_second_phase_ms: u64,
    pub poll_busy_backoff_ms: u64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            busy_settle_ms: 7000,
            socket_switch_ms: 3000,
            poll_round_delay_ms: 1200,
            poll_first_phase_ms: 30_000,
            poll_second_phase_ms: 40_000,
            poll_busy_backoff_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalDoneConfig {
    /// Between writing the flag and reading it back.
    pub verify_delay_ms: u64,
}

impl Default for CalDoneConfig {
    fn default() -> Self {
        Self {
            verify_delay_ms: 3000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgrammingConfig {
    /// Pause before every programming write.
    pub write_gap_ms: u64,
}

impl Default for ProgrammingConfig {
    fn default() -> Self {
        Self { write_gap_ms: 1000 }
    }
}

impl Config {
    /// Load a YAML file. Keys it leaves out keep their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config = Self::from_yaml(&text)
            .map_err(|e| Error::Configuration(format!("{}: {}", path.display(), e)))?;
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).map_err(|e| Error::Configuration(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.sockets.is_empty() {
            return Err(Error::Configuration("no sockets configured".into()));
        }
        if self.meter_count == 0 {
            return Err(Error::Configuration(
                "meter_count is zero; set it in the config file or with --meters".into(),
            ));
        }
        if self.meters_per_socket == 0 {
            return Err(Error::Configuration("meters_per_socket is zero".into()));
        }
        if !(1..=247).contains(&self.slave_id) {
            return Err(Error::Configuration(format!(
                "slave_id {} is outside 1..=247",
                self.slave_id
            )));
        }
        if let Some([start, end]) = self.word_swap_ranges.iter().find(|[s, e]| s > e) {
            return Err(Error::Configuration(format!(
                "word swap range {start:#06X}..={end:#06X} is reversed"
            )));
        }
        self.plan().validate()?;
        self.parameters.validate()
    }

    pub fn topology(&self) -> Result<Topology> {
        Topology::new(self.sockets.clone(), self.meter_count, self.meters_per_socket)
    }

    pub fn plan(&self) -> CalibrationPlan {
        self.plan.clone().unwrap_or_default()
    }

    pub fn encoder(&self) -> Encoder {
        let ranges: Vec<RangeInclusive<u16>> = self
            .word_swap_ranges
            .iter()
            .map(|[start, end]| *start..=*end)
            .collect();
        Encoder::new(self.slave_id, self.meter_count).with_word_swap(ranges)
    }

    pub fn state_store(&self) -> StateStore {
        StateStore::new(&self.state_dir)
    }

    pub fn client_timing(&self) -> ClientTiming {
        ClientTiming {
            reply_timeout: ms(self.link.reply_timeout_ms),
            read_retries: self.link.read_retries,
            retry_gap: ms(self.link.retry_gap_ms),
        }
    }

    pub fn tcp_connector(&self) -> TcpConnector {
        TcpConnector {
            connect_timeout: ms(self.link.connect_timeout_ms),
            terminator: self.link.terminator,
            timing: StreamTiming {
                post_send: ms(self.link.post_send_ms),
                grace: ms(self.link.grace_ms),
                trailing: ms(self.link.trailing_ms),
            },
        }
    }

    pub fn poll_config(&self) -> PollConfig {
        PollConfig {
            round_delay: ms(self.calibration.poll_round_delay_ms),
            first_phase: ms(self.calibration.poll_first_phase_ms),
            second_phase: ms(self.calibration.poll_second_phase_ms),
            busy_backoff: ms(self.calibration.poll_busy_backoff_ms),
        }
    }

    pub fn busy_settle(&self) -> Duration {
        ms(self.calibration.busy_settle_ms)
    }

    pub fn socket_switch(&self) -> Duration {
        ms(self.calibration.socket_switch_ms)
    }

    pub fn init_gap(&self) -> Duration {
        ms(self.init_gap_ms)
    }
}

pub(crate) fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}
