//! Reading measured parameters back from the meters and checking them against limits.

use std::collections::BTreeMap;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::client::McwClient;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::state::StateStore;
use crate::sweep::sweep;
use crate::topology::{GlobalMeterId, LocalMeterId};
use crate::transport::{Connector, Transport};

pub const PARAMS_REPORT_FILE: &str = "meter_params.json";

/// Most registers a single read can ask for.
const MAX_READ_REGISTERS: usize = 125;

/// A named float and the inclusive range it must fall in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    pub min: f32,
    pub max: f32,
}

impl ParameterSpec {
    pub fn new(name: impl Into<String>, min: f32, max: f32) -> Self {
        Self {
            name: name.into(),
            min,
            max,
        }
    }

    pub fn check(&self, value: f32) -> ParamStatus {
        if (self.min..=self.max).contains(&value) {
            ParamStatus::Pass
        } else {
            ParamStatus::Fail
        }
    }
}

/// Consecutive float parameters read in one request, two registers each.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterTable {
    pub start_register: u16,
    pub parameters: Vec<ParameterSpec>,
}

impl ParameterTable {
    /// Per phase voltage, current and active power, starting at register 0x0000.
    pub fn measurements() -> Self {
        let mut parameters = Vec::with_capacity(9);
        for (quantity, min, max) in [
            ("voltage", 220.0, 240.0),
            ("current", 4.0, 5.5),
            ("watt", 0.0, 1500.0),
        ] {
            for phase in 1..=3 {
                parameters.push(ParameterSpec::new(format!("{quantity}_L{phase}"), min, max));
            }
        }
        Self {
            start_register: 0x0000,
            parameters,
        }
    }

    pub fn register_count(&self) -> usize {
        self.parameters.len() * 2
    }

    pub fn validate(&self) -> Result<()> {
        if self.parameters.is_empty() {
            return Err(Error::Configuration("parameter table is empty".into()));
        }
        if self.register_count() > MAX_READ_REGISTERS {
            return Err(Error::Configuration(format!(
                "parameter table spans {} registers, at most {} fit in one read",
                self.register_count(),
                MAX_READ_REGISTERS
            )));
        }
        if let Some(spec) = self.parameters.iter().find(|p| p.min > p.max) {
            return Err(Error::Configuration(format!(
                "parameter {} has min {} above max {}",
                spec.name, spec.min, spec.max
            )));
        }
        Ok(())
    }

    /// Pair every value with its limits and classify it.
    pub fn classify(&self, values: &[f32]) -> BTreeMap<String, ParamValue> {
        self.parameters
            .iter()
            .zip(values)
            .map(|(spec, &value)| {
                let status = spec.check(value);
                let reason = (status == ParamStatus::Fail).then(|| "out_of_range".to_string());
                (
                    spec.name.clone(),
                    ParamValue {
                        value,
                        status,
                        reason,
                    },
                )
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ParamStatus {
    Pass,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamValue {
    pub value: f32,
    pub status: ParamStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// What was learned about one meter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeterParams {
    pub global_meter: GlobalMeterId,
    pub local_meter: LocalMeterId,
    pub params: BTreeMap<String, ParamValue>,
    pub pass: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl MeterParams {
    fn failed(global: GlobalMeterId, local: LocalMeterId, error: &str) -> Self {
        Self {
            global_meter: global,
            local_meter: local,
            params: BTreeMap::new(),
            pass: false,
            error: Some(error.to_string()),
        }
    }
}

pub type ParamsReport = BTreeMap<GlobalMeterId, MeterParams>;

/// Read `table` from one meter and judge the values.
pub fn read_meter<T: Transport>(
    client: &mut McwClient<T>,
    table: &ParameterTable,
    global: GlobalMeterId,
    local: LocalMeterId,
) -> Result<MeterParams> {
    let Some(values) = client.read_floats(local, table.start_register, table.parameters.len())?
    else {
        return Ok(MeterParams::failed(global, local, "no_valid_frame"));
    };
    let params = table.classify(&values);
    let pass = params.values().all(|p| p.status == ParamStatus::Pass);
    Ok(MeterParams {
        global_meter: global,
        local_meter: local,
        params,
        pass,
        error: None,
    })
}

/// Read and validate every meter of the bench, then write [`PARAMS_REPORT_FILE`].
///
/// Problematic meters are not asked and are reported as `skipped`. Meters of a socket that could
/// not be driven are reported with a `transport_error`.
pub fn read_parameters<C: Connector>(
    config: &Config,
    connector: &mut C,
    store: &StateStore,
) -> Result<ParamsReport> {
    let problematic = store.load_problematic()?;
    let table = &config.parameters;
    let mut report = ParamsReport::new();

    let failed = sweep(config, connector, |client, pairs| {
        for pair in pairs {
            let entry = if problematic.contains(&pair.global) {
                info!("[{}] Skipping problematic {}", client.socket(), pair);
                MeterParams::failed(pair.global, pair.local, "skipped")
            } else {
                read_meter(client, table, pair.global, pair.local)?
            };
            if entry.pass {
                info!("[{}] {} parameters PASS", client.socket(), pair);
            } else if entry.error.is_none() {
                warn!("[{}] {} parameters FAIL", client.socket(), pair);
            }
            report.insert(pair.global, entry);
        }
        Ok(())
    })?;

    if !failed.is_empty() {
        let topology = config.topology()?;
        for global in (1..=topology.meter_count()).map(GlobalMeterId) {
            if let Some((_, local)) = topology.locate(global) {
                report
                    .entry(global)
                    .or_insert_with(|| MeterParams::failed(global, local, "transport_error"));
            }
        }
    }

    store.save(PARAMS_REPORT_FILE, &report)?;
    let passed = report.values().filter(|m| m.pass).count();
    info!(
        "Parameter check: {}/{} meters passed, report in {}",
        passed,
        report.len(),
        store.path(PARAMS_REPORT_FILE).display()
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CalibrationConfig;
    use crate::simulator::{BankSettings, SimulatedConnector};
    use crate::state::ProblematicSet;
    use tempfile::tempdir;

    fn config(dir: &std::path::Path) -> Config {
        let mut config = Config {
            meter_count: 12,
            state_dir: dir.to_path_buf(),
            calibration: CalibrationConfig {
                socket_switch_ms: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        config.link.reply_timeout_ms = 0;
        config.link.retry_gap_ms = 0;
        config
    }

    #[test]
    fn measurement_table_layout() {
        let table = ParameterTable::measurements();
        table.validate().unwrap();
        assert_eq!(table.start_register, 0);
        assert_eq!(table.register_count(), 18);
        assert_eq!(table.parameters[0].name, "voltage_L1");
        assert_eq!(table.parameters[5].name, "current_L3");
        assert_eq!(table.parameters[8], ParameterSpec::new("watt_L3", 0.0, 1500.0));
    }

    #[test]
    fn limits_are_inclusive() {
        let table = ParameterTable::measurements();
        let values = [220.0, 240.0, 240.5, 4.0, 5.5, 3.9, 0.0, 1500.0, -1.0];
        let params = table.classify(&values);
        let failed: Vec<&str> = params
            .iter()
            .filter(|(_, p)| p.status == ParamStatus::Fail)
            .map(|(name, _)| name.as_str())
            .collect();
        assert_eq!(failed, vec!["current_L3", "voltage_L3", "watt_L3"]);
        assert_eq!(params["voltage_L3"].reason.as_deref(), Some("out_of_range"));
        assert_eq!(params["voltage_L1"].reason, None);
    }

    #[test]
    fn invalid_tables_are_rejected() {
        let mut table = ParameterTable::measurements();
        table.parameters[0].min = 300.0;
        assert!(table.validate().is_err());
        table.parameters.clear();
        assert!(table.validate().is_err());
        let huge = ParameterTable {
            start_register: 0,
            parameters: (0..63).map(|i| ParameterSpec::new(format!("p{i}"), 0.0, 1.0)).collect(),
        };
        assert!(huge.validate().is_err());
    }

    #[test]
    fn bench_report() {
        let dir = tempdir().unwrap();
        let config = config(dir.path());
        let store = config.state_store();
        store
            .save_problematic(&ProblematicSet::from([GlobalMeterId(4)]))
            .unwrap();
        let mut connector =
            SimulatedConnector::new(BankSettings::default()).silent(&config.sockets[1], 2);

        let report = read_parameters(&config, &mut connector, &store).unwrap();

        assert_eq!(report.len(), 12);
        assert!(report[&GlobalMeterId(1)].pass);
        assert_eq!(report[&GlobalMeterId(1)].params.len(), 9);
        assert_eq!(report[&GlobalMeterId(4)].error.as_deref(), Some("skipped"));
        assert_eq!(
            report[&GlobalMeterId(12)].error.as_deref(),
            Some("no_valid_frame")
        );
        assert_eq!(report[&GlobalMeterId(12)].local_meter, LocalMeterId::new(2));
        assert!(
            !connector
                .journal()
                .sent_to(&config.sockets[0])
                .iter()
                .any(|c| c.starts_with("MCW4,"))
        );

        let saved: ParamsReport = store.load(PARAMS_REPORT_FILE).unwrap().unwrap();
        assert_eq!(saved, report);
    }

    #[test]
    fn unreachable_socket_is_reported() {
        let dir = tempdir().unwrap();
        let config = config(dir.path());
        let store = config.state_store();
        let mut connector =
            SimulatedConnector::new(BankSettings::default()).refuse(&config.sockets[1]);
        let report = read_parameters(&config, &mut connector, &store).unwrap();
        assert_eq!(report.len(), 12);
        assert_eq!(
            report[&GlobalMeterId(11)].error.as_deref(),
            Some("transport_error")
        );
        assert!(report[&GlobalMeterId(10)].pass);
    }
}
