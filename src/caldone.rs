//! Closing calibration: every meter is told it is calibrated and asked to confirm.

use std::collections::{BTreeMap, BTreeSet};
use std::thread;
use std::time::Duration;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::client::McwClient;
use crate::config::{Config, ms};
use crate::error::Result;
use crate::params::{PARAMS_REPORT_FILE, ParamsReport};
use crate::register::{CAL_DONE_CONFIRMED, CAL_DONE_VALUE, MeterRegister};
use crate::state::StateStore;
use crate::sweep::sweep;
use crate::topology::{GlobalMeterId, MeterPair};
use crate::transport::{Connector, Transport};

pub const CALDONE_LOG_FILE: &str = "caldone_log.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CalDoneResult {
    /// The meter read back the confirmation value.
    CalSuccess,
    /// The meter answered with something else.
    CalFail,
    /// Nothing readable came back.
    ParamFail,
    /// Problematic meter or failed parameter check, never asked.
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WriteStatus {
    Ok,
    NoAnswer,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalDoneRecord {
    pub write: WriteStatus,
    #[serde(default)]
    pub read_val: Option<f32>,
    pub result: CalDoneResult,
}

pub type CalDoneLog = BTreeMap<GlobalMeterId, CalDoneRecord>;

fn classify(value: Option<f32>) -> CalDoneResult {
    match value {
        Some(v) if v == CAL_DONE_CONFIRMED => CalDoneResult::CalSuccess,
        Some(_) => CalDoneResult::CalFail,
        None => CalDoneResult::ParamFail,
    }
}

fn close_meter<T: Transport>(
    client: &mut McwClient<T>,
    pair: &MeterPair,
    verify_delay: Duration,
) -> Result<CalDoneRecord> {
    let write = if client.write_floats(pair.local, MeterRegister::CalDone, &[CAL_DONE_VALUE])? {
        WriteStatus::Ok
    } else {
        WriteStatus::NoAnswer
    };
    thread::sleep(verify_delay);
    let read_val = client.read_float(pair.local, MeterRegister::CalDone)?;
    let result = classify(read_val);
    match result {
        CalDoneResult::CalSuccess => info!("[{}] {} CAL_SUCCESS", client.socket(), pair),
        _ => warn!(
            "[{}] {} {:?}, read back {:?}",
            client.socket(),
            pair,
            result,
            read_val
        ),
    }
    Ok(CalDoneRecord {
        write,
        read_val,
        result,
    })
}

/// Meters the last parameter check rejected. No report means nobody was rejected.
fn load_param_failures(store: &StateStore) -> Result<BTreeSet<GlobalMeterId>> {
    let report: ParamsReport = store.load(PARAMS_REPORT_FILE)?.unwrap_or_default();
    Ok(report
        .into_iter()
        .filter(|(_, meter)| !meter.pass)
        .map(|(global, _)| global)
        .collect())
}

/// Write the cal-done flag to every meter that is neither problematic nor rejected by the last
/// parameter check, verify it, and record the outcome in [`CALDONE_LOG_FILE`].
///
/// Meters on a socket that failed part way are logged as `PARAM_FAIL`.
pub fn run_cal_done<C: Connector>(
    config: &Config,
    connector: &mut C,
    store: &StateStore,
) -> Result<CalDoneLog> {
    let problematic = store.load_problematic()?;
    let param_failures = load_param_failures(store)?;
    let verify_delay = ms(config.cal_done.verify_delay_ms);
    let mut log = CalDoneLog::new();

    let failed = sweep(config, connector, |client, pairs| {
        for pair in pairs {
            let skip = if problematic.contains(&pair.global) {
                Some("problematic")
            } else if param_failures.contains(&pair.global) {
                Some("failed the parameter check")
            } else {
                None
            };
            let record = if let Some(reason) = skip {
                info!("[{}] Skipping {}: {}", client.socket(), pair, reason);
                CalDoneRecord {
                    write: WriteStatus::Skipped,
                    read_val: None,
                    result: CalDoneResult::Skipped,
                }
            } else {
                close_meter(client, pair, verify_delay)?
            };
            log.insert(pair.global, record);
        }
        Ok(())
    })?;

    if !failed.is_empty() {
        let topology = config.topology()?;
        let reachable = (1..=topology.meter_count())
            .map(GlobalMeterId)
            .filter(|g| topology.locate(*g).is_some());
        for global in reachable {
            log.entry(global).or_insert(CalDoneRecord {
                write: WriteStatus::NoAnswer,
                read_val: None,
                result: CalDoneResult::ParamFail,
            });
        }
    }

    store.save(CALDONE_LOG_FILE, &log)?;
    let succeeded = log
        .values()
        .filter(|r| r.result == CalDoneResult::CalSuccess)
        .count();
    info!("Cal done: {}/{} meters confirmed", succeeded, log.len());
    Ok(log)
}

/// Meters a previous cal-done run confirmed. A missing log means none.
pub fn load_confirmed(store: &StateStore) -> Result<Vec<GlobalMeterId>> {
    let log: CalDoneLog = store.load(CALDONE_LOG_FILE)?.unwrap_or_default();
    Ok(log
        .into_iter()
        .filter(|(_, record)| record.result == CalDoneResult::CalSuccess)
        .map(|(global, _)| global)
        .collect())
}
