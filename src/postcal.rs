//! Programming identity into calibrated meters: serial number, manufacture date and model code.

use std::str::FromStr;
use std::thread;
use std::time::Duration;

use chrono::Datelike;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;

use crate::caldone::load_confirmed;
use crate::client::McwClient;
use crate::config::{Config, ms};
use crate::error::{Error, Result};
use crate::operator::Operator;
use crate::register::{MeterModel, MeterRating, MeterRegister, MeterVariant, PROGRAMMING_UNLOCK};
use crate::state::StateStore;
use crate::sweep::sweep;
use crate::topology::{GlobalMeterId, MeterPair};
use crate::transport::{Connector, Transport};

pub const POSTCAL_LOG_FILE: &str = "postcal_log.json";

/// `YYMM` of today, e.g. 2610 for October 2026.
pub fn current_yymm() -> u32 {
    let today = chrono::Local::now();
    (today.year().rem_euclid(100) as u32) * 100 + today.month()
}

/// A starting serial has exactly six digits.
pub fn parse_serial(text: &str) -> Result<u32> {
    let text = text.trim();
    if text.len() != 6 || !text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::Operator(format!(
            "serial number must be 6 digits, got '{text}'"
        )));
    }
    text.parse()
        .map_err(|_| Error::Operator(format!("bad serial number '{text}'")))
}

/// What gets programmed, fixed before the first meter is touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramRequest {
    pub serial_start: u32,
    pub yymm: u32,
    pub model: MeterModel,
}

impl ProgramRequest {
    /// Take the values given up front and ask the operator for the rest.
    pub fn resolve<O: Operator + ?Sized>(
        operator: &mut O,
        serial: Option<&str>,
        rating: Option<MeterRating>,
        variant: Option<MeterVariant>,
        yymm: u32,
    ) -> Result<Self> {
        let serial_start = match serial {
            Some(serial) => parse_serial(serial)?,
            None => parse_serial(
                &operator.request_text("Enter starting serial number (6 digits):")?,
            )?,
        };
        let rating = match rating {
            Some(rating) => rating,
            None => choose::<MeterRating, _>(operator, "Select meter rating:")?,
        };
        let variant = match variant {
            Some(variant) => variant,
            None => choose::<MeterVariant, _>(operator, "Select meter variant:")?,
        };
        Ok(Self {
            serial_start,
            yymm,
            model: MeterModel { rating, variant },
        })
    }
}

fn choose<E, O>(operator: &mut O, prompt: &str) -> Result<E>
where
    E: IntoEnumIterator + FromStr + ToString,
    O: Operator + ?Sized,
{
    let options: Vec<String> = E::iter().map(|e| e.to_string()).collect();
    let answer = operator.request_choice(prompt, &options)?;
    E::from_str(&answer).map_err(|_| Error::Operator(format!("unknown choice '{answer}'")))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProgramStatus {
    Pass,
    CommError,
    SkippedCalFail,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramEntry {
    pub name: String,
    pub meter: GlobalMeterId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial: Option<u32>,
    pub received: String,
    pub status: ProgramStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramLog {
    pub meters: Vec<ProgramEntry>,
}

/// Unlock `register`, then write `value` to it. True when both writes were answered, each within
/// the retry bound.
fn unlock_and_write<T: Transport>(
    client: &mut McwClient<T>,
    pair: &MeterPair,
    register: MeterRegister,
    value: u32,
    gap: Duration,
) -> Result<bool> {
    thread::sleep(gap);
    let unlocked = client.write_code_acknowledged(pair.local, register, PROGRAMMING_UNLOCK)?;
    thread::sleep(gap);
    let written = client.write_code_acknowledged(pair.local, register, value)?;
    Ok(unlocked && written)
}

fn program_meter<T: Transport>(
    client: &mut McwClient<T>,
    pair: &MeterPair,
    request: &ProgramRequest,
    serial: u32,
    gap: Duration,
) -> Result<ProgramEntry> {
    let mut entry = ProgramEntry {
        name: format!("meter {}", pair.global.0),
        meter: pair.global,
        serial: None,
        received: String::new(),
        status: ProgramStatus::CommError,
    };

    if unlock_and_write(client, pair, MeterRegister::SerialNumber, serial, gap)? {
        entry.serial = Some(serial);
        entry.status = ProgramStatus::Pass;
        entry.received.push_str(&format!("Serial {serial:06} written | "));
    } else {
        entry.received.push_str("Serial not acknowledged | ");
    }
    if unlock_and_write(client, pair, MeterRegister::ManufactureDate, request.yymm, gap)? {
        entry.received.push_str(&format!("YYMM {} written | ", request.yymm));
    } else {
        entry.received.push_str("YYMM not acknowledged | ");
    }
    let code = request.model.code();
    if unlock_and_write(client, pair, MeterRegister::ModelCode, code, gap)? {
        entry.received.push_str(&format!("Model {code} written"));
    } else {
        entry.received.push_str("Model not acknowledged");
    }
    Ok(entry)
}

/// Program every meter confirmed by the last cal-done run, numbering serials in global order.
///
/// A serial number is used up only by a meter that acknowledged it. Results go to
/// [`POSTCAL_LOG_FILE`].
pub fn run_programming<C: Connector>(
    config: &Config,
    connector: &mut C,
    store: &StateStore,
    request: &ProgramRequest,
) -> Result<ProgramLog> {
    let eligible = load_confirmed(store)?;
    if eligible.is_empty() {
        warn!("No meters passed cal done, nothing to program");
        return Ok(ProgramLog::default());
    }
    info!(
        "Programming {} meters: serials from {:06}, YYMM {}, model {} {} ({})",
        eligible.len(),
        request.serial_start,
        request.yymm,
        request.model.rating,
        request.model.variant,
        request.model.code()
    );

    let gap = ms(config.programming.write_gap_ms);
    let mut serial = request.serial_start;
    let mut log = ProgramLog::default();

    let failed = sweep(config, connector, |client, pairs| {
        for pair in pairs {
            if !eligible.contains(&pair.global) {
                log.meters.push(ProgramEntry {
                    name: format!("meter {}", pair.global.0),
                    meter: pair.global,
                    serial: None,
                    received: "Skipped due to CAL_FAIL".into(),
                    status: ProgramStatus::SkippedCalFail,
                });
                continue;
            }
            let entry = program_meter(client, pair, request, serial, gap)?;
            match entry.status {
                ProgramStatus::Pass => {
                    info!("[{}] {} programmed as {:06}", client.socket(), pair, serial);
                    serial += 1;
                }
                _ => warn!("[{}] {} did not take serial {:06}", client.socket(), pair, serial),
            }
            log.meters.push(entry);
        }
        Ok(())
    })?;
    for socket in &failed {
        warn!("[{}] Meters on this socket were not programmed", socket);
    }
    if !failed.is_empty() {
        let topology = config.topology()?;
        let unvisited: Vec<GlobalMeterId> = (1..=topology.meter_count())
            .map(GlobalMeterId)
            .filter(|g| topology.locate(*g).is_some())
            .filter(|g| !log.meters.iter().any(|e| e.meter == *g))
            .collect();
        for global in unvisited {
            let (received, status) = if eligible.contains(&global) {
                ("No connection to socket", ProgramStatus::CommError)
            } else {
                ("Skipped due to CAL_FAIL", ProgramStatus::SkippedCalFail)
            };
            log.meters.push(ProgramEntry {
                name: format!("meter {}", global.0),
                meter: global,
                serial: None,
                received: received.into(),
                status,
            });
        }
        log.meters.sort_by_key(|e| e.meter);
    }

    store.save(POSTCAL_LOG_FILE, &log)?;
    let passed = log
        .meters
        .iter()
        .filter(|e| e.status == ProgramStatus::Pass)
        .count();
    info!(
        "Programming done: {}/{} eligible meters passed",
        passed,
        eligible.len()
    );
    Ok(log)
}
