//! Two-phase wait for busy calibration steps.
//!
//! Every pending meter is polled once per round until it reports ready. After the first phase the
//! remaining meters are in "elimination mode"; once the second phase has also run out, whoever is
//! still pending is given up on and returned to the caller as problematic.

use std::collections::{BTreeMap, BTreeSet};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::client::McwClient;
use crate::error::Result;
use crate::topology::{GlobalMeterId, LocalMeterId, MeterPair};
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    /// Pause between rounds.
    pub round_delay: Duration,
    pub first_phase: Duration,
    /// Extra time granted once elimination mode starts.
    pub second_phase: Duration,
    /// Pause after a meter answered busy, before the next one is asked.
    pub busy_backoff: Duration,
}

impl PollConfig {
    pub fn total(&self) -> Duration {
        self.first_phase + self.second_phase
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            round_delay: Duration::from_millis(1200),
            first_phase: Duration::from_secs(30),
            second_phase: Duration::from_secs(40),
            busy_backoff: Duration::from_secs(1),
        }
    }
}

/// Poll `pairs` until each is ready or the budget is spent.
///
/// Returns the global ids of the meters that never became ready. A transport failure stops
/// polling and is returned as the error.
pub fn poll_with_elimination<T: Transport>(
    client: &mut McwClient<T>,
    pairs: &[MeterPair],
    config: &PollConfig,
) -> Result<BTreeSet<GlobalMeterId>> {
    let mut pending: BTreeMap<LocalMeterId, GlobalMeterId> =
        pairs.iter().map(|p| (p.local, p.global)).collect();
    let start = Instant::now();
    let mut eliminating = false;

    info!(
        "[{}] Polling {} meters, total timeout {:?}",
        client.socket(),
        pending.len(),
        config.total()
    );

    while !pending.is_empty() {
        let elapsed = start.elapsed();
        if elapsed > config.total() {
            let problematic: BTreeSet<GlobalMeterId> = pending.values().copied().collect();
            warn!(
                "[{}] Timeout after {:?}; not ready: {}",
                client.socket(),
                config.total(),
                display_ids(&problematic)
            );
            return Ok(problematic);
        }
        if elapsed > config.first_phase {
            let left = config.total().saturating_sub(elapsed);
            if !eliminating {
                eliminating = true;
                warn!(
                    "[{}] Elimination mode for {} meters, {:.1}s left",
                    client.socket(),
                    pending.len(),
                    left.as_secs_f32()
                );
            } else {
                debug!("[{}] Elimination mode, {:.1}s left", client.socket(), left.as_secs_f32());
            }
        }

        let locals: Vec<LocalMeterId> = pending.keys().copied().collect();
        for local in locals {
            let global = pending[&local];
            if client.poll_ready(local)? {
                info!("[{}] {} {} ready", client.socket(), global, local);
                pending.remove(&local);
            } else {
                debug!("[{}] {} {} still busy", client.socket(), global, local);
                thread::sleep(config.busy_backoff);
            }
        }

        if !pending.is_empty() {
            thread::sleep(config.round_delay);
        }
    }

    info!("[{}] All polled meters ready", client.socket());
    Ok(BTreeSet::new())
}

pub(crate) fn display_ids(ids: &BTreeSet<GlobalMeterId>) -> String {
    ids.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
