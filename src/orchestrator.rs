//! One resumable calibration invocation.
//!
//! Each invocation runs the group the bookmark points at on every socket that has not finished it
//! yet, then moves the bookmark on only if all sockets have. Progress and the problematic set are
//! persisted as soon as they change, so an interrupted run picks up where it stopped.

use std::thread;
use std::time::Duration;

use log::{debug, info, warn};

use crate::client::McwClient;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::operator::Operator;
use crate::poll::{display_ids, poll_with_elimination};
use crate::register::MeterRegister;
use crate::state::{ProblematicSet, StateStore};
use crate::steps::{CalibrationPlan, Step, StepAction};
use crate::topology::{ActivePairs, Socket, Topology};
use crate::transport::{Connector, Transport};

/// How far an invocation got.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every socket finished `group` and the bookmark now points at `next`.
    Advanced { group: usize, next: usize },
    /// The last group is finished on every socket.
    PlanComplete { group: usize },
    /// `pending` still have to finish `group`; the bookmark stays.
    Incomplete { group: usize, pending: Vec<Socket> },
}

pub struct Orchestrator<'a, C: Connector, O: Operator> {
    config: &'a Config,
    topology: Topology,
    plan: CalibrationPlan,
    store: StateStore,
    connector: C,
    operator: O,
}

impl<'a, C: Connector, O: Operator> Orchestrator<'a, C, O> {
    pub fn new(config: &'a Config, connector: C, operator: O) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            topology: config.topology()?,
            plan: config.plan(),
            store: config.state_store(),
            connector,
            operator,
        })
    }

    pub fn operator(&self) -> &O {
        &self.operator
    }

    /// Run the current group once.
    ///
    /// A transport failure only leaves its socket unfinished. Operator refusals, persistence
    /// failures and anything else abort the invocation.
    pub fn run(&mut self) -> Result<RunOutcome> {
        let mut progress = self.store.load_progress()?;
        let mut problematic = self.store.load_problematic()?;
        let group_count = self.plan.group_count();
        if progress.normalize(group_count) {
            self.store.save_progress(&progress)?;
        }
        let group = progress.group();
        let steps = self
            .plan
            .group(group)
            .ok_or_else(|| Error::Configuration(format!("plan has no group {group}")))?
            .to_vec();

        info!(
            "=== Calibration group {}/{} of '{}': {} steps ===",
            group,
            group_count,
            self.plan.name,
            steps.len()
        );
        if !problematic.is_empty() {
            info!("Problematic meters excluded: {}", display_ids(&problematic));
        }

        if let Some(step) = steps.iter().find(|s| s.input_change) {
            self.operator.confirm(&format!(
                "Group {}: set up the calibrator for '{}', then confirm",
                group, step.description
            ))?;
        }

        let sockets = self.topology.sockets().to_vec();
        let mut opened_any = false;
        for (index, socket) in sockets.iter().enumerate() {
            if progress.is_done(group, socket) {
                info!("[{}] Group {} already done, skipping", socket, group);
                continue;
            }
            if opened_any {
                self.socket_switch_pause(socket);
            }
            opened_any = true;

            match self.run_socket(group, index, socket, &steps, &mut problematic) {
                Ok(()) => {
                    progress.mark_done(group, socket);
                    self.store.save_progress(&progress)?;
                    info!("[{}] Group {} done", socket, group);
                }
                Err(e) if e.is_socket_fault() => {
                    warn!(
                        "[{}] Socket failed, group {} left unfinished: {}",
                        socket, group, e
                    );
                }
                Err(e) => return Err(e),
            }
        }

        if !progress.all_done(group, &sockets) {
            let pending: Vec<Socket> = sockets
                .into_iter()
                .filter(|s| !progress.is_done(group, s))
                .collect();
            warn!(
                "Group {} incomplete on {} socket(s), bookmark stays at {}",
                group,
                pending.len(),
                group
            );
            return Ok(RunOutcome::Incomplete { group, pending });
        }
        if group < group_count {
            progress.advance();
            self.store.save_progress(&progress)?;
            let next = progress.group();
            info!("BOOKMARK: group {} complete, next run starts group {}", group, next);
            Ok(RunOutcome::Advanced { group, next })
        } else {
            info!("BOOKMARK: all {} groups complete", group_count);
            Ok(RunOutcome::PlanComplete { group })
        }
    }

    fn socket_switch_pause(&self, socket: &Socket) {
        let pause = self.config.socket_switch();
        if !pause.is_zero() {
            info!("Switching to {}, waiting {:?}", socket, pause);
            thread::sleep(pause);
        }
    }

    /// Run `steps` on one socket. The connection is closed on every way out.
    fn run_socket(
        &mut self,
        group: usize,
        index: usize,
        socket: &Socket,
        steps: &[Step],
        problematic: &mut ProblematicSet,
    ) -> Result<()> {
        let transport = self.connector.open(socket)?;
        let mut client = McwClient::new(
            transport,
            socket.clone(),
            self.config.encoder(),
            self.config.client_timing(),
        );
        let mut active = self.topology.active_pairs(index, problematic);
        if active.is_empty() {
            info!("[{}] No active meters, nothing to do", socket);
            return Ok(());
        }
        info!(
            "[{}] Group {}: {} active meters ({})",
            socket,
            group,
            active.len(),
            active
                .globals()
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        );

        for (number, step) in steps.iter().enumerate() {
            info!("[{}] Step {}: {}", socket, number + 1, step.description);
            if step.input_change {
                self.operator.confirm(&format!(
                    "[{}] '{}': confirm the input is applied",
                    socket, step.description
                ))?;
            }
            match step.action() {
                StepAction::BusyPoll { code } => {
                    if let Some(code) = code {
                        write_to_all(&mut client, &active, code, step.wait())?;
                    }
                    let settle = self.config.busy_settle();
                    debug!("[{}] Settling {:?} before polling", socket, settle);
                    thread::sleep(settle);
                    let failed =
                        poll_with_elimination(&mut client, active.as_slice(), &self.config.poll_config())?;
                    if !failed.is_empty() {
                        active.exclude(&failed);
                        problematic.extend(failed.iter().copied());
                        self.store.save_problematic(problematic)?;
                        warn!(
                            "[{}] PROBLEMATIC: {} excluded from now on",
                            socket,
                            display_ids(&failed)
                        );
                    }
                }
                StepAction::Write { code } => {
                    write_to_all(&mut client, &active, code, step.wait())?;
                }
                StepAction::Placeholder => {
                    debug!("[{}] Nothing to send for '{}'", socket, step.description);
                }
            }
        }
        Ok(())
    }
}

/// Write `code` to the command register of every active meter, pausing `wait` after each.
fn write_to_all<T: Transport>(
    client: &mut McwClient<T>,
    active: &ActivePairs,
    code: u32,
    wait: Duration,
) -> Result<()> {
    for pair in active.iter() {
        if !client.write_code(pair.local, MeterRegister::Command, code)? {
            debug!("[{}] {} did not acknowledge {}", client.socket(), pair, code);
        }
        if !wait.is_zero() {
            thread::sleep(wait);
        }
    }
    Ok(())
}
