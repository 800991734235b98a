//! One pass over every configured socket, used by the procedures that run outside the
//! calibration plan.

use std::collections::BTreeSet;
use std::thread;

use log::{info, warn};

use crate::client::McwClient;
use crate::config::Config;
use crate::error::Result;
use crate::topology::{MeterPair, Socket};
use crate::transport::Connector;

/// Open each socket in turn and hand a client for it to `visit`, together with all meters the
/// socket serves.
///
/// The connection is closed when `visit` returns. Transport failures are logged and the socket is
/// reported back as failed; every other error stops the sweep.
pub fn sweep<C, F>(config: &Config, connector: &mut C, mut visit: F) -> Result<Vec<Socket>>
where
    C: Connector,
    F: FnMut(&mut McwClient<C::Transport>, &[MeterPair]) -> Result<()>,
{
    let topology = config.topology()?;
    let mut failed = Vec::new();

    for (index, socket) in topology.sockets().iter().enumerate() {
        if index > 0 && !config.socket_switch().is_zero() {
            info!(
                "Switching to {}, waiting {:?}",
                socket,
                config.socket_switch()
            );
            thread::sleep(config.socket_switch());
        }
        let outcome = connector.open(socket).and_then(|transport| {
            let mut client =
                McwClient::new(transport, socket.clone(), config.encoder(), config.client_timing());
            let pairs = topology.active_pairs(index, &BTreeSet::new());
            visit(&mut client, pairs.as_slice())
        });
        match outcome {
            Ok(()) => {}
            Err(e) if e.is_socket_fault() => {
                warn!("[{}] Socket failed: {}", socket, e);
                failed.push(socket.clone());
            }
            Err(e) => return Err(e),
        }
    }
    Ok(failed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::simulator::{BankSettings, SimulatedConnector};

    fn config() -> Config {
        Config {
            meter_count: 15,
            calibration: crate::config::CalibrationConfig {
                socket_switch_ms: 0,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn visits_every_socket_with_its_meters() {
        let config = config();
        let mut connector = SimulatedConnector::new(BankSettings::default());
        let mut seen = Vec::new();
        let failed = sweep(&config, &mut connector, |client, pairs| {
            seen.push((client.socket().clone(), pairs.len()));
            Ok(())
        })
        .unwrap();
        assert!(failed.is_empty());
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].1, 10);
        assert_eq!(seen[1].1, 5);
        let journal = connector.journal();
        for socket in &config.sockets {
            assert_eq!(journal.opened(socket), 1);
            assert_eq!(journal.closed(socket), 1);
        }
    }

    #[test]
    fn refused_socket_is_reported_and_skipped() {
        let config = config();
        let mut connector =
            SimulatedConnector::new(BankSettings::default()).refuse(&config.sockets[0]);
        let mut visited = 0;
        let failed = sweep(&config, &mut connector, |_, _| {
            visited += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(failed, vec![config.sockets[0].clone()]);
        assert_eq!(visited, 1);
    }

    #[test]
    fn other_errors_stop_the_sweep() {
        let config = config();
        let mut connector = SimulatedConnector::new(BankSettings::default());
        let result = sweep(&config, &mut connector, |_, _| {
            Err(Error::Operator("stop".into()))
        });
        assert!(matches!(result, Err(Error::Operator(_))));
        assert_eq!(connector.journal().opened(&config.sockets[1]), 0);
    }
}
