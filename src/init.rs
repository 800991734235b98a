//! Gateway bring-up: put every socket's serial side into the mode the meters expect.

use std::thread;

use log::{info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::sweep::sweep;
use crate::topology::Socket;
use crate::transport::Connector;

/// Send the configured init commands to every socket, `init_gap` apart.
///
/// Returns the sockets that could not be initialized.
pub fn initialize<C: Connector>(config: &Config, connector: &mut C) -> Result<Vec<Socket>> {
    let failed = sweep(config, connector, |client, _| {
        info!("[{}] Connected", client.socket());
        for command in &config.init_commands {
            let reply = client.send_raw(command)?;
            let reply = String::from_utf8_lossy(&reply);
            let reply = reply.trim();
            if reply.is_empty() {
                info!("[{}] Sent {}", client.socket(), command);
            } else {
                info!("[{}] Sent {}: {}", client.socket(), command, reply);
            }
            thread::sleep(config.init_gap());
        }
        info!("[{}] All init commands sent", client.socket());
        Ok(())
    })?;
    for socket in &failed {
        warn!("[{}] Not initialized", socket);
    }
    Ok(failed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CalibrationConfig;
    use crate::simulator::{BankSettings, SimulatedConnector};

    fn config() -> Config {
        let mut config = Config {
            meter_count: 20,
            init_gap_ms: 0,
            calibration: CalibrationConfig {
                socket_switch_ms: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        config.link.reply_timeout_ms = 0;
        config
    }

    #[test]
    fn sends_commands_in_order_to_every_socket() {
        let config = config();
        let mut connector = SimulatedConnector::new(BankSettings::default());
        let failed = initialize(&config, &mut connector).unwrap();
        assert!(failed.is_empty());
        for socket in &config.sockets {
            assert_eq!(connector.journal().sent_to(socket), config.init_commands);
        }
    }

    #[test]
    fn failing_socket_does_not_stop_the_rest() {
        let config = config();
        let mut connector =
            SimulatedConnector::new(BankSettings::default()).fail_after(&config.sockets[0], 2);
        let failed = initialize(&config, &mut connector).unwrap();
        assert_eq!(failed, vec![config.sockets[0].clone()]);
        let journal = connector.journal();
        assert_eq!(journal.sent_to(&config.sockets[0]).len(), 2);
        assert_eq!(journal.closed(&config.sockets[0]), 1);
        assert_eq!(journal.sent_to(&config.sockets[1]), config.init_commands);
    }
}
