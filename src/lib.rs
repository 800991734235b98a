//! This crate drives the calibration of electricity meter banks that sit behind MCW/TCP gateways.
//!
//! Each gateway socket serves up to ten meters on an RS485 bus. Meters are addressed in the
//! `MCW<n>,` text protocol, which wraps Modbus RTU frames (function codes 0x03, 0x04 and 0x10) in
//! an escaped ASCII form.
//!
//! A calibration plan is cut into groups, and every invocation runs one group on every socket.
//! Progress is kept in a state directory, so the bench can be stopped and resumed between groups
//! or after a failed socket:
//! * `progress.json`: the group bookmark and per-socket done flags
//! * `problematic_meters.json`: meters that never finished a busy step and are left alone
//!
//! Apart from calibration, the crate also covers gateway initialization, parameter read-back,
//! the cal-done confirmation and serial/date/model programming.
//!
//! The gateway TCP link should be set up like so:
//! * Meter bus: 9600 baud, 8 data bits, no parity, 1 stop bit (sent by `init`)
//! * Modbus slave id of every meter: 1

pub mod caldone;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod init;
pub mod operator;
pub mod orchestrator;
pub mod params;
pub mod poll;
pub mod postcal;
pub mod register;
pub mod simulator;
pub mod state;
pub mod steps;
pub mod sweep;
pub mod topology;
pub mod transport;

#[cfg(test)]
mod mock_link;
