//! Meter identities and the socket topology that maps them onto the wire.
//!
//! Every meter has a stable [`GlobalMeterId`] used for bookkeeping. Each gateway socket
//! serves a contiguous block of `meters_per_socket` meters, and the gateway only knows
//! them by their position inside that block, the [`LocalMeterId`].

use std::collections::BTreeSet;
use std::fmt;
use std::ops::RangeInclusive;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Stable identity of a meter across sockets and runs. Never sent over the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GlobalMeterId(pub u16);

impl fmt::Display for GlobalMeterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "G{}", self.0)
    }
}

/// Identity of a meter on its own socket. This is the number in `MCW<n>,`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalMeterId(u16);

impl LocalMeterId {
    /// `MCW0` addresses every meter on the socket.
    pub const BROADCAST: LocalMeterId = LocalMeterId(0);

    pub const fn new(id: u16) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u16 {
        self.0
    }

    pub const fn is_broadcast(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for LocalMeterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// A meter as seen from one socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MeterPair {
    pub global: GlobalMeterId,
    pub local: LocalMeterId,
}

impl fmt::Display for MeterPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.global, self.local)
    }
}

/// One gateway endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Socket {
    pub host: String,
    pub port: u16,
}

impl Socket {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Key of this socket's completion flag for `group` in the progress document.
    pub fn done_key(&self, group: usize) -> String {
        format!(
            "group_{}_socket_{}_{}_done",
            group,
            self.host.replace('.', "_"),
            self.port
        )
    }
}

impl fmt::Display for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// The meters reachable through one socket, minus those excluded so far.
///
/// Only ever shrinks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivePairs(Vec<MeterPair>);

impl ActivePairs {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MeterPair> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[MeterPair] {
        &self.0
    }

    pub fn globals(&self) -> Vec<GlobalMeterId> {
        self.0.iter().map(|p| p.global).collect()
    }

    /// Drop every pair whose global id is in `excluded`.
    pub fn exclude(&mut self, excluded: &BTreeSet<GlobalMeterId>) {
        self.0.retain(|p| !excluded.contains(&p.global));
    }
}

/// Ordered sockets and the contiguous global ranges they own.
#[derive(Debug, Clone)]
pub struct Topology {
    sockets: Vec<Socket>,
    meter_count: u16,
    meters_per_socket: u16,
}

impl Topology {
    pub fn new(sockets: Vec<Socket>, meter_count: u16, meters_per_socket: u16) -> Result<Self> {
        if sockets.is_empty() {
            return Err(Error::Configuration("no sockets configured".into()));
        }
        if meter_count == 0 {
            return Err(Error::Configuration("meter count is zero".into()));
        }
        if meters_per_socket == 0 {
            return Err(Error::Configuration("meters per socket is zero".into()));
        }
        let reachable = sockets.len() as u32 * meters_per_socket as u32;
        if (meter_count as u32) > reachable {
            warn!(
                "Meter count {} exceeds the {} meters reachable through {} sockets; meters above {} are ignored",
                meter_count,
                reachable,
                sockets.len(),
                reachable
            );
        }
        Ok(Self {
            sockets,
            meter_count,
            meters_per_socket,
        })
    }

    pub fn sockets(&self) -> &[Socket] {
        &self.sockets
    }

    pub fn meter_count(&self) -> u16 {
        self.meter_count
    }

    pub fn meters_per_socket(&self) -> u16 {
        self.meters_per_socket
    }

    /// Global ids owned by the socket at `index`. Empty when the meter count stops short of it.
    pub fn global_range(&self, index: usize) -> RangeInclusive<u16> {
        let width = self.meters_per_socket as u32;
        let start = index as u32 * width + 1;
        let end = (start + width - 1).min(self.meter_count as u32);
        if start > end {
            return 1..=0;
        }
        start as u16..=end as u16
    }

    /// Map `global` to its local id on the socket at `index`, if that socket owns it.
    pub fn rebase(&self, index: usize, global: GlobalMeterId) -> Option<LocalMeterId> {
        let range = self.global_range(index);
        if range.contains(&global.0) {
            Some(LocalMeterId(global.0 - range.start() + 1))
        } else {
            None
        }
    }

    /// Find the socket that owns `global`, together with the local id it has there.
    pub fn locate(&self, global: GlobalMeterId) -> Option<(usize, LocalMeterId)> {
        (0..self.sockets.len()).find_map(|index| self.rebase(index, global).map(|l| (index, l)))
    }

    /// Every meter of the socket at `index` that is not in `problematic`.
    pub fn active_pairs(
        &self,
        index: usize,
        problematic: &BTreeSet<GlobalMeterId>,
    ) -> ActivePairs {
        let range = self.global_range(index);
        let first = *range.start();
        ActivePairs(
            range
                .map(GlobalMeterId)
                .filter(|g| !problematic.contains(g))
                .map(|global| MeterPair {
                    global,
                    local: LocalMeterId(global.0 - first + 1),
                })
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_sockets(meter_count: u16) -> Topology {
        Topology::new(
            vec![
                Socket::new("192.168.100.100", 12345),
                Socket::new("192.168.100.101", 12345),
            ],
            meter_count,
            10,
        )
        .unwrap()
    }

    #[test]
    fn second_socket_rebases_to_one_through_ten() {
        let topology = two_sockets(20);
        assert_eq!(topology.global_range(1), 11..=20);
        assert_eq!(
            topology.rebase(1, GlobalMeterId(15)),
            Some(LocalMeterId::new(5))
        );
        assert_eq!(topology.rebase(0, GlobalMeterId(15)), None);

        let pairs = topology.active_pairs(1, &BTreeSet::new());
        assert_eq!(pairs.len(), 10);
        for pair in pairs.iter() {
            assert!((1..=10).contains(&pair.local.get()));
        }
    }

    #[test]
    fn short_meter_count_truncates_the_last_socket() {
        let topology = two_sockets(13);
        assert_eq!(topology.global_range(1), 11..=13);
        assert_eq!(topology.active_pairs(1, &BTreeSet::new()).len(), 3);

        let topology = two_sockets(7);
        assert!(topology.global_range(1).is_empty());
        assert!(topology.active_pairs(1, &BTreeSet::new()).is_empty());
    }

    #[test]
    fn problematic_meters_are_not_active() {
        let topology = two_sockets(20);
        let problematic = BTreeSet::from([GlobalMeterId(7), GlobalMeterId(12)]);
        let first = topology.active_pairs(0, &problematic);
        assert!(!first.globals().contains(&GlobalMeterId(7)));
        assert_eq!(first.len(), 9);
        let second = topology.active_pairs(1, &problematic);
        assert!(second.iter().all(|p| p.local != LocalMeterId::new(2)));
    }

    #[test]
    fn exclude_shrinks_pairs() {
        let topology = two_sockets(20);
        let mut pairs = topology.active_pairs(0, &BTreeSet::new());
        pairs.exclude(&BTreeSet::from([GlobalMeterId(3), GlobalMeterId(4)]));
        assert_eq!(pairs.len(), 8);
        assert!(!pairs.globals().contains(&GlobalMeterId(3)));
    }

    #[test]
    fn locate_finds_owner() {
        let topology = two_sockets(20);
        assert_eq!(
            topology.locate(GlobalMeterId(11)),
            Some((1, LocalMeterId::new(1)))
        );
        assert_eq!(topology.locate(GlobalMeterId(21)), None);
    }

    #[test]
    fn done_key_matches_progress_document() {
        let socket = Socket::new("192.168.100.101", 12345);
        assert_eq!(socket.done_key(3), "group_3_socket_192_168_100_101_12345_done");
    }

    #[test]
    fn rejects_empty_configuration() {
        assert!(matches!(
            Topology::new(vec![], 10, 10),
            Err(Error::Configuration(_))
        ));
        assert!(matches!(
            Topology::new(vec![Socket::new("h", 1)], 0, 10),
            Err(Error::Configuration(_))
        ));
    }
}
