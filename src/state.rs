//! Durable progress of calibration runs.
//!
//! Two JSON documents live in the state directory: `progress.json` holds the group bookmark and one
//! done flag per (group, socket), `problematic_meters.json` the sorted list of meters excluded for
//! good. Both are rewritten in full through a temporary file and a rename on every change.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use log::{info, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::topology::{GlobalMeterId, Socket};

pub const PROGRESS_FILE: &str = "progress.json";
pub const PROBLEMATIC_FILE: &str = "problematic_meters.json";

/// Meters given up on. Only ever grows.
pub type ProblematicSet = BTreeSet<GlobalMeterId>;

/// Group bookmark plus done flags, as stored in `progress.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressState {
    #[serde(default = "first_group")]
    pub current_cal_group: i64,
    /// `group_<g>_socket_<host>_<port>_done` flags. Unknown keys are kept as they are.
    #[serde(flatten)]
    flags: BTreeMap<String, serde_json::Value>,
}

fn first_group() -> i64 {
    1
}

impl Default for ProgressState {
    fn default() -> Self {
        Self {
            current_cal_group: first_group(),
            flags: BTreeMap::new(),
        }
    }
}

impl ProgressState {
    /// Force the bookmark into `1..=group_count`. Returns true if it had to be reset.
    pub fn normalize(&mut self, group_count: usize) -> bool {
        if (1..=group_count as i64).contains(&self.current_cal_group) {
            return false;
        }
        warn!(
            "Invalid current_cal_group {} (plan has {} groups), resetting to 1",
            self.current_cal_group, group_count
        );
        self.current_cal_group = 1;
        true
    }

    /// The bookmark. Only meaningful after [`Self::normalize`].
    pub fn group(&self) -> usize {
        self.current_cal_group.max(1) as usize
    }

    pub fn is_done(&self, group: usize, socket: &Socket) -> bool {
        self.flags.get(&socket.done_key(group)) == Some(&serde_json::Value::Bool(true))
    }

    pub fn mark_done(&mut self, group: usize, socket: &Socket) {
        self.flags
            .insert(socket.done_key(group), serde_json::Value::Bool(true));
    }

    pub fn all_done(&self, group: usize, sockets: &[Socket]) -> bool {
        sockets.iter().all(|s| self.is_done(group, s))
    }

    pub fn advance(&mut self) {
        self.current_cal_group += 1;
    }
}

/// Reads and writes the state documents of one state directory.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    pub fn load_progress(&self) -> Result<ProgressState> {
        Ok(self.load(PROGRESS_FILE)?.unwrap_or_default())
    }

    pub fn save_progress(&self, progress: &ProgressState) -> Result<()> {
        self.save(PROGRESS_FILE, progress)
    }

    pub fn load_problematic(&self) -> Result<ProblematicSet> {
        Ok(self.load(PROBLEMATIC_FILE)?.unwrap_or_default())
    }

    pub fn save_problematic(&self, problematic: &ProblematicSet) -> Result<()> {
        self.save(PROBLEMATIC_FILE, problematic)
    }

    /// Load a JSON document. Missing or unparsable documents are `None`.
    pub fn load<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        let path = self.path(name);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!("{} not found, starting fresh", path.display());
                return Ok(None);
            }
            Err(source) => return Err(Error::Persistence { path, source }),
        };
        match serde_json::from_slice(&data) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!("{} is corrupt ({}), starting fresh", path.display(), e);
                Ok(None)
            }
        }
    }

    /// Replace a JSON document in one step: write a temporary file, then rename it over the old one.
    pub fn save<T: Serialize + ?Sized>(&self, name: &str, value: &T) -> Result<()> {
        let path = self.path(name);
        let data = serde_json::to_vec_pretty(value).map_err(|source| Error::StateFormat {
            path: path.clone(),
            source,
        })?;
        let temp_path = self.dir.join(format!("{name}.tmp"));
        let persist = || -> io::Result<()> {
            fs::create_dir_all(&self.dir)?;
            let mut file = fs::File::create(&temp_path)?;
            file.write_all(&data)?;
            file.sync_all()?;
            fs::rename(&temp_path, &path)
        };
        persist().map_err(|source| Error::Persistence {
            path: path.clone(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn socket() -> Socket {
        Socket::new("192.168.100.100", 12345)
    }

    #[test]
    fn missing_files_are_fresh() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let progress = store.load_progress().unwrap();
        assert_eq!(progress.current_cal_group, 1);
        assert!(!progress.is_done(1, &socket()));
        assert!(store.load_problematic().unwrap().is_empty());
    }

    #[test]
    fn progress_document_layout() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("nested"));
        let mut progress = ProgressState::default();
        progress.mark_done(1, &socket());
        progress.advance();
        store.save_progress(&progress).unwrap();

        let raw: serde_json::Value =
            serde_json::from_slice(&fs::read(store.path(PROGRESS_FILE)).unwrap()).unwrap();
        assert_eq!(raw["current_cal_group"], 2);
        assert_eq!(raw["group_1_socket_192_168_100_100_12345_done"], true);
        assert!(!store.path("progress.json.tmp").exists());

        let loaded = store.load_progress().unwrap();
        assert_eq!(loaded, progress);
    }

    #[test]
    fn problematic_is_sorted_list() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let set = ProblematicSet::from([GlobalMeterId(12), GlobalMeterId(3), GlobalMeterId(7)]);
        store.save_problematic(&set).unwrap();
        let raw = fs::read_to_string(store.path(PROBLEMATIC_FILE)).unwrap();
        let list: Vec<u16> = serde_json::from_str(&raw).unwrap();
        assert_eq!(list, vec![3, 7, 12]);
        assert_eq!(store.load_problematic().unwrap(), set);
    }

    #[test]
    fn corrupt_files_are_fresh() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path());
        fs::write(store.path(PROGRESS_FILE), b"{not json").unwrap();
        fs::write(store.path(PROBLEMATIC_FILE), b"[1, \"two\"]").unwrap();
        assert_eq!(store.load_progress().unwrap(), ProgressState::default());
        assert!(store.load_problematic().unwrap().is_empty());
    }

    #[test]
    fn out_of_range_bookmark_is_reset() {
        let mut progress = ProgressState {
            current_cal_group: 9,
            ..Default::default()
        };
        assert!(progress.normalize(4));
        assert_eq!(progress.group(), 1);
        progress.current_cal_group = -2;
        assert!(progress.normalize(4));
        progress.current_cal_group = 4;
        assert!(!progress.normalize(4));
    }

    #[test]
    fn unknown_keys_survive() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path());
        fs::write(
            store.path(PROGRESS_FILE),
            br#"{"current_cal_group": 3, "operator": "night shift"}"#,
        )
        .unwrap();
        let progress = store.load_progress().unwrap();
        assert_eq!(progress.group(), 3);
        store.save_progress(&progress).unwrap();
        let raw = fs::read_to_string(store.path(PROGRESS_FILE)).unwrap();
        assert!(raw.contains("night shift"));
    }

    #[test]
    fn all_done_needs_every_socket() {
        let other = Socket::new("192.168.100.101", 12345);
        let mut progress = ProgressState::default();
        progress.mark_done(2, &socket());
        assert!(!progress.all_done(2, &[socket(), other.clone()]));
        progress.mark_done(2, &other);
        assert!(progress.all_done(2, &[socket(), other]));
        assert!(!progress.all_done(1, &[socket()]));
    }
}
