// Copyright (c) Checker Contributors
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::CheckerResult;
use crate::serialize::{tags, Buffer, Reader};

use super::TimeStamp;

struct XdbEntry {
    value: Vec<u8>,
    stamp: TimeStamp,
}

/// One append-once database: an ordered map from opaque byte keys to opaque
/// byte values. Replacing a value is a logical append (the store never
/// forgets a key); per-key stamps support conditional replaces once
/// timestamps are enabled.
pub struct Xdb {
    name: String,
    path: PathBuf,
    entries: BTreeMap<Vec<u8>, XdbEntry>,
    timestamps_enabled: bool,
    dirty: bool,
}

impl Xdb {
    /// Open the database `name` under `dir`, loading any persisted file.
    pub fn open(dir: &Path, name: &str) -> CheckerResult<Xdb> {
        let path = dir.join(name);
        let mut xdb = Xdb {
            name: name.to_string(),
            path,
            entries: BTreeMap::new(),
            timestamps_enabled: false,
            dirty: false,
        };
        if xdb.path.exists() {
            let bytes = fs::read(&xdb.path)?;
            let mut reader = Reader::new(&bytes);
            while !reader.at_end() {
                let key = reader.get_bytes(tags::NAME)?;
                let value = reader.get_bytes(tags::STRING)?;
                let stamp = reader.get_uint(tags::INDEX)?;
                xdb.entries.insert(key, XdbEntry { value, stamp });
            }
        }
        Ok(xdb)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lookup(&self, key: &[u8]) -> Option<&[u8]> {
        self.entries.get(key).map(|entry| entry.value.as_slice())
    }

    pub fn replace(&mut self, key: &[u8], value: Vec<u8>, stamp: TimeStamp) {
        self.dirty = true;
        self.entries.insert(key.to_vec(), XdbEntry { value, stamp });
    }

    /// Stamp of the last write to `key`; zero when the key is absent or
    /// timestamps are disabled.
    pub fn key_stamp(&self, key: &[u8]) -> TimeStamp {
        if !self.timestamps_enabled {
            return 0;
        }
        self.entries.get(key).map_or(0, |entry| entry.stamp)
    }

    pub fn enable_timestamps(&mut self) {
        self.timestamps_enabled = true;
    }

    pub fn all_keys(&self) -> impl Iterator<Item = &[u8]> {
        self.entries.keys().map(|key| key.as_slice())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.dirty = true;
        self.entries.clear();
    }

    /// Persist the database to its file when anything changed.
    pub fn save(&mut self) -> CheckerResult<()> {
        if !self.dirty {
            return Ok(());
        }
        let mut buf = Buffer::new();
        for (key, entry) in &self.entries {
            buf.put_bytes(tags::NAME, key);
            buf.put_bytes(tags::STRING, &entry.value);
            buf.put_uint(tags::INDEX, entry.stamp);
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, buf.as_bytes())?;
        self.dirty = false;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_replace_and_lookup() {
        let dir = TempDir::new().unwrap();
        let mut xdb = Xdb::open(dir.path(), "test.xdb").unwrap();
        assert!(xdb.lookup(b"key").is_none());

        xdb.replace(b"key", b"one".to_vec(), 1);
        assert_eq!(xdb.lookup(b"key").unwrap(), b"one");

        xdb.replace(b"key", b"two".to_vec(), 2);
        assert_eq!(xdb.lookup(b"key").unwrap(), b"two");
        assert_eq!(xdb.len(), 1);
    }

    #[test]
    fn test_stamps_behind_enable() {
        let dir = TempDir::new().unwrap();
        let mut xdb = Xdb::open(dir.path(), "test.xdb").unwrap();
        xdb.replace(b"key", b"value".to_vec(), 7);
        assert_eq!(xdb.key_stamp(b"key"), 0);
        xdb.enable_timestamps();
        assert_eq!(xdb.key_stamp(b"key"), 7);
        assert_eq!(xdb.key_stamp(b"missing"), 0);
    }

    #[test]
    fn test_save_and_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let mut xdb = Xdb::open(dir.path(), "test.xdb").unwrap();
            xdb.replace(b"a", b"1".to_vec(), 1);
            xdb.replace(b"b", b"2".to_vec(), 2);
            xdb.save().unwrap();
        }
        let xdb = Xdb::open(dir.path(), "test.xdb").unwrap();
        assert_eq!(xdb.lookup(b"a").unwrap(), b"1");
        assert_eq!(xdb.lookup(b"b").unwrap(), b"2");
        let keys: Vec<_> = xdb.all_keys().collect();
        assert_eq!(keys, vec![b"a".as_slice(), b"b".as_slice()]);
    }
}
