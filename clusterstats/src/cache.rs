// SPDX-FileCopyrightText: © 2024 Christopher Woods <Christopher.Woods@bristol.ac.uk>
// SPDX-License-Identifier: MIT

use anyhow::Context;
use once_cell::unsync::OnceCell;
use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::Error;

///
/// The source of the code that computes cached results. Any change
/// to these files changes the fingerprint, so every result computed
/// by older code is no longer found.
///
const ALGORITHM_SOURCES: [&str; 3] = [
    include_str!("record.rs"),
    include_str!("distribution.rs"),
    include_str!("bucket.rs"),
];

fn sha256_hex(data: &[u8]) -> String {
    let mut h = Sha256::new();
    h.update(data);
    format!("{:x}", h.finalize())
}

///
/// A directory of computed bucket results, one JSON file per key.
/// Entries never expire; they are only left behind when the
/// fingerprint changes.
///
#[derive(Debug)]
pub struct ResultCache {
    dir: PathBuf,
    sources: Vec<String>,
    fingerprint: OnceCell<String>,
}

impl ResultCache {
    pub fn new(dir: &Path) -> Self {
        Self::with_sources(dir, ALGORITHM_SOURCES.iter().map(|s| s.to_string()).collect())
    }

    /// A cache whose fingerprint is derived from the passed sources
    pub fn with_sources(dir: &Path, sources: Vec<String>) -> Self {
        Self {
            dir: dir.to_path_buf(),
            sources,
            fingerprint: OnceCell::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Hash of the aggregation code, computed once
    pub fn fingerprint(&self) -> &str {
        self.fingerprint.get_or_init(|| {
            let mut h = Sha256::new();
            for source in &self.sources {
                h.update(source.as_bytes());
            }
            format!("{:x}", h.finalize())
        })
    }

    pub fn key(
        &self,
        year: i32,
        month: u32,
        day: u32,
        hour: &str,
        minute: &str,
        name: &str,
    ) -> String {
        let coordinates = format!("{}-{}-{}-{}-{}{}", year, month, day, hour, minute, name);
        format!("{}-{}", self.fingerprint(), sha256_hex(coordinates.as_bytes()))
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }

    ///
    /// Write the value for `key`. The value is written to a temporary
    /// file in the cache directory and then renamed over the entry,
    /// so a reader sees either the old or the new entry in full.
    ///
    pub fn store<T: Serialize>(&self, key: &str, value: &T) -> Result<(), Error> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("Could not create cache directory {:?}", self.dir))?;

        let json = serde_json::to_vec(value)?;

        let mut file = tempfile::NamedTempFile::new_in(&self.dir)
            .with_context(|| format!("Could not create temporary file in {:?}", self.dir))?;

        file.write_all(&json)
            .with_context(|| format!("Could not write cache entry {}", key))?;

        file.as_file().sync_all()?;

        let path = self.path(key);

        file.persist(&path)
            .map_err(|e| e.error)
            .with_context(|| format!("Could not persist cache entry {:?}", path))?;

        tracing::debug!("Stored cache entry {:?}", path);

        Ok(())
    }

    ///
    /// Read the value for `key`, returning None if there is no entry.
    /// An entry that exists but cannot be read or decoded is an error.
    ///
    pub fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, Error> {
        let path = self.path(key);

        if !path.try_exists()? {
            tracing::debug!("Cache miss for {:?}", path);
            return Ok(None);
        }

        let json = std::fs::read_to_string(&path)
            .with_context(|| format!("Could not read cache entry {:?}", path))?;

        let value = serde_json::from_str(&json)
            .with_context(|| format!("Could not decode cache entry {:?}", path))?;

        tracing::debug!("Cache hit for {:?}", path);

        Ok(Some(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_round_trip() {
        #[allow(clippy::unwrap_used)]
        let dir = tempfile::tempdir().unwrap();
        let cache = ResultCache::new(dir.path());

        let mut value: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        value.insert("cores".to_string(), vec![1.0, 2.5, 64.0]);
        value.insert("empty".to_string(), vec![]);

        let key = cache.key(2024, 3, 1, "00-00", "00:00-09:59", "stats");

        #[allow(clippy::unwrap_used)]
        cache.store(&key, &value).unwrap();

        #[allow(clippy::unwrap_used)]
        let loaded: Option<BTreeMap<String, Vec<f64>>> = cache.load(&key).unwrap();
        assert_eq!(loaded, Some(value));
    }

    #[test]
    fn test_miss() {
        #[allow(clippy::unwrap_used)]
        let dir = tempfile::tempdir().unwrap();
        let cache = ResultCache::new(&dir.path().join("not_yet_created"));

        let key = cache.key(2024, 3, 1, "00-00", "00:00-09:59", "stats");

        #[allow(clippy::unwrap_used)]
        let loaded: Option<String> = cache.load(&key).unwrap();
        assert_eq!(loaded, None);
    }

    #[test]
    fn test_overwrite() {
        #[allow(clippy::unwrap_used)]
        let dir = tempfile::tempdir().unwrap();
        let cache = ResultCache::new(dir.path());
        let key = cache.key(2024, 3, 1, "00-00", "00:00-09:59", "snapshot");

        #[allow(clippy::unwrap_used)]
        cache.store(&key, &1_u64).unwrap();
        #[allow(clippy::unwrap_used)]
        cache.store(&key, &2_u64).unwrap();

        #[allow(clippy::unwrap_used)]
        let loaded: Option<u64> = cache.load(&key).unwrap();
        assert_eq!(loaded, Some(2));

        // only the entry itself, no leftover temporary files
        #[allow(clippy::unwrap_used)]
        let entries = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn test_corrupt_entry() {
        #[allow(clippy::unwrap_used)]
        let dir = tempfile::tempdir().unwrap();
        let cache = ResultCache::new(dir.path());
        let key = cache.key(2024, 3, 1, "00-00", "00:00-09:59", "stats");

        #[allow(clippy::unwrap_used)]
        std::fs::write(dir.path().join(format!("{}.json", key)), "{not json").unwrap();

        let loaded: Result<Option<u64>, Error> = cache.load(&key);
        assert!(loaded.is_err());
    }

    #[test]
    fn test_keys() {
        #[allow(clippy::unwrap_used)]
        let dir = tempfile::tempdir().unwrap();
        let cache = ResultCache::new(dir.path());

        let a = cache.key(2024, 3, 1, "00-00", "00:00-09:59", "stats");
        let b = cache.key(2024, 3, 1, "00-00", "00:00-09:59", "stats");
        let c = cache.key(2024, 3, 1, "00-00", "00:00-09:59", "snapshot");
        let d = cache.key(2024, 3, 2, "00-00", "00:00-09:59", "stats");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert!(a.starts_with(cache.fingerprint()));
    }

    #[test]
    fn test_fingerprint() {
        #[allow(clippy::unwrap_used)]
        let dir = tempfile::tempdir().unwrap();

        let a = ResultCache::with_sources(dir.path(), vec!["fn stats() {}".to_string()]);
        let b = ResultCache::with_sources(dir.path(), vec!["fn stats() {}".to_string()]);
        let c = ResultCache::with_sources(dir.path(), vec!["fn stats() { }".to_string()]);

        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
        assert_eq!(ResultCache::new(dir.path()).fingerprint().len(), 64);

        // results stored by older code are misses, not errors
        let key = a.key(2024, 3, 1, "00-00", "00:00-09:59", "stats");
        #[allow(clippy::unwrap_used)]
        a.store(&key, &"old").unwrap();

        let key = c.key(2024, 3, 1, "00-00", "00:00-09:59", "stats");
        #[allow(clippy::unwrap_used)]
        let loaded: Option<String> = c.load(&key).unwrap();
        assert_eq!(loaded, None);
    }
}
