use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::{Read, Write};
use thiserror::Error;

/// One manifest item. Identity is `hash`, not `path`: two entries with the
/// same content hash are the same object no matter where they are mounted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub hash: String,
    pub size: u64,
    /// Unix millis of the last modification on the control plane.
    pub mtime: i64,
}

/// An immutable snapshot of the file set the control plane expects this
/// node to serve. Every fetch produces a new snapshot.
#[derive(Debug, Clone)]
pub struct FileManifest {
    pub entries: Vec<FileEntry>,
    /// Unix millis at which this snapshot was taken by the node.
    pub retrieved_at: i64,
}

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("failed to inflate manifest payload: {0}")]
    Inflate(#[from] std::io::Error),

    #[error("failed to decode manifest payload: {0}")]
    Decode(#[from] bincode::Error),
}

impl FileManifest {
    pub fn from_entries(entries: Vec<FileEntry>, retrieved_at: i64) -> Self {
        Self {
            entries,
            retrieved_at,
        }
    }

    /// Decode the wire form: gzip-compressed bincode of `Vec<FileEntry>`.
    pub fn decode(payload: &[u8], retrieved_at: i64) -> Result<Self, ManifestError> {
        let mut decoder = GzDecoder::new(payload);
        let mut raw = Vec::new();
        decoder.read_to_end(&mut raw)?;
        let entries: Vec<FileEntry> = bincode::deserialize(&raw)?;
        Ok(Self {
            entries,
            retrieved_at,
        })
    }

    /// Encode to the wire form. The node only needs this in tests; the
    /// control plane uses it for real.
    pub fn encode(entries: &[FileEntry]) -> Result<Vec<u8>, ManifestError> {
        let raw = bincode::serialize(entries)?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&raw)?;
        Ok(encoder.finish()?)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Set of content hashes in this snapshot.
    pub fn hash_set(&self) -> HashSet<&str> {
        self.entries.iter().map(|e| e.hash.as_str()).collect()
    }

    /// Largest mtime in the snapshot, used as the `lastModified` filter on
    /// the next incremental fetch.
    pub fn latest_mtime(&self) -> Option<i64> {
        self.entries.iter().map(|e| e.mtime).max()
    }

    /// Fold an incremental update into this snapshot: updated entries
    /// replace their path's previous version, new paths are appended.
    pub fn merged(&self, update: &FileManifest) -> FileManifest {
        let replaced: HashSet<&str> = update.entries.iter().map(|e| e.path.as_str()).collect();
        let mut entries: Vec<FileEntry> = self
            .entries
            .iter()
            .filter(|e| !replaced.contains(e.path.as_str()))
            .cloned()
            .collect();
        entries.extend(update.entries.iter().cloned());
        FileManifest {
            entries,
            retrieved_at: update.retrieved_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str, hash: &str, size: u64, mtime: i64) -> FileEntry {
        FileEntry {
            path: path.to_string(),
            hash: hash.to_string(),
            size,
            mtime,
        }
    }

    #[test]
    fn decode_inverts_encode() {
        let entries = vec![
            entry("/files/a", "aa11", 3, 100),
            entry("/files/b", "bb22", 0, 250),
        ];
        let payload = FileManifest::encode(&entries).unwrap();
        let manifest = FileManifest::decode(&payload, 999).unwrap();
        assert_eq!(manifest.entries, entries);
        assert_eq!(manifest.retrieved_at, 999);
        assert_eq!(manifest.latest_mtime(), Some(250));
    }

    #[test]
    fn decode_rejects_garbage() {
        let err = FileManifest::decode(b"definitely not gzip", 0);
        assert!(err.is_err());
    }

    #[test]
    fn merge_replaces_updated_paths_and_appends_new_ones() {
        let base = FileManifest::from_entries(
            vec![
                entry("/files/a", "aa11", 3, 100),
                entry("/files/b", "bb22", 4, 100),
            ],
            100,
        );
        let update = FileManifest::from_entries(
            vec![
                entry("/files/b", "bb33", 5, 200),
                entry("/files/c", "cc44", 6, 200),
            ],
            200,
        );
        let merged = base.merged(&update);
        assert_eq!(merged.len(), 3);
        assert_eq!(merged.retrieved_at, 200);
        let b = merged.entries.iter().find(|e| e.path == "/files/b").unwrap();
        assert_eq!(b.hash, "bb33");
        assert_eq!(merged.latest_mtime(), Some(200));
    }

    #[test]
    fn hash_set_is_keyed_by_hash_not_path() {
        let manifest = FileManifest::from_entries(
            vec![
                entry("/files/a", "aa11", 3, 100),
                entry("/mirror/a", "aa11", 3, 100),
            ],
            0,
        );
        assert_eq!(manifest.hash_set().len(), 1);
    }
}
