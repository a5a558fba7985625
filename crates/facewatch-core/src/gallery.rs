//! Identity gallery: loading, validation, persistence and the hot-swappable store.
//!
//! A [`Gallery`] is immutable once built. The [`GalleryStore`] publishes new
//! galleries by replacing an `Arc`, so a reader that cloned the previous
//! `Arc` keeps matching against a complete, consistent snapshot.

use crate::types::{Embedding, Identity};
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("cannot access gallery {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed gallery data: {0}")]
    DataFormat(String),
    #[error("invalid embedding: {0}")]
    InvalidVector(String),
    #[error("duplicate identity id: {0}")]
    DuplicateId(String),
}

/// A record that was dropped during load, with its position in the source.
#[derive(Debug)]
pub struct RejectedRecord {
    pub index: usize,
    pub error: GalleryError,
}

/// Outcome of parsing a gallery source.
#[derive(Debug)]
pub struct LoadReport {
    pub gallery: Gallery,
    pub rejected: Vec<RejectedRecord>,
}

/// Persisted record shape. Every field is required.
#[derive(Deserialize)]
struct IdentityRecord {
    id: String,
    name: String,
    embedding: Vec<f32>,
}

/// Ordered, immutable set of known identities sharing one embedding dimension.
#[derive(Debug, Clone, Default)]
pub struct Gallery {
    identities: Vec<Identity>,
    dimension: Option<usize>,
    generation: u64,
}

impl Gallery {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a gallery from already-typed identities.
    ///
    /// Unlike [`parse`], nothing is dropped: the first invalid identity is an error.
    pub fn from_identities(identities: Vec<Identity>) -> Result<Self, GalleryError> {
        let mut seen = HashSet::new();
        let mut dimension = None;
        for identity in &identities {
            validate_identity(identity)?;
            match dimension {
                None => dimension = Some(identity.embedding.dimension()),
                Some(d) if d != identity.embedding.dimension() => {
                    return Err(GalleryError::InvalidVector(format!(
                        "identity {} has dimension {}, gallery has {d}",
                        identity.id,
                        identity.embedding.dimension()
                    )));
                }
                Some(_) => {}
            }
            if !seen.insert(identity.id.as_str()) {
                return Err(GalleryError::DuplicateId(identity.id.clone()));
            }
        }
        Ok(Self {
            identities,
            dimension,
            generation: 0,
        })
    }

    pub fn identities(&self) -> &[Identity] {
        &self.identities
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    /// Shared embedding dimension, `None` for an empty gallery.
    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    /// Load generation assigned by the store when this gallery was published.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn contains_id(&self, id: &str) -> bool {
        self.identities.iter().any(|i| i.id == id)
    }

    fn with_generation(mut self, generation: u64) -> Self {
        self.generation = generation;
        self
    }
}

fn validate_identity(identity: &Identity) -> Result<(), GalleryError> {
    if identity.id.trim().is_empty() {
        return Err(GalleryError::DataFormat("empty id".into()));
    }
    validate_embedding(&identity.embedding)
}

fn validate_embedding(embedding: &Embedding) -> Result<(), GalleryError> {
    if embedding.values.is_empty() {
        return Err(GalleryError::InvalidVector("embedding is empty".into()));
    }
    if let Some(pos) = embedding.values.iter().position(|v| !v.is_finite()) {
        return Err(GalleryError::InvalidVector(format!("non-finite value at position {pos}")));
    }
    Ok(())
}

/// Most common embedding dimension; ties go to the dimension seen first.
fn majority_dimension<'a>(dims: impl Iterator<Item = &'a usize>) -> Option<usize> {
    let mut counts: HashMap<usize, (usize, usize)> = HashMap::new();
    for (order, &dim) in dims.enumerate() {
        counts.entry(dim).or_insert((0, order)).0 += 1;
    }
    counts
        .into_iter()
        .max_by(|(_, (count_a, first_a)), (_, (count_b, first_b))| {
            count_a.cmp(count_b).then(first_b.cmp(first_a))
        })
        .map(|(dim, _)| dim)
}

/// Read and validate a gallery file.
///
/// Only an unreadable file or a document that is not a JSON array fails the
/// whole load. Individual malformed records are dropped and listed in the
/// report.
pub fn load(path: &Path) -> Result<LoadReport, GalleryError> {
    let bytes = std::fs::read(path).map_err(|source| GalleryError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse(&bytes)
}

/// Parse and validate gallery records from an in-memory JSON document.
pub fn parse(bytes: &[u8]) -> Result<LoadReport, GalleryError> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(LoadReport {
            gallery: Gallery::empty(),
            rejected: Vec::new(),
        });
    }

    let entries: Vec<serde_json::Value> = serde_json::from_slice(bytes)
        .map_err(|e| GalleryError::DataFormat(format!("expected a JSON array of records: {e}")))?;

    let mut rejected = Vec::new();
    let mut candidates = Vec::with_capacity(entries.len());

    for (index, entry) in entries.into_iter().enumerate() {
        let record = match serde_json::from_value::<IdentityRecord>(entry) {
            Ok(record) => record,
            Err(e) => {
                rejected.push(RejectedRecord {
                    index,
                    error: GalleryError::DataFormat(e.to_string()),
                });
                continue;
            }
        };
        let identity = Identity::new(record.id.trim(), record.name.trim(), record.embedding);
        match validate_identity(&identity) {
            Ok(()) => candidates.push((index, identity)),
            Err(error) => rejected.push(RejectedRecord { index, error }),
        }
    }

    let dims: Vec<usize> = candidates.iter().map(|(_, i)| i.embedding.dimension()).collect();
    let dimension = majority_dimension(dims.iter());

    let mut seen = HashSet::new();
    let mut identities = Vec::with_capacity(candidates.len());
    for (index, identity) in candidates {
        if Some(identity.embedding.dimension()) != dimension {
            rejected.push(RejectedRecord {
                index,
                error: GalleryError::InvalidVector(format!(
                    "dimension {} disagrees with gallery dimension {}",
                    identity.embedding.dimension(),
                    dimension.unwrap_or_default()
                )),
            });
            continue;
        }
        if !seen.insert(identity.id.clone()) {
            rejected.push(RejectedRecord {
                index,
                error: GalleryError::DuplicateId(identity.id),
            });
            continue;
        }
        identities.push(identity);
    }

    rejected.sort_by_key(|r| r.index);

    Ok(LoadReport {
        gallery: Gallery {
            identities,
            dimension,
            generation: 0,
        },
        rejected,
    })
}

/// Write identities in the persisted form, replacing `path` atomically.
pub fn save(path: &Path, identities: &[Identity]) -> Result<(), GalleryError> {
    let io_err = |source| GalleryError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }

    let json = serde_json::to_vec_pretty(identities)
        .map_err(|e| GalleryError::DataFormat(format!("serialize gallery: {e}")))?;

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    std::fs::write(&tmp, json).map_err(io_err)?;
    std::fs::rename(&tmp, path).map_err(io_err)?;

    tracing::info!(path = %path.display(), count = identities.len(), "gallery saved");
    Ok(())
}

/// Summary of a successful (re)load.
#[derive(Debug)]
pub struct LoadSummary {
    pub loaded: usize,
    pub generation: u64,
    pub rejected: Vec<RejectedRecord>,
}

struct Active {
    gallery: Arc<Gallery>,
    load_failed: bool,
}

/// Holds the active gallery and replaces it wholesale on reload.
pub struct GalleryStore {
    path: PathBuf,
    active: RwLock<Active>,
    /// Serializes reloads so generations are published in order.
    reload_lock: Mutex<u64>,
}

impl GalleryStore {
    /// Create a store backed by `path` and perform the initial load.
    ///
    /// A failed initial load is logged and leaves an empty gallery with
    /// [`size`](Self::size) reporting `None`.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let store = Self {
            path: path.into(),
            active: RwLock::new(Active {
                gallery: Arc::new(Gallery::empty()),
                load_failed: false,
            }),
            reload_lock: Mutex::new(0),
        };
        if let Err(e) = store.reload() {
            tracing::warn!(path = %store.path.display(), error = %e, "initial gallery load failed");
        }
        store
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The currently published gallery.
    pub fn snapshot(&self) -> Arc<Gallery> {
        Arc::clone(&self.active.read().gallery)
    }

    /// Number of identities in the active gallery, or `None` if the most
    /// recent load attempt failed outright.
    pub fn size(&self) -> Option<usize> {
        let active = self.active.read();
        if active.load_failed {
            None
        } else {
            Some(active.gallery.len())
        }
    }

    /// Load the backing file again and publish the result.
    ///
    /// The new gallery is fully built before the active reference is
    /// swapped. On outright failure an empty gallery is published and the
    /// failure sentinel is set.
    pub fn reload(&self) -> Result<LoadSummary, GalleryError> {
        let mut generation = self.reload_lock.lock();
        *generation += 1;

        match load(&self.path) {
            Ok(report) => {
                for rejected in &report.rejected {
                    tracing::warn!(
                        path = %self.path.display(),
                        record = rejected.index,
                        error = %rejected.error,
                        "dropped gallery record"
                    );
                }
                let gallery = Arc::new(report.gallery.with_generation(*generation));
                let loaded = gallery.len();
                self.publish(gallery, false);
                tracing::info!(
                    path = %self.path.display(),
                    loaded,
                    rejected = report.rejected.len(),
                    generation = *generation,
                    "gallery loaded"
                );
                Ok(LoadSummary {
                    loaded,
                    generation: *generation,
                    rejected: report.rejected,
                })
            }
            Err(e) => {
                self.publish(Arc::new(Gallery::empty().with_generation(*generation)), true);
                Err(e)
            }
        }
    }

    fn publish(&self, gallery: Arc<Gallery>, load_failed: bool) {
        let previous = {
            let mut active = self.active.write();
            std::mem::replace(&mut *active, Active { gallery, load_failed })
        };
        // The old snapshot is released outside the lock.
        drop(previous);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_gallery(dir: &tempfile::TempDir, json: &str) -> PathBuf {
        let path = dir.path().join("gallery.json");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(json.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_parse_valid_records() {
        let report = parse(
            br#"[
                {"id": "001", "name": "Alice", "embedding": [0.0, 0.0]},
                {"id": "002", "name": "Bob", "embedding": [10.0, 10.0]}
            ]"#,
        )
        .unwrap();
        assert!(report.rejected.is_empty());
        assert_eq!(report.gallery.len(), 2);
        assert_eq!(report.gallery.dimension(), Some(2));
        assert_eq!(report.gallery.identities()[1].name, "Bob");
    }

    #[test]
    fn test_parse_drops_record_missing_embedding() {
        let report = parse(
            br#"[
                {"id": "001", "name": "Alice", "embedding": [0.0, 0.0]},
                {"id": "002", "name": "Bob"},
                {"id": "003", "name": "Carol", "embedding": [1.0, 1.0]}
            ]"#,
        )
        .unwrap();
        assert_eq!(report.gallery.len(), 2);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].index, 1);
        assert!(matches!(report.rejected[0].error, GalleryError::DataFormat(_)));
    }

    #[test]
    fn test_parse_drops_minority_dimension() {
        let report = parse(
            br#"[
                {"id": "a", "name": "A", "embedding": [1.0, 2.0, 3.0]},
                {"id": "b", "name": "B", "embedding": [1.0, 2.0]},
                {"id": "c", "name": "C", "embedding": [4.0, 5.0, 6.0]}
            ]"#,
        )
        .unwrap();
        assert_eq!(report.gallery.dimension(), Some(3));
        assert_eq!(report.gallery.len(), 2);
        assert_eq!(report.rejected.len(), 1);
        assert!(matches!(report.rejected[0].error, GalleryError::InvalidVector(_)));
    }

    #[test]
    fn test_majority_tie_prefers_first_dimension() {
        assert_eq!(majority_dimension([2usize, 3, 3, 2].iter()), Some(2));
        assert_eq!(majority_dimension([3usize, 2, 2].iter()), Some(2));
        assert_eq!(majority_dimension(std::iter::empty()), None);
    }

    #[test]
    fn test_parse_drops_empty_and_wrongly_typed_records() {
        let report = parse(
            br#"[
                {"id": "a", "name": "A", "embedding": []},
                {"id": "", "name": "B", "embedding": [1.0]},
                {"id": 7, "name": "C", "embedding": [1.0]},
                "not a record",
                {"id": "d", "name": "D", "embedding": [1.0]}
            ]"#,
        )
        .unwrap();
        assert_eq!(report.gallery.len(), 1);
        assert_eq!(report.gallery.identities()[0].id, "d");
        let indices: Vec<usize> = report.rejected.iter().map(|r| r.index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_parse_drops_duplicate_ids() {
        let report = parse(
            br#"[
                {"id": "a", "name": "First", "embedding": [1.0]},
                {"id": "a", "name": "Second", "embedding": [2.0]}
            ]"#,
        )
        .unwrap();
        assert_eq!(report.gallery.len(), 1);
        assert_eq!(report.gallery.identities()[0].name, "First");
        assert!(matches!(report.rejected[0].error, GalleryError::DuplicateId(_)));
    }

    #[test]
    fn test_parse_zero_readable_entries_is_empty_gallery() {
        let report = parse(br#"[{"name": "nobody"}]"#).unwrap();
        assert!(report.gallery.is_empty());
        assert_eq!(report.gallery.dimension(), None);

        assert!(parse(b"[]").unwrap().gallery.is_empty());
        assert!(parse(b"  \n").unwrap().gallery.is_empty());
    }

    #[test]
    fn test_parse_rejects_non_array_document() {
        assert!(matches!(parse(br#"{"id": "a"}"#), Err(GalleryError::DataFormat(_))));
        assert!(matches!(parse(b"\x80\x04pickle"), Err(GalleryError::DataFormat(_))));
    }

    #[test]
    fn test_from_identities_is_strict() {
        let mixed = vec![
            Identity::new("a", "A", vec![1.0, 2.0]),
            Identity::new("b", "B", vec![1.0]),
        ];
        assert!(matches!(Gallery::from_identities(mixed), Err(GalleryError::InvalidVector(_))));

        let dup = vec![Identity::new("a", "A", vec![1.0]), Identity::new("a", "B", vec![2.0])];
        assert!(matches!(Gallery::from_identities(dup), Err(GalleryError::DuplicateId(_))));
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("gallery.json");
        let identities = vec![
            Identity::new("001", "Alice", vec![0.25, -0.5]),
            Identity::new("002", "Bob", vec![0.125, 0.75]),
        ];
        save(&path, &identities).unwrap();

        let report = load(&path).unwrap();
        assert!(report.rejected.is_empty());
        assert_eq!(report.gallery.identities(), identities.as_slice());
    }

    #[test]
    fn test_store_missing_file_sets_failure_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let store = GalleryStore::open(dir.path().join("absent.json"));
        assert_eq!(store.size(), None);
        assert!(store.snapshot().is_empty());
        assert!(matches!(store.reload(), Err(GalleryError::Io { .. })));
    }

    #[test]
    fn test_store_empty_gallery_reports_zero() {
        let dir = tempfile::tempdir().unwrap();
        let store = GalleryStore::open(write_gallery(&dir, "[]"));
        assert_eq!(store.size(), Some(0));
    }

    #[test]
    fn test_store_three_records_one_missing_embedding() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_gallery(
            &dir,
            r#"[
                {"id": "1", "name": "A", "embedding": [0.1, 0.2]},
                {"id": "2", "name": "B"},
                {"id": "3", "name": "C", "embedding": [0.3, 0.4]}
            ]"#,
        );
        let store = GalleryStore::open(path);
        assert_eq!(store.size(), Some(2));
    }

    #[test]
    fn test_reload_swaps_snapshot_and_keeps_old_one_alive() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_gallery(&dir, r#"[{"id": "1", "name": "A", "embedding": [0.0]}]"#);
        let store = GalleryStore::open(&path);
        let before = store.snapshot();

        save(
            &path,
            &[Identity::new("1", "A", vec![0.0]), Identity::new("2", "B", vec![1.0])],
        )
        .unwrap();
        let summary = store.reload().unwrap();

        assert_eq!(summary.loaded, 2);
        assert_eq!(store.size(), Some(2));
        assert_eq!(before.len(), 1);
        assert!(store.snapshot().generation() > before.generation());
    }

    #[test]
    fn test_failed_reload_recovers_on_next_success() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_gallery(&dir, r#"[{"id": "1", "name": "A", "embedding": [0.0]}]"#);
        let store = GalleryStore::open(&path);

        std::fs::remove_file(&path).unwrap();
        assert!(store.reload().is_err());
        assert_eq!(store.size(), None);

        save(&path, &[Identity::new("1", "A", vec![0.0])]).unwrap();
        store.reload().unwrap();
        assert_eq!(store.size(), Some(1));
    }

    #[test]
    fn test_concurrent_reload_never_mixes_generations() {
        // Two alternating source files: every identity in generation "a" has
        // vector [0, 0], every identity in generation "b" has [10, 10].
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gallery.json");
        let gen_a: Vec<Identity> = (0..20).map(|i| Identity::new(format!("a{i}"), "A", vec![0.0, 0.0])).collect();
        let gen_b: Vec<Identity> = (0..35).map(|i| Identity::new(format!("b{i}"), "B", vec![10.0, 10.0])).collect();
        save(&path, &gen_a).unwrap();

        let store = Arc::new(GalleryStore::open(&path));
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = Arc::clone(&store);
                let stop = Arc::clone(&stop);
                std::thread::spawn(move || {
                    use crate::matcher::{EuclideanMatcher, Matcher};
                    let query = Embedding::new(vec![0.0, 0.0]);
                    let mut checked = 0usize;
                    while !stop.load(std::sync::atomic::Ordering::Relaxed) {
                        let snapshot = store.snapshot();
                        let prefixes: HashSet<char> =
                            snapshot.identities().iter().filter_map(|i| i.id.chars().next()).collect();
                        assert!(prefixes.len() <= 1, "snapshot mixes generations: {prefixes:?}");
                        let result = EuclideanMatcher.classify(&query, &snapshot, 1.05);
                        match prefixes.iter().next() {
                            Some('a') => assert!(result.is_match()),
                            Some('b') => assert!(!result.is_match()),
                            _ => {}
                        }
                        checked += 1;
                    }
                    checked
                })
            })
            .collect();

        for round in 0..40 {
            let next = if round % 2 == 0 { &gen_b } else { &gen_a };
            save(&path, next).unwrap();
            store.reload().unwrap();
        }
        stop.store(true, std::sync::atomic::Ordering::Relaxed);

        for reader in readers {
            assert!(reader.join().unwrap() > 0);
        }
    }
}
