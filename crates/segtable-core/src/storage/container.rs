//! Directory of segments belonging to one container.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::RwLock;

use super::segment::{segment_paths, DirectSegment, DATA_EXTENSION};
use super::sync::sync_dir;
use super::SegmentAttributes;
use crate::error::{TableError, TableResult};

/// Segment storage for one container: a directory of `<hex name>.seg` files.
///
/// All methods take `&self`; the name map is guarded by an RwLock so segment
/// lookups run concurrently with each other.
pub struct SegmentContainer {
    id: u64,
    dir: PathBuf,
    segments: RwLock<HashMap<String, Arc<DirectSegment>>>,
    next_segment_id: AtomicU64,
}

impl SegmentContainer {
    /// Open or create the container directory, reopening every segment in it.
    pub fn open<P: AsRef<Path>>(dir: P, container_id: u64) -> TableResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| TableError::io(&dir, e))?;

        let mut segments = HashMap::new();
        let mut next_id = 0u64;
        let listing = fs::read_dir(&dir).map_err(|e| TableError::io(&dir, e))?;
        for item in listing {
            let item = item.map_err(|e| TableError::io(&dir, e))?;
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some(DATA_EXTENSION) {
                continue;
            }
            let Some(name) = decode_segment_name(&path) else {
                tracing::warn!(path = %path.display(), "skipping segment file with undecodable name");
                continue;
            };
            let segment = DirectSegment::open(next_id, &dir, &name)?;
            next_id += 1;
            segments.insert(name, Arc::new(segment));
        }

        if !segments.is_empty() {
            tracing::info!(container = container_id, segments = segments.len(), dir = %dir.display(), "reopened segments");
        }

        Ok(Self {
            id: container_id,
            dir,
            segments: RwLock::new(segments),
            next_segment_id: AtomicU64::new(next_id),
        })
    }

    pub fn container_id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Create a segment. Fails with `SegmentExists` if the name is taken.
    pub fn create_segment(&self, name: &str, attributes: SegmentAttributes) -> TableResult<Arc<DirectSegment>> {
        let mut segments = self.segments.write();
        if segments.contains_key(name) {
            return Err(TableError::SegmentExists { segment: name.to_string() });
        }
        let id = self.next_segment_id.fetch_add(1, Ordering::Relaxed);
        let segment = Arc::new(DirectSegment::create(id, &self.dir, name, attributes)?);
        segments.insert(name.to_string(), Arc::clone(&segment));
        Ok(segment)
    }

    /// Delete a segment and its files. Handles still held fail with `NotFound`.
    pub fn delete_segment(&self, name: &str) -> TableResult<()> {
        let segment = self
            .segments
            .write()
            .remove(name)
            .ok_or_else(|| TableError::NotFound { segment: name.to_string() })?;
        segment.delete_files()?;
        sync_dir(&self.dir).map_err(|e| TableError::io(&self.dir, e))?;
        Ok(())
    }

    /// Open handle to a segment.
    pub fn for_segment(&self, name: &str) -> TableResult<Arc<DirectSegment>> {
        self.segments
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| TableError::NotFound { segment: name.to_string() })
    }

    pub fn segment_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.segments.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// True if `name` maps to this container's files for `name`.
    pub fn exists(&self, name: &str) -> bool {
        let (data_path, _) = segment_paths(&self.dir, name);
        self.segments.read().contains_key(name) && data_path.exists()
    }
}

fn decode_segment_name(path: &Path) -> Option<String> {
    let stem = path.file_stem()?.to_str()?;
    let bytes = hex::decode(stem).ok()?;
    String::from_utf8(bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SegmentAccess;
    use tempfile::TempDir;

    #[test]
    fn test_create_and_lookup() {
        let tmp = TempDir::new().unwrap();
        let container = SegmentContainer::open(tmp.path(), 7).unwrap();
        assert_eq!(container.container_id(), 7);

        container.create_segment("scope/stream/table", SegmentAttributes::table(75)).unwrap();
        let segment = container.for_segment("scope/stream/table").unwrap();
        assert_eq!(segment.info().unwrap().name, "scope/stream/table");
        assert!(container.exists("scope/stream/table"));
        assert!(matches!(
            container.create_segment("scope/stream/table", SegmentAttributes::default()),
            Err(TableError::SegmentExists { .. })
        ));
    }

    #[test]
    fn test_missing_segment() {
        let tmp = TempDir::new().unwrap();
        let container = SegmentContainer::open(tmp.path(), 0).unwrap();
        assert!(matches!(container.for_segment("nope"), Err(TableError::NotFound { .. })));
        assert!(matches!(container.delete_segment("nope"), Err(TableError::NotFound { .. })));
    }

    #[test]
    fn test_delete_invalidates_handles() {
        let tmp = TempDir::new().unwrap();
        let container = SegmentContainer::open(tmp.path(), 0).unwrap();
        let segment = container.create_segment("t", SegmentAttributes::table(75)).unwrap();

        container.delete_segment("t").unwrap();
        assert!(!container.exists("t"));
        assert!(matches!(segment.info(), Err(TableError::NotFound { .. })));
        assert!(container.segment_names().is_empty());
    }

    #[test]
    fn test_reopen_lists_segments() {
        let tmp = TempDir::new().unwrap();
        {
            let container = SegmentContainer::open(tmp.path(), 0).unwrap();
            let segment = container.create_segment("b", SegmentAttributes::table(50)).unwrap();
            segment.append(None, &mut |_| Ok(vec![1, 2, 3])).unwrap();
            container.create_segment("a", SegmentAttributes::default()).unwrap();
        }

        let container = SegmentContainer::open(tmp.path(), 0).unwrap();
        assert_eq!(container.segment_names(), vec!["a".to_string(), "b".to_string()]);
        let info = container.for_segment("b").unwrap().info().unwrap();
        assert_eq!(info.length, 3);
        assert!(info.attributes.is_table_segment());
        assert!(!container.for_segment("a").unwrap().info().unwrap().attributes.is_table_segment());
    }
}
