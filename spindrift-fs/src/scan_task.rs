//! One folder scan, advanced entry by entry.
//!
//! The task snapshots the model's view of the folder at construction, then
//! walks the root comparing what is on disk. Each `advance` consumes at most
//! one directory entry and reports what it found; the scan actor turns the
//! interesting outcomes into hashing work and local-update diffs.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use tracing::{debug, trace};

use spindrift_model::{Cluster, FileKind};
use spindrift_types::TEMP_SUFFIX;

/// Model snapshot of one file entry, enough to detect metadata drift.
#[derive(Debug, Clone)]
struct FileMeta {
    kind: FileKind,
    size: u64,
    modified_s: i64,
    deleted: bool,
    symlink_target: String,
}

/// An I/O failure encountered while scanning.
#[derive(Debug)]
pub struct ScanError {
    /// The path that failed.
    pub path: PathBuf,
    /// The underlying error.
    pub error: std::io::Error,
}

/// What one `advance` step found.
#[derive(Debug)]
pub enum ScanOutcome {
    /// Progress was made; call `advance` again.
    Continue,
    /// The walk is finished; consult [`ScanTask::missing`] for tombstones.
    Done,
    /// A recorded file whose size and mtime match the model.
    Unchanged(String),
    /// A recorded file whose size or mtime drifted; content must be rehashed.
    ChangedMeta(String),
    /// A temp file matching the recorded size; the pull can resume.
    Incomplete(String),
    /// A file the model does not know; hash it and emit a local update.
    New {
        /// Absolute path on disk.
        path: PathBuf,
        /// Folder-relative name.
        name: String,
    },
    /// A symlink that is new or whose target changed.
    SymlinkChanged {
        /// Folder-relative name.
        name: String,
        /// Current target.
        target: String,
    },
    /// I/O failures; the scan continues past them.
    Errors(Vec<ScanError>),
}

/// A single folder scan.
#[derive(Debug)]
pub struct ScanTask {
    folder_id: String,
    root: PathBuf,
    started: bool,
    dirs: VecDeque<PathBuf>,
    entries: VecDeque<PathBuf>,
    files: HashMap<String, FileMeta>,
    seen: HashSet<String>,
}

impl ScanTask {
    /// Snapshot the local view of `folder_id` and prepare the walk. Returns
    /// `None` when the folder is unknown.
    pub fn new(cluster: &Cluster, folder_id: &str) -> Option<Self> {
        let folder = cluster.folder(folder_id)?;
        let info = cluster.local_folder_info(folder_id)?;
        let files = info
            .files()
            .map(|f| {
                (
                    f.name.clone(),
                    FileMeta {
                        kind: f.kind,
                        size: f.size,
                        modified_s: f.modified_s,
                        deleted: f.deleted,
                        symlink_target: f.symlink_target.clone(),
                    },
                )
            })
            .collect();
        Some(Self {
            folder_id: folder_id.to_string(),
            root: folder.path.clone(),
            started: false,
            dirs: VecDeque::new(),
            entries: VecDeque::new(),
            files,
            seen: HashSet::new(),
        })
    }

    /// The folder being scanned.
    pub fn folder_id(&self) -> &str {
        &self.folder_id
    }

    /// The folder root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Recorded names the walk never saw on disk (and that are not already
    /// tombstones); each needs a deleted local-update.
    pub fn missing(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .files
            .iter()
            .filter(|(name, meta)| !meta.deleted && !self.seen.contains(*name))
            .map(|(name, _)| name.clone())
            .collect();
        out.sort_unstable();
        out
    }

    fn relative(&self, path: &Path) -> String {
        let rel = path.strip_prefix(&self.root).unwrap_or(path);
        let mut name = String::new();
        for part in rel.components() {
            if !name.is_empty() {
                name.push('/');
            }
            name.push_str(&part.as_os_str().to_string_lossy());
        }
        name
    }

    fn push_dir_entries(&mut self, dir: &Path) -> Result<(), ScanError> {
        let reader = std::fs::read_dir(dir).map_err(|error| ScanError {
            path: dir.to_path_buf(),
            error,
        })?;
        let mut batch = Vec::new();
        for entry in reader {
            match entry {
                Ok(e) => batch.push(e.path()),
                Err(error) => {
                    return Err(ScanError {
                        path: dir.to_path_buf(),
                        error,
                    })
                }
            }
        }
        batch.sort();
        self.entries.extend(batch);
        Ok(())
    }

    /// Consume at most one directory entry.
    pub fn advance(&mut self) -> ScanOutcome {
        if !self.started {
            self.started = true;
            return match self.push_dir_entries(&self.root.clone()) {
                Ok(()) => ScanOutcome::Continue,
                Err(e) => {
                    debug!(path = %e.path.display(), error = %e.error, "cannot open folder root");
                    ScanOutcome::Errors(vec![e])
                }
            };
        }

        if let Some(path) = self.entries.pop_front() {
            return self.process(path);
        }
        if let Some(dir) = self.dirs.pop_front() {
            return match self.push_dir_entries(&dir) {
                Ok(()) => ScanOutcome::Continue,
                Err(e) => ScanOutcome::Errors(vec![e]),
            };
        }
        ScanOutcome::Done
    }

    fn process(&mut self, path: PathBuf) -> ScanOutcome {
        let meta = match std::fs::symlink_metadata(&path) {
            Ok(m) => m,
            Err(error) => return ScanOutcome::Errors(vec![ScanError { path, error }]),
        };

        if meta.file_type().is_symlink() {
            let name = self.relative(&path);
            self.seen.insert(name.clone());
            let target = std::fs::read_link(&path)
                .map(|t| t.to_string_lossy().into_owned())
                .unwrap_or_default();
            return match self.files.get(&name) {
                Some(rec)
                    if rec.kind == FileKind::Symlink
                        && !rec.deleted
                        && rec.symlink_target == target =>
                {
                    ScanOutcome::Unchanged(name)
                }
                _ => ScanOutcome::SymlinkChanged { name, target },
            };
        }

        if meta.is_dir() {
            self.dirs.push_back(path.clone());
            let name = self.relative(&path);
            if !name.is_empty() {
                self.seen.insert(name);
            }
            return ScanOutcome::Continue;
        }

        let name = self.relative(&path);
        if let Some(base) = name.strip_suffix(TEMP_SUFFIX) {
            return self.process_temp(path, base.to_string(), meta.len());
        }

        self.seen.insert(name.clone());
        let modified_s = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        match self.files.get(&name) {
            Some(rec) if !rec.deleted && rec.kind == FileKind::File => {
                if rec.size == meta.len() && rec.modified_s == modified_s {
                    ScanOutcome::Unchanged(name)
                } else {
                    trace!(
                        name,
                        disk_size = meta.len(),
                        model_size = rec.size,
                        "metadata drift"
                    );
                    ScanOutcome::ChangedMeta(name)
                }
            }
            _ => ScanOutcome::New { path, name },
        }
    }

    fn process_temp(&mut self, path: PathBuf, base: String, len: u64) -> ScanOutcome {
        let final_path = self.root.join(&base);
        let resumable = !final_path.exists()
            && self
                .files
                .get(&base)
                .map(|rec| !rec.deleted && rec.kind == FileKind::File && rec.size == len)
                .unwrap_or(false);
        if resumable {
            self.seen.insert(base.clone());
            return ScanOutcome::Incomplete(base);
        }
        // stale temp: the final file exists, the size drifted, or nothing is
        // recorded for it
        match std::fs::remove_file(&path) {
            Ok(()) => ScanOutcome::Continue,
            Err(error) => ScanOutcome::Errors(vec![ScanError { path, error }]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::FileTime;
    use spindrift_model::diff::ClusterDiff;
    use spindrift_model::Device;
    use spindrift_types::records::FolderRecord;
    use spindrift_types::{bep, DeviceId};

    const MODIFIED: i64 = 1_642_007_468;

    fn cluster_at(root: &Path) -> Cluster {
        let my_id: DeviceId = "KHQNO2S-5QSILRK-YX4JZZ4-7L77APM-QNVGZJT-EKU7IFI-PNEPBMY-4MXFMQD"
            .parse()
            .unwrap();
        let mut cluster = Cluster::new(Device::new(my_id, "my-device"));
        cluster
            .apply(&ClusterDiff::create_folder(FolderRecord {
                id: "some-id".into(),
                label: "zzz".into(),
                path: root.to_string_lossy().into_owned(),
                ..Default::default()
            }))
            .unwrap();
        cluster
    }

    fn record_file(cluster: &mut Cluster, name: &str, size: i64, modified_s: i64) {
        cluster
            .apply(&ClusterDiff::local_update(
                "some-id",
                bep::FileInfo {
                    name: name.into(),
                    size,
                    block_size: 5,
                    modified_s,
                    blocks: vec![bep::BlockInfo {
                        offset: 0,
                        size: size as i32,
                        hash: vec![7; 32],
                        weak_hash: 0,
                    }],
                    ..Default::default()
                },
            ))
            .unwrap();
    }

    fn write_with_mtime(path: &Path, content: &str, mtime: i64) {
        std::fs::write(path, content).unwrap();
        filetime::set_file_mtime(path, FileTime::from_unix_time(mtime, 0)).unwrap();
    }

    fn run_to_end(task: &mut ScanTask) -> Vec<ScanOutcome> {
        let mut interesting = Vec::new();
        loop {
            match task.advance() {
                ScanOutcome::Continue => continue,
                ScanOutcome::Done => return interesting,
                other => interesting.push(other),
            }
        }
    }

    #[test]
    fn nonexistent_root_reports_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut cluster = cluster_at(dir.path());
        cluster
            .apply(&ClusterDiff::create_folder(FolderRecord {
                id: "bad".into(),
                label: "bad".into(),
                path: "/some/non-existing/path".into(),
                ..Default::default()
            }))
            .unwrap();
        let mut task = ScanTask::new(&cluster, "bad").unwrap();
        match task.advance() {
            ScanOutcome::Errors(errs) => {
                assert_eq!(errs.len(), 1);
                assert_eq!(errs[0].path, PathBuf::from("/some/non-existing/path"));
            }
            other => panic!("expected errors, got {other:?}"),
        }
    }

    #[test]
    fn empty_root_finishes_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = cluster_at(dir.path());
        let mut task = ScanTask::new(&cluster, "some-id").unwrap();
        assert!(matches!(task.advance(), ScanOutcome::Continue));
        assert!(matches!(task.advance(), ScanOutcome::Done));
    }

    #[test]
    fn unchanged_meta_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut cluster = cluster_at(dir.path());
        write_with_mtime(&dir.path().join("a.txt"), "12345", MODIFIED);
        record_file(&mut cluster, "a.txt", 5, MODIFIED);

        let mut task = ScanTask::new(&cluster, "some-id").unwrap();
        let outcomes = run_to_end(&mut task);
        assert_eq!(outcomes.len(), 1);
        assert!(matches!(&outcomes[0], ScanOutcome::Unchanged(n) if n == "a.txt"));
        assert!(task.missing().is_empty());
    }

    #[test]
    fn size_drift_is_changed_meta() {
        let dir = tempfile::tempdir().unwrap();
        let mut cluster = cluster_at(dir.path());
        write_with_mtime(&dir.path().join("a.txt"), "12345", MODIFIED);
        record_file(&mut cluster, "a.txt", 6, MODIFIED);

        let mut task = ScanTask::new(&cluster, "some-id").unwrap();
        let outcomes = run_to_end(&mut task);
        assert!(matches!(&outcomes[0], ScanOutcome::ChangedMeta(n) if n == "a.txt"));
    }

    #[test]
    fn mtime_drift_is_changed_meta() {
        let dir = tempfile::tempdir().unwrap();
        let mut cluster = cluster_at(dir.path());
        write_with_mtime(&dir.path().join("a.txt"), "12345", MODIFIED);
        record_file(&mut cluster, "a.txt", 5, MODIFIED + 1);

        let mut task = ScanTask::new(&cluster, "some-id").unwrap();
        let outcomes = run_to_end(&mut task);
        assert!(matches!(&outcomes[0], ScanOutcome::ChangedMeta(n) if n == "a.txt"));
    }

    #[test]
    fn matching_temp_resumes() {
        let dir = tempfile::tempdir().unwrap();
        let mut cluster = cluster_at(dir.path());
        std::fs::write(dir.path().join("a.txt.spindrift-tmp"), "12345").unwrap();
        record_file(&mut cluster, "a.txt", 5, MODIFIED);

        let mut task = ScanTask::new(&cluster, "some-id").unwrap();
        let outcomes = run_to_end(&mut task);
        assert_eq!(outcomes.len(), 1);
        assert!(matches!(&outcomes[0], ScanOutcome::Incomplete(n) if n == "a.txt"));
        assert!(
            task.missing().is_empty(),
            "a resumable temp counts as present"
        );
    }

    #[test]
    fn size_mismatched_temp_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let mut cluster = cluster_at(dir.path());
        let temp = dir.path().join("a.txt.spindrift-tmp");
        std::fs::write(&temp, "123456").unwrap();
        record_file(&mut cluster, "a.txt", 5, MODIFIED);

        let mut task = ScanTask::new(&cluster, "some-id").unwrap();
        let outcomes = run_to_end(&mut task);
        assert!(outcomes.is_empty());
        assert!(!temp.exists(), "stale temp is deleted");
    }

    #[test]
    fn temp_next_to_final_file_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let mut cluster = cluster_at(dir.path());
        let temp = dir.path().join("a.txt.spindrift-tmp");
        write_with_mtime(&dir.path().join("a.txt"), "12345", MODIFIED);
        std::fs::write(&temp, "12345").unwrap();
        record_file(&mut cluster, "a.txt", 5, MODIFIED);

        let mut task = ScanTask::new(&cluster, "some-id").unwrap();
        let outcomes = run_to_end(&mut task);
        assert_eq!(outcomes.len(), 1);
        assert!(matches!(&outcomes[0], ScanOutcome::Unchanged(n) if n == "a.txt"));
        assert!(!temp.exists());
    }

    #[test]
    fn unknown_files_are_new() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = cluster_at(dir.path());
        std::fs::write(dir.path().join("fresh.txt"), "data").unwrap();

        let mut task = ScanTask::new(&cluster, "some-id").unwrap();
        let outcomes = run_to_end(&mut task);
        assert!(matches!(&outcomes[0], ScanOutcome::New { name, .. } if name == "fresh.txt"));
    }

    #[test]
    fn missing_recorded_files_become_tombstones() {
        let dir = tempfile::tempdir().unwrap();
        let mut cluster = cluster_at(dir.path());
        record_file(&mut cluster, "gone.txt", 5, MODIFIED);

        let mut task = ScanTask::new(&cluster, "some-id").unwrap();
        let outcomes = run_to_end(&mut task);
        assert!(outcomes.is_empty());
        assert_eq!(task.missing(), vec!["gone.txt".to_string()]);
    }

    #[test]
    fn subdirectories_are_walked() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = cluster_at(dir.path());
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/inner.txt"), "x").unwrap();

        let mut task = ScanTask::new(&cluster, "some-id").unwrap();
        let outcomes = run_to_end(&mut task);
        assert!(outcomes
            .iter()
            .any(|o| matches!(o, ScanOutcome::New { name, .. } if name == "sub/inner.txt")));
    }
}
