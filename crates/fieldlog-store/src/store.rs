//! Append-only buffer file implementation.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, error, info, warn};

use fieldlog_types::{Record, line};

use crate::error::{Error, Result};
use crate::snapshot::{BufferStats, RejectedLine, Snapshot};

/// Durable FIFO log of records that could not be delivered.
///
/// Each record is one line of line protocol. Appends are written as a whole
/// line and synced before returning. Delivered records are removed by
/// [`commit`](Self::commit)ting the [`Snapshot`] they were read from, which
/// rewrites the file through a temporary sibling and an atomic rename.
#[derive(Debug)]
pub struct BufferStore {
    path: PathBuf,
    file: File,
    lines: usize,
}

impl BufferStore {
    /// Open or create a buffer file at the given path.
    ///
    /// If the previous process died in the middle of an append, the trailing
    /// partial line is cut off so the file only contains complete records.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            fs::create_dir_all(parent).map_err(|e| Error::CreateDirectory {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let lines = recover(&path).map_err(|e| Error::Open {
            path: path.clone(),
            source: e,
        })?;
        let file = open_append(&path).map_err(|e| Error::Open {
            path: path.clone(),
            source: e,
        })?;

        if lines > 0 {
            info!("Opened buffer {} with {} pending record(s)", path.display(), lines);
        } else {
            debug!("Opened empty buffer {}", path.display());
        }

        Ok(Self { path, file, lines })
    }

    /// Path of the buffer file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the sidecar file holding lines that could not be decoded.
    pub fn rejected_path(&self) -> PathBuf {
        sibling(&self.path, "rejected")
    }

    /// Number of lines currently buffered.
    pub fn len(&self) -> usize {
        self.lines
    }

    /// True if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.lines == 0
    }

    /// Append a record and sync it to disk.
    ///
    /// Once this returns `Ok`, the record survives a crash.
    pub fn append(&mut self, record: &Record) -> Result<()> {
        let mut entry = line::encode(record);
        entry.push('\n');

        self.file
            .write_all(entry.as_bytes())
            .and_then(|()| self.file.sync_data())
            .map_err(|e| Error::Append {
                path: self.path.clone(),
                source: e,
            })?;

        self.lines += 1;
        debug!("Buffered record for {} ({} pending)", record.measurement(), self.lines);
        Ok(())
    }

    /// Read every buffered line without changing the file.
    ///
    /// An empty buffer yields an empty snapshot without touching the disk.
    pub fn snapshot(&self) -> Result<Snapshot> {
        if self.lines == 0 {
            return Ok(Snapshot::default());
        }

        let content = fs::read(&self.path).map_err(|e| Error::Read {
            path: self.path.clone(),
            source: e,
        })?;
        Ok(parse(&self.path, &content))
    }

    /// Remove exactly the lines covered by `snapshot`.
    ///
    /// Lines appended after the snapshot was taken are kept. Lines the
    /// snapshot could not decode are moved to [`rejected_path`](Self::rejected_path)
    /// rather than deleted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StaleSnapshot`] if the file no longer starts with the
    /// snapshot's lines; nothing is modified in that case.
    pub fn commit(&mut self, snapshot: &Snapshot) -> Result<()> {
        if snapshot.is_empty() {
            return Ok(());
        }

        let commit_err = |path: &Path| {
            let path = path.to_path_buf();
            move |e: std::io::Error| Error::Commit { path, source: e }
        };

        let content = fs::read(&self.path).map_err(|e| Error::Read {
            path: self.path.clone(),
            source: e,
        })?;
        if !content.starts_with(&snapshot.prefix) {
            return Err(Error::StaleSnapshot {
                path: self.path.clone(),
                lines: snapshot.line_count,
            });
        }

        let remainder = &content[snapshot.prefix.len()..];
        let tmp_path = sibling(&self.path, "tmp");
        replace_contents(&self.path, &tmp_path, remainder).map_err(commit_err(&self.path))?;

        // The old handle still points at the replaced inode.
        self.file = open_append(&self.path).map_err(commit_err(&self.path))?;
        self.lines = self.lines.saturating_sub(snapshot.line_count);

        // After the rename, so a failed commit never quarantines twice.
        if !snapshot.rejected.is_empty() {
            let rejected_path = self.rejected_path();
            match quarantine(&rejected_path, snapshot.rejected()) {
                Ok(()) => warn!(
                    "Moved {} unreadable line(s) to {}",
                    snapshot.rejected.len(),
                    rejected_path.display()
                ),
                Err(e) => {
                    error!(
                        "Dropped {} unreadable line(s), could not write {}: {}",
                        snapshot.rejected.len(),
                        rejected_path.display(),
                        e
                    );
                    for rejected in snapshot.rejected() {
                        error!("Dropped line {}: {}", rejected.line_number, rejected.raw);
                    }
                }
            }
        }

        debug!(
            "Committed {} line(s) from {} ({} pending)",
            snapshot.line_count,
            self.path.display(),
            self.lines
        );
        Ok(())
    }

    /// Summarize buffer contents.
    pub fn stats(&self) -> Result<BufferStats> {
        summarize(&self.snapshot()?, &self.rejected_path())
    }

    /// Summarize a buffer file without opening it for writing.
    ///
    /// Safe to call while a collector owns the buffer: nothing is created,
    /// truncated or synced. A missing file reads as empty.
    pub fn inspect<P: AsRef<Path>>(path: P) -> Result<BufferStats> {
        let path = path.as_ref();
        let snapshot = match fs::read(path) {
            Ok(content) => parse(path, &content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Snapshot::default(),
            Err(e) => {
                return Err(Error::Read {
                    path: path.to_path_buf(),
                    source: e,
                });
            }
        };
        summarize(&snapshot, &sibling(path, "rejected"))
    }

    /// Flush file metadata and release the buffer.
    pub fn close(self) -> Result<()> {
        self.file.sync_all().map_err(|e| Error::Append {
            path: self.path.clone(),
            source: e,
        })?;
        debug!("Closed buffer {}", self.path.display());
        Ok(())
    }
}

fn open_append(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Decode every complete line of `content`.
fn parse(path: &Path, content: &[u8]) -> Snapshot {
    let mut snapshot = Snapshot::default();
    let mut offset = 0;
    for (idx, raw) in content.split_inclusive(|b| *b == b'\n').enumerate() {
        // Appends always end in a newline, anything else is a write in progress.
        if !raw.ends_with(b"\n") {
            break;
        }
        let text = String::from_utf8_lossy(&raw[..raw.len() - 1]);
        match line::decode(&text) {
            Ok(record) => snapshot.records.push(record),
            Err(error) => {
                warn!(
                    "Unreadable line {} in {}: {}",
                    idx + 1,
                    path.display(),
                    error
                );
                snapshot.rejected.push(RejectedLine {
                    line_number: idx + 1,
                    raw: text.into_owned(),
                    error,
                });
            }
        }
        offset += raw.len();
        snapshot.line_count += 1;
    }
    snapshot.prefix = content[..offset].to_vec();
    snapshot
}

fn summarize(snapshot: &Snapshot, rejected_path: &Path) -> Result<BufferStats> {
    let quarantined = match fs::read(rejected_path) {
        Ok(bytes) => bytes.iter().filter(|b| **b == b'\n').count(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
        Err(e) => {
            return Err(Error::Read {
                path: rejected_path.to_path_buf(),
                source: e,
            });
        }
    };

    Ok(BufferStats {
        pending: snapshot.len(),
        unreadable: snapshot.rejected().len(),
        oldest: snapshot.records().iter().map(Record::timestamp).min(),
        newest: snapshot.records().iter().map(Record::timestamp).max(),
        quarantined,
    })
}

/// Truncate a trailing partial line and return the number of complete lines.
fn recover(path: &Path) -> std::io::Result<usize> {
    let mut file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(path)?;
    let mut content = Vec::new();
    file.read_to_end(&mut content)?;

    if content.last().is_some_and(|b| *b != b'\n') {
        let keep = content
            .iter()
            .rposition(|b| *b == b'\n')
            .map_or(0, |pos| pos + 1);
        warn!(
            "Discarding incomplete trailing line in {}: {:?}",
            path.display(),
            String::from_utf8_lossy(&content[keep..])
        );
        file.set_len(keep as u64)?;
        file.sync_all()?;
        content.truncate(keep);
    }

    Ok(content.iter().filter(|b| **b == b'\n').count())
}

fn replace_contents(path: &Path, tmp_path: &Path, contents: &[u8]) -> std::io::Result<()> {
    {
        let mut tmp = File::create(tmp_path)?;
        tmp.write_all(contents)?;
        tmp.sync_all()?;
    }
    fs::rename(tmp_path, path)?;
    sync_parent(path)
}

fn quarantine(path: &Path, lines: &[RejectedLine]) -> std::io::Result<()> {
    let mut file = open_append(path)?;
    for rejected in lines {
        file.write_all(rejected.raw.as_bytes())?;
        file.write_all(b"\n")?;
    }
    file.sync_data()
}

#[cfg(unix)]
fn sync_parent(path: &Path) -> std::io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => File::open(parent)?.sync_all(),
        _ => Ok(()),
    }
}

#[cfg(not(unix))]
fn sync_parent(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldlog_types::FieldValue;
    use time::OffsetDateTime;

    fn record(seq: i64) -> Record {
        Record::builder("wind_sensor")
            .tag("sensor", "mast-1")
            .field("seq", seq)
            .field("speed", 1.25 * seq as f64)
            .timestamp(
                OffsetDateTime::from_unix_timestamp_nanos(
                    1_700_000_000_000_000_000 + i128::from(seq),
                )
                .unwrap(),
            )
            .build()
            .unwrap()
    }

    fn seqs(snapshot: &Snapshot) -> Vec<i64> {
        snapshot
            .records()
            .iter()
            .map(|r| match r.field("seq") {
                Some(FieldValue::Integer(v)) => v,
                other => panic!("unexpected seq {:?}", other),
            })
            .collect()
    }

    fn open_temp() -> (tempfile::TempDir, BufferStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = BufferStore::open(dir.path().join("buffer.lp")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_open_creates_file_and_parent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("buffer.lp");
        let store = BufferStore::open(&path).unwrap();
        assert!(path.exists());
        assert!(store.is_empty());
    }

    #[test]
    fn test_empty_snapshot_is_empty() {
        let (_dir, mut store) = open_temp();
        let snapshot = store.snapshot().unwrap();
        assert!(snapshot.is_empty());
        assert_eq!(snapshot.len(), 0);
        store.commit(&snapshot).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_append_preserves_order() {
        let (_dir, mut store) = open_temp();
        for seq in 1..=5 {
            store.append(&record(seq)).unwrap();
        }
        assert_eq!(store.len(), 5);
        let snapshot = store.snapshot().unwrap();
        assert_eq!(seqs(&snapshot), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_snapshot_does_not_mutate() {
        let (_dir, mut store) = open_temp();
        store.append(&record(1)).unwrap();
        let before = fs::read(store.path()).unwrap();
        let _ = store.snapshot().unwrap();
        let _ = store.snapshot().unwrap();
        assert_eq!(fs::read(store.path()).unwrap(), before);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_round_trip_values() {
        let (_dir, mut store) = open_temp();
        let original = record(3);
        store.append(&original).unwrap();
        let snapshot = store.snapshot().unwrap();
        assert_eq!(snapshot.records(), &[original]);
    }

    #[test]
    fn test_commit_removes_snapshot() {
        let (_dir, mut store) = open_temp();
        store.append(&record(1)).unwrap();
        store.append(&record(2)).unwrap();
        let snapshot = store.snapshot().unwrap();
        store.commit(&snapshot).unwrap();
        assert!(store.is_empty());
        assert!(store.snapshot().unwrap().is_empty());
        assert!(fs::read(store.path()).unwrap().is_empty());
    }

    #[test]
    fn test_commit_keeps_appends_after_snapshot() {
        let (_dir, mut store) = open_temp();
        store.append(&record(1)).unwrap();
        store.append(&record(2)).unwrap();
        let snapshot = store.snapshot().unwrap();

        store.append(&record(3)).unwrap();
        store.commit(&snapshot).unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(seqs(&store.snapshot().unwrap()), vec![3]);

        // Appends after commit land in the rewritten file.
        store.append(&record(4)).unwrap();
        assert_eq!(seqs(&store.snapshot().unwrap()), vec![3, 4]);
    }

    #[test]
    fn test_stale_snapshot_rejected() {
        let (_dir, mut store) = open_temp();
        store.append(&record(1)).unwrap();
        let snapshot = store.snapshot().unwrap();
        store.commit(&snapshot).unwrap();
        store.append(&record(2)).unwrap();

        let err = store.commit(&snapshot).unwrap_err();
        assert!(matches!(err, Error::StaleSnapshot { lines: 1, .. }));
        assert_eq!(seqs(&store.snapshot().unwrap()), vec![2]);
    }

    #[test]
    fn test_records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buffer.lp");
        {
            let mut store = BufferStore::open(&path).unwrap();
            store.append(&record(7)).unwrap();
            // Dropped without commit, as if the process died here.
        }
        let store = BufferStore::open(&path).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(seqs(&store.snapshot().unwrap()), vec![7]);
    }

    #[test]
    fn test_open_truncates_partial_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buffer.lp");
        let complete = format!("{}\n", line::encode(&record(1)));
        fs::write(&path, format!("{}wind_sensor,sensor=mast-1 seq=2i,sp", complete)).unwrap();

        let mut store = BufferStore::open(&path).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(fs::read_to_string(&path).unwrap(), complete);

        store.append(&record(3)).unwrap();
        assert_eq!(seqs(&store.snapshot().unwrap()), vec![1, 3]);
    }

    #[test]
    fn test_unreadable_lines_quarantined_on_commit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buffer.lp");
        let good = line::encode(&record(1));
        fs::write(&path, format!("garbage\n{}\n", good)).unwrap();

        let mut store = BufferStore::open(&path).unwrap();
        let snapshot = store.snapshot().unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.line_count(), 2);
        assert_eq!(snapshot.rejected()[0].line_number, 1);
        assert_eq!(snapshot.rejected()[0].raw, "garbage");

        store.commit(&snapshot).unwrap();
        assert!(store.is_empty());
        assert_eq!(fs::read_to_string(store.rejected_path()).unwrap(), "garbage\n");
        assert_eq!(store.stats().unwrap().quarantined, 1);
    }

    #[test]
    fn test_failed_commit_does_not_quarantine() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buffer.lp");
        let good = line::encode(&record(1));
        fs::write(&path, format!("garbage\n{}\n", good)).unwrap();

        let mut store = BufferStore::open(&path).unwrap();
        let snapshot = store.snapshot().unwrap();

        // A directory where the temporary file goes makes the rewrite fail.
        let tmp_path = dir.path().join("buffer.lp.tmp");
        fs::create_dir(&tmp_path).unwrap();
        assert!(matches!(store.commit(&snapshot), Err(Error::Commit { .. })));
        assert!(!store.rejected_path().exists());
        assert_eq!(store.len(), 2);

        fs::remove_dir(&tmp_path).unwrap();
        store.commit(&snapshot).unwrap();
        assert!(store.is_empty());
        assert_eq!(fs::read_to_string(store.rejected_path()).unwrap(), "garbage\n");
    }

    #[test]
    fn test_stats() {
        let (_dir, mut store) = open_temp();
        assert_eq!(store.stats().unwrap(), BufferStats::default());

        store.append(&record(2)).unwrap();
        store.append(&record(5)).unwrap();
        let stats = store.stats().unwrap();
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.oldest, Some(record(2).timestamp()));
        assert_eq!(stats.newest, Some(record(5).timestamp()));
    }

    #[test]
    fn test_inspect_is_read_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buffer.lp");
        assert_eq!(BufferStore::inspect(&path).unwrap(), BufferStats::default());
        assert!(!path.exists());

        let mut content = line::encode(&record(1));
        content.push('\n');
        content.push_str("partial");
        fs::write(&path, &content).unwrap();

        let stats = BufferStore::inspect(&path).unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(fs::read_to_string(&path).unwrap(), content);
    }

    #[test]
    fn test_sibling_paths() {
        let (_dir, store) = open_temp();
        assert!(store.rejected_path().ends_with("buffer.lp.rejected"));
        assert_eq!(
            sibling(Path::new("/data/buffer.lp"), "tmp"),
            PathBuf::from("/data/buffer.lp.tmp")
        );
    }
}
