//! On-disk layout of order event streams and their append-only logs.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::event::{StoredEvent, now_millis};

/// File name of a stream's event log inside its stream directory.
const EVENTS_FILE: &str = "events.jsonl";

/// File name of the stream registry inside `meta/`.
const REGISTRY_FILE: &str = "streams.jsonl";

/// One line of the stream registry.
#[derive(Debug, Serialize, Deserialize)]
struct RegistryEntry {
    #[serde(rename = "type")]
    aggregate_type: String,
    id: String,
    /// Unix seconds at registration.
    ts: u64,
}

/// Where order streams live under the store's base directory.
///
/// ```text
/// <base_dir>/
///     streams/order/<id>/events.jsonl   -- one StoredEvent per line
///     meta/streams.jsonl                -- one registry line per stream
/// ```
///
/// Nothing is created until [`ensure_stream`](StreamLayout::ensure_stream)
/// is called for a stream.
#[derive(Debug, Clone)]
pub struct StreamLayout {
    base_dir: PathBuf,
}

impl StreamLayout {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn type_dir(&self, aggregate_type: &str) -> PathBuf {
        self.base_dir.join("streams").join(aggregate_type)
    }

    /// `<base_dir>/streams/<aggregate_type>/<instance_id>`
    pub fn stream_dir(&self, aggregate_type: &str, instance_id: &str) -> PathBuf {
        self.type_dir(aggregate_type).join(instance_id)
    }

    /// `<base_dir>/streams/<aggregate_type>/<instance_id>/events.jsonl`
    pub fn events_path(&self, aggregate_type: &str, instance_id: &str) -> PathBuf {
        self.stream_dir(aggregate_type, instance_id).join(EVENTS_FILE)
    }

    /// `<base_dir>/meta`
    pub fn meta_dir(&self) -> PathBuf {
        self.base_dir.join("meta")
    }

    fn registry_path(&self) -> PathBuf {
        self.meta_dir().join(REGISTRY_FILE)
    }

    /// Whether the registry already lists this stream. A missing registry
    /// lists nothing; unparseable lines are ignored.
    fn is_registered(&self, aggregate_type: &str, instance_id: &str) -> io::Result<bool> {
        let file = match File::open(self.registry_path()) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e),
        };
        for line in BufReader::new(file).lines() {
            let line = line?;
            let Ok(entry) = serde_json::from_str::<RegistryEntry>(&line) else {
                continue;
            };
            if entry.aggregate_type == aggregate_type && entry.id == instance_id {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Create the stream's directory and register it, once.
    ///
    /// Safe to call on every actor spawn: neither the directory tree nor the
    /// registry line is duplicated.
    ///
    /// # Returns
    ///
    /// The stream directory.
    ///
    /// # Errors
    ///
    /// Returns `std::io::Error` if a directory or the registry cannot be
    /// written.
    pub fn ensure_stream(&self, aggregate_type: &str, instance_id: &str) -> io::Result<PathBuf> {
        let dir = self.stream_dir(aggregate_type, instance_id);
        fs::create_dir_all(&dir)?;
        fs::create_dir_all(self.meta_dir())?;

        if !self.is_registered(aggregate_type, instance_id)? {
            let entry = RegistryEntry {
                aggregate_type: aggregate_type.to_owned(),
                id: instance_id.to_owned(),
                ts: now_millis() / 1000,
            };
            let mut line = serde_json::to_vec(&entry).map_err(io::Error::other)?;
            line.push(b'\n');
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.registry_path())?
                .write_all(&line)?;
        }

        Ok(dir)
    }

    /// Instance ids of every stream of `aggregate_type` on disk, sorted
    /// lexically.
    ///
    /// An aggregate type with no directory yet has no streams.
    ///
    /// # Errors
    ///
    /// Returns `std::io::Error` if the type directory exists but cannot be
    /// read.
    pub fn list_streams(&self, aggregate_type: &str) -> io::Result<Vec<String>> {
        let entries = match fs::read_dir(self.type_dir(aggregate_type)) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                ids.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        ids.sort();
        Ok(ids)
    }
}

/// Read every event of a stream log, oldest first.
///
/// A missing log reads as an empty stream. Lines that fail to parse (for
/// example a torn final write) are logged and skipped.
///
/// # Errors
///
/// Returns `std::io::Error` for I/O failures other than file-not-found.
pub fn read_log(path: &Path) -> io::Result<Vec<StoredEvent>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut events = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<StoredEvent>(&line) {
            Ok(event) => events.push(event),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    line = index + 1,
                    error = %e,
                    "skipping corrupt event log line"
                );
            }
        }
    }
    Ok(events)
}

/// Whether a non-empty file's last byte is something other than `\n`.
fn has_torn_tail(file: &mut File) -> io::Result<bool> {
    if file.metadata()?.len() == 0 {
        return Ok(false);
    }
    let mut last = [0u8; 1];
    file.seek(SeekFrom::End(-1))?;
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

/// Append-only writer for one stream's log.
///
/// Owned exclusively by the stream's actor. Every record starts on a fresh
/// line: a batch that fails partway is truncated off again, and a partial
/// line left by a crash is terminated before the next append.
#[derive(Debug)]
pub struct EventLog {
    path: PathBuf,
    file: File,
    /// The file may end in a partial line.
    torn: bool,
}

impl EventLog {
    /// Open (creating if needed) the log at `path` for appending.
    ///
    /// # Errors
    ///
    /// Returns `std::io::Error` if the file cannot be opened or its tail
    /// cannot be read.
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;
        let torn = has_torn_tail(&mut file)?;
        if torn {
            tracing::warn!(path = %path.display(), "event log ends in a partial line");
        }
        Ok(Self { path, file, torn })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a batch of events and flush them to disk.
    ///
    /// The batch is written with a single `write_all` call and synced before
    /// returning, so a command's events are durable once this returns `Ok`.
    /// On failure the file is cut back to its length before the call.
    ///
    /// # Errors
    ///
    /// Returns `std::io::Error` if serialization, the write, or the sync fails.
    pub fn append(&mut self, events: &[StoredEvent]) -> io::Result<()> {
        let mut buf = Vec::new();
        if self.torn {
            buf.push(b'\n');
        }
        for event in events {
            serde_json::to_writer(&mut buf, event).map_err(io::Error::other)?;
            buf.push(b'\n');
        }

        let start = self.file.metadata()?.len();
        if let Err(e) = self.write_synced(&buf) {
            if let Err(truncate) = self.file.set_len(start) {
                tracing::error!(
                    path = %self.path.display(),
                    error = %truncate,
                    "failed to truncate partial append"
                );
                self.torn = true;
            }
            return Err(e);
        }
        self.torn = false;
        Ok(())
    }

    fn write_synced(&mut self, buf: &[u8]) -> io::Result<()> {
        self.file.write_all(buf)?;
        self.file.flush()?;
        self.file.sync_data()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    use crate::event::EventMetadata;

    fn event(version: u64) -> StoredEvent {
        StoredEvent {
            event_id: uuid::Uuid::new_v4(),
            aggregate_type: "order".to_string(),
            instance_id: "1".to_string(),
            stream_version: version,
            event_type: "Discarded".to_string(),
            data: serde_json::json!({"at": version}),
            metadata: EventMetadata::default(),
            recorded_at: version,
        }
    }

    #[test]
    fn order_paths() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let layout = StreamLayout::new(tmp.path());

        assert_eq!(
            layout.events_path("order", "7"),
            tmp.path().join("streams/order/7/events.jsonl")
        );
        assert_eq!(layout.meta_dir(), tmp.path().join("meta"));
    }

    #[test]
    fn nothing_exists_before_a_stream_is_ensured() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let layout = StreamLayout::new(tmp.path().join("store"));

        assert!(!layout.base_dir().exists());
        assert!(
            layout
                .list_streams("order")
                .expect("listing a missing tree should succeed")
                .is_empty()
        );
    }

    #[test]
    fn each_stream_is_registered_once() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let layout = StreamLayout::new(tmp.path());

        for _ in 0..3 {
            let dir = layout
                .ensure_stream("order", "7")
                .expect("ensure_stream should succeed");
            assert!(dir.is_dir());
        }
        layout
            .ensure_stream("order", "8")
            .expect("ensure_stream should succeed");

        let registry = fs::read_to_string(tmp.path().join("meta/streams.jsonl"))
            .expect("registry should exist");
        let entries: Vec<serde_json::Value> = registry
            .lines()
            .map(|line| serde_json::from_str(line).expect("registry line is JSON"))
            .collect();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["type"], "order");
        assert_eq!(entries[0]["id"], "7");
        assert!(entries[0]["ts"].is_u64());
    }

    #[test]
    fn stream_ids_are_listed_sorted_and_files_ignored() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let layout = StreamLayout::new(tmp.path());
        for id in ["20", "3", "100"] {
            layout
                .ensure_stream("order", id)
                .expect("ensure_stream should succeed");
        }
        fs::write(tmp.path().join("streams/order/README"), "stray")
            .expect("write should succeed");

        let ids = layout.list_streams("order").expect("list should succeed");
        assert_eq!(ids, vec!["100", "20", "3"]);
    }

    #[test]
    fn read_log_missing_file_is_empty() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let events = read_log(&tmp.path().join("nope.jsonl")).expect("read should succeed");
        assert!(events.is_empty());
    }

    #[test]
    fn append_then_read_preserves_order() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let path = tmp.path().join(EVENTS_FILE);

        let mut log = EventLog::open(&path).expect("open should succeed");
        log.append(&[event(1), event(2)]).expect("append should succeed");
        log.append(&[event(3)]).expect("append should succeed");
        drop(log);

        let versions: Vec<u64> = read_log(&path)
            .expect("read should succeed")
            .iter()
            .map(|e| e.stream_version)
            .collect();
        assert_eq!(versions, vec![1, 2, 3]);
    }

    #[test]
    fn corrupt_lines_are_skipped() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let path = tmp.path().join(EVENTS_FILE);

        let mut log = EventLog::open(&path).expect("open should succeed");
        log.append(&[event(1)]).expect("append should succeed");
        drop(log);

        let mut file = OpenOptions::new()
            .append(true)
            .open(&path)
            .expect("reopen should succeed");
        writeln!(file, "{{\"event_id\": trunc").expect("write should succeed");
        drop(file);

        let events = read_log(&path).expect("read should succeed");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].stream_version, 1);
    }

    #[test]
    fn append_after_torn_tail_starts_a_fresh_line() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let path = tmp.path().join(EVENTS_FILE);

        let mut log = EventLog::open(&path).expect("open should succeed");
        log.append(&[event(1)]).expect("append should succeed");
        drop(log);

        // A crash mid-write leaves a fragment with no newline.
        let mut file = OpenOptions::new()
            .append(true)
            .open(&path)
            .expect("reopen should succeed");
        write!(file, "{{\"event_id\":\"ab").expect("write should succeed");
        drop(file);

        let mut log = EventLog::open(&path).expect("open should succeed");
        log.append(&[event(2)]).expect("append should succeed");
        log.append(&[event(3)]).expect("append should succeed");
        drop(log);

        let versions: Vec<u64> = read_log(&path)
            .expect("read should succeed")
            .iter()
            .map(|e| e.stream_version)
            .collect();
        assert_eq!(versions, vec![1, 2, 3]);

        let contents = fs::read_to_string(&path).expect("read should succeed");
        assert_eq!(contents.lines().count(), 4, "the fragment keeps its own line");
    }

    #[test]
    fn clean_log_is_not_reported_torn() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let path = tmp.path().join(EVENTS_FILE);

        let mut log = EventLog::open(&path).expect("open should succeed");
        assert!(!log.torn, "an empty log has no partial line");
        log.append(&[event(1)]).expect("append should succeed");
        drop(log);

        let log = EventLog::open(&path).expect("open should succeed");
        assert!(!log.torn);
    }
}
