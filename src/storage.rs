use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{TResult, TrackerError};
use crate::geo_filter::{mps_to_kmh, pace_min_per_km};
use crate::types::{PositionFix, Session, SessionId, SessionRecord, SnapshotPoint};

/// Where sessions and their points are written.
///
/// The coordinator treats every write as fire-and-forget except
/// `create_session` (gates start) and the closing `update_session`.
pub trait PersistenceSink: Send + Sync {
    fn create_session(&self, session: &Session) -> TResult<()>;

    fn update_session(&self, session: &Session) -> TResult<()>;

    fn append_position_fix(&self, fix: &PositionFix) -> TResult<()>;

    fn append_snapshot(&self, point: &SnapshotPoint) -> TResult<()>;

    /// Sessions without their points, newest first
    fn list_sessions(&self) -> TResult<Vec<Session>>;

    fn load_session(&self, id: &SessionId) -> TResult<Option<SessionRecord>>;

    /// Returns false when nothing was stored under `id`
    fn delete_session(&self, id: &SessionId) -> TResult<bool>;
}

fn newest_first(sessions: &mut [Session]) {
    sessions.sort_by(|a, b| b.start_time.cmp(&a.start_time).then_with(|| b.id.cmp(&a.id)));
}

fn missing(id: &SessionId) -> TrackerError {
    TrackerError::Persistence(format!("Session {} not found", id))
}

fn already_exists(id: &SessionId) -> TrackerError {
    TrackerError::Persistence(format!("Session {} already exists", id))
}

/// Keeps everything in process memory
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<BTreeMap<SessionId, SessionRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> TResult<MutexGuard<'_, BTreeMap<SessionId, SessionRecord>>> {
        self.records
            .lock()
            .map_err(|_| TrackerError::Internal("Failed to acquire store lock".to_string()))
    }

    fn with_record<F>(&self, id: &SessionId, f: F) -> TResult<()>
    where
        F: FnOnce(&mut SessionRecord),
    {
        let mut records = self.records()?;
        let record = records.get_mut(id).ok_or_else(|| missing(id))?;
        f(record);
        Ok(())
    }
}

impl PersistenceSink for MemoryStore {
    fn create_session(&self, session: &Session) -> TResult<()> {
        let mut records = self.records()?;
        if records.contains_key(&session.id) {
            return Err(already_exists(&session.id));
        }
        records.insert(session.id.clone(), SessionRecord::new(session.clone()));
        Ok(())
    }

    fn update_session(&self, session: &Session) -> TResult<()> {
        self.with_record(&session.id, |record| record.session = session.clone())
    }

    fn append_position_fix(&self, fix: &PositionFix) -> TResult<()> {
        self.with_record(&fix.session_id, |record| record.fixes.push(fix.clone()))
    }

    fn append_snapshot(&self, point: &SnapshotPoint) -> TResult<()> {
        self.with_record(&point.session_id, |record| record.snapshots.push(point.clone()))
    }

    fn list_sessions(&self) -> TResult<Vec<Session>> {
        let mut sessions: Vec<Session> = self
            .records()?
            .values()
            .map(|record| record.session.clone())
            .collect();
        newest_first(&mut sessions);
        Ok(sessions)
    }

    fn load_session(&self, id: &SessionId) -> TResult<Option<SessionRecord>> {
        Ok(self.records()?.get(id).cloned())
    }

    fn delete_session(&self, id: &SessionId) -> TResult<bool> {
        Ok(self.records()?.remove(id).is_some())
    }
}

const FIXES_SUFFIX: &str = "fixes.jsonl";
const SNAPSHOTS_SUFFIX: &str = "snapshots.jsonl";

/// File-backed store under one directory.
///
/// `<id>.json` holds the pretty-printed session header and is replaced
/// atomically on every update. Points go to append-only JSON-lines files,
/// `<id>.fixes.jsonl` and `<id>.snapshots.jsonl`, one object per line, so an
/// append costs the same at the end of a long run as at the start.
pub struct JsonFileStore {
    dir: PathBuf,
    // Serializes header rewrites and appends
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn open(dir: impl AsRef<Path>) -> TResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        log::debug!("[store] using {}", dir.display());
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    fn file_for(&self, id: &SessionId, suffix: &str) -> TResult<PathBuf> {
        if !id.is_path_safe() {
            return Err(TrackerError::Persistence(format!(
                "Session id {:?} is not a valid file name",
                id.as_str()
            )));
        }
        Ok(self.dir.join(format!("{}.{}", id, suffix)))
    }

    fn header_path(&self, id: &SessionId) -> TResult<PathBuf> {
        self.file_for(id, "json")
    }

    fn guard(&self) -> TResult<MutexGuard<'_, ()>> {
        self.write_lock
            .lock()
            .map_err(|_| TrackerError::Internal("Failed to acquire store lock".to_string()))
    }

    fn read_header(path: &Path) -> TResult<Option<Session>> {
        match fs::read_to_string(path) {
            Ok(json) => Ok(Some(serde_json::from_str(&json)?)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    // Write to a sibling temp file and rename so readers never see a torn header
    fn write_header(path: &Path, session: &Session) -> TResult<()> {
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(session)?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    fn append_line<T: Serialize>(&self, id: &SessionId, suffix: &str, item: &T) -> TResult<()> {
        let header = self.header_path(id)?;
        let path = self.file_for(id, suffix)?;
        let mut line = Vec::new();
        serde_json::to_writer(&mut line, item)?;
        line.push(b'\n');

        let _guard = self.guard()?;
        if !header.exists() {
            return Err(missing(id));
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(&line)?;
        Ok(())
    }

    // A line cut short by a crash mid-append is skipped, not fatal
    fn read_lines<T: DeserializeOwned>(path: &Path) -> TResult<Vec<T>> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut items = Vec::new();
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(item) => items.push(item),
                Err(err) => log::warn!(
                    "[store] skipping line {} of {}: {}",
                    index + 1,
                    path.display(),
                    err
                ),
            }
        }
        Ok(items)
    }

    fn remove_if_present(path: &Path) -> TResult<bool> {
        match fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}

impl PersistenceSink for JsonFileStore {
    fn create_session(&self, session: &Session) -> TResult<()> {
        let path = self.header_path(&session.id)?;
        let fixes = self.file_for(&session.id, FIXES_SUFFIX)?;
        let snapshots = self.file_for(&session.id, SNAPSHOTS_SUFFIX)?;

        let _guard = self.guard()?;
        if path.exists() {
            return Err(already_exists(&session.id));
        }
        // Points left behind by an interrupted delete must not leak into the new session
        Self::remove_if_present(&fixes)?;
        Self::remove_if_present(&snapshots)?;
        Self::write_header(&path, session)
    }

    fn update_session(&self, session: &Session) -> TResult<()> {
        let path = self.header_path(&session.id)?;
        let _guard = self.guard()?;
        if !path.exists() {
            return Err(missing(&session.id));
        }
        Self::write_header(&path, session)
    }

    fn append_position_fix(&self, fix: &PositionFix) -> TResult<()> {
        self.append_line(&fix.session_id, FIXES_SUFFIX, fix)
    }

    fn append_snapshot(&self, point: &SnapshotPoint) -> TResult<()> {
        self.append_line(&point.session_id, SNAPSHOTS_SUFFIX, point)
    }

    fn list_sessions(&self) -> TResult<Vec<Session>> {
        let mut sessions = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            // Point files end in .jsonl and temp files in .tmp
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            match Self::read_header(&path) {
                Ok(Some(session)) => sessions.push(session),
                Ok(None) => {}
                Err(err) => log::warn!("[store] skipping {}: {}", path.display(), err),
            }
        }
        newest_first(&mut sessions);
        Ok(sessions)
    }

    fn load_session(&self, id: &SessionId) -> TResult<Option<SessionRecord>> {
        let Some(session) = Self::read_header(&self.header_path(id)?)? else {
            return Ok(None);
        };
        Ok(Some(SessionRecord {
            session,
            fixes: Self::read_lines(&self.file_for(id, FIXES_SUFFIX)?)?,
            snapshots: Self::read_lines(&self.file_for(id, SNAPSHOTS_SUFFIX)?)?,
        }))
    }

    fn delete_session(&self, id: &SessionId) -> TResult<bool> {
        let path = self.header_path(id)?;
        let fixes = self.file_for(id, FIXES_SUFFIX)?;
        let snapshots = self.file_for(id, SNAPSHOTS_SUFFIX)?;

        let _guard = self.guard()?;
        Self::remove_if_present(&fixes)?;
        Self::remove_if_present(&snapshots)?;
        Self::remove_if_present(&path)
    }
}

/// Session statistics for display
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub duration_seconds: u64,
    pub steps: u64,
    pub distance_km: f64,
    pub average_speed_kmh: f64,
    pub average_pace_min_per_km: Option<f64>,
    pub peak_speed_kmh: f64,
    pub fix_count: usize,
    pub snapshot_count: usize,
}

impl SessionSummary {
    pub fn from_record(record: &SessionRecord) -> Self {
        let session = &record.session;
        let peak_speed_kmh = record
            .fixes
            .iter()
            .map(|fix| mps_to_kmh(fix.speed_mps))
            .filter(|speed| speed.is_finite())
            .fold(0.0_f64, f64::max);

        SessionSummary {
            session_id: session.id.clone(),
            duration_seconds: session.duration_seconds,
            steps: session.steps,
            distance_km: session.distance_km,
            average_speed_kmh: session.average_speed_kmh,
            average_pace_min_per_km: pace_min_per_km(session.average_speed_kmh),
            peak_speed_kmh,
            fix_count: record.fixes.len(),
            snapshot_count: record.snapshots.len(),
        }
    }
}
