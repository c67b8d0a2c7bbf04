//! Durable checkpoint of the current source [`Position`].
//!
//! Writes are throttled to once every [`SAVE_THROTTLE_SECS`] unless the
//! caller forces a write (e.g. on shutdown), and every write lands via a
//! write-temp / fsync / rename sequence so a crash mid-write never leaves a
//! truncated or partially-written checkpoint file behind.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};

use mymy_position::{Position, PositionError};

pub const SAVE_THROTTLE_SECS: i64 = 60;

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("failed to create checkpoint directory {path}: {source}")]
    CreateDir { path: PathBuf, source: std::io::Error },
    #[error("failed to read checkpoint file {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("failed to write checkpoint file {path}: {source}")]
    Write { path: PathBuf, source: std::io::Error },
    #[error("checkpoint document at {path} is malformed: {source}")]
    Malformed { path: PathBuf, source: serde_json::Error },
    #[error(transparent)]
    Position(#[from] PositionError),
    #[error("position variant mismatch: checkpoint holds a different position kind than gtid_mode selects")]
    VariantMismatch,
}

/// Implemented by anything that can durably remember the last synced
/// position. [`FileStateSaver`] is the only production implementation;
/// `mymy-testkit` provides an in-memory double for tests.
pub trait StateSaver: Send + Sync {
    fn load(&self) -> Result<Position, StateError>;
    fn save(&self, pos: Position, force: bool) -> Result<(), StateError>;
    fn position(&self) -> Position;
    fn close(&self) -> Result<(), StateError>;
}

struct Inner {
    pos: Position,
    saved_at: i64,
}

pub struct FileStateSaver {
    path: PathBuf,
    gtid_mode: bool,
    inner: RwLock<Inner>,
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs() as i64
}

impl FileStateSaver {
    pub fn new(path: impl AsRef<Path>, gtid_mode: bool) -> Result<Self, StateError> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|source| StateError::CreateDir {
                path: dir.to_path_buf(),
                source,
            })?;
        }

        let pos = if gtid_mode {
            Position::empty_gtid()
        } else {
            Position::zero_binlog()
        };

        Ok(FileStateSaver {
            path,
            gtid_mode,
            inner: RwLock::new(Inner {
                pos,
                saved_at: now_unix(),
            }),
        })
    }

    fn write_atomic(&self, doc: &serde_json::Value) -> Result<(), StateError> {
        let dir = self
            .path
            .parent()
            .filter(|d| !d.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|source| StateError::Write {
            path: self.path.clone(),
            source,
        })?;

        let body = serde_json::to_vec(doc).expect("position document always serialisable");
        tmp.write_all(&body).map_err(|source| StateError::Write {
            path: self.path.clone(),
            source,
        })?;
        tmp.as_file().sync_all().map_err(|source| StateError::Write {
            path: self.path.clone(),
            source,
        })?;

        tmp.persist(&self.path)
            .map_err(|e| StateError::Write {
                path: self.path.clone(),
                source: e.error,
            })?;
        Ok(())
    }
}

impl StateSaver for FileStateSaver {
    fn load(&self) -> Result<Position, StateError> {
        let mut inner = self.inner.write().unwrap();

        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(inner.pos.clone()),
            Err(source) => {
                return Err(StateError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let doc: serde_json::Value = serde_json::from_reader(file).map_err(|source| StateError::Malformed {
            path: self.path.clone(),
            source,
        })?;
        let pos = Position::from_json(self.gtid_mode, &doc)?;
        inner.pos = pos.clone();
        Ok(pos)
    }

    fn save(&self, pos: Position, force: bool) -> Result<(), StateError> {
        let expected = if self.gtid_mode {
            Position::empty_gtid()
        } else {
            Position::zero_binlog()
        };
        if !pos.same_variant(&expected) {
            return Err(StateError::VariantMismatch);
        }

        let mut inner = self.inner.write().unwrap();
        inner.pos = pos.clone();

        let now = now_unix();
        if !force && now - inner.saved_at < SAVE_THROTTLE_SECS {
            return Ok(());
        }
        inner.saved_at = now;

        let doc = pos.to_json();
        drop(inner);
        self.write_atomic(&doc)
    }

    fn position(&self) -> Position {
        self.inner.read().unwrap().pos.clone()
    }

    fn close(&self) -> Result<(), StateError> {
        let pos = self.position();
        self.save(pos, true)
    }
}
