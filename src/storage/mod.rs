//! Persistent metadata store.
//!
//! Raft keeps three records that must survive a crash: the current term, the
//! vote cast in that term, and the replicated log. They live in a sled
//! key-value store under the configured durability directory, each under a
//! well-known key. Every write is flushed before the caller proceeds, so a
//! term/vote/log transition is durable before any message that causally
//! depends on it leaves this server.

use crate::raft::{LogEntry, ServerId, Term};
use std::path::Path;

const KEY_CURRENT_TERM: &[u8] = b"current_term";
const KEY_VOTED_FOR: &[u8] = b"voted_for";
const KEY_LOG: &[u8] = b"log";

/// Leading byte of the serialized log, bumped on incompatible codec changes.
const LOG_FORMAT_VERSION: u8 = 1;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("missing persistent data for key '{0}'")]
    MissingPersistentData(String),
    #[error("corrupt persistent data for key '{0}': {1}")]
    Corrupt(String, String),
    #[error("durability dir unusable: {0}")]
    Io(#[from] sled::Error),
}

/// Storage seam for the Raft server. The durable implementation is
/// [`DurableMetadataStore`]; [`InMemoryMetadataStore`] exists for tests and
/// embedding scenarios that accept losing state on restart.
pub trait MetadataStorage: Send + 'static {
    fn current_term(&self) -> Result<Term, StorageError>;

    fn set_current_term(&mut self, term: Term) -> Result<(), StorageError>;

    fn voted_for(&self) -> Result<Option<ServerId>, StorageError>;

    fn set_voted_for(&mut self, vote: Option<ServerId>) -> Result<(), StorageError>;

    fn load_log(&self) -> Result<Vec<LogEntry>, StorageError>;

    fn save_log(&mut self, entries: &[LogEntry]) -> Result<(), StorageError>;
}

pub struct DurableMetadataStore {
    db: sled::Db,
}

impl DurableMetadataStore {
    /// Opens (or creates) the store under `dir`. A fresh directory is
    /// initialized with term 0, no vote and an empty log, so recovery after
    /// the first boot never observes a missing `current_term`.
    pub fn open(dir: &Path) -> Result<Self, StorageError> {
        let db = sled::open(dir)?;

        if db.get(KEY_CURRENT_TERM)?.is_none() {
            db.insert(KEY_CURRENT_TERM, Term(0).as_u64().to_le_bytes().to_vec())?;
        }
        if db.get(KEY_LOG)?.is_none() {
            db.insert(KEY_LOG, encode_log(&[]))?;
        }
        db.flush()?;

        Ok(DurableMetadataStore { db })
    }

    fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

impl MetadataStorage for DurableMetadataStore {
    fn current_term(&self) -> Result<Term, StorageError> {
        let bytes = self
            .db
            .get(KEY_CURRENT_TERM)?
            .ok_or_else(|| StorageError::MissingPersistentData("current_term".to_string()))?;
        let raw: [u8; 8] = bytes.as_ref().try_into().map_err(|_| {
            StorageError::Corrupt("current_term".to_string(), "expected 8 bytes".to_string())
        })?;
        Ok(Term(u64::from_le_bytes(raw)))
    }

    fn set_current_term(&mut self, term: Term) -> Result<(), StorageError> {
        self.db
            .insert(KEY_CURRENT_TERM, term.as_u64().to_le_bytes().to_vec())?;
        self.flush()
    }

    fn voted_for(&self) -> Result<Option<ServerId>, StorageError> {
        // An absent key is a legitimate "no vote cast this term".
        match self.db.get(KEY_VOTED_FOR)? {
            None => Ok(None),
            Some(bytes) => {
                let raw: [u8; 2] = bytes.as_ref().try_into().map_err(|_| {
                    StorageError::Corrupt("voted_for".to_string(), "expected 2 bytes".to_string())
                })?;
                Ok(Some(ServerId(u16::from_le_bytes(raw))))
            }
        }
    }

    fn set_voted_for(&mut self, vote: Option<ServerId>) -> Result<(), StorageError> {
        match vote {
            Some(id) => {
                self.db.insert(KEY_VOTED_FOR, id.0.to_le_bytes().to_vec())?;
            }
            None => {
                self.db.remove(KEY_VOTED_FOR)?;
            }
        }
        self.flush()
    }

    fn load_log(&self) -> Result<Vec<LogEntry>, StorageError> {
        match self.db.get(KEY_LOG)? {
            // Possible only if someone deleted the key out from under us;
            // an empty log is its defined default.
            None => Ok(Vec::new()),
            Some(bytes) => decode_log(bytes.as_ref()),
        }
    }

    fn save_log(&mut self, entries: &[LogEntry]) -> Result<(), StorageError> {
        self.db.insert(KEY_LOG, encode_log(entries))?;
        self.flush()
    }
}

fn encode_log(entries: &[LogEntry]) -> Vec<u8> {
    let mut buffer = vec![LOG_FORMAT_VERSION];
    bincode::serialize_into(&mut buffer, entries).expect("log entries are always encodable");
    buffer
}

fn decode_log(bytes: &[u8]) -> Result<Vec<LogEntry>, StorageError> {
    match bytes.split_first() {
        Some((&LOG_FORMAT_VERSION, rest)) => bincode::deserialize(rest)
            .map_err(|e| StorageError::Corrupt("log".to_string(), e.to_string())),
        Some((&version, _)) => Err(StorageError::Corrupt(
            "log".to_string(),
            format!("unsupported log format version {}", version),
        )),
        None => Err(StorageError::Corrupt(
            "log".to_string(),
            "empty log record".to_string(),
        )),
    }
}

/// Keeps everything in RAM. Satisfies the same interface so the Raft server
/// can be exercised without touching disk; a restart loses all state.
#[derive(Default)]
pub struct InMemoryMetadataStore {
    current_term: Term,
    voted_for: Option<ServerId>,
    log: Vec<LogEntry>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetadataStorage for InMemoryMetadataStore {
    fn current_term(&self) -> Result<Term, StorageError> {
        Ok(self.current_term)
    }

    fn set_current_term(&mut self, term: Term) -> Result<(), StorageError> {
        self.current_term = term;
        Ok(())
    }

    fn voted_for(&self) -> Result<Option<ServerId>, StorageError> {
        Ok(self.voted_for)
    }

    fn set_voted_for(&mut self, vote: Option<ServerId>) -> Result<(), StorageError> {
        self.voted_for = vote;
        Ok(())
    }

    fn load_log(&self) -> Result<Vec<LogEntry>, StorageError> {
        Ok(self.log.clone())
    }

    fn save_log(&mut self, entries: &[LogEntry]) -> Result<(), StorageError> {
        self.log = entries.to_vec();
        Ok(())
    }
}
