//! Durable journal of loyalty state changes.
//!
//! Every atomic unit (account opening with its welcome entry, one ledger
//! entry, a redemption's entry together with its reward token, a token
//! consumption, a deactivation) is one record. A record is written before
//! the change becomes visible in memory, so replaying the journal rebuilds
//! exactly the state that was acknowledged.
//!
//! # File format
//!
//! JSON lines. Each line is an envelope `{seq, checksum, payload}` where
//! `payload` is the serialized record and `checksum` is the hex SHA-256 of
//! the sequence number and payload. Replay verifies every checksum. A torn
//! final line (crash mid-write) is dropped and truncated; damage anywhere
//! else is reported as corruption.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use storefront_core::error::{LoyaltyError, LoyaltyResult};
use storefront_core::loyalty::{LedgerEntry, LoyaltyAccount, RewardToken};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum JournalRecord {
    /// `account` is the snapshot before `welcome` is applied.
    AccountOpened {
        account: LoyaltyAccount,
        welcome: Option<LedgerEntry>,
    },
    EntryAppended {
        entry: LedgerEntry,
    },
    RewardIssued {
        entry: LedgerEntry,
        token: RewardToken,
    },
    RewardConsumed {
        code: String,
        account_id: Uuid,
        consumed_at: DateTime<Utc>,
    },
    AccountDeactivated {
        account_id: Uuid,
        at: DateTime<Utc>,
    },
}

/// Append-only storage for journal records.
pub trait Journal: Send + Sync {
    /// Persist one record. On error nothing was persisted.
    fn append(&self, record: &JournalRecord) -> LoyaltyResult<()>;

    /// All persisted records in append order.
    fn replay(&self) -> LoyaltyResult<Vec<JournalRecord>>;
}

// ─── In-memory ──────────────────────────────────────────────────────────────

/// Journal kept in process memory. Survives engine rebuilds, not restarts.
#[derive(Default)]
pub struct MemoryJournal {
    records: Mutex<Vec<JournalRecord>>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl Journal for MemoryJournal {
    fn append(&self, record: &JournalRecord) -> LoyaltyResult<()> {
        self.records.lock().push(record.clone());
        Ok(())
    }

    fn replay(&self) -> LoyaltyResult<Vec<JournalRecord>> {
        Ok(self.records.lock().clone())
    }
}

// ─── File-backed ────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    seq: u64,
    checksum: String,
    payload: String,
}

fn checksum(seq: u64, payload: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(seq.to_le_bytes());
    hasher.update(payload.as_bytes());
    hex::encode(hasher.finalize())
}

struct Writer {
    file: File,
    next_seq: u64,
    /// Length of the file up to the last complete record.
    len: u64,
}

pub struct FileJournal {
    path: PathBuf,
    writer: Mutex<Writer>,
    sync_writes: bool,
}

struct Scan {
    records: Vec<JournalRecord>,
    valid_len: u64,
    torn_tail: bool,
}

impl FileJournal {
    /// Open or create the journal at `path`, verifying existing records.
    pub fn open(path: impl AsRef<Path>, sync_writes: bool) -> LoyaltyResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        let scan = Self::scan(&path)?;
        if scan.torn_tail {
            warn!(
                path = %path.display(),
                valid_len = scan.valid_len,
                "Dropping torn journal tail"
            );
            file.set_len(scan.valid_len)?;
        }

        info!(
            path = %path.display(),
            records = scan.records.len(),
            "Journal opened"
        );

        Ok(Self {
            path,
            writer: Mutex::new(Writer {
                file,
                next_seq: scan.records.len() as u64 + 1,
                len: scan.valid_len,
            }),
            sync_writes,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn scan(path: &Path) -> LoyaltyResult<Scan> {
        let reader = BufReader::new(File::open(path)?);
        let mut lines: Vec<(String, u64)> = Vec::new();
        let mut complete_len = 0u64;
        let mut torn_tail = false;

        for line in reader.split(b'\n') {
            let bytes = line?;
            lines.push((String::from_utf8_lossy(&bytes).into_owned(), bytes.len() as u64));
        }
        // `split` doesn't say whether the last line ended with a newline.
        let file_len = std::fs::metadata(path)?.len();
        let newline_terminated: u64 = lines.iter().map(|(_, n)| n + 1).sum();
        let unterminated_tail = newline_terminated > file_len;

        let mut records = Vec::with_capacity(lines.len());
        let last = lines.len().saturating_sub(1);
        for (i, (line, n)) in lines.iter().enumerate() {
            // Records are written newline-terminated in one write, so an
            // unterminated last line is an interrupted append.
            if i == last && unterminated_tail {
                torn_tail = true;
                break;
            }
            if line.trim().is_empty() {
                complete_len += n + 1;
                continue;
            }

            let record = Self::decode(line, records.len() as u64 + 1).map_err(|e| {
                LoyaltyError::Journal(format!("corrupt record at line {}: {e}", i + 1))
            })?;
            records.push(record);
            complete_len += n + 1;
        }

        Ok(Scan {
            records,
            valid_len: complete_len,
            torn_tail,
        })
    }

    fn decode(line: &str, expected_seq: u64) -> LoyaltyResult<JournalRecord> {
        let envelope: Envelope = serde_json::from_str(line)?;
        if envelope.seq != expected_seq {
            return Err(LoyaltyError::Journal(format!(
                "expected sequence {expected_seq}, found {}",
                envelope.seq
            )));
        }
        if checksum(envelope.seq, &envelope.payload) != envelope.checksum {
            return Err(LoyaltyError::Journal(format!(
                "checksum mismatch at sequence {}",
                envelope.seq
            )));
        }
        Ok(serde_json::from_str(&envelope.payload)?)
    }
}

impl Journal for FileJournal {
    fn append(&self, record: &JournalRecord) -> LoyaltyResult<()> {
        let payload = serde_json::to_string(record)?;
        let mut writer = self.writer.lock();
        let seq = writer.next_seq;
        let envelope = Envelope {
            seq,
            checksum: checksum(seq, &payload),
            payload,
        };
        let mut line = serde_json::to_vec(&envelope)?;
        line.push(b'\n');

        let mut written = writer.file.write_all(&line);
        if written.is_ok() {
            written = if self.sync_writes {
                writer.file.sync_data()
            } else {
                writer.file.flush()
            };
        }

        if let Err(e) = written {
            // Cut off whatever part of the line made it to disk.
            let len = writer.len;
            if let Err(truncate) = writer.file.set_len(len) {
                warn!(error = %truncate, "Failed to roll back partial journal write");
            }
            metrics::counter!("loyalty.journal.write_errors").increment(1);
            return Err(LoyaltyError::Journal(format!("append failed: {e}")));
        }

        writer.next_seq += 1;
        writer.len += line.len() as u64;
        metrics::counter!("loyalty.journal.records").increment(1);
        Ok(())
    }

    fn replay(&self) -> LoyaltyResult<Vec<JournalRecord>> {
        // Hold the writer lock so no append interleaves with the scan.
        let _writer = self.writer.lock();
        Ok(Self::scan(&self.path)?.records)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use storefront_core::loyalty::EntryKind;
    use tempfile::TempDir;

    fn record(id: u64) -> JournalRecord {
        JournalRecord::EntryAppended {
            entry: LedgerEntry {
                id,
                account_id: Uuid::new_v4(),
                kind: EntryKind::Earned,
                points: 10,
                description: "order".into(),
                reference_id: Some(format!("order-{id}")),
                expiration_date: None,
                idempotency_key: Some(format!("order:order-{id}")),
                created_at: Utc::now(),
            },
        }
    }

    #[test]
    fn test_memory_journal_round_trip() {
        let journal = MemoryJournal::new();
        journal.append(&record(1)).unwrap();
        journal.append(&record(2)).unwrap();
        assert_eq!(journal.len(), 2);
        assert_eq!(journal.replay().unwrap().len(), 2);
    }

    #[test]
    fn test_file_journal_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("loyalty.journal");

        let written = vec![record(1), record(2), record(3)];
        {
            let journal = FileJournal::open(&path, false).unwrap();
            for r in &written {
                journal.append(r).unwrap();
            }
        }

        let journal = FileJournal::open(&path, true).unwrap();
        assert_eq!(journal.replay().unwrap(), written);

        journal.append(&record(4)).unwrap();
        assert_eq!(journal.replay().unwrap().len(), 4);
    }

    #[test]
    fn test_torn_tail_is_dropped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("loyalty.journal");
        {
            let journal = FileJournal::open(&path, false).unwrap();
            journal.append(&record(1)).unwrap();
            journal.append(&record(2)).unwrap();
        }
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(br#"{"seq":3,"checksum":"ab"#).unwrap();
        }

        let journal = FileJournal::open(&path, false).unwrap();
        assert_eq!(journal.replay().unwrap().len(), 2);

        // Appends continue cleanly after the truncated tail.
        journal.append(&record(3)).unwrap();
        drop(journal);
        let journal = FileJournal::open(&path, false).unwrap();
        assert_eq!(journal.replay().unwrap().len(), 3);
    }

    #[test]
    fn test_corruption_is_detected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("loyalty.journal");
        {
            let journal = FileJournal::open(&path, false).unwrap();
            journal.append(&record(1)).unwrap();
            journal.append(&record(2)).unwrap();
        }

        let contents = std::fs::read_to_string(&path).unwrap();
        let tampered = contents.replacen(r#"\"points\":10"#, r#"\"points\":9000"#, 1);
        assert_ne!(contents, tampered);
        std::fs::write(&path, tampered).unwrap();

        assert!(matches!(
            FileJournal::open(&path, false),
            Err(LoyaltyError::Journal(_))
        ));
    }
}
