//! Checkpoint log
//!
//! Append-only, durable before-image log for steps whose outcome is not
//! yet confirmed in their home store. One causally-ordered log of
//! tagged entries rather than three independent lists, so a recovery
//! pass can replay strictly in append order.
//!
//! # Design Principles
//!
//! 1. **Append-Only**: appends and tombstones only; removal never
//!    rewrites history in place
//! 2. **Durable before risky**: `append` returns only after the record
//!    is flushed and synced
//! 3. **Value-match removal**: `remove_one` removes the first live
//!    entry equal by value, so duplicate entries from two operations
//!    are retired one at a time and never conflated
//!
//! Record framing is one line per record: `crc32,json`. Torn or
//! corrupt trailing lines are skipped with a warning on replay.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::models::{HistoryDraft, MoneyToken};

/// Which logical stream an entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointKind {
    Wallet,
    MoneyToken,
    History,
}

impl CheckpointKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointKind::Wallet => "wallet",
            CheckpointKind::MoneyToken => "money_token",
            CheckpointKind::History => "history",
        }
    }
}

/// A before-image owed to one of the ledger stores.
///
/// Equality is full value match; internal sequence numbers never
/// participate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CheckpointEntry {
    /// A balance delta owed to a wallet
    WalletDelta { user_id: u64, delta: i64 },
    /// A money token owed to the token store
    TokenSnapshot(MoneyToken),
    /// A history record owed to the history store
    HistorySnapshot(HistoryDraft),
}

impl CheckpointEntry {
    pub fn kind(&self) -> CheckpointKind {
        match self {
            CheckpointEntry::WalletDelta { .. } => CheckpointKind::Wallet,
            CheckpointEntry::TokenSnapshot(_) => CheckpointKind::MoneyToken,
            CheckpointEntry::HistorySnapshot(_) => CheckpointKind::History,
        }
    }
}

/// On-disk record: an entry append or a tombstone for one.
#[derive(Debug, Serialize, Deserialize)]
enum LogRecord {
    Append { seq: u64, entry: CheckpointEntry },
    Remove { seq: u64 },
}

/// Checkpoint log configuration
#[derive(Debug, Clone)]
pub struct CheckpointConfig {
    pub path: String,
    /// Tombstones accumulated before the file is compacted
    pub compact_after_tombstones: usize,
    /// Whether to sync to disk after every record
    pub sync_on_write: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            path: "data/checkpoint.log".to_string(),
            compact_after_tombstones: 1024,
            sync_on_write: true,
        }
    }
}

struct Inner {
    writer: BufWriter<File>,
    /// Live entries in append order
    live: Vec<(u64, CheckpointEntry)>,
    next_seq: u64,
    tombstones: usize,
}

/// Durable checkpoint log. Cheap to share behind an `Arc`; internal
/// access is serialized and the lock is never held across an await.
pub struct CheckpointLog {
    config: CheckpointConfig,
    inner: Mutex<Inner>,
    /// When set, appends fail as if the log device were down
    fail_appends: AtomicBool,
}

impl CheckpointLog {
    /// Open the log, replaying any existing file to rebuild the live set.
    pub fn open(config: CheckpointConfig) -> io::Result<Self> {
        if let Some(parent) = Path::new(&config.path).parent() {
            fs::create_dir_all(parent)?;
        }

        let (live, next_seq, tombstones) = Self::replay(&config.path)?;
        if !live.is_empty() {
            info!(
                outstanding = live.len(),
                path = %config.path,
                "Checkpoint log opened with outstanding entries"
            );
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.path)?;

        Ok(Self {
            config,
            inner: Mutex::new(Inner {
                writer: BufWriter::new(file),
                live,
                next_seq,
                tombstones,
            }),
            fail_appends: AtomicBool::new(false),
        })
    }

    fn replay(path: &str) -> io::Result<(Vec<(u64, CheckpointEntry)>, u64, usize)> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok((Vec::new(), 1, 0)); // Fresh log
            }
            Err(e) => return Err(e),
        };

        let mut live: Vec<(u64, CheckpointEntry)> = Vec::new();
        let mut next_seq = 1u64;
        let mut tombstones = 0usize;

        for (line_no, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            let Some(record) = Self::parse_line(&line) else {
                warn!(line = line_no + 1, "Skipping corrupt checkpoint record");
                continue;
            };
            match record {
                LogRecord::Append { seq, entry } => {
                    next_seq = next_seq.max(seq + 1);
                    live.push((seq, entry));
                }
                LogRecord::Remove { seq } => {
                    tombstones += 1;
                    live.retain(|(s, _)| *s != seq);
                }
            }
        }

        Ok((live, next_seq, tombstones))
    }

    fn parse_line(line: &str) -> Option<LogRecord> {
        let (crc_str, body) = line.split_once(',')?;
        let stored_crc = u32::from_str_radix(crc_str, 16).ok()?;
        if crc32fast::hash(body.as_bytes()) != stored_crc {
            return None;
        }
        serde_json::from_str(body).ok()
    }

    fn write_record(inner: &mut Inner, record: &LogRecord, sync: bool) -> io::Result<()> {
        let body = serde_json::to_string(record)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let crc = crc32fast::hash(body.as_bytes());
        writeln!(inner.writer, "{:08x},{}", crc, body)?;
        inner.writer.flush()?;
        if sync {
            inner.writer.get_ref().sync_data()?;
        }
        Ok(())
    }

    /// Force subsequent appends to fail, exercising log-down branches.
    pub fn set_fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }

    /// Append an entry. Durable on return.
    pub fn append(&self, entry: CheckpointEntry) -> io::Result<u64> {
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(io::Error::other("checkpoint append forced failure"));
        }
        let mut inner = self.inner.lock().unwrap();
        let seq = inner.next_seq;
        inner.next_seq += 1;

        let record = LogRecord::Append {
            seq,
            entry: entry.clone(),
        };
        Self::write_record(&mut inner, &record, self.config.sync_on_write)?;
        inner.live.push((seq, entry));

        debug!(seq, kind = ?record_kind(&record), "Checkpoint appended");
        Ok(seq)
    }

    /// Remove the first live entry equal to `entry` by value.
    ///
    /// Idempotent: returns false and writes nothing when no entry
    /// matches.
    pub fn remove_one(&self, entry: &CheckpointEntry) -> io::Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        let Some(pos) = inner.live.iter().position(|(_, e)| e == entry) else {
            return Ok(false);
        };
        let (seq, _) = inner.live[pos];

        Self::write_record(
            &mut inner,
            &LogRecord::Remove { seq },
            self.config.sync_on_write,
        )?;
        inner.live.remove(pos);
        inner.tombstones += 1;
        debug!(seq, "Checkpoint removed");

        if inner.tombstones >= self.config.compact_after_tombstones {
            self.compact(&mut inner)?;
        }
        Ok(true)
    }

    /// Live entries of one stream, in append order.
    pub fn list(&self, kind: CheckpointKind) -> Vec<CheckpointEntry> {
        self.inner
            .lock()
            .unwrap()
            .live
            .iter()
            .filter(|(_, e)| e.kind() == kind)
            .map(|(_, e)| e.clone())
            .collect()
    }

    /// All live entries in append (causal) order.
    pub fn list_all(&self) -> Vec<CheckpointEntry> {
        self.inner
            .lock()
            .unwrap()
            .live
            .iter()
            .map(|(_, e)| e.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rewrite the file with only live entries, dropping tombstones.
    fn compact(&self, inner: &mut Inner) -> io::Result<()> {
        let tmp_path = format!("{}.compact", self.config.path);
        {
            let file = File::create(&tmp_path)?;
            let mut writer = BufWriter::new(file);
            for (seq, entry) in &inner.live {
                let record = LogRecord::Append {
                    seq: *seq,
                    entry: entry.clone(),
                };
                let body = serde_json::to_string(&record)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                writeln!(writer, "{:08x},{}", crc32fast::hash(body.as_bytes()), body)?;
            }
            writer.flush()?;
            writer.get_ref().sync_data()?;
        }
        fs::rename(&tmp_path, &self.config.path)?;

        let file = OpenOptions::new().append(true).open(&self.config.path)?;
        inner.writer = BufWriter::new(file);
        let dropped = inner.tombstones;
        inner.tombstones = 0;
        info!(live = inner.live.len(), dropped, "Checkpoint log compacted");
        Ok(())
    }
}

fn record_kind(record: &LogRecord) -> Option<CheckpointKind> {
    match record {
        LogRecord::Append { entry, .. } => Some(entry.kind()),
        LogRecord::Remove { .. } => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn test_config(tag: &str) -> CheckpointConfig {
        CheckpointConfig {
            path: format!("target/test_checkpoint_{}_{}.log", tag, std::process::id()),
            compact_after_tombstones: 1024,
            sync_on_write: false,
        }
    }

    fn wallet_entry(user_id: u64, delta: i64) -> CheckpointEntry {
        CheckpointEntry::WalletDelta { user_id, delta }
    }

    #[test]
    fn test_append_remove_list() {
        let config = test_config("basic");
        let _ = fs::remove_file(&config.path);
        let log = CheckpointLog::open(config.clone()).unwrap();

        log.append(wallet_entry(1, 50)).unwrap();
        log.append(wallet_entry(2, -10)).unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log.list(CheckpointKind::Wallet).len(), 2);
        assert!(log.list(CheckpointKind::History).is_empty());

        assert!(log.remove_one(&wallet_entry(1, 50)).unwrap());
        assert_eq!(log.len(), 1);
        // Removing again is a no-op
        assert!(!log.remove_one(&wallet_entry(1, 50)).unwrap());

        let _ = fs::remove_file(&config.path);
    }

    #[test]
    fn test_duplicates_removed_one_at_a_time() {
        let config = test_config("dups");
        let _ = fs::remove_file(&config.path);
        let log = CheckpointLog::open(config.clone()).unwrap();

        // Two operations logged the same delta for the same user
        log.append(wallet_entry(7, 100)).unwrap();
        log.append(wallet_entry(7, 100)).unwrap();

        assert!(log.remove_one(&wallet_entry(7, 100)).unwrap());
        assert_eq!(log.len(), 1, "only one of the duplicates is retired");
        assert!(log.remove_one(&wallet_entry(7, 100)).unwrap());
        assert!(log.is_empty());

        let _ = fs::remove_file(&config.path);
    }

    #[test]
    fn test_reopen_replays_outstanding_entries() {
        let config = test_config("reopen");
        let _ = fs::remove_file(&config.path);

        {
            let log = CheckpointLog::open(config.clone()).unwrap();
            log.append(wallet_entry(1, 50)).unwrap();
            log.append(wallet_entry(2, 25)).unwrap();
            log.remove_one(&wallet_entry(1, 50)).unwrap();
        }

        // Crash-restart: only the unremoved entry survives
        let log = CheckpointLog::open(config.clone()).unwrap();
        assert_eq!(log.list_all(), vec![wallet_entry(2, 25)]);

        // Sequence numbers keep advancing after reopen
        log.append(wallet_entry(3, 10)).unwrap();
        assert_eq!(log.len(), 2);

        let _ = fs::remove_file(&config.path);
    }

    #[test]
    fn test_replay_skips_torn_tail() {
        let config = test_config("torn");
        let _ = fs::remove_file(&config.path);

        {
            let log = CheckpointLog::open(config.clone()).unwrap();
            log.append(wallet_entry(1, 50)).unwrap();
        }
        // Simulate a torn write
        let mut file = OpenOptions::new().append(true).open(&config.path).unwrap();
        write!(file, "deadbeef,{{\"Append\":{{\"seq\":9,\"ent").unwrap();
        drop(file);

        let log = CheckpointLog::open(config.clone()).unwrap();
        assert_eq!(log.list_all(), vec![wallet_entry(1, 50)]);

        let _ = fs::remove_file(&config.path);
    }

    #[test]
    fn test_compaction_preserves_live_set() {
        let mut config = test_config("compact");
        config.compact_after_tombstones = 4;
        let _ = fs::remove_file(&config.path);

        let log = CheckpointLog::open(config.clone()).unwrap();
        for i in 0..5 {
            log.append(wallet_entry(i, 10)).unwrap();
        }
        log.append(wallet_entry(99, 1)).unwrap();
        for i in 0..5 {
            log.remove_one(&wallet_entry(i, 10)).unwrap();
        }
        assert_eq!(log.list_all(), vec![wallet_entry(99, 1)]);
        drop(log);

        // The compacted file replays to the same live set
        let log = CheckpointLog::open(config.clone()).unwrap();
        assert_eq!(log.list_all(), vec![wallet_entry(99, 1)]);

        let _ = fs::remove_file(&config.path);
    }
}
