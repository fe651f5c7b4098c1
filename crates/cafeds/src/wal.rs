// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Write-ahead log for delivered orders.
//!
//! One `ORDER` record per line, appended in delivery order, fsynced before
//! the append returns. Recovery replays the file so a restarted node treats
//! its prior deliveries as already done.
//!
//! WAL failures are never fatal: a node with a broken disk keeps serving
//! from memory and logs the error.

use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use crate::proto::{self, Message, OrderRecord};

/// Append-only durable order log. `disabled()` yields a no-op instance.
#[derive(Debug)]
pub struct Wal {
    path: Option<PathBuf>,
}

/// State reconstructed from a WAL file at startup.
#[derive(Debug, Default)]
pub struct Recovered {
    /// Valid order records in file order. Later lines win on seq collisions
    /// once folded into history.
    pub records: Vec<OrderRecord>,
}

impl Recovered {
    /// Highest sequence number present in the recovered records.
    #[must_use]
    pub fn last_seq(&self) -> u64 {
        self.records.iter().map(|r| r.seq).max().unwrap_or(0)
    }
}

impl Wal {
    /// WAL backed by the given file. The file is created on first append.
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path: Some(path) }
    }

    /// No-op WAL for nodes running without disk persistence.
    #[must_use]
    pub fn disabled() -> Self {
        Self { path: None }
    }

    /// Durably append one delivered order. Errors are logged, not returned;
    /// delivery has already happened and is not rolled back.
    pub fn append(&self, record: &OrderRecord) {
        let Some(path) = &self.path else { return };
        if let Err(err) = append_record(path, record) {
            log::error!("[wal] append of seq={} failed: {}", record.seq, err);
        }
    }

    /// Replay the WAL file. A missing file is an empty log; invalid lines
    /// are skipped.
    #[must_use]
    pub fn recover(&self) -> Recovered {
        let Some(path) = &self.path else {
            return Recovered::default();
        };
        let file = match File::open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Recovered::default(),
            Err(err) => {
                log::error!("[wal] open {} failed: {}", path.display(), err);
                return Recovered::default();
            }
        };

        let mut recovered = Recovered::default();
        for line in BufReader::new(file).lines() {
            let Ok(line) = line else { break };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match proto::decode(line.as_bytes()) {
                Some(Message::Order(rec)) if rec.seq > 0 => recovered.records.push(rec),
                _ => log::debug!("[wal] skipping invalid line in {}", path.display()),
            }
        }
        log::info!(
            "[wal] recovered {} orders from {}, last_seq={}",
            recovered.records.len(),
            path.display(),
            recovered.last_seq()
        );
        recovered
    }
}

fn append_record(path: &Path, record: &OrderRecord) -> io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    let line = proto::encode_line(&Message::Order(record.clone()));
    file.write_all(&line)?;
    file.flush()?;
    file.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::text_payload;

    fn record(seq: u64, uuid: &str) -> OrderRecord {
        OrderRecord {
            leader_id: 10,
            epoch: 1,
            seq,
            order_uuid: uuid.to_string(),
            payload: text_payload("Espresso"),
            sender_id: Some(2),
        }
    }

    #[test]
    fn append_then_recover_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let wal = Wal::new(dir.path().join("wal.jsonl"));

        wal.append(&record(1, "a"));
        wal.append(&record(2, "b"));
        wal.append(&record(3, "c"));

        let recovered = wal.recover();
        assert_eq!(recovered.records.len(), 3);
        assert_eq!(recovered.last_seq(), 3);
        assert_eq!(recovered.records[1].order_uuid, "b");
    }

    #[test]
    fn recover_skips_corrupt_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("wal.jsonl");
        let wal = Wal::new(path.clone());
        wal.append(&record(1, "a"));
        std::fs::write(
            &path,
            [
                std::fs::read(&path).unwrap(),
                b"garbage line\n{\"type\":\"RESEND_REQUEST\",\"from_seq\":1}\n".to_vec(),
            ]
            .concat(),
        )
        .unwrap();
        wal.append(&record(2, "b"));

        let recovered = wal.recover();
        assert_eq!(recovered.records.len(), 2);
        assert_eq!(recovered.last_seq(), 2);
    }

    #[test]
    fn missing_file_recovers_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let wal = Wal::new(dir.path().join("never_written.jsonl"));
        let recovered = wal.recover();
        assert!(recovered.records.is_empty());
        assert_eq!(recovered.last_seq(), 0);
    }

    #[test]
    fn disabled_wal_is_a_no_op() {
        let wal = Wal::disabled();
        wal.append(&record(1, "a"));
        assert!(wal.recover().records.is_empty());
    }
}
