use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use core_types::{DecisionRecord, RecordSource, RecordWindow, Snapshot, SnapshotSource};
use serde::de::DeserializeOwned;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

/// Reads one JSON value per line. Blank lines are ignored; lines that fail
/// to decode are skipped and counted.
pub async fn load_jsonl<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<(Vec<T>, usize)> {
    let path = path.as_ref();
    let file = File::open(path)
        .await
        .with_context(|| format!("open jsonl file {}", path.display()))?;
    let mut lines = BufReader::new(file).lines();
    let mut out = Vec::new();
    let mut malformed = 0usize;
    let mut line_no = 0usize;
    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<T>(&line) {
            Ok(v) => out.push(v),
            Err(err) => {
                malformed += 1;
                tracing::warn!(path = %path.display(), line = line_no, %err, "skipping malformed jsonl line");
            }
        }
    }
    Ok((out, malformed))
}

pub struct JsonlRecordSource {
    path: PathBuf,
}

impl JsonlRecordSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl RecordSource for JsonlRecordSource {
    async fn load_window(&self) -> Result<RecordWindow> {
        let (records, malformed) = load_jsonl::<DecisionRecord>(&self.path).await?;
        tracing::debug!(
            path = %self.path.display(),
            records = records.len(),
            malformed,
            "decision records loaded"
        );
        Ok(RecordWindow { records, malformed })
    }
}

pub struct JsonlSnapshotSource {
    path: PathBuf,
}

impl JsonlSnapshotSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SnapshotSource for JsonlSnapshotSource {
    async fn load_snapshots(&self) -> Result<Vec<Snapshot>> {
        let (snapshots, malformed) = load_jsonl::<Snapshot>(&self.path).await?;
        if malformed > 0 {
            tracing::warn!(path = %self.path.display(), malformed, "malformed snapshots skipped");
        }
        Ok(snapshots)
    }
}

/// Append-only JSONL sink for resolved decision records.
pub struct JsonlRecordWriter {
    file: File,
}

impl JsonlRecordWriter {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .context("create record dir")?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .context("open record file")?;
        Ok(Self { file })
    }

    pub async fn write(&mut self, record: &DecisionRecord) -> Result<()> {
        let line = serde_json::to_string(record).context("encode record")?;
        self.file.write_all(line.as_bytes()).await?;
        self.file.write_all(b"\n").await?;
        self.file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use core_types::{Market, Outcome};
    use std::collections::BTreeMap;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("replay_engine_{}_{name}", std::process::id()))
    }

    #[tokio::test]
    async fn record_roundtrip_counts_malformed_lines() {
        let path = temp_path("records.jsonl");
        let _ = tokio::fs::remove_file(&path).await;
        let mut writer = JsonlRecordWriter::open(&path).await.expect("open writer");
        writer
            .write(&DecisionRecord {
                run_id: 1,
                created_at: Utc.with_ymd_and_hms(2025, 5, 1, 0, 0, 0).unwrap(),
                match_id: "m1".to_string(),
                market_outcomes: BTreeMap::from([(Market::OneXTwo, Outcome::Success)]),
                reason_codes_by_market: BTreeMap::new(),
                predictions: vec![],
            })
            .await
            .expect("write");
        drop(writer);

        let mut raw = tokio::fs::read_to_string(&path).await.expect("read");
        raw.push_str("{not json}\n\n");
        tokio::fs::write(&path, raw).await.expect("rewrite");

        let window = JsonlRecordSource::new(&path)
            .load_window()
            .await
            .expect("load");
        assert_eq!(window.records.len(), 1);
        assert_eq!(window.malformed, 1);
        assert_eq!(window.records[0].outcome(Market::OneXTwo), Outcome::Success);
        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn snapshots_decode_with_evidence() {
        let path = temp_path("snapshots.jsonl");
        tokio::fs::write(
            &path,
            "{\"snapshot_id\":\"s1\",\"evidence\":{\"markets\":{}}}\n{\"snapshot_id\":\"s2\"}\n",
        )
        .await
        .expect("write");
        let snapshots = JsonlSnapshotSource::new(&path)
            .load_snapshots()
            .await
            .expect("load");
        assert_eq!(snapshots.len(), 2);
        assert!(snapshots[1].evidence.is_null());
        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        let err = JsonlRecordSource::new(temp_path("absent.jsonl"))
            .load_window()
            .await
            .expect_err("missing file");
        assert!(err.to_string().contains("open jsonl file"));
    }
}
