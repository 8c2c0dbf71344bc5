//! Summary stream - step-keyed JSON lines under the checkpoint directory

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use disp_engine::Summary;

pub const SUMMARY_FILE: &str = "events.jsonl";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryRecord {
    pub step: u64,
    /// Seconds since the Unix epoch.
    pub wall_time: f64,
    pub scalars: BTreeMap<String, f64>,
}

pub struct SummaryWriter {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl SummaryWriter {
    /// Appends to `<dir>/events.jsonl`, so a resumed run extends the same stream.
    pub fn create(dir: &Path) -> Result<Self> {
        let path = dir.join(SUMMARY_FILE);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open summary stream {}", path.display()))?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn add_summary(&mut self, summary: &Summary, step: u64) -> Result<()> {
        let wall_time = chrono::Utc::now().timestamp_millis() as f64 / 1000.0;
        let record = SummaryRecord {
            step,
            wall_time,
            scalars: summary.scalars.clone(),
        };
        serde_json::to_writer(&mut self.writer, &record)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Reads every record of a summary stream.
pub fn read_summaries(path: &Path) -> Result<Vec<SummaryRecord>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read summary stream {}", path.display()))?;
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str::<SummaryRecord>(line).map_err(anyhow::Error::from))
        .collect()
}
