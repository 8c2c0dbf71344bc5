//! Sample lists - `<target> <confidence> <f1> ... <fD>` per line

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rayon::prelude::*;
use tracing::info;

use disp_engine::Batch;

#[derive(Clone, Debug, PartialEq)]
pub struct Sample {
    pub target: f32,
    pub confidence: f32,
    pub features: Vec<f32>,
}

/// In-memory sample list shared read-only with the feed threads.
#[derive(Debug)]
pub struct Dataset {
    samples: Vec<Sample>,
    dim: usize,
    source: Option<PathBuf>,
}

impl Dataset {
    pub fn from_samples(samples: Vec<Sample>) -> Result<Self> {
        let dim = samples
            .first()
            .map(|s| s.features.len())
            .ok_or_else(|| anyhow::anyhow!("Sample list is empty"))?;
        anyhow::ensure!(dim > 0, "Samples have no features");
        if let Some((i, s)) = samples.iter().enumerate().find(|(_, s)| s.features.len() != dim) {
            anyhow::bail!(
                "Sample {} has {} features, expected {}",
                i,
                s.features.len(),
                dim
            );
        }
        Ok(Self {
            samples,
            dim,
            source: None,
        })
    }

    /// Parses a list file. Blank lines and `#` comments are skipped; any other
    /// malformed line fails the whole list.
    pub fn from_list(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read list file {}", path.display()))?;
        let lines: Vec<&str> = text.lines().collect();

        let parsed = lines
            .par_iter()
            .enumerate()
            .map(|(i, line)| {
                parse_line(line).with_context(|| format!("{}:{}", path.display(), i + 1))
            })
            .collect::<Result<Vec<Option<Sample>>>>()?;
        let samples: Vec<Sample> = parsed.into_iter().flatten().collect();

        let mut dataset = Self::from_samples(samples)
            .with_context(|| format!("Invalid list file {}", path.display()))?;
        dataset.source = Some(path.to_path_buf());
        info!(
            "Loaded {} samples ({} features) from {}",
            dataset.len(),
            dataset.dim,
            path.display()
        );
        Ok(dataset)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Stacks the samples at `indices` into one batch.
    pub fn gather(&self, indices: &[usize]) -> Result<Batch> {
        let mut features = Vec::with_capacity(indices.len() * self.dim);
        let mut targets = Vec::with_capacity(indices.len());
        let mut confidences = Vec::with_capacity(indices.len());
        for &i in indices {
            let sample = self
                .samples
                .get(i)
                .ok_or_else(|| anyhow::anyhow!("Sample index {} out of range", i))?;
            features.extend_from_slice(&sample.features);
            targets.push(sample.target);
            confidences.push(sample.confidence);
        }
        Batch::new(features, targets, confidences, self.dim)
    }
}

fn parse_line(line: &str) -> Result<Option<Sample>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let values = line
        .split_whitespace()
        .map(|tok| {
            tok.parse::<f32>()
                .map_err(|e| anyhow::anyhow!("invalid number '{}': {}", tok, e))
        })
        .collect::<Result<Vec<f32>>>()?;
    anyhow::ensure!(
        values.len() >= 3,
        "expected '<target> <confidence> <features...>', got {} values",
        values.len()
    );
    anyhow::ensure!(
        values.iter().all(|v| v.is_finite()),
        "non-finite value in sample"
    );
    Ok(Some(Sample {
        target: values[0],
        confidence: values[1],
        features: values[2..].to_vec(),
    }))
}
