//! Synthetic sample lists for smoke runs

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use tracing::info;

#[derive(Args, Debug, Clone)]
pub struct GenListsArgs {
    /// Output directory for train.list / test.list
    #[arg(long, default_value = "data")]
    pub out: PathBuf,

    #[arg(long, default_value_t = 2048)]
    pub train: usize,

    #[arg(long, default_value_t = 256)]
    pub test: usize,

    /// Features per sample (left and right halves)
    #[arg(long, default_value_t = 8)]
    pub dim: usize,

    /// Standard deviation of the target noise
    #[arg(long, default_value_t = 0.05)]
    pub noise: f64,

    #[arg(long, default_value_t = 42)]
    pub seed: u64,
}

pub fn run(args: GenListsArgs) -> Result<()> {
    anyhow::ensure!(args.dim > 0, "--dim must be > 0");
    std::fs::create_dir_all(&args.out)
        .with_context(|| format!("Failed to create {}", args.out.display()))?;

    let mut rng = StdRng::seed_from_u64(args.seed);
    let coeffs: Vec<f64> = (0..args.dim).map(|_| rng.gen_range(-1.0..1.0)).collect();
    let noise = Normal::new(0.0, args.noise)
        .map_err(|e| anyhow::anyhow!("Invalid noise level {}: {}", args.noise, e))?;

    let train_path = args.out.join("train.list");
    let test_path = args.out.join("test.list");
    write_list(&train_path, args.train, &coeffs, &noise, &mut rng)?;
    write_list(&test_path, args.test, &coeffs, &noise, &mut rng)?;

    info!(
        "Wrote {} training and {} test samples ({} features) to {}",
        args.train,
        args.test,
        args.dim,
        args.out.display()
    );
    Ok(())
}

fn write_list(
    path: &Path,
    count: usize,
    coeffs: &[f64],
    noise: &Normal<f64>,
    rng: &mut StdRng,
) -> Result<()> {
    let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    let mut out = BufWriter::new(file);
    writeln!(out, "# target confidence features...")?;
    for _ in 0..count {
        let features: Vec<f64> = coeffs.iter().map(|_| rng.gen_range(-1.0..1.0)).collect();
        let target: f64 = coeffs.iter().zip(&features).map(|(c, x)| c * x).sum::<f64>()
            + noise.sample(rng);
        let confidence: u8 = rng.gen();
        write!(out, "{:.6} {}", target, confidence)?;
        for x in &features {
            write!(out, " {:.6}", x)?;
        }
        writeln!(out)?;
    }
    out.flush()?;
    Ok(())
}
