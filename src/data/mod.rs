//! Historical bar loading (CSV), dataset manifests and synthetic series.
//!
//! CSV layout: `ts,open,high,low,close,volume[,symbol]`, `ts` in epoch seconds.
//! Blank lines and `#` comments are ignored; an optional header row starting
//! with `ts,` is recognised. Rows that fail to parse or validate are counted
//! and reported rather than aborting the load.

use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{EngineError, Result};
use crate::events::Bar;
use crate::logging::Domain;

pub const EXPECTED_COLUMNS: [&str; 6] = ["ts", "open", "high", "low", "close", "volume"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gap {
    pub start_ts: i64,
    pub end_ts: i64,
    pub missing_bars: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatasetManifest {
    pub path: String,
    pub hash_sha256: String,
    pub row_count: u64,
    pub bad_rows: u64,
    pub ts_min: Option<i64>,
    pub ts_max: Option<i64>,
    pub interval_secs: i64,
    pub gaps: Vec<Gap>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct LoadedBars {
    pub bars: Vec<Bar>,
    pub manifest: DatasetManifest,
}

/// Parse one data row. The symbol column is optional; `default_symbol` is
/// used when it is missing or empty.
pub fn parse_csv_line(line: &str, default_symbol: &str) -> Result<Bar> {
    let parts: Vec<&str> = line.split(',').map(str::trim).collect();
    if parts.len() < EXPECTED_COLUMNS.len() {
        return Err(EngineError::validation(format!(
            "expected {}+ columns, got {}",
            EXPECTED_COLUMNS.len(),
            parts.len()
        )));
    }
    let num = |i: usize| -> Result<f64> {
        parts[i]
            .parse::<f64>()
            .map_err(|e| EngineError::validation(format!("bad {} '{}': {}", EXPECTED_COLUMNS[i], parts[i], e)))
    };
    let ts = parts[0]
        .parse::<i64>()
        .map_err(|e| EngineError::validation(format!("bad ts '{}': {}", parts[0], e)))?;
    let symbol = parts.get(6).filter(|s| !s.is_empty()).copied().unwrap_or(default_symbol);
    let bar = Bar::new(symbol, ts, num(1)?, num(2)?, num(3)?, num(4)?, num(5)?);
    bar.validate()?;
    Ok(bar)
}

/// Load a CSV file into bars sorted by timestamp, with a manifest describing
/// the file (hash, rows, gaps). `interval_secs` is the expected bar spacing
/// used for gap detection; 0 disables it.
pub fn load_csv(path: &Path, default_symbol: &str, interval_secs: i64) -> Result<LoadedBars> {
    let hash = file_sha256(path)?;
    let reader = BufReader::new(File::open(path)?);

    let mut bars = Vec::new();
    let mut bad_rows = 0u64;
    let mut warnings = Vec::new();
    let mut prev_ts: Option<i64> = None;
    let mut gaps = Vec::new();

    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.to_lowercase().starts_with("ts,") {
            continue;
        }
        match parse_csv_line(trimmed, default_symbol) {
            Ok(bar) => {
                if let Some(prev) = prev_ts {
                    if bar.ts <= prev {
                        warnings.push(format!("non_monotonic_ts: line {} prev={} current={}", lineno + 1, prev, bar.ts));
                    } else if interval_secs > 0 && bar.ts - prev > interval_secs {
                        gaps.push(Gap {
                            start_ts: prev,
                            end_ts: bar.ts,
                            missing_bars: (bar.ts - prev) / interval_secs - 1,
                        });
                    }
                }
                prev_ts = Some(bar.ts);
                bars.push(bar);
            }
            Err(e) => {
                bad_rows += 1;
                warnings.push(format!("bad_row: line {}: {}", lineno + 1, e));
            }
        }
    }

    bars.sort_by_key(|b| b.ts);
    if bad_rows > 0 {
        tracing::warn!(domain = Domain::Market.as_str(), path = %path.display(), bad_rows, "skipped malformed rows");
    }
    let manifest = DatasetManifest {
        path: path.display().to_string(),
        hash_sha256: hash,
        row_count: bars.len() as u64,
        bad_rows,
        ts_min: bars.first().map(|b| b.ts),
        ts_max: bars.last().map(|b| b.ts),
        interval_secs,
        gaps,
        warnings,
    };
    tracing::info!(
        domain = Domain::Market.as_str(),
        path = %manifest.path,
        rows = manifest.row_count,
        gaps = manifest.gaps.len(),
        "dataset loaded"
    );
    Ok(LoadedBars { bars, manifest })
}

pub fn file_sha256(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Seeded random-walk bars, for demos and tests. Same seed, same series.
pub fn synthetic_bars(symbol: &str, start_ts: i64, interval_secs: i64, count: usize, start_price: f64, seed: u64) -> Vec<Bar> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut price = start_price.max(1.0);
    let mut bars = Vec::with_capacity(count);
    for i in 0..count {
        let open = price;
        let drift: f64 = rng.gen_range(-0.01..0.01);
        let close = (open * (1.0 + drift)).max(0.01);
        let wick: f64 = rng.gen_range(0.0..0.004);
        let high = open.max(close) * (1.0 + wick);
        let low = open.min(close) * (1.0 - wick);
        let volume = rng.gen_range(1_000.0..10_000.0_f64).round();
        bars.push(Bar::new(symbol, start_ts + i as i64 * interval_secs, open, high, low, close, volume));
        price = close;
    }
    bars
}
