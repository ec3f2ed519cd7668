//! Paired-example dataset: JSON-lines loading, held-out carve, held-out file

use serde::Deserialize;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use pairtune_core::{Result, TuneError};

pub const HELD_OUT_FILE: &str = "val.jsonl";

/// One `{"input", "target"}` record and where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingPair {
    pub input: String,
    pub target: String,
    /// 1-based line number in the source file.
    pub line: usize,
    /// Source line exactly as read, for the held-out file.
    pub raw: String,
}

#[derive(Deserialize)]
struct RawPair {
    input: Option<serde_json::Value>,
    target: Option<serde_json::Value>,
}

impl TrainingPair {
    /// Parse one non-blank JSON line.
    pub fn parse(line: usize, raw: &str) -> Result<Self> {
        let malformed = |reason: String| TuneError::MalformedRecord { line, reason };

        let record: RawPair = serde_json::from_str(raw).map_err(|e| malformed(e.to_string()))?;
        let input = text_field(record.input, "input").map_err(malformed)?;
        let target = text_field(record.target, "target").map_err(malformed)?;

        Ok(Self {
            input,
            target,
            line,
            raw: raw.trim_end_matches(['\r', '\n']).to_string(),
        })
    }
}

fn text_field(value: Option<serde_json::Value>, name: &str) -> std::result::Result<String, String> {
    match value {
        None | Some(serde_json::Value::Null) => Err(format!("missing '{name}'")),
        Some(serde_json::Value::String(s)) if s.trim().is_empty() => Err(format!("empty '{name}'")),
        Some(serde_json::Value::String(s)) => Ok(s),
        Some(other) => Err(format!("'{name}' must be a string, got {other}")),
    }
}

/// Records read from disk, plus the lines that had to be skipped.
#[derive(Debug, Default)]
pub struct LoadedPairs {
    pub pairs: Vec<TrainingPair>,
    pub skipped: Vec<TuneError>,
}

/// Read every well-formed record of a JSON-lines file, in file order.
///
/// Blank lines are ignored. Malformed lines are skipped and returned in
/// `skipped`. `max_samples` caps the number of records kept.
pub fn load_pairs(path: &Path, max_samples: Option<usize>) -> Result<LoadedPairs> {
    if !path.is_file() {
        return Err(TuneError::DatasetMissing(path.to_path_buf()));
    }
    let reader = BufReader::new(std::fs::File::open(path)?);

    let mut loaded = LoadedPairs::default();
    for (idx, line) in reader.lines().enumerate() {
        if max_samples.is_some_and(|max| loaded.pairs.len() >= max) {
            break;
        }
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match TrainingPair::parse(idx + 1, &line) {
            Ok(pair) => loaded.pairs.push(pair),
            Err(err) if err.is_recoverable() => {
                tracing::debug!("skipping record: {}", err);
                loaded.skipped.push(err);
            }
            Err(err) => return Err(err),
        }
    }

    if loaded.pairs.is_empty() {
        return Err(TuneError::EmptyDataset { skipped: loaded.skipped.len() });
    }
    Ok(loaded)
}

/// Number of records held out: `max(1, floor(n * val_split))`, or 0 when
/// that would leave nothing to train on.
pub fn held_out_count(n: usize, val_split: f64) -> usize {
    let n_val = ((n as f64 * val_split).floor() as usize).max(1);
    if n_val >= n {
        0
    } else {
        n_val
    }
}

/// Split off the first `held_out_count` records. Returns `(held_out, train)`.
pub fn split_pairs(mut pairs: Vec<TrainingPair>, val_split: f64) -> (Vec<TrainingPair>, Vec<TrainingPair>) {
    let n_val = held_out_count(pairs.len(), val_split);
    let train = pairs.split_off(n_val);
    (pairs, train)
}

/// Where the held-out file lands: next to the dataset file.
pub fn held_out_path(dataset_path: &Path) -> PathBuf {
    match dataset_path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.join(HELD_OUT_FILE),
        _ => PathBuf::from(HELD_OUT_FILE),
    }
}

/// Write held-out records verbatim, one per line. An empty set still
/// produces an (empty) file.
pub fn write_held_out(held_out: &[TrainingPair], dataset_path: &Path) -> Result<PathBuf> {
    let path = held_out_path(dataset_path);
    let mut file = std::io::BufWriter::new(std::fs::File::create(&path)?);
    for pair in held_out {
        writeln!(file, "{}", pair.raw)?;
    }
    file.flush()?;
    Ok(path)
}
