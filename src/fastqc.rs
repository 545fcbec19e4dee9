//! FastQC invocation and report parsing.
//!
//! Reports are read from `<out>/<stem>_fastqc/fastqc_data.txt`. When only the
//! `<stem>_fastqc.zip` archive is present it is extracted first.

use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::KiraError;
use crate::fs_util;
use crate::process::{ProcessRunner, SlotPool, ToolCommand};

const REPORT_FILE: &str = "fastqc_data.txt";
const QUALITY_SCORES: usize = 50;

/// Summary of read quality for a sample.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Quality {
    pub count: u64,
    pub encoding: String,
    /// Shortest and longest read length.
    pub length: [u64; 2],
    pub gc: f64,
    /// Per position: mean, median, lower quartile, upper quartile,
    /// 10th percentile, 90th percentile.
    pub bases: Vec<[f64; 6]>,
    /// Per position: G, A, T, C percentages.
    pub composition: Vec<[f64; 4]>,
    /// Read counts indexed by mean sequence quality.
    pub sequences: Vec<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Basic,
    BaseQuality,
    SequenceQuality,
    Composition,
    Other,
}

pub fn fastqc_command(
    tool: &str,
    proc: usize,
    read_paths: &[Utf8PathBuf],
    out_dir: &Utf8Path,
) -> ToolCommand {
    ToolCommand::new(tool)
        .args(["-f", "fastq", "-o", out_dir.as_str(), "-t"])
        .arg(proc.to_string())
        .arg("--extract")
        .args(read_paths.iter().map(|path| path.as_str()))
        .slots(proc)
}

/// Runs FastQC over `read_paths`, holding `proc` slots while it runs.
/// Nothing is run for an empty read list.
pub fn run_fastqc(
    runner: &dyn ProcessRunner,
    slots: &SlotPool,
    tool: &str,
    proc: usize,
    read_paths: &[Utf8PathBuf],
    out_dir: &Utf8Path,
) -> Result<(), KiraError> {
    if read_paths.is_empty() {
        debug!(%out_dir, "no reads to check");
        return Ok(());
    }
    let command = fastqc_command(tool, proc, read_paths, out_dir);
    let _slots = slots.acquire(command.slots);
    runner.run(&command)?;
    Ok(())
}

/// Parses every report in `out_dir` (in file-name order) into one summary.
pub fn parse_fastqc(out_dir: &Utf8Path) -> Result<Quality, KiraError> {
    let reports = report_paths(out_dir)?;
    let mut merged: Option<Quality> = None;
    for path in reports {
        let content = fs::read_to_string(path.as_std_path())
            .map_err(|err| KiraError::fs(format!("read {path}: {err}")))?;
        let quality = parse_report(&content).map_err(|message| KiraError::QcParse {
            path: path.clone(),
            message,
        })?;
        merged = Some(match merged {
            Some(first) => merge(first, quality),
            None => quality,
        });
    }
    Ok(merged.unwrap_or_default())
}

fn report_paths(out_dir: &Utf8Path) -> Result<Vec<Utf8PathBuf>, KiraError> {
    let mut stems = Vec::new();
    let entries = fs::read_dir(out_dir.as_std_path())
        .map_err(|err| KiraError::fs(format!("read {out_dir}: {err}")))?;
    for entry in entries {
        let entry = entry.map_err(KiraError::fs)?;
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if let Some(stem) = name.strip_suffix(".zip") {
            if stem.ends_with("_fastqc") {
                let extracted = out_dir.join(stem);
                if !extracted.join(REPORT_FILE).as_std_path().exists() {
                    fs_util::extract_zip(&out_dir.join(&name), out_dir)?;
                }
                stems.push(stem.to_string());
            }
        } else if name.ends_with("_fastqc") && entry.path().is_dir() {
            stems.push(name);
        }
    }
    stems.sort();
    stems.dedup();
    Ok(stems
        .into_iter()
        .map(|stem| out_dir.join(stem).join(REPORT_FILE))
        .filter(|path| path.as_std_path().exists())
        .collect())
}

fn parse_report(content: &str) -> Result<Quality, String> {
    let mut quality = Quality {
        sequences: vec![0; QUALITY_SCORES],
        ..Quality::default()
    };
    let mut section = Section::Other;
    let mut saw_count = false;

    for (number, line) in content.lines().enumerate() {
        let line = line.trim_end();
        if let Some(header) = line.strip_prefix(">>") {
            section = match header.split('\t').next().unwrap_or_default() {
                "Basic Statistics" => Section::Basic,
                "Per base sequence quality" => Section::BaseQuality,
                "Per sequence quality scores" => Section::SequenceQuality,
                "Per base sequence content" => Section::Composition,
                _ => Section::Other,
            };
            continue;
        }
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        let at = |message: &str| format!("line {}: {message}", number + 1);

        match section {
            Section::Basic => match fields.as_slice() {
                ["Encoding", value, ..] => quality.encoding = value.trim().to_string(),
                ["Total Sequences", value, ..] => {
                    quality.count = value.trim().parse().map_err(|_| at("bad sequence count"))?;
                    saw_count = true;
                }
                ["Sequence length", value, ..] => {
                    quality.length = parse_length(value).ok_or_else(|| at("bad sequence length"))?;
                }
                ["%GC", value, ..] => {
                    quality.gc = value.trim().parse().map_err(|_| at("bad %GC"))?;
                }
                _ => {}
            },
            Section::BaseQuality => {
                let (span, values) =
                    parse_row::<6>(&fields).ok_or_else(|| at("bad base quality row"))?;
                let previous = quality.bases.last().copied();
                let row = fill_nan(values, previous);
                quality.bases.extend(std::iter::repeat_n(row, span));
            }
            Section::Composition => {
                let (span, values) =
                    parse_row::<4>(&fields).ok_or_else(|| at("bad composition row"))?;
                let previous = quality.composition.last().copied();
                let row = fill_nan(values, previous);
                quality.composition.extend(std::iter::repeat_n(row, span));
            }
            Section::SequenceQuality => {
                let [score, count, ..] = fields.as_slice() else {
                    return Err(at("bad sequence quality row"));
                };
                let score: usize = score.trim().parse().map_err(|_| at("bad quality score"))?;
                let count: f64 = count.trim().parse().map_err(|_| at("bad quality count"))?;
                if score >= quality.sequences.len() {
                    quality.sequences.resize(score + 1, 0);
                }
                quality.sequences[score] += count.round() as u64;
            }
            Section::Other => {}
        }
    }

    if !saw_count {
        return Err("missing Total Sequences".to_string());
    }
    Ok(quality)
}

fn parse_length(value: &str) -> Option<[u64; 2]> {
    let value = value.trim();
    match value.split_once('-') {
        Some((low, high)) => Some([low.trim().parse().ok()?, high.trim().parse().ok()?]),
        None => {
            let length = value.parse().ok()?;
            Some([length, length])
        }
    }
}

/// Returns how many positions the row covers (`10-14` covers 5) and its
/// values; unparseable cells become NaN.
fn parse_row<const N: usize>(fields: &[&str]) -> Option<(usize, [f64; N])> {
    let (position, cells) = fields.split_first()?;
    if cells.len() < N {
        return None;
    }
    let span = match position.split_once('-') {
        Some((start, end)) => {
            let start: usize = start.trim().parse().ok()?;
            let end: usize = end.trim().parse().ok()?;
            end.checked_sub(start)? + 1
        }
        None => {
            position.trim().parse::<usize>().ok()?;
            1
        }
    };
    let mut values = [f64::NAN; N];
    for (slot, cell) in values.iter_mut().zip(cells) {
        *slot = cell.trim().parse().unwrap_or(f64::NAN);
    }
    Some((span, values))
}

fn fill_nan<const N: usize>(mut values: [f64; N], previous: Option<[f64; N]>) -> [f64; N] {
    for (index, value) in values.iter_mut().enumerate() {
        if value.is_nan() {
            *value = previous.map(|row| row[index]).unwrap_or(0.0);
        }
    }
    values
}

/// Combines the read 1 and read 2 summaries of a paired sample.
fn merge(first: Quality, second: Quality) -> Quality {
    let mut sequences = first.sequences;
    if second.sequences.len() > sequences.len() {
        sequences.resize(second.sequences.len(), 0);
    }
    for (total, count) in sequences.iter_mut().zip(&second.sequences) {
        *total += count;
    }

    Quality {
        count: first.count,
        encoding: first.encoding,
        length: [
            first.length[0].min(second.length[0]),
            first.length[1].max(second.length[1]),
        ],
        gc: (first.gc + second.gc) / 2.0,
        bases: average_rows(first.bases, second.bases),
        composition: average_rows(first.composition, second.composition),
        sequences,
    }
}

fn average_rows<const N: usize>(first: Vec<[f64; N]>, second: Vec<[f64; N]>) -> Vec<[f64; N]> {
    let len = first.len().max(second.len());
    (0..len)
        .map(|index| match (first.get(index), second.get(index)) {
            (Some(a), Some(b)) => std::array::from_fn(|i| (a[i] + b[i]) / 2.0),
            (Some(row), None) | (None, Some(row)) => *row,
            (None, None) => [0.0; N],
        })
        .collect()
}
