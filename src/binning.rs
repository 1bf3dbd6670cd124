//! Binned scan over a snapshot.
//!
//! Consumers plot a signal normalised by an intensity monitor as a
//! function of a scan variable, split by laser on/off. Everything
//! here is a pure function of one snapshot.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::schema::Snapshot;

/// Which side of a bin edge a value exactly on the edge falls to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgePolicy {
    /// `edges[i-1] <= x < edges[i]`
    #[default]
    LowerInclusive,
    /// `edges[i-1] < x <= edges[i]`
    UpperInclusive,
}

/// Keeps events with `min < column < max`.
#[derive(Debug, Clone, Deserialize)]
pub struct RangeFilter {
    pub key: String,
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum BinningConfig {
    /// `count` evenly spaced edges, both ends included
    Count {
        count: usize,
        #[serde(default)]
        start: Option<f64>,
        #[serde(default)]
        stop: Option<f64>,
    },

    /// Edges every `width` from start, stop excluded
    Width {
        width: f64,
        #[serde(default)]
        start: Option<f64>,
        #[serde(default)]
        stop: Option<f64>,
    },

    /// Percentile edges, about `entries_per_bin` laser-on events per bin
    EqualEntries { entries_per_bin: usize },
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScanConfig {
    pub signal_key: String,

    /// `"nEntries"` normalises by event count
    #[serde(default = "default_i0_key")]
    pub i0_key: String,

    #[serde(default = "default_laser_key")]
    pub laser_key: String,

    #[serde(default = "default_scan_key")]
    pub scan_key: String,

    #[serde(default)]
    pub filters: Vec<RangeFilter>,

    pub bins: BinningConfig,

    #[serde(default)]
    pub edge_policy: EdgePolicy,
}

pub const COUNT_NORMALISATION: &str = "nEntries";

fn default_i0_key() -> String {
    COUNT_NORMALISATION.to_string()
}

fn default_laser_key() -> String {
    "lightStatus__laser".to_string()
}

fn default_scan_key() -> String {
    "delay".to_string()
}

#[derive(Debug, Error, PartialEq)]
pub enum BinningError {
    #[error("column {0} is missing or not scalar")]
    Column(String),

    #[error("column {key} has {found} entries, expected {expected}")]
    LengthMismatch {
        key: String,
        expected: usize,
        found: usize,
    },

    #[error("no events left after filtering")]
    Empty,

    #[error("invalid binning: {0}")]
    InvalidBins(String),
}

/// Per-bin result. Index `i` of every vector is digitize bin `i`,
/// so there are `edges.len() + 1` entries including the two
/// overflow bins.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanResult {
    pub edges: Vec<f64>,
    pub ratio_on: Vec<f64>,
    pub ratio_off: Vec<f64>,
    pub events_on: Vec<u64>,
    pub events_off: Vec<u64>,
}

/// AND of all range filters; non-finite values never pass.
pub fn filter_mask(
    snapshot: &Snapshot,
    filters: &[RangeFilter],
    len: usize,
) -> Result<Vec<bool>, BinningError> {
    let mut mask = vec![true; len];

    for f in filters {
        let column = column(snapshot, &f.key, len)?;
        for (keep, x) in mask.iter_mut().zip(column) {
            *keep &= x > f.min && x < f.max;
        }
    }

    Ok(mask)
}

pub fn linspace(start: f64, stop: f64, count: usize) -> Vec<f64> {
    match count {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (stop - start) / (count - 1) as f64;
            (0..count).map(|i| start + step * i as f64).collect()
        }
    }
}

/// Upper bound on generated bin edges.
pub const MAX_EDGES: usize = 1_000_000;

pub fn arange(start: f64, stop: f64, step: f64) -> Result<Vec<f64>, BinningError> {
    if step <= 0.0 || !step.is_finite() || stop <= start {
        return Ok(Vec::new());
    }
    let n = ((stop - start) / step).ceil();
    if !n.is_finite() || n > MAX_EDGES as f64 {
        return Err(BinningError::InvalidBins(format!(
            "width {} over [{}, {}) needs more than {} edges",
            step, start, stop, MAX_EDGES
        )));
    }
    Ok((0..n as usize).map(|i| start + step * i as f64).collect())
}

/// Percentile `q` (0..=100) of sorted data, linear interpolation.
pub fn percentile(sorted: &[f64], q: f64) -> Option<f64> {
    let last = sorted.len().checked_sub(1)?;
    let rank = q.clamp(0.0, 100.0) / 100.0 * last as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
}

/// Edges at `0, 100/n, 2*100/n, .. 100` percent of `values`, where
/// `n = values.len() / entries_per_bin`.
pub fn percentile_edges(values: &[f64], entries_per_bin: usize) -> Result<Vec<f64>, BinningError> {
    if entries_per_bin == 0 {
        return Err(BinningError::InvalidBins(
            "entries_per_bin must be positive".to_string(),
        ));
    }
    let bins = values.len() / entries_per_bin;
    if bins == 0 {
        return Err(BinningError::InvalidBins(format!(
            "{} events cannot fill a bin of {}",
            values.len(),
            entries_per_bin
        )));
    }

    let mut sorted: Vec<f64> = values.iter().copied().filter(|x| x.is_finite()).collect();
    sorted.sort_by(f64::total_cmp);

    let step = 100.0 / bins as f64;
    (0..=bins)
        .map(|i| percentile(&sorted, step * i as f64).ok_or(BinningError::Empty))
        .collect()
}

/// Bin index of `x` for monotonically increasing `edges`.
///
/// 0 below the first edge, `edges.len()` above the last.
pub fn digitize(x: f64, edges: &[f64], policy: EdgePolicy) -> usize {
    match policy {
        EdgePolicy::LowerInclusive => edges.partition_point(|e| *e <= x),
        EdgePolicy::UpperInclusive => edges.partition_point(|e| *e < x),
    }
}

/// Sum of `weights` per bin index, `bins` entries long.
pub fn weighted_bincount(indices: &[usize], weights: &[f64], bins: usize) -> Vec<f64> {
    let mut out = vec![0.0; bins];
    for (&i, &w) in indices.iter().zip(weights) {
        if let Some(slot) = out.get_mut(i) {
            *slot += w;
        }
    }
    out
}

fn column(snapshot: &Snapshot, key: &str, len: usize) -> Result<Vec<f64>, BinningError> {
    let values = snapshot
        .scalar_column(key)
        .ok_or_else(|| BinningError::Column(key.to_string()))?;

    if values.len() != len {
        return Err(BinningError::LengthMismatch {
            key: key.to_string(),
            expected: len,
            found: values.len(),
        });
    }
    Ok(values)
}

fn bounds(values: &[f64]) -> Option<(f64, f64)> {
    values
        .iter()
        .filter(|x| x.is_finite())
        .fold(None, |acc, &x| match acc {
            None => Some((x, x)),
            Some((lo, hi)) => Some((lo.min(x), hi.max(x))),
        })
}

/// Laser-split, normalised scan over one snapshot.
///
/// Both the on and off halves are digitized against the same edges
/// so their ratios line up bin for bin.
pub fn binned_scan(snapshot: &Snapshot, cfg: &ScanConfig) -> Result<ScanResult, BinningError> {
    let len = snapshot.len_of(&cfg.scan_key);
    let scan = column(snapshot, &cfg.scan_key, len)?;
    let signal = column(snapshot, &cfg.signal_key, len)?;
    let laser = column(snapshot, &cfg.laser_key, len)?;
    let i0 = if cfg.i0_key == COUNT_NORMALISATION {
        vec![1.0; len]
    } else {
        column(snapshot, &cfg.i0_key, len)?
    };

    let mask = filter_mask(snapshot, &cfg.filters, len)?;
    let selected: Vec<usize> = (0..len)
        .filter(|&i| mask[i] && scan[i].is_finite())
        .collect();
    if selected.is_empty() {
        return Err(BinningError::Empty);
    }

    let scan_sel: Vec<f64> = selected.iter().map(|&i| scan[i]).collect();
    let edges = match &cfg.bins {
        BinningConfig::Count { count, start, stop } => {
            let (lo, hi) = bounds(&scan_sel).ok_or(BinningError::Empty)?;
            if *count > MAX_EDGES {
                return Err(BinningError::InvalidBins(format!(
                    "{} edges requested, at most {}",
                    count, MAX_EDGES
                )));
            }
            linspace(start.unwrap_or(lo), stop.unwrap_or(hi), *count)
        }
        BinningConfig::Width { width, start, stop } => {
            let (lo, hi) = bounds(&scan_sel).ok_or(BinningError::Empty)?;
            arange(start.unwrap_or(lo), stop.unwrap_or(hi), *width)?
        }
        BinningConfig::EqualEntries { entries_per_bin } => {
            let on: Vec<f64> = selected
                .iter()
                .filter(|&&i| laser[i] > 0.0)
                .map(|&i| scan[i])
                .collect();
            percentile_edges(&on, *entries_per_bin)?
        }
    };
    if edges.is_empty() {
        return Err(BinningError::InvalidBins("no bin edges".to_string()));
    }

    let bins = edges.len() + 1;
    let (on, off): (Vec<usize>, Vec<usize>) =
        selected.iter().copied().partition(|&i| laser[i] > 0.0);

    let half = |rows: &[usize]| {
        let idx: Vec<usize> = rows
            .iter()
            .map(|&i| digitize(scan[i], &edges, cfg.edge_policy))
            .collect();
        let sig: Vec<f64> = rows.iter().map(|&i| signal[i]).collect();
        let norm: Vec<f64> = rows.iter().map(|&i| i0[i]).collect();

        let sig_sum = weighted_bincount(&idx, &sig, bins);
        let norm_sum = weighted_bincount(&idx, &norm, bins);
        let counts = weighted_bincount(&idx, &vec![1.0; idx.len()], bins);

        let ratio = sig_sum
            .iter()
            .zip(&norm_sum)
            .map(|(s, n)| if *n == 0.0 { f64::NAN } else { s / n })
            .collect::<Vec<_>>();
        (ratio, counts.into_iter().map(|c| c as u64).collect::<Vec<_>>())
    };

    let (ratio_on, events_on) = half(&on);
    let (ratio_off, events_off) = half(&off);

    Ok(ScanResult {
        edges,
        ratio_on,
        ratio_off,
        events_on,
        events_off,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::schema::{EventTime, Value};

    fn snapshot(columns: &[(&str, Vec<f64>)]) -> Snapshot {
        Snapshot {
            run_id: 1,
            columns: columns
                .iter()
                .map(|(k, v)| (k.to_string(), v.iter().map(|x| Value::Float(*x)).collect()))
                .collect::<BTreeMap<_, _>>(),
            batches_merged: 1,
            events_merged: columns.first().map_or(0, |c| c.1.len() as u64),
            taken_at: EventTime::new(0, 0),
        }
    }

    fn scan_cfg(bins: BinningConfig) -> ScanConfig {
        ScanConfig {
            signal_key: "sig".to_string(),
            i0_key: COUNT_NORMALISATION.to_string(),
            laser_key: "laser".to_string(),
            scan_key: "delay".to_string(),
            filters: Vec::new(),
            bins,
            edge_policy: EdgePolicy::LowerInclusive,
        }
    }

    #[test]
    fn digitize_respects_edge_policy() {
        let edges = [0.0, 1.0, 2.0];

        assert_eq!(digitize(-0.5, &edges, EdgePolicy::LowerInclusive), 0);
        assert_eq!(digitize(1.0, &edges, EdgePolicy::LowerInclusive), 2);
        assert_eq!(digitize(1.0, &edges, EdgePolicy::UpperInclusive), 1);
        assert_eq!(digitize(0.0, &edges, EdgePolicy::UpperInclusive), 0);
        assert_eq!(digitize(2.5, &edges, EdgePolicy::UpperInclusive), 3);
    }

    #[test]
    fn ranges() {
        assert_eq!(linspace(0.0, 1.0, 5), vec![0.0, 0.25, 0.5, 0.75, 1.0]);
        assert_eq!(arange(0.0, 1.0, 0.25).unwrap(), vec![0.0, 0.25, 0.5, 0.75]);
        assert!(arange(0.0, 1.0, 0.0).unwrap().is_empty());
    }

    #[test]
    fn tiny_width_is_rejected_before_allocating() {
        assert!(matches!(
            arange(0.0, 1.0, 1e-12),
            Err(BinningError::InvalidBins(_))
        ));

        let snap = snapshot(&[
            ("delay", vec![0.0, 1.0]),
            ("sig", vec![1.0, 1.0]),
            ("laser", vec![1.0, 1.0]),
        ]);
        let cfg = scan_cfg(BinningConfig::Width {
            width: 1e-300,
            start: None,
            stop: None,
        });
        assert!(matches!(
            binned_scan(&snap, &cfg),
            Err(BinningError::InvalidBins(_))
        ));
    }

    #[test]
    fn percentiles_interpolate() {
        let sorted = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(percentile(&sorted, 0.0), Some(1.0));
        assert_eq!(percentile(&sorted, 50.0), Some(2.5));
        assert_eq!(percentile(&sorted, 100.0), Some(4.0));
        assert_eq!(percentile(&[], 50.0), None);

        let values: Vec<f64> = (0..9).map(f64::from).collect();
        let edges = percentile_edges(&values, 3).unwrap();
        let expected = [0.0, 8.0 / 3.0, 16.0 / 3.0, 8.0];
        assert_eq!(edges.len(), expected.len());
        for (got, want) in edges.iter().zip(expected) {
            assert!((got - want).abs() < 1e-9, "{} != {}", got, want);
        }
        assert!(percentile_edges(&values, 10).is_err());
    }

    #[test]
    fn scan_splits_laser_and_normalises() {
        let snap = snapshot(&[
            ("delay", vec![0.1, 0.2, 1.1, 1.2, 0.1, 1.1]),
            ("sig", vec![2.0, 4.0, 6.0, 8.0, 1.0, 3.0]),
            ("laser", vec![1.0, 1.0, 1.0, 1.0, 0.0, 0.0]),
        ]);
        let cfg = scan_cfg(BinningConfig::Count {
            count: 3,
            start: Some(0.0),
            stop: Some(2.0),
        });

        let result = binned_scan(&snap, &cfg).unwrap();

        assert_eq!(result.edges, vec![0.0, 1.0, 2.0]);
        assert_eq!(result.events_on, vec![0, 2, 2, 0]);
        assert_eq!(result.ratio_on[1], 3.0);
        assert_eq!(result.ratio_on[2], 7.0);
        assert!(result.ratio_on[0].is_nan());
        assert_eq!(result.ratio_off[1], 1.0);
        assert_eq!(result.ratio_off[2], 3.0);
    }

    #[test]
    fn filters_are_exclusive() {
        let snap = snapshot(&[
            ("delay", vec![0.5, 0.5, 0.5]),
            ("sig", vec![1.0, 1.0, 1.0]),
            ("laser", vec![1.0, 1.0, 1.0]),
            ("ipm", vec![0.0, 0.5, 1.0]),
        ]);
        let mut cfg = scan_cfg(BinningConfig::Width {
            width: 1.0,
            start: Some(0.0),
            stop: Some(1.0),
        });
        cfg.filters.push(RangeFilter {
            key: "ipm".to_string(),
            min: 0.0,
            max: 1.0,
        });

        let result = binned_scan(&snap, &cfg).unwrap();
        assert_eq!(result.events_on.iter().sum::<u64>(), 1);
    }

    #[test]
    fn missing_or_short_columns_are_errors() {
        let cfg = scan_cfg(BinningConfig::EqualEntries { entries_per_bin: 1 });

        let snap = snapshot(&[("delay", vec![1.0]), ("laser", vec![1.0])]);
        assert_eq!(
            binned_scan(&snap, &cfg),
            Err(BinningError::Column("sig".to_string()))
        );

        let snap = snapshot(&[
            ("delay", vec![1.0, 2.0]),
            ("sig", vec![1.0]),
            ("laser", vec![1.0, 1.0]),
        ]);
        assert!(matches!(
            binned_scan(&snap, &cfg),
            Err(BinningError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn equal_entries_bins_use_laser_on_events() {
        let delay: Vec<f64> = (0..8).map(f64::from).collect();
        let laser = vec![1.0, 1.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0];
        let snap = snapshot(&[("delay", delay), ("sig", vec![1.0; 8]), ("laser", laser)]);

        let result = binned_scan(&snap, &scan_cfg(BinningConfig::EqualEntries { entries_per_bin: 2 }))
            .unwrap();

        assert_eq!(result.edges, vec![0.0, 1.5, 3.0]);
        assert_eq!(result.events_on, vec![0, 2, 1, 1]);
        assert_eq!(result.events_off, vec![0, 0, 0, 4]);
    }
}
