//! Linear clock synchronization between two pulse trains.
//!
//! Two devices record the same physical pulse edges on their own clocks.
//! Pairing the trains by index and fitting a line gives a mapping from
//! one clock to the other; the slope's deviation from one is the relative
//! drift in parts per million.

use crate::{rlog_warn, Error, Result};

/// An affine mapping from a source clock to a target clock.
#[derive(Debug, Clone, PartialEq)]
pub struct ClockMapping {
    pub slope: f64,
    pub intercept: f64,
    /// Index pairs (source, target) over the trains' common prefix.
    /// This is the full pairing the fit started from; the slope and
    /// intercept come from a refit over the best-fitting subset.
    pub matched: Vec<(usize, usize)>,
}

impl ClockMapping {
    pub fn map(&self, t: f64) -> f64 {
        self.slope * t + self.intercept
    }

    pub fn map_all(&self, times: &[f64]) -> Vec<f64> {
        times.iter().map(|&t| self.map(t)).collect()
    }

    /// Relative clock drift in parts per million.
    pub fn drift_ppm(&self) -> f64 {
        (self.slope - 1.0) * 1e6
    }

    /// A valid mapping must keep increasing timestamps increasing. A
    /// violation means the fit is unusable and is surfaced, never
    /// silently repaired.
    pub fn check_monotonic(&self, times: &[f64]) -> Result<()> {
        let mapped = self.map_all(times);
        for window in mapped.windows(2) {
            if window[1] <= window[0] {
                return Err(Error::Synchronization(format!(
                    "mapped timestamps not strictly increasing ({} -> {})",
                    window[0], window[1]
                )));
            }
        }
        Ok(())
    }
}

/// Fit a clock mapping between two pulse trains with zero tolerance on
/// the pulse count difference.
pub fn sync_timestamps(a: &[f64], b: &[f64]) -> Result<ClockMapping> {
    sync_timestamps_with(a, b, 0)
}

/// Fit a clock mapping, allowing the pulse counts to differ by at most
/// `tolerance` (extra pulses beyond the common prefix are dropped).
pub fn sync_timestamps_with(a: &[f64], b: &[f64], tolerance: usize) -> Result<ClockMapping> {
    let diff = a.len().abs_diff(b.len());
    if diff > tolerance {
        return Err(Error::Synchronization(format!(
            "pulse count mismatch: {} vs {} (tolerance {})",
            a.len(),
            b.len(),
            tolerance
        )));
    }
    let n = a.len().min(b.len());
    if n < 2 {
        return Err(Error::Synchronization(format!(
            "need at least 2 common pulses to fit a clock, got {}",
            n
        )));
    }
    if diff > 0 {
        rlog_warn!("pulse count mismatch within tolerance: {} vs {}", a.len(), b.len());
    }

    let matched: Vec<(usize, usize)> = (0..n).map(|i| (i, i)).collect();
    let (slope, intercept) = least_squares(&a[..n], &b[..n])?;

    // One robustness pass: drop the worst-fitting quartile of pairs and
    // refit, which shields the fit against a few misassigned pulses.
    let mut residuals: Vec<(usize, f64)> = (0..n)
        .map(|i| (i, (slope * a[i] + intercept - b[i]).abs()))
        .collect();
    residuals.sort_by(|x, y| x.1.total_cmp(&y.1));
    let keep = (n * 3 / 4).max(2);
    let kept: Vec<usize> = residuals[..keep].iter().map(|(i, _)| *i).collect();
    let xs: Vec<f64> = kept.iter().map(|&i| a[i]).collect();
    let ys: Vec<f64> = kept.iter().map(|&i| b[i]).collect();
    let (slope, intercept) = least_squares(&xs, &ys)?;

    Ok(ClockMapping {
        slope,
        intercept,
        matched,
    })
}

fn least_squares(xs: &[f64], ys: &[f64]) -> Result<(f64, f64)> {
    let n = xs.len() as f64;
    let mean_x = xs.iter().sum::<f64>() / n;
    let mean_y = ys.iter().sum::<f64>() / n;
    let mut sxx = 0.0;
    let mut sxy = 0.0;
    for (&x, &y) in xs.iter().zip(ys) {
        sxx += (x - mean_x) * (x - mean_x);
        sxy += (x - mean_x) * (y - mean_y);
    }
    if sxx == 0.0 {
        return Err(Error::Synchronization(
            "degenerate pulse train: all timestamps identical".to_string(),
        ));
    }
    let slope = sxy / sxx;
    Ok((slope, mean_y - slope * mean_x))
}
