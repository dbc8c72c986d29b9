//! Sub-window estimation for range-sum style queries.
//!
//! A query interval usually covers a run of whole summary windows plus a
//! partial overlap with the first and last. Whole windows contribute their
//! aggregate exactly; partial windows contribute a fraction proportional to
//! the overlap, with a variance term for the unknown placement of mass
//! inside the window. Landmark points inside the interval are exact.

use crate::agg::{DataTable, LandmarkWindow, SummaryWindow};

/// Hard lower/upper bounds on the queried aggregate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    /// Smallest value consistent with the windows seen.
    pub lower: f64,
    /// Largest value consistent with the windows seen.
    pub upper: f64,
}

/// First two moments of the estimate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Moments {
    /// Expected value of the aggregate.
    pub mean: f64,
    /// Variance of the estimate.
    pub var: f64,
}

/// A confidence interval around the estimate, clamped to the hard bounds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ci {
    /// Point estimate.
    pub mean: f64,
    /// Lower end of the interval.
    pub lower: f64,
    /// Upper end of the interval.
    pub upper: f64,
}

fn window_length(l: i64, r: i64) -> i64 {
    r - l + 1
}

fn window_overlap(l1: i64, r1: i64, l2: i64, r2: i64) -> i64 {
    (r1.min(r2) - l1.max(l2) + 1).max(0)
}

struct WindowInfo {
    start: i64,
    end: i64,
    sum: f64,
    overlap: i64,
    length: i64,
}

impl WindowInfo {
    fn new() -> Self {
        Self {
            start: 0,
            end: 0,
            sum: 0.0,
            overlap: 1,
            length: 1,
        }
    }

    fn set_values(&mut self, window: &SummaryWindow, value: f64) {
        self.start = window.time_start;
        self.end = window.time_end;
        self.sum = value;
    }

    fn set_length_and_overlap(&mut self, t0: i64, t1: i64) {
        self.overlap = window_overlap(self.start, self.end, t0, t1);
        self.length = window_length(self.start, self.end);
    }
}

fn update_estimate(bounds: &mut Bounds, moments: &mut Moments, info: &WindowInfo) {
    bounds.upper += info.sum;
    if info.overlap == info.length {
        bounds.lower += info.sum;
    }
    if info.overlap > 0 {
        let ratio = info.overlap as f64 / info.length as f64;
        moments.mean += info.sum * ratio;
        moments.var += info.sum * ratio * (1.0 - ratio);
    }
}

/// Estimates a sum-like aggregate over `[t0, t1]`.
///
/// `window_value` extracts the operator's scalar from a window's data table;
/// `landmark_value` maps one exactly-retained point to its contribution
/// (1 for count, the value itself for sum).
pub fn sum_stats(
    t0: i64,
    t1: i64,
    windows: &[SummaryWindow],
    landmarks: &[LandmarkWindow],
    window_value: impl Fn(&DataTable) -> f64,
    landmark_value: impl Fn(f64) -> f64,
) -> (Bounds, Moments) {
    let mut first = WindowInfo::new();
    let mut middle = WindowInfo::new();
    let mut last = WindowInfo::new();
    let mut landmark_info = WindowInfo::new();

    let mut total = 0.0;
    for (i, window) in windows.iter().enumerate() {
        let value = window_value(&window.data);
        if i == 0 {
            first.set_values(window, value);
        }
        if i == windows.len() - 1 {
            last.set_values(window, value);
        }
        total += value;
    }
    if windows.len() == 1 {
        last.sum = 0.0;
    }
    middle.sum = total - (first.sum + last.sum);

    first.set_length_and_overlap(t0, t1);
    last.set_length_and_overlap(t0, t1);

    for window in landmarks {
        // Ranges doubly covered by a landmark are served from it exactly, so
        // the decayed first/last windows shrink by the covered span. Middle
        // windows need no correction: their landmark-covered mass lies
        // entirely inside [t0, t1].
        first.length -= window_overlap(window.time_start, window.time_end, first.start, first.end);
        first.overlap -= window_overlap(window.time_start, window.time_end, t0, first.end);
        last.length -= window_overlap(window.time_start, window.time_end, last.start, last.end);
        last.overlap -= window_overlap(window.time_start, window.time_end, last.start, t1);

        for landmark in &window.landmarks {
            if t0 <= landmark.timestamp && landmark.timestamp <= t1 {
                landmark_info.sum += landmark_value(landmark.value);
            }
        }
    }

    let mut bounds = Bounds {
        lower: 0.0,
        upper: 0.0,
    };
    let mut moments = Moments {
        mean: 0.0,
        var: 0.0,
    };

    update_estimate(&mut bounds, &mut moments, &landmark_info);
    update_estimate(&mut bounds, &mut moments, &first);
    update_estimate(&mut bounds, &mut moments, &middle);
    update_estimate(&mut bounds, &mut moments, &last);

    (bounds, moments)
}

/// Converts bounds and moments into a confidence interval.
pub fn bounds_to_ci(bounds: &Bounds, moments: &Moments, sd_multiplier: f64, confidence: f64) -> Ci {
    let probability = (1.0 + confidence) / 2.0;
    let z = inv_cdf(probability);
    if z.is_infinite() {
        Ci {
            mean: moments.mean,
            lower: bounds.lower,
            upper: bounds.upper,
        }
    } else {
        let sd = sd_multiplier * moments.var.sqrt();
        Ci {
            mean: moments.mean,
            lower: (moments.mean - z * sd).max(bounds.lower),
            upper: (moments.mean + z * sd).min(bounds.upper),
        }
    }
}

/// Inverse CDF of the standard normal distribution (Acklam's rational
/// approximation, |relative error| < 1.15e-9).
fn inv_cdf(p: f64) -> f64 {
    const A: [f64; 6] = [
        -3.969683028665376e+01,
        2.209460984245205e+02,
        -2.759285104469687e+02,
        1.383577518672690e+02,
        -3.066479806614716e+01,
        2.506628277459239e+00,
    ];
    const B: [f64; 5] = [
        -5.447609879822406e+01,
        1.615858368580409e+02,
        -1.556989798598866e+02,
        6.680131188771972e+01,
        -1.328068155288572e+01,
    ];
    const C: [f64; 6] = [
        -7.784894002430293e-03,
        -3.223964580411365e-01,
        -2.400758277161838e+00,
        -2.549732539343734e+00,
        4.374664141464968e+00,
        2.938163982698783e+00,
    ];
    const D: [f64; 4] = [
        7.784695709041462e-03,
        3.224671290700398e-01,
        2.445134137142996e+00,
        3.754408661907416e+00,
    ];
    const P_LOW: f64 = 0.02425;

    if p <= 0.0 {
        return f64::NEG_INFINITY;
    }
    if p >= 1.0 {
        return f64::INFINITY;
    }

    if p < P_LOW {
        let q = (-2.0 * p.ln()).sqrt();
        (((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    } else if p <= 1.0 - P_LOW {
        let q = p - 0.5;
        let r = q * q;
        (((((A[0] * r + A[1]) * r + A[2]) * r + A[3]) * r + A[4]) * r + A[5]) * q
            / (((((B[0] * r + B[1]) * r + B[2]) * r + B[3]) * r + B[4]) * r + 1.0)
    } else {
        let q = (-2.0 * (1.0 - p).ln()).sqrt();
        -(((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inv_cdf_reference_points() {
        assert!((inv_cdf(0.5)).abs() < 1e-9);
        assert!((inv_cdf(0.975) - 1.959964).abs() < 1e-5);
        assert!((inv_cdf(0.025) + 1.959964).abs() < 1e-5);
        assert!(inv_cdf(1.0).is_infinite());
        assert!(inv_cdf(0.0).is_infinite());
    }

    #[test]
    fn test_full_overlap_is_exact() {
        let mut windows = Vec::new();
        for i in 0..4i64 {
            let mut w = SummaryWindow::new(i * 10, (i + 1) * 10 - 1, i * 10, (i + 1) * 10 - 1);
            w.data.sum = 100.0;
            windows.push(w);
        }
        let (bounds, moments) = sum_stats(0, 39, &windows, &[], |d| d.sum, |v| v);
        assert_eq!(moments.mean, 400.0);
        assert_eq!(moments.var, 0.0);
        assert_eq!(bounds.lower, 400.0);
        assert_eq!(bounds.upper, 400.0);

        let ci = bounds_to_ci(&bounds, &moments, 1.0, 0.95);
        assert_eq!(ci.upper - ci.lower, 0.0);
    }

    #[test]
    fn test_partial_overlap_widens_interval() {
        let mut w0 = SummaryWindow::new(0, 9, 0, 9);
        w0.data.sum = 100.0;
        let mut w1 = SummaryWindow::new(10, 19, 10, 19);
        w1.data.sum = 100.0;
        let (bounds, moments) = sum_stats(5, 19, &[w0, w1], &[], |d| d.sum, |v| v);
        // Half of the first window is in range.
        assert_eq!(moments.mean, 150.0);
        assert!(moments.var > 0.0);
        assert_eq!(bounds.lower, 100.0);
        assert_eq!(bounds.upper, 200.0);
    }

    #[test]
    fn test_landmark_points_count_exactly() {
        let mut lw = LandmarkWindow::new(100);
        lw.insert(101, 5.0);
        lw.insert(102, 7.0);
        lw.insert(110, 9.0);
        lw.close(111);
        let (bounds, moments) = sum_stats(0, 105, &[], &[lw], |d| d.sum, |v| v);
        assert_eq!(moments.mean, 12.0);
        assert_eq!(bounds.lower, 12.0);
        assert_eq!(bounds.upper, 12.0);
    }
}
