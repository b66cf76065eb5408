//! Rate-of-rise: trailing-window linear regression of bean temperature.

use crate::{Sample, ROR_WINDOW_SEC};

// Guards the near-cancelled OLS denominator of a degenerate window.
const DENOM_EPS: f64 = 1e-9;

/// Compute the °C/min slope series, index-aligned with `samples`.
///
/// The window holds every sample whose time lies in `[t - 30, t]`; both ends
/// advance monotonically, so the running regression sums make the whole pass
/// O(n). Entries stay `None` until the first positive slope has been seen
/// (the pre-heating latch) and for windows that are too small or degenerate.
pub fn compute_ror(samples: &[Sample]) -> Vec<Option<f64>> {
    let mut out = vec![None; samples.len()];
    let mut start = 0usize;
    let mut n = 0.0f64;
    let mut sum_t = 0.0f64;
    let mut sum_bt = 0.0f64;
    let mut sum_tt = 0.0f64;
    let mut sum_tbt = 0.0f64;
    // One-way: flips on the first positive slope and stays set for the pass.
    let mut latched = false;

    for (i, sample) in samples.iter().enumerate() {
        n += 1.0;
        sum_t += sample.t;
        sum_bt += sample.bt;
        sum_tt += sample.t * sample.t;
        sum_tbt += sample.t * sample.bt;

        while samples[start].t < sample.t - ROR_WINDOW_SEC {
            let old = &samples[start];
            n -= 1.0;
            sum_t -= old.t;
            sum_bt -= old.bt;
            sum_tt -= old.t * old.t;
            sum_tbt -= old.t * old.bt;
            start += 1;
        }

        if n < 2.0 {
            continue;
        }
        let denom = n * sum_tt - sum_t * sum_t;
        if denom.abs() < DENOM_EPS {
            continue;
        }
        let slope_per_min = (n * sum_tbt - sum_t * sum_bt) / denom * 60.0;
        if slope_per_min > 0.0 {
            latched = true;
        }
        if latched {
            out[i] = Some(slope_per_min);
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples(points: &[(f64, f64)]) -> Vec<Sample> {
        points
            .iter()
            .map(|&(t, bt)| Sample {
                t,
                bt,
                et: 0.0,
                power: 0,
                fan: 0,
                event: String::new(),
            })
            .collect()
    }

    /// Per-index mean-centered regression over a filtered window, the form
    /// the incremental scan must agree with.
    fn naive_ror(samples: &[Sample]) -> Vec<Option<f64>> {
        let mut out = vec![None; samples.len()];
        let mut latched = false;
        for i in 0..samples.len() {
            let t_now = samples[i].t;
            let window: Vec<&Sample> = samples
                .iter()
                .filter(|s| s.t >= t_now - ROR_WINDOW_SEC && s.t <= t_now)
                .collect();
            if window.len() < 2 {
                continue;
            }
            let n = window.len() as f64;
            let mean_t = window.iter().map(|s| s.t).sum::<f64>() / n;
            let mean_bt = window.iter().map(|s| s.bt).sum::<f64>() / n;
            let num: f64 = window
                .iter()
                .map(|s| (s.t - mean_t) * (s.bt - mean_bt))
                .sum();
            let den: f64 = window.iter().map(|s| (s.t - mean_t).powi(2)).sum();
            if den.abs() < DENOM_EPS {
                continue;
            }
            let slope_per_min = num / den * 60.0;
            if slope_per_min > 0.0 {
                latched = true;
            }
            if latched {
                out[i] = Some(slope_per_min);
            }
        }
        out
    }

    #[test]
    fn linear_ramp_yields_the_expected_slope() {
        let series = samples(&[(0.0, 20.0), (10.0, 25.0), (20.0, 30.0), (30.0, 35.0)]);
        let ror = compute_ror(&series);
        // 0.5 °C/s over the whole window.
        let last = ror[3].unwrap();
        assert!((last - 30.0).abs() < 1e-9, "got {last}");
    }

    #[test]
    fn early_negative_slopes_are_suppressed_until_the_first_positive() {
        let series = samples(&[
            (0.0, 100.0),
            (10.0, 95.0),
            (20.0, 90.0),
            (30.0, 95.0),
            (40.0, 100.0),
            (50.0, 80.0),
        ]);
        let ror = compute_ror(&series);
        assert_eq!(ror[1], None);
        assert_eq!(ror[2], None);
        assert_eq!(ror[3], None);
        assert!(ror[4].unwrap() > 0.0);
        // Once latched, negative slopes pass through.
        assert!(ror[5].unwrap() < 0.0);
    }

    #[test]
    fn latch_keeps_later_windows_defined() {
        let mut points = Vec::new();
        for i in 0..40 {
            let t = i as f64 * 4.0;
            points.push((t, 90.0 + i as f64 * 1.5));
        }
        let series = samples(&points);
        let ror = compute_ror(&series);
        let first_defined = ror.iter().position(|v| v.is_some()).unwrap();
        for (i, value) in ror.iter().enumerate().skip(first_defined) {
            assert!(value.is_some(), "index {i} regressed to None");
        }
    }

    #[test]
    fn degenerate_timestamps_stay_undefined() {
        let series = samples(&[(0.0, 100.0), (0.0, 105.0), (0.0, 110.0)]);
        let ror = compute_ror(&series);
        assert!(ror.iter().all(Option::is_none));
    }

    #[test]
    fn incremental_matches_the_naive_reference() {
        let mut points = Vec::new();
        let mut t = 0.0;
        for i in 0..60u32 {
            // Irregular cadence and a wiggly but mostly rising curve.
            t += 1.0 + f64::from(i % 7) * 0.9;
            let bt = 85.0 + t * 0.35 + f64::from((i * 37) % 11) * 0.8 - 4.0;
            points.push((t, bt));
        }
        let series = samples(&points);
        let fast = compute_ror(&series);
        let slow = naive_ror(&series);
        assert_eq!(fast.len(), slow.len());
        for (i, (a, b)) in fast.iter().zip(slow.iter()).enumerate() {
            match (a, b) {
                (Some(x), Some(y)) => {
                    assert!((x - y).abs() < 1e-6, "index {i}: {x} vs {y}")
                }
                (None, None) => {}
                _ => panic!("index {i}: definedness mismatch {a:?} vs {b:?}"),
            }
        }
    }
}
