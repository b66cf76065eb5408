//! Core roast curve preparation library implemented in Rust.
//!
//! Takes an already-tokenized roast-logger export (a table of trimmed string
//! cells) and derives a normalized sample sequence, a rate-of-rise series,
//! milestone events and phase percentages. File acquisition, CSV tokenization
//! and chart rendering live in the CLI crate.

use ndarray::Array1;
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod events;
pub mod layout;
pub mod locate;
pub mod ror;

pub use events::{
    build_phases, detect_events, estimate_yellow_crossing, EventKind, Phase, PhaseSummary,
    RoastEvent,
};
pub use locate::{build_mapping, locate, ColumnMapping, TableLayout, TimeColumnStats};
pub use ror::compute_ror;

/// Trailing regression window for the rate-of-rise series, seconds.
pub const ROR_WINDOW_SEC: f64 = 30.0;
/// Upper bound of the normalized heater level scale.
pub const POWER_MAX_LEVEL: u8 = 10;
/// Upper bound of the normalized fan level scale.
pub const FAN_MAX_LEVEL: u8 = 15;

#[derive(Error, Debug)]
pub enum RoastError {
    #[error("no usable header row: {0}")]
    MissingRequiredColumns(String),
    #[error("time column contained no parseable timestamps")]
    NoValidTimeData,
    #[error("no finite timestamp available to anchor the time base")]
    NoBaselineTimestamp,
    #[error("every row was dropped during normalization")]
    EmptySeries,
}

/// One normalized logger row. The sequence handed out by [`normalize`] is
/// sorted ascending by `t` and every retained `t` is finite.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Seconds since the charge baseline, clamped at zero.
    pub t: f64,
    /// Bean temperature, °C.
    pub bt: f64,
    /// Exhaust temperature, °C.
    pub et: f64,
    /// Heater level, 0..=10.
    pub power: u8,
    /// Fan level, 0..=15.
    pub fan: u8,
    /// Raw event label text, empty when the column is absent.
    pub event: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeUnit {
    Seconds,
    Minutes,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BaselineSource {
    ChargeEvent,
    FirstSample,
}

/// Observability payload: how the table was read. Consumed by the CLI's
/// reporting, never used internally.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Diagnostics {
    pub header_row: usize,
    pub header_fallback: bool,
    pub notes: Vec<String>,
    pub time_unit: TimeUnit,
    pub median_time_delta_s: Option<f64>,
    pub baseline: BaselineSource,
    pub time_header: Option<String>,
    pub bt_header: Option<String>,
    pub et_header: Option<String>,
    pub power_header: Option<String>,
    pub fan_header: Option<String>,
    pub event_header: Option<String>,
}

/// Everything a renderer or exporter needs, produced by [`prepare`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PreparedSeries {
    pub samples: Vec<Sample>,
    /// °C/min per sample index; `None` while suppressed or degenerate.
    pub ror: Vec<Option<f64>>,
    pub events: Vec<RoastEvent>,
    pub phases: PhaseSummary,
    /// RoR axis ceiling; the temperature axis is fixed at ten times this.
    pub right_max: f64,
    pub temp_max: f64,
    pub max_positive_ror: f64,
    pub diagnostics: Diagnostics,
}

/// Output of [`normalize`]: the sample sequence plus unit/baseline findings.
#[derive(Clone, Debug)]
pub struct NormalizedSeries {
    pub samples: Vec<Sample>,
    pub time_unit: TimeUnit,
    pub median_time_delta_s: Option<f64>,
    pub baseline: BaselineSource,
}

/// Parse a time cell into seconds. Colon-separated values are read as
/// right-aligned `[hh:]mm:ss` with non-digits stripped per segment; anything
/// else is parsed as a float after locale-noise stripping. Returns `NaN` on
/// unparseable input, never panics.
pub fn parse_time(cell: &str) -> f64 {
    let text = cell.trim();
    if text.is_empty() {
        return f64::NAN;
    }
    if text.contains(':') {
        let mut parts: Vec<f64> = text
            .split(':')
            .map(|segment| {
                let cleaned: String = segment
                    .chars()
                    .filter(|c| c.is_ascii_digit() || *c == '.')
                    .collect();
                cleaned.parse::<f64>().unwrap_or(0.0)
            })
            .collect();
        while parts.len() < 3 {
            parts.insert(0, 0.0);
        }
        let n = parts.len();
        return parts[n - 3] * 3600.0 + parts[n - 2] * 60.0 + parts[n - 1];
    }
    strip_numeric(text).parse::<f64>().unwrap_or(f64::NAN)
}

/// Parse a magnitude cell (temperature, control level) into a float,
/// `NaN` on failure.
pub fn parse_number(cell: &str) -> f64 {
    strip_numeric(cell.trim()).parse::<f64>().unwrap_or(f64::NAN)
}

fn strip_numeric(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '0'..='9' | '.' => out.push(c),
            '-' if out.is_empty() => out.push(c),
            _ => {}
        }
    }
    out
}

/// Replace every non-finite value with the most recent finite one, or
/// `initial` before the first finite value. Fully finite input is returned
/// unchanged.
pub fn forward_fill(values: &mut Array1<f64>, initial: f64) {
    let mut last = initial;
    for value in values.iter_mut() {
        if value.is_finite() {
            last = *value;
        } else {
            *value = last;
        }
    }
}

/// Map a forward-filled control column onto `0..=max_level`. Columns whose
/// p95 or maximum lands in (20, 100] are treated as percentages and scaled
/// proportionally; anything else is rounded and clamped in place. The
/// (20, 100] band is a heuristic and can misread genuinely low-percentage
/// data as raw levels.
pub fn normalize_levels(values: &mut Array1<f64>, max_level: u8) {
    if values.is_empty() {
        return;
    }
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let p95 = percentile_95(values);
    let percent_like = |v: f64| v > 20.0 && v <= 100.0;
    let cap = f64::from(max_level);
    let scale = if percent_like(p95) || percent_like(max) {
        cap / 100.0
    } else {
        1.0
    };
    for value in values.iter_mut() {
        *value = (*value * scale).round().clamp(0.0, cap);
    }
}

fn percentile_95(values: &Array1<f64>) -> f64 {
    let mut sorted: Vec<f64> = values.iter().copied().collect();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let idx = ((sorted.len() - 1) as f64 * 0.95).round() as usize;
    sorted[idx]
}

fn median(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = values.len() / 2;
    Some(if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    })
}

fn cell<'a>(row: &'a [String], index: Option<usize>) -> &'a str {
    index
        .and_then(|i| row.get(i))
        .map(String::as_str)
        .unwrap_or("")
}

/// Build the normalized sample sequence from body rows and a column mapping:
/// minutes-to-seconds inference, charge baseline, forward fills, level
/// normalization, non-finite-time drop and ascending sort.
pub fn normalize(
    body: &[Vec<String>],
    mapping: &ColumnMapping,
) -> Result<NormalizedSeries, RoastError> {
    let mut times: Vec<f64> = Vec::with_capacity(body.len());
    let mut bt: Vec<f64> = Vec::with_capacity(body.len());
    let mut et: Vec<f64> = Vec::with_capacity(body.len());
    let mut power: Vec<f64> = Vec::with_capacity(body.len());
    let mut fan: Vec<f64> = Vec::with_capacity(body.len());
    let mut labels: Vec<String> = Vec::with_capacity(body.len());

    for row in body {
        times.push(parse_time(cell(row, mapping.time)));
        bt.push(parse_number(cell(row, mapping.bt)));
        et.push(parse_number(cell(row, mapping.et)));
        power.push(parse_number(cell(row, mapping.power)));
        fan.push(parse_number(cell(row, mapping.fan)));
        labels.push(cell(row, mapping.event).trim().to_string());
    }

    if !times.iter().any(|t| t.is_finite()) {
        return Err(RoastError::NoValidTimeData);
    }

    // Fractional-minute timestamps would otherwise read as coarse seconds.
    let mut deltas: Vec<f64> = Vec::new();
    let mut prev: Option<f64> = None;
    for &t in &times {
        if !t.is_finite() {
            continue;
        }
        if let Some(p) = prev {
            let delta = t - p;
            if delta > 0.0 {
                deltas.push(delta);
            }
        }
        prev = Some(t);
    }
    let median_delta = median(&mut deltas);
    let max_time = times
        .iter()
        .copied()
        .filter(|t| t.is_finite())
        .fold(f64::NEG_INFINITY, f64::max);
    let time_unit = match median_delta {
        Some(m) if m < 0.2 && max_time < 60.0 => TimeUnit::Minutes,
        _ => TimeUnit::Seconds,
    };
    if time_unit == TimeUnit::Minutes {
        for t in &mut times {
            *t *= 60.0;
        }
    }

    let charge_time = labels
        .iter()
        .position(|label| label.to_lowercase().contains("charge"))
        .map(|i| times[i]);
    let (base_time, baseline) = match charge_time {
        Some(t) if t.is_finite() => (t, BaselineSource::ChargeEvent),
        _ => (
            times
                .iter()
                .copied()
                .filter(|t| t.is_finite())
                .fold(f64::INFINITY, f64::min),
            BaselineSource::FirstSample,
        ),
    };
    if !base_time.is_finite() {
        return Err(RoastError::NoBaselineTimestamp);
    }

    let mut bt = Array1::from_vec(bt);
    let mut et = Array1::from_vec(et);
    let mut power = Array1::from_vec(power);
    let mut fan = Array1::from_vec(fan);
    forward_fill(&mut bt, 0.0);
    forward_fill(&mut et, 0.0);
    forward_fill(&mut power, 0.0);
    forward_fill(&mut fan, 0.0);
    normalize_levels(&mut power, POWER_MAX_LEVEL);
    normalize_levels(&mut fan, FAN_MAX_LEVEL);

    let mut samples: Vec<Sample> = Vec::with_capacity(times.len());
    for (i, &t) in times.iter().enumerate() {
        if !t.is_finite() {
            continue;
        }
        samples.push(Sample {
            // Pre-charge rows collapse to t=0 instead of disappearing.
            t: (t - base_time).max(0.0),
            bt: bt[i],
            et: et[i],
            power: power[i] as u8,
            fan: fan[i] as u8,
            event: labels[i].clone(),
        });
    }
    samples.sort_by_key(|s| OrderedFloat(s.t));
    if samples.is_empty() {
        return Err(RoastError::EmptySeries);
    }

    Ok(NormalizedSeries {
        samples,
        time_unit,
        median_time_delta_s: median_delta,
        baseline,
    })
}

/// Run the whole pipeline over a tokenized table: locate the header, build
/// the sample sequence, compute RoR, detect events, segment phases and fix
/// the paired axis ceilings.
pub fn prepare(rows: &[Vec<String>]) -> Result<PreparedSeries, RoastError> {
    let located = locate(rows)?;
    let body = &rows[located.header_row + 1..];
    let normalized = normalize(body, &located.mapping)?;

    let ror = compute_ror(&normalized.samples);
    let events = detect_events(&normalized.samples);
    let phases = build_phases(&normalized.samples, &events);

    let observed_max = ror
        .iter()
        .flatten()
        .copied()
        .filter(|v| *v > 0.0)
        .fold(f64::NAN, f64::max);
    let (max_positive_ror, right_max) = if observed_max.is_finite() {
        let clamped = observed_max.clamp(1.0, 80.0);
        (clamped, (clamped.floor() + 5.0).clamp(10.0, 60.0))
    } else {
        (0.0, 25.0)
    };
    // 1:10 axis pairing keeps the temperature and RoR slopes comparable.
    let temp_max = right_max * 10.0;

    let header = &rows[located.header_row];
    let audit = |index: Option<usize>| index.and_then(|i| header.get(i)).cloned();
    let diagnostics = Diagnostics {
        header_row: located.header_row,
        header_fallback: located.fallback,
        notes: located.notes,
        time_unit: normalized.time_unit,
        median_time_delta_s: normalized.median_time_delta_s,
        baseline: normalized.baseline,
        time_header: audit(located.mapping.time),
        bt_header: audit(located.mapping.bt),
        et_header: audit(located.mapping.et),
        power_header: audit(located.mapping.power),
        fan_header: audit(located.mapping.fan),
        event_header: audit(located.mapping.event),
    };

    Ok(PreparedSeries {
        samples: normalized.samples,
        ror,
        events,
        phases,
        right_max,
        temp_max,
        max_positive_ror,
        diagnostics,
    })
}

/// Zero-padded `mm:ss` label for a non-negative second count.
pub fn format_mmss(seconds: f64) -> String {
    let total = seconds.max(0.0).round() as u64;
    format!("{:02}:{:02}", total / 60, total % 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(rows: &[&[&str]]) -> Vec<Vec<String>> {
        rows.iter()
            .map(|row| row.iter().map(|c| c.to_string()).collect())
            .collect()
    }

    #[test]
    fn parse_time_handles_clock_formats() {
        assert_eq!(parse_time("12:30"), 750.0);
        assert_eq!(parse_time("1:02:03"), 3723.0);
        assert_eq!(parse_time(":45"), 45.0);
        assert_eq!(parse_time("00:01:00.5"), 60.5);
    }

    #[test]
    fn parse_time_strips_locale_noise() {
        assert_eq!(parse_time(" 90 "), 90.0);
        assert_eq!(parse_time("1,234.5"), 1234.5);
        assert_eq!(parse_time("-15"), -15.0);
        assert!(parse_time("n/a").is_nan());
        assert!(parse_time("").is_nan());
    }

    #[test]
    fn parse_number_strips_units() {
        assert_eq!(parse_number("205.4 °C"), 205.4);
        assert_eq!(parse_number("75%"), 75.0);
        assert!(parse_number("--").is_nan());
    }

    #[test]
    fn forward_fill_uses_initial_before_first_finite() {
        let mut values = Array1::from_vec(vec![f64::NAN, 1.0, f64::NAN, 3.0]);
        forward_fill(&mut values, 0.0);
        assert_eq!(values.to_vec(), vec![0.0, 1.0, 1.0, 3.0]);
    }

    #[test]
    fn forward_fill_is_idempotent_on_finite_input() {
        let original = vec![2.0, 4.0, 8.0];
        let mut values = Array1::from_vec(original.clone());
        forward_fill(&mut values, 0.0);
        assert_eq!(values.to_vec(), original);
    }

    #[test]
    fn percent_encoded_power_maps_onto_levels() {
        let mut values = Array1::from_vec(vec![0.0, 50.0, 100.0]);
        normalize_levels(&mut values, POWER_MAX_LEVEL);
        assert_eq!(values.to_vec(), vec![0.0, 5.0, 10.0]);
    }

    #[test]
    fn raw_levels_are_rounded_and_clamped() {
        let mut values = Array1::from_vec(vec![0.4, 7.6, 12.0]);
        normalize_levels(&mut values, POWER_MAX_LEVEL);
        assert_eq!(values.to_vec(), vec![0.0, 8.0, 10.0]);
    }

    #[test]
    fn fractional_minute_times_are_rescaled() {
        let body: Vec<Vec<String>> = (1..=9)
            .map(|i| vec![format!("0.{i}"), format!("{}", 90 + i)])
            .collect();
        let mapping = ColumnMapping {
            time: Some(0),
            bt: Some(1),
            ..ColumnMapping::default()
        };
        let normalized = normalize(&body, &mapping).unwrap();
        assert_eq!(normalized.time_unit, TimeUnit::Minutes);
        // 0.1 min steps become 6 s steps after the ×60 rescale.
        assert!((normalized.samples[1].t - normalized.samples[0].t - 6.0).abs() < 1e-9);
    }

    #[test]
    fn charge_event_sets_the_baseline_and_clamps_earlier_rows() {
        let body = table(&[
            &["100", "80", ""],
            &["110", "85", "Charge"],
            &["120", "90", ""],
        ]);
        let mapping = ColumnMapping {
            time: Some(0),
            bt: Some(1),
            event: Some(2),
            ..ColumnMapping::default()
        };
        let normalized = normalize(&body, &mapping).unwrap();
        assert_eq!(normalized.baseline, BaselineSource::ChargeEvent);
        let times: Vec<f64> = normalized.samples.iter().map(|s| s.t).collect();
        assert_eq!(times, vec![0.0, 0.0, 10.0]);
    }

    #[test]
    fn samples_are_sorted_for_any_input_order() {
        let body = table(&[&["30", "95"], &["10", "85"], &["20", "90"]]);
        let mapping = ColumnMapping {
            time: Some(0),
            bt: Some(1),
            ..ColumnMapping::default()
        };
        let normalized = normalize(&body, &mapping).unwrap();
        let times: Vec<f64> = normalized.samples.iter().map(|s| s.t).collect();
        assert_eq!(times, vec![0.0, 10.0, 20.0]);
    }

    #[test]
    fn unparseable_time_column_is_fatal() {
        let body = table(&[&["abc", "80"], &["def", "85"]]);
        let mapping = ColumnMapping {
            time: Some(0),
            bt: Some(1),
            ..ColumnMapping::default()
        };
        assert!(matches!(
            normalize(&body, &mapping),
            Err(RoastError::NoValidTimeData)
        ));
    }

    #[test]
    fn prepare_runs_end_to_end() {
        let mut rows = vec![vec![
            "Time".to_string(),
            "Beantemp".to_string(),
            "Event".to_string(),
        ]];
        for i in 0..61 {
            let t = i * 5;
            let bt = 90.0 + i as f64 * 2.0;
            let event = match t {
                150 => "yellow",
                250 => "1st crack",
                _ => "",
            };
            rows.push(vec![t.to_string(), format!("{bt:.1}"), event.to_string()]);
        }
        let prepared = prepare(&rows).unwrap();
        assert_eq!(prepared.samples.len(), 61);
        assert_eq!(prepared.diagnostics.header_row, 0);
        assert_eq!(prepared.temp_max, prepared.right_max * 10.0);
        assert!(prepared
            .events
            .iter()
            .any(|e| e.kind == EventKind::FirstCrack));
        // 2 °C per 5 s is 24 °C/min; ceiling = floor(24) + 5.
        assert_eq!(prepared.right_max, 29.0);
    }

    #[test]
    fn axis_ceiling_defaults_without_positive_ror() {
        let rows = table(&[
            &["Time", "Beantemp"],
            &["0", "100"],
            &["10", "90"],
            &["20", "80"],
        ]);
        let prepared = prepare(&rows).unwrap();
        assert_eq!(prepared.right_max, 25.0);
        assert_eq!(prepared.max_positive_ror, 0.0);
    }

    #[test]
    fn format_mmss_pads_and_rounds() {
        assert_eq!(format_mmss(0.0), "00:00");
        assert_eq!(format_mmss(75.4), "01:15");
        assert_eq!(format_mmss(-3.0), "00:00");
    }
}
