//! Milestone detection and phase segmentation.

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

use crate::{format_mmss, Sample};

/// The turning-point search ignores the first moments after charge, where
/// the probe still reads the preheated drum.
pub const TP_SEARCH_START_S: f64 = 20.0;
/// Conventional yellowing temperature used for the crossing estimate.
pub const YELLOW_CROSSING_C: f64 = 150.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Charge,
    Yellow,
    FirstCrack,
    TurningPoint,
}

impl EventKind {
    pub fn label(self) -> &'static str {
        match self {
            EventKind::Charge => "CHARGE",
            EventKind::Yellow => "YELLOW",
            EventKind::FirstCrack => "1ST CRACK",
            EventKind::TurningPoint => "TP",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoastEvent {
    /// Index into the sample sequence.
    pub index: usize,
    pub t: f64,
    pub bt: f64,
    pub kind: EventKind,
}

/// Scan the event column for milestone labels and estimate the turning point
/// when none was logged. Never fails; an unlabeled roast yields at most the
/// synthesized TP.
pub fn detect_events(samples: &[Sample]) -> Vec<RoastEvent> {
    let mut events: Vec<RoastEvent> = Vec::new();
    for (index, sample) in samples.iter().enumerate() {
        let label = sample.event.to_uppercase();
        if label.is_empty() {
            continue;
        }
        let kind = if label.contains("YELLOW") {
            Some(EventKind::Yellow)
        } else if label.contains("1ST") {
            Some(EventKind::FirstCrack)
        } else if label.contains("CHARGE") {
            Some(EventKind::Charge)
        } else if label.contains("TURNING") || label == "TP" {
            Some(EventKind::TurningPoint)
        } else {
            None
        };
        if let Some(kind) = kind {
            events.push(RoastEvent {
                index,
                t: sample.t,
                bt: sample.bt,
                kind,
            });
        }
    }

    if !events
        .iter()
        .any(|e| e.kind == EventKind::TurningPoint)
    {
        if let Some(tp) = estimate_turning_point(samples) {
            events.push(tp);
            events.sort_by_key(|e| OrderedFloat(e.t));
        }
    }

    events
}

/// The post-charge temperature dip: minimum finite bt at `t >= 20`, falling
/// back to the whole sequence when the roast is shorter than that.
fn estimate_turning_point(samples: &[Sample]) -> Option<RoastEvent> {
    let min_bt = |late_only: bool| {
        samples
            .iter()
            .enumerate()
            .filter(|(_, s)| s.bt.is_finite() && (!late_only || s.t >= TP_SEARCH_START_S))
            .min_by_key(|(_, s)| OrderedFloat(s.bt))
    };
    min_bt(true)
        .or_else(|| min_bt(false))
        .map(|(index, s)| RoastEvent {
            index,
            t: s.t,
            bt: s.bt,
            kind: EventKind::TurningPoint,
        })
}

/// First linear-interpolated crossing of 150 °C from below, as `(t, 150.0)`.
/// Feeds the phase segmentation when no yellow label exists; never added to
/// the event list.
pub fn estimate_yellow_crossing(samples: &[Sample]) -> Option<(f64, f64)> {
    for pair in samples.windows(2) {
        let (a, b) = (&pair[0], &pair[1]);
        if !a.bt.is_finite() || !b.bt.is_finite() {
            continue;
        }
        if a.bt < YELLOW_CROSSING_C && b.bt >= YELLOW_CROSSING_C {
            let frac = (YELLOW_CROSSING_C - a.bt) / (b.bt - a.bt);
            return Some((a.t + (b.t - a.t) * frac, YELLOW_CROSSING_C));
        }
    }
    None
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    pub duration_s: f64,
    pub pct: u32,
    /// `mm:ss` rendering of the duration.
    pub label: String,
}

/// Drying/Maillard/development split of the roast timeline.
///
/// The three durations are clamped to `[0, total]` independently, so with
/// inconsistent milestones (a yellow label after first crack) they need not
/// sum to the total. That mirrors the source behavior and is left as-is.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PhaseSummary {
    pub drying: Phase,
    pub maillard: Phase,
    pub development: Phase,
    pub total_s: f64,
    pub display: String,
    pub drop_text: String,
}

/// Segment the roast using explicit events where present, the 150 °C
/// crossing for yellow, and total-time thirds as the last resort.
pub fn build_phases(samples: &[Sample], events: &[RoastEvent]) -> PhaseSummary {
    let total = samples.last().map(|s| s.t).unwrap_or(0.0);
    let yellow = events
        .iter()
        .find(|e| e.kind == EventKind::Yellow)
        .map(|e| e.t)
        .or_else(|| estimate_yellow_crossing(samples).map(|(t, _)| t))
        .unwrap_or(total / 3.0);
    let first_crack = events
        .iter()
        .find(|e| e.kind == EventKind::FirstCrack)
        .map(|e| e.t)
        .unwrap_or(total * 2.0 / 3.0);

    let a = clamp_duration(yellow, total);
    let b = clamp_duration(first_crack - yellow, total);
    let c = clamp_duration(total - first_crack, total);

    let drying = phase(a, total);
    let maillard = phase(b, total);
    let development = phase(c, total);
    let display = format!(
        "A {}% {} | B {}% {} | C {}% {}",
        drying.pct,
        drying.label,
        maillard.pct,
        maillard.label,
        development.pct,
        development.label
    );
    let drop_bt = samples.last().map(|s| s.bt).unwrap_or(0.0);
    let drop_text = format!(
        "drop {} / BT {}°C",
        format_mmss(total),
        drop_bt.round() as i64
    );

    PhaseSummary {
        drying,
        maillard,
        development,
        total_s: total,
        display,
        drop_text,
    }
}

fn phase(duration_s: f64, total: f64) -> Phase {
    let pct = if total > 0.0 {
        (duration_s / total * 100.0).round() as u32
    } else {
        0
    };
    Phase {
        duration_s,
        pct,
        label: format_mmss(duration_s),
    }
}

fn clamp_duration(value: f64, total: f64) -> f64 {
    if !value.is_finite() || value < 0.0 {
        0.0
    } else if value > total {
        total
    } else {
        value
    }
}
