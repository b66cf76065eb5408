//! Header-row location and column-role mapping.
//!
//! Logger exports disagree on header wording (bilingual), header position
//! (metadata preambles) and time encoding, so the locator pairs an ordered
//! keyword rule table with a statistical probe of the would-be time column.

use std::collections::BTreeSet;

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

use crate::{parse_time, RoastError};

/// Header candidates are drawn from at most this many leading rows.
pub const HEADER_SCAN_ROWS: usize = 100;
/// Rows probed below a candidate header when judging its time column.
pub const TIME_PROBE_ROWS: usize = 80;

/// Column index per logical role; `None` marks an absent role. `time` and
/// `bt` are mandatory for the pipeline, the rest degrade gracefully.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMapping {
    pub time: Option<usize>,
    pub bt: Option<usize>,
    pub et: Option<usize>,
    pub power: Option<usize>,
    pub fan: Option<usize>,
    pub event: Option<usize>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Role {
    Time,
    Bt,
    Et,
    Power,
    Fan,
    Event,
}

struct MatchRule {
    role: Role,
    keywords: &'static [&'static str],
    exclude: &'static [&'static str],
    exact: bool,
}

// Scanned in order; the first column whose normalized key satisfies a rule
// claims that role. "time" must match exactly so that derived columns like
// "total time" stay out of the running.
const RULES: &[MatchRule] = &[
    MatchRule {
        role: Role::Time,
        keywords: &["time", "timesec", "sec", "seconds", "時間", "時刻"],
        exclude: &["totaltime"],
        exact: true,
    },
    MatchRule {
        role: Role::Bt,
        keywords: &["beantemp", "bt", "豆溫", "beantemperature"],
        exclude: &["loadbean", "outbean"],
        exact: false,
    },
    MatchRule {
        role: Role::Et,
        keywords: &["exhaust", "et", "環境", "排氣", "exhausttemp"],
        exclude: &[],
        exact: false,
    },
    MatchRule {
        role: Role::Power,
        keywords: &["power", "火力", "heater"],
        exclude: &[],
        exact: false,
    },
    MatchRule {
        role: Role::Fan,
        keywords: &["fan", "風門", "air"],
        exclude: &[],
        exact: false,
    },
    MatchRule {
        role: Role::Event,
        keywords: &["event", "模式", "roastmode", "事件"],
        exclude: &[],
        exact: false,
    },
];

/// Canonical form of a header cell: lower-cased, everything but ASCII
/// alphanumerics and CJK ideographs removed, "temperature" folded to "temp".
pub fn normalize_key(header: &str) -> String {
    let lowered = header.to_lowercase();
    let stripped: String = lowered
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || ('\u{4e00}'..='\u{9faf}').contains(c))
        .collect();
    stripped.replace("temperature", "temp")
}

fn rule_matches(rule: &MatchRule, key: &str) -> bool {
    if key.is_empty() || rule.exclude.iter().any(|ex| key.contains(ex)) {
        return false;
    }
    if rule.exact {
        rule.keywords.iter().any(|kw| key == *kw)
    } else {
        rule.keywords.iter().any(|kw| key.contains(kw))
    }
}

/// Apply the rule table to one row of header cells.
pub fn build_mapping(headers: &[String]) -> ColumnMapping {
    let keys: Vec<String> = headers.iter().map(|h| normalize_key(h)).collect();
    let mut mapping = ColumnMapping::default();
    for rule in RULES {
        let found = keys.iter().position(|key| rule_matches(rule, key));
        match rule.role {
            Role::Time => mapping.time = found,
            Role::Bt => mapping.bt = found,
            Role::Et => mapping.et = found,
            Role::Power => mapping.power = found,
            Role::Fan => mapping.fan = found,
            Role::Event => mapping.event = found,
        }
    }
    mapping
}

/// Statistics of a candidate time column over the rows below its header.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct TimeColumnStats {
    pub finite: usize,
    pub distinct: usize,
    pub range_s: f64,
    pub positive_delta_fraction: f64,
}

impl TimeColumnStats {
    /// Thresholds that separate a monotonic time axis from a coincidental
    /// numeric column.
    pub fn qualifies(&self) -> bool {
        self.finite >= 30
            && self.distinct >= 30
            && self.range_s >= 60.0
            && self.positive_delta_fraction > 0.7
    }

    pub fn score(&self) -> f64 {
        self.distinct as f64 + self.range_s + self.positive_delta_fraction * 100.0
    }
}

/// Probe up to [`TIME_PROBE_ROWS`] cells of `column` in `rows`.
pub fn probe_time_column(rows: &[Vec<String>], column: usize) -> TimeColumnStats {
    let mut finite = 0usize;
    let mut distinct: BTreeSet<OrderedFloat<f64>> = BTreeSet::new();
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    let mut rising = 0usize;
    let mut pairs = 0usize;
    let mut prev: Option<f64> = None;

    for row in rows.iter().take(TIME_PROBE_ROWS) {
        let value = parse_time(row.get(column).map(String::as_str).unwrap_or(""));
        if !value.is_finite() {
            continue;
        }
        finite += 1;
        distinct.insert(OrderedFloat(value));
        min = min.min(value);
        max = max.max(value);
        if let Some(p) = prev {
            pairs += 1;
            if value > p {
                rising += 1;
            }
        }
        prev = Some(value);
    }

    TimeColumnStats {
        finite,
        distinct: distinct.len(),
        range_s: if finite > 0 { max - min } else { 0.0 },
        positive_delta_fraction: if pairs > 0 {
            rising as f64 / pairs as f64
        } else {
            0.0
        },
    }
}

#[derive(Clone, Debug)]
pub struct TableLayout {
    pub header_row: usize,
    pub mapping: ColumnMapping,
    /// True when no candidate passed the statistical checks and the earliest
    /// keyword match was used best-effort.
    pub fallback: bool,
    pub notes: Vec<String>,
}

/// Find the best header row and column mapping for a tokenized table.
pub fn locate(rows: &[Vec<String>]) -> Result<TableLayout, RoastError> {
    let mut best: Option<(f64, usize, ColumnMapping)> = None;
    let mut earliest: Option<(usize, ColumnMapping)> = None;

    for (i, row) in rows.iter().enumerate().take(HEADER_SCAN_ROWS) {
        let mapping = build_mapping(row);
        let (Some(time_col), Some(_)) = (mapping.time, mapping.bt) else {
            continue;
        };
        if earliest.is_none() {
            earliest = Some((i, mapping));
        }
        let stats = probe_time_column(&rows[i + 1..], time_col);
        if !stats.qualifies() {
            continue;
        }
        let score = stats.score();
        if best.as_ref().map_or(true, |(b, _, _)| score > *b) {
            best = Some((score, i, mapping));
        }
    }

    if let Some((_, header_row, mapping)) = best {
        return Ok(TableLayout {
            header_row,
            mapping,
            fallback: false,
            notes: Vec::new(),
        });
    }

    match earliest {
        Some((header_row, mapping)) => Ok(TableLayout {
            header_row,
            mapping,
            fallback: true,
            notes: vec![format!(
                "no candidate header passed the time-column checks (need >=30 finite, \
                 >=30 distinct, range >=60 s, >0.7 rising deltas); \
                 using the earliest keyword match at row {header_row}"
            )],
        }),
        None => Err(RoastError::MissingRequiredColumns(format!(
            "scanned the first {} rows without finding both a time and a bean-temperature header",
            rows.len().min(HEADER_SCAN_ROWS)
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(cells: &[&str]) -> Vec<String> {
        cells.iter().map(|c| c.to_string()).collect()
    }

    fn monotonic_table(header: &[&str], rows: usize, step: usize) -> Vec<Vec<String>> {
        let mut table = vec![strings(header)];
        for i in 0..rows {
            table.push(strings(&[
                &(i * step).to_string(),
                &format!("{:.1}", 90.0 + i as f64),
                "",
            ]));
        }
        table
    }

    #[test]
    fn selects_the_obvious_header_row() {
        let table = monotonic_table(&["Time", "Beantemp", "Event"], 61, 5);
        let layout = locate(&table).unwrap();
        assert_eq!(layout.header_row, 0);
        assert_eq!(layout.mapping.time, Some(0));
        assert_eq!(layout.mapping.bt, Some(1));
        assert_eq!(layout.mapping.event, Some(2));
        assert!(!layout.fallback);
    }

    #[test]
    fn skips_a_metadata_preamble() {
        let mut table = vec![
            strings(&["Roast Report", "", ""]),
            strings(&["Machine", "R2", ""]),
        ];
        table.extend(monotonic_table(&["time(sec)", "Bean Temperature", "event"], 40, 10));
        let layout = locate(&table).unwrap();
        assert_eq!(layout.header_row, 2);
        assert_eq!(layout.mapping.time, Some(0));
        assert_eq!(layout.mapping.bt, Some(1));
    }

    #[test]
    fn falls_back_to_the_earliest_keyword_match_on_short_tables() {
        let table = monotonic_table(&["Time", "BT"], 5, 10);
        let layout = locate(&table).unwrap();
        assert!(layout.fallback);
        assert_eq!(layout.header_row, 0);
        assert!(!layout.notes.is_empty());
    }

    #[test]
    fn missing_required_columns_is_fatal() {
        let table = vec![strings(&["Total Time", "Humidity"]), strings(&["1", "2"])];
        assert!(matches!(
            locate(&table),
            Err(RoastError::MissingRequiredColumns(_))
        ));
    }

    #[test]
    fn time_rule_requires_an_exact_key() {
        let mapping = build_mapping(&strings(&["Total Time", "Beantemp"]));
        assert_eq!(mapping.time, None);
        let mapping = build_mapping(&strings(&["Time (sec)", "Beantemp"]));
        assert_eq!(mapping.time, Some(0));
    }

    #[test]
    fn bilingual_headers_map() {
        let mapping = build_mapping(&strings(&["時間", "豆溫", "排氣", "火力", "風門", "事件"]));
        assert_eq!(mapping.time, Some(0));
        assert_eq!(mapping.bt, Some(1));
        assert_eq!(mapping.et, Some(2));
        assert_eq!(mapping.power, Some(3));
        assert_eq!(mapping.fan, Some(4));
        assert_eq!(mapping.event, Some(5));
    }

    #[test]
    fn bean_exclusions_skip_inventory_columns() {
        let mapping = build_mapping(&strings(&["Time", "Loadbean Temp", "Bean Temp"]));
        assert_eq!(mapping.bt, Some(2));
    }

    #[test]
    fn temperature_is_folded_to_temp() {
        assert_eq!(normalize_key("Bean Temperature"), "beantemp");
        assert_eq!(normalize_key("Exhaust-Temperature (°C)"), "exhausttempc");
    }

    #[test]
    fn probe_counts_rising_deltas() {
        let rows: Vec<Vec<String>> = (0..40).map(|i| strings(&[&(i * 3).to_string()])).collect();
        let stats = probe_time_column(&rows, 0);
        assert_eq!(stats.finite, 40);
        assert_eq!(stats.distinct, 40);
        assert_eq!(stats.range_s, 117.0);
        assert_eq!(stats.positive_delta_fraction, 1.0);
        assert!(stats.qualifies());
    }
}
