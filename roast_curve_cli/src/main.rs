use std::fs;
use std::fs::File;
use std::io::{self, Read, Write};
use std::panic;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use clap::{ArgAction, Parser, Subcommand, ValueHint};
use plotters::prelude::*;
use plotters::style::{FontDesc, FontFamily, FontStyle};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use roast_curve::layout::{place_labels, LabelRequest, OverlapScore, PlotFrame};
use roast_curve::locate::{normalize_key, probe_time_column};
use roast_curve::{format_mmss, locate, parse_number, prepare, PreparedSeries, Sample};

#[derive(Parser, Debug)]
#[command(author, version, about = "Roast curve preparation CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Prepare a roast-logger export and render the roast curve
    Chart(ChartArgs),
    /// Inspect an export: header candidates, column stats, mapping audit
    Diagnose(DiagnoseArgs),
}

#[derive(Parser, Debug)]
struct ChartArgs {
    /// CSV or ZIP export to ingest
    #[arg(required = true, value_hint = ValueHint::FilePath)]
    input: PathBuf,

    /// Output samples CSV path (`-` for stdout)
    #[arg(short, long, default_value = "roast.csv", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// Output PNG chart path (defaults next to the CSV)
    #[arg(long, value_hint = ValueHint::FilePath)]
    png: Option<PathBuf>,

    /// Output SVG chart path
    #[arg(long, value_hint = ValueHint::FilePath)]
    svg: Option<PathBuf>,

    /// Optional JSON dump of the full prepared series
    #[arg(long, value_hint = ValueHint::FilePath)]
    json: Option<PathBuf>,

    /// Disable chart generation
    #[arg(long, action = ArgAction::SetTrue)]
    no_plot: bool,

    /// Hide event annotations on the chart
    #[arg(long, action = ArgAction::SetTrue)]
    no_events: bool,

    /// Chart width in pixels
    #[arg(long, default_value_t = 1280)]
    width: u32,

    /// Chart height in pixels
    #[arg(long, default_value_t = 720)]
    height: u32,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct DiagnoseArgs {
    /// CSV or ZIP export to inspect
    #[arg(required = true, value_hint = ValueHint::FilePath)]
    input: PathBuf,

    /// Output report path
    #[arg(short, long, default_value = "roast_diagnostics.txt", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let default_level = match &cli.command {
        Command::Chart(args) => {
            if args.verbose {
                "debug"
            } else {
                "info"
            }
        }
        Command::Diagnose(args) => {
            if args.verbose {
                "debug"
            } else {
                "info"
            }
        }
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    match cli.command {
        Command::Chart(args) => handle_chart(args),
        Command::Diagnose(args) => handle_diagnose(args),
    }
}

fn handle_chart(args: ChartArgs) -> Result<()> {
    let rows = read_table(&args.input)?;
    let prepared = prepare(&rows)
        .with_context(|| format!("failed to prepare {}", args.input.display()))?;

    let diag = &prepared.diagnostics;
    info!(
        "Prepared {} samples: header row {}, unit {:?}, baseline {:?}",
        prepared.samples.len(),
        diag.header_row,
        diag.time_unit,
        diag.baseline
    );
    for note in &diag.notes {
        warn!("{note}");
    }
    info!("{}", prepared.phases.display);
    info!("{}", prepared.phases.drop_text);

    if args.output.as_os_str() == "-" {
        write_samples_stdout(&prepared)?;
    } else {
        write_samples_csv(&prepared, &args.output)?;
        info!("Wrote samples CSV: {}", args.output.display());
    }

    if let Some(path) = args.json.as_ref() {
        let text = serde_json::to_string_pretty(&prepared)?;
        fs::write(path, text).with_context(|| format!("failed to write {}", path.display()))?;
        info!("Wrote prepared series JSON: {}", path.display());
    }

    if !args.no_plot {
        let opts = PlotOptions {
            width: args.width,
            height: args.height,
            show_events: !args.no_events,
        };

        if let Some(path) = args.png.as_ref() {
            render_or_warn(&prepared, path, ChartKind::Png, &opts);
        } else if args.output.as_os_str() != "-" {
            let mut png_path = args.output.clone();
            png_path.set_extension("png");
            render_or_warn(&prepared, &png_path, ChartKind::Png, &opts);
        }

        if let Some(path) = args.svg.as_ref() {
            render_or_warn(&prepared, path, ChartKind::Svg, &opts);
        }
    }

    Ok(())
}

fn render_or_warn(prepared: &PreparedSeries, path: &Path, kind: ChartKind, opts: &PlotOptions) {
    if let Err(err) = render_chart_guard(prepared, path, kind, opts) {
        warn!("Skipping chart render ({}): {}", path.display(), err);
    } else {
        info!("Wrote chart: {}", path.display());
    }
}

/// Read CSV text from a plain file or from the first CSV entry of a ZIP
/// archive, then tokenize it into trimmed cells.
fn read_table(path: &Path) -> Result<Vec<Vec<String>>> {
    let text = read_export_text(path)?;
    parse_table(&text)
}

fn read_export_text(path: &Path) -> Result<String> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    if ext != "zip" {
        return fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()));
    }

    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut archive = zip::ZipArchive::new(file)
        .with_context(|| format!("{} is not a readable ZIP archive", path.display()))?;
    let mut csv_name: Option<String> = None;
    for i in 0..archive.len() {
        let entry = archive.by_index(i)?;
        if !entry.is_dir() && entry.name().to_ascii_lowercase().ends_with(".csv") {
            csv_name = Some(entry.name().to_string());
            break;
        }
    }
    let name = csv_name.ok_or_else(|| anyhow!("{} contains no CSV entry", path.display()))?;
    let mut entry = archive.by_name(&name)?;
    let mut text = String::new();
    entry
        .read_to_string(&mut text)
        .with_context(|| format!("failed to decompress {name}"))?;
    Ok(text)
}

fn parse_table(text: &str) -> Result<Vec<Vec<String>>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(text.as_bytes());
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.context("CSV parse failure")?;
        let cells: Vec<String> = record.iter().map(|cell| cell.trim().to_string()).collect();
        if cells.iter().all(|cell| cell.is_empty()) {
            continue;
        }
        rows.push(cells);
    }
    if rows.is_empty() {
        bail!("the export contained no data rows");
    }
    Ok(rows)
}

fn write_samples_stdout(prepared: &PreparedSeries) -> Result<()> {
    let stdout = io::stdout();
    let handle = stdout.lock();
    let mut writer = csv::Writer::from_writer(handle);
    write_samples_rows(prepared, &mut writer)
}

fn write_samples_csv(prepared: &PreparedSeries, path: &Path) -> Result<()> {
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = csv::Writer::from_writer(file);
    write_samples_rows(prepared, &mut writer)
}

fn write_samples_rows<W: Write>(prepared: &PreparedSeries, writer: &mut csv::Writer<W>) -> Result<()> {
    writer.write_record([
        "t_s",
        "time",
        "bt_c",
        "et_c",
        "power_level",
        "fan_level",
        "ror_c_per_min",
        "event",
    ])?;

    for (sample, ror) in prepared.samples.iter().zip(prepared.ror.iter()) {
        writer.write_record([
            format!("{:.1}", sample.t),
            format_mmss(sample.t),
            format!("{:.1}", sample.bt),
            format!("{:.1}", sample.et),
            sample.power.to_string(),
            sample.fan.to_string(),
            ror.map(|v| format!("{:.2}", v)).unwrap_or_default(),
            sample.event.clone(),
        ])?;
    }

    writer.flush()?;
    Ok(())
}

#[derive(Clone, Debug)]
struct PlotOptions {
    width: u32,
    height: u32,
    show_events: bool,
}

enum ChartKind {
    Png,
    Svg,
}

fn render_chart_guard(
    prepared: &PreparedSeries,
    path: &Path,
    kind: ChartKind,
    opts: &PlotOptions,
) -> Result<(), String> {
    let render = || -> Result<(), String> {
        match kind {
            ChartKind::Png => {
                let root = BitMapBackend::new(path, (opts.width, opts.height)).into_drawing_area();
                draw_chart(root, prepared, opts).map_err(|e| format!("plotting error: {}", e))
            }
            ChartKind::Svg => {
                let root = SVGBackend::new(path, (opts.width, opts.height)).into_drawing_area();
                draw_chart(root, prepared, opts).map_err(|e| format!("plotting error: {}", e))
            }
        }
    };

    panic::catch_unwind(panic::AssertUnwindSafe(render))
        .map_err(|_| "plotting backend panicked".to_string())?
}

fn draw_chart<DB>(
    root: DrawingArea<DB, plotters::coord::Shift>,
    prepared: &PreparedSeries,
    opts: &PlotOptions,
) -> Result<()>
where
    DB: DrawingBackend,
    DB::ErrorType: 'static,
{
    if prepared.samples.is_empty() {
        return Ok(());
    }

    let area = root;
    area.fill(&WHITE)?;

    let x_max = prepared.samples.last().map(|s| s.t).unwrap_or(0.0).max(1.0);
    let mut chart = ChartBuilder::on(&area)
        .margin(25)
        .set_label_area_size(LabelAreaPosition::Left, 60)
        .set_label_area_size(LabelAreaPosition::Right, 60)
        .set_label_area_size(LabelAreaPosition::Bottom, 40)
        .build_cartesian_2d(0.0..x_max, 0.0..prepared.temp_max)?
        .set_secondary_coord(0.0..x_max, 0.0..prepared.right_max);

    let axis_font = FontDesc::new(FontFamily::SansSerif, 18.0, FontStyle::Normal);
    chart
        .configure_mesh()
        .light_line_style(&TRANSPARENT)
        .x_label_formatter(&|v| format_mmss(*v))
        .y_label_formatter(&|v| format!("{:.0}", v))
        .x_desc("time (mm:ss)")
        .y_desc("temperature (°C)")
        .label_style(axis_font.color(&BLACK.mix(0.85)))
        .draw()?;
    chart
        .configure_secondary_axes()
        .y_desc("RoR (°C/min)")
        .draw()?;

    let bt_color = RGBColor(249, 115, 22);
    let et_color = RGBColor(148, 163, 184);
    let ror_color = RGBColor(59, 130, 246);
    let power_color = RGBColor(239, 68, 68);
    let fan_color = RGBColor(16, 185, 129);

    chart
        .draw_series(LineSeries::new(
            prepared.samples.iter().map(|s| (s.t, s.bt)),
            bt_color.stroke_width(2),
        ))?
        .label("BT (°C)")
        .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 30, y)], bt_color.stroke_width(2)));

    chart
        .draw_series(LineSeries::new(
            prepared.samples.iter().map(|s| (s.t, s.et)),
            et_color.stroke_width(2),
        ))?
        .label("ET (°C)")
        .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 30, y)], et_color.stroke_width(2)));

    // The RoR trace has gaps (latch suppression, degenerate windows); draw
    // each defined run separately so the gaps stay visible.
    let mut ror_in_legend = false;
    for segment in ror_segments(&prepared.samples, &prepared.ror) {
        let series = chart.draw_secondary_series(LineSeries::new(
            segment.into_iter(),
            ror_color.stroke_width(2),
        ))?;
        if !ror_in_legend {
            series.label("RoR (°C/min)").legend(move |(x, y)| {
                PathElement::new(vec![(x, y), (x + 30, y)], ror_color.stroke_width(2))
            });
            ror_in_legend = true;
        }
    }

    // Control levels ride the temperature axis at ×5 so a full-power roast
    // tops out at 50 °C-equivalent, well under the curves.
    chart
        .draw_series(DashedLineSeries::new(
            stepped_points(&prepared.samples, |s| f64::from(s.power) * 5.0),
            6,
            4,
            power_color.stroke_width(2),
        ))?
        .label("power ×5")
        .legend(move |(x, y)| {
            PathElement::new(vec![(x, y), (x + 30, y)], power_color.stroke_width(2))
        });

    chart
        .draw_series(DashedLineSeries::new(
            stepped_points(&prepared.samples, |s| f64::from(s.fan) * 5.0),
            4,
            4,
            fan_color.stroke_width(2),
        ))?
        .label("fan ×5")
        .legend(move |(x, y)| {
            PathElement::new(vec![(x, y), (x + 30, y)], fan_color.stroke_width(2))
        });

    if opts.show_events && !prepared.events.is_empty() {
        chart.draw_series(
            prepared
                .events
                .iter()
                .map(|e| Circle::new((e.t, e.bt), 4, bt_color.filled())),
        )?;
        draw_event_labels(&area, &chart, prepared)?;
    }

    chart
        .configure_series_labels()
        .background_style(&WHITE.mix(0.7))
        .border_style(&BLACK.mix(0.3))
        .label_font(
            FontDesc::new(FontFamily::SansSerif, 16.0, FontStyle::Normal).color(&BLACK),
        )
        .position(SeriesLabelPosition::LowerRight)
        .draw()?;

    area.present()?;
    Ok(())
}

type RoastChart<'a, DB> = plotters::chart::DualCoordChartContext<
    'a,
    DB,
    plotters::coord::cartesian::Cartesian2d<
        plotters::coord::types::RangedCoordf64,
        plotters::coord::types::RangedCoordf64,
    >,
    plotters::coord::cartesian::Cartesian2d<
        plotters::coord::types::RangedCoordf64,
        plotters::coord::types::RangedCoordf64,
    >,
>;

/// Measure each event's two-line annotation, slot it into a lane, then draw
/// leader line, box and text in pixel space.
fn draw_event_labels<DB>(
    area: &DrawingArea<DB, plotters::coord::Shift>,
    chart: &RoastChart<'_, DB>,
    prepared: &PreparedSeries,
) -> Result<()>
where
    DB: DrawingBackend,
    DB::ErrorType: 'static,
{
    let font = FontDesc::new(FontFamily::SansSerif, 14.0, FontStyle::Normal);
    let text_style = font.color(&BLACK);

    let mut requests = Vec::with_capacity(prepared.events.len());
    let mut texts = Vec::with_capacity(prepared.events.len());
    for event in &prepared.events {
        let headline = event.kind.label().to_string();
        let temp_line = format!("{}°C", event.bt.round() as i64);
        let (w1, h1) = area
            .estimate_text_size(&headline, &text_style)
            .unwrap_or((48, 12));
        let (w2, h2) = area
            .estimate_text_size(&temp_line, &text_style)
            .unwrap_or((48, 12));
        let (anchor_x, anchor_y) = chart.backend_coord(&(event.t, event.bt));
        requests.push(LabelRequest {
            anchor_x: f64::from(anchor_x),
            anchor_y: f64::from(anchor_y),
            width: f64::from(w1.max(w2)) + 8.0,
            height: f64::from(h1 + h2) + 6.0,
        });
        texts.push((headline, temp_line, h1));
    }

    let (x_range, y_range) = chart.plotting_area().get_pixel_range();
    let frame = PlotFrame {
        left: f64::from(x_range.start),
        top: f64::from(y_range.start),
        right: f64::from(x_range.end),
        bottom: f64::from(y_range.end),
    };
    let placed = place_labels(&frame, &requests, &OverlapScore);

    for (label, (headline, temp_line, h1)) in placed.iter().zip(texts.iter()) {
        let rect = label.rect;
        let (cx, cy) = rect.center();
        area.draw(&PathElement::new(
            vec![
                (cx as i32, cy as i32),
                (label.anchor_x as i32, label.anchor_y as i32),
            ],
            BLACK.mix(0.4),
        ))?;
        area.draw(&Rectangle::new(
            [
                (rect.x as i32, rect.y as i32),
                ((rect.x + rect.w) as i32, (rect.y + rect.h) as i32),
            ],
            WHITE.mix(0.85).filled(),
        ))?;
        area.draw(&Rectangle::new(
            [
                (rect.x as i32, rect.y as i32),
                ((rect.x + rect.w) as i32, (rect.y + rect.h) as i32),
            ],
            BLACK.mix(0.3),
        ))?;
        area.draw(&Text::new(
            headline.clone(),
            (rect.x as i32 + 4, rect.y as i32 + 3),
            text_style.clone(),
        ))?;
        area.draw(&Text::new(
            temp_line.clone(),
            (rect.x as i32 + 4, rect.y as i32 + 3 + *h1 as i32),
            text_style.clone(),
        ))?;
    }

    Ok(())
}

fn ror_segments(samples: &[Sample], ror: &[Option<f64>]) -> Vec<Vec<(f64, f64)>> {
    let mut segments = Vec::new();
    let mut current: Vec<(f64, f64)> = Vec::new();
    for (sample, value) in samples.iter().zip(ror.iter()) {
        match value {
            Some(v) => current.push((sample.t, *v)),
            None => {
                if current.len() > 1 {
                    segments.push(std::mem::take(&mut current));
                } else {
                    current.clear();
                }
            }
        }
    }
    if current.len() > 1 {
        segments.push(current);
    }
    segments
}

/// Duplicate the previous level at each change point so control traces render
/// as steps instead of ramps.
fn stepped_points(samples: &[Sample], level: impl Fn(&Sample) -> f64) -> Vec<(f64, f64)> {
    let mut points = Vec::with_capacity(samples.len() * 2);
    let mut prev: Option<f64> = None;
    for sample in samples {
        let y = level(sample);
        if let Some(p) = prev {
            if (p - y).abs() > f64::EPSILON {
                points.push((sample.t, p));
            }
        }
        points.push((sample.t, y));
        prev = Some(y);
    }
    points
}

#[derive(Default, Clone)]
struct ColumnStats {
    count: usize,
    numeric: usize,
    min: Option<f64>,
    max: Option<f64>,
}

fn handle_diagnose(args: DiagnoseArgs) -> Result<()> {
    let rows = read_table(&args.input)?;

    let mut report = String::new();
    report.push_str(&format!("FILE: {}\n", args.input.display()));
    report.push_str(&format!("generated: {}\n", Utc::now().to_rfc3339()));
    report.push_str(&format!("rows: {}\n", rows.len()));

    let mut header_row = 0usize;
    match locate(&rows) {
        Ok(layout) => {
            header_row = layout.header_row;
            report.push_str(&format!(
                "header_row: {}{}\n",
                layout.header_row,
                if layout.fallback { " (fallback)" } else { "" }
            ));
            for note in &layout.notes {
                report.push_str(&format!("  note: {}\n", note));
            }
            let header = &rows[layout.header_row];
            report.push_str("  mapping:\n");
            let roles = [
                ("time", layout.mapping.time),
                ("bt", layout.mapping.bt),
                ("et", layout.mapping.et),
                ("power", layout.mapping.power),
                ("fan", layout.mapping.fan),
                ("event", layout.mapping.event),
            ];
            for (role, index) in roles {
                match index {
                    Some(i) => report.push_str(&format!(
                        "    - {}: column {} ('{}')\n",
                        role,
                        i,
                        header.get(i).map(String::as_str).unwrap_or("")
                    )),
                    None => report.push_str(&format!("    - {}: absent\n", role)),
                }
            }
            if let Some(time_col) = layout.mapping.time {
                let stats = probe_time_column(&rows[layout.header_row + 1..], time_col);
                report.push_str(&format!(
                    "  time_stats: finite={} distinct={} range_s={:.1} rising={:.2} qualifies={}\n",
                    stats.finite,
                    stats.distinct,
                    stats.range_s,
                    stats.positive_delta_fraction,
                    stats.qualifies()
                ));
            }
        }
        Err(err) => {
            report.push_str(&format!("header detection failed: {}\n", err));
        }
    }

    let width = rows.iter().map(|r| r.len()).max().unwrap_or(0);
    report.push_str("  columns:\n");
    for col in 0..width {
        let name = rows[header_row]
            .get(col)
            .map(String::as_str)
            .unwrap_or("");
        let mut stats = ColumnStats::default();
        for row in rows[header_row + 1..].iter() {
            let cell = row.get(col).map(String::as_str).unwrap_or("");
            if cell.is_empty() {
                continue;
            }
            stats.count += 1;
            let value = parse_number(cell);
            if value.is_finite() {
                stats.numeric += 1;
                stats.min = Some(stats.min.map_or(value, |m| m.min(value)));
                stats.max = Some(stats.max.map_or(value, |m| m.max(value)));
            }
        }
        report.push_str(&format!(
            "    - {} (key '{}'): count={}, numeric={}, min={}, max={}\n",
            if name.is_empty() { "(unnamed)" } else { name },
            normalize_key(name),
            stats.count,
            stats.numeric,
            stats
                .min
                .map_or("n/a".into(), |v: f64| format!("{:.3}", v)),
            stats
                .max
                .map_or("n/a".into(), |v: f64| format!("{:.3}", v)),
        ));
    }

    fs::write(&args.output, report)
        .with_context(|| format!("failed to write {}", args.output.display()))?;
    info!("Diagnostic report written: {}", args.output.display());
    Ok(())
}
