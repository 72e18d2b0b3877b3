//! SVG charts for detection results.
//!
//! Three charts are produced, all as standalone SVG documents:
//!
//! | Function | Chart |
//! |----------|-------|
//! | [`anomaly_chart`] | traffic line, anomaly markers, ±2σ band, stats box |
//! | [`hourly_chart`] | bar chart of anomalies per hour of day |
//! | [`intensity_chart`] | anomalies over time, coloured by value |

use anyhow::{bail, Context, Result};
use std::fmt::Write as _;
use std::path::Path;

use crate::detector::{AnomalyAnalysis, AnomalyFrame};
use crate::preprocess::TIMESTAMP_FORMAT;

pub const CONTENT_TYPE: &str = "image/svg+xml";

const MARGIN_LEFT: f64 = 90.0;
const MARGIN_RIGHT: f64 = 40.0;
const MARGIN_TOP: f64 = 70.0;
const MARGIN_BOTTOM: f64 = 110.0;
const X_TICKS: usize = 6;
const Y_TICKS: usize = 5;

/// Maps a data range onto a pixel range.
#[derive(Debug, Clone, Copy)]
struct Scale {
    d0: f64,
    d1: f64,
    r0: f64,
    r1: f64,
}

impl Scale {
    fn new(d0: f64, d1: f64, r0: f64, r1: f64) -> Self {
        // widen degenerate domains so a single value lands mid-axis
        let (d0, d1) = if (d1 - d0).abs() < f64::EPSILON {
            (d0 - 1.0, d1 + 1.0)
        } else {
            (d0, d1)
        };
        Self { d0, d1, r0, r1 }
    }

    fn map(&self, v: f64) -> f64 {
        self.r0 + (v - self.d0) / (self.d1 - self.d0) * (self.r1 - self.r0)
    }

    fn ticks(&self, n: usize) -> Vec<f64> {
        (0..=n)
            .map(|i| self.d0 + (self.d1 - self.d0) * i as f64 / n as f64)
            .collect()
    }
}

/// Minimal SVG document builder.
struct Canvas {
    width: f64,
    height: f64,
    body: String,
}

impl Canvas {
    fn new(width: f64, height: f64) -> Self {
        let mut canvas = Self {
            width,
            height,
            body: String::new(),
        };
        canvas.rect(0.0, 0.0, width, height, "white", 1.0, None);
        canvas
    }

    #[allow(clippy::too_many_arguments)]
    fn rect(&mut self, x: f64, y: f64, w: f64, h: f64, fill: &str, opacity: f64, stroke: Option<&str>) {
        let _ = write!(
            self.body,
            r#"<rect x="{:.1}" y="{:.1}" width="{:.1}" height="{:.1}" fill="{}" fill-opacity="{}""#,
            x, y, w.max(0.0), h.max(0.0), fill, opacity
        );
        if let Some(s) = stroke {
            let _ = write!(self.body, r#" stroke="{}""#, s);
        }
        self.body.push_str("/>\n");
    }

    fn line(&mut self, x1: f64, y1: f64, x2: f64, y2: f64, stroke: &str, opacity: f64) {
        let _ = writeln!(
            self.body,
            r#"<line x1="{:.1}" y1="{:.1}" x2="{:.1}" y2="{:.1}" stroke="{}" stroke-opacity="{}"/>"#,
            x1, y1, x2, y2, stroke, opacity
        );
    }

    fn polyline(&mut self, points: &[(f64, f64)], stroke: &str, opacity: f64) {
        if points.is_empty() {
            return;
        }
        let coords: Vec<String> = points.iter().map(|(x, y)| format!("{:.1},{:.1}", x, y)).collect();
        let _ = writeln!(
            self.body,
            r#"<polyline points="{}" fill="none" stroke="{}" stroke-opacity="{}" stroke-width="1"/>"#,
            coords.join(" "),
            stroke,
            opacity
        );
    }

    fn circle(&mut self, x: f64, y: f64, r: f64, fill: &str) {
        let _ = writeln!(
            self.body,
            r#"<circle cx="{:.1}" cy="{:.1}" r="{:.1}" fill="{}"/>"#,
            x, y, r, fill
        );
    }

    fn text(&mut self, x: f64, y: f64, size: u32, anchor: &str, content: &str) {
        let _ = writeln!(
            self.body,
            r#"<text x="{:.1}" y="{:.1}" font-family="sans-serif" font-size="{}" text-anchor="{}">{}</text>"#,
            x,
            y,
            size,
            anchor,
            escape(content)
        );
    }

    fn rotated_text(&mut self, x: f64, y: f64, size: u32, angle: f64, content: &str) {
        let _ = writeln!(
            self.body,
            r#"<text x="{:.1}" y="{:.1}" font-family="sans-serif" font-size="{}" text-anchor="end" transform="rotate({} {:.1} {:.1})">{}</text>"#,
            x,
            y,
            size,
            angle,
            x,
            y,
            escape(content)
        );
    }

    fn plot_area(&self) -> (f64, f64, f64, f64) {
        (
            MARGIN_LEFT,
            MARGIN_TOP,
            self.width - MARGIN_RIGHT,
            self.height - MARGIN_BOTTOM,
        )
    }

    /// Title, axis labels, frame, and light grid lines.
    fn axes(&mut self, title: &str, x_label: &str, y_label: &str, y_scale: &Scale) {
        let (left, top, right, bottom) = self.plot_area();
        self.text(self.width / 2.0, 40.0, 20, "middle", title);
        self.text((left + right) / 2.0, self.height - 15.0, 13, "middle", x_label);
        let _ = writeln!(
            self.body,
            r#"<text x="20" y="{:.1}" font-family="sans-serif" font-size="13" text-anchor="middle" transform="rotate(-90 20 {:.1})">{}</text>"#,
            (top + bottom) / 2.0,
            (top + bottom) / 2.0,
            escape(y_label)
        );

        for tick in y_scale.ticks(Y_TICKS) {
            let y = y_scale.map(tick);
            self.line(left, y, right, y, "gray", 0.3);
            self.text(left - 8.0, y + 4.0, 11, "end", &format_value(tick));
        }
        self.rect(left, top, right - left, bottom - top, "none", 0.0, Some("black"));
    }

    fn finish(self) -> String {
        format!(
            "<svg xmlns=\"http://www.w3.org/2000/svg\" width=\"{w}\" height=\"{h}\" viewBox=\"0 0 {w} {h}\">\n{body}</svg>\n",
            w = self.width,
            h = self.height,
            body = self.body
        )
    }
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn format_value(v: f64) -> String {
    if v.abs() >= 1_000_000.0 {
        format!("{:.1e}", v)
    } else if v.abs() >= 100.0 || v == v.trunc() {
        format!("{:.0}", v)
    } else {
        format!("{:.2}", v)
    }
}

fn value_domain(values: impl Iterator<Item = f64>) -> (f64, f64) {
    values.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)))
}

/// Timestamp ticks along the x axis, labels rotated 45°.
fn time_ticks(canvas: &mut Canvas, x_scale: &Scale) {
    let (_, _, _, bottom) = canvas.plot_area();
    for tick in x_scale.ticks(X_TICKS) {
        let x = x_scale.map(tick);
        canvas.line(x, bottom, x, bottom + 5.0, "black", 1.0);
        let label = chrono::DateTime::from_timestamp(tick as i64, 0)
            .map(|dt| dt.naive_utc().format(TIMESTAMP_FORMAT).to_string())
            .unwrap_or_default();
        canvas.rotated_text(x, bottom + 18.0, 10, -45.0, &label);
    }
}

/// Traffic over time with anomalies highlighted.
pub fn anomaly_chart(frame: &AnomalyFrame) -> String {
    let mut canvas = Canvas::new(2000.0, 1000.0);
    let (left, top, right, bottom) = canvas.plot_area();
    let summary = frame.summary();

    let band_lo = summary.mean - 2.0 * summary.std;
    let band_hi = summary.mean + 2.0 * summary.std;
    let (vmin, vmax) = value_domain(frame.points.iter().map(|p| p.y).chain([band_lo, band_hi]));
    let (tmin, tmax) = value_domain(frame.points.iter().map(|p| p.ds.and_utc().timestamp() as f64));

    let x_scale = Scale::new(tmin, tmax, left, right);
    let y_scale = Scale::new(vmin, vmax, bottom, top);

    canvas.axes(
        "Network Traffic Anomaly Detection",
        "Timestamp",
        "Network Load",
        &y_scale,
    );

    if frame.is_empty() {
        return canvas.finish();
    }

    // ±2σ band
    let (y_hi, y_lo) = (y_scale.map(band_hi), y_scale.map(band_lo));
    canvas.rect(left, y_hi, right - left, y_lo - y_hi, "gray", 0.2, None);

    let line: Vec<(f64, f64)> = frame
        .points
        .iter()
        .map(|p| (x_scale.map(p.ds.and_utc().timestamp() as f64), y_scale.map(p.y)))
        .collect();
    canvas.polyline(&line, "blue", 0.7);

    let anomalies = frame.anomalies();
    for p in &anomalies {
        canvas.circle(
            x_scale.map(p.ds.and_utc().timestamp() as f64),
            y_scale.map(p.y),
            7.0,
            "red",
        );
    }
    time_ticks(&mut canvas, &x_scale);

    // stats box
    let stats = [
        format!("Total Points: {}", summary.total_points),
        format!("Anomalies: {} ({:.2}%)", summary.anomalies, summary.anomaly_pct),
        format!("Mean Traffic: {:.2}", summary.mean),
        format!("Std Dev: {:.2}", summary.std),
    ];
    canvas.rect(left + 10.0, top + 10.0, 260.0, 20.0 * stats.len() as f64 + 12.0, "white", 0.8, Some("gray"));
    for (i, line) in stats.iter().enumerate() {
        canvas.text(left + 20.0, top + 30.0 + 20.0 * i as f64, 13, "start", line);
    }

    // legend
    let legend_x = right - 260.0;
    canvas.line(legend_x, top + 20.0, legend_x + 30.0, top + 20.0, "blue", 0.7);
    canvas.text(legend_x + 40.0, top + 24.0, 13, "start", "Network Traffic");
    canvas.circle(legend_x + 15.0, top + 45.0, 6.0, "red");
    canvas.text(
        legend_x + 40.0,
        top + 49.0,
        13,
        "start",
        &format!("Anomalies ({} points)", anomalies.len()),
    );
    canvas.rect(legend_x, top + 62.0, 30.0, 14.0, "gray", 0.2, None);
    canvas.text(legend_x + 40.0, top + 74.0, 13, "start", "Normal Range (±2σ)");

    canvas.finish()
}

/// Bar chart of anomalies per hour of day (0–23).
pub fn hourly_chart(analysis: &AnomalyAnalysis) -> String {
    let mut canvas = Canvas::new(1500.0, 600.0);
    let (left, _top, right, bottom) = canvas.plot_area();

    let max_count = analysis.hourly.values().copied().max().unwrap_or(0).max(1);
    let y_scale = Scale::new(0.0, max_count as f64, bottom, MARGIN_TOP);
    canvas.axes("Anomalies by Hour of Day", "Hour", "Number of Anomalies", &y_scale);

    let slot = (right - left) / 24.0;
    for hour in 0..24u32 {
        let x = left + slot * hour as f64;
        let count = analysis.hourly.get(&hour).copied().unwrap_or(0);
        if count > 0 {
            let y = y_scale.map(count as f64);
            canvas.rect(x + slot * 0.1, y, slot * 0.8, bottom - y, "steelblue", 1.0, None);
        }
        canvas.text(x + slot / 2.0, bottom + 18.0, 11, "middle", &hour.to_string());
    }

    canvas.finish()
}

/// Anomalous points over time, coloured from low (purple) to high (yellow).
pub fn intensity_chart(frame: &AnomalyFrame) -> String {
    let mut canvas = Canvas::new(1500.0, 600.0);
    let (left, top, right, bottom) = canvas.plot_area();
    let anomalies = frame.anomalies();

    let (vmin, vmax) = value_domain(anomalies.iter().map(|p| p.y));
    let (tmin, tmax) = value_domain(anomalies.iter().map(|p| p.ds.and_utc().timestamp() as f64));
    let (vmin, vmax) = if anomalies.is_empty() { (0.0, 1.0) } else { (vmin, vmax) };

    let y_scale = Scale::new(vmin, vmax, bottom, top);
    canvas.axes("Anomaly Intensity Over Time", "Timestamp", "Network Load", &y_scale);

    if anomalies.is_empty() {
        return canvas.finish();
    }

    let x_scale = Scale::new(tmin, tmax, left, right);
    let color_scale = Scale::new(vmin, vmax, 0.0, 1.0);
    for p in &anomalies {
        canvas.circle(
            x_scale.map(p.ds.and_utc().timestamp() as f64),
            y_scale.map(p.y),
            5.0,
            &viridis(color_scale.map(p.y)),
        );
    }
    time_ticks(&mut canvas, &x_scale);

    canvas.finish()
}

/// Approximate viridis colour for `t` in `[0, 1]`.
fn viridis(t: f64) -> String {
    const STOPS: [(f64, f64, f64); 5] = [
        (68.0, 1.0, 84.0),
        (59.0, 82.0, 139.0),
        (33.0, 145.0, 140.0),
        (94.0, 201.0, 98.0),
        (253.0, 231.0, 37.0),
    ];
    let t = t.clamp(0.0, 1.0) * (STOPS.len() - 1) as f64;
    let i = (t.floor() as usize).min(STOPS.len() - 2);
    let f = t - i as f64;
    let (a, b) = (STOPS[i], STOPS[i + 1]);
    let mix = |x: f64, y: f64| (x + (y - x) * f).round() as u8;
    format!("#{:02x}{:02x}{:02x}", mix(a.0, b.0), mix(a.1, b.1), mix(a.2, b.2))
}

/// Writes `svg` to `path`, creating the parent directory if needed.
pub fn save(path: &Path, svg: &str) -> Result<()> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create plot directory: {}", dir.display()))?;
            let meta = std::fs::metadata(dir)?;
            if meta.permissions().readonly() {
                bail!("Cannot write to the directory: {}", dir.display());
            }
        }
    }
    std::fs::write(path, svg).with_context(|| format!("Failed to write plot: {}", path.display()))?;
    Ok(())
}
