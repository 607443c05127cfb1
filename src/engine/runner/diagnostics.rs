use std::collections::HashMap;
use std::fmt::{Display, Formatter, Write};
use std::time::Duration;

use crate::blueprint::Blueprint;
use crate::engine::runner::StepExecution;
use crate::engine::schedule::RunStep;

/// Timings of the run-steps of a run.
#[derive(Debug, Default)]
pub struct Diagnostics {
    pub execution_times: HashMap<RunStep, StepExecution>,
}

impl Diagnostics {
    /// Sum of the durations of all steps.
    pub fn total(&self) -> Duration {
        self.execution_times.values().map(|e| e.duration).sum()
    }

    /// The `count` slowest steps, slowest first.
    pub fn slowest(&self, count: usize) -> Vec<(RunStep, Duration)> {
        let mut steps: Vec<_> = self
            .execution_times
            .iter()
            .map(|(step, e)| (*step, e.duration))
            .collect();
        steps.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        steps.truncate(count);
        steps
    }

    /// Renders the steps in execution order as an SVG waterfall chart.
    pub fn render_waterfall(&self, blueprint: &Blueprint) -> String {
        let mut steps: Vec<(&RunStep, &StepExecution)> = self.execution_times.iter().collect();
        if steps.is_empty() {
            return r#"<svg width="200" height="50" xmlns="http://www.w3.org/2000/svg"><text x="10" y="30" font-family="sans-serif">No steps ran</text></svg>"#.to_string();
        }
        steps.sort_by_key(|(_, e)| e.start);

        let layout = Layout::default();
        let start = steps[0].1.start;
        let end = steps
            .iter()
            .map(|(_, e)| e.start + e.duration)
            .max()
            .unwrap_or(start);
        let total = end.duration_since(start).as_micros().max(1) as f64;

        let mut svg = String::with_capacity(steps.len() * 400);
        let _ = write!(
            svg,
            r#"<svg width="{}" height="{}" xmlns="http://www.w3.org/2000/svg"><style>text {{ font-family: sans-serif; font-size: 12px; }} .init {{ fill: #10b981; }} .build {{ fill: #3b82f6; }}</style><rect width="100%" height="100%" fill="white" />"#,
            layout.width(),
            layout.header + steps.len() as u32 * layout.row
        );

        for (i, (step, execution)) in steps.iter().enumerate() {
            let y = layout.header + i as u32 * layout.row;
            let label = XmlSafe(&step.token(blueprint)).to_string();

            let offset = execution.start.duration_since(start).as_micros() as f64;
            let x = (layout.label + layout.padding) as f64 + offset / total * layout.chart as f64;
            let w = (execution.duration.as_micros() as f64 / total * layout.chart as f64).max(1.0);

            let _ = write!(
                svg,
                r#"<text x="{}" y="{}" dominant-baseline="middle">{}</text><rect x="{x:.1}" y="{}" width="{w:.1}" height="{}" class="{}"><title>{}: {:.2?}</title></rect>"#,
                layout.padding,
                y + layout.row / 2,
                label,
                y + 5,
                layout.row - 10,
                step.kind(),
                label,
                execution.duration,
            );
        }

        svg.push_str("</svg>");
        svg
    }
}

#[derive(Debug, Clone, Copy)]
struct Layout {
    row: u32,
    label: u32,
    chart: u32,
    padding: u32,
    header: u32,
}

impl Default for Layout {
    fn default() -> Self {
        Self {
            row: 24,
            label: 360,
            chart: 800,
            padding: 10,
            header: 10,
        }
    }
}

impl Layout {
    fn width(&self) -> u32 {
        self.label + self.chart + self.padding * 3
    }
}

struct XmlSafe<'a>(&'a str);

impl Display for XmlSafe<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for c in self.0.chars() {
            match c {
                '<' => f.write_str("&lt;")?,
                '>' => f.write_str("&gt;")?,
                '&' => f.write_str("&amp;")?,
                '"' => f.write_str("&quot;")?,
                _ => f.write_char(c)?,
            }
        }
        Ok(())
    }
}
