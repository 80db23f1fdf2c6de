use std::collections::HashMap;
use std::fmt::{Display, Formatter, Write};
use std::time::{Duration, Instant};

use crate::graph::Graph;

#[derive(Debug, Clone)]
pub struct TaskExecution {
    pub start: Instant,
    pub duration: Duration,
}

/// Timings of a graph run.
///
/// Returned by [`Executor::run`](crate::Executor::run) together with the
/// structure of the graph as it was before the run.
#[derive(Debug, Default)]
pub struct Diagnostics {
    /// Execution metrics of every node that completed.
    pub execution_times: HashMap<String, TaskExecution>,
    nodes: Vec<String>,
    links: Vec<(String, String)>,
}

impl Diagnostics {
    pub(crate) fn from_graph<T>(graph: &Graph<T>) -> Self {
        let mut nodes: Vec<String> = graph.nodes().map(|n| n.name().to_string()).collect();
        nodes.sort();

        let mut links = Vec::new();
        for from in &nodes {
            for to in graph.successors(from).unwrap_or_default() {
                links.push((from.clone(), to.to_string()));
            }
        }

        Self {
            execution_times: HashMap::new(),
            nodes,
            links,
        }
    }

    pub(crate) fn record(&mut self, name: String, execution: TaskExecution) {
        self.execution_times.insert(name, execution);
    }

    /// Sum of the run time of every node.
    pub fn total(&self) -> Duration {
        self.execution_times.values().map(|t| t.duration).sum()
    }

    /// Renders the graph as a Mermaid diagram, color-coded by execution duration.
    ///
    /// * **Green**: Fast
    /// * **Yellow**: Moderate
    /// * **Red**: Slow
    /// * **Grey**: Never ran
    pub fn render_mermaid(&self) -> String {
        let mut f = String::new();
        let _ = writeln!(f, "graph LR");

        let (min_time, max_time) = self.bounds();

        for (i, name) in self.nodes.iter().enumerate() {
            let label = name.replace('"', "\\\"");

            let (extra, color) = match self.execution_times.get(name) {
                Some(exec) => {
                    let t = (exec.duration.as_secs_f64() - min_time) / (max_time - min_time);
                    (format!("{:.2?}", exec.duration), heat(t))
                }
                None => ("Skipped".to_string(), "#D3D3D3".to_string()),
            };

            let _ = writeln!(f, "    {i}[\"{label}\\n{extra}\"]");
            let _ = writeln!(f, "    style {i} fill:{color}");
        }

        for (from, to) in &self.links {
            let a = self.nodes.iter().position(|n| n == from);
            let b = self.nodes.iter().position(|n| n == to);
            if let (Some(a), Some(b)) = (a, b) {
                let _ = writeln!(f, "    {a} --> {b}");
            }
        }

        f
    }

    fn bounds(&self) -> (f64, f64) {
        let mut min_time = f64::MAX;
        let mut max_time = f64::MIN;

        for t in self.execution_times.values() {
            let secs = t.duration.as_secs_f64();
            min_time = min_time.min(secs);
            max_time = max_time.max(secs);
        }

        if min_time > max_time {
            min_time = 0.0;
            max_time = 0.0;
        }

        // all nodes took the same time
        if (max_time - min_time).abs() < f64::EPSILON {
            max_time = min_time + 1.0;
        }

        (min_time, max_time)
    }

    /// Renders a waterfall chart of the run as an SVG string.
    pub fn render_waterfall(&self) -> String {
        let mut ran: Vec<(&str, &TaskExecution)> = self
            .execution_times
            .iter()
            .map(|(k, v)| (k.as_str(), v))
            .collect();

        let Some(stats) = TimelineStats::from_tasks(&mut ran) else {
            return r#"<svg width="200" height="50" xmlns="http://www.w3.org/2000/svg"><text x="10" y="30" font-family="sans-serif">No nodes ran</text></svg>"#
                .to_string();
        };

        let layout = WaterfallLayout::default();
        let mut svg = String::with_capacity(ran.len() * 500);

        let _ = write!(
            svg,
            r#"<svg width="{}" height="{}" xmlns="http://www.w3.org/2000/svg"><style>text {{ font-family: sans-serif; font-size: 12px; }} .bar {{ fill: #3b82f6; }} .time {{ fill: #666; font-size: 11px; }}</style><rect width="100%" height="100%" fill="white" />"#,
            layout.total_width(),
            layout.total_height(ran.len())
        );
        let _ = write_rows(&mut svg, &layout, &stats, &ran);
        svg.push_str("</svg>");

        svg
    }
}

/// Green through yellow to red for `t` in `0.0..=1.0`.
fn heat(t: f64) -> String {
    let (r, g) = if t < 0.5 {
        ((255.0 * t * 2.0) as u8, 255)
    } else {
        (255, (255.0 * (1.0 - (t - 0.5) * 2.0)) as u8)
    };

    format!("#{r:02X}{g:02X}00")
}

// WATERFALL

struct XmlSafe<'a>(&'a str);

impl Display for XmlSafe<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for c in self.0.chars() {
            match c {
                '<' => f.write_str("&lt;")?,
                '>' => f.write_str("&gt;")?,
                '&' => f.write_str("&amp;")?,
                '"' => f.write_str("&quot;")?,
                '\'' => f.write_str("&apos;")?,
                _ => f.write_char(c)?,
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct WaterfallLayout {
    row_height: u32,
    label_width: u32,
    chart_width: u32,
    padding: u32,
    header_height: u32,
    text_space: u32,
}

impl Default for WaterfallLayout {
    fn default() -> Self {
        Self {
            row_height: 30,
            label_width: 300,
            chart_width: 800,
            padding: 10,
            header_height: 30,
            text_space: 80,
        }
    }
}

impl WaterfallLayout {
    fn total_width(&self) -> u32 {
        self.label_width + self.chart_width + (self.padding * 3) + self.text_space
    }

    fn total_height(&self, count: usize) -> u32 {
        self.header_height + (count as u32 * self.row_height) + self.padding
    }
}

struct TimelineStats {
    global_start: Instant,
    total_micros: f64,
}

impl TimelineStats {
    /// Sorts `tasks` by start time, `None` when nothing ran.
    fn from_tasks(tasks: &mut [(&str, &TaskExecution)]) -> Option<Self> {
        tasks.sort_by_key(|(name, t)| (t.start, *name));

        let global_start = tasks.first()?.1.start;
        let global_end = tasks.iter().map(|(_, t)| t.start + t.duration).max()?;
        let total_micros = global_end.duration_since(global_start).as_micros().max(1) as f64;

        Some(Self {
            global_start,
            total_micros,
        })
    }

    fn format_duration(micros: f64) -> String {
        if micros < 1000.0 {
            format!("{micros:.0}µs")
        } else {
            format!("{:.2}ms", micros / 1000.0)
        }
    }
}

fn write_rows(
    buf: &mut String,
    layout: &WaterfallLayout,
    stats: &TimelineStats,
    tasks: &[(&str, &TaskExecution)],
) -> std::fmt::Result {
    for (i, (name, exec)) in tasks.iter().enumerate() {
        let name = XmlSafe(name);
        let y_pos = layout.header_height + (i as u32 * layout.row_height);
        let y_center = y_pos + (layout.row_height / 2);

        write!(
            buf,
            r#"<text x="{}" y="{}" dominant-baseline="middle">{}</text>"#,
            layout.padding, y_center, name
        )?;

        let offset = exec.start.duration_since(stats.global_start).as_micros() as f64;
        let micros = exec.duration.as_micros() as f64;

        let x = layout.label_width as f64
            + layout.padding as f64
            + (offset / stats.total_micros * layout.chart_width as f64);
        let w = (micros / stats.total_micros * layout.chart_width as f64).max(1.0);

        write!(
            buf,
            r#"<rect x="{x:.1}" y="{}" width="{w:.1}" height="{}" class="bar"><title>{name}: {:.2?}</title></rect>"#,
            y_pos + 5,
            layout.row_height - 10,
            exec.duration
        )?;
        write!(
            buf,
            r#"<text x="{:.1}" y="{y_center}" class="time" dominant-baseline="middle">{}</text>"#,
            x + w + 5.0,
            TimelineStats::format_duration(micros)
        )?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphNode;

    #[test]
    fn test_mermaid_marks_skipped_nodes() {
        let mut graph: Graph<()> = Graph::new();
        graph.add_node(GraphNode::empty("a")).unwrap();
        graph.add_node(GraphNode::empty("b")).unwrap();
        graph.add_link("a", "b").unwrap();

        let mut diagnostics = Diagnostics::from_graph(&graph);
        diagnostics.record(
            "a".into(),
            TaskExecution {
                start: Instant::now(),
                duration: Duration::from_millis(3),
            },
        );

        let chart = diagnostics.render_mermaid();
        assert!(chart.starts_with("graph LR\n"));
        assert!(chart.contains("1[\"b\\nSkipped\"]"));
        assert!(chart.contains("0 --> 1"));
        assert_eq!(diagnostics.total(), Duration::from_millis(3));
    }

    #[test]
    fn test_waterfall() {
        let empty = Diagnostics::default();
        assert!(empty.render_waterfall().contains("No nodes ran"));

        let mut diagnostics = Diagnostics::default();
        diagnostics.record(
            "<x>".into(),
            TaskExecution {
                start: Instant::now(),
                duration: Duration::from_micros(250),
            },
        );

        let svg = diagnostics.render_waterfall();
        assert!(svg.contains("&lt;x&gt;"));
        assert!(svg.ends_with("</svg>"));
    }
}
