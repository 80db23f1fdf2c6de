mod diagnostics;

use std::collections::HashSet;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::mpsc::channel;
use std::time::{Duration, Instant};

use indicatif::ProgressStyle;
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::error::ScheduleError;
use crate::graph::{Graph, GraphNode};
use crate::io::as_overhead;

pub use diagnostics::{Diagnostics, TaskExecution};

/// Message sent back by a worker: node name, payload, outcome, start, duration.
type Done<T> = (String, Option<T>, anyhow::Result<()>, Instant, Duration);

/// Drains a [`Graph`] by running every node as soon as all of its
/// predecessors have completed.
///
/// Ready nodes run concurrently on a rayon pool. The graph itself is only
/// ever touched by the scheduling thread, which removes each completed node
/// and polls [`Graph::available_nodes`] again.
#[derive(Debug, Clone, Default)]
pub struct Executor {
    threads: Option<usize>,
    progress: bool,
}

/// Nodes handed back by [`Executor::run`] in completion order, with their
/// payloads after the job ran on them.
pub type Completed<T> = Vec<GraphNode<T>>;

impl Executor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of worker threads, defaults to the number of CPUs.
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads.max(1));
        self
    }

    /// Shows a progress bar over the whole run.
    pub fn progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    /// Runs `job` over the payload of every node of `graph`.
    ///
    /// Nodes without a payload complete immediately. After the first failed
    /// job no new node is started; jobs already running are waited for and
    /// the failure is returned.
    pub fn run<T, F>(
        &self,
        mut graph: Graph<T>,
        job: F,
    ) -> Result<(Completed<T>, Diagnostics), ScheduleError>
    where
        T: Send,
        F: Fn(&str, &mut T) -> anyhow::Result<()> + Sync,
    {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.threads.unwrap_or(0))
            .thread_name(|i| format!("pipebox-{i}"))
            .build()?;

        let s = Instant::now();
        let mut diagnostics = Diagnostics::from_graph(&graph);
        let mut completed = Vec::with_capacity(graph.len());

        if graph.is_empty() {
            return Ok((completed, diagnostics));
        }

        let root_span = tracing::span!(Level::INFO, "running_graph");
        if self.progress {
            root_span.pb_set_length(graph.len() as u64);
            root_span.pb_set_style(&style_run()?);
            root_span.pb_set_message("Running nodes...");
        }
        let _enter = root_span.enter();

        let task_style = style_task()?;

        let job = &job;

        // The scheduling loop runs on the calling thread, every pool thread
        // is left to the jobs.
        let failure = pool.in_place_scope(|scope| -> Result<Option<ScheduleError>, ScheduleError> {
            let (sender, receiver) = channel::<Done<T>>();
            let mut running = HashSet::new();
            let mut failure = None;

            loop {
                if failure.is_none() {
                    let ready: Vec<String> = graph
                        .available_nodes()
                        .into_iter()
                        .map(|node| node.name().to_string())
                        .filter(|name| !running.contains(name))
                        .collect();

                    for name in ready {
                        let payload = graph
                            .get_mut(&name)
                            .and_then(GraphNode::take_payload);

                        running.insert(name.clone());
                        let sender = sender.clone();
                        let task_style = task_style.clone();

                        scope.spawn(move |_| {
                            let span = tracing::span!(Level::INFO, "node", name = %name);
                            span.pb_set_style(&task_style);
                            span.pb_set_message(&format!("Running {name}"));
                            let _enter = span.enter();

                            let start = Instant::now();
                            let mut payload = payload;
                            let result = match payload.as_mut() {
                                Some(payload) => guarded(|| job(&name, payload)),
                                None => Ok(()),
                            };
                            let duration = start.elapsed();

                            // The receiver only goes away once the scope is
                            // unwinding, nobody is left to report to.
                            let _ = sender.send((name, payload, result, start, duration));
                        });
                    }
                }

                if running.is_empty() {
                    break;
                }

                let (name, payload, result, start, duration) =
                    receiver.recv().map_err(|_| ScheduleError::Disconnected)?;
                running.remove(&name);

                match result {
                    Ok(()) => {
                        graph.remove_node(&name)?;
                        completed.push(match payload {
                            Some(payload) => GraphNode::new(name.clone(), payload),
                            None => GraphNode::empty(name.clone()),
                        });
                        diagnostics.record(name, TaskExecution { start, duration });
                        if self.progress {
                            root_span.pb_inc(1);
                        }
                    }
                    Err(err) => {
                        tracing::error!(node = %name, "{err:#}");
                        if failure.is_none() {
                            failure = Some(ScheduleError::Node(name, err));
                        }
                    }
                }
            }

            Ok(failure)
        })?;

        if let Some(err) = failure {
            return Err(err);
        }

        if !graph.is_empty() {
            let mut stalled: Vec<String> = graph.nodes().map(|n| n.name().to_string()).collect();
            stalled.sort();
            return Err(ScheduleError::Stalled(stalled));
        }

        tracing::info!("Ran {} nodes {}", completed.len(), as_overhead(s));
        Ok((completed, diagnostics))
    }
}

/// Runs `f`, turning a panic into an error.
fn guarded(f: impl FnOnce() -> anyhow::Result<()>) -> anyhow::Result<()> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(panic) => {
            let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                format!("Job panicked: {s}")
            } else if let Some(s) = panic.downcast_ref::<String>() {
                format!("Job panicked: {s}")
            } else {
                String::from("Job panicked with unknown payload")
            };

            Err(anyhow::anyhow!(msg))
        }
    }
}

fn style_run() -> Result<ProgressStyle, ScheduleError> {
    Ok(ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")?
        .progress_chars("=>-"))
}

fn style_task() -> Result<ProgressStyle, ScheduleError> {
    Ok(ProgressStyle::with_template("{spinner:.green} {msg}")?)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn diamond() -> Graph<u32> {
        let mut graph = Graph::new();
        for (name, value) in [("A", 1), ("B", 2), ("C", 3), ("D", 4)] {
            graph.add_node(GraphNode::new(name, value)).unwrap();
        }
        for (from, to) in [("A", "B"), ("A", "C"), ("B", "D"), ("C", "D")] {
            graph.add_link(from, to).unwrap();
        }
        graph
    }

    #[test]
    fn test_runs_in_dependency_order() {
        let order = Mutex::new(Vec::new());

        let (completed, diagnostics) = Executor::new()
            .threads(4)
            .run(diamond(), |name, value| {
                *value *= 10;
                order.lock().unwrap().push(name.to_string());
                Ok(())
            })
            .unwrap();

        let order = order.into_inner().unwrap();
        let at = |n: &str| order.iter().position(|x| x == n).unwrap();
        assert_eq!(order.len(), 4);
        assert!(at("A") < at("B") && at("A") < at("C"));
        assert!(at("B") < at("D") && at("C") < at("D"));

        let last = completed.last().unwrap();
        assert_eq!(last.name(), "D");
        assert_eq!(last.payload(), Some(&40));
        assert_eq!(diagnostics.execution_times.len(), 4);
    }

    #[test]
    fn test_failure_stops_dispatch() {
        let runs = AtomicUsize::new(0);

        let err = Executor::new()
            .run(diamond(), |name, _| {
                runs.fetch_add(1, Ordering::SeqCst);
                if name == "B" {
                    anyhow::bail!("broken");
                }
                Ok(())
            })
            .unwrap_err();

        assert!(matches!(&err, ScheduleError::Node(name, _) if name == "B"));
        // D never starts
        assert!(runs.load(Ordering::SeqCst) <= 3);
    }

    #[test]
    fn test_panic_is_reported() {
        let err = Executor::new()
            .run(diamond(), |name, _| {
                if name == "A" {
                    panic!("kaboom");
                }
                Ok(())
            })
            .unwrap_err();

        assert!(err.to_string().contains("kaboom"));
    }

    #[test]
    fn test_empty_nodes_pass_through() {
        let mut graph: Graph<u32> = Graph::new();
        graph.add_node(GraphNode::empty("group")).unwrap();
        graph.add_node(GraphNode::new("work", 1)).unwrap();
        graph.add_link("group", "work").unwrap();

        let (completed, _) = Executor::new().run(graph, |_, _| Ok(())).unwrap();
        let names: Vec<&str> = completed.iter().map(GraphNode::name).collect();
        assert_eq!(names, ["group", "work"]);
    }

    #[test]
    fn test_empty_graph() {
        let (completed, diagnostics) = Executor::new()
            .run(Graph::<u32>::new(), |_, _| Ok(()))
            .unwrap();
        assert!(completed.is_empty());
        assert!(diagnostics.execution_times.is_empty());
    }
}
