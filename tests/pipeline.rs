use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use camino::Utf8PathBuf;
use pipebox::{
    Control, Executor, FnBox, Graph, GraphNode, Memory, Overrides, Proxy, Unit, Value,
};

fn names<T>(graph: &Graph<T>) -> BTreeSet<String> {
    graph
        .available_nodes()
        .into_iter()
        .map(|n| n.name().to_string())
        .collect()
}

fn set(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[test]
fn diamond_drains_in_waves() {
    let mut graph: Graph<()> = Graph::new();
    for name in ["A", "B", "C", "D"] {
        graph.add_node(GraphNode::empty(name)).unwrap();
    }
    for (from, to) in [("A", "B"), ("A", "C"), ("B", "D"), ("C", "D")] {
        graph.add_link(from, to).unwrap();
    }

    assert_eq!(names(&graph), set(&["A"]));
    graph.remove_node("A").unwrap();
    assert_eq!(names(&graph), set(&["B", "C"]));
    graph.remove_node("B").unwrap();
    assert_eq!(names(&graph), set(&["C"]));
    graph.remove_node("C").unwrap();
    assert_eq!(names(&graph), set(&["D"]));
    graph.remove_node("D").unwrap();
    assert!(graph.is_empty());
}

struct Pipeline {
    _temp: tempfile::TempDir,
    work: Utf8PathBuf,
    memory: Memory,
    runs: Arc<AtomicUsize>,
}

impl Pipeline {
    fn new() -> Self {
        let temp = tempfile::TempDir::new().unwrap();
        let dir = Utf8PathBuf::try_from(temp.path().to_path_buf()).unwrap();
        let work = dir.join("work");
        fs::create_dir(&work).unwrap();

        Self {
            memory: Memory::new(dir.join("cache")).unwrap(),
            _temp: temp,
            work,
            runs: Arc::default(),
        }
    }

    /// `source` writes a file, `count` and `shout` read it, `join` merges.
    fn graph(&self) -> Graph<Proxy<FnBox>> {
        let runs = self.runs.clone();
        let target = self.work.join("source.txt");
        let source = FnBox::new("demo.source", move |inputs| {
            runs.fetch_add(1, Ordering::SeqCst);
            let text = inputs.value("text").and_then(Value::as_str).unwrap_or_default();
            fs::write(&target, text)?;
            Ok(BTreeMap::from([("file".to_string(), Value::from(target.as_str()))]))
        })
        .input("text", Control::scalar().with_value("hello"))
        .output("file", Control::scalar().copy_to_cache());

        let runs = self.runs.clone();
        let count = FnBox::new("demo.count", move |inputs| {
            runs.fetch_add(1, Ordering::SeqCst);
            let path = inputs.value("file").and_then(Value::as_str).unwrap_or_default();
            let len = fs::read_to_string(path)?.len() as i64;
            Ok(BTreeMap::from([("len".to_string(), Value::Int(len))]))
        })
        .input("file", Control::scalar())
        .output("len", Control::scalar());

        let mut graph = Graph::new();
        for (name, unit) in [("source", source), ("count", count)] {
            let proxy = self.memory.cache(unit, false).unwrap();
            graph.add_node(GraphNode::new(name, proxy)).unwrap();
        }
        graph.add_link("source", "count").unwrap();
        graph
    }

    fn run(&self) -> BTreeMap<String, Proxy<FnBox>> {
        let file = self.work.join("source.txt");

        let (done, diagnostics) = Executor::new()
            .threads(2)
            .run(self.graph(), |name, unit| {
                let overrides = match name {
                    "count" => Overrides::from([("file".to_string(), Value::from(file.as_str()))]),
                    _ => Overrides::new(),
                };
                unit.call(overrides)?;
                Ok(())
            })
            .unwrap();

        assert_eq!(diagnostics.execution_times.len(), 2);
        done.into_iter()
            .map(|n| (n.name().to_string(), n.into_payload().unwrap()))
            .collect()
    }
}

#[test]
fn second_run_is_served_from_cache() {
    let pipeline = Pipeline::new();

    let first = pipeline.run();
    assert_eq!(pipeline.runs.load(Ordering::SeqCst), 2);
    assert_eq!(first["count"].outputs().value("len"), Some(&Value::Int(5)));

    // The restored file keeps its mtime, so `count` hashes the same.
    fs::remove_file(pipeline.work.join("source.txt")).unwrap();
    let second = pipeline.run();

    assert_eq!(pipeline.runs.load(Ordering::SeqCst), 2);
    assert_eq!(second["count"].outputs().value("len"), Some(&Value::Int(5)));
    assert_eq!(
        fs::read_to_string(pipeline.work.join("source.txt")).unwrap(),
        "hello"
    );
}

#[test]
fn clear_keeps_live_entries() {
    let pipeline = Pipeline::new();
    pipeline.run();

    let mut live = HashSet::new();
    for (_, node) in pipeline.run() {
        if let Proxy::Memorized(proxy) = node {
            live.insert(proxy.entry_dir().unwrap());
        }
    }

    assert_eq!(live.len(), 2);
    assert!(pipeline.memory.clear(&live).unwrap().is_empty());
    let removed = pipeline.memory.clear(&HashSet::new()).unwrap();
    assert_eq!(removed.len(), 2);
}

#[test]
fn failing_node_reports_its_name() {
    let pipeline = Pipeline::new();
    let mut graph = pipeline.graph();
    let broken = FnBox::new("demo.broken", |_| anyhow::bail!("no luck"));
    graph
        .add_node(GraphNode::new("broken", pipeline.memory.cache(broken, false).unwrap()))
        .unwrap();
    graph.add_link("count", "broken").unwrap();

    let file = pipeline.work.join("source.txt");
    let err = Executor::new()
        .run(graph, |name, unit| {
            let overrides = match name {
                "count" => Overrides::from([("file".to_string(), Value::from(file.as_str()))]),
                _ => Overrides::new(),
            };
            unit.call(overrides)?;
            Ok(())
        })
        .unwrap_err();

    assert!(matches!(&err, pipebox::ScheduleError::Node(name, _) if name == "broken"));
    let entry = match pipeline.memory.cache(
        FnBox::new("demo.broken", |_| Ok(BTreeMap::new())),
        false,
    ) {
        Ok(Proxy::Memorized(proxy)) => proxy.entry_dir().unwrap(),
        _ => panic!("memory is enabled"),
    };
    assert!(!entry.exists());
}
