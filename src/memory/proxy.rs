use std::collections::BTreeMap;
use std::fmt::Display;
use std::fs;
use std::io::ErrorKind;
use std::time::{Instant, SystemTime};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::codec;
use crate::control::Controls;
use crate::error::{BoxError, CodecError};
use crate::io::{as_duration, copy_with_mtime, is_writable_dir};
use crate::memory::fingerprint::input_hash;
use crate::memory::locks::EntryLock;
use crate::unit::{Overrides, Report, Unit, apply_overrides, signature};
use crate::value::Value;

pub(crate) const RESULT_FILE: &str = "result.json";
pub(crate) const MAPPING_FILE: &str = "file_mapping.json";
pub(crate) const STAGING_PREFIX: &str = ".staging-";

macro_rules! note {
    ($verbose:expr, $($arg:tt)+) => {
        if $verbose {
            tracing::info!($($arg)+)
        } else {
            tracing::debug!($($arg)+)
        }
    };
}

/// Pairs of `(workspace file, cached copy)` stored next to a result.
#[derive(Debug, Default, Serialize, Deserialize)]
struct FileMapping(Vec<(Utf8PathBuf, Utf8PathBuf)>);

/// Proxy running the wrapped box on every call, never touching the disk.
#[derive(Debug, Clone)]
pub struct UnMemorizedBox<B> {
    inner: B,
    verbose: bool,
}

impl<B: Unit> UnMemorizedBox<B> {
    pub fn new(inner: B, verbose: bool) -> Self {
        Self { inner, verbose }
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }

    pub fn into_inner(self) -> B {
        self.inner
    }
}

impl<B: Unit> Unit for UnMemorizedBox<B> {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn inputs(&self) -> &Controls {
        self.inner.inputs()
    }

    fn inputs_mut(&mut self) -> &mut Controls {
        self.inner.inputs_mut()
    }

    fn outputs(&self) -> &Controls {
        self.inner.outputs()
    }

    fn outputs_mut(&mut self) -> &mut Controls {
        self.inner.outputs_mut()
    }

    fn execute(&mut self) -> anyhow::Result<Report> {
        self.inner.execute()
    }

    fn call(&mut self, overrides: Overrides) -> Result<Report, BoxError> {
        apply_overrides(&mut self.inner, overrides)?;

        let id = self.inner.id().to_string();
        note!(
            self.verbose,
            "[NoMemory] Calling {}",
            signature(&id, &self.inner.inputs().values())
        );

        let start = Instant::now();
        let report = self
            .inner
            .execute()
            .map_err(|source| BoxError::Execution { id, source })?;

        note!(self.verbose, "[NoMemory] Done in {}", as_duration(start));
        Ok(report)
    }
}

impl<B: Unit> Display for UnMemorizedBox<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "UnMemorizedBox({})", self.inner.id())
    }
}

/// Proxy serving repeated calls with identical inputs from the cache.
///
/// Every call resolves to an entry directory
/// `root/<id segments>/<input hash>/`. When it exists, the stored result and
/// files are restored; otherwise the box runs and its result is persisted.
/// An entry only ever appears once fully written: it is assembled in a
/// staging directory that is renamed into place on success and deleted on
/// failure.
///
/// Calls resolving to the same entry are serialized through a lock file next
/// to it, across threads and processes alike, so the box runs at most once
/// per entry.
#[derive(Debug)]
pub struct MemorizedBox<B> {
    inner: B,
    root: Utf8PathBuf,
    timestamp: SystemTime,
    verbose: bool,
}

impl<B: Unit> MemorizedBox<B> {
    /// Wraps `inner` with a cache rooted at the existing directory `root`.
    ///
    /// `timestamp` is the reference time reported in traces, defaults to now.
    pub fn new(
        inner: B,
        root: impl Into<Utf8PathBuf>,
        timestamp: Option<SystemTime>,
        verbose: bool,
    ) -> Result<Self, BoxError> {
        let root = root.into();
        if root.as_str().is_empty() || !root.is_dir() {
            return Err(BoxError::Config(root));
        }

        Ok(Self {
            inner,
            root,
            timestamp: timestamp.unwrap_or_else(SystemTime::now),
            verbose,
        })
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }

    pub fn into_inner(self) -> B {
        self.inner
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    /// Directory holding every entry of this box, one level per dotted
    /// segment of its id.
    pub fn box_dir(&self) -> Utf8PathBuf {
        let mut path = self.root.clone();
        path.extend(self.inner.id().split('.').filter(|s| !s.is_empty()));
        path
    }

    /// Entry directory the current inputs map to, whether or not it exists.
    pub fn entry_dir(&self) -> Result<Utf8PathBuf, BoxError> {
        let hash = input_hash(self.inner.inputs()).map_err(|source| BoxError::Codec {
            path: self.box_dir(),
            source,
        })?;

        Ok(self.box_dir().join(hash.to_hex()))
    }

    fn since_start(&self) -> f64 {
        self.timestamp
            .elapsed()
            .map(|d| d.as_secs_f64())
            .unwrap_or_default()
    }

    fn compute(&mut self, entry: &Utf8Path, sig: &str) -> Result<Report, BoxError> {
        let parent = entry.parent().unwrap_or(self.root.as_path()).to_path_buf();
        fs::create_dir_all(&parent).map_err(BoxError::io(&parent))?;

        // Dropping the staging directory deletes it, which is what happens
        // on every early return below.
        let staging = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempdir_in(&parent)
            .map_err(BoxError::io(&parent))?;
        let staging_dir = Utf8PathBuf::try_from(staging.path().to_path_buf())?;

        note!(self.verbose, at = self.since_start(), "[Memory] Calling {sig}");
        let start = Instant::now();

        let report = self
            .inner
            .execute()
            .map_err(|source| BoxError::Execution {
                id: self.inner.id().to_string(),
                source,
            })?;

        let mapping = self.copy_files(&staging_dir, entry)?;

        let result_path = staging_dir.join(RESULT_FILE);
        let text = codec::to_string_pretty(&report.to_value()).map_err(|source| {
            BoxError::Codec {
                path: entry.join(RESULT_FILE),
                source,
            }
        })?;
        fs::write(&result_path, text).map_err(BoxError::io(&result_path))?;

        let mapping_path = staging_dir.join(MAPPING_FILE);
        let text = serde_json::to_string(&mapping).map_err(|e| BoxError::Codec {
            path: entry.join(MAPPING_FILE),
            source: e.into(),
        })?;
        fs::write(&mapping_path, text).map_err(BoxError::io(&mapping_path))?;

        match fs::rename(&staging_dir, entry) {
            Ok(()) => {}
            // Another process published the same entry first. Both hold the
            // result of identical inputs, so theirs stays and ours goes.
            Err(_) if entry.join(RESULT_FILE).is_file() => {
                tracing::debug!(entry = %entry, "[Memory] Entry already published");
            }
            Err(e) => return Err(BoxError::Io {
                path: entry.to_path_buf(),
                source: e,
            }),
        }

        note!(self.verbose, "[Memory] Done in {}", as_duration(start));
        Ok(report)
    }

    /// Copies every existing file referenced by an output flagged for it
    /// into `staging`, recording where it will live once published.
    fn copy_files(&self, staging: &Utf8Path, entry: &Utf8Path) -> Result<FileMapping, BoxError> {
        let mut files = Vec::new();
        for (_, control) in self.inner.outputs().iter() {
            for value in control.copied_values() {
                collect_files(value, &mut files);
            }
        }

        let mut mapping = FileMapping::default();
        let mut taken = std::collections::HashSet::new();

        for file in files {
            let base = file.file_name().unwrap_or("file");
            let mut name = base.to_string();
            let mut n = 1;
            while !taken.insert(name.clone()) {
                name = format!("{n}-{base}");
                n += 1;
            }

            let target = staging.join(&name);
            copy_with_mtime(file, &target).map_err(BoxError::io(file))?;
            mapping.0.push((file.to_path_buf(), entry.join(&name)));
        }

        Ok(mapping)
    }

    fn restore(&mut self, entry: &Utf8Path, sig: &str) -> Result<Report, BoxError> {
        note!(self.verbose, at = self.since_start(), "[Memory] Loading {sig}");

        let mapping_path = entry.join(MAPPING_FILE);
        let mapping: FileMapping = serde_json::from_str(&read_entry_file(&mapping_path)?)
            .map_err(|e| BoxError::Codec {
                path: mapping_path.clone(),
                source: CodecError::from(e),
            })?;

        let result_path = entry.join(RESULT_FILE);
        let report = codec::from_str(&read_entry_file(&result_path)?)
            .and_then(Report::from_value)
            .map_err(|source| BoxError::Codec {
                path: result_path.clone(),
                source,
            })?;

        for (workspace, cached) in &mapping.0 {
            restore_file(cached, workspace)?;
        }

        let outputs = self.inner.outputs_mut();
        for (name, value) in &report.outputs {
            outputs.set(name, value.clone());
        }

        Ok(report)
    }
}

fn read_entry_file(path: &Utf8Path) -> Result<String, BoxError> {
    fs::read_to_string(path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => BoxError::Integrity(path.to_path_buf()),
        _ => BoxError::Io {
            path: path.to_path_buf(),
            source: e,
        },
    })
}

fn restore_file(cached: &Utf8Path, workspace: &Utf8Path) -> Result<(), BoxError> {
    if !cached.is_file() {
        return Err(BoxError::Integrity(cached.to_path_buf()));
    }

    let writable = workspace.parent().is_some_and(is_writable_dir);
    if !writable {
        return Err(BoxError::Restore {
            path: workspace.to_path_buf(),
            source: None,
        });
    }

    copy_with_mtime(cached, workspace).map_err(|e| BoxError::Restore {
        path: workspace.to_path_buf(),
        source: Some(e),
    })
}

/// Strings naming an existing file anywhere inside `value`.
fn collect_files<'a>(value: &'a Value, acc: &mut Vec<&'a Utf8Path>) {
    match value {
        Value::Str(s) => {
            let path = Utf8Path::new(s);
            if path.is_file() {
                acc.push(path);
            }
        }
        Value::List(items) | Value::Tuple(items) => {
            for item in items {
                collect_files(item, acc);
            }
        }
        Value::Map(map) => {
            for item in map.values() {
                collect_files(item, acc);
            }
        }
        _ => {}
    }
}

impl<B: Unit> Unit for MemorizedBox<B> {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn inputs(&self) -> &Controls {
        self.inner.inputs()
    }

    fn inputs_mut(&mut self) -> &mut Controls {
        self.inner.inputs_mut()
    }

    fn outputs(&self) -> &Controls {
        self.inner.outputs()
    }

    fn outputs_mut(&mut self) -> &mut Controls {
        self.inner.outputs_mut()
    }

    /// Runs the wrapped box directly, bypassing the cache.
    fn execute(&mut self) -> anyhow::Result<Report> {
        self.inner.execute()
    }

    fn call(&mut self, overrides: Overrides) -> Result<Report, BoxError> {
        apply_overrides(&mut self.inner, overrides)?;

        let entry = self.entry_dir()?;
        let inputs: BTreeMap<String, Value> = self.inner.inputs().values();
        let sig = signature(self.inner.id(), &inputs);

        // Checked only once the lock is held: whoever held it before may have
        // just published this entry.
        let _lock = EntryLock::acquire(&entry)?;

        if entry.is_dir() {
            self.restore(&entry, &sig)
        } else {
            self.compute(&entry, &sig)
        }
    }
}

impl<B: Unit> Display for MemorizedBox<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MemorizedBox({}, base_dir={})", self.inner.id(), self.root)
    }
}

/// Either proxy, as handed out by [`Memory::cache`](crate::Memory::cache).
#[derive(Debug)]
pub enum Proxy<B> {
    Memorized(MemorizedBox<B>),
    UnMemorized(UnMemorizedBox<B>),
}

impl<B: Unit> Proxy<B> {
    pub fn is_memorized(&self) -> bool {
        matches!(self, Proxy::Memorized(_))
    }

    pub fn inner(&self) -> &B {
        match self {
            Proxy::Memorized(proxy) => proxy.inner(),
            Proxy::UnMemorized(proxy) => proxy.inner(),
        }
    }

    /// The wrapped box, without any proxy around it.
    pub fn into_inner(self) -> B {
        match self {
            Proxy::Memorized(proxy) => proxy.into_inner(),
            Proxy::UnMemorized(proxy) => proxy.into_inner(),
        }
    }

    fn as_unit(&self) -> &dyn Unit {
        match self {
            Proxy::Memorized(proxy) => proxy,
            Proxy::UnMemorized(proxy) => proxy,
        }
    }

    fn as_unit_mut(&mut self) -> &mut dyn Unit {
        match self {
            Proxy::Memorized(proxy) => proxy,
            Proxy::UnMemorized(proxy) => proxy,
        }
    }
}

impl<B: Unit> Unit for Proxy<B> {
    fn id(&self) -> &str {
        self.as_unit().id()
    }

    fn inputs(&self) -> &Controls {
        self.as_unit().inputs()
    }

    fn inputs_mut(&mut self) -> &mut Controls {
        self.as_unit_mut().inputs_mut()
    }

    fn outputs(&self) -> &Controls {
        self.as_unit().outputs()
    }

    fn outputs_mut(&mut self) -> &mut Controls {
        self.as_unit_mut().outputs_mut()
    }

    fn execute(&mut self) -> anyhow::Result<Report> {
        self.as_unit_mut().execute()
    }

    fn call(&mut self, overrides: Overrides) -> Result<Report, BoxError> {
        self.as_unit_mut().call(overrides)
    }
}

impl<B: Unit> Display for Proxy<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Proxy::Memorized(proxy) => proxy.fmt(f),
            Proxy::UnMemorized(proxy) => proxy.fmt(f),
        }
    }
}
