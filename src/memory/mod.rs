//! On-disk memoization of box calls.
//!
//! A [`Memory`] owns one cache root, `<root>/casper_memory`, and hands out
//! proxies around boxes. Entries are laid out as
//! `<box id segments>/<input hash>/` and hold `result.json`,
//! `file_mapping.json` and the output files copied into the cache.

mod fingerprint;
mod locks;
mod proxy;

use std::collections::HashSet;
use std::fmt::Display;
use std::fs;
use std::time::SystemTime;

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::BoxError;
use crate::unit::Unit;

pub use self::fingerprint::{file_fingerprint, fingerprint, hashed_inputs};
pub use self::proxy::{MemorizedBox, Proxy, UnMemorizedBox};
use self::proxy::{RESULT_FILE, STAGING_PREFIX};

/// Name of the directory created under the root handed to [`Memory::new`].
pub const CACHE_DIR: &str = "casper_memory";

/// Cache shared by every box of a run.
///
/// Proxies created from the same `Memory` share its reference timestamp.
/// Concurrent calls resolving to the same entry run the box once, whichever
/// `Memory` or process they come from: entries are locked on disk.
#[derive(Debug, Clone)]
pub struct Memory {
    root: Option<Utf8PathBuf>,
    timestamp: SystemTime,
}

impl Memory {
    /// Enables caching under `root/casper_memory`, creating it if needed.
    pub fn new(root: impl AsRef<Utf8Path>) -> Result<Self, BoxError> {
        let root = root.as_ref();
        if root.as_str().is_empty() || (root.exists() && !root.is_dir()) {
            return Err(BoxError::Config(root.to_path_buf()));
        }

        let absolute = std::path::absolute(root).map_err(BoxError::io(root))?;
        let dir = Utf8PathBuf::try_from(absolute)?.join(CACHE_DIR);

        fs::create_dir_all(&dir).map_err(|_| BoxError::Config(dir.clone()))?;
        if !dir.is_dir() {
            return Err(BoxError::Config(dir));
        }

        tracing::debug!(root = %dir, "Memory enabled");

        Ok(Self {
            root: Some(dir),
            timestamp: SystemTime::now(),
        })
    }

    /// A memory that never persists anything.
    pub fn disabled() -> Self {
        Self {
            root: None,
            timestamp: SystemTime::now(),
        }
    }

    pub fn from_option(root: Option<impl AsRef<Utf8Path>>) -> Result<Self, BoxError> {
        match root {
            Some(root) => Self::new(root),
            None => Ok(Self::disabled()),
        }
    }

    /// The `casper_memory` directory, `None` when caching is disabled.
    pub fn root(&self) -> Option<&Utf8Path> {
        self.root.as_deref()
    }

    pub fn is_enabled(&self) -> bool {
        self.root.is_some()
    }

    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    /// Wraps `unit` in the proxy matching this memory.
    pub fn cache<B: Unit>(&self, unit: B, verbose: bool) -> Result<Proxy<B>, BoxError> {
        Ok(match &self.root {
            Some(root) => Proxy::Memorized(MemorizedBox::new(
                unit,
                root.clone(),
                Some(self.timestamp),
                verbose,
            )?),
            None => Proxy::UnMemorized(UnMemorizedBox::new(unit, verbose)),
        })
    }

    /// Same as [`Memory::cache`] for a box that is already wrapped: the old
    /// proxy is dropped and the box it held is wrapped again.
    pub fn cache_proxy<B: Unit>(&self, proxy: Proxy<B>, verbose: bool) -> Result<Proxy<B>, BoxError> {
        self.cache(proxy.into_inner(), verbose)
    }

    /// Deletes every entry of the cache tree not listed in `skip`, returning
    /// the deleted entry directories.
    ///
    /// An entry is a leaf directory holding a `result.json`. Entries still
    /// being written by a running box, empty box directories left by failed
    /// runs and lock files are left alone.
    pub fn clear(&self, skip: &HashSet<Utf8PathBuf>) -> Result<Vec<Utf8PathBuf>, BoxError> {
        let Some(root) = &self.root else {
            return Ok(Vec::new());
        };

        let mut leaves = Vec::new();
        let mut stack = vec![root.clone()];

        while let Some(dir) = stack.pop() {
            let mut children = Vec::new();
            for entry in dir.read_dir_utf8().map_err(BoxError::io(&dir))? {
                let entry = entry.map_err(BoxError::io(&dir))?;
                let is_dir = entry.file_type().map_err(BoxError::io(entry.path()))?.is_dir();
                if is_dir {
                    children.push(entry.into_path());
                }
            }

            if children.is_empty() {
                if dir != *root && dir.join(RESULT_FILE).is_file() {
                    leaves.push(dir);
                }
            } else {
                stack.extend(
                    children
                        .into_iter()
                        .filter(|c| !c.file_name().is_some_and(|n| n.starts_with(STAGING_PREFIX))),
                );
            }
        }

        let mut removed = Vec::new();
        for dir in leaves {
            if skip.contains(&dir) {
                continue;
            }
            fs::remove_dir_all(&dir).map_err(BoxError::io(&dir))?;
            tracing::debug!(entry = %dir, "Memory entry removed");
            removed.push(dir);
        }

        removed.sort();
        Ok(removed)
    }
}

impl Display for Memory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.root {
            Some(root) => write!(f, "Memory(cachedir={root})"),
            None => write!(f, "Memory(cachedir=None)"),
        }
    }
}
