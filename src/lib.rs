#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

pub mod codec;
mod control;
mod error;
mod executor;
mod graph;
mod hash;
mod io;
#[cfg(feature = "logging")]
pub mod logging;
mod memory;
mod signal;
mod unit;
mod value;

pub use crate::control::{Control, Controls, Flags, Shape};
pub use crate::error::*;
pub use crate::executor::{Completed, Diagnostics, Executor, TaskExecution};
pub use crate::graph::{GRAPH_SIGNALS, Graph, GraphNode, Position};
pub use crate::memory::{
    CACHE_DIR, MemorizedBox, Memory, Proxy, UnMemorizedBox, file_fingerprint, fingerprint,
    hashed_inputs,
};
pub use crate::signal::{LIST_SIGNALS, Observable, ObservableList, Observer, Signal};
pub use crate::unit::{FnBox, Overrides, Report, Unit, signature};
pub use crate::value::{NdArray, Value};
