use camino::Utf8PathBuf;
use thiserror::Error;

/// Structural violations rejected by [`Graph`](crate::Graph) before any
/// mutation is applied.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("Node '{0}' is already registered in the graph")]
    DuplicateNode(String),

    #[error("Node '{0}' is not registered in the graph")]
    UnknownNode(String),

    #[error("Node '{0}' can't depend on itself")]
    SelfLoop(String),

    #[error("Link '{from}' -> '{to}' would close a cycle")]
    Cycle { from: String, to: String },
}

/// Usage errors of the signal bus.
#[derive(Debug, Error)]
pub enum SignalError {
    #[error("Signal '{signal}' is not allowed, expected one of: {allowed}")]
    NotAllowed { signal: String, allowed: String },

    #[error("Couldn't serialize the payload of signal '{0}'.\n{1}")]
    Payload(String, serde_json::Error),
}

/// Errors of the result codec.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Non-finite float {0} can't be persisted")]
    NonFinite(f64),

    #[error("Malformed tuple record: {0}")]
    MalformedTuple(String),

    #[error("Unexpected result layout: {0}")]
    Layout(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Every way calling a box, cached or not, can fail.
///
/// The variants are disjoint so callers can tell a configuration mistake from
/// a broken cache entry or from the box itself failing.
#[derive(Debug, Error)]
pub enum BoxError {
    #[error("'{0}' is not a valid cache directory")]
    Config(Utf8PathBuf),

    #[error("Box '{id}' has no input named '{name}'")]
    UnknownInput { id: String, name: String },

    #[error("Box '{id}' failed.\n{source}")]
    Execution {
        id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Non-existing cache value (may have been cleared). File '{0}' does not exist")]
    Integrity(Utf8PathBuf),

    #[error("Can't restore file '{path}', access rights are not sufficient")]
    Restore {
        path: Utf8PathBuf,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Couldn't decode cache file '{path}'.\n{source}")]
    Codec {
        path: Utf8PathBuf,
        #[source]
        source: CodecError,
    },

    #[error("I/O error on '{path}'.\n{source}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Path is not valid UTF-8: {0}")]
    PathFormat(#[from] camino::FromPathBufError),
}

impl BoxError {
    pub(crate) fn io(path: impl Into<Utf8PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| BoxError::Io { path, source }
    }

    /// Returns the unchanged error raised by the box body, if that is what
    /// failed.
    pub fn execution(&self) -> Option<&anyhow::Error> {
        match self {
            BoxError::Execution { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Failure of a graph run driven by the [`Executor`](crate::Executor).
#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("Node '{0}':\n{1}")]
    Node(String, anyhow::Error),

    #[error("Couldn't start the worker pool.\n{0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),

    #[error("Invalid progress bar template.\n{0}")]
    Style(#[from] indicatif::style::TemplateError),

    #[error("Nodes {0:?} can never become available")]
    Stalled(Vec<String>),

    #[error("Worker channel closed before all nodes completed")]
    Disconnected,
}
