use std::path::PathBuf;

use thiserror::Error;

/// Failures of the disk-backed shared namespace.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Key cannot be encoded in an entry name.
    #[error("unsupported key {0:?}: keys must be int, non-empty str without '/', or bool")]
    UnsupportedKey(String),

    /// Entry name or array header does not follow `<tag>:<key>:<p|a|d>`.
    #[error("corrupt store entry {path}: {reason}")]
    CorruptEntry { path: PathBuf, reason: String },

    #[error("no entry {key} in namespace {namespace}")]
    NotFound { namespace: PathBuf, key: String },

    #[error("entry {key} is a {found}, not a {expected}")]
    WrongKind {
        key: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("array {key} holds {found}, requested {expected}")]
    DtypeMismatch {
        key: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("array shape {found:?} does not match {expected:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    /// Another handle already holds the array open for mutation.
    #[error("array {0} is already held by a writer")]
    WriterBusy(PathBuf),

    #[error("namespace {0} was attached read-only")]
    ReadOnly(PathBuf),

    #[error("record codec error: {0}")]
    Codec(#[from] bincode::Error),
}

impl StoreError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Invalid imaging setup, detected before any job is dispatched.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("invalid image parameter: {0}")]
    Image(String),

    #[error("invalid kernel parameter: {0}")]
    Kernel(String),

    #[error("unsupported polarisation setup: {0}")]
    Polarisation(String),

    #[error("unsupported solution mode: {0}")]
    Solutions(String),

    #[error("invalid parallel setup: {0}")]
    Parallel(String),

    #[error("failed to read configuration {path}: {reason}")]
    File { path: PathBuf, reason: String },
}

/// Programming-contract violations between the orchestrator, the engines and
/// their buffers. These are bugs, never user errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ContractError {
    #[error("{name}: expected shape {expected:?}, found {found:?}")]
    Shape {
        name: &'static str,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error("{0} buffer is not contiguous in standard layout")]
    NotContiguous(&'static str),

    #[error("antenna arrays have {antennas} rows but uvw has {rows}")]
    AntennaRows { antennas: usize, rows: usize },

    #[error("unsupported correlation count {0}")]
    Correlations(usize),

    #[error("kernel set is missing {0}")]
    MissingKernel(&'static str),

    #[error("channel {chan} maps to band {band}, grid has {nbands} bands")]
    ChannelMapping {
        chan: usize,
        band: usize,
        nbands: usize,
    },
}

#[derive(Error, Debug)]
pub enum SolutionError {
    #[error("failed to read solutions {path}: {reason}")]
    File { path: PathBuf, reason: String },

    #[error("solution shape mismatch: {0}")]
    Shape(String),

    #[error("cannot merge solution sets: {0}")]
    Merge(String),

    #[error("solution set has no time intervals")]
    Empty,

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum JobError {
    #[error("job {label} failed: {message}")]
    Failed { label: String, message: String },

    #[error("job {label} panicked: {message}")]
    Panicked { label: String, message: String },

    #[error("job {label} names unknown handler {handler}")]
    UnknownHandler { label: String, handler: String },

    #[error("worker pool is shut down")]
    PoolClosed,
}

/// Top-level error of the facet pipeline.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("pipeline is in state {found}, expected {expected}")]
    InvalidState {
        expected: &'static str,
        found: String,
    },

    #[error(transparent)]
    Job(#[from] JobError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Contract(#[from] ContractError),

    #[error(transparent)]
    Solutions(#[from] SolutionError),

    #[error("FFT failure: {0}")]
    Fft(String),

    #[error("cache I/O error at {path}: {source}")]
    Cache {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
