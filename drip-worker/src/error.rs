use drip_common::store;
use thiserror::Error;

/// Enumeration of errors for one downstream API call, after the client's
/// internal transport retries have been exhausted.
#[derive(Error, Debug)]
pub enum DownstreamError {
    #[error("request to {endpoint} could not be delivered after {attempts} attempts: {message}")]
    Transport {
        endpoint: String,
        attempts: u32,
        message: String,
    },
    #[error("{endpoint} returned {status}: {message}")]
    UpstreamStatus {
        endpoint: String,
        status: u16,
        message: String,
        body: Option<String>,
    },
    #[error("{endpoint} returned a 2xx response that is not JSON: {message}")]
    Decode { endpoint: String, message: String },
}

impl DownstreamError {
    /// Whether a later attempt could plausibly succeed. 429 and 5xx are
    /// transient by contract; other 4xx responses are the caller's fault
    /// and retrying cannot fix them.
    pub fn is_retryable(&self) -> bool {
        match self {
            DownstreamError::Transport { .. } => true,
            DownstreamError::UpstreamStatus { status, .. } => *status == 429 || *status >= 500,
            DownstreamError::Decode { .. } => false,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            DownstreamError::UpstreamStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Why a single job execution did not produce a result. Determines whether
/// the scheduler spends another attempt from the job's budget.
#[derive(Error, Debug)]
pub enum JobError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("missing required parameters: {}", .0.join(", "))]
    MissingParams(Vec<&'static str>),
    #[error(transparent)]
    Downstream(#[from] DownstreamError),
}

impl JobError {
    pub fn is_retryable(&self) -> bool {
        match self {
            JobError::UnknownTool(_) | JobError::MissingParams(_) => false,
            JobError::Downstream(error) => error.is_retryable(),
        }
    }
}

/// Enumeration of errors related to initialization and consumption of jobs.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("a store error occurred while running the worker")]
    StoreError(#[from] store::StoreError),
}
