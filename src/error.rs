use std::time::Duration;

/// Rejections raised while validating a run plan. Nothing is sent when one of
/// these comes back.
#[derive(thiserror::Error, Debug)]
pub enum PlanError {
    #[error("-c cannot be smaller than 1.")]
    Concurrency,
    #[error("-n cannot be less than -c.")]
    CountBelowConcurrency { count: usize, concurrency: usize },
    #[error("-t must be greater than 0.")]
    Duration,
    #[error("when async is set, qps is required.")]
    AsyncWithoutRateLimit,
    #[error("invalid proxy url '{0}'")]
    Proxy(String),
    #[error("could not build http client - {0}")]
    Client(#[source] reqwest::Error),
}

/// Failures turning a template plus variant into a sendable request.
#[derive(thiserror::Error, Debug)]
pub enum BuildError {
    #[error("form body is not a flat string mapping - {0}")]
    FormMapping(#[from] serde_json::Error),
    #[error("form body has no usable field ({dropped} dropped)")]
    FormUnusable { dropped: usize },
    #[error("invalid header value for {0}")]
    Header(&'static str),
}

/// Per-request transport failures. Always terminal for the attempt.
#[derive(thiserror::Error, Debug)]
pub enum DispatchError {
    #[error("request timeout after {0:?}")]
    Timeout(Duration),
    #[error("connection failure - {0}")]
    Connect(#[source] reqwest::Error),
    #[error("transport failure - {0}")]
    Transport(#[source] reqwest::Error),
    #[error("response body read failure - {0}")]
    Body(#[source] reqwest::Error),
    #[error(transparent)]
    Build(#[from] BuildError),
}

impl DispatchError {
    pub(crate) fn from_reqwest(err: reqwest::Error, timeout: Option<Duration>) -> Self {
        if err.is_timeout() {
            return DispatchError::Timeout(timeout.unwrap_or_default());
        }
        if err.is_connect() {
            return DispatchError::Connect(err);
        }
        DispatchError::Transport(err)
    }
}
