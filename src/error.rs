use thiserror::Error;

/// Problems found while turning a scenario document into a runnable plan.
///
/// Every variant is fatal: the run never starts.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("scenario `{0}` is declared more than once")]
    DuplicateScenario(String),

    #[error("no scenarios declared")]
    NoScenarios,

    #[error("scenario `{scenario}`: unknown executor `{executor}`")]
    UnknownExecutor { scenario: String, executor: String },

    #[error("scenario `{scenario}`: missing required field `{field}`")]
    MissingField {
        scenario: String,
        field: &'static str,
    },

    #[error("scenario `{scenario}`: `{field}` does not apply to {executor}")]
    UnsupportedField {
        scenario: String,
        executor: &'static str,
        field: &'static str,
    },

    #[error("scenario `{scenario}`: preAllocatedVUs ({pre_allocated}) exceeds maxVUs ({max})")]
    PreAllocatedExceedsMax {
        scenario: String,
        pre_allocated: u64,
        max: u64,
    },

    #[error("scenario `{scenario}`: {reason}")]
    InvalidStages { scenario: String, reason: String },

    #[error("scenario `{scenario}`: exec function `{function}` is not defined")]
    UnknownFunction { scenario: String, function: String },

    #[error("{context}: invalid duration `{value}`")]
    InvalidDuration { context: String, value: String },

    #[error("function `{function}`: fixture `{fixture}` is not defined")]
    UnknownFixture { function: String, fixture: String },

    #[error("function `{function}`: fixture `{fixture}` is {actual}, expected {expected}")]
    FixtureKind {
        function: String,
        fixture: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("function `{function}`: {reason}")]
    InvalidStep { function: String, reason: String },

    #[error("invalid template `{template}`: {reason}")]
    InvalidTemplate { template: String, reason: String },

    #[error("threshold `{metric}: {expression}`: {reason}")]
    InvalidThreshold {
        metric: String,
        expression: String,
        reason: String,
    },
}

/// Failure of a single outbound request. Recorded as a failed sample, never propagated.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("request timeout")]
    Timeout,

    #[error("reading response body failed: {0}")]
    Body(String),
}
