use thiserror::Error;

/// What the outer loop must do with a [`Fatal`] outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalAction {
    Restart,
    Halt,
}

/// Outcomes the core cannot recover from in place.
#[derive(Debug, Error)]
pub enum Fatal {
    #[error("{what} not ready within {timeout_secs}s")]
    Timeout {
        what: &'static str,
        timeout_secs: u32,
    },
    #[error("{what} failed to start: {reason}")]
    Service { what: &'static str, reason: String },
    #[error("access token unavailable: {0}")]
    NoToken(#[source] RequestError),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Fatal {
    pub fn action(&self) -> FatalAction {
        match self {
            Self::Timeout { .. } | Self::Service { .. } => FatalAction::Restart,
            Self::NoToken(_) | Self::Config(_) => FatalAction::Halt,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TzError {
    #[error("time zone string is empty")]
    Empty,
    #[error("unsupported time zone form `{0}`")]
    Unsupported(String),
    #[error("invalid time zone rule: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DateError {
    #[error("month {0} is outside 1..=12")]
    Month(u32),
    #[error("date {year}-{month:02} day {day} is out of the supported range")]
    OutOfRange { year: i32, month: u32, day: i32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WindowError {
    #[error(transparent)]
    Date(#[from] DateError),
    #[error("local midnight of {0} is ambiguous")]
    Ambiguous(chrono::NaiveDate),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimeError {
    #[error("time base not synchronized")]
    NotSynced,
    #[error("no time zone active")]
    NoTimeZone,
    #[error("time source error: {0}")]
    Source(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("wifi driver error: {0}")]
    Driver(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("response body exceeds {0} bytes")]
    BodyTooLarge(usize),
    #[error("i/o error: {0}")]
    Io(String),
}

#[derive(Debug, Error)]
pub enum RequestError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("unexpected HTTP status {0}")]
    Status(u16),
    #[error("malformed JSON body: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("invalid request URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("empty access token")]
    EmptyToken,
}

/// Why a single day produced no color.
#[derive(Debug, Error)]
pub enum ReportError {
    #[error(transparent)]
    Window(#[from] WindowError),
    #[error(transparent)]
    Time(#[from] TimeError),
    #[error(transparent)]
    Request(#[from] RequestError),
}
