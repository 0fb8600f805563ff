//! RTE "Tempo Like Supply Contract" client: OAuth token and day colors.

use std::{fmt, time::Duration};

use serde::Deserialize;
use url::Url;

use crate::{
    error::{RequestError, TransportError},
    window::DateWindow,
};

/// Every request gives up after this long.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(1);

/// Upper bound on a response body kept in memory.
pub const MAX_RESPONSE_BYTES: usize = 4096;

/// Label returned to callers when the API has no color for a date.
pub const UNDEFINED_LABEL: &str = "UNDEFINED";

const STATUS_OK: u16 = 200;
const STATUS_BAD_REQUEST: u16 = 400;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

/// One blocking GET per call, on a fresh connection.
pub trait HttpTransport {
    fn get(
        &mut self,
        url: &str,
        headers: &[(&str, &str)],
        timeout: Duration,
    ) -> Result<HttpResponse, TransportError>;
}

#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn new(value: impl Into<String>) -> Result<Self, RequestError> {
        let value = value.into();
        if value.is_empty() {
            return Err(RequestError::EmptyToken);
        }
        Ok(Self(value))
    }

    pub fn value(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shown: String = self.0.chars().take(6).collect();
        write!(f, "AccessToken({shown}…)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DayColor {
    Color(String),
    Undefined,
}

impl DayColor {
    pub fn label(&self) -> &str {
        match self {
            Self::Color(label) => label,
            Self::Undefined => UNDEFINED_LABEL,
        }
    }
}

impl fmt::Display for DayColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct CalendarResponse {
    #[serde(default)]
    tempo_like_calendars: Option<Calendars>,
}

#[derive(Debug, Deserialize)]
struct Calendars {
    #[serde(default)]
    values: Option<Vec<Option<CalendarValue>>>,
}

#[derive(Debug, Deserialize)]
struct CalendarValue {
    #[serde(default)]
    value: Option<String>,
}

/// Request engine over some [`HttpTransport`]. Requests run one at a time.
pub struct TempoApi<T> {
    transport: T,
}

impl<T: HttpTransport> TempoApi<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn acquire_token(
        &mut self,
        token_url: &str,
        basic_auth: &str,
    ) -> Result<AccessToken, RequestError> {
        let authorization = format!("Basic {basic_auth}");
        let response = self.transport.get(
            token_url,
            &[
                ("Authorization", authorization.as_str()),
                ("Accept", "application/json"),
            ],
            REQUEST_TIMEOUT,
        )?;

        if response.status != STATUS_OK {
            log::warn!("token request answered HTTP {}", response.status);
            return Err(RequestError::Status(response.status));
        }

        let token: TokenResponse = serde_json::from_slice(&response.body)?;
        AccessToken::new(token.access_token)
    }

    pub fn day_color(
        &mut self,
        window: &DateWindow,
        token: &AccessToken,
        calendar_url: &str,
    ) -> Result<DayColor, RequestError> {
        let url = calendar_query_url(calendar_url, window)?;
        let authorization = format!("Bearer {}", token.value());
        log::debug!("GET {url}");

        let response = self.transport.get(
            &url,
            &[
                ("Authorization", authorization.as_str()),
                ("Accept", "application/json"),
            ],
            REQUEST_TIMEOUT,
        )?;

        match response.status {
            STATUS_OK => {
                log::debug!("payload: {}", String::from_utf8_lossy(&response.body));
                let calendar: CalendarResponse = serde_json::from_slice(&response.body)?;
                let value = calendar
                    .tempo_like_calendars
                    .and_then(|calendars| calendars.values)
                    .and_then(|values| values.into_iter().next().flatten())
                    .and_then(|entry| entry.value);
                Ok(value.map_or(DayColor::Undefined, DayColor::Color))
            }
            // The API answers 400 for dates it has no classification for.
            STATUS_BAD_REQUEST => Ok(DayColor::Undefined),
            status => {
                log::warn!("calendar request answered HTTP {status}");
                Err(RequestError::Status(status))
            }
        }
    }
}

/// `calendar_url` with `start_date` and `end_date` appended to its query.
pub fn calendar_query_url(calendar_url: &str, window: &DateWindow) -> Result<String, RequestError> {
    let mut url = Url::parse(calendar_url)?;
    url.query_pairs_mut()
        .append_pair("start_date", &window.start_iso())
        .append_pair("end_date", &window.end_iso());
    Ok(url.into())
}
