use serde::{Deserialize, Serialize};

use crate::{date::CivilDate, window::AmbiguityPolicy};

pub const DEFAULT_TOKEN_URL: &str = "https://digital.iservices.rte-france.com/token/oauth/";
pub const DEFAULT_CALENDAR_URL: &str = "https://digital.iservices.rte-france.com/open_api/tempo_like_supply_contract/v1/tempo_like_calendars";
pub const DEFAULT_TIMEZONE: &str = "CET-1CEST,M3.5.0,M10.5.0/3";
pub const DEFAULT_NTP_SERVER: &str = "pool.ntp.org";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub connect_timeout_secs: u32,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            connect_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeConfig {
    pub ntp_server: String,
    /// POSIX TZ rule string.
    pub timezone: String,
    pub sync_timeout_secs: u32,
    #[serde(default)]
    pub ambiguity: AmbiguityPolicy,
}

impl Default for TimeConfig {
    fn default() -> Self {
        Self {
            ntp_server: DEFAULT_NTP_SERVER.to_string(),
            timezone: DEFAULT_TIMEZONE.to_string(),
            sync_timeout_secs: 30,
            ambiguity: AmbiguityPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiConfig {
    pub token_url: String,
    pub calendar_url: String,
    /// Base64 `client_id:client_secret`, without the `Basic ` prefix.
    pub basic_auth: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            token_url: DEFAULT_TOKEN_URL.to_string(),
            calendar_url: DEFAULT_CALENDAR_URL.to_string(),
            basic_auth: String::new(),
        }
    }
}

/// Which days to ask about at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportConfig {
    #[serde(default)]
    pub custom_date: Option<CivilDate>,
    #[serde(default)]
    pub custom_offsets: Vec<i32>,
    #[serde(default)]
    pub today_offsets: Vec<i32>,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            custom_date: Some(CivilDate::new(2024, 2, 12)),
            custom_offsets: vec![-1, 0, 1],
            today_offsets: vec![0, 2],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub time: TimeConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub report: ReportConfig,
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.network.connect_timeout_secs = self.network.connect_timeout_secs.clamp(5, 300);
        self.time.sync_timeout_secs = self.time.sync_timeout_secs.clamp(5, 300);
        self.api.basic_auth = self.api.basic_auth.trim().to_string();
        if self.time.timezone.trim().is_empty() {
            self.time.timezone = DEFAULT_TIMEZONE.to_string();
        }
        if self.time.ntp_server.trim().is_empty() {
            self.time.ntp_server = DEFAULT_NTP_SERVER.to_string();
        }
    }

    pub fn has_station_credentials(&self) -> bool {
        !self.network.wifi_ssid.trim().is_empty()
    }
}
