pub mod config;
pub mod date;
pub mod error;
pub mod link;
pub mod pipeline;
pub mod posix_tz;
pub mod tempo;
pub mod timebase;
pub mod watchdog;
pub mod window;

pub use config::{ApiConfig, NetworkConfig, ReportConfig, RuntimeConfig, TimeConfig};
pub use date::CivilDate;
pub use error::{Fatal, FatalAction, ReportError, RequestError, TransportError};
pub use link::{ConnectivitySupervisor, DisconnectReason, LinkEvent, LinkState, WifiDriver};
pub use pipeline::{run_pipeline, DayReport, PipelineReport, ReportSection};
pub use posix_tz::PosixTimeZone;
pub use tempo::{AccessToken, DayColor, HttpResponse, HttpTransport, TempoApi};
pub use timebase::{TimeBase, TimeSource};
pub use watchdog::{Clock, SystemClock, Watchdog};
pub use window::{resolve_window, AmbiguityPolicy, DateWindow};
