//! Configuration options.
//!
//! Tapwire reads its runtime options (memory caps for reassembly, stream and correlation timeouts,
//! output queue sizing and the set of targeted endpoints) from a TOML file whose path is typically
//! a command line argument passed to the application. A handful of tunables can additionally be
//! overridden from the environment with [RuntimeConfig::apply_env], which is applied once at
//! startup.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Overrides the total buffered-bytes cap across all connections.
pub const ENV_MAX_BUFFERED_BYTES_TOTAL: &str = "TAPWIRE_MAX_BUFFERED_BYTES_TOTAL";
/// Overrides the per-connection buffered-bytes cap.
pub const ENV_MAX_BUFFERED_BYTES_PER_CONNECTION: &str = "TAPWIRE_MAX_BUFFERED_BYTES_PER_CONNECTION";
/// Overrides the correlator expiry window (in milliseconds).
pub const ENV_CONNECTION_TIMEOUT_MS: &str = "TAPWIRE_CONNECTION_TIMEOUT_MS";
/// Overrides the unclassified-stream timeout (in milliseconds).
pub const ENV_TCP_CHANNEL_TIMEOUT_MS: &str = "TAPWIRE_TCP_CHANNEL_TIMEOUT_MS";
/// Overrides the unclassified-stream sweep interval (in milliseconds).
pub const ENV_CLOSE_TIMEDOUT_CHANNELS_INTERVAL_MS: &str =
    "TAPWIRE_CLOSE_TIMEDOUT_CHANNELS_INTERVAL_MS";

/// Lower bound of the unclassified-stream sweep interval (in milliseconds).
pub const MIN_SWEEP_INTERVAL_MS: u64 = 10;
/// Upper bound of the unclassified-stream sweep interval (in milliseconds).
pub const MAX_SWEEP_INTERVAL_MS: u64 = 10_000;

/// Errors raised while loading or validating a configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Loads and validates a configuration file from `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<RuntimeConfig, ConfigError> {
    let path = path.as_ref();
    let config_str = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_owned(),
        source,
    })?;
    let config: RuntimeConfig = toml::from_str(&config_str)?;
    config.validate()?;
    Ok(config)
}

/// Loads a default configuration.
///
/// Targets every observed connection and keeps every tunable at its default:
/// ```toml
/// targets = []
///
/// [assembly]
///     max_buffered_bytes_total = 9_500_000
///     max_buffered_bytes_per_connection = 9_500_000
///
/// [streams]
///     tcp_channel_timeout_ms = 10_000
///     close_timedout_channels_interval_ms = 1000
///
/// [correlation]
///     connection_timeout_ms = 10_000
/// ```
pub fn default_config() -> RuntimeConfig {
    RuntimeConfig::default()
}

/* --------------------------------------------------------------------------------- */

/// Runtime configuration options.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct RuntimeConfig {
    /// Endpoints of interest, as `host` or `host:port` authorities. An empty list targets every
    /// connection. Defaults to `[]`.
    #[serde(default)]
    pub targets: Vec<String>,

    /// Reassembly engine settings.
    #[serde(default)]
    pub assembly: AssemblyConfig,

    /// Stream lifecycle settings.
    #[serde(default)]
    pub streams: StreamsConfig,

    /// Request/response correlation settings.
    #[serde(default)]
    pub correlation: CorrelationConfig,

    /// Output queue settings.
    #[serde(default)]
    pub output: OutputConfig,

    /// Offline capture file settings.
    #[serde(default)]
    pub offline: OfflineConfig,
}

impl RuntimeConfig {
    /// Applies the `TAPWIRE_*` environment overrides.
    ///
    /// Values that fail to parse are ignored with a warning and the configured value is kept.
    pub fn apply_env(&mut self) {
        env_override(
            ENV_MAX_BUFFERED_BYTES_TOTAL,
            &mut self.assembly.max_buffered_bytes_total,
        );
        env_override(
            ENV_MAX_BUFFERED_BYTES_PER_CONNECTION,
            &mut self.assembly.max_buffered_bytes_per_connection,
        );
        env_override(
            ENV_CONNECTION_TIMEOUT_MS,
            &mut self.correlation.connection_timeout_ms,
        );
        env_override(
            ENV_TCP_CHANNEL_TIMEOUT_MS,
            &mut self.streams.tcp_channel_timeout_ms,
        );
        env_override(
            ENV_CLOSE_TIMEDOUT_CHANNELS_INTERVAL_MS,
            &mut self.streams.close_timedout_channels_interval_ms,
        );
    }

    /// Rejects inconsistent settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let assembly = &self.assembly;
        if assembly.max_buffered_bytes_per_connection > assembly.max_buffered_bytes_total {
            return Err(ConfigError::Invalid(format!(
                "per-connection buffer cap ({}) exceeds the total cap ({})",
                assembly.max_buffered_bytes_per_connection, assembly.max_buffered_bytes_total
            )));
        }
        if assembly.timeout_resolution == 0 {
            return Err(ConfigError::Invalid(
                "timeout resolution must be positive".to_owned(),
            ));
        }
        if assembly.timeout_resolution > assembly.stale_timeout {
            return Err(ConfigError::Invalid(format!(
                "timeout resolution ({} ms) must not exceed the stale connection timeout ({} ms)",
                assembly.timeout_resolution, assembly.stale_timeout
            )));
        }
        if self.streams.reader_queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "reader queue capacity must be positive".to_owned(),
            ));
        }
        if self.output.sink_capacity == 0 {
            return Err(ConfigError::Invalid(
                "sink capacity must be positive".to_owned(),
            ));
        }
        if self.correlation.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "correlation max attempts must be positive".to_owned(),
            ));
        }
        Ok(())
    }
}

fn env_override<T>(name: &str, value: &mut T)
where
    T: FromStr + std::fmt::Display,
{
    if let Ok(raw) = env::var(name) {
        match raw.trim().parse::<T>() {
            Ok(parsed) => {
                log::info!("{} overrides configured value {} with {}", name, value, parsed);
                *value = parsed;
            }
            Err(_) => log::warn!("Ignoring unparsable {}={:?}, keeping {}", name, raw, value),
        }
    }
}

/* --------------------------------------------------------------------------------- */

/// Reassembly engine options.
///
/// Both buffer caps count payload bytes held out of order, waiting for missing data. Exceeding
/// either cap forces the offending connection to flush its oldest buffered data past the gap.
///
/// ## Example
/// ```toml
/// [assembly]
///     max_connections = 1_000_000
///     max_buffered_bytes_total = 9_500_000
///     max_buffered_bytes_per_connection = 9_500_000
///     stale_timeout = 10_000
///     timeout_resolution = 100
///     reject_fsm_errors = false
///     allow_missing_init = true
/// ```
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct AssemblyConfig {
    /// Maximum number of connections tracked simultaneously per source. Defaults to `1_000_000`.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Cap on out-of-order bytes buffered across all connections. Defaults to `9_500_000`.
    #[serde(default = "default_max_buffered_bytes")]
    pub max_buffered_bytes_total: usize,

    /// Cap on out-of-order bytes buffered by a single connection. Defaults to `9_500_000`.
    #[serde(default = "default_max_buffered_bytes")]
    pub max_buffered_bytes_per_connection: usize,

    /// A connection can be inactive for up to this amount of time (in milliseconds) before it is
    /// flushed and closed. Defaults to `10_000`.
    #[serde(default = "default_stale_timeout")]
    pub stale_timeout: usize,

    /// Frequency to check for inactive connections (in milliseconds). Defaults to `100`.
    #[serde(default = "default_timeout_resolution")]
    pub timeout_resolution: usize,

    /// Drop segments that violate the handshake/teardown state machine. Defaults to `false`
    /// (counted and tolerated).
    #[serde(default)]
    pub reject_fsm_errors: bool,

    /// Drop segments whose options are inconsistent with the connection. Defaults to `false`
    /// (counted and tolerated).
    #[serde(default)]
    pub reject_option_errors: bool,

    /// Verify TCP checksums and drop segments that fail. Defaults to `false`.
    #[serde(default)]
    pub verify_checksum: bool,

    /// Accept connections whose handshake was never observed. Defaults to `true`.
    #[serde(default = "default_allow_missing_init")]
    pub allow_missing_init: bool,
}

impl Default for AssemblyConfig {
    fn default() -> Self {
        AssemblyConfig {
            max_connections: default_max_connections(),
            max_buffered_bytes_total: default_max_buffered_bytes(),
            max_buffered_bytes_per_connection: default_max_buffered_bytes(),
            stale_timeout: default_stale_timeout(),
            timeout_resolution: default_timeout_resolution(),
            reject_fsm_errors: false,
            reject_option_errors: false,
            verify_checksum: false,
            allow_missing_init: default_allow_missing_init(),
        }
    }
}

fn default_max_connections() -> usize {
    1_000_000
}

fn default_max_buffered_bytes() -> usize {
    // 5000 pages of 1900 bytes
    5000 * 1900
}

fn default_stale_timeout() -> usize {
    10_000
}

fn default_timeout_resolution() -> usize {
    100
}

fn default_allow_missing_init() -> bool {
    true
}

/* --------------------------------------------------------------------------------- */

/// Stream lifecycle options.
///
/// ## Example
/// ```toml
/// [streams]
///     tcp_channel_timeout_ms = 10_000
///     close_timedout_channels_interval_ms = 1000
///     reader_idle_timeout_ms = 120_000
///     reader_queue_capacity = 1024
///     identify_only = false
/// ```
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct StreamsConfig {
    /// Streams still unclassified this long after creation are closed (in milliseconds).
    /// Defaults to `10_000`.
    #[serde(default = "default_tcp_channel_timeout_ms")]
    pub tcp_channel_timeout_ms: u64,

    /// Interval between sweeps for unclassified streams (in milliseconds). Bounded to
    /// `[10, 10_000]`; out of range values fall back to `1000`.
    #[serde(default = "default_close_timedout_channels_interval_ms")]
    pub close_timedout_channels_interval_ms: u64,

    /// A reader with no new data for this long reports end of stream (in milliseconds).
    /// Defaults to `120_000`.
    #[serde(default = "default_reader_idle_timeout_ms")]
    pub reader_idle_timeout_ms: u64,

    /// Number of byte ranges queued per reader before further data for that direction is
    /// dropped. Defaults to `1024`.
    #[serde(default = "default_reader_queue_capacity")]
    pub reader_queue_capacity: usize,

    /// Classify and correlate without forwarding anything to the output. Defaults to `false`.
    #[serde(default)]
    pub identify_only: bool,
}

impl StreamsConfig {
    /// Unclassified-stream timeout.
    pub fn channel_timeout(&self) -> Duration {
        Duration::from_millis(self.tcp_channel_timeout_ms)
    }

    /// Unclassified-stream sweep interval, bounded to the supported range.
    pub fn sweep_interval(&self) -> Duration {
        let ms = self.close_timedout_channels_interval_ms;
        if (MIN_SWEEP_INTERVAL_MS..=MAX_SWEEP_INTERVAL_MS).contains(&ms) {
            Duration::from_millis(ms)
        } else {
            log::warn!(
                "Sweep interval {} ms outside [{}, {}], using {} ms",
                ms,
                MIN_SWEEP_INTERVAL_MS,
                MAX_SWEEP_INTERVAL_MS,
                default_close_timedout_channels_interval_ms()
            );
            Duration::from_millis(default_close_timedout_channels_interval_ms())
        }
    }

    /// Reader idle timeout.
    pub fn reader_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.reader_idle_timeout_ms)
    }
}

impl Default for StreamsConfig {
    fn default() -> Self {
        StreamsConfig {
            tcp_channel_timeout_ms: default_tcp_channel_timeout_ms(),
            close_timedout_channels_interval_ms: default_close_timedout_channels_interval_ms(),
            reader_idle_timeout_ms: default_reader_idle_timeout_ms(),
            reader_queue_capacity: default_reader_queue_capacity(),
            identify_only: false,
        }
    }
}

fn default_tcp_channel_timeout_ms() -> u64 {
    10_000
}

fn default_close_timedout_channels_interval_ms() -> u64 {
    1000
}

fn default_reader_idle_timeout_ms() -> u64 {
    120_000
}

fn default_reader_queue_capacity() -> usize {
    1024
}

/* --------------------------------------------------------------------------------- */

/// Request/response correlation options.
///
/// ## Example
/// ```toml
/// [correlation]
///     connection_timeout_ms = 10_000
///     clean_period_ms = 1000
///     max_attempts = 16
/// ```
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct CorrelationConfig {
    /// Unmatched halves older than this are expired (in milliseconds). Defaults to `10_000`.
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,

    /// Interval between expiry sweeps (in milliseconds). Defaults to `1000`.
    #[serde(default = "default_clean_period_ms")]
    pub clean_period_ms: u64,

    /// Number of times a key may be re-registered by the same half before the held entry is
    /// discarded. Defaults to `16`.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl CorrelationConfig {
    /// Correlator expiry window.
    pub fn expiry_window(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    /// Expiry sweep period.
    pub fn clean_period(&self) -> Duration {
        Duration::from_millis(self.clean_period_ms.max(1))
    }
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        CorrelationConfig {
            connection_timeout_ms: default_connection_timeout_ms(),
            clean_period_ms: default_clean_period_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

fn default_connection_timeout_ms() -> u64 {
    10_000
}

fn default_clean_period_ms() -> u64 {
    1000
}

fn default_max_attempts() -> u32 {
    16
}

/* --------------------------------------------------------------------------------- */

/// Output queue options.
///
/// ## Example
/// ```toml
/// [output]
///     sink_capacity = 65_536
/// ```
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct OutputConfig {
    /// Number of output items queued before new items are dropped. Defaults to `65_536`.
    #[serde(default = "default_sink_capacity")]
    pub sink_capacity: usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        OutputConfig {
            sink_capacity: default_sink_capacity(),
        }
    }
}

fn default_sink_capacity() -> usize {
    65_536
}

/* --------------------------------------------------------------------------------- */

/// Offline capture file options.
///
/// ## Example
/// ```toml
/// [offline]
///     mtu = 9702
/// ```
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct OfflineConfig {
    /// Maximum frame size, equivalent to MTU on a live interface. Larger frames are skipped.
    /// Defaults to `9702`.
    #[serde(default = "default_mtu")]
    pub mtu: usize,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        OfflineConfig { mtu: default_mtu() }
    }
}

fn default_mtu() -> usize {
    9702
}
