//! Configuration layer: typed settings with layered precedence (file → env → CLI).
//!
//! Server, logging and store problems abort startup with a [`LoadError`].
//! Invalid cache settings never do: they are kept in [`Settings::cache_error`]
//! and the cache runs disabled.

use std::{
    collections::BTreeMap,
    net::SocketAddr,
    num::NonZeroU32,
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::cache::{CacheConfig, CacheError, CompressionConfig, DebugFlags, Timeouts};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "tagcache";
const ENV_PREFIX: &str = "TAGCACHE";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_STORE_URL: &str = "redis://127.0.0.1:6379";
const DEFAULT_STORE_POOL_SIZE: u32 = 16;
const DEFAULT_STORE_TIMEOUT_MS: u64 = 2_000;

/// Command-line arguments for the tagcache binary.
#[derive(Debug, Parser)]
#[command(name = "tagcache", version, about = "Tagged response cache")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "TAGCACHE_CONFIG_FILE", value_name = "PATH", value_hint = ValueHint::FilePath)]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the cache admin HTTP surface and background workers.
    Serve(Box<ServeArgs>),
    /// Invalidate every entry carrying one of the given tags.
    Invalidate(InvalidateArgs),
    /// List the keys currently indexed under a tag.
    Members(MembersArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct StoreOverride {
    /// Override the backing store URL.
    #[arg(long = "store-url", value_name = "URL")]
    pub store_url: Option<String>,
}

#[derive(Debug, Args, Clone)]
pub struct InvalidateArgs {
    #[command(flatten)]
    pub store: StoreOverride,

    /// Tag to invalidate; repeat for several.
    #[arg(long = "tag", value_name = "TAG", required = true)]
    pub tags: Vec<String>,
}

#[derive(Debug, Args, Clone)]
pub struct MembersArgs {
    #[command(flatten)]
    pub store: StoreOverride,

    /// Tag whose members should be listed.
    #[arg(value_name = "TAG")]
    pub tag: String,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub store: StoreOverride,

    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Enable or disable the response cache.
    #[arg(
        long = "cache-enabled",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub cache_enabled: Option<bool>,

    /// Override the cache key prefix.
    #[arg(long = "cache-prefix", value_name = "PREFIX")]
    pub cache_prefix: Option<String>,
}

pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub store: StoreSettings,
    pub cache: CacheConfig,
    /// Why the cache was disabled at startup, if it was.
    pub cache_error: Option<CacheError>,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub url: String,
    pub pool_size: NonZeroU32,
    pub timeout: Duration,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    resolve(builder.build()?, cli.command.as_ref())
}

/// Deserialize a built [`Config`] and apply the command's CLI overrides.
///
/// The `[cache]` section is extracted on its own so a malformed value there
/// disables the cache instead of failing the whole load.
fn resolve(config: Config, command: Option<&Command>) -> Result<Settings, LoadError> {
    let cache = match config.get::<RawCacheSettings>("cache") {
        Ok(cache) => Ok(cache),
        Err(ConfigError::NotFound(_)) => Ok(RawCacheSettings::default()),
        Err(err) => Err(CacheError::configuration("cache", err.to_string())),
    };
    let mut raw: RawSettings = config.try_deserialize()?;
    raw.cache = cache;

    match command {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Invalidate(args)) => raw.apply_store_override(&args.store),
        Some(Command::Members(args)) => raw.apply_store_override(&args.store),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    store: RawStoreSettings,
    #[serde(skip, default = "default_raw_cache")]
    cache: Result<RawCacheSettings, CacheError>,
}

fn default_raw_cache() -> Result<RawCacheSettings, CacheError> {
    Ok(RawCacheSettings::default())
}

impl Default for RawSettings {
    fn default() -> Self {
        Self {
            server: RawServerSettings::default(),
            logging: RawLoggingSettings::default(),
            store: RawStoreSettings::default(),
            cache: default_raw_cache(),
        }
    }
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        self.apply_store_override(&overrides.store);
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Ok(cache) = self.cache.as_mut() {
            if let Some(enabled) = overrides.cache_enabled {
                cache.enabled = Some(enabled);
            }
            if let Some(prefix) = overrides.cache_prefix.as_ref() {
                cache.prefix = Some(prefix.clone());
            }
        }
    }

    fn apply_store_override(&mut self, overrides: &StoreOverride) {
        if let Some(url) = overrides.store_url.as_ref() {
            self.store.url = Some(url.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            store,
            cache,
        } = raw;

        let server = build_server_settings(server)?;
        let logging = build_logging_settings(logging)?;
        let store = build_store_settings(store)?;
        let (cache, cache_error) = match cache.and_then(build_cache_config) {
            Ok(cache) => (cache, None),
            Err(err) => (CacheConfig::disabled(), Some(err)),
        };

        Ok(Self {
            server,
            logging,
            store,
            cache,
            cache_error,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }
    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_store_settings(store: RawStoreSettings) -> Result<StoreSettings, LoadError> {
    let url = store
        .url
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_STORE_URL.to_string());
    let pool_size = non_zero_u32(
        store.pool_size.unwrap_or(u64::from(DEFAULT_STORE_POOL_SIZE)),
        "store.pool_size",
    )?;
    let timeout_ms = store.timeout_ms.unwrap_or(DEFAULT_STORE_TIMEOUT_MS);
    if timeout_ms == 0 {
        return Err(LoadError::invalid(
            "store.timeout_ms",
            "must be greater than zero",
        ));
    }

    Ok(StoreSettings {
        url,
        pool_size,
        timeout: Duration::from_millis(timeout_ms),
    })
}

/// Resolve the cache section on top of [`CacheConfig::default`] and validate it.
pub fn build_cache_config(cache: RawCacheSettings) -> Result<CacheConfig, CacheError> {
    let defaults = CacheConfig::default();

    let mut ttls = defaults.ttls.clone();
    for (name, secs) in cache.ttl_seconds {
        ttls.insert(name.to_ascii_lowercase(), Duration::from_secs(secs));
    }

    let config = CacheConfig {
        enabled: cache.enabled.unwrap_or(defaults.enabled),
        prefix: cache.prefix.unwrap_or(defaults.prefix),
        default_ttl: cache
            .default_ttl_seconds
            .map_or(defaults.default_ttl, Duration::from_secs),
        ttls,
        timeouts: Timeouts {
            read: cache
                .timeouts
                .read_ms
                .map_or(defaults.timeouts.read, Duration::from_millis),
            write: cache
                .timeouts
                .write_ms
                .map_or(defaults.timeouts.write, Duration::from_millis),
            delete: cache
                .timeouts
                .delete_ms
                .map_or(defaults.timeouts.delete, Duration::from_millis),
        },
        compression: CompressionConfig {
            enabled: cache
                .compression
                .enabled
                .unwrap_or(defaults.compression.enabled),
            threshold_bytes: cache
                .compression
                .threshold_bytes
                .unwrap_or(defaults.compression.threshold_bytes),
        },
        debug: DebugFlags {
            hits: cache.debug.hits.unwrap_or(false),
            misses: cache.debug.misses.unwrap_or(false),
            invalidations: cache.debug.invalidations.unwrap_or(false),
            tag_operations: cache.debug.tag_operations.unwrap_or(false),
        },
        health_check_interval: cache
            .health_check_interval_ms
            .map_or(defaults.health_check_interval, Duration::from_millis),
        stats_interval: cache
            .stats_interval_seconds
            .map_or(defaults.stats_interval, Duration::from_secs),
        write_queue_limit: cache.write_queue_limit.unwrap_or(defaults.write_queue_limit),
        body_limit_bytes: cache.body_limit_bytes.unwrap_or(defaults.body_limit_bytes),
    };

    config.validate()?;
    Ok(config)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawStoreSettings {
    url: Option<String>,
    pool_size: Option<u64>,
    timeout_ms: Option<u64>,
}

/// `[cache]` section as written in files and `TAGCACHE__CACHE__*` variables.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RawCacheSettings {
    pub enabled: Option<bool>,
    pub prefix: Option<String>,
    pub default_ttl_seconds: Option<u64>,
    /// Per-resource-type TTLs, merged over the built-in table.
    pub ttl_seconds: BTreeMap<String, u64>,
    pub timeouts: RawCacheTimeouts,
    pub compression: RawCompressionSettings,
    pub debug: RawDebugSettings,
    pub health_check_interval_ms: Option<u64>,
    pub stats_interval_seconds: Option<u64>,
    pub write_queue_limit: Option<usize>,
    pub body_limit_bytes: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RawCacheTimeouts {
    pub read_ms: Option<u64>,
    pub write_ms: Option<u64>,
    pub delete_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RawCompressionSettings {
    pub enabled: Option<bool>,
    pub threshold_bytes: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RawDebugSettings {
    pub hits: Option<bool>,
    pub misses: Option<bool>,
    pub invalidations: Option<bool>,
    pub tag_operations: Option<bool>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}
