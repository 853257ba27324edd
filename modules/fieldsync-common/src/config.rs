use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use crate::error::ConfigError;

const DEFAULT_BATCH_SIZE: usize = 5000;
const MAX_BATCH_SIZE: usize = 20_000;
const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;
const DEFAULT_MAX_LAG_SECONDS: u64 = 60;
const DEFAULT_ASSOC_WINDOW_MS: i64 = 5000;
const ASSOC_WINDOW_RANGE_MS: std::ops::RangeInclusive<i64> = 100..=60_000;
const DEFAULT_ASSOC_CONCURRENCY: usize = 8;
const BATCH_SIZE_SUFFIX: &str = "_BATCH_SIZE";

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub store: StoreConfig,
    pub bus: BusConfig,
    pub mover: MoverConfig,
    pub associator: AssociatorConfig,
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Primary store: the source of moved rows and home of cursors and associations.
    pub database_url: String,
    /// Destination store for store-to-store replication.
    pub replica_database_url: Option<String>,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaslMechanism {
    Plain,
    ScramSha256,
    ScramSha512,
}

impl SaslMechanism {
    /// Name as librdkafka expects it in `sasl.mechanisms`.
    pub fn as_kafka_str(self) -> &'static str {
        match self {
            SaslMechanism::Plain => "PLAIN",
            SaslMechanism::ScramSha256 => "SCRAM-SHA-256",
            SaslMechanism::ScramSha512 => "SCRAM-SHA-512",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SaslConfig {
    pub mechanism: SaslMechanism,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct Topics {
    pub device_readings: String,
    pub device_health: String,
    pub lab_readings: String,
    pub sweep_readings: String,
    pub image_created: String,
    pub weight_associated: String,
}

#[derive(Debug, Clone)]
pub struct BusConfig {
    pub brokers: Vec<String>,
    pub client_id: String,
    pub group_id: String,
    pub ssl: bool,
    pub sasl: Option<SaslConfig>,
    pub topics: Topics,
}

impl BusConfig {
    /// Bootstrap servers joined for librdkafka. Fails when none are configured.
    pub fn bootstrap_servers(&self) -> Result<String, ConfigError> {
        if self.brokers.is_empty() {
            return Err(ConfigError::Missing("KAFKA_BROKERS".to_string()));
        }
        Ok(self.brokers.join(","))
    }
}

#[derive(Debug, Clone)]
pub struct MoverConfig {
    pub batch_size: usize,
    /// Per-source overrides keyed by lowercase source name.
    pub batch_size_overrides: BTreeMap<String, usize>,
    pub poll_interval: Duration,
    pub max_lag: Duration,
    /// Tenant allow-list. Empty means every tenant.
    pub tenant_filter: Vec<String>,
}

impl MoverConfig {
    pub fn batch_size_for(&self, source: &str) -> usize {
        self.batch_size_overrides
            .get(source)
            .copied()
            .unwrap_or(self.batch_size)
    }
}

#[derive(Debug, Clone)]
pub struct AssociatorConfig {
    pub window_ms: i64,
    /// Candidate metrics a probe may be paired with.
    pub metrics: Vec<String>,
    /// Probe events handled concurrently by one service instance.
    pub concurrency: usize,
}

impl Config {
    /// Load configuration from the process environment (and `.env`, if present).
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let config = Self::from_vars(std::env::vars())?;
        config.log_redacted();
        Ok(config)
    }

    /// Load configuration from an explicit set of variables.
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let env = Env(vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect());

        Ok(Self {
            store: StoreConfig::from_env(&env)?,
            bus: BusConfig::from_env(&env)?,
            mover: MoverConfig::from_env(&env)?,
            associator: AssociatorConfig::from_env(&env)?,
        })
    }

    pub fn log_redacted(&self) {
        tracing::info!("Config loaded:");
        tracing::info!("  DATABASE_URL: {}", redact_url(&self.store.database_url));
        tracing::info!(
            "  REPLICA_DATABASE_URL: {}",
            self.store
                .replica_database_url
                .as_deref()
                .map(redact_url)
                .unwrap_or_else(|| "<not set>".to_string())
        );
        tracing::info!("  KAFKA_BROKERS: {:?}", self.bus.brokers);
        tracing::info!("  KAFKA_SSL: {}", self.bus.ssl);
        tracing::info!(
            "  KAFKA_SASL_MECHANISM: {}",
            self.bus
                .sasl
                .as_ref()
                .map(|s| s.mechanism.as_kafka_str())
                .unwrap_or("<not set>")
        );
        tracing::info!(
            batch_size = self.mover.batch_size,
            poll_interval_ms = self.mover.poll_interval.as_millis() as u64,
            max_lag_secs = self.mover.max_lag.as_secs(),
            tenants = self.mover.tenant_filter.len(),
            "  mover"
        );
        tracing::info!(
            window_ms = self.associator.window_ms,
            metrics = ?self.associator.metrics,
            "  associator"
        );
    }
}

impl StoreConfig {
    fn from_env(env: &Env) -> Result<Self, ConfigError> {
        let database_url = match env.get("DATABASE_URL") {
            Some(url) => url.to_string(),
            None => synthesize_db_url(env, "DB_")
                .ok_or_else(|| ConfigError::Missing("DATABASE_URL".to_string()))?,
        };
        let replica_database_url = env
            .get("REPLICA_DATABASE_URL")
            .map(str::to_string)
            .or_else(|| synthesize_db_url(env, "CLOUD_DB_"));

        Ok(Self {
            database_url,
            replica_database_url,
            max_connections: env.parse_or("DB_MAX_CONNECTIONS", 8u32)?,
        })
    }
}

impl Default for Topics {
    fn default() -> Self {
        Self {
            device_readings: "sensors.device.readings".into(),
            device_health: "sensors.device.health".into(),
            lab_readings: "sensors.lab.readings".into(),
            sweep_readings: "sensors.sweep.readings".into(),
            image_created: "image.created".into(),
            weight_associated: "weight.associated".into(),
        }
    }
}

impl Topics {
    fn from_env(env: &Env) -> Self {
        let d = Topics::default();
        Self {
            device_readings: env.string_or("TOPIC_DEVICE_READINGS", &d.device_readings),
            device_health: env.string_or("TOPIC_DEVICE_HEALTH", &d.device_health),
            lab_readings: env.string_or("TOPIC_LAB_READINGS", &d.lab_readings),
            sweep_readings: env.string_or("TOPIC_SWEEP_READINGS", &d.sweep_readings),
            image_created: env.string_or("TOPIC_IMAGE_CREATED", &d.image_created),
            weight_associated: env.string_or("TOPIC_WEIGHT_ASSOCIATED", &d.weight_associated),
        }
    }
}

impl BusConfig {
    fn from_env(env: &Env) -> Result<Self, ConfigError> {
        let brokers = env.list("KAFKA_BROKERS");
        let force_ssl_off = env.bool_or("FORCE_KAFKA_SSL_OFF", false)?;
        let ssl = !force_ssl_off && env.bool_or("KAFKA_SSL", false)?;

        let sasl = match env.get("KAFKA_SASL_MECHANISM") {
            None => None,
            Some(raw) => {
                let mechanism = match raw.trim().to_lowercase().as_str() {
                    "plain" => SaslMechanism::Plain,
                    "scram-sha-256" => SaslMechanism::ScramSha256,
                    "scram-sha-512" => SaslMechanism::ScramSha512,
                    _ => {
                        return Err(ConfigError::invalid(
                            "KAFKA_SASL_MECHANISM",
                            raw,
                            "expected plain, scram-sha-256 or scram-sha-512",
                        ))
                    }
                };
                Some(SaslConfig {
                    mechanism,
                    username: env.required("KAFKA_SASL_USERNAME")?.to_string(),
                    password: env.required("KAFKA_SASL_PASSWORD")?.to_string(),
                })
            }
        };

        Ok(Self {
            brokers,
            client_id: env.string_or("KAFKA_CLIENT_ID", "sensor-streamer"),
            group_id: env.string_or("KAFKA_GROUP_ID", "weight-associator"),
            ssl,
            sasl,
            topics: Topics::from_env(env),
        })
    }
}

impl MoverConfig {
    fn from_env(env: &Env) -> Result<Self, ConfigError> {
        let batch_size = env.parse_or("BATCH_SIZE", DEFAULT_BATCH_SIZE)?;
        check_batch_size("BATCH_SIZE", batch_size)?;

        let mut batch_size_overrides = BTreeMap::new();
        for (key, raw) in env.0.iter() {
            let Some(source) = key.strip_suffix(BATCH_SIZE_SUFFIX) else {
                continue;
            };
            if source.is_empty() || raw.trim().is_empty() {
                continue;
            }
            let size: usize = raw
                .trim()
                .parse()
                .map_err(|_| ConfigError::invalid(key, raw, "expected a positive integer"))?;
            check_batch_size(key, size)?;
            batch_size_overrides.insert(source.to_lowercase(), size);
        }

        let poll_ms: u64 = env.parse_or("POLL_INTERVAL_MS", DEFAULT_POLL_INTERVAL_MS)?;
        if poll_ms == 0 {
            return Err(ConfigError::invalid("POLL_INTERVAL_MS", "0", "must be positive"));
        }
        let lag_secs: u64 = env.parse_or("MAX_LAG_SECONDS", DEFAULT_MAX_LAG_SECONDS)?;
        if lag_secs == 0 {
            return Err(ConfigError::invalid("MAX_LAG_SECONDS", "0", "must be positive"));
        }

        Ok(Self {
            batch_size,
            batch_size_overrides,
            poll_interval: Duration::from_millis(poll_ms),
            max_lag: Duration::from_secs(lag_secs),
            tenant_filter: env.list("TENANT_FILTER"),
        })
    }
}

impl AssociatorConfig {
    fn from_env(env: &Env) -> Result<Self, ConfigError> {
        let window_ms: i64 = env.parse_or("ASSOC_WINDOW_MS", DEFAULT_ASSOC_WINDOW_MS)?;
        if !ASSOC_WINDOW_RANGE_MS.contains(&window_ms) {
            return Err(ConfigError::invalid(
                "ASSOC_WINDOW_MS",
                &window_ms.to_string(),
                format!(
                    "must be between {} and {}",
                    ASSOC_WINDOW_RANGE_MS.start(),
                    ASSOC_WINDOW_RANGE_MS.end()
                ),
            ));
        }
        let mut metrics = env.list("ASSOC_METRICS");
        if metrics.is_empty() {
            metrics = vec!["weight".to_string(), "mass".to_string()];
        }
        let concurrency: usize = env.parse_or("ASSOC_CONCURRENCY", DEFAULT_ASSOC_CONCURRENCY)?;

        Ok(Self {
            window_ms,
            metrics,
            concurrency: concurrency.max(1),
        })
    }
}

fn check_batch_size(key: &str, size: usize) -> Result<(), ConfigError> {
    if size == 0 || size > MAX_BATCH_SIZE {
        return Err(ConfigError::invalid(
            key,
            &size.to_string(),
            format!("must be between 1 and {MAX_BATCH_SIZE}"),
        ));
    }
    Ok(())
}

/// Build a Postgres URL from `<prefix>HOST`, `<prefix>PORT`, `<prefix>NAME`,
/// `<prefix>USER` and `<prefix>PASSWORD` when all required parts are present.
fn synthesize_db_url(env: &Env, prefix: &str) -> Option<String> {
    let host = env.get(&format!("{prefix}HOST"))?;
    let name = env.get(&format!("{prefix}NAME"))?;
    let user = env.get(&format!("{prefix}USER"))?;
    let password = env.get(&format!("{prefix}PASSWORD"))?;
    let port = env.get(&format!("{prefix}PORT")).unwrap_or("5432");
    Some(format!(
        "postgres://{}:{}@{host}:{port}/{name}",
        encode_userinfo(user),
        encode_userinfo(password)
    ))
}

fn encode_userinfo(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for b in raw.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

fn redact_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***@{}", &url[..scheme_end], &url[at + 1..])
        }
        _ => url.to_string(),
    }
}

struct Env(HashMap<String, String>);

impl Env {
    /// A variable's value; empty strings count as unset.
    fn get(&self, key: &str) -> Option<&str> {
        self.0
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }

    fn required(&self, key: &str) -> Result<&str, ConfigError> {
        self.get(key)
            .ok_or_else(|| ConfigError::Missing(key.to_string()))
    }

    fn string_or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or(default).to_string()
    }

    fn parse_or<T: std::str::FromStr>(&self, key: &str, default: T) -> Result<T, ConfigError> {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|_| ConfigError::invalid(key, raw, "not a valid number")),
        }
    }

    fn bool_or(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        let Some(raw) = self.0.get(key) else {
            return Ok(default);
        };
        match raw.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" | "" => Ok(false),
            _ => Err(ConfigError::invalid(key, raw, "expected a boolean")),
        }
    }

    fn list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }
}
