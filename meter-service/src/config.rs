use serde::Deserialize;
use std::{fs, path::PathBuf, time::Duration};

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub uri: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    8
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// Topic prefix, e.g. `gridtokenx` for `gridtokenx/meters/data`.
    pub namespace: String,
    /// Where the broker bridge delivers subscribed messages.
    pub http_bind_addr: String,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// Bridge endpoint used to publish device commands.
    pub command_publish_url: String,
    /// Meter id used when a message carries none. Unset means such messages are dropped.
    #[serde(default)]
    pub fallback_meter_id: Option<String>,
}

fn default_channel_capacity() -> usize {
    4096
}

fn default_max_body_bytes() -> usize {
    256 * 1024
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub latest_ttl_secs: u64,
    pub time_series_ttl_secs: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            latest_ttl_secs: 3600,
            time_series_ttl_secs: 7200,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    pub rpc_url: String,
    /// Address of the energy token contract, used for balance reads.
    pub token_address: String,
    #[serde(default = "default_ledger_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_ledger_timeout_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SettlementConfig {
    pub enabled: bool,
    pub interval_minutes: u32,
    /// Meters settled concurrently within one cycle.
    pub workers: usize,
    /// Upper bound for any single ledger call made during settlement.
    pub ledger_timeout_ms: u64,
    /// Pending records older than this are reconciled.
    pub pending_timeout_minutes: u32,
    pub reconcile_interval_secs: u64,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_minutes: 5,
            workers: 4,
            ledger_timeout_ms: 60_000,
            pending_timeout_minutes: 30,
            reconcile_interval_secs: 300,
        }
    }
}

impl SettlementConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.interval_minutes.max(1)) * 60)
    }

    pub fn ledger_timeout(&self) -> Duration {
        Duration::from_millis(self.ledger_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    pub interval_ms: u64,
    pub window_secs: u64,
    /// Average power within ±this many watts counts as idle.
    pub idle_deadband_w: f64,
    pub auto_shutdown_enabled: bool,
    /// Multiplier applied to the projected burn before comparing with the balance.
    pub safety_margin: f64,
    pub shutdown_cooldown_secs: u64,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            window_secs: 600,
            idle_deadband_w: 50.0,
            auto_shutdown_enabled: true,
            safety_margin: 1.05,
            shutdown_cooldown_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    pub interval_secs: u64,
    /// Complete hours re-aggregated on each run. Must stay inside the time-series TTL.
    pub lookback_hours: u32,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            interval_secs: 1800,
            lookback_hours: 1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ArchivalConfig {
    pub enabled: bool,
    pub interval_hours: u64,
    pub retention_days: u32,
    pub output_dir: PathBuf,
    pub batch_size: i64,
}

impl Default for ArchivalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_hours: 24,
            retention_days: 30,
            output_dir: PathBuf::from("archive"),
            batch_size: 50_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub bind_addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub bind_addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub broker: BrokerConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub settlement: SettlementConfig,
    #[serde(default)]
    pub sampling: SamplingConfig,
    #[serde(default)]
    pub aggregation: AggregationConfig,
    #[serde(default)]
    pub archival: ArchivalConfig,
    pub metrics: Option<MetricsConfig>,
    pub api: Option<ApiConfig>,
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        use std::env;

        let path = env::var("METER_SERVICE_CONFIG").unwrap_or_else(|_| "meter-service.toml".to_string());
        let contents = fs::read_to_string(&path)?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> anyhow::Result<Self> {
        let cfg: AppConfig = toml::from_str(contents)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.aggregation.lookback_hours == 0 {
            anyhow::bail!("aggregation.lookback_hours must be at least 1");
        }
        // Hour H is re-aggregated until H + (lookback_hours + 1) h; its samples
        // must outlive every one of those runs.
        let ttl = self.telemetry.time_series_ttl_secs;
        let lookback_secs = u64::from(self.aggregation.lookback_hours) * 3600;
        if lookback_secs + 3600 > ttl {
            anyhow::bail!(
                "aggregation.lookback_hours + 1 hours must fit within telemetry.time_series_ttl_secs, \
                 otherwise trimmed hours are re-aggregated from partial samples"
            );
        }
        if self.aggregation.interval_secs == 0 || self.aggregation.interval_secs > lookback_secs {
            anyhow::bail!("aggregation.interval_secs must be positive and at most lookback_hours, or hours are skipped");
        }
        if 60 % self.settlement.interval_minutes.max(1) != 0 {
            anyhow::bail!("settlement.interval_minutes must divide an hour evenly");
        }
        if self.sampling.safety_margin < 1.0 {
            anyhow::bail!("sampling.safety_margin must be >= 1.0");
        }
        Ok(())
    }
}
