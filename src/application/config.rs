use std::{
    collections::{BTreeMap, HashMap},
    net::{IpAddr, SocketAddr},
    path::{Path, PathBuf},
    time::Duration,
};

use clap::Parser;
use serde::Deserialize;

#[derive(Debug, Clone, Parser)]
#[command(
    name = "ingest-core",
    version,
    about = "Ingest Core (multi-provider message ingestion, identity resolution and threading)"
)]
pub struct Args {
    #[arg(long, env = "INGEST_HOST", default_value = "127.0.0.1")]
    pub host: IpAddr,

    #[arg(long, env = "INGEST_PORT", default_value_t = 18790)]
    pub port: u16,

    #[arg(
        long,
        env = "INGEST_DB_PATH",
        default_value = "./.ingest-core/ingest.db"
    )]
    pub db_path: PathBuf,

    #[arg(long, env = "INGEST_PROVIDERS_PATH")]
    pub providers_path: Option<PathBuf>,

    #[arg(long, env = "INGEST_IDEMPOTENCY_CAPACITY", default_value_t = 10_000)]
    pub idempotency_capacity: usize,

    #[arg(long, env = "INGEST_PIPELINE_TIMEOUT_MS", default_value_t = 30_000)]
    pub pipeline_timeout_ms: u64,

    #[arg(long, env = "INGEST_WEBHOOK_CONCURRENCY", default_value_t = 8)]
    pub webhook_concurrency: usize,

    #[arg(long, env = "INGEST_PROCESSING_CONCURRENCY", default_value_t = 4)]
    pub processing_concurrency: usize,

    #[arg(long, env = "INGEST_JOB_MAX_ATTEMPTS", default_value_t = 5)]
    pub job_max_attempts: u32,

    #[arg(long, env = "INGEST_JOB_BASE_BACKOFF_MS", default_value_t = 1_000)]
    pub job_base_backoff_ms: u64,

    #[arg(long, env = "INGEST_SLACK_TOLERANCE_SECS", default_value_t = 300)]
    pub slack_tolerance_secs: u64,

    #[arg(long, env = "INGEST_STRICT_VALIDATION", default_value_t = false)]
    pub strict_validation: bool,

    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_filter: String,

    #[arg(long, env = "INGEST_JSON_LOGS", default_value_t = false)]
    pub json_logs: bool,
}

/// One `[providers.<type>]` table of the providers file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderSettings {
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub business_identifier: Option<String>,
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl ProviderSettings {
    /// The configured secret, if it is non-blank.
    #[must_use]
    pub fn secret(&self) -> Option<&str> {
        self.secret
            .as_deref()
            .map(str::trim)
            .filter(|secret| !secret.is_empty())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ProvidersFile {
    #[serde(default)]
    providers: BTreeMap<String, ProviderSettings>,
}

/// Per-provider settings keyed by lower-cased provider type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvidersConfig {
    providers: BTreeMap<String, ProviderSettings>,
}

impl ProvidersConfig {
    pub fn parse(text: &str) -> Result<Self, String> {
        let file: ProvidersFile =
            toml::from_str(text).map_err(|error| format!("invalid providers file: {error}"))?;
        let mut providers = BTreeMap::new();
        for (provider_type, settings) in file.providers {
            if let Some(url) = &settings.webhook_url {
                url::Url::parse(url).map_err(|error| {
                    format!("providers.{provider_type}.webhook_url is not a valid URL: {error}")
                })?;
            }
            providers.insert(provider_type.trim().to_ascii_lowercase(), settings);
        }
        Ok(Self { providers })
    }

    pub fn load(path: &Path) -> Result<Self, String> {
        let text = std::fs::read_to_string(path)
            .map_err(|error| format!("failed to read {}: {error}", path.display()))?;
        Self::parse(&text)
    }

    #[must_use]
    pub fn with_provider(mut self, provider_type: &str, settings: ProviderSettings) -> Self {
        self.providers
            .insert(provider_type.to_ascii_lowercase(), settings);
        self
    }

    #[must_use]
    pub fn get(&self, provider_type: &str) -> Option<&ProviderSettings> {
        self.providers.get(&provider_type.to_ascii_lowercase())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ProviderSettings)> {
        self.providers
            .iter()
            .map(|(provider_type, settings)| (provider_type.as_str(), settings))
    }

    /// Business identifiers for enabled providers, as the normalizer registry expects them.
    #[must_use]
    pub fn business_identifiers(&self) -> HashMap<String, String> {
        self.iter()
            .filter(|(_, settings)| settings.enabled)
            .filter_map(|(provider_type, settings)| {
                settings
                    .business_identifier
                    .clone()
                    .map(|identifier| (provider_type.to_owned(), identifier))
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub host: IpAddr,
    pub port: u16,
    pub db_path: PathBuf,
    pub providers: ProvidersConfig,
    pub idempotency_capacity: usize,
    pub pipeline_timeout: Duration,
    pub webhook_concurrency: usize,
    pub processing_concurrency: usize,
    pub job_max_attempts: u32,
    pub job_base_backoff: Duration,
    pub slack_tolerance: Duration,
    pub strict_validation: bool,
    pub log_filter: String,
    pub json_logs: bool,
}

impl RuntimeConfig {
    pub fn from_args(args: Args) -> Result<Self, String> {
        if args.port == 0 {
            return Err("port must be greater than 0".to_owned());
        }
        if args.idempotency_capacity == 0 {
            return Err("idempotency_capacity must be greater than 0".to_owned());
        }
        if args.pipeline_timeout_ms == 0 {
            return Err("pipeline_timeout_ms must be greater than 0".to_owned());
        }
        if args.webhook_concurrency == 0 {
            return Err("webhook_concurrency must be greater than 0".to_owned());
        }
        if args.processing_concurrency == 0 {
            return Err("processing_concurrency must be greater than 0".to_owned());
        }
        if args.job_max_attempts == 0 {
            return Err("job_max_attempts must be greater than 0".to_owned());
        }

        let providers = match &args.providers_path {
            Some(path) => ProvidersConfig::load(path)?,
            None => ProvidersConfig::default(),
        };

        Ok(Self {
            host: args.host,
            port: args.port,
            db_path: args.db_path,
            providers,
            idempotency_capacity: args.idempotency_capacity,
            pipeline_timeout: Duration::from_millis(args.pipeline_timeout_ms),
            webhook_concurrency: args.webhook_concurrency,
            processing_concurrency: args.processing_concurrency,
            job_max_attempts: args.job_max_attempts,
            job_base_backoff: Duration::from_millis(args.job_base_backoff_ms),
            slack_tolerance: Duration::from_secs(args.slack_tolerance_secs),
            strict_validation: args.strict_validation,
            log_filter: args.log_filter,
            json_logs: args.json_logs,
        })
    }

    #[must_use]
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    #[must_use]
    pub fn for_test(host: IpAddr, port: u16, db_path: PathBuf) -> Self {
        Self {
            host,
            port,
            db_path,
            providers: ProvidersConfig::default(),
            idempotency_capacity: 1_000,
            pipeline_timeout: Duration::from_millis(5_000),
            webhook_concurrency: 4,
            processing_concurrency: 2,
            job_max_attempts: 2,
            job_base_backoff: Duration::from_millis(10),
            slack_tolerance: Duration::from_secs(300),
            strict_validation: true,
            log_filter: "warn".to_owned(),
            json_logs: false,
        }
    }
}
