//! Runtime configuration from the environment.
//!
//! [`AppConfig::from_env`] loads `.env` and reads process variables;
//! [`AppConfig::from_lookup`] is the pure core and takes any key lookup.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::classifier::ClassifierConfig;
use crate::dispatch::{DispatchConfig, FailurePolicy};
use crate::gateway::{GatewayConfig, ProviderKind, ProviderSettings};
use crate::taxonomy::{CanonicalLabel, MatchProfile, Taxonomy, TaxonomyError};

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_OPENAI_COMPAT_MODEL: &str = "qwen3-30b-a3b-instruct";
pub const DEFAULT_DATABRICKS_MODEL: &str = "databricks-gpt-oss-20b";

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAX_RETRIES: u32 = 10;
const DEFAULT_RETRY_BASE_MS: u64 = 2_000;
const DEFAULT_MAX_CONCURRENT: usize = 5;
const DEFAULT_THINKING_TIME_SECS: u64 = 3;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
    #[error("failed to read taxonomy file {path}: {source}")]
    TaxonomyIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse taxonomy file {path}: {source}")]
    TaxonomyParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Taxonomy(#[from] TaxonomyError),
}

/// Where the taxonomy comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaxonomySource {
    /// JSON array of names or `{name, category?, description?}` objects.
    File(PathBuf),
    /// Comma-separated names.
    Inline(Vec<String>),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TaxonomyEntry {
    Name(String),
    Label(CanonicalLabel),
}

impl TaxonomySource {
    pub fn load(&self) -> Result<Taxonomy, ConfigError> {
        match self {
            TaxonomySource::Inline(names) => Ok(Taxonomy::from_names(names)?),
            TaxonomySource::File(path) => load_taxonomy_file(path),
        }
    }
}

fn load_taxonomy_file(path: &Path) -> Result<Taxonomy, ConfigError> {
    let text = fs::read_to_string(path).map_err(|source| ConfigError::TaxonomyIo {
        path: path.to_path_buf(),
        source,
    })?;
    let entries: Vec<TaxonomyEntry> =
        serde_json::from_str(&text).map_err(|source| ConfigError::TaxonomyParse {
            path: path.to_path_buf(),
            source,
        })?;
    let labels = entries
        .into_iter()
        .map(|e| match e {
            TaxonomyEntry::Name(name) => CanonicalLabel::new(name.trim()),
            TaxonomyEntry::Label(label) => label,
        })
        .collect();
    Ok(Taxonomy::new(labels)?)
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub provider: ProviderSettings,
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub max_concurrent_requests: usize,
    pub thinking_time: Duration,
    pub match_profile: MatchProfile,
    pub failure_policy: FailurePolicy,
    pub taxonomy: TaxonomySource,
}

fn parse_num<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) {
        None => Ok(default),
        Some(raw) => raw.parse::<T>().map_err(|e| ConfigError::Invalid {
            key,
            message: format!("'{raw}': {e}"),
        }),
    }
}

fn first_set(lookup: &impl Fn(&str) -> Option<String>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|&k| lookup(k))
        .map(|v| v.trim().to_string())
        .find(|v| !v.is_empty())
}

impl AppConfig {
    /// Load `.env` (if present) and read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let kind = match first_set(&lookup, &["LLM_PROVIDER"]) {
            None => ProviderKind::OpenAiCompat,
            Some(raw) => raw.parse::<ProviderKind>().map_err(|message| ConfigError::Invalid {
                key: "LLM_PROVIDER",
                message,
            })?,
        };

        let provider = match kind {
            ProviderKind::OpenAiCompat => {
                let model = first_set(&lookup, &["LLM_MODEL", "QWEN3_MODEL"])
                    .unwrap_or_else(|| DEFAULT_OPENAI_COMPAT_MODEL.to_string());
                let base_url = match first_set(&lookup, &["LLM_BASE_URL"]) {
                    Some(url) => url,
                    None => {
                        let host = first_set(&lookup, &["LLM_HOST", "QWEN3_HOST"])
                            .unwrap_or_else(|| DEFAULT_HOST.to_string());
                        let port = match first_set(&lookup, &["LLM_PORT", "QWEN3_PORT"]) {
                            None => DEFAULT_PORT,
                            Some(raw) => raw.parse::<u16>().map_err(|e| ConfigError::Invalid {
                                key: "LLM_PORT",
                                message: format!("'{raw}': {e}"),
                            })?,
                        };
                        format!("http://{host}:{port}/v1")
                    }
                };
                ProviderSettings::OpenAiCompat {
                    base_url,
                    model,
                    api_key: first_set(&lookup, &["LLM_API_KEY"]),
                }
            }
            ProviderKind::Databricks => ProviderSettings::Databricks {
                url: first_set(&lookup, &["DATABRICKS_URL"])
                    .ok_or(ConfigError::Missing("DATABRICKS_URL"))?,
                token: first_set(&lookup, &["DATABRICKS_TOKEN"])
                    .ok_or(ConfigError::Missing("DATABRICKS_TOKEN"))?,
                model: first_set(&lookup, &["DATABRICKS_MODEL"])
                    .unwrap_or_else(|| DEFAULT_DATABRICKS_MODEL.to_string()),
            },
        };

        let timeout = Duration::from_secs(parse_num(&lookup, "LLM_TIMEOUT", DEFAULT_TIMEOUT_SECS)?);
        let max_retries = parse_num(&lookup, "LLM_MAX_RETRIES", DEFAULT_MAX_RETRIES)?;
        let retry_base_delay =
            Duration::from_millis(parse_num(&lookup, "LLM_RETRY_BASE_MS", DEFAULT_RETRY_BASE_MS)?);
        let max_concurrent_requests =
            parse_num(&lookup, "MAX_CONCURRENT_REQUESTS", DEFAULT_MAX_CONCURRENT)?;
        if max_concurrent_requests == 0 {
            return Err(ConfigError::Invalid {
                key: "MAX_CONCURRENT_REQUESTS",
                message: "must be at least 1".into(),
            });
        }
        let thinking_time =
            Duration::from_secs(parse_num(&lookup, "THINKING_TIME", DEFAULT_THINKING_TIME_SECS)?);

        let match_profile = match first_set(&lookup, &["MATCH_PROFILE"]) {
            None => MatchProfile::default(),
            Some(raw) => raw.parse::<MatchProfile>().map_err(|message| ConfigError::Invalid {
                key: "MATCH_PROFILE",
                message,
            })?,
        };
        let failure_policy = match first_set(&lookup, &["FAILURE_POLICY"]) {
            None => FailurePolicy::default(),
            Some(raw) => raw.parse::<FailurePolicy>().map_err(|message| ConfigError::Invalid {
                key: "FAILURE_POLICY",
                message,
            })?,
        };

        let taxonomy = if let Some(path) = first_set(&lookup, &["TAXONOMY_FILE"]) {
            TaxonomySource::File(PathBuf::from(path))
        } else if let Some(domains) = first_set(&lookup, &["DOMAINS"]) {
            let names: Vec<String> = domains
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            if names.is_empty() {
                return Err(ConfigError::Missing("DOMAINS"));
            }
            TaxonomySource::Inline(names)
        } else {
            return Err(ConfigError::Missing("TAXONOMY_FILE or DOMAINS"));
        };

        Ok(Self {
            provider,
            timeout,
            max_retries,
            retry_base_delay,
            max_concurrent_requests,
            thinking_time,
            match_profile,
            failure_policy,
            taxonomy,
        })
    }

    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            max_retries: self.max_retries,
            retry_base_delay: self.retry_base_delay,
            ..GatewayConfig::default()
        }
    }

    pub fn classifier_config(&self) -> ClassifierConfig {
        ClassifierConfig {
            profile: self.match_profile,
            timeout: self.timeout,
            ..ClassifierConfig::for_provider(self.provider.kind())
        }
    }

    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            workers: self.max_concurrent_requests,
            pacing: self.thinking_time,
            policy: self.failure_policy,
        }
    }
}
