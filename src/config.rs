// Veritas Trust Engine: Configuration
// Configuration is loaded from defaults, then an optional key=value file
// (TRUST_ENGINE_CONFIG), then environment variables, with later sources
// overriding earlier ones.

use std::collections::HashMap;
use std::env;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result};

#[derive(Clone, Debug)]
pub struct EngineConfig {
    // Logging
    pub log_level: String,

    // Telemetry collection
    pub flush_interval_secs: u64,
    pub min_session_duration_secs: i64,
    pub min_session_events: usize,
    pub pointer_coordinate_rounding: u32,

    // Device trust
    pub learning_period_days: i64,
    pub learning_extension_days: i64,
    pub verification_history_limit: usize,

    // Caches
    pub geo_cache_ttl_secs: i64,
    pub threat_cache_ttl_secs: i64,
    pub policy_cache_ttl_secs: i64,
    pub cache_sweep_interval_secs: u64,

    // Continuous monitoring
    pub monitor_interval_secs: u64,
    pub monitor_max_duration_secs: u64,

    // Histories
    pub response_history_limit: usize,
    pub assessment_history_limit: usize,

    // External collaborators
    pub behavior_api_url: String,
    pub behavior_api_token: String,
    pub geo_api_key: String,
    pub threat_api_key: String,

    // Additional configuration values
    pub extra: HashMap<String, String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            log_level: "info".to_string(),
            flush_interval_secs: 30,
            min_session_duration_secs: 10,
            min_session_events: 5,
            pointer_coordinate_rounding: 10,
            learning_period_days: 14,
            learning_extension_days: 7,
            verification_history_limit: 50,
            geo_cache_ttl_secs: 3600,
            threat_cache_ttl_secs: 1800,
            policy_cache_ttl_secs: 60,
            cache_sweep_interval_secs: 300,
            monitor_interval_secs: 60,
            monitor_max_duration_secs: 8 * 3600,
            response_history_limit: 100,
            assessment_history_limit: 50,
            behavior_api_url: String::new(),
            behavior_api_token: String::new(),
            geo_api_key: String::new(),
            threat_api_key: String::new(),
            extra: HashMap::new(),
        }
    }
}

/// Load configuration from defaults, optional file, and environment
pub fn load_config() -> Result<EngineConfig> {
    let mut config = EngineConfig::default();

    if let Ok(path) = env::var("TRUST_ENGINE_CONFIG") {
        let path = Path::new(&path);
        if path.exists() {
            load_from_file(&mut config, path)?;
        }
    }

    load_from_env(&mut config);

    Ok(config)
}

fn apply(config: &mut EngineConfig, key: &str, value: &str) {
    match key {
        "LOG_LEVEL" => config.log_level = value.to_string(),
        "FLUSH_INTERVAL_SECS" => parse_into(value, &mut config.flush_interval_secs),
        "MIN_SESSION_DURATION_SECS" => parse_into(value, &mut config.min_session_duration_secs),
        "MIN_SESSION_EVENTS" => parse_into(value, &mut config.min_session_events),
        "POINTER_COORDINATE_ROUNDING" => {
            parse_into(value, &mut config.pointer_coordinate_rounding)
        }
        "LEARNING_PERIOD_DAYS" => parse_into(value, &mut config.learning_period_days),
        "LEARNING_EXTENSION_DAYS" => parse_into(value, &mut config.learning_extension_days),
        "VERIFICATION_HISTORY_LIMIT" => {
            parse_into(value, &mut config.verification_history_limit)
        }
        "GEO_CACHE_TTL_SECS" => parse_into(value, &mut config.geo_cache_ttl_secs),
        "THREAT_CACHE_TTL_SECS" => parse_into(value, &mut config.threat_cache_ttl_secs),
        "POLICY_CACHE_TTL_SECS" => parse_into(value, &mut config.policy_cache_ttl_secs),
        "CACHE_SWEEP_INTERVAL_SECS" => parse_into(value, &mut config.cache_sweep_interval_secs),
        "MONITOR_INTERVAL_SECS" => parse_into(value, &mut config.monitor_interval_secs),
        "MONITOR_MAX_DURATION_SECS" => parse_into(value, &mut config.monitor_max_duration_secs),
        "RESPONSE_HISTORY_LIMIT" => parse_into(value, &mut config.response_history_limit),
        "ASSESSMENT_HISTORY_LIMIT" => parse_into(value, &mut config.assessment_history_limit),
        "BEHAVIOR_API_URL" => config.behavior_api_url = value.to_string(),
        "BEHAVIOR_API_TOKEN" => config.behavior_api_token = value.to_string(),
        "GEO_API_KEY" => config.geo_api_key = value.to_string(),
        "THREAT_API_KEY" => config.threat_api_key = value.to_string(),
        _ => {
            if let Some(stripped) = key.strip_prefix("CONFIG_") {
                config.extra.insert(stripped.to_string(), value.to_string());
            }
        }
    }
}

fn parse_into<T: std::str::FromStr>(value: &str, target: &mut T) {
    if let Ok(parsed) = value.parse() {
        *target = parsed;
    }
}

fn load_from_env(config: &mut EngineConfig) {
    for (key, value) in env::vars() {
        apply(config, &key, &value);
    }
}

/// Load configuration from a key=value file
fn load_from_file(config: &mut EngineConfig, path: &Path) -> Result<()> {
    let file = File::open(path).context("Failed to open configuration file")?;
    let reader = BufReader::new(file);

    for line in reader.lines() {
        let line = line.context("Failed to read line from configuration file")?;
        let line = line.trim();

        // Skip empty lines and comments
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some(index) = line.find('=') {
            let key = line[..index].trim();
            let value = line[index + 1..].trim();
            apply(config, key, value);
        }
    }

    Ok(())
}
