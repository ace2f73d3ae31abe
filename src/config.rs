use crate::device::DeviceConfig;
use crate::engine::FlushPolicy;
use anyhow::{bail, Context, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_BUFFER_SIZE: usize = 10;
const DEFAULT_FLUSH_INTERVAL_SECS: f64 = 5.0;
const DEFAULT_DB_PATH: &str = "neurosity_data.db";

/// Optional JSON file for values the environment leaves unset.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SetupConfigOverrides {
    #[serde(default)]
    buffer_size: Option<usize>,
    #[serde(default)]
    flush_interval_seconds: Option<f64>,
    #[serde(default)]
    user_name: Option<String>,
    #[serde(default)]
    db_path: Option<String>,
    #[serde(default)]
    device_id: Option<String>,
    #[serde(default)]
    mqtt_host: Option<String>,
    #[serde(default)]
    mqtt_port: Option<u16>,
    #[serde(default)]
    mqtt_topic_prefix: Option<String>,
}

fn load_setup_config_overrides(path: Option<String>) -> Option<SetupConfigOverrides> {
    let path = PathBuf::from(path?.trim());
    if path.as_os_str().is_empty() || !path.exists() {
        return None;
    }
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "failed to read setup config; using env defaults"
            );
            return None;
        }
    };
    let mut bytes = contents.into_bytes();
    match simd_json::serde::from_slice(&mut bytes) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "failed to parse setup config; using env defaults"
            );
            None
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub buffer_size: usize,
    pub flush_interval_secs: f64,
    pub owner_name: Option<String>,
    pub db_path: PathBuf,
    pub db_pool_size: u32,
    pub device_id: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_topic_prefix: String,
    pub mqtt_keepalive_secs: u64,
    pub mqtt_client_id: String,
    pub stream_queue: usize,
    pub otlp_endpoint: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        let overrides = load_setup_config_overrides(env::var("RECORDER_SETUP_CONFIG_PATH").ok());
        Self::from_lookup(|key| env::var(key).ok(), overrides.unwrap_or_default())
    }

    /// Environment values win; the setup file only fills in what is unset.
    pub fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
        overrides: SetupConfigOverrides,
    ) -> Result<Self> {
        let var = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let buffer_size = match var("BUFFER_SIZE") {
            Some(raw) => raw
                .parse::<usize>()
                .with_context(|| format!("invalid BUFFER_SIZE {raw:?}"))?,
            None => overrides.buffer_size.unwrap_or(DEFAULT_BUFFER_SIZE),
        };
        if buffer_size == 0 {
            bail!("BUFFER_SIZE must be at least 1");
        }

        let flush_interval_secs = match var("BUFFER_FLUSH_INTERVAL") {
            Some(raw) => raw
                .parse::<f64>()
                .with_context(|| format!("invalid BUFFER_FLUSH_INTERVAL {raw:?}"))?,
            None => overrides
                .flush_interval_seconds
                .unwrap_or(DEFAULT_FLUSH_INTERVAL_SECS),
        };
        let representable = Duration::try_from_secs_f64(flush_interval_secs).is_ok();
        if flush_interval_secs.is_nan() || flush_interval_secs <= 0.0 || !representable {
            bail!("BUFFER_FLUSH_INTERVAL must be a positive number of seconds");
        }

        let owner_name = var("USER_NAME").or_else(|| {
            overrides
                .user_name
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        });

        let db_path = PathBuf::from(
            var("DB_PATH")
                .or(overrides.db_path)
                .unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
        );
        let db_pool_size = match var("RECORDER_DB_POOL_SIZE") {
            Some(raw) => raw
                .parse::<u32>()
                .with_context(|| format!("invalid RECORDER_DB_POOL_SIZE {raw:?}"))?,
            None => 2,
        };

        let device_id = var("NEUROSITY_DEVICE_ID")
            .or(overrides.device_id)
            .context("NEUROSITY_DEVICE_ID is required (or present as device_id in the setup config)")?;

        let mqtt_host = var("RECORDER_MQTT_HOST")
            .or(overrides.mqtt_host)
            .unwrap_or_else(|| "127.0.0.1".to_string());
        let mqtt_port = match var("RECORDER_MQTT_PORT") {
            Some(raw) => raw
                .parse::<u16>()
                .with_context(|| format!("invalid RECORDER_MQTT_PORT {raw:?}"))?,
            None => overrides.mqtt_port.filter(|v| *v != 0).unwrap_or(1883),
        };
        let mqtt_username = var("NEUROSITY_EMAIL");
        let mqtt_password = var("NEUROSITY_PASSWORD");
        let mqtt_topic_prefix = var("RECORDER_MQTT_TOPIC_PREFIX")
            .or(overrides.mqtt_topic_prefix)
            .unwrap_or_else(|| "neurosity".to_string());
        let mqtt_keepalive_secs = var("RECORDER_MQTT_KEEPALIVE_SECS")
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(30);
        let mqtt_client_id = var("RECORDER_MQTT_CLIENT_ID")
            .unwrap_or_else(|| format!("brainwave-recorder-{}", std::process::id()));

        let stream_queue = var("RECORDER_STREAM_QUEUE")
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|v| *v != 0)
            .unwrap_or(1024);
        let otlp_endpoint = var("OTEL_EXPORTER_OTLP_ENDPOINT");

        Ok(Self {
            buffer_size,
            flush_interval_secs,
            owner_name,
            db_path,
            db_pool_size,
            device_id,
            mqtt_host,
            mqtt_port,
            mqtt_username,
            mqtt_password,
            mqtt_topic_prefix,
            mqtt_keepalive_secs,
            mqtt_client_id,
            stream_queue,
            otlp_endpoint,
        })
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs_f64(self.flush_interval_secs)
    }

    pub fn flush_policy(&self) -> FlushPolicy {
        FlushPolicy::new(self.buffer_size, self.flush_interval())
    }

    pub fn mqtt_keepalive(&self) -> Duration {
        Duration::from_secs(self.mqtt_keepalive_secs)
    }

    pub fn device_config(&self) -> DeviceConfig {
        DeviceConfig {
            device_id: self.device_id.clone(),
            host: self.mqtt_host.clone(),
            port: self.mqtt_port,
            username: self.mqtt_username.clone(),
            password: self.mqtt_password.clone(),
            topic_prefix: self.mqtt_topic_prefix.clone(),
            keepalive: self.mqtt_keepalive(),
            client_id: self.mqtt_client_id.clone(),
        }
    }
}
