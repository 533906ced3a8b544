use std::{
    env, fmt,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use anyhow::bail;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    EagerCpu,
    EagerGpu,
    Batching,
}

impl FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> anyhow::Result<Self> {
        match raw.trim().to_lowercase().as_str() {
            "cpu" | "eager-cpu" => Ok(Self::EagerCpu),
            "gpu" | "eager-gpu" => Ok(Self::EagerGpu),
            "batching" | "vllm" => Ok(Self::Batching),
            other => bail!("unknown BACKEND `{other}` (expected cpu, gpu or batching)"),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackendKind::EagerCpu => "eager-cpu",
            BackendKind::EagerGpu => "eager-gpu",
            BackendKind::Batching => "batching",
        })
    }
}

/// What a deployment does with a request once every slot is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionPolicy {
    /// Wait in FIFO order for a free slot.
    Queue,
    /// Fail immediately with a capacity error.
    Reject,
}

impl FromStr for AdmissionPolicy {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> anyhow::Result<Self> {
        match raw.trim().to_lowercase().as_str() {
            "queue" => Ok(Self::Queue),
            "reject" => Ok(Self::Reject),
            other => bail!("unknown ADMISSION_POLICY `{other}` (expected queue or reject)"),
        }
    }
}

/// Concurrency and deadline settings of one deployment instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeploymentSettings {
    pub max_concurrent_requests: usize,
    pub admission: AdmissionPolicy,
    pub max_queued_requests: Option<usize>,
    #[serde(rename = "request_timeout_seconds", serialize_with = "as_secs")]
    pub request_timeout: Duration,
}

impl Default for DeploymentSettings {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 100,
            admission: AdmissionPolicy::Queue,
            max_queued_requests: None,
            request_timeout: Duration::from_secs(120),
        }
    }
}

fn as_secs<S: serde::Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(value.as_secs_f64())
}

/// Defaults and bounds applied to request bodies.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationDefaults {
    pub max_tokens: usize,
    pub max_tokens_limit: usize,
    pub temperature: f64,
    pub top_p: f64,
}

impl Default for GenerationDefaults {
    fn default() -> Self {
        Self {
            max_tokens: 100,
            max_tokens_limit: 2048,
            temperature: 0.7,
            top_p: 0.9,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub model_id: String,
    pub backend: BackendKind,
    pub device: String,
    pub tokenizer_path: PathBuf,
    pub deployment: DeploymentSettings,
    pub generation: GenerationDefaults,
    pub dummy_token_delay_ms: u64,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from any key lookup. Numbers that fail to parse fall
    /// back to their defaults; unknown enumeration values are errors.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

        let listen_addr = lookup("SERVER_ADDR")
            .unwrap_or_else(|| "127.0.0.1:8080".into())
            .parse()
            .unwrap_or_else(|_| SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8080));

        let model_id =
            lookup("MODEL_ID").unwrap_or_else(|| "/mnt/models/models/tinyllama".to_string());
        let backend = match lookup("BACKEND") {
            Some(raw) => raw.parse()?,
            None => BackendKind::EagerCpu,
        };
        let device = lookup("DEVICE").unwrap_or_else(|| match backend {
            BackendKind::EagerCpu => "cpu".to_string(),
            BackendKind::EagerGpu | BackendKind::Batching => "cuda".to_string(),
        });
        let tokenizer_path = lookup("TOKENIZER_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(&model_id).join("tokenizer.json"));

        let defaults = DeploymentSettings::default();
        let deployment = DeploymentSettings {
            max_concurrent_requests: parsed("MAX_CONCURRENT_REQUESTS")
                .map(|v| (v as usize).max(1))
                .unwrap_or(defaults.max_concurrent_requests),
            admission: match lookup("ADMISSION_POLICY") {
                Some(raw) => raw.parse()?,
                None => defaults.admission,
            },
            max_queued_requests: parsed("MAX_QUEUED_REQUESTS").map(|v| v as usize),
            request_timeout: parsed("REQUEST_TIMEOUT_SECS")
                .filter(|&secs| secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.request_timeout),
        };

        let defaults = GenerationDefaults::default();
        let max_tokens_limit = parsed("MAX_TOKENS_LIMIT")
            .map(|v| (v as usize).max(1))
            .unwrap_or(defaults.max_tokens_limit);
        let generation = GenerationDefaults {
            max_tokens: parsed("DEFAULT_MAX_TOKENS")
                .map(|v| v as usize)
                .filter(|&v| v > 0)
                .unwrap_or(defaults.max_tokens)
                .min(max_tokens_limit),
            max_tokens_limit,
            temperature: lookup("TEMPERATURE")
                .and_then(|v| v.trim().parse().ok())
                .filter(|t: &f64| (0.0..=2.0).contains(t))
                .unwrap_or(defaults.temperature),
            top_p: lookup("TOP_P")
                .and_then(|v| v.trim().parse().ok())
                .filter(|p: &f64| *p > 0.0 && *p <= 1.0)
                .unwrap_or(defaults.top_p),
        };

        Ok(Self {
            listen_addr,
            model_id,
            backend,
            device,
            tokenizer_path,
            deployment,
            generation,
            dummy_token_delay_ms: parsed("DUMMY_TOKEN_DELAY_MS").unwrap_or(0),
        })
    }
}
