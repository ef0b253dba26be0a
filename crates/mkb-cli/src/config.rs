//! Configuration file management for mkb.
//!
//! Provides a TOML-based config file at `~/.config/mkb/config.toml` and a
//! resolution chain: CLI flag > env var > config file > default.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use mkb_core::agent::OpenAiAgentConfig;
use mkb_core::files::DEFAULT_MAX_UPLOAD_BYTES;
use mkb_core::knowledge::DEFAULT_PROJECT;
use mkb_core::knowledge::viking::VikingConfig;
use mkb_core::session::sweeper::SweeperConfig;
use mkb_core::signing::Credentials;
use mkb_core::storage::tos::TosConfig;

pub const DEFAULT_BIND: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8888;
pub const DEFAULT_STATIC_DIR: &str = "./static";
const DEFAULT_KB_DOMAIN: &str = "api-knowledgebase.mlp.cn-beijing.volces.com";

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub server: ServerSection,
    pub knowledge_base: KnowledgeBaseSection,
    pub storage: StorageSection,
    pub agent: AgentSection,
    pub sessions: SessionsSection,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub bind: String,
    pub port: u16,
    pub static_dir: String,
    pub max_upload_bytes: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            port: DEFAULT_PORT,
            static_dir: DEFAULT_STATIC_DIR.to_string(),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct KnowledgeBaseSection {
    /// Host name of the knowledge-base API; a full URL is accepted too.
    pub domain: String,
    pub region: String,
    pub service: String,
    pub project: String,
    pub model: String,
    pub model_version: String,
    pub model_api_key: String,
    pub access_key: String,
    pub secret_key: String,
}

impl Default for KnowledgeBaseSection {
    fn default() -> Self {
        Self {
            domain: DEFAULT_KB_DOMAIN.to_string(),
            region: VikingConfig::DEFAULT_REGION.to_string(),
            service: VikingConfig::DEFAULT_SERVICE.to_string(),
            project: DEFAULT_PROJECT.to_string(),
            model: VikingConfig::DEFAULT_MODEL.to_string(),
            model_version: String::new(),
            model_api_key: String::new(),
            access_key: String::new(),
            secret_key: String::new(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    pub endpoint: String,
    pub region: String,
    pub bucket: String,
    pub presign_expiry_secs: u64,
    pub access_key: String,
    pub secret_key: String,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            endpoint: TosConfig::DEFAULT_ENDPOINT.to_string(),
            region: TosConfig::DEFAULT_REGION.to_string(),
            bucket: String::new(),
            presign_expiry_secs: TosConfig::DEFAULT_PRESIGN_EXPIRY.as_secs(),
            access_key: String::new(),
            secret_key: String::new(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub base_url: String,
    pub model: String,
    pub api_key: String,
    pub max_iterations: u32,
    pub timeout_secs: u64,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            base_url: OpenAiAgentConfig::DEFAULT_BASE_URL.to_string(),
            model: OpenAiAgentConfig::DEFAULT_MODEL.to_string(),
            api_key: String::new(),
            max_iterations: OpenAiAgentConfig::DEFAULT_MAX_ITERATIONS,
            timeout_secs: OpenAiAgentConfig::DEFAULT_TIMEOUT.as_secs(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionsSection {
    pub ttl_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for SessionsSection {
    fn default() -> Self {
        Self {
            ttl_secs: SweeperConfig::DEFAULT_TTL.as_secs(),
            sweep_interval_secs: SweeperConfig::DEFAULT_INTERVAL.as_secs(),
        }
    }
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the mkb config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/mkb` or `~/.config/mkb`.
/// We intentionally ignore the platform-specific `dirs::config_dir()`
/// (which returns `~/Library/Application Support` on macOS).
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("mkb");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("mkb")
}

/// Return the path to the mkb config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file at `path`. Returns an error if it does
/// not exist.
pub fn load_config(path: &Path) -> Result<ConfigFile> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix.
pub fn save_config(config: &ConfigFile, path: &Path) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create config directory {}", dir.display()))?;
    }

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    // Secrets live in this file: owner read/write only.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct MkbConfig {
    pub bind: String,
    pub port: u16,
    pub static_dir: PathBuf,
    pub max_upload_bytes: u64,
    pub project: String,
    pub viking: VikingConfig,
    pub tos: TosConfig,
    pub agent: OpenAiAgentConfig,
    pub sweeper: SweeperConfig,
}

/// Value from `var` if set and non-empty, else `fallback`.
fn env_or(var: &str, fallback: &str) -> String {
    match std::env::var(var) {
        Ok(v) if !v.is_empty() => v,
        _ => fallback.to_string(),
    }
}

fn required(var: &str, fallback: &str, what: &str) -> Result<String> {
    let value = env_or(var, fallback);
    if value.is_empty() {
        bail!("{what} not found; set {var} or add it to the config file (`mkb init` writes a template)");
    }
    Ok(value)
}

fn endpoint_url(domain: &str) -> String {
    if domain.starts_with("http://") || domain.starts_with("https://") {
        domain.to_string()
    } else {
        format!("https://{domain}")
    }
}

impl MkbConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config file > default.
    ///
    /// - Config file: `cli_config` > `$XDG_CONFIG_HOME/mkb/config.toml`; a
    ///   missing file means defaults everywhere.
    /// - Bind / port: CLI flag > `MKB_BIND` / `MKB_PORT` > `[server]` > default.
    /// - Credentials: `MKB_KB_ACCESS_KEY`, `MKB_KB_SECRET_KEY`,
    ///   `MKB_TOS_ACCESS_KEY`, `MKB_TOS_SECRET_KEY` > config file > error.
    /// - Agent key: `MKB_AGENT_API_KEY` > config file > unset.
    pub fn resolve(
        cli_config: Option<&Path>,
        cli_bind: Option<&str>,
        cli_port: Option<u16>,
    ) -> Result<Self> {
        let file = match cli_config {
            // An explicitly named file must exist.
            Some(path) => load_config(path)?,
            None => load_config(&config_path()).unwrap_or_default(),
        };

        let bind = match cli_bind {
            Some(b) => b.to_string(),
            None => env_or("MKB_BIND", &file.server.bind),
        };
        let port = match cli_port {
            Some(p) => p,
            None => match std::env::var("MKB_PORT") {
                Ok(p) if !p.is_empty() => p
                    .parse()
                    .with_context(|| format!("MKB_PORT is not a valid port: {p}"))?,
                _ => file.server.port,
            },
        };

        let kb = &file.knowledge_base;
        let kb_credentials = Credentials::new(
            required("MKB_KB_ACCESS_KEY", &kb.access_key, "knowledge base access key")?,
            required("MKB_KB_SECRET_KEY", &kb.secret_key, "knowledge base secret key")?,
        );
        let model_api_key = env_or("MKB_KB_MODEL_API_KEY", &kb.model_api_key);
        let viking = VikingConfig {
            endpoint: endpoint_url(&env_or("MKB_KB_DOMAIN", &kb.domain)),
            region: kb.region.clone(),
            service: kb.service.clone(),
            model: kb.model.clone(),
            model_version: kb.model_version.clone(),
            model_api_key: (!model_api_key.is_empty()).then_some(model_api_key),
            ..VikingConfig::new(kb_credentials)
        };

        let st = &file.storage;
        let tos_credentials = Credentials::new(
            required("MKB_TOS_ACCESS_KEY", &st.access_key, "storage access key")?,
            required("MKB_TOS_SECRET_KEY", &st.secret_key, "storage secret key")?,
        );
        let bucket = required("MKB_TOS_BUCKET", &st.bucket, "storage bucket")?;
        let tos = TosConfig {
            endpoint: env_or("MKB_TOS_ENDPOINT", &st.endpoint),
            region: st.region.clone(),
            presign_expiry: Duration::from_secs(st.presign_expiry_secs),
            ..TosConfig::new(bucket, tos_credentials)
        };

        let ag = &file.agent;
        let agent_key = env_or("MKB_AGENT_API_KEY", &ag.api_key);
        let agent = OpenAiAgentConfig {
            base_url: ag.base_url.clone(),
            model: ag.model.clone(),
            api_key: (!agent_key.is_empty()).then_some(agent_key),
            max_iterations: ag.max_iterations,
            timeout: Duration::from_secs(ag.timeout_secs),
        };

        let sweeper = SweeperConfig {
            interval: Duration::from_secs(file.sessions.sweep_interval_secs.max(1)),
            ttl: Duration::from_secs(file.sessions.ttl_secs),
        };

        Ok(Self {
            bind,
            port,
            static_dir: PathBuf::from(&file.server.static_dir),
            max_upload_bytes: file.server.max_upload_bytes,
            project: kb.project.clone(),
            viking,
            tos,
            agent,
            sweeper,
        })
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
