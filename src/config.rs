use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub monitor: MonitorConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamConfig {
    /// Base URL for Anthropic-style requests (/v1/messages)
    pub anthropic_base_url: String,
    /// Base URL for OpenAI-style requests (/v1/chat/completions)
    pub openai_base_url: String,
    /// Default credential injected when the client sends none
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Upstream response timeout in seconds
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitorConfig {
    /// Maximum number of completed records kept in memory
    pub max_history: usize,
    /// Whether the observer WebSocket channel is exposed
    pub enable_ws: bool,
}

/// Load configuration from an optional `config.toml` plus `LIVETOKEN__*`
/// environment overrides, on top of built-in defaults.
pub fn load_config(file: &str) -> anyhow::Result<Config> {
    let config = config::Config::builder()
        .set_default("server.host", "0.0.0.0")?
        .set_default("server.port", 7357)?
        .set_default("upstream.anthropic_base_url", "https://api.anthropic.com")?
        .set_default("upstream.openai_base_url", "https://api.openai.com")?
        .set_default("upstream.timeout_seconds", 300)?
        .set_default("monitor.max_history", 100)?
        .set_default("monitor.enable_ws", true)?
        .add_source(config::File::with_name(file).required(false))
        .add_source(config::Environment::with_prefix("LIVETOKEN").separator("__"))
        .build()?;

    let cfg: Config = config.try_deserialize()?;
    validate_config(&cfg)?;

    Ok(cfg)
}

fn validate_config(cfg: &Config) -> anyhow::Result<()> {
    for (name, url) in [
        ("upstream.anthropic_base_url", &cfg.upstream.anthropic_base_url),
        ("upstream.openai_base_url", &cfg.upstream.openai_base_url),
    ] {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            anyhow::bail!("{} must be an http(s) URL, got '{}'", name, url);
        }
        if url.ends_with('/') {
            anyhow::bail!("{} must not end with a trailing slash", name);
        }
    }

    if cfg.monitor.max_history == 0 {
        anyhow::bail!("monitor.max_history must be at least 1");
    }
    if cfg.upstream.timeout_seconds == 0 {
        anyhow::bail!("upstream.timeout_seconds must be at least 1");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_config() -> Config {
        Config {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 7357,
            },
            upstream: UpstreamConfig {
                anthropic_base_url: "https://api.anthropic.com".to_string(),
                openai_base_url: "https://api.openai.com".to_string(),
                api_key: None,
                timeout_seconds: 300,
            },
            monitor: MonitorConfig {
                max_history: 100,
                enable_ws: true,
            },
        }
    }

    #[test]
    fn test_validate_accepts_defaults() {
        assert!(validate_config(&create_test_config()).is_ok());
    }

    #[test]
    fn test_validate_rejects_non_http_url() {
        let mut cfg = create_test_config();
        cfg.upstream.anthropic_base_url = "ftp://example.com".to_string();
        let result = validate_config(&cfg);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("http(s)"));
    }

    #[test]
    fn test_validate_rejects_trailing_slash() {
        let mut cfg = create_test_config();
        cfg.upstream.openai_base_url = "https://api.openai.com/".to_string();
        assert!(validate_config(&cfg).is_err());
    }

    #[test]
    fn test_validate_rejects_zero_history() {
        let mut cfg = create_test_config();
        cfg.monitor.max_history = 0;
        assert!(validate_config(&cfg).is_err());
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let mut cfg = create_test_config();
        cfg.upstream.timeout_seconds = 0;
        assert!(validate_config(&cfg).is_err());
    }
}
