use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use url::Url;

pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// One entry per HTTP relay instance
    #[serde(default)]
    pub http: Vec<HttpRelayConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct HttpRelayConfig {
    /// Name identifies the HTTP relay
    #[serde(default)]
    pub name: String,

    /// Desired listening host:port
    pub bind_addr: String,

    /// Path to a combined certificate+key PEM; presence selects HTTPS
    #[serde(default)]
    pub ssl_combined_pem: Option<String>,

    /// Directory under which each follower's durable queue lives
    #[serde(default)]
    pub buffer_dir: String,

    /// Backend servers where writes are forwarded, in order (first is leader)
    #[serde(rename = "output", default)]
    pub outputs: Vec<HttpOutputConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct HttpOutputConfig {
    /// Name of the backend server; defaults to its location
    #[serde(default)]
    pub name: String,

    /// Full URL of the backend server's write endpoint
    pub location: String,

    /// Per-backend timeout for replayed write attempts (default 10s)
    #[serde(with = "duration_serde", default = "default_timeout")]
    pub timeout: Duration,

    /// Skip TLS verification in order to use a self-signed certificate.
    /// WARNING: insecure, development only.
    #[serde(default)]
    pub skip_tls_verification: bool,
}

fn default_timeout() -> Duration {
    DEFAULT_HTTP_TIMEOUT
}

impl HttpRelayConfig {
    /// Scheme the relay will serve, derived from the TLS configuration.
    pub fn scheme(&self) -> &'static str {
        if self.ssl_combined_pem.is_some() {
            "https"
        } else {
            "http"
        }
    }

    /// Display name for logs; falls back to the listening URL.
    pub fn display_name(&self) -> String {
        if self.name.is_empty() {
            format!("{}://{}", self.scheme(), self.bind_addr)
        } else {
            self.name.clone()
        }
    }
}

impl HttpOutputConfig {
    /// The unique backend name, defaulting to the location URL.
    pub fn resolved_name(&self) -> &str {
        if self.name.is_empty() {
            &self.location
        } else {
            &self.name
        }
    }
}

impl Config {
    /// Load configuration from file
    pub async fn load(path: &str) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        for relay in &self.http {
            if relay.bind_addr.is_empty() {
                anyhow::bail!("Relay '{}' has no bind-addr", relay.display_name());
            }

            if relay.outputs.len() > 1 && relay.buffer_dir.is_empty() {
                anyhow::bail!(
                    "Relay '{}' has followers but no buffer-dir",
                    relay.display_name()
                );
            }

            let mut names = HashSet::new();
            for output in &relay.outputs {
                if output.location.is_empty() {
                    anyhow::bail!(
                        "Backend location cannot be empty in relay '{}'",
                        relay.display_name()
                    );
                }

                Url::parse(&output.location).with_context(|| {
                    format!(
                        "Invalid backend location '{}' in relay '{}'",
                        output.location,
                        relay.display_name()
                    )
                })?;

                if !names.insert(output.resolved_name().to_string()) {
                    anyhow::bail!(
                        "Duplicate backend name '{}' in relay '{}'",
                        output.resolved_name(),
                        relay.display_name()
                    );
                }
            }
        }

        Ok(())
    }
}

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}s", duration.as_secs()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    fn parse_duration(s: &str) -> Result<Duration, String> {
        let parse = |num: &str| {
            num.parse::<u64>()
                .map_err(|e| format!("invalid duration '{}': {}", s, e))
        };

        if let Some(num) = s.strip_suffix("ms") {
            Ok(Duration::from_millis(parse(num)?))
        } else if let Some(num) = s.strip_suffix('s') {
            Ok(Duration::from_secs(parse(num)?))
        } else if let Some(num) = s.strip_suffix('m') {
            Ok(Duration::from_secs(parse(num)? * 60))
        } else if let Some(num) = s.strip_suffix('h') {
            Ok(Duration::from_secs(parse(num)? * 3600))
        } else {
            Ok(Duration::from_secs(parse(s)?))
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_name_defaults_to_location() {
        let config: Config = serde_yaml::from_str(
            r#"
http:
  - bind-addr: "127.0.0.1:9090"
    buffer-dir: "/tmp/buffer"
    output:
      - location: "http://127.0.0.1:8123"
      - name: "replica"
        location: "http://127.0.0.1:8124"
        timeout: "30s"
        skip-tls-verification: true
"#,
        )
        .unwrap();

        config.validate().unwrap();

        let relay = &config.http[0];
        assert_eq!(relay.outputs[0].resolved_name(), "http://127.0.0.1:8123");
        assert_eq!(relay.outputs[0].timeout, DEFAULT_HTTP_TIMEOUT);
        assert!(!relay.outputs[0].skip_tls_verification);
        assert_eq!(relay.outputs[1].resolved_name(), "replica");
        assert_eq!(relay.outputs[1].timeout, Duration::from_secs(30));
        assert!(relay.outputs[1].skip_tls_verification);
    }

    #[test]
    fn rejects_duplicate_backend_names() {
        let config: Config = serde_yaml::from_str(
            r#"
http:
  - bind-addr: "127.0.0.1:9090"
    buffer-dir: "/tmp/buffer"
    output:
      - name: "a"
        location: "http://127.0.0.1:8123"
      - name: "a"
        location: "http://127.0.0.1:8124"
"#,
        )
        .unwrap();

        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_followers_without_buffer_dir() {
        let config: Config = serde_yaml::from_str(
            r#"
http:
  - bind-addr: "127.0.0.1:9090"
    output:
      - location: "http://127.0.0.1:8123"
      - location: "http://127.0.0.1:8124"
"#,
        )
        .unwrap();

        assert!(config.validate().is_err());
    }

    #[test]
    fn display_name_falls_back_to_listen_url() {
        let relay = HttpRelayConfig {
            name: String::new(),
            bind_addr: "127.0.0.1:9090".to_string(),
            ssl_combined_pem: None,
            buffer_dir: String::new(),
            outputs: Vec::new(),
        };
        assert_eq!(relay.display_name(), "http://127.0.0.1:9090");
    }
}
