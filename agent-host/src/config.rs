use crate::connection::ConnectionStrategy;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// Port the agent host listens on
    pub port: u16,
    /// Directory holding `host.db` and the per-agent databases
    pub data_dir: PathBuf,
    /// Keep every database in memory (nothing survives a restart)
    pub in_memory: bool,
    /// Connection strategy for the demo agent class
    pub connection_strategy: ConnectionStrategy,
    /// How long an agent can be idle before it is hibernated
    pub idle_timeout: Duration,
    /// How often the idle watchdog runs
    pub eviction_interval: Duration,
    /// Largest accepted Streamable-HTTP / SSE POST body
    pub max_body_bytes: usize,
    /// Allowed CORS origins. Empty allows any origin.
    pub cors_origins: Vec<String>,
    /// Increment used by the demo agent's counter
    pub demo_counter_step: i64,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let strategy = env_str("AGENT_CONNECTION_STRATEGY", "hibernating");
        let connection_strategy = ConnectionStrategy::parse(&strategy).ok_or_else(|| {
            anyhow::anyhow!(
                "Invalid AGENT_CONNECTION_STRATEGY '{strategy}'. Expected 'hibernating' or 'memory'"
            )
        })?;

        Ok(Self {
            port: env_parse("AGENT_HOST_PORT", 8080)?,
            data_dir: PathBuf::from(env_str("AGENT_DATA_DIR", "./data")),
            in_memory: env_parse("AGENT_IN_MEMORY", false)?,
            connection_strategy,
            idle_timeout: Duration::from_secs(env_parse("AGENT_IDLE_TIMEOUT_SECS", 300)?),
            eviction_interval: Duration::from_secs(env_parse("AGENT_EVICTION_INTERVAL_SECS", 30)?),
            max_body_bytes: env_parse("MCP_MAX_BODY_BYTES", 4 * 1024 * 1024)?,
            cors_origins: env_csv("AGENT_CORS_ORIGINS", &[]),
            demo_counter_step: env_parse("DEMO_COUNTER_STEP", 1)?,
        })
    }
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(val) => val
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Failed to parse env var {key}={val}: {e}")),
        Err(_) => Ok(default),
    }
}

fn env_csv(key: &str, default: &[&str]) -> Vec<String> {
    match std::env::var(key) {
        Ok(raw) => raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
            .collect(),
        Err(_) => default.iter().map(|s| (*s).to_string()).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_parse_reports_key() {
        std::env::set_var("AGENT_HOST_TEST_PORT", "not-a-port");
        let err = env_parse::<u16>("AGENT_HOST_TEST_PORT", 1).unwrap_err();
        assert!(err.to_string().contains("AGENT_HOST_TEST_PORT"));
        std::env::remove_var("AGENT_HOST_TEST_PORT");

        assert_eq!(env_parse::<u16>("AGENT_HOST_TEST_UNSET", 7).unwrap(), 7);
    }

    #[test]
    fn test_env_csv_trims_and_skips_empty() {
        std::env::set_var("AGENT_HOST_TEST_CSV", " a, ,b ");
        assert_eq!(env_csv("AGENT_HOST_TEST_CSV", &[]), vec!["a", "b"]);
        std::env::remove_var("AGENT_HOST_TEST_CSV");
    }
}
