use std::env;
use std::net::SocketAddr;
use std::time::Duration;

/// Coordinator configuration, loaded once at startup from the process
/// environment (§6's configuration table). CLI argument parsing is out of
/// scope per spec; environment variables (optionally loaded from a local
/// `.env` file) are the only configuration surface.
#[derive(Debug, Clone)]
pub struct Config {
    // Transport
    pub bind_host: String,
    pub bind_port: u16,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub tls_ca: Option<String>,
    pub tls_passphrase: Option<String>,
    pub tunnel_provider: Option<String>,

    // Initial session
    pub threshold: u32,
    pub eligible_keys: Vec<String>,
    pub expected_participants: u32,
    pub session_timeout: Duration,
    pub auth_token: Option<String>,

    // Timer tuning
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub cleanup_interval: Duration,

    // Persistence
    pub persistent_store: Option<String>,

    // CORS, for the HTTP surface that carries health/metrics alongside /ws
    pub cors_origins: Vec<String>,
}

impl Config {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let eligible_keys = require_env("ELIGIBLE_KEYS")
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        let threshold: u32 = env("THRESHOLD", "1").parse().expect("THRESHOLD must be a number");
        let expected_participants: u32 = env("EXPECTED_PARTICIPANTS", &eligible_keys.len().to_string())
            .parse()
            .unwrap_or(eligible_keys.len() as u32);

        Self {
            bind_host: env("BIND_HOST", "0.0.0.0"),
            bind_port: env("BIND_PORT", "9000").parse().expect("BIND_PORT must be a number"),
            tls_cert: env_opt("TLS_CERT"),
            tls_key: env_opt("TLS_KEY"),
            tls_ca: env_opt("TLS_CA"),
            tls_passphrase: env_opt("TLS_PASSPHRASE"),
            tunnel_provider: env_opt("TUNNEL_PROVIDER"),

            threshold,
            eligible_keys,
            expected_participants,
            session_timeout: Duration::from_secs(
                env("SESSION_TIMEOUT_SECS", "1800").parse().unwrap_or(1800),
            ),
            auth_token: env_opt("AUTH_TOKEN"),

            heartbeat_interval: Duration::from_secs(
                env("HEARTBEAT_INTERVAL_SECS", "30").parse().unwrap_or(30),
            ),
            heartbeat_timeout: Duration::from_secs(
                env("HEARTBEAT_TIMEOUT_SECS", "90").parse().unwrap_or(90),
            ),
            cleanup_interval: Duration::from_secs(
                env("CLEANUP_INTERVAL_SECS", "60").parse().unwrap_or(60),
            ),

            persistent_store: env_opt("PERSISTENT_STORE"),

            cors_origins: env("CORS_ORIGINS", "*")
                .split(',')
                .map(|s| s.trim().to_string())
                .collect(),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        format!("{}:{}", self.bind_host, self.bind_port)
            .parse()
            .expect("invalid bind address")
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls_cert.is_some() && self.tls_key.is_some()
    }
}

fn env(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

fn require_env(key: &str) -> String {
    env::var(key).unwrap_or_else(|_| panic!("{key} environment variable is required"))
}
