use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Application configuration loaded from the environment.
///
/// Command-line flag parsing is out of scope for the core (see `spec.md`
/// §1); this loader only reads environment variables, optionally primed
/// from a `.env` file via `dotenvy`.
#[derive(Clone, Debug)]
pub struct Config {
    pub server_host: String,
    pub server_port: u16,
    pub is_dev: bool,
    pub allowed_origins: Vec<String>,

    /// UDP port the TURN/STUN relay listens on.
    pub turn_port: u16,
    /// STUN/TURN realm advertised to clients and checked during auth.
    pub turn_realm: String,
    /// Directory holding the persisted TURN credential files.
    pub turn_keys_dir: PathBuf,

    /// Maximum time a call may remain live without a state-changing touch.
    pub call_ttl: Duration,
    /// Period of the background sweep that evicts expired calls.
    pub sweep_period: Duration,

    /// Directory holding the built frontend bundle, served as a fallback so
    /// the binary is runnable end-to-end without a reverse proxy in front of
    /// it. Serving/building the SPA itself is out of scope; this is boundary
    /// wiring only (`spec.md` §1).
    pub static_dir: PathBuf,
}

impl Config {
    pub fn from_env() -> Result<Self, env::VarError> {
        dotenvy::dotenv().ok();

        let is_dev = env::var("APP_ENV").as_deref() != Ok("production");

        let allowed_origins = env::var("ALLOWED_ORIGINS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .collect();

        Ok(Config {
            server_host: env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            server_port: env::var("SERVER_PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .unwrap_or(8080),
            is_dev,
            allowed_origins,

            turn_port: env::var("TURN_PORT")
                .unwrap_or_else(|_| "3478".to_string())
                .parse()
                .unwrap_or(3478),
            turn_realm: env::var("TURN_REALM").unwrap_or_else(|_| "familycall".to_string()),
            turn_keys_dir: env::var("TURN_KEYS_DIR")
                .unwrap_or_else(|_| "./keys".to_string())
                .into(),

            call_ttl: Duration::from_secs(
                env::var("CALL_TTL_SECS")
                    .unwrap_or_else(|_| "1800".to_string())
                    .parse()
                    .unwrap_or(1800),
            ),
            sweep_period: Duration::from_secs(
                env::var("SWEEP_PERIOD_SECS")
                    .unwrap_or_else(|_| "10800".to_string())
                    .parse()
                    .unwrap_or(10800),
            ),

            static_dir: env::var("STATIC_DIR")
                .unwrap_or_else(|_| "./public".to_string())
                .into(),
        })
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }
}
