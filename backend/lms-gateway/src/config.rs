use serde::Deserialize;
use std::env;

const DEFAULT_LMS_API_URL: &str = "http://localhost:5000";
const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8081";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Base URL of the LMS REST server (origin only, paths start with `/api`).
    pub lms_api_url: String,
    /// HS256 secret shared with the LMS so issued tokens can be checked locally.
    pub jwt_secret: String,
    pub bind_addr: String,
    pub request_timeout_ms: u64,
    pub status_poll_interval_secs: u64,
    pub timer_tick_interval_ms: u64,
    /// `username:password` for the Basic-protected `/metrics` endpoint.
    pub metrics_auth: String,
}

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        // Root .env first (two levels up), then the local one
        let skip_root_env = env::var("SKIP_ROOT_ENV").is_ok();
        if skip_root_env {
            dotenvy::dotenv().ok();
        } else if dotenvy::from_path("../../.env").is_err() {
            dotenvy::dotenv().ok();
        }

        let env = env::var("APP_ENV").unwrap_or_else(|_| "dev".to_string());

        // config/*.toml + ENV overrides (prefix: APP_)
        let settings = config::Config::builder()
            .add_source(config::File::with_name(&format!("config/{}", env)).required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"))
            .build()?;

        let lms_api_url = settings
            .get_string("lms.api_url")
            .or_else(|_| env::var("LMS_API_URL"))
            .unwrap_or_else(|_| DEFAULT_LMS_API_URL.to_string());

        if let Err(e) = url::Url::parse(&lms_api_url) {
            return Err(config::ConfigError::Message(format!(
                "Invalid LMS API URL '{}': {}",
                lms_api_url, e
            )));
        }

        let jwt_secret = match settings
            .get_string("auth.jwt_secret")
            .or_else(|_| env::var("JWT_SECRET"))
        {
            Ok(secret) => secret,
            Err(_) if env == "prod" => {
                return Err(config::ConfigError::Message(
                    "JWT_SECRET must be set in production".to_string(),
                ));
            }
            Err(_) => {
                eprintln!("WARNING: Using default JWT_SECRET (dev mode only!)");
                "dev-secret-only-for-local-testing".to_string()
            }
        };

        let bind_addr = settings
            .get_string("server.bind_addr")
            .or_else(|_| env::var("BIND_ADDR"))
            .unwrap_or_else(|_| DEFAULT_BIND_ADDR.to_string());

        let metrics_auth = settings
            .get_string("metrics.auth")
            .or_else(|_| env::var("METRICS_AUTH"))
            .unwrap_or_else(|_| "admin:changeme".to_string());

        Ok(Config {
            lms_api_url,
            jwt_secret,
            bind_addr,
            request_timeout_ms: positive_int(&settings, "lms.request_timeout_ms", 10_000),
            status_poll_interval_secs: positive_int(&settings, "status.poll_interval_secs", 10),
            timer_tick_interval_ms: positive_int(&settings, "attempts.tick_interval_ms", 1000),
            metrics_auth,
        })
    }
}

fn positive_int(settings: &config::Config, key: &str, default: u64) -> u64 {
    settings
        .get_int(key)
        .ok()
        .and_then(|v| u64::try_from(v).ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}
