use async_mutex::Mutex;
use cached::stores::TimedCache;
use slog::o;
use slog::Drain;
use sqlx::postgres::PgPoolOptions;
use std::io::Read;
use std::sync::Arc;
use std::{env, fs};

mod crypto;
mod db;
mod logging;
mod models;
mod service;
mod spotify;
mod utils;

pub type Error = tide::Error;
pub type Result<T> = std::result::Result<T, Error>;

/// Shorthand for making a new server error with a formatted message
#[macro_export]
macro_rules! se {
    ($($arg:tt)*) => {
        tide::Error::from_str(tide::StatusCode::InternalServerError, format!($($arg)*))
    };
}

/// Shorthand for building the json responses handlers return
#[macro_export]
macro_rules! resp {
    (json => $body:expr) => {
        tide::Response::builder(200)
            .body(tide::Body::from_json(&$body)?)
            .build()
    };
    (message => $msg:expr) => {
        tide::Response::builder(200)
            .body(serde_json::json!({ "message": $msg }))
            .build()
    };
    (status => $status:expr, error => $msg:expr) => {
        tide::Response::builder($status)
            .body(serde_json::json!({ "error": $msg }))
            .build()
    };
}

fn env_or(k: &str, default: &str) -> String {
    env::var(k).unwrap_or_else(|_| default.to_string())
}

lazy_static::lazy_static! {
    pub static ref CONFIG: Config = Config::load();

    // The "base" logger that all crates should branch off of
    pub static ref BASE_LOG: slog::Logger = {
        let level: slog::Level = CONFIG.log_level
                .parse()
                .expect("invalid log_level");
        if CONFIG.log_format == "pretty" {
            let decorator = slog_term::TermDecorator::new().build();
            let drain = slog_term::CompactFormat::new(decorator).build().fuse();
            let drain = slog_async::Async::new(drain).build().fuse();
            let drain = slog::LevelFilter::new(drain, level).fuse();
            slog::Logger::root(drain, o!())
        } else {
            let drain = slog_json::Json::default(std::io::stderr()).fuse();
            let drain = slog_async::Async::new(drain).build().fuse();
            let drain = slog::LevelFilter::new(drain, level).fuse();
            slog::Logger::root(drain, o!())
        }
    };

    // Base logger
    pub static ref LOG: slog::Logger = BASE_LOG.new(slog::o!("app" => "cratedigger"));

    // one-time login state tokens, dropped on first use or after expiry
    pub static ref LOGIN_STATES: Arc<Mutex<TimedCache<String, ()>>> = Arc::new(Mutex::new(TimedCache::with_lifespan(300)));
}

pub struct Config {
    pub version: String,
    pub ssl: bool,
    pub host: String,
    pub real_hostname: Option<String>,
    pub port: u16,
    pub log_format: String,
    pub log_level: String,
    pub spotify_client_id: String,
    pub spotify_secret_id: String,
    pub db_url: String,
    pub enc_key: String,
    pub session_secret: String,
    pub require_login_state: bool,
}
impl Config {
    pub fn load() -> Self {
        let version = fs::File::open("commit_hash.txt")
            .map(|mut f| {
                let mut s = String::new();
                f.read_to_string(&mut s).expect("Error reading commit_hash");
                s
            })
            .unwrap_or_else(|_| "unknown".to_string());
        Self {
            version,
            ssl: env_or("SSL", "false") == "true",
            host: env_or("HOST", "localhost"),
            real_hostname: env::var("REAL_HOSTNAME").ok(),
            port: env_or("PORT", "3030").parse().expect("invalid port"),
            log_format: env_or("LOG_FORMAT", "json")
                .to_lowercase()
                .trim()
                .to_string(),
            log_level: env_or("LOG_LEVEL", "INFO"),
            spotify_client_id: env_or("SPOTIFY_CLIENT_ID", "fake"),
            spotify_secret_id: env_or("SPOTIFY_SECRET_ID", "fake"),
            db_url: env::var("DATABASE_URL").unwrap_or_else(|_| {
                format!(
                    "postgres://{user}:{password}@{host}:{port}/{name}",
                    user = env_or("DB_USER", "postgres"),
                    password = env_or("DB_PASSWORD", "postgres"),
                    host = env_or("DB_HOST", "localhost"),
                    port = env_or("DB_PORT", "5432"),
                    name = env_or("DB_NAME", "cratedigger"),
                )
            }),
            enc_key: env_or("ENC_KEY", "01234567890123456789012345678901"),
            session_secret: env_or("SESSION_SECRET", "01234567890123456789012345678901"),
            require_login_state: env_or("REQUIRE_LOGIN_STATE", "false") == "true",
        }
    }
    pub fn initialize(&self) -> anyhow::Result<()> {
        if self.enc_key.len() != 32 {
            anyhow::bail!("ENC_KEY must be exactly 32 bytes");
        }
        if self.session_secret.len() < 32 {
            anyhow::bail!("SESSION_SECRET must be at least 32 bytes");
        }
        slog::info!(
            LOG, "initialized config";
            "version" => &CONFIG.version,
            "ssl" => &CONFIG.ssl,
            "host" => &CONFIG.host,
            "real_hostname" => &CONFIG.real_hostname,
            "port" => &CONFIG.port,
            "log_format" => &CONFIG.log_format,
            "log_level" => &CONFIG.log_level,
            "require_login_state" => &CONFIG.require_login_state,
        );
        Ok(())
    }
    pub fn host(&self) -> String {
        let p = if self.ssl { "https" } else { "http" };
        format!("{}://{}:{}", p, self.host, self.port)
    }
    /// The host spotify and browsers are told to come back to,
    /// differing from the listen host when behind a proxy.
    pub fn redirect_host(&self) -> String {
        self.real_hostname.clone().unwrap_or_else(|| self.host())
    }
    pub fn spotify_redirect_url(&self) -> String {
        format!("{}/callback", self.redirect_host())
    }
}

#[async_std::main]
async fn main() -> tide::Result<()> {
    // try sourcing a .env if one exists
    dotenv::dotenv().ok();
    CONFIG.initialize()?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&CONFIG.db_url)
        .await?;
    sqlx::migrate!().run(&pool).await?;
    service::start(pool).await
}
