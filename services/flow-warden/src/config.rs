//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Every section is optional. The captcha service API key is loaded from
//! CAPTCHA_API_KEY or api_key_file, never stored in the TOML directly.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use common::Secret;
use flow_captcha::{DisplayCapability, SolverBackend};
use serde::Deserialize;

/// Root configuration
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub pool: PoolSection,
    #[serde(default)]
    pub exchange: ExchangeConfig,
    #[serde(default)]
    pub captcha: CaptchaConfig,
    #[serde(default)]
    pub browser: BrowserConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Credential store location
#[derive(Debug, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

/// Pool limits and background task cadence
#[derive(Debug, Deserialize)]
pub struct PoolSection {
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: u32,
    #[serde(default = "default_auth_failure_threshold")]
    pub auth_failure_threshold: u32,
    #[serde(default = "default_wait_timeout")]
    pub wait_timeout_secs: u64,
    #[serde(default = "default_refresh_timeout")]
    pub refresh_timeout_secs: u64,
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,
    /// Refresh credentials whose ST expires within this window
    #[serde(default = "default_refresh_threshold")]
    pub refresh_threshold_secs: u64,
    #[serde(default = "default_status_interval")]
    pub status_interval_secs: u64,
}

/// Silent AT → ST exchange
#[derive(Debug, Deserialize)]
pub struct ExchangeConfig {
    #[serde(default = "default_exchange_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_exchange_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_exchange_backoff")]
    pub backoff_ms: u64,
    #[serde(default = "default_exchange_timeout")]
    pub timeout_secs: u64,
}

/// Captcha solving for browser re-authentication
#[derive(Debug, Deserialize)]
pub struct CaptchaConfig {
    /// `browser` (in-page) or a solving service name
    #[serde(default = "default_captcha_backend")]
    pub backend: String,
    #[serde(skip)]
    pub api_key: Option<Secret<String>>,
    /// Path to a file containing the service API key (alternative to CAPTCHA_API_KEY)
    #[serde(default)]
    pub api_key_file: Option<PathBuf>,
    /// Override the service's API base URL
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_solve_attempts")]
    pub max_solve_attempts: u32,
    #[serde(default = "default_browser_sessions")]
    pub max_browser_sessions: usize,
    #[serde(default = "default_reauth_timeout")]
    pub reauth_timeout_secs: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_max_polls")]
    pub max_polls: u32,
}

/// Which display browser sessions run on
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayMode {
    /// Inspect the environment at startup
    #[default]
    Auto,
    Real,
    Virtual,
    None,
}

impl DisplayMode {
    pub fn resolve(self) -> DisplayCapability {
        match self {
            DisplayMode::Auto => DisplayCapability::detect(),
            DisplayMode::Real => DisplayCapability::Real,
            DisplayMode::Virtual => DisplayCapability::Virtual,
            DisplayMode::None => DisplayCapability::None,
        }
    }
}

/// WebDriver-driven browser
#[derive(Debug, Deserialize)]
pub struct BrowserConfig {
    #[serde(default = "default_webdriver_url")]
    pub webdriver_url: String,
    #[serde(default = "default_profile_root")]
    pub profile_root: PathBuf,
    #[serde(default)]
    pub binary: Option<String>,
    #[serde(default)]
    pub display: DisplayMode,
    #[serde(default = "default_challenge_wait")]
    pub challenge_wait_secs: u64,
}

/// Prometheus exposition
#[derive(Debug, Default, Deserialize)]
pub struct MetricsConfig {
    /// Serve `/metrics` here; metrics are recorded but not exposed when unset
    #[serde(default)]
    pub listen_addr: Option<SocketAddr>,
}

/// Resolved captcha backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptchaBackend {
    /// First-party solving inside the browser session
    Browser,
    Service(SolverBackend),
}

fn default_store_path() -> PathBuf {
    PathBuf::from("credentials.json")
}

fn default_max_concurrency() -> u32 {
    2
}

fn default_auth_failure_threshold() -> u32 {
    3
}

fn default_wait_timeout() -> u64 {
    150
}

fn default_refresh_timeout() -> u64 {
    30
}

fn default_refresh_interval() -> u64 {
    300
}

fn default_refresh_threshold() -> u64 {
    900
}

fn default_status_interval() -> u64 {
    60
}

fn default_exchange_endpoint() -> String {
    flow_auth::SESSION_ENDPOINT.to_string()
}

fn default_exchange_attempts() -> u32 {
    3
}

fn default_exchange_backoff() -> u64 {
    500
}

fn default_exchange_timeout() -> u64 {
    30
}

fn default_captcha_backend() -> String {
    "browser".into()
}

fn default_solve_attempts() -> u32 {
    3
}

fn default_browser_sessions() -> usize {
    1
}

fn default_reauth_timeout() -> u64 {
    120
}

fn default_poll_interval() -> u64 {
    3
}

fn default_max_polls() -> u32 {
    40
}

fn default_webdriver_url() -> String {
    "http://127.0.0.1:9515".into()
}

fn default_profile_root() -> PathBuf {
    PathBuf::from("browser-profiles")
}

fn default_challenge_wait() -> u64 {
    15
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            auth_failure_threshold: default_auth_failure_threshold(),
            wait_timeout_secs: default_wait_timeout(),
            refresh_timeout_secs: default_refresh_timeout(),
            refresh_interval_secs: default_refresh_interval(),
            refresh_threshold_secs: default_refresh_threshold(),
            status_interval_secs: default_status_interval(),
        }
    }
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            endpoint: default_exchange_endpoint(),
            max_attempts: default_exchange_attempts(),
            backoff_ms: default_exchange_backoff(),
            timeout_secs: default_exchange_timeout(),
        }
    }
}

impl Default for CaptchaConfig {
    fn default() -> Self {
        Self {
            backend: default_captcha_backend(),
            api_key: None,
            api_key_file: None,
            base_url: None,
            max_solve_attempts: default_solve_attempts(),
            max_browser_sessions: default_browser_sessions(),
            reauth_timeout_secs: default_reauth_timeout(),
            poll_interval_secs: default_poll_interval(),
            max_polls: default_max_polls(),
        }
    }
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            webdriver_url: default_webdriver_url(),
            profile_root: default_profile_root(),
            binary: None,
            display: DisplayMode::default(),
            challenge_wait_secs: default_challenge_wait(),
        }
    }
}

impl PoolSection {
    pub fn to_pool_config(&self) -> flow_pool::PoolConfig {
        flow_pool::PoolConfig {
            max_concurrency: self.max_concurrency,
            auth_failure_threshold: self.auth_failure_threshold,
            wait_timeout: Duration::from_secs(self.wait_timeout_secs),
            refresh_timeout: Duration::from_secs(self.refresh_timeout_secs),
        }
    }
}

impl CaptchaConfig {
    /// Parse `backend`. Only valid after [`Config::load`] has validated it.
    pub fn resolved_backend(&self) -> common::Result<CaptchaBackend> {
        if self.backend.eq_ignore_ascii_case("browser") {
            return Ok(CaptchaBackend::Browser);
        }
        SolverBackend::from_str(&self.backend)
            .map(CaptchaBackend::Service)
            .map_err(|_| {
                common::Error::Config(format!(
                    "captcha.backend must be browser, yescaptcha, capmonster, ezcaptcha or capsolver, got: {}",
                    self.backend
                ))
            })
    }
}

fn require_http(field: &str, url: &str) -> common::Result<()> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(common::Error::Config(format!(
            "{field} must start with http:// or https://, got: {url}"
        )))
    }
}

fn require_nonzero(field: &str, value: u64) -> common::Result<()> {
    if value == 0 {
        return Err(common::Error::Config(format!(
            "{field} must be greater than 0"
        )));
    }
    Ok(())
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// API key resolution order:
    /// 1. CAPTCHA_API_KEY env var
    /// 2. api_key_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        require_http("exchange.endpoint", &config.exchange.endpoint)?;
        require_http("browser.webdriver_url", &config.browser.webdriver_url)?;
        if let Some(url) = &config.captcha.base_url {
            require_http("captcha.base_url", url)?;
        }

        let pool = &config.pool;
        require_nonzero("pool.max_concurrency", pool.max_concurrency.into())?;
        require_nonzero("pool.auth_failure_threshold", pool.auth_failure_threshold.into())?;
        require_nonzero("pool.wait_timeout_secs", pool.wait_timeout_secs)?;
        require_nonzero("pool.refresh_timeout_secs", pool.refresh_timeout_secs)?;
        require_nonzero("pool.refresh_interval_secs", pool.refresh_interval_secs)?;
        require_nonzero("pool.status_interval_secs", pool.status_interval_secs)?;
        require_nonzero("exchange.max_attempts", config.exchange.max_attempts.into())?;
        require_nonzero("exchange.timeout_secs", config.exchange.timeout_secs)?;
        require_nonzero("captcha.max_solve_attempts", config.captcha.max_solve_attempts.into())?;
        require_nonzero("captcha.max_browser_sessions", config.captcha.max_browser_sessions as u64)?;
        require_nonzero("captcha.reauth_timeout_secs", config.captcha.reauth_timeout_secs)?;
        require_nonzero("captcha.max_polls", config.captcha.max_polls.into())?;

        // A caller waiting on a browser re-auth must outlast it
        if pool.wait_timeout_secs < config.captcha.reauth_timeout_secs {
            return Err(common::Error::Config(format!(
                "pool.wait_timeout_secs ({}) must be at least captcha.reauth_timeout_secs ({})",
                pool.wait_timeout_secs, config.captcha.reauth_timeout_secs
            )));
        }

        let backend = config.captcha.resolved_backend()?;

        // Resolve API key: env var takes precedence over file
        if let Ok(key) = std::env::var("CAPTCHA_API_KEY") {
            config.captcha.api_key = Some(Secret::new(key));
        } else if let Some(ref key_file) = config.captcha.api_key_file {
            let key = std::fs::read_to_string(key_file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read api_key_file {}: {e}",
                    key_file.display()
                ))
            })?;
            let key = key.trim().to_owned();
            if !key.is_empty() {
                config.captcha.api_key = Some(Secret::new(key));
            }
        }

        if matches!(backend, CaptchaBackend::Service(_)) && config.captcha.api_key.is_none() {
            return Err(common::Error::Config(format!(
                "captcha.backend {} needs CAPTCHA_API_KEY or captcha.api_key_file",
                config.captcha.backend
            )));
        }

        Ok(config)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("flow-warden.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Serializes tests that mutate environment variables.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// SAFETY: Callers must hold ENV_MUTEX to prevent concurrent env mutation.
    unsafe fn set_env(key: &str, val: &str) {
        unsafe { std::env::set_var(key, val) };
    }

    unsafe fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) };
    }

    fn write_config(dir: &tempfile::TempDir, contents: &str) -> PathBuf {
        let path = dir.path().join("flow-warden.toml");
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn empty_file_uses_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("CAPTCHA_API_KEY") };
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "");

        let config = Config::load(&path).unwrap();
        assert_eq!(config.store.path, PathBuf::from("credentials.json"));
        assert_eq!(config.pool.max_concurrency, 2);
        assert_eq!(config.pool.auth_failure_threshold, 3);
        assert_eq!(config.exchange.endpoint, flow_auth::SESSION_ENDPOINT);
        assert_eq!(config.exchange.max_attempts, 3);
        assert_eq!(config.captcha.resolved_backend().unwrap(), CaptchaBackend::Browser);
        assert_eq!(config.captcha.max_browser_sessions, 1);
        assert_eq!(config.browser.display, DisplayMode::Auto);
        assert!(config.metrics.listen_addr.is_none());
        assert!(config.captcha.api_key.is_none());

        let pool = config.pool.to_pool_config();
        assert_eq!(pool.wait_timeout, Duration::from_secs(150));
        assert_eq!(pool.refresh_timeout, Duration::from_secs(30));
    }

    #[test]
    fn full_config_round_trips_values() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("CAPTCHA_API_KEY") };
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[store]
path = "/var/lib/flow/credentials.json"

[pool]
max_concurrency = 4
auth_failure_threshold = 5
refresh_interval_secs = 120

[exchange]
max_attempts = 5
backoff_ms = 250

[captcha]
max_solve_attempts = 2
max_browser_sessions = 3

[browser]
display = "virtual"
binary = "/usr/bin/chromium"

[metrics]
listen_addr = "127.0.0.1:9464"
"#,
        );

        let config = Config::load(&path).unwrap();
        assert_eq!(config.store.path, PathBuf::from("/var/lib/flow/credentials.json"));
        assert_eq!(config.pool.max_concurrency, 4);
        assert_eq!(config.pool.auth_failure_threshold, 5);
        assert_eq!(config.pool.refresh_interval_secs, 120);
        assert_eq!(config.exchange.max_attempts, 5);
        assert_eq!(config.captcha.max_browser_sessions, 3);
        assert_eq!(config.browser.display.resolve(), DisplayCapability::Virtual);
        assert_eq!(config.browser.binary.as_deref(), Some("/usr/bin/chromium"));
        assert_eq!(config.metrics.listen_addr, Some("127.0.0.1:9464".parse().unwrap()));
    }

    #[test]
    fn missing_file_is_an_error() {
        let result = Config::load(Path::new("/nonexistent/path/flow-warden.toml"));
        assert!(matches!(result, Err(common::Error::Io(_))));
    }

    #[test]
    fn invalid_toml_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "not valid {{{{ toml");
        assert!(matches!(Config::load(&path), Err(common::Error::Toml(_))));
    }

    #[test]
    fn zero_limits_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("CAPTCHA_API_KEY") };
        let dir = tempfile::tempdir().unwrap();

        for (section, field) in [
            ("pool", "max_concurrency"),
            ("pool", "auth_failure_threshold"),
            ("pool", "wait_timeout_secs"),
            ("exchange", "max_attempts"),
            ("captcha", "max_browser_sessions"),
            ("captcha", "reauth_timeout_secs"),
        ] {
            let path = write_config(&dir, &format!("[{section}]\n{field} = 0\n"));
            let err = Config::load(&path).unwrap_err().to_string();
            assert!(
                err.contains(&format!("{section}.{field} must be greater than 0")),
                "unexpected error for {section}.{field}: {err}"
            );
        }
    }

    #[test]
    fn wait_timeout_must_cover_reauth() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("CAPTCHA_API_KEY") };
        let dir = tempfile::tempdir().unwrap();

        let path = write_config(&dir, "[pool]\nwait_timeout_secs = 60\n");
        let err = Config::load(&path).unwrap_err().to_string();
        assert!(
            err.contains("pool.wait_timeout_secs (60) must be at least captcha.reauth_timeout_secs (120)"),
            "got: {err}"
        );

        let path = write_config(
            &dir,
            "[pool]\nwait_timeout_secs = 60\n[captcha]\nreauth_timeout_secs = 60\n",
        );
        assert_eq!(Config::load(&path).unwrap().pool.wait_timeout_secs, 60);
    }

    #[test]
    fn urls_without_scheme_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("CAPTCHA_API_KEY") };
        let dir = tempfile::tempdir().unwrap();

        let path = write_config(&dir, "[exchange]\nendpoint = \"labs.google/fx/api/auth/session\"\n");
        let err = Config::load(&path).unwrap_err().to_string();
        assert!(err.contains("exchange.endpoint must start with http"), "got: {err}");

        let path = write_config(&dir, "[browser]\nwebdriver_url = \"localhost:9515\"\n");
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn unknown_backend_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("CAPTCHA_API_KEY") };
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "[captcha]\nbackend = \"2captcha\"\n");

        let err = Config::load(&path).unwrap_err().to_string();
        assert!(err.contains("captcha.backend must be"), "got: {err}");
    }

    #[test]
    fn unknown_display_mode_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "[browser]\ndisplay = \"hologram\"\n");
        assert!(matches!(Config::load(&path), Err(common::Error::Toml(_))));
    }

    #[test]
    fn service_backend_requires_api_key() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("CAPTCHA_API_KEY") };
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "[captcha]\nbackend = \"capsolver\"\n");

        let err = Config::load(&path).unwrap_err().to_string();
        assert!(err.contains("needs CAPTCHA_API_KEY"), "got: {err}");
    }

    #[test]
    fn api_key_from_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "[captcha]\nbackend = \"yescaptcha\"\n");

        unsafe { set_env("CAPTCHA_API_KEY", "key-from-env") };
        let config = Config::load(&path).unwrap();
        unsafe { remove_env("CAPTCHA_API_KEY") };

        assert_eq!(config.captcha.api_key.as_ref().unwrap().expose(), "key-from-env");
        assert_eq!(
            config.captcha.resolved_backend().unwrap(),
            CaptchaBackend::Service(SolverBackend::YesCaptcha)
        );
    }

    #[test]
    fn api_key_from_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("CAPTCHA_API_KEY") };
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("captcha_key");
        std::fs::write(&key_path, "key-from-file\n").unwrap();
        let path = write_config(
            &dir,
            &format!(
                "[captcha]\nbackend = \"capmonster\"\napi_key_file = \"{}\"\n",
                key_path.display()
            ),
        );

        let config = Config::load(&path).unwrap();
        assert_eq!(config.captcha.api_key.as_ref().unwrap().expose(), "key-from-file");
    }

    #[test]
    fn api_key_env_overrides_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("captcha_key");
        std::fs::write(&key_path, "key-from-file").unwrap();
        let path = write_config(
            &dir,
            &format!("[captcha]\napi_key_file = \"{}\"\n", key_path.display()),
        );

        unsafe { set_env("CAPTCHA_API_KEY", "key-from-env") };
        let config = Config::load(&path).unwrap();
        unsafe { remove_env("CAPTCHA_API_KEY") };

        assert_eq!(config.captcha.api_key.as_ref().unwrap().expose(), "key-from-env");
    }

    #[test]
    fn api_key_file_missing_is_an_error() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("CAPTCHA_API_KEY") };
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "[captcha]\napi_key_file = \"/nonexistent/captcha_key\"\n");

        let err = Config::load(&path).unwrap_err().to_string();
        assert!(err.contains("failed to read api_key_file"), "got: {err}");
    }

    #[test]
    fn whitespace_api_key_file_yields_none() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("CAPTCHA_API_KEY") };
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("captcha_key");
        std::fs::write(&key_path, "  \n  ").unwrap();
        let path = write_config(
            &dir,
            &format!("[captcha]\napi_key_file = \"{}\"\n", key_path.display()),
        );

        let config = Config::load(&path).unwrap();
        assert!(config.captcha.api_key.is_none());
    }

    #[test]
    fn resolve_path_precedence() {
        let _lock = ENV_MUTEX.lock().unwrap();

        unsafe { set_env("CONFIG_PATH", "/env/path.toml") };
        assert_eq!(
            Config::resolve_path(Some("/cli/wins.toml")),
            PathBuf::from("/cli/wins.toml")
        );
        assert_eq!(Config::resolve_path(None), PathBuf::from("/env/path.toml"));

        unsafe { remove_env("CONFIG_PATH") };
        assert_eq!(Config::resolve_path(None), PathBuf::from("flow-warden.toml"));
    }
}
