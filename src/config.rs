//! Configuration management with serde serialization/deserialization
//!
//! This module holds the process-wide [`Config`] (pool, browser, capture,
//! store, packaging, and request limits) and the per-job [`CaptureOptions`],
//! which are validated once at intake and never change afterwards.

use crate::{validate_url, CaptureError, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

/// Main configuration structure for the capture service
///
/// # Examples
///
/// ```rust
/// use page_capture::Config;
///
/// let config = Config::default();
/// assert_eq!(config.pool.max_instances, 5);
///
/// let config = Config {
///     job_timeout: std::time::Duration::from_secs(120),
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub pool: PoolConfig,
    pub browser: BrowserSettings,
    pub capture: CaptureSettings,
    pub store: StoreConfig,
    pub packaging: PackagingConfig,
    pub limits: OptionLimits,

    /// Upper bound on one job's wall-clock time (default: 10 minutes)
    #[serde(with = "humantime_serde")]
    pub job_timeout: Duration,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the HTTP API binds to (default: 0.0.0.0:3000)
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:3000".to_string(),
        }
    }
}

/// Browser pool sizing and lifecycle
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum number of live browser instances (default: 5)
    ///
    /// Every instance is a full Chrome process, so this is the main memory
    /// knob. Overridden by `MAX_BROWSERS`.
    pub max_instances: usize,

    /// Instances unused for longer than this are closed by the sweep
    /// (default: 5 minutes). Overridden by `BROWSER_TIMEOUT` (milliseconds).
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,

    /// How often the idle sweep runs (default: 60 seconds)
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,

    /// How long `acquire` may wait for a lease to be returned when every
    /// instance is busy (default: 0, fail immediately)
    #[serde(with = "humantime_serde")]
    pub acquire_timeout: Duration,

    /// Upper bound on launching one browser process (default: 30 seconds)
    #[serde(with = "humantime_serde")]
    pub launch_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_instances: 5,
            idle_timeout: Duration::from_secs(5 * 60),
            sweep_interval: Duration::from_secs(60),
            acquire_timeout: Duration::ZERO,
            launch_timeout: Duration::from_secs(30),
        }
    }
}

/// Chrome launch settings
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct BrowserSettings {
    /// Path to Chrome/Chromium executable (default: auto-detect)
    pub chrome_path: Option<String>,

    /// Custom User-Agent string for desktop instances
    pub user_agent: Option<String>,

    /// Memory limit per Chrome instance in bytes
    pub memory_limit: Option<usize>,
}

/// Timeouts and retry behaviour of the page capture unit
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CaptureSettings {
    /// Bound on a single navigation attempt (default: 45 seconds)
    #[serde(with = "humantime_serde")]
    pub navigation_timeout: Duration,

    /// Bound on taking one full-page screenshot (default: 30 seconds)
    #[serde(with = "humantime_serde")]
    pub screenshot_timeout: Duration,

    /// Bound on reading the page title (default: 5 seconds)
    #[serde(with = "humantime_serde")]
    pub title_timeout: Duration,

    /// Bound on a single click during interactive exploration (default: 10 seconds)
    #[serde(with = "humantime_serde")]
    pub click_timeout: Duration,

    /// Navigation retry policy (default: 3 attempts, 1s/2s linear backoff)
    pub navigation_retry: RetryPolicy,

    pub thumbnail_width: u32,
    pub thumbnail_height: u32,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            navigation_timeout: Duration::from_secs(45),
            screenshot_timeout: Duration::from_secs(30),
            title_timeout: Duration::from_secs(5),
            click_timeout: Duration::from_secs(10),
            navigation_retry: RetryPolicy::navigation(),
            thumbnail_width: 400,
            thumbnail_height: 300,
        }
    }
}

/// Session store settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite database file; an in-memory database is used when unset
    pub path: Option<PathBuf>,

    /// Sessions older than this are dropped from the cache (default: 1 hour)
    #[serde(with = "humantime_serde")]
    pub retention: Duration,

    /// How often expired sessions are swept (default: 5 minutes)
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,

    /// Durable write retry policy (default: 3 attempts, 100ms/200ms)
    pub write_retry: RetryPolicy,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            retention: Duration::from_secs(60 * 60),
            sweep_interval: Duration::from_secs(5 * 60),
            write_retry: RetryPolicy::store_write(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PackagingConfig {
    /// Deflate level, 1 (fastest) to 9 (smallest) (default: 6)
    pub compression_level: u8,
}

impl Default for PackagingConfig {
    fn default() -> Self {
        Self {
            compression_level: 6,
        }
    }
}

/// Server-side bounds applied to per-request options
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OptionLimits {
    pub max_depth: u32,
    pub max_pages: usize,
    pub max_elements: usize,
    pub min_viewport_width: u32,
    pub max_viewport_width: u32,
    pub min_viewport_height: u32,
    pub max_viewport_height: u32,
    #[serde(with = "humantime_serde")]
    pub max_wait_after_load: Duration,
    #[serde(with = "humantime_serde")]
    pub max_click_delay: Duration,
}

impl Default for OptionLimits {
    fn default() -> Self {
        Self {
            max_depth: 5,
            max_pages: 100,
            max_elements: 50,
            min_viewport_width: 320,
            max_viewport_width: 3840,
            min_viewport_height: 240,
            max_viewport_height: 2160,
            max_wait_after_load: Duration::from_secs(30),
            max_click_delay: Duration::from_secs(10),
        }
    }
}

impl Config {
    /// Applies the environment overrides on top of `self`.
    ///
    /// | Variable | Field |
    /// |---|---|
    /// | `MAX_BROWSERS` | `pool.max_instances` |
    /// | `BROWSER_TIMEOUT` | `pool.idle_timeout` (milliseconds) |
    /// | `POOL_ACQUIRE_TIMEOUT_MS` | `pool.acquire_timeout` |
    /// | `CAPTURE_BIND` | `server.bind` |
    /// | `CAPTURE_STORE_PATH` | `store.path` |
    /// | `SESSION_RETENTION_SECS` | `store.retention` |
    /// | `CHROME_PATH` | `browser.chrome_path` |
    pub fn apply_env(&mut self) -> Result<(), CaptureError> {
        self.apply_vars(|key| std::env::var(key).ok())
    }

    fn apply_vars<F>(&mut self, lookup: F) -> Result<(), CaptureError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("MAX_BROWSERS") {
            self.pool.max_instances = parse_var("MAX_BROWSERS", &v)?;
        }
        if let Some(v) = lookup("BROWSER_TIMEOUT") {
            self.pool.idle_timeout = Duration::from_millis(parse_var("BROWSER_TIMEOUT", &v)?);
        }
        if let Some(v) = lookup("POOL_ACQUIRE_TIMEOUT_MS") {
            self.pool.acquire_timeout =
                Duration::from_millis(parse_var("POOL_ACQUIRE_TIMEOUT_MS", &v)?);
        }
        if let Some(v) = lookup("CAPTURE_BIND") {
            self.server.bind = v;
        }
        if let Some(v) = lookup("CAPTURE_STORE_PATH") {
            self.store.path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("SESSION_RETENTION_SECS") {
            self.store.retention = Duration::from_secs(parse_var("SESSION_RETENTION_SECS", &v)?);
        }
        if let Some(v) = lookup("CHROME_PATH") {
            self.browser.chrome_path = Some(v);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), CaptureError> {
        let fail = |msg: &str| Err(CaptureError::Configuration(msg.to_string()));

        if self.pool.max_instances == 0 {
            return fail("pool.max_instances must be greater than 0");
        }
        if self.pool.idle_timeout.is_zero() || self.pool.sweep_interval.is_zero() {
            return fail("pool idle timeout and sweep interval must be greater than 0");
        }
        if self.capture.navigation_timeout.is_zero() || self.capture.screenshot_timeout.is_zero() {
            return fail("capture timeouts must be greater than 0");
        }
        if self.capture.navigation_retry.max_attempts == 0
            || self.store.write_retry.max_attempts == 0
        {
            return fail("retry attempts must be greater than 0");
        }
        if self.capture.thumbnail_width == 0 || self.capture.thumbnail_height == 0 {
            return fail("thumbnail dimensions must be greater than 0");
        }
        if !(1..=9).contains(&self.packaging.compression_level) {
            return fail("packaging.compression_level must be between 1 and 9");
        }
        if self.job_timeout.is_zero() {
            return fail("job_timeout must be greater than 0");
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            pool: PoolConfig::default(),
            browser: BrowserSettings::default(),
            capture: CaptureSettings::default(),
            store: StoreConfig::default(),
            packaging: PackagingConfig::default(),
            limits: OptionLimits::default(),
            job_timeout: Duration::from_secs(10 * 60),
        }
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, CaptureError> {
    value
        .trim()
        .parse()
        .map_err(|_| CaptureError::Configuration(format!("{name} has an invalid value: {value}")))
}

/// Browser viewport configuration for captures
///
/// # Examples
///
/// ```rust
/// use page_capture::Viewport;
///
/// let desktop = Viewport::default();
/// let mobile = Viewport {
///     width: 375,
///     height: 667,
///     device_scale_factor: 2.0,
///     mobile: true,
/// };
/// assert!(mobile.width < desktop.width);
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Viewport {
    /// Viewport width in pixels (default: 1920)
    pub width: u32,

    /// Viewport height in pixels (default: 1080)
    pub height: u32,

    /// Device pixel ratio for high-DPI displays (default: 1.0)
    pub device_scale_factor: f64,

    /// Whether to emulate a mobile device (default: false)
    pub mobile: bool,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            device_scale_factor: 1.0,
            mobile: false,
        }
    }
}

/// Browser engine variant an instance is launched as
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BrowserKind {
    #[default]
    Chromium,
    /// Chromium with a mobile user agent and touch emulation
    ChromiumMobile,
}

impl std::fmt::Display for BrowserKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BrowserKind::Chromium => write!(f, "chromium"),
            BrowserKind::ChromiumMobile => write!(f, "chromium_mobile"),
        }
    }
}

/// Which traversal strategy a job uses
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureMode {
    /// Follow same-origin links breadth-first
    #[default]
    Links,
    /// Click interactive elements and capture the results
    Interactive,
}

/// Submit body of `POST /capture`
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CaptureRequest {
    pub url: String,
    #[serde(default)]
    pub options: Option<RequestOptions>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestViewport {
    pub width: u32,
    pub height: u32,
}

/// Raw, unvalidated per-request options as sent by clients
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RequestOptions {
    pub mode: Option<CaptureMode>,
    pub max_depth: Option<u32>,
    pub max_pages: Option<usize>,
    pub max_elements: Option<usize>,
    pub viewport: Option<RequestViewport>,
    /// Milliseconds
    pub wait_after_load: Option<u64>,
    /// Milliseconds
    pub click_delay: Option<u64>,
    pub selectors: Option<Vec<String>>,
    pub exclude_selectors: Option<Vec<String>>,
    pub only_internal_navigation: Option<bool>,
    pub browser: Option<BrowserKind>,
}

/// Selectors never clicked during interactive exploration unless the request
/// supplies its own list.
pub const DEFAULT_EXCLUDED_SELECTORS: &[&str] = &[
    "[id*=cookie]",
    "[class*=cookie]",
    "[id*=consent]",
    "[class*=consent]",
    "[class*=modal]",
    "[role=dialog]",
    "[aria-modal=true]",
    "a[href^='mailto:']",
    "a[href^='tel:']",
    "a[href^='javascript:']",
];

/// Validated, immutable options for one capture job
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureOptions {
    pub mode: CaptureMode,
    /// Links mode: how many link hops from the seed are followed (default: 1).
    /// Interactive mode: how many navigations deep exploration continues.
    pub max_depth: u32,
    /// Links mode cap on captured pages (default: 10)
    pub max_pages: usize,
    /// Interactive mode cap on click captures, excluding the seed (default: 10)
    pub max_elements: usize,
    pub viewport: Viewport,
    /// Settle delay after each load for client-rendered content (default: 1s)
    pub wait_after_load: Duration,
    /// Settle delay after each click (default: 2s)
    pub click_delay: Duration,
    /// Restricts interactive candidates to these selectors when non-empty
    pub selectors: Vec<String>,
    pub exclude_selectors: Vec<String>,
    /// Drop anchors that leave the seed origin (default: true)
    pub only_internal_navigation: bool,
    pub browser: BrowserKind,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            mode: CaptureMode::Links,
            max_depth: 1,
            max_pages: 10,
            max_elements: 10,
            viewport: Viewport::default(),
            wait_after_load: Duration::from_secs(1),
            click_delay: Duration::from_secs(2),
            selectors: Vec::new(),
            exclude_selectors: DEFAULT_EXCLUDED_SELECTORS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            only_internal_navigation: true,
            browser: BrowserKind::Chromium,
        }
    }
}

impl CaptureOptions {
    /// Validates raw request options against `limits`, filling defaults.
    pub fn from_request(
        raw: Option<&RequestOptions>,
        limits: &OptionLimits,
    ) -> Result<Self, CaptureError> {
        let mut options = CaptureOptions::default();
        let Some(raw) = raw else {
            return Ok(options);
        };

        let invalid = |msg: String| Err(CaptureError::InvalidOptions(msg));

        if let Some(mode) = raw.mode {
            options.mode = mode;
        }
        if let Some(depth) = raw.max_depth {
            if depth > limits.max_depth {
                return invalid(format!("maxDepth must be between 0 and {}", limits.max_depth));
            }
            options.max_depth = depth;
        }
        if let Some(pages) = raw.max_pages {
            if pages == 0 || pages > limits.max_pages {
                return invalid(format!("maxPages must be between 1 and {}", limits.max_pages));
            }
            options.max_pages = pages;
        }
        if let Some(elements) = raw.max_elements {
            if elements == 0 || elements > limits.max_elements {
                return invalid(format!(
                    "maxElements must be between 1 and {}",
                    limits.max_elements
                ));
            }
            options.max_elements = elements;
        }
        if let Some(viewport) = &raw.viewport {
            if !(limits.min_viewport_width..=limits.max_viewport_width).contains(&viewport.width) {
                return invalid(format!(
                    "viewport.width must be between {} and {}",
                    limits.min_viewport_width, limits.max_viewport_width
                ));
            }
            if !(limits.min_viewport_height..=limits.max_viewport_height)
                .contains(&viewport.height)
            {
                return invalid(format!(
                    "viewport.height must be between {} and {}",
                    limits.min_viewport_height, limits.max_viewport_height
                ));
            }
            options.viewport.width = viewport.width;
            options.viewport.height = viewport.height;
        }
        if let Some(ms) = raw.wait_after_load {
            let wait = Duration::from_millis(ms);
            if wait > limits.max_wait_after_load {
                return invalid(format!(
                    "waitAfterLoad must be at most {}ms",
                    limits.max_wait_after_load.as_millis()
                ));
            }
            options.wait_after_load = wait;
        }
        if let Some(ms) = raw.click_delay {
            let delay = Duration::from_millis(ms);
            if delay > limits.max_click_delay {
                return invalid(format!(
                    "clickDelay must be at most {}ms",
                    limits.max_click_delay.as_millis()
                ));
            }
            options.click_delay = delay;
        }
        if let Some(selectors) = &raw.selectors {
            options.selectors = clean_selectors(selectors);
        }
        if let Some(excluded) = &raw.exclude_selectors {
            options.exclude_selectors = clean_selectors(excluded);
        }
        if let Some(internal) = raw.only_internal_navigation {
            options.only_internal_navigation = internal;
        }
        if let Some(kind) = raw.browser {
            options.browser = kind;
        }
        if options.browser == BrowserKind::ChromiumMobile {
            options.viewport.mobile = true;
            options.viewport.device_scale_factor = 2.0;
        }

        Ok(options)
    }

    /// Upper bound on artifacts a job may record: `maxPages` for link
    /// crawling, `maxElements` plus the seed page for exploration.
    pub fn capture_budget(&self) -> usize {
        match self.mode {
            CaptureMode::Links => self.max_pages,
            CaptureMode::Interactive => self.max_elements + 1,
        }
    }
}

fn clean_selectors(selectors: &[String]) -> Vec<String> {
    selectors
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Validates the job URL and options together, as done once at intake.
pub fn validate_request(
    request: &CaptureRequest,
    limits: &OptionLimits,
) -> Result<(Url, CaptureOptions), CaptureError> {
    let url = validate_url(request.url.trim())
        .map_err(|_| CaptureError::InvalidUrl(request.url.clone()))?;
    let options = CaptureOptions::from_request(request.options.as_ref(), limits)?;
    Ok((url, options))
}

const MOBILE_USER_AGENT: &str = "Mozilla/5.0 (Linux; Android 13; Pixel 7) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/120.0.0.0 Mobile Safari/537.36";

/// Generate Chrome arguments for one pool instance
///
/// Every instance gets its own user-data and temp directory so concurrently
/// running processes never collide on Chrome's singleton lock.
///
/// # Examples
///
/// ```rust
/// use page_capture::{get_chrome_args, BrowserKind, Config};
///
/// let config = Config::default();
/// let args = get_chrome_args(&config, 0, BrowserKind::Chromium);
/// assert!(args.contains(&"--headless".to_string()));
/// ```
pub fn get_chrome_args(config: &Config, instance_id: usize, kind: BrowserKind) -> Vec<String> {
    let unique_id = format!("{}-{}", std::process::id(), instance_id);
    let viewport = Viewport::default();

    let mut args = vec![
        "--headless".to_string(),
        "--no-sandbox".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--disable-gpu".to_string(),
        "--disable-background-timer-throttling".to_string(),
        "--disable-backgrounding-occluded-windows".to_string(),
        "--disable-renderer-backgrounding".to_string(),
        "--disable-features=TranslateUI,ProcessSingleton".to_string(),
        "--disable-extensions".to_string(),
        "--disable-default-apps".to_string(),
        "--disable-sync".to_string(),
        "--no-first-run".to_string(),
        "--hide-scrollbars".to_string(),
        "--mute-audio".to_string(),
        "--ignore-certificate-errors".to_string(),
        format!("--window-size={},{}", viewport.width, viewport.height),
        format!("--user-data-dir=/tmp/page-capture-profile-{unique_id}"),
        format!("--temp-dir=/tmp/page-capture-temp-{unique_id}"),
    ];

    if let Some(memory_limit) = config.browser.memory_limit {
        args.push(format!(
            "--js-flags=--max_old_space_size={}",
            memory_limit / 1024 / 1024
        ));
    }

    match kind {
        BrowserKind::Chromium => {
            if let Some(user_agent) = &config.browser.user_agent {
                args.push(format!("--user-agent={user_agent}"));
            }
        }
        BrowserKind::ChromiumMobile => {
            args.push(format!("--user-agent={MOBILE_USER_AGENT}"));
            args.push("--touch-events=enabled".to_string());
        }
    }

    args
}

pub fn create_browser_config(
    config: &Config,
    instance_id: usize,
    kind: BrowserKind,
) -> Result<chromiumoxide::browser::BrowserConfig, CaptureError> {
    use chromiumoxide::browser::BrowserConfig;

    let viewport = Viewport::default();
    let mut builder = BrowserConfig::builder()
        .window_size(viewport.width, viewport.height)
        .request_timeout(config.capture.navigation_timeout)
        .args(get_chrome_args(config, instance_id, kind));

    if let Some(chrome_path) = &config.browser.chrome_path {
        builder = builder.chrome_executable(chrome_path);
    }

    builder.build().map_err(CaptureError::BrowserLaunchFailed)
}
