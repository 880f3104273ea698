use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::page::SiteProfile;
use crate::{OutputFormat, ReportFormat};

/// Main configuration structure loaded from config files
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    pub general: Option<GeneralConfig>,
    pub browser: Option<BrowserConfig>,
    pub site: Option<SiteProfile>,
    pub timing: Option<TimingConfig>,
    pub output: Option<OutputConfig>,
    pub profiles: Option<HashMap<String, ProfileConfig>>,
}

/// Configuration profile for predefined settings
#[derive(Debug, Deserialize, Clone)]
pub struct ProfileConfig {
    pub description: Option<String>,
    pub persons: Option<Vec<String>>,
    pub headless: Option<bool>,
    pub max_attempts_per_source: Option<u32>,
    pub quality: Option<u8>,
    pub site: Option<SiteProfile>,
}

/// General configuration options
#[derive(Debug, Deserialize)]
pub struct GeneralConfig {
    pub root_dir: Option<String>,
    pub persons: Option<Vec<String>>,
    pub max_attempts_per_source: Option<u32>,
    pub max_runtime_secs: Option<u64>,
    pub stop_grace_secs: Option<u64>,
}

/// Browser backend configuration
#[derive(Debug, Deserialize)]
pub struct BrowserConfig {
    pub webdriver_url: Option<String>,
    pub headless: Option<bool>,
    pub args: Option<Vec<String>>,
    /// Only honoured for visible browsers; headless sessions always close.
    pub close_on_finish: Option<bool>,
}

/// Polling and timeout budgets, all in seconds unless noted
#[derive(Debug, Deserialize)]
pub struct TimingConfig {
    pub poll_interval_ms: Option<u64>,
    pub element_wait: Option<u64>,
    pub page_ready: Option<u64>,
    pub upload: Option<u64>,
    pub upload_stuck: Option<u64>,
    pub swap_no_progress: Option<u64>,
    pub swap_stall: Option<u64>,
    pub swap_overall: Option<u64>,
    pub rate_limit_cooldown: Option<u64>,
    pub retry_delay: Option<u64>,
}

/// Output and reporting configuration
#[derive(Debug, Deserialize)]
pub struct OutputConfig {
    pub format: Option<String>,
    pub quality: Option<u8>,
    pub verbose: Option<bool>,
    pub quiet: Option<bool>,
    pub generate_report: Option<bool>,
    pub report_format: Option<String>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&text)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// `<config dir>/faceswap-pilot/config.toml`, when it exists.
    pub fn default_path() -> Option<PathBuf> {
        let path = dirs::config_dir()?.join("faceswap-pilot").join("config.toml");
        path.is_file().then_some(path)
    }

    pub fn profile(&self, name: &str) -> Option<&ProfileConfig> {
        self.profiles.as_ref()?.get(name)
    }
}

/// Every wait the workers perform, in one place.
#[derive(Debug, Clone, PartialEq)]
pub struct Timeouts {
    pub poll_interval: Duration,
    /// Short waits for controls that should already be there.
    pub element_wait: Duration,
    pub page_ready: Duration,
    /// Hard ceiling on waiting for an upload thumbnail.
    pub upload: Duration,
    /// A busy indicator visible this long without a thumbnail means stuck.
    pub upload_stuck: Duration,
    /// Ceiling when no progress indicator was ever observed.
    pub swap_no_progress: Duration,
    /// Ceiling measured from the last progress change.
    pub swap_stall: Duration,
    /// Absolute ceiling for one swap.
    pub swap_overall: Duration,
    pub rate_limit_cooldown: Duration,
    pub retry_delay: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            element_wait: Duration::from_secs(10),
            page_ready: Duration::from_secs(30),
            upload: Duration::from_secs(180),
            upload_stuck: Duration::from_secs(45),
            swap_no_progress: Duration::from_secs(60),
            swap_stall: Duration::from_secs(30),
            swap_overall: Duration::from_secs(300),
            rate_limit_cooldown: Duration::from_secs(3),
            retry_delay: Duration::from_secs(5),
        }
    }
}

impl Timeouts {
    fn apply(&mut self, timing: &TimingConfig) {
        let secs = |value: Option<u64>, target: &mut Duration| {
            if let Some(value) = value {
                *target = Duration::from_secs(value);
            }
        };
        if let Some(ms) = timing.poll_interval_ms {
            self.poll_interval = Duration::from_millis(ms);
        }
        secs(timing.element_wait, &mut self.element_wait);
        secs(timing.page_ready, &mut self.page_ready);
        secs(timing.upload, &mut self.upload);
        secs(timing.upload_stuck, &mut self.upload_stuck);
        secs(timing.swap_no_progress, &mut self.swap_no_progress);
        secs(timing.swap_stall, &mut self.swap_stall);
        secs(timing.swap_overall, &mut self.swap_overall);
        secs(timing.rate_limit_cooldown, &mut self.rate_limit_cooldown);
        secs(timing.retry_delay, &mut self.retry_delay);
    }
}

/// Run options that can be passed to the core library
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub root_dir: Option<PathBuf>,
    pub persons: Vec<String>,
    pub all_persons: bool,
    pub webdriver_url: String,
    pub headless: bool,
    pub browser_args: Vec<String>,
    pub close_browser_on_finish: bool,
    pub site: SiteProfile,
    pub timeouts: Timeouts,
    pub output_format: OutputFormat,
    pub quality: u8,
    pub max_attempts_per_source: u32,
    pub max_runtime: Option<Duration>,
    pub stop_grace: Duration,
    pub generate_report: bool,
    pub report_format: ReportFormat,
    pub verbose: bool,
    pub quiet: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            root_dir: None,
            persons: Vec::new(),
            all_persons: false,
            webdriver_url: "http://localhost:9515".to_string(),
            headless: false,
            browser_args: Vec::new(),
            close_browser_on_finish: true,
            site: SiteProfile::default(),
            timeouts: Timeouts::default(),
            output_format: OutputFormat::Jpeg,
            quality: 75,
            max_attempts_per_source: 3,
            max_runtime: None,
            stop_grace: Duration::from_secs(120),
            generate_report: false,
            report_format: ReportFormat::Json,
            verbose: false,
            quiet: false,
        }
    }
}

impl RunOptions {
    /// Create new run options with sensible defaults
    pub fn new(root_dir: PathBuf) -> Self {
        Self {
            root_dir: Some(root_dir),
            ..Default::default()
        }
    }

    /// Layer a config file over the current values.
    pub fn apply_config(mut self, config: &Config) -> Self {
        if let Some(general) = &config.general {
            if let Some(root) = &general.root_dir {
                self.root_dir = Some(PathBuf::from(root));
            }
            if let Some(persons) = &general.persons {
                self.persons = persons.clone();
            }
            if let Some(attempts) = general.max_attempts_per_source {
                self.max_attempts_per_source = attempts;
            }
            if let Some(secs) = general.max_runtime_secs {
                self.max_runtime = Some(Duration::from_secs(secs));
            }
            if let Some(secs) = general.stop_grace_secs {
                self.stop_grace = Duration::from_secs(secs);
            }
        }

        if let Some(browser) = &config.browser {
            if let Some(url) = &browser.webdriver_url {
                self.webdriver_url = url.clone();
            }
            if let Some(headless) = browser.headless {
                self.headless = headless;
            }
            if let Some(args) = &browser.args {
                self.browser_args = args.clone();
            }
            if let Some(close) = browser.close_on_finish {
                self.close_browser_on_finish = close;
            }
        }

        if let Some(site) = &config.site {
            self.site = site.clone();
        }

        if let Some(timing) = &config.timing {
            self.timeouts.apply(timing);
        }

        if let Some(output) = &config.output {
            if let Some(format) = output.format.as_deref().and_then(OutputFormat::parse) {
                self.output_format = format;
            }
            if let Some(quality) = output.quality {
                self.quality = quality;
            }
            if let Some(report) = output.generate_report {
                self.generate_report = report;
            }
            if let Some(format) = output.report_format.as_deref().and_then(ReportFormat::parse) {
                self.report_format = format;
            }
            if let Some(verbose) = output.verbose {
                self.verbose = verbose;
            }
            if let Some(quiet) = output.quiet {
                self.quiet = quiet;
            }
        }

        self
    }

    /// Layer a named profile over the current values.
    pub fn apply_profile(mut self, profile: &ProfileConfig) -> Self {
        if let Some(persons) = &profile.persons {
            self.persons = persons.clone();
        }
        if let Some(headless) = profile.headless {
            self.headless = headless;
        }
        if let Some(attempts) = profile.max_attempts_per_source {
            self.max_attempts_per_source = attempts;
        }
        if let Some(quality) = profile.quality {
            self.quality = quality;
        }
        if let Some(site) = &profile.site {
            self.site = site.clone();
        }
        self
    }

    /// Builder pattern for selecting persons by name
    pub fn with_persons(mut self, persons: Vec<String>) -> Self {
        self.persons = persons;
        self
    }

    /// Builder pattern for selecting every discovered person
    pub fn with_all_persons(mut self, all: bool) -> Self {
        self.all_persons = all;
        self
    }

    /// Builder pattern for setting the WebDriver endpoint
    pub fn with_webdriver_url(mut self, url: String) -> Self {
        self.webdriver_url = url;
        self
    }

    /// Builder pattern for running browsers headless
    pub fn with_headless(mut self, headless: bool) -> Self {
        self.headless = headless;
        self
    }

    /// Builder pattern for leaving visible browsers open after the run
    pub fn with_close_browser_on_finish(mut self, close: bool) -> Self {
        self.close_browser_on_finish = close;
        self
    }

    /// Builder pattern for setting the site profile
    pub fn with_site(mut self, site: SiteProfile) -> Self {
        self.site = site;
        self
    }

    /// Builder pattern for setting timeouts
    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Builder pattern for setting output quality
    pub fn with_quality(mut self, quality: u8) -> Self {
        self.quality = quality;
        self
    }

    /// Builder pattern for capping attempts per source image
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts_per_source = attempts;
        self
    }

    /// Builder pattern for limiting total runtime
    pub fn with_max_runtime(mut self, max_runtime: Duration) -> Self {
        self.max_runtime = Some(max_runtime);
        self
    }

    /// Builder pattern for the grace period between stop and kill
    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    /// Logger filter for these options; `None` installs no logger.
    pub fn log_level(&self) -> Option<log::LevelFilter> {
        if self.verbose {
            Some(log::LevelFilter::Debug)
        } else if self.quiet {
            None
        } else {
            Some(log::LevelFilter::Info)
        }
    }

    /// Attempts are never configured below one.
    pub fn attempt_cap(&self) -> u32 {
        self.max_attempts_per_source.max(1)
    }

    /// Browsers are closed at cleanup unless running visibly with inspection enabled.
    pub fn close_sessions(&self) -> bool {
        self.headless || self.close_browser_on_finish
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [general]
        root_dir = "/data/ai"
        persons = ["Ann", "Bob"]
        max_attempts_per_source = 5

        [browser]
        webdriver_url = "http://127.0.0.1:4444"
        headless = true

        [site]
        url = "https://swap.example/"
        start_button = "xpath://button[@id='go']"

        [timing]
        poll_interval_ms = 250
        swap_no_progress = 90

        [output]
        format = "png"
        report_format = "csv"
        quiet = true

        [profiles.quick]
        description = "single attempt"
        max_attempts_per_source = 1
        persons = ["Ann"]
    "#;

    #[test]
    fn config_layers_onto_defaults() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        let options = RunOptions::default().apply_config(&config);

        assert_eq!(options.root_dir, Some(PathBuf::from("/data/ai")));
        assert_eq!(options.persons, vec!["Ann".to_string(), "Bob".to_string()]);
        assert_eq!(options.max_attempts_per_source, 5);
        assert_eq!(options.webdriver_url, "http://127.0.0.1:4444");
        assert!(options.headless);
        assert_eq!(options.site.url, "https://swap.example/");
        assert_eq!(options.timeouts.poll_interval, Duration::from_millis(250));
        assert_eq!(options.timeouts.swap_no_progress, Duration::from_secs(90));
        assert_eq!(options.timeouts.swap_stall, Duration::from_secs(30));
        assert_eq!(options.output_format, OutputFormat::Png);
        assert_eq!(options.report_format, ReportFormat::Csv);
        assert!(options.quiet);
        assert_eq!(options.log_level(), None);
    }

    #[test]
    fn log_level_follows_output_flags() {
        assert_eq!(RunOptions::default().log_level(), Some(log::LevelFilter::Info));

        let config: Config = toml::from_str("[output]\nverbose = true").unwrap();
        let options = RunOptions::default().apply_config(&config);
        assert_eq!(options.log_level(), Some(log::LevelFilter::Debug));
    }

    #[test]
    fn profile_overrides_config() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        let profile = config.profile("quick").unwrap();
        let options = RunOptions::default().apply_config(&config).apply_profile(profile);

        assert_eq!(options.max_attempts_per_source, 1);
        assert_eq!(options.persons, vec!["Ann".to_string()]);
        assert!(config.profile("missing").is_none());
    }

    #[test]
    fn headless_always_closes_sessions() {
        let options = RunOptions::default()
            .with_headless(true)
            .with_close_browser_on_finish(false);
        assert!(options.close_sessions());

        let visible = RunOptions::default()
            .with_headless(false)
            .with_close_browser_on_finish(false);
        assert!(!visible.close_sessions());
    }

    #[test]
    fn attempt_cap_is_at_least_one() {
        assert_eq!(RunOptions::default().with_max_attempts(0).attempt_cap(), 1);
    }
}
