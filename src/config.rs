use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::error::ScrapeError;
use crate::fetch::Backend;

pub const DEFAULT_JSON_FILE: &str = "doctolib_doctors.json";
pub const DEFAULT_CSV_FILE: &str = "doctolib_doctors.csv";

/// Dismisses the cookie banner before the page source is read.
pub const CONSENT_SCRIPT: &str = r#"
const sel = ['button[data-testid="accept-all-cookies"]', '#didomi-notice-agree-button', '.cookie-consent button', '.gdpr-accept'];
for (const s of sel) {
  const b = document.querySelector(s);
  if (b && b.offsetParent !== null) { b.click(); break; }
}
"#;

// ── Run configuration ──

/// Everything a run needs, read from an optional JSON file and then
/// overridden from the command line.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub base_url: String,
    pub max_pages: u32,
    pub output: OutputConfig,
    pub scraping: ScrapingConfig,
    pub ratings: RatingsConfig,
    pub llm: LlmConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            base_url: String::new(),
            max_pages: 3,
            output: OutputConfig::default(),
            scraping: ScrapingConfig::default(),
            ratings: RatingsConfig::default(),
            llm: LlmConfig::default(),
        }
    }
}

/// Output targets; `None` disables a target.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub json_file: Option<PathBuf>,
    pub csv_file: Option<PathBuf>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        OutputConfig {
            json_file: Some(PathBuf::from(DEFAULT_JSON_FILE)),
            csv_file: Some(PathBuf::from(DEFAULT_CSV_FILE)),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScrapingConfig {
    pub delay_between_pages_ms: u64,
    pub page_timeout_ms: u64,
    pub headless: bool,
    pub backend: Backend,
    pub webdriver_url: String,
    pub pre_render_script: Option<String>,
    pub fallback_specialty: Option<String>,
    pub extra_denylist: Vec<String>,
    pub schema_file: Option<PathBuf>,
}

impl Default for ScrapingConfig {
    fn default() -> Self {
        ScrapingConfig {
            delay_between_pages_ms: 2000,
            page_timeout_ms: 30_000,
            headless: false,
            backend: Backend::default(),
            webdriver_url: "http://localhost:9515".to_string(),
            pre_render_script: Some(CONSENT_SCRIPT.trim().to_string()),
            fallback_specialty: Some("Unknown".to_string()),
            extra_denylist: Vec::new(),
            schema_file: None,
        }
    }
}

impl ScrapingConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_between_pages_ms)
    }

    pub fn page_timeout(&self) -> Duration {
        Duration::from_millis(self.page_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RatingsConfig {
    pub enabled: bool,
    /// Deterministic pseudo-ratings instead of live search.
    pub mock: bool,
    pub seed: u64,
    pub search_url: String,
    /// Query patterns; `{name}` is replaced with the practitioner name.
    pub query_templates: Vec<String>,
    pub delay_between_records_ms: u64,
}

impl Default for RatingsConfig {
    fn default() -> Self {
        RatingsConfig {
            enabled: false,
            mock: false,
            seed: 42,
            search_url: "https://html.duckduckgo.com/html/".to_string(),
            query_templates: vec![
                "{name} avis google".to_string(),
                "{name} note étoiles".to_string(),
                "{name} avis patients".to_string(),
            ],
            delay_between_records_ms: 1000,
        }
    }
}

impl RatingsConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_between_records_ms)
    }
}

/// OpenAI-compatible chat endpoint used for schema generation.
///
/// The API key is never read from the config file; it is resolved from the
/// environment variable named by `api_key_env` and kept out of `Debug`.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub endpoint: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub api_key_env: Option<String>,
    #[serde(skip)]
    api_key: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        LlmConfig {
            endpoint: "http://localhost:11434/v1/chat/completions".to_string(),
            model: "llama3.2".to_string(),
            temperature: 0.1,
            max_tokens: 4000,
            api_key_env: None,
            api_key: None,
        }
    }
}

impl LlmConfig {
    /// Load the key from `api_key_env`, if one is named and set.
    pub fn resolve_key(mut self) -> Self {
        self.api_key = self
            .api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|k| !k.trim().is_empty());
        self
    }

    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref()
    }
}

impl fmt::Debug for LlmConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LlmConfig")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("api_key_env", &self.api_key_env)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

// ── Loading, overrides, validation ──

impl RunConfig {
    pub fn load(path: &Path) -> Result<Self, ScrapeError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ScrapeError::config(format!("cannot read config file {}: {}", path.display(), e))
        })?;
        RunConfig::from_json(&raw)
            .map_err(|e| ScrapeError::config(format!("{} ({})", e, path.display())))
    }

    pub fn from_json(raw: &str) -> Result<Self, ScrapeError> {
        serde_json::from_str(raw).map_err(|e| ScrapeError::config(format!("invalid config JSON: {}", e)))
    }

    /// Apply command-line values on top of the file values.
    pub fn apply(&mut self, o: Overrides) {
        if let Some(url) = o.url {
            self.base_url = url;
        }
        if let Some(pages) = o.max_pages {
            self.max_pages = pages;
        }
        if let Some(path) = o.json_file {
            self.output.json_file = Some(path);
        }
        if let Some(path) = o.csv_file {
            self.output.csv_file = Some(path);
        }
        if o.no_json {
            self.output.json_file = None;
        }
        if o.no_csv {
            self.output.csv_file = None;
        }
        if let Some(backend) = o.backend {
            self.scraping.backend = backend;
        }
        if let Some(ms) = o.delay_ms {
            self.scraping.delay_between_pages_ms = ms;
        }
        if o.headless {
            self.scraping.headless = true;
        }
        if let Some(path) = o.schema_file {
            self.scraping.schema_file = Some(path);
        }
        if o.ratings || o.mock_ratings {
            self.ratings.enabled = true;
        }
        if o.mock_ratings {
            self.ratings.mock = true;
        }
    }

    /// Reject configurations that cannot start a run.
    pub fn validate(&self) -> Result<(), ScrapeError> {
        let base = self.base_url.trim();
        if base.is_empty() {
            return Err(ScrapeError::config("base URL is required"));
        }
        let url = Url::parse(base)
            .map_err(|e| ScrapeError::config(format!("invalid base URL {:?}: {}", base, e)))?;
        if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
            return Err(ScrapeError::config(format!(
                "base URL {:?} must be an absolute http(s) URL",
                base
            )));
        }
        if self.max_pages == 0 {
            return Err(ScrapeError::config("max_pages must be at least 1"));
        }
        self.output.validate()?;
        if self.ratings.enabled && !self.ratings.mock {
            if self.ratings.query_templates.is_empty() {
                return Err(ScrapeError::config("ratings.query_templates is empty"));
            }
            if let Some(t) = self.ratings.query_templates.iter().find(|t| !t.contains("{name}")) {
                return Err(ScrapeError::config(format!(
                    "rating query template {:?} has no {{name}} placeholder",
                    t
                )));
            }
        }
        Ok(())
    }
}

impl OutputConfig {
    pub fn validate(&self) -> Result<(), ScrapeError> {
        if self.json_file.is_none() && self.csv_file.is_none() {
            return Err(ScrapeError::config(
                "no output selected (both JSON and CSV are disabled)",
            ));
        }
        Ok(())
    }
}

/// Command-line values that take precedence over the config file.
#[derive(Debug, Default)]
pub struct Overrides {
    pub url: Option<String>,
    pub max_pages: Option<u32>,
    pub json_file: Option<PathBuf>,
    pub csv_file: Option<PathBuf>,
    pub no_json: bool,
    pub no_csv: bool,
    pub backend: Option<Backend>,
    pub delay_ms: Option<u64>,
    pub headless: bool,
    pub schema_file: Option<PathBuf>,
    pub ratings: bool,
    pub mock_ratings: bool,
}
