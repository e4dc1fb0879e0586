use std::time::Duration;

use serde::Deserialize;
use spider_client::shapes::request::{ReturnFormat, ReturnFormatHandling};
use spider_client::{RequestParams, Spider};
use thirtyfour::prelude::*;
use tracing::{debug, warn};

use crate::error::FetchFailure;

const MAX_RETRIES: u32 = 3;
const BASE_BACKOFF_MS: u64 = 2000;
const USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0 Safari/537.36";

/// One page load request handed to the browser collaborator.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: String,
    /// Opaque interaction script (cookie consent etc.), passed through as is.
    pub pre_render_script: Option<String>,
}

/// Rendered markup, plus server-side extracted field-sets when the backend
/// applied a schema itself.
#[derive(Debug, Clone)]
pub struct RenderedPage {
    pub url: String,
    pub html: String,
    pub structured_json: Option<String>,
}

/// External browser collaborator.
pub trait PageFetcher {
    async fn fetch(&self, req: &FetchRequest) -> Result<RenderedPage, FetchFailure>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// spider.cloud rendering API (needs SPIDER_API_KEY)
    #[default]
    Spider,
    /// Local WebDriver server (chromedriver, geckodriver)
    Webdriver,
    /// Plain HTTP GET, no script execution
    Http,
}

/// Backend chosen at runtime.
pub enum AnyFetcher {
    Spider(SpiderFetcher),
    WebDriver(WebDriverFetcher),
    Http(HttpFetcher),
}

impl PageFetcher for AnyFetcher {
    async fn fetch(&self, req: &FetchRequest) -> Result<RenderedPage, FetchFailure> {
        match self {
            AnyFetcher::Spider(f) => f.fetch(req).await,
            AnyFetcher::WebDriver(f) => f.fetch(req).await,
            AnyFetcher::Http(f) => f.fetch(req).await,
        }
    }
}

/// Build the fetcher for `backend`. Secrets come from the environment only.
pub fn build(
    backend: Backend,
    webdriver_url: &str,
    headless: bool,
    page_timeout: Duration,
) -> Result<AnyFetcher, FetchFailure> {
    Ok(match backend {
        Backend::Spider => AnyFetcher::Spider(SpiderFetcher::from_env()?),
        Backend::Webdriver => AnyFetcher::WebDriver(WebDriverFetcher {
            server_url: webdriver_url.to_string(),
            headless,
            page_timeout,
            settle: Duration::from_secs(3),
        }),
        Backend::Http => AnyFetcher::Http(HttpFetcher::new(page_timeout)?),
    })
}

// ── spider.cloud ──

pub struct SpiderFetcher {
    spider: Spider,
}

impl SpiderFetcher {
    pub fn from_env() -> Result<Self, FetchFailure> {
        let api_key = std::env::var("SPIDER_API_KEY")
            .map_err(|_| FetchFailure::Setup("SPIDER_API_KEY environment variable must be set".into()))?;
        let spider = Spider::new(Some(api_key))
            .map_err(|e| FetchFailure::Setup(format!("failed to create Spider client: {}", e)))?;
        Ok(SpiderFetcher { spider })
    }

    async fn scrape_once(&self, url: &str) -> Result<String, FetchFailure> {
        let params = RequestParams {
            return_format: Some(ReturnFormatHandling::Single(ReturnFormat::Raw)),
            ..Default::default()
        };

        let response = self
            .spider
            .scrape_url(url, Some(params), "application/json")
            .await
            .map_err(|e| FetchFailure::Unsuccessful {
                url: url.to_string(),
                message: e.to_string(),
            })?;

        extract_spider_content(response).ok_or_else(|| FetchFailure::Empty(url.to_string()))
    }
}

/// Pull `content` out of a spider response, which may arrive double-encoded.
fn extract_spider_content(response: serde_json::Value) -> Option<String> {
    let parsed: serde_json::Value = match response.as_str() {
        Some(s) => serde_json::from_str(s).unwrap_or(response.clone()),
        None => response,
    };

    parsed
        .as_array()
        .and_then(|arr| arr.first())
        .and_then(|obj| obj.get("content"))
        .and_then(|c| c.as_str())
        .filter(|c| !c.trim().is_empty())
        .map(str::to_string)
}

fn is_retryable(failure: &FetchFailure) -> bool {
    match failure {
        FetchFailure::Unsuccessful { message, .. } => {
            message.contains("429")
                || message.contains("rate")
                || message.contains("500")
                || message.contains("502")
                || message.contains("503")
        }
        _ => false,
    }
}

impl PageFetcher for SpiderFetcher {
    async fn fetch(&self, req: &FetchRequest) -> Result<RenderedPage, FetchFailure> {
        if req.pre_render_script.is_some() {
            debug!("spider backend renders without the pre-render script");
        }

        let mut attempt = 0;
        loop {
            match self.scrape_once(&req.url).await {
                Ok(html) => {
                    return Ok(RenderedPage {
                        url: req.url.clone(),
                        html,
                        structured_json: None,
                    })
                }
                Err(e) if is_retryable(&e) && attempt < MAX_RETRIES => {
                    let backoff = Duration::from_millis(BASE_BACKOFF_MS * 2u64.pow(attempt));
                    warn!(
                        "Rate limited on {} (attempt {}/{}), backing off {:.1}s",
                        req.url,
                        attempt + 1,
                        MAX_RETRIES,
                        backoff.as_secs_f64()
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

// ── WebDriver ──

/// Opens one browser session per page and always closes it before returning.
pub struct WebDriverFetcher {
    pub server_url: String,
    pub headless: bool,
    pub page_timeout: Duration,
    /// Wait after the interaction script for late content.
    pub settle: Duration,
}

impl WebDriverFetcher {
    async fn render(&self, driver: &WebDriver, req: &FetchRequest) -> WebDriverResult<String> {
        driver.goto(&req.url).await?;
        if let Some(script) = &req.pre_render_script {
            driver.execute(script.as_str(), Vec::new()).await?;
        }
        tokio::time::sleep(self.settle).await;
        driver.source().await
    }
}

impl PageFetcher for WebDriverFetcher {
    async fn fetch(&self, req: &FetchRequest) -> Result<RenderedPage, FetchFailure> {
        let browser_err = |message: String| FetchFailure::Browser {
            url: req.url.clone(),
            message,
        };

        let mut caps = DesiredCapabilities::chrome();
        if self.headless {
            caps.set_headless().map_err(|e| browser_err(e.to_string()))?;
        }
        let driver = WebDriver::new(self.server_url.as_str(), caps)
            .await
            .map_err(|e| browser_err(format!("cannot start session: {}", e)))?;

        let outcome = tokio::time::timeout(self.page_timeout, self.render(&driver, req)).await;

        // Released whatever happened above
        if let Err(e) = driver.quit().await {
            warn!("failed to close browser session for {}: {}", req.url, e);
        }

        let html = match outcome {
            Ok(Ok(html)) => html,
            Ok(Err(e)) => return Err(browser_err(e.to_string())),
            Err(_) => {
                return Err(browser_err(format!(
                    "timed out after {}ms",
                    self.page_timeout.as_millis()
                )))
            }
        };
        Ok(RenderedPage {
            url: req.url.clone(),
            html,
            structured_json: None,
        })
    }
}

// ── plain HTTP ──

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self, FetchFailure> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| FetchFailure::Setup(format!("http client: {}", e)))?;
        Ok(HttpFetcher { client })
    }
}

impl PageFetcher for HttpFetcher {
    async fn fetch(&self, req: &FetchRequest) -> Result<RenderedPage, FetchFailure> {
        let http_err = |source: reqwest::Error| FetchFailure::Http {
            url: req.url.clone(),
            source,
        };

        let response = self.client.get(&req.url).send().await.map_err(http_err)?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchFailure::Unsuccessful {
                url: req.url.clone(),
                message: format!("HTTP {}", status),
            });
        }
        let html = response.text().await.map_err(http_err)?;
        if html.trim().is_empty() {
            return Err(FetchFailure::Empty(req.url.clone()));
        }
        Ok(RenderedPage {
            url: req.url.clone(),
            html,
            structured_json: None,
        })
    }
}
