use std::time::Duration;

use indicatif::ProgressBar;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::fetch::{FetchRequest, PageFetcher};
use crate::filter::{dedupe, Denylist};
use crate::parser::schema::ExtractionSchema;
use crate::parser::{extract_page, ExtractContext, Strategy};
use crate::record::{PractitionerRecord, RecordDefaults};

const PAGE_PARAM: &str = "page";

/// Remove every `page=` query parameter (and any fragment) from `url`,
/// keeping the remaining parameters in order.
pub fn strip_page_param(url: &str) -> String {
    let url = url.trim();
    let url = url.split_once('#').map_or(url, |(head, _)| head);
    let Some((path, query)) = url.split_once('?') else {
        return url.to_string();
    };
    let kept: Vec<&str> = query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter(|pair| pair.split_once('=').map_or(*pair, |(k, _)| k) != PAGE_PARAM)
        .collect();
    if kept.is_empty() {
        path.to_string()
    } else {
        format!("{}?{}", path, kept.join("&"))
    }
}

/// Append the page number using `&` when `base` already has a query string.
pub fn build_page_url(base: &str, page: u32) -> String {
    let sep = if base.contains('?') { '&' } else { '?' };
    format!("{}{}{}={}", base, sep, PAGE_PARAM, page)
}

/// A results page: cleaned base URL plus page number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    base: String,
    page: u32,
}

impl PageRequest {
    pub fn new(base: &str, page: u32) -> Self {
        PageRequest {
            base: strip_page_param(base),
            page,
        }
    }

    pub fn page(&self) -> u32 {
        self.page
    }

    pub fn url(&self) -> String {
        build_page_url(&self.base, self.page)
    }
}

/// Inputs of one scrape run.
pub struct RunPlan<'a> {
    pub base_url: String,
    pub max_pages: u32,
    pub delay: Duration,
    pub pre_render_script: Option<String>,
    pub schema: Option<&'a ExtractionSchema>,
    pub defaults: &'a RecordDefaults,
    pub denylist: &'a Denylist,
}

#[derive(Debug, Clone)]
pub struct PageOutcome {
    pub page: u32,
    pub url: String,
    pub records: usize,
    pub strategy: Option<Strategy>,
    pub error: Option<String>,
}

#[derive(Debug)]
pub struct RunReport {
    pub records: Vec<PractitionerRecord>,
    pub pages: Vec<PageOutcome>,
    pub interrupted: bool,
}

impl RunReport {
    pub fn pages_failed(&self) -> usize {
        self.pages.iter().filter(|p| p.error.is_some()).count()
    }
}

/// Resolves once the cancel flag is raised; never if the sender goes away.
pub(crate) async fn cancelled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Fetch and extract pages `1..=max_pages` strictly one after another.
///
/// A failed page is logged and skipped. Raising `cancel` abandons the
/// in-flight fetch or delay and returns what was gathered so far.
pub async fn run<F: PageFetcher>(
    fetcher: &F,
    plan: &RunPlan<'_>,
    pb: &ProgressBar,
    cancel: &mut watch::Receiver<bool>,
) -> RunReport {
    let mut records: Vec<PractitionerRecord> = Vec::new();
    let mut pages = Vec::with_capacity(plan.max_pages as usize);
    let mut interrupted = false;

    for n in 1..=plan.max_pages {
        if *cancel.borrow() {
            interrupted = true;
            break;
        }

        let request = PageRequest::new(&plan.base_url, n);
        let fetch_req = FetchRequest {
            url: request.url(),
            pre_render_script: plan.pre_render_script.clone(),
        };
        pb.set_message(format!("page {}", n));
        info!("Scraping page {}: {}", request.page(), fetch_req.url);

        let fetched = tokio::select! {
            r = fetcher.fetch(&fetch_req) => Some(r),
            _ = cancelled(cancel) => None,
        };
        let Some(fetched) = fetched else {
            warn!("Interrupted while loading page {}", n);
            interrupted = true;
            break;
        };

        let outcome = match fetched {
            Ok(page) => {
                let ctx = ExtractContext {
                    page_url: &page.url,
                    schema: plan.schema,
                    structured_json: page.structured_json.as_deref(),
                    defaults: plan.defaults,
                    denylist: plan.denylist,
                };
                let extraction = extract_page(&page.html, &ctx);
                for (strategy, failure) in &extraction.failures {
                    debug!("page {}: {} pass: {}", n, strategy, failure);
                }
                let batch = dedupe(extraction.records, plan.denylist);
                match extraction.strategy {
                    Some(s) => info!("Found {} practitioners on page {} ({} pass)", batch.len(), n, s),
                    None => warn!("No practitioners extracted from page {}", n),
                }
                let count = batch.len();
                records.extend(batch);
                PageOutcome {
                    page: n,
                    url: fetch_req.url.clone(),
                    records: count,
                    strategy: extraction.strategy,
                    error: None,
                }
            }
            Err(e) => {
                warn!("Failed to load page {}: {}", n, e);
                PageOutcome {
                    page: n,
                    url: fetch_req.url.clone(),
                    records: 0,
                    strategy: None,
                    error: Some(e.to_string()),
                }
            }
        };
        pages.push(outcome);
        pb.inc(1);

        if n < plan.max_pages && !plan.delay.is_zero() {
            debug!("Waiting {:.1}s before next page", plan.delay.as_secs_f64());
            tokio::select! {
                _ = tokio::time::sleep(plan.delay) => {}
                _ = cancelled(cancel) => {
                    warn!("Interrupted after page {}", n);
                    interrupted = true;
                    break;
                }
            }
        }
    }

    let records = dedupe(records, plan.denylist);
    info!(
        "Total practitioners found: {} ({} pages attempted, {} failed)",
        records.len(),
        pages.len(),
        pages.iter().filter(|p| p.error.is_some()).count()
    );
    RunReport {
        records,
        pages,
        interrupted,
    }
}
