use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::RatingsConfig;
use crate::pagination::cancelled;
use crate::record::PractitionerRecord;

const USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0 Safari/537.36";

// Tried in order; the first pattern that yields a value <= 5 wins. The
// number may not touch other digits or separators on either side, so
// `14,5 ★` or `★ 12` are not read as ratings.
static RATING_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    const NUM: &str = r"(\d(?:[.,]\d{1,2})?)";
    const BEFORE: &str = r"(?:^|[^\d.,])";
    const AFTER: &str = r"(?:$|[^\d])";
    [
        format!(r"{BEFORE}{NUM}\s*★"),
        format!(r"★\s*{NUM}{AFTER}"),
        format!(r"{BEFORE}{NUM}\s*/\s*5{AFTER}"),
        format!(r"(?i){BEFORE}{NUM}\s+sur\s+5{AFTER}"),
        format!(r"(?i){BEFORE}{NUM}\s+out\s+of\s+5{AFTER}"),
        format!(r"(?i)\bnote\s*:\s*{NUM}{AFTER}"),
        format!(r"(?i)\brating\s*:\s*{NUM}{AFTER}"),
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

/// Find a star rating in a search-results page, formatted `"x/5"`.
pub fn find_rating(markup: &str) -> Option<String> {
    for re in RATING_PATTERNS.iter() {
        for cap in re.captures_iter(markup) {
            let raw = cap[1].replace(',', ".");
            let Ok(value) = raw.parse::<f32>() else {
                continue;
            };
            if (0.0..=5.0).contains(&value) {
                return Some(format!("{}/5", raw));
            }
        }
    }
    None
}

/// Looks up a rating for one practitioner name.
pub trait RatingSource {
    async fn lookup(&self, name: &str) -> Option<String>;
}

// ── live search ──

pub struct SearchRatingSource {
    client: reqwest::Client,
    search_url: String,
    templates: Vec<String>,
}

impl SearchRatingSource {
    pub fn new(cfg: &RatingsConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(SearchRatingSource {
            client,
            search_url: cfg.search_url.clone(),
            templates: cfg.query_templates.clone(),
        })
    }

    async fn search(&self, query: &str) -> Result<String, reqwest::Error> {
        self.client
            .get(&self.search_url)
            .query(&[("q", query)])
            .send()
            .await?
            .error_for_status()?
            .text()
            .await
    }
}

impl RatingSource for SearchRatingSource {
    async fn lookup(&self, name: &str) -> Option<String> {
        for template in &self.templates {
            let query = template.replace("{name}", name);
            match self.search(&query).await {
                Ok(body) => {
                    if let Some(rating) = find_rating(&body) {
                        debug!("rating for {:?} via {:?}: {}", name, query, rating);
                        return Some(rating);
                    }
                }
                Err(e) => warn!("rating search failed for {:?}: {}", query, e),
            }
        }
        None
    }
}

// ── deterministic mock ──

/// Pseudo-ratings in `[3.0, 5.0]` derived from the name and a seed.
pub struct MockRatingSource {
    pub seed: u64,
}

impl MockRatingSource {
    fn fnv1a(&self, name: &str) -> u64 {
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325 ^ self.seed;
        for b in name.as_bytes() {
            hash ^= u64::from(*b);
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
        hash
    }

    pub fn rating_for(&self, name: &str) -> String {
        let tenths = 30 + self.fnv1a(name) % 21;
        format!("{}.{}/5", tenths / 10, tenths % 10)
    }
}

impl RatingSource for MockRatingSource {
    async fn lookup(&self, name: &str) -> Option<String> {
        Some(self.rating_for(name))
    }
}

/// Either source, picked from the config at runtime.
pub enum AnyRatingSource {
    Search(SearchRatingSource),
    Mock(MockRatingSource),
}

impl AnyRatingSource {
    pub fn from_config(cfg: &RatingsConfig) -> anyhow::Result<Self> {
        Ok(if cfg.mock {
            AnyRatingSource::Mock(MockRatingSource { seed: cfg.seed })
        } else {
            AnyRatingSource::Search(SearchRatingSource::new(cfg)?)
        })
    }
}

impl RatingSource for AnyRatingSource {
    async fn lookup(&self, name: &str) -> Option<String> {
        match self {
            AnyRatingSource::Search(s) => s.lookup(name).await,
            AnyRatingSource::Mock(m) => m.lookup(name).await,
        }
    }
}

/// Add ratings to `records` one at a time, waiting `delay` between lookups.
/// Returns how many records received a rating. A missing rating never
/// clears an existing one.
pub async fn enrich_records<S: RatingSource>(
    records: &mut [PractitionerRecord],
    source: &S,
    delay: Duration,
    cancel: &mut watch::Receiver<bool>,
) -> usize {
    let total = records.len();
    let mut rated = 0;
    for (i, record) in records.iter_mut().enumerate() {
        if *cancel.borrow() {
            warn!("Rating lookup interrupted after {} of {} records", i, total);
            break;
        }
        if let Some(rating) = source.lookup(&record.name).await {
            record.set_rating(rating);
            rated += 1;
        }
        if i + 1 < total && !delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancelled(cancel) => {}
            }
        }
    }
    info!("Ratings found for {}/{} practitioners", rated, total);
    rated
}
