use std::path::PathBuf;

use thiserror::Error;

/// Page could not be obtained from the browser collaborator.
#[derive(Debug, Error)]
pub enum FetchFailure {
    #[error("collaborator reported failure for {url}: {message}")]
    Unsuccessful { url: String, message: String },
    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("browser session error on {url}: {message}")]
    Browser { url: String, message: String },
    #[error("backend not configured: {0}")]
    Setup(String),
    #[error("no content returned for {0}")]
    Empty(String),
}

/// A single extraction strategy could not produce field-sets.
#[derive(Debug, Error)]
pub enum ExtractionFailure {
    #[error("no extraction schema supplied")]
    NoSchema,
    #[error("malformed structured JSON: {0}")]
    MalformedJson(#[from] serde_json::Error),
    #[error("unexpected structured JSON shape: {0}")]
    UnexpectedShape(&'static str),
    #[error("invalid selector `{selector}`: {message}")]
    Selector { selector: String, message: String },
    #[error("{0} pass matched nothing")]
    NoMatches(&'static str),
}

/// Fatal errors: the run does not start, or one output target is lost.
#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("cannot write {}: {source}", path.display())]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ScrapeError {
    pub fn config(msg: impl Into<String>) -> Self {
        ScrapeError::Config(msg.into())
    }
}
