use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::LlmConfig;
use crate::parser::schema::ExtractionSchema;

const MAX_SAMPLE_CHARS: usize = 60_000;

const INSTRUCTION: &str = "\
Analyze this medical directory search results page and create a CSS extraction schema \
for the practitioner listings. Each entry should include:
- name: the practitioner's full name
- specialty: medical specialty
- address: full address including street and city
- distance: distance from the search location (if available)
- sector_info: insurance sector information (if available)
- profile_url: link to the practitioner's profile (if available)
Ignore navigation, ads and footer content.
Answer with JSON only, shaped as {\"name\": str, \"baseSelector\": str, \"fields\": \
[{\"name\": str, \"selector\": str, \"type\": \"text\" | \"attribute\", \"attribute\"?: str}]}.";

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    content: Option<String>,
}

/// Cut `html` to at most `max` characters without splitting a code point.
fn truncate_sample(html: &str, max: usize) -> &str {
    match html.char_indices().nth(max) {
        Some((idx, _)) => &html[..idx],
        None => html,
    }
}

/// Pull the JSON object out of a model reply that may wrap it in prose or a
/// code fence.
fn schema_from_reply(reply: &str) -> Result<ExtractionSchema> {
    let start = reply.find('{').context("reply contains no JSON object")?;
    let end = reply.rfind('}').context("reply contains no JSON object")?;
    if end < start {
        bail!("reply contains no JSON object");
    }
    Ok(ExtractionSchema::from_json(&reply[start..=end])?)
}

/// Ask the configured chat endpoint for an extraction schema of `sample_html`.
pub async fn generate_schema(cfg: &LlmConfig, sample_html: &str) -> Result<ExtractionSchema> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(120))
        .build()?;
    let sample = truncate_sample(sample_html, MAX_SAMPLE_CHARS);
    let body = ChatRequest {
        model: &cfg.model,
        messages: vec![
            ChatMessage {
                role: "system",
                content: INSTRUCTION,
            },
            ChatMessage {
                role: "user",
                content: sample,
            },
        ],
        temperature: cfg.temperature,
        max_tokens: cfg.max_tokens,
    };

    let mut req = client.post(&cfg.endpoint).json(&body);
    if let Some(key) = cfg.api_key() {
        req = req.bearer_auth(key);
    }
    let resp: ChatResponse = req
        .send()
        .await
        .with_context(|| format!("calling {}", cfg.endpoint))?
        .error_for_status()?
        .json()
        .await
        .context("decoding chat response")?;

    let reply = resp
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .context("chat response has no content")?;
    schema_from_reply(&reply)
}

/// Generate a schema, falling back to the built-in one on any failure.
pub async fn generate_or_default(cfg: &LlmConfig, sample_html: &str) -> ExtractionSchema {
    info!("Generating extraction schema with {} at {}", cfg.model, cfg.endpoint);
    match generate_schema(cfg, sample_html).await {
        Ok(schema) => {
            info!(
                "Schema generated: base {:?}, {} fields",
                schema.base_selector,
                schema.fields.len()
            );
            schema
        }
        Err(e) => {
            warn!("Schema generation failed ({:#}), using built-in schema", e);
            ExtractionSchema::default()
        }
    }
}
