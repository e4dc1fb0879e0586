use std::sync::LazyLock;

use regex::Regex;

use super::text::normalize;
use crate::record::FieldSet;

static P_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?is)<p\b[^>]*>(.*?)</p>").unwrap());
static SPAN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<span\b[^>]*>([^<]*?)</span>").unwrap());
static HREF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)\bhref\s*=\s*["']([^"']+)["']"#).unwrap());
static STREET_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(rue|boulevard|bd|avenue|av|place|square|allée|quai|chemin|impasse)\b").unwrap());
static POSTAL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{5}\s+\p{L}").unwrap());
static KM_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\d\s*(?:[.,]\d+)?\s*km\b").unwrap());
static SECTOR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)conventionn[ée]|[ée]tablissement").unwrap());

const SPECIALTY_MAX_CHARS: usize = 80;

/// Normalized text of every `<p>` in `block`, empty ones skipped.
fn paragraphs(block: &str) -> Vec<String> {
    P_RE.captures_iter(block)
        .map(|c| normalize(&c[1]))
        .filter(|t| !t.is_empty())
        .collect()
}

pub fn is_address(text: &str) -> bool {
    STREET_RE.is_match(text) || POSTAL_RE.is_match(text)
}

pub fn is_distance(text: &str) -> bool {
    KM_RE.is_match(text)
}

pub fn is_sector(text: &str) -> bool {
    SECTOR_RE.is_match(text)
}

/// Run every sub-pattern over one entry's content block.
pub fn extract_fields(block: &str) -> FieldSet {
    let paras = paragraphs(block);

    let specialty = paras
        .iter()
        .find(|t| {
            t.chars().count() <= SPECIALTY_MAX_CHARS
                && !is_address(t)
                && !is_distance(t)
                && !is_sector(t)
        })
        .cloned();

    let mut address_parts: Vec<&str> = Vec::new();
    for t in paras.iter().filter(|t| is_address(t) && !is_sector(t)) {
        if !address_parts.contains(&t.as_str()) {
            address_parts.push(t);
        }
    }
    let address = (!address_parts.is_empty()).then(|| address_parts.join(", "));

    let distance = SPAN_RE
        .captures_iter(block)
        .map(|c| normalize(&c[1]))
        .chain(paras.iter().cloned())
        .find(|t| is_distance(t));

    let sector_info = paras.iter().find(|t| is_sector(t)).cloned();

    let profile_url = HREF_RE
        .captures_iter(block)
        .map(|c| c[1].trim().to_string())
        .find(|h| !h.starts_with('#') && !h.to_ascii_lowercase().starts_with("javascript:"));

    FieldSet {
        name: None,
        specialty,
        address,
        distance,
        sector_info,
        profile_url,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOCK: &str = r#"
        <div><p>Gastro-entérologue et hépatologue</p></div>
        <div><p>12 Rue de Lyon</p><p>75012 Paris</p></div>
        <div><span>3,2 km</span></div>
        <p>Conventionné secteur 2</p>
        <a href="/gastro-enterologue/paris/dr-a">Prendre rendez-vous</a>
    "#;

    #[test]
    fn all_fields() {
        let fs = extract_fields(BLOCK);
        assert_eq!(fs.name, None);
        assert_eq!(fs.specialty.as_deref(), Some("Gastro-entérologue et hépatologue"));
        assert_eq!(fs.address.as_deref(), Some("12 Rue de Lyon, 75012 Paris"));
        assert_eq!(fs.distance.as_deref(), Some("3,2 km"));
        assert_eq!(fs.sector_info.as_deref(), Some("Conventionné secteur 2"));
        assert_eq!(fs.profile_url.as_deref(), Some("/gastro-enterologue/paris/dr-a"));
    }

    #[test]
    fn multiple_addresses_concatenate() {
        let block = "<p>Centre médical</p><p>4 Place de la Nation</p><p>1 Avenue Daumesnil</p><p>75012 Paris</p><p>4 Place de la Nation</p>";
        let fs = extract_fields(block);
        assert_eq!(
            fs.address.as_deref(),
            Some("4 Place de la Nation, 1 Avenue Daumesnil, 75012 Paris")
        );
        assert_eq!(fs.specialty.as_deref(), Some("Centre médical"));
    }

    #[test]
    fn etablissement_is_sector() {
        let fs = extract_fields("<p>Dermatologue</p><p>Établissement de santé privé</p>");
        assert_eq!(fs.sector_info.as_deref(), Some("Établissement de santé privé"));
        assert_eq!(fs.specialty.as_deref(), Some("Dermatologue"));
    }

    #[test]
    fn long_paragraph_not_specialty() {
        let long = "x".repeat(120);
        let fs = extract_fields(&format!("<p>{long}</p><p>ORL</p>"));
        assert_eq!(fs.specialty.as_deref(), Some("ORL"));
    }

    #[test]
    fn empty_block() {
        assert_eq!(extract_fields(""), FieldSet::default());
    }

    #[test]
    fn classifiers() {
        assert!(is_address("75011 Paris"));
        assert!(is_address("3 boulevard Voltaire"));
        assert!(!is_address("Rueil")); // word boundary
        assert!(!is_address("1234 Paris"));
        assert!(is_distance("0.8 km"));
        assert!(is_distance("12km"));
        assert!(!is_distance("Kinésithérapeute"));
    }
}
