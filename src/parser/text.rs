use std::sync::LazyLock;

use regex::Regex;

static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").unwrap());
static WS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

const ENTITIES: &[(&str, &str)] = &[
    ("&nbsp;", " "),
    ("&#160;", " "),
    ("&quot;", "\""),
    ("&#39;", "'"),
    ("&apos;", "'"),
    ("&rsquo;", "\u{2019}"),
    ("&eacute;", "é"),
    ("&Eacute;", "É"),
    ("&egrave;", "è"),
    ("&lt;", ""),
    ("&gt;", ""),
    // last so "&amp;nbsp;" does not turn into a space
    ("&amp;", "&"),
];

/// Strip tag-like fragments, decode common entities and collapse whitespace.
///
/// Never fails; the worst case is an empty string. The output contains no
/// `<` or `>` characters, no whitespace runs and no leading/trailing spaces.
pub fn normalize(raw: &str) -> String {
    if raw.is_empty() {
        return String::new();
    }
    let mut text = TAG_RE.replace_all(raw, " ").into_owned();
    for (entity, replacement) in ENTITIES {
        if text.contains(entity) {
            text = text.replace(entity, replacement);
        }
    }
    // Unterminated tags ("<div class=") leave stray brackets behind
    text.retain(|c| c != '<' && c != '>');
    WS_RE.replace_all(text.trim(), " ").into_owned()
}

/// Like [`normalize`] but maps an empty result to `None`.
pub fn normalize_opt(raw: Option<&str>) -> Option<String> {
    raw.map(normalize).filter(|s| !s.is_empty())
}
