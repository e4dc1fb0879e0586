use std::sync::LazyLock;

use regex::Regex;

use super::fields::extract_fields;
use super::text::normalize;
use crate::error::ExtractionFailure;
use crate::record::FieldSet;

/// Name heading opening on its clickable name control: `<h2><button>NAME</button>`.
/// The name may only hold text and inline tags, so a match never runs into
/// the next heading; siblings after the button are left to the block.
static NAME_ANCHOR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)<h2\b[^>]*>\s*<button\b[^>]*>((?:[^<]|</?(?:span|strong|em|b|i)\b[^>]*>)*)</button>",
    )
    .unwrap()
});
static HEADING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<h([23])\b[^>]*>(.*?)</h[23]>").unwrap());
static NAME_ATTR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)<[a-z][a-z0-9]*\b[^>]*\b(?:class|data-testid)\s*=\s*"[^"]*name[^"]*"[^>]*>([^<]+)<"#)
        .unwrap()
});

/// A located name heading: byte span in the markup plus the raw name fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Anchor {
    pub start: usize,
    pub end: usize,
    pub raw_name: String,
}

/// Strict anchors, in document order.
pub fn name_anchors(markup: &str) -> Vec<Anchor> {
    NAME_ANCHOR_RE
        .captures_iter(markup)
        .filter_map(|c| {
            let m = c.get(0)?;
            Some(Anchor {
                start: m.start(),
                end: m.end(),
                raw_name: c[1].to_string(),
            })
        })
        .collect()
}

/// Strict anchors plus plain headings and `*name*` class/test-id elements,
/// ordered by position. Overlapping matches collapse to the earliest one,
/// and a strict anchor wins over a heading starting at the same place.
pub fn loose_anchors(markup: &str) -> Vec<Anchor> {
    let mut found: Vec<(u8, Anchor)> = name_anchors(markup).into_iter().map(|a| (0, a)).collect();
    for c in HEADING_RE.captures_iter(markup) {
        if let Some(m) = c.get(0) {
            found.push((
                1,
                Anchor {
                    start: m.start(),
                    end: m.end(),
                    raw_name: c[2].to_string(),
                },
            ));
        }
    }
    for c in NAME_ATTR_RE.captures_iter(markup) {
        if let Some(m) = c.get(0) {
            found.push((
                2,
                Anchor {
                    start: m.start(),
                    end: m.end(),
                    raw_name: c[1].to_string(),
                },
            ));
        }
    }

    found.sort_by(|(ra, a), (rb, b)| a.start.cmp(&b.start).then(ra.cmp(rb)).then(b.end.cmp(&a.end)));
    let mut kept: Vec<Anchor> = Vec::with_capacity(found.len());
    for (_, anchor) in found {
        if kept.last().is_some_and(|last| anchor.start < last.end) {
            continue;
        }
        if normalize(&anchor.raw_name).is_empty() {
            continue;
        }
        kept.push(anchor);
    }
    kept
}

/// Split `markup` into per-entry segments: each anchor owns the text up to
/// the next anchor, the last one owns the rest of the document.
fn segment<'a>(markup: &'a str, anchors: &'a [Anchor]) -> impl Iterator<Item = FieldSet> + 'a {
    anchors.iter().enumerate().map(move |(i, anchor)| {
        let stop = anchors.get(i + 1).map_or(markup.len(), |next| next.start);
        let block = &markup[anchor.end..stop];
        FieldSet {
            name: Some(anchor.raw_name.clone()),
            ..extract_fields(block)
        }
    })
}

/// Segmented-block regex pass.
pub fn segmented_blocks(markup: &str) -> Result<Vec<FieldSet>, ExtractionFailure> {
    let anchors = name_anchors(markup);
    if anchors.is_empty() {
        return Err(ExtractionFailure::NoMatches("segmented-block"));
    }
    Ok(segment(markup, &anchors).collect())
}

/// Name-anchored context pass: all names first, then the context between
/// consecutive names.
pub fn name_anchored(markup: &str) -> Result<Vec<FieldSet>, ExtractionFailure> {
    let anchors = loose_anchors(markup);
    if anchors.is_empty() {
        return Err(ExtractionFailure::NoMatches("name-anchored"));
    }
    Ok(segment(markup, &anchors).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(sets: &[FieldSet]) -> Vec<String> {
        sets.iter()
            .map(|f| normalize(f.name.as_deref().unwrap_or_default()))
            .collect()
    }

    #[test]
    fn segments_between_anchors() {
        let html = r#"<div><h2><button type="button">Dr A</button></h2><p>Cardiologue</p><p>1 Rue X</p></div>
<div><h2 class="t"><button>Dr B</button></h2><p>ORL</p><span>2 km</span></div>"#;
        let sets = segmented_blocks(html).unwrap();
        assert_eq!(names(&sets), ["Dr A", "Dr B"]);
        assert_eq!(sets[0].specialty.as_deref(), Some("Cardiologue"));
        assert_eq!(sets[0].address.as_deref(), Some("1 Rue X"));
        assert_eq!(sets[0].distance, None);
        assert_eq!(sets[1].specialty.as_deref(), Some("ORL"));
        assert_eq!(sets[1].distance.as_deref(), Some("2 km"));
    }

    #[test]
    fn multiline_anchor() {
        let html = "<h2>\n  <button>\n Dr   C\n</button>\n</h2>\n<p>Pédiatre</p>";
        let sets = segmented_blocks(html).unwrap();
        assert_eq!(names(&sets), ["Dr C"]);
        assert_eq!(sets[0].specialty.as_deref(), Some("Pédiatre"));
    }

    #[test]
    fn sibling_after_button_stays_in_its_own_entry() {
        let html = "<h2>\n<button>Dr A</button>\n<span>Nouveau</span>\n</h2>\n<p>Cardiologue</p>\n<p>12 Rue de Lyon</p>\n\
                    <h2><button>Dr B</button></h2>\n<p>ORL</p>";
        let sets = segmented_blocks(html).unwrap();
        assert_eq!(names(&sets), ["Dr A", "Dr B"]);
        assert_eq!(sets[0].specialty.as_deref(), Some("Cardiologue"));
        assert_eq!(sets[0].address.as_deref(), Some("12 Rue de Lyon"));
        assert_eq!(sets[1].specialty.as_deref(), Some("ORL"));
    }

    #[test]
    fn inline_markup_inside_name() {
        let html = "<h2><button><span>Dr</span> <strong>Eva</strong> ROUX</button></h2><p>Dentiste</p>";
        let sets = segmented_blocks(html).unwrap();
        assert_eq!(names(&sets), ["Dr Eva ROUX"]);
    }

    #[test]
    fn no_anchor_is_failure() {
        let err = segmented_blocks("<h3>Dr A</h3><p>ORL</p>").unwrap_err();
        assert!(matches!(err, ExtractionFailure::NoMatches(_)));
    }

    #[test]
    fn name_anchored_uses_loose_headings() {
        let html = r#"<h3>Dr A</h3><p>ORL</p><p>5 Avenue Y</p>
<div class="card"><span class="dl-doctor-name">Dr B</span><p>Dentiste</p></div>"#;
        let sets = name_anchored(html).unwrap();
        assert_eq!(names(&sets), ["Dr A", "Dr B"]);
        assert_eq!(sets[0].address.as_deref(), Some("5 Avenue Y"));
        assert_eq!(sets[1].specialty.as_deref(), Some("Dentiste"));
    }

    #[test]
    fn loose_anchors_collapse_overlaps() {
        let html = "<h2><button>Dr A</button></h2><p>ORL</p><h2></h2><h3>Dr B</h3>";
        let anchors = loose_anchors(html);
        let got: Vec<String> = anchors.iter().map(|a| normalize(&a.raw_name)).collect();
        assert_eq!(got, ["Dr A", "Dr B"]);
    }

    #[test]
    fn strict_anchor_preferred_over_enclosing_heading() {
        let html = "<h2><button>Dr A</button><span>Nouveau</span></h2><p>ORL</p>";
        let anchors = loose_anchors(html);
        assert_eq!(anchors.len(), 1);
        assert_eq!(anchors[0].raw_name, "Dr A");
    }
}
