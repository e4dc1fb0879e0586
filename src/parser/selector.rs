use scraper::{ElementRef, Html, Selector};
use tracing::debug;

use super::schema::{ExtractionSchema, FieldKind};
use super::text::normalize;
use crate::error::ExtractionFailure;
use crate::record::FieldSet;

/// CSS selector list with `:contains('text')` and `:has(sel)` support on the
/// last compound of each alternative. The same pseudo-classes on earlier
/// compounds are dropped, so those alternatives may over-match.
#[derive(Debug)]
pub struct CompiledSelector {
    alternatives: Vec<Alternative>,
}

#[derive(Debug)]
struct Alternative {
    css: Selector,
    filters: Vec<Filter>,
}

#[derive(Debug)]
enum Filter {
    Contains(String),
    Has(Box<CompiledSelector>),
}

enum Pseudo {
    Contains(String),
    Has(String),
}

impl CompiledSelector {
    pub fn parse(source: &str) -> Result<Self, ExtractionFailure> {
        let fail = |message: String| ExtractionFailure::Selector {
            selector: source.to_string(),
            message,
        };

        let mut alternatives = Vec::new();
        for alt in split_top_level(source, ',') {
            let alt = alt.trim();
            if alt.is_empty() {
                continue;
            }
            let (mut css, pseudos) = strip_pseudos(alt).map_err(fail)?;
            if css.is_empty() || css.ends_with(|c: char| c.is_whitespace() || "+>~".contains(c)) {
                css.push('*');
            }
            let last = last_compound_start(&css);
            let mut filters = Vec::new();
            for (pos, pseudo) in pseudos {
                if pos < last {
                    debug!("ignoring pseudo-class on inner compound of `{}`", alt);
                    continue;
                }
                filters.push(match pseudo {
                    Pseudo::Contains(text) => Filter::Contains(text),
                    Pseudo::Has(inner) => Filter::Has(Box::new(CompiledSelector::parse(&inner)?)),
                });
            }
            let css = Selector::parse(css.trim()).map_err(|e| fail(e.to_string()))?;
            alternatives.push(Alternative { css, filters });
        }

        if alternatives.is_empty() {
            return Err(fail("empty selector".to_string()));
        }
        Ok(CompiledSelector { alternatives })
    }

    fn matches(&self, el: &ElementRef) -> bool {
        self.alternatives.iter().any(|alt| alt.matches(el))
    }

    /// Matching descendants of `root` (excluding `root`), in document order.
    pub fn select_in<'a>(&self, root: ElementRef<'a>) -> Vec<ElementRef<'a>> {
        root.descendants()
            .skip(1)
            .filter_map(ElementRef::wrap)
            .filter(|el| self.matches(el))
            .collect()
    }

    /// First match below `root`. Alternatives are tried in the order they
    /// were written, so `h2 + div p, p` only falls back to `p` when no
    /// `h2 + div p` exists.
    pub fn first_in<'a>(&self, root: ElementRef<'a>) -> Option<ElementRef<'a>> {
        self.alternatives.iter().find_map(|alt| {
            root.descendants()
                .skip(1)
                .filter_map(ElementRef::wrap)
                .find(|el| alt.matches(el))
        })
    }
}

impl Alternative {
    fn matches(&self, el: &ElementRef) -> bool {
        self.css.matches(el)
            && self.filters.iter().all(|f| match f {
                Filter::Contains(text) => el.text().collect::<String>().contains(text.as_str()),
                Filter::Has(inner) => inner.first_in(*el).is_some(),
            })
    }
}

/// Split on `sep` outside of parentheses, brackets and quotes.
fn split_top_level(input: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    let mut start = 0;
    for (i, c) in input.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(c),
            (None, '(' | '[') => depth += 1,
            (None, ')' | ']') => depth -= 1,
            (None, c) if c == sep && depth == 0 => {
                parts.push(&input[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&input[start..]);
    parts
}

/// Byte index of the `)` closing the `(` at `open`.
fn find_close(input: &str, open: usize) -> Option<usize> {
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    for (i, c) in input[open..].char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(c),
            (None, '(') => depth += 1,
            (None, ')') => {
                depth -= 1;
                if depth == 0 {
                    return Some(open + i);
                }
            }
            _ => {}
        }
    }
    None
}

fn unquote(arg: &str) -> String {
    let arg = arg.trim();
    let stripped = arg
        .strip_prefix('\'')
        .and_then(|a| a.strip_suffix('\''))
        .or_else(|| arg.strip_prefix('"').and_then(|a| a.strip_suffix('"')));
    stripped.unwrap_or(arg).to_string()
}

/// Remove custom pseudo-classes, remembering where in the stripped output
/// each one sat.
fn strip_pseudos(alt: &str) -> Result<(String, Vec<(usize, Pseudo)>), String> {
    const CONTAINS: &str = ":contains(";
    const HAS: &str = ":has(";

    let mut out = String::with_capacity(alt.len());
    let mut pseudos = Vec::new();
    let mut quote: Option<char> = None;
    let mut i = 0;
    while i < alt.len() {
        let rest = &alt[i..];
        if quote.is_none() {
            let prefix = if rest.starts_with(CONTAINS) {
                Some(CONTAINS)
            } else if rest.starts_with(HAS) {
                Some(HAS)
            } else {
                None
            };
            if let Some(prefix) = prefix {
                let open = i + prefix.len() - 1;
                let close = find_close(alt, open)
                    .ok_or_else(|| format!("unbalanced parenthesis in `{alt}`"))?;
                let arg = &alt[open + 1..close];
                let pseudo = if prefix == CONTAINS {
                    Pseudo::Contains(unquote(arg))
                } else {
                    Pseudo::Has(arg.trim().to_string())
                };
                pseudos.push((out.len(), pseudo));
                i = close + 1;
                continue;
            }
        }
        let Some(c) = rest.chars().next() else { break };
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (None, '\'' | '"') => quote = Some(c),
            _ => {}
        }
        out.push(c);
        i += c.len_utf8();
    }
    Ok((out, pseudos))
}

/// Start of the last compound selector (after the last top-level combinator).
fn last_compound_start(css: &str) -> usize {
    let trimmed = css.trim_end();
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    let mut start = 0;
    for (i, c) in trimmed.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(c),
            (None, '(' | '[') => depth += 1,
            (None, ')' | ']') => depth -= 1,
            (None, c) if depth == 0 && (c.is_whitespace() || "+>~".contains(c)) => {
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    start
}

/// True when `el` sits somewhere inside `outer`.
fn is_within(el: &ElementRef, outer: &ElementRef) -> bool {
    el.ancestors().any(|a| a.id() == outer.id())
}

/// Pick the elements that stand for one card each. `div:has(h2 button)`
/// matches every wrapper around a card, and inside a card it may also match
/// a heading wrapper. A card is the outermost base match holding exactly one
/// name match; without a usable name selector the innermost matches are kept.
fn card_elements<'a>(bases: &[ElementRef<'a>], name: Option<&CompiledSelector>) -> Vec<ElementRef<'a>> {
    if let Some(name) = name {
        let single: Vec<ElementRef> = bases
            .iter()
            .copied()
            .filter(|b| name.select_in(*b).len() == 1)
            .collect();
        let outermost: Vec<ElementRef> = single
            .iter()
            .copied()
            .filter(|b| !single.iter().any(|o| o.id() != b.id() && is_within(b, o)))
            .collect();
        if !outermost.is_empty() {
            return outermost;
        }
    }
    bases
        .iter()
        .copied()
        .filter(|b| !bases.iter().any(|o| o.id() != b.id() && is_within(o, b)))
        .collect()
}

/// Structured pass run locally: one field-set per card element.
pub fn apply_schema(markup: &str, schema: &ExtractionSchema) -> Result<Vec<FieldSet>, ExtractionFailure> {
    let base = CompiledSelector::parse(&schema.base_selector)?;
    let fields = schema
        .fields
        .iter()
        .map(|f| CompiledSelector::parse(&f.selector).map(|sel| (f, sel)))
        .collect::<Result<Vec<_>, _>>()?;

    let doc = Html::parse_document(markup);
    let root = doc.root_element();
    let mut bases = Vec::new();
    if base.matches(&root) {
        bases.push(root);
    }
    bases.extend(base.select_in(root));

    let name_sel = fields.iter().find(|(f, _)| f.name == "name").map(|(_, sel)| sel);
    let cards = card_elements(&bases, name_sel);

    let mut sets = Vec::with_capacity(cards.len());
    for el in cards {
        let mut fs = FieldSet::default();
        for (field, sel) in &fields {
            let Some(found) = sel.first_in(el) else { continue };
            let value = match field.kind {
                FieldKind::Text => normalize(&found.text().collect::<Vec<_>>().join(" ")),
                FieldKind::Attribute => {
                    let attr = field.attribute.as_deref().unwrap_or("href");
                    found.value().attr(attr).map(str::trim).unwrap_or_default().to_string()
                }
            };
            if !value.is_empty() {
                fs.set(&field.name, value);
            }
        }
        sets.push(fs);
    }

    if sets.is_empty() {
        return Err(ExtractionFailure::NoMatches("structured"));
    }
    Ok(sets)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CARDS: &str = r#"<html><body><main><div class="list">
        <div class="card"><img class="w-48"><h2><button>Dr A</button></h2>
            <div><p>Cardiologue</p></div><p>12 Rue de Lyon</p><span>1,5 km</span>
            <p>Conventionné secteur 1</p><a href="/cardiologue/paris/dr-a">Voir</a></div>
        <div class="card"><h2><button>Dr B</button></h2>
            <div><p>ORL</p></div><p>4 Avenue Daumesnil</p></div>
    </div></main></body></html>"#;

    #[test]
    fn split_respects_parens_and_quotes() {
        assert_eq!(
            split_top_level("p:contains('a, b'), div:has(h2, h3), span", ','),
            ["p:contains('a, b')", " div:has(h2, h3)", " span"]
        );
    }

    #[test]
    fn pseudo_on_last_compound_only() {
        let (css, pseudos) = strip_pseudos("div:has(h2) + div p:contains('Rue')").unwrap();
        assert_eq!(css, "div + div p");
        let last = last_compound_start(&css);
        let kept: Vec<usize> = pseudos.iter().map(|(p, _)| *p).filter(|p| *p >= last).collect();
        assert_eq!(kept, [css.len()]);
    }

    #[test]
    fn contains_filter() {
        let doc = Html::parse_document(CARDS);
        let sel = CompiledSelector::parse("p:contains('Rue'), p:contains('Avenue')").unwrap();
        let found: Vec<String> = sel
            .select_in(doc.root_element())
            .iter()
            .map(|e| e.text().collect())
            .collect();
        assert_eq!(found, ["12 Rue de Lyon", "4 Avenue Daumesnil"]);
    }

    #[test]
    fn bare_pseudo_selects_any_element() {
        let doc = Html::parse_document("<div><em>1 km</em></div>");
        let sel = CompiledSelector::parse(":contains('km')").unwrap();
        assert!(sel.select_in(doc.root_element()).iter().any(|e| e.value().name() == "em"));
    }

    #[test]
    fn invalid_selector() {
        assert!(matches!(
            CompiledSelector::parse("p:contains('x'"),
            Err(ExtractionFailure::Selector { .. })
        ));
        assert!(matches!(
            CompiledSelector::parse("[[["),
            Err(ExtractionFailure::Selector { .. })
        ));
    }

    #[test]
    fn default_schema_on_cards() {
        let sets = apply_schema(CARDS, &ExtractionSchema::default()).unwrap();
        assert_eq!(sets.len(), 2);
        assert_eq!(sets[0].name.as_deref(), Some("Dr A"));
        assert_eq!(sets[0].specialty.as_deref(), Some("Cardiologue"));
        assert_eq!(sets[0].address.as_deref(), Some("12 Rue de Lyon"));
        assert_eq!(sets[0].distance.as_deref(), Some("1,5 km"));
        assert_eq!(sets[0].sector_info.as_deref(), Some("Conventionné secteur 1"));
        assert_eq!(sets[0].profile_url.as_deref(), Some("/cardiologue/paris/dr-a"));
        assert_eq!(sets[1].name.as_deref(), Some("Dr B"));
        assert_eq!(sets[1].profile_url, None);
    }

    #[test]
    fn heading_wrapper_inside_card() {
        let html = r#"<div class="list">
            <div class="card"><div class="head"><h2><button>Dr A</button></h2></div>
                <p>Cardiologue</p><p>12 Rue de Lyon</p><span>1 km</span>
                <p>Conventionné secteur 1</p></div>
            <div class="card"><div class="head"><h2><button>Dr B</button></h2></div>
                <p>ORL</p><p>4 Avenue Daumesnil</p></div>
        </div>"#;
        let sets = apply_schema(html, &ExtractionSchema::default()).unwrap();
        assert_eq!(sets.len(), 2);
        assert_eq!(sets[0].name.as_deref(), Some("Dr A"));
        assert_eq!(sets[0].specialty.as_deref(), Some("Cardiologue"));
        assert_eq!(sets[0].address.as_deref(), Some("12 Rue de Lyon"));
        assert_eq!(sets[0].distance.as_deref(), Some("1 km"));
        assert_eq!(sets[0].sector_info.as_deref(), Some("Conventionné secteur 1"));
        assert_eq!(sets[1].address.as_deref(), Some("4 Avenue Daumesnil"));
    }

    #[test]
    fn innermost_kept_without_name_field() {
        let html = r#"<div class="outer"><div class="card"><b>x</b></div><div class="card"><b>y</b></div></div>"#;
        let schema = ExtractionSchema::from_json(
            r#"{"baseSelector": "div:has(b)", "fields": [{"name": "name", "selector": "i"}]}"#,
        )
        .unwrap();
        assert_eq!(apply_schema(html, &schema).unwrap().len(), 2);
    }

    #[test]
    fn alternatives_tried_in_written_order() {
        let doc = Html::parse_document(
            "<div><p>Nouveau patient</p><h2><button>Dr A</button></h2><div><p>Cardiologue</p></div></div>",
        );
        let sel = CompiledSelector::parse("h2 + div p, p").unwrap();
        let found = sel.first_in(doc.root_element()).unwrap();
        assert_eq!(found.text().collect::<String>(), "Cardiologue");

        let fallback = CompiledSelector::parse("h3 + div p, p").unwrap();
        let found = fallback.first_in(doc.root_element()).unwrap();
        assert_eq!(found.text().collect::<String>(), "Nouveau patient");
    }

    #[test]
    fn no_base_match() {
        let err = apply_schema("<p>nothing</p>", &ExtractionSchema::default()).unwrap_err();
        assert!(matches!(err, ExtractionFailure::NoMatches(_)));
    }
}
