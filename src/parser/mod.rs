pub mod blocks;
pub mod fields;
pub mod schema;
pub mod selector;
pub mod text;

use std::fmt;

use tracing::{debug, trace};

use crate::error::ExtractionFailure;
use crate::filter::Denylist;
use crate::record::{FieldSet, PractitionerRecord, RecordDefaults};
use schema::ExtractionSchema;

/// Everything one page's extraction needs besides the markup.
pub struct ExtractContext<'a> {
    pub page_url: &'a str,
    pub schema: Option<&'a ExtractionSchema>,
    /// Field-sets already extracted by the collaborator, as raw JSON.
    pub structured_json: Option<&'a str>,
    pub defaults: &'a RecordDefaults,
    pub denylist: &'a Denylist,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Structured,
    SegmentedBlocks,
    NameAnchored,
}

/// Strategies in the order they are attempted.
pub const DEFAULT_CHAIN: &[Strategy] = &[
    Strategy::Structured,
    Strategy::SegmentedBlocks,
    Strategy::NameAnchored,
];

impl Strategy {
    pub fn run(self, markup: &str, ctx: &ExtractContext) -> Result<Vec<FieldSet>, ExtractionFailure> {
        match self {
            Strategy::Structured => match (ctx.structured_json, ctx.schema) {
                (Some(json), _) => schema::parse_structured_json(json),
                (None, Some(schema)) => selector::apply_schema(markup, schema),
                (None, None) => Err(ExtractionFailure::NoSchema),
            },
            Strategy::SegmentedBlocks => blocks::segmented_blocks(markup),
            Strategy::NameAnchored => blocks::name_anchored(markup),
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Strategy::Structured => "structured",
            Strategy::SegmentedBlocks => "segmented-block",
            Strategy::NameAnchored => "name-anchored",
        })
    }
}

/// Result of running the strategy chain over one page.
#[derive(Debug)]
pub struct PageExtraction {
    pub records: Vec<PractitionerRecord>,
    /// Strategy whose output was kept; `None` when every strategy came up empty.
    pub strategy: Option<Strategy>,
    pub failures: Vec<(Strategy, ExtractionFailure)>,
}

/// Number of strict name headings carrying a plausible practitioner name.
pub fn count_name_headings(markup: &str, denylist: &Denylist) -> usize {
    blocks::name_anchors(markup)
        .iter()
        .map(|a| text::normalize(&a.raw_name))
        .filter(|n| !n.is_empty() && !denylist.matches(n))
        .count()
}

fn validate(sets: Vec<FieldSet>, ctx: &ExtractContext) -> Vec<PractitionerRecord> {
    sets.into_iter()
        .filter_map(|fs| fs.into_record(ctx.defaults, ctx.denylist, ctx.page_url))
        .collect()
}

/// Run `chain` over `markup`; the first strategy yielding at least one valid
/// record wins.
///
/// A structured result smaller than the independent heading count is
/// compared against the segmented-block pass, and whichever count is closer
/// to the heading count is kept (ties keep the structured result).
pub fn extract_with(markup: &str, ctx: &ExtractContext, chain: &[Strategy]) -> PageExtraction {
    let mut failures = Vec::new();
    let headings = count_name_headings(markup, ctx.denylist);

    for &strategy in chain {
        let sets = match strategy.run(markup, ctx) {
            Ok(sets) => sets,
            Err(e) => {
                debug!("{} pass failed on {}: {}", strategy, ctx.page_url, e);
                failures.push((strategy, e));
                continue;
            }
        };
        let records = validate(sets, ctx);
        if records.is_empty() {
            failures.push((strategy, ExtractionFailure::NoMatches("validated")));
            continue;
        }

        if strategy == Strategy::Structured && records.len() < headings {
            if let Ok(alt_sets) = Strategy::SegmentedBlocks.run(markup, ctx) {
                let alt = validate(alt_sets, ctx);
                if headings.abs_diff(alt.len()) < headings.abs_diff(records.len()) {
                    debug!(
                        "structured pass found {} of {} headings, keeping segmented-block pass ({})",
                        records.len(),
                        headings,
                        alt.len()
                    );
                    return PageExtraction {
                        records: alt,
                        strategy: Some(Strategy::SegmentedBlocks),
                        failures,
                    };
                }
            }
        }

        trace!("{} pass kept {} records", strategy, records.len());
        return PageExtraction {
            records,
            strategy: Some(strategy),
            failures,
        };
    }

    PageExtraction {
        records: Vec::new(),
        strategy: None,
        failures,
    }
}

pub fn extract_page(markup: &str, ctx: &ExtractContext) -> PageExtraction {
    extract_with(markup, ctx, DEFAULT_CHAIN)
}
