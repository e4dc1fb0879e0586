use serde::{Deserialize, Serialize};
use tracing::trace;
use url::Url;

use crate::filter::Denylist;
use crate::parser::text::{normalize, normalize_opt};

/// Column order shared by the CSV writer and the JSON field names.
pub const FIELD_NAMES: [&str; 7] = [
    "name",
    "specialty",
    "address",
    "distance",
    "sector_info",
    "profile_url",
    "rating",
];

/// One practitioner listing, normalized and validated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PractitionerRecord {
    pub name: String,
    pub specialty: Option<String>,
    pub address: Option<String>,
    #[serde(rename = "distance")]
    pub distance_text: Option<String>,
    pub sector_info: Option<String>,
    pub profile_url: Option<String>,
    #[serde(default)]
    pub rating: Option<String>,
}

impl PractitionerRecord {
    /// The only mutation a record accepts after construction.
    pub fn set_rating(&mut self, rating: String) {
        let rating = normalize(&rating);
        if !rating.is_empty() {
            self.rating = Some(rating);
        }
    }

    /// Values in [`FIELD_NAMES`] order, absent fields as empty strings.
    pub fn to_row(&self) -> Vec<String> {
        let cell = |v: &Option<String>| v.clone().unwrap_or_default();
        vec![
            self.name.clone(),
            cell(&self.specialty),
            cell(&self.address),
            cell(&self.distance_text),
            cell(&self.sector_info),
            cell(&self.profile_url),
            cell(&self.rating),
        ]
    }
}

/// Caller-supplied values applied while turning field-sets into records.
#[derive(Debug, Clone, Default)]
pub struct RecordDefaults {
    pub fallback_specialty: Option<String>,
}

/// Raw, unvalidated candidate values for one listing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct FieldSet {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub specialty: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default, alias = "distance_text")]
    pub distance: Option<String>,
    #[serde(default, alias = "insurance", alias = "sector")]
    pub sector_info: Option<String>,
    #[serde(default, alias = "url", alias = "href")]
    pub profile_url: Option<String>,
}

impl FieldSet {
    #[cfg(test)]
    pub fn named(name: impl Into<String>) -> Self {
        FieldSet {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    /// Assign a value by schema field name. Unknown names are ignored.
    pub fn set(&mut self, field: &str, value: String) {
        let slot = match field {
            "name" => &mut self.name,
            "specialty" | "speciality" => &mut self.specialty,
            "address" => &mut self.address,
            "distance" | "distance_text" => &mut self.distance,
            "sector_info" | "sector" | "insurance" => &mut self.sector_info,
            "profile_url" | "url" | "href" => &mut self.profile_url,
            _ => return,
        };
        *slot = Some(value);
    }

    /// Normalize and validate. Returns `None` for an empty or denylisted name.
    pub fn into_record(
        self,
        defaults: &RecordDefaults,
        denylist: &Denylist,
        page_url: &str,
    ) -> Option<PractitionerRecord> {
        let name = normalize(self.name.as_deref().unwrap_or_default());
        if name.is_empty() {
            trace!("dropping field-set without a name");
            return None;
        }
        if denylist.matches(&name) {
            trace!("dropping denylisted entry {:?}", name);
            return None;
        }

        let specialty = normalize_opt(self.specialty.as_deref())
            .or_else(|| defaults.fallback_specialty.clone());
        let profile_url = normalize_opt(self.profile_url.as_deref())
            .and_then(|href| resolve_url(page_url, &href));

        Some(PractitionerRecord {
            name,
            specialty,
            address: normalize_opt(self.address.as_deref()),
            distance_text: normalize_opt(self.distance.as_deref()),
            sector_info: normalize_opt(self.sector_info.as_deref()),
            profile_url,
            rating: None,
        })
    }
}

/// Resolve `href` against `base`; `None` when neither is usable.
pub fn resolve_url(base: &str, href: &str) -> Option<String> {
    if let Ok(abs) = Url::parse(href) {
        return matches!(abs.scheme(), "http" | "https").then(|| abs.to_string());
    }
    Url::parse(base)
        .and_then(|b| b.join(href))
        .ok()
        .map(|u| u.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> RecordDefaults {
        RecordDefaults {
            fallback_specialty: Some("Unknown".into()),
        }
    }

    const PAGE: &str = "https://example.test/search?location=paris&page=2";

    #[test]
    fn normalizes_every_field() {
        let fs = FieldSet {
            name: Some("  <b>Dr  Jean</b>\nMARTIN ".into()),
            specialty: Some("<p>Gastro-entérologue</p>".into()),
            address: Some(" 12  Rue de Lyon ".into()),
            distance: Some("3,2\tkm".into()),
            sector_info: Some("Conventionné   secteur 1".into()),
            profile_url: Some("/gastro/paris/jean-martin".into()),
        };
        let rec = fs.into_record(&defaults(), &Denylist::default(), PAGE).unwrap();
        assert_eq!(rec.name, "Dr Jean MARTIN");
        assert_eq!(rec.specialty.as_deref(), Some("Gastro-entérologue"));
        assert_eq!(rec.address.as_deref(), Some("12 Rue de Lyon"));
        assert_eq!(rec.distance_text.as_deref(), Some("3,2 km"));
        assert_eq!(rec.sector_info.as_deref(), Some("Conventionné secteur 1"));
        assert_eq!(
            rec.profile_url.as_deref(),
            Some("https://example.test/gastro/paris/jean-martin")
        );
        assert_eq!(rec.rating, None);
    }

    #[test]
    fn missing_name_is_rejected() {
        let fs = FieldSet {
            specialty: Some("Dermatologue".into()),
            ..Default::default()
        };
        assert!(fs.into_record(&defaults(), &Denylist::default(), PAGE).is_none());
        let blank = FieldSet::named(" <span> </span> ");
        assert!(blank.into_record(&defaults(), &Denylist::default(), PAGE).is_none());
    }

    #[test]
    fn denylisted_name_is_rejected() {
        let fs = FieldSet::named("Questions fréquentes");
        assert!(fs.into_record(&defaults(), &Denylist::default(), PAGE).is_none());
    }

    #[test]
    fn specialty_falls_back() {
        let rec = FieldSet::named("Dr A")
            .into_record(&defaults(), &Denylist::default(), PAGE)
            .unwrap();
        assert_eq!(rec.specialty.as_deref(), Some("Unknown"));

        let rec = FieldSet::named("Dr A")
            .into_record(&RecordDefaults::default(), &Denylist::default(), PAGE)
            .unwrap();
        assert_eq!(rec.specialty, None);
    }

    #[test]
    fn absolute_profile_url_kept() {
        let mut fs = FieldSet::named("Dr A");
        fs.set("profile_url", "https://other.test/dr-a".into());
        let rec = fs.into_record(&defaults(), &Denylist::default(), PAGE).unwrap();
        assert_eq!(rec.profile_url.as_deref(), Some("https://other.test/dr-a"));
    }

    #[test]
    fn javascript_href_dropped() {
        let mut fs = FieldSet::named("Dr A");
        fs.set("profile_url", "javascript:void(0)".into());
        let rec = fs.into_record(&defaults(), &Denylist::default(), PAGE).unwrap();
        assert_eq!(rec.profile_url, None);
    }

    #[test]
    fn set_accepts_aliases() {
        let mut fs = FieldSet::default();
        fs.set("insurance", "Conventionné".into());
        fs.set("speciality", "ORL".into());
        fs.set("unknown_field", "ignored".into());
        assert_eq!(fs.sector_info.as_deref(), Some("Conventionné"));
        assert_eq!(fs.specialty.as_deref(), Some("ORL"));
    }

    #[test]
    fn rating_is_normalized_on_set() {
        let mut rec = FieldSet::named("Dr A")
            .into_record(&defaults(), &Denylist::default(), PAGE)
            .unwrap();
        rec.set_rating("  ".into());
        assert_eq!(rec.rating, None);
        rec.set_rating(" 4.5/5 ".into());
        assert_eq!(rec.rating.as_deref(), Some("4.5/5"));
    }

    #[test]
    fn json_keys_match_field_names() {
        let rec = FieldSet::named("Dr A")
            .into_record(&defaults(), &Denylist::default(), PAGE)
            .unwrap();
        let value = serde_json::to_value(&rec).unwrap();
        let keys: Vec<&str> = value.as_object().unwrap().keys().map(|k| k.as_str()).collect();
        let mut expected = FIELD_NAMES.to_vec();
        expected.sort();
        let mut keys_sorted = keys.clone();
        keys_sorted.sort();
        assert_eq!(keys_sorted, expected);
    }
}
