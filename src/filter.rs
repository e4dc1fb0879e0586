use std::collections::HashSet;

use tracing::debug;

use crate::record::PractitionerRecord;

/// Navigation, footer and help-center labels that show up in name positions.
pub const DEFAULT_DENYLIST: &[&str] = &[
    "Questions fréquentes",
    "Notre entreprise",
    "Centre d'aide",
    "Centre d\u{2019}aide",
    "Mentions légales",
    "Conditions d'utilisation",
    "Conditions générales",
    "Politique de confidentialité",
    "Gestion des cookies",
    "Recrutement",
    "Nos engagements",
    "Trouvez votre spécialiste",
    "Vous êtes professionnel",
    "Doctolib",
];

/// Case-sensitive substring denylist applied to normalized names.
#[derive(Debug, Clone)]
pub struct Denylist {
    entries: Vec<String>,
}

impl Default for Denylist {
    fn default() -> Self {
        Denylist {
            entries: DEFAULT_DENYLIST.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl Denylist {
    /// Built-in entries plus `extra` (blank extras are ignored).
    pub fn with_extra<I, S>(extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut list = Denylist::default();
        for entry in extra {
            let entry: String = entry.into();
            if !entry.trim().is_empty() && !list.entries.contains(&entry) {
                list.entries.push(entry);
            }
        }
        list
    }

    pub fn matches(&self, name: &str) -> bool {
        self.entries.iter().any(|e| name.contains(e.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Drop denylisted names, then drop later repeats of a name already seen.
/// Retained records keep their relative order.
pub fn dedupe(records: Vec<PractitionerRecord>, denylist: &Denylist) -> Vec<PractitionerRecord> {
    let before = records.len();
    let mut seen: HashSet<String> = HashSet::new();
    let kept: Vec<PractitionerRecord> = records
        .into_iter()
        .filter(|r| !r.name.is_empty() && !denylist.matches(&r.name))
        .filter(|r| seen.insert(r.name.clone()))
        .collect();
    if kept.len() != before {
        debug!("dedupe: {} -> {} records", before, kept.len());
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(name: &str) -> PractitionerRecord {
        PractitionerRecord {
            name: name.to_string(),
            specialty: None,
            address: None,
            distance_text: None,
            sector_info: None,
            profile_url: None,
            rating: None,
        }
    }

    fn names(records: &[PractitionerRecord]) -> Vec<&str> {
        records.iter().map(|r| r.name.as_str()).collect()
    }

    #[test]
    fn keeps_first_occurrence_in_order() {
        let input = vec![rec("Dr B"), rec("Dr A"), rec("Dr B"), rec("Dr C"), rec("Dr A")];
        let out = dedupe(input, &Denylist::default());
        assert_eq!(names(&out), ["Dr B", "Dr A", "Dr C"]);
    }

    #[test]
    fn duplicate_dr_a_kept_once() {
        let mut second = rec("Dr A");
        second.address = Some("other".into());
        let out = dedupe(vec![rec("Dr A"), second], &Denylist::default());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].address, None);
    }

    #[test]
    fn denylist_applied_again() {
        let input = vec![rec("Dr A"), rec("Notre entreprise"), rec("Aide Doctolib")];
        let out = dedupe(input, &Denylist::default());
        assert_eq!(names(&out), ["Dr A"]);
    }

    #[test]
    fn denylist_is_case_sensitive_substring() {
        let list = Denylist::default();
        assert!(list.matches("Questions fréquentes patients"));
        assert!(!list.matches("questions fréquentes"));
    }

    #[test]
    fn extra_entries() {
        let list = Denylist::with_extra(["Publicité", " ", "Doctolib"]);
        assert_eq!(list.len(), DEFAULT_DENYLIST.len() + 1);
        assert!(list.matches("Publicité"));
    }

    #[test]
    fn survivors_are_unique_and_allowed() {
        let input: Vec<_> = ["Dr A", "", "Dr B", "Dr A", "Centre d'aide", "Dr C", "Dr B"]
            .iter()
            .map(|n| rec(n))
            .collect();
        let list = Denylist::default();
        let out = dedupe(input, &list);
        let mut seen = HashSet::new();
        for r in &out {
            assert!(!r.name.is_empty());
            assert!(!list.matches(&r.name));
            assert!(seen.insert(r.name.clone()));
        }
        assert_eq!(names(&out), ["Dr A", "Dr B", "Dr C"]);
    }
}
