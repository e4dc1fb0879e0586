use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::{error, info};

use crate::config::OutputConfig;
use crate::error::ScrapeError;
use crate::record::{PractitionerRecord, FIELD_NAMES};

// ── JSON ──

/// Pretty-printed array, 2-space indent, non-ASCII kept as UTF-8.
pub fn save_json(records: &[PractitionerRecord], path: &Path) -> Result<(), ScrapeError> {
    let persist = |source: io::Error| ScrapeError::Persistence {
        path: path.to_path_buf(),
        source,
    };
    let file = File::create(path).map_err(persist)?;
    let mut w = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut w, records).map_err(|e| persist(e.into()))?;
    w.flush().map_err(persist)
}

pub fn load_json(path: &Path) -> anyhow::Result<Vec<PractitionerRecord>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

// ── CSV ──

fn needs_quotes(field: &str) -> bool {
    field.contains(',') || field.contains('"') || field.contains('\n') || field.contains('\r')
}

/// Write one RFC-4180 row terminated by CRLF.
pub fn write_row<W: Write>(mut w: W, row: &[String]) -> io::Result<()> {
    let mut first = true;
    for cell in row {
        if !first {
            w.write_all(b",")?;
        } else {
            first = false;
        }
        if needs_quotes(cell) {
            write!(w, "\"{}\"", cell.replace('"', "\"\""))?;
        } else {
            w.write_all(cell.as_bytes())?;
        }
    }
    w.write_all(b"\r\n")
}

/// Header row plus one row per record; written even when `records` is empty.
pub fn save_csv(records: &[PractitionerRecord], path: &Path) -> Result<(), ScrapeError> {
    let persist = |source: io::Error| ScrapeError::Persistence {
        path: path.to_path_buf(),
        source,
    };
    let file = File::create(path).map_err(persist)?;
    let mut w = BufWriter::new(file);
    let header: Vec<String> = FIELD_NAMES.iter().map(|s| s.to_string()).collect();
    write_row(&mut w, &header).map_err(persist)?;
    for r in records {
        write_row(&mut w, &r.to_row()).map_err(persist)?;
    }
    w.flush().map_err(persist)
}

/// Write every enabled target. A failing target does not prevent the other
/// from being written; the failures are returned.
pub fn write_outputs(records: &[PractitionerRecord], targets: &OutputConfig) -> Vec<ScrapeError> {
    let mut failures = Vec::new();
    let jobs: [(Option<&PathBuf>, fn(&[PractitionerRecord], &Path) -> Result<(), ScrapeError>); 2] = [
        (targets.json_file.as_ref(), save_json),
        (targets.csv_file.as_ref(), save_csv),
    ];
    for (path, save) in jobs {
        let Some(path) = path else { continue };
        match save(records, path) {
            Ok(()) => info!("Saved {} practitioners to {}", records.len(), path.display()),
            Err(e) => {
                error!("{}", e);
                failures.push(e);
            }
        }
    }
    failures
}

// ── summary ──

/// Human-readable run summary: totals, specialty counts and the first
/// three records.
pub fn format_summary(records: &[PractitionerRecord], pages_attempted: usize, pages_failed: usize) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "\n=== SCRAPING SUMMARY ===");
    let _ = writeln!(out, "Total practitioners found: {}", records.len());
    let _ = writeln!(out, "Pages scraped: {} ({} failed)", pages_attempted, pages_failed);
    if records.is_empty() {
        return out;
    }

    let mut by_specialty: HashMap<&str, usize> = HashMap::new();
    for r in records {
        *by_specialty.entry(r.specialty.as_deref().unwrap_or("-")).or_default() += 1;
    }
    let mut counts: Vec<(&str, usize)> = by_specialty.into_iter().collect();
    counts.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
    let _ = writeln!(out, "\nSpecialties:");
    for (specialty, n) in counts {
        let _ = writeln!(out, "  {:>4}  {}", n, specialty);
    }

    let _ = writeln!(out, "\nFirst {} practitioners:", records.len().min(3));
    for (i, r) in records.iter().take(3).enumerate() {
        let _ = writeln!(out, "{}. {}", i + 1, r.name);
        let _ = writeln!(out, "   Specialty: {}", r.specialty.as_deref().unwrap_or("-"));
        let _ = writeln!(out, "   Address: {}", r.address.as_deref().unwrap_or("-"));
        if let Some(rating) = &r.rating {
            let _ = writeln!(out, "   Rating: {}", rating);
        }
        if let Some(url) = &r.profile_url {
            let _ = writeln!(out, "   URL: {}", url);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<PractitionerRecord> {
        vec![
            PractitionerRecord {
                name: "Dr Natanel BENABOU".into(),
                specialty: Some("Gastro-entérologue et hépatologue".into()),
                address: Some("24 Boulevard de Picpus, 75012 Paris".into()),
                distance_text: Some("0,8 km".into()),
                sector_info: Some("Conventionné secteur 1".into()),
                profile_url: Some("https://example.test/gastro/paris/natanel-benabou".into()),
                rating: None,
            },
            PractitionerRecord {
                name: "Centre \"Daumesnil\"".into(),
                specialty: Some("Unknown".into()),
                address: None,
                distance_text: None,
                sector_info: None,
                profile_url: None,
                rating: Some("4.5/5".into()),
            },
        ]
    }

    #[test]
    fn csv_quoting() {
        let mut buf = Vec::new();
        write_row(&mut buf, &["a".into(), "b,c".into(), "say \"hi\"".into(), "".into()]).unwrap();
        assert_eq!(String::from_utf8(buf).unwrap(), "a,\"b,c\",\"say \"\"hi\"\"\",\r\n");
    }

    #[test]
    fn csv_file_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        save_csv(&sample(), &path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.split("\r\n").collect();
        assert_eq!(lines[0], "name,specialty,address,distance,sector_info,profile_url,rating");
        assert!(lines[1].starts_with("Dr Natanel BENABOU,Gastro-entérologue et hépatologue,\"24 Boulevard"));
        assert_eq!(lines[2], "\"Centre \"\"Daumesnil\"\"\",Unknown,,,,,4.5/5");
        assert_eq!(lines.len(), 4);
    }

    #[test]
    fn empty_results_still_written() {
        let dir = tempfile::tempdir().unwrap();
        let targets = OutputConfig {
            json_file: Some(dir.path().join("out.json")),
            csv_file: Some(dir.path().join("out.csv")),
        };
        assert!(write_outputs(&[], &targets).is_empty());
        assert_eq!(std::fs::read_to_string(dir.path().join("out.json")).unwrap(), "[]");
        assert_eq!(
            std::fs::read_to_string(dir.path().join("out.csv")).unwrap(),
            "name,specialty,address,distance,sector_info,profile_url,rating\r\n"
        );
    }

    #[test]
    fn json_layout_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.json");
        let records = sample();
        save_json(&records, &path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("\n  {\n    \"name\": \"Dr Natanel BENABOU\""));
        assert!(text.contains("Gastro-entérologue"));
        assert!(text.contains("\"distance\": \"0,8 km\""));
        assert!(text.contains("\"address\": null"));

        assert_eq!(load_json(&path).unwrap(), records);
    }

    #[test]
    fn one_failing_target_does_not_block_the_other() {
        let dir = tempfile::tempdir().unwrap();
        let targets = OutputConfig {
            json_file: Some(dir.path().join("missing-dir").join("out.json")),
            csv_file: Some(dir.path().join("out.csv")),
        };
        let failures = write_outputs(&sample(), &targets);
        assert_eq!(failures.len(), 1);
        assert!(matches!(failures[0], ScrapeError::Persistence { .. }));
        assert!(dir.path().join("out.csv").exists());
    }

    #[test]
    fn summary_lists_specialties_and_first_records() {
        let text = format_summary(&sample(), 3, 1);
        assert!(text.contains("Total practitioners found: 2"));
        assert!(text.contains("Pages scraped: 3 (1 failed)"));
        assert!(text.contains("Gastro-entérologue et hépatologue"));
        assert!(text.contains("1. Dr Natanel BENABOU"));
        assert!(text.contains("Rating: 4.5/5"));
    }
}
