//! Groups raw rows by source key and picks each group's representative.

use std::collections::HashMap;

use fscr_core::normalize::{collapse_whitespace, identity_key, normalize_for_match, source_key};
use fscr_core::{Coordinates, SourceRecord};

use crate::associate::parse_media_reference;

/// Candidate entity: every row sharing one source key, in first-seen order.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordGroup {
    pub source_key: String,
    pub records: Vec<SourceRecord>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AddressCandidate {
    pub address: String,
    pub coordinates: Option<Coordinates>,
}

#[derive(Debug, Clone, Default)]
pub struct Grouping {
    pub groups: Vec<RecordGroup>,
    /// Rows with a blank name; they cannot form a source key.
    pub skipped_rows: Vec<String>,
}

pub fn group_records(records: impl IntoIterator<Item = SourceRecord>) -> Grouping {
    let mut grouping = Grouping::default();
    let mut index: HashMap<String, usize> = HashMap::new();

    for record in records {
        if record.name.trim().is_empty() {
            grouping.skipped_rows.push(record.row_key);
            continue;
        }
        let key = source_key(&record.name, &record.country, &record.cuisine);
        match index.get(&key) {
            Some(&slot) => grouping.groups[slot].records.push(record),
            None => {
                index.insert(key.clone(), grouping.groups.len());
                grouping.groups.push(RecordGroup {
                    source_key: key,
                    records: vec![record],
                });
            }
        }
    }
    grouping
}

fn has_text(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.trim().is_empty())
}

/// Information-completeness score of a single row.
pub fn completeness_score(record: &SourceRecord) -> u32 {
    [
        has_text(&record.opening_hours),
        has_text(&record.dish_name),
        record
            .media_ref
            .as_deref()
            .and_then(parse_media_reference)
            .is_some(),
        !record.hits.is_empty(),
        !record.misses.is_empty(),
        !record.awards.is_empty(),
        record.host_rating.is_some() || record.guest_rating.is_some(),
    ]
    .into_iter()
    .filter(|present| *present)
    .count() as u32
}

/// Highest-scoring row; ties go to the earliest row.
pub fn select_representative(records: &[SourceRecord]) -> Option<(&SourceRecord, u32)> {
    records.iter().fold(None, |best, record| {
        let score = completeness_score(record);
        match best {
            Some((_, best_score)) if best_score >= score => best,
            _ => Some((record, score)),
        }
    })
}

/// Distinct non-empty addresses across the group, first spelling wins.
pub fn union_addresses(records: &[SourceRecord]) -> Vec<AddressCandidate> {
    let mut seen: HashMap<String, usize> = HashMap::new();
    let mut out: Vec<AddressCandidate> = Vec::new();
    for record in records {
        let address = collapse_whitespace(&record.address);
        let key = identity_key(&address, "addr");
        if key.is_empty() {
            continue;
        }
        match seen.get(&key) {
            Some(&slot) => {
                if out[slot].coordinates.is_none() {
                    out[slot].coordinates = record.coordinates;
                }
            }
            None => {
                seen.insert(key, out.len());
                out.push(AddressCandidate {
                    address,
                    coordinates: record.coordinates,
                });
            }
        }
    }
    out
}

/// Case-insensitive union of a list-valued field, first spelling wins.
pub fn union_values<'a>(lists: impl IntoIterator<Item = &'a Vec<String>>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for value in lists.into_iter().flatten() {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            continue;
        }
        if seen.insert(normalize_for_match(trimmed)) {
            out.push(trimmed.to_string());
        }
    }
    out
}
