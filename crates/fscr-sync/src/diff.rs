//! Change classification against the persisted active index, the closure-ratio
//! guardrail and deterministic slug collision handling.

use std::collections::BTreeMap;

use fscr_core::normalize::short_hash;
use fscr_core::{ActiveIndex, CanonicalStall};

const SLUG_SUFFIX_LEN: usize = 6;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    pub new: Vec<CanonicalStall>,
    pub updated: Vec<CanonicalStall>,
    pub unchanged: Vec<String>,
    pub closed: Vec<String>,
}

impl ChangeSet {
    pub fn fresh_total(&self) -> usize {
        self.new.len() + self.updated.len() + self.unchanged.len()
    }
}

/// Splits the fresh set into new/updated/unchanged and lists closures. Output is
/// ordered by source key; a repeated key keeps its first occurrence.
pub fn classify(active: &ActiveIndex, fresh: Vec<CanonicalStall>) -> ChangeSet {
    let mut by_key: BTreeMap<String, CanonicalStall> = BTreeMap::new();
    for stall in fresh {
        by_key.entry(stall.source_key.clone()).or_insert(stall);
    }

    let mut changes = ChangeSet::default();
    for (key, stall) in by_key.iter() {
        match active.get(key) {
            None => changes.new.push(stall.clone()),
            Some(hash) if *hash == stall.payload_hash => changes.unchanged.push(key.clone()),
            Some(_) => changes.updated.push(stall.clone()),
        }
    }
    changes.closed = active
        .keys()
        .filter(|key| !by_key.contains_key(*key))
        .cloned()
        .collect();
    changes
}

pub fn closure_ratio(closed: usize, previous_active: usize) -> f64 {
    if previous_active == 0 {
        return 0.0;
    }
    closed as f64 / previous_active as f64
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GuardrailDecision {
    pub ratio: f64,
    /// Ratio exceeded the maximum over a non-empty previous set.
    pub tripped: bool,
    /// Tripped, but the force flag lets the commit through.
    pub bypassed: bool,
}

impl GuardrailDecision {
    pub fn blocks_commit(&self) -> bool {
        self.tripped && !self.bypassed
    }
}

pub fn evaluate_guardrail(
    closed: usize,
    previous_active: usize,
    max_ratio: f64,
    force: bool,
) -> GuardrailDecision {
    let ratio = closure_ratio(closed, previous_active);
    let tripped = previous_active > 0 && ratio > max_ratio;
    GuardrailDecision {
        ratio,
        tripped,
        bypassed: tripped && force,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlugAdjustment {
    pub source_key: String,
    pub base: String,
    pub assigned: String,
}

fn suffixed(base: &str, source_key: &str, attempt: u32) -> String {
    let suffix = short_hash(&format!("{source_key}#{attempt}"), SLUG_SUFFIX_LEN);
    format!("{base}-{suffix}")
}

/// Assigns final slugs in place. Keys already known to the store keep their
/// persisted slug; the rest are processed in source-key order and take a hash
/// suffix while their base slug belongs to another key.
pub fn resolve_slugs(
    changes: &mut ChangeSet,
    persisted: &BTreeMap<String, String>,
) -> Vec<SlugAdjustment> {
    let mut owners: BTreeMap<String, String> = persisted
        .iter()
        .map(|(key, slug)| (slug.clone(), key.clone()))
        .collect();

    let mut pending: Vec<&mut CanonicalStall> = Vec::new();
    for stall in changes.updated.iter_mut().chain(changes.new.iter_mut()) {
        match persisted.get(&stall.source_key) {
            Some(slug) => stall.slug = slug.clone(),
            None => pending.push(stall),
        }
    }
    pending.sort_by(|a, b| a.source_key.cmp(&b.source_key));

    let mut adjustments = Vec::new();
    for stall in pending {
        let base = stall.slug.clone();
        let mut candidate = base.clone();
        let mut attempt = 1;
        while owners
            .get(&candidate)
            .is_some_and(|owner| *owner != stall.source_key)
        {
            candidate = suffixed(&base, &stall.source_key, attempt);
            attempt += 1;
        }
        owners.insert(candidate.clone(), stall.source_key.clone());
        if candidate != base {
            adjustments.push(SlugAdjustment {
                source_key: stall.source_key.clone(),
                base,
                assigned: candidate.clone(),
            });
        }
        stall.slug = candidate;
    }
    adjustments
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use fscr_core::StallStatus;

    fn stall(key: &str, slug: &str, hash: &str) -> CanonicalStall {
        CanonicalStall {
            id: format!("stall_{key}"),
            source_key: key.into(),
            slug: slug.into(),
            name: slug.into(),
            cuisine_id: "teochew".into(),
            cuisine_label: "Teochew".into(),
            country: "SG".into(),
            primary_address: "1 Market St".into(),
            episode_number: None,
            dish_name: None,
            price: None,
            host_rating: None,
            guest_rating: None,
            opening_hours: None,
            time_categories: vec![],
            hits: vec![],
            misses: vec![],
            media_title: None,
            media_url: None,
            media_id: None,
            awards: vec![],
            status: StallStatus::Active,
            rank_score: 0.0,
            inputs_hash: String::new(),
            media_hash: String::new(),
            payload_hash: hash.into(),
            locations: vec![],
            last_synced_at: Utc::now(),
        }
    }

    fn index(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn classification_covers_all_four_outcomes() {
        let active = index(&[("a", "h1"), ("b", "h2"), ("c", "h3")]);
        let fresh = vec![
            stall("d", "d", "h4"),
            stall("b", "b", "h2-changed"),
            stall("a", "a", "h1"),
            stall("a", "a", "ignored-duplicate"),
        ];
        let changes = classify(&active, fresh);
        assert_eq!(changes.new.len(), 1);
        assert_eq!(changes.new[0].source_key, "d");
        assert_eq!(changes.updated[0].source_key, "b");
        assert_eq!(changes.unchanged, vec!["a".to_string()]);
        assert_eq!(changes.closed, vec!["c".to_string()]);
        assert_eq!(changes.fresh_total(), 3);
    }

    #[test]
    fn guardrail_trips_only_strictly_above_max() {
        let at_limit = evaluate_guardrail(5, 10, 0.5, false);
        assert_eq!(at_limit.ratio, 0.5);
        assert!(!at_limit.tripped);

        let over = evaluate_guardrail(6, 10, 0.5, false);
        assert!(over.tripped && over.blocks_commit());

        let forced = evaluate_guardrail(6, 10, 0.5, true);
        assert!(forced.tripped && forced.bypassed && !forced.blocks_commit());

        let empty_store = evaluate_guardrail(0, 0, 0.5, false);
        assert_eq!(empty_store.ratio, 0.0);
        assert!(!empty_store.tripped);
    }

    #[test]
    fn persisted_slugs_are_kept_and_new_collisions_get_stable_suffixes() {
        let persisted = index(&[("a|SG|x", "tai-hwa"), ("old|SG|x", "ah-seng")]);
        let mut changes = ChangeSet {
            updated: vec![stall("a|SG|x", "renamed", "h")],
            new: vec![
                stall("c|SG|x", "tai-hwa", "h"),
                stall("b|SG|x", "tai-hwa", "h"),
                stall("old|SG|x", "ah-seng-2", "h"),
            ],
            ..Default::default()
        };
        let adjustments = resolve_slugs(&mut changes, &persisted);

        assert_eq!(changes.updated[0].slug, "tai-hwa");
        let slug_of = |key: &str| {
            changes
                .new
                .iter()
                .find(|s| s.source_key == key)
                .map(|s| s.slug.clone())
                .unwrap()
        };
        assert_eq!(slug_of("old|SG|x"), "ah-seng");
        let b = slug_of("b|SG|x");
        let c = slug_of("c|SG|x");
        assert_eq!(b, format!("tai-hwa-{}", short_hash("b|SG|x#1", 6)));
        assert_eq!(c, format!("tai-hwa-{}", short_hash("c|SG|x#1", 6)));
        assert_eq!(adjustments.len(), 2);
        assert_eq!(adjustments[0].source_key, "b|SG|x");

        // Same inputs, same answer.
        let mut again = ChangeSet {
            new: vec![
                stall("c|SG|x", "tai-hwa", "h"),
                stall("b|SG|x", "tai-hwa", "h"),
            ],
            ..Default::default()
        };
        resolve_slugs(&mut again, &persisted);
        assert_eq!(again.new[1].slug, b);
    }

    #[test]
    fn first_new_key_keeps_a_free_base_slug() {
        let mut changes = ChangeSet {
            new: vec![stall("z|SG|x", "satay", "h"), stall("y|SG|x", "satay", "h")],
            ..Default::default()
        };
        let adjustments = resolve_slugs(&mut changes, &BTreeMap::new());
        assert_eq!(changes.new[1].slug, "satay");
        assert_ne!(changes.new[0].slug, "satay");
        assert_eq!(adjustments.len(), 1);
        assert_eq!(adjustments[0].source_key, "z|SG|x");
    }
}
