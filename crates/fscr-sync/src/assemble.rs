//! Builds the canonical stall for one group from its representative, the group
//! unions and the resolved media reference.

use chrono::{DateTime, Utc};
use fscr_adapters::SeedStall;
use fscr_core::normalize::{
    collapse_whitespace, content_hash, identity_key, sha256_hex, short_hash, slugify, source_key,
    EntityKind,
};
use fscr_core::{CanonicalStall, Coordinates, Location, SourceRecord, StallStatus};
use serde::Serialize;

use crate::associate::{canonical_media_url, parse_media_reference, MediaAssociation};
use crate::group::{union_addresses, union_values, AddressCandidate, RecordGroup};
use crate::tags::TimeCategoryRules;

const HEURISTIC_MATCH_BOOST: f64 = 2.0;

pub fn location_id(stall_id: &str, address: &str) -> String {
    content_hash(
        EntityKind::Location,
        &format!("{stall_id}|{}", identity_key(address, "addr")),
    )
}

fn trimmed(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
}

fn build_locations(
    stall_id: &str,
    addresses: Vec<AddressCandidate>,
    primary_address: &str,
    media_url: Option<&str>,
) -> Vec<Location> {
    let primary_key = identity_key(primary_address, "addr");
    let primary_index = addresses
        .iter()
        .position(|a| identity_key(&a.address, "addr") == primary_key)
        .unwrap_or(0);

    addresses
        .into_iter()
        .enumerate()
        .map(|(i, candidate)| Location {
            id: location_id(stall_id, &candidate.address),
            stall_id: stall_id.to_string(),
            address: candidate.address,
            coordinates: candidate.coordinates,
            media_url: media_url.map(String::from),
            is_primary: i == primary_index,
            is_active: true,
        })
        .collect()
}

#[derive(Serialize)]
struct LocationView<'a> {
    id: &'a str,
    address: &'a str,
    coordinates: Option<Coordinates>,
    media_url: Option<&'a str>,
    is_primary: bool,
}

/// Externally visible fields only. Rank, slug, debug hashes, status and sync time stay out.
#[derive(Serialize)]
struct PayloadView<'a> {
    name: &'a str,
    cuisine_id: &'a str,
    cuisine_label: &'a str,
    country: &'a str,
    episode_number: Option<u32>,
    dish_name: Option<&'a str>,
    price: Option<f64>,
    host_rating: Option<f64>,
    guest_rating: Option<f64>,
    opening_hours: Option<&'a str>,
    time_categories: &'a [String],
    hits: &'a [String],
    misses: &'a [String],
    media_title: Option<&'a str>,
    media_url: Option<&'a str>,
    media_id: Option<&'a str>,
    awards: &'a [String],
    locations: Vec<LocationView<'a>>,
}

pub fn payload_hash(stall: &CanonicalStall) -> String {
    let view = PayloadView {
        name: &stall.name,
        cuisine_id: &stall.cuisine_id,
        cuisine_label: &stall.cuisine_label,
        country: &stall.country,
        episode_number: stall.episode_number,
        dish_name: stall.dish_name.as_deref(),
        price: stall.price,
        host_rating: stall.host_rating,
        guest_rating: stall.guest_rating,
        opening_hours: stall.opening_hours.as_deref(),
        time_categories: &stall.time_categories,
        hits: &stall.hits,
        misses: &stall.misses,
        media_title: stall.media_title.as_deref(),
        media_url: stall.media_url.as_deref(),
        media_id: stall.media_id.as_deref(),
        awards: &stall.awards,
        locations: stall
            .locations
            .iter()
            .map(|l| LocationView {
                id: &l.id,
                address: &l.address,
                coordinates: l.coordinates,
                media_url: l.media_url.as_deref(),
                is_primary: l.is_primary,
            })
            .collect(),
    };
    // Serializing plain structs of strings and numbers cannot fail.
    let bytes = serde_json::to_vec(&view).unwrap_or_default();
    sha256_hex(&bytes)
}

fn inputs_hash(records: &[SourceRecord]) -> String {
    let mut keys: Vec<&str> = records.iter().map(|r| r.row_key.as_str()).collect();
    keys.sort_unstable();
    short_hash(&keys.join("\n"), 16)
}

fn media_hash(media_id: Option<&str>) -> String {
    short_hash(media_id.unwrap_or_default(), 16)
}

/// Canonical stall for one group, or `None` when the group has no usable address.
pub fn assemble_stall(
    group: &RecordGroup,
    representative: &SourceRecord,
    completeness: u32,
    association: Option<&MediaAssociation>,
    rules: &TimeCategoryRules,
    synced_at: DateTime<Utc>,
) -> Option<CanonicalStall> {
    let addresses = union_addresses(&group.records);
    if addresses.is_empty() {
        return None;
    }

    let stall_id = content_hash(EntityKind::Stall, &group.source_key);
    let media_url = association.map(|a| a.media_url.clone());
    let locations = build_locations(
        &stall_id,
        addresses,
        &representative.address,
        media_url.as_deref(),
    );
    let primary_address = locations
        .iter()
        .find(|l| l.is_primary)
        .map(|l| l.address.clone())
        .unwrap_or_default();

    let opening_hours = trimmed(&representative.opening_hours);
    let time_categories = opening_hours
        .as_deref()
        .map(|hours| rules.categorize(hours))
        .unwrap_or_default();

    let mut rank_score = f64::from(completeness);
    if association.is_some_and(|a| a.method.is_heuristic()) {
        rank_score += HEURISTIC_MATCH_BOOST;
    }

    let mut stall = CanonicalStall {
        id: stall_id,
        source_key: group.source_key.clone(),
        slug: slugify(&representative.name),
        name: collapse_whitespace(&representative.name),
        cuisine_id: identity_key(&representative.cuisine, "cuisine"),
        cuisine_label: representative.cuisine.trim().to_string(),
        country: representative.country.trim().to_uppercase(),
        primary_address,
        episode_number: representative.episode_number,
        dish_name: trimmed(&representative.dish_name),
        price: representative.price,
        host_rating: representative.host_rating,
        guest_rating: representative.guest_rating,
        opening_hours,
        time_categories,
        hits: union_values(group.records.iter().map(|r| &r.hits)),
        misses: union_values(group.records.iter().map(|r| &r.misses)),
        media_title: association.and_then(|a| a.media_title.clone()),
        media_url,
        media_id: association.map(|a| a.media_id.clone()),
        awards: union_values(group.records.iter().map(|r| &r.awards)),
        status: StallStatus::Active,
        rank_score,
        inputs_hash: inputs_hash(&group.records),
        media_hash: media_hash(association.map(|a| a.media_id.as_str())),
        payload_hash: String::new(),
        locations,
        last_synced_at: synced_at,
    };
    stall.payload_hash = payload_hash(&stall);
    Some(stall)
}

/// Carries the stored media link onto a stall assembled without a media catalog.
///
/// A stall with no media gets the persisted id, url and title; one that resolved
/// the same id from an explicit reference keeps the persisted catalog title.
/// Returns whether anything was carried over.
pub fn retain_persisted_media(stall: &mut CanonicalStall, persisted: &CanonicalStall) -> bool {
    let Some(persisted_id) = persisted.media_id.as_deref() else {
        return false;
    };
    match stall.media_id.as_deref() {
        None => {
            stall.media_id = Some(persisted_id.to_string());
            stall.media_url = persisted.media_url.clone();
            stall.media_title = persisted.media_title.clone();
            stall.media_hash = media_hash(Some(persisted_id));
            stall.rank_score += HEURISTIC_MATCH_BOOST;
            for location in &mut stall.locations {
                location.media_url = stall.media_url.clone();
            }
        }
        Some(id) if id == persisted_id && persisted.media_title.is_some() => {
            if stall.media_title == persisted.media_title {
                return false;
            }
            stall.media_title = persisted.media_title.clone();
        }
        Some(_) => return false,
    }
    stall.payload_hash = payload_hash(stall);
    true
}

/// Turns a fallback seed entry into a canonical stall with derived ids and hashes.
pub fn seed_to_stall(
    seed: &SeedStall,
    rules: &TimeCategoryRules,
    synced_at: DateTime<Utc>,
) -> Option<CanonicalStall> {
    if seed.name.trim().is_empty() {
        return None;
    }
    let key = source_key(&seed.name, &seed.country, &seed.cuisine);

    let mut addresses: Vec<AddressCandidate> = Vec::new();
    for location in &seed.locations {
        let address = collapse_whitespace(&location.address);
        let identity = identity_key(&address, "addr");
        let seen = addresses
            .iter()
            .any(|a| identity_key(&a.address, "addr") == identity);
        if identity.is_empty() || seen {
            continue;
        }
        addresses.push(AddressCandidate {
            address,
            coordinates: location.coordinates,
        });
    }
    if addresses.is_empty() {
        return None;
    }
    let primary = seed
        .locations
        .iter()
        .find(|l| l.is_primary)
        .map(|l| l.address.clone())
        .unwrap_or_default();

    let media_id = seed
        .media_id
        .clone()
        .or_else(|| seed.media_url.as_deref().and_then(parse_media_reference));
    let media_url = seed
        .media_url
        .clone()
        .or_else(|| media_id.as_deref().map(canonical_media_url));

    let stall_id = content_hash(EntityKind::Stall, &key);
    let locations = build_locations(&stall_id, addresses, &primary, media_url.as_deref());
    let primary_address = locations
        .iter()
        .find(|l| l.is_primary)
        .map(|l| l.address.clone())
        .unwrap_or_default();
    let opening_hours = trimmed(&seed.opening_hours);
    let time_categories = opening_hours
        .as_deref()
        .map(|hours| rules.categorize(hours))
        .unwrap_or_default();

    let mut stall = CanonicalStall {
        id: stall_id,
        source_key: key.clone(),
        slug: slugify(&seed.name),
        name: seed.name.trim().to_string(),
        cuisine_id: identity_key(&seed.cuisine, "cuisine"),
        cuisine_label: seed.cuisine.trim().to_string(),
        country: seed.country.trim().to_uppercase(),
        primary_address,
        episode_number: seed.episode_number,
        dish_name: trimmed(&seed.dish_name),
        price: seed.price,
        host_rating: seed.host_rating,
        guest_rating: seed.guest_rating,
        opening_hours,
        time_categories,
        hits: union_values([&seed.hits]),
        misses: union_values([&seed.misses]),
        media_title: trimmed(&seed.media_title),
        media_url,
        media_hash: media_hash(media_id.as_deref()),
        media_id,
        awards: union_values([&seed.awards]),
        status: StallStatus::Active,
        rank_score: 0.0,
        inputs_hash: short_hash(&format!("seed:{key}"), 16),
        payload_hash: String::new(),
        locations,
        last_synced_at: synced_at,
    };
    stall.payload_hash = payload_hash(&stall);
    Some(stall)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::associate::AssociationMethod;
    use crate::group::{group_records, select_representative};
    use fscr_adapters::SeedLocation;

    fn synced_at() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T04:00:00Z")
            .expect("ts")
            .with_timezone(&Utc)
    }

    fn record(row_key: &str, address: &str) -> SourceRecord {
        SourceRecord {
            row_key: row_key.into(),
            name: "Hill Street Tai Hwa".into(),
            address: address.into(),
            cuisine: "Teochew".into(),
            country: "sg".into(),
            ..Default::default()
        }
    }

    fn hint_association() -> MediaAssociation {
        MediaAssociation {
            media_id: "HSTHwa00001".into(),
            media_url: canonical_media_url("HSTHwa00001"),
            media_title: Some("Hill Street Tai Hwa Pork Noodle | Episode 3".into()),
            method: AssociationMethod::Hint,
            score: 104,
        }
    }

    fn assemble(
        records: Vec<SourceRecord>,
        association: Option<&MediaAssociation>,
    ) -> Option<CanonicalStall> {
        let grouping = group_records(records);
        let group = &grouping.groups[0];
        let (rep, score) = select_representative(&group.records).unwrap();
        let rules = TimeCategoryRules::builtin();
        assemble_stall(group, rep, score, association, &rules, synced_at())
    }

    fn at(address: &str) -> CanonicalStall {
        assemble(vec![record("a", address)], None).unwrap()
    }

    #[test]
    fn primary_location_follows_the_representative_address() {
        let a = record("a", "Blk 51 Old Airport Rd");
        let mut b = record("b", "466 Crawford Lane #01-12");
        b.dish_name = Some("Bak Chor Mee".into());
        b.opening_hours = Some("9:30am - 9pm".into());

        let stall = assemble(vec![a, b], None).unwrap();
        assert_eq!(stall.locations.len(), 2);
        assert_eq!(stall.primary_address, "466 Crawford Lane #01-12");
        assert_eq!(stall.locations.iter().filter(|l| l.is_primary).count(), 1);
        assert!(stall.locations[1].is_primary);
        assert_eq!(stall.country, "SG");
        assert_eq!(stall.cuisine_id, "teochew");
        assert_eq!(stall.time_categories, vec!["breakfast", "lunch", "dinner"]);
        assert_eq!(stall.rank_score, 2.0);
    }

    #[test]
    fn group_without_addresses_is_dropped() {
        let stall = assemble(vec![record("a", ""), record("b", "   ")], None);
        assert!(stall.is_none());
    }

    #[test]
    fn locations_inherit_the_stall_media_link_and_heuristics_boost_rank() {
        let association = hint_association();
        let records = vec![record("a", "466 Crawford Lane")];
        let stall = assemble(records, Some(&association)).unwrap();
        assert_eq!(stall.media_id.as_deref(), Some("HSTHwa00001"));
        assert_eq!(stall.locations[0].media_url, stall.media_url);
        assert_eq!(stall.rank_score, 2.0);
    }

    #[test]
    fn ids_and_hashes_are_stable_across_runs() {
        let first = at("466 Crawford Lane");
        let mut second = at("466 CRAWFORD LANE");
        assert_eq!(first.id, second.id);
        assert_eq!(first.locations[0].id, second.locations[0].id);
        assert_eq!(
            first.id,
            content_hash(EntityKind::Stall, "hill-street-tai-hwa|SG|teochew")
        );

        // Address spelling is externally visible.
        assert_ne!(first.payload_hash, second.payload_hash);

        second.locations[0].address = first.locations[0].address.clone();
        second.primary_address = first.primary_address.clone();
        second.rank_score = 42.0;
        second.last_synced_at = Utc::now();
        assert_eq!(payload_hash(&second), first.payload_hash);
    }

    #[test]
    fn inputs_hash_ignores_row_order() {
        let ab = vec![record("a", "x"), record("b", "y")];
        let ba = vec![record("b", "y"), record("a", "x")];
        let ab = assemble(ab, None).unwrap();
        let ba = assemble(ba, None).unwrap();
        assert_eq!(ab.inputs_hash, ba.inputs_hash);
        assert_ne!(ab.inputs_hash, ab.media_hash);
    }

    #[test]
    fn seed_entries_become_canonical_stalls() {
        let seed = SeedStall {
            name: "Hawker Chan".into(),
            cuisine: "Cantonese".into(),
            country: "SG".into(),
            episode_number: None,
            dish_name: Some("Soya Sauce Chicken Rice".into()),
            price: Some(3.5),
            host_rating: None,
            guest_rating: None,
            opening_hours: Some("10am-8pm".into()),
            hits: vec![],
            misses: vec![],
            media_id: Some("HawkerChan1".into()),
            media_url: None,
            media_title: None,
            awards: vec!["Michelin Star 2016".into()],
            locations: vec![
                SeedLocation {
                    address: "78 Smith Street".into(),
                    coordinates: None,
                    is_primary: false,
                },
                SeedLocation {
                    address: "335 Smith Street #02-126".into(),
                    coordinates: None,
                    is_primary: true,
                },
            ],
        };
        let rules = TimeCategoryRules::builtin();
        let stall = seed_to_stall(&seed, &rules, synced_at()).unwrap();
        assert_eq!(stall.source_key, "hawker-chan|SG|cantonese");
        assert_eq!(stall.primary_address, "335 Smith Street #02-126");
        assert_eq!(
            stall.media_url.as_deref(),
            Some("https://www.youtube.com/watch?v=HawkerChan1")
        );
        assert_eq!(stall.slug, "hawker-chan");
    }

    #[test]
    fn han_script_addresses_stay_distinct() {
        let stall = assemble(
            vec![
                record("a", "牛车水大厦"),
                record("b", "大华路"),
                record("c", "牛车水大厦 "),
            ],
            None,
        )
        .unwrap();
        assert_eq!(stall.locations.len(), 2);
        assert_ne!(stall.locations[0].id, stall.locations[1].id);
        assert_eq!(stall.primary_address, "牛车水大厦");
    }

    #[test]
    fn persisted_heuristic_media_is_carried_over() {
        let association = hint_association();
        let records = vec![record("a", "466 Crawford Lane")];
        let persisted = assemble(records, Some(&association)).unwrap();

        let mut fresh = at("466 Crawford Lane");
        assert!(retain_persisted_media(&mut fresh, &persisted));
        assert_eq!(fresh.media_id, persisted.media_id);
        assert_eq!(fresh.media_title, persisted.media_title);
        assert_eq!(fresh.locations[0].media_url, persisted.media_url);
        assert_eq!(fresh.media_hash, persisted.media_hash);
        assert_eq!(fresh.rank_score, persisted.rank_score);
        assert_eq!(fresh.payload_hash, persisted.payload_hash);
    }

    #[test]
    fn explicit_reference_keeps_the_persisted_catalog_title() {
        let mut persisted = at("466 Crawford Lane");
        persisted.media_id = Some("HSTHwa00001".into());
        persisted.media_title = Some("Hill Street Tai Hwa Pork Noodle | Episode 3".into());

        let mut fresh = at("466 Crawford Lane");
        fresh.media_id = Some("HSTHwa00001".into());
        assert!(retain_persisted_media(&mut fresh, &persisted));
        assert_eq!(fresh.media_title, persisted.media_title);
        assert_eq!(fresh.payload_hash, payload_hash(&fresh));

        let mut other = at("466 Crawford Lane");
        other.media_id = Some("OtherVideo1".into());
        assert!(!retain_persisted_media(&mut other, &persisted));
        assert!(other.media_title.is_none());
        let mut fresh = at("466 Crawford Lane");
        assert!(!retain_persisted_media(&mut fresh, &at("x")));
    }
}
