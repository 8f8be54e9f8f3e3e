//! Attaches a video-catalog reference to a stall.
//!
//! Strict priority: an explicit reference on any row wins outright, then free-text
//! hints are scored against catalog titles, then the stall name is tried. Each
//! heuristic has an absolute floor; the name fallback also needs a clear margin
//! over the runner-up. No confident match means no reference.

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::Context;
use fscr_core::normalize::{identity_form, normalize_for_match, tokens};
use fscr_core::{MediaRecord, SourceRecord};
use serde::{Deserialize, Serialize};

const MEDIA_ID_LEN: usize = 11;
const MEDIA_HOSTS: &[&str] = &["youtube.com", "www.youtube.com", "m.youtube.com"];

const GENERIC_TERMS: &str = "stall stalls food foods kitchen restaurant house shop famous \
    original best noodle noodles rice chicken pork duck fish soup curry coffee cafe eating \
    eatery hawker centre center market corner delight delights street road lane traditional \
    authentic handmade homemade kopitiam";

/// Thresholds and word lists for association. Loaded from `rules/matching.yaml` when present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchConfig {
    pub exact_score: u32,
    pub contains_score: u32,
    pub episode_bonus: u32,
    pub hint_min_score: u32,
    pub name_min_score: u32,
    pub name_min_margin: u32,
    pub min_hint_word_len: usize,
    pub min_name_word_len: usize,
    pub restricted_keywords: Vec<String>,
    pub generic_terms: Vec<String>,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            exact_score: 100,
            contains_score: 50,
            episode_bonus: 25,
            hint_min_score: 3,
            name_min_score: 2,
            name_min_margin: 1,
            min_hint_word_len: 3,
            min_name_word_len: 4,
            restricted_keywords: vec!["members".into()],
            generic_terms: GENERIC_TERMS
                .split_whitespace()
                .map(String::from)
                .collect(),
        }
    }
}

impl MatchConfig {
    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        serde_yaml::from_str(yaml).context("parsing matching config")
    }

    /// `rules/matching.yaml` under `root`, or the defaults when the file is absent.
    pub fn from_workspace_root(root: &Path) -> anyhow::Result<Self> {
        let path = root.join("rules").join("matching.yaml");
        if !path.exists() {
            return Ok(Self::default());
        }
        let yaml = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&yaml).with_context(|| format!("parsing {}", path.display()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssociationMethod {
    Explicit,
    Hint,
    Name,
}

impl AssociationMethod {
    pub fn is_heuristic(&self) -> bool {
        !matches!(self, Self::Explicit)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MediaAssociation {
    pub media_id: String,
    pub media_url: String,
    pub media_title: Option<String>,
    pub method: AssociationMethod,
    pub score: u32,
}

fn is_media_id(candidate: &str) -> bool {
    candidate.len() == MEDIA_ID_LEN
        && candidate
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Media id of a syntactically valid reference: a bare id or a catalog URL.
pub fn parse_media_reference(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if is_media_id(raw) {
        return Some(raw.to_string());
    }

    let rest = raw
        .strip_prefix("https://")
        .or_else(|| raw.strip_prefix("http://"))?;
    let (host, path) = rest.split_once('/').unwrap_or((rest, ""));
    let host = host.to_ascii_lowercase();
    let (path, query) = path.split_once('?').unwrap_or((path, ""));

    let id = if host == "youtu.be" {
        path.split('/').next()
    } else if MEDIA_HOSTS.contains(&host.as_str()) {
        match path.split_once('/') {
            Some(("shorts" | "embed" | "live", tail)) => tail.split('/').next(),
            _ if path == "watch" => query
                .split('&')
                .find_map(|pair| pair.strip_prefix("v=")),
            _ => None,
        }
    } else {
        None
    };

    id.filter(|id| is_media_id(id)).map(String::from)
}

pub fn canonical_media_url(media_id: &str) -> String {
    format!("https://www.youtube.com/watch?v={media_id}")
}

fn title_for(catalog: &[MediaRecord], media_id: &str) -> Option<String> {
    catalog
        .iter()
        .find(|m| m.id == media_id)
        .map(|m| m.title.clone())
}

fn explicit_reference(
    records: &[SourceRecord],
    catalog: &[MediaRecord],
) -> Option<MediaAssociation> {
    records.iter().find_map(|record| {
        let raw = record.media_ref.as_deref()?;
        let media_id = parse_media_reference(raw)?;
        let raw = raw.trim();
        let media_url = if raw == media_id {
            canonical_media_url(&media_id)
        } else {
            raw.to_string()
        };
        let media_title = title_for(catalog, &media_id).or_else(|| {
            record
                .media_title
                .as_deref()
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(String::from)
        });
        Some(MediaAssociation {
            media_id,
            media_url,
            media_title,
            method: AssociationMethod::Explicit,
            score: 0,
        })
    })
}

/// Free-text hints harvested from every row: titles and unparseable link fields.
pub fn harvest_hints(records: &[SourceRecord]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut hints = Vec::new();
    for record in records {
        let candidates = [record.media_title.as_deref(), record.media_ref.as_deref()];
        for hint in candidates.into_iter().flatten() {
            let hint = hint.trim();
            if hint.is_empty() || parse_media_reference(hint).is_some() {
                continue;
            }
            if seen.insert(normalize_for_match(hint)) {
                hints.push(hint.to_string());
            }
        }
    }
    hints
}

/// `episode 12`, `ep 12`, `ep12`, `episode #12` (the `#` is already stripped by tokenizing).
fn episode_number(tokens: &[String]) -> Option<u32> {
    for (i, token) in tokens.iter().enumerate() {
        if matches!(token.as_str(), "episode" | "ep" | "eps") {
            if let Some(n) = tokens.get(i + 1).and_then(|t| t.parse().ok()) {
                return Some(n);
            }
        }
        for prefix in ["episode", "ep"] {
            let digits = token.strip_prefix(prefix);
            if let Some(n) = digits.and_then(|rest| rest.parse().ok()) {
                return Some(n);
            }
        }
    }
    None
}

/// Score of one hint against one title; `None` when a restricted keyword disqualifies it.
pub fn score_hint(hint: &str, title: &str, config: &MatchConfig) -> Option<u32> {
    let hint_tokens = tokens(hint);
    let title_tokens = tokens(title);

    for keyword in &config.restricted_keywords {
        let keyword = identity_form(keyword);
        if hint_tokens.contains(&keyword) && !title_tokens.contains(&keyword) {
            return None;
        }
    }

    let hint_text = hint_tokens.join(" ");
    let title_text = title_tokens.join(" ");
    if hint_text.is_empty() || title_text.is_empty() {
        return Some(0);
    }

    let mut score = if hint_text == title_text {
        config.exact_score
    } else if format!(" {title_text} ").contains(&format!(" {hint_text} "))
        || format!(" {hint_text} ").contains(&format!(" {title_text} "))
    {
        config.contains_score
    } else {
        0
    };

    if let (Some(a), Some(b)) = (episode_number(&hint_tokens), episode_number(&title_tokens)) {
        if a == b {
            score += config.episode_bonus;
        }
    }

    let significant = |t: &&String| t.chars().count() >= config.min_hint_word_len;
    let hint_words: BTreeSet<&String> = hint_tokens.iter().filter(significant).collect();
    let title_words: BTreeSet<&String> = title_tokens.iter().filter(significant).collect();
    score += hint_words.intersection(&title_words).count() as u32;

    Some(score)
}

fn match_hints(
    hints: &[String],
    catalog: &[MediaRecord],
    config: &MatchConfig,
) -> Option<(usize, u32)> {
    let mut best: Option<(usize, u32)> = None;
    for hint in hints {
        for (i, media) in catalog.iter().enumerate() {
            let Some(score) = score_hint(hint, &media.title, config) else {
                continue;
            };
            if best.map_or(true, |(_, s)| score > s) {
                best = Some((i, score));
            }
        }
    }
    best.filter(|(_, score)| *score >= config.hint_min_score)
}

/// Significant words of a stall name for the fallback matcher.
pub fn name_keywords(name: &str, config: &MatchConfig) -> BTreeSet<String> {
    tokens(name)
        .into_iter()
        .filter(|t| t.chars().count() >= config.min_name_word_len)
        .filter(|t| !config.generic_terms.iter().any(|g| g == t))
        .collect()
}

fn match_name(name: &str, catalog: &[MediaRecord], config: &MatchConfig) -> Option<(usize, u32)> {
    let keywords = name_keywords(name, config);
    if keywords.is_empty() {
        return None;
    }

    let mut best: Option<(usize, u32)> = None;
    let mut runner_up = 0u32;
    for (i, media) in catalog.iter().enumerate() {
        let title_words: BTreeSet<String> = tokens(&media.title).into_iter().collect();
        let score = keywords.intersection(&title_words).count() as u32;
        match best {
            Some((_, best_score)) if score <= best_score => runner_up = runner_up.max(score),
            Some((_, best_score)) => {
                runner_up = best_score;
                best = Some((i, score));
            }
            None => best = Some((i, score)),
        }
    }

    best.filter(|(_, score)| {
        *score >= config.name_min_score && score - runner_up >= config.name_min_margin
    })
}

fn from_catalog(media: &MediaRecord, method: AssociationMethod, score: u32) -> MediaAssociation {
    MediaAssociation {
        media_id: media.id.clone(),
        media_url: if media.url.trim().is_empty() {
            canonical_media_url(&media.id)
        } else {
            media.url.clone()
        },
        media_title: Some(media.title.clone()),
        method,
        score,
    }
}

/// Resolves the media reference for one group of rows sharing a stall.
pub fn associate(
    records: &[SourceRecord],
    stall_name: &str,
    catalog: &[MediaRecord],
    config: &MatchConfig,
) -> Option<MediaAssociation> {
    if let Some(explicit) = explicit_reference(records, catalog) {
        return Some(explicit);
    }

    let hints = harvest_hints(records);
    if let Some((i, score)) = match_hints(&hints, catalog, config) {
        return Some(from_catalog(&catalog[i], AssociationMethod::Hint, score));
    }

    match_name(stall_name, catalog, config)
        .map(|(i, score)| from_catalog(&catalog[i], AssociationMethod::Name, score))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn media(id: &str, title: &str) -> MediaRecord {
        MediaRecord {
            id: id.into(),
            url: canonical_media_url(id),
            title: title.into(),
            published_at: None,
        }
    }

    fn row(media_ref: Option<&str>, media_title: Option<&str>) -> SourceRecord {
        SourceRecord {
            row_key: "r".into(),
            name: "Hawker Chan".into(),
            media_ref: media_ref.map(String::from),
            media_title: media_title.map(String::from),
            ..Default::default()
        }
    }

    #[test]
    fn media_reference_syntax() {
        assert_eq!(
            parse_media_reference("HSTHwa00001").as_deref(),
            Some("HSTHwa00001")
        );
        assert_eq!(
            parse_media_reference("https://www.youtube.com/watch?v=HSTHwa00001&t=30").as_deref(),
            Some("HSTHwa00001")
        );
        assert_eq!(
            parse_media_reference("https://youtu.be/HSTHwa00001").as_deref(),
            Some("HSTHwa00001")
        );
        assert_eq!(
            parse_media_reference("https://youtube.com/shorts/HSTHwa00001").as_deref(),
            Some("HSTHwa00001")
        );
        assert_eq!(parse_media_reference("https://vimeo.com/HSTHwa00001"), None);
        assert_eq!(
            parse_media_reference("https://www.youtube.com/watch?v=short"),
            None
        );
        assert!(parse_media_reference("Episode 3 of the show").is_none());
    }

    #[test]
    fn explicit_reference_short_circuits_heuristics() {
        let catalog = vec![media("AAAAAAAAAAA", "Hawker Chan Soya Chicken Episode 2")];
        let rows = vec![
            row(None, Some("Hawker Chan Soya Chicken Episode 2")),
            row(Some("https://youtu.be/BBBBBBBBBBB"), None),
        ];
        let config = MatchConfig::default();
        let found = associate(&rows, "Hawker Chan", &catalog, &config).unwrap();
        assert_eq!(found.method, AssociationMethod::Explicit);
        assert_eq!(found.media_id, "BBBBBBBBBBB");
        assert_eq!(found.media_url, "https://youtu.be/BBBBBBBBBBB");
        assert!(found.media_title.is_none());
    }

    #[test]
    fn hint_scoring_ranks_exact_over_contains_over_overlap() {
        let config = MatchConfig::default();
        let exact = score_hint(
            "Hawker Chan Soya Chicken",
            "hawker chan: soya chicken",
            &config,
        );
        let contains = score_hint("Hawker Chan", "Hawker Chan Soya Chicken", &config);
        let overlap = score_hint("Chan's soya chicken", "Soya chicken crawl", &config);
        assert_eq!(exact, Some(100 + 4));
        assert_eq!(contains, Some(50 + 2));
        assert_eq!(overlap, Some(2));
    }

    #[test]
    fn episode_token_adds_bonus() {
        let config = MatchConfig::default();
        let with = score_hint("Ep. 7 satay", "Satay Street | Episode 7", &config);
        let without = score_hint("Ep. 7 satay", "Satay Street | Episode 8", &config);
        assert_eq!(with, without.map(|s| s + config.episode_bonus));
    }

    #[test]
    fn restricted_marker_never_selects_unmarked_title() {
        let catalog = vec![
            media(
                "FULLEPISODE",
                "Hawker Chan Soya Chicken Rice Full Episode Uncut",
            ),
            media("MEMBERSCUT1", "Members Only: Hawker Chan"),
        ];
        let hint = "Members Only: Hawker Chan Soya Chicken Rice Full Episode Uncut";
        let rows = vec![row(None, Some(hint))];
        let config = MatchConfig::default();
        let found = associate(&rows, "Hawker Chan", &catalog, &config).unwrap();
        assert_eq!(found.method, AssociationMethod::Hint);
        assert_eq!(found.media_id, "MEMBERSCUT1");

        let unmarked_only = vec![catalog[0].clone()];
        let config = MatchConfig {
            name_min_score: 99,
            ..config
        };
        let found = associate(&rows, "Hawker Chan", &unmarked_only, &config);
        assert!(found.is_none());
    }

    #[test]
    fn hint_below_floor_is_rejected() {
        let catalog = vec![media("AAAAAAAAAAA", "Satay by the Bay")];
        let rows = vec![row(None, Some("best satay"))];
        let config = MatchConfig::default();
        let score = score_hint("best satay", "Satay by the Bay", &config);
        assert_eq!(score, Some(1));
        assert!(associate(&rows, "Unrelated", &catalog, &config).is_none());
    }

    #[test]
    fn name_fallback_requires_margin_over_runner_up() {
        let config = MatchConfig::default();
        let catalog = vec![
            media(
                "TIANTIAN005",
                "Tian Tian Hainanese Chicken Rice at Maxwell | Episode 5",
            ),
            media("HAINAN00009", "Hainanese Curry Rice Crawl | Episode 9"),
        ];
        let name = "Tian Tian Hainanese Chicken Rice";
        let found = associate(&[], name, &catalog, &config).unwrap();
        assert_eq!(found.method, AssociationMethod::Name);
        assert_eq!(found.media_id, "TIANTIAN005");
        assert_eq!(found.score, 2);

        let tied = vec![
            media("TIANTIAN005", "Tian Tian Hainanese Chicken Rice at Maxwell"),
            media("TIANTIAN006", "Tian Tian Hainanese Chicken Rice Revisited"),
        ];
        assert!(associate(&[], name, &tied, &config).is_none());
    }

    #[test]
    fn name_keywords_drop_short_and_generic_words() {
        let config = MatchConfig::default();
        let words = name_keywords("Ah Heng Curry Chicken Bee Hoon Mee", &config);
        assert_eq!(
            words.into_iter().collect::<Vec<_>>(),
            vec!["heng".to_string(), "hoon".to_string()]
        );
    }

    #[test]
    fn yaml_overrides_merge_with_defaults() {
        let yaml = "name_min_margin: 2\nrestricted_keywords: [members, uncut]\n";
        let config = MatchConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.name_min_margin, 2);
        assert_eq!(config.restricted_keywords, vec!["members", "uncut"]);
        assert_eq!(config.exact_score, 100);
    }
}
