//! Deterministic keys, hashes and slugs derived from free text.
//!
//! Every function here is pure and always returns a value.

use sha2::{Digest, Sha256};
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

const HASH_ID_LEN: usize = 16;
const FALLBACK_SLUG_HEX_LEN: usize = 8;
const FALLBACK_KEY_HEX_LEN: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Stall,
    Location,
}

impl EntityKind {
    fn namespace(&self) -> &'static str {
        match self {
            Self::Stall => "stall",
            Self::Location => "location",
        }
    }

    fn prefix(&self) -> &'static str {
        match self {
            Self::Stall => "stall",
            Self::Location => "loc",
        }
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Lowercased, whitespace-collapsed form used for equality checks.
pub fn normalize_for_match(input: &str) -> String {
    input
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Trimmed `input` with inner whitespace runs collapsed to single spaces.
pub fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Diacritic- and punctuation-free, dash-joined ASCII form used for keys and slugs.
///
/// Letters are NFKD-decomposed and stripped of combining marks, so `"Phở Hòa"`
/// becomes `"pho-hoa"`. Scripts with no ASCII base letters yield an empty string.
pub fn identity_form(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut pending_dash = false;

    for ch in input.nfkd().flat_map(char::to_lowercase) {
        if is_combining_mark(ch) || matches!(ch, '\'' | '\u{2019}' | '`') {
            // "Ah Heng's" keys as "ah-hengs"
            continue;
        }
        let mut buf = [0u8; 4];
        let text = if ch.is_ascii_alphanumeric() {
            &*ch.encode_utf8(&mut buf)
        } else if let Some(folded) = fold_letter(ch) {
            folded
        } else {
            pending_dash = true;
            continue;
        };
        if pending_dash && !out.is_empty() {
            out.push('-');
        }
        pending_dash = false;
        out.push_str(text);
    }
    out
}

/// Significant lowercase tokens of `input`, after diacritic folding.
pub fn tokens(input: &str) -> Vec<String> {
    identity_form(input)
        .split('-')
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Identity form of `input`, or `<prefix>-<hash>` of its match form when the text
/// has no ASCII identity (e.g. written only in Han characters). Blank input stays empty.
pub fn identity_key(input: &str, fallback_prefix: &str) -> String {
    let form = identity_form(input);
    if !form.is_empty() || input.trim().is_empty() {
        return form;
    }
    let digest = short_hash(&normalize_for_match(input), FALLBACK_KEY_HEX_LEN);
    format!("{fallback_prefix}-{digest}")
}

/// `name|COUNTRY|cuisine` built from identity keys.
pub fn source_key(name: &str, country: &str, cuisine: &str) -> String {
    format!(
        "{}|{}|{}",
        identity_key(name, "name"),
        country.trim().to_uppercase(),
        identity_key(cuisine, "cuisine")
    )
}

/// Namespaced, truncated SHA-256 id, e.g. `stall_1f2e3d4c5b6a7988`.
pub fn content_hash(kind: EntityKind, text: &str) -> String {
    let digest = sha256_hex(format!("{}:{}", kind.namespace(), text).as_bytes());
    format!("{}_{}", kind.prefix(), &digest[..HASH_ID_LEN])
}

pub fn short_hash(text: &str, len: usize) -> String {
    let digest = sha256_hex(text.as_bytes());
    digest.chars().take(len).collect()
}

/// URL slug for a display name; hash-based when the name has no usable characters.
pub fn slugify(display_name: &str) -> String {
    let slug = identity_form(display_name);
    if slug.is_empty() {
        let digest = sha256_hex(format!("stall:{}", display_name.trim()).as_bytes());
        return format!("stall-{}", &digest[..FALLBACK_SLUG_HEX_LEN]);
    }
    slug
}

/// Letters that carry no combining mark under NFKD.
fn fold_letter(ch: char) -> Option<&'static str> {
    let folded = match ch {
        'æ' => "ae",
        'ð' | 'đ' => "d",
        'ħ' => "h",
        'ı' => "i",
        'ł' => "l",
        'ø' => "o",
        'œ' => "oe",
        'ß' => "ss",
        'ŧ' => "t",
        'þ' => "th",
        _ => return None,
    };
    Some(folded)
}
