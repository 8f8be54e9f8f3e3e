//! Rule-based time-category tags derived from free-text opening hours.

use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

const MINUTES_PER_DAY: u32 = 24 * 60;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TimeCategoryRule {
    pub tag: String,
    #[serde(default)]
    pub contains_any: Vec<String>,
    /// Hour window `[start, end)`; `end` may exceed 24 for past-midnight windows.
    #[serde(default)]
    pub window: Option<[u32; 2]>,
}

#[derive(Debug, Clone, Deserialize)]
struct TimeCategoryRulesFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    rules: Vec<TimeCategoryRule>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimeCategoryRules {
    rules: Vec<TimeCategoryRule>,
}

fn rule(tag: &str, contains_any: &[&str], window: Option<[u32; 2]>) -> TimeCategoryRule {
    TimeCategoryRule {
        tag: tag.to_string(),
        contains_any: contains_any.iter().map(|s| s.to_string()).collect(),
        window,
    }
}

impl Default for TimeCategoryRules {
    fn default() -> Self {
        Self::builtin()
    }
}

impl TimeCategoryRules {
    pub fn builtin() -> Self {
        Self {
            rules: vec![
                rule("breakfast", &["breakfast"], Some([5, 11])),
                rule("lunch", &["lunch"], Some([11, 15])),
                rule("dinner", &["dinner"], Some([17, 22])),
                rule(
                    "late-night",
                    &["supper", "late night", "late-night"],
                    Some([22, 29]),
                ),
                rule(
                    "all-day",
                    &["24 hours", "24hrs", "24h", "24/7", "round the clock"],
                    None,
                ),
            ],
        }
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let file: TimeCategoryRulesFile =
            serde_yaml::from_str(yaml).context("parsing time category rules")?;
        Ok(Self { rules: file.rules })
    }

    /// `rules/time_categories.yaml` under `root`, or the built-in rules when absent.
    pub fn from_workspace_root(root: &Path) -> anyhow::Result<Self> {
        let path = root.join("rules").join("time_categories.yaml");
        if !path.exists() {
            return Ok(Self::builtin());
        }
        let yaml = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&yaml).with_context(|| format!("parsing {}", path.display()))
    }

    /// Tags in rule order, each at most once.
    pub fn categorize(&self, opening_hours: &str) -> Vec<String> {
        let text = opening_hours.to_lowercase();
        if text.trim().is_empty() {
            return Vec::new();
        }
        let ranges = parse_hour_ranges(&text);

        self.rules
            .iter()
            .filter(|rule| {
                let keyword_hit = rule
                    .contains_any
                    .iter()
                    .any(|needle| text.contains(&needle.to_lowercase()));
                let window_hit = rule.window.is_some_and(|[start, end]| {
                    let (start, end) = (start * 60, end * 60);
                    ranges.iter().any(|&(open, close)| {
                        [0, MINUTES_PER_DAY]
                            .iter()
                            .any(|shift| open + shift < end && start < close + shift)
                    })
                });
                keyword_hit || window_hit
            })
            .map(|rule| rule.tag.clone())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Meridiem {
    Am,
    Pm,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Lexeme {
    Time {
        hour: u32,
        minute: u32,
        meridiem: Option<Meridiem>,
    },
    Dash,
    Other,
}

fn lex(text: &str) -> Vec<Lexeme> {
    let chars: Vec<char> = text.chars().collect();
    let mut out = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
            let digits: String = chars[start..i].iter().collect();
            let (mut hour, mut minute) = match digits.len() {
                1 | 2 => (digits.parse().unwrap_or(99), 0),
                // 0930 style
                4 => (
                    digits[..2].parse().unwrap_or(99),
                    digits[2..].parse().unwrap_or(99),
                ),
                _ => (99, 99),
            };
            if i + 2 < chars.len()
                && matches!(chars[i], ':' | '.')
                && chars[i + 1].is_ascii_digit()
                && chars[i + 2].is_ascii_digit()
            {
                minute = chars[i + 1].to_digit(10).unwrap_or(0) * 10
                    + chars[i + 2].to_digit(10).unwrap_or(0);
                i += 3;
            }
            let mut j = i;
            while j < chars.len() && chars[j] == ' ' {
                j += 1;
            }
            let meridiem = match (chars.get(j), chars.get(j + 1), chars.get(j + 2)) {
                (Some('a'), Some('m'), _) => Some((Meridiem::Am, j + 2)),
                (Some('p'), Some('m'), _) => Some((Meridiem::Pm, j + 2)),
                (Some('a'), Some('.'), Some('m')) => Some((Meridiem::Am, j + 3)),
                (Some('p'), Some('.'), Some('m')) => Some((Meridiem::Pm, j + 3)),
                _ => None,
            };
            let meridiem = meridiem.map(|(m, end)| {
                i = end;
                if chars.get(i) == Some(&'.') {
                    i += 1;
                }
                m
            });
            if hour == 24 && minute == 0 {
                hour = 0;
            }
            if hour < 24 && minute < 60 && !(meridiem.is_some() && hour > 12) {
                out.push(Lexeme::Time {
                    hour,
                    minute,
                    meridiem,
                });
            } else {
                out.push(Lexeme::Other);
            }
        } else if matches!(c, '-' | '~' | '\u{2013}' | '\u{2014}') {
            out.push(Lexeme::Dash);
            i += 1;
        } else if c.is_alphabetic() {
            let start = i;
            while i < chars.len() && chars[i].is_alphabetic() {
                i += 1;
            }
            let word: String = chars[start..i].iter().collect();
            out.push(match word.as_str() {
                "to" | "till" | "til" | "until" => Lexeme::Dash,
                "noon" => Lexeme::Time {
                    hour: 12,
                    minute: 0,
                    meridiem: Some(Meridiem::Pm),
                },
                "midnight" => Lexeme::Time {
                    hour: 12,
                    minute: 0,
                    meridiem: Some(Meridiem::Am),
                },
                _ => Lexeme::Other,
            });
        } else if c.is_whitespace() {
            i += 1;
        } else {
            out.push(Lexeme::Other);
            i += 1;
        }
    }
    out
}

fn to_minutes(hour: u32, minute: u32, meridiem: Option<Meridiem>) -> u32 {
    let hour = match meridiem {
        Some(Meridiem::Am) if hour == 12 => 0,
        Some(Meridiem::Pm) if hour < 12 => hour + 12,
        _ => hour,
    };
    hour * 60 + minute
}

/// Opening ranges in minutes from midnight; a close at or before the open wraps past midnight.
fn parse_hour_ranges(text: &str) -> Vec<(u32, u32)> {
    let lexemes = lex(text);
    let mut ranges = Vec::new();
    for window in lexemes.windows(3) {
        let [Lexeme::Time {
            hour: h1,
            minute: m1,
            meridiem: mer1,
        }, Lexeme::Dash, Lexeme::Time {
            hour: h2,
            minute: m2,
            meridiem: mer2,
        }] = *window
        else {
            continue;
        };
        // "7-11pm": the open borrows the close's meridiem when that keeps the order
        let mer1 = match (mer1, mer2) {
            (None, Some(m)) if to_minutes(h1, m1, Some(m)) < to_minutes(h2, m2, Some(m)) => Some(m),
            _ => mer1,
        };
        let open = to_minutes(h1, m1, mer1);
        let mut close = to_minutes(h2, m2, mer2);
        if close <= open {
            close += MINUTES_PER_DAY;
        }
        ranges.push((open, close));
    }
    ranges
}
