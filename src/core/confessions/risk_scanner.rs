// Rule-based risk scanner for submission text.
//
// Pipeline (always in this order):
// 1. normalize text into a comparison form
// 2. moderator-configured banned words (all matches collected, list order)
// 3. built-in PII patterns (run on the original text)
// 4. built-in crisis phrases (always run, acting on them is the caller's call)
// 5. moderator-configured required keywords (at least one must occur)
//
// A word is a maximal run of alphanumeric chars, everywhere: `normalize`,
// the matchers and `redact` all split on the same characters.
//
// `scan` is a pure function of (text, config): no hidden state, no randomness.

use super::confession_models::{PolicyConfig, RiskVerdict};
use regex::Regex;
use std::ops::Range;
use std::sync::OnceLock;

/// Bump whenever the built-in PII or crisis tables change.
pub const RULESET_VERSION: u32 = 1;

/// What redacted spans are replaced with in public posts.
pub const REDACTION_MARK: &str = "[entfernt]";

/// Built-in PII rules: (name, pattern). Not moderator-configurable.
const PII_RULES: &[(&str, &str)] = &[
    ("email", r"(?i)\b[a-z0-9._%+-]+@[a-z0-9.-]+\.[a-z]{2,}\b"),
    (
        "phone",
        r"(?:\+\d{1,3}[\s-]?|\b0)\d{2,5}[\s/-]?\d{3,4}[\s-]?\d{2,5}\b|\b\d{9,}\b",
    ),
    (
        "handle",
        r"(?i)\b(?:discord\.gg|instagram\.com|tiktok\.com|t\.me)/[\w.-]+|\b(?:insta|instagram|ig|snap|snapchat|tiktok|telegram|discord)\s*[:=]\s*@?[\w.]{2,}",
    ),
    ("at_handle", r"(?:^|\s)@([A-Za-z0-9_.]{3,32})"),
];

/// `@everyone` and `@here` are mentions, not someone's handle.
const NOT_HANDLES: &[&str] = &["everyone", "here"];

/// Built-in crisis phrases, already in normalized form. A phrase matches at a
/// word start, so German compounds like "suizidgedanken" are caught.
const CRISIS_PHRASES: &[&str] = &[
    "selbstmord",
    "suizid",
    "notfall",
    "ich halte es nicht mehr aus",
    "ich will nicht mehr leben",
    "ich will sterben",
    "mich umbringen",
    "selbstverletzung",
    "suicide",
    "suicidal",
    "kill myself",
    "end my life",
    "want to die",
    "self harm",
];

fn pii_rules() -> &'static [(&'static str, Regex)] {
    static RULES: OnceLock<Vec<(&'static str, Regex)>> = OnceLock::new();
    RULES.get_or_init(|| {
        PII_RULES
            .iter()
            .filter_map(|(name, pattern)| match Regex::new(pattern) {
                Ok(re) => Some((*name, re)),
                Err(e) => {
                    tracing::error!(rule = *name, "Invalid built-in PII pattern: {}", e);
                    None
                }
            })
            .collect()
    })
}

/// Case-fold, turn punctuation into spaces and collapse whitespace.
pub fn normalize(text: &str) -> String {
    let folded: String = text
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Whole-word (or whole-phrase) containment on normalized text.
fn contains_word(padded_text: &str, normalized_term: &str) -> bool {
    !normalized_term.is_empty() && padded_text.contains(&format!(" {} ", normalized_term))
}

/// Word-start containment on normalized text.
fn contains_word_prefix(padded_text: &str, normalized_term: &str) -> bool {
    !normalized_term.is_empty() && padded_text.contains(&format!(" {}", normalized_term))
}

/// Every PII span in the original text, as (rule name, byte range).
fn pii_matches(text: &str) -> Vec<(&'static str, Range<usize>)> {
    let mut found = Vec::new();
    for (name, re) in pii_rules() {
        for caps in re.captures_iter(text) {
            if *name == "at_handle" {
                let Some(handle) = caps.get(1) else { continue };
                if NOT_HANDLES.contains(&handle.as_str().to_lowercase().as_str()) {
                    continue;
                }
                // Redact the `@handle` itself, not the whitespace before it
                found.push((*name, handle.start().saturating_sub(1)..handle.end()));
            } else if let Some(m) = caps.get(0) {
                found.push((*name, m.range()));
            }
        }
    }
    found
}

/// Classify `text` against the guild's banned words and the built-in tables.
pub fn scan(text: &str, config: &PolicyConfig) -> RiskVerdict {
    let normalized = normalize(text);
    let padded = format!(" {} ", normalized);

    let matched_terms: Vec<String> = config
        .banned_words
        .iter()
        .filter(|word| contains_word(&padded, &normalize(word)))
        .cloned()
        .collect();

    let mut pii_kinds: Vec<&'static str> = Vec::new();
    for (name, _) in pii_matches(text) {
        if !pii_kinds.contains(&name) {
            pii_kinds.push(name);
        }
    }
    // Keep table order regardless of where in the text things matched
    pii_kinds.sort_by_key(|kind| PII_RULES.iter().position(|(name, _)| name == kind));

    let crisis_terms: Vec<&'static str> = CRISIS_PHRASES
        .iter()
        .copied()
        .filter(|phrase| contains_word_prefix(&padded, phrase))
        .collect();

    let missing_required_word = !config.required_words.is_empty()
        && !config
            .required_words
            .iter()
            .any(|word| contains_word(&padded, &normalize(word)));

    RiskVerdict {
        contains_banned_word: !matched_terms.is_empty(),
        matched_terms,
        pii_suspected: !pii_kinds.is_empty(),
        pii_kinds,
        crisis_suspected: !crisis_terms.is_empty(),
        crisis_terms,
        missing_required_word,
    }
}

/// Case-insensitive pattern for a banned term. Any run of non-word chars may
/// stand between the words of a phrase, and combining marks trailing the
/// last word go with it. Word edges are checked separately.
fn term_regex(term: &str) -> Option<Regex> {
    let words: Vec<String> = normalize(term)
        .split(' ')
        .filter(|w| !w.is_empty())
        .map(regex::escape)
        .collect();
    if words.is_empty() {
        return None;
    }
    let pattern = format!(
        r"(?i){}\p{{M}}*",
        words.join(r"[^\p{Alphabetic}\p{N}]+")
    );
    Regex::new(&pattern).ok()
}

/// Whether `span` starts and ends on a word edge, using the same notion of a
/// word char as `normalize`.
fn on_word_edges(text: &str, span: &Range<usize>) -> bool {
    let before = text[..span.start].chars().next_back();
    let after = text[span.end..].chars().next();
    !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
}

/// Every whole-word occurrence of `re` in `text`.
fn term_spans(re: &Regex, text: &str) -> Vec<Range<usize>> {
    let mut spans = Vec::new();
    let mut from = 0;
    while from < text.len() {
        let Some(m) = re.find_at(text, from) else { break };
        if on_word_edges(text, &m.range()) {
            spans.push(m.range());
            from = m.end();
        } else {
            // A whole-word match may still start inside this one
            from = m.start() + text[m.start()..].chars().next().map_or(1, char::len_utf8);
        }
    }
    spans
}

/// Replace every banned term in `terms` and every PII span with
/// [`REDACTION_MARK`].
pub fn redact(text: &str, terms: &[String]) -> String {
    let mut spans: Vec<Range<usize>> = pii_matches(text)
        .into_iter()
        .map(|(_, range)| range)
        .collect();
    for term in terms {
        if let Some(re) = term_regex(term) {
            spans.extend(term_spans(&re, text));
        }
    }
    if spans.is_empty() {
        return text.to_string();
    }

    // Merge overlapping spans, then rebuild the string left to right
    spans.sort_by_key(|r| (r.start, r.end));
    let mut merged: Vec<Range<usize>> = Vec::with_capacity(spans.len());
    for span in spans {
        match merged.last_mut() {
            Some(last) if span.start <= last.end => last.end = last.end.max(span.end),
            _ => merged.push(span),
        }
    }

    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for span in merged {
        out.push_str(&text[cursor..span.start]);
        out.push_str(REDACTION_MARK);
        cursor = span.end;
    }
    out.push_str(&text[cursor..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn config_with_words(words: &[&str]) -> PolicyConfig {
        let mut config = PolicyConfig::new(1, Utc::now());
        config.banned_words = words.iter().map(|w| normalize(w)).collect();
        config
    }

    #[test]
    fn normalize_folds_case_and_punctuation() {
        assert_eq!(normalize("  Hallo,   WELT!!  Wie geht's? "), "hallo welt wie geht s");
        assert_eq!(normalize("Größe ÄRGER"), "größe ärger");
        assert_eq!(normalize("...!!!"), "");
    }

    #[test]
    fn banned_word_scenario() {
        let config = config_with_words(&["xyz"]);
        let verdict = scan("I saw XYZ yesterday", &config);

        assert!(verdict.contains_banned_word);
        assert_eq!(verdict.matched_terms, vec!["xyz".to_string()]);
        assert!(!verdict.pii_suspected);
        assert!(!verdict.crisis_suspected);
    }

    #[test]
    fn banned_words_collect_all_matches_in_list_order() {
        let config = config_with_words(&["zeta", "alpha", "unused", "bad phrase"]);
        let verdict = scan("alpha and zeta, plus a BAD... phrase", &config);

        assert_eq!(
            verdict.matched_terms,
            vec!["zeta".to_string(), "alpha".to_string(), "bad phrase".to_string()]
        );
    }

    #[test]
    fn banned_words_need_word_boundaries() {
        let config = config_with_words(&["ass"]);
        assert!(!scan("a classic passage", &config).contains_banned_word);
        assert!(scan("what an ASS!", &config).contains_banned_word);
    }

    #[test]
    fn detects_email_and_phone() {
        let config = config_with_words(&[]);

        let verdict = scan("schreib mir an max.muster@example.de", &config);
        assert!(verdict.pii_suspected);
        assert_eq!(verdict.pii_kinds, vec!["email"]);

        for text in [
            "ruf an: 0170-1234567",
            "+49 170 1234567 ist meine nummer",
            "0170 123 4567",
            "123456789012",
        ] {
            let verdict = scan(text, &config);
            assert!(verdict.pii_suspected, "expected phone in {text:?}");
            assert!(verdict.pii_kinds.contains(&"phone"));
        }
    }

    #[test]
    fn years_and_small_numbers_are_not_phones() {
        let config = config_with_words(&[]);
        let verdict = scan("Von 2023 bis 2024 war ich 3 mal weg, 15 Tage", &config);
        assert!(!verdict.pii_suspected);
    }

    #[test]
    fn detects_shared_handles() {
        let config = config_with_words(&[]);
        assert!(scan("add me, insta: cool.name", &config).pii_suspected);
        assert!(scan("join discord.gg/abcdef", &config).pii_suspected);
        assert!(scan("frag @someone_else", &config).pii_suspected);
        assert!(!scan("hey @everyone and @here", &config).pii_suspected);
    }

    #[test]
    fn detects_crisis_language() {
        let config = config_with_words(&[]);

        let verdict = scan("Ich halte es nicht mehr aus...", &config);
        assert!(verdict.crisis_suspected);
        assert_eq!(verdict.crisis_terms, vec!["ich halte es nicht mehr aus"]);

        assert!(scan("Ich habe Suizidgedanken", &config).crisis_suspected);
        assert!(!scan("Heute war ein guter Tag", &config).crisis_suspected);
    }

    #[test]
    fn crisis_detection_ignores_response_toggle() {
        let mut config = config_with_words(&[]);
        config.crisis_response_enabled = false;
        assert!(scan("I want to die", &config).crisis_suspected);
    }

    #[test]
    fn scan_is_pure() {
        let config = config_with_words(&["xyz", "foo"]);
        let text = "xyz foo 0170 1234567 suizid @person";
        let first = scan(text, &config);
        for _ in 0..5 {
            assert_eq!(scan(text, &config), first);
        }
    }

    #[test]
    fn redact_replaces_terms_and_pii() {
        let redacted = redact(
            "I saw XYZ yesterday, mail me: a@b.de",
            &["xyz".to_string()],
        );
        assert_eq!(
            redacted,
            format!("I saw {} yesterday, mail me: {}", REDACTION_MARK, REDACTION_MARK)
        );
    }

    #[test]
    fn redact_handles_phrases_and_overlaps() {
        let redacted = redact(
            "this is a Bad, Phrase indeed",
            &["bad phrase".to_string(), "phrase".to_string()],
        );
        assert_eq!(redacted, format!("this is a {} indeed", REDACTION_MARK));
    }

    #[test]
    fn redact_uses_the_same_word_edges_as_scan() {
        let terms = vec!["xyz".to_string()];
        assert_eq!(
            redact("I saw xyz_ yesterday", &terms),
            format!("I saw {}_ yesterday", REDACTION_MARK)
        );
        assert_eq!(redact("xyz\u{0301}!", &terms), format!("{}!", REDACTION_MARK));
        assert_eq!(redact("xyz xyz", &terms), format!("{} {}", REDACTION_MARK, REDACTION_MARK));
        // Digits are word chars: neither scan nor redact sees a match here
        assert_eq!(redact("1xyz xyz2", &terms), "1xyz xyz2");
        assert!(!scan("1xyz xyz2", &config_with_words(&["xyz"])).contains_banned_word);
    }

    #[test]
    fn scanned_terms_never_survive_redaction() {
        let config = config_with_words(&["xyz", "bad phrase"]);
        let inputs = [
            "I saw xyz_ yesterday",
            "_xyz_ und xyz_1",
            "xyz\u{0301} hier",
            "e\u{0301}xyz",
            "12 xyz 34",
            "(XYZ)42",
            "bad_phrase!",
            "BAD\u{0301} phrase",
            "axyz xyz",
            "xyz xyz xyz",
        ];
        for text in inputs {
            let verdict = scan(text, &config);
            assert!(verdict.contains_banned_word, "expected a match in {text:?}");

            let redacted = redact(text, &verdict.matched_terms);
            let again = scan(&redacted, &config);
            assert!(
                !again.contains_banned_word,
                "{:?} still contains {:?} after redaction: {:?}",
                text, again.matched_terms, redacted
            );
        }
    }

    #[test]
    fn required_words_need_one_whole_word_match() {
        let mut config = config_with_words(&[]);
        assert!(!scan("egal", &config).missing_required_word);

        config.required_words = vec!["beichte".to_string(), "ich gestehe".to_string()];
        assert!(!scan("Meine Beichte: ...", &config).missing_required_word);
        assert!(!scan("Ich, gestehe!", &config).missing_required_word);
        assert!(scan("Beichtenstuhl", &config).missing_required_word);
        assert!(scan("nichts davon", &config).missing_required_word);
        // Not a risk
        assert!(!scan("nichts davon", &config).is_flagged());
    }

    #[test]
    fn redact_keeps_clean_text() {
        assert_eq!(redact("nothing to see", &[]), "nothing to see");
    }
}
