//! Advisory content signals for moderation and UI hints.
//!
//! None of these reject a message; validation does that. They flag content
//! for review, spam scoring or masking before display.

use crate::validation::URL_PATTERN;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

const MAX_SPECIAL_CHAR_RATIO: f64 = 0.3;
const REPEATED_CHAR_RUN: usize = 10;
const MAX_LINKS: usize = 2;
const ALL_CAPS_MIN_LENGTH: usize = 20;

const SPAM_PHRASES: &[&str] = &[
    "click here",
    "buy now",
    "limited time offer",
    "act now",
    "free money",
    "you have won",
    "congratulations you",
    "100% free",
    "risk free",
    "earn money fast",
    "work from home",
    "double your income",
];

static SCRIPT_MARKERS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)<\s*script|javascript\s*:|vbscript\s*:|data\s*:\s*text/html|\bon[a-z]+\s*=|\beval\s*\(|document\.cookie",
    )
    .expect("script marker pattern is valid")
});

static EMAIL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b[a-z0-9._%+-]+@[a-z0-9.-]+\.[a-z]{2,}\b").expect("email pattern is valid")
});

static PHONE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:\+?1[-.\s]?)?(?:\(\d{3}\)|\b\d{3})[-.\s]?\d{3}[-.\s]?\d{4}\b")
        .expect("phone pattern is valid")
});

static SSN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").expect("ssn pattern is valid"));

static CREDIT_CARD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:\d{4}[-\s]?){3}\d{4}\b").expect("credit card pattern is valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SuspiciousPattern {
    ScriptInjection,
    ExcessiveSpecialCharacters,
    RepeatedCharacters,
}

/// Anomaly markers found in `content`, empty when nothing looks off.
pub fn detect_suspicious_content(content: &str) -> Vec<SuspiciousPattern> {
    let mut found = Vec::new();

    if SCRIPT_MARKERS.is_match(content) {
        found.push(SuspiciousPattern::ScriptInjection);
    }
    if special_character_ratio(content) > MAX_SPECIAL_CHAR_RATIO {
        found.push(SuspiciousPattern::ExcessiveSpecialCharacters);
    }
    if longest_run(content) >= REPEATED_CHAR_RUN {
        found.push(SuspiciousPattern::RepeatedCharacters);
    }

    found
}

pub fn is_suspicious(content: &str) -> bool {
    !detect_suspicious_content(content).is_empty()
}

fn special_character_ratio(content: &str) -> f64 {
    let total = content.chars().count();
    if total == 0 {
        return 0.0;
    }
    let special = content
        .chars()
        .filter(|c| !c.is_alphanumeric() && !c.is_whitespace())
        .count();
    special as f64 / total as f64
}

fn longest_run(content: &str) -> usize {
    let mut longest = 0;
    let mut current = 0;
    let mut previous = None;

    for c in content.chars() {
        if Some(c) == previous {
            current += 1;
        } else {
            current = 1;
            previous = Some(c);
        }
        longest = longest.max(current);
    }

    longest
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SpamSignal {
    AllCaps,
    RepeatedPhrase,
    KnownSpamPhrase,
    ExcessiveLinks,
}

pub fn spam_signals(content: &str) -> Vec<SpamSignal> {
    let mut signals = Vec::new();

    if is_all_caps(content) {
        signals.push(SpamSignal::AllCaps);
    }
    if has_repeated_phrase(content) {
        signals.push(SpamSignal::RepeatedPhrase);
    }
    let lowered = content.to_lowercase();
    if SPAM_PHRASES.iter().any(|phrase| lowered.contains(phrase)) {
        signals.push(SpamSignal::KnownSpamPhrase);
    }
    if URL_PATTERN.find_iter(content).count() > MAX_LINKS {
        signals.push(SpamSignal::ExcessiveLinks);
    }

    signals
}

pub fn is_spam_message(content: &str) -> bool {
    !spam_signals(content).is_empty()
}

fn is_all_caps(content: &str) -> bool {
    if content.chars().count() <= ALL_CAPS_MIN_LENGTH {
        return false;
    }
    let mut letters = 0;
    for c in content.chars().filter(|c| c.is_alphabetic()) {
        if c.is_lowercase() {
            return false;
        }
        letters += 1;
    }
    letters >= ALL_CAPS_MIN_LENGTH / 2
}

/// A run of one to three words repeated three times back to back.
fn has_repeated_phrase(content: &str) -> bool {
    let words: Vec<String> = content
        .split_whitespace()
        .map(|w| {
            w.trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase()
        })
        .filter(|w| !w.is_empty())
        .collect();

    (1..=3).any(|n| {
        words.len() >= n * 3
            && (0..=words.len() - n * 3).any(|i| {
                let first = &words[i..i + n];
                first == &words[i + n..i + 2 * n] && first == &words[i + 2 * n..i + 3 * n]
            })
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PersonalInfoKind {
    Email,
    Phone,
    Ssn,
    CreditCard,
}

pub fn detect_personal_info(content: &str) -> Vec<PersonalInfoKind> {
    let mut kinds = Vec::new();
    if EMAIL.is_match(content) {
        kinds.push(PersonalInfoKind::Email);
    }
    if CREDIT_CARD.is_match(content) {
        kinds.push(PersonalInfoKind::CreditCard);
    }
    if SSN.is_match(content) {
        kinds.push(PersonalInfoKind::Ssn);
    }
    // Cards are masked first so their digit groups are not read as phones.
    let without_cards = CREDIT_CARD.replace_all(content, "");
    if PHONE.is_match(&without_cards) {
        kinds.push(PersonalInfoKind::Phone);
    }
    kinds
}

pub fn contains_personal_info(content: &str) -> bool {
    !detect_personal_info(content).is_empty()
}

/// Masks emails, phone numbers, SSNs and card numbers.
pub fn redact_personal_info(content: &str) -> String {
    let redacted = CREDIT_CARD.replace_all(content, "[CARD REDACTED]");
    let redacted = SSN.replace_all(&redacted, "[SSN REDACTED]");
    let redacted = EMAIL.replace_all(&redacted, "[EMAIL REDACTED]");
    PHONE
        .replace_all(&redacted, "[PHONE REDACTED]")
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_script_injection() {
        assert_eq!(
            detect_suspicious_content("<script>alert('x')</script>"),
            vec![SuspiciousPattern::ScriptInjection, SuspiciousPattern::ExcessiveSpecialCharacters]
        );
        assert!(is_suspicious("click <a href=\"javascript:void(0)\">me</a>"));
        assert!(is_suspicious("<img src=x onerror=alert(1)>"));
    }

    #[test]
    fn flags_special_character_noise() {
        assert!(detect_suspicious_content("$$$ !!! ### ???")
            .contains(&SuspiciousPattern::ExcessiveSpecialCharacters));
        assert!(!is_suspicious("Hi, can you help me reset my password?"));
    }

    #[test]
    fn flags_long_character_runs() {
        assert!(detect_suspicious_content("heyyyyyyyyyyyy")
            .contains(&SuspiciousPattern::RepeatedCharacters));
        assert!(!detect_suspicious_content("heyyyyy")
            .contains(&SuspiciousPattern::RepeatedCharacters));
    }

    #[test]
    fn spam_heuristics() {
        assert!(spam_signals("THIS IS AN AMAZING DEAL FOR YOU").contains(&SpamSignal::AllCaps));
        assert!(!spam_signals("OK THANKS").contains(&SpamSignal::AllCaps));

        assert!(spam_signals("buy buy buy").contains(&SpamSignal::RepeatedPhrase));
        assert!(spam_signals("great deal great deal great deal")
            .contains(&SpamSignal::RepeatedPhrase));

        assert!(spam_signals("Click here to claim").contains(&SpamSignal::KnownSpamPhrase));

        assert!(spam_signals("http://a.com http://b.com http://c.com")
            .contains(&SpamSignal::ExcessiveLinks));
        assert!(!spam_signals("see http://a.com and http://b.com")
            .contains(&SpamSignal::ExcessiveLinks));

        assert!(!is_spam_message("My order #1234 has not arrived yet, can you check?"));
    }

    #[test]
    fn detects_personal_info() {
        assert_eq!(
            detect_personal_info("mail me at jo@example.com"),
            vec![PersonalInfoKind::Email]
        );
        assert_eq!(
            detect_personal_info("call (555) 123-4567"),
            vec![PersonalInfoKind::Phone]
        );
        assert_eq!(detect_personal_info("ssn 123-45-6789"), vec![PersonalInfoKind::Ssn]);
        assert_eq!(
            detect_personal_info("card 4111 1111 1111 1111"),
            vec![PersonalInfoKind::CreditCard]
        );
        assert!(!contains_personal_info("order 12345 shipped"));
    }

    #[test]
    fn redacts_personal_info() {
        let redacted = redact_personal_info(
            "I'm jo@example.com, 555-123-4567, ssn 123-45-6789, card 4111-1111-1111-1111",
        );
        assert_eq!(
            redacted,
            "I'm [EMAIL REDACTED], [PHONE REDACTED], ssn [SSN REDACTED], card [CARD REDACTED]"
        );
    }
}
