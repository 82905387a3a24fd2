use once_cell::sync::Lazy;
use regex::Regex;

// Hardcoded patterns; a failure here is a source bug
static HARMFUL_PATTERNS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    [
        ("script tag", r"(?i)<\s*/?\s*script\b"),
        ("iframe tag", r"(?i)<\s*/?\s*iframe\b"),
        ("inline event handler", r"(?i)<[^>]*\bon[a-z]+\s*="),
        ("javascript url", r"(?i)javascript\s*:"),
    ]
    .into_iter()
    .map(|(name, pattern)| {
        (
            name,
            Regex::new(pattern).expect("hardcoded harmful-content regex is invalid - fix source code"),
        )
    })
    .collect()
});

static URL_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bhttps?://|\bwww\.")
        .expect("hardcoded url regex is invalid - fix source code")
});

const MAX_URLS: usize = 2;
const MAX_REPEATED_CHARS: usize = 10;
const MAX_REPEATED_WORDS: usize = 5;
const MIN_CAPS_LETTERS: usize = 10;

/// Name of the first harmful pattern found in `content`
pub fn find_harmful(content: &str) -> Option<&'static str> {
    HARMFUL_PATTERNS
        .iter()
        .find(|(_, regex)| regex.is_match(content))
        .map(|(name, _)| *name)
}

/// Reason the text looks like spam, if it does
pub fn find_spam(content: &str) -> Option<&'static str> {
    if has_char_run(content, MAX_REPEATED_CHARS) {
        return Some("excessive character repetition");
    }
    if has_word_run(content, MAX_REPEATED_WORDS) {
        return Some("excessive word repetition");
    }
    if is_shouting(content) {
        return Some("all caps");
    }
    if URL_REGEX.find_iter(content).count() > MAX_URLS {
        return Some("too many links");
    }
    None
}

fn has_char_run(content: &str, limit: usize) -> bool {
    let mut previous = None;
    let mut run = 0;
    for c in content.chars().filter(|c| !c.is_whitespace()) {
        if Some(c) == previous {
            run += 1;
        } else {
            previous = Some(c);
            run = 1;
        }
        if run >= limit {
            return true;
        }
    }
    false
}

fn has_word_run(content: &str, limit: usize) -> bool {
    let mut previous = String::new();
    let mut run = 0;
    for word in content.split_whitespace().map(str::to_lowercase) {
        if word == previous {
            run += 1;
        } else {
            previous = word;
            run = 1;
        }
        if run >= limit {
            return true;
        }
    }
    false
}

fn is_shouting(content: &str) -> bool {
    let letters: Vec<char> = content.chars().filter(|c| c.is_alphabetic()).collect();
    letters.len() >= MIN_CAPS_LETTERS && letters.iter().all(|c| c.is_uppercase())
}
