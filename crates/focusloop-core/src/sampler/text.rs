//! OCR text cleanup and comprehensibility scoring.

use super::lexicon::Lexicon;

const KEPT_PUNCTUATION: [char; 5] = ['.', ',', '!', '?', '-'];

fn is_kept(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c.is_whitespace() || KEPT_PUNCTUATION.contains(&c)
}

/// Drop non-linguistic characters and collapse whitespace runs to one space.
pub fn normalize(raw: &str) -> String {
    let stripped: String = raw.chars().filter(|c| is_kept(*c)).collect();
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Fraction of tokens found in `lexicon`, in `[0, 1]`.
///
/// Edge punctuation is trimmed before lookup; tokens that are only
/// punctuation are ignored. Text without tokens scores 0.
pub fn comprehensibility(text: &str, lexicon: &Lexicon) -> f64 {
    let mut total = 0usize;
    let mut known = 0usize;
    for token in text.split_whitespace() {
        let word = token.trim_matches(|c: char| !c.is_alphanumeric());
        if word.is_empty() {
            continue;
        }
        total += 1;
        if lexicon.contains(word) {
            known += 1;
        }
    }
    if total == 0 {
        0.0
    } else {
        known as f64 / total as f64
    }
}
