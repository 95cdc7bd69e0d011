//! Lexical task classifier.
//!
//! Maps a free-text task description onto a [`Category`] by lemmatizing its
//! tokens and scanning them left to right against fixed keyword sets. The
//! first token that hits either set decides the category.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Task category used to size study intervals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    /// Reading, studying, researching.
    Learning,
    /// Producing something. Called "creative" in the three-way scheme.
    #[serde(alias = "creative")]
    Doing,
    /// Everything else, three-way scheme only.
    Administrative,
}

impl Category {
    pub const ALL: [Category; 3] = [Category::Learning, Category::Doing, Category::Administrative];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Learning => "learning",
            Category::Doing => "doing",
            Category::Administrative => "administrative",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "learning" => Some(Category::Learning),
            "doing" | "creative" => Some(Category::Doing),
            "administrative" | "admin" => Some(Category::Administrative),
            _ => None,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which category set the classifier may return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassifierScheme {
    /// {Learning, Doing}; unmatched descriptions fall into Doing.
    #[default]
    TwoWay,
    /// {Learning, Doing, Administrative}; unmatched fall into Administrative.
    ThreeWay,
}

const LEARNING_KEYWORDS: &[&str] = &["study", "learn", "research", "read"];
const DOING_KEYWORDS: &[&str] = &[
    "build", "write", "create", "finish", "develop", "complete", "design",
];

/// Irregular forms that suffix stripping cannot recover.
const IRREGULAR: &[(&str, &str)] = &[
    ("wrote", "write"),
    ("written", "write"),
    ("built", "build"),
    ("learnt", "learn"),
    ("studies", "study"),
    ("studied", "study"),
    ("researches", "research"),
];

#[derive(Debug, Clone, Copy, Default)]
pub struct Classifier {
    scheme: ClassifierScheme,
}

impl Classifier {
    pub fn new(scheme: ClassifierScheme) -> Self {
        Self { scheme }
    }

    pub fn scheme(&self) -> ClassifierScheme {
        self.scheme
    }

    pub fn classify(&self, description: &str) -> Category {
        for token in description.split_whitespace() {
            let lemma = lemmatize(token);
            if LEARNING_KEYWORDS.contains(&lemma.as_str()) {
                return Category::Learning;
            }
            if DOING_KEYWORDS.contains(&lemma.as_str()) {
                return Category::Doing;
            }
        }
        match self.scheme {
            ClassifierScheme::TwoWay => Category::Doing,
            ClassifierScheme::ThreeWay => Category::Administrative,
        }
    }
}

/// Classify with the default two-way scheme.
pub fn classify(description: &str) -> Category {
    Classifier::default().classify(description)
}

/// Reduce a raw token to a dictionary-ish base form.
///
/// Rules: lowercase, drop non-alphanumerics, irregular table, then strip
/// `-ing`, `-ed`, `-es`, `-s` while undoing consonant doubling and restoring a
/// dropped trailing `e` when the stem is a known keyword.
pub fn lemmatize(token: &str) -> String {
    let word: String = token
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect();

    if let Some((_, base)) = IRREGULAR.iter().find(|(form, _)| *form == word) {
        return (*base).to_string();
    }
    if is_keyword(&word) {
        return word;
    }

    for suffix in ["ing", "ed", "es", "s"] {
        if let Some(stem) = word.strip_suffix(suffix) {
            if stem.len() < 2 {
                continue;
            }
            if let Some(found) = resolve_stem(stem) {
                return found;
            }
        }
    }
    word
}

fn resolve_stem(stem: &str) -> Option<String> {
    if is_keyword(stem) {
        return Some(stem.to_string());
    }
    let with_e = format!("{stem}e");
    if is_keyword(&with_e) {
        return Some(with_e);
    }
    // "writting" style doubling: drop the repeated consonant
    let bytes = stem.as_bytes();
    if bytes.len() >= 2 && bytes[bytes.len() - 1] == bytes[bytes.len() - 2] {
        let undoubled = &stem[..stem.len() - 1];
        if is_keyword(undoubled) {
            return Some(undoubled.to_string());
        }
        let undoubled_e = format!("{undoubled}e");
        if is_keyword(&undoubled_e) {
            return Some(undoubled_e);
        }
    }
    None
}

fn is_keyword(word: &str) -> bool {
    LEARNING_KEYWORDS.contains(&word) || DOING_KEYWORDS.contains(&word)
}
