//! Name normalization and rejection rules for generated taxonomy entries.
//!
//! Each ingestion target gets a [`CandidateFilter`] value instead of inline
//! conditionals: the placeholder pattern derived from the kind word plus a
//! static list of forbidden terms.

use crate::llm::MOCK_MARKER;
use std::collections::HashSet;

/// Longest name persisted, in characters.
pub const MAX_NAME_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForbiddenTerm {
    /// Case-insensitive substring anywhere in the name.
    Substring(&'static str),
    /// Case-insensitive whole word; used for short acronyms.
    Word(&'static str),
}

impl ForbiddenTerm {
    fn hits(&self, lowered: &str, words: &[&str]) -> bool {
        match self {
            ForbiddenTerm::Substring(term) => lowered.contains(term),
            ForbiddenTerm::Word(term) => words.iter().any(|word| word == term),
        }
    }
}

const PLACEHOLDER_TERMS: &[ForbiddenTerm] = &[
    ForbiddenTerm::Substring("placeholder"),
    ForbiddenTerm::Substring("lorem ipsum"),
];

/// Keeps school-board ingestion on K-12 boards.
const NON_SCHOOL_TERMS: &[ForbiddenTerm] = &[
    ForbiddenTerm::Substring("university"),
    ForbiddenTerm::Substring("college"),
    ForbiddenTerm::Substring("institute"),
    ForbiddenTerm::Substring("polytechnic"),
    ForbiddenTerm::Substring("medical"),
    ForbiddenTerm::Substring("engineering"),
    ForbiddenTerm::Substring("nursing"),
    ForbiddenTerm::Substring("pharmacy"),
    ForbiddenTerm::Substring("technical education"),
    ForbiddenTerm::Substring("entrance"),
    ForbiddenTerm::Word("jee"),
    ForbiddenTerm::Word("neet"),
    ForbiddenTerm::Word("cuet"),
    ForbiddenTerm::Word("gate"),
    ForbiddenTerm::Word("cat"),
];

#[derive(Debug, Clone, Copy)]
pub struct CandidateFilter {
    kind_word: &'static str,
    forbidden: &'static [ForbiddenTerm],
}

impl CandidateFilter {
    pub const fn new(kind_word: &'static str, forbidden: &'static [ForbiddenTerm]) -> Self {
        Self {
            kind_word,
            forbidden,
        }
    }

    pub const fn school_boards() -> Self {
        Self::new("board", NON_SCHOOL_TERMS)
    }

    pub const fn universities() -> Self {
        Self::new("university", &[])
    }

    pub const fn papers() -> Self {
        Self::new("paper", &[])
    }

    pub const fn subjects() -> Self {
        Self::new("subject", &[])
    }

    pub const fn chapters() -> Self {
        Self::new("chapter", &[])
    }

    /// Trimmed, length-bounded name, or `None` when the candidate is rejected.
    pub fn normalize(&self, raw: &str) -> Option<String> {
        let trimmed = raw.trim();
        let bounded: String = trimmed.chars().take(MAX_NAME_CHARS).collect();
        let name = bounded.trim_end();
        if name.is_empty() || name.contains(MOCK_MARKER) {
            return None;
        }

        let lowered = name.to_lowercase();
        let words: Vec<&str> = lowered
            .split(|ch: char| !ch.is_alphanumeric())
            .filter(|word| !word.is_empty())
            .collect();

        if self.is_generic_placeholder(&words) {
            return None;
        }
        if PLACEHOLDER_TERMS
            .iter()
            .chain(self.forbidden)
            .any(|term| term.hits(&lowered, &words))
        {
            return None;
        }
        Some(name.to_string())
    }

    /// Normalizes in order and drops case-insensitive repeats.
    pub fn apply<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> Vec<String> {
        let mut seen = HashSet::new();
        names
            .into_iter()
            .filter_map(|raw| self.normalize(raw))
            .filter(|name| seen.insert(name.to_lowercase()))
            .collect()
    }

    /// The kind word directly followed by a number ("Board 1", "subject 12").
    /// Matching the kind word plus a space anywhere would also reject real
    /// names such as "Board of Secondary Education".
    fn is_generic_placeholder(&self, words: &[&str]) -> bool {
        words.windows(2).any(|pair| {
            pair[0] == self.kind_word && pair[1].chars().all(|ch| ch.is_ascii_digit())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbered_kind_names_are_placeholders() {
        let filter = CandidateFilter::school_boards();
        assert_eq!(filter.normalize("Board 1"), None);
        assert_eq!(filter.normalize("board 12"), None);
        assert_eq!(filter.normalize("Placeholder entry"), None);
        assert_eq!(
            filter.normalize("Board of Secondary Education, Rajasthan"),
            Some("Board of Secondary Education, Rajasthan".into())
        );
    }

    #[test]
    fn school_boards_reject_higher_education_terms() {
        let filter = CandidateFilter::school_boards();
        assert_eq!(filter.normalize("Some University Board"), None);
        assert_eq!(filter.normalize("State Polytechnic Council"), None);
        assert_eq!(filter.normalize("JEE Main"), None);
        assert_eq!(filter.normalize("WBCHSE"), Some("WBCHSE".into()));
        // acronyms only match whole words
        assert_eq!(filter.normalize("Gateway Board"), Some("Gateway Board".into()));
    }

    #[test]
    fn other_kinds_keep_university_names() {
        assert_eq!(
            CandidateFilter::universities().normalize("University of Calcutta"),
            Some("University of Calcutta".into())
        );
        assert_eq!(CandidateFilter::universities().normalize("University 3"), None);
    }

    #[test]
    fn names_are_trimmed_and_bounded() {
        let filter = CandidateFilter::chapters();
        assert_eq!(filter.normalize("   "), None);
        assert_eq!(filter.normalize("  Motion  "), Some("Motion".into()));
        let long = "x".repeat(MAX_NAME_CHARS + 50);
        assert_eq!(
            filter.normalize(&long).map(|name| name.chars().count()),
            Some(MAX_NAME_CHARS)
        );
    }

    #[test]
    fn mock_items_never_pass() {
        let filter = CandidateFilter::subjects();
        assert_eq!(filter.normalize("[MOCK] Sample subjects 1"), None);
    }

    #[test]
    fn apply_keeps_order_and_drops_repeats() {
        let filter = CandidateFilter::subjects();
        let names = filter.apply(["Physics", "physics ", "Chemistry", "Subject 2"]);
        assert_eq!(names, vec!["Physics".to_string(), "Chemistry".to_string()]);
    }
}
