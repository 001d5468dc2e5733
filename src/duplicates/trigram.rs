// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Trigram similarity, as used by fuzzy name search in PostgreSQL's
//! `pg_trgm`.
//!
//! A string is lower-cased and split into words on anything that is not a
//! letter or digit. Each word is padded with two blanks in front and one
//! behind, then cut into every run of three characters:
//!
//! ```text
//! "Kone" → "  kone " → {"  k", " ko", "kon", "one", "ne "}
//! ```
//!
//! Similarity is the number of shared trigrams over the size of the union.

use std::collections::HashSet;

/// Distinct trigrams of `s`.
#[must_use]
pub fn trigrams(s: &str) -> HashSet<[char; 3]> {
    let mut set = HashSet::new();
    let lower = s.to_lowercase();
    for word in lower.split(|c: char| !c.is_alphanumeric()).filter(|w| !w.is_empty()) {
        let padded: Vec<char> = "  ".chars().chain(word.chars()).chain(" ".chars()).collect();
        for window in padded.windows(3) {
            set.insert([window[0], window[1], window[2]]);
        }
    }
    set
}

/// Trigrams of `s` as sorted strings, the form kept in the name index.
#[must_use]
pub fn trigram_keys(s: &str) -> Vec<String> {
    let mut keys: Vec<String> = trigrams(s).into_iter().map(|t| t.iter().collect()).collect();
    keys.sort();
    keys
}

/// Fewest trigrams a stored name must share with a query name of
/// `query_len` trigrams to score strictly above `floor`.
///
/// Similarity is at most `shared / query_len`, so anything below this
/// count cannot clear the floor. Rounds down at the boundary, which only
/// widens the block.
#[must_use]
pub fn min_shared_trigrams(query_len: usize, floor: f64) -> usize {
    let bound = (floor.clamp(0.0, 1.0) * query_len as f64 - 1e-9).floor().max(0.0);
    bound as usize + 1
}

/// Similarity in `0.0..=1.0`; 0.0 when either side has no words.
#[must_use]
pub fn similarity(a: &str, b: &str) -> f64 {
    let ta = trigrams(a);
    let tb = trigrams(b);
    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }
    let shared = ta.intersection(&tb).count();
    let union = ta.len() + tb.len() - shared;
    shared as f64 / union as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigrams_of_short_word() {
        let t = trigrams("Kone");
        assert_eq!(t.len(), 5);
        assert!(t.contains(&[' ', ' ', 'k']));
        assert!(t.contains(&['n', 'e', ' ']));
    }

    #[test]
    fn test_words_are_split_on_punctuation() {
        assert_eq!(trigrams("jean-marc"), trigrams("Jean Marc"));
    }

    #[test]
    fn test_identical_is_one() {
        assert_eq!(similarity("Kouassi", "KOUASSI"), 1.0);
    }

    #[test]
    fn test_unrelated_is_zero() {
        assert_eq!(similarity("Diallo", "Kouassi"), 0.0);
        assert_eq!(similarity("Amadou", "Yves"), 0.0);
    }

    #[test]
    fn test_empty_is_zero() {
        assert_eq!(similarity("", "Kone"), 0.0);
        assert_eq!(similarity("--", "--"), 0.0);
    }

    #[test]
    fn test_close_spelling() {
        // "  kone " vs "  konan ": shared {"  k", " ko", "kon"}, union 8
        let s = similarity("Kone", "Konan");
        assert!((s - 3.0 / 8.0).abs() < 1e-9, "{}", s);
        assert!(similarity("Kouassi", "Kouasi") > 0.5);
    }

    #[test]
    fn test_keys_are_lowercase_strings() {
        assert_eq!(trigram_keys("KONE"), vec!["  k", " ko", "kon", "ne ", "one"]);
        assert_eq!(trigram_keys("ÉLODIE"), trigram_keys("élodie"));
        assert!(trigram_keys("--").is_empty());
    }

    #[test]
    fn test_min_shared_bounds_similarity() {
        // 11 trigrams at floor 0.3: 3 shared caps similarity at 3/11 < 0.3
        assert_eq!(min_shared_trigrams(11, 0.3), 4);
        assert_eq!(min_shared_trigrams(10, 0.3), 3);
        assert_eq!(min_shared_trigrams(5, 0.0), 1);
        assert_eq!(min_shared_trigrams(5, 1.0), 5);

        // KOUASSIBLE vs COUASSIBLE share 8 of 11
        let shared = trigrams("KOUASSIBLE").intersection(&trigrams("COUASSIBLE")).count();
        assert_eq!(shared, 8);
        assert!(shared >= min_shared_trigrams(11, 0.3));
    }

    #[test]
    fn test_accents_are_letters() {
        assert!(similarity("Clémence", "Clemence") > 0.3);
        assert_eq!(trigrams("É").len(), 2);
    }
}
