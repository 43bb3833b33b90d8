//! Language-conditional text normalization for the lexical index.
//!
//! Produces the `lemma_text` side of each chunk: Russian (the default and
//! the fallback for unknown codes) is lowercased, mapped from pre-reform
//! orthography to modern characters, and reduced to Snowball stems; Kazakh
//! and Tatar are lowercased word tokens without stemming so their extended
//! Cyrillic letters survive untouched; English is lowercased word tokens.
//! Raw text is never normalized — only the lemma field is.
//!
//! Every path is idempotent: normalizing already-normalized text returns
//! the same text.

use std::sync::LazyLock;

use regex::Regex;
use rust_stemmers::{Algorithm, Stemmer};
use unicode_segmentation::UnicodeSegmentation;

/// Word pattern for the Russian pipeline. Pre-reform characters are mapped
/// to modern equivalents before this is applied, so the basic ranges
/// suffice.
pub static WORD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[0-9A-Za-zА-Яа-яЁё]+").unwrap());

// Terminal hard sign at a word boundary, stripped for lemma text.
static TERMINAL_HARD_SIGN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"ъ\b").unwrap());

static PREREV_CHARS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("[\u{0462}\u{0463}\u{0472}\u{0473}\u{0406}\u{0456}\u{0474}\u{0475}]").unwrap());

/// Character-level substitution (pre-revolutionary → modern):
/// Ѣ/ѣ → Е/е (yat), Ѳ/ѳ → Ф/ф (fita), І/і → И/и, Ѵ/ѵ → И/и (izhitsa).
fn map_prerev_char(ch: char) -> char {
    match ch {
        '\u{0462}' => 'Е',
        '\u{0463}' => 'е',
        '\u{0472}' => 'Ф',
        '\u{0473}' => 'ф',
        '\u{0406}' => 'И',
        '\u{0456}' => 'и',
        '\u{0474}' => 'И',
        '\u{0475}' => 'и',
        other => other,
    }
}

/// True if `text` contains any pre-revolutionary Cyrillic characters.
pub fn has_prerev_characters(text: &str) -> bool {
    PREREV_CHARS_RE.is_match(text)
}

/// Map pre-reform characters to modern equivalents and strip terminal ъ.
///
/// Only for lemma text; `raw_text` must always preserve the original.
pub fn normalize_prerev_to_modern(text: &str) -> String {
    let mapped: String = text.chars().map(map_prerev_char).collect();
    TERMINAL_HARD_SIGN_RE.replace_all(&mapped, "").into_owned()
}

/// Normalize `text` for the lexical index according to `language`.
pub fn normalize_text(text: &str, language: &str) -> String {
    match language {
        "kk" | "tt" | "en" => lowercase_tokens(text),
        _ => russian_lemmas(text).join(" "),
    }
}

/// Query-side twin of [`normalize_text`]; both sides must agree for
/// retrieval parity.
pub fn normalize_query(query: &str, language: &str) -> String {
    normalize_text(query, language)
}

fn lowercase_tokens(text: &str) -> String {
    text.unicode_words()
        .map(|word| word.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

fn russian_lemmas(text: &str) -> Vec<String> {
    let lowered = text.to_lowercase().replace('ё', "е");
    let modernized = normalize_prerev_to_modern(&lowered);
    let stemmer = Stemmer::create(Algorithm::Russian);

    WORD_RE
        .find_iter(&modernized)
        .map(|token| stem_fixpoint(&stemmer, token.as_str()).replace('ё', "е"))
        .collect()
}

/// Snowball stems are not always fixpoints ("наблюдения" → "наблюден" →
/// "наблюд"); iterate until stable so the whole pipeline stays idempotent.
fn stem_fixpoint(stemmer: &Stemmer, token: &str) -> String {
    let mut current = token.to_string();
    loop {
        let next = stemmer.stem(&current).into_owned();
        if next == current {
            return current;
        }
        current = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn russian_inflections_collapse_to_one_form() {
        let result = normalize_text("книга книги КНИГУ", "ru");
        let tokens: Vec<&str> = result.split(' ').collect();
        assert_eq!(tokens.len(), 3);
        assert_eq!(tokens[0], tokens[1]);
        assert_eq!(tokens[1], tokens[2]);
    }

    #[test]
    fn russian_folds_yo() {
        let result = normalize_text("Ёжик и ёлки", "ru");
        assert!(!result.contains('ё'));
        assert!(!result.contains('Ё'));
    }

    #[test]
    fn russian_is_default_for_unknown_codes() {
        assert_eq!(normalize_text("Книги", "xx"), normalize_text("Книги", "ru"));
    }

    #[test]
    fn prerev_text_matches_modern_equivalent() {
        let prerev = normalize_text("Сѣверъ", "ru");
        assert!(!prerev.contains('ѣ'));
        assert!(!prerev.ends_with('ъ'));
        assert_eq!(prerev, normalize_text("север", "ru"));
    }

    #[test]
    fn prerev_mapping_handles_every_archaic_letter() {
        let mapped = normalize_prerev_to_modern("ѣдоки ѳита міръ ѵпостась");
        assert_eq!(mapped, "едоки фита мир ипостась");
    }

    #[test]
    fn prerev_detection() {
        assert!(has_prerev_characters("Сѣверъ"));
        assert!(!has_prerev_characters("Север"));
    }

    #[test]
    fn kazakh_keeps_extended_cyrillic() {
        let result = normalize_text("КІТАП кітаптар", "kk");
        assert_eq!(result, "кітап кітаптар");
    }

    #[test]
    fn tatar_is_lowercased_without_stemming() {
        assert_eq!(normalize_text("КИТАП китаплар", "tt"), "китап китаплар");
    }

    #[test]
    fn english_is_lowercased() {
        assert_eq!(normalize_text("Books and Libraries", "en"), "books and libraries");
    }

    #[test]
    fn normalization_is_idempotent() {
        let cases = [
            ("Практика внимательного наблюдения за мыслями", "ru"),
            ("Сѣверъ и ёлки", "ru"),
            ("книга книги книгу читателям", "ru"),
            ("Тарих һәм мәдениет туралы", "kk"),
            ("Books and Libraries", "en"),
        ];
        for (text, language) in cases {
            let once = normalize_text(text, language);
            let twice = normalize_text(&once, language);
            assert_eq!(once, twice, "language {language}");
        }
    }

    #[test]
    fn query_and_text_normalization_agree() {
        assert_eq!(
            normalize_query("практика наблюдения", "ru"),
            normalize_text("практика наблюдения", "ru")
        );
    }
}
