//! Language detection for multilingual document ingestion (kk/ru/tt/en).
//!
//! Detection is restricted to the four supported languages and falls back
//! to Russian when inconclusive. Kazakh and Tatar are recognized by their
//! distinctive Cyrillic letters before the statistical detector decides
//! between Russian and English.

use whatlang::{Detector, Lang};

pub const SUPPORTED_LANGUAGES: [&str; 4] = ["kk", "ru", "tt", "en"];
pub const FALLBACK_LANGUAGE: &str = "ru";

const SAMPLE_CHARS: usize = 3000;

// Letters present in Kazakh orthography but absent from Tatar.
const KAZAKH_ONLY: [char; 4] = ['ғ', 'қ', 'ұ', 'і'];
// җ is the one letter unique to Tatar within this pair.
const TATAR_ONLY: [char; 1] = ['җ'];
// Shared by both Turkic alphabets, absent from Russian.
const TURKIC_SHARED: [char; 5] = ['ә', 'ң', 'ө', 'ү', 'һ'];

pub fn is_supported(code: &str) -> bool {
    SUPPORTED_LANGUAGES.contains(&code)
}

/// Return the ISO 639-1 code for `text`, sampling up to 3000 characters.
pub fn detect_language(text: &str) -> String {
    let sample: String = text.chars().take(SAMPLE_CHARS).collect();
    let sample = sample.trim();
    if sample.is_empty() {
        return FALLBACK_LANGUAGE.to_string();
    }

    if let Some(code) = detect_turkic(sample) {
        return code.to_string();
    }

    let detector = Detector::with_allowlist(vec![Lang::Rus, Lang::Eng]);
    match detector.detect_lang(sample) {
        Some(Lang::Eng) => "en".to_string(),
        Some(Lang::Rus) => "ru".to_string(),
        _ => FALLBACK_LANGUAGE.to_string(),
    }
}

/// Prefer a container-supplied tag when it names a supported language,
/// otherwise detect from the text.
pub fn resolve_language(metadata_language: Option<&str>, text: &str) -> String {
    if let Some(tag) = metadata_language {
        // "ru-RU" and friends reduce to their primary subtag.
        let primary = tag
            .trim()
            .split(['-', '_'])
            .next()
            .unwrap_or("")
            .to_lowercase();
        if is_supported(&primary) {
            return primary;
        }
    }
    detect_language(text)
}

fn detect_turkic(sample: &str) -> Option<&'static str> {
    let mut kazakh = 0usize;
    let mut tatar = 0usize;
    let mut shared = 0usize;

    for ch in sample.chars().flat_map(|c| c.to_lowercase()) {
        if KAZAKH_ONLY.contains(&ch) {
            kazakh += 1;
        } else if TATAR_ONLY.contains(&ch) {
            tatar += 1;
        } else if TURKIC_SHARED.contains(&ch) {
            shared += 1;
        }
    }

    // A single stray letter is not evidence.
    if kazakh + tatar + shared < 2 {
        return None;
    }
    if tatar > 0 && tatar >= kazakh {
        return Some("tt");
    }
    if kazakh > 0 {
        return Some("kk");
    }
    // Kazakh text of any real length shows қ/ғ/ұ/і; a sample carrying only
    // the shared letters reads as Tatar.
    Some("tt")
}
