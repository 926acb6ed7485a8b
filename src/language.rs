//! Output languages, and checking that a result is actually written in the
//! language we asked for.
//!
//! The model is prompted, not forced, to answer in a given language, so we
//! look at which scripts appear in the result. This is a heuristic: brand
//! names and numerals can confuse it, which is why short strings are ignored.

use std::{fmt, str::FromStr};

use clap::ValueEnum;
use schemars::JsonSchema;

use crate::{prelude::*, result::AnalysisResult};

/// Text must be longer than this many characters before we use it to judge
/// the language of a result. Prices, symbols and short labels are skipped.
pub const MIN_MEANINGFUL_TEXT_LEN: usize = 10;

/// Character ranges used by Japanese text: CJK punctuation, hiragana,
/// katakana, full-width and half-width forms, and kanji.
const JAPANESE_RANGES: &[(char, char)] = &[
    ('\u{3000}', '\u{303f}'),
    ('\u{3040}', '\u{309f}'),
    ('\u{30a0}', '\u{30ff}'),
    ('\u{ff00}', '\u{ff9f}'),
    ('\u{4e00}', '\u{9faf}'),
    ('\u{3400}', '\u{4dbf}'),
];

/// The languages we can ask the model to answer in.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Eq,
    Hash,
    JsonSchema,
    PartialEq,
    Serialize,
    ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum OutputLanguage {
    /// English.
    #[default]
    En,
    /// Japanese.
    Ja,
}

impl OutputLanguage {
    /// The locale tag for this language.
    pub fn tag(self) -> &'static str {
        match self {
            OutputLanguage::En => "en",
            OutputLanguage::Ja => "ja",
        }
    }

    /// Pick between an English and a Japanese version of a message.
    pub fn pick<'a>(self, en: &'a str, ja: &'a str) -> &'a str {
        match self {
            OutputLanguage::En => en,
            OutputLanguage::Ja => ja,
        }
    }
}

impl fmt::Display for OutputLanguage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for OutputLanguage {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "en" => Ok(OutputLanguage::En),
            "ja" => Ok(OutputLanguage::Ja),
            _ => Err(anyhow!("Unsupported output language: {:?}", s)),
        }
    }
}

/// Why a result failed the language check.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum LanguageError {
    /// The result has no text at all.
    #[error("no text content found")]
    NoTextContent,

    /// We asked for Japanese but got none.
    #[error("response is not in Japanese")]
    ExpectedJapanese,

    /// We asked for English but got Japanese.
    #[error("response contains Japanese characters")]
    UnexpectedJapanese,
}

/// Does `text` contain any Japanese characters?
pub fn has_japanese(text: &str) -> bool {
    text.chars().any(|c| {
        JAPANESE_RANGES
            .iter()
            .any(|&(start, end)| (start..=end).contains(&c))
    })
}

/// Check that `result` is written in `language`.
pub fn validate_language(
    result: &AnalysisResult,
    language: OutputLanguage,
) -> Result<(), LanguageError> {
    let texts = result.text_content();
    if texts.is_empty() {
        return Err(LanguageError::NoTextContent);
    }

    let meaningful = texts
        .iter()
        .filter(|text| text.chars().count() > MIN_MEANINGFUL_TEXT_LEN)
        .collect::<Vec<_>>();
    if meaningful.is_empty() {
        trace!("No text long enough to judge language");
        return Ok(());
    }

    let contains_japanese = meaningful.iter().any(|text| has_japanese(text));
    match language {
        OutputLanguage::Ja if !contains_japanese => Err(LanguageError::ExpectedJapanese),
        OutputLanguage::En if contains_japanese => Err(LanguageError::UnexpectedJapanese),
        _ => Ok(()),
    }
}
