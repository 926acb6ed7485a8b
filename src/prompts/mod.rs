//! Built-in prompts, one per output language.

use crate::language::OutputLanguage;

/// English prompt.
const PROMPT_EN: &str = include_str!("en.txt");

/// Japanese prompt.
const PROMPT_JA: &str = include_str!("ja.txt");

/// The prompt asking the model to answer in `language`.
pub fn prompt_for(language: OutputLanguage) -> &'static str {
    language.pick(PROMPT_EN, PROMPT_JA)
}
