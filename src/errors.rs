//! Errors reported by the analysis pipeline.
//!
//! Callers only ever see an [`AnalysisError`]. The per-attempt details in
//! [`AttemptError`] are logged by the invoker and then discarded.

use std::io;

use crate::{
    extract::ExtractError, image::ValidationError, language::LanguageError,
    language::OutputLanguage,
};

/// Why an analysis failed.
#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    /// The image was rejected before we called the model.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// We couldn't read the image.
    #[error("could not read image: {0}")]
    Read(#[source] io::Error),

    /// Every attempt to get a usable answer from the model failed.
    #[error("image analysis failed after {attempts} attempt(s)")]
    ExhaustedRetries { attempts: u32 },
}

impl AnalysisError {
    /// A message suitable for showing to the user, in their language.
    pub fn localized_message(&self, language: OutputLanguage) -> String {
        match self {
            AnalysisError::Validation(err) => err.localized_message(language),
            AnalysisError::Read(_) | AnalysisError::ExhaustedRetries { .. } => language
                .pick(
                    "Image analysis failed. Please try again.",
                    "画像の分析に失敗しました。もう一度お試しください。",
                )
                .to_owned(),
        }
    }
}

/// Why a single attempt to analyze an image failed. All of these are worth
/// retrying.
#[derive(Debug, thiserror::Error)]
pub enum AttemptError {
    /// The driver couldn't get a reply from the model.
    #[error("model request failed: {0:#}")]
    Transport(#[from] anyhow::Error),

    /// The model replied with nothing.
    #[error("model returned an empty reply")]
    EmptyReply,

    /// The reply did not contain a JSON object.
    #[error(transparent)]
    Parse(#[from] ExtractError),

    /// The reply parsed, but contained no text.
    #[error("model returned a result with no content")]
    EmptyContent,

    /// The reply was in the wrong language.
    #[error("wrong output language: {0}")]
    LanguageMismatch(#[from] LanguageError),
}
