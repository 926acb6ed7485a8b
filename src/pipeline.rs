//! The analysis pipeline: validate, fingerprint, check the cache, ask the
//! model, and remember the answer.

use std::sync::RwLock;

use crate::{
    cache::ResultCache,
    errors::AnalysisError,
    fingerprint::Fingerprint,
    image::{ImageInput, ImageLimits},
    invoker::ModelInvoker,
    language::OutputLanguage,
    prelude::*,
    result::AnalysisResult,
};

/// Turns images into [`AnalysisResult`]s, using a cache where possible.
///
/// The output language is shared by all analyses run through a pipeline.
/// Changing it discards every cached result.
#[derive(Debug)]
pub struct Pipeline {
    limits: ImageLimits,
    cache: ResultCache,
    invoker: ModelInvoker,
    language: RwLock<LanguageState>,
}

/// The current output language, and how many times it has changed.
#[derive(Clone, Copy, Debug)]
struct LanguageState {
    language: OutputLanguage,
    generation: u64,
}

impl Pipeline {
    /// Create a pipeline producing results in `language`.
    ///
    /// If the cache was last used with a different language, it is cleared,
    /// exactly as if [`Self::set_output_language`] had been called.
    pub async fn new(
        limits: ImageLimits,
        cache: ResultCache,
        invoker: ModelInvoker,
        language: OutputLanguage,
    ) -> Self {
        if let Some(previous) = cache.remembered_language().await
            && previous != language
        {
            info!(%previous, %language, "Output language changed, clearing cache");
            cache.clear_all().await;
        }
        cache.remember_language(language).await;
        Self {
            limits,
            cache,
            invoker,
            language: RwLock::new(LanguageState {
                language,
                generation: 0,
            }),
        }
    }

    /// The current output language.
    pub fn output_language(&self) -> OutputLanguage {
        self.language_state().language
    }

    fn language_state(&self) -> LanguageState {
        *self.language.read().expect("lock poisoned")
    }

    /// Switch to a new output language. If it differs from the current one,
    /// all cached results are discarded.
    #[instrument(level = "debug", skip(self))]
    pub async fn set_output_language(&self, language: OutputLanguage) {
        let previous = {
            let mut state = self.language.write().expect("lock poisoned");
            let previous = state.language;
            if previous != language {
                state.language = language;
                state.generation += 1;
            }
            previous
        };
        if previous == language {
            return;
        }
        info!(%previous, %language, "Output language changed, clearing cache");
        self.cache.clear_all().await;
        self.cache.remember_language(language).await;
    }

    /// Discard all cached results.
    pub async fn clear_cache(&self) {
        self.cache.clear_all().await;
    }

    /// Analyze `image` in the current output language.
    pub async fn analyze(&self, image: &ImageInput) -> Result<AnalysisResult, AnalysisError> {
        // Take the language once, so that the cache lookup, the prompt and
        // the cache write all agree, even if someone changes it meanwhile.
        let state = self.language_state();
        self.analyze_with(image, state.language, state.generation)
            .await
    }

    /// Read and analyze the image at `path`. See [`ImageInput::from_path`] for
    /// how `mime_type` is used.
    #[instrument(level = "debug", skip(self, path), fields(path = %path.display()))]
    pub async fn analyze_path(
        &self,
        path: &Path,
        mime_type: Option<&str>,
    ) -> Result<AnalysisResult, AnalysisError> {
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(AnalysisError::Read)?;
        self.limits.check_size(metadata.len())?;

        let image = ImageInput::from_path(path, mime_type)
            .await
            .map_err(AnalysisError::Read)?;
        self.analyze(&image).await
    }

    /// Analyze `image` in `language`, which need not be the current output
    /// language.
    pub async fn analyze_in(
        &self,
        image: &ImageInput,
        language: OutputLanguage,
    ) -> Result<AnalysisResult, AnalysisError> {
        let generation = self.language_state().generation;
        self.analyze_with(image, language, generation).await
    }

    /// Analyze `image` in `language`. `generation` is the language generation
    /// when the request started.
    #[instrument(level = "debug", skip_all, fields(%language, ?image))]
    async fn analyze_with(
        &self,
        image: &ImageInput,
        language: OutputLanguage,
        generation: u64,
    ) -> Result<AnalysisResult, AnalysisError> {
        self.limits.validate(image)?;

        let fingerprint = Fingerprint::from_bytes(image.data())
            .await
            .map_err(AnalysisError::Read)?;
        if let Some(result) = self.cache.get(&fingerprint, language).await {
            debug!(%fingerprint, "Cache hit");
            return Ok(result);
        }
        debug!(%fingerprint, "Cache miss");

        let result = self.invoker.invoke(image, language).await?;

        // If the language changed while we were waiting on the model, the
        // cache has been cleared since. Don't refill it with a result in the
        // old language.
        if self.language_state().generation == generation {
            self.cache.put(&fingerprint, language, &result).await;
        } else {
            debug!(%fingerprint, "Output language changed during analysis, not caching");
        }
        Ok(result)
    }
}
