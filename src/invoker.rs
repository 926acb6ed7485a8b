//! Asking a model about an image until we get a usable answer.

use std::sync::{Arc, Mutex};

use keen_retry::{ResolvedResult, RetryResult};

use crate::{
    drivers::{Driver, LlmOpts, ModelRequest},
    errors::{AnalysisError, AttemptError},
    extract::extract_json,
    image::ImageInput,
    language::{OutputLanguage, validate_language},
    prelude::*,
    prompts::prompt_for,
    result::AnalysisResult,
    retry::{
        RetryPolicy, retry_result_ok, retry_result_transient, try_retry_result,
        try_transient,
    },
    sanitize::sanitize_result,
};

/// The outcome of a single attempt.
type AttemptResult = RetryResult<(), (), AnalysisResult, AttemptError>;

/// Sends images to a model, and turns its replies into [`AnalysisResult`]s.
///
/// A reply only counts if it contains a JSON object with some text in it,
/// written in the requested language. Anything else is retried, up to the
/// limit set by our [`RetryPolicy`].
#[derive(Debug)]
pub struct ModelInvoker {
    driver: Arc<dyn Driver>,
    model: String,
    llm_opts: LlmOpts,
    retry_policy: RetryPolicy,
}

impl ModelInvoker {
    /// Create a new invoker.
    pub fn new(
        driver: Arc<dyn Driver>,
        model: impl Into<String>,
        llm_opts: LlmOpts,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            driver,
            model: model.into(),
            llm_opts,
            retry_policy,
        }
    }

    /// Analyze `image`, asking for an answer in `language`.
    ///
    /// Individual attempt failures are logged, but never returned. If no
    /// attempt succeeds, we return [`AnalysisError::ExhaustedRetries`].
    #[instrument(level = "debug", skip_all, fields(model = %self.model, %language))]
    pub async fn invoke(
        &self,
        image: &ImageInput,
        language: OutputLanguage,
    ) -> Result<AnalysisResult, AnalysisError> {
        // The request is identical for every attempt, so only encode the image
        // once.
        let request = ModelRequest::new(prompt_for(language), image);

        let attempt_number = Mutex::new(0);
        let result = self
            .attempt(&attempt_number, &request, language)
            .await
            .retry_with_async(|_| async {
                self.attempt(&attempt_number, &request, language).await
            })
            .with_delays(self.retry_policy.delays())
            .await
            .inspect_fatal(|_, fatal_error| {
                error!("FAILED with error {fatal_error}")
            })
            .inspect_recovered(|_, _, retry_errors_list| {
                info!(
                    "succeeded after retrying {} times (failed attempts: [{}])",
                    retry_errors_list.len(),
                    keen_retry::loggable_retry_errors(retry_errors_list)
                )
            })
            .inspect_given_up(|_, retry_errors_list, fatal_error| {
                error!(
                    "FAILED after exhausting all {} retrying attempts with error {fatal_error}. Previous transient failures: [{}]",
                    retry_errors_list.len(),
                    keen_retry::loggable_retry_errors(retry_errors_list)
                )
            });

        let attempts = *attempt_number.lock().expect("lock poisoned");
        match result {
            ResolvedResult::Ok { output, .. } | ResolvedResult::Recovered { output, .. } => {
                Ok(output)
            }
            ResolvedResult::Fatal { .. }
            | ResolvedResult::GivenUp { .. }
            | ResolvedResult::Unrecoverable { .. } => {
                Err(AnalysisError::ExhaustedRetries { attempts })
            }
        }
    }

    /// Make one attempt, and log how it went.
    async fn attempt(
        &self,
        attempt_number: &Mutex<u32>,
        request: &ModelRequest,
        language: OutputLanguage,
    ) -> AttemptResult {
        let attempt = {
            let mut attempt_number = attempt_number.lock().expect("lock poisoned");
            *attempt_number += 1;
            *attempt_number
        };
        let max_attempts = self.retry_policy.max_attempts;

        let result = self.attempt_inner(request, language).await;
        match &result {
            RetryResult::Ok { .. } => debug!(attempt, max_attempts, "Attempt succeeded"),
            RetryResult::Transient { error, .. } => {
                warn!(attempt, max_attempts, "Attempt failed: {error}")
            }
            RetryResult::Fatal { error, .. } => {
                warn!(attempt, max_attempts, "Attempt failed, giving up: {error}")
            }
        }
        result
    }

    async fn attempt_inner(
        &self,
        request: &ModelRequest,
        language: OutputLanguage,
    ) -> AttemptResult {
        let reply = try_retry_result!(
            self.driver
                .analyze_image(&self.model, request, &self.llm_opts)
                .await
        );
        if let Some(usage) = &reply.token_usage {
            debug!(
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                "Token usage"
            );
        }
        debug!(reply = %reply.text, "Model reply");

        if reply.text.trim().is_empty() {
            return retry_result_transient(AttemptError::EmptyReply);
        }
        let value = try_transient!(extract_json(&reply.text));
        let result = sanitize_result(&value);
        if result.is_empty() {
            return retry_result_transient(AttemptError::EmptyContent);
        }
        try_transient!(validate_language(&result, language));
        retry_result_ok(result)
    }
}
