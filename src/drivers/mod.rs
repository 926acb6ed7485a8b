//! LLM drivers.
//!
//! A driver sends one prompt plus one image to a multimodal model and returns
//! whatever text comes back. It knows nothing about the shape of that text;
//! parsing and validation happen in [`crate::invoker`].

use std::{error, fmt, pin::Pin, sync::Arc, time::Duration};

use clap::{Args, ValueEnum};
use futures::{FutureExt as _, TryFutureExt as _};
use keen_retry::RetryResult;
use tokio::time;

use crate::{image::ImageInput, prelude::*, retry::IsKnownTransient};

pub mod echo;
pub mod native;
pub mod openai;
#[cfg(test)]
pub mod scripted;

/// Our different driver types.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[clap(rename_all = "snake_case")]
pub enum DriverType {
    /// OpenAI-compatible driver (also for LiteLLM, Ollama, and Gemini's
    /// OpenAI compatibility endpoint).
    #[default]
    #[clap(name = "openai")]
    OpenAI,

    /// Talk to the model's own API directly.
    Native,

    /// Answer without calling any model. For testing.
    Echo,
}

impl DriverType {
    /// Instantiate an appropriate driver for `model`.
    pub async fn create_driver(&self, model: &str) -> Result<Arc<dyn Driver>> {
        match self {
            DriverType::OpenAI => Ok(Arc::new(openai::OpenAiDriver::new().await?)),
            DriverType::Native => Ok(Arc::new(native::NativeDriver::new(model).await?)),
            DriverType::Echo => Ok(Arc::new(echo::EchoDriver::new())),
        }
    }
}

/// Our LLM-related options.
#[derive(Args, Clone, Debug, Default)]
pub struct LlmOpts {
    /// An upper limit on the number of completion tokens to generate. This may
    /// help prevent runaway responses, but it may also cause incomplete
    /// results.
    #[clap(long)]
    pub max_completion_tokens: Option<u32>,

    /// The temperature to use for sampling, between 0.0 and 2.0. Defaults to
    /// the model's default.
    #[clap(long)]
    pub temperature: Option<f32>,

    /// The top-p sampling value to use, between 0.0 and 1.0. Defaults to the
    /// model's default.
    #[clap(long)]
    pub top_p: Option<f32>,

    /// A timeout, in seconds, for the LLM to return a complete response.
    /// Timed-out requests are retried.
    #[clap(long)]
    pub timeout: Option<u64>,
}

impl LlmOpts {
    /// Apply a timeout to a future.
    ///
    /// `'fut` is the lifetime of any data borrowed by `future`, which we need
    /// to preserve in the boxed future we return. We box because the two
    /// branches below produce different future types.
    pub fn apply_timeout<'fut, T, E>(
        &self,
        future: impl Future<Output = Result<T, E>> + Send + 'fut,
    ) -> Pin<Box<dyn Future<Output = Result<T, LlmError<E>>> + Send + 'fut>>
    where
        T: Send + 'static,
        E: Send + 'static,
    {
        let future = future.map_err(LlmError::Native);
        if let Some(timeout) = self.timeout {
            time::timeout(Duration::from_secs(timeout), future)
                // We have a `Result<Result<T, LlmError<E>>, Elapsed>` here, and
                // we want to convert it to a `Result<T, LlmError<E>>`.
                .map(|result| match result {
                    Ok(inner) => inner,
                    Err(_) => Err(LlmError::Timeout),
                })
                .boxed()
        } else {
            future.boxed()
        }
    }
}

/// A [`RetryResult`] for LLM requests. This allows [`Driver`] instances to
/// distinguish between errors that may be transient, and errors that are
/// definitely fatal.
pub type LlmRetryResult<T> = RetryResult<(), (), T, anyhow::Error>;

/// Interface trait for LLM drivers.
#[async_trait]
pub trait Driver: fmt::Debug + Send + Sync + 'static {
    /// Send `request` to `model` and return the raw text of its reply.
    ///
    /// An empty reply is not an error at this level.
    async fn analyze_image(
        &self,
        model: &str,
        request: &ModelRequest,
        llm_opts: &LlmOpts,
    ) -> LlmRetryResult<RawReply>;
}

/// A prompt and an image, encoded the way model APIs expect.
///
/// We build this once per analysis and reuse it for every retry.
#[derive(Clone)]
pub struct ModelRequest {
    /// The instructions for the model.
    pub prompt: String,

    /// MIME type of the image.
    pub mime_type: String,

    /// The image, as standard Base64.
    pub image_base64: String,
}

impl ModelRequest {
    /// Build a request for `image`.
    pub fn new(prompt: impl Into<String>, image: &ImageInput) -> Self {
        Self {
            prompt: prompt.into(),
            mime_type: image.mime_type().to_owned(),
            image_base64: image.to_base64(),
        }
    }

    /// The image as a `data:` URL.
    pub fn image_data_url(&self) -> String {
        // Some sources say the Base64 data should be percent-encoded, but in
        // practice that breaks Gemini and probably several other LLMs.
        format!("data:{};base64,{}", self.mime_type, self.image_base64)
    }
}

impl fmt::Debug for ModelRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelRequest")
            .field("mime_type", &self.mime_type)
            .field("image_base64_len", &self.image_base64.len())
            .finish_non_exhaustive()
    }
}

/// The unparsed reply from a model.
#[derive(Debug)]
pub struct RawReply {
    /// The text of the reply. This is supposed to contain JSON, but nothing
    /// guarantees it.
    pub text: String,

    /// Token usage.
    pub token_usage: Option<TokenUsage>,
}

/// Token usage.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TokenUsage {
    /// How many tokens were used in the prompt?
    pub prompt_tokens: u64,

    /// How many tokens were used in the response?
    pub completion_tokens: u64,
}

/// An error which occurred while calling an LLM.
///
/// Used internally by drivers to handle timeouts.
#[derive(Debug)]
pub enum LlmError<E> {
    /// A native error.
    Native(E),

    /// A timeout error.
    Timeout,
}

impl<E> IsKnownTransient for LlmError<E>
where
    E: IsKnownTransient,
{
    /// Is this a known transient error?
    fn is_known_transient(&self) -> bool {
        match self {
            LlmError::Native(err) => err.is_known_transient(),
            // Runaway LLM responses and some kinds of network timeouts can be retried
            // with hope of a better result.
            LlmError::Timeout => true,
        }
    }
}

impl<E> fmt::Display for LlmError<E>
where
    E: fmt::Display,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LlmError::Native(err) => write!(f, "LLM error: {err}"),
            LlmError::Timeout => write!(f, "LLM request timed out"),
        }
    }
}

impl<E> error::Error for LlmError<E>
where
    E: error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            LlmError::Native(err) => Some(err),
            LlmError::Timeout => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Permanent;

    impl IsKnownTransient for Permanent {
        fn is_known_transient(&self) -> bool {
            false
        }
    }

    #[test]
    fn data_url_uses_base64() {
        let image = ImageInput::new(b"hi".to_vec(), "image/png");
        let request = ModelRequest::new("describe", &image);
        assert_eq!(request.image_data_url(), "data:image/png;base64,aGk=");
    }

    #[test]
    fn timeouts_are_transient() {
        assert!(LlmError::<Permanent>::Timeout.is_known_transient());
        assert!(!LlmError::Native(Permanent).is_known_transient());
    }

    #[tokio::test]
    async fn apply_timeout_reports_timeouts() {
        let opts = LlmOpts {
            timeout: Some(0),
            ..LlmOpts::default()
        };
        let result = opts
            .apply_timeout(async {
                time::sleep(Duration::from_secs(5)).await;
                Ok::<_, anyhow::Error>(())
            })
            .await;
        assert!(matches!(result, Err(LlmError::Timeout)));
    }
}
