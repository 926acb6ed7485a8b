//! Native LLM driver, for talking to a provider's own API instead of going
//! through an OpenAI-compatible gateway.
//!
//! For now, we use the [`genai`] crate, which picks the provider from the model
//! name and reads credentials from the usual environment variables.

use std::sync::Arc;

use genai::{
    Client,
    chat::{
        ChatMessage, ChatOptions, ChatRequest, ChatRole, ContentPart, ImageSource,
        MessageContent, Usage,
    },
    webc,
};

use crate::{
    prelude::*,
    retry::{IsKnownTransient, retry_result_ok, try_fatal, try_potentially_transient},
};

use super::{Driver, LlmOpts, LlmRetryResult, ModelRequest, RawReply, TokenUsage};

/// Environment variable holding the Gemini API key.
const GEMINI_API_KEY_VAR: &str = "GEMINI_API_KEY";

/// Real Gemini API keys are at least this long.
const MIN_GEMINI_API_KEY_LEN: usize = 30;

/// Our native driver.
#[derive(Debug)]
pub struct NativeDriver {
    /// The `genai` client.
    pub client: Client,
}

impl NativeDriver {
    /// Create a new native driver for `model`.
    ///
    /// For Gemini models, we check the API key up front, so that a missing key
    /// is reported once instead of failing every request.
    pub async fn new(model: &str) -> Result<Self> {
        if model.starts_with("gemini") {
            check_api_key(GEMINI_API_KEY_VAR, std::env::var(GEMINI_API_KEY_VAR).ok())?;
        }
        Ok(Self {
            client: Client::default(),
        })
    }
}

/// Make sure an API key is present and plausible.
fn check_api_key(var: &str, value: Option<String>) -> Result<()> {
    match value {
        None => Err(anyhow!(
            "API key is missing. Please set {var} in your environment or .env file."
        )),
        Some(key) if key.trim().len() < MIN_GEMINI_API_KEY_LEN => Err(anyhow!(
            "Invalid API key format in {var}. Please check your API key."
        )),
        Some(_) => Ok(()),
    }
}

#[async_trait]
impl Driver for NativeDriver {
    #[instrument(level = "debug", skip_all, fields(model = %model))]
    async fn analyze_image(
        &self,
        model: &str,
        request: &ModelRequest,
        llm_opts: &LlmOpts,
    ) -> LlmRetryResult<RawReply> {
        // Report what native driver we're using under the hood.
        if let Ok(service_target) = self.client.resolve_service_target(model).await {
            debug!(
                adapter_kind = %service_target.model.adapter_kind,
                "Using native driver"
            );
        }

        let req = to_genai_request(request);
        let opts = ChatOptions {
            temperature: llm_opts.temperature.map(f64::from),
            max_tokens: llm_opts.max_completion_tokens,
            top_p: llm_opts.top_p.map(f64::from),
            ..ChatOptions::default()
        };

        // Run our LLM request with a timeout.
        let future =
            llm_opts.apply_timeout(self.client.exec_chat(model, req, Some(&opts)));
        let chat_res = try_potentially_transient!(future.await);

        // Extract our response content. No content at all is an empty reply,
        // which the caller will retry.
        let text = match chat_res.content.as_ref() {
            Some(content) => try_fatal!(content.text_as_str().ok_or_else(|| anyhow!(
                "Expected text content in response, found: {:?}",
                content
            )))
            .to_owned(),
            None => String::new(),
        };

        // Compute our token usage.
        let token_usage = if let Usage {
            prompt_tokens: Some(prompt_tokens),
            completion_tokens: Some(completion_tokens),
            ..
        } = chat_res.usage
        {
            Some(TokenUsage {
                prompt_tokens: u64::try_from(prompt_tokens).unwrap_or_default(),
                completion_tokens: u64::try_from(completion_tokens).unwrap_or_default(),
            })
        } else {
            None
        };

        retry_result_ok(RawReply { text, token_usage })
    }
}

/// Convert a [`ModelRequest`] into a single-message [`genai`] chat request.
fn to_genai_request(request: &ModelRequest) -> ChatRequest {
    let parts = vec![
        ContentPart::Text(request.prompt.clone()),
        ContentPart::Image {
            content_type: request.mime_type.clone(),
            source: ImageSource::Base64(Arc::from(request.image_base64.as_str())),
        },
    ];
    ChatRequest {
        messages: vec![ChatMessage {
            role: ChatRole::User,
            content: MessageContent::Parts(parts),
            options: None,
        }],
        ..ChatRequest::default()
    }
}

impl IsKnownTransient for genai::Error {
    fn is_known_transient(&self) -> bool {
        match self {
            // These seem likely to be transient, but we have not observed them
            // in the wild yet.
            genai::Error::NoChatResponse { .. }
            | genai::Error::InvalidJsonResponseElement { .. } => true,
            genai::Error::WebAdapterCall { webc_error, .. }
            | genai::Error::WebModelCall { webc_error, .. } => {
                webc_error.is_known_transient()
            }
            // Assume other errors are fatal, until we discover otherwise in
            // production.
            _ => false,
        }
    }
}

impl IsKnownTransient for webc::Error {
    fn is_known_transient(&self) -> bool {
        match self {
            webc::Error::ResponseFailedNotJson { .. } => true,
            webc::Error::ResponseFailedStatus { status, .. } => {
                status.is_known_transient()
            }
            webc::Error::Reqwest(error) => error.is_known_transient(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::ImageInput;

    #[test]
    fn api_key_must_be_present_and_plausible() {
        let err = check_api_key("GEMINI_API_KEY", None).unwrap_err();
        assert!(err.to_string().contains("missing"));

        let err = check_api_key("GEMINI_API_KEY", Some("short".to_owned())).unwrap_err();
        assert!(err.to_string().contains("Invalid API key"));

        let key = "A".repeat(MIN_GEMINI_API_KEY_LEN);
        assert!(check_api_key("GEMINI_API_KEY", Some(key)).is_ok());
    }

    #[test]
    fn request_has_text_then_image() {
        let image = ImageInput::new(b"hi".to_vec(), "image/png");
        let req = to_genai_request(&ModelRequest::new("Describe this.", &image));
        assert_eq!(req.messages.len(), 1);
        match &req.messages[0].content {
            MessageContent::Parts(parts) => {
                assert!(matches!(&parts[0], ContentPart::Text(text) if text == "Describe this."));
                assert!(matches!(
                    &parts[1],
                    ContentPart::Image { content_type, .. } if content_type == "image/png"
                ));
            }
            other => panic!("expected parts, got {other:?}"),
        }
    }
}
