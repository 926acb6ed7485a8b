//! Our OpenAI driver, which we also use for LiteLLM, Ollama, Gemini's
//! compatibility endpoint and other compatible gateways.

use async_openai::{
    Client,
    config::OpenAIConfig,
    error::OpenAIError,
    types::{CreateChatCompletionResponse, FinishReason},
};

use crate::{
    prelude::*,
    retry::{
        IsKnownTransient, retry_result_fatal, retry_result_ok, try_fatal,
        try_potentially_transient,
    },
};

use super::{Driver, LlmOpts, LlmRetryResult, ModelRequest, RawReply, TokenUsage};

/// Our OpenAI driver.
#[derive(Debug)]
pub struct OpenAiDriver {
    /// The OpenAI client.
    pub client: Client<OpenAIConfig>,
}

impl OpenAiDriver {
    /// Create a new OpenAI driver, configured from `OPENAI_API_KEY` and
    /// `OPENAI_API_BASE`.
    pub async fn new() -> Result<Self> {
        let mut client_config = OpenAIConfig::new();
        if let Ok(api_key) = std::env::var("OPENAI_API_KEY") {
            client_config = client_config.with_api_key(api_key);
        }
        if let Ok(api_base) = std::env::var("OPENAI_API_BASE") {
            client_config = client_config.with_api_base(api_base);
        }
        Ok(Self {
            client: Client::with_config(client_config),
        })
    }
}

#[async_trait]
impl Driver for OpenAiDriver {
    #[instrument(level = "debug", skip_all, fields(model = %model))]
    async fn analyze_image(
        &self,
        model: &str,
        request: &ModelRequest,
        llm_opts: &LlmOpts,
    ) -> LlmRetryResult<RawReply> {
        let req = chat_request_body(model, request, llm_opts);

        // Call OpenAI. We use the "bring your own types" API so that we can
        // send a hand-built request and inspect the raw response.
        let chat = self.client.chat();
        let future = llm_opts.apply_timeout(chat.create_byot(req));
        let chat_result: Value = try_potentially_transient!(future.await);
        trace!(%chat_result, "OpenAI response");
        parse_chat_response(chat_result)
    }
}

/// Build a `/chat/completions` request with our prompt and image.
fn chat_request_body(model: &str, request: &ModelRequest, llm_opts: &LlmOpts) -> Value {
    let mut req = json!({
        "model": model,
        "messages": [{
            "role": "user",
            "content": [
                { "type": "text", "text": request.prompt },
                { "type": "image_url", "image_url": { "url": request.image_data_url() } },
            ],
        }],
    });
    if let Some(max_completion_tokens) = llm_opts.max_completion_tokens {
        req["max_completion_tokens"] = json!(max_completion_tokens);
    }
    if let Some(temperature) = llm_opts.temperature {
        req["temperature"] = json!(temperature);
    }
    if let Some(top_p) = llm_opts.top_p {
        req["top_p"] = json!(top_p);
    }
    req
}

/// Pull the reply text and token usage out of a raw response.
fn parse_chat_response(chat_result: Value) -> LlmRetryResult<RawReply> {
    let response = try_fatal!(
        serde_json::from_value::<CreateChatCompletionResponse>(chat_result)
            .context("Error parsing OpenAI response")
    );

    // How many tokens did we use?
    let token_usage = response.usage.map(|usage| TokenUsage {
        prompt_tokens: u64::from(usage.prompt_tokens),
        completion_tokens: u64::from(usage.completion_tokens),
    });

    let Some(choice) = response.choices.first() else {
        return retry_result_fatal(anyhow!("No choices in OpenAI response"));
    };
    if choice.finish_reason == Some(FinishReason::ContentFilter) {
        return retry_result_fatal(anyhow!(
            "Content filter triggered (may also be a RECITATION error for Gemini models)"
        ));
    }
    let text = choice.message.content.clone().unwrap_or_default();
    retry_result_ok(RawReply { text, token_usage })
}

impl IsKnownTransient for OpenAIError {
    fn is_known_transient(&self) -> bool {
        match self {
            OpenAIError::Reqwest(err) => err.is_known_transient(),
            // Overloaded gateways sometimes answer with an HTML error page.
            OpenAIError::JSONDeserialize(_) => true,
            // Assume other errors are fatal, until we discover otherwise in
            // production.
            _ => false,
        }
    }
}
