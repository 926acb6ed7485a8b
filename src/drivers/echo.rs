//! Echo driver for testing.
//!
//! This driver never talks to a model. It answers with a small, well-formed
//! result describing the image it was sent, in whichever language the prompt
//! asks for, so that the whole pipeline can be exercised offline.

use crate::{language::has_japanese, prelude::*, retry::retry_result_ok};

use super::{Driver, LlmOpts, LlmRetryResult, ModelRequest, RawReply, TokenUsage};

/// Echo driver for testing.
#[derive(Debug, Default)]
pub struct EchoDriver;

impl EchoDriver {
    /// Create a new echo driver.
    pub fn new() -> Self {
        Self
    }
}

/// Build the reply we'd expect a well-behaved model to send.
fn echo_reply(request: &ModelRequest) -> Value {
    let mime_type = &request.mime_type;
    let len = request.image_base64.len();
    if has_japanese(&request.prompt) {
        json!({
            "description": format!("{mime_type} 画像のエコーです。"),
            "text": "",
            "menuItems": [],
            "tables": [],
            "analysis": [format!("Base64データの長さは{len}文字です。")],
        })
    } else {
        json!({
            "description": format!("Echo of an {mime_type} image."),
            "text": "",
            "menuItems": [],
            "tables": [],
            "analysis": [format!("The Base64 payload is {len} characters long.")],
        })
    }
}

#[async_trait]
impl Driver for EchoDriver {
    async fn analyze_image(
        &self,
        _model: &str,
        request: &ModelRequest,
        _llm_opts: &LlmOpts,
    ) -> LlmRetryResult<RawReply> {
        retry_result_ok(RawReply {
            text: echo_reply(request).to_string(),
            token_usage: Some(TokenUsage::default()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        image::ImageInput,
        language::{OutputLanguage, validate_language},
        prompts::prompt_for,
        sanitize::sanitize_result,
    };

    #[test]
    fn echo_replies_pass_language_validation() {
        let image = ImageInput::new(b"fake png".to_vec(), "image/png");
        for language in [OutputLanguage::En, OutputLanguage::Ja] {
            let request = ModelRequest::new(prompt_for(language), &image);
            let result = sanitize_result(&echo_reply(&request));
            assert!(!result.is_empty());
            assert_eq!(validate_language(&result, language), Ok(()));
        }
    }
}
