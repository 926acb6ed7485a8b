//! A driver which plays back canned replies, for unit tests.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use tokio::sync::Notify;

use crate::{
    prelude::*,
    retry::{retry_result_fatal, retry_result_ok, retry_result_transient},
};

use super::{Driver, LlmOpts, LlmRetryResult, ModelRequest, RawReply};

/// One scripted reply.
#[derive(Clone, Debug)]
pub enum Reply {
    /// Return this text.
    Text(String),
    /// Fail with a transient error.
    Transient,
    /// Fail with a fatal error.
    Fatal,
}

impl Reply {
    pub fn text(text: impl Into<String>) -> Self {
        Reply::Text(text.into())
    }
}

/// Plays back `replies` in order, then repeats `fallback` forever.
#[derive(Debug)]
pub struct ScriptedDriver {
    replies: Mutex<VecDeque<Reply>>,
    fallback: Reply,
    prompts: Mutex<Vec<String>>,
    gate: Option<Gate>,
}

/// Lets a test pause the driver in the middle of a request.
#[derive(Clone, Debug, Default)]
pub struct Gate {
    /// Notified when a request arrives.
    pub entered: Arc<Notify>,
    /// The request waits for this before replying.
    pub release: Arc<Notify>,
}

impl ScriptedDriver {
    pub fn new(replies: impl IntoIterator<Item = Reply>, fallback: Reply) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().collect()),
            fallback,
            prompts: Mutex::new(vec![]),
            gate: None,
        }
    }

    /// Pause every request at `gate`.
    pub fn with_gate(mut self, gate: Gate) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Always give the same reply.
    pub fn always(reply: Reply) -> Self {
        Self::new([], reply)
    }

    /// How many times have we been called?
    pub fn calls(&self) -> usize {
        self.prompts.lock().expect("lock poisoned").len()
    }

    /// The prompts we've been sent, in order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().expect("lock poisoned").clone()
    }
}

#[async_trait]
impl Driver for ScriptedDriver {
    async fn analyze_image(
        &self,
        _model: &str,
        request: &ModelRequest,
        _llm_opts: &LlmOpts,
    ) -> LlmRetryResult<RawReply> {
        self.prompts
            .lock()
            .expect("lock poisoned")
            .push(request.prompt.clone());
        if let Some(gate) = &self.gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        let reply = self
            .replies
            .lock()
            .expect("lock poisoned")
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        match reply {
            Reply::Text(text) => retry_result_ok(RawReply {
                text,
                token_usage: None,
            }),
            Reply::Transient => retry_result_transient(anyhow!("scripted transient failure")),
            Reply::Fatal => retry_result_fatal(anyhow!("scripted fatal failure")),
        }
    }
}
