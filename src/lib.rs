//! Describe images with multimodal LLMs.
//!
//! The heart of this crate is [`pipeline::Pipeline`], which takes an
//! [`image::ImageInput`] and returns a typed [`result::AnalysisResult`] in the
//! requested [`language::OutputLanguage`]. Along the way it validates the
//! image, checks a local cache keyed by content fingerprint and language,
//! asks the model (retrying with backoff until the reply parses and is in the
//! right language), and caches the answer.
//!
//! The `image-insight` binary is a thin command-line wrapper around this.

pub mod cache;
pub mod cmd;
pub mod drivers;
pub mod errors;
pub mod extract;
pub mod fingerprint;
pub mod image;
pub mod invoker;
pub mod language;
pub mod pipeline;
pub mod prelude;
pub mod prompts;
pub mod result;
pub mod retry;
pub mod sanitize;
pub mod ui;
