//! The `analyze` subcommand.

use std::{sync::Arc, time::Duration};

use clap::Args;
use futures::{StreamExt as _, stream};
use schemars::JsonSchema;
use tokio::io::{AsyncWriteExt as _, BufWriter};

use crate::{
    cache::{CacheBackend, DEFAULT_CACHE_TTL, DirBackend, MemoryBackend, ResultCache},
    drivers::{DriverType, LlmOpts},
    errors::AnalysisError,
    image::{DEFAULT_MAX_FILE_SIZE, ImageLimits},
    invoker::ModelInvoker,
    language::OutputLanguage,
    pipeline::Pipeline,
    prelude::*,
    result::AnalysisResult,
    retry::RetryPolicy,
    ui::{ProgressConfig, Ui},
};

use super::{CacheDirOpts, create_writer};

/// The model we use unless told otherwise.
const DEFAULT_MODEL: &str = "gemini-1.5-flash";

/// `analyze` command line arguments.
#[derive(Debug, Args)]
pub struct AnalyzeOpts {
    /// Image files to analyze.
    #[clap(required = true, value_name = "IMAGE")]
    pub images: Vec<PathBuf>,

    /// Language to answer in. Switching languages clears the cache.
    #[clap(short = 'l', long, value_enum, default_value_t = OutputLanguage::default())]
    pub language: OutputLanguage,

    /// The model to use.
    #[clap(short = 'm', long, default_value = DEFAULT_MODEL)]
    pub model: String,

    /// The driver to use for talking to the model.
    #[clap(long, value_enum, default_value_t = DriverType::default())]
    pub driver: DriverType,

    /// MIME type of the images. Normally guessed from file names and contents.
    #[clap(long)]
    pub mime_type: Option<String>,

    #[clap(flatten)]
    pub cache_dir: CacheDirOpts,

    /// Don't use the on-disk cache. Results are still shared between
    /// identical images within a run.
    #[clap(long)]
    pub no_cache: bool,

    /// How long cached results stay valid, in hours.
    #[clap(long, default_value_t = DEFAULT_CACHE_TTL.as_secs() / 3600)]
    pub cache_ttl_hours: u64,

    /// Largest image we'll accept, in MiB.
    #[clap(long, default_value_t = DEFAULT_MAX_FILE_SIZE / (1024 * 1024))]
    pub max_file_size_mb: u64,

    /// How many times to ask the model before giving up on an image.
    #[clap(long, default_value = "3", value_parser = clap::value_parser!(u32).range(1..))]
    pub max_attempts: u32,

    /// Base delay between attempts, in milliseconds. The wait grows linearly
    /// with each retry.
    #[clap(long, default_value = "1000")]
    pub retry_delay_ms: u64,

    /// Max number of images to analyze at a time.
    #[clap(short = 'j', long = "jobs", default_value = "4")]
    pub job_count: usize,

    /// What portion of inputs should we allow to fail? Specified as a
    /// number between 0.0 and 1.0.
    #[clap(long, default_value = "0.01")]
    pub allowed_failure_rate: f32,

    /// Output file, in JSONL format. Defaults to standard output.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,

    #[clap(flatten)]
    pub llm_opts: LlmOpts,
}

impl AnalyzeOpts {
    /// Assemble a [`Pipeline`] from our options.
    async fn build_pipeline(&self) -> Result<Pipeline> {
        let driver = self.driver.create_driver(&self.model).await?;
        let invoker = ModelInvoker::new(
            driver,
            &self.model,
            self.llm_opts.clone(),
            RetryPolicy {
                max_attempts: self.max_attempts,
                backoff_step: Duration::from_millis(self.retry_delay_ms),
            },
        );

        let backend: Arc<dyn CacheBackend> = if self.no_cache {
            Arc::new(MemoryBackend::new())
        } else {
            let dir = self.cache_dir.cache_dir()?;
            debug!(dir = %dir.display(), "Using cache directory");
            Arc::new(DirBackend::new(dir))
        };
        let ttl = Duration::from_secs(self.cache_ttl_hours.saturating_mul(3600));
        let cache = ResultCache::new(backend, ttl);

        let limits = ImageLimits {
            max_file_size: self.max_file_size_mb.saturating_mul(1024 * 1024),
            ..ImageLimits::default()
        };
        Ok(Pipeline::new(limits, cache, invoker, self.language).await)
    }
}

/// Did we analyze an image?
#[derive(Clone, Copy, Debug, PartialEq, Eq, JsonSchema, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalyzeStatus {
    /// We have a result.
    Ok,
    /// We gave up on this image.
    Failed,
}

/// One line of `analyze` output.
#[derive(Debug, JsonSchema, Serialize)]
pub struct AnalyzeOutput {
    /// The image we analyzed.
    pub path: PathBuf,

    pub status: AnalyzeStatus,

    /// The result, if we have one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<AnalysisResult>,

    /// Why we failed, in the output language.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AnalyzeOutput {
    /// Build an output record from the outcome of an analysis.
    fn new(
        path: PathBuf,
        outcome: Result<AnalysisResult, AnalysisError>,
        language: OutputLanguage,
    ) -> Self {
        match outcome {
            Ok(result) => Self {
                path,
                status: AnalyzeStatus::Ok,
                result: Some(result),
                error: None,
            },
            Err(err) => {
                error!(path = %path.display(), "Could not analyze image: {err}");
                Self {
                    path,
                    status: AnalyzeStatus::Failed,
                    result: None,
                    error: Some(err.localized_message(language)),
                }
            }
        }
    }
}

/// The `analyze` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_analyze(ui: &Ui, opts: &AnalyzeOpts) -> Result<()> {
    let pipeline = opts.build_pipeline().await?;
    let language = pipeline.output_language();

    let pb = ui.new_progress_bar(
        &ProgressConfig {
            emoji: "🖼️",
            msg: "Analyzing images",
            done_msg: "Analyzed images",
        },
        opts.images.len() as u64,
    );

    let pipeline = &pipeline;
    let outputs = stream::iter(&opts.images)
        .map(|path| async move {
            let outcome = pipeline
                .analyze_path(path, opts.mime_type.as_deref())
                .await;
            AnalyzeOutput::new(path.to_owned(), outcome, language)
        })
        .buffered(opts.job_count.max(1));
    let outputs = pb.wrap_stream(outputs);
    futures::pin_mut!(outputs);

    let mut writer = BufWriter::new(create_writer(opts.output_path.as_deref()).await?);
    let mut counters = FailureCounters::default();
    while let Some(output) = outputs.next().await {
        counters.record(output.status);
        let json = serde_json::to_string(&output)
            .with_context(|| format!("Failed to serialize output for {:?}", output.path))?;
        writer
            .write_all(json.as_bytes())
            .await
            .context("Failed to write JSON to output")?;
        writer
            .write_all(b"\n")
            .await
            .context("Failed to write newline to output")?;
    }
    writer.flush().await.context("Failed to flush output")?;
    pb.finish();

    counters.check(ui, opts.allowed_failure_rate)
}

/// How many images did we fail on?
#[derive(Clone, Copy, Debug, Default)]
struct FailureCounters {
    total: usize,
    failures: usize,
}

impl FailureCounters {
    fn record(&mut self, status: AnalyzeStatus) {
        self.total += 1;
        if status == AnalyzeStatus::Failed {
            self.failures += 1;
        }
    }

    /// Fail if too many images could not be analyzed.
    fn check(self, ui: &Ui, allowed_failure_rate: f32) -> Result<()> {
        if self.total == 0 {
            return Ok(());
        }
        let failure_rate = self.failures as f32 / self.total as f32;
        if failure_rate > allowed_failure_rate {
            Err(anyhow!(
                "{}/{} ({:.2}%) of images could not be analyzed, but only {:.2}% were allowed",
                self.failures,
                self.total,
                failure_rate * 100.0,
                allowed_failure_rate * 100.0
            ))
        } else {
            if self.failures > 0 {
                ui.display_message(
                    "❌",
                    &format!("{} images could not be analyzed", self.failures),
                );
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_lines_have_expected_shape() {
        let ok = AnalyzeOutput::new(
            PathBuf::from("menu.jpg"),
            Ok(AnalysisResult {
                description: "A menu".to_owned(),
                ..AnalysisResult::default()
            }),
            OutputLanguage::En,
        );
        let ok = serde_json::to_value(&ok).unwrap();
        assert_eq!(ok["path"], "menu.jpg");
        assert_eq!(ok["status"], "ok");
        assert_eq!(ok["result"]["description"], "A menu");
        assert!(ok.get("error").is_none());

        let failed = AnalyzeOutput::new(
            PathBuf::from("menu.jpg"),
            Err(AnalysisError::ExhaustedRetries { attempts: 3 }),
            OutputLanguage::Ja,
        );
        let failed = serde_json::to_value(&failed).unwrap();
        assert_eq!(failed["status"], "failed");
        assert_eq!(
            failed["error"],
            "画像の分析に失敗しました。もう一度お試しください。"
        );
        assert!(failed.get("result").is_none());
    }

    #[test]
    fn failure_rate_is_enforced() {
        let mut counters = FailureCounters::default();
        for _ in 0..9 {
            counters.record(AnalyzeStatus::Ok);
        }
        counters.record(AnalyzeStatus::Failed);
        let ui = Ui::init();
        ui.hide_progress_bars();
        assert!(counters.check(&ui, 0.1).is_ok());
        assert!(counters.check(&ui, 0.05).is_err());
    }
}
