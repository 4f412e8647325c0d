use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::{Client, Response};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::stream::{block_data, parse_chunk, ChunkEvent, SseBuffer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SamplingParams {
    pub max_tokens: u64,
}

/// One incremental output of a generation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartialOutput {
    /// Tokens generated so far, including this output.
    pub cumulative_tokens: u64,
    /// Prompt length as counted by the engine, when it reports one.
    pub prompt_tokens: Option<u64>,
}

pub type GenerationStream = BoxStream<'static, Result<PartialOutput>>;

/// The inference engine under test. Implementations own the transport; the
/// harness only ever consumes the stream they return.
#[async_trait]
pub trait GenerationEngine: Send + Sync {
    async fn generate(
        &self,
        prompt: &str,
        params: SamplingParams,
        request_id: u64,
    ) -> Result<GenerationStream>;

    async fn runtime_version(&self) -> Option<String> {
        None
    }

    fn describe(&self) -> String;
}

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Talks to an OpenAI-compatible completion server (vLLM, SGLang, TGI).
#[derive(Debug, Clone)]
pub struct HttpEngine {
    client: Client,
    config: EngineConfig,
    /// Context length the server reports for the model, when it lists one.
    served_max_model_len: Option<u32>,
}

impl HttpEngine {
    /// Builds the client and checks the configured model against `/v1/models`.
    pub async fn connect(config: EngineConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .tcp_nodelay(true)
            .build()
            .context("failed to construct HTTP client")?;
        let mut engine = Self {
            client,
            config,
            served_max_model_len: None,
        };
        engine.served_max_model_len = engine.check_model().await?;
        Ok(engine)
    }

    pub fn served_max_model_len(&self) -> Option<u32> {
        self.served_max_model_len
    }

    /// Context length requests are bound by: the served value when known,
    /// otherwise the configured one.
    pub fn context_limit(&self) -> u32 {
        self.served_max_model_len.unwrap_or(self.config.max_model_len)
    }

    /// Warns and returns `false` when prompt plus generation budget cannot
    /// fit in the model's context.
    pub fn check_request_budget(&self, prompt_tokens: u64, max_tokens: u64) -> bool {
        let limit = u64::from(self.context_limit());
        let needed = prompt_tokens.saturating_add(max_tokens);
        if needed > limit {
            warn!(
                prompt_tokens,
                max_tokens,
                max_model_len = limit,
                "prompt plus max_tokens exceeds the model context; requests may be rejected or truncated"
            );
            return false;
        }
        true
    }

    async fn check_model(&self) -> Result<Option<u32>> {
        let url = self.config.url_for("v1/models")?;
        let response = self
            .client
            .get(url.clone())
            .headers(self.config.headers.clone())
            .send()
            .await
            .with_context(|| format!("inference engine unreachable at {}", url))?;
        let response = ensure_success(response).await?;
        let payload: Value = response
            .json()
            .await
            .context("failed to decode /v1/models response")?;

        let models: &[Value] = payload
            .get("data")
            .and_then(|data| data.as_array())
            .map(Vec::as_slice)
            .unwrap_or_default();

        let Some(entry) = models
            .iter()
            .find(|model| model.get("id").and_then(|id| id.as_str()) == Some(self.config.model.as_str()))
        else {
            let served: Vec<&str> = models
                .iter()
                .filter_map(|model| model.get("id").and_then(|id| id.as_str()))
                .collect();
            warn!(
                model = %self.config.model,
                served = ?served,
                "configured model is not listed by the engine"
            );
            return Ok(None);
        };

        let served_len = entry
            .get("max_model_len")
            .and_then(|value| value.as_u64())
            .and_then(|value| u32::try_from(value).ok());
        match served_len {
            Some(served) if served != self.config.max_model_len => warn!(
                model = %self.config.model,
                configured = self.config.max_model_len,
                served,
                "engine serves a different max_model_len than configured"
            ),
            Some(served) => debug!(model = %self.config.model, max_model_len = served, "model is served by the engine"),
            None => debug!(model = %self.config.model, "engine does not report max_model_len"),
        }
        Ok(served_len)
    }

    fn request_body<'a>(&'a self, prompt: &'a str, params: SamplingParams) -> CompletionRequest<'a> {
        CompletionRequest {
            model: &self.config.model,
            prompt,
            params,
            stream: true,
            stream_options: StreamOptions {
                include_usage: true,
                continuous_usage_stats: true,
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    #[serde(flatten)]
    params: SamplingParams,
    stream: bool,
    stream_options: StreamOptions,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
    /// vLLM extension: attach usage to every chunk, not just the last one.
    continuous_usage_stats: bool,
}

#[async_trait]
impl GenerationEngine for HttpEngine {
    async fn generate(
        &self,
        prompt: &str,
        params: SamplingParams,
        request_id: u64,
    ) -> Result<GenerationStream> {
        let url = self.config.url_for("v1/completions")?;
        let response = self
            .client
            .post(url)
            .headers(self.config.headers.clone())
            .header("X-Request-Id", format!("llmbench-{}", request_id))
            .json(&self.request_body(prompt, params))
            .send()
            .await
            .with_context(|| format!("request {} could not be sent", request_id))?;
        let response = ensure_success(response).await?;
        Ok(completion_stream(response.bytes_stream()))
    }

    async fn runtime_version(&self) -> Option<String> {
        let url = self.config.url_for("version").ok()?;
        let response = self
            .client
            .get(url)
            .headers(self.config.headers.clone())
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            debug!(status = %response.status(), "engine does not expose /version");
            return None;
        }
        let payload: Value = response.json().await.ok()?;
        payload
            .get("version")
            .and_then(|version| version.as_str())
            .map(str::to_string)
    }

    fn describe(&self) -> String {
        let max_model_len = match self.served_max_model_len {
            Some(served) if served == self.config.max_model_len => format!("{} (served)", served),
            Some(served) => format!(
                "{} (served, configured {})",
                served, self.config.max_model_len
            ),
            None => format!("{} (configured)", self.config.max_model_len),
        };
        format!(
            "{} at {}; max_model_len={}; configured dtype={}, gpu_memory_utilization={}",
            self.config.model,
            self.config.endpoint,
            max_model_len,
            self.config.dtype,
            self.config.gpu_memory_utilization
        )
    }
}

async fn ensure_success(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|err| format!("<failed to read body: {}>", err));
    Err(anyhow!("request failed ({}) {}", status, body.trim()))
}

struct StreamState {
    body: BoxStream<'static, Result<Bytes>>,
    buffer: SseBuffer,
    tokens: u64,
    prompt_tokens: Option<u64>,
    finished: bool,
}

/// Turns an SSE byte stream into cumulative token counts, one item per chunk
/// that advanced the count or reported a prompt length.
pub(crate) fn completion_stream<S, B, E>(body: S) -> GenerationStream
where
    S: futures::Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: Into<Bytes>,
    E: std::error::Error + Send + Sync + 'static,
{
    let state = StreamState {
        body: body
            .map(|item| item.map(Into::into).map_err(anyhow::Error::new))
            .boxed(),
        buffer: SseBuffer::new(),
        tokens: 0,
        prompt_tokens: None,
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if state.finished {
                return None;
            }

            if let Some(block) = state.buffer.next_block() {
                if let Some(item) = state.apply_block(&block) {
                    return Some((item, state));
                }
                continue;
            }

            match state.body.next().await {
                Some(Ok(chunk)) => state.buffer.push_chunk(&chunk),
                Some(Err(err)) => {
                    state.finished = true;
                    return Some((Err(err.context("stream interrupted")), state));
                }
                None => {
                    state.finished = true;
                    let tail = state.buffer.take_remaining();
                    if let Some(item) = tail.and_then(|block| state.apply_block(&block)) {
                        return Some((item, state));
                    }
                    return None;
                }
            }
        }
    })
    .boxed()
}

impl StreamState {
    fn apply_block(&mut self, block: &str) -> Option<Result<PartialOutput>> {
        let data = block_data(block)?;
        match parse_chunk(&data) {
            Ok(ChunkEvent::Done) => {
                self.finished = true;
                None
            }
            Ok(ChunkEvent::Progress {
                completion_tokens,
                prompt_tokens,
                has_text,
            }) => {
                let previous = (self.tokens, self.prompt_tokens);
                if let Some(reported) = completion_tokens {
                    self.tokens = self.tokens.max(reported);
                } else if has_text {
                    self.tokens += 1;
                }
                if prompt_tokens.is_some() {
                    self.prompt_tokens = prompt_tokens;
                }
                if (self.tokens, self.prompt_tokens) == previous {
                    return None;
                }
                Some(Ok(PartialOutput {
                    cumulative_tokens: self.tokens,
                    prompt_tokens: self.prompt_tokens,
                }))
            }
            Err(err) => {
                self.finished = true;
                Some(Err(err))
            }
        }
    }
}
