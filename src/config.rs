use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Url;

pub const DEFAULT_MODEL: &str = "speakleash/Bielik-11B-v3-Base-20250730";
pub const DEFAULT_PROMPT: &str = "Explain the benefits of AMD ROCm for large language models.";
pub const DEFAULT_CONCURRENCY_LEVELS: [usize; 6] = [1, 2, 4, 8, 16, 32];
pub const DEFAULT_MAX_TOKENS: u64 = 200;
pub const DEFAULT_PROMPT_TOKENS: u64 = 128;

/// Everything needed to reach and describe the inference engine under test.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub endpoint: Url,
    pub model: String,
    pub dtype: String,
    pub max_model_len: u32,
    pub gpu_memory_utilization: f64,
    pub headers: HeaderMap,
}

impl EngineConfig {
    pub fn try_new(
        endpoint: impl AsRef<str>,
        model: impl Into<String>,
        access_token: Option<String>,
    ) -> Result<Self> {
        let endpoint = Url::parse(endpoint.as_ref())
            .with_context(|| format!("invalid endpoint URL: {}", endpoint.as_ref()))?;

        let model = model.into();
        if model.trim().is_empty() {
            return Err(anyhow!("model identifier must not be empty"));
        }

        let mut headers = HeaderMap::new();
        if let Some(token) = access_token {
            if !token.is_empty() {
                let auth_value = format!("Bearer {}", token);
                let header_value = HeaderValue::from_str(&auth_value)
                    .context("failed to build Authorization header from access token")?;
                headers.insert(AUTHORIZATION, header_value);
            }
        }
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        Ok(Self {
            endpoint,
            model,
            dtype: "float16".to_string(),
            max_model_len: 4096,
            gpu_memory_utilization: 0.9,
            headers,
        })
    }

    pub fn with_dtype(mut self, dtype: impl Into<String>) -> Self {
        self.dtype = dtype.into();
        self
    }

    pub fn with_max_model_len(mut self, max_model_len: u32) -> Result<Self> {
        if max_model_len == 0 {
            return Err(anyhow!("max_model_len must be greater than zero"));
        }
        self.max_model_len = max_model_len;
        Ok(self)
    }

    pub fn with_gpu_memory_utilization(mut self, fraction: f64) -> Result<Self> {
        if !(fraction > 0.0 && fraction <= 1.0) {
            return Err(anyhow!(
                "gpu_memory_utilization must be in (0, 1], got {}",
                fraction
            ));
        }
        self.gpu_memory_utilization = fraction;
        Ok(self)
    }

    /// Resolves `path` against the configured endpoint, keeping any base path
    /// the endpoint already carries.
    pub fn url_for(&self, path: &str) -> Result<Url> {
        let mut base = self.endpoint.clone();
        if !base.path().ends_with('/') {
            let with_slash = format!("{}/", base.path());
            base.set_path(&with_slash);
        }
        base.join(path.trim_start_matches('/'))
            .with_context(|| format!("failed to resolve {} against {}", path, self.endpoint))
    }
}

#[derive(Clone, Debug)]
pub struct BenchmarkConfig {
    pub concurrency_levels: Vec<usize>,
    pub prompt: String,
    pub max_tokens: u64,
    pub prompt_tokens: u64,
    pub request_timeout: Option<Duration>,
    pub show_progress: bool,
}

impl BenchmarkConfig {
    pub fn try_new(concurrency_levels: Vec<usize>, prompt: impl Into<String>) -> Result<Self> {
        if concurrency_levels.is_empty() {
            return Err(anyhow!("at least one concurrency level is required"));
        }
        if concurrency_levels.iter().any(|level| *level == 0) {
            return Err(anyhow!("concurrency levels must be greater than zero"));
        }

        Ok(Self {
            concurrency_levels,
            prompt: prompt.into(),
            max_tokens: DEFAULT_MAX_TOKENS,
            prompt_tokens: DEFAULT_PROMPT_TOKENS,
            request_timeout: None,
            show_progress: true,
        })
    }

    pub fn with_max_tokens(mut self, max_tokens: u64) -> Result<Self> {
        if max_tokens == 0 {
            return Err(anyhow!("max_tokens must be greater than zero"));
        }
        self.max_tokens = max_tokens;
        Ok(self)
    }

    pub fn with_prompt_tokens(mut self, prompt_tokens: u64) -> Self {
        self.prompt_tokens = prompt_tokens;
        self
    }

    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        if !request_timeout.is_zero() {
            self.request_timeout = Some(request_timeout);
        }
        self
    }

    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self {
            concurrency_levels: DEFAULT_CONCURRENCY_LEVELS.to_vec(),
            prompt: DEFAULT_PROMPT.to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
            prompt_tokens: DEFAULT_PROMPT_TOKENS,
            request_timeout: None,
            show_progress: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_and_zero_levels() {
        assert!(BenchmarkConfig::try_new(vec![], DEFAULT_PROMPT).is_err());
        assert!(BenchmarkConfig::try_new(vec![1, 0, 4], DEFAULT_PROMPT).is_err());
        assert!(BenchmarkConfig::try_new(vec![1, 2], DEFAULT_PROMPT).is_ok());
    }

    #[test]
    fn zero_timeout_leaves_requests_unbounded() {
        let config = BenchmarkConfig::default().with_request_timeout(Duration::ZERO);
        assert!(config.request_timeout.is_none());
    }

    #[test]
    fn access_token_becomes_bearer_header() {
        let config =
            EngineConfig::try_new("http://localhost:8000", DEFAULT_MODEL, Some("hf_abc".into()))
                .unwrap();
        assert_eq!(config.headers.get(AUTHORIZATION).unwrap(), "Bearer hf_abc");

        let anonymous =
            EngineConfig::try_new("http://localhost:8000", DEFAULT_MODEL, Some(String::new()))
                .unwrap();
        assert!(anonymous.headers.get(AUTHORIZATION).is_none());
    }

    #[test]
    fn memory_fraction_must_be_a_fraction() {
        let config = EngineConfig::try_new("http://localhost:8000", DEFAULT_MODEL, None).unwrap();
        assert!(config.clone().with_gpu_memory_utilization(0.0).is_err());
        assert!(config.clone().with_gpu_memory_utilization(1.5).is_err());
        assert!(config.with_gpu_memory_utilization(1.0).is_ok());
    }

    #[test]
    fn url_for_keeps_base_path() {
        let config = EngineConfig::try_new("http://gpu-box:8000/proxy", DEFAULT_MODEL, None).unwrap();
        assert_eq!(
            config.url_for("/v1/completions").unwrap().as_str(),
            "http://gpu-box:8000/proxy/v1/completions"
        );

        let bare = EngineConfig::try_new("http://gpu-box:8000", DEFAULT_MODEL, None).unwrap();
        assert_eq!(
            bare.url_for("version").unwrap().as_str(),
            "http://gpu-box:8000/version"
        );
    }
}
