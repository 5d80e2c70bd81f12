//! LLM provider implementations.
//!
//! Every supported backend (Groq, OpenAI, Ollama, vLLM, LM Studio) speaks the
//! OpenAI chat completions format, so a single `OpenAiCompatibleProvider` covers
//! them; `create_provider()` fills in the right base URL for known names.

pub mod openai_compat;

use crate::brain::LlmProvider;
use crate::config::LlmConfig;
use crate::error::{ConfigError, LlmError};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub use crate::config::RetryConfig;
pub use openai_compat::OpenAiCompatibleProvider;

/// Run a provider call, retrying transient failures.
///
/// Which failures are transient is decided by `LlmError::is_transient`;
/// everything else is returned on first occurrence.
pub async fn with_retry<F, Fut, T>(policy: &RetryConfig, mut call: F) -> Result<T, LlmError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LlmError>>,
{
    let mut attempt = 0;
    loop {
        let err = match call().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if !err.is_transient() || attempt >= policy.max_retries {
            return Err(err);
        }
        let delay = retry_delay(policy, attempt, &err);
        attempt += 1;
        tracing::warn!(
            attempt,
            max_retries = policy.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Transient LLM failure, retrying"
        );
        tokio::time::sleep(delay).await;
    }
}

/// Wait before the retry that follows failed `attempt` (0-based).
///
/// Grows by `backoff_multiplier` from `initial_backoff_ms` up to
/// `max_backoff_ms`, plus up to 25% jitter. A provider's rate-limit hint is a
/// floor.
fn retry_delay(policy: &RetryConfig, attempt: u32, err: &LlmError) -> Duration {
    let grown = policy.initial_backoff_ms as f64 * policy.backoff_multiplier.powi(attempt as i32);
    let mut ms = grown.min(policy.max_backoff_ms as f64) as u64;
    if policy.jitter {
        ms += (ms as f64 * 0.25 * jitter_fraction()) as u64;
    }
    let hint = err.retry_after().unwrap_or_default();
    Duration::from_millis(ms).max(hint)
}

/// Uniform fraction in [0, 1) from the low random bits of a v4 UUID.
fn jitter_fraction() -> f64 {
    const BITS: u32 = 53;
    let random = Uuid::new_v4().as_u128() as u64 & ((1u64 << BITS) - 1);
    random as f64 / (1u64 << BITS) as f64
}

/// Default chat completions base URL for a provider name.
pub fn default_base_url(provider: &str) -> &'static str {
    match provider {
        "groq" => "https://api.groq.com/openai/v1",
        "ollama" => "http://localhost:11434/v1",
        "lmstudio" => "http://localhost:1234/v1",
        _ => "https://api.openai.com/v1",
    }
}

/// Create an LLM provider based on the configuration.
///
/// A missing credential for a remote endpoint is a configuration error: it is
/// reported here, before any pipeline run is attempted.
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, ConfigError> {
    let provider = OpenAiCompatibleProvider::new(config)?;
    tracing::info!(
        provider = %config.provider,
        model = %config.model,
        "LLM provider initialized"
    );
    Ok(Arc::new(provider))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(provider: &str) -> LlmConfig {
        LlmConfig {
            provider: provider.to_string(),
            model: "test-model".to_string(),
            api_key_env: "MEKA_TEST_UNSET_LLM_KEY".to_string(),
            api_key: Some("test-key-123".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_create_provider_groq() {
        let provider = create_provider(&test_config("groq")).unwrap();
        assert_eq!(provider.model_name(), "test-model");
    }

    #[test]
    fn test_create_provider_missing_key() {
        let mut config = test_config("groq");
        config.api_key = None;
        let err = create_provider(&config).err().unwrap();
        match err {
            ConfigError::MissingCredential { var } => {
                assert_eq!(var, "MEKA_TEST_UNSET_LLM_KEY");
            }
            other => panic!("Expected MissingCredential, got {:?}", other),
        }
    }

    #[test]
    fn test_create_provider_local_needs_no_key() {
        let mut config = test_config("ollama");
        config.api_key = None;
        assert!(create_provider(&config).is_ok());
    }

    #[test]
    fn test_default_base_url() {
        assert_eq!(default_base_url("groq"), "https://api.groq.com/openai/v1");
        assert_eq!(default_base_url("openai"), "https://api.openai.com/v1");
        assert_eq!(default_base_url("something"), "https://api.openai.com/v1");
    }

    fn fixed_policy(max_backoff_ms: u64) -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            initial_backoff_ms: 1000,
            max_backoff_ms,
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    fn dropped() -> LlmError {
        LlmError::Connection {
            message: "reset".into(),
        }
    }

    #[test]
    fn test_retry_delay_grows_then_caps() {
        let policy = fixed_policy(3000);
        let delays: Vec<u64> = (0..4)
            .map(|a| retry_delay(&policy, a, &dropped()).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1000, 2000, 3000, 3000]);
    }

    #[test]
    fn test_retry_delay_honours_rate_limit_hint() {
        let policy = fixed_policy(60_000);
        let limited = LlmError::RateLimited {
            retry_after_secs: 30,
        };
        assert_eq!(retry_delay(&policy, 0, &limited), Duration::from_secs(30));
        // The hint is a floor, not a replacement.
        let brief = LlmError::RateLimited {
            retry_after_secs: 1,
        };
        assert_eq!(retry_delay(&policy, 2, &brief), Duration::from_secs(4));
    }

    #[test]
    fn test_jitter_stays_within_a_quarter() {
        let policy = RetryConfig {
            jitter: true,
            ..fixed_policy(60_000)
        };
        for _ in 0..50 {
            let ms = retry_delay(&policy, 1, &dropped()).as_millis() as u64;
            assert!((2000..=2500).contains(&ms), "delay {} out of range", ms);
        }
    }

    #[tokio::test]
    async fn test_with_retry_succeeds_first_try() {
        let result = with_retry(&RetryConfig::default(), || async { Ok::<_, LlmError>(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_with_retry_recovers_from_transient_failures() {
        let policy = RetryConfig {
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
            ..fixed_policy(2)
        };
        let mut calls = 0;
        let result = with_retry(&policy, || {
            calls += 1;
            let outcome = if calls < 3 { Err(dropped()) } else { Ok("Paris") };
            async move { outcome }
        })
        .await;
        assert_eq!(result.unwrap(), "Paris");
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn test_with_retry_gives_up_after_max_retries() {
        let policy = RetryConfig {
            max_retries: 2,
            initial_backoff_ms: 1,
            max_backoff_ms: 1,
            ..fixed_policy(1)
        };
        let mut calls = 0;
        let result: Result<(), LlmError> = with_retry(&policy, || {
            calls += 1;
            async { Err(LlmError::Timeout { timeout_secs: 30 }) }
        })
        .await;
        assert!(matches!(result, Err(LlmError::Timeout { .. })));
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn test_with_retry_permanent_error_no_retry() {
        let mut calls = 0;
        let result: Result<i32, LlmError> = with_retry(&fixed_policy(60_000), || {
            calls += 1;
            async {
                Err(LlmError::AuthFailed {
                    provider: "groq".into(),
                })
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }
}
