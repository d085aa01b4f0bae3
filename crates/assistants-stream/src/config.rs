use std::time::Duration;

use crate::errors::ApiError;
use crate::model::Voice;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_SPEECH_MODEL: &str = "tts-1";

/// Configuration for the Assistants API client.
///
/// The assistant id has no built-in default: runs fail with a config error
/// until one is provided.
#[derive(Clone, Debug)]
pub struct AssistantsConfig {
    /// API key used for bearer auth.
    pub api_key: String,
    /// Base URL including the version segment.
    ///
    /// Useful for proxies or local test servers.
    pub base_url: String,
    /// Default HTTP timeout for non-streaming requests.
    pub timeout: Duration,
    pub assistant_id: Option<String>,
    pub speech_model: String,
    pub voice: Voice,
}

impl AssistantsConfig {
    /// Creates a config with defaults and a provided API key.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(120),
            assistant_id: None,
            speech_model: DEFAULT_SPEECH_MODEL.to_string(),
            voice: Voice::default(),
        }
    }

    /// Builds a config from `OPENAI_*` environment variables.
    pub fn from_env() -> Result<Self, ApiError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from any key lookup, with the same rules as `from_env`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ApiError> {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let api_key = non_empty("OPENAI_API_KEY")
            .ok_or_else(|| ApiError::Config("missing OPENAI_API_KEY".into()))?;
        let mut config = Self::new(api_key);
        if let Some(base_url) = non_empty("OPENAI_BASE_URL") {
            config = config.base_url(base_url);
        }
        if let Some(assistant_id) = non_empty("OPENAI_ASSISTANT_ID") {
            config = config.assistant_id(assistant_id);
        }
        if let Some(model) = non_empty("OPENAI_SPEECH_MODEL") {
            config = config.speech_model(model);
        }
        if let Some(voice) = non_empty("OPENAI_SPEECH_VOICE") {
            config = config.voice(voice.parse().map_err(ApiError::Config)?);
        }
        Ok(config)
    }

    /// Overrides the API base URL (for proxies or test servers).
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Overrides the default HTTP timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn assistant_id(mut self, assistant_id: impl Into<String>) -> Self {
        self.assistant_id = Some(assistant_id.into());
        self
    }

    pub fn speech_model(mut self, model: impl Into<String>) -> Self {
        self.speech_model = model.into();
        self
    }

    pub fn voice(mut self, voice: Voice) -> Self {
        self.voice = voice;
        self
    }

    pub fn validate(&self) -> Result<(), ApiError> {
        if self.api_key.trim().is_empty() {
            return Err(ApiError::Config("api_key must not be empty".into()));
        }
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(ApiError::Config(format!(
                "base_url must be an http(s) URL, got {:?}",
                self.base_url
            )));
        }
        if self.speech_model.trim().is_empty() {
            return Err(ApiError::Config("speech_model must not be empty".into()));
        }
        Ok(())
    }

    /// Assistant id for runs, or a config error when none was configured.
    pub fn require_assistant_id(&self) -> Result<&str, ApiError> {
        self.assistant_id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| {
                ApiError::Config("no assistant id configured (set OPENAI_ASSISTANT_ID)".into())
            })
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<AssistantsConfig, ApiError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AssistantsConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn api_key_is_required() {
        assert!(matches!(from_pairs(&[]), Err(ApiError::Config(_))));
        assert!(matches!(
            from_pairs(&[("OPENAI_API_KEY", "  ")]),
            Err(ApiError::Config(_))
        ));
    }

    #[test]
    fn defaults_apply_without_overrides() {
        let config = from_pairs(&[("OPENAI_API_KEY", "sk-test")]).expect("config");
        assert_eq!(config.base_url, DEFAULT_BASE_URL);
        assert_eq!(config.speech_model, "tts-1");
        assert_eq!(config.voice, Voice::Nova);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn assistant_id_never_falls_back_to_a_literal() {
        let config = from_pairs(&[("OPENAI_API_KEY", "sk-test")]).expect("config");
        assert!(matches!(config.require_assistant_id(), Err(ApiError::Config(_))));
        let config = config.assistant_id("asst_123");
        assert_eq!(config.require_assistant_id().expect("id"), "asst_123");
    }

    #[test]
    fn env_overrides_are_read() {
        let config = from_pairs(&[
            ("OPENAI_API_KEY", "sk-test"),
            ("OPENAI_BASE_URL", "http://localhost:8080/v1/"),
            ("OPENAI_ASSISTANT_ID", "asst_env"),
            ("OPENAI_SPEECH_MODEL", "tts-1-hd"),
            ("OPENAI_SPEECH_VOICE", "echo"),
        ])
        .expect("config");
        assert_eq!(config.assistant_id.as_deref(), Some("asst_env"));
        assert_eq!(config.speech_model, "tts-1-hd");
        assert_eq!(config.voice, Voice::Echo);
        assert_eq!(
            config.url("/threads/t1/runs"),
            "http://localhost:8080/v1/threads/t1/runs"
        );
    }

    #[test]
    fn invalid_voice_and_base_url_are_rejected() {
        assert!(from_pairs(&[("OPENAI_API_KEY", "k"), ("OPENAI_SPEECH_VOICE", "robot")]).is_err());
        let config = AssistantsConfig::new("k").base_url("ftp://example");
        assert!(matches!(config.validate(), Err(ApiError::Config(_))));
    }
}
