use async_trait::async_trait;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::config::RemoteConfig;
use crate::types::{MemoryEntry, Persona};

/// Remote language-model collaborator.
///
/// Only `generate_reply` may fail; scoring and keyword extraction map every
/// failure to "absent" so callers can fall back locally.
#[async_trait]
pub trait RemoteModel: Send + Sync {
    /// Relevance of `message` to `persona` in `[0, 1]`, or `None` if unavailable.
    async fn score_relevance(&self, persona: &Persona, message: &str) -> Option<f64>;

    async fn generate_reply(
        &self,
        persona: &Persona,
        message: &str,
        history: &[MemoryEntry],
        short: bool,
    ) -> anyhow::Result<String>;

    /// Best-effort; empty on total failure.
    async fn extract_keywords(&self, prompt: &str, max_count: usize) -> Vec<String>;
}

const GENERATE_PATHS: &[&str] = &["/responses", "/generate", "/v1/responses", "/v1/generate"];
const RELEVANCE_PATHS: &[&str] = &["/relevance", "/v1/relevance", "/assess"];
const KEYWORD_PATHS: &[&str] = &["/keywords", "/v1/keywords"];

/// Short replies ask the model for far fewer tokens.
const SHORT_MAX_TOKENS: u32 = 96;

/// JSON-over-HTTP model client. Tries a list of candidate endpoints and
/// accepts several common response shapes.
pub struct HttpModel {
    client: Client,
    base_url: Url,
    api_key: String,
    generate_path: Option<String>,
    relevance_path: Option<String>,
    max_tokens: u32,
    temperature: f32,
}

impl HttpModel {
    pub fn new(api_key: String, base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| anyhow::anyhow!("invalid remote base_url '{base_url}': {e}"))?;
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url,
            api_key,
            generate_path: None,
            relevance_path: None,
            max_tokens: 512,
            temperature: 0.7,
        })
    }

    pub fn with_paths(mut self, generate: Option<String>, relevance: Option<String>) -> Self {
        self.generate_path = generate;
        self.relevance_path = relevance;
        self
    }

    pub fn with_sampling(mut self, max_tokens: u32, temperature: f32) -> Self {
        self.max_tokens = max_tokens;
        self.temperature = temperature;
        self
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.as_str().trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn candidates<'a>(&'a self, preferred: Option<&'a str>, defaults: &'a [&'a str]) -> Vec<&'a str> {
        preferred.into_iter().chain(defaults.iter().copied()).collect()
    }

    async fn post(&self, path: &str, body: &serde_json::Value) -> anyhow::Result<serde_json::Value> {
        let response = self
            .client
            .post(self.endpoint(path))
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("{status}: {text}");
        }

        let text = response.text().await?;
        // Some endpoints answer with a bare string rather than JSON.
        Ok(serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text)))
    }

    /// Try each candidate path and return the first extracted text.
    async fn generate_text(&self, body: &serde_json::Value) -> anyhow::Result<String> {
        let mut last_err = None;
        for path in self.candidates(self.generate_path.as_deref(), GENERATE_PATHS) {
            match self.post(path, body).await {
                Ok(value) => match extract_text(&value) {
                    Some(text) => return Ok(text),
                    None => return Ok(value.to_string()),
                },
                Err(e) => {
                    debug!(path, "generate endpoint failed: {e}");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("no usable generate endpoint")))
    }
}

#[async_trait]
impl RemoteModel for HttpModel {
    async fn score_relevance(&self, persona: &Persona, message: &str) -> Option<f64> {
        let body = serde_json::json!({
            "persona_name": persona.name,
            "prompt": persona.prompt,
            "message": message,
        });

        for path in self.candidates(self.relevance_path.as_deref(), RELEVANCE_PATHS) {
            match self.post(path, &body).await {
                Ok(value) => {
                    if let Some(score) = extract_score(&value) {
                        return Some(score);
                    }
                }
                Err(e) => debug!(path, persona = %persona.name, "relevance endpoint failed: {e}"),
            }
        }
        None
    }

    async fn generate_reply(
        &self,
        persona: &Persona,
        message: &str,
        history: &[MemoryEntry],
        short: bool,
    ) -> anyhow::Result<String> {
        let history: Vec<serde_json::Value> = history
            .iter()
            .map(|m| serde_json::json!({ "role": m.role.as_str(), "text": m.text }))
            .collect();

        let body = serde_json::json!({
            "persona_name": persona.name,
            "prompt": persona.prompt,
            "history": history,
            "input": message,
            "max_tokens": if short { SHORT_MAX_TOKENS } else { self.max_tokens },
            "temperature": self.temperature,
            "short": short,
        });

        self.generate_text(&body).await
    }

    async fn extract_keywords(&self, prompt: &str, max_count: usize) -> Vec<String> {
        let body = serde_json::json!({ "prompt": prompt });
        for path in KEYWORD_PATHS {
            if let Ok(value) = self.post(path, &body).await {
                if let Some(list) = extract_keyword_list(&value) {
                    return list.into_iter().take(max_count).collect();
                }
            }
        }

        // Ask the generate endpoint for a comma-separated list instead.
        let instruction = format!(
            "Extract up to {max_count} concise keywords (single words or short phrases) that \
             describe this persona. Respond as a comma-separated list without extra text. \
             Persona description: {prompt}"
        );
        let body = serde_json::json!({ "input": instruction, "max_tokens": 60, "temperature": 0.0 });
        match self.generate_text(&body).await {
            Ok(text) => split_keywords(&text).into_iter().take(max_count).collect(),
            Err(e) => {
                debug!("keyword extraction failed: {e}");
                Vec::new()
            }
        }
    }
}

/// Pull reply text out of the response shapes seen in the wild.
pub fn extract_text(value: &serde_json::Value) -> Option<String> {
    if let Some(s) = value.as_str() {
        return Some(s.to_string());
    }
    for key in ["reply", "output"] {
        if let Some(v) = value.get(key) {
            return Some(scalar_to_string(v));
        }
    }
    if let Some(result) = value.get("result") {
        if let Some(s) = result.as_str() {
            return Some(s.to_string());
        }
        if let Some(out) = result.get("output") {
            return Some(scalar_to_string(out));
        }
    }
    if let Some(data) = value.get("data") {
        if let Some(text) = data.get("text") {
            return Some(scalar_to_string(text));
        }
        if let Some(text) = data.get(0).and_then(|d| d.get("text")) {
            return Some(scalar_to_string(text));
        }
    }
    let choice = value.get("choices").and_then(|c| c.get(0))?;
    choice
        .get("text")
        .or_else(|| choice.pointer("/message/content"))
        .map(scalar_to_string)
}

/// `score`, `relevance`, or the first element of `scores`.
pub fn extract_score(value: &serde_json::Value) -> Option<f64> {
    value
        .get("score")
        .and_then(|v| v.as_f64())
        .or_else(|| value.get("relevance").and_then(|v| v.as_f64()))
        .or_else(|| value.pointer("/scores/0").and_then(|v| v.as_f64()))
}

fn extract_keyword_list(value: &serde_json::Value) -> Option<Vec<String>> {
    let list = value
        .as_array()
        .or_else(|| value.get("keywords").and_then(|v| v.as_array()))
        .or_else(|| value.get("items").and_then(|v| v.as_array()))?;
    Some(list.iter().map(scalar_to_string).collect())
}

fn split_keywords(text: &str) -> Vec<String> {
    text.split(['\n', ',', ';'])
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn scalar_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Create the remote model from config, or `None` if credentials or the
/// endpoint are missing.
pub fn from_config(config: &RemoteConfig) -> anyhow::Result<Option<Arc<dyn RemoteModel>>> {
    let (Some(api_key), Some(base_url)) = (config.api_key.clone(), config.base_url.as_deref())
    else {
        return Ok(None);
    };

    let model = HttpModel::new(api_key, base_url, Duration::from_secs(config.timeout_secs))?
        .with_paths(config.generate_path.clone(), config.relevance_path.clone())
        .with_sampling(config.max_tokens, config.temperature);
    let model: Arc<dyn RemoteModel> = Arc::new(model);
    Ok(Some(model))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_text_from_common_shapes() {
        assert_eq!(extract_text(&json!("plain")).as_deref(), Some("plain"));
        assert_eq!(extract_text(&json!({"reply": "r"})).as_deref(), Some("r"));
        assert_eq!(
            extract_text(&json!({"result": {"output": "o"}})).as_deref(),
            Some("o")
        );
        assert_eq!(
            extract_text(&json!({"data": [{"text": "d"}]})).as_deref(),
            Some("d")
        );
        assert_eq!(
            extract_text(&json!({"choices": [{"message": {"content": "c"}}]})).as_deref(),
            Some("c")
        );
        assert_eq!(extract_text(&json!({"unrelated": 1})), None);
    }

    #[test]
    fn extracts_score_variants() {
        assert_eq!(extract_score(&json!({"score": 0.7})), Some(0.7));
        assert_eq!(extract_score(&json!({"relevance": 1})), Some(1.0));
        assert_eq!(extract_score(&json!({"scores": [0.25, 0.9]})), Some(0.25));
        assert_eq!(extract_score(&json!({"score": "high"})), None);
    }

    #[test]
    fn splits_keyword_text_on_separators() {
        assert_eq!(
            split_keywords("cats, dogs;\nbirds ,"),
            vec!["cats", "dogs", "birds"]
        );
    }

    #[test]
    fn endpoint_joins_without_double_slashes() {
        let model =
            HttpModel::new("k".into(), "https://api.example.com/v1/", Duration::from_secs(1))
                .expect("model");
        assert_eq!(
            model.endpoint("/generate"),
            "https://api.example.com/v1/generate"
        );
    }

    #[test]
    fn missing_credentials_mean_no_remote() {
        let config = RemoteConfig {
            api_key: None,
            base_url: Some("https://api.example.com".into()),
            ..RemoteConfig::default()
        };
        assert!(from_config(&config).expect("config").is_none());
    }
}
