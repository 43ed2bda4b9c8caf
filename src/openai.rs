use std::time::Duration;

use async_trait::async_trait;

use crate::generator::{ContentGenerator, GeneratorError, parse_chapter_titles};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_IMAGE_MODEL: &str = "dall-e-3";
const TITLE_DEADLINE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub image_model: String,
    pub temperature: f32,
}

impl OpenAiConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY is not set"))?;
        let base_url = std::env::var("BOOKSMITH_OPENAI_BASE_URL")
            .unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        let model =
            std::env::var("BOOKSMITH_OPENAI_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        let image_model = std::env::var("BOOKSMITH_OPENAI_IMAGE_MODEL")
            .unwrap_or_else(|_| DEFAULT_IMAGE_MODEL.to_string());
        Ok(Self {
            api_key,
            base_url,
            model,
            image_model,
            temperature: 0.7,
        })
    }
}

/// `ContentGenerator` backed by the OpenAI API: chat completions for text,
/// image generations for the cover. Each call runs under the caller's
/// deadline via `tokio::time::timeout`.
pub struct OpenAiGenerator {
    client: reqwest::Client,
    config: OpenAiConfig,
}

impl OpenAiGenerator {
    pub fn new(config: OpenAiConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self::new(OpenAiConfig::from_env()?))
    }

    fn endpoint(&self, path: &str) -> String {
        let base = self.config.base_url.trim_end_matches('/');
        format!("{base}/{path}")
    }

    async fn chat_text(
        &self,
        system: &str,
        user: &str,
        max_tokens: u32,
        deadline: Duration,
    ) -> Result<String, GeneratorError> {
        let endpoint = self.endpoint("chat/completions");
        let body = serde_json::json!({
            "model": self.config.model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user },
            ],
            "temperature": self.config.temperature,
            "max_tokens": max_tokens,
        });

        let value = self.post_json(&endpoint, &body, deadline).await?;
        let text = value
            .pointer("/choices/0/message/content")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .unwrap_or_default();
        if text.is_empty() {
            return Err(GeneratorError::provider("chat completion content is empty"));
        }
        Ok(text.to_string())
    }

    async fn post_json(
        &self,
        endpoint: &str,
        body: &serde_json::Value,
        deadline: Duration,
    ) -> Result<serde_json::Value, GeneratorError> {
        // One window covers the request and the body read; a provider
        // that answers headers quickly and then stalls the body still
        // surfaces TimedOut within the deadline.
        let call = async {
            let response = self
                .client
                .post(endpoint)
                .bearer_auth(&self.config.api_key)
                .json(body)
                .send()
                .await
                .map_err(|err| GeneratorError::provider(format!("POST {endpoint}: {err}")))?;
            let status = response.status();
            let raw = response
                .text()
                .await
                .map_err(|err| GeneratorError::provider(format!("read response body: {err}")))?;
            Ok::<_, GeneratorError>((status, raw))
        };

        let (status, raw) = tokio::time::timeout(deadline, call)
            .await
            .map_err(|_| GeneratorError::TimedOut)??;

        if !status.is_success() {
            let message = parse_error_message(&raw).unwrap_or_else(|| raw.clone());
            return Err(GeneratorError::provider(format!(
                "OpenAI API error ({status}): {message}"
            )));
        }

        serde_json::from_str(&raw)
            .map_err(|err| GeneratorError::provider(format!("parse response: {err}")))
    }
}

#[async_trait]
impl ContentGenerator for OpenAiGenerator {
    async fn generate_title(&self, description: &str) -> Result<String, GeneratorError> {
        let system = "You are an assistant that writes attractive, professional e-book titles.";
        let user = format!(
            "Write an attractive title for an e-book with the following description: \
             \"{description}\". Return only the title, without quotes or extra formatting."
        );
        self.chat_text(system, &user, 50, TITLE_DEADLINE).await
    }

    async fn generate_table_of_contents(
        &self,
        title: &str,
        description: &str,
        deadline: Duration,
    ) -> Result<Vec<String>, GeneratorError> {
        let system = "You are an assistant that structures professional e-books.";
        let user = format!(
            "Create a chapter outline for an e-book titled \"{title}\" with the following \
             description: \"{description}\". Return only the chapter titles, one per line, \
             without numbering or extra formatting. Use between 5 and 10 chapters depending \
             on the complexity of the subject."
        );

        let raw = self.chat_text(system, &user, 500, deadline).await?;
        let titles = parse_chapter_titles(&raw);
        if titles.is_empty() {
            return Err(GeneratorError::provider(
                "table of contents output contained no chapter titles",
            ));
        }
        Ok(titles)
    }

    async fn generate_chapter(
        &self,
        title: &str,
        description: &str,
        chapter_title: &str,
        previous_content: Option<&str>,
        deadline: Duration,
    ) -> Result<String, GeneratorError> {
        let system = "You are an assistant that writes high-quality e-book content.";
        let mut user = format!(
            "Write the chapter \"{chapter_title}\" for an e-book titled \"{title}\" with the \
             following description: \"{description}\"."
        );
        if let Some(previous) = previous_content {
            user.push_str(&format!(
                "\n\nThe previous chapter's content is: \"{previous}\"\n\n\
                 Continue the narrative coherently."
            ));
        }
        user.push_str(
            "\n\nFormat the content as simple HTML with <h1>, <h2>, <p>, <ul>, <li> tags \
             where appropriate.",
        );

        self.chat_text(system, &user, 2000, deadline).await
    }

    async fn generate_cover_image(
        &self,
        title: &str,
        description: &str,
        aspect_ratio: &str,
        deadline: Duration,
    ) -> Result<String, GeneratorError> {
        let endpoint = self.endpoint("images/generations");
        let prompt = format!(
            "A professional e-book cover for a book titled \"{title}\". \
             The book is about: {description}. Clean typography, no text artifacts."
        );
        let body = serde_json::json!({
            "model": self.config.image_model,
            "prompt": prompt,
            "n": 1,
            "size": image_size(aspect_ratio),
        });

        let value = self.post_json(&endpoint, &body, deadline).await?;
        let url = value
            .pointer("/data/0/url")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        if url.is_empty() {
            return Err(GeneratorError::provider("image response has no url"));
        }
        Ok(url.to_string())
    }
}

/// Maps an aspect ratio to the closest supported DALL-E size. Portrait
/// book format is the default.
fn image_size(aspect_ratio: &str) -> &'static str {
    match aspect_ratio {
        "1:1" => "1024x1024",
        "3:2" | "16:9" => "1792x1024",
        _ => "1024x1792",
    }
}

fn parse_error_message(raw_json: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(raw_json).ok()?;
    let message = value.get("error")?.get("message")?.as_str()?.to_owned();
    Some(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_size_prefers_portrait() {
        assert_eq!(image_size("2:3"), "1024x1792");
        assert_eq!(image_size("anything"), "1024x1792");
        assert_eq!(image_size("1:1"), "1024x1024");
        assert_eq!(image_size("3:2"), "1792x1024");
    }

    #[test]
    fn parses_api_error_body() {
        let raw = r#"{"error":{"message":"Rate limit reached","type":"requests"}}"#;
        assert_eq!(
            parse_error_message(raw).as_deref(),
            Some("Rate limit reached")
        );
        assert_eq!(parse_error_message("not json"), None);
    }

    #[test]
    fn endpoint_join_tolerates_trailing_slash() {
        let config = OpenAiConfig {
            api_key: "k".into(),
            base_url: "https://example.test/v1/".into(),
            model: DEFAULT_MODEL.into(),
            image_model: DEFAULT_IMAGE_MODEL.into(),
            temperature: 0.7,
        };
        let generator = OpenAiGenerator::new(config);
        assert_eq!(
            generator.endpoint("chat/completions"),
            "https://example.test/v1/chat/completions"
        );
    }
}
