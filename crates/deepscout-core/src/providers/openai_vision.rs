use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use super::{http_client, is_retryable_status, is_transient};
use crate::agents::{ImageDescription, VisionModel};
use crate::config::VlmConfig;
use crate::error::PipelineError;
use crate::security::SecretValue;

const USER_AGENT: &str = concat!("deepscout/", env!("CARGO_PKG_VERSION"));

/// OpenAI-compatible chat-completions client used for image description.
pub struct OpenAiVisionModel {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    prompt: String,
    api_key: SecretValue,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiVisionModel {
    pub fn new(config: &VlmConfig, api_key: SecretValue) -> Result<Self, PipelineError> {
        let client = http_client(USER_AGENT, config.timeout()).map_err(|err| {
            PipelineError::InvalidConfiguration(format!("failed to build VLM client: {err}"))
        })?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            prompt: config.prompt.clone(),
            api_key,
        })
    }
}

#[async_trait]
impl VisionModel for OpenAiVisionModel {
    async fn describe(&self, image_ref: &str) -> Result<ImageDescription, PipelineError> {
        let payload = json!({
            "model": self.model,
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": self.prompt },
                    { "type": "image_url", "image_url": { "url": image_ref } }
                ]
            }]
        });

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(self.api_key.expose())
            .json(&payload)
            .send()
            .await
            .map_err(|err| {
                PipelineError::image_failed(image_ref, err.to_string(), is_transient(&err))
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::image_failed(
                image_ref,
                format!("model endpoint returned HTTP {status}"),
                is_retryable_status(status),
            ));
        }

        let body: ChatResponse = response.json().await.map_err(|err| {
            PipelineError::image_failed(
                image_ref,
                format!("malformed model response: {err}"),
                false,
            )
        })?;

        let description = body
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|content| content.trim().to_string())
            .filter(|content| !content.is_empty())
            .ok_or_else(|| {
                PipelineError::image_failed(image_ref, "model returned no description", false)
            })?;

        Ok(ImageDescription {
            description,
            confidence: None,
        })
    }
}
