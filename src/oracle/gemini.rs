use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::http::http_client;
use crate::oracle::{HypothesisOracle, OracleError, OracleRequest};
use crate::protocol::Speaker;

const API_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Serialize)]
struct Content<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    parts: Vec<Part<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    system_instruction: Content<'a>,
    contents: Vec<Content<'a>>,
    generation_config: GenerationConfig,
}

/// Google Gemini `generateContent` client.
pub struct GeminiOracle {
    api_key: String,
    model: String,
    temperature: f32,
}

impl GeminiOracle {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            temperature: 0.7,
        }
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/models/{}:generateContent",
            API_URL,
            urlencoding::encode(&self.model)
        )
    }
}

fn role(speaker: Speaker) -> &'static str {
    match speaker {
        Speaker::User => "user",
        Speaker::Assistant => "model",
    }
}

/// Shape an `OracleRequest` into the Gemini wire format. The history is
/// replayed as alternating turns and the request message always goes last as
/// a user turn, since the API rejects conversations ending on the model.
fn build_body(request: &OracleRequest, temperature: f32) -> GenerateRequest<'_> {
    let mut contents: Vec<Content<'_>> = request
        .history
        .iter()
        .map(|turn| Content {
            role: Some(role(turn.speaker)),
            parts: vec![Part { text: &turn.text }],
        })
        .collect();
    let message = if request.message.trim().is_empty() {
        "Continue."
    } else {
        request.message.as_str()
    };
    contents.push(Content {
        role: Some("user"),
        parts: vec![Part { text: message }],
    });
    GenerateRequest {
        system_instruction: Content {
            role: None,
            parts: vec![Part { text: &request.instruction }],
        },
        contents,
        generation_config: GenerationConfig { temperature },
    }
}

/// Concatenate the text parts of the first candidate.
fn extract_text(json: &Value) -> Option<String> {
    let parts = json.pointer("/candidates/0/content/parts")?.as_array()?;
    let text: String = parts
        .iter()
        .filter_map(|p| p.get("text").and_then(Value::as_str))
        .collect();
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

#[async_trait]
impl HypothesisOracle for GeminiOracle {
    async fn generate(&self, request: &OracleRequest) -> Result<String, OracleError> {
        let body = build_body(request, self.temperature);
        let resp = http_client()
            .post(self.endpoint())
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(OracleError::Api(format!("gemini: HTTP {}", resp.status())));
        }

        let json: Value = resp.json().await?;
        if let Some(reason) = json.pointer("/promptFeedback/blockReason").and_then(Value::as_str) {
            return Err(OracleError::Api(format!("gemini: prompt blocked ({reason})")));
        }
        extract_text(&json).ok_or(OracleError::Empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ConversationTurn;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn body_replays_history_and_ends_on_user() {
        let request = OracleRequest {
            instruction: "Ask one question.".into(),
            history: vec![
                ConversationTurn::user("it goes na na na"),
                ConversationTurn::assistant("Is it a pop song?"),
                ConversationTurn::user("Yes"),
            ],
            message: String::new(),
        };
        let body = serde_json::to_value(build_body(&request, 0.7)).expect("serialize");
        assert_eq!(body["systemInstruction"], json!({ "parts": [{ "text": "Ask one question." }] }));
        let roles: Vec<&str> = body["contents"]
            .as_array()
            .expect("contents")
            .iter()
            .map(|c| c["role"].as_str().unwrap_or_default())
            .collect();
        assert_eq!(roles, vec!["user", "model", "user", "user"]);
        assert_eq!(body["contents"][3]["parts"][0]["text"], "Continue.");
        assert!(body["generationConfig"]["temperature"].as_f64().is_some());
    }

    #[test]
    fn text_joined_from_first_candidate() {
        let resp = json!({
            "candidates": [{ "content": { "parts": [{ "text": "{\"song\": " }, { "text": "\"X\"}\n" }] } }]
        });
        assert_eq!(extract_text(&resp).as_deref(), Some("{\"song\": \"X\"}"));
        assert_eq!(extract_text(&json!({ "candidates": [] })), None);
        assert_eq!(
            extract_text(&json!({ "candidates": [{ "content": { "parts": [{ "text": "  " }] } }] })),
            None
        );
    }

    #[test]
    fn endpoint_names_model() {
        let oracle = GeminiOracle::new("key", "gemini-2.0-flash");
        assert_eq!(
            oracle.endpoint(),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.0-flash:generateContent"
        );
    }
}
