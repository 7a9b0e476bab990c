use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
}

impl Request {
    /// 单轮用户提问。
    pub fn user_prompt(prompt: &str, generation_config: GenerationConfig) -> Self {
        Self {
            contents: vec![Content {
                role: "user".to_string(),
                parts: vec![Part {
                    text: prompt.to_string(),
                    ..Default::default()
                }],
            }],
            generation_config: Some(generation_config),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub role: String,
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub text: String,
    #[serde(skip_serializing_if = "is_false", default)]
    pub thought: bool,
}

fn is_false(v: &bool) -> bool {
    !*v
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage_metadata: Option<UsageMetadata>,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub model_version: String,
}

impl Response {
    /// 第一个候选中所有非思考文本片段的拼接。
    pub fn text(&self) -> String {
        let Some(candidate) = self.candidates.first() else {
            return String::new();
        };
        let Some(content) = &candidate.content else {
            return String::new();
        };
        content
            .parts
            .iter()
            .filter(|p| !p.thought)
            .map(|p| p.text.as_str())
            .collect()
    }

    pub fn finish_reason(&self) -> &str {
        self.candidates
            .first()
            .map(|c| c.finish_reason.as_str())
            .unwrap_or("")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<Content>,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub finish_reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetadata {
    #[serde(default)]
    pub prompt_token_count: u64,
    #[serde(default)]
    pub candidates_token_count: u64,
    #[serde(default)]
    pub total_token_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serializes_camel_case() {
        let req = Request::user_prompt(
            "你好",
            GenerationConfig {
                temperature: Some(0.6),
                max_output_tokens: Some(2048),
            },
        );
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["contents"][0]["role"], "user");
        assert_eq!(v["contents"][0]["parts"][0]["text"], "你好");
        assert_eq!(v["generationConfig"]["maxOutputTokens"], 2048);
        assert!(v["contents"][0]["parts"][0].get("thought").is_none());
    }

    #[test]
    fn response_text_skips_thoughts() {
        let body = r#"{
            "candidates": [{
                "content": {"role": "model", "parts": [
                    {"text": "thinking...", "thought": true},
                    {"text": "Hello "},
                    {"text": "world"}
                ]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 3, "candidatesTokenCount": 2, "totalTokenCount": 5},
            "modelVersion": "gemini-2.5-flash"
        }"#;
        let resp: Response = sonic_rs::from_str(body).unwrap();
        assert_eq!(resp.text(), "Hello world");
        assert_eq!(resp.finish_reason(), "STOP");
        assert_eq!(resp.usage_metadata.unwrap().total_token_count, 5);
    }

    #[test]
    fn response_without_candidates_has_no_text() {
        let resp: Response = sonic_rs::from_str(r#"{"promptFeedback":{"blockReason":"SAFETY"}}"#).unwrap();
        assert_eq!(resp.text(), "");
        assert_eq!(resp.finish_reason(), "");
    }
}
