use serde::Deserialize;

/// Anthropic 上游的配置（Provider.config 的 anthropic 形态）。
#[derive(Debug, Clone, Deserialize)]
pub struct AnthropicUpstream {
    pub base_url: String,
    pub api_key: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub beta: String,
}

fn default_version() -> String {
    "2023-06-01".to_string()
}

impl AnthropicUpstream {
    pub fn chat_request(&self, client: &reqwest::Client, body: Vec<u8>) -> reqwest::RequestBuilder {
        let mut request = client
            .post(format!("{}/messages", self.base_url.trim_end_matches('/')))
            .header("content-type", "application/json")
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", &self.version);
        if !self.beta.is_empty() {
            request = request.header("anthropic-beta", &self.beta);
        }
        request.body(body)
    }
}
