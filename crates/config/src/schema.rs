//! Config schema. Every section defaults, so a partial file is a valid file.

use {
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize},
};

pub const DEFAULT_BASE_URL: &str = "http://localhost:10240/v1";
pub const DEFAULT_MODEL: &str = "mlx-community/Qwen2.5-7B-Instruct-1M-4bit";

/// Prompt for the bundled order-lookup assistant.
pub const DEFAULT_SYSTEM_PROMPT: &str = "\
You are a helpful customer support assistant for an online store.
Follow these steps when a customer asks about a delivery:
1. Ask for the customer's full name if they have not given it.
2. Call find_order_by_name with that name to look up their order.
3. If no order is found, ask the customer to double-check the name.
4. Call get_delivery_date with the order id you found.
5. Tell the customer the estimated delivery date in plain language.
6. Never invent order ids or dates; only report what the tools return.";

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolstreamConfig {
    pub provider: ProviderConfig,
    pub chat: ChatConfig,
    pub tools: ToolsConfig,
}

/// OpenAI-compatible model endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub base_url: String,
    /// Local servers usually ignore the key.
    #[serde(serialize_with = "serialize_secret")]
    pub api_key: Secret<String>,
    pub model: String,
    /// LoRA adapter applied on top of `model`; part of the model cache key.
    pub adapter_path: Option<String>,
    /// Deadline for one complete model call.
    pub timeout_secs: u64,
    pub temperature: f32,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.into(),
            api_key: Secret::new("not-needed".into()),
            model: DEFAULT_MODEL.into(),
            adapter_path: None,
            timeout_secs: 60,
            temperature: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    pub system_prompt: String,
    /// Keep the model's narration on assistant messages that carry tool calls.
    pub keep_content_with_tool_calls: bool,
    /// Look for tool calls written into plain text when none arrive structurally.
    pub fallback_parsing: bool,
    pub thought_start_tag: String,
    pub thought_end_tag: String,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.into(),
            keep_content_with_tool_calls: true,
            fallback_parsing: true,
            thought_start_tag: "<think>".into(),
            thought_end_tag: "</think>".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Model turns allowed per user message before giving up.
    pub max_iterations: usize,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self { max_iterations: 25 }
    }
}

fn serialize_secret<S: serde::Serializer>(
    secret: &Secret<String>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(secret.expose_secret())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = ToolstreamConfig::default();
        assert_eq!(cfg.provider.base_url, "http://localhost:10240/v1");
        assert_eq!(cfg.provider.api_key.expose_secret(), "not-needed");
        assert_eq!(cfg.provider.timeout_secs, 60);
        assert!(cfg.provider.adapter_path.is_none());
        assert!(cfg.chat.keep_content_with_tool_calls);
        assert!(cfg.chat.fallback_parsing);
        assert_eq!(cfg.chat.thought_start_tag, "<think>");
        assert_eq!(cfg.tools.max_iterations, 25);
        assert!(cfg.chat.system_prompt.contains("find_order_by_name"));
    }

    #[test]
    fn partial_sections_keep_defaults() {
        let cfg: ToolstreamConfig = toml::from_str(
            r#"
            [provider]
            model = "qwen3-8b"

            [chat]
            fallback_parsing = false
            "#,
        )
        .unwrap();
        assert_eq!(cfg.provider.model, "qwen3-8b");
        assert_eq!(cfg.provider.base_url, DEFAULT_BASE_URL);
        assert!(!cfg.chat.fallback_parsing);
        assert!(cfg.chat.keep_content_with_tool_calls);
        assert_eq!(cfg.tools.max_iterations, 25);
    }

    #[test]
    fn api_key_round_trips_through_serialization() {
        let mut cfg = ToolstreamConfig::default();
        cfg.provider.api_key = Secret::new("sk-test".into());
        let json = serde_json::to_value(&cfg).unwrap();
        assert_eq!(json["provider"]["api_key"], "sk-test");
        // Debug output never shows it.
        assert!(!format!("{:?}", cfg.provider).contains("sk-test"));
    }
}
