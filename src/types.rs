//! Request data model: messages, content blocks, and per-request configuration.
//!
//! [`ConverseRequest`] is the normalized request the relay orchestrates.
//! Content is an ordered list of [`ContentBlock`] values per [`Message`];
//! block order is significant and is preserved across filter/restore cycles
//! (see [`ContentFilter`](crate::filter::ContentFilter)).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// The author of a [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// End-user input.
    User,
    /// Model output (also used for continuation prefixes during mid-stream
    /// recovery).
    Assistant,
}

/// Raw media payload: inline bytes (base64) or an external reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MediaSource {
    /// Base64-encoded inline bytes.
    Bytes(String),
    /// Opaque reference (URI, storage key) resolved by the provider.
    Reference(String),
}

impl MediaSource {
    /// Returns `true` if the source carries no usable payload.
    pub fn is_empty(&self) -> bool {
        match self {
            MediaSource::Bytes(b) => b.is_empty(),
            MediaSource::Reference(r) => r.is_empty(),
        }
    }
}

/// An image or video attachment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaBlock {
    /// Container format (e.g. `"jpeg"`, `"png"`, `"mp4"`).
    pub format: String,
    /// Payload bytes or reference.
    pub source: MediaSource,
}

/// A document attachment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentBlock {
    /// Display name used by the model to refer to the document.
    pub name: String,
    /// Container format (e.g. `"pdf"`, `"txt"`, `"md"`).
    pub format: String,
    /// Payload bytes or reference.
    pub source: MediaSource,
}

/// A model-initiated tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolUseBlock {
    /// Correlation id matched by the eventual [`ToolResultBlock`].
    pub tool_use_id: String,
    /// Tool name.
    pub name: String,
    /// Tool input as free-form JSON.
    pub input: Value,
}

/// The caller-supplied result of a prior tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResultBlock {
    /// Correlation id of the originating [`ToolUseBlock`].
    pub tool_use_id: String,
    /// Result content as free-form JSON.
    pub content: Value,
    /// Optional status (`"success"` / `"error"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// Guard-evaluated content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardBlock {
    /// Text to run through the configured guardrail.
    pub text: String,
}

/// Model reasoning content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReasoningBlock {
    /// Reasoning text.
    pub text: String,
}

/// A prompt-cache checkpoint marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachePointBlock {
    /// Checkpoint type. The provider currently defines only `"default"`.
    #[serde(rename = "type")]
    pub kind: String,
}

impl Default for CachePointBlock {
    fn default() -> Self {
        Self {
            kind: "default".to_string(),
        }
    }
}

/// One element of a message's ordered content list.
///
/// Every variant except `Text` maps to a [`FeatureTag`] the
/// [`ContentFilter`](crate::filter::ContentFilter) can remove and restore.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ContentBlock {
    /// Plain text.
    Text(String),
    /// Image attachment.
    Image(MediaBlock),
    /// Document attachment.
    Document(DocumentBlock),
    /// Video attachment.
    Video(MediaBlock),
    /// Model-initiated tool call.
    ToolUse(ToolUseBlock),
    /// Result of a prior tool call.
    ToolResult(ToolResultBlock),
    /// Guard-evaluated content.
    Guard(GuardBlock),
    /// Model reasoning content.
    Reasoning(ReasoningBlock),
    /// Prompt-cache checkpoint.
    CachePoint(CachePointBlock),
}

impl ContentBlock {
    /// The feature tag governing this block, or `None` for plain text.
    pub fn feature_tag(&self) -> Option<FeatureTag> {
        match self {
            ContentBlock::Text(_) => None,
            ContentBlock::Image(_) => Some(FeatureTag::ImageProcessing),
            ContentBlock::Document(_) => Some(FeatureTag::DocumentProcessing),
            ContentBlock::Video(_) => Some(FeatureTag::VideoProcessing),
            ContentBlock::ToolUse(_) | ContentBlock::ToolResult(_) => Some(FeatureTag::ToolUse),
            ContentBlock::Guard(_) => Some(FeatureTag::Guardrails),
            ContentBlock::Reasoning(_) => Some(FeatureTag::Reasoning),
            ContentBlock::CachePoint(_) => Some(FeatureTag::PromptCaching),
        }
    }

    /// Short kind name for diagnostics (`"text"`, `"image"`, ...).
    pub fn kind(&self) -> &'static str {
        match self {
            ContentBlock::Text(_) => "text",
            ContentBlock::Image(_) => "image",
            ContentBlock::Document(_) => "document",
            ContentBlock::Video(_) => "video",
            ContentBlock::ToolUse(_) => "tool_use",
            ContentBlock::ToolResult(_) => "tool_result",
            ContentBlock::Guard(_) => "guard",
            ContentBlock::Reasoning(_) => "reasoning",
            ContentBlock::CachePoint(_) => "cache_point",
        }
    }

    /// Convenience: a text block.
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text(text.into())
    }
}

/// A single conversation turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Author of the turn.
    pub role: Role,
    /// Ordered content blocks. Order is preserved across filtering.
    pub content: Vec<ContentBlock>,
}

impl Message {
    /// A user message containing a single text block.
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentBlock::text(text)],
        }
    }

    /// An assistant message containing a single text block.
    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: vec![ContentBlock::text(text)],
        }
    }

    /// Append a content block.
    pub fn with_block(mut self, block: ContentBlock) -> Self {
        self.content.push(block);
        self
    }
}

/// A system prompt entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemPrompt {
    /// System prompt text.
    pub text: String,
}

impl SystemPrompt {
    /// Build a system prompt from text.
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

/// Sampling and length configuration for one request.
///
/// Unknown keys supplied by callers land in `extra`; they are forwarded
/// untouched but flagged with a validation warning.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceConfig {
    /// Maximum tokens to generate. Must be positive when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Sampling temperature in `[0, 1]`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Nucleus sampling cutoff in `[0, 1]`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    /// Generation stops when any of these sequences is produced.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop_sequences: Vec<String>,
    /// Keys this library does not recognize. Forwarded as-is with a warning.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Tool definitions and selection policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolConfig {
    /// Tool specifications in the provider's schema.
    pub tools: Vec<Value>,
    /// Optional tool-choice directive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,
}

/// Guardrail selection for one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardrailConfig {
    /// Guardrail identifier.
    pub guardrail_id: String,
    /// Guardrail version.
    pub guardrail_version: String,
    /// Trace mode (`"enabled"` / `"disabled"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
}

/// Provider performance tier selection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceConfig {
    /// Latency tier (`"standard"` / `"optimized"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency: Option<String>,
}

/// A normalized converse request.
///
/// # Example
///
/// ```
/// use llm_relay::types::{ConverseRequest, Message};
///
/// let request = ConverseRequest::new(vec![Message::user("Hello")])
///     .with_request_id("req-1");
/// assert_eq!(request.messages.len(), 1);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConverseRequest {
    /// Identifier unique within a batch. Auto-assigned by the parallel
    /// executor when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Ordered conversation turns. Must be non-empty.
    pub messages: Vec<Message>,
    /// System prompts.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub system: Vec<SystemPrompt>,
    /// Sampling configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inference_config: Option<InferenceConfig>,
    /// Tool configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_config: Option<ToolConfig>,
    /// Guardrail configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guardrail_config: Option<GuardrailConfig>,
    /// Model-specific request fields forwarded verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_model_request_fields: Option<Map<String, Value>>,
    /// Performance tier selection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub performance_config: Option<PerformanceConfig>,
    /// Whether the streaming endpoint should be used. Set by
    /// `converse_stream`; cleared when the `streaming` feature is disabled
    /// by compatibility fallback.
    #[serde(default)]
    pub stream: bool,
    /// Dispatch priority for the parallel executor (higher first, only when
    /// request prioritization is enabled).
    #[serde(default)]
    pub priority: u32,
}

impl ConverseRequest {
    /// Build a request from messages.
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Self::default()
        }
    }

    /// Set the batch-unique request id.
    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }

    /// Add a system prompt.
    pub fn with_system(mut self, text: impl Into<String>) -> Self {
        self.system.push(SystemPrompt::new(text));
        self
    }

    /// Set the inference configuration.
    pub fn with_inference_config(mut self, config: InferenceConfig) -> Self {
        self.inference_config = Some(config);
        self
    }

    /// Set the tool configuration.
    pub fn with_tool_config(mut self, config: ToolConfig) -> Self {
        self.tool_config = Some(config);
        self
    }

    /// Set the guardrail configuration.
    pub fn with_guardrail_config(mut self, config: GuardrailConfig) -> Self {
        self.guardrail_config = Some(config);
        self
    }

    /// Set model-specific request fields.
    pub fn with_additional_fields(mut self, fields: Map<String, Value>) -> Self {
        self.additional_model_request_fields = Some(fields);
        self
    }

    /// Set the dispatch priority.
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }
}

/// Label for a request capability whose removal is reversible by the
/// content filter. Closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureTag {
    /// Image content blocks.
    ImageProcessing,
    /// Document content blocks.
    DocumentProcessing,
    /// Video content blocks.
    VideoProcessing,
    /// Tool-use and tool-result blocks plus the request-level tool config.
    ToolUse,
    /// Guard blocks plus the request-level guardrail config.
    Guardrails,
    /// Cache-point blocks.
    PromptCaching,
    /// The request-level streaming toggle.
    Streaming,
    /// Reasoning blocks.
    Reasoning,
    /// The request-level additional model request fields.
    AdditionalModelRequestFields,
}

impl FeatureTag {
    /// All tags, in declaration order.
    pub const ALL: [FeatureTag; 9] = [
        FeatureTag::ImageProcessing,
        FeatureTag::DocumentProcessing,
        FeatureTag::VideoProcessing,
        FeatureTag::ToolUse,
        FeatureTag::Guardrails,
        FeatureTag::PromptCaching,
        FeatureTag::Streaming,
        FeatureTag::Reasoning,
        FeatureTag::AdditionalModelRequestFields,
    ];

    /// Snake-case name used in warnings and serialized responses.
    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureTag::ImageProcessing => "image_processing",
            FeatureTag::DocumentProcessing => "document_processing",
            FeatureTag::VideoProcessing => "video_processing",
            FeatureTag::ToolUse => "tool_use",
            FeatureTag::Guardrails => "guardrails",
            FeatureTag::PromptCaching => "prompt_caching",
            FeatureTag::Streaming => "streaming",
            FeatureTag::Reasoning => "reasoning",
            FeatureTag::AdditionalModelRequestFields => "additional_model_request_fields",
        }
    }
}

impl fmt::Display for FeatureTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_content_block_wire_shape() {
        let block = ContentBlock::text("hello");
        let v = serde_json::to_value(&block).unwrap();
        assert_eq!(v, json!({"text": "hello"}));

        let block = ContentBlock::Image(MediaBlock {
            format: "png".into(),
            source: MediaSource::Bytes("QUJD".into()),
        });
        let v = serde_json::to_value(&block).unwrap();
        assert_eq!(
            v,
            json!({"image": {"format": "png", "source": {"bytes": "QUJD"}}})
        );
    }

    #[test]
    fn test_content_block_round_trip() {
        let blocks = vec![
            ContentBlock::text("t"),
            ContentBlock::Document(DocumentBlock {
                name: "spec".into(),
                format: "pdf".into(),
                source: MediaSource::Reference("s3://bucket/spec.pdf".into()),
            }),
            ContentBlock::ToolUse(ToolUseBlock {
                tool_use_id: "tu-1".into(),
                name: "search".into(),
                input: json!({"q": "rust"}),
            }),
            ContentBlock::CachePoint(CachePointBlock::default()),
        ];
        let text = serde_json::to_string(&blocks).unwrap();
        let back: Vec<ContentBlock> = serde_json::from_str(&text).unwrap();
        assert_eq!(blocks, back);
    }

    #[test]
    fn test_feature_tags() {
        assert_eq!(ContentBlock::text("x").feature_tag(), None);
        assert_eq!(
            ContentBlock::Guard(GuardBlock { text: "g".into() }).feature_tag(),
            Some(FeatureTag::Guardrails)
        );
        assert_eq!(
            ContentBlock::ToolResult(ToolResultBlock {
                tool_use_id: "tu".into(),
                content: json!([]),
                status: None,
            })
            .feature_tag(),
            Some(FeatureTag::ToolUse)
        );
        assert_eq!(FeatureTag::PromptCaching.as_str(), "prompt_caching");
    }

    #[test]
    fn test_inference_config_captures_unknown_keys() {
        let raw = json!({
            "maxTokens": 100,
            "temperature": 0.5,
            "topK": 40
        });
        let config: InferenceConfig = serde_json::from_value(raw).unwrap();
        assert_eq!(config.max_tokens, Some(100));
        assert!(config.extra.contains_key("topK"));
    }

    #[test]
    fn test_message_builders() {
        let msg = Message::user("hi").with_block(ContentBlock::CachePoint(Default::default()));
        assert_eq!(msg.role, Role::User);
        assert_eq!(msg.content.len(), 2);
    }
}
