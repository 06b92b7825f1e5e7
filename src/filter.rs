//! Content filtering: reversible removal of feature-tagged request content.
//!
//! A [`ContentFilter`] is created from an immutable snapshot of the original
//! request. `apply` removes every block and request-level field governed by
//! the disabled tags; `restore` re-enables tags and reproduces the request
//! with the removed content back at its original indices. Because both are
//! computed from the pristine snapshot, replaying all removals in reverse
//! exactly reconstitutes the original request.

use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::catalog::ModelEntry;
use crate::types::{ConverseRequest, FeatureTag};

/// A block removed by filtering, with enough position to restore it.
#[derive(Debug, Clone, PartialEq)]
pub struct RemovedBlock {
    /// Index of the containing message in the original request.
    pub message_index: usize,
    /// Index of the block within the original message content.
    pub block_index: usize,
    /// The removed block itself.
    pub block: crate::types::ContentBlock,
}

/// Stateful filter over one request, tracking removals across attempts.
#[derive(Debug, Clone)]
pub struct ContentFilter {
    original: ConverseRequest,
    disabled: BTreeSet<FeatureTag>,
    removed: BTreeMap<FeatureTag, Vec<RemovedBlock>>,
    warnings: Vec<String>,
}

impl ContentFilter {
    /// Snapshot the request and start with nothing disabled.
    pub fn new(request: &ConverseRequest) -> Self {
        Self {
            original: request.clone(),
            disabled: BTreeSet::new(),
            removed: BTreeMap::new(),
            warnings: Vec::new(),
        }
    }

    /// The pristine original request.
    pub fn original(&self) -> &ConverseRequest {
        &self.original
    }

    /// Tags currently disabled.
    pub fn disabled_features(&self) -> &BTreeSet<FeatureTag> {
        &self.disabled
    }

    /// Blocks removed for `tag` in the last `apply`.
    pub fn removed_blocks(&self, tag: FeatureTag) -> &[RemovedBlock] {
        self.removed.get(&tag).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Drain warnings produced by filtering (dropped empty messages).
    pub fn take_warnings(&mut self) -> Vec<String> {
        std::mem::take(&mut self.warnings)
    }

    /// Produce the request with everything governed by `disabled` removed.
    ///
    /// Always computed from the original snapshot, so repeated applications
    /// are idempotent and re-applying a larger set after a restore is fine.
    pub fn apply(&mut self, disabled: &BTreeSet<FeatureTag>) -> ConverseRequest {
        self.disabled = disabled.clone();
        self.removed.clear();

        let mut request = self.original.clone();

        // Message-level removals, recorded with original indices.
        let mut filtered_messages = Vec::with_capacity(request.messages.len());
        for (message_index, message) in request.messages.into_iter().enumerate() {
            let mut kept = Vec::with_capacity(message.content.len());
            let original_len = message.content.len();
            for (block_index, block) in message.content.into_iter().enumerate() {
                match block.feature_tag() {
                    Some(tag) if disabled.contains(&tag) => {
                        self.removed.entry(tag).or_default().push(RemovedBlock {
                            message_index,
                            block_index,
                            block,
                        });
                    }
                    _ => kept.push(block),
                }
            }
            if kept.is_empty() && original_len > 0 {
                let warning = format!(
                    "message {message_index} lost all content to filtering and was dropped"
                );
                debug!("{warning}");
                self.warnings.push(warning);
                continue;
            }
            filtered_messages.push(crate::types::Message {
                role: message.role,
                content: kept,
            });
        }
        request.messages = filtered_messages;

        // Request-level removals.
        if disabled.contains(&FeatureTag::ToolUse) {
            request.tool_config = None;
        }
        if disabled.contains(&FeatureTag::Guardrails) {
            request.guardrail_config = None;
        }
        if disabled.contains(&FeatureTag::AdditionalModelRequestFields) {
            request.additional_model_request_fields = None;
        }
        if disabled.contains(&FeatureTag::Streaming) {
            request.stream = false;
        }

        request
    }

    /// Re-enable `features` and produce the request with their content back
    /// at the original indices.
    pub fn restore(&mut self, features: &BTreeSet<FeatureTag>) -> ConverseRequest {
        let remaining: BTreeSet<FeatureTag> =
            self.disabled.difference(features).copied().collect();
        self.apply(&remaining)
    }

    /// Which currently disabled features `entry` can handle, according to
    /// catalog metadata (modalities and streaming support). Features with no
    /// catalog signal stay disabled.
    pub fn should_restore_for_model(&self, entry: &ModelEntry) -> (bool, BTreeSet<FeatureTag>) {
        let mut restorable = BTreeSet::new();
        for tag in &self.disabled {
            let supported = match tag {
                FeatureTag::ImageProcessing => entry.supports_input("image"),
                FeatureTag::DocumentProcessing => entry.supports_input("document"),
                FeatureTag::VideoProcessing => entry.supports_input("video"),
                FeatureTag::Streaming => entry.streaming_supported,
                // No catalog metadata for the rest; leave them disabled.
                _ => false,
            };
            if supported {
                restorable.insert(*tag);
            }
        }
        (!restorable.is_empty(), restorable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        CachePointBlock, ContentBlock, GuardBlock, GuardrailConfig, MediaBlock, MediaSource,
        Message, Role, ToolConfig, ToolUseBlock,
    };
    use serde_json::json;
    use std::collections::BTreeMap;

    fn image_block() -> ContentBlock {
        ContentBlock::Image(MediaBlock {
            format: "png".into(),
            source: MediaSource::Bytes("aW1n".into()),
        })
    }

    fn rich_request() -> ConverseRequest {
        ConverseRequest::new(vec![
            Message {
                role: Role::User,
                content: vec![
                    ContentBlock::text("describe this"),
                    image_block(),
                    ContentBlock::CachePoint(CachePointBlock::default()),
                ],
            },
            Message {
                role: Role::Assistant,
                content: vec![ContentBlock::ToolUse(ToolUseBlock {
                    tool_use_id: "tu-1".into(),
                    name: "lookup".into(),
                    input: json!({}),
                })],
            },
        ])
        .with_tool_config(ToolConfig::default())
        .with_guardrail_config(GuardrailConfig {
            guardrail_id: "g-1".into(),
            guardrail_version: "1".into(),
            trace: None,
        })
    }

    fn tags(list: &[FeatureTag]) -> BTreeSet<FeatureTag> {
        list.iter().copied().collect()
    }

    #[test]
    fn test_apply_empty_set_is_identity() {
        let request = rich_request();
        let mut filter = ContentFilter::new(&request);
        let applied = filter.apply(&BTreeSet::new());
        assert_eq!(applied, request);
    }

    #[test]
    fn test_apply_removes_tagged_blocks_and_fields() {
        let request = rich_request();
        let mut filter = ContentFilter::new(&request);
        let applied = filter.apply(&tags(&[FeatureTag::ImageProcessing, FeatureTag::ToolUse]));

        // Image gone, text and cache point stay in order.
        assert_eq!(applied.messages[0].content.len(), 2);
        assert_eq!(applied.messages[0].content[0], ContentBlock::text("describe this"));
        // The tool-use message lost all content and was dropped.
        assert_eq!(applied.messages.len(), 1);
        // Request-level tool config stripped; guardrails untouched.
        assert!(applied.tool_config.is_none());
        assert!(applied.guardrail_config.is_some());

        let warnings = filter.take_warnings();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("dropped"));

        // Ledger has the removals at their original positions.
        let removed = filter.removed_blocks(FeatureTag::ImageProcessing);
        assert_eq!(removed.len(), 1);
        assert_eq!((removed[0].message_index, removed[0].block_index), (0, 1));
    }

    #[test]
    fn test_round_trip_restores_exactly() {
        let request = rich_request();
        let mut filter = ContentFilter::new(&request);
        let disabled = tags(&[
            FeatureTag::ImageProcessing,
            FeatureTag::ToolUse,
            FeatureTag::PromptCaching,
            FeatureTag::Guardrails,
        ]);
        let _ = filter.apply(&disabled);
        let restored = filter.restore(&disabled);
        assert_eq!(restored, request);
        assert!(filter.disabled_features().is_empty());
    }

    #[test]
    fn test_partial_restore() {
        let request = rich_request();
        let mut filter = ContentFilter::new(&request);
        let _ = filter.apply(&tags(&[FeatureTag::ImageProcessing, FeatureTag::ToolUse]));

        let restored = filter.restore(&tags(&[FeatureTag::ImageProcessing]));
        // Image back at original index 1.
        assert_eq!(restored.messages[0].content[1], image_block());
        // Tool use still filtered.
        assert!(restored.tool_config.is_none());
        assert_eq!(
            filter.disabled_features(),
            &tags(&[FeatureTag::ToolUse])
        );
    }

    #[test]
    fn test_reapply_larger_set_after_restore() {
        let request = rich_request();
        let mut filter = ContentFilter::new(&request);
        let _ = filter.apply(&tags(&[FeatureTag::ImageProcessing]));
        let _ = filter.restore(&tags(&[FeatureTag::ImageProcessing]));
        let applied = filter.apply(&tags(&[
            FeatureTag::ImageProcessing,
            FeatureTag::PromptCaching,
        ]));
        assert_eq!(applied.messages[0].content.len(), 1);
        assert_eq!(filter.removed_blocks(FeatureTag::PromptCaching).len(), 1);
    }

    #[test]
    fn test_streaming_and_additional_fields_toggles() {
        let mut request = rich_request();
        request.stream = true;
        let mut fields = serde_json::Map::new();
        fields.insert("top_k".into(), json!(50));
        request.additional_model_request_fields = Some(fields);

        let mut filter = ContentFilter::new(&request);
        let applied = filter.apply(&tags(&[
            FeatureTag::Streaming,
            FeatureTag::AdditionalModelRequestFields,
        ]));
        assert!(!applied.stream);
        assert!(applied.additional_model_request_fields.is_none());

        let restored = filter.restore(&tags(&[FeatureTag::Streaming]));
        assert!(restored.stream);
        assert!(restored.additional_model_request_fields.is_none());
    }

    fn entry(modalities: &[&str], streaming: bool) -> ModelEntry {
        ModelEntry {
            model_name: "m".into(),
            provider: "p".into(),
            per_region: BTreeMap::new(),
            streaming_supported: streaming,
            input_modalities: modalities.iter().map(|m| m.to_string()).collect(),
            output_modalities: vec!["text".into()],
        }
    }

    #[test]
    fn test_should_restore_for_model_uses_catalog_metadata() {
        let request = rich_request();
        let mut filter = ContentFilter::new(&request);
        let _ = filter.apply(&tags(&[
            FeatureTag::ImageProcessing,
            FeatureTag::Streaming,
            FeatureTag::ToolUse,
        ]));

        let capable = entry(&["text", "image"], true);
        let (should, features) = filter.should_restore_for_model(&capable);
        assert!(should);
        assert_eq!(
            features,
            tags(&[FeatureTag::ImageProcessing, FeatureTag::Streaming])
        );
        // tool_use has no catalog signal and stays disabled.
        assert!(!features.contains(&FeatureTag::ToolUse));

        let text_only = entry(&["text"], false);
        let (should, features) = filter.should_restore_for_model(&text_only);
        assert!(!should);
        assert!(features.is_empty());
    }
}
