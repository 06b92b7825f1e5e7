//! Request validation at the orchestrator boundary.
//!
//! Shape faults reject the request before any RPC; recognized-but-odd input
//! (unknown inference keys) produces warnings instead.

use std::collections::HashSet;

use crate::error::{RelayError, Result};
use crate::types::{ContentBlock, ConverseRequest, MediaSource};

fn check_source(source: &MediaSource, field: &str, errors: &mut Vec<String>, fields: &mut Vec<String>) {
    if source.is_empty() {
        errors.push(format!("{field} has an empty source"));
        fields.push(field.to_string());
    }
}

/// Validate one request. Returns non-fatal warnings; shape faults become a
/// [`RelayError::RequestValidation`] carrying messages and field paths.
pub fn validate_request(request: &ConverseRequest) -> Result<Vec<String>> {
    let mut errors = Vec::new();
    let mut invalid_fields = Vec::new();
    let mut warnings = Vec::new();

    if request.messages.is_empty() {
        errors.push("messages must not be empty".to_string());
        invalid_fields.push("messages".to_string());
    }

    for (message_index, message) in request.messages.iter().enumerate() {
        if message.content.is_empty() {
            errors.push(format!("message {message_index} has empty content"));
            invalid_fields.push(format!("messages[{message_index}].content"));
            continue;
        }
        for (block_index, block) in message.content.iter().enumerate() {
            let path = format!("messages[{message_index}].content[{block_index}]");
            match block {
                ContentBlock::Text(text) => {
                    if text.is_empty() {
                        errors.push(format!("{path} is an empty text block"));
                        invalid_fields.push(path);
                    }
                }
                ContentBlock::Image(media) | ContentBlock::Video(media) => {
                    if media.format.is_empty() {
                        errors.push(format!("{path} is missing its format"));
                        invalid_fields.push(format!("{path}.format"));
                    }
                    check_source(&media.source, &path, &mut errors, &mut invalid_fields);
                }
                ContentBlock::Document(document) => {
                    if document.name.is_empty() {
                        errors.push(format!("{path} is missing its document name"));
                        invalid_fields.push(format!("{path}.name"));
                    }
                    if document.format.is_empty() {
                        errors.push(format!("{path} is missing its format"));
                        invalid_fields.push(format!("{path}.format"));
                    }
                    check_source(&document.source, &path, &mut errors, &mut invalid_fields);
                }
                ContentBlock::ToolUse(tool_use) => {
                    if tool_use.tool_use_id.is_empty() || tool_use.name.is_empty() {
                        errors.push(format!("{path} needs tool_use_id and name"));
                        invalid_fields.push(path);
                    }
                }
                ContentBlock::ToolResult(tool_result) => {
                    if tool_result.tool_use_id.is_empty() {
                        errors.push(format!("{path} needs tool_use_id"));
                        invalid_fields.push(path);
                    }
                }
                ContentBlock::Guard(guard) => {
                    if guard.text.is_empty() {
                        errors.push(format!("{path} is an empty guard block"));
                        invalid_fields.push(path);
                    }
                }
                ContentBlock::Reasoning(_) | ContentBlock::CachePoint(_) => {}
            }
        }
    }

    if let Some(config) = &request.inference_config {
        if let Some(max_tokens) = config.max_tokens {
            if max_tokens == 0 {
                errors.push("inference_config.max_tokens must be positive".to_string());
                invalid_fields.push("inference_config.max_tokens".to_string());
            }
        }
        if let Some(temperature) = config.temperature {
            if !(0.0..=1.0).contains(&temperature) {
                errors.push(format!(
                    "inference_config.temperature {temperature} outside [0, 1]"
                ));
                invalid_fields.push("inference_config.temperature".to_string());
            }
        }
        if let Some(top_p) = config.top_p {
            if !(0.0..=1.0).contains(&top_p) {
                errors.push(format!("inference_config.top_p {top_p} outside [0, 1]"));
                invalid_fields.push("inference_config.top_p".to_string());
            }
        }
        if !config.extra.is_empty() {
            let keys: Vec<&str> = config.extra.keys().map(String::as_str).collect();
            warnings.push(format!(
                "unknown inference_config key(s) forwarded as-is: {}",
                keys.join(", ")
            ));
        }
    }

    if errors.is_empty() {
        Ok(warnings)
    } else {
        Err(RelayError::RequestValidation {
            validation_errors: errors,
            invalid_fields,
        })
    }
}

/// Reject a batch whose requests share ids. Requests without an id are
/// ignored here (the executor assigns them unique ids).
pub fn check_id_collisions(requests: &[ConverseRequest]) -> Result<()> {
    let mut seen = HashSet::new();
    let mut collisions = Vec::new();
    for request in requests {
        if let Some(id) = &request.request_id {
            if !seen.insert(id.clone()) && !collisions.contains(id) {
                collisions.push(id.clone());
            }
        }
    }
    if collisions.is_empty() {
        Ok(())
    } else {
        Err(RelayError::RequestIdCollision { ids: collisions })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{InferenceConfig, Message};
    use serde_json::json;

    #[test]
    fn test_valid_request_passes() {
        let request = ConverseRequest::new(vec![Message::user("hello")]);
        assert!(validate_request(&request).unwrap().is_empty());
    }

    #[test]
    fn test_empty_messages_rejected() {
        let request = ConverseRequest::new(vec![]);
        match validate_request(&request) {
            Err(RelayError::RequestValidation { invalid_fields, .. }) => {
                assert_eq!(invalid_fields, vec!["messages"]);
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_content_rejected() {
        let request = ConverseRequest::new(vec![Message {
            role: crate::types::Role::User,
            content: vec![],
        }]);
        assert!(validate_request(&request).is_err());
    }

    #[test]
    fn test_inference_ranges() {
        let mut request = ConverseRequest::new(vec![Message::user("x")]);
        request.inference_config = Some(InferenceConfig {
            max_tokens: Some(0),
            temperature: Some(1.5),
            ..InferenceConfig::default()
        });
        match validate_request(&request) {
            Err(RelayError::RequestValidation {
                validation_errors, ..
            }) => {
                assert_eq!(validation_errors.len(), 2);
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_inference_keys_warn() {
        let mut request = ConverseRequest::new(vec![Message::user("x")]);
        let config: InferenceConfig =
            serde_json::from_value(json!({"maxTokens": 10, "topK": 40})).unwrap();
        request.inference_config = Some(config);
        let warnings = validate_request(&request).unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("topK"));
    }

    #[test]
    fn test_id_collision_detection() {
        let requests = vec![
            ConverseRequest::new(vec![Message::user("a")]).with_request_id("r1"),
            ConverseRequest::new(vec![Message::user("b")]).with_request_id("r2"),
            ConverseRequest::new(vec![Message::user("c")]).with_request_id("r1"),
        ];
        match check_id_collisions(&requests) {
            Err(RelayError::RequestIdCollision { ids }) => {
                assert_eq!(ids, vec!["r1"]);
            }
            other => panic!("expected collision error, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_ids_do_not_collide() {
        let requests = vec![
            ConverseRequest::new(vec![Message::user("a")]),
            ConverseRequest::new(vec![Message::user("b")]),
        ];
        assert!(check_id_collisions(&requests).is_ok());
    }
}
