//! Error classification: provider codes and message patterns to retry
//! actions.
//!
//! String matching against provider error text is fragile but unavoidable;
//! the patterns live here as closed, versioned tables with a unit test per
//! known provider phrase. Content-incompatibility patterns are consulted
//! before feature-incompatibility patterns: disabling a feature silently
//! drops user data when the real problem is an unsupported content block,
//! so those errors skip to the next target instead.

use crate::transport::RpcFailure;
use crate::types::FeatureTag;

/// Version of the pattern tables below. Bump when phrases change.
pub const PATTERN_TABLE_VERSION: &str = "2025-07";

/// What kind of failure this is, and therefore what the retry manager does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorClass {
    /// Throttling, unavailability, timeouts. Retry the same target after
    /// backoff.
    Transient,
    /// Access denied, model not ready, not found. Skip to the next target.
    Access,
    /// The endpoint rejects a feature the request uses. Disable the feature
    /// and retry the same target immediately.
    FeatureCompat(FeatureTag),
    /// The endpoint rejects an additional request field. Strip it and retry
    /// the same target, carrying the field name when it could be extracted.
    ParameterCompat(Option<String>),
    /// The model rejects a content block kind (image, document, video).
    /// Never filtered; skip to the next target.
    ContentCompat(&'static str),
    /// Malformed request, credential faults. Surface immediately.
    NonRetryable,
}

/// A classification plus which table produced it, surfaced in warnings so
/// pattern drift stays visible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classified {
    /// The class driving the retry decision.
    pub class: ErrorClass,
    /// Name of the matching table.
    pub table: &'static str,
}

const TRANSIENT_CODES: &[&str] = &[
    "ThrottlingException",
    "ServiceUnavailableException",
    "InternalServerException",
    "ModelTimeoutException",
    "ServiceQuotaExceededException",
    "ModelStreamErrorException",
];

const ACCESS_CODES: &[&str] = &[
    "AccessDeniedException",
    "UnauthorizedException",
    "ResourceNotFoundException",
    "ModelNotReadyException",
    "ValidationException",
];

const CREDENTIAL_CODES: &[&str] = &[
    "UnrecognizedClientException",
    "InvalidSignatureException",
    "ExpiredTokenException",
    "SerializationException",
];

const TRANSIENT_PATTERNS: &[&str] = &[
    "timeout",
    "timed out",
    "connection reset",
    "connection refused",
    "throttl",
    "rate limit",
    "too many requests",
    "service unavailable",
    "internal error",
];

/// Content-block incompatibility phrases, checked before everything
/// message-based. First element is the block kind reported back.
const CONTENT_PATTERNS: &[(&str, &str)] = &[
    ("image", "does not support image"),
    ("image", "image content is not supported"),
    ("image", "model does not accept image"),
    ("document", "does not support document"),
    ("document", "document content is not supported"),
    ("video", "does not support video"),
    ("video", "video content is not supported"),
    ("unknown", "unsupported content block"),
];

/// Additional-request-field rejection phrases.
const PARAMETER_PATTERNS: &[&str] = &[
    "additional model request field",
    "additionalmodelrequestfields",
    "unknown parameter",
    "unsupported parameter",
    "unsupported field",
    "extraneous key",
];

/// Feature-incompatibility phrases, per tag. Image/document/video are
/// deliberately absent: those are content-compat.
const FEATURE_PATTERNS: &[(FeatureTag, &[&str])] = &[
    (FeatureTag::Guardrails, &["guardrail", "content filter policy"]),
    (
        FeatureTag::ToolUse,
        &["tool use", "toolconfig", "tool_use", "function calling", "tool calling"],
    ),
    (
        FeatureTag::PromptCaching,
        &["cache point", "prompt caching", "cachepoint"],
    ),
    (
        FeatureTag::Streaming,
        &["streaming is not supported", "does not support streaming", "response streaming"],
    ),
    (
        FeatureTag::Reasoning,
        &["reasoning is not supported", "does not support reasoning", "reasoning_content"],
    ),
];

/// Try to pull the offending field name out of a parameter-rejection
/// message: the first token enclosed in single or double quotes.
fn extract_field_name(message: &str) -> Option<String> {
    for quote in ['\'', '"'] {
        let mut parts = message.split(quote);
        parts.next()?;
        if let Some(name) = parts.next() {
            if !name.is_empty() && !name.contains(char::is_whitespace) {
                return Some(name.to_string());
            }
        }
    }
    None
}

/// Classify a failure. `extra_transient_codes` extends the transient table
/// per configuration.
pub fn classify(failure: &RpcFailure, extra_transient_codes: &[String]) -> Classified {
    let code = failure.code.as_deref().unwrap_or("");
    let message = failure.message.to_lowercase();

    // 1. Structured transient signals: provider codes and HTTP status.
    if TRANSIENT_CODES.contains(&code) || extra_transient_codes.iter().any(|c| c == code) {
        return Classified {
            class: ErrorClass::Transient,
            table: "transient-code",
        };
    }
    if matches!(failure.status, Some(429) | Some(500) | Some(502) | Some(503) | Some(504)) {
        return Classified {
            class: ErrorClass::Transient,
            table: "transient-status",
        };
    }

    // 2. Credential and serialization faults are terminal regardless of text.
    if CREDENTIAL_CODES.contains(&code) {
        return Classified {
            class: ErrorClass::NonRetryable,
            table: "non-retryable-code",
        };
    }

    // 3. Content-compat is tested before feature-compat: overlapping phrases
    //    must not silently drop user content.
    for &(kind, pattern) in CONTENT_PATTERNS {
        if message.contains(pattern) {
            return Classified {
                class: ErrorClass::ContentCompat(kind),
                table: "content-compat",
            };
        }
    }

    // 4. Parameter rejections.
    for pattern in PARAMETER_PATTERNS {
        if message.contains(pattern) {
            return Classified {
                class: ErrorClass::ParameterCompat(extract_field_name(&failure.message)),
                table: "parameter-compat",
            };
        }
    }

    // 5. Feature rejections.
    for &(tag, patterns) in FEATURE_PATTERNS {
        for pattern in patterns {
            if message.contains(pattern) {
                return Classified {
                    class: ErrorClass::FeatureCompat(tag),
                    table: "feature-compat",
                };
            }
        }
    }

    // 6. Access-class codes (including generic validation of model/region).
    if ACCESS_CODES.contains(&code) {
        return Classified {
            class: ErrorClass::Access,
            table: "access-code",
        };
    }

    // 7. Transient text patterns.
    for pattern in TRANSIENT_PATTERNS {
        if message.contains(pattern) {
            return Classified {
                class: ErrorClass::Transient,
                table: "transient-pattern",
            };
        }
    }

    // Unknown errors surface rather than burn the attempt budget.
    Classified {
        class: ErrorClass::NonRetryable,
        table: "unclassified",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(code: Option<&str>, message: &str) -> RpcFailure {
        RpcFailure {
            code: code.map(str::to_string),
            message: message.to_string(),
            status: None,
        }
    }

    #[test]
    fn test_transient_codes() {
        for &code in TRANSIENT_CODES {
            let c = classify(&failure(Some(code), "anything"), &[]);
            assert_eq!(c.class, ErrorClass::Transient, "{code}");
        }
    }

    #[test]
    fn test_transient_status() {
        let f = RpcFailure::new("gateway").with_status(503);
        assert_eq!(classify(&f, &[]).class, ErrorClass::Transient);
        let f = RpcFailure::new("fine").with_status(404);
        assert_ne!(classify(&f, &[]).class, ErrorClass::Transient);
    }

    #[test]
    fn test_extra_retryable_codes() {
        let f = failure(Some("CustomBackpressure"), "x");
        assert_eq!(classify(&f, &[]).class, ErrorClass::NonRetryable);
        assert_eq!(
            classify(&f, &["CustomBackpressure".to_string()]).class,
            ErrorClass::Transient
        );
    }

    #[test]
    fn test_access_codes() {
        let c = classify(
            &failure(Some("AccessDeniedException"), "no access to model"),
            &[],
        );
        assert_eq!(c.class, ErrorClass::Access);
        assert_eq!(c.table, "access-code");
    }

    #[test]
    fn test_credential_codes_terminal() {
        let c = classify(
            &failure(Some("ExpiredTokenException"), "token expired"),
            &[],
        );
        assert_eq!(c.class, ErrorClass::NonRetryable);
    }

    #[test]
    fn test_content_compat_phrases() {
        for &(kind, phrase) in CONTENT_PATTERNS {
            let c = classify(&failure(Some("ValidationException"), phrase), &[]);
            assert_eq!(c.class, ErrorClass::ContentCompat(kind), "{phrase}");
            assert_eq!(c.table, "content-compat");
        }
    }

    #[test]
    fn test_content_compat_wins_over_feature_compat() {
        // "image" would never match the feature table (by design), but a
        // message mentioning both content and a feature must classify as
        // content-compat.
        let c = classify(
            &failure(
                Some("ValidationException"),
                "This model does not support image content in tool use",
            ),
            &[],
        );
        assert!(matches!(c.class, ErrorClass::ContentCompat("image")));
    }

    #[test]
    fn test_feature_compat_phrases() {
        let cases: &[(&str, FeatureTag)] = &[
            ("Guardrail is not applicable for this model", FeatureTag::Guardrails),
            ("This model doesn't support tool use.", FeatureTag::ToolUse),
            ("cache point is not supported here", FeatureTag::PromptCaching),
            ("Streaming is not supported for the model", FeatureTag::Streaming),
            ("reasoning is not supported by this endpoint", FeatureTag::Reasoning),
        ];
        for &(message, tag) in cases {
            let c = classify(&failure(Some("ValidationException"), message), &[]);
            assert_eq!(c.class, ErrorClass::FeatureCompat(tag), "{message}");
            assert_eq!(c.table, "feature-compat");
        }
    }

    #[test]
    fn test_parameter_compat_extracts_field() {
        let c = classify(
            &failure(
                Some("ValidationException"),
                "Unknown parameter 'top_k' in additionalModelRequestFields",
            ),
            &[],
        );
        assert_eq!(c.class, ErrorClass::ParameterCompat(Some("top_k".into())));

        let c = classify(
            &failure(Some("ValidationException"), "unsupported field supplied"),
            &[],
        );
        assert_eq!(c.class, ErrorClass::ParameterCompat(None));
    }

    #[test]
    fn test_transient_message_patterns() {
        let c = classify(&failure(None, "Read timed out after 30s"), &[]);
        assert_eq!(c.class, ErrorClass::Transient);
        assert_eq!(c.table, "transient-pattern");
    }

    #[test]
    fn test_unknown_is_non_retryable() {
        let c = classify(&failure(None, "something inexplicable"), &[]);
        assert_eq!(c.class, ErrorClass::NonRetryable);
        assert_eq!(c.table, "unclassified");
    }

    #[test]
    fn test_code_beats_message_for_transient() {
        // A throttling code with a feature-looking message still sleeps and
        // retries rather than disabling the feature.
        let c = classify(
            &failure(Some("ThrottlingException"), "tool use rate limited"),
            &[],
        );
        assert_eq!(c.class, ErrorClass::Transient);
    }
}
