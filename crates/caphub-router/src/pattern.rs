//! Input-shape pattern detection.
//!
//! Used only when the input carries no explicit `operation`. Each shape maps
//! to a fixed confidence score; the highest-scoring match seeds routing.

use caphub_contract::handler::Operation;
use caphub_contract::run::ContextMap;

/// An operation inferred from the input shape.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectedOperation {
    pub operation: Operation,
    pub confidence: f64,
}

fn has(context: &ContextMap, key: &str) -> bool {
    context.get(key).is_some_and(|v| !v.is_null())
}

/// Infer the operation from the context shape.
///
/// Shapes, highest confidence first:
/// - `text` + `categories` → classification (0.95)
/// - `text` + `schema` → extraction (0.95)
/// - (`query` | `question`) + `context_ids` → rag (0.90)
/// - `question` → reasoning (0.70)
/// - `query` → rag (0.60)
/// - `message` | `request` → generic (0.50)
pub fn detect_operation(context: &ContextMap) -> Option<DetectedOperation> {
    let text = has(context, "text");
    let query = has(context, "query");
    let question = has(context, "question");

    let detected = if text && has(context, "categories") {
        DetectedOperation {
            operation: Operation::Classification,
            confidence: 0.95,
        }
    } else if text && has(context, "schema") {
        DetectedOperation {
            operation: Operation::Extraction,
            confidence: 0.95,
        }
    } else if (query || question) && has(context, "context_ids") {
        DetectedOperation {
            operation: Operation::Rag,
            confidence: 0.90,
        }
    } else if question {
        DetectedOperation {
            operation: Operation::Reasoning,
            confidence: 0.70,
        }
    } else if query {
        DetectedOperation {
            operation: Operation::Rag,
            confidence: 0.60,
        }
    } else if has(context, "message") || has(context, "request") {
        DetectedOperation {
            operation: Operation::Generic,
            confidence: 0.50,
        }
    } else {
        return None;
    };
    Some(detected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(value: serde_json::Value) -> ContextMap {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_detection_table() {
        let cases = [
            (json!({"text": "t", "categories": ["a"]}), Operation::Classification, 0.95),
            (json!({"text": "t", "schema": {}}), Operation::Extraction, 0.95),
            (json!({"query": "q", "context_ids": ["c"]}), Operation::Rag, 0.90),
            (json!({"question": "q", "context_ids": ["c"]}), Operation::Rag, 0.90),
            (json!({"question": "why"}), Operation::Reasoning, 0.70),
            (json!({"query": "find"}), Operation::Rag, 0.60),
            (json!({"message": "hi"}), Operation::Generic, 0.50),
            (json!({"request": "do"}), Operation::Generic, 0.50),
        ];
        for (shape, operation, confidence) in cases {
            let detected = detect_operation(&ctx(shape.clone()))
                .unwrap_or_else(|| panic!("no detection for {shape}"));
            assert_eq!(detected.operation, operation, "{shape}");
            assert!((detected.confidence - confidence).abs() < f64::EPSILON, "{shape}");
        }
    }

    #[test]
    fn test_classification_beats_rag_when_both_match() {
        // text+categories scores above query-alone.
        let detected =
            detect_operation(&ctx(json!({"text": "t", "categories": [], "query": "q"})));
        // Empty categories array is still present and non-null.
        assert_eq!(detected.unwrap().operation, Operation::Classification);
    }

    #[test]
    fn test_unrecognized_shape_detects_nothing() {
        assert!(detect_operation(&ctx(json!({"payload": 1}))).is_none());
        assert!(detect_operation(&ctx(json!({}))).is_none());
        // Null values do not count as present.
        assert!(detect_operation(&ctx(json!({"query": null}))).is_none());
    }
}
