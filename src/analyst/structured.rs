//! Typed remote calls: JSON-mode request, tolerant extraction, serde parse.

use serde::de::DeserializeOwned;
use tracing::debug;

use crate::gateway::{ChatGateway, ChatRequest, FinishReason};

use super::AnalystError;

/// Send `req` and parse the response as `T`.
///
/// A response cut off by the output-token ceiling is an error, never a partial
/// result.
pub(crate) async fn call_structured<T: DeserializeOwned>(
    gateway: &dyn ChatGateway,
    req: ChatRequest,
) -> Result<T, AnalystError> {
    let caller = req.attribution.caller;
    let max_tokens = req.max_tokens;
    let resp = gateway.chat(req.json()).await?;

    if resp.finish_reason == FinishReason::Length {
        return Err(AnalystError::OutputExhausted {
            caller,
            max_tokens,
            output_tokens: resp.output_tokens,
        });
    }

    debug!(
        caller,
        input_tokens = resp.input_tokens,
        output_tokens = resp.output_tokens,
        latency_ms = resp.latency.as_millis() as u64,
        "structured call complete"
    );

    parse_structured(caller, &resp.content)
}

pub(crate) fn parse_structured<T: DeserializeOwned>(
    caller: &'static str,
    raw: &str,
) -> Result<T, AnalystError> {
    serde_json::from_str(extract_json(raw)).map_err(|e| AnalystError::Parse {
        caller,
        message: e.to_string(),
    })
}

/// Extract the first balanced JSON object from a response (handles models
/// that wrap JSON in prose or code fences). Braces inside strings are skipped.
pub(crate) fn extract_json(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(start) = trimmed.find('{') else {
        return trimmed;
    };
    let remainder = &trimmed[start..];

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in remainder.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return &remainder[..=i];
                }
            }
            _ => {}
        }
    }

    remainder
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct Verdict {
        category: String,
    }

    #[test]
    fn extracts_object_from_fenced_prose() {
        let raw = "Sure!\n```json\n{\"category\": \"a}b\", \"x\": {\"y\": 1}}\n```\nDone.";
        assert_eq!(
            extract_json(raw),
            "{\"category\": \"a}b\", \"x\": {\"y\": 1}}"
        );
        let v: Verdict = parse_structured("test", raw).unwrap();
        assert_eq!(v.category, "a}b");
    }

    #[test]
    fn parse_error_names_the_caller() {
        let err = parse_structured::<Verdict>("analyst::classify", "no json here").unwrap_err();
        match err {
            AnalystError::Parse { caller, .. } => assert_eq!(caller, "analyst::classify"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
