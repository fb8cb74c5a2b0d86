//! Lenient decoding of JSON objects returned by the completion service.

use serde::de::DeserializeOwned;
use tracing::debug;

/// A response that could not be coerced into the expected schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseFailure {
    pub reason: String,
}

/// Decode `raw` into `T`, salvaging common model formatting mistakes.
///
/// Tries a strict parse of the extracted object first, then one with raw
/// newlines escaped and brackets balanced, then a relaxed JSON5 parse.
pub fn parse_structured<T: DeserializeOwned>(raw: &str) -> Result<T, ParseFailure> {
    let payload = extract_json_payload(raw);
    if payload.is_empty() {
        return Err(ParseFailure {
            reason: "response contained no JSON object".into(),
        });
    }
    if let Ok(value) = serde_json::from_str::<T>(&payload) {
        return Ok(value);
    }

    let repaired = repair_json(&payload);
    if repaired != payload {
        if let Ok(value) = serde_json::from_str::<T>(&repaired) {
            debug!("structured response parsed after repair");
            return Ok(value);
        }
    }

    let value: serde_json::Value = json5::from_str(&repaired).map_err(|err| ParseFailure {
        reason: format!("invalid JSON even with relaxed parsing: {err}"),
    })?;
    serde_json::from_value(value).map_err(|err| ParseFailure {
        reason: format!("JSON did not match the expected fields: {err}"),
    })
}

fn extract_json_payload(raw: &str) -> String {
    let trimmed = raw.trim();
    let body = strip_code_fence(trimmed).unwrap_or_else(|| trimmed.to_string());
    match (body.find('{'), body.rfind('}')) {
        (Some(start), Some(end)) if start < end => body[start..=end].to_string(),
        (Some(start), _) => body[start..].to_string(),
        _ => String::new(),
    }
}

fn strip_code_fence(input: &str) -> Option<String> {
    let mut trimmed = input.trim();
    if !trimmed.starts_with("```") {
        return None;
    }
    trimmed = trimmed.trim_start_matches("```");
    trimmed = trimmed.trim_start_matches(|c: char| c.is_ascii_whitespace());
    if let Some(rest) = trimmed.strip_prefix("json") {
        trimmed = rest.trim_start_matches(|c: char| c.is_ascii_whitespace());
    }
    let end = trimmed.rfind("```").unwrap_or(trimmed.len());
    Some(trimmed[..end].trim().to_string())
}

/// Escape raw newlines inside strings and close anything left open.
fn repair_json(payload: &str) -> String {
    let mut result = String::with_capacity(payload.len() + 4);
    let mut in_string = false;
    let mut escape = false;
    let mut open = Vec::new();

    for ch in payload.chars() {
        if in_string {
            if escape {
                escape = false;
                result.push(ch);
                continue;
            }
            match ch {
                '\\' => {
                    escape = true;
                    result.push(ch);
                }
                '"' => {
                    in_string = false;
                    result.push(ch);
                }
                '\n' => result.push_str("\\n"),
                '\r' => {}
                _ => result.push(ch),
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => open.push('}'),
            '[' => open.push(']'),
            '}' | ']' => {
                open.pop();
            }
            _ => {}
        }
        result.push(ch);
    }

    if in_string {
        result.push('"');
    }
    while let Some(closer) = open.pop() {
        result.push(closer);
    }
    result
}
