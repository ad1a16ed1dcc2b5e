//! Parse pipeline (§4.2.1) and the `transform.*` step actions that share its
//! decode primitives. Grounded on `backend/services/protocol_executor.py`'s
//! `_parse_result`/`_run_transform`/`_extract_payload`.

use std::collections::HashMap;

use base64::Engine;
use regex::Regex;
use serde_json::{json, Value};

use crate::error::GatewayError;
use crate::model::Parse;

use super::expr;

/// `payload_as_string(x)`: prefer an explicit `payload` field on a map
/// result, decode bytes UTF-8-lossy, else stringify.
pub fn payload_as_string(raw: &Value) -> String {
    if let Some(payload) = raw.get("payload") {
        return match payload {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
    }
    match raw {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub fn apply_parse(parse: &Parse, raw_result: &Value, ctx: &Value) -> Result<Value, GatewayError> {
    match parse {
        Parse::Expression { expression } => {
            // Expressions see the step's own raw result merged with the
            // wider context (`registers`, `coils`, `payload`, `steps`, vars).
            let mut merged = ctx.clone();
            if let (Value::Object(m), Value::Object(raw)) = (&mut merged, raw_result) {
                for (k, v) in raw {
                    m.entry(k.clone()).or_insert_with(|| v.clone());
                }
            }
            expr::evaluate(expression, &merged)
        }
        Parse::Regex { pattern, group } => {
            let text = payload_as_string(raw_result);
            let re = Regex::new(pattern)
                .map_err(|e| GatewayError::ActionError(format!("bad regex: {e}")))?;
            match re.captures(&text) {
                Some(caps) => Ok(caps
                    .get(*group)
                    .map(|m| Value::String(m.as_str().to_string()))
                    .unwrap_or(Value::Null)),
                None => Ok(Value::Null),
            }
        }
        Parse::Substring { start, end } => {
            let text = payload_as_string(raw_result);
            let chars: Vec<char> = text.chars().collect();
            let len = chars.len() as i64;
            let clamp = |i: i64| -> usize {
                let idx = if i < 0 { (len + i).max(0) } else { i.min(len) };
                idx as usize
            };
            let (s, e) = (clamp(*start), clamp(*end));
            if s >= e {
                return Ok(Value::String(String::new()));
            }
            Ok(Value::String(chars[s..e].iter().collect()))
        }
        Parse::Struct { format, fields } => struct_parse(format, fields.as_deref(), raw_result),
    }
}

/// `transform.*` actions run locally without touching the driver; they share
/// the same decode primitives as the parse pipeline.
pub fn run_transform(action: &str, params: &HashMap<String, Value>) -> Result<Value, GatewayError> {
    let input = params
        .get("input")
        .ok_or_else(|| GatewayError::Validation("transform requires an 'input' param".to_string()))?;

    match action {
        "transform.base64_decode" => {
            let text = as_str(input);
            let decoded = base64::engine::general_purpose::STANDARD
                .decode(text.trim())
                .map_err(|e| GatewayError::ActionError(format!("base64_decode: {e}")))?;
            Ok(Value::String(String::from_utf8_lossy(&decoded).to_string()))
        }
        "transform.hex_decode" => {
            let cleaned: String = as_str(input).chars().filter(|c| !c.is_whitespace()).collect();
            let decoded = hex::decode(cleaned)
                .map_err(|e| GatewayError::ActionError(format!("hex_decode: {e}")))?;
            Ok(Value::String(String::from_utf8_lossy(&decoded).to_string()))
        }
        "transform.regex_extract" => {
            let pattern = params
                .get("pattern")
                .and_then(|v| v.as_str())
                .ok_or_else(|| GatewayError::Validation("regex_extract requires 'pattern'".to_string()))?;
            let group = params.get("group").and_then(|v| v.as_u64()).unwrap_or(1) as usize;
            let re = Regex::new(pattern)
                .map_err(|e| GatewayError::ActionError(format!("bad regex: {e}")))?;
            let text = as_str(input);
            Ok(re
                .captures(&text)
                .and_then(|c| c.get(group))
                .map(|m| Value::String(m.as_str().to_string()))
                .unwrap_or(Value::Null))
        }
        "transform.substring" => {
            let start = params.get("start").and_then(|v| v.as_i64()).unwrap_or(0);
            let end = params.get("end").and_then(|v| v.as_i64()).unwrap_or(i64::MAX);
            let text = as_str(input);
            let chars: Vec<char> = text.chars().collect();
            let len = chars.len() as i64;
            let clamp = |i: i64| -> usize {
                let idx = if i < 0 { (len + i).max(0) } else { i.min(len) };
                idx as usize
            };
            let (s, e) = (clamp(start), clamp(end));
            if s >= e {
                return Ok(Value::String(String::new()));
            }
            Ok(Value::String(chars[s..e].iter().collect()))
        }
        "transform.struct_parse" => {
            let format = params
                .get("format")
                .and_then(|v| v.as_str())
                .ok_or_else(|| GatewayError::Validation("struct_parse requires 'format'".to_string()))?;
            let fields: Option<Vec<String>> = params.get("fields").and_then(|v| {
                v.as_array().map(|a| {
                    a.iter()
                        .filter_map(|f| f.as_str().map(str::to_string))
                        .collect()
                })
            });
            struct_parse(format, fields.as_deref(), input)
        }
        other => Err(GatewayError::Unsupported(format!("unknown transform action: {other}"))),
    }
}

fn as_str(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn raw_bytes(raw: &Value) -> Vec<u8> {
    let source = raw.get("payload").unwrap_or(raw);
    match source {
        Value::String(s) => s.clone().into_bytes(),
        Value::Array(a) => a
            .iter()
            .filter_map(|v| v.as_u64().map(|n| n as u8))
            .collect(),
        other => other.to_string().into_bytes(),
    }
}

/// Unpack a fixed-width binary format: leading `>`/`<` selects endianness
/// (defaults big-endian), followed by field-letter codes
/// `b B h H i I q Q f d` mirroring Python's `struct` module subset the
/// original templates rely on.
fn struct_parse(format: &str, fields: Option<&[String]>, raw: &Value) -> Result<Value, GatewayError> {
    let bytes = raw_bytes(raw);
    let mut chars = format.chars().peekable();
    let big_endian = match chars.peek() {
        Some('>') => {
            chars.next();
            true
        }
        Some('<') => {
            chars.next();
            false
        }
        _ => true,
    };

    let mut offset = 0usize;
    let mut values = Vec::new();
    for code in chars {
        let (size, value) = read_field(code, &bytes[offset..], big_endian)?;
        offset += size;
        values.push(value);
    }

    match fields {
        Some(names) => {
            let mut map = serde_json::Map::new();
            for (name, value) in names.iter().zip(values.into_iter()) {
                map.insert(name.clone(), value);
            }
            Ok(Value::Object(map))
        }
        None => Ok(Value::Array(values)),
    }
}

fn read_field(code: char, buf: &[u8], big_endian: bool) -> Result<(usize, Value), GatewayError> {
    macro_rules! read_int {
        ($ty:ty, $size:expr) => {{
            if buf.len() < $size {
                return Err(GatewayError::ActionError(format!(
                    "struct_parse: need {} bytes, have {}",
                    $size,
                    buf.len()
                )));
            }
            let mut arr = [0u8; $size];
            arr.copy_from_slice(&buf[..$size]);
            let n = if big_endian {
                <$ty>::from_be_bytes(arr)
            } else {
                <$ty>::from_le_bytes(arr)
            };
            ($size, json!(n))
        }};
    }

    Ok(match code {
        'b' => read_int!(i8, 1),
        'B' => read_int!(u8, 1),
        'h' => read_int!(i16, 2),
        'H' => read_int!(u16, 2),
        'i' | 'l' => read_int!(i32, 4),
        'I' | 'L' => read_int!(u32, 4),
        'q' => read_int!(i64, 8),
        'Q' => read_int!(u64, 8),
        'f' => {
            if buf.len() < 4 {
                return Err(GatewayError::ActionError("struct_parse: need 4 bytes for f32".to_string()));
            }
            let mut arr = [0u8; 4];
            arr.copy_from_slice(&buf[..4]);
            let n = if big_endian {
                f32::from_be_bytes(arr)
            } else {
                f32::from_le_bytes(arr)
            };
            (4, json!(n))
        }
        'd' => {
            if buf.len() < 8 {
                return Err(GatewayError::ActionError("struct_parse: need 8 bytes for f64".to_string()));
            }
            let mut arr = [0u8; 8];
            arr.copy_from_slice(&buf[..8]);
            let n = if big_endian {
                f64::from_be_bytes(arr)
            } else {
                f64::from_le_bytes(arr)
            };
            (8, json!(n))
        }
        other => return Err(GatewayError::Unsupported(format!("unknown struct format code: {other}"))),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_weight_via_regex() {
        let parse = Parse::Regex {
            pattern: "\"weight\"\\s*:\\s*([-+]?[0-9]*\\.?[0-9]+)".to_string(),
            group: 1,
        };
        let raw = json!({"payload": "{\"weight\": 37.5, \"t\": 1}"});
        let result = apply_parse(&parse, &raw, &json!({})).unwrap();
        assert_eq!(result, json!("37.5"));
    }

    #[test]
    fn struct_parse_unpacks_big_endian_shorts() {
        let raw = json!({"payload": [0x00, 0x01, 0x00, 0x02]});
        let result = struct_parse(">hh", None, &raw).unwrap();
        assert_eq!(result, json!([1, 2]));
    }

    #[test]
    fn struct_parse_with_named_fields() {
        let raw = json!({"payload": [0x00, 0x01, 0x00, 0x02]});
        let fields = vec!["a".to_string(), "b".to_string()];
        let result = struct_parse(">hh", Some(&fields), &raw).unwrap();
        assert_eq!(result, json!({"a": 1, "b": 2}));
    }
}
