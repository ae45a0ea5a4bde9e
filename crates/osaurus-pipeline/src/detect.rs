//! Detection of tool calls embedded in model output text.
//!
//! Models without native tool-call support emit the call as a JSON object in
//! the text stream. The detector scans a suffix of the rolling buffer for a
//! `"name": "<tool>"` key, delimits the enclosing JSON object with a
//! brace/string/escape state machine, and parses it. Detection is cheap to
//! gate: the pipeline only runs it on tokens containing `}`.

use regex::Regex;

/// How many characters of buffer tail the detector scans.
pub const DETECT_WINDOW: usize = 45_000;

/// How many successively wider enclosing objects are tried per name match.
/// Bounds backward-search cost on inputs full of false-positive name keys.
const MAX_ENCLOSURES: usize = 3;

/// A tool call recovered from the text stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedToolCall {
    pub name: String,
    pub arguments_json: String,
}

/// Per-request detector, compiled once from the request's tool list.
pub struct ToolCallDetector {
    patterns: Vec<(String, Regex)>,
}

impl ToolCallDetector {
    /// Build a detector for the given tool names. Returns `None` when the
    /// list is empty (detection disabled).
    pub fn new(tool_names: &[String]) -> Option<Self> {
        if tool_names.is_empty() {
            return None;
        }
        let patterns: Vec<(String, Regex)> = tool_names
            .iter()
            .filter_map(|name| {
                let pattern = format!(r#""(?:tool_)?name"\s*:\s*"{}""#, regex::escape(name));
                // Template + escaped literal; compilation only fails on a
                // pathological name, which then simply goes undetected.
                Regex::new(&pattern).ok().map(|re| (name.clone(), re))
            })
            .collect();
        if patterns.is_empty() {
            return None;
        }
        Some(Self { patterns })
    }

    /// Scan `window` (newest text last) for a completed tool-call object.
    /// Matches are tried newest-first.
    pub fn scan(&self, window: &str) -> Option<DetectedToolCall> {
        for (name, pattern) in &self.patterns {
            let matches: Vec<usize> = pattern.find_iter(window).map(|m| m.start()).collect();
            for key_pos in matches.into_iter().rev() {
                if let Some(call) = self.delimit_and_parse(window, key_pos, name) {
                    return Some(call);
                }
            }
        }
        None
    }

    /// From a name-key match, walk outwards through up to
    /// [`MAX_ENCLOSURES`] candidate `{` positions, delimit each candidate
    /// object, and accept the first that parses into a known shape.
    fn delimit_and_parse(
        &self,
        window: &str,
        key_pos: usize,
        name: &str,
    ) -> Option<DetectedToolCall> {
        let bytes = window.as_bytes();
        let mut open = key_pos;
        for _ in 0..MAX_ENCLOSURES {
            open = match bytes[..open].iter().rposition(|&b| b == b'{') {
                Some(p) => p,
                None => return None,
            };
            if let Some(close) = matching_brace(window, open) {
                if close > key_pos {
                    if let Ok(candidate) =
                        serde_json::from_str::<serde_json::Value>(&window[open..=close])
                    {
                        if let Some(arguments_json) = extract_call(&candidate, name) {
                            return Some(DetectedToolCall {
                                name: name.to_string(),
                                arguments_json,
                            });
                        }
                    }
                }
            }
        }
        None
    }
}

/// Byte offset of the `}` matching the `{` at `open`, honoring strings and
/// escapes. `None` when the object is still incomplete.
fn matching_brace(text: &str, open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in text[open..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(open + i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Accept the three shapes models emit:
/// `{"function":{"name":N,"arguments":…}}`, `{"tool_name":N,"arguments":…}`,
/// `{"name":N,"arguments":…}`. Arguments may already be a serialized string
/// or a nested object.
fn extract_call(candidate: &serde_json::Value, expect_name: &str) -> Option<String> {
    let obj = candidate.as_object()?;

    let (name, arguments) = if let Some(function) = obj.get("function").and_then(|f| f.as_object())
    {
        (function.get("name")?, function.get("arguments"))
    } else if obj.contains_key("tool_name") {
        (obj.get("tool_name")?, obj.get("arguments"))
    } else {
        (obj.get("name")?, obj.get("arguments"))
    };

    if name.as_str()? != expect_name {
        return None;
    }

    Some(match arguments {
        None | Some(serde_json::Value::Null) => "{}".to_string(),
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector(names: &[&str]) -> ToolCallDetector {
        let names: Vec<String> = names.iter().map(|s| s.to_string()).collect();
        ToolCallDetector::new(&names).unwrap()
    }

    #[test]
    fn empty_tool_list_disables_detection() {
        assert!(ToolCallDetector::new(&[]).is_none());
    }

    #[test]
    fn detects_bare_name_shape() {
        let d = detector(&["get_weather"]);
        let call = d
            .scan(r#"thinking…{"name":"get_weather","arguments":{"city":"SF"}}"#)
            .unwrap();
        assert_eq!(call.name, "get_weather");
        assert_eq!(call.arguments_json, r#"{"city":"SF"}"#);
    }

    #[test]
    fn detects_function_wrapper_shape() {
        let d = detector(&["get_weather"]);
        let call = d
            .scan(r#"{"function":{"name":"get_weather","arguments":"{\"city\":\"SF\"}"}}"#)
            .unwrap();
        assert_eq!(call.name, "get_weather");
        assert_eq!(call.arguments_json, r#"{"city":"SF"}"#);
    }

    #[test]
    fn detects_tool_name_shape() {
        let d = detector(&["search"]);
        let call = d
            .scan(r#"{"tool_name":"search","arguments":{"q":"rust"}}"#)
            .unwrap();
        assert_eq!(call.name, "search");
        assert_eq!(call.arguments_json, r#"{"q":"rust"}"#);
    }

    #[test]
    fn string_arguments_pass_through_unreserialized() {
        let d = detector(&["t"]);
        let call = d
            .scan(r#"{"name":"t","arguments":"{\"a\": 1}"}"#)
            .unwrap();
        assert_eq!(call.arguments_json, r#"{"a": 1}"#);
    }

    #[test]
    fn missing_arguments_default_to_empty_object() {
        let d = detector(&["t"]);
        let call = d.scan(r#"{"name":"t"}"#).unwrap();
        assert_eq!(call.arguments_json, "{}");
    }

    #[test]
    fn unknown_tool_name_is_ignored() {
        let d = detector(&["get_weather"]);
        assert!(d.scan(r#"{"name":"other_tool","arguments":{}}"#).is_none());
    }

    #[test]
    fn incomplete_object_is_not_detected() {
        let d = detector(&["get_weather"]);
        assert!(d.scan(r#"{"name":"get_weather","arguments":{"city":"#).is_none());
    }

    #[test]
    fn braces_inside_strings_do_not_confuse_delimiting() {
        let d = detector(&["t"]);
        let call = d
            .scan(r#"{"name":"t","arguments":{"text":"some { weird } braces"}}"#)
            .unwrap();
        assert_eq!(call.arguments_json, r#"{"text":"some { weird } braces"}"#);
    }

    #[test]
    fn escaped_quotes_inside_strings_are_honored() {
        let d = detector(&["t"]);
        let call = d
            .scan(r#"{"name":"t","arguments":{"text":"quote \" and { brace"}}"#)
            .unwrap();
        assert!(call.arguments_json.contains("brace"));
    }

    #[test]
    fn newest_match_wins() {
        let d = detector(&["t"]);
        let text = concat!(
            r#"{"name":"t","arguments":{"n":1}} and later "#,
            r#"{"name":"t","arguments":{"n":2}}"#
        );
        let call = d.scan(text).unwrap();
        assert_eq!(call.arguments_json, r#"{"n":2}"#);
    }

    #[test]
    fn name_key_mentioned_in_prose_is_not_a_call() {
        let d = detector(&["get_weather"]);
        assert!(
            d.scan(r#"the "name": "get_weather" key would appear in JSON"#)
                .is_none()
        );
    }
}
