//! Tool-call extraction across native and text-embedded encodings.
//!
//! Text encodings recognised inside text parts:
//!
//! - XML: `<tool_use><name>read_file</name><args>{"path": "a"}</args></tool_use>`,
//!   or parameters as child tags: `<tool_use><name>read_file</name><path>a</path></tool_use>`
//! - Bracket markers: `[TOOL_CALL]{"name": "read_file", "args": {"path": "a"}}[/TOOL_CALL]`
//!
//! Neither encoding carries an id, so every call found in text gets a fresh one.

use agentloop_core::id;
use agentloop_types::{Content, FunctionCall, Part};

const XML_OPEN: &str = "<tool_use>";
const XML_CLOSE: &str = "</tool_use>";
const BRACKET_OPEN: &str = "[TOOL_CALL]";
const BRACKET_CLOSE: &str = "[/TOOL_CALL]";

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Text(String),
    Call(FunctionCall),
}

pub struct ToolCallParser;

impl ToolCallParser {
    /// Returns the calls of a message in part order.
    ///
    /// Native calls keep their id (or get one if it is missing). Calls found
    /// in text get fresh ids on every invocation, so callers that need stable
    /// ids should `normalize` first.
    pub fn extract(message: &Content) -> Vec<FunctionCall> {
        let mut calls = Vec::new();
        for part in &message.parts {
            match part {
                Part::FunctionCall(call) => {
                    let mut call = call.clone();
                    if call.id.is_empty() {
                        call.id = id::call_id();
                    }
                    calls.push(call);
                }
                Part::Text { text } => {
                    calls.extend(split_text(text).into_iter().filter_map(|s| match s {
                        Segment::Call(call) => Some(call),
                        Segment::Text(_) => None,
                    }));
                }
                _ => {}
            }
        }
        calls
    }

    /// Rewrites text-embedded calls into native function-call parts.
    ///
    /// Text around a call becomes its own text part. A block that fails to
    /// parse stays in the text unchanged.
    pub fn normalize(message: &mut Content) {
        let mut rewritten = Vec::with_capacity(message.parts.len());
        let mut changed = false;
        for part in message.parts.drain(..) {
            match part {
                Part::Text { text } if contains_marker(&text) => {
                    let segments = split_text(&text);
                    if !segments.iter().any(|s| matches!(s, Segment::Call(_))) {
                        rewritten.push(Part::Text { text });
                        continue;
                    }
                    changed = true;
                    for segment in segments {
                        match segment {
                            Segment::Text(text) if text.trim().is_empty() => {}
                            Segment::Text(text) => rewritten.push(Part::Text { text }),
                            Segment::Call(call) => rewritten.push(Part::FunctionCall(call)),
                        }
                    }
                }
                other => rewritten.push(other),
            }
        }
        message.parts = rewritten;
        if changed {
            tracing::debug!(message_id = %message.id, "normalized text-encoded tool calls");
        }
    }

    /// Back-fills missing ids on native calls. Existing ids are never touched.
    pub fn ensure_ids(message: &mut Content) {
        for part in &mut message.parts {
            if let Part::FunctionCall(call) = part {
                if call.id.is_empty() {
                    call.id = id::call_id();
                }
            }
        }
    }
}

fn contains_marker(text: &str) -> bool {
    text.contains(XML_OPEN) || text.contains(BRACKET_OPEN)
}

/// Splits text into narration and parsed calls, in order.
fn split_text(text: &str) -> Vec<Segment> {
    fn push_text(segments: &mut Vec<Segment>, s: &str) {
        if s.is_empty() {
            return;
        }
        if let Some(Segment::Text(prev)) = segments.last_mut() {
            prev.push_str(s);
        } else {
            segments.push(Segment::Text(s.to_string()));
        }
    }

    let mut segments: Vec<Segment> = Vec::new();
    let mut rest = text;
    loop {
        let next = [(XML_OPEN, XML_CLOSE), (BRACKET_OPEN, BRACKET_CLOSE)]
            .into_iter()
            .filter_map(|(open, close)| rest.find(open).map(|pos| (pos, open, close)))
            .min_by_key(|(pos, _, _)| *pos);

        let Some((start, open, close)) = next else {
            push_text(&mut segments, rest);
            break;
        };
        let body_start = start + open.len();
        let Some(body_len) = rest[body_start..].find(close) else {
            // Unterminated block: keep the remainder as narration.
            push_text(&mut segments, rest);
            break;
        };
        let body = &rest[body_start..body_start + body_len];
        let block_end = body_start + body_len + close.len();

        let parsed = if open == XML_OPEN {
            parse_xml_block(body)
        } else {
            parse_bracket_block(body)
        };

        push_text(&mut segments, &rest[..start]);
        match parsed {
            Some(call) => segments.push(Segment::Call(call)),
            None => {
                tracing::debug!(marker = %open, "tool call block did not parse, keeping text");
                push_text(&mut segments, &rest[start..block_end]);
            }
        }
        rest = &rest[block_end..];
    }
    segments
}

fn parse_bracket_block(body: &str) -> Option<FunctionCall> {
    let json: serde_json::Value = serde_json::from_str(body.trim()).ok()?;
    let name = json
        .get("name")
        .or_else(|| json.get("tool"))?
        .as_str()?
        .trim()
        .to_string();
    if name.is_empty() {
        return None;
    }
    let args = ["args", "arguments", "parameters"]
        .iter()
        .find_map(|key| json.get(*key))
        .cloned()
        .unwrap_or_else(|| serde_json::Value::Object(serde_json::Map::new()));
    Some(FunctionCall::new(name, args))
}

fn parse_xml_block(body: &str) -> Option<FunctionCall> {
    let tags = child_tags(body)?;
    let name = tags
        .iter()
        .find(|(tag, _)| tag == "name")
        .map(|(_, value)| value.trim().to_string())
        .filter(|name| !name.is_empty())?;

    if let Some((_, raw)) = tags.iter().find(|(tag, _)| tag == "args" || tag == "arguments") {
        let raw = raw.trim();
        if raw.is_empty() {
            return Some(FunctionCall::new(name, serde_json::json!({})));
        }
        let args: serde_json::Value = serde_json::from_str(raw).ok()?;
        if !args.is_object() {
            return None;
        }
        return Some(FunctionCall::new(name, args));
    }

    let mut args = serde_json::Map::new();
    for (tag, value) in tags.into_iter().filter(|(tag, _)| tag != "name") {
        let trimmed = value.trim();
        let parsed = serde_json::from_str::<serde_json::Value>(trimmed)
            .ok()
            .filter(|v| !v.is_string())
            .unwrap_or_else(|| serde_json::Value::String(trimmed.to_string()));
        args.insert(tag, parsed);
    }
    Some(FunctionCall::new(name, serde_json::Value::Object(args)))
}

/// Reads a flat sequence of `<tag>value</tag>` children.
///
/// Whitespace between children is allowed; any other stray text fails the block.
fn child_tags(body: &str) -> Option<Vec<(String, String)>> {
    let mut tags = Vec::new();
    let mut rest = body.trim_start();
    while !rest.is_empty() {
        let after_lt = rest.strip_prefix('<')?;
        let name_end = after_lt.find('>')?;
        let tag = &after_lt[..name_end];
        if tag.is_empty() || tag.starts_with('/') || tag.contains(char::is_whitespace) {
            return None;
        }
        let value_start = &after_lt[name_end + 1..];
        let close = format!("</{}>", tag);
        let value_end = value_start.find(&close)?;
        tags.push((tag.to_string(), value_start[..value_end].to_string()));
        rest = value_start[value_end + close.len()..].trim_start();
    }
    Some(tags)
}
