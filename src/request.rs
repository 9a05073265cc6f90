//! Binding runtime values into a compiled descriptor.

use crate::descriptor::{BodyTemplate, FormField, Placeholder, ProviderDescriptor, Segment, Template};
use crate::error::BuildError;
use crate::model::Role;
use base64::Engine;
use serde::Serialize;
use std::collections::BTreeMap;

// Array elements carrying these markers are removed after rendering: an
// image-only element whose slot got no attachment, and a spliced history with
// no entries.
const UNFILLED_IMAGE: &str = "__chatwire_unfilled_image__";
const NO_HISTORY: &str = "__chatwire_no_history__";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryEntry {
    pub role: Role,
    pub content: String,
}

/// Runtime values for one submission.
#[derive(Debug, Clone, Default)]
pub struct Bindings {
    pub history: Vec<HistoryEntry>,
    pub user_text: String,
    pub system_prompt: Option<String>,

    /// Base64 image payloads in attachment order.
    pub images: Vec<String>,

    /// Base64 audio payload.
    pub audio: Option<String>,
    pub variables: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoundPart {
    Text {
        name: String,
        value: String,
    },
    File {
        name: String,
        file_name: String,
        mime_type: Option<String>,
        bytes: Vec<u8>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoundBody {
    Empty,
    Text(String),
    Multipart(Vec<BoundPart>),
}

/// A provider-ready request with every placeholder resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: BoundBody,
    pub content_path: Option<String>,

    /// Non-fatal notes, e.g. attachments that found no image slot.
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Context {
    Url,
    Plain,
    Json,
}

/// Materialize `descriptor` with `bindings`.
///
/// Free-form variables are resolved first everywhere, then the reserved
/// tokens. Image slots are filled in attachment order across url, headers,
/// and body.
pub fn build(descriptor: &ProviderDescriptor, bindings: &Bindings) -> Result<BoundRequest, BuildError> {
    // Pass 1: variables.
    let url = resolve_variables(&descriptor.url, Context::Url, bindings)?;
    let headers = descriptor
        .headers
        .iter()
        .map(|(name, value)| Ok((name.clone(), resolve_variables(value, Context::Plain, bindings)?)))
        .collect::<Result<Vec<_>, BuildError>>()?;
    let body = match &descriptor.body {
        BodyTemplate::None => BodyTemplate::None,
        BodyTemplate::Json(t) => BodyTemplate::Json(resolve_variables(t, Context::Json, bindings)?),
        BodyTemplate::Raw(t) => BodyTemplate::Raw(resolve_variables(t, Context::Plain, bindings)?),
        BodyTemplate::Form(fields) => BodyTemplate::Form(
            fields
                .iter()
                .map(|f| match f {
                    FormField::Text { name, value } => Ok(FormField::Text {
                        name: name.clone(),
                        value: resolve_variables(value, Context::Plain, bindings)?,
                    }),
                    other => Ok(other.clone()),
                })
                .collect::<Result<Vec<_>, BuildError>>()?,
        ),
    };

    // Pass 2: reserved tokens.
    let mut reserved = Reserved {
        bindings,
        next_image: 0,
        image_slots: 0,
    };
    let url = reserved.render(&url, Context::Url)?;
    let headers = headers
        .iter()
        .map(|(name, value)| Ok((name.clone(), reserved.render(value, Context::Plain)?)))
        .collect::<Result<Vec<_>, BuildError>>()?;
    let body = match &body {
        BodyTemplate::None => BoundBody::Empty,
        BodyTemplate::Json(t) => {
            let text = reserved.render(t, Context::Json)?;
            BoundBody::Text(prune_markers(text))
        }
        BodyTemplate::Raw(t) => BoundBody::Text(reserved.render(t, Context::Plain)?),
        BodyTemplate::Form(fields) => {
            let mut parts = Vec::with_capacity(fields.len());
            for f in fields {
                parts.push(match f {
                    FormField::Text { name, value } => BoundPart::Text {
                        name: name.clone(),
                        value: reserved.render(value, Context::Plain)?,
                    },
                    FormField::Audio {
                        name,
                        file_name,
                        mime_type,
                    } => BoundPart::File {
                        name: name.clone(),
                        file_name: file_name.clone(),
                        mime_type: mime_type.clone(),
                        bytes: decode_audio(bindings)?,
                    },
                });
            }
            BoundBody::Multipart(parts)
        }
    };

    let mut warnings = Vec::new();
    let image_slots = reserved.image_slots;
    if bindings.images.len() > image_slots {
        let dropped = bindings.images.len() - image_slots;
        tracing::warn!(
            provider = %descriptor.id,
            dropped,
            image_slots,
            "dropping attachments without an image slot"
        );
        warnings.push(format!(
            "{dropped} attachment(s) not sent: provider `{}` has {image_slots} image slot(s)",
            descriptor.id
        ));
    }

    Ok(BoundRequest {
        method: descriptor.method.clone(),
        url,
        headers,
        body,
        content_path: descriptor.content_path.clone(),
        warnings,
    })
}

fn lookup_variable<'a>(bindings: &'a Bindings, name: &str) -> Option<&'a str> {
    bindings
        .variables
        .get(name)
        .or_else(|| {
            bindings
                .variables
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v)
        })
        .map(String::as_str)
}

fn resolve_variables(template: &Template, ctx: Context, bindings: &Bindings) -> Result<Template, BuildError> {
    let mut segments = Vec::with_capacity(template.segments().len());
    for seg in template.segments() {
        match seg {
            Segment::Slot {
                placeholder: Placeholder::Variable(name),
                in_string,
                ..
            } => {
                let value = lookup_variable(bindings, name).ok_or_else(|| BuildError::MissingBinding {
                    placeholder: name.clone(),
                })?;
                let text = match ctx {
                    Context::Json if *in_string => escape_json(value),
                    _ => value.to_string(),
                };
                segments.push(Segment::Literal(text));
            }
            other => segments.push(other.clone()),
        }
    }
    Ok(Template::from_segments(segments))
}

struct Reserved<'a> {
    bindings: &'a Bindings,
    next_image: usize,
    image_slots: usize,
}

impl Reserved<'_> {
    fn render(&mut self, template: &Template, ctx: Context) -> Result<String, BuildError> {
        let mut out = String::new();
        for seg in template.segments() {
            match seg {
                Segment::Literal(s) => out.push_str(s),
                Segment::Slot {
                    placeholder,
                    in_string,
                    element,
                    droppable,
                } => {
                    let value = self.value_for(placeholder, *droppable)?;
                    out.push_str(&encode(value, ctx, *in_string, *element));
                }
            }
        }
        Ok(out)
    }

    fn value_for(&mut self, placeholder: &Placeholder, droppable: bool) -> Result<Value, BuildError> {
        let b = self.bindings;
        let missing = || BuildError::MissingBinding {
            placeholder: placeholder.name().to_string(),
        };
        Ok(match placeholder {
            Placeholder::History => Value::History(&b.history),
            Placeholder::Text => Value::Str(b.user_text.clone()),
            Placeholder::SystemPrompt => Value::Str(b.system_prompt.clone().ok_or_else(missing)?),
            Placeholder::Audio => Value::Str(b.audio.clone().ok_or_else(missing)?),
            Placeholder::Image => {
                self.image_slots += 1;
                let idx = self.next_image;
                self.next_image += 1;
                match b.images.get(idx) {
                    Some(img) => Value::Str(img.clone()),
                    None if droppable => Value::Str(UNFILLED_IMAGE.to_string()),
                    None => Value::Str(String::new()),
                }
            }
            // Resolved in the first pass.
            Placeholder::Variable(_) => return Err(missing()),
        })
    }
}

enum Value<'a> {
    Str(String),
    History(&'a [HistoryEntry]),
}

fn history_json(history: &[HistoryEntry]) -> String {
    serde_json::to_string(history).unwrap_or_else(|_| "[]".to_string())
}

/// Encode `value` for its slot. A history slot standing as an array element
/// splices its entries into the surrounding array.
fn encode(value: Value<'_>, ctx: Context, in_string: bool, element: bool) -> String {
    match (ctx, value) {
        (Context::Json, Value::History(h)) if in_string => escape_json(&history_json(h)),
        (Context::Json, Value::History([])) if element => format!("\"{NO_HISTORY}\""),
        (Context::Json, Value::History(h)) if element => {
            let list = history_json(h);
            list[1..list.len() - 1].to_string()
        }
        (Context::Json, Value::History(h)) => history_json(h),
        (Context::Json, Value::Str(s)) if in_string => escape_json(&s),
        (Context::Json, Value::Str(s)) => serde_json::Value::String(s).to_string(),
        (Context::Url, Value::History(h)) => urlencoding::encode(&history_json(h)).into_owned(),
        (Context::Url, Value::Str(s)) => urlencoding::encode(&s).into_owned(),
        (Context::Plain, Value::History(h)) => history_json(h),
        (Context::Plain, Value::Str(s)) => s,
    }
}

fn escape_json(s: &str) -> String {
    let quoted = serde_json::Value::String(s.to_string()).to_string();
    quoted[1..quoted.len() - 1].to_string()
}

fn decode_audio(bindings: &Bindings) -> Result<Vec<u8>, BuildError> {
    let audio = bindings.audio.as_deref().ok_or_else(|| BuildError::MissingBinding {
        placeholder: Placeholder::Audio.name().to_string(),
    })?;
    base64::engine::general_purpose::STANDARD
        .decode(audio.trim())
        .map_err(|e| BuildError::InvalidPayload {
            placeholder: Placeholder::Audio.name().to_string(),
            reason: e.to_string(),
        })
}

/// Drop the array elements left by unfilled image parts and by an empty
/// spliced history, so a text-only turn sent to a vision provider loses its
/// image part instead of carrying an empty one.
fn prune_markers(body: String) -> String {
    if !body.contains(UNFILLED_IMAGE) && !body.contains(NO_HISTORY) {
        return body;
    }
    match serde_json::from_str::<serde_json::Value>(&body) {
        Ok(mut value) => {
            prune(&mut value);
            value.to_string()
        }
        Err(_) => body
            .replace(&format!("\"{NO_HISTORY}\""), "")
            .replace(UNFILLED_IMAGE, ""),
    }
}

/// Only the innermost array holding a marker loses an element; the arrays
/// around it keep theirs.
fn prune(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::Array(items) => {
            items.iter_mut().for_each(prune);
            items.retain(|item| !holds_marker(item));
        }
        serde_json::Value::Object(map) => map.values_mut().for_each(prune),
        _ => {}
    }
}

// Arrays are not searched: their own pass has already run.
fn holds_marker(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::String(s) => s.contains(UNFILLED_IMAGE) || s == NO_HISTORY,
        serde_json::Value::Object(map) => map.values().any(holds_marker),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{compile, Mode};

    fn descriptor(raw: &str) -> ProviderDescriptor {
        compile("test", raw, Mode::Completion).unwrap()
    }

    fn body_text(req: &BoundRequest) -> &str {
        match &req.body {
            BoundBody::Text(s) => s,
            other => panic!("expected text body, got {other:?}"),
        }
    }

    #[test]
    fn history_and_text_in_json_body() {
        let d = descriptor(r#"curl http://h -d '{"messages": {{HISTORY}}, "input": "{{TEXT}}"}'"#);
        let req = build(
            &d,
            &Bindings {
                user_text: "Hi".to_string(),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(body_text(&req), r#"{"messages": [], "input": "Hi"}"#);
        assert_eq!(req.method, "POST");
        assert!(req.warnings.is_empty());
    }

    #[test]
    fn every_placeholder_resolves() {
        let d = descriptor(
            r#"curl 'https://h/{{MODEL}}?q={{TEXT}}' -H 'Authorization: Bearer {{API_KEY}}' \
               -d '{"sys": "{{SYSTEM_PROMPT}}", "h": {{HISTORY}}, "img": "{{IMAGE}}", "a": "{{AUDIO}}", "t": "{{TEXT}}", "n": {{MAX_TOKENS}}}'"#,
        );
        let mut variables = BTreeMap::new();
        variables.insert("MODEL".to_string(), "m1".to_string());
        variables.insert("api_key".to_string(), "sk-1".to_string());
        variables.insert("MAX_TOKENS".to_string(), "256".to_string());
        let bindings = Bindings {
            history: vec![HistoryEntry {
                role: Role::User,
                content: "earlier \"quoted\"".to_string(),
            }],
            user_text: "hello world".to_string(),
            system_prompt: Some("be brief".to_string()),
            images: vec!["aW1n".to_string()],
            audio: Some("YXVk".to_string()),
            variables,
        };
        let req = build(&d, &bindings).unwrap();

        assert_eq!(req.url, "https://h/m1?q=hello%20world");
        assert_eq!(req.headers, vec![("Authorization".to_string(), "Bearer sk-1".to_string())]);
        let body = body_text(&req);
        assert!(!body.contains("{{"));
        let v: serde_json::Value = serde_json::from_str(body).unwrap();
        assert_eq!(v["sys"], "be brief");
        assert_eq!(v["h"][0]["role"], "user");
        assert_eq!(v["h"][0]["content"], "earlier \"quoted\"");
        assert_eq!(v["img"], "aW1n");
        assert_eq!(v["a"], "YXVk");
        assert_eq!(v["n"], 256);
    }

    #[test]
    fn user_text_is_escaped_inside_json_strings() {
        let d = descriptor(r#"curl http://h -d '{"input": "{{TEXT}}"}'"#);
        let req = build(
            &d,
            &Bindings {
                user_text: "line1\n\"two\" {{API_KEY}}".to_string(),
                ..Default::default()
            },
        )
        .unwrap();
        let v: serde_json::Value = serde_json::from_str(body_text(&req)).unwrap();
        assert_eq!(v["input"], "line1\n\"two\" {{API_KEY}}");
    }

    #[test]
    fn missing_audio_is_reported() {
        let d = descriptor(r#"curl http://h -d '{"audio": "{{AUDIO}}"}'"#);
        let err = build(&d, &Bindings::default()).unwrap_err();
        assert_eq!(
            err,
            BuildError::MissingBinding {
                placeholder: "AUDIO".to_string()
            }
        );
    }

    #[test]
    fn missing_variable_is_reported() {
        let d = descriptor("curl http://h -H 'x-api-key: {{API_KEY}}'");
        let err = build(&d, &Bindings::default()).unwrap_err();
        assert_eq!(
            err,
            BuildError::MissingBinding {
                placeholder: "API_KEY".to_string()
            }
        );
    }

    #[test]
    fn extra_images_are_dropped_with_warning() {
        let d = descriptor(r#"curl http://h -d '{"images": ["{{IMAGE}}", "{{IMAGE}}"], "q": "{{TEXT}}"}'"#);
        let bindings = Bindings {
            user_text: "look".to_string(),
            images: (1..=5).map(|i| format!("img{i}")).collect(),
            ..Default::default()
        };
        let req = build(&d, &bindings).unwrap();
        let v: serde_json::Value = serde_json::from_str(body_text(&req)).unwrap();
        assert_eq!(v["images"], serde_json::json!(["img1", "img2"]));
        assert_eq!(req.warnings.len(), 1);
        assert!(req.warnings[0].starts_with("3 attachment(s) not sent"));
    }

    #[test]
    fn unfilled_image_parts_are_pruned() {
        let d = descriptor(
            r#"curl http://h -d '{"content": [{"type": "text", "text": "{{TEXT}}"}, {"type": "image_url", "image_url": {"url": "data:image/png;base64,{{IMAGE}}"}}]}'"#,
        );
        let req = build(
            &d,
            &Bindings {
                user_text: "no picture".to_string(),
                ..Default::default()
            },
        )
        .unwrap();
        let v: serde_json::Value = serde_json::from_str(body_text(&req)).unwrap();
        assert_eq!(
            v["content"],
            serde_json::json!([{"type": "text", "text": "no picture"}])
        );
    }

    #[test]
    fn multipart_audio_is_decoded() {
        let d = compile(
            "stt",
            "curl http://h/stt -F 'file=@{{AUDIO}};type=audio/wav' -F 'model={{MODEL}}'",
            Mode::Transcription,
        )
        .unwrap();
        let mut variables = BTreeMap::new();
        variables.insert("MODEL".to_string(), "whisper-1".to_string());
        let req = build(
            &d,
            &Bindings {
                audio: Some("aGVsbG8=".to_string()),
                variables: variables.clone(),
                ..Default::default()
            },
        )
        .unwrap();
        let BoundBody::Multipart(parts) = &req.body else {
            panic!("expected multipart");
        };
        assert_eq!(
            parts[0],
            BoundPart::File {
                name: "file".to_string(),
                file_name: "audio.wav".to_string(),
                mime_type: Some("audio/wav".to_string()),
                bytes: b"hello".to_vec(),
            }
        );
        assert_eq!(
            parts[1],
            BoundPart::Text {
                name: "model".to_string(),
                value: "whisper-1".to_string()
            }
        );

        let err = build(
            &d,
            &Bindings {
                audio: Some("not base64!".to_string()),
                variables,
                ..Default::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, BuildError::InvalidPayload { .. }));
    }

    const VISION_CHAT: &str = r#"curl https://api.openai.com/v1/chat/completions -H "Content-Type: application/json" -H "Authorization: Bearer {{API_KEY}}" -d '{"model": "{{MODEL}}", "stream": true, "messages": [{"role": "system", "content": "{{SYSTEM_PROMPT}}"}, {{HISTORY}}, {"role": "user", "content": [{"type": "text", "text": "{{TEXT}}"}, {"type": "image_url", "image_url": {"url": "data:image/png;base64,{{IMAGE}}"}}]}]}'"#;

    fn vision_messages(history: Vec<HistoryEntry>, images: Vec<String>) -> Vec<serde_json::Value> {
        let mut variables = BTreeMap::new();
        variables.insert("API_KEY".to_string(), "sk".to_string());
        variables.insert("MODEL".to_string(), "m".to_string());
        let bindings = Bindings {
            history,
            user_text: "hello".to_string(),
            system_prompt: Some("sys".to_string()),
            images,
            variables,
            ..Default::default()
        };
        let req = build(&descriptor(VISION_CHAT), &bindings).unwrap();
        let v: serde_json::Value = serde_json::from_str(body_text(&req)).unwrap();
        assert_eq!(v["model"], "m");
        assert_eq!(v["stream"], true);
        match &v["messages"] {
            serde_json::Value::Array(items) => items.clone(),
            other => panic!("expected a messages array, got {other}"),
        }
    }

    fn turn(role: Role, content: &str) -> HistoryEntry {
        HistoryEntry {
            role,
            content: content.to_string(),
        }
    }

    #[test]
    fn text_only_turn_keeps_the_user_message() {
        let messages = vision_messages(vec![turn(Role::User, "earlier")], Vec::new());
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0], serde_json::json!({"role": "system", "content": "sys"}));
        assert_eq!(messages[1], serde_json::json!({"role": "user", "content": "earlier"}));
        assert_eq!(
            messages[2],
            serde_json::json!({"role": "user", "content": [{"type": "text", "text": "hello"}]})
        );
    }

    #[test]
    fn empty_history_leaves_no_hole_in_the_messages() {
        let messages = vision_messages(Vec::new(), Vec::new());
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0], serde_json::json!({"role": "system", "content": "sys"}));
        assert_eq!(
            messages[1],
            serde_json::json!({"role": "user", "content": [{"type": "text", "text": "hello"}]})
        );
    }

    #[test]
    fn history_entries_splice_into_the_messages() {
        let history = vec![turn(Role::User, "q1"), turn(Role::Assistant, "a1")];
        let messages = vision_messages(history, vec!["aW1n".to_string()]);
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0], serde_json::json!({"role": "system", "content": "sys"}));
        assert_eq!(messages[1], serde_json::json!({"role": "user", "content": "q1"}));
        assert_eq!(messages[2], serde_json::json!({"role": "assistant", "content": "a1"}));
        assert_eq!(
            messages[3],
            serde_json::json!({"role": "user", "content": [
                {"type": "text", "text": "hello"},
                {"type": "image_url", "image_url": {"url": "data:image/png;base64,aW1n"}}
            ]})
        );
    }

    #[test]
    fn image_turn_without_history() {
        let messages = vision_messages(Vec::new(), vec!["aW1n".to_string()]);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0], serde_json::json!({"role": "system", "content": "sys"}));
        assert_eq!(
            messages[1],
            serde_json::json!({"role": "user", "content": [
                {"type": "text", "text": "hello"},
                {"type": "image_url", "image_url": {"url": "data:image/png;base64,aW1n"}}
            ]})
        );
    }

    #[test]
    fn spliced_history_is_sent_verbatim_when_nothing_is_pruned() {
        let d = descriptor(r#"curl http://h -d '{"messages": [{{HISTORY}}, {"role": "user", "content": "{{TEXT}}"}]}'"#);
        let bindings = Bindings {
            history: vec![turn(Role::Assistant, "a1")],
            user_text: "hi".to_string(),
            ..Default::default()
        };
        let req = build(&d, &bindings).unwrap();
        assert_eq!(
            body_text(&req),
            r#"{"messages": [{"role":"assistant","content":"a1"}, {"role": "user", "content": "hi"}]}"#
        );

        let trailing = descriptor(r#"curl http://h -d '{"messages": [{"role": "user", "content": "{{TEXT}}"}, {{HISTORY}}]}'"#);
        let req = build(&trailing, &Bindings::default()).unwrap();
        let v: serde_json::Value = serde_json::from_str(body_text(&req)).unwrap();
        assert_eq!(v["messages"], serde_json::json!([{"role": "user", "content": ""}]));
    }

    #[test]
    fn image_sharing_an_element_with_text_is_blanked_not_dropped() {
        let d = descriptor(
            r#"curl http://h -d '{"messages": [{"role": "user", "content": "{{TEXT}}", "images": "{{IMAGE}}"}], "nested": {"data": "{{IMAGE}}"}}'"#,
        );
        let req = build(
            &d,
            &Bindings {
                user_text: "hi".to_string(),
                ..Default::default()
            },
        )
        .unwrap();
        let v: serde_json::Value = serde_json::from_str(body_text(&req)).unwrap();
        assert_eq!(
            v["messages"],
            serde_json::json!([{"role": "user", "content": "hi", "images": ""}])
        );
        assert_eq!(v["nested"]["data"], "");
    }
}
