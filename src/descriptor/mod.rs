//! Provider descriptors: a curl command line compiled once into a reusable,
//! immutable request shape with typed placeholder slots.

pub mod curl;
mod template;

pub use template::{Placeholder, Segment, Template};

use crate::error::CompileError;
use reqwest::Url;
use std::collections::BTreeSet;

/// What a descriptor is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Completion,
    Transcription,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormField {
    Text {
        name: String,
        value: Template,
    },
    /// A file part carrying the audio payload.
    Audio {
        name: String,
        file_name: String,
        mime_type: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyTemplate {
    None,
    Json(Template),
    Raw(Template),
    Form(Vec<FormField>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderDescriptor {
    pub id: String,
    pub mode: Mode,
    pub method: String,
    pub url: Template,
    pub headers: Vec<(String, Template)>,
    pub body: BodyTemplate,
    pub placeholders: BTreeSet<Placeholder>,

    /// Path to the reply text inside each response JSON object.
    pub content_path: Option<String>,
}

impl ProviderDescriptor {
    pub fn with_content_path(mut self, path: Option<String>) -> Self {
        self.content_path = path.filter(|p| !p.trim().is_empty());
        self
    }

    /// Free-form variables the user must supply, e.g. `API_KEY`.
    pub fn variables(&self) -> impl Iterator<Item = &str> {
        self.placeholders
            .iter()
            .filter(|p| p.is_variable())
            .map(Placeholder::name)
    }

    pub fn references(&self, p: &Placeholder) -> bool {
        self.placeholders.contains(p)
    }
}

/// Whether the body has a slot for image payloads.
pub fn supports_images(descriptor: &ProviderDescriptor) -> bool {
    match &descriptor.body {
        BodyTemplate::Json(t) | BodyTemplate::Raw(t) => t.contains(&Placeholder::Image),
        BodyTemplate::Form(fields) => fields.iter().any(|f| match f {
            FormField::Text { value, .. } => value.contains(&Placeholder::Image),
            FormField::Audio { .. } => false,
        }),
        BodyTemplate::None => false,
    }
}

/// Rewrite `{{IMAGE}}` and `{{AUDIO_BASE64}}` to `{{AUDIO}}`, padded
/// spellings such as `{{ IMAGE }}` included.
fn audio_tokens(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(open) = rest.find("{{") {
        let after_open = &rest[open + 2..];
        match after_open.find("}}") {
            Some(close) if matches!(after_open[..close].trim(), "IMAGE" | "AUDIO_BASE64") => {
                out.push_str(&rest[..open]);
                out.push_str("{{AUDIO}}");
                rest = &after_open[close + 2..];
            }
            _ => {
                out.push_str(&rest[..=open]);
                rest = &rest[open + 1..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// Compile a curl command line into a descriptor.
///
/// In transcription mode the image token (and the legacy `AUDIO_BASE64`
/// token) is rewritten to the audio token first, so one description can
/// serve both roles.
pub fn compile(id: &str, raw: &str, mode: Mode) -> Result<ProviderDescriptor, CompileError> {
    let source = match mode {
        Mode::Completion => raw.to_string(),
        Mode::Transcription => audio_tokens(raw),
    };

    let cmd = curl::parse(&source)?;

    let raw_url = cmd
        .url
        .clone()
        .ok_or_else(|| CompileError::Malformed("missing URL".to_string()))?;
    let url = Template::parse(&raw_url, false)?;
    let sample = url.render_with("placeholder");
    let parsed = Url::parse(&sample)
        .map_err(|e| CompileError::Malformed(format!("invalid URL {raw_url:?}: {e}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(CompileError::Malformed(format!(
            "unsupported URL scheme: {}",
            parsed.scheme()
        )));
    }

    let has_body = !cmd.data.is_empty() || !cmd.form.is_empty();
    let method = match &cmd.method {
        Some(m) => m.trim().to_ascii_uppercase(),
        None if has_body => "POST".to_string(),
        None => "GET".to_string(),
    };
    if method.is_empty() || !method.bytes().all(curl::is_token_byte) {
        return Err(CompileError::Malformed(format!("invalid method: {method:?}")));
    }

    let mut headers = Vec::with_capacity(cmd.headers.len());
    for (name, value) in &cmd.headers {
        headers.push((name.clone(), Template::parse(value, false)?));
    }

    let body = if !cmd.form.is_empty() {
        if !cmd.data.is_empty() {
            return Err(CompileError::Malformed(
                "cannot combine --form with --data".to_string(),
            ));
        }
        BodyTemplate::Form(
            cmd.form
                .iter()
                .map(String::as_str)
                .map(parse_form_field)
                .collect::<Result<_, _>>()?,
        )
    } else if !cmd.data.is_empty() {
        let joined = cmd.data.join("&");
        let json = cmd.json
            || cmd
                .header("content-type")
                .is_some_and(|ct| ct.to_ascii_lowercase().contains("json"))
            || matches!(joined.trim_start().chars().next(), Some('{' | '['));
        if json {
            BodyTemplate::Json(Template::parse(&joined, true)?)
        } else {
            BodyTemplate::Raw(Template::parse(&joined, false)?)
        }
    } else {
        BodyTemplate::None
    };

    let mut placeholders = BTreeSet::new();
    placeholders.extend(url.placeholders().cloned());
    for (_, value) in &headers {
        placeholders.extend(value.placeholders().cloned());
    }
    match &body {
        BodyTemplate::Json(t) | BodyTemplate::Raw(t) => placeholders.extend(t.placeholders().cloned()),
        BodyTemplate::Form(fields) => {
            for f in fields {
                match f {
                    FormField::Text { value, .. } => placeholders.extend(value.placeholders().cloned()),
                    FormField::Audio { .. } => {
                        placeholders.insert(Placeholder::Audio);
                    }
                }
            }
        }
        BodyTemplate::None => {}
    }

    tracing::debug!(id, %method, placeholders = placeholders.len(), "compiled provider descriptor");

    Ok(ProviderDescriptor {
        id: id.to_string(),
        mode,
        method,
        url,
        headers,
        body,
        placeholders,
        content_path: None,
    })
}

fn parse_form_field(raw: &str) -> Result<FormField, CompileError> {
    let Some((name, value)) = raw.split_once('=') else {
        return Err(CompileError::Malformed(format!("form field without `=`: {raw}")));
    };
    let name = name.trim().to_string();
    if name.is_empty() {
        return Err(CompileError::Malformed(format!("form field without name: {raw}")));
    }

    let Some(file_spec) = value.strip_prefix('@') else {
        if value.trim() == "{{AUDIO}}" {
            return Ok(FormField::Audio {
                name,
                file_name: "audio.wav".to_string(),
                mime_type: None,
            });
        }
        return Ok(FormField::Text {
            name,
            value: Template::parse(value, false)?,
        });
    };

    let mut parts = file_spec.split(';');
    let target = parts.next().unwrap_or_default().trim();
    if target != "{{AUDIO}}" {
        return Err(CompileError::Malformed(format!(
            "file upload `{target}` is not supported; use @{{{{AUDIO}}}}"
        )));
    }

    let mut file_name = "audio.wav".to_string();
    let mut mime_type = None;
    for attr in parts {
        match attr.trim().split_once('=') {
            Some(("type", v)) => mime_type = Some(v.trim().to_string()),
            Some(("filename", v)) => file_name = v.trim().trim_matches('"').to_string(),
            _ => {}
        }
    }
    Ok(FormField::Audio {
        name,
        file_name,
        mime_type,
    })
}
