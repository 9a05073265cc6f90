//! Pulling reply text out of provider JSON objects.

use crate::error::TransportError;
use serde_json::Value;

// Shapes of the common provider APIs, tried in order when no path is configured.
const KNOWN_PATHS: &[&str] = &[
    "choices[0].delta.content",
    "choices[0].message.content",
    "choices[0].text",
    "delta.text",
    "content[*].text",
    "candidates[0].content.parts[*].text",
    "message.content",
    "response",
    "text",
];

#[derive(Debug, Clone, PartialEq, Eq)]
enum Step {
    Key(String),
    Index(usize),
    All,
}

#[derive(Debug, Clone)]
pub struct Extractor {
    paths: Vec<Vec<Step>>,
}

impl Extractor {
    /// `content_path` uses dots and brackets: `choices[0].delta.content`,
    /// `choices.0.delta.content`, `content[*].text`.
    pub fn new(content_path: Option<&str>) -> Self {
        let paths = match content_path {
            Some(p) => vec![parse_path(p)],
            None => KNOWN_PATHS.iter().map(|p| parse_path(p)).collect(),
        };
        Self { paths }
    }

    /// Text carried by one response object.
    ///
    /// `Ok(None)` for objects without text (role headers, usage frames).
    /// Objects carrying an `error` member become a provider error.
    pub fn text(&self, value: &Value) -> Result<Option<String>, TransportError> {
        if let Some(err) = value.get("error").filter(|e| !e.is_null()) {
            return Err(TransportError::Provider(error_message(err)));
        }

        for path in &self.paths {
            let mut found = Vec::new();
            collect(value, path, &mut found);
            let text: String = found.iter().filter_map(|v| v.as_str()).collect();
            if !text.is_empty() {
                return Ok(Some(text));
            }
        }
        Ok(None)
    }
}

impl Default for Extractor {
    fn default() -> Self {
        Self::new(None)
    }
}

fn error_message(err: &Value) -> String {
    match err {
        Value::String(s) => s.clone(),
        other => other
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| other.to_string()),
    }
}

fn parse_path(path: &str) -> Vec<Step> {
    let mut steps = Vec::new();
    for part in path.split('.').map(str::trim).filter(|p| !p.is_empty()) {
        let (key, mut rest) = match part.find('[') {
            Some(i) => (&part[..i], &part[i..]),
            None => (part, ""),
        };
        if !key.is_empty() {
            steps.push(match key.parse::<usize>() {
                Ok(i) => Step::Index(i),
                Err(_) => Step::Key(key.to_string()),
            });
        }
        while let Some(inner) = rest.strip_prefix('[') {
            let Some(end) = inner.find(']') else { break };
            let idx = inner[..end].trim();
            steps.push(match idx {
                "*" => Step::All,
                n => match n.parse::<usize>() {
                    Ok(i) => Step::Index(i),
                    Err(_) => Step::Key(n.trim_matches(|c| c == '"' || c == '\'').to_string()),
                },
            });
            rest = &inner[end + 1..];
        }
    }
    steps
}

fn collect<'a>(value: &'a Value, steps: &[Step], out: &mut Vec<&'a Value>) {
    let Some((step, rest)) = steps.split_first() else {
        out.push(value);
        return;
    };
    match (step, value) {
        (Step::Key(k), Value::Object(map)) => {
            if let Some(v) = map.get(k) {
                collect(v, rest, out);
            }
        }
        (Step::Index(i), Value::Array(items)) => {
            if let Some(v) = items.get(*i) {
                collect(v, rest, out);
            }
        }
        // `choices.0` on an object keyed "0".
        (Step::Index(i), Value::Object(map)) => {
            if let Some(v) = map.get(&i.to_string()) {
                collect(v, rest, out);
            }
        }
        (Step::All, Value::Array(items)) => {
            for v in items {
                collect(v, rest, out);
            }
        }
        _ => {}
    }
}
