use crate::error::CompileError;
use std::fmt;

/// A named substitution point.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Placeholder {
    History,
    Text,
    SystemPrompt,
    Image,
    Audio,
    Variable(String),
}

impl Placeholder {
    /// Classify the text between `{{` and `}}`.
    pub fn from_name(name: &str) -> Result<Self, CompileError> {
        if !is_identifier(name) {
            return Err(CompileError::UnknownPlaceholder {
                name: name.to_string(),
            });
        }
        Ok(match name {
            "HISTORY" => Placeholder::History,
            "TEXT" => Placeholder::Text,
            "SYSTEM_PROMPT" => Placeholder::SystemPrompt,
            "IMAGE" => Placeholder::Image,
            "AUDIO" => Placeholder::Audio,
            other => Placeholder::Variable(other.to_string()),
        })
    }

    pub fn name(&self) -> &str {
        match self {
            Placeholder::History => "HISTORY",
            Placeholder::Text => "TEXT",
            Placeholder::SystemPrompt => "SYSTEM_PROMPT",
            Placeholder::Image => "IMAGE",
            Placeholder::Audio => "AUDIO",
            Placeholder::Variable(name) => name,
        }
    }

    pub fn is_variable(&self) -> bool {
        matches!(self, Placeholder::Variable(_))
    }
}

impl fmt::Display for Placeholder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{{{}}}}}", self.name())
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    Slot {
        placeholder: Placeholder,
        /// The slot sits inside a JSON string literal.
        in_string: bool,
        /// A bare JSON array element; list values splice into the array.
        element: bool,
        /// The enclosing JSON array element holds image slots only, so it
        /// can be dropped when no image is bound.
        droppable: bool,
    },
}

/// Slots seen in the current element of an open JSON array.
struct Element {
    slots: Vec<usize>,
    only_images: bool,
}

impl Element {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            only_images: true,
        }
    }
}

enum Frame {
    Object,
    Array(Element),
}

fn close_element(segments: &mut [Segment], element: Element) {
    if !element.only_images {
        return;
    }
    for i in element.slots {
        if let Some(Segment::Slot { droppable, .. }) = segments.get_mut(i) {
            *droppable = true;
        }
    }
}

/// Text split into literals and placeholder slots.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Template {
    segments: Vec<Segment>,
}

impl Template {
    /// Split `src` on `{{NAME}}` tokens.
    ///
    /// With `json` set, the scanner tracks JSON strings, objects, and arrays
    /// so each slot knows how its value must be encoded.
    pub fn parse(src: &str, json: bool) -> Result<Self, CompileError> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut in_string = false;
        let mut escaped = false;
        let mut frames: Vec<Frame> = Vec::new();
        let mut last_token: Option<char> = None;
        let mut rest = src;

        while !rest.is_empty() {
            // `{{{TEXT}}}` keeps the outer brace as literal text.
            if let Some(after_open) = rest.strip_prefix("{{").filter(|a| !a.starts_with('{')) {
                if let Some(close) = after_open.find("}}") {
                    let name = after_open[..close].trim();
                    let placeholder = Placeholder::from_name(name)?;
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }

                    let is_image = placeholder == Placeholder::Image;
                    let element = json
                        && !in_string
                        && matches!(last_token, Some('[' | ','))
                        && matches!(frames.last(), Some(Frame::Array(_)));
                    let index = segments.len();
                    segments.push(Segment::Slot {
                        placeholder,
                        in_string: json && in_string,
                        element,
                        droppable: false,
                    });

                    if json {
                        for frame in frames.iter_mut() {
                            if let Frame::Array(e) = frame {
                                e.only_images &= is_image;
                            }
                        }
                        let innermost = frames.iter_mut().rev().find_map(|f| match f {
                            Frame::Array(e) => Some(e),
                            Frame::Object => None,
                        });
                        if let Some(e) = innermost {
                            e.slots.push(index);
                        }
                        if !in_string {
                            last_token = Some('"');
                        }
                    }
                    rest = &after_open[close + 2..];
                    continue;
                }
            }

            let Some(c) = rest.chars().next() else { break };
            if json {
                if in_string {
                    if escaped {
                        escaped = false;
                    } else if c == '\\' {
                        escaped = true;
                    } else if c == '"' {
                        in_string = false;
                    }
                } else {
                    match c {
                        '"' => in_string = true,
                        '{' => frames.push(Frame::Object),
                        '[' => frames.push(Frame::Array(Element::new())),
                        '}' => {
                            if matches!(frames.last(), Some(Frame::Object)) {
                                frames.pop();
                            }
                        }
                        ']' => {
                            if matches!(frames.last(), Some(Frame::Array(_))) {
                                if let Some(Frame::Array(e)) = frames.pop() {
                                    close_element(&mut segments, e);
                                }
                            }
                        }
                        ',' => {
                            if let Some(Frame::Array(e)) = frames.last_mut() {
                                let done = std::mem::replace(e, Element::new());
                                close_element(&mut segments, done);
                            }
                        }
                        _ => {}
                    }
                    if !c.is_whitespace() {
                        last_token = Some(c);
                    }
                }
            }
            literal.push(c);
            rest = &rest[c.len_utf8()..];
        }

        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }
        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn placeholders(&self) -> impl Iterator<Item = &Placeholder> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Slot { placeholder, .. } => Some(placeholder),
            Segment::Literal(_) => None,
        })
    }

    pub fn contains(&self, p: &Placeholder) -> bool {
        self.placeholders().any(|x| x == p)
    }

    /// Render with every slot replaced by `filler`.
    pub fn render_with(&self, filler: &str) -> String {
        let mut out = String::new();
        for seg in &self.segments {
            match seg {
                Segment::Literal(s) => out.push_str(s),
                Segment::Slot { .. } => out.push_str(filler),
            }
        }
        out
    }

    pub(crate) fn from_segments(segments: Vec<Segment>) -> Self {
        Self { segments }
    }
}
