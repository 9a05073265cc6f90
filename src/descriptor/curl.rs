//! curl command-line parsing: shell word splitting plus the curl options that
//! shape an HTTP request.

use crate::error::CompileError;
use base64::Engine;

/// The request-shaping parts of a curl invocation, placeholders untouched.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CurlCommand {
    pub method: Option<String>,
    pub url: Option<String>,
    pub headers: Vec<(String, String)>,
    pub data: Vec<String>,
    pub form: Vec<String>,
    pub json: bool,
}

impl CurlCommand {
    pub fn has_header(&self, name: &str) -> bool {
        self.headers.iter().any(|(k, _)| k.eq_ignore_ascii_case(name))
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

// Options whose value we do not need but must skip over.
const LONG_WITH_VALUE: &[&str] = &[
    "output",
    "user-agent",
    "max-time",
    "connect-timeout",
    "cookie",
    "cookie-jar",
    "referer",
    "proxy",
    "cert",
    "key",
    "cacert",
    "config",
    "write-out",
    "retry",
    "limit-rate",
    "resolve",
    "upload-file",
];
const SHORT_WITH_VALUE: &[char] = &['o', 'A', 'm', 'b', 'c', 'e', 'x', 'E', 'K', 'w', 'T'];

pub fn parse(input: &str) -> Result<CurlCommand, CompileError> {
    let words = split_words(input)?;
    let mut iter = words.into_iter().peekable();
    if iter.peek().map(String::as_str) == Some("curl") {
        iter.next();
    }

    let mut cmd = CurlCommand::default();
    let mut user: Option<String> = None;
    let mut positional_only = false;

    while let Some(word) = iter.next() {
        if positional_only || word == "-" || !word.starts_with('-') {
            set_url(&mut cmd, word)?;
            continue;
        }
        if word == "--" {
            positional_only = true;
            continue;
        }

        if let Some(long) = word.strip_prefix("--") {
            let mut value = || {
                iter.next()
                    .ok_or_else(|| CompileError::Malformed(format!("option --{long} needs a value")))
            };
            match long {
                "request" => cmd.method = Some(value()?),
                "header" => cmd.headers.push(parse_header(&value()?)?),
                "data" | "data-raw" | "data-binary" | "data-ascii" | "data-urlencode" => {
                    cmd.data.push(value()?)
                }
                "json" => {
                    cmd.data.push(value()?);
                    cmd.json = true;
                }
                "form" | "form-string" => cmd.form.push(value()?),
                "user" => user = Some(value()?),
                "url" => {
                    let url = value()?;
                    set_url(&mut cmd, url)?;
                }
                other if LONG_WITH_VALUE.contains(&other) => {
                    value()?;
                }
                other => tracing::debug!(option = other, "ignoring curl flag"),
            }
            continue;
        }

        let mut chars = word.chars().skip(1);
        let Some(flag) = chars.next() else { continue };
        let attached: String = chars.collect();
        let takes_value = matches!(flag, 'X' | 'H' | 'd' | 'F' | 'u') || SHORT_WITH_VALUE.contains(&flag);
        if !takes_value {
            // Bundled boolean flags such as `-sSL`.
            continue;
        }

        let value = if attached.is_empty() {
            iter.next()
                .ok_or_else(|| CompileError::Malformed(format!("option -{flag} needs a value")))?
        } else {
            attached
        };
        match flag {
            'X' => cmd.method = Some(value),
            'H' => cmd.headers.push(parse_header(&value)?),
            'd' => cmd.data.push(value),
            'F' => cmd.form.push(value),
            'u' => user = Some(value),
            _ => {}
        }
    }

    if let Some(user) = user {
        if !cmd.has_header("authorization") {
            let encoded = base64::engine::general_purpose::STANDARD.encode(user.as_bytes());
            cmd.headers
                .push(("Authorization".to_string(), format!("Basic {encoded}")));
        }
    }

    if cmd.json {
        if !cmd.has_header("content-type") {
            cmd.headers
                .push(("Content-Type".to_string(), "application/json".to_string()));
        }
        if !cmd.has_header("accept") {
            cmd.headers
                .push(("Accept".to_string(), "application/json".to_string()));
        }
    }

    Ok(cmd)
}

fn set_url(cmd: &mut CurlCommand, url: String) -> Result<(), CompileError> {
    if cmd.url.is_some() {
        return Err(CompileError::Malformed(format!(
            "more than one URL (unexpected `{url}`)"
        )));
    }
    cmd.url = Some(url);
    Ok(())
}

fn parse_header(raw: &str) -> Result<(String, String), CompileError> {
    let Some((name, value)) = raw.split_once(':') else {
        return Err(CompileError::Malformed(format!("header without `:`: {raw}")));
    };
    let name = name.trim();
    if name.is_empty() || !name.bytes().all(is_token_byte) {
        return Err(CompileError::Malformed(format!("invalid header name: {name:?}")));
    }
    Ok((name.to_string(), value.trim().to_string()))
}

pub(crate) fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

/// Split a command line into words following POSIX shell quoting.
pub fn split_words(input: &str) -> Result<Vec<String>, CompileError> {
    let mut words = Vec::new();
    let mut cur = String::new();
    let mut in_word = false;
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut cur));
                    in_word = false;
                }
            }
            '\\' => match chars.next() {
                Some('\n') => {}
                Some('\r') => {
                    if chars.peek() == Some(&'\n') {
                        chars.next();
                    }
                }
                Some(n) => {
                    cur.push(n);
                    in_word = true;
                }
                None => return Err(CompileError::Malformed("trailing backslash".to_string())),
            },
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(ch) => cur.push(ch),
                        None => {
                            return Err(CompileError::Malformed(
                                "unterminated single quote".to_string(),
                            ))
                        }
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.peek().copied() {
                            Some(n @ ('"' | '\\' | '$' | '`')) => {
                                cur.push(n);
                                chars.next();
                            }
                            Some('\n') => {
                                chars.next();
                            }
                            _ => cur.push('\\'),
                        },
                        Some(ch) => cur.push(ch),
                        None => {
                            return Err(CompileError::Malformed(
                                "unterminated double quote".to_string(),
                            ))
                        }
                    }
                }
            }
            '$' if chars.peek() == Some(&'\'') => {
                chars.next();
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some('\\') => match chars.next() {
                            Some('n') => cur.push('\n'),
                            Some('t') => cur.push('\t'),
                            Some('r') => cur.push('\r'),
                            Some(n @ ('\\' | '\'' | '"')) => cur.push(n),
                            Some(n) => {
                                cur.push('\\');
                                cur.push(n);
                            }
                            None => break,
                        },
                        Some(ch) => cur.push(ch),
                        None => {
                            return Err(CompileError::Malformed(
                                "unterminated $'...' quote".to_string(),
                            ))
                        }
                    }
                }
            }
            other => {
                cur.push(other);
                in_word = true;
            }
        }
    }

    if in_word {
        words.push(cur);
    }
    Ok(words)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_quotes_and_continuations() {
        let words = split_words("curl -H 'A: b c' \\\n  -d \"x \\\"y\\\"\" $'l1\\nl2'").unwrap();
        assert_eq!(
            words,
            vec!["curl", "-H", "A: b c", "-d", "x \"y\"", "l1\nl2"]
        );
    }

    #[test]
    fn unterminated_quote_is_malformed() {
        assert!(matches!(
            split_words("curl 'oops"),
            Err(CompileError::Malformed(_))
        ));
    }

    #[test]
    fn parses_openai_style_command() {
        let cmd = parse(
            r#"curl https://api.openai.com/v1/chat/completions \
              -H "Content-Type: application/json" \
              -H "Authorization: Bearer {{API_KEY}}" \
              -d '{"model": "{{MODEL}}", "stream": true}'"#,
        )
        .unwrap();
        assert_eq!(cmd.url.as_deref(), Some("https://api.openai.com/v1/chat/completions"));
        assert_eq!(cmd.method, None);
        assert_eq!(cmd.header("authorization"), Some("Bearer {{API_KEY}}"));
        assert_eq!(cmd.data, vec![r#"{"model": "{{MODEL}}", "stream": true}"#]);
    }

    #[test]
    fn attached_short_values_and_bundled_flags() {
        let cmd = parse("curl -sSL -XPUT -HAccept:text/plain --url http://h/x").unwrap();
        assert_eq!(cmd.method.as_deref(), Some("PUT"));
        assert_eq!(cmd.header("accept"), Some("text/plain"));
        assert_eq!(cmd.url.as_deref(), Some("http://h/x"));
    }

    #[test]
    fn json_option_adds_default_headers() {
        let cmd = parse("curl --json '{}' http://h").unwrap();
        assert!(cmd.json);
        assert_eq!(cmd.header("content-type"), Some("application/json"));
        assert_eq!(cmd.header("accept"), Some("application/json"));
    }

    #[test]
    fn user_becomes_basic_auth() {
        let cmd = parse("curl -u me:secret http://h").unwrap();
        assert_eq!(cmd.header("authorization"), Some("Basic bWU6c2VjcmV0"));
    }

    #[test]
    fn skips_values_of_ignored_options() {
        let cmd = parse("curl -o out.json --max-time 30 http://h").unwrap();
        assert_eq!(cmd.url.as_deref(), Some("http://h"));
    }

    #[test]
    fn rejects_second_url_and_bad_header() {
        assert!(parse("curl http://a http://b").is_err());
        assert!(parse("curl -H 'NoColon' http://a").is_err());
        assert!(parse("curl http://a -H").is_err());
    }
}
