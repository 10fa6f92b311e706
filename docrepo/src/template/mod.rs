// Template engine for the built-in `template` virtual formatter.
// Placeholders are `{field}`, `{parent.child}` or `{field:format}`.

use chrono::{DateTime, NaiveDate};
use serde_json::{Map, Value};

use crate::error::{RepoError, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    pub raw: String,
    pub segments: Vec<Segment>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Literal(String),
    Field { path: String, format: Option<String> },
}

impl Template {
    pub fn parse(template: &str) -> Result<Self> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = template.chars();

        while let Some(c) = chars.next() {
            if c != '{' {
                literal.push(c);
                continue;
            }

            let mut inner = String::new();
            let mut closed = false;
            for c in chars.by_ref() {
                if c == '}' {
                    closed = true;
                    break;
                }
                inner.push(c);
            }
            if !closed {
                return Err(RepoError::Other(format!(
                    "Unclosed placeholder in template '{template}'"
                )));
            }

            if !literal.is_empty() {
                segments.push(Segment::Literal(std::mem::take(&mut literal)));
            }
            let (path, format) = match inner.split_once(':') {
                Some((path, format)) => (path.trim(), Some(format.trim().to_string())),
                None => (inner.trim(), None),
            };
            if path.is_empty() {
                return Err(RepoError::Other(format!(
                    "Empty placeholder in template '{template}'"
                )));
            }
            segments.push(Segment::Field {
                path: path.to_string(),
                format,
            });
        }

        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Template {
            raw: template.to_string(),
            segments,
        })
    }

    /// Render against a document. Missing fields render as empty strings.
    pub fn render(&self, doc: &Map<String, Value>) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Field { path, format } => {
                    let text = lookup(doc, path).map(value_text).unwrap_or_default();
                    match format {
                        Some(format) => out.push_str(&apply_format(&text, format)),
                        None => out.push_str(&text),
                    }
                }
            }
        }
        out
    }
}

/// Resolve a dotted path inside a document
pub fn lookup<'a>(doc: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = doc.get(parts.next()?)?;
    for part in parts {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Plain-text rendering of a JSON value
pub fn value_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// Slugify a string for identifiers and URLs
pub fn slugify(input: &str) -> String {
    slug::slugify(input)
}

fn apply_format(text: &str, format: &str) -> String {
    match format {
        "slug" => slugify(text),
        "upper" => text.to_uppercase(),
        "lower" => text.to_lowercase(),
        pattern => format_date(text, pattern).unwrap_or_else(|| text.to_string()),
    }
}

fn format_date(text: &str, pattern: &str) -> Option<String> {
    let strftime = pattern
        .replace("YYYY", "%Y")
        .replace("MM", "%m")
        .replace("DD", "%d")
        .replace("HH", "%H")
        .replace("mm", "%M")
        .replace("ss", "%S");

    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.format(&strftime).to_string());
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .map(|d| d.format(&strftime).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_parse_segments() {
        let t = Template::parse("{firstName} {lastName:upper}!").unwrap();
        assert_eq!(
            t.segments,
            vec![
                Segment::Field { path: "firstName".into(), format: None },
                Segment::Literal(" ".into()),
                Segment::Field { path: "lastName".into(), format: Some("upper".into()) },
                Segment::Literal("!".into()),
            ]
        );
    }

    #[test]
    fn test_render_nested_and_missing() {
        let t = Template::parse("{name.first}/{missing}/{count}").unwrap();
        let d = doc(json!({ "name": { "first": "Ada" }, "count": 3 }));
        assert_eq!(t.render(&d), "Ada//3");
    }

    #[test]
    fn test_render_formats() {
        let t = Template::parse("{date:YYYY-MM-DD}-{title:slug}").unwrap();
        let d = doc(json!({ "date": "2026-03-04T10:00:00Z", "title": "Hello World" }));
        assert_eq!(t.render(&d), "2026-03-04-hello-world");
    }

    #[test]
    fn test_unclosed_placeholder() {
        assert!(Template::parse("{oops").is_err());
    }
}
