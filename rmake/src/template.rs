//! Command-line templates with `{{.Field}}` placeholders.
//!
//! Supported placeholders: `{{.Filename}}`, `{{.Type}}` and
//! `{{.Option.<key>}}`. Templates are parsed once when a recipe is loaded.

use crate::Result;
use crate::conn::Request;
use crate::error::Error;

/// One parsed piece of a template.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    /// Text copied as is.
    Literal(String),
    /// `{{.Filename}}`
    Filename,
    /// `{{.Type}}`
    Type,
    /// `{{.Option.<key>}}`
    Option(String),
}

/// A parsed command template.
#[derive(Debug, Clone)]
pub struct CommandTemplate {
    /// Original template text.
    source: String,
    /// Parsed pieces, in order.
    segments: Vec<Segment>,
}

impl CommandTemplate {
    /// Parses a template, rejecting unknown or unterminated placeholders.
    pub fn parse(source: &str) -> Result<Self> {
        let mut segments = Vec::new();
        let mut rest = source;

        while let Some(start) = rest.find("{{") {
            if start > 0 {
                segments.push(Segment::Literal(rest[..start].to_owned()));
            }
            let action = &rest[start + 2..];
            let Some(end) = action.find("}}") else {
                return Err(Error::Template(format!("unterminated `{{{{` in {source:?}")));
            };
            segments.push(Self::placeholder(action[..end].trim(), source)?);
            rest = &action[end + 2..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_owned()));
        }

        Ok(Self {
            source: source.to_owned(),
            segments,
        })
    }

    /// Parses the inside of one `{{ }}` action.
    fn placeholder(expr: &str, source: &str) -> Result<Segment> {
        match expr {
            ".Filename" => Ok(Segment::Filename),
            ".Type" => Ok(Segment::Type),
            _ => match expr.strip_prefix(".Option.") {
                Some(key)
                    if !key.is_empty()
                        && key
                            .chars()
                            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') =>
                {
                    Ok(Segment::Option(key.to_owned()))
                }
                _ => Err(Error::Template(format!(
                    "unknown placeholder `{{{{{expr}}}}}` in {source:?}"
                ))),
            },
        }
    }

    /// Original template text.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Substitutes the request's fields into the template.
    ///
    /// Fails if the template names an option the request does not carry.
    pub fn render(&self, request: &Request) -> Result<String> {
        let mut out = String::with_capacity(self.source.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Filename => out.push_str(&request.filename),
                Segment::Type => out.push_str(&request.recipe_type),
                Segment::Option(key) => {
                    let Some(value) = request.options.get(key) else {
                        return Err(Error::Template(format!(
                            "option {key:?} used by {:?} was not supplied",
                            self.source
                        )));
                    };
                    out.push_str(value);
                }
            }
        }
        Ok(out)
    }
}
