//! Resource descriptor: loading and the session-description grammar.
//!
//! The descriptor advertises the media capabilities the daemon may negotiate.
//! It is optional: when it cannot be read or parsed the loader returns `None`
//! and the daemon keeps running without that capability.
//!
//! # Grammar
//!
//! ```text
//! v=0                      session section (everything before the first m=)
//! o=- 0 0 IN IP4 0.0.0.0
//! s=mediad
//! m=audio 0 RTP/AVP 0      opens a media section
//! a=rtpmap:0 PCMU/8000
//! ```

use std::fmt;
use std::fs;
use std::path::Path;

use serde::Serialize;

use crate::error::DescriptorError;

/// One `<type>=<value>` line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Field {
    pub kind: char,
    pub value: String,
}

/// A run of fields: the session preamble or one `m=` block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Section {
    pub fields: Vec<Field>,
}

impl Section {
    /// First value of the given field type.
    pub fn get(&self, kind: char) -> Option<&str> {
        self.fields
            .iter()
            .find(|f| f.kind == kind)
            .map(|f| f.value.as_str())
    }
}

/// A fully validated descriptor. There is no partially-parsed form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceDescriptor {
    session: Section,
    media: Vec<Section>,
}

impl ResourceDescriptor {
    pub fn session(&self) -> &Section {
        &self.session
    }

    pub fn media(&self) -> &[Section] {
        &self.media
    }

    /// Media kinds in declaration order (`audio`, `video`, ...).
    pub fn media_kinds(&self) -> Vec<&str> {
        self.media
            .iter()
            .filter_map(|m| m.get('m'))
            .filter_map(|m| m.split_whitespace().next())
            .collect()
    }
}

impl fmt::Display for ResourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for field in self
            .session
            .fields
            .iter()
            .chain(self.media.iter().flat_map(|m| m.fields.iter()))
        {
            writeln!(f, "{}={}", field.kind, field.value)?;
        }
        Ok(())
    }
}

/// Parses descriptor text into a validated [`ResourceDescriptor`].
pub trait DescriptorParser {
    fn parse(&self, text: &str) -> Result<ResourceDescriptor, DescriptorError>;
}

/// Default grammar, see the module docs.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionDescriptionParser;

impl DescriptorParser for SessionDescriptionParser {
    fn parse(&self, text: &str) -> Result<ResourceDescriptor, DescriptorError> {
        let mut session = Section::default();
        let mut media: Vec<Section> = Vec::new();

        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim_end_matches('\r');
            if line.trim().is_empty() {
                continue;
            }
            let field = parse_field(idx + 1, line)?;

            if field.kind == 'm' {
                media.push(Section {
                    fields: vec![field],
                });
            } else if let Some(current) = media.last_mut() {
                current.fields.push(field);
            } else {
                session.fields.push(field);
            }
        }

        match session.fields.first() {
            Some(first) if first.kind == 'v' && first.value == "0" => {}
            Some(first) => {
                return Err(DescriptorError::Parse {
                    line: 1,
                    reason: format!("expected 'v=0' first, found '{}={}'", first.kind, first.value),
                })
            }
            None => return Err(DescriptorError::Missing('v')),
        }
        for required in ['o', 's'] {
            if session.get(required).is_none() {
                return Err(DescriptorError::Missing(required));
            }
        }

        Ok(ResourceDescriptor { session, media })
    }
}

fn parse_field(line: usize, text: &str) -> Result<Field, DescriptorError> {
    let mut chars = text.chars();
    let kind = chars.next().filter(char::is_ascii_alphabetic);
    let sep = chars.next();
    match (kind, sep) {
        (Some(kind), Some('=')) => Ok(Field {
            kind,
            value: chars.as_str().to_string(),
        }),
        _ => Err(DescriptorError::Parse {
            line,
            reason: format!("expected '<type>=<value>', found '{text}'"),
        }),
    }
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load the descriptor at `path` with the default grammar.
pub fn load(path: &Path) -> Option<ResourceDescriptor> {
    load_with(path, &SessionDescriptionParser)
}

/// Read `path` once and parse it. Every failure is logged and mapped to `None`.
pub fn load_with(path: &Path, parser: &dyn DescriptorParser) -> Option<ResourceDescriptor> {
    tracing::debug!(path = %path.display(), "loading resource descriptor");

    let result = fs::read_to_string(path)
        .map_err(|source| DescriptorError::Io {
            path: path.to_path_buf(),
            source,
        })
        .and_then(|text| parser.parse(&text));

    match result {
        Ok(descriptor) => {
            tracing::debug!("resource descriptor:\n{descriptor}");
            Some(descriptor)
        }
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "wrong codec configuration, communication won't be possible",
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "v=0\r\no=- 0 0 IN IP4 0.0.0.0\r\ns=mediad\r\nm=audio 0 RTP/AVP 0 8\r\na=rtpmap:0 PCMU/8000\r\na=rtpmap:8 PCMA/8000\r\nm=video 0 RTP/AVP 96\r\na=rtpmap:96 VP8/90000\r\n";

    #[test]
    fn parses_sections_in_order() {
        let d = SessionDescriptionParser.parse(SAMPLE).expect("parse");
        assert_eq!(d.session().get('s'), Some("mediad"));
        assert_eq!(d.media_kinds(), vec!["audio", "video"]);
        assert_eq!(d.media()[0].fields.iter().filter(|f| f.kind == 'a').count(), 2);
    }

    #[test]
    fn display_renders_every_field() {
        let d = SessionDescriptionParser.parse(SAMPLE).expect("parse");
        let text = d.to_string();
        assert_eq!(text, SAMPLE.replace("\r\n", "\n"));
    }

    #[test]
    fn rejects_missing_version() {
        let err = SessionDescriptionParser
            .parse("o=- 0 0 IN IP4 0.0.0.0\ns=x\n")
            .unwrap_err();
        assert!(matches!(err, DescriptorError::Parse { line: 1, .. }), "got: {err}");
    }

    #[test]
    fn rejects_missing_session_name() {
        let err = SessionDescriptionParser
            .parse("v=0\no=- 0 0 IN IP4 0.0.0.0\n")
            .unwrap_err();
        assert!(matches!(err, DescriptorError::Missing('s')));
    }

    #[test]
    fn rejects_malformed_line_with_number() {
        let err = SessionDescriptionParser
            .parse("v=0\no=x\ns=x\nnot a field\n")
            .unwrap_err();
        assert!(matches!(err, DescriptorError::Parse { line: 4, .. }), "got: {err}");
    }

    #[test]
    fn empty_text_is_missing_version() {
        let err = SessionDescriptionParser.parse("").unwrap_err();
        assert!(matches!(err, DescriptorError::Missing('v')));
    }
}
