//! Text projection: turns a metadata record into the string that gets embedded.
//!
//! A projection is a template with `{field}` placeholders, e.g.
//! `"Looking for a job as: {job_title}; {experience}"`. `{{` and `}}` are
//! literal braces. Fields missing from a record render as an empty string.

use crate::metadata::MetadataRecord;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ProjectionError {
    #[error("unclosed placeholder starting at byte {0}")]
    Unclosed(usize),

    #[error("unmatched '}}' at byte {0}")]
    UnmatchedClose(usize),

    #[error("empty placeholder at byte {0}")]
    EmptyPlaceholder(usize),
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Field(String),
}

/// Parsed projection template.
#[derive(Debug, Clone, PartialEq)]
pub struct TextProjection {
    segments: Vec<Segment>,
}

impl TextProjection {
    pub fn parse(template: &str) -> Result<Self, ProjectionError> {
        let mut segments = vec![];
        let mut literal = String::new();
        let mut chars = template.char_indices().peekable();

        while let Some((at, c)) = chars.next() {
            match c {
                '{' if matches!(chars.peek(), Some((_, '{'))) => {
                    chars.next();
                    literal.push('{');
                }
                '}' if matches!(chars.peek(), Some((_, '}'))) => {
                    chars.next();
                    literal.push('}');
                }
                '{' => {
                    let mut name = String::new();
                    loop {
                        match chars.next() {
                            Some((_, '}')) => break,
                            Some((_, c)) => name.push(c),
                            None => return Err(ProjectionError::Unclosed(at)),
                        }
                    }

                    let name = name.trim();
                    if name.is_empty() {
                        return Err(ProjectionError::EmptyPlaceholder(at));
                    }

                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Field(name.to_string()));
                }
                '}' => return Err(ProjectionError::UnmatchedClose(at)),
                c => literal.push(c),
            }
        }

        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self { segments })
    }

    /// Field names referenced by the template, in order of appearance.
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Field(name) => Some(name.as_str()),
            Segment::Literal(_) => None,
        })
    }

    pub fn render(&self, record: &MetadataRecord) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Field(name) => out.push_str(record.get(name).unwrap_or_default()),
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(pairs: &[(&str, &str)]) -> MetadataRecord {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_render_fields() {
        let projection =
            TextProjection::parse("Ищет работу на должность: {job_title}; {experience}; {edu}").unwrap();

        let text = projection.render(&record(&[
            ("job_title", "Data engineer"),
            ("experience", "5 years"),
            ("edu", "MSU"),
        ]));

        assert_eq!(text, "Ищет работу на должность: Data engineer; 5 years; MSU");
        assert_eq!(
            projection.fields().collect::<Vec<_>>(),
            vec!["job_title", "experience", "edu"]
        );
    }

    #[test]
    fn test_missing_field_renders_empty() {
        let projection = TextProjection::parse("{descr}. Требуемый опыт: {req_exp}").unwrap();
        let text = projection.render(&record(&[("descr", "Backend role")]));
        assert_eq!(text, "Backend role. Требуемый опыт: ");
    }

    #[test]
    fn test_escaped_braces() {
        let projection = TextProjection::parse("{{literal}} {name}").unwrap();
        assert_eq!(projection.render(&record(&[("name", "x")])), "{literal} x");
        assert_eq!(projection.fields().count(), 1);
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            TextProjection::parse("abc {name"),
            Err(ProjectionError::Unclosed(4))
        );
        assert_eq!(
            TextProjection::parse("a } b"),
            Err(ProjectionError::UnmatchedClose(2))
        );
        assert_eq!(
            TextProjection::parse("{ }"),
            Err(ProjectionError::EmptyPlaceholder(0))
        );
    }
}
