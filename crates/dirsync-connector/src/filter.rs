//! Search filters
//!
//! A structured filter model, its rendering to RFC 4515 filter text and a
//! parser for filter text supplied by callers.

use serde::{Deserialize, Serialize};

use crate::error::{ConnectorError, ConnectorResult};

/// Filter for search operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Filter {
    /// Match objects where attribute equals value.
    Equals { attribute: String, value: String },

    /// Match objects where a binary attribute equals the given bytes.
    EqualsBinary { attribute: String, value: Vec<u8> },

    /// Match objects by substring pattern `initial*any*...*final`.
    Substring {
        attribute: String,
        initial: Option<String>,
        any: Vec<String>,
        #[serde(rename = "final")]
        final_value: Option<String>,
    },

    /// Approximate match; directories treat it as case-insensitive equality.
    Approx { attribute: String, value: String },

    /// Match objects where attribute is greater than or equal to value.
    GreaterThanOrEquals { attribute: String, value: String },

    /// Match objects where attribute is less than or equal to value.
    LessThanOrEquals { attribute: String, value: String },

    /// Match objects where attribute exists (has any value).
    Present { attribute: String },

    /// Extensible match with a matching rule OID, e.g. the bitwise AND rule.
    Extensible {
        attribute: String,
        rule: Option<String>,
        dn_attributes: bool,
        value: String,
    },

    /// Logical AND of multiple filters.
    And { filters: Vec<Filter> },

    /// Logical OR of multiple filters.
    Or { filters: Vec<Filter> },

    /// Logical NOT of a filter.
    Not { filter: Box<Filter> },
}

impl Filter {
    /// Create an equals filter.
    pub fn eq(attribute: impl Into<String>, value: impl Into<String>) -> Self {
        Filter::Equals {
            attribute: attribute.into(),
            value: value.into(),
        }
    }

    /// Create a contains filter.
    pub fn contains(attribute: impl Into<String>, value: impl Into<String>) -> Self {
        Filter::Substring {
            attribute: attribute.into(),
            initial: None,
            any: vec![value.into()],
            final_value: None,
        }
    }

    /// Create a starts-with filter.
    pub fn starts_with(attribute: impl Into<String>, value: impl Into<String>) -> Self {
        Filter::Substring {
            attribute: attribute.into(),
            initial: Some(value.into()),
            any: vec![],
            final_value: None,
        }
    }

    /// Create an ends-with filter.
    pub fn ends_with(attribute: impl Into<String>, value: impl Into<String>) -> Self {
        Filter::Substring {
            attribute: attribute.into(),
            initial: None,
            any: vec![],
            final_value: Some(value.into()),
        }
    }

    /// Create a greater-or-equal filter.
    pub fn ge(attribute: impl Into<String>, value: impl Into<String>) -> Self {
        Filter::GreaterThanOrEquals {
            attribute: attribute.into(),
            value: value.into(),
        }
    }

    /// Create a less-or-equal filter.
    pub fn le(attribute: impl Into<String>, value: impl Into<String>) -> Self {
        Filter::LessThanOrEquals {
            attribute: attribute.into(),
            value: value.into(),
        }
    }

    /// Create a present filter.
    pub fn present(attribute: impl Into<String>) -> Self {
        Filter::Present {
            attribute: attribute.into(),
        }
    }

    /// Create an AND filter.
    pub fn and(filters: Vec<Filter>) -> Self {
        Filter::And { filters }
    }

    /// Create an OR filter.
    pub fn or(filters: Vec<Filter>) -> Self {
        Filter::Or { filters }
    }

    /// Create a NOT filter.
    pub fn negate(filter: Filter) -> Self {
        Filter::Not {
            filter: Box::new(filter),
        }
    }

    /// Combine with another filter using AND.
    #[must_use]
    pub fn and_with(self, other: Filter) -> Self {
        match self {
            Filter::And { mut filters } => {
                filters.push(other);
                Filter::And { filters }
            }
            _ => Filter::And {
                filters: vec![self, other],
            },
        }
    }

    /// Parse RFC 4515 filter text.
    ///
    /// A bare item without the outer parentheses (`cn=jdoe`) is accepted the
    /// way most directory tools accept it.
    pub fn parse(text: &str) -> ConnectorResult<Filter> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(ConnectorError::usage("filter text is empty"));
        }
        let wrapped;
        let input = if trimmed.starts_with('(') {
            trimmed
        } else {
            wrapped = format!("({trimmed})");
            &wrapped
        };

        let mut parser = Parser {
            input: input.as_bytes(),
            pos: 0,
        };
        let filter = parser.parse_filter()?;
        if parser.pos != parser.input.len() {
            return Err(parser.error("unexpected trailing characters"));
        }
        Ok(filter)
    }

    /// Render as RFC 4515 filter text.
    pub fn to_ldap(&self) -> String {
        match self {
            Filter::And { filters } => {
                let inner: Vec<String> = filters.iter().map(Filter::to_ldap).collect();
                format!("(&{})", inner.join(""))
            }
            Filter::Or { filters } => {
                let inner: Vec<String> = filters.iter().map(Filter::to_ldap).collect();
                format!("(|{})", inner.join(""))
            }
            Filter::Not { filter } => format!("(!{})", filter.to_ldap()),
            Filter::Equals { attribute, value } => {
                format!("({}={})", attribute, escape_filter_value(value))
            }
            Filter::EqualsBinary { attribute, value } => {
                format!("({}={})", attribute, escape_filter_bytes(value))
            }
            Filter::Substring {
                attribute,
                initial,
                any,
                final_value,
            } => {
                let mut pattern = String::new();
                if let Some(initial) = initial {
                    pattern.push_str(&escape_filter_value(initial));
                }
                pattern.push('*');
                for part in any {
                    pattern.push_str(&escape_filter_value(part));
                    pattern.push('*');
                }
                if let Some(final_value) = final_value {
                    pattern.push_str(&escape_filter_value(final_value));
                }
                format!("({attribute}={pattern})")
            }
            Filter::Approx { attribute, value } => {
                format!("({}~={})", attribute, escape_filter_value(value))
            }
            Filter::GreaterThanOrEquals { attribute, value } => {
                format!("({}>={})", attribute, escape_filter_value(value))
            }
            Filter::LessThanOrEquals { attribute, value } => {
                format!("({}<={})", attribute, escape_filter_value(value))
            }
            Filter::Present { attribute } => format!("({attribute}=*)"),
            Filter::Extensible {
                attribute,
                rule,
                dn_attributes,
                value,
            } => {
                let mut text = format!("({attribute}");
                if *dn_attributes {
                    text.push_str(":dn");
                }
                if let Some(rule) = rule {
                    text.push(':');
                    text.push_str(rule);
                }
                text.push_str(":=");
                text.push_str(&escape_filter_value(value));
                text.push(')');
                text
            }
        }
    }

    /// Apply `f` to every attribute name in the filter tree.
    #[must_use]
    pub fn map_attributes(self, f: &impl Fn(&str) -> String) -> Filter {
        match self {
            Filter::And { filters } => Filter::And {
                filters: filters.into_iter().map(|x| x.map_attributes(f)).collect(),
            },
            Filter::Or { filters } => Filter::Or {
                filters: filters.into_iter().map(|x| x.map_attributes(f)).collect(),
            },
            Filter::Not { filter } => Filter::negate(filter.map_attributes(f)),
            Filter::Equals { attribute, value } => Filter::Equals {
                attribute: f(&attribute),
                value,
            },
            Filter::EqualsBinary { attribute, value } => Filter::EqualsBinary {
                attribute: f(&attribute),
                value,
            },
            Filter::Substring {
                attribute,
                initial,
                any,
                final_value,
            } => Filter::Substring {
                attribute: f(&attribute),
                initial,
                any,
                final_value,
            },
            Filter::Approx { attribute, value } => Filter::Approx {
                attribute: f(&attribute),
                value,
            },
            Filter::GreaterThanOrEquals { attribute, value } => Filter::GreaterThanOrEquals {
                attribute: f(&attribute),
                value,
            },
            Filter::LessThanOrEquals { attribute, value } => Filter::LessThanOrEquals {
                attribute: f(&attribute),
                value,
            },
            Filter::Present { attribute } => Filter::Present {
                attribute: f(&attribute),
            },
            Filter::Extensible {
                attribute,
                rule,
                dn_attributes,
                value,
            } => Filter::Extensible {
                attribute: f(&attribute),
                rule,
                dn_attributes,
                value,
            },
        }
    }
}

impl std::fmt::Display for Filter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_ldap())
    }
}

/// Escape special characters in LDAP filter values (RFC 4515).
pub fn escape_filter_value(value: &str) -> String {
    value
        .replace('\\', "\\5c")
        .replace('*', "\\2a")
        .replace('(', "\\28")
        .replace(')', "\\29")
        .replace('\0', "\\00")
}

/// Escape every byte of a binary assertion value as `\xx`.
pub fn escape_filter_bytes(value: &[u8]) -> String {
    let mut out = String::with_capacity(value.len() * 3);
    for byte in value {
        out.push('\\');
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
}

/// One component of a value; `Star` marks an unescaped `*`.
enum ValuePart {
    Bytes(Vec<u8>),
    Star,
}

impl Parser<'_> {
    fn error(&self, message: &str) -> ConnectorError {
        ConnectorError::usage(format!(
            "malformed filter at position {}: {}",
            self.pos, message
        ))
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn expect(&mut self, byte: u8) -> ConnectorResult<()> {
        if self.peek() == Some(byte) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(&format!("expected '{}'", byte as char)))
        }
    }

    fn parse_filter(&mut self) -> ConnectorResult<Filter> {
        self.expect(b'(')?;
        let filter = match self.peek() {
            Some(b'&') => {
                self.pos += 1;
                Filter::And {
                    filters: self.parse_list()?,
                }
            }
            Some(b'|') => {
                self.pos += 1;
                Filter::Or {
                    filters: self.parse_list()?,
                }
            }
            Some(b'!') => {
                self.pos += 1;
                Filter::negate(self.parse_filter()?)
            }
            Some(_) => self.parse_item()?,
            None => return Err(self.error("unexpected end of filter")),
        };
        self.expect(b')')?;
        Ok(filter)
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(|b| b.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }

    // Whitespace between components is tolerated, as in hand-written filters.
    fn parse_list(&mut self) -> ConnectorResult<Vec<Filter>> {
        let mut filters = Vec::new();
        self.skip_whitespace();
        while self.peek() == Some(b'(') {
            filters.push(self.parse_filter()?);
            self.skip_whitespace();
        }
        Ok(filters)
    }

    fn parse_attribute(&mut self) -> ConnectorResult<String> {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b';') {
                self.pos += 1;
            } else {
                break;
            }
        }
        if self.pos == start {
            return Err(self.error("expected attribute description"));
        }
        Ok(String::from_utf8_lossy(&self.input[start..self.pos]).into_owned())
    }

    fn parse_item(&mut self) -> ConnectorResult<Filter> {
        let attribute = self.parse_attribute()?;
        match self.peek() {
            Some(b'=') => {
                self.pos += 1;
                self.parse_equality_or_substring(attribute)
            }
            Some(b'~') => {
                self.pos += 1;
                self.expect(b'=')?;
                let value = self.parse_plain_value()?;
                Ok(Filter::Approx { attribute, value })
            }
            Some(b'>') => {
                self.pos += 1;
                self.expect(b'=')?;
                let value = self.parse_plain_value()?;
                Ok(Filter::GreaterThanOrEquals { attribute, value })
            }
            Some(b'<') => {
                self.pos += 1;
                self.expect(b'=')?;
                let value = self.parse_plain_value()?;
                Ok(Filter::LessThanOrEquals { attribute, value })
            }
            Some(b':') => self.parse_extensible(attribute),
            _ => Err(self.error("expected filter operator")),
        }
    }

    fn parse_extensible(&mut self, attribute: String) -> ConnectorResult<Filter> {
        let mut dn_attributes = false;
        let mut rule = None;
        loop {
            self.expect(b':')?;
            if self.peek() == Some(b'=') {
                self.pos += 1;
                break;
            }
            let part = self.parse_attribute()?;
            if part.eq_ignore_ascii_case("dn") && rule.is_none() {
                dn_attributes = true;
            } else if rule.is_none() {
                rule = Some(part);
            } else {
                return Err(self.error("unexpected extensible match component"));
            }
        }
        let value = self.parse_plain_value()?;
        Ok(Filter::Extensible {
            attribute,
            rule,
            dn_attributes,
            value,
        })
    }

    fn parse_value_parts(&mut self) -> ConnectorResult<Vec<ValuePart>> {
        let mut parts = Vec::new();
        let mut current = Vec::new();
        loop {
            match self.peek() {
                None => return Err(self.error("unterminated value")),
                Some(b')') => break,
                Some(b'(') => return Err(self.error("unescaped '(' in value")),
                Some(b'*') => {
                    self.pos += 1;
                    if !current.is_empty() {
                        parts.push(ValuePart::Bytes(std::mem::take(&mut current)));
                    }
                    parts.push(ValuePart::Star);
                }
                Some(b'\\') => {
                    let hex = self
                        .input
                        .get(self.pos + 1..self.pos + 3)
                        .ok_or_else(|| self.error("truncated escape"))?;
                    let text = std::str::from_utf8(hex).map_err(|_| self.error("bad escape"))?;
                    let byte =
                        u8::from_str_radix(text, 16).map_err(|_| self.error("bad escape"))?;
                    current.push(byte);
                    self.pos += 3;
                }
                Some(b) => {
                    current.push(b);
                    self.pos += 1;
                }
            }
        }
        if !current.is_empty() {
            parts.push(ValuePart::Bytes(current));
        }
        Ok(parts)
    }

    fn to_text(&self, bytes: Vec<u8>) -> ConnectorResult<String> {
        String::from_utf8(bytes).map_err(|_| self.error("value is not valid UTF-8"))
    }

    fn parse_plain_value(&mut self) -> ConnectorResult<String> {
        let mut out = Vec::new();
        for part in self.parse_value_parts()? {
            match part {
                ValuePart::Bytes(bytes) => out.extend(bytes),
                ValuePart::Star => return Err(self.error("unexpected '*' in value")),
            }
        }
        self.to_text(out)
    }

    fn parse_equality_or_substring(&mut self, attribute: String) -> ConnectorResult<Filter> {
        let parts = self.parse_value_parts()?;
        let stars = parts
            .iter()
            .filter(|p| matches!(p, ValuePart::Star))
            .count();

        if stars == 0 {
            let bytes = match parts.into_iter().next() {
                Some(ValuePart::Bytes(bytes)) => bytes,
                _ => Vec::new(),
            };
            return Ok(match String::from_utf8(bytes) {
                Ok(value) => Filter::Equals { attribute, value },
                Err(e) => Filter::EqualsBinary {
                    attribute,
                    value: e.into_bytes(),
                },
            });
        }
        if stars == 1 && parts.len() == 1 {
            return Ok(Filter::Present { attribute });
        }

        let mut initial = None;
        let mut any = Vec::new();
        let mut final_value = None;
        let last = parts.len() - 1;
        for (i, part) in parts.into_iter().enumerate() {
            if let ValuePart::Bytes(bytes) = part {
                let text = self.to_text(bytes)?;
                if i == 0 {
                    initial = Some(text);
                } else if i == last {
                    final_value = Some(text);
                } else {
                    any.push(text);
                }
            }
        }
        Ok(Filter::Substring {
            attribute,
            initial,
            any,
            final_value,
        })
    }
}
