//! Search filters: AST, RFC 4515 string form, BER encoding (RFC 4511 §4.5.1).

use crate::error::{LdapError, Result};
use crate::protocol::{BerReader, BerWriter};

// Filter CHOICE context tags
const TAG_AND: u8 = 0xA0;
const TAG_OR: u8 = 0xA1;
const TAG_NOT: u8 = 0xA2;
const TAG_EQUALITY: u8 = 0xA3;
const TAG_SUBSTRINGS: u8 = 0xA4;
const TAG_GREATER_OR_EQUAL: u8 = 0xA5;
const TAG_LESS_OR_EQUAL: u8 = 0xA6;
const TAG_PRESENT: u8 = 0x87;
const TAG_APPROX: u8 = 0xA8;
const TAG_EXTENSIBLE: u8 = 0xA9;

// MatchingRuleAssertion fields
const TAG_MRA_RULE: u8 = 0x81;
const TAG_MRA_TYPE: u8 = 0x82;
const TAG_MRA_VALUE: u8 = 0x83;
const TAG_MRA_DN_ATTRS: u8 = 0x84;

// SubstringFilter items
const TAG_SUB_INITIAL: u8 = 0x80;
const TAG_SUB_ANY: u8 = 0x81;
const TAG_SUB_FINAL: u8 = 0x82;

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Equality {
        attribute: String,
        value: Vec<u8>,
    },
    Substrings {
        attribute: String,
        initial: Option<Vec<u8>>,
        any: Vec<Vec<u8>>,
        final_: Option<Vec<u8>>,
    },
    GreaterOrEqual {
        attribute: String,
        value: Vec<u8>,
    },
    LessOrEqual {
        attribute: String,
        value: Vec<u8>,
    },
    Present(String),
    Approx {
        attribute: String,
        value: Vec<u8>,
    },
    Extensible {
        matching_rule: Option<String>,
        attribute: Option<String>,
        value: Vec<u8>,
        dn_attributes: bool,
    },
}

impl Filter {
    /// Match-everything filter used as the search default.
    pub fn present_object_class() -> Filter {
        Filter::Present("objectClass".to_string())
    }

    pub fn equality(attribute: impl Into<String>, value: impl Into<Vec<u8>>) -> Filter {
        Filter::Equality {
            attribute: attribute.into(),
            value: value.into(),
        }
    }

    /// Parse an RFC 4515 filter string, e.g. `(&(objectClass=person)(cn=a*))`.
    pub fn parse(input: &str) -> Result<Filter> {
        let mut parser = Parser {
            buf: input.as_bytes(),
            pos: 0,
        };
        let filter = parser.parse_filter()?;
        parser.skip_ws();
        if parser.pos != parser.buf.len() {
            return Err(invalid(format!(
                "trailing characters after filter at offset {}",
                parser.pos
            )));
        }
        Ok(filter)
    }

    pub(crate) fn encode(&self, w: &mut BerWriter) {
        match self {
            Filter::And(filters) => {
                let p = w.begin(TAG_AND);
                for f in filters {
                    f.encode(w);
                }
                w.end(p);
            }
            Filter::Or(filters) => {
                let p = w.begin(TAG_OR);
                for f in filters {
                    f.encode(w);
                }
                w.end(p);
            }
            Filter::Not(inner) => {
                let p = w.begin(TAG_NOT);
                inner.encode(w);
                w.end(p);
            }
            Filter::Equality { attribute, value } => {
                encode_ava(w, TAG_EQUALITY, attribute, value);
            }
            Filter::Substrings {
                attribute,
                initial,
                any,
                final_,
            } => {
                let p = w.begin(TAG_SUBSTRINGS);
                w.write_string(attribute);
                let subs = w.begin(crate::protocol::TAG_SEQUENCE);
                if let Some(i) = initial {
                    w.write_raw(TAG_SUB_INITIAL, i);
                }
                for a in any {
                    w.write_raw(TAG_SUB_ANY, a);
                }
                if let Some(f) = final_ {
                    w.write_raw(TAG_SUB_FINAL, f);
                }
                w.end(subs);
                w.end(p);
            }
            Filter::GreaterOrEqual { attribute, value } => {
                encode_ava(w, TAG_GREATER_OR_EQUAL, attribute, value);
            }
            Filter::LessOrEqual { attribute, value } => {
                encode_ava(w, TAG_LESS_OR_EQUAL, attribute, value);
            }
            Filter::Present(attribute) => {
                w.write_raw(TAG_PRESENT, attribute.as_bytes());
            }
            Filter::Approx { attribute, value } => {
                encode_ava(w, TAG_APPROX, attribute, value);
            }
            Filter::Extensible {
                matching_rule,
                attribute,
                value,
                dn_attributes,
            } => {
                let p = w.begin(TAG_EXTENSIBLE);
                if let Some(rule) = matching_rule {
                    w.write_raw(TAG_MRA_RULE, rule.as_bytes());
                }
                if let Some(attr) = attribute {
                    w.write_raw(TAG_MRA_TYPE, attr.as_bytes());
                }
                w.write_raw(TAG_MRA_VALUE, value);
                if *dn_attributes {
                    w.write_raw(TAG_MRA_DN_ATTRS, &[0xFF]);
                }
                w.end(p);
            }
        }
    }

    pub(crate) fn decode(r: &mut BerReader<'_>) -> Result<Filter> {
        let (tag, content) = r.read_any()?;
        Filter::decode_content(tag, content)
    }

    fn decode_content(tag: u8, content: &[u8]) -> Result<Filter> {
        let mut r = BerReader::new(content);
        match tag {
            TAG_AND | TAG_OR => {
                let mut filters = Vec::new();
                while !r.is_empty() {
                    filters.push(Filter::decode(&mut r)?);
                }
                Ok(if tag == TAG_AND {
                    Filter::And(filters)
                } else {
                    Filter::Or(filters)
                })
            }
            TAG_NOT => Ok(Filter::Not(Box::new(Filter::decode(&mut r)?))),
            TAG_EQUALITY => decode_ava(&mut r, |attribute, value| Filter::Equality {
                attribute,
                value,
            }),
            TAG_SUBSTRINGS => {
                let attribute = r.read_string()?;
                let mut subs = r.read_sequence()?;
                let mut initial = None;
                let mut any = Vec::new();
                let mut final_ = None;
                while !subs.is_empty() {
                    let (t, v) = subs.read_any()?;
                    match t {
                        TAG_SUB_INITIAL => initial = Some(v.to_vec()),
                        TAG_SUB_ANY => any.push(v.to_vec()),
                        TAG_SUB_FINAL => final_ = Some(v.to_vec()),
                        other => {
                            return Err(LdapError::Protocol(format!(
                                "unknown substring item tag 0x{:02X}",
                                other
                            )))
                        }
                    }
                }
                Ok(Filter::Substrings {
                    attribute,
                    initial,
                    any,
                    final_,
                })
            }
            TAG_GREATER_OR_EQUAL => decode_ava(&mut r, |attribute, value| Filter::GreaterOrEqual {
                attribute,
                value,
            }),
            TAG_LESS_OR_EQUAL => decode_ava(&mut r, |attribute, value| Filter::LessOrEqual {
                attribute,
                value,
            }),
            TAG_PRESENT => match std::str::from_utf8(content) {
                Ok(attr) => Ok(Filter::Present(attr.to_string())),
                Err(_) => Err(LdapError::Protocol(
                    "invalid UTF-8 in present filter".to_string(),
                )),
            },
            TAG_APPROX => decode_ava(&mut r, |attribute, value| Filter::Approx {
                attribute,
                value,
            }),
            TAG_EXTENSIBLE => {
                let mut matching_rule = None;
                let mut attribute = None;
                let mut value = Vec::new();
                let mut dn_attributes = false;
                while !r.is_empty() {
                    let (t, v) = r.read_any()?;
                    match t {
                        TAG_MRA_RULE => matching_rule = Some(utf8(v, "matchingRule")?),
                        TAG_MRA_TYPE => attribute = Some(utf8(v, "matching type")?),
                        TAG_MRA_VALUE => value = v.to_vec(),
                        TAG_MRA_DN_ATTRS => dn_attributes = v.first().is_some_and(|b| *b != 0),
                        other => {
                            return Err(LdapError::Protocol(format!(
                                "unknown extensibleMatch field tag 0x{:02X}",
                                other
                            )))
                        }
                    }
                }
                Ok(Filter::Extensible {
                    matching_rule,
                    attribute,
                    value,
                    dn_attributes,
                })
            }
            other => Err(LdapError::Protocol(format!(
                "unknown filter tag 0x{:02X}",
                other
            ))),
        }
    }
}

fn utf8(bytes: &[u8], what: &str) -> Result<String> {
    match std::str::from_utf8(bytes) {
        Ok(s) => Ok(s.to_string()),
        Err(_) => Err(LdapError::Protocol(format!("invalid UTF-8 in {}", what))),
    }
}

fn encode_ava(w: &mut BerWriter, tag: u8, attribute: &str, value: &[u8]) {
    let p = w.begin(tag);
    w.write_string(attribute);
    w.write_octet_string(value);
    w.end(p);
}

fn decode_ava(
    r: &mut BerReader<'_>,
    build: impl FnOnce(String, Vec<u8>) -> Filter,
) -> Result<Filter> {
    let attribute = r.read_string()?;
    let value = r.read_octet_string()?.to_vec();
    Ok(build(attribute, value))
}

fn invalid(msg: impl Into<String>) -> LdapError {
    LdapError::InvalidArgument(msg.into())
}

struct Parser<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn skip_ws(&mut self) {
        while self.buf.get(self.pos) == Some(&b' ') {
            self.pos += 1;
        }
    }

    fn peek(&self) -> Option<u8> {
        self.buf.get(self.pos).copied()
    }

    fn eat(&mut self, b: u8) -> Result<()> {
        if self.peek() == Some(b) {
            self.pos += 1;
            Ok(())
        } else {
            Err(invalid(format!(
                "expected '{}' at offset {}",
                b as char, self.pos
            )))
        }
    }

    fn parse_filter(&mut self) -> Result<Filter> {
        self.skip_ws();
        self.eat(b'(')?;
        let filter = match self.peek() {
            Some(b'&') => {
                self.pos += 1;
                Filter::And(self.parse_filter_list()?)
            }
            Some(b'|') => {
                self.pos += 1;
                Filter::Or(self.parse_filter_list()?)
            }
            Some(b'!') => {
                self.pos += 1;
                Filter::Not(Box::new(self.parse_filter()?))
            }
            Some(_) => self.parse_item()?,
            None => return Err(invalid("unterminated filter")),
        };
        self.eat(b')')?;
        Ok(filter)
    }

    fn parse_filter_list(&mut self) -> Result<Vec<Filter>> {
        let mut filters = Vec::new();
        while self.peek() == Some(b'(') {
            filters.push(self.parse_filter()?);
        }
        if filters.is_empty() {
            return Err(invalid("empty filter list"));
        }
        Ok(filters)
    }

    /// attr = value | attr >= value | attr <= value | attr ~= value |
    /// attr =* | attr = a*b*c | [attr][:dn][:rule]:=value
    fn parse_item(&mut self) -> Result<Filter> {
        let attribute = self.parse_attribute()?;
        match self.peek() {
            Some(b'=') => {
                self.pos += 1;
                self.parse_equality_tail(attribute)
            }
            Some(b'>') => {
                self.pos += 1;
                self.eat(b'=')?;
                Ok(Filter::GreaterOrEqual {
                    attribute,
                    value: self.parse_value()?.simple()?,
                })
            }
            Some(b'<') => {
                self.pos += 1;
                self.eat(b'=')?;
                Ok(Filter::LessOrEqual {
                    attribute,
                    value: self.parse_value()?.simple()?,
                })
            }
            Some(b'~') => {
                self.pos += 1;
                self.eat(b'=')?;
                Ok(Filter::Approx {
                    attribute,
                    value: self.parse_value()?.simple()?,
                })
            }
            Some(b':') => self.parse_extensible_tail(attribute),
            _ => Err(invalid(format!(
                "expected comparison operator at offset {}",
                self.pos
            ))),
        }
    }

    fn parse_attribute(&mut self) -> Result<String> {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if matches!(b, b'=' | b'>' | b'<' | b'~' | b':' | b'(' | b')') {
                break;
            }
            self.pos += 1;
        }
        let attr = &self.buf[start..self.pos];
        match std::str::from_utf8(attr) {
            Ok(s) if !s.is_empty() || self.peek() == Some(b':') => Ok(s.to_string()),
            Ok(_) => Err(invalid(format!("empty attribute at offset {}", start))),
            Err(_) => Err(invalid("attribute description is not UTF-8")),
        }
    }

    fn parse_equality_tail(&mut self, attribute: String) -> Result<Filter> {
        let value = self.parse_value()?;
        match value {
            Value::Simple(v) => Ok(Filter::Equality {
                attribute,
                value: v,
            }),
            Value::PresentStar => Ok(Filter::Present(attribute)),
            Value::Substrings {
                initial,
                any,
                final_,
            } => Ok(Filter::Substrings {
                attribute,
                initial,
                any,
                final_,
            }),
        }
    }

    fn parse_extensible_tail(&mut self, attribute: String) -> Result<Filter> {
        let mut dn_attributes = false;
        let mut matching_rule = None;
        loop {
            self.eat(b':')?;
            if self.peek() == Some(b'=') {
                self.pos += 1;
                break;
            }
            let word = self.parse_attribute()?;
            if word.eq_ignore_ascii_case("dn") {
                dn_attributes = true;
            } else if matching_rule.is_none() {
                matching_rule = Some(word);
            } else {
                return Err(invalid("extensible filter has multiple matching rules"));
            }
        }
        let value = self.parse_value()?.simple()?;
        Ok(Filter::Extensible {
            matching_rule,
            attribute: if attribute.is_empty() {
                None
            } else {
                Some(attribute)
            },
            value,
            dn_attributes,
        })
    }

    /// Value up to the closing parenthesis; `*` separates substring parts.
    fn parse_value(&mut self) -> Result<Value> {
        let mut parts: Vec<Vec<u8>> = vec![Vec::new()];
        let mut stars = 0usize;
        loop {
            match self.peek() {
                None => return Err(invalid("unterminated filter value")),
                Some(b')') => break,
                Some(b'(') => return Err(invalid("unescaped '(' in filter value")),
                Some(b'*') => {
                    self.pos += 1;
                    stars += 1;
                    parts.push(Vec::new());
                }
                Some(b'\\') => {
                    self.pos += 1;
                    let hi = self.hex_digit()?;
                    let lo = self.hex_digit()?;
                    parts.last_mut().unwrap().push(hi << 4 | lo);
                }
                Some(b) => {
                    self.pos += 1;
                    parts.last_mut().unwrap().push(b);
                }
            }
        }
        if stars == 0 {
            return Ok(Value::Simple(parts.pop().unwrap()));
        }
        if stars == 1 && parts.iter().all(|p| p.is_empty()) {
            return Ok(Value::PresentStar);
        }
        let final_part = parts.pop().unwrap();
        let initial_part = parts.remove(0);
        Ok(Value::Substrings {
            initial: if initial_part.is_empty() {
                None
            } else {
                Some(initial_part)
            },
            any: parts.into_iter().filter(|p| !p.is_empty()).collect(),
            final_: if final_part.is_empty() {
                None
            } else {
                Some(final_part)
            },
        })
    }

    fn hex_digit(&mut self) -> Result<u8> {
        let b = self
            .peek()
            .ok_or_else(|| invalid("truncated escape sequence"))?;
        self.pos += 1;
        match b {
            b'0'..=b'9' => Ok(b - b'0'),
            b'a'..=b'f' => Ok(b - b'a' + 10),
            b'A'..=b'F' => Ok(b - b'A' + 10),
            _ => Err(invalid(format!(
                "invalid hex digit '{}' in escape",
                b as char
            ))),
        }
    }
}

enum Value {
    Simple(Vec<u8>),
    PresentStar,
    Substrings {
        initial: Option<Vec<u8>>,
        any: Vec<Vec<u8>>,
        final_: Option<Vec<u8>>,
    },
}

impl Value {
    fn simple(self) -> Result<Vec<u8>> {
        match self {
            Value::Simple(v) => Ok(v),
            _ => Err(invalid("wildcard not allowed in this filter value")),
        }
    }
}

fn escape_to(out: &mut String, value: &[u8]) {
    for &b in value {
        match b {
            b'(' => out.push_str("\\28"),
            b')' => out.push_str("\\29"),
            b'*' => out.push_str("\\2a"),
            b'\\' => out.push_str("\\5c"),
            0x00 => out.push_str("\\00"),
            0x20..=0x7E => out.push(b as char),
            other => {
                out.push('\\');
                out.push_str(&format!("{:02x}", other));
            }
        }
    }
}

impl std::fmt::Display for Filter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut out = String::new();
        render(self, &mut out);
        f.write_str(&out)
    }
}

fn render(filter: &Filter, out: &mut String) {
    out.push('(');
    match filter {
        Filter::And(fs) => {
            out.push('&');
            for f in fs {
                render(f, out);
            }
        }
        Filter::Or(fs) => {
            out.push('|');
            for f in fs {
                render(f, out);
            }
        }
        Filter::Not(inner) => {
            out.push('!');
            render(inner, out);
        }
        Filter::Equality { attribute, value } => {
            out.push_str(attribute);
            out.push('=');
            escape_to(out, value);
        }
        Filter::Substrings {
            attribute,
            initial,
            any,
            final_,
        } => {
            out.push_str(attribute);
            out.push('=');
            if let Some(i) = initial {
                escape_to(out, i);
            }
            out.push('*');
            for a in any {
                escape_to(out, a);
                out.push('*');
            }
            if let Some(fv) = final_ {
                escape_to(out, fv);
            }
        }
        Filter::GreaterOrEqual { attribute, value } => {
            out.push_str(attribute);
            out.push_str(">=");
            escape_to(out, value);
        }
        Filter::LessOrEqual { attribute, value } => {
            out.push_str(attribute);
            out.push_str("<=");
            escape_to(out, value);
        }
        Filter::Present(attribute) => {
            out.push_str(attribute);
            out.push_str("=*");
        }
        Filter::Approx { attribute, value } => {
            out.push_str(attribute);
            out.push_str("~=");
            escape_to(out, value);
        }
        Filter::Extensible {
            matching_rule,
            attribute,
            value,
            dn_attributes,
        } => {
            if let Some(attr) = attribute {
                out.push_str(attr);
            }
            if *dn_attributes {
                out.push_str(":dn");
            }
            if let Some(rule) = matching_rule {
                out.push(':');
                out.push_str(rule);
            }
            out.push_str(":=");
            escape_to(out, value);
        }
    }
    out.push(')');
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_render(input: &str) -> String {
        Filter::parse(input).unwrap().to_string()
    }

    #[test]
    fn parse_equality() {
        assert_eq!(
            Filter::parse("(cn=foo)").unwrap(),
            Filter::equality("cn", "foo")
        );
    }

    #[test]
    fn parse_present() {
        assert_eq!(
            Filter::parse("(objectClass=*)").unwrap(),
            Filter::Present("objectClass".to_string())
        );
    }

    #[test]
    fn parse_and_or_not() {
        let f = Filter::parse("(&(objectClass=person)(|(cn=a)(cn=b))(!(uid=x)))").unwrap();
        match f {
            Filter::And(parts) => {
                assert_eq!(parts.len(), 3);
                assert!(matches!(parts[1], Filter::Or(_)));
                assert!(matches!(parts[2], Filter::Not(_)));
            }
            other => panic!("expected And, got {:?}", other),
        }
    }

    #[test]
    fn parse_substrings() {
        let f = Filter::parse("(cn=ab*cd*ef)").unwrap();
        assert_eq!(
            f,
            Filter::Substrings {
                attribute: "cn".to_string(),
                initial: Some(b"ab".to_vec()),
                any: vec![b"cd".to_vec()],
                final_: Some(b"ef".to_vec()),
            }
        );
        let f = Filter::parse("(cn=*mid*)").unwrap();
        assert_eq!(
            f,
            Filter::Substrings {
                attribute: "cn".to_string(),
                initial: None,
                any: vec![b"mid".to_vec()],
                final_: None,
            }
        );
    }

    #[test]
    fn parse_comparisons() {
        assert!(matches!(
            Filter::parse("(age>=21)").unwrap(),
            Filter::GreaterOrEqual { .. }
        ));
        assert!(matches!(
            Filter::parse("(age<=65)").unwrap(),
            Filter::LessOrEqual { .. }
        ));
        assert!(matches!(
            Filter::parse("(cn~=smith)").unwrap(),
            Filter::Approx { .. }
        ));
    }

    #[test]
    fn parse_extensible() {
        let f = Filter::parse("(cn:dn:2.5.13.5:=John)").unwrap();
        assert_eq!(
            f,
            Filter::Extensible {
                matching_rule: Some("2.5.13.5".to_string()),
                attribute: Some("cn".to_string()),
                value: b"John".to_vec(),
                dn_attributes: true,
            }
        );
    }

    #[test]
    fn parse_escapes() {
        let f = Filter::parse(r"(cn=a\2ab)").unwrap();
        assert_eq!(f, Filter::equality("cn", "a*b"));
        let f = Filter::parse(r"(cn=par\28en\29s)").unwrap();
        assert_eq!(f, Filter::equality("cn", "par(en)s"));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(Filter::parse("cn=foo").is_err());
        assert!(Filter::parse("(cn=foo").is_err());
        assert!(Filter::parse("(&)").is_err());
        assert!(Filter::parse("(cn=foo)x").is_err());
        assert!(Filter::parse(r"(cn=a\zz)").is_err());
        assert!(Filter::parse("(cn>=a*b)").is_err());
    }

    #[test]
    fn render_escapes_specials() {
        let f = Filter::equality("cn", "a*b(c)d\\e");
        assert_eq!(f.to_string(), r"(cn=a\2ab\28c\29d\5ce)");
    }

    #[test]
    fn render_round_trips() {
        for input in [
            "(cn=foo)",
            "(objectClass=*)",
            "(&(a=1)(b=2))",
            "(|(a=1)(!(b=2)))",
            "(cn=ab*cd*ef)",
            "(age>=21)",
            "(sn~=smith)",
        ] {
            assert_eq!(parse_render(input), input);
        }
    }

    #[test]
    fn ber_round_trips() {
        for input in [
            "(cn=foo)",
            "(objectClass=*)",
            "(&(objectClass=person)(|(cn=a*)(sn=*b))(!(uid<=9)))",
            "(cn:dn:2.5.13.5:=John)",
        ] {
            let filter = Filter::parse(input).unwrap();
            let mut w = BerWriter::new();
            filter.encode(&mut w);
            let bytes = w.into_vec();
            let mut r = BerReader::new(&bytes);
            let decoded = Filter::decode(&mut r).unwrap();
            assert!(r.is_empty());
            assert_eq!(decoded, filter);
        }
    }
}
