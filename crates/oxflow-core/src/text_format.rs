// Structured Text - schema-driven textual encoding for boundary messages
//
// Every structured payload that crosses the boundary between the front end
// and the engine (op configs, placements, shapes, optional ints, job sets,
// error statuses) travels as text in this format:
//
//   name: "conv1"
//   parallel_conf {
//     device_tag: "gpu"
//     device_name: "0:0-3"
//   }
//   batch_axis { value: 0 }
//
// Scalars are `field: value`, nested messages are `field { ... }`, repeated
// fields repeat the field name. Strings are double quoted, enum values and
// booleans are bare identifiers, `#` starts a line comment and `,` / `;`
// are accepted as separators.
//
// COMPONENTS:
//
//   TextValue    - one field value (int, float, string, identifier, message)
//   TextNode     - an ordered list of fields, the parsed form of a message
//   TextMessage  - implemented by every schema type (to_node / from_node)
//   parse()      - lexer + recursive-descent parser, errors carry line numbers
//
// Optional integers are encoded as a nested `{ value: N }` message and are
// omitted when unset, so "unset" and "zero" stay distinguishable.

use std::fmt;
use std::iter::Peekable;
use std::str::Chars;

use crate::error::{Error, Result};

/// A single field value.
#[derive(Debug, Clone, PartialEq)]
pub enum TextValue {
    Int(i64),
    Float(f64),
    Str(String),
    /// Enum value or boolean literal.
    Ident(String),
    Message(TextNode),
}

impl TextValue {
    fn type_name(&self) -> &'static str {
        match self {
            TextValue::Int(_) => "int",
            TextValue::Float(_) => "float",
            TextValue::Str(_) => "string",
            TextValue::Ident(_) => "identifier",
            TextValue::Message(_) => "message",
        }
    }
}

/// Parsed form of one message: fields in declaration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TextNode {
    fields: Vec<(String, TextValue)>,
}

/// Types that have a structured-text encoding.
pub trait TextMessage: Sized {
    fn to_node(&self) -> TextNode;

    fn from_node(node: &TextNode) -> Result<Self>;

    fn to_text(&self) -> String {
        self.to_node().to_string()
    }

    fn from_text(text: &str) -> Result<Self> {
        Self::from_node(&parse(text)?)
    }
}

impl TextNode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fields(&self) -> &[(String, TextValue)] {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    // Writers

    pub fn push(&mut self, name: &str, value: TextValue) -> &mut Self {
        self.fields.push((name.to_string(), value));
        self
    }

    pub fn int(&mut self, name: &str, v: i64) -> &mut Self {
        self.push(name, TextValue::Int(v))
    }

    pub fn float(&mut self, name: &str, v: f64) -> &mut Self {
        self.push(name, TextValue::Float(v))
    }

    pub fn bool(&mut self, name: &str, v: bool) -> &mut Self {
        self.push(name, TextValue::Ident(if v { "true" } else { "false" }.to_string()))
    }

    pub fn str(&mut self, name: &str, v: &str) -> &mut Self {
        self.push(name, TextValue::Str(v.to_string()))
    }

    pub fn ident(&mut self, name: &str, v: &str) -> &mut Self {
        self.push(name, TextValue::Ident(v.to_string()))
    }

    pub fn message(&mut self, name: &str, node: TextNode) -> &mut Self {
        self.push(name, TextValue::Message(node))
    }

    pub fn set_ints(&mut self, name: &str, values: impl IntoIterator<Item = i64>) -> &mut Self {
        for v in values {
            self.int(name, v);
        }
        self
    }

    /// Write an optional integer as `name { value: N }`; nothing when unset.
    pub fn set_opt_int(&mut self, name: &str, v: Option<i64>) -> &mut Self {
        if let Some(v) = v {
            let mut inner = TextNode::new();
            inner.int("value", v);
            self.message(name, inner);
        }
        self
    }

    // Readers

    pub fn has(&self, name: &str) -> bool {
        self.fields.iter().any(|(n, _)| n == name)
    }

    /// Last value of a field (singular fields: last one wins).
    pub fn get(&self, name: &str) -> Option<&TextValue> {
        self.fields
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    /// All values of a repeated field, in order.
    pub fn all<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a TextValue> + 'a {
        let name = name.to_string();
        self.fields
            .iter()
            .filter(move |(n, _)| *n == name)
            .map(|(_, v)| v)
    }

    pub fn get_int(&self, name: &str) -> Result<Option<i64>> {
        match self.get(name) {
            None => Ok(None),
            Some(TextValue::Int(v)) => Ok(Some(*v)),
            Some(other) => Err(mistyped(name, "int", other)),
        }
    }

    pub fn req_int(&self, name: &str) -> Result<i64> {
        self.get_int(name)?.ok_or_else(|| missing(name))
    }

    pub fn int_or(&self, name: &str, default: i64) -> Result<i64> {
        Ok(self.get_int(name)?.unwrap_or(default))
    }

    pub fn get_float(&self, name: &str) -> Result<Option<f64>> {
        match self.get(name) {
            None => Ok(None),
            Some(TextValue::Float(v)) => Ok(Some(*v)),
            Some(TextValue::Int(v)) => Ok(Some(*v as f64)),
            Some(other) => Err(mistyped(name, "float", other)),
        }
    }

    pub fn get_str(&self, name: &str) -> Result<Option<&str>> {
        match self.get(name) {
            None => Ok(None),
            Some(TextValue::Str(s)) => Ok(Some(s.as_str())),
            Some(other) => Err(mistyped(name, "string", other)),
        }
    }

    pub fn req_str(&self, name: &str) -> Result<String> {
        self.get_str(name)?
            .map(str::to_string)
            .ok_or_else(|| missing(name))
    }

    pub fn str_or(&self, name: &str, default: &str) -> Result<String> {
        Ok(self.get_str(name)?.unwrap_or(default).to_string())
    }

    pub fn get_ident(&self, name: &str) -> Result<Option<&str>> {
        match self.get(name) {
            None => Ok(None),
            Some(TextValue::Ident(s)) => Ok(Some(s.as_str())),
            Some(other) => Err(mistyped(name, "identifier", other)),
        }
    }

    pub fn req_ident(&self, name: &str) -> Result<&str> {
        self.get_ident(name)?.ok_or_else(|| missing(name))
    }

    pub fn bool_or(&self, name: &str, default: bool) -> Result<bool> {
        match self.get(name) {
            None => Ok(default),
            Some(TextValue::Ident(s)) if s == "true" => Ok(true),
            Some(TextValue::Ident(s)) if s == "false" => Ok(false),
            Some(TextValue::Int(0)) => Ok(false),
            Some(TextValue::Int(1)) => Ok(true),
            Some(other) => Err(mistyped(name, "bool", other)),
        }
    }

    pub fn get_message(&self, name: &str) -> Result<Option<&TextNode>> {
        match self.get(name) {
            None => Ok(None),
            Some(TextValue::Message(m)) => Ok(Some(m)),
            Some(other) => Err(mistyped(name, "message", other)),
        }
    }

    pub fn req_message(&self, name: &str) -> Result<&TextNode> {
        self.get_message(name)?.ok_or_else(|| missing(name))
    }

    pub fn messages(&self, name: &str) -> Result<Vec<&TextNode>> {
        self.all(name)
            .map(|v| match v {
                TextValue::Message(m) => Ok(m),
                other => Err(mistyped(name, "message", other)),
            })
            .collect()
    }

    pub fn ints(&self, name: &str) -> Result<Vec<i64>> {
        self.all(name)
            .map(|v| match v {
                TextValue::Int(i) => Ok(*i),
                other => Err(mistyped(name, "int", other)),
            })
            .collect()
    }

    pub fn strs(&self, name: &str) -> Result<Vec<String>> {
        self.all(name)
            .map(|v| match v {
                TextValue::Str(s) => Ok(s.clone()),
                other => Err(mistyped(name, "string", other)),
            })
            .collect()
    }

    /// Read `name { value: N }`. An absent field, or one present without
    /// `value` (a cleared optional), both decode to `None`.
    pub fn opt_int(&self, name: &str) -> Result<Option<i64>> {
        match self.get_message(name)? {
            None => Ok(None),
            Some(inner) => inner.get_int("value"),
        }
    }

    fn write_indented(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        let pad = "  ".repeat(depth);
        for (name, value) in &self.fields {
            match value {
                TextValue::Message(m) => {
                    writeln!(f, "{pad}{name} {{")?;
                    m.write_indented(f, depth + 1)?;
                    writeln!(f, "{pad}}}")?;
                }
                TextValue::Int(v) => writeln!(f, "{pad}{name}: {v}")?,
                TextValue::Float(v) => writeln!(f, "{pad}{name}: {v:?}")?,
                TextValue::Str(s) => writeln!(f, "{pad}{name}: \"{}\"", escape(s))?,
                TextValue::Ident(s) => writeln!(f, "{pad}{name}: {s}")?,
            }
        }
        Ok(())
    }
}

impl fmt::Display for TextNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_indented(f, 0)
    }
}

fn missing(field: &str) -> Error {
    Error::schema(field, "required field is missing")
}

fn mistyped(field: &str, expected: &str, got: &TextValue) -> Error {
    Error::schema(
        field,
        format!("expected {expected}, found {}", got.type_name()),
    )
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out
}

// Lexer

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    Colon,
    LBrace,
    RBrace,
}

struct Lexer<'a> {
    chars: Peekable<Chars<'a>>,
    line: usize,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            chars: src.chars().peekable(),
            line: 1,
        }
    }

    fn err(&self, msg: impl Into<String>) -> Error {
        Error::Parse {
            line: self.line,
            msg: msg.into(),
        }
    }

    fn tokenize(mut self) -> Result<Vec<(Token, usize)>> {
        let mut out = Vec::new();
        while let Some(&c) = self.chars.peek() {
            match c {
                '\n' => {
                    self.line += 1;
                    self.chars.next();
                }
                c if c.is_whitespace() || c == ',' || c == ';' => {
                    self.chars.next();
                }
                '#' => {
                    while let Some(&c) = self.chars.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.chars.next();
                    }
                }
                ':' => {
                    self.chars.next();
                    out.push((Token::Colon, self.line));
                }
                '{' => {
                    self.chars.next();
                    out.push((Token::LBrace, self.line));
                }
                '}' => {
                    self.chars.next();
                    out.push((Token::RBrace, self.line));
                }
                '"' => {
                    self.chars.next();
                    let line = self.line;
                    let s = self.string()?;
                    out.push((Token::Str(s), line));
                }
                c if c == '-' || c.is_ascii_digit() => {
                    let tok = self.number()?;
                    out.push((tok, self.line));
                }
                c if c.is_ascii_alphabetic() || c == '_' => {
                    let mut ident = String::new();
                    while let Some(&c) = self.chars.peek() {
                        if c.is_ascii_alphanumeric() || c == '_' || c == '.' {
                            ident.push(c);
                            self.chars.next();
                        } else {
                            break;
                        }
                    }
                    out.push((Token::Ident(ident), self.line));
                }
                other => return Err(self.err(format!("unexpected character '{other}'"))),
            }
        }
        Ok(out)
    }

    fn string(&mut self) -> Result<String> {
        let mut s = String::new();
        loop {
            match self.chars.next() {
                None => return Err(self.err("unterminated string")),
                Some('"') => return Ok(s),
                Some('\\') => match self.chars.next() {
                    Some('n') => s.push('\n'),
                    Some('t') => s.push('\t'),
                    Some('"') => s.push('"'),
                    Some('\\') => s.push('\\'),
                    Some(c) => return Err(self.err(format!("unknown escape '\\{c}'"))),
                    None => return Err(self.err("unterminated string")),
                },
                Some('\n') => {
                    self.line += 1;
                    s.push('\n');
                }
                Some(c) => s.push(c),
            }
        }
    }

    fn number(&mut self) -> Result<Token> {
        let mut text = String::new();
        if self.chars.peek() == Some(&'-') {
            text.push('-');
            self.chars.next();
        }
        while let Some(&c) = self.chars.peek() {
            let exponent_sign =
                (c == '+' || c == '-') && matches!(text.chars().last(), Some('e') | Some('E'));
            if c.is_ascii_digit() || c == '.' || c == 'e' || c == 'E' || exponent_sign {
                text.push(c);
                self.chars.next();
            } else {
                break;
            }
        }
        if let Ok(v) = text.parse::<i64>() {
            return Ok(Token::Int(v));
        }
        text.parse::<f64>()
            .map(Token::Float)
            .map_err(|_| self.err(format!("invalid number '{text}'")))
    }
}

// Parser

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
}

impl Parser {
    fn last_line(&self) -> usize {
        self.tokens.last().map(|(_, l)| *l).unwrap_or(1)
    }

    fn fields(&mut self, nested: bool) -> Result<TextNode> {
        let mut node = TextNode::new();
        loop {
            let Some((tok, line)) = self.tokens.get(self.pos).cloned() else {
                if nested {
                    return Err(Error::Parse {
                        line: self.last_line(),
                        msg: "unexpected end of input, expected '}'".into(),
                    });
                }
                return Ok(node);
            };
            match tok {
                Token::RBrace if nested => {
                    self.pos += 1;
                    return Ok(node);
                }
                Token::Ident(name) => {
                    self.pos += 1;
                    let value = self.value(&name, line)?;
                    node.fields.push((name, value));
                }
                other => {
                    return Err(Error::Parse {
                        line,
                        msg: format!("expected field name, found {other:?}"),
                    })
                }
            }
        }
    }

    fn value(&mut self, name: &str, line: usize) -> Result<TextValue> {
        if matches!(self.tokens.get(self.pos), Some((Token::Colon, _))) {
            self.pos += 1;
        }
        let Some((tok, line)) = self.tokens.get(self.pos).cloned() else {
            return Err(Error::Parse {
                line,
                msg: format!("missing value for field '{name}'"),
            });
        };
        self.pos += 1;
        match tok {
            Token::LBrace => Ok(TextValue::Message(self.fields(true)?)),
            Token::Int(v) => Ok(TextValue::Int(v)),
            Token::Float(v) => Ok(TextValue::Float(v)),
            Token::Str(s) => Ok(TextValue::Str(s)),
            Token::Ident(s) => Ok(TextValue::Ident(s)),
            other => Err(Error::Parse {
                line,
                msg: format!("unexpected {other:?} after field '{name}'"),
            }),
        }
    }
}

/// Parse structured text into a [`TextNode`].
pub fn parse(src: &str) -> Result<TextNode> {
    let tokens = Lexer::new(src).tokenize()?;
    let mut parser = Parser { tokens, pos: 0 };
    parser.fields(false)
}

// Small wrapper messages used for boundary payloads

/// A list of int64 values (`value: 2 value: 3`), e.g. a static shape.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Int64List(pub Vec<i64>);

impl TextMessage for Int64List {
    fn to_node(&self) -> TextNode {
        let mut node = TextNode::new();
        node.set_ints("value", self.0.iter().copied());
        node
    }

    fn from_node(node: &TextNode) -> Result<Self> {
        Ok(Self(node.ints("value")?))
    }
}

/// An optional int64 (`value: N` or empty).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OptInt64(pub Option<i64>);

impl TextMessage for OptInt64 {
    fn to_node(&self) -> TextNode {
        let mut node = TextNode::new();
        if let Some(v) = self.0 {
            node.int("value", v);
        }
        node
    }

    fn from_node(node: &TextNode) -> Result<Self> {
        Ok(Self(node.get_int("value")?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_nested_and_repeated() {
        let node = parse(
            r#"
            name: "conv1"   # trailing comment
            parallel_conf {
              device_tag: "gpu"
              device_name: "0:0-3"
              device_name: "1:0"
            }
            dim: 2, dim: 3
            enabled: true
            "#,
        )
        .unwrap();
        assert_eq!(node.req_str("name").unwrap(), "conv1");
        let pc = node.req_message("parallel_conf").unwrap();
        assert_eq!(pc.strs("device_name").unwrap(), vec!["0:0-3", "1:0"]);
        assert_eq!(node.ints("dim").unwrap(), vec![2, 3]);
        assert!(node.bool_or("enabled", false).unwrap());
    }

    #[test]
    fn test_repeated_writers_and_readers() {
        let mut node = TextNode::new();
        node.set_ints("dim", [4, 5]).set_opt_int("axis", Some(1));
        for tag in ["a", "b"] {
            let mut entry = TextNode::new();
            entry.str("tag", tag);
            node.message("entry", entry);
        }
        let reparsed = parse(&node.to_string()).unwrap();
        assert_eq!(reparsed.ints("dim").unwrap(), vec![4, 5]);
        assert_eq!(reparsed.opt_int("axis").unwrap(), Some(1));
        let entries = {
            let field = String::from("entry");
            reparsed.messages(&field).unwrap()
        };
        let tags: Vec<String> = entries.iter().map(|e| e.req_str("tag").unwrap()).collect();
        assert_eq!(tags, vec!["a", "b"]);
    }

    #[test]
    fn test_print_then_parse_preserves_fields() {
        let mut inner = TextNode::new();
        inner.str("tag", "a \"quoted\"\nline").float("scale", 0.5);
        let mut node = TextNode::new();
        node.int("x", -7).message("inner", inner).ident("kind", "f32");
        let reparsed = parse(&node.to_string()).unwrap();
        assert_eq!(reparsed, node);
    }

    #[test]
    fn test_unset_optional_is_not_zero() {
        let mut node = TextNode::new();
        node.set_opt_int("batch_axis", None).set_opt_int("split_axis", Some(0));
        let reparsed = parse(&node.to_string()).unwrap();
        assert_eq!(reparsed.opt_int("batch_axis").unwrap(), None);
        assert_eq!(reparsed.opt_int("split_axis").unwrap(), Some(0));
        // A cleared optional (present but empty) also reads as unset.
        let cleared = parse("batch_axis { }").unwrap();
        assert_eq!(cleared.opt_int("batch_axis").unwrap(), None);
    }

    #[test]
    fn test_parse_errors_report_line() {
        let err = parse("a: 1\nb {\n c: 2\n").unwrap_err();
        assert!(matches!(err, Error::Parse { .. }));
        let err = parse("a: 1\n  @").unwrap_err();
        match err {
            Error::Parse { line, .. } => assert_eq!(line, 2),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_mistyped_field() {
        let node = parse("x: \"seven\"").unwrap();
        assert!(matches!(node.req_int("x"), Err(Error::Schema { .. })));
        assert!(matches!(node.req_int("y"), Err(Error::Schema { .. })));
    }

    #[test]
    fn test_wrapper_messages() {
        let list = Int64List(vec![2, 3]);
        assert_eq!(Int64List::from_text(&list.to_text()).unwrap(), list);
        assert_eq!(OptInt64::from_text("").unwrap(), OptInt64(None));
        assert_eq!(OptInt64::from_text("value: 0").unwrap(), OptInt64(Some(0)));
    }
}
