//! LLSD documents in their XML serialization, as carried by
//! capability requests and responses and by LLSD logins.

use crate::xml::{self, Token, Tokens};
use base64::{engine::general_purpose::STANDARD, Engine};
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum LlsdError {
    #[error("malformed xml: {0}")]
    Xml(String),
    #[error("document is not utf-8")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("missing <llsd> root element")]
    MissingRoot,
    #[error("unexpected element <{0}>")]
    UnexpectedElement(String),
    #[error("invalid {kind} value {value:?}")]
    InvalidValue { kind: &'static str, value: String },
    #[error("document ended early")]
    Truncated,
}

impl From<String> for LlsdError {
    fn from(message: String) -> Self {
        LlsdError::Xml(message)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum Llsd {
    #[default]
    Undefined,
    Boolean(bool),
    Integer(i32),
    Real(f64),
    String(String),
    Uuid(Uuid),
    /// ISO 8601 text, kept as sent.
    Date(String),
    Uri(String),
    Binary(Vec<u8>),
    Map(BTreeMap<String, Llsd>),
    Array(Vec<Llsd>),
}

impl Llsd {
    pub fn from_xml(bytes: &[u8]) -> Result<Self, LlsdError> {
        let text = std::str::from_utf8(bytes)?;
        let mut tokens = Tokens::new(text);
        match tokens.next()? {
            Some(Token::Open(name)) if name == "llsd" => {}
            Some(Token::Empty(name)) if name == "llsd" => return Ok(Llsd::Undefined),
            _ => return Err(LlsdError::MissingRoot),
        }
        match tokens.next()? {
            Some(Token::Close(name)) if name == "llsd" => Ok(Llsd::Undefined),
            Some(token) => {
                let value = parse_value(&mut tokens, token)?;
                match tokens.next()? {
                    Some(Token::Close(name)) if name == "llsd" => Ok(value),
                    Some(other) => Err(unexpected(other)),
                    None => Err(LlsdError::Truncated),
                }
            }
            None => Err(LlsdError::Truncated),
        }
    }

    pub fn to_xml(&self) -> String {
        let mut out = String::from(r#"<?xml version="1.0" encoding="UTF-8"?><llsd>"#);
        self.write_xml(&mut out);
        out.push_str("</llsd>");
        out
    }

    fn write_xml(&self, out: &mut String) {
        match self {
            Llsd::Undefined => out.push_str("<undef />"),
            Llsd::Boolean(value) => {
                out.push_str(if *value { "<boolean>1</boolean>" } else { "<boolean>0</boolean>" })
            }
            Llsd::Integer(value) => out.push_str(&format!("<integer>{value}</integer>")),
            Llsd::Real(value) => out.push_str(&format!("<real>{value}</real>")),
            Llsd::String(value) => leaf(out, "string", &xml::escape(value)),
            Llsd::Uuid(value) => leaf(out, "uuid", &value.to_string()),
            Llsd::Date(value) => leaf(out, "date", &xml::escape(value)),
            Llsd::Uri(value) => leaf(out, "uri", &xml::escape(value)),
            Llsd::Binary(value) => {
                out.push_str(r#"<binary encoding="base64">"#);
                out.push_str(&STANDARD.encode(value));
                out.push_str("</binary>");
            }
            Llsd::Map(map) => {
                out.push_str("<map>");
                for (key, value) in map {
                    leaf(out, "key", &xml::escape(key));
                    value.write_xml(out);
                }
                out.push_str("</map>");
            }
            Llsd::Array(items) => {
                out.push_str("<array>");
                for item in items {
                    item.write_xml(out);
                }
                out.push_str("</array>");
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&Llsd> {
        match self {
            Llsd::Map(map) => map.get(key),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Llsd> {
        match self {
            Llsd::Map(map) => map.get_mut(key),
            _ => None,
        }
    }

    pub fn index_mut(&mut self, index: usize) -> Option<&mut Llsd> {
        match self {
            Llsd::Array(items) => items.get_mut(index),
            _ => None,
        }
    }

    /// Text of a string or URI value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Llsd::String(text) | Llsd::Uri(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i32> {
        match self {
            Llsd::Integer(value) => Some(*value),
            Llsd::Real(value) => Some(*value as i32),
            Llsd::String(text) => text.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_binary(&self) -> Option<&[u8]> {
        match self {
            Llsd::Binary(bytes) => Some(bytes),
            _ => None,
        }
    }
}

fn leaf(out: &mut String, element: &str, escaped: &str) {
    out.push('<');
    out.push_str(element);
    out.push('>');
    out.push_str(escaped);
    out.push_str("</");
    out.push_str(element);
    out.push('>');
}

fn unexpected(token: Token) -> LlsdError {
    match token {
        Token::Open(name) | Token::Empty(name) | Token::Close(name) => {
            LlsdError::UnexpectedElement(name)
        }
        Token::Text(text) => LlsdError::InvalidValue {
            kind: "element",
            value: text,
        },
    }
}

fn parse_value(tokens: &mut Tokens, token: Token) -> Result<Llsd, LlsdError> {
    let name = match token {
        Token::Empty(name) => return empty_value(name),
        Token::Open(name) => name,
        other => return Err(unexpected(other)),
    };

    match name.as_str() {
        "map" => {
            let mut map = BTreeMap::new();
            loop {
                match tokens.next()?.ok_or(LlsdError::Truncated)? {
                    Token::Close(closed) if closed == "map" => return Ok(Llsd::Map(map)),
                    Token::Open(key) if key == "key" => {
                        let key = tokens.text_until_close("key")?;
                        let token = tokens.next()?.ok_or(LlsdError::Truncated)?;
                        map.insert(key, parse_value(tokens, token)?);
                    }
                    Token::Empty(key) if key == "key" => {
                        let token = tokens.next()?.ok_or(LlsdError::Truncated)?;
                        map.insert(String::new(), parse_value(tokens, token)?);
                    }
                    other => return Err(unexpected(other)),
                }
            }
        }
        "array" => {
            let mut items = Vec::new();
            loop {
                match tokens.next()?.ok_or(LlsdError::Truncated)? {
                    Token::Close(closed) if closed == "array" => return Ok(Llsd::Array(items)),
                    token => items.push(parse_value(tokens, token)?),
                }
            }
        }
        "undef" => {
            tokens.text_until_close("undef")?;
            Ok(Llsd::Undefined)
        }
        _ => {
            let text = tokens.text_until_close(&name)?;
            scalar(&name, text)
        }
    }
}

fn empty_value(name: String) -> Result<Llsd, LlsdError> {
    match name.as_str() {
        "map" => Ok(Llsd::Map(BTreeMap::new())),
        "array" => Ok(Llsd::Array(Vec::new())),
        "undef" => Ok(Llsd::Undefined),
        _ => scalar(&name, String::new()),
    }
}

fn scalar(element: &str, text: String) -> Result<Llsd, LlsdError> {
    let invalid = |kind: &'static str, value: &str| LlsdError::InvalidValue {
        kind,
        value: value.to_owned(),
    };
    let trimmed = text.trim();
    Ok(match element {
        "boolean" => match trimmed {
            "" | "0" | "false" => Llsd::Boolean(false),
            "1" | "true" => Llsd::Boolean(true),
            other => return Err(invalid("boolean", other)),
        },
        "integer" if trimmed.is_empty() => Llsd::Integer(0),
        "integer" => Llsd::Integer(trimmed.parse().map_err(|_| invalid("integer", trimmed))?),
        "real" if trimmed.is_empty() => Llsd::Real(0.0),
        "real" => Llsd::Real(trimmed.parse().map_err(|_| invalid("real", trimmed))?),
        "uuid" if trimmed.is_empty() => Llsd::Uuid(Uuid::nil()),
        "uuid" => Llsd::Uuid(Uuid::parse_str(trimmed).map_err(|_| invalid("uuid", trimmed))?),
        "binary" => Llsd::Binary(
            STANDARD
                .decode(trimmed.split_whitespace().collect::<String>())
                .map_err(|_| invalid("binary", trimmed))?,
        ),
        "string" => Llsd::String(text),
        "date" => Llsd::Date(text),
        "uri" => Llsd::Uri(text),
        other => return Err(LlsdError::UnexpectedElement(other.to_owned())),
    })
}
