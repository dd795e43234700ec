//! Just enough XML-RPC for the login exchange: one method call in,
//! one method response out.

use crate::xml::{self, Token, Tokens};
use base64::{engine::general_purpose::STANDARD, Engine};

#[derive(Debug, thiserror::Error)]
pub enum XmlRpcError {
    #[error("malformed xml: {0}")]
    Xml(String),
    #[error("document is not utf-8")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("unexpected element <{0}>")]
    UnexpectedElement(String),
    #[error("invalid {kind} value {value:?}")]
    InvalidValue { kind: &'static str, value: String },
    #[error("document ended early")]
    Truncated,
}

impl From<String> for XmlRpcError {
    fn from(message: String) -> Self {
        XmlRpcError::Xml(message)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i32),
    Boolean(bool),
    String(String),
    Double(f64),
    DateTime(String),
    Base64(Vec<u8>),
    /// Members in document order.
    Struct(Vec<(String, Value)>),
    Array(Vec<Value>),
}

impl Value {
    pub fn member(&self, name: &str) -> Option<&Value> {
        match self {
            Value::Struct(members) => members
                .iter()
                .find(|(member, _)| member == name)
                .map(|(_, value)| value),
            _ => None,
        }
    }

    /// Replaces the member `name`, appending it if absent.
    pub fn set_member(&mut self, name: &str, value: Value) {
        if let Value::Struct(members) = self {
            match members.iter_mut().find(|(member, _)| member == name) {
                Some((_, existing)) => *existing = value,
                None => members.push((name.to_owned(), value)),
            }
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            Value::Int(value) => Some(*value),
            Value::String(text) => text.trim().parse().ok(),
            _ => None,
        }
    }

    fn write_xml(&self, out: &mut String) {
        out.push_str("<value>");
        match self {
            Value::Int(value) => out.push_str(&format!("<i4>{value}</i4>")),
            Value::Boolean(value) => {
                out.push_str(if *value { "<boolean>1</boolean>" } else { "<boolean>0</boolean>" })
            }
            Value::String(text) => {
                out.push_str("<string>");
                out.push_str(&xml::escape(text));
                out.push_str("</string>");
            }
            Value::Double(value) => out.push_str(&format!("<double>{value}</double>")),
            Value::DateTime(text) => {
                out.push_str("<dateTime.iso8601>");
                out.push_str(&xml::escape(text));
                out.push_str("</dateTime.iso8601>");
            }
            Value::Base64(bytes) => {
                out.push_str("<base64>");
                out.push_str(&STANDARD.encode(bytes));
                out.push_str("</base64>");
            }
            Value::Struct(members) => {
                out.push_str("<struct>");
                for (name, value) in members {
                    out.push_str("<member><name>");
                    out.push_str(&xml::escape(name));
                    out.push_str("</name>");
                    value.write_xml(out);
                    out.push_str("</member>");
                }
                out.push_str("</struct>");
            }
            Value::Array(items) => {
                out.push_str("<array><data>");
                for item in items {
                    item.write_xml(out);
                }
                out.push_str("</data></array>");
            }
        }
        out.push_str("</value>");
    }
}

/// A client's `methodCall`, e.g. `login_to_simulator`.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodCall {
    pub method: String,
    pub params: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MethodResponse {
    Success(Vec<Value>),
    Fault(Value),
}

impl MethodCall {
    pub fn parse(bytes: &[u8]) -> Result<Self, XmlRpcError> {
        let text = std::str::from_utf8(bytes)?;
        let mut tokens = Tokens::new(text);
        expect_open(&mut tokens, "methodCall")?;
        expect_open(&mut tokens, "methodName")?;
        let method = tokens.text_until_close("methodName")?.trim().to_owned();

        let mut params = Vec::new();
        match next(&mut tokens)? {
            Token::Open(name) if name == "params" => {
                params = parse_params(&mut tokens)?;
                expect_close(&mut tokens, "methodCall")?;
            }
            Token::Empty(name) if name == "params" => expect_close(&mut tokens, "methodCall")?,
            Token::Close(name) if name == "methodCall" => {}
            other => return Err(unexpected(other)),
        }
        Ok(Self { method, params })
    }

    pub fn to_xml(&self) -> String {
        let mut out = String::from(r#"<?xml version="1.0"?><methodCall><methodName>"#);
        out.push_str(&xml::escape(&self.method));
        out.push_str("</methodName>");
        write_params(&self.params, &mut out);
        out.push_str("</methodCall>");
        out
    }
}

impl MethodResponse {
    pub fn parse(bytes: &[u8]) -> Result<Self, XmlRpcError> {
        let text = std::str::from_utf8(bytes)?;
        let mut tokens = Tokens::new(text);
        expect_open(&mut tokens, "methodResponse")?;
        let response = match next(&mut tokens)? {
            Token::Open(name) if name == "params" => MethodResponse::Success(parse_params(&mut tokens)?),
            Token::Empty(name) if name == "params" => MethodResponse::Success(Vec::new()),
            Token::Open(name) if name == "fault" => {
                let token = next(&mut tokens)?;
                let fault = parse_value(&mut tokens, token)?;
                expect_close(&mut tokens, "fault")?;
                MethodResponse::Fault(fault)
            }
            other => return Err(unexpected(other)),
        };
        expect_close(&mut tokens, "methodResponse")?;
        Ok(response)
    }

    pub fn to_xml(&self) -> String {
        let mut out = String::from(r#"<?xml version="1.0"?><methodResponse>"#);
        match self {
            MethodResponse::Success(params) => write_params(params, &mut out),
            MethodResponse::Fault(fault) => {
                out.push_str("<fault>");
                fault.write_xml(&mut out);
                out.push_str("</fault>");
            }
        }
        out.push_str("</methodResponse>");
        out
    }

    /// The struct a login reply carries as its single parameter.
    pub fn login_struct_mut(&mut self) -> Option<&mut Value> {
        match self {
            MethodResponse::Success(params) => params
                .first_mut()
                .filter(|value| matches!(value, Value::Struct(_))),
            MethodResponse::Fault(_) => None,
        }
    }
}

fn write_params(params: &[Value], out: &mut String) {
    out.push_str("<params>");
    for param in params {
        out.push_str("<param>");
        param.write_xml(out);
        out.push_str("</param>");
    }
    out.push_str("</params>");
}

fn next(tokens: &mut Tokens) -> Result<Token, XmlRpcError> {
    tokens.next()?.ok_or(XmlRpcError::Truncated)
}

fn unexpected(token: Token) -> XmlRpcError {
    match token {
        Token::Open(name) | Token::Close(name) | Token::Empty(name) => {
            XmlRpcError::UnexpectedElement(name)
        }
        Token::Text(text) => XmlRpcError::InvalidValue {
            kind: "element",
            value: text,
        },
    }
}

fn expect_open(tokens: &mut Tokens, element: &str) -> Result<(), XmlRpcError> {
    match next(tokens)? {
        Token::Open(name) if name == element => Ok(()),
        other => Err(unexpected(other)),
    }
}

fn expect_close(tokens: &mut Tokens, element: &str) -> Result<(), XmlRpcError> {
    match next(tokens)? {
        Token::Close(name) if name == element => Ok(()),
        other => Err(unexpected(other)),
    }
}

/// Parses `<param><value>..</value></param>` entries up to `</params>`.
fn parse_params(tokens: &mut Tokens) -> Result<Vec<Value>, XmlRpcError> {
    let mut params = Vec::new();
    loop {
        match next(tokens)? {
            Token::Close(name) if name == "params" => return Ok(params),
            Token::Open(name) if name == "param" => {
                let token = next(tokens)?;
                params.push(parse_value(tokens, token)?);
                expect_close(tokens, "param")?;
            }
            other => return Err(unexpected(other)),
        }
    }
}

/// Parses a `<value>` element whose opening token is `token`.
fn parse_value(tokens: &mut Tokens, token: Token) -> Result<Value, XmlRpcError> {
    match token {
        Token::Open(name) if name == "value" => {}
        Token::Empty(name) if name == "value" => return Ok(Value::String(String::new())),
        other => return Err(unexpected(other)),
    }

    // A bare `<value>text</value>` is a string.
    let mut bare = String::new();
    let value = loop {
        match next(tokens)? {
            Token::Text(text) => bare.push_str(&text),
            Token::Close(name) if name == "value" => return Ok(Value::String(bare)),
            Token::Open(name) => break typed_value(tokens, &name)?,
            Token::Empty(name) => break scalar(&name, String::new())?,
            other => return Err(unexpected(other)),
        }
    };
    expect_close(tokens, "value")?;
    Ok(value)
}

fn typed_value(tokens: &mut Tokens, element: &str) -> Result<Value, XmlRpcError> {
    match element {
        "struct" => {
            let mut members = Vec::new();
            loop {
                match next(tokens)? {
                    Token::Close(name) if name == "struct" => return Ok(Value::Struct(members)),
                    Token::Open(name) if name == "member" => {
                        expect_open(tokens, "name")?;
                        let member = tokens.text_until_close("name")?;
                        let token = next(tokens)?;
                        let value = parse_value(tokens, token)?;
                        expect_close(tokens, "member")?;
                        members.push((member, value));
                    }
                    other => return Err(unexpected(other)),
                }
            }
        }
        "array" => {
            let mut items = Vec::new();
            match next(tokens)? {
                Token::Open(name) if name == "data" => loop {
                    match next(tokens)? {
                        Token::Close(name) if name == "data" => break,
                        token => items.push(parse_value(tokens, token)?),
                    }
                },
                Token::Empty(name) if name == "data" => {}
                other => return Err(unexpected(other)),
            }
            expect_close(tokens, "array")?;
            Ok(Value::Array(items))
        }
        _ => {
            let text = tokens.text_until_close(element)?;
            scalar(element, text)
        }
    }
}

fn scalar(element: &str, text: String) -> Result<Value, XmlRpcError> {
    let invalid = |kind: &'static str, value: &str| XmlRpcError::InvalidValue {
        kind,
        value: value.to_owned(),
    };
    let trimmed = text.trim();
    Ok(match element {
        "i4" | "int" => Value::Int(trimmed.parse().map_err(|_| invalid("int", trimmed))?),
        "boolean" => match trimmed {
            "1" | "true" => Value::Boolean(true),
            "0" | "false" | "" => Value::Boolean(false),
            other => return Err(invalid("boolean", other)),
        },
        "double" => Value::Double(trimmed.parse().map_err(|_| invalid("double", trimmed))?),
        "dateTime.iso8601" => Value::DateTime(text),
        "base64" => Value::Base64(
            STANDARD
                .decode(trimmed.split_whitespace().collect::<String>())
                .map_err(|_| invalid("base64", trimmed))?,
        ),
        "string" => Value::String(text),
        other => return Err(XmlRpcError::UnexpectedElement(other.to_owned())),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOGIN_REPLY: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
        <methodResponse><params><param><value><struct>
          <member><name>login</name><value><string>true</string></value></member>
          <member><name>sim_ip</name><value><string>10.0.0.5</string></value></member>
          <member><name>sim_port</name><value><i4>13000</i4></value></member>
          <member><name>seed_capability</name><value>https://sim/cap/0</value></member>
          <member><name>inventory-root</name><value><array><data>
            <value><struct><member><name>folder_id</name><value><string>x</string></value></member></struct></value>
          </data></array></value></member>
        </struct></value></param></params></methodResponse>"#;

    #[test]
    fn parses_login_reply() {
        let mut response = MethodResponse::parse(LOGIN_REPLY.as_bytes()).unwrap();
        let login = response.login_struct_mut().unwrap();
        assert_eq!(login.member("sim_ip").and_then(Value::as_str), Some("10.0.0.5"));
        assert_eq!(login.member("sim_port").and_then(Value::as_int), Some(13000));
        assert_eq!(
            login.member("seed_capability").and_then(Value::as_str),
            Some("https://sim/cap/0")
        );
        assert!(matches!(login.member("inventory-root"), Some(Value::Array(items)) if items.len() == 1));
    }

    #[test]
    fn rewritten_reply_serializes_back() {
        let mut response = MethodResponse::parse(LOGIN_REPLY.as_bytes()).unwrap();
        let login = response.login_struct_mut().unwrap();
        login.set_member("sim_port", Value::Int(40000));
        login.set_member("message", Value::String("a < b".to_owned()));

        let reparsed = MethodResponse::parse(response.to_xml().as_bytes()).unwrap();
        assert_eq!(reparsed, response);
    }

    #[test]
    fn parses_method_call_and_fault() {
        let call = MethodCall::parse(
            br#"<?xml version="1.0"?><methodCall><methodName>login_to_simulator</methodName>
                <params><param><value><struct>
                  <member><name>first</name><value><string>Test</string></value></member>
                </struct></value></param></params></methodCall>"#,
        )
        .unwrap();
        assert_eq!(call.method, "login_to_simulator");
        assert_eq!(call.params[0].member("first").and_then(Value::as_str), Some("Test"));
        assert_eq!(MethodCall::parse(call.to_xml().as_bytes()).unwrap(), call);

        let fault = MethodResponse::parse(
            br#"<methodResponse><fault><value><struct>
                  <member><name>faultCode</name><value><int>4</int></value></member>
                </struct></value></fault></methodResponse>"#,
        )
        .unwrap();
        assert!(matches!(fault, MethodResponse::Fault(_)));
    }
}
