//! Minimal pull tokenizer over `quick-xml`, shared by the LLSD and
//! XML-RPC codecs. Both formats are element-only documents, so
//! declarations, comments and whitespace between elements are skipped.

use quick_xml::{events::Event, Reader};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Token {
    Open(String),
    Close(String),
    /// Self-closing element such as `<undef/>`.
    Empty(String),
    Text(String),
}

pub(crate) struct Tokens<'a> {
    reader: Reader<&'a [u8]>,
}

impl<'a> Tokens<'a> {
    pub fn new(text: &'a str) -> Self {
        Self {
            reader: Reader::from_str(text),
        }
    }

    fn raw(&mut self) -> Result<Option<Token>, String> {
        loop {
            let event = self.reader.read_event().map_err(|e| e.to_string())?;
            let token = match event {
                Event::Start(start) => Token::Open(name(start.name().as_ref())),
                Event::End(end) => Token::Close(name(end.name().as_ref())),
                Event::Empty(start) => Token::Empty(name(start.name().as_ref())),
                Event::Text(text) => Token::Text(text.unescape().map_err(|e| e.to_string())?.into_owned()),
                Event::CData(data) => Token::Text(String::from_utf8_lossy(&data).into_owned()),
                Event::Eof => return Ok(None),
                _ => continue,
            };
            return Ok(Some(token));
        }
    }

    /// Next structural token; whitespace-only text is skipped.
    pub fn next(&mut self) -> Result<Option<Token>, String> {
        loop {
            match self.raw()? {
                Some(Token::Text(text)) if text.trim().is_empty() => continue,
                other => return Ok(other),
            }
        }
    }

    /// Collects the text content of the element named `element`,
    /// consuming its closing tag.
    pub fn text_until_close(&mut self, element: &str) -> Result<String, String> {
        let mut content = String::new();
        loop {
            match self.raw()? {
                Some(Token::Text(text)) => content.push_str(&text),
                Some(Token::Close(closed)) if closed == element => return Ok(content),
                Some(other) => return Err(format!("unexpected {other:?} inside <{element}>")),
                None => return Err(format!("document ended inside <{element}>")),
            }
        }
    }
}

fn name(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).into_owned()
}

/// Escapes text for use as element content.
pub(crate) fn escape(text: &str) -> String {
    quick_xml::escape::escape(text).into_owned()
}
