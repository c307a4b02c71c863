//! Parser for the `message_template.msg` text format
//!
//! ```text
//! version 2.0
//! {
//!     TestMessage Low 1 NotTrusted Zerocoded
//!     {
//!         TestBlock1 Single
//!         {   Test1   U32 }
//!     }
//!     {
//!         NeighborBlock Multiple 4
//!         {   Test0   U32 }
//!     }
//! }
//! ```
//!
//! Braces are tokens of their own, `//` starts a comment, and every other token
//! is whitespace separated. Errors carry the 1-based source line.

use super::template_registry::{
    BlockTemplate, Encoding, FieldTemplate, Frequency, MessageNumber, MessageTemplate, Occurrence, TrustLevel,
};
use super::{CodecError, CodecResult};
use crate::networking::packets::FieldType;
use std::iter::Peekable;
use std::sync::Arc;

/// Result of parsing a template file
#[derive(Debug, Clone)]
pub struct ParsedTemplate {
    pub version: Option<String>,
    pub messages: Vec<MessageTemplate>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Token<'a> {
    line: usize,
    text: &'a str,
}

fn tokenize(content: &str) -> Vec<Token<'_>> {
    let mut tokens = Vec::new();
    for (index, raw) in content.lines().enumerate() {
        let line = index + 1;
        let code = raw.split("//").next().unwrap_or_default();
        let mut start: Option<usize> = None;
        for (pos, ch) in code.char_indices() {
            let is_brace = ch == '{' || ch == '}';
            if ch.is_whitespace() || is_brace {
                if let Some(s) = start.take() {
                    tokens.push(Token { line, text: &code[s..pos] });
                }
                if is_brace {
                    tokens.push(Token { line, text: &code[pos..pos + 1] });
                }
            } else if start.is_none() {
                start = Some(pos);
            }
        }
        if let Some(s) = start {
            tokens.push(Token { line, text: &code[s..] });
        }
    }
    tokens
}

struct Parser<'a, I: Iterator<Item = Token<'a>>> {
    tokens: Peekable<I>,
    last_line: usize,
}

fn template_error(line: usize, reason: impl Into<String>) -> CodecError {
    CodecError::Template { line, reason: reason.into() }
}

/// Pin a layout error raised while building templates to its source line
fn at_line(line: usize, err: CodecError) -> CodecError {
    match err {
        CodecError::Template { reason, .. } => template_error(line, reason),
        other => other,
    }
}

impl<'a, I: Iterator<Item = Token<'a>>> Parser<'a, I> {
    fn next(&mut self, what: &str) -> CodecResult<Token<'a>> {
        let token = self
            .tokens
            .next()
            .ok_or_else(|| template_error(self.last_line, format!("unexpected end of input, expected {}", what)))?;
        self.last_line = token.line;
        Ok(token)
    }

    fn peek_text(&mut self) -> Option<&'a str> {
        self.tokens.peek().map(|t| t.text)
    }

    fn expect(&mut self, text: &str) -> CodecResult<()> {
        let token = self.next(&format!("'{}'", text))?;
        if token.text != text {
            return Err(template_error(token.line, format!("expected '{}', found '{}'", text, token.text)));
        }
        Ok(())
    }

    fn parse_file(&mut self) -> CodecResult<ParsedTemplate> {
        let mut version = None;
        if self.peek_text() == Some("version") {
            self.next("version")?;
            version = Some(self.next("version number")?.text.to_string());
        }

        let mut messages = Vec::new();
        while self.peek_text().is_some() {
            messages.push(self.parse_message()?);
        }
        Ok(ParsedTemplate { version, messages })
    }

    fn parse_message(&mut self) -> CodecResult<MessageTemplate> {
        self.expect("{")?;
        let name = self.next("message name")?;
        let line = name.line;

        let frequency = self
            .next("frequency")?
            .text
            .parse::<Frequency>()
            .map_err(|e| template_error(line, e))?;
        let number_token = self.next("message number")?;
        let raw_number = parse_number(number_token.text).map_err(|e| template_error(number_token.line, e))?;
        let number = MessageNumber::new(frequency, raw_number).map_err(|e| at_line(number_token.line, e))?;
        let trust = self
            .next("trust level")?
            .text
            .parse::<TrustLevel>()
            .map_err(|e| template_error(line, e))?;
        let encoding = self
            .next("encoding")?
            .text
            .parse::<Encoding>()
            .map_err(|e| template_error(line, e))?;

        // trailing flags such as UDPDeprecated run up to the first brace
        let mut flags = Vec::new();
        while let Some(text) = self.peek_text() {
            if text == "{" || text == "}" {
                break;
            }
            flags.push(self.next("flag")?.text.to_string());
        }

        let mut blocks = Vec::new();
        while self.peek_text() == Some("{") {
            blocks.push(Arc::new(self.parse_block()?));
        }
        self.expect("}")?;

        MessageTemplate::new(name.text, number, trust, encoding, flags, blocks).map_err(|e| at_line(line, e))
    }

    fn parse_block(&mut self) -> CodecResult<BlockTemplate> {
        self.expect("{")?;
        let name = self.next("block name")?;
        let occurrence_token = self.next("block occurrence")?;
        let occurrence = match occurrence_token.text {
            "Single" => Occurrence::Single,
            "Optional" => Occurrence::Optional,
            "Variable" => Occurrence::Variable,
            "Multiple" => {
                let count_token = self.next("repeat count")?;
                let count = count_token
                    .text
                    .parse::<u8>()
                    .map_err(|e| template_error(count_token.line, format!("invalid repeat count '{}': {}", count_token.text, e)))?;
                Occurrence::Multiple(count)
            }
            other => return Err(template_error(occurrence_token.line, format!("unknown block occurrence '{}'", other))),
        };

        let mut fields = Vec::new();
        while self.peek_text() == Some("{") {
            fields.push(self.parse_field()?);
        }
        self.expect("}")?;

        if let Some(duplicate) = fields
            .iter()
            .enumerate()
            .find(|(i, f)| fields[..*i].iter().any(|g| g.name == f.name))
            .map(|(_, f)| f.name.clone())
        {
            return Err(template_error(name.line, format!("duplicate field '{}' in block '{}'", duplicate, name.text)));
        }

        Ok(BlockTemplate { name: name.text.to_string(), occurrence, fields })
    }

    fn parse_field(&mut self) -> CodecResult<FieldTemplate> {
        self.expect("{")?;
        let name = self.next("field name")?;
        let keyword = self.next("field type")?;
        let size = if FieldType::takes_size(keyword.text) {
            Some(self.next("field size")?.text)
        } else {
            None
        };
        let field_type = FieldType::from_template(keyword.text, size).map_err(|e| template_error(keyword.line, e))?;
        self.expect("}")?;
        Ok(FieldTemplate { name: name.text.to_string(), field_type })
    }
}

fn parse_number(text: &str) -> Result<u32, String> {
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => text.parse::<u32>(),
    };
    parsed.map_err(|e| format!("invalid message number '{}': {}", text, e))
}

/// Parses the content of a message_template.msg file.
pub fn parse(content: &str) -> CodecResult<ParsedTemplate> {
    let mut parser = Parser { tokens: tokenize(content).into_iter().peekable(), last_line: 1 };
    parser.parse_file()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
version 2.0

// a comment line
{
    TestMessage Low 1 NotTrusted Zerocoded
    {
        TestBlock1      Single
        {   Test1       U32 }
    }
    {
        NeighborBlock   Multiple    4
        {   Test0       U32 }
        {   Test1       U32 }   // trailing comment
    }
}
{
    PacketAck Fixed 0xFFFFFFFB NotTrusted Unencoded
    {
        Packets Variable
        {   ID  U32 }
    }
}
{
    ChatFromViewer Low 80 NotTrusted Zerocoded UDPDeprecated
    {
        ChatData Single
        {   Message Variable 2 }
        {   Type    U8 }
        {   Channel S32 }
    }
    {
        Extra Optional
        {   Blob    Fixed 4 }
    }
}
"#;

    #[test]
    fn test_parse_sample() {
        let parsed = parse(SAMPLE).unwrap();
        assert_eq!(parsed.version.as_deref(), Some("2.0"));
        assert_eq!(parsed.messages.len(), 3);

        let test = &parsed.messages[0];
        assert_eq!(test.name, "TestMessage");
        assert_eq!(test.number, MessageNumber { frequency: Frequency::Low, id: 1 });
        assert_eq!(test.encoding, Encoding::Zerocoded);
        assert_eq!(test.blocks[1].occurrence, Occurrence::Multiple(4));
        assert_eq!(test.blocks[1].fields.len(), 2);

        let ack = &parsed.messages[1];
        assert_eq!(ack.number, MessageNumber { frequency: Frequency::Fixed, id: 0xFFFFFFFB });
        assert_eq!(ack.blocks[0].occurrence, Occurrence::Variable);

        let chat = &parsed.messages[2];
        assert_eq!(chat.flags, vec!["UDPDeprecated".to_string()]);
        assert_eq!(chat.blocks[0].fields[0].field_type, FieldType::Variable2);
        assert_eq!(chat.blocks[1].occurrence, Occurrence::Optional);
        assert_eq!(chat.blocks[1].fields[0].field_type, FieldType::Fixed(4));
    }

    #[test]
    fn test_errors_report_line() {
        let text = "{\n  Broken Low 1 NotTrusted Unencoded\n  {\n    Block Single\n    { Field U128 }\n  }\n}\n";
        match parse(text) {
            Err(CodecError::Template { line, reason }) => {
                assert_eq!(line, 5);
                assert!(reason.contains("U128"));
            }
            other => panic!("expected template error, got {:?}", other),
        }
    }

    #[test]
    fn test_unterminated_message() {
        let text = "{\n  Broken Low 1 NotTrusted Unencoded\n";
        assert!(matches!(parse(text), Err(CodecError::Template { .. })));
    }

    #[test]
    fn test_duplicate_field_rejected() {
        let text = "{ M High 3 NotTrusted Unencoded { B Single { A U8 } { A U8 } } }";
        assert!(matches!(parse(text), Err(CodecError::Template { line: 1, .. })));
    }

    #[test]
    fn test_out_of_range_number_rejected() {
        let text = "{ M High 300 NotTrusted Unencoded }";
        assert!(matches!(parse(text), Err(CodecError::Template { .. })));
    }
}
