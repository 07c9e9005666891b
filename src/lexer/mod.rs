//! Script lexer/tokenizer
//!
//! Turns source text into a flat token vector. Template literals are kept
//! as one token and split by the parser; `%Name` directives are recognized
//! only when the lexer is created with directive support.

mod token;

pub use token::{Keyword, Token, TokenKind};

use crate::bytecode::Intrinsic;
use crate::error::{Error, Result, SourceLocation};

/// A lexer for script source code
pub struct Lexer<'src> {
    /// Source code being lexed
    source: &'src str,
    /// Source as bytes for faster access
    bytes: &'src [u8],
    /// Current position in bytes
    pos: usize,
    /// Current line number (1-indexed)
    line: u32,
    /// Current column number (1-indexed)
    column: u32,
    /// Accept `%Name` directive tokens
    allow_directives: bool,
    /// A line terminator was skipped since the last token
    saw_newline: bool,
    /// Kind of the previously produced token
    last_kind: Option<TokenKind>,
}

impl<'src> Lexer<'src> {
    /// Create a new lexer for the given source code
    pub fn new(source: &'src str) -> Self {
        Self {
            source,
            bytes: source.as_bytes(),
            pos: 0,
            line: 1,
            column: 1,
            allow_directives: false,
            saw_newline: false,
            last_kind: None,
        }
    }

    /// Enable `%Name(...)` directive tokens
    pub fn with_directives(mut self, allow: bool) -> Self {
        self.allow_directives = allow;
        self
    }

    /// Start lexing at a line/column other than the beginning of a file
    pub fn at_location(mut self, location: SourceLocation) -> Self {
        self.line = location.line;
        self.column = location.column;
        self
    }

    fn location(&self) -> SourceLocation {
        SourceLocation {
            line: self.line,
            column: self.column,
            offset: self.pos,
        }
    }

    fn error(&self, message: impl Into<String>, location: SourceLocation) -> Error {
        Error::lexer_error(message, location).with_source_context(self.source)
    }

    fn is_eof(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn peek(&self) -> Option<char> {
        if self.is_eof() {
            None
        } else {
            self.source[self.pos..].chars().next()
        }
    }

    fn peek_next(&self) -> Option<char> {
        let mut chars = self.source[self.pos..].chars();
        chars.next();
        chars.next()
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn eat(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn skip_whitespace_and_comments(&mut self) -> Result<()> {
        loop {
            match self.peek() {
                Some('\n') => {
                    self.saw_newline = true;
                    self.advance();
                }
                Some(c) if c.is_whitespace() => {
                    self.advance();
                }
                Some('/') if self.peek_next() == Some('/') => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.advance();
                    }
                }
                Some('/') if self.peek_next() == Some('*') => {
                    let start = self.location();
                    self.advance();
                    self.advance();
                    loop {
                        match self.advance() {
                            None => return Err(self.error("Unterminated comment", start)),
                            Some('\n') => self.saw_newline = true,
                            Some('*') if self.peek() == Some('/') => {
                                self.advance();
                                break;
                            }
                            Some(_) => {}
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn is_id_start(c: char) -> bool {
        c == '$' || c == '_' || unicode_xid::UnicodeXID::is_xid_start(c)
    }

    fn is_id_continue(c: char) -> bool {
        c == '$' || c == '_' || unicode_xid::UnicodeXID::is_xid_continue(c)
    }

    fn scan_identifier(&mut self) -> TokenKind {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if Self::is_id_continue(c) {
                self.advance();
            } else {
                break;
            }
        }
        match Keyword::lookup(&self.source[start..self.pos]) {
            Some(keyword) => TokenKind::Keyword(keyword),
            None => TokenKind::Identifier,
        }
    }

    fn scan_number(&mut self) -> Result<TokenKind> {
        let start_loc = self.location();
        if self.peek() == Some('0') && matches!(self.peek_next(), Some('x' | 'X' | 'b' | 'B' | 'o' | 'O')) {
            self.advance();
            let radix = match self.advance() {
                Some('x' | 'X') => 16,
                Some('b' | 'B') => 2,
                _ => 8,
            };
            let digits_start = self.pos;
            while let Some(c) = self.peek() {
                if c.is_digit(radix) || c == '_' {
                    self.advance();
                } else {
                    break;
                }
            }
            if self.pos == digits_start {
                return Err(self.error("Missing digits in numeric literal", start_loc));
            }
            return Ok(TokenKind::NumberLiteral);
        }

        while let Some(c) = self.peek() {
            if c.is_ascii_digit() || c == '_' {
                self.advance();
            } else {
                break;
            }
        }
        if self.peek() == Some('.') {
            self.advance();
            while let Some(c) = self.peek() {
                if c.is_ascii_digit() || c == '_' {
                    self.advance();
                } else {
                    break;
                }
            }
        }
        if matches!(self.peek(), Some('e' | 'E')) {
            self.advance();
            if matches!(self.peek(), Some('+' | '-')) {
                self.advance();
            }
            if !self.peek().is_some_and(|c| c.is_ascii_digit()) {
                return Err(self.error("Missing exponent in numeric literal", start_loc));
            }
            while let Some(c) = self.peek() {
                if c.is_ascii_digit() {
                    self.advance();
                } else {
                    break;
                }
            }
        }
        if self.peek().is_some_and(Self::is_id_start) {
            return Err(self.error("Identifier directly after number", start_loc));
        }
        Ok(TokenKind::NumberLiteral)
    }

    fn scan_string(&mut self, quote: char) -> Result<TokenKind> {
        let start_loc = self.location();
        self.advance();
        loop {
            match self.peek() {
                None | Some('\n') => {
                    return Err(self.error("Unterminated string literal", start_loc));
                }
                Some('\\') => {
                    self.advance();
                    self.advance();
                }
                Some(c) if c == quote => {
                    self.advance();
                    return Ok(TokenKind::StringLiteral);
                }
                Some(_) => {
                    self.advance();
                }
            }
        }
    }

    /// Scan a whole template literal, tracking brace depth inside `${...}`
    fn scan_template(&mut self) -> Result<TokenKind> {
        let start_loc = self.location();
        self.advance();
        loop {
            match self.peek() {
                None => return Err(self.error("Unterminated template literal", start_loc)),
                Some('\\') => {
                    self.advance();
                    self.advance();
                }
                Some('`') => {
                    self.advance();
                    return Ok(TokenKind::Template);
                }
                Some('$') if self.peek_next() == Some('{') => {
                    self.advance();
                    self.advance();
                    self.skip_substitution(start_loc)?;
                }
                Some(_) => {
                    self.advance();
                }
            }
        }
    }

    fn skip_substitution(&mut self, start_loc: SourceLocation) -> Result<()> {
        let mut depth = 1usize;
        while depth > 0 {
            match self.peek() {
                None => return Err(self.error("Unterminated template substitution", start_loc)),
                Some('{') => {
                    depth += 1;
                    self.advance();
                }
                Some('}') => {
                    depth -= 1;
                    self.advance();
                }
                Some(q @ ('"' | '\'')) => {
                    self.scan_string(q)?;
                }
                Some('`') => {
                    self.scan_template()?;
                }
                Some(_) => {
                    self.advance();
                }
            }
        }
        Ok(())
    }

    /// Whether the previous token ends an operand, which makes `%` a modulo
    fn after_operand(&self) -> bool {
        matches!(
            self.last_kind,
            Some(
                TokenKind::Identifier
                    | TokenKind::NumberLiteral
                    | TokenKind::StringLiteral
                    | TokenKind::Template
                    | TokenKind::RightParen
                    | TokenKind::RightBracket
                    | TokenKind::RightBrace
                    | TokenKind::Keyword(Keyword::This | Keyword::True | Keyword::False | Keyword::Null | Keyword::Undefined)
            )
        )
    }

    /// Whether the `%` at the cursor starts a directive. After an operand
    /// only a known intrinsic name counts, so `a %b` stays a modulo.
    fn at_directive(&self) -> bool {
        if !self.allow_directives || !self.peek_next().is_some_and(Self::is_id_start) {
            return false;
        }
        if !self.after_operand() {
            return true;
        }
        let rest = &self.source[self.pos + 1..];
        let end = rest
            .char_indices()
            .find(|&(_, c)| !Self::is_id_continue(c))
            .map_or(rest.len(), |(i, _)| i);
        Intrinsic::from_name(&rest[..end]).is_some()
    }

    /// Get the next token
    pub fn next_token(&mut self) -> Result<Token<'src>> {
        self.saw_newline = false;
        self.skip_whitespace_and_comments()?;
        let newline_before = self.saw_newline;
        let start = self.pos;
        let start_loc = self.location();

        let Some(c) = self.peek() else {
            return Ok(Token {
                kind: TokenKind::Eof,
                text: "",
                location: start_loc,
                newline_before,
            });
        };

        let kind = if Self::is_id_start(c) {
            self.scan_identifier()
        } else if c.is_ascii_digit() || (c == '.' && self.peek_next().is_some_and(|n| n.is_ascii_digit())) {
            self.scan_number()?
        } else if c == '"' || c == '\'' {
            self.scan_string(c)?
        } else if c == '`' {
            self.scan_template()?
        } else if c == '%' && self.at_directive() {
            self.advance();
            self.scan_identifier();
            TokenKind::Directive
        } else {
            self.scan_punctuator(c, start_loc)?
        };

        self.last_kind = Some(kind);
        Ok(Token {
            kind,
            text: &self.source[start..self.pos],
            location: start_loc,
            newline_before,
        })
    }

    fn scan_punctuator(&mut self, c: char, start_loc: SourceLocation) -> Result<TokenKind> {
        self.advance();
        let kind = match c {
            '(' => TokenKind::LeftParen,
            ')' => TokenKind::RightParen,
            '{' => TokenKind::LeftBrace,
            '}' => TokenKind::RightBrace,
            '[' => TokenKind::LeftBracket,
            ']' => TokenKind::RightBracket,
            ';' => TokenKind::Semicolon,
            ',' => TokenKind::Comma,
            ':' => TokenKind::Colon,
            '?' => TokenKind::Question,
            '~' => TokenKind::Tilde,
            '.' => TokenKind::Dot,
            '+' => {
                if self.eat('+') {
                    TokenKind::PlusPlus
                } else if self.eat('=') {
                    TokenKind::PlusEquals
                } else {
                    TokenKind::Plus
                }
            }
            '-' => {
                if self.eat('-') {
                    TokenKind::MinusMinus
                } else if self.eat('=') {
                    TokenKind::MinusEquals
                } else {
                    TokenKind::Minus
                }
            }
            '*' => {
                if self.eat('=') {
                    TokenKind::StarEquals
                } else {
                    TokenKind::Star
                }
            }
            '/' => {
                if self.eat('=') {
                    TokenKind::SlashEquals
                } else {
                    TokenKind::Slash
                }
            }
            '%' => {
                if self.eat('=') {
                    TokenKind::PercentEquals
                } else {
                    TokenKind::Percent
                }
            }
            '<' => {
                if self.eat('<') {
                    if self.eat('=') {
                        TokenKind::LeftShiftEquals
                    } else {
                        TokenKind::LeftShift
                    }
                } else if self.eat('=') {
                    TokenKind::LessEqual
                } else {
                    TokenKind::Less
                }
            }
            '>' => {
                if self.eat('>') {
                    if self.eat('>') {
                        if self.eat('=') {
                            TokenKind::UnsignedRightShiftEquals
                        } else {
                            TokenKind::UnsignedRightShift
                        }
                    } else if self.eat('=') {
                        TokenKind::RightShiftEquals
                    } else {
                        TokenKind::RightShift
                    }
                } else if self.eat('=') {
                    TokenKind::GreaterEqual
                } else {
                    TokenKind::Greater
                }
            }
            '=' => {
                if self.eat('=') {
                    if self.eat('=') {
                        TokenKind::EqualEqualEqual
                    } else {
                        TokenKind::EqualEqual
                    }
                } else {
                    TokenKind::Equal
                }
            }
            '!' => {
                if self.eat('=') {
                    if self.eat('=') {
                        TokenKind::NotEqualEqual
                    } else {
                        TokenKind::NotEqual
                    }
                } else {
                    TokenKind::Bang
                }
            }
            '&' => {
                if self.eat('&') {
                    TokenKind::AmpersandAmpersand
                } else if self.eat('=') {
                    TokenKind::AmpersandEquals
                } else {
                    TokenKind::Ampersand
                }
            }
            '|' => {
                if self.eat('|') {
                    TokenKind::PipePipe
                } else if self.eat('=') {
                    TokenKind::PipeEquals
                } else {
                    TokenKind::Pipe
                }
            }
            '^' => {
                if self.eat('=') {
                    TokenKind::CaretEquals
                } else {
                    TokenKind::Caret
                }
            }
            other => {
                return Err(self.error(format!("Unexpected character '{}'", other), start_loc));
            }
        };
        Ok(kind)
    }

    /// Tokenize the entire source
    pub fn tokenize(&mut self) -> Result<Vec<Token<'src>>> {
        let mut tokens = Vec::new();
        loop {
            let token = self.next_token()?;
            let done = token.kind == TokenKind::Eof;
            tokens.push(token);
            if done {
                return Ok(tokens);
            }
        }
    }
}

/// Decode the escapes of a string literal body (quotes already stripped)
pub fn unescape(body: &str) -> std::result::Result<String, String> {
    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('b') => out.push('\u{8}'),
            Some('f') => out.push('\u{c}'),
            Some('v') => out.push('\u{b}'),
            Some('0') => out.push('\0'),
            Some('x') => {
                let hex: String = chars.by_ref().take(2).collect();
                let code = u32::from_str_radix(&hex, 16).map_err(|_| "Invalid hex escape".to_string())?;
                out.push(char::from_u32(code).ok_or("Invalid hex escape")?);
            }
            Some('u') => {
                let code = if chars.peek() == Some(&'{') {
                    chars.next();
                    let hex: String = chars.by_ref().take_while(|c| *c != '}').collect();
                    u32::from_str_radix(&hex, 16)
                } else {
                    let hex: String = chars.by_ref().take(4).collect();
                    u32::from_str_radix(&hex, 16)
                }
                .map_err(|_| "Invalid unicode escape".to_string())?;
                out.push(char::from_u32(code).unwrap_or('\u{fffd}'));
            }
            Some('\n') => {}
            Some(other) => out.push(other),
            None => return Err("Trailing backslash".into()),
        }
    }
    Ok(out)
}

/// Parse the text of a numeric literal token
pub fn parse_number_literal(text: &str) -> Option<f64> {
    let cleaned: String = text.chars().filter(|c| *c != '_').collect();
    let radix = match cleaned.get(..2) {
        Some("0x" | "0X") => 16,
        Some("0b" | "0B") => 2,
        Some("0o" | "0O") => 8,
        _ => 10,
    };
    if radix != 10 {
        let mut value = 0f64;
        for c in cleaned[2..].chars() {
            value = value * radix as f64 + c.to_digit(radix)? as f64;
        }
        return Some(value);
    }
    lexical_core::parse::<f64>(cleaned.as_bytes()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        Lexer::new(source)
            .with_directives(true)
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn test_operators() {
        assert_eq!(
            kinds("a >>>= b !== c"),
            vec![
                TokenKind::Identifier,
                TokenKind::UnsignedRightShiftEquals,
                TokenKind::Identifier,
                TokenKind::NotEqualEqual,
                TokenKind::Identifier,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_directive_versus_modulo() {
        assert_eq!(
            kinds("%GetTier(f); a %b"),
            vec![
                TokenKind::Directive,
                TokenKind::LeftParen,
                TokenKind::Identifier,
                TokenKind::RightParen,
                TokenKind::Semicolon,
                TokenKind::Identifier,
                TokenKind::Percent,
                TokenKind::Identifier,
                TokenKind::Eof
            ]
        );
        let plain: Vec<_> = Lexer::new("%GetTier").tokenize().unwrap().into_iter().map(|t| t.kind).collect();
        assert_eq!(plain[0], TokenKind::Percent);
    }

    #[test]
    fn test_directive_after_closing_brace_or_paren() {
        let after_brace = kinds("function f() {}\n%PrepareFunctionForOptimization(f);");
        assert_eq!(after_brace[6], TokenKind::Directive);
        let after_paren = kinds("if (c) %DeoptimizeNow();");
        assert_eq!(after_paren[4], TokenKind::Directive);
        let modulo = kinds("(a) %b + x %GetTierX");
        assert_eq!(modulo[3], TokenKind::Percent);
        assert_eq!(modulo[7], TokenKind::Percent);
    }

    #[test]
    fn test_template_with_nested_braces_is_one_token() {
        let tokens = Lexer::new("`a${ {x: 1}.x }b` + 1").tokenize().unwrap();
        assert_eq!(tokens[0].kind, TokenKind::Template);
        assert_eq!(tokens[0].text, "`a${ {x: 1}.x }b`");
        assert_eq!(tokens[1].kind, TokenKind::Plus);
    }

    #[test]
    fn test_newline_tracking() {
        let tokens = Lexer::new("a\n// c\nb").tokenize().unwrap();
        assert!(!tokens[0].newline_before);
        assert!(tokens[1].newline_before);
        assert_eq!(tokens[1].location.line, 3);
    }

    #[test]
    fn test_number_literals() {
        assert_eq!(parse_number_literal("0x1F"), Some(31.0));
        assert_eq!(parse_number_literal("1_000"), Some(1000.0));
        assert_eq!(parse_number_literal("2.5e3"), Some(2500.0));
        assert_eq!(parse_number_literal(".5"), Some(0.5));
    }

    #[test]
    fn test_unescape() {
        assert_eq!(unescape(r"a\nbA\x42").unwrap(), "a\nbAB");
    }
}
