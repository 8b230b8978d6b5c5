// File: src/lexer.rs
//
// Scanner for the Lumen programming language.
// Converts source text into a flat token stream; whitespace and `//` line
// comments are discarded. Tokenization is eager (the whole source is
// scanned up front into a `Vec<Token>`), and the compiler walks that vector
// with `current`/`previous` cursors, so the parser never needs to hold a
// lifetime-bound iterator.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    // single-character punctuation
    LeftParen,
    RightParen,
    LeftBrace,
    RightBrace,
    LeftBracket,
    RightBracket,
    Comma,
    Dot,
    Semicolon,
    Colon,
    Minus,
    Plus,
    Slash,
    Star,

    // one or two character tokens
    Bang,
    BangEqual,
    Equal,
    EqualEqual,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,
    PlusEqual,
    MinusEqual,

    // literals
    Identifier,
    String,
    Number,

    // keywords
    And,
    Class,
    Else,
    False,
    For,
    Fun,
    If,
    Nil,
    Or,
    Print,
    Return,
    Super,
    This,
    True,
    Var,
    While,

    Error,
    Eof,
}

/// A scanned token. `lexeme` borrows directly from the source string, so a
/// `Token` never outlives the `&str` it was scanned from.
#[derive(Debug, Clone, Copy)]
pub struct Token<'src> {
    pub kind: TokenKind,
    pub lexeme: &'src str,
    pub line: u32,
}

impl<'src> Token<'src> {
    fn new(kind: TokenKind, lexeme: &'src str, line: u32) -> Self {
        Token { kind, lexeme, line }
    }
}

fn keyword(ident: &str) -> Option<TokenKind> {
    Some(match ident {
        "and" => TokenKind::And,
        "class" => TokenKind::Class,
        "else" => TokenKind::Else,
        "false" => TokenKind::False,
        "for" => TokenKind::For,
        "fun" => TokenKind::Fun,
        "if" => TokenKind::If,
        "nil" => TokenKind::Nil,
        "or" => TokenKind::Or,
        "print" => TokenKind::Print,
        "return" => TokenKind::Return,
        "super" => TokenKind::Super,
        "this" => TokenKind::This,
        "true" => TokenKind::True,
        "var" => TokenKind::Var,
        "while" => TokenKind::While,
        _ => return None,
    })
}

/// Byte-cursor scanner over a source string. Produces one token at a time
/// via `scan_token`; `tokenize` drives it to completion (including a
/// trailing `Eof` token) for the compiler to consume.
pub struct Scanner<'src> {
    source: &'src str,
    bytes: &'src [u8],
    start: usize,
    current: usize,
    line: u32,
}

impl<'src> Scanner<'src> {
    pub fn new(source: &'src str) -> Self {
        Scanner { source, bytes: source.as_bytes(), start: 0, current: 0, line: 1 }
    }

    fn is_at_end(&self) -> bool {
        self.current >= self.bytes.len()
    }

    fn advance(&mut self) -> u8 {
        let c = self.bytes[self.current];
        self.current += 1;
        c
    }

    fn peek(&self) -> u8 {
        if self.is_at_end() { 0 } else { self.bytes[self.current] }
    }

    fn peek_next(&self) -> u8 {
        if self.current + 1 >= self.bytes.len() { 0 } else { self.bytes[self.current + 1] }
    }

    fn matches(&mut self, expected: u8) -> bool {
        if self.is_at_end() || self.bytes[self.current] != expected {
            return false;
        }
        self.current += 1;
        true
    }

    fn make(&self, kind: TokenKind) -> Token<'src> {
        Token::new(kind, &self.source[self.start..self.current], self.line)
    }

    fn error(&self, message: &'static str) -> Token<'src> {
        Token::new(TokenKind::Error, message, self.line)
    }

    fn skip_whitespace(&mut self) {
        loop {
            match self.peek() {
                b' ' | b'\r' | b'\t' => {
                    self.advance();
                }
                b'\n' => {
                    self.line += 1;
                    self.advance();
                }
                b'/' if self.peek_next() == b'/' => {
                    while self.peek() != b'\n' && !self.is_at_end() {
                        self.advance();
                    }
                }
                _ => return,
            }
        }
    }

    fn string(&mut self) -> Token<'src> {
        while self.peek() != b'"' && !self.is_at_end() {
            if self.peek() == b'\n' {
                self.line += 1;
            }
            self.advance();
        }
        if self.is_at_end() {
            return self.error("Unterminated string.");
        }
        self.advance(); // closing quote
        self.make(TokenKind::String)
    }

    /// Consumes digits, and also consumes a trailing `.digits` fractional
    /// part as part of the lexeme, even though the compiler only ever
    /// parses the integer part and rejects the rest.
    fn number(&mut self) -> Token<'src> {
        while self.peek().is_ascii_digit() {
            self.advance();
        }
        if self.peek() == b'.' && self.peek_next().is_ascii_digit() {
            self.advance();
            while self.peek().is_ascii_digit() {
                self.advance();
            }
        }
        self.make(TokenKind::Number)
    }

    fn identifier(&mut self) -> Token<'src> {
        while self.peek().is_ascii_alphanumeric() || self.peek() == b'_' {
            self.advance();
        }
        let text = &self.source[self.start..self.current];
        match keyword(text) {
            Some(kind) => self.make(kind),
            None => self.make(TokenKind::Identifier),
        }
    }

    pub fn scan_token(&mut self) -> Token<'src> {
        self.skip_whitespace();
        self.start = self.current;
        if self.is_at_end() {
            return self.make(TokenKind::Eof);
        }

        let c = self.advance();
        if c.is_ascii_digit() {
            return self.number();
        }
        if c.is_ascii_alphabetic() || c == b'_' {
            return self.identifier();
        }

        match c {
            b'(' => self.make(TokenKind::LeftParen),
            b')' => self.make(TokenKind::RightParen),
            b'{' => self.make(TokenKind::LeftBrace),
            b'}' => self.make(TokenKind::RightBrace),
            b'[' => self.make(TokenKind::LeftBracket),
            b']' => self.make(TokenKind::RightBracket),
            b',' => self.make(TokenKind::Comma),
            b'.' => self.make(TokenKind::Dot),
            b';' => self.make(TokenKind::Semicolon),
            b':' => self.make(TokenKind::Colon),
            b'*' => self.make(TokenKind::Star),
            b'/' => self.make(TokenKind::Slash),
            b'-' => {
                let kind = if self.matches(b'=') { TokenKind::MinusEqual } else { TokenKind::Minus };
                self.make(kind)
            }
            b'+' => {
                let kind = if self.matches(b'=') { TokenKind::PlusEqual } else { TokenKind::Plus };
                self.make(kind)
            }
            b'!' => {
                let kind = if self.matches(b'=') { TokenKind::BangEqual } else { TokenKind::Bang };
                self.make(kind)
            }
            b'=' => {
                let kind = if self.matches(b'=') { TokenKind::EqualEqual } else { TokenKind::Equal };
                self.make(kind)
            }
            b'<' => {
                let kind = if self.matches(b'=') { TokenKind::LessEqual } else { TokenKind::Less };
                self.make(kind)
            }
            b'>' => {
                let kind = if self.matches(b'=') { TokenKind::GreaterEqual } else { TokenKind::Greater };
                self.make(kind)
            }
            b'"' => self.string(),
            _ => self.error("Unexpected character."),
        }
    }
}

/// Scans the whole source into a token vector, including a trailing `Eof`.
pub fn tokenize(source: &str) -> Vec<Token<'_>> {
    let mut scanner = Scanner::new(source);
    let mut tokens = Vec::new();
    loop {
        let token = scanner.scan_token();
        let done = token.kind == TokenKind::Eof;
        tokens.push(token);
        if done {
            break;
        }
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scans_punctuation_and_operators() {
        let tokens = tokenize("( ) { } [ ] , . ; : + - * / = == != < <= > >= ! += -=");
        let kinds: Vec<TokenKind> = tokens.iter().map(|t| t.kind).collect();
        assert_eq!(
            kinds,
            vec![
                TokenKind::LeftParen,
                TokenKind::RightParen,
                TokenKind::LeftBrace,
                TokenKind::RightBrace,
                TokenKind::LeftBracket,
                TokenKind::RightBracket,
                TokenKind::Comma,
                TokenKind::Dot,
                TokenKind::Semicolon,
                TokenKind::Colon,
                TokenKind::Plus,
                TokenKind::Minus,
                TokenKind::Star,
                TokenKind::Slash,
                TokenKind::Equal,
                TokenKind::EqualEqual,
                TokenKind::BangEqual,
                TokenKind::Less,
                TokenKind::LessEqual,
                TokenKind::Greater,
                TokenKind::GreaterEqual,
                TokenKind::Bang,
                TokenKind::PlusEqual,
                TokenKind::MinusEqual,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn scans_keywords_vs_identifiers() {
        let tokens = tokenize("var fun class foo bar_baz");
        let kinds: Vec<TokenKind> = tokens.iter().map(|t| t.kind).collect();
        assert_eq!(
            kinds,
            vec![
                TokenKind::Var,
                TokenKind::Fun,
                TokenKind::Class,
                TokenKind::Identifier,
                TokenKind::Identifier,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn unterminated_string_is_an_error_token() {
        let tokens = tokenize("\"abc");
        assert_eq!(tokens[0].kind, TokenKind::Error);
    }

    #[test]
    fn skips_line_comments() {
        let tokens = tokenize("1 // a comment\n2");
        let kinds: Vec<TokenKind> = tokens.iter().map(|t| t.kind).collect();
        assert_eq!(kinds, vec![TokenKind::Number, TokenKind::Number, TokenKind::Eof]);
    }

    #[test]
    fn number_consumes_fractional_lexeme() {
        let tokens = tokenize("1.5");
        assert_eq!(tokens[0].kind, TokenKind::Number);
        assert_eq!(tokens[0].lexeme, "1.5");
    }
}
