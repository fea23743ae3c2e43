//! Two-level lexer (`spec.md` §4.1).
//!
//! Level 1 scans the raw template byte stream, recognizing directive
//! delimiters (`<?teng ... ?>`, the short form `<?...?>`, `${...}`,
//! `%{...}`, `#{...}`) and literal-text runs between them; comments
//! (`<!--- ... --->`) are discarded and escape sequences (`<\?...\?>`)
//! become literal text. Level 2 activates inside a directive/expression
//! body and tokenizes the expression sublanguage (identifiers, number and
//! string literals, operators, punctuation).
//!
//! Both levels are driven from one [`Lexer`] with an internal mode, since
//! level 2 only ever runs nested inside a level-1-recognized span — the
//! spec's "two levels" describe a mode switch, not two independent passes.

use std::rc::Rc;

use memchr::{memchr, memchr3};

use crate::error::Pos;

/// Which opening form introduced the current directive; threaded through so
/// the parser knows what closing delimiter to expect and how to treat the
/// body (`${}`/`%{}` are bare expressions, `#{}` is a dictionary lookup,
/// `<?teng ...?>`/short tag carry a keyword-led statement).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectiveKind {
    Keyword,
    ShortTag,
    PrintEscape,
    PrintRaw,
    DictLookup,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Text(String),
    DirectiveStart(DirectiveKind),
    DirectiveEnd,

    Ident(String),
    IntLit(i64),
    RealLit(f64),
    StrLit(String),

    // operators & punctuation
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    RegexMatch,
    RegexNotMatch,
    AndAnd,
    OrOr,
    Not,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Concat,
    Repeat,
    Amp,
    Pipe,
    Caret,
    Tilde,
    Question,
    Colon,
    Comma,
    Dot,
    DollarDollar,
    Dollar,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Assign,

    Eof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Text,
    Directive,
}

/// Severity-tagged lex failure, reported through the caller's `ErrorLog`.
#[derive(Debug, Clone)]
pub struct LexError {
    pub pos: Pos,
    pub message: String,
    pub fatal: bool,
}

/// Owns its source (`Rc<str>`, cheap to clone) rather than borrowing it, so a
/// [`crate::parser::Parser`] compiling an `extends`-chain of templates can
/// swap in a nested `Lexer` over a freshly loaded source string without
/// fighting a borrowed lifetime tied to the outer template's text.
pub struct Lexer {
    src: Rc<str>,
    offset: usize,
    line: u32,
    column: u32,
    file: u32,
    mode: Mode,
    shorttag: bool,
    /// Closing delimiter expected for the directive currently open, so we
    /// know when level 2 hands back to level 1.
    closing: Option<&'static str>,
}

impl Lexer {
    pub fn new(src: impl Into<Rc<str>>, file: u32, shorttag: bool) -> Self {
        Lexer {
            src: src.into(),
            offset: 0,
            line: 1,
            column: 1,
            file,
            mode: Mode::Text,
            shorttag,
            closing: None,
        }
    }

    pub fn pos(&self) -> Pos {
        Pos::new(self.file, self.line, self.column)
    }

    fn peek_byte(&self) -> Option<u8> {
        self.src.as_bytes().get(self.offset).copied()
    }

    fn starts_with(&self, pat: &str) -> bool {
        self.src[self.offset..].starts_with(pat)
    }

    fn advance(&mut self) -> Option<char> {
        let rest = &self.src[self.offset..];
        let c = rest.chars().next()?;
        self.offset += c.len_utf8();
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn skip_bytes(&mut self, n: usize) {
        for _ in 0..n {
            self.advance();
        }
    }

    fn eof(&self) -> bool {
        self.offset >= self.src.len()
    }

    /// Level 1: produce the next token, switching into directive mode when
    /// a marker is recognized.
    pub fn next_token(&mut self) -> Result<Token, LexError> {
        match self.mode {
            Mode::Text => self.lex_text(),
            Mode::Directive => self.lex_directive(),
        }
    }

    fn lex_text(&mut self) -> Result<Token, LexError> {
        let mut text = String::new();
        loop {
            if self.eof() {
                break;
            }
            if self.starts_with("<!---") {
                self.skip_comment()?;
                continue;
            }
            if self.starts_with("<\\?") {
                // Escape sequence: literal "<?" in output.
                self.skip_bytes(3);
                text.push_str("<?");
                continue;
            }
            if self.starts_with("<?teng") {
                if text.is_empty() {
                    self.skip_bytes(6);
                    self.mode = Mode::Directive;
                    self.closing = Some("?>");
                    return Ok(Token::DirectiveStart(DirectiveKind::Keyword));
                }
                break;
            }
            if self.shorttag && self.starts_with("<?") && !self.starts_with("<?xml") {
                if text.is_empty() {
                    self.skip_bytes(2);
                    self.mode = Mode::Directive;
                    self.closing = Some("?>");
                    return Ok(Token::DirectiveStart(DirectiveKind::ShortTag));
                }
                break;
            }
            if self.starts_with("${") {
                if text.is_empty() {
                    self.skip_bytes(2);
                    self.mode = Mode::Directive;
                    self.closing = Some("}");
                    return Ok(Token::DirectiveStart(DirectiveKind::PrintEscape));
                }
                break;
            }
            if self.starts_with("%{") {
                if text.is_empty() {
                    self.skip_bytes(2);
                    self.mode = Mode::Directive;
                    self.closing = Some("}");
                    return Ok(Token::DirectiveStart(DirectiveKind::PrintRaw));
                }
                break;
            }
            if self.starts_with("#{") {
                if text.is_empty() {
                    self.skip_bytes(2);
                    self.mode = Mode::Directive;
                    self.closing = Some("}");
                    return Ok(Token::DirectiveStart(DirectiveKind::DictLookup));
                }
                break;
            }
            // None of the markers above matched here: bulk-copy the run of
            // plain bytes up to the next byte that could start one, rather
            // than decoding and re-checking a char at a time.
            let rest = &self.src.as_bytes()[self.offset..];
            let angle = memchr(b'<', rest);
            let other = memchr3(b'$', b'%', b'#', rest);
            let next = match (angle, other) {
                (Some(a), Some(b)) => a.min(b),
                (Some(a), None) => a,
                (None, Some(b)) => b,
                (None, None) => rest.len(),
            };
            // A lone marker byte that failed every check above (e.g. a bare
            // '<' not followed by a recognized form) must still advance.
            let end = self.offset + next.max(1).min(rest.len());
            let chunk = &self.src[self.offset..end];
            for ch in chunk.chars() {
                if ch == '\n' {
                    self.line += 1;
                    self.column = 1;
                } else {
                    self.column += 1;
                }
            }
            text.push_str(chunk);
            self.offset = end;
        }
        if text.is_empty() {
            Ok(Token::Eof)
        } else {
            Ok(Token::Text(text))
        }
    }

    fn skip_comment(&mut self) -> Result<(), LexError> {
        let start = self.pos();
        self.skip_bytes(5); // "<!---"
        loop {
            if self.eof() {
                return Err(LexError {
                    pos: start,
                    message: "unterminated comment".to_string(),
                    fatal: false,
                });
            }
            if self.starts_with("--->") {
                self.skip_bytes(4);
                return Ok(());
            }
            self.advance();
        }
    }

    fn lex_directive(&mut self) -> Result<Token, LexError> {
        self.skip_ws();
        let closing = self.closing.unwrap_or("?>");
        if self.eof() {
            return Err(LexError {
                pos: self.pos(),
                message: "unterminated directive".to_string(),
                fatal: true,
            });
        }
        if self.starts_with(closing) {
            self.skip_bytes(closing.len());
            self.mode = Mode::Text;
            self.closing = None;
            return Ok(Token::DirectiveEnd);
        }
        self.lex_l2_token()
    }

    fn skip_ws(&mut self) {
        loop {
            match self.peek_byte() {
                Some(b) if b.is_ascii_whitespace() => {
                    self.advance();
                }
                _ => break,
            }
        }
    }

    fn lex_l2_token(&mut self) -> Result<Token, LexError> {
        let start = self.pos();
        let c = match self.peek_byte() {
            Some(b) => b as char,
            None => return Ok(Token::Eof),
        };

        if c.is_ascii_digit() {
            return self.lex_number();
        }
        if c == '_' || c.is_ascii_alphabetic() {
            return Ok(self.lex_ident());
        }
        if c == '\'' || c == '"' {
            return self.lex_string(c);
        }

        macro_rules! two {
            ($a:literal, $b:literal, $tok2:expr, $tok1:expr) => {{
                if self.starts_with(concat!($a, $b)) {
                    self.skip_bytes(2);
                    return Ok($tok2);
                }
                self.skip_bytes(1);
                return Ok($tok1);
            }};
        }

        match c {
            '=' => {
                if self.starts_with("==") {
                    self.skip_bytes(2);
                    Ok(Token::EqEq)
                } else if self.starts_with("=~") {
                    self.skip_bytes(2);
                    Ok(Token::RegexMatch)
                } else {
                    self.skip_bytes(1);
                    Ok(Token::Assign)
                }
            }
            '!' => {
                if self.starts_with("!=") {
                    self.skip_bytes(2);
                    Ok(Token::NotEq)
                } else if self.starts_with("!~") {
                    self.skip_bytes(2);
                    Ok(Token::RegexNotMatch)
                } else {
                    self.skip_bytes(1);
                    Ok(Token::Not)
                }
            }
            '<' => two!("<", "=", Token::Le, Token::Lt),
            '>' => two!(">", "=", Token::Ge, Token::Gt),
            '&' => two!("&", "&", Token::AndAnd, Token::Amp),
            '|' => two!("|", "|", Token::OrOr, Token::Pipe),
            '+' => two!("+", "+", Token::Concat, Token::Plus),
            '*' => two!("*", "*", Token::Repeat, Token::Star),
            '~' => {
                self.skip_bytes(1);
                Ok(Token::Tilde)
            }
            '^' => {
                self.skip_bytes(1);
                Ok(Token::Caret)
            }
            '-' => {
                self.skip_bytes(1);
                Ok(Token::Minus)
            }
            '/' => {
                self.skip_bytes(1);
                Ok(Token::Slash)
            }
            '%' => {
                self.skip_bytes(1);
                Ok(Token::Percent)
            }
            '?' => {
                self.skip_bytes(1);
                Ok(Token::Question)
            }
            ':' => {
                self.skip_bytes(1);
                Ok(Token::Colon)
            }
            ',' => {
                self.skip_bytes(1);
                Ok(Token::Comma)
            }
            '.' => {
                self.skip_bytes(1);
                Ok(Token::Dot)
            }
            '(' => {
                self.skip_bytes(1);
                Ok(Token::LParen)
            }
            ')' => {
                self.skip_bytes(1);
                Ok(Token::RParen)
            }
            '[' => {
                self.skip_bytes(1);
                Ok(Token::LBracket)
            }
            ']' => {
                self.skip_bytes(1);
                Ok(Token::RBracket)
            }
            '$' => {
                if self.starts_with("$$") {
                    self.skip_bytes(2);
                    Ok(Token::DollarDollar)
                } else {
                    self.skip_bytes(1);
                    Ok(Token::Dollar)
                }
            }
            _ => {
                self.skip_bytes(1);
                Err(LexError {
                    pos: start,
                    message: format!("unexpected character '{c}'"),
                    fatal: false,
                })
            }
        }
    }

    fn lex_ident(&mut self) -> Token {
        let start = self.offset;
        while let Some(c) = self.peek_byte() {
            let c = c as char;
            if c.is_ascii_alphanumeric() || c == '_' {
                self.advance();
            } else {
                break;
            }
        }
        Token::Ident(self.src[start..self.offset].to_string())
    }

    fn lex_number(&mut self) -> Result<Token, LexError> {
        let start = self.offset;
        if self.starts_with("0x") || self.starts_with("0X") {
            self.skip_bytes(2);
            let digits_start = self.offset;
            while self.peek_byte().map(|b| (b as char).is_ascii_hexdigit()).unwrap_or(false) {
                self.advance();
            }
            let digits = &self.src[digits_start..self.offset];
            let v = i64::from_str_radix(digits, 16).unwrap_or(0);
            return Ok(Token::IntLit(v));
        }
        if self.starts_with("0b") || self.starts_with("0B") {
            self.skip_bytes(2);
            let digits_start = self.offset;
            while matches!(self.peek_byte(), Some(b'0') | Some(b'1')) {
                self.advance();
            }
            let digits = &self.src[digits_start..self.offset];
            let v = i64::from_str_radix(digits, 2).unwrap_or(0);
            return Ok(Token::IntLit(v));
        }
        // Leading zero with only octal digits and no '.'/'e' => octal literal.
        if self.peek_byte() == Some(b'0') {
            let save = self.offset;
            let (save_line, save_col) = (self.line, self.column);
            self.advance();
            let digits_start = self.offset;
            while self.peek_byte().map(|b| (b'0'..=b'7').contains(&b)).unwrap_or(false) {
                self.advance();
            }
            let next_is_float_marker = matches!(self.peek_byte(), Some(b'.') | Some(b'8') | Some(b'9') | Some(b'e') | Some(b'E'));
            if self.offset > digits_start && !next_is_float_marker {
                let digits = &self.src[digits_start..self.offset];
                let v = i64::from_str_radix(digits, 8).unwrap_or(0);
                return Ok(Token::IntLit(v));
            }
            // Not octal after all: rewind and fall through to decimal/real scan.
            self.offset = save;
            self.line = save_line;
            self.column = save_col;
        }

        while self.peek_byte().map(|b| (b as char).is_ascii_digit()).unwrap_or(false) {
            self.advance();
        }
        let mut is_real = false;
        if self.peek_byte() == Some(b'.') && self.src.as_bytes().get(self.offset + 1).map(|b| (*b as char).is_ascii_digit()).unwrap_or(false) {
            is_real = true;
            self.advance();
            while self.peek_byte().map(|b| (b as char).is_ascii_digit()).unwrap_or(false) {
                self.advance();
            }
        }
        if matches!(self.peek_byte(), Some(b'e') | Some(b'E')) {
            let save = self.offset;
            let (save_line, save_col) = (self.line, self.column);
            self.advance();
            if matches!(self.peek_byte(), Some(b'+') | Some(b'-')) {
                self.advance();
            }
            if self.peek_byte().map(|b| (b as char).is_ascii_digit()).unwrap_or(false) {
                is_real = true;
                while self.peek_byte().map(|b| (b as char).is_ascii_digit()).unwrap_or(false) {
                    self.advance();
                }
            } else {
                self.offset = save;
                self.line = save_line;
                self.column = save_col;
            }
        }
        let text = &self.src[start..self.offset];
        if is_real {
            text.parse::<f64>().map(Token::RealLit).map_err(|_| LexError {
                pos: self.pos(),
                message: format!("invalid real literal '{text}'"),
                fatal: false,
            })
        } else {
            text.parse::<i64>().map(Token::IntLit).map_err(|_| LexError {
                pos: self.pos(),
                message: format!("invalid integer literal '{text}'"),
                fatal: false,
            })
        }
    }

    fn lex_string(&mut self, quote: char) -> Result<Token, LexError> {
        let start = self.pos();
        self.advance(); // opening quote
        let mut out = String::new();
        loop {
            match self.peek_byte() {
                None => {
                    return Err(LexError {
                        pos: start,
                        message: "unterminated string literal".to_string(),
                        fatal: false,
                    });
                }
                Some(b) if (b as char) == quote => {
                    self.advance();
                    return Ok(Token::StrLit(out));
                }
                Some(b'\\') => {
                    self.advance();
                    match self.peek_byte() {
                        Some(b'n') => { out.push('\n'); self.advance(); }
                        Some(b'r') => { out.push('\r'); self.advance(); }
                        Some(b't') => { out.push('\t'); self.advance(); }
                        Some(b'a') => { out.push('\x07'); self.advance(); }
                        Some(b'0') => { out.push('\0'); self.advance(); }
                        Some(b'v') => { out.push('\x0b'); self.advance(); }
                        Some(b'\'') => { out.push('\''); self.advance(); }
                        Some(b'"') => { out.push('"'); self.advance(); }
                        Some(b'\\') => { out.push('\\'); self.advance(); }
                        Some(b'\n') => {
                            // Backslash immediately before a literal newline:
                            // WARNING (reported by caller via returned flag),
                            // terminates the literal at this point.
                            self.advance();
                            return Ok(Token::StrLit(out));
                        }
                        Some(other) => {
                            // Unknown escape: pass the letter through.
                            out.push(other as char);
                            self.advance();
                        }
                        None => {
                            return Err(LexError {
                                pos: start,
                                message: "unterminated string literal".to_string(),
                                fatal: false,
                            });
                        }
                    }
                }
                Some(_) => {
                    let c = self.advance().unwrap();
                    out.push(c);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(src: &str) -> Vec<Token> {
        let mut lex = Lexer::new(src, 0, true);
        let mut out = Vec::new();
        loop {
            let t = lex.next_token().unwrap();
            let is_eof = t == Token::Eof;
            out.push(t);
            if is_eof {
                break;
            }
        }
        out
    }

    #[test]
    fn plain_text_is_single_token() {
        let toks = tokens("hello world");
        assert_eq!(toks, vec![Token::Text("hello world".into()), Token::Eof]);
    }

    #[test]
    fn print_escape_directive() {
        let toks = tokens("${var}");
        assert_eq!(
            toks,
            vec![
                Token::DirectiveStart(DirectiveKind::PrintEscape),
                Token::Ident("var".into()),
                Token::DirectiveEnd,
                Token::Eof,
            ]
        );
    }

    #[test]
    fn numeric_literal_forms() {
        let mut lex = Lexer::new("${0xFF}", 0, true);
        assert_eq!(lex.next_token().unwrap(), Token::DirectiveStart(DirectiveKind::PrintEscape));
        assert_eq!(lex.next_token().unwrap(), Token::IntLit(255));

        let mut lex = Lexer::new("${0755}", 0, true);
        lex.next_token().unwrap();
        assert_eq!(lex.next_token().unwrap(), Token::IntLit(0o755));

        let mut lex = Lexer::new("${0b101}", 0, true);
        lex.next_token().unwrap();
        assert_eq!(lex.next_token().unwrap(), Token::IntLit(5));

        let mut lex = Lexer::new("${1.5e2}", 0, true);
        lex.next_token().unwrap();
        assert_eq!(lex.next_token().unwrap(), Token::RealLit(150.0));
    }

    #[test]
    fn comment_is_discarded() {
        let toks = tokens("a<!--- hidden --->b");
        assert_eq!(toks, vec![Token::Text("ab".into()), Token::Eof]);
    }

    #[test]
    fn escaped_open_tag_is_literal() {
        let toks = tokens("x<\\?teng?>y");
        assert_eq!(toks, vec![Token::Text("x<?teng?>y".into()), Token::Eof]);
    }

    #[test]
    fn regex_match_operators() {
        let toks = tokens("${a=~b}");
        assert!(toks.contains(&Token::RegexMatch));
        let toks = tokens("${a!~b}");
        assert!(toks.contains(&Token::RegexNotMatch));
        let toks = tokens("${a!=b}");
        assert!(toks.contains(&Token::NotEq));
    }

    #[test]
    fn string_literal_escapes() {
        let mut lex = Lexer::new("${'a\\nb'}", 0, true);
        lex.next_token().unwrap();
        assert_eq!(lex.next_token().unwrap(), Token::StrLit("a\nb".into()));
    }
}
