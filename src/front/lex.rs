//! The lexer.
//!
//! TAC source is line-oriented, so unlike most lexers this one reports
//! newlines as tokens; the parser uses them as instruction terminators.
//! `#` starts a comment running to the end of the line.

use derive_more::Display;
use regex::Regex;

/// Tokens in the program
#[derive(Clone, Copy, PartialEq, Eq, Hash, Display, Debug)]
#[display("kind: '{kind}', part of input: '{text}'")]
pub struct Token<'src> {
    /// What token class this token belongs to.
    kind: TokenKind,
    /// What part of the input this token carries.
    text: &'src str,
}

impl<'src> Token<'src> {
    pub fn kind(&self) -> TokenKind {
        self.kind
    }

    pub fn text(&self) -> &'src str {
        self.text
    }
}

/// Token classes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Display, Debug)]
pub enum TokenKind {
    /// Meta opcode name with its leading `@`.
    #[display("meta")]
    Meta,
    /// Identifier: plain opcode name, register, label or function name.
    #[display("id")]
    Id,
    /// Float literal, recognized by the decimal point.
    #[display("float")]
    Float,
    /// Optionally signed integer literal.
    #[display("int")]
    Int,
    /// Single-quoted character literal.
    #[display("char")]
    Char,
    /// Double-quoted string literal.
    #[display("string")]
    Str,
    /// `true` or `false`.
    #[display("bool")]
    Bool,
    #[display(",")]
    Comma,
    #[display("[")]
    LBracket,
    #[display("]")]
    RBracket,
    /// End of an instruction line.
    #[display("newline")]
    Newline,
}

pub struct LexError(pub usize, pub char);

impl std::fmt::Display for LexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "lexer error: unexpected character {:?} at byte {}",
            self.1, self.0
        )
    }
}

impl std::fmt::Debug for LexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self}")
    }
}

pub struct Lexer<'input> {
    input: &'input str,
    pos: usize,
    whitespace: Regex,
    matchers: Vec<(Regex, TokenKind)>,
}

impl<'input> Lexer<'input> {
    pub fn new(input: &'input str) -> Self {
        use TokenKind::*;

        let matcher = |re, kind| (Regex::new(re).unwrap(), kind);
        Lexer {
            input,
            pos: 0,
            // Skip everything horizontal; newlines are tokens here.
            whitespace: Regex::new(r"\A(?:[ \t\f\r\v]|(?:#[^\n]*))*").unwrap(),
            matchers: vec![
                matcher(r"\A@[A-Za-z_][A-Za-z0-9_]*", Meta),
                matcher(r"\A-?[0-9]+\.[0-9]+", Float),
                matcher(r"\A-?[0-9]+", Int),
                matcher(r"\A'(?:\\.|[^'\\])'", Char),
                matcher(r#"\A"(?:\\.|[^"\\])*""#, Str),
                matcher(r"\A(?:true|false)\b", Bool),
                matcher(r"\A[A-Za-z_][A-Za-z0-9_]*", Id),
                matcher(r"\A,", Comma),
                matcher(r"\A\[", LBracket),
                matcher(r"\A\]", RBracket),
                matcher(r"\A\n", Newline),
            ],
        }
    }

    /// Byte offset of the next unread character.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Has the lexer reached the end of input?
    pub fn end_of_input(&self) -> bool {
        self.pos == self.input.len()
    }

    // Skip comments and whitespace
    fn skip_whitespace(&mut self) {
        if let Some(m) = self.whitespace.find(&self.input[self.pos..]) {
            self.pos += m.end()
        }
    }

    /// Get the next token if possible.
    ///
    /// The return type distinguishes between end-of-input and lexer error.
    pub fn next(&mut self) -> Result<Option<Token<'input>>, LexError> {
        self.skip_whitespace();
        if self.end_of_input() {
            return Ok(None);
        }

        let rest = &self.input[self.pos..];
        for (re, kind) in &self.matchers {
            if let Some(m) = re.find(rest) {
                let text = &rest[..m.end()];
                self.pos += m.end();
                return Ok(Some(Token { kind: *kind, text }));
            }
        }

        // No matcher applies, report the offending character.
        let c = rest.chars().next().unwrap();
        Err(LexError(self.pos, c))
    }
}
