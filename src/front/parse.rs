//! The parser.
//!
//! Each non-empty line is one instruction: an opcode name followed by
//! comma-separated operands.  All operand typing happens here; the machine
//! never sees raw text.

use std::fmt::Debug;

use derive_more::Display;

use crate::common::Id;
use crate::tac::{Index, Instruction, Opcode, Program, Value, VarRef};

use super::lex::{Lexer, Token, TokenKind};

#[derive(Display)]
#[display("parse error at line {line}: {msg}")]
pub struct ParseError {
    pub line: usize,
    msg: String,
}

impl ParseError {
    fn new(line: usize, msg: impl Into<String>) -> Self {
        ParseError {
            line,
            msg: msg.into(),
        }
    }
}

impl Debug for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self}")
    }
}

/// Parse a whole TAC source file into a program.
pub fn parse(input: &str) -> Result<Program, ParseError> {
    let mut lexer = Lexer::new(input);
    let mut lines: Vec<Vec<Token>> = vec![Vec::new()];
    loop {
        match lexer.next() {
            Ok(None) => break,
            Ok(Some(tok)) if tok.kind() == TokenKind::Newline => lines.push(Vec::new()),
            Ok(Some(tok)) => lines.last_mut().unwrap().push(tok),
            Err(err) => {
                let line = input[..err.0].matches('\n').count() + 1;
                return Err(ParseError::new(line, err.to_string()));
            }
        }
    }

    let mut program = Program::new();
    for (i, tokens) in lines.iter().enumerate() {
        if tokens.is_empty() {
            continue; // blank or comment-only line
        }
        program.push(parse_line(tokens, i + 1)?);
    }
    Ok(program)
}

/// Parse one instruction from the tokens of a single line.
fn parse_line(tokens: &[Token], line: usize) -> Result<Instruction, ParseError> {
    let (head, mut rest) = tokens.split_first().unwrap();
    if !matches!(head.kind(), TokenKind::Id | TokenKind::Meta) {
        return Err(ParseError::new(
            line,
            format!("expected an opcode, found {head}"),
        ));
    }
    let op: Opcode = head
        .text()
        .parse()
        .map_err(|err| ParseError::new(line, format!("{err}")))?;

    let mut args = Vec::new();
    while !rest.is_empty() {
        if !args.is_empty() {
            let (comma, after) = rest.split_first().unwrap();
            if comma.kind() != TokenKind::Comma {
                return Err(ParseError::new(
                    line,
                    format!("expected ',' between operands, found {comma}"),
                ));
            }
            if after.is_empty() {
                return Err(ParseError::new(line, "expected an operand after ','"));
            }
            rest = after;
        }
        let (value, after) = parse_operand(rest, line)?;
        args.push(value);
        rest = after;
    }

    Ok(Instruction::new(op, args))
}

/// Parse a single operand, returning it and the unconsumed tokens.
fn parse_operand<'a, 'src>(
    tokens: &'a [Token<'src>],
    line: usize,
) -> Result<(Value, &'a [Token<'src>]), ParseError> {
    let (tok, rest) = tokens.split_first().unwrap();
    let value = match tok.kind() {
        TokenKind::Int => Value::Int(
            tok.text()
                .parse()
                .map_err(|_| ParseError::new(line, format!("integer out of range: {}", tok.text())))?,
        ),
        TokenKind::Float => Value::Float(
            tok.text()
                .parse()
                .map_err(|_| ParseError::new(line, format!("bad float literal: {}", tok.text())))?,
        ),
        TokenKind::Bool => Value::Bool(tok.text() == "true"),
        TokenKind::Char => Value::Char(unescape_char(tok.text(), line)?),
        TokenKind::Str => Value::Str(unescape_str(tok.text(), line)?),
        TokenKind::Id => return parse_variable(tok, rest, line),
        _ => {
            return Err(ParseError::new(
                line,
                format!("expected an operand, found {tok}"),
            ))
        }
    };
    Ok((value, rest))
}

/// Parse a variable reference, plain `name` or indexed `name[expr]`.
fn parse_variable<'a, 'src>(
    name: &Token<'src>,
    rest: &'a [Token<'src>],
    line: usize,
) -> Result<(Value, &'a [Token<'src>]), ParseError> {
    let id = Id::from_ref(name.text());
    match rest.first() {
        Some(tok) if tok.kind() == TokenKind::LBracket => {}
        _ => return Ok((Value::Var(VarRef::plain(id)), rest)),
    }

    // name[expr]: expr is an integer literal or another identifier
    let index = match rest.get(1) {
        Some(tok) if tok.kind() == TokenKind::Int => Index::Const(
            tok.text()
                .parse()
                .map_err(|_| ParseError::new(line, format!("index out of range: {}", tok.text())))?,
        ),
        Some(tok) if tok.kind() == TokenKind::Id => Index::Name(Id::from_ref(tok.text())),
        _ => {
            return Err(ParseError::new(
                line,
                format!("expected an index after '{id}['"),
            ))
        }
    };
    match rest.get(2) {
        Some(tok) if tok.kind() == TokenKind::RBracket => {}
        _ => return Err(ParseError::new(line, format!("missing ']' after index of '{id}'"))),
    }

    Ok((Value::Var(VarRef::access(id, index)), &rest[3..]))
}

/// Decode the escapes of a quoted string literal, quotes included.
fn unescape_str(text: &str, line: usize) -> Result<String, ParseError> {
    unescape(&text[1..text.len() - 1], line)
}

/// Decode a quoted character literal into its byte value.
fn unescape_char(text: &str, line: usize) -> Result<u8, ParseError> {
    let decoded = unescape(&text[1..text.len() - 1], line)?;
    let mut bytes = decoded.bytes();
    match (bytes.next(), bytes.next()) {
        (Some(b), None) => Ok(b),
        _ => Err(ParseError::new(
            line,
            format!("character literal must be a single byte: {text}"),
        )),
    }
}

fn unescape(body: &str, line: usize) -> Result<String, ParseError> {
    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        // The lexer guarantees a character follows every backslash.
        let escaped = chars.next().unwrap();
        out.push(match escaped {
            'n' => '\n',
            't' => '\t',
            'r' => '\r',
            '0' => '\0',
            '\\' => '\\',
            '\'' => '\'',
            '"' => '"',
            _ => {
                return Err(ParseError::new(
                    line,
                    format!("unknown escape sequence: \\{escaped}"),
                ))
            }
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_literal_operands() {
        let program = parse("assignw x, 12\nassignw f, 1.25\nassignb c, 'a'\nassignb b, true\n")
            .unwrap();
        assert_eq!(program[0].args[1], Value::Int(12));
        assert_eq!(program[1].args[1], Value::Float(1.25));
        assert_eq!(program[2].args[1], Value::Char(b'a'));
        assert_eq!(program[3].args[1], Value::Bool(true));
    }

    #[test]
    fn parses_indexed_variables() {
        let program = parse("assignw x[4], y[i]").unwrap();
        let x = Id::from_ref("x");
        let y = Id::from_ref("y");
        let i = Id::from_ref("i");
        assert_eq!(
            program[0].args,
            vec![
                Value::Var(VarRef::access(x, Index::Const(4))),
                Value::Var(VarRef::access(y, Index::Name(i))),
            ]
        );
    }

    #[test]
    fn parses_meta_and_string() {
        let program = parse("@string s, \"hi\\n\"\nprint s\nexit 0\n").unwrap();
        assert_eq!(program.len(), 3);
        assert_eq!(program[0].op, Opcode::StaticStr);
        assert_eq!(program[0].args[1], Value::Str("hi\n".into()));
        assert_eq!(program[2].op, Opcode::Exit);
    }

    #[test]
    fn skips_blank_and_comment_lines() {
        let program = parse("\n# setup\n\nexit 0\n# trailing\n").unwrap();
        assert_eq!(program.len(), 1);
        assert_eq!(program[0].op, Opcode::Exit);
    }

    #[test]
    fn reports_line_numbers() {
        let err = parse("exit 0\nnonsense x\n").unwrap_err();
        assert_eq!(err.line, 2);

        let err = parse("exit 0\nadd x 1, 2\n").unwrap_err();
        assert_eq!(err.line, 2);

        let err = parse("exit 0\n\nadd x, $\n").unwrap_err();
        assert_eq!(err.line, 3);
    }

    #[test]
    fn rejects_malformed_indexing() {
        assert!(parse("assignw x[, 2").is_err());
        assert!(parse("assignw x[1, 2").is_err());
        assert!(parse("assignw x[1.5], 2").is_err());
    }
}
