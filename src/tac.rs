//! The three-address-code instruction model.
//!
//! A program is a flat ordered sequence of [Instruction]s.  Every operand is
//! fully typed at parse time; the machine consumes this representation as-is.

use std::fmt;
use std::str::FromStr;

use derive_more::Display;

use crate::common::Id;

/// Instruction opcodes, spelled the way they appear in source.
///
/// Meta opcodes carry a leading `@` and describe data or program structure
/// rather than computation.
#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq)]
pub enum Opcode {
    // meta
    #[display("@staticv")]
    Staticv,
    #[display("@string")]
    StaticStr,
    #[display("@label")]
    Label,
    #[display("@function_begin")]
    FunBegin,
    #[display("@function_end")]
    FunEnd,
    // data movement
    #[display("assignw")]
    Assignw,
    #[display("assignb")]
    Assignb,
    // arithmetic
    #[display("add")]
    Add,
    #[display("sub")]
    Sub,
    #[display("mult")]
    Mult,
    #[display("div")]
    Div,
    #[display("mod")]
    Mod,
    #[display("minus")]
    Minus,
    #[display("neg")]
    Neg,
    // relational
    #[display("eq")]
    Eq,
    #[display("neq")]
    Neq,
    #[display("lt")]
    Lt,
    #[display("leq")]
    Leq,
    #[display("gt")]
    Gt,
    #[display("geq")]
    Geq,
    // logical
    #[display("and")]
    And,
    #[display("or")]
    Or,
    // control flow
    #[display("goto")]
    Goto,
    #[display("goif")]
    Goif,
    #[display("goifnot")]
    Goifnot,
    // memory
    #[display("malloc")]
    Malloc,
    #[display("memcpy")]
    Memcpy,
    #[display("free")]
    Free,
    // procedure
    #[display("param")]
    Param,
    #[display("call")]
    Call,
    #[display("return")]
    Return,
    #[display("exit")]
    Exit,
    // I/O
    #[display("printi")]
    Printi,
    #[display("printf")]
    Printf,
    #[display("print")]
    Print,
    #[display("printc")]
    Printc,
    #[display("readi")]
    Readi,
    #[display("readf")]
    Readf,
    #[display("read")]
    Read,
    #[display("readc")]
    Readc,
    // conversion
    #[display("ftoi")]
    Ftoi,
    #[display("itof")]
    Itof,
}

/// The opcode name was not one of the known instruction spellings.
#[derive(Display)]
#[display("unknown opcode: '{_0}'")]
pub struct UnknownOpcode(pub String);

impl fmt::Debug for UnknownOpcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl FromStr for Opcode {
    type Err = UnknownOpcode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        use Opcode::*;

        let op = match s {
            "@staticv" => Staticv,
            "@string" => StaticStr,
            "@label" => Label,
            "@function_begin" => FunBegin,
            "@function_end" => FunEnd,
            "assignw" => Assignw,
            "assignb" => Assignb,
            "add" => Add,
            "sub" => Sub,
            "mult" => Mult,
            "div" => Div,
            "mod" => Mod,
            "minus" => Minus,
            "neg" => Neg,
            "eq" => Eq,
            "neq" => Neq,
            "lt" => Lt,
            "leq" => Leq,
            "gt" => Gt,
            "geq" => Geq,
            "and" => And,
            "or" => Or,
            "goto" => Goto,
            "goif" => Goif,
            "goifnot" => Goifnot,
            "malloc" => Malloc,
            "memcpy" => Memcpy,
            "free" => Free,
            "param" => Param,
            "call" => Call,
            "return" => Return,
            "exit" => Exit,
            "printi" => Printi,
            "printf" => Printf,
            "print" => Print,
            "printc" => Printc,
            "readi" => Readi,
            "readf" => Readf,
            "read" => Read,
            "readc" => Readc,
            "ftoi" => Ftoi,
            "itof" => Itof,
            _ => return Err(UnknownOpcode(s.to_string())),
        };
        Ok(op)
    }
}

/// Index part of a variable reference: `name`, `name[3]` or `name[other]`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Index {
    /// Plain variable, no index.
    None,
    /// Integer-literal index, in bytes.
    Const(i32),
    /// Indirect index: the value of another register.
    Name(Id),
}

/// A reference to a register or, with `is_access`, to a memory address.
///
/// Without brackets the name denotes a register.  The bracketed form
/// `name[index]` addresses memory at `register[name] + index`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct VarRef {
    pub name: Id,
    pub index: Index,
    pub is_access: bool,
}

impl VarRef {
    /// A plain register reference.
    pub fn plain(name: Id) -> Self {
        VarRef {
            name,
            index: Index::None,
            is_access: false,
        }
    }

    /// A memory access through `name[index]`.
    pub fn access(name: Id, index: Index) -> Self {
        VarRef {
            name,
            index,
            is_access: true,
        }
    }
}

impl fmt::Display for VarRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if self.is_access {
            match self.index {
                Index::None => write!(f, "[0]")?,
                Index::Const(i) => write!(f, "[{i}]")?,
                Index::Name(n) => write!(f, "[{n}]")?,
            }
        }
        Ok(())
    }
}

/// A fully typed instruction operand.
#[derive(Clone, Debug, Display, PartialEq)]
pub enum Value {
    #[display("{_0}")]
    Bool(bool),
    #[display("'{}'", char::from(*_0))]
    Char(u8),
    #[display("{_0}")]
    Int(i32),
    #[display("{_0}")]
    Float(f32),
    #[display("\"{_0}\"")]
    Str(String),
    #[display("{_0}")]
    Var(VarRef),
}

/// One instruction: an opcode plus up to three operands.
#[derive(Clone, Debug, PartialEq)]
pub struct Instruction {
    pub op: Opcode,
    pub args: Vec<Value>,
}

impl Instruction {
    pub fn new(op: Opcode, args: Vec<Value>) -> Self {
        Instruction { op, args }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.op)?;
        for (i, arg) in self.args.iter().enumerate() {
            if i == 0 {
                write!(f, " {arg}")?;
            } else {
                write!(f, ", {arg}")?;
            }
        }
        Ok(())
    }
}

/// A parsed program: the ordered instruction sequence the machine runs.
pub type Program = Vec<Instruction>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_spellings_round_trip() {
        for op in [
            Opcode::Staticv,
            Opcode::StaticStr,
            Opcode::FunBegin,
            Opcode::Assignw,
            Opcode::Mod,
            Opcode::Goifnot,
            Opcode::Return,
            Opcode::Itof,
        ] {
            assert_eq!(op.to_string().parse::<Opcode>().unwrap(), op);
        }
        assert!("@nope".parse::<Opcode>().is_err());
        assert!("ADD".parse::<Opcode>().is_err());
    }

    #[test]
    fn instruction_display() {
        let x = Id::from_ref("x");
        let inst = Instruction::new(
            Opcode::Assignw,
            vec![
                Value::Var(VarRef::access(x, Index::Const(4))),
                Value::Int(-2),
            ],
        );
        assert_eq!(inst.to_string(), "assignw x[4], -2");

        let exit = Instruction::new(Opcode::Exit, vec![Value::Int(0)]);
        assert_eq!(exit.to_string(), "exit 0");
    }

    #[test]
    fn value_display() {
        assert_eq!(Value::Char(b'a').to_string(), "'a'");
        assert_eq!(Value::Str("hi".into()), Value::Str("hi".into()));
        assert_eq!(Value::Str("hi".into()).to_string(), "\"hi\"");
        assert_eq!(Value::Var(VarRef::plain(Id::from_ref("t0"))).to_string(), "t0");
    }
}
