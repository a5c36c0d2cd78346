//! The TAC machine.
//!
//! Construction pre-scans the program and indexes every `@label` and
//! `@function_begin` name; `run` then drives the fetch/execute/advance loop
//! until the program falls off the end, executes `exit`, or an instruction
//! fails.  Jumping instructions set the program counter to `target - 1` so
//! the loop's unconditional increment lands on the target.

use std::fmt::Write as _;
use std::io::{self, BufRead, Write};

use derive_more::{Display, From};
use log::{error, trace, warn};

use crate::common::{Id, Map};
use crate::tac::{Index, Instruction, Opcode, Program, Value, VarRef};

use super::memory::Memory;
use super::regs::{CallStack, Frame};

/// Reserved register name aliasing the frame pointer.
pub const BASE: &str = "BASE";
/// Reserved register name aliasing the stack pointer.
pub const STACK: &str = "STACK";

/// Machine status.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum Status {
    #[display("NOT_STARTED")]
    NotStarted,
    #[display("RUNNING")]
    Running,
    #[display("FINISHED")]
    Finished,
    #[display("ERROR")]
    Error,
}

/// Scalar type of an arithmetic operand.
///
/// Variables carry no declared type; a register holds a float exactly when
/// its name starts with `f`.  This convention is load-bearing for existing
/// TAC generators and is implemented as-is.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum NumType {
    #[display("int")]
    Int,
    #[display("float")]
    Float,
}

/// Why an instruction (or machine construction) failed.
#[derive(Debug, Display, From)]
pub enum ExecError {
    #[display("{_0}")]
    #[from]
    Memory(super::memory::MemoryError),
    #[display("trying to access invalid register: '{_0}'")]
    UndefinedRegister(Id),
    #[display("branch target does not exist: '{_0}'")]
    UndefinedLabel(Id),
    #[display("duplicated label or function name: '{_0}'")]
    DuplicateLabel(Id),
    #[display("return without a pending call")]
    CallstackUnderflow,
    #[display("type mismatch in '{op}': {lhs} and {rhs} operands")]
    TypeMismatch {
        op: Opcode,
        lhs: NumType,
        rhs: NumType,
    },
    #[display("division by zero")]
    DivisionByZero,
    #[display("'mod' is undefined for float operands")]
    FloatModulo,
    #[display("a string literal has no scalar value")]
    StringOperand,
    #[display("malformed instruction '{inst}': {reason}")]
    Malformed { inst: Instruction, reason: String },
    #[display("cannot parse program input: '{_0}'")]
    ReadParse(String),
    #[display("i/o failure: {_0}")]
    #[from]
    Io(io::Error),
}

/// State saved by `call` and consumed by `return`/`@function_end`.
struct Backup {
    pc: usize,
    sp: u32,
    fp: u32,
    dest: Id,
}

/// Which sections the post-run state report includes.
#[derive(Clone, Copy, Debug, Default)]
pub struct ReportOptions {
    pub memory: bool,
    pub labels: bool,
    pub registers: bool,
    pub callstack: bool,
    /// Raw stack bytes to show even past the stack pointer.
    pub stack_mem_bytes: u32,
}

/// The virtual machine: program, label index, register file, memory and the
/// run-loop state.
pub struct Machine {
    program: Program,
    labels: Map<Id, usize>,
    pc: usize,
    fp: u32,
    exit_code: u32,
    status: Status,
    memory: Memory,
    callstack: CallStack,
    backups: Vec<Backup>,
    input: Box<dyn BufRead>,
    output: Box<dyn Write>,
}

impl Machine {
    /// Build a machine for `program`, indexing its labels and function
    /// entries.  Duplicate names are a construction failure.
    pub fn new(program: Program) -> Result<Self, ExecError> {
        let labels = scan_labels(&program)?;
        let memory = Memory::new();
        let fp = memory.sp();
        Ok(Machine {
            program,
            labels,
            pc: 0,
            fp,
            exit_code: 0,
            status: Status::NotStarted,
            memory,
            callstack: CallStack::new(fp),
            backups: Vec::new(),
            input: Box::new(io::stdin().lock()),
            output: Box::new(io::stdout()),
        })
    }

    /// Replace the machine's input and output streams.
    pub fn with_io(mut self, input: impl BufRead + 'static, output: impl Write + 'static) -> Self {
        self.input = Box::new(input);
        self.output = Box::new(output);
        self
    }

    /// Run the program to termination.
    pub fn run(&mut self) {
        self.status = Status::Running;
        self.pc = 0;
        while self.status == Status::Running {
            if self.pc == self.program.len() {
                self.status = Status::Finished;
                break;
            }
            let inst = self.program[self.pc].clone();
            trace!("running instruction {}: {inst}", self.pc);
            if let Err(err) = self.execute(&inst) {
                error!("at instruction {} '{inst}': {err}", self.pc);
                self.status = Status::Error;
                break;
            }
            // Jumps park the counter one short of their target.
            self.pc = self.pc.wrapping_add(1);
        }
    }

    pub fn pc(&self) -> usize {
        self.pc
    }

    pub fn frame_pointer(&self) -> u32 {
        self.fp
    }

    pub fn stack_pointer(&self) -> u32 {
        self.memory.sp()
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn exit_code(&self) -> u32 {
        self.exit_code
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn callstack(&self) -> &CallStack {
        &self.callstack
    }

    // -- registers ---------------------------------------------------------

    /// Read a register.  `BASE` and `STACK` bypass the register file.
    fn get_register(&self, name: Id) -> Result<u32, ExecError> {
        match name.as_str() {
            BASE => Ok(self.fp),
            STACK => Ok(self.memory.sp()),
            _ => self
                .callstack
                .get(name)
                .ok_or(ExecError::UndefinedRegister(name)),
        }
    }

    /// Write a register in the current frame.  Writing `BASE` or `STACK`
    /// moves the frame or stack pointer instead.
    fn set_register(&mut self, name: Id, value: u32) -> Result<(), ExecError> {
        match name.as_str() {
            BASE => {
                self.fp = value;
                Ok(())
            }
            STACK => Ok(self.memory.set_sp(value)?),
            _ => {
                self.callstack.set(name, value);
                Ok(())
            }
        }
    }

    // -- operand evaluation ------------------------------------------------

    fn index_value(&self, index: Index) -> Result<u32, ExecError> {
        match index {
            Index::None => Ok(0),
            Index::Const(i) => Ok(i as u32),
            Index::Name(name) => self.get_register(name),
        }
    }

    /// The raw value of a variable operand: a virtual address for accesses,
    /// the register word otherwise.
    fn get_var_value(&self, var: &VarRef) -> Result<u32, ExecError> {
        let base = self.get_register(var.name)?;
        if var.is_access {
            Ok(base.wrapping_add(self.index_value(var.index)?))
        } else {
            Ok(base)
        }
    }

    /// The value a variable operand stands for, reading memory on accesses.
    fn access_var_value(&mut self, var: &VarRef) -> Result<u32, ExecError> {
        if var.is_access {
            let addr = self.get_var_value(var)?;
            Ok(self.memory.read_word(addr)?)
        } else {
            self.get_register(var.name)
        }
    }

    /// The word an operand evaluates to; scalars become their bit patterns.
    fn actual_value(&mut self, value: &Value) -> Result<u32, ExecError> {
        match value {
            Value::Bool(b) => Ok(u32::from(*b)),
            Value::Char(c) => Ok(u32::from(*c)),
            Value::Int(i) => Ok(*i as u32),
            Value::Float(f) => Ok(f.to_bits()),
            Value::Var(var) => self.access_var_value(var),
            Value::Str(_) => Err(ExecError::StringOperand),
        }
    }

    /// Store a result where a destination operand points: a register, or
    /// memory when the operand is an access.
    fn write_dest(&mut self, var: &VarRef, value: u32) -> Result<(), ExecError> {
        if var.is_access {
            let addr = self.get_var_value(var)?;
            Ok(self.memory.write_word(value, addr)?)
        } else {
            self.set_register(var.name, value)
        }
    }

    /// Scalar type of an arithmetic operand; variables follow the leading-`f`
    /// name convention.
    fn num_type(&self, value: &Value) -> Result<NumType, ExecError> {
        match value {
            Value::Float(_) => Ok(NumType::Float),
            Value::Int(_) | Value::Char(_) | Value::Bool(_) => Ok(NumType::Int),
            Value::Var(var) => Ok(if var.name.as_str().starts_with('f') {
                NumType::Float
            } else {
                NumType::Int
            }),
            Value::Str(_) => Err(ExecError::StringOperand),
        }
    }

    // -- dispatch ----------------------------------------------------------

    fn execute(&mut self, inst: &Instruction) -> Result<(), ExecError> {
        use Opcode::*;

        match inst.op {
            Staticv => self.exec_staticv(inst),
            StaticStr => self.exec_static_str(inst),
            Label => Ok(()),
            FunBegin => self.exec_fun_begin(inst),
            FunEnd => self.exec_fun_end(inst),
            Assignw => self.exec_assign(inst, true),
            Assignb => self.exec_assign(inst, false),
            Add | Sub | Mult | Div | Mod => self.exec_arith(inst),
            Minus => self.exec_minus(inst),
            Neg => self.exec_neg(inst),
            Eq | Neq | Lt | Leq | Gt | Geq => self.exec_relational(inst),
            And | Or => self.exec_logical(inst),
            Goto => {
                expect_arity(inst, 1)?;
                self.jump_to(name_arg(inst, 0)?)
            }
            Goif => self.exec_goif(inst, true),
            Goifnot => self.exec_goif(inst, false),
            Malloc => self.exec_malloc(inst),
            Memcpy => self.exec_memcpy(inst),
            Free => self.exec_free(inst),
            Param => self.exec_param(inst),
            Call => self.exec_call(inst),
            Return => self.exec_return(inst),
            Exit => self.exec_exit(inst),
            Printi | Printf | Print | Printc => self.exec_print(inst),
            Readi | Readf | Read | Readc => self.exec_read(inst),
            Ftoi | Itof => self.exec_convert(inst),
        }
    }

    // -- meta --------------------------------------------------------------

    fn exec_staticv(&mut self, inst: &Instruction) -> Result<(), ExecError> {
        expect_arity(inst, 2)?;
        let name = name_arg(inst, 0)?;
        let size = self.actual_value(arg(inst, 1)?)?;
        let addr = self.memory.static_alloc(size);
        self.set_register(name, addr)
    }

    fn exec_static_str(&mut self, inst: &Instruction) -> Result<(), ExecError> {
        expect_arity(inst, 2)?;
        let name = name_arg(inst, 0)?;
        let literal = str_arg(inst, 1)?;
        let mut bytes = literal.as_bytes().to_vec();
        bytes.push(0);
        let addr = self.memory.static_alloc(bytes.len() as u32);
        self.memory.write(addr, &bytes)?;
        self.set_register(name, addr)
    }

    fn exec_fun_begin(&mut self, inst: &Instruction) -> Result<(), ExecError> {
        expect_arity(inst, 2)?;
        let name = name_arg(inst, 0)?;
        let stack_size = self.actual_value(arg(inst, 1)?)?;
        // The frame starts where the caller's stack ended.
        let fp = self.memory.sp();
        self.fp = fp;
        self.memory.reserve_stack(stack_size)?;
        self.callstack.push(Frame::new(name, fp));
        Ok(())
    }

    fn exec_fun_end(&mut self, inst: &Instruction) -> Result<(), ExecError> {
        expect_arity(inst, 0)?;
        let backup = self.backups.pop().ok_or(ExecError::CallstackUnderflow)?;
        self.pc = backup.pc;
        self.memory.set_sp(backup.sp)?;
        self.fp = backup.fp;
        self.callstack.pop().ok_or(ExecError::CallstackUnderflow)?;
        Ok(())
    }

    // -- data movement -----------------------------------------------------

    fn exec_assign(&mut self, inst: &Instruction, word: bool) -> Result<(), ExecError> {
        expect_arity(inst, 2)?;
        let lhs = *var_arg(inst, 0)?;
        let rhs = arg(inst, 1)?;

        // name[i] := other[j] would need a fourth address; three-address
        // code cannot express it.
        if let Value::Var(rv) = rhs {
            if lhs.is_access && rv.is_access {
                return Err(malformed(inst, "both operands access memory"));
            }
        }
        if word && matches!(rhs, Value::Char(_) | Value::Bool(_)) {
            warn!("byte value widens to a full word in '{inst}'");
        }

        if word {
            let value = self.actual_value(rhs)?;
            self.write_dest(&lhs, value)
        } else {
            let value = match rhs {
                Value::Var(rv) if rv.is_access => {
                    let addr = self.get_var_value(rv)?;
                    u32::from(self.memory.read_byte(addr)?)
                }
                other => self.actual_value(other)? & 0xFF,
            };
            if lhs.is_access {
                let addr = self.get_var_value(&lhs)?;
                Ok(self.memory.write_byte(value as u8, addr)?)
            } else {
                self.set_register(lhs.name, value)
            }
        }
    }

    // -- arithmetic & logic ------------------------------------------------

    fn exec_arith(&mut self, inst: &Instruction) -> Result<(), ExecError> {
        expect_arity(inst, 3)?;
        let dest = *var_arg(inst, 0)?;
        let (lop, rop) = (arg(inst, 1)?, arg(inst, 2)?);
        let (lt, rt) = (self.num_type(lop)?, self.num_type(rop)?);
        if lt != rt {
            return Err(ExecError::TypeMismatch {
                op: inst.op,
                lhs: lt,
                rhs: rt,
            });
        }
        let lv = self.actual_value(lop)?;
        let rv = self.actual_value(rop)?;

        let result = match lt {
            NumType::Int => {
                let (l, r) = (lv as i32, rv as i32);
                match inst.op {
                    Opcode::Add => l.wrapping_add(r) as u32,
                    Opcode::Sub => l.wrapping_sub(r) as u32,
                    Opcode::Mult => l.wrapping_mul(r) as u32,
                    Opcode::Div => {
                        if r == 0 {
                            return Err(ExecError::DivisionByZero);
                        }
                        l.wrapping_div(r) as u32
                    }
                    Opcode::Mod => {
                        if r == 0 {
                            return Err(ExecError::DivisionByZero);
                        }
                        l.wrapping_rem(r) as u32
                    }
                    _ => unreachable!("not an arithmetic opcode"),
                }
            }
            NumType::Float => {
                let (l, r) = (f32::from_bits(lv), f32::from_bits(rv));
                match inst.op {
                    Opcode::Add => (l + r).to_bits(),
                    Opcode::Sub => (l - r).to_bits(),
                    Opcode::Mult => (l * r).to_bits(),
                    Opcode::Div => {
                        if r == 0.0 {
                            return Err(ExecError::DivisionByZero);
                        }
                        (l / r).to_bits()
                    }
                    Opcode::Mod => return Err(ExecError::FloatModulo),
                    _ => unreachable!("not an arithmetic opcode"),
                }
            }
        };
        self.write_dest(&dest, result)
    }

    fn exec_minus(&mut self, inst: &Instruction) -> Result<(), ExecError> {
        expect_arity(inst, 2)?;
        let dest = *var_arg(inst, 0)?;
        let value = self.actual_value(arg(inst, 1)?)?;
        // Unary negation follows the destination's name convention.
        let result = if dest.name.as_str().starts_with('f') {
            (-f32::from_bits(value)).to_bits()
        } else {
            (value as i32).wrapping_neg() as u32
        };
        self.write_dest(&dest, result)
    }

    fn exec_neg(&mut self, inst: &Instruction) -> Result<(), ExecError> {
        expect_arity(inst, 2)?;
        let dest = *var_arg(inst, 0)?;
        let value = self.actual_value(arg(inst, 1)?)?;
        self.write_dest(&dest, !value)
    }

    fn exec_relational(&mut self, inst: &Instruction) -> Result<(), ExecError> {
        expect_arity(inst, 3)?;
        let dest = *var_arg(inst, 0)?;
        let (lop, rop) = (arg(inst, 1)?, arg(inst, 2)?);

        let truth = match inst.op {
            // Plain bit equality, no numeric typing involved.
            Opcode::Eq => self.actual_value(lop)? == self.actual_value(rop)?,
            Opcode::Neq => self.actual_value(lop)? != self.actual_value(rop)?,
            _ => {
                let (lt, rt) = (self.num_type(lop)?, self.num_type(rop)?);
                if lt != rt {
                    return Err(ExecError::TypeMismatch {
                        op: inst.op,
                        lhs: lt,
                        rhs: rt,
                    });
                }
                let lv = self.actual_value(lop)?;
                let rv = self.actual_value(rop)?;
                match lt {
                    NumType::Int => {
                        let (l, r) = (lv as i32, rv as i32);
                        match inst.op {
                            Opcode::Lt => l < r,
                            Opcode::Leq => l <= r,
                            Opcode::Gt => l > r,
                            Opcode::Geq => l >= r,
                            _ => unreachable!("not a relational opcode"),
                        }
                    }
                    NumType::Float => {
                        let (l, r) = (f32::from_bits(lv), f32::from_bits(rv));
                        match inst.op {
                            Opcode::Lt => l < r,
                            Opcode::Leq => l <= r,
                            Opcode::Gt => l > r,
                            Opcode::Geq => l >= r,
                            _ => unreachable!("not a relational opcode"),
                        }
                    }
                }
            }
        };
        self.write_dest(&dest, u32::from(truth))
    }

    fn exec_logical(&mut self, inst: &Instruction) -> Result<(), ExecError> {
        expect_arity(inst, 3)?;
        let dest = *var_arg(inst, 0)?;
        // Booleans live in the low byte of a word.
        let l = self.actual_value(arg(inst, 1)?)? & 0xFF != 0;
        let r = self.actual_value(arg(inst, 2)?)? & 0xFF != 0;
        let truth = match inst.op {
            Opcode::And => l && r,
            Opcode::Or => l || r,
            _ => unreachable!("not a logical opcode"),
        };
        self.write_dest(&dest, u32::from(truth))
    }

    // -- control flow ------------------------------------------------------

    fn jump_to(&mut self, label: Id) -> Result<(), ExecError> {
        let target = self.resolve(label)?;
        self.pc = target.wrapping_sub(1);
        Ok(())
    }

    fn resolve(&self, label: Id) -> Result<usize, ExecError> {
        self.labels
            .get(&label)
            .copied()
            .ok_or(ExecError::UndefinedLabel(label))
    }

    fn exec_goif(&mut self, inst: &Instruction, wanted: bool) -> Result<(), ExecError> {
        expect_arity(inst, 2)?;
        let label = name_arg(inst, 0)?;
        let cond = self.actual_value(arg(inst, 1)?)? != 0;
        if cond == wanted {
            self.jump_to(label)?;
        }
        Ok(())
    }

    // -- memory ------------------------------------------------------------

    fn exec_malloc(&mut self, inst: &Instruction) -> Result<(), ExecError> {
        expect_arity(inst, 2)?;
        let dest = *var_arg(inst, 0)?;
        let size = self.actual_value(arg(inst, 1)?)?;
        let addr = self.memory.malloc(size);
        self.write_dest(&dest, addr)
    }

    fn exec_free(&mut self, inst: &Instruction) -> Result<(), ExecError> {
        expect_arity(inst, 1)?;
        let addr = self.actual_value(arg(inst, 0)?)?;
        Ok(self.memory.free(addr)?)
    }

    fn exec_memcpy(&mut self, inst: &Instruction) -> Result<(), ExecError> {
        expect_arity(inst, 3)?;
        let dst = self.actual_value(arg(inst, 0)?)?;
        let src = self.actual_value(arg(inst, 1)?)?;
        let len = self.actual_value(arg(inst, 2)?)?;
        Ok(self.memory.move_bytes(src, dst, len)?)
    }

    // -- procedure protocol ------------------------------------------------

    fn exec_param(&mut self, inst: &Instruction) -> Result<(), ExecError> {
        expect_arity(inst, 2)?;
        let dest = *var_arg(inst, 0)?;
        let offset = self.actual_value(arg(inst, 1)?)?;
        // Caller-stored parameters sit in the slack right above SP; hand the
        // callee their address.
        let addr = self.memory.sp().wrapping_add(offset);
        self.write_dest(&dest, addr)
    }

    fn exec_call(&mut self, inst: &Instruction) -> Result<(), ExecError> {
        expect_arity(inst, 2)?;
        let dest = name_arg(inst, 0)?;
        let function = name_arg(inst, 1)?;
        let target = self.resolve(function)?;
        self.backups.push(Backup {
            pc: self.pc,
            sp: self.memory.sp(),
            fp: self.fp,
            dest,
        });
        self.pc = target.wrapping_sub(1);
        Ok(())
    }

    fn exec_return(&mut self, inst: &Instruction) -> Result<(), ExecError> {
        expect_arity(inst, 1)?;
        let value = self.actual_value(arg(inst, 0)?)?;
        self.callstack.pop().ok_or(ExecError::CallstackUnderflow)?;
        let backup = self.backups.pop().ok_or(ExecError::CallstackUnderflow)?;
        self.pc = backup.pc;
        self.memory.set_sp(backup.sp)?;
        self.fp = backup.fp;
        // The caller's frame is on top again; give it the return value.
        self.set_register(backup.dest, value)
    }

    fn exec_exit(&mut self, inst: &Instruction) -> Result<(), ExecError> {
        expect_arity(inst, 1)?;
        self.exit_code = self.actual_value(arg(inst, 0)?)?;
        self.status = Status::Finished;
        Ok(())
    }

    // -- I/O ---------------------------------------------------------------

    fn exec_print(&mut self, inst: &Instruction) -> Result<(), ExecError> {
        expect_arity(inst, 1)?;
        let value = self.actual_value(arg(inst, 0)?)?;
        let text = match inst.op {
            Opcode::Printi => (value as i32).to_string(),
            Opcode::Printf => f32::from_bits(value).to_string(),
            Opcode::Printc => char::from(value as u8).to_string(),
            Opcode::Print => {
                // The word is the address of a NUL-terminated string.
                let mut bytes = Vec::new();
                let mut addr = value;
                loop {
                    let byte = self.memory.read_byte(addr)?;
                    if byte == 0 {
                        break;
                    }
                    bytes.push(byte);
                    addr = addr.wrapping_add(1);
                }
                String::from_utf8_lossy(&bytes).into_owned()
            }
            _ => unreachable!("not a print opcode"),
        };
        writeln!(self.output, "program: {text}")?;
        self.output.flush()?;
        Ok(())
    }

    fn exec_read(&mut self, inst: &Instruction) -> Result<(), ExecError> {
        expect_arity(inst, 1)?;
        let dest = *var_arg(inst, 0)?;
        let line = self.read_line()?;
        match inst.op {
            Opcode::Readi => {
                let n: i32 = line
                    .trim()
                    .parse()
                    .map_err(|_| ExecError::ReadParse(line))?;
                self.write_dest(&dest, n as u32)
            }
            Opcode::Readf => {
                let f: f32 = line
                    .trim()
                    .parse()
                    .map_err(|_| ExecError::ReadParse(line))?;
                self.write_dest(&dest, f.to_bits())
            }
            Opcode::Readc => match line.bytes().next() {
                Some(byte) => self.write_dest(&dest, u32::from(byte)),
                None => Err(ExecError::ReadParse(line)),
            },
            Opcode::Read => {
                // The destination holds the address of the line buffer.
                let addr = self.actual_value(&Value::Var(dest))?;
                let mut bytes = line.into_bytes();
                bytes.push(0);
                Ok(self.memory.write(addr, &bytes)?)
            }
            _ => unreachable!("not a read opcode"),
        }
    }

    /// One line of program input, without its trailing newline.
    fn read_line(&mut self) -> Result<String, ExecError> {
        let mut line = String::new();
        let n = self.input.read_line(&mut line)?;
        if n == 0 {
            return Err(ExecError::ReadParse("end of input".into()));
        }
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Ok(line)
    }

    // -- conversion --------------------------------------------------------

    fn exec_convert(&mut self, inst: &Instruction) -> Result<(), ExecError> {
        expect_arity(inst, 2)?;
        let dest = *var_arg(inst, 0)?;
        let value = self.actual_value(arg(inst, 1)?)?;
        let result = match inst.op {
            Opcode::Itof => (value as i32 as f32).to_bits(),
            // Truncation toward zero.
            Opcode::Ftoi => (f32::from_bits(value) as i32) as u32,
            _ => unreachable!("not a conversion opcode"),
        };
        self.write_dest(&dest, result)
    }

    // -- reporting ---------------------------------------------------------

    /// Human readable description of the machine after a run.
    pub fn report(&self, opts: &ReportOptions) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "-- << TAC MACHINE >> ----------------------------------------");
        let _ = writeln!(out, "- Program counter (PC): {}", self.pc);
        let _ = writeln!(out, "- Frame pointer (FP): {:#x}", self.fp);
        let _ = writeln!(out, "- Stack pointer (SP): {:#x}", self.memory.sp());
        match self.program.get(self.pc) {
            Some(inst) => {
                let _ = writeln!(out, "- Current instruction: {inst}");
            }
            None => {
                let _ = writeln!(out, "- Current instruction: <Program Finished>");
            }
        }
        let _ = writeln!(out, "- Program status: {}", self.status);
        let _ = writeln!(out, "- Exit code: {}", self.exit_code);
        let active: usize = self
            .callstack
            .frames()
            .iter()
            .map(|frame| frame.registers().len())
            .sum();
        let _ = writeln!(out, "- Currently active registers: {active}");

        if opts.registers {
            for frame in self.callstack.frames().iter().rev() {
                let _ = writeln!(out, "- Registers of {}:", frame.function());
                for (name, value) in frame.registers() {
                    let _ = writeln!(out, "\t- {name} = {value:#x}");
                }
            }
        }
        if opts.labels {
            let _ = writeln!(out, "- Labels:");
            if self.labels.is_empty() {
                let _ = writeln!(out, "\t<No labels to show>");
            }
            for (name, position) in &self.labels {
                let _ = writeln!(out, "\t+ {name} : {position}");
            }
        }
        if opts.callstack {
            let _ = writeln!(out, "- Callstack:");
            let _ = write!(out, "{}", self.callstack.trace());
        }

        let _ = write!(out, "{}", self.memory.stack().report(opts.memory, opts.stack_mem_bytes));
        let _ = write!(out, "{}", self.memory.heap().report(opts.memory));
        let _ = write!(out, "{}", self.memory.statics().report(opts.memory));
        out
    }
}

/// Index every `@label` and `@function_begin` by instruction position.
fn scan_labels(program: &Program) -> Result<Map<Id, usize>, ExecError> {
    let mut labels = Map::new();
    for (position, inst) in program.iter().enumerate() {
        if !matches!(inst.op, Opcode::Label | Opcode::FunBegin) {
            continue;
        }
        let name = name_arg(inst, 0)?;
        if labels.insert(name, position).is_some() {
            return Err(ExecError::DuplicateLabel(name));
        }
    }
    Ok(labels)
}

// -- operand accessors -----------------------------------------------------

fn malformed(inst: &Instruction, reason: impl Into<String>) -> ExecError {
    ExecError::Malformed {
        inst: inst.clone(),
        reason: reason.into(),
    }
}

fn expect_arity(inst: &Instruction, n: usize) -> Result<(), ExecError> {
    if inst.args.len() != n {
        return Err(malformed(inst, format!("takes {n} operand(s)")));
    }
    Ok(())
}

fn arg<'inst>(inst: &'inst Instruction, i: usize) -> Result<&'inst Value, ExecError> {
    inst.args
        .get(i)
        .ok_or_else(|| malformed(inst, format!("missing operand {i}")))
}

fn var_arg<'inst>(inst: &'inst Instruction, i: usize) -> Result<&'inst VarRef, ExecError> {
    match arg(inst, i)? {
        Value::Var(var) => Ok(var),
        other => Err(malformed(inst, format!("operand {i} must be a variable, found {other}"))),
    }
}

/// A plain name operand: a label, function or register name.
fn name_arg(inst: &Instruction, i: usize) -> Result<Id, ExecError> {
    let var = var_arg(inst, i)?;
    if var.is_access {
        return Err(malformed(inst, format!("operand {i} must be a plain name")));
    }
    Ok(var.name)
}

fn str_arg<'inst>(inst: &'inst Instruction, i: usize) -> Result<&'inst str, ExecError> {
    match arg(inst, i)? {
        Value::Str(s) => Ok(s),
        other => Err(malformed(inst, format!("operand {i} must be a string literal, found {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::io::{self, Cursor, Write};
    use std::rc::Rc;

    use super::*;
    use crate::front::parse;
    use crate::vm::memory::STACK_START;

    /// A clonable sink, so tests can keep reading what the machine wrote.
    #[derive(Clone, Default)]
    struct SharedOutput(Rc<RefCell<Vec<u8>>>);

    impl Write for SharedOutput {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SharedOutput {
        fn text(&self) -> String {
            String::from_utf8(self.0.borrow().clone()).unwrap()
        }
    }

    fn run_with_input(source: &str, input: &str) -> (Machine, String) {
        let program = parse(source).unwrap();
        let output = SharedOutput::default();
        let mut machine = Machine::new(program)
            .unwrap()
            .with_io(Cursor::new(input.to_string()), output.clone());
        machine.run();
        let text = output.text();
        (machine, text)
    }

    fn run_source(source: &str) -> (Machine, String) {
        run_with_input(source, "")
    }

    #[test]
    fn hello_static_string() {
        let (machine, output) = run_source("@string s, \"hi\"\nprint s\nexit 0\n");
        assert_eq!(output, "program: hi\n");
        assert_eq!(machine.status(), Status::Finished);
        assert_eq!(machine.exit_code(), 0);
    }

    #[test]
    fn integer_add() {
        let source = "\
@staticv x, 4
assignw x[0], 2
assignw x[0], 2
assignw r, 3
add r, r, 4
printi r
exit 0
";
        let (machine, output) = run_source(source);
        assert_eq!(output, "program: 7\n");
        assert_eq!(machine.status(), Status::Finished);
    }

    #[test]
    fn heap_round_trip() {
        let source = "\
malloc p, 4
assignw p[0], 123456
assignw q, p[0]
printi q
free p
exit 0
";
        let (machine, output) = run_source(source);
        assert_eq!(output, "program: 123456\n");
        assert_eq!(machine.status(), Status::Finished);
        assert_eq!(machine.memory().heap().live_chunks(), 0);
        assert_eq!(machine.memory().heap().allocations(), 1);
        assert_eq!(machine.memory().heap().frees(), 1);
    }

    #[test]
    fn conditional_branch() {
        let source = "\
assignw a, 5
assignw b, 7
lt c, a, b
goif LT, c
assignw r, 0
goto END
@label LT
assignw r, 1
@label END
printi r
exit 0
";
        let (machine, output) = run_source(source);
        assert_eq!(output, "program: 1\n");
        assert_eq!(machine.status(), Status::Finished);
    }

    #[test]
    fn call_and_return() {
        let source = "\
goto main
@function_begin add2, 0
param p0, 0
param p1, 4
assignw x, p0[0]
assignw y, p1[0]
add z, x, y
return z
@function_end
@label main
assignw STACK[0], 2
assignw STACK[4], 3
call r, add2
printi r
exit 0
";
        let (machine, output) = run_source(source);
        assert_eq!(output, "program: 5\n");
        assert_eq!(machine.status(), Status::Finished);
        // A call / return pair restores the machine exactly.
        assert_eq!(machine.stack_pointer(), STACK_START);
        assert_eq!(machine.frame_pointer(), STACK_START);
        assert_eq!(machine.callstack().depth(), 1);
    }

    #[test]
    fn nested_calls() {
        let source = "\
goto main
@function_begin inc, 0
param a0, 0
assignw v, a0[0]
add v, v, 1
return v
@function_end
@function_begin twice, 0
param b0, 0
assignw w, b0[0]
assignw STACK[0], w
call r1, inc
assignw STACK[0], r1
call r2, inc
return r2
@function_end
@label main
assignw STACK[0], 5
call r, twice
printi r
exit 0
";
        let (machine, output) = run_source(source);
        assert_eq!(output, "program: 7\n");
        assert_eq!(machine.status(), Status::Finished);
        assert_eq!(machine.callstack().depth(), 1);
    }

    #[test]
    fn division_by_zero_is_fatal() {
        let (machine, _) = run_source("assignw a, 10\nassignw b, 0\ndiv c, a, b\n");
        assert_eq!(machine.status(), Status::Error);
    }

    #[test]
    fn transfer_is_idempotent() {
        let (_, output) = run_source("assignw r, 7\nassignw s, r\nprinti s\nexit 0\n");
        assert_eq!(output, "program: 7\n");
    }

    #[test]
    fn falling_off_the_end_finishes() {
        let (machine, _) = run_source("assignw r, 1\n");
        assert_eq!(machine.status(), Status::Finished);
        assert_eq!(machine.exit_code(), 0);
        assert_eq!(machine.pc(), 1);
    }

    #[test]
    fn exit_status_is_kept() {
        let (machine, _) = run_source("exit 3\n");
        assert_eq!(machine.status(), Status::Finished);
        assert_eq!(machine.exit_code(), 3);
    }

    #[test]
    fn malloc_zero_yields_null_sentinel() {
        let (machine, output) = run_source("malloc p, 0\nprinti p\nexit 0\n");
        assert_eq!(output, "program: 0\n");
        assert_eq!(machine.status(), Status::Finished);
        assert_eq!(machine.memory().heap().live_chunks(), 0);
    }

    #[test]
    fn freeing_a_foreign_address_is_fatal() {
        let (machine, _) = run_source("assignw p, 999\nfree p\n");
        assert_eq!(machine.status(), Status::Error);
    }

    #[test]
    fn float_modulo_is_fatal() {
        let (machine, _) = run_source("assignw fa, 1.5\nassignw fb, 2.5\nmod fc, fa, fb\n");
        assert_eq!(machine.status(), Status::Error);
    }

    #[test]
    fn mixed_operand_types_are_fatal() {
        let (machine, _) = run_source("assignw fa, 1.5\nadd r, fa, 2\n");
        assert_eq!(machine.status(), Status::Error);
    }

    #[test]
    fn branching_to_an_unknown_label_is_fatal() {
        let (machine, _) = run_source("goto nowhere\n");
        assert_eq!(machine.status(), Status::Error);
    }

    #[test]
    fn reading_an_unknown_register_is_fatal() {
        let (machine, _) = run_source("printi r\n");
        assert_eq!(machine.status(), Status::Error);
    }

    #[test]
    fn double_access_assignment_is_fatal() {
        let (machine, _) = run_source("malloc p, 4\nmalloc q, 4\nassignw p[0], q[0]\n");
        assert_eq!(machine.status(), Status::Error);
    }

    #[test]
    fn duplicate_labels_fail_at_construction() {
        let program = parse("@label a\nexit 0\n@label a\n").unwrap();
        assert!(Machine::new(program).is_err());

        let program = parse("@function_begin f, 0\n@function_end\n@label f\n").unwrap();
        assert!(Machine::new(program).is_err());
    }

    #[test]
    fn stack_slack_writes_stay_non_fatal() {
        // SP never moves here; these writes land beyond it and must only warn.
        let source = "assignw STACK[0], 7\nassignw r, STACK[0]\nprinti r\nexit 0\n";
        let (machine, output) = run_source(source);
        assert_eq!(output, "program: 7\n");
        assert_eq!(machine.status(), Status::Finished);
    }

    #[test]
    fn float_arithmetic_uses_bit_views() {
        let source = "\
assignw fa, 1.5
assignw fb, 0.25
add fc, fa, fb
printf fc
exit 0
";
        let (_, output) = run_source(source);
        assert_eq!(output, "program: 1.75\n");
    }

    #[test]
    fn goifnot_branches_on_zero() {
        let source = "\
assignw r, 0
assignw c, 0
goifnot END, c
assignw r, 1
@label END
printi r
exit 0
";
        let (_, output) = run_source(source);
        assert_eq!(output, "program: 0\n");
    }

    #[test]
    fn relational_and_logical_results_are_words() {
        let source = "\
assignw a, 5
eq c, a, 5
printi c
assignw t, 1
assignw z, 0
and x, t, z
or y, t, z
printi x
printi y
exit 0
";
        let (_, output) = run_source(source);
        assert_eq!(output, "program: 1\nprogram: 0\nprogram: 1\n");
    }

    #[test]
    fn minus_and_neg() {
        let source = "\
assignw a, 5
minus b, a
printi b
assignw z, 0
neg c, z
printi c
exit 0
";
        let (_, output) = run_source(source);
        assert_eq!(output, "program: -5\nprogram: -1\n");
    }

    #[test]
    fn conversions_truncate_toward_zero() {
        let source = "\
assignw i, 7
itof fo, i
printf fo
assignw fg, 3.9
ftoi j, fg
printi j
assignw fh, -3.9
ftoi k, fh
printi k
exit 0
";
        let (_, output) = run_source(source);
        assert_eq!(output, "program: 7\nprogram: 3\nprogram: -3\n");
    }

    #[test]
    fn byte_assignment_touches_one_byte() {
        let source = "\
@staticv buf, 4
assignw buf[0], -1
assignb buf[0], 0
assignw r, buf[0]
printi r
assignb c, buf[1]
printi c
exit 0
";
        let (_, output) = run_source(source);
        // Low byte cleared, the other three bytes still 0xff.
        assert_eq!(output, "program: -256\nprogram: 255\n");
    }

    #[test]
    fn memcpy_copies_between_regions() {
        let source = "\
@string src, \"abc\"
malloc dst, 4
memcpy dst, src, 4
print dst
exit 0
";
        let (machine, output) = run_source(source);
        assert_eq!(output, "program: abc\n");
        assert_eq!(machine.status(), Status::Finished);
    }

    #[test]
    fn read_instructions_parse_one_line_each() {
        let (_, output) = run_with_input("readi r\nprinti r\nexit 0\n", "42\n");
        assert_eq!(output, "program: 42\n");

        let (_, output) = run_with_input("readf fr\nprintf fr\nexit 0\n", "2.5\n");
        assert_eq!(output, "program: 2.5\n");

        let (_, output) = run_with_input("readc r\nprintc r\nexit 0\n", "x\n");
        assert_eq!(output, "program: x\n");
    }

    #[test]
    fn read_stores_the_line_with_a_nul() {
        let source = "malloc p, 16\nread p\nprint p\nexit 0\n";
        let (machine, output) = run_with_input(source, "hello\n");
        assert_eq!(output, "program: hello\n");
        assert_eq!(machine.status(), Status::Finished);
    }

    #[test]
    fn unparsable_input_is_fatal() {
        let (machine, _) = run_with_input("readi r\n", "not a number\n");
        assert_eq!(machine.status(), Status::Error);
    }

    #[test]
    fn report_names_the_outcome() {
        let (machine, _) = run_source("@string s, \"hi\"\nprint s\nexit 0\n");
        let report = machine.report(&ReportOptions {
            labels: true,
            registers: true,
            callstack: true,
            ..Default::default()
        });
        assert!(report.contains("FINISHED"));
        assert!(report.contains("- Exit code: 0"));
        assert!(report.contains("[ Heap Memory ]"));
        assert!(report.contains("<global>"));
    }
}
