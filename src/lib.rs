//! A virtual machine executing textual three-address code.
//!
//! The front-end turns a TAC source file into a [tac::Program]; the
//! [vm::Machine] lays out a segmented virtual address space, resolves labels
//! and interprets the program one instruction at a time.  See `src/bin` for
//! the command-line runner built on this library.

pub mod common;
pub mod front;
pub mod tac;
pub mod vm;
