//! The command-line runner.  Takes a TAC source file, executes it, and
//! prints a state report unless asked to be quiet.
//!
//! Run with `--help` for more info.

use std::io::Write as _;
use std::process::ExitCode;

use clap::Parser;
use log::{error, info, trace};

use tac_runner::front::parse;
use tac_runner::vm::{Machine, ReportOptions, Status};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// the tac source file to run
    file: String,
    /// do not print the state report after the run
    #[arg(long, default_value_t = false)]
    quiet: bool,
    /// include the callstack trace in the report
    #[arg(long, default_value_t = false)]
    callstack: bool,
    /// include region memory contents in the report
    #[arg(long, default_value_t = false)]
    memory: bool,
    /// include per-frame register dumps in the report
    #[arg(long, default_value_t = false)]
    registers: bool,
    /// include the label table in the report
    #[arg(long, default_value_t = false)]
    labels: bool,
    /// with --memory, how many raw stack bytes to show even past the
    /// stack pointer
    #[arg(long, default_value_t = 0)]
    stack_mem_bytes: u32,
}

/// Diagnostics go to stderr as `tac-runner: [LEVEL] message`, colorized by
/// level.  `RUST_LOG` overrides the default `trace` filter.
fn init_logger() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("trace"))
        .format(|buf, record| {
            let label = match record.level() {
                log::Level::Error => "ERROR",
                log::Level::Warn => "WARNING",
                log::Level::Info => "SUCCESS",
                log::Level::Debug => "DEBUG",
                log::Level::Trace => "TRACE",
            };
            let style = buf.default_level_style(record.level());
            writeln!(
                buf,
                "tac-runner: [{style}{label}{style:#}] {}",
                record.args()
            )
        })
        .init();
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logger();

    let input = match std::fs::read_to_string(&args.file) {
        Ok(input) => input,
        Err(err) => {
            error!("cannot read file '{}': {err}", args.file);
            return ExitCode::FAILURE;
        }
    };

    trace!("parsing tac program from '{}'...", args.file);
    let program = match parse(&input) {
        Ok(program) => program,
        Err(err) => {
            error!("invalid TAC code: {err}");
            return ExitCode::FAILURE;
        }
    };
    info!("TAC code successfully parsed");

    trace!("creating tac machine...");
    let mut machine = match Machine::new(program) {
        Ok(machine) => machine,
        Err(err) => {
            error!("cannot create machine: {err}");
            return ExitCode::FAILURE;
        }
    };

    trace!("starting program...");
    machine.run();

    match machine.status() {
        Status::Error => error!("program execution failed at instruction {}", machine.pc()),
        _ => info!("program execution successful"),
    }

    if !args.quiet {
        trace!("resulting state summary:");
        let opts = ReportOptions {
            memory: args.memory,
            labels: args.labels,
            registers: args.registers,
            callstack: args.callstack,
            stack_mem_bytes: args.stack_mem_bytes,
        };
        println!("{}", machine.report(&opts));
    }

    if machine.status() == Status::Error {
        return ExitCode::FAILURE;
    }
    // The program's own exit status becomes the process exit code.
    ExitCode::from(machine.exit_code() as u8)
}
