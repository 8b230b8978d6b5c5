// File: src/main.rs
//
// Main entry point for the Lumen programming language interpreter.
// Handles command-line argument parsing and dispatches to the appropriate
// subcommand (run, repl, or disassemble). Exit codes: 0 on success, 65 on
// a compile error, 70 on a runtime error.

mod chunk;
mod compiler;
mod errors;
mod heap;
mod lexer;
mod repl;
mod value;
mod vm;

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use colored::Colorize;

use chunk::disassemble_chunk;
use heap::{Heap, Obj};
use vm::{InterpretResult, Vm};

#[derive(Parser)]
#[command(name = "lumen", version, about = "A small bytecode-compiled scripting language")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Echo each executed instruction and GC cycle to stderr.
    #[arg(long, global = true)]
    trace: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile and execute a script file.
    Run { file: PathBuf },
    /// Start the interactive shell.
    Repl,
    /// Compile a script and print its disassembled bytecode.
    Disassemble { file: PathBuf },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { file } => run_file(&file, cli.trace),
        Commands::Repl => {
            repl::Repl::new(cli.trace).run();
            ExitCode::SUCCESS
        }
        Commands::Disassemble { file } => disassemble_file(&file),
    }
}

fn run_file(path: &PathBuf, trace: bool) -> ExitCode {
    let source = match fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("{}: could not read '{}': {e}", "error".red().bold(), path.display());
            return ExitCode::from(70);
        }
    };

    let mut interpreter = Vm::new().with_trace(trace);
    match interpreter.interpret(&source) {
        InterpretResult::Ok => ExitCode::SUCCESS,
        InterpretResult::CompileError(errors) => {
            for error in &errors {
                eprint!("{error}");
            }
            ExitCode::from(65)
        }
        InterpretResult::RuntimeError(error) => {
            eprint!("{error}");
            ExitCode::from(70)
        }
    }
}

fn disassemble_file(path: &PathBuf) -> ExitCode {
    let source = match fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("{}: could not read '{}': {e}", "error".red().bold(), path.display());
            return ExitCode::from(70);
        }
    };

    let mut heap = Heap::new();
    match compiler::compile(&source, &mut heap) {
        Ok(function_ref) => {
            if let Obj::Function(f) = heap.get(function_ref) {
                let name = path.file_stem().and_then(|s| s.to_str()).unwrap_or("script");
                print!("{}", disassemble_chunk(&f.chunk, name, &heap));
            }
            ExitCode::SUCCESS
        }
        Err(errors) => {
            for error in &errors {
                eprint!("{error}");
            }
            ExitCode::from(65)
        }
    }
}
