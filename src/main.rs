// File: src/main.rs
//
// Command-line entry point for the Lox interpreter.
// With a script argument the file is compiled and run; without one an
// interactive REPL starts. Exit codes follow interpreter convention:
// 65 for compile errors, 70 for runtime errors, 74 for unreadable input.

use clap::Parser;
use colored::Colorize;
use std::fs;
use std::path::PathBuf;
use std::process;

use lox::repl::Repl;
use lox::vm::Vm;

#[derive(Parser)]
#[command(
    name = "lox",
    about = "Lox: a bytecode virtual machine for the Lox language",
    version = env!("CARGO_PKG_VERSION"),
    long_about = None
)]
struct Cli {
    /// Path to a Lox script; starts the REPL when omitted.
    script: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();

    match cli.script {
        Some(path) => run_file(&path),
        None => match Repl::new() {
            Ok(mut repl) => {
                if let Err(e) = repl.run() {
                    eprintln!("REPL error: {}", e);
                    process::exit(1);
                }
            }
            Err(e) => {
                eprintln!("Failed to start REPL: {}", e);
                process::exit(1);
            }
        },
    }
}

fn run_file(path: &PathBuf) {
    let source = match fs::read_to_string(path) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("{} could not read \"{}\": {}", "Error:".bright_red(), path.display(), e);
            process::exit(74);
        }
    };

    let mut vm = Vm::new();
    if let Err(error) = vm.interpret(&source) {
        eprintln!("{}", error);
        process::exit(error.exit_code());
    }
}
