// File: src/repl.rs
//
// Interactive REPL (Read-Eval-Print Loop) for the Lox language.
// Provides an interactive shell with:
// - Multi-line input buffering for unclosed braces and parentheses
// - Command history with up/down arrow navigation
// - Persistent interpreter state (globals and interned strings) across lines

use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use crate::vm::Vm;

/// REPL session holding the VM whose state persists between inputs.
pub struct Repl {
    vm: Vm,
    editor: DefaultEditor,
}

impl Repl {
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        let editor = DefaultEditor::new()?;
        Ok(Repl { vm: Vm::new(), editor })
    }

    fn show_banner(&self) {
        println!("{}", format!("Lox {}", env!("CARGO_PKG_VERSION")).bright_cyan());
        println!("Ctrl-D to exit.");
        println!();
    }

    /// Read-eval-print until end of input.
    pub fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.show_banner();

        let mut buffer = String::new();
        loop {
            let prompt = if buffer.is_empty() {
                "> ".bright_green().to_string()
            } else {
                ". ".bright_blue().to_string()
            };

            match self.editor.readline(&prompt) {
                Ok(line) => {
                    let _ = self.editor.add_history_entry(line.as_str());
                    buffer.push_str(&line);
                    buffer.push('\n');
                    if is_input_complete(&buffer) {
                        self.eval_input(&buffer);
                        buffer.clear();
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    buffer.clear();
                }
                Err(ReadlineError::Eof) => break,
                Err(err) => {
                    eprintln!("{} {}", "Error:".bright_red(), err);
                    break;
                }
            }
        }
        Ok(())
    }

    fn eval_input(&mut self, source: &str) {
        if source.trim().is_empty() {
            return;
        }
        if let Err(error) = self.vm.interpret(source) {
            eprintln!("{}", error);
        }
    }
}

/// A line ending inside an unclosed brace, parenthesis, or string keeps the
/// buffer open for more input.
fn is_input_complete(source: &str) -> bool {
    let mut depth: i64 = 0;
    let mut in_string = false;
    for c in source.chars() {
        match c {
            '"' => in_string = !in_string,
            '(' | '{' if !in_string => depth += 1,
            ')' | '}' if !in_string => depth -= 1,
            _ => {}
        }
    }
    depth <= 0 && !in_string
}
