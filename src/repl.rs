// File: src/repl.rs
//
// Interactive REPL (Read-Eval-Print Loop) for the Lumen programming
// language. Provides an interactive shell for executing Lumen code with:
// - Multi-line input support for functions, loops, and control structures
// - Command history with up/down arrow navigation
// - Line editing capabilities
// - Special commands (:help, :clear, :quit, :vars, :reset, :bytecode, :gc)
// - Persistent VM state (globals, heap) across inputs

use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use crate::chunk::disassemble_chunk;
use crate::compiler;
use crate::heap::{Heap, Obj};
use crate::vm::{InterpretResult, Vm};

/// REPL session that maintains VM state and handles user interaction.
pub struct Repl {
    vm: Vm,
    editor: DefaultEditor,
    trace: bool,
}

impl Repl {
    /// Creates a new REPL session with a fresh VM. Falls back to a
    /// minimal editor (no history file) if rustyline's terminal setup
    /// fails, since a broken readline backend shouldn't stop the shell
    /// from starting.
    pub fn new(trace: bool) -> Self {
        let editor = DefaultEditor::new().unwrap_or_else(|e| {
            eprintln!("{} line editor init failed: {e}", "warning:".bright_yellow());
            DefaultEditor::with_config(rustyline::Config::default()).expect("fallback editor must construct")
        });
        Repl { vm: Vm::new().with_trace(trace), editor, trace }
    }

    fn show_banner(&self) {
        println!("{}", "╔══════════════════════════════════════════════════════╗".bright_cyan());
        println!(
            "{}",
            "║           Lumen REPL - Interactive Shell             ║".bright_cyan()
        );
        println!("{}", "╚══════════════════════════════════════════════════════╝".bright_cyan());
        println!();
        println!(
            "  {} Use {}{}{}{}",
            "Welcome!".bright_green(),
            ":".bright_blue(),
            "help".bright_yellow(),
            " for commands or ".bright_blue(),
            ":quit".bright_yellow()
        );
        println!("  {} Multi-line input: end with unclosed braces", "Tip:".bright_magenta());
        println!();
    }

    pub fn run(&mut self) {
        self.show_banner();

        let mut buffer = String::new();

        loop {
            let prompt = if buffer.is_empty() {
                "lumen> ".bright_green().to_string()
            } else {
                "....> ".bright_blue().to_string()
            };

            match self.editor.readline(&prompt) {
                Ok(line) => {
                    let _ = self.editor.add_history_entry(line.as_str());

                    if buffer.is_empty() && line.trim().starts_with(':') {
                        if self.handle_command(line.trim()) {
                            continue;
                        } else {
                            break;
                        }
                    }

                    buffer.push_str(&line);
                    buffer.push('\n');

                    if is_input_complete(&buffer) {
                        self.eval_input(&buffer);
                        buffer.clear();
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    println!("{}", "^C (Ctrl+C to interrupt, :quit to exit)".bright_yellow());
                    buffer.clear();
                }
                Err(ReadlineError::Eof) => {
                    println!("{}", "\nGoodbye!".bright_cyan());
                    break;
                }
                Err(err) => {
                    eprintln!("{} {}", "Error:".bright_red(), err);
                    break;
                }
            }
        }
    }

    /// Returns true to continue the REPL, false to quit.
    fn handle_command(&mut self, cmd: &str) -> bool {
        if let Some(snippet) = cmd.strip_prefix(":bytecode ").or_else(|| cmd.strip_prefix(":b ")) {
            print!("{}", disassemble_snippet(snippet));
            return true;
        }
        match cmd {
            ":help" | ":h" => {
                self.show_help();
                true
            }
            ":quit" | ":q" | ":exit" => {
                println!("{}", "Goodbye!".bright_cyan());
                false
            }
            ":clear" | ":c" => {
                print!("\x1B[2J\x1B[1;1H");
                self.show_banner();
                true
            }
            ":vars" | ":v" => {
                self.show_variables();
                true
            }
            ":reset" | ":r" => {
                self.vm = Vm::new().with_trace(self.trace);
                println!("{}", "Environment reset".bright_green());
                true
            }
            ":bytecode" | ":b" => {
                println!("  {}", "Usage: :bytecode <source>, e.g. :bytecode 1 + 2;".dimmed());
                true
            }
            ":gc" => {
                self.show_gc_stats();
                true
            }
            _ => {
                println!(
                    "{} Unknown command: {}. Type {}{}{}",
                    "Error:".bright_red(),
                    cmd.bright_yellow(),
                    ":".bright_blue(),
                    "help".bright_yellow(),
                    " for available commands.".bright_blue()
                );
                true
            }
        }
    }

    fn show_help(&self) {
        println!();
        println!("{}", "REPL Commands:".bright_cyan().bold());
        println!();
        println!("  {}{}  Display this help message", ":help".bright_yellow(), " or :h      ".dimmed());
        println!("  {}{}  Exit the REPL", ":quit".bright_yellow(), " or :q      ".dimmed());
        println!("  {}{}  Clear the screen", ":clear".bright_yellow(), " or :c     ".dimmed());
        println!("  {}{}  List global variables", ":vars".bright_yellow(), " or :v     ".dimmed());
        println!("  {}{}  Reset the VM (clears globals and heap)", ":reset".bright_yellow(), " or :r    ".dimmed());
        println!("  {}  Force a GC cycle and print byte counts", ":gc".bright_yellow());
        println!();
        println!("{}", "Navigation:".bright_cyan().bold());
        println!();
        println!("  {}  Navigate command history", "up/down arrows".bright_blue());
        println!("  {}  Interrupt current input", "Ctrl+C        ".bright_blue());
        println!("  {}  Exit REPL", "Ctrl+D        ".bright_blue());
        println!();
        println!("{}", "Multi-line Input:".bright_cyan().bold());
        println!();
        println!("  Leave braces, brackets, or parentheses unclosed to continue");
        println!("  on the next line. Close them to execute the statement.");
        println!();
        println!("{}", "Example:".bright_cyan().bold());
        println!();
        println!("  {}", "lumen> fun greet(name) {".dimmed());
        println!("  {}", "....>     print \"Hello, \" + name;".dimmed());
        println!("  {}", "....> }".dimmed());
        println!("  {}", "lumen> greet(\"World\");".dimmed());
        println!();
    }

    fn show_variables(&self) {
        println!();
        println!("{}", "Global Variables:".bright_cyan().bold());
        println!();
        if self.vm.global_names().is_empty() {
            println!("  {}", "(none defined yet)".dimmed());
        } else {
            for name in self.vm.global_names() {
                println!("  {}", name.bright_yellow());
            }
        }
        println!();
    }

    fn show_gc_stats(&mut self) {
        let before = self.vm.heap_bytes_allocated();
        self.vm.force_collect();
        let after = self.vm.heap_bytes_allocated();
        println!(
            "  {} {before} -> {after} bytes allocated",
            "gc:".bright_magenta()
        );
    }

    fn eval_input(&mut self, input: &str) {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return;
        }

        match self.vm.interpret(input) {
            InterpretResult::Ok => {}
            InterpretResult::CompileError(errors) => {
                for error in &errors {
                    print!("{error}");
                }
            }
            InterpretResult::RuntimeError(error) => {
                print!("{error}");
            }
        }
    }
}

/// Disassembles `source` without executing it. Backs the REPL's
/// `:bytecode` command; the `lumen disassemble` CLI subcommand shares
/// this same compile-only path.
fn disassemble_snippet(source: &str) -> String {
    let mut heap = Heap::new();
    match compiler::compile(source, &mut heap) {
        Ok(function_ref) => match heap.get(function_ref) {
            Obj::Function(f) => disassemble_chunk(&f.chunk, "repl", &heap),
            _ => unreachable!(),
        },
        Err(errors) => errors.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("\n"),
    }
}

/// Checks whether `input`'s delimiters are balanced and it isn't left
/// mid-string, so the REPL knows to keep reading more lines.
fn is_input_complete(input: &str) -> bool {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return true;
    }

    let mut brace_count = 0i32;
    let mut bracket_count = 0i32;
    let mut paren_count = 0i32;
    let mut in_string = false;
    let mut escape_next = false;
    let mut in_comment = false;

    for ch in trimmed.chars() {
        if in_comment {
            if ch == '\n' {
                in_comment = false;
            }
            continue;
        }
        if escape_next {
            escape_next = false;
            continue;
        }
        match ch {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '/' if !in_string => {} // two-slash comments are handled by the lexer, not tracked here
            '{' if !in_string => brace_count += 1,
            '}' if !in_string => brace_count -= 1,
            '[' if !in_string => bracket_count += 1,
            ']' if !in_string => bracket_count -= 1,
            '(' if !in_string => paren_count += 1,
            ')' if !in_string => paren_count -= 1,
            _ => {}
        }
    }

    !in_string && brace_count <= 0 && bracket_count <= 0 && paren_count <= 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn balanced_single_line_is_complete() {
        assert!(is_input_complete("print 1 + 2;"));
    }

    #[test]
    fn unclosed_brace_is_incomplete() {
        assert!(!is_input_complete("fun f() {"));
    }

    #[test]
    fn closing_brace_on_next_line_completes_it() {
        assert!(is_input_complete("fun f() {\nreturn 1;\n}"));
    }

    #[test]
    fn unterminated_string_is_incomplete() {
        assert!(!is_input_complete("print \"unterminated"));
    }
}
