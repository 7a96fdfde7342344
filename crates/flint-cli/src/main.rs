//! The `flint` binary: file runner and REPL.
//!
//! Usage: `flint [<source>...] [-]` — sources run in order, `-` drops
//! into the REPL (also the default with no arguments). Running a file
//! that fails to compile or errors at runtime exits non-zero; the REPL
//! reports and keeps going. Ctrl-C sets the session's interrupt flag so
//! a runaway script stops at the next dispatch tick instead of killing
//! the process.

use std::io::{self, BufRead, Write};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use nix::sys::signal::{self, SigHandler, Signal};

use flint::Session;

static INTERRUPTED: OnceLock<Arc<AtomicBool>> = OnceLock::new();

extern "C" fn on_sigint(_signal: i32) {
    if let Some(flag) = INTERRUPTED.get() {
        flag.store(true, Ordering::Relaxed);
    }
}

fn install_sigint(flag: Arc<AtomicBool>) {
    let _ = INTERRUPTED.set(flag);
    // SAFETY: the handler only stores into an atomic flag.
    unsafe {
        let _ = signal::signal(Signal::SIGINT, SigHandler::Handler(on_sigint));
    }
}

fn main() -> ExitCode {
    let mut session = Session::new();
    install_sigint(session.interrupt_flag());

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.is_empty() {
        repl(&mut session);
        return ExitCode::SUCCESS;
    }

    for arg in &args {
        if arg == "-" {
            repl(&mut session);
        } else {
            println!("Loading {arg}");
            if !run_file(&mut session, arg) {
                return ExitCode::from(10);
            }
        }
    }
    ExitCode::SUCCESS
}

fn run_file(session: &mut Session, path: &str) -> bool {
    let source = match std::fs::read_to_string(path) {
        Ok(source) => source,
        Err(error) => {
            eprintln!("Could not open \"{path}\": {error}.");
            return false;
        }
    };

    let result = session.interpret(&source);
    flush_output(session);
    match result {
        Ok(()) => true,
        Err(error) => {
            eprintln!("{}", error.report());
            false
        }
    }
}

fn repl(session: &mut Session) {
    let stdin = io::stdin();
    loop {
        print!("> ");
        let _ = io::stdout().flush();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => {
                // EOF ends the session.
                println!();
                return;
            }
            Ok(_) => {}
            Err(error) => {
                eprintln!("Could not read input: {error}.");
                return;
            }
        }

        // `&path` loads a file from the prompt.
        let trimmed = line.trim();
        if let Some(path) = trimmed.strip_prefix('&') {
            run_file(session, path.trim());
            continue;
        }

        let result = session.interpret(&line);
        flush_output(session);
        if let Err(error) = result {
            eprintln!("{}", error.report());
        }
    }
}

fn flush_output(session: &mut Session) {
    let output = session.take_output();
    if !output.is_empty() {
        print!("{output}");
        let _ = io::stdout().flush();
    }
}
