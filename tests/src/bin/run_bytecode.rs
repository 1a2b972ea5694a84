//! Bytecode test runner.
//!
//! Each invocation of this program assembles and runs one of the programs found in the `bytecode`
//! directory of this crate, first in the interpreter and then through the JIT. The two runs must
//! agree. What the program prints goes to stdout; an uncaught exception is reported on stderr,
//! innermost line last, and makes the process exit with status 1.

use bcjit::{
    asm::assemble,
    runtime::{FrameEvaluator, Runtime},
    JitBuilder,
};
use clap::Parser;
use std::{
    error::Error,
    fs::read_to_string,
    io::{self, Write},
    path::PathBuf,
    process::ExitCode,
    rc::Rc,
};

#[derive(Parser, Debug)]
#[command(about, long_about = None)]
struct Args {
    /// The bytecode assembly file to run.
    test_file: PathBuf,

    /// Only run the program in the interpreter.
    #[arg(short, long)]
    interp_only: bool,
}

/// What a program run did that the outside world can observe.
#[derive(Debug, PartialEq)]
struct Outcome {
    stdout: String,
    /// The traceback and exception of an uncaught exception, one line per element.
    exception: Option<Vec<String>>,
}

fn run(src: &str, jit: bool) -> Result<Outcome, Box<dyn Error>> {
    let mut rt = Runtime::new();
    if jit {
        let jit = JitBuilder::from_env()?.build();
        rt.set_evaluator(jit as Rc<dyn FrameEvaluator>);
    }
    let code = assemble(&mut rt, src)?;
    let globals = rt.new_dict();
    let r = rt.run_code(Rc::new(code), globals);
    let exception = match r {
        Ok(v) => {
            rt.decref(v);
            None
        }
        Err(_) => {
            let lines = rt.current_exception().map(|info| {
                let mut lines = vec!["Traceback (most recent call last):".to_owned()];
                lines.extend(
                    rt.traceback_lines(info.tb)
                        .into_iter()
                        .map(|l| format!("  line {l}")),
                );
                lines.push(rt.format_exception(info));
                lines
            });
            rt.err_clear();
            Some(lines.unwrap_or_default())
        }
    };
    rt.decref(globals);
    Ok(Outcome {
        stdout: rt.take_stdout(),
        exception,
    })
}

fn inner(args: &Args) -> Result<bool, Box<dyn Error>> {
    let src = read_to_string(&args.test_file)?;
    let interpreted = run(&src, false)?;
    let outcome = if args.interp_only {
        interpreted
    } else {
        let jitted = run(&src, true)?;
        if jitted != interpreted {
            return Err(format!(
                "interpreted and JIT runs differ:\n  interpreted: {interpreted:?}\n  JIT: {jitted:?}"
            )
            .into());
        }
        jitted
    };
    io::stdout().write_all(outcome.stdout.as_bytes())?;
    match outcome.exception {
        Some(lines) => {
            for l in lines {
                eprintln!("{l}");
            }
            Ok(false)
        }
        None => Ok(true),
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    match inner(&args) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("{}: {e}", args.test_file.display());
            ExitCode::from(2)
        }
    }
}
