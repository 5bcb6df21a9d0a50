//! `feline` — compile and run a `.fn` script against the bytecode VM.
//!
//! Scoped down from the teacher's multi-subcommand `vitte-cli` to exactly
//! what spec.md §6 asks for: one positional source path plus `--trace` and
//! `--stress-gc` debugging switches, and the four exit codes below.

use clap::Parser;
use feline_vm::{run_file, VmOptions, VmOutcome};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "feline", version, about = "Run a Feline script", long_about = None)]
struct Cli {
    /// Path to a `.fn` source file.
    path: PathBuf,

    /// Run a full GC cycle before every allocation, to shake out missing
    /// roots (spec.md §3's "stress-test mode").
    #[arg(long)]
    stress_gc: bool,

    /// Print each dispatched opcode to stderr via `tracing`.
    #[arg(long)]
    trace: bool,
}

fn main() -> ExitCode {
    color_eyre::install().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if !cli.path.exists() {
        eprintln!("feline: no such file: {}", cli.path.display());
        return ExitCode::from(1);
    }

    let options = VmOptions { trace: cli.trace, stress_gc: cli.stress_gc };
    match run_file(&cli.path, options) {
        VmOutcome::Ok => ExitCode::from(0),
        VmOutcome::CompileError(message) => {
            eprintln!("{message}");
            ExitCode::from(2)
        }
        VmOutcome::RuntimeError(message) => {
            eprintln!("{message}");
            ExitCode::from(4)
        }
    }
}
