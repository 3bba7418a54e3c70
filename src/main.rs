use std::{
    io::{BufReader, Write},
    path::PathBuf,
};

use clap::{Args, Parser, Subcommand};
use stackvm::{
    compile, compile_reader,
    vm::{Machine, RuntimeError},
    CompileError, CompileOptions,
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

impl Cli {
    pub fn command(&self) -> Command {
        self.command
            .clone()
            .unwrap_or(Command::Repl(ReplArgs { no_optimize: false }))
    }
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Compile and run each file in order.
    Run(RunArgs),
    /// Read, compile and run one line at a time.
    Repl(ReplArgs),
}

#[derive(Debug, Clone, Args)]
struct RunArgs {
    #[arg(required = true)]
    files: Vec<PathBuf>,
    /// Constant-fold before running.
    #[arg(long)]
    optimize: bool,
    /// Print a disassembly listing to stderr before running.
    #[arg(long)]
    dump: bool,
}

#[derive(Debug, Clone, Args)]
struct ReplArgs {
    /// Skip constant folding.
    #[arg(long)]
    no_optimize: bool,
}

#[derive(Debug, thiserror::Error)]
enum InterpretError {
    #[error("Failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let args = Cli::parse();

    match args.command() {
        Command::Repl(args) => repl_command(&args),
        Command::Run(args) => {
            if let Err(e) = run_command(&args) {
                eprintln!("Error: {e}");
                std::process::exit(1);
            }
        }
    }
}

fn repl_command(args: &ReplArgs) {
    let options = CompileOptions {
        optimize: !args.no_optimize,
    };

    loop {
        let mut input = String::new();

        print!("> ");
        if std::io::stdout().flush().is_err() {
            break;
        }

        match std::io::stdin().read_line(&mut input) {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }

        if let Err(e) = interpret(&input, options) {
            println!("Error: {}", e);
        }
    }
}

fn interpret(source: &str, options: CompileOptions) -> Result<(), InterpretError> {
    let program = compile(source, options)?;
    Machine::new(program).run()?;
    Ok(())
}

fn run_command(args: &RunArgs) -> Result<(), InterpretError> {
    let options = CompileOptions {
        optimize: args.optimize,
    };

    for path in &args.files {
        let file = std::fs::File::open(path).map_err(|source| InterpretError::Io {
            path: path.clone(),
            source,
        })?;
        let program = compile_reader(BufReader::new(file), options)?;

        if args.dump {
            program
                .disassemble(&mut std::io::stderr())
                .map_err(|source| InterpretError::Io {
                    path: path.clone(),
                    source,
                })?;
        }

        Machine::new(program).run()?;
    }

    Ok(())
}
