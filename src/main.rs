use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;

use kestrel::config::init_logging;
use kestrel::debugger::TerminalDebugger;
use kestrel::vm::VmOptions;
use kestrel::{FatalError, RuntimeConfig, Script, Value};

/// Exit status for internal VM errors, as opposed to uncaught exceptions.
const FATAL_EXIT: u8 = 2;

#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum DumpFormat {
    #[default]
    Text,
    Json,
}

#[derive(Parser)]
#[command(name = "kestrel")]
#[command(about = "Run and inspect bytecode programs", long_about = None)]
struct Cli {
    /// Runtime configuration file (defaults to ./kestrel.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log every executed instruction
    #[arg(long, global = true)]
    trace: bool,

    /// Log every stack operation
    #[arg(long, global = true)]
    debug_stacks: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a program
    Run {
        /// Program file (.toml or .json)
        file: PathBuf,
    },
    /// Print the bytecode listing of a program and its functions
    Dump {
        file: PathBuf,

        #[arg(long, value_enum, default_value = "text")]
        format: DumpFormat,
    },
    /// Step through a program in the terminal debugger
    Debug { file: PathBuf },
    /// Assemble a program without running it
    Check { file: PathBuf },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match RuntimeConfig::discover(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::FAILURE;
        }
    };
    config.trace |= cli.trace;
    config.debug_stacks |= cli.debug_stacks;

    let filter = match config.log_filter.as_deref() {
        Some(filter) => Some(filter),
        None if config.trace || config.debug_stacks => Some("trace"),
        None => None,
    };
    init_logging(filter);

    match cli.command {
        Commands::Run { file } => {
            let Some(script) = load(&file) else {
                return ExitCode::FAILURE;
            };
            let options = config.vm_options();
            let result = script.run(options.clone());
            finish(result, &options)
        }
        Commands::Dump { file, format } => {
            let Some(script) = load(&file) else {
                return ExitCode::FAILURE;
            };
            dump(&script, format)
        }
        Commands::Debug { file } => {
            let Some(script) = load(&file) else {
                return ExitCode::FAILURE;
            };
            let debugger = match TerminalDebugger::new() {
                Ok(debugger) => debugger,
                Err(e) => {
                    eprintln!("error: cannot open terminal: {}", e);
                    return ExitCode::FAILURE;
                }
            };
            let options = config.vm_options();
            let result = script.debug(options.clone(), Box::new(debugger));
            finish(result, &options)
        }
        Commands::Check { file } => match load(&file) {
            Some(script) => {
                println!("{}: ok ({} scripts)", file.display(), script.walk().len());
                ExitCode::SUCCESS
            }
            None => ExitCode::FAILURE,
        },
    }
}

fn load(path: &Path) -> Option<Arc<Script>> {
    match kestrel::asm::load(path) {
        Ok(script) => {
            info!(path = %path.display(), "loaded program");
            Some(Arc::new(script))
        }
        Err(e) => {
            eprintln!("error: {}", e);
            None
        }
    }
}

fn dump(script: &Script, format: DumpFormat) -> ExitCode {
    match format {
        DumpFormat::Text => {
            for s in script.walk() {
                print!("{}", s.bytecode);
            }
        }
        DumpFormat::Json => {
            let listings: Vec<_> = script.walk().iter().map(|s| s.bytecode.listing()).collect();
            match serde_json::to_string_pretty(&listings) {
                Ok(json) => println!("{}", json),
                Err(e) => {
                    eprintln!("error: {}", e);
                    return ExitCode::FAILURE;
                }
            }
        }
    }
    ExitCode::SUCCESS
}

/// Report a program's outcome and map it to a process exit status.
fn finish(result: Result<Value, FatalError>, options: &VmOptions) -> ExitCode {
    let value = match result {
        Ok(value) => value,
        Err(e) => {
            eprintln!("fatal: {}", e);
            return ExitCode::from(FATAL_EXIT);
        }
    };
    if let Some(code) = options.exit_signal.code() {
        let status = code.as_int().unwrap_or(1).clamp(0, 255) as u8;
        return ExitCode::from(status);
    }
    if let Some(e) = value.as_exception() {
        eprintln!("error: {}", value);
        if let Some(trace) = e.trace() {
            eprint!("{}", trace);
        }
        return ExitCode::FAILURE;
    }
    if !value.is_null() {
        println!("{}", value);
    }
    ExitCode::SUCCESS
}
