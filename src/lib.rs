use clap::{Parser, Subcommand};
use std::process::ExitCode;
use vm::config::{CallingConvention, EngineConfig, LockMode};

pub mod demo;
pub mod error;
pub mod types;
pub mod value;
#[macro_use]
pub mod vm;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Method invocation and object lifetime for a .NET-style virtual machine"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Runs a virtual call, an interface call and a finalization cycle.
    Demo {
        /// Overrides DOTNET_ENGINE_CONVENTION.
        #[arg(long, value_enum)]
        convention: Option<CallingConvention>,
        /// Overrides DOTNET_ENGINE_LOCK_MODE.
        #[arg(long, value_enum)]
        lock_mode: Option<LockMode>,
    },
}

pub fn run_cli() -> ExitCode {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(tracing::Level::WARN)
        .init();

    let mut config = match EngineConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(2);
        }
    };

    match args.command {
        Command::Demo {
            convention,
            lock_mode,
        } => {
            if let Some(convention) = convention {
                config = config.with_convention(convention);
            }
            if let Some(lock_mode) = lock_mode {
                config = config.with_lock_mode(lock_mode);
            }
            match demo::run(config) {
                Ok(_) => ExitCode::SUCCESS,
                Err(e) => {
                    eprintln!("demo failed: {e}");
                    ExitCode::FAILURE
                }
            }
        }
    }
}
