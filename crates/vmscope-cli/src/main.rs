//! `vmscope` — command-line front-end for the introspection engine.

mod cli;
mod commands;

use clap::Parser;
use vmscope_core::{Config, Introspector};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = cli::Cli::parse();
    let config = Config::load(&cli.config)?;
    let introspector = Introspector::open(config)?;

    match cli.command {
        cli::Command::Snapshot { expected } => commands::snapshot(&introspector, expected),
        cli::Command::Translate { pid, va } => commands::translate(&introspector, pid, va),
        cli::Command::Classify { va } => commands::classify(&introspector, va),
        cli::Command::ReadVirtual { pid, va, len } => commands::read_virtual(&introspector, pid, va, len),
    }
}
