mod cmd;

use std::process;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "lodge", about = "Run flat guest images under KVM")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch one VM per guest image and wait for all of them
    Run(cmd::run::Cmd),
}

fn main() {
    env_logger::init();

    let cli = Cli::parse();

    let result = match &cli.command {
        Commands::Run(cmd) => cmd.execute(),
    };

    if let Err(e) = result {
        eprintln!("lodge: {e}");
        process::exit(1);
    }
}
