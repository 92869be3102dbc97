//! procwarden CLI - run and supervise external programs

mod cli;
mod logging;
mod runner;

use clap::Parser;
use cli::{Cli, Commands};
use console::style;
use procwarden::errors::Result;
use procwarden::interrupt::{InterruptContext, ReceiveInterrupts};

fn main() {
    let cli = Cli::parse();

    logging::init_logger(cli.verbose);

    // Before any other thread exists, so every thread inherits the mask.
    let interrupts = InterruptContext::new();
    let outcome = interrupts
        .start_signal_listener()
        .and_then(|()| ReceiveInterrupts::new(&interrupts))
        .and_then(|_wake| dispatch(cli.command, &interrupts));

    match outcome {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("{} {}", style("error:").red().bold(), e);
            std::process::exit(e.exit_code());
        }
    }
}

fn dispatch(command: Commands, interrupts: &InterruptContext) -> Result<i32> {
    match command {
        Commands::Run(args) => {
            let (config, json) = runner::load_config(args)?;
            runner::run_program(&config, json, interrupts)
        }
        Commands::Tempdir { root, prefix } => runner::make_temp_dir(root, prefix).map(|()| 0),
        Commands::Rm { path } => runner::remove_path(&path).map(|()| 0),
    }
}
