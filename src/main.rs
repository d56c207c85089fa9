use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use clap::{CommandFactory as _, Parser};

use envmatrix_cli::cli::{Cli, Command};
use envmatrix_cli::commands;
use envmatrix_cli::engine::CancelToken;
use envmatrix_cli::error::exit_code_for;
use envmatrix_cli::logging::{Logger, init_subscriber};

fn command_name(command: &Command) -> &'static str {
    match command {
        Command::Run(_) => "run",
        Command::Show(_) => "show",
        Command::List => "list",
        Command::Coverage(_) => "coverage",
        Command::Matrix(_) => "matrix",
        Command::Completions { .. } => "completions",
        Command::Version => "version",
    }
}

fn dispatch(args: &Cli, log: &Arc<Logger>, cancel: &CancelToken) -> Result<i32> {
    match &args.command {
        Command::Run(opts) => commands::run::run(&args.global, opts, log, cancel),
        Command::Show(opts) => commands::show::run(&args.global, opts, &**log),
        Command::List => commands::list::run(&args.global, &**log),
        Command::Coverage(opts) => commands::coverage::run(&args.global, opts, &**log),
        Command::Matrix(opts) => commands::matrix::run(&args.global, opts, log, cancel),
        Command::Completions { shell } => {
            clap_complete::generate(*shell, &mut Cli::command(), "envmatrix", &mut std::io::stdout());
            Ok(0)
        }
        Command::Version => {
            let version = option_env!("ENVMATRIX_VERSION").unwrap_or(env!("CARGO_PKG_VERSION"));
            println!("envmatrix {version}");
            Ok(0)
        }
    }
}

fn main() -> ExitCode {
    let _ = enable_ansi_support::enable_ansi_support();
    let args = Cli::parse();
    let name = command_name(&args.command);
    init_subscriber(args.verbose, name);
    let log = Arc::new(Logger::new(name));

    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || handler_token.cancel()) {
        log.warn(&format!("cannot install interrupt handler: {e}"));
    }

    match dispatch(&args, &log, &cancel) {
        Ok(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        Err(e) => {
            log.error(&format!("{e:#}"));
            ExitCode::from(exit_code_for(&e))
        }
    }
}
