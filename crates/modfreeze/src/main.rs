use clap::Parser;
use colored::Colorize;
use modfreeze::cli::{self, Cli};

fn main() {
    let cli = Cli::parse();
    cli::init_logging(cli.verbose);

    if let Err(e) = cli::run(cli) {
        eprintln!("{} {e:#}", "error:".red().bold());
        std::process::exit(1);
    }
}
