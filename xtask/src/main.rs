use anyhow::Result;
use clap::{Parser, Subcommand};
use std::process::Command;

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Developer tasks for amptek-rs", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build every workspace member
    Build,
    /// Run the unit tests of the core crate
    Test,
    /// Run the amptek CLI, forwarding any extra arguments
    Run {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

fn cargo(args: &[&str], what: &str) -> Result<()> {
    let status = Command::new("cargo").args(args).status()?;
    if !status.success() {
        anyhow::bail!("{} failed", what);
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Build => {
            println!("Building workspace...");
            cargo(&["build", "--workspace"], "Build")?;
        }
        Commands::Test => {
            println!("Testing amptek-core...");
            cargo(&["test", "-p", "amptek-core"], "Test")?;
        }
        Commands::Run { args } => {
            println!("Running CLI...");
            let mut full = vec!["run", "-p", "amptek-cli", "--"];
            full.extend(args.iter().map(String::as_str));
            cargo(&full, "Run")?;
        }
    }

    Ok(())
}
