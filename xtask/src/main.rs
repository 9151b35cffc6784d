//! Workspace maintenance tasks invoked via `cargo xtask <task>`.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "xtask")]
struct Cli {
    #[command(subcommand)]
    task: Task,
}

#[derive(Subcommand)]
enum Task {
    /// Render man pages for `ptb` and each of its subcommands.
    Man {
        #[arg(long, default_value = "target/man")]
        out_dir: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.task {
        Task::Man { out_dir } => man(&out_dir),
    }
}

fn man(out_dir: &PathBuf) -> Result<()> {
    fs::create_dir_all(out_dir)
        .with_context(|| format!("creating {}", out_dir.display()))?;

    let command = ptb_cli::Cli::command();
    render_man_page(&command, out_dir)?;
    for sub in command.get_subcommands() {
        render_man_page(sub, out_dir)?;
    }
    Ok(())
}

fn render_man_page(command: &clap::Command, out_dir: &PathBuf) -> Result<()> {
    let name = command.get_display_name().unwrap_or_else(|| command.get_name()).to_string();
    let man = clap_mangen::Man::new(command.clone());
    let mut buffer = Vec::new();
    man.render(&mut buffer)?;

    let path = out_dir.join(format!("{name}.1"));
    fs::write(&path, buffer).with_context(|| format!("writing {}", path.display()))?;
    println!("wrote {}", path.display());
    Ok(())
}
