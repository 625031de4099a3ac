//! CLI subcommands. Mirrors `main.rs`'s `Cli`/`Commands` split, but this
//! crate's two subcommands are peers rather than a default-daemon/extras
//! split: `run` is the scheduling runner (OS threads), `serve` is the
//! reporting HTTP API (tokio/axum).

pub mod run;
pub mod serve;

use clap::Subcommand;

#[derive(Subcommand)]
pub enum Commands {
    /// Run the task scheduling loop on this host.
    Run(run::RunArgs),
    /// Run the reporting HTTP API.
    Serve,
}
