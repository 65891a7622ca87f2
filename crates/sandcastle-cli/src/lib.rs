//! Sandcastle CLI library

pub mod commands;
pub mod config;
pub mod docker;
pub mod error;

pub use error::{Error, Result};

use clap::{Parser, Subcommand};

/// Sandcastle - ephemeral Talos clusters for tests and CI
#[derive(Parser, Debug)]
#[command(name = "sandcastle")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a cluster on the local Docker daemon and write its credentials
    Create(commands::create::CreateArgs),
    /// Render machine configs and a talosconfig without starting anything
    Gen(commands::gen::GenArgs),
    /// Point a kubeconfig's cluster server at another address
    RewriteKubeconfig(commands::rewrite::RewriteArgs),
}

impl Cli {
    /// Run the CLI command
    pub async fn run(self) -> Result<()> {
        match self.command {
            Commands::Create(args) => commands::create::run(args).await,
            Commands::Gen(args) => commands::gen::run(args).await,
            Commands::RewriteKubeconfig(args) => commands::rewrite::run(args).await,
        }
    }
}
