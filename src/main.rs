//! `labctl` entry point.

use clap::Parser;
use labctl::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    labctl::run(Cli::parse()).await
}
