use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    reward_kernel_cli::init_tracing();
    let cli = reward_kernel_cli::Cli::parse();
    reward_kernel_cli::run_cli(cli)
}
