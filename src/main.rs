use clap::Parser;

use crate::cli::Cli;
use gpu_suballocator::args::Args;
use gpu_suballocator::run;

mod cli;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    run(Args {
        scenario: cli.scenario,
        backend: cli.backend.into(),
        detailed_map: cli.detailed_map,
        format: cli.format.into(),
    })
}
