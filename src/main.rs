//! This is the main entry point for the `forge-mirror` binary.

use clap::Parser;
use forge_mirror::{
    console_utils::init_logging,
    opt::{App, SubCommands},
    run_check_built, run_clone_feedstocks, run_copy, run_plan,
};

#[tokio::main(flavor = "current_thread")]
async fn main() -> miette::Result<()> {
    let app = App::parse();
    let log_handler = init_logging(&app.verbose);

    match app.subcommand {
        SubCommands::Copy(opts) => run_copy(opts, log_handler).await,
        SubCommands::Plan(opts) => run_plan(opts, log_handler).await,
        SubCommands::CloneFeedstocks(opts) => run_clone_feedstocks(opts, log_handler).await,
        SubCommands::CheckBuilt(opts) => run_check_built(opts),
    }
}
