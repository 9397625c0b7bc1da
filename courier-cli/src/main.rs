// This defines the main courier cli
// application.
mod cmd;

use clap::{Parser, Subcommand};
use log::info;
use pretty_env_logger;
use std::io::Error;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct CourierCli {
    #[clap(subcommand)]
    cmd: Option<Cmd>,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Publishes a batch, runs a subscription until the watchdog
    /// fires and checks every message arrived
    Run(cmd::run::Opts),
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    pretty_env_logger::init();

    let cli = CourierCli::parse();
    if let Some(cmd) = cli.cmd {
        info!("running cmd: {:#?}", &cmd);
        match cmd {
            Cmd::Run(opts) => cmd::run::handle(opts).await,
        }?
    }

    Ok(())
}
