/*!
The `depotdl` binary: a thin front end over the `depotdl` engine that
pairs depot manifests with their keys and downloads them.
*/

mod app;
mod cli;
mod depot;

use anyhow::Result;
use cli::{Command, Opt};
use structopt::StructOpt;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    let options = Opt::from_args();
    tracing_subscriber::fmt()
        .with_max_level(options.log_level()?)
        .with_writer(std::io::stderr)
        .init();

    // First ctrl-c asks the engine to stop; it checkpoints and returns
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    match options.command.clone() {
        Command::App { app_path } => app::run(&options, &app_path, cancel).await,
        Command::Depot {
            manifest_path,
            depot_key,
        } => depot::run(&options, &manifest_path, &depot_key, cancel).await,
    }
}
