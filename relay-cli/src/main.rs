use anyhow::Result;
use structopt::StructOpt;

use relay_cli::Relay;

#[tokio::main]
async fn main() -> Result<()> {
    Relay::from_args().run().await
}
