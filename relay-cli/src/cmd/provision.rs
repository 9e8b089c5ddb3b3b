//! Ensure the configured stream exists.

use anyhow::{Context, Result};
use relay::StreamProvisioner;
use structopt::StructOpt;

use crate::config::Config;
use crate::Relay;

/// Ensure the configured stream exists.
#[derive(StructOpt)]
#[structopt(name = "provision")]
pub struct Provision {}

impl Provision {
    pub async fn run(&self, base: &Relay, config: &Config) -> Result<()> {
        let service = base.service(config).await?;
        let outcome = StreamProvisioner::new(service)
            .ensure(&config.descriptor())
            .await
            .context("error provisioning stream")?;
        tracing::info!(stream = %config.stream_name, ?outcome, "stream provisioned");
        Ok(())
    }
}
