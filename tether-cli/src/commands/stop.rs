use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;

use tether_daemon::request_stop;

use super::explain;

#[derive(Args, Debug)]
pub struct StopArgs {
    /// Application whose process should be stopped.
    pub application_id: String,
}

impl StopArgs {
    pub fn run(self) -> Result<()> {
        let home = dirs::home_dir().context("could not determine home directory")?;
        let application_id = self.application_id.trim();
        if application_id.is_empty() {
            anyhow::bail!("application id must not be empty");
        }

        request_stop(&home, application_id)
            .map_err(|err| explain(err, &format!("stop '{application_id}'")))?;
        println!("{} {}", "stopped".yellow().bold(), application_id);
        Ok(())
    }
}
