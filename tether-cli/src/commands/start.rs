//! `tether start`: launch an application through the daemon.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;

use tether_core::ProcessHandle;
use tether_daemon::request_start;

use super::explain;

#[derive(Args, Debug)]
pub struct StartArgs {
    /// Application to launch.
    pub application_id: String,

    /// Print the new process handle as JSON.
    #[arg(long)]
    pub json: bool,
}

impl StartArgs {
    pub fn run(self) -> Result<()> {
        let home = dirs::home_dir().context("could not determine home directory")?;
        let application_id = self.application_id.trim();
        if application_id.is_empty() {
            anyhow::bail!("application id must not be empty");
        }

        let data = request_start(&home, application_id)
            .map_err(|err| explain(err, &format!("start '{application_id}'")))?;

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&data).context("failed to render handle JSON")?
            );
            return Ok(());
        }

        let handle: ProcessHandle =
            serde_json::from_value(data).context("daemon returned an invalid process handle")?;
        println!(
            "{} {} (pid {})",
            "started".green().bold(),
            handle.application_id,
            handle.process_id,
        );
        Ok(())
    }
}
