//! `tether ps`: tracked processes, live from the daemon or from the store.

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use colored::Colorize;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tabled::{settings::Style, Table, Tabled};

use tether_core::{store, ChannelState};
use tether_daemon::{request_status, DaemonError};

#[derive(Args, Debug)]
pub struct PsArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

impl PsArgs {
    pub fn run(self) -> Result<()> {
        let home = dirs::home_dir().context("could not determine home directory")?;
        let report = build_report(&home)?;

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&report).context("failed to serialize ps JSON")?
            );
            return Ok(());
        }

        print_table(&report);
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct StatusProcess {
    application_id: String,
    process_id: String,
    channel_state: ChannelState,
    last_event_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct StatusChannel {
    process_id: String,
}

#[derive(Debug, Serialize)]
struct PsReport {
    daemon_running: bool,
    processes: Vec<PsEntry>,
}

#[derive(Debug, Serialize)]
struct PsEntry {
    application_id: String,
    process_id: String,
    /// `None` when read from the store without a daemon.
    channel_state: Option<ChannelState>,
    channel_open: bool,
    last_event_at: Option<DateTime<Utc>>,
}

#[derive(Tabled)]
struct PsTableRow {
    #[tabled(rename = "application")]
    application_id: String,
    #[tabled(rename = "pid")]
    process_id: String,
    #[tabled(rename = "channel")]
    channel: String,
    #[tabled(rename = "last event")]
    last_event: String,
}

fn build_report(home: &Path) -> Result<PsReport> {
    match request_status(home) {
        Ok(status) => report_from_status(status),
        Err(DaemonError::DaemonNotRunning { .. }) => report_from_store(home),
        Err(err) => Err(err).context("failed to query daemon status"),
    }
}

fn report_from_status(mut status: Value) -> Result<PsReport> {
    let processes: Vec<StatusProcess> =
        serde_json::from_value(status["processes"].take()).context("malformed process list")?;
    let channels: Vec<StatusChannel> =
        serde_json::from_value(status["channels"].take()).context("malformed channel list")?;
    let open: BTreeSet<String> = channels.into_iter().map(|c| c.process_id).collect();

    Ok(PsReport {
        daemon_running: true,
        processes: processes
            .into_iter()
            .map(|p| PsEntry {
                channel_open: open.contains(&p.process_id),
                application_id: p.application_id,
                process_id: p.process_id,
                channel_state: Some(p.channel_state),
                last_event_at: Some(p.last_event_at),
            })
            .collect(),
    })
}

fn report_from_store(home: &Path) -> Result<PsReport> {
    let state = store::load_at(home).context("failed to read persisted processes")?;
    Ok(PsReport {
        daemon_running: false,
        processes: state
            .entries
            .into_iter()
            .map(|(application_id, process_id)| PsEntry {
                application_id: application_id.0,
                process_id: process_id.0,
                channel_state: None,
                channel_open: false,
                last_event_at: None,
            })
            .collect(),
    })
}

fn print_table(report: &PsReport) {
    let daemon = if report.daemon_running {
        "daemon running".green().to_string()
    } else {
        "daemon not running".red().to_string()
    };
    println!(
        "Tether v{} | {} | {} tracked",
        env!("CARGO_PKG_VERSION"),
        daemon,
        report.processes.len(),
    );

    if report.processes.is_empty() {
        println!("No tracked processes.");
        return;
    }

    let now = Utc::now();
    let rows: Vec<PsTableRow> = report
        .processes
        .iter()
        .map(|entry| PsTableRow {
            application_id: entry.application_id.clone(),
            process_id: entry.process_id.clone(),
            channel: channel_label(entry.channel_state),
            last_event: entry
                .last_event_at
                .map(|at| format_age(now, at))
                .unwrap_or_else(|| "-".to_string()),
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");

    if !report.daemon_running {
        println!("Showing persisted processes. Run 'tether daemon start' to reconnect.");
    }
}

fn channel_label(state: Option<ChannelState>) -> String {
    match state {
        None => "unknown".bright_black().to_string(),
        Some(ChannelState::Connecting) => "connecting".yellow().to_string(),
        Some(ChannelState::Open) => "open".green().bold().to_string(),
        Some(ChannelState::Closed) => "closed".bright_black().to_string(),
        Some(ChannelState::Errored) => "errored".red().bold().to_string(),
    }
}

fn format_age(now: DateTime<Utc>, at: DateTime<Utc>) -> String {
    let seconds = (now - at).num_seconds().max(0);
    match seconds {
        0..=59 => format!("{seconds}s ago"),
        60..=3599 => format!("{}m ago", seconds / 60),
        3600..=86_399 => format!("{}h ago", seconds / 3600),
        _ => format!("{}d ago", seconds / 86_400),
    }
}
