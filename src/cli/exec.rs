//! Exec command implementation.

use clap::Args;
use serde_json::Value;
use std::io::Read;
use std::path::{Path, PathBuf};
use vmshim::protocol::Answer;
use vmshim::{driver, Dispatcher, JobPoller, ShimConfig};

/// Execute one orchestrator command
#[derive(Args, Debug)]
pub struct ExecCmd {
    /// Command name, e.g. StartCommand
    pub command: String,

    /// Read the JSON payload from this file instead of stdin
    #[arg(short, long)]
    pub input: Option<PathBuf>,

    /// Pretty-print the answer
    #[arg(long)]
    pub pretty: bool,
}

impl ExecCmd {
    /// Print the answer on stdout. Setup failures are reported as failed
    /// answers too, so the caller always gets one.
    pub fn run(self, config_path: Option<&Path>) -> vmshim::Result<()> {
        let answer = match self.execute(config_path) {
            Ok(answer) => answer,
            Err(e) => {
                tracing::error!(command = %self.command, error = %e, "could not execute command");
                Answer::failure(e.to_string())
            }
        };

        let json = if self.pretty {
            serde_json::to_string_pretty(&answer)?
        } else {
            serde_json::to_string(&answer)?
        };
        println!("{}", json);
        Ok(())
    }

    fn execute(&self, config_path: Option<&Path>) -> vmshim::Result<Answer> {
        let payload = self.read_payload()?;
        let config = ShimConfig::load(config_path)?;
        let poller = JobPoller::from_config(&config)?;
        let mut driver = driver::open(&config)?;

        let answer = Dispatcher::new(driver.as_mut(), poller)
            .with_ready_details(config.ready_details.clone())
            .dispatch(&self.command, payload);

        // Closing persists the session, so a failed close voids the answer.
        if let Err(e) = driver.close() {
            tracing::error!(driver = driver.name(), error = %e, "failed to close driver session");
            return Ok(Answer::failure(format!(
                "{} failed to persist: {}",
                self.command, e
            )));
        }
        Ok(answer)
    }

    /// Payload JSON; empty input means no payload.
    fn read_payload(&self) -> vmshim::Result<Value> {
        let raw = match &self.input {
            Some(path) => std::fs::read_to_string(path)?,
            None => {
                let mut buf = String::new();
                std::io::stdin().read_to_string(&mut buf)?;
                buf
            }
        };

        if raw.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&raw)
            .map_err(|e| vmshim::Error::InvalidCommand(format!("payload is not valid JSON: {}", e)))
    }
}
