//! Commands listing.

use clap::Args;
use vmshim::protocol::Command;

/// List the command names `exec` accepts
#[derive(Args, Debug)]
pub struct CommandsCmd {}

impl CommandsCmd {
    pub fn run(self) -> vmshim::Result<()> {
        for name in Command::NAMES {
            println!("{}", name);
        }
        Ok(())
    }
}
