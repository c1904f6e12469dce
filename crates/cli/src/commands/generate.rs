//! Key Generation Commands

use anyhow::Result;
use clap::Subcommand;
use meshgate_common::MachinePrivate;
use serde_json::json;

use crate::output::OutputFormat;

#[derive(Subcommand)]
pub enum GenerateCommands {
    /// Print a new private key in privkey: form
    PrivateKey,
}

pub fn execute(cmd: GenerateCommands, format: OutputFormat) -> Result<()> {
    match cmd {
        GenerateCommands::PrivateKey => {
            let key = MachinePrivate::generate();
            if format.is_json() {
                let doc = json!({
                    "private_key": key.to_prefixed_hex(),
                    "public_key": key.public().to_string(),
                });
                let rendered = if format == OutputFormat::JsonLine {
                    serde_json::to_string(&doc)?
                } else {
                    serde_json::to_string_pretty(&doc)?
                };
                println!("{}", rendered);
            } else {
                println!("{}", key.to_prefixed_hex());
            }
        }
    }

    Ok(())
}
