//! Namespace Commands

use anyhow::Result;
use clap::Subcommand;
use meshgate_common::Namespace;
use meshgate_coordinator::Coordinator;
use serde::Serialize;

use crate::output::{print_item, print_list, print_result, OutputFormat, TableDisplay};

#[derive(Subcommand)]
pub enum NamespaceCommands {
    /// Create a namespace
    Create {
        /// Namespace name
        name: String,
    },

    /// List all namespaces
    List,

    /// Rename a namespace
    Rename {
        /// Current name
        old_name: String,

        /// New name
        new_name: String,
    },

    /// Destroy an empty namespace and its pre-auth keys
    Destroy {
        /// Namespace name
        name: String,

        /// Do not ask for confirmation
        #[arg(long)]
        force: bool,
    },
}

/// Namespace display wrapper for serialization
#[derive(Serialize)]
pub struct NamespaceDisplay {
    pub id: i64,
    pub name: String,
    pub created_at: String,
}

impl From<Namespace> for NamespaceDisplay {
    fn from(ns: Namespace) -> Self {
        Self {
            id: ns.id,
            name: ns.name,
            created_at: ns.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        }
    }
}

impl TableDisplay for NamespaceDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["ID", "Name", "Created"]
    }

    fn row(&self) -> Vec<String> {
        vec![self.id.to_string(), self.name.clone(), self.created_at.clone()]
    }
}

pub fn execute(cmd: NamespaceCommands, coordinator: &Coordinator, format: OutputFormat) -> Result<()> {
    match cmd {
        NamespaceCommands::Create { name } => {
            let ns = coordinator.create_namespace(&name)?;
            print_item(&NamespaceDisplay::from(ns), format);
        }

        NamespaceCommands::List => {
            let displays: Vec<NamespaceDisplay> = coordinator
                .list_namespaces()?
                .into_iter()
                .map(NamespaceDisplay::from)
                .collect();
            print_list(&displays, format);
        }

        NamespaceCommands::Rename { old_name, new_name } => {
            let ns = coordinator.rename_namespace(&old_name, &new_name)?;
            print_item(&NamespaceDisplay::from(ns), format);
        }

        NamespaceCommands::Destroy { name, force } => {
            coordinator.get_namespace(&name)?;
            if !force && !super::confirm(&format!("Do you want to destroy the namespace {}?", name))? {
                print_result("Namespace not destroyed", format);
                return Ok(());
            }
            coordinator.destroy_namespace(&name)?;
            print_result(&format!("Namespace {} destroyed", name), format);
        }
    }

    Ok(())
}
