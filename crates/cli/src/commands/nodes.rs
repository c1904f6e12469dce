//! Node Commands

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use clap::{Args, Subcommand};
use colored::Colorize;
use meshgate_common::Machine;
use meshgate_coordinator::Coordinator;
use serde::Serialize;

use crate::output::{print_item, print_list, print_result, OutputFormat, TableDisplay};

/// Machines seen within this window are shown as online
pub const ONLINE_WINDOW_MINUTES: i64 = 5;

#[derive(Args)]
pub struct NodesArgs {
    /// Namespace the command operates in
    #[arg(short, long, global = true)]
    pub namespace: Option<String>,

    #[command(subcommand)]
    pub command: NodeCommands,
}

#[derive(Subcommand)]
pub enum NodeCommands {
    /// List owned and shared machines of a namespace
    List,

    /// Approve a pending machine into the namespace
    Register {
        /// Machine key, with or without the mkey: prefix
        machine_key: String,
    },

    /// Delete a machine
    Delete {
        /// Machine ID
        id: i64,

        /// Do not ask for confirmation
        #[arg(long)]
        force: bool,
    },

    /// Share a machine with another namespace
    Share {
        /// Machine ID
        id: i64,

        /// Destination namespace
        to: String,
    },

    /// Remove a machine from the namespace it was shared with
    Unshare {
        /// Machine ID
        id: i64,
    },
}

/// Machine display wrapper for serialization
#[derive(Serialize)]
pub struct NodeDisplay {
    pub id: i64,
    pub name: String,
    pub machine_key: String,
    pub node_key: String,
    pub namespace: String,
    pub ip_addresses: Vec<String>,
    pub ephemeral: bool,
    pub registered: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub online: bool,
    /// Shown through a share grant rather than owned
    pub shared: bool,
    #[serde(skip)]
    node_key_short: String,
}

impl NodeDisplay {
    pub fn new(machine: Machine, current_namespace: &str, now: DateTime<Utc>) -> Self {
        let online = machine.is_online(now, Duration::minutes(ONLINE_WINDOW_MINUTES));
        Self {
            id: machine.id,
            shared: machine.namespace_name() != current_namespace,
            namespace: machine.namespace_name().to_string(),
            machine_key: machine.machine_key.to_string(),
            node_key: machine.node_key.map(|k| k.to_string()).unwrap_or_default(),
            node_key_short: machine.node_key.map(|k| k.short_string()).unwrap_or_default(),
            ip_addresses: machine.ip_addresses.to_string_list(),
            ephemeral: machine.ephemeral,
            registered: machine.registered,
            last_seen: machine.last_seen,
            online,
            name: machine.name,
        }
    }
}

impl TableDisplay for NodeDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["ID", "Name", "NodeKey", "Namespace", "IP addresses", "Ephemeral", "Last seen", "Online"]
    }

    fn row(&self) -> Vec<String> {
        let namespace = if self.shared {
            self.namespace.bright_yellow()
        } else {
            self.namespace.bright_magenta()
        };
        let online = if self.online {
            "true".bright_green()
        } else {
            "false".bright_red()
        };

        vec![
            self.id.to_string(),
            self.name.clone(),
            self.node_key_short.clone(),
            namespace.to_string(),
            self.ip_addresses.join(", "),
            self.ephemeral.to_string(),
            self.last_seen
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_default(),
            online.to_string(),
        ]
    }
}

pub fn execute(args: NodesArgs, coordinator: &Coordinator, format: OutputFormat) -> Result<()> {
    let namespace = args
        .namespace
        .ok_or_else(|| anyhow::anyhow!("--namespace is required for nodes commands"))?;

    match args.command {
        NodeCommands::List => {
            let mut machines = coordinator.list_machines_in_namespace(&namespace)?;
            machines.extend(coordinator.list_shared_machines_in_namespace(&namespace)?);

            let now = Utc::now();
            let displays: Vec<NodeDisplay> = machines
                .into_iter()
                .map(|m| NodeDisplay::new(m, &namespace, now))
                .collect();
            print_list(&displays, format);
        }

        NodeCommands::Register { machine_key } => {
            let machine = coordinator.register_machine(&machine_key, &namespace)?;
            if format.is_json() {
                print_item(&NodeDisplay::new(machine, &namespace, Utc::now()), format);
            } else {
                print_result(
                    &format!("Machine {} registered with {}", machine.name, machine.ip_addresses),
                    format,
                );
            }
        }

        NodeCommands::Delete { id, force } => {
            let machine = coordinator.get_machine_by_id(id)?;
            if !force && !super::confirm(&format!("Do you want to remove the node {}?", machine.name))? {
                print_result("Node not deleted", format);
                return Ok(());
            }
            coordinator.delete_machine(id)?;
            print_result("Node deleted", format);
        }

        NodeCommands::Share { id, to } => {
            // The origin namespace must exist even though sharing only needs the destination
            coordinator.get_namespace(&namespace)?;
            coordinator.add_shared_machine_to_namespace(id, &to)?;
            print_result("Node shared", format);
        }

        NodeCommands::Unshare { id } => {
            coordinator.remove_shared_machine_from_namespace(id, &namespace)?;
            print_result("Node unshared", format);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshgate_common::{MachineAddresses, MachinePrivate, Namespace};

    fn machine(namespace: &str, last_seen: Option<DateTime<Utc>>) -> Machine {
        let now = Utc::now();
        Machine {
            id: 7,
            machine_key: MachinePrivate::generate().public(),
            node_key: None,
            disco_key: None,
            name: "laptop".to_string(),
            namespace: Some(Namespace {
                id: 1,
                name: namespace.to_string(),
                created_at: now,
            }),
            ip_addresses: MachineAddresses(vec!["100.64.0.1".parse().unwrap()]),
            registered: true,
            register_method: None,
            auth_key_id: None,
            ephemeral: false,
            last_seen,
            created_at: now,
        }
    }

    #[test]
    fn test_shared_flag() {
        let now = Utc::now();
        assert!(!NodeDisplay::new(machine("alpha", None), "alpha", now).shared);
        assert!(NodeDisplay::new(machine("alpha", None), "beta", now).shared);
    }

    #[test]
    fn test_online_window() {
        let now = Utc::now();
        let recent = NodeDisplay::new(machine("a", Some(now - Duration::minutes(1))), "a", now);
        let stale = NodeDisplay::new(machine("a", Some(now - Duration::minutes(10))), "a", now);
        let never = NodeDisplay::new(machine("a", None), "a", now);
        assert!(recent.online);
        assert!(!stale.online);
        assert!(!never.online);
    }

    #[test]
    fn test_row_shape() {
        colored::control::set_override(false);
        let display = NodeDisplay::new(machine("alpha", None), "alpha", Utc::now());
        let row = display.row();
        assert_eq!(row.len(), NodeDisplay::headers().len());
        assert_eq!(row[3], "alpha");
        assert_eq!(row[4], "100.64.0.1");
        assert_eq!(row[7], "false");
    }
}
