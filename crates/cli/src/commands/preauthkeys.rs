//! Pre-auth Key Commands

use anyhow::{bail, Result};
use chrono::{DateTime, Duration, Utc};
use clap::{Args, Subcommand};
use meshgate_common::PreAuthKey;
use meshgate_coordinator::Coordinator;
use serde::Serialize;

use crate::output::{print_item, print_list, OutputFormat, TableDisplay};

#[derive(Args)]
pub struct PreAuthKeyArgs {
    /// Namespace the keys belong to
    #[arg(short, long, global = true)]
    pub namespace: Option<String>,

    #[command(subcommand)]
    pub command: PreAuthKeyCommands,
}

#[derive(Subcommand)]
pub enum PreAuthKeyCommands {
    /// List the keys of a namespace
    List,

    /// Create a key
    Create {
        /// Allow the key to register more than one machine
        #[arg(long)]
        reusable: bool,

        /// Machines registered with this key are ephemeral
        #[arg(long)]
        ephemeral: bool,

        /// Lifetime such as 30m, 24h or 7d
        #[arg(short, long, value_parser = parse_duration)]
        expiration: Option<Duration>,

        /// ACL tags attached to machines registered with the key
        #[arg(long = "tag")]
        tags: Vec<String>,
    },

    /// Expire a key so it can no longer register machines
    Expire {
        /// The key
        key: String,
    },
}

/// Pre-auth key display wrapper for serialization
#[derive(Serialize)]
pub struct PreAuthKeyDisplay {
    pub id: i64,
    pub key: String,
    pub namespace: String,
    pub reusable: bool,
    pub ephemeral: bool,
    pub used: bool,
    pub expiration: Option<DateTime<Utc>>,
    pub acl_tags: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl From<PreAuthKey> for PreAuthKeyDisplay {
    fn from(key: PreAuthKey) -> Self {
        Self {
            id: key.id,
            key: key.key,
            namespace: key.namespace.name,
            reusable: key.reusable,
            ephemeral: key.ephemeral,
            used: key.used,
            expiration: key.expiration,
            acl_tags: key.acl_tags,
            created_at: key.created_at,
        }
    }
}

impl TableDisplay for PreAuthKeyDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["ID", "Key", "Reusable", "Ephemeral", "Used", "Expiration", "Tags", "Created"]
    }

    fn row(&self) -> Vec<String> {
        let stamp = |t: &DateTime<Utc>| t.format("%Y-%m-%d %H:%M:%S").to_string();
        vec![
            self.id.to_string(),
            self.key.clone(),
            self.reusable.to_string(),
            self.ephemeral.to_string(),
            self.used.to_string(),
            self.expiration.as_ref().map(stamp).unwrap_or_default(),
            self.acl_tags.join(", "),
            stamp(&self.created_at),
        ]
    }
}

/// Parse `<number><unit>` with unit one of s, m, h, d
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    let value: i64 = match digits.parse() {
        Ok(v) if v > 0 => v,
        _ => bail!("invalid duration {:?}: expected a positive number followed by s, m, h or d", s),
    };

    let duration = match unit {
        "s" => Duration::seconds(value),
        "m" => Duration::minutes(value),
        "h" | "" => Duration::hours(value),
        "d" => Duration::days(value),
        other => bail!("invalid duration unit {:?} in {:?}", other, s),
    };
    Ok(duration)
}

pub fn execute(args: PreAuthKeyArgs, coordinator: &Coordinator, format: OutputFormat) -> Result<()> {
    let namespace = args
        .namespace
        .ok_or_else(|| anyhow::anyhow!("--namespace is required for preauthkeys commands"))?;

    match args.command {
        PreAuthKeyCommands::List => {
            let displays: Vec<PreAuthKeyDisplay> = coordinator
                .list_pre_auth_keys(&namespace)?
                .into_iter()
                .map(PreAuthKeyDisplay::from)
                .collect();
            print_list(&displays, format);
        }

        PreAuthKeyCommands::Create {
            reusable,
            ephemeral,
            expiration,
            tags,
        } => {
            let expiration = expiration.map(|d| Utc::now() + d);
            let key = coordinator.create_pre_auth_key(&namespace, reusable, ephemeral, expiration, &tags)?;
            print_item(&PreAuthKeyDisplay::from(key), format);
        }

        PreAuthKeyCommands::Expire { key } => {
            let key = coordinator.expire_pre_auth_key(&namespace, &key)?;
            print_item(&PreAuthKeyDisplay::from(key), format);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30m").unwrap(), Duration::minutes(30));
        assert_eq!(parse_duration("24h").unwrap(), Duration::hours(24));
        assert_eq!(parse_duration("7d").unwrap(), Duration::days(7));
        assert_eq!(parse_duration("90s").unwrap(), Duration::seconds(90));
        assert_eq!(parse_duration("2").unwrap(), Duration::hours(2));
    }

    #[test]
    fn test_parse_duration_rejects_garbage() {
        for bad in ["", "h", "0h", "-1h", "3w", "1.5h"] {
            assert!(parse_duration(bad).is_err(), "{:?} should be rejected", bad);
        }
    }
}
