//! Core types for Meshgate

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::keys::{DiscoPublic, MachinePublic, NodePublic};

/// How a machine was brought into its namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterMethod {
    Cli,
    AuthKey,
    Interactive,
}

impl std::fmt::Display for RegisterMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "cli"),
            Self::AuthKey => write!(f, "authkey"),
            Self::Interactive => write!(f, "interactive"),
        }
    }
}

impl std::str::FromStr for RegisterMethod {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cli" => Ok(Self::Cli),
            "authkey" => Ok(Self::AuthKey),
            "interactive" => Ok(Self::Interactive),
            _ => Err(format!("unknown register method: {}", s)),
        }
    }
}

/// Addresses held by one machine, one per configured prefix, in prefix order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MachineAddresses(pub Vec<IpAddr>);

impl MachineAddresses {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &IpAddr> {
        self.0.iter()
    }

    pub fn to_string_list(&self) -> Vec<String> {
        self.0.iter().map(IpAddr::to_string).collect()
    }
}

impl std::fmt::Display for MachineAddresses {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_string_list().join(", "))
    }
}

/// An isolation domain grouping machines
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Namespace {
    pub id: i64,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// A device known to the coordinator, pending or registered
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Machine {
    pub id: i64,
    pub machine_key: MachinePublic,
    pub node_key: Option<NodePublic>,
    pub disco_key: Option<DiscoPublic>,
    pub name: String,
    /// Owning namespace; `None` while pending
    pub namespace: Option<Namespace>,
    pub ip_addresses: MachineAddresses,
    pub registered: bool,
    pub register_method: Option<RegisterMethod>,
    pub auth_key_id: Option<i64>,
    /// Registered with an ephemeral pre-auth key
    pub ephemeral: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Machine {
    pub fn namespace_id(&self) -> Option<i64> {
        self.namespace.as_ref().map(|ns| ns.id)
    }

    pub fn namespace_name(&self) -> &str {
        self.namespace.as_ref().map(|ns| ns.name.as_str()).unwrap_or("")
    }

    /// Seen within `window` of `now`
    pub fn is_online(&self, now: DateTime<Utc>, window: chrono::Duration) -> bool {
        self.last_seen.map(|seen| seen > now - window).unwrap_or(false)
    }
}

/// Namespace-scoped credential for unattended registration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreAuthKey {
    pub id: i64,
    pub key: String,
    pub namespace: Namespace,
    pub reusable: bool,
    pub ephemeral: bool,
    pub used: bool,
    pub expiration: Option<DateTime<Utc>>,
    pub acl_tags: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl PreAuthKey {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration.map(|exp| exp <= now).unwrap_or(false)
    }
}
