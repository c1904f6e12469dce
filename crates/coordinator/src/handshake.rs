//! Registration handshake over the secure control channel
//!
//! A machine sends a sealed `RegisterRequest` addressed to the coordinator's
//! long-term key. The reply is sealed back to the machine key it came from.

use std::sync::Arc;

use meshgate_common::crypto;
use meshgate_common::{DiscoPublic, Machine, MachinePrivate, MachinePublic, NodePublic, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::registry::MachineRegistry;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RegisterRequest {
    pub node_key: Option<NodePublic>,
    #[serde(default)]
    pub old_node_key: Option<NodePublic>,
    #[serde(default)]
    pub disco_key: Option<DiscoPublic>,
    #[serde(default)]
    pub auth: Option<AuthInfo>,
    #[serde(default)]
    pub hostinfo: Option<HostInfo>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AuthInfo {
    #[serde(default)]
    pub auth_key: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HostInfo {
    #[serde(default)]
    pub hostname: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RegisterResponse {
    pub machine_authorized: bool,
    /// Owning namespace once authorized
    #[serde(default)]
    pub user: String,
    /// Where an operator approves the machine when it is not yet authorized
    #[serde(default, rename = "AuthURL")]
    pub auth_url: String,
}

#[derive(Clone)]
pub struct HandshakeService {
    registry: MachineRegistry,
    private_key: Arc<MachinePrivate>,
    server_url: String,
}

impl HandshakeService {
    pub fn new(registry: MachineRegistry, private_key: MachinePrivate, server_url: &str) -> Self {
        Self {
            registry,
            private_key: Arc::new(private_key),
            server_url: server_url.trim_end_matches('/').to_string(),
        }
    }

    /// Public half of the coordinator key machines seal their requests to
    pub fn public_key(&self) -> MachinePublic {
        self.private_key.public()
    }

    /// Handle one sealed register request from `machine_key`.
    ///
    /// Pre-auth key rejections and store failures are returned as errors for
    /// the transport to map; everything else yields a sealed response.
    pub fn handle_register(&self, machine_key: &MachinePublic, body: &[u8]) -> Result<Vec<u8>> {
        let req: RegisterRequest = crypto::decode(body, machine_key, &self.private_key)?;
        let machine = self.registry.lookup_or_create_pending(machine_key)?;

        let response = if machine.registered {
            self.handle_registered(machine_key, &machine, &req)?
        } else {
            self.handle_pending(machine_key, &machine, &req)?
        };

        self.registry.touch(machine.id)?;
        crypto::encode(&response, machine_key, &self.private_key)
    }

    fn handle_registered(
        &self,
        machine_key: &MachinePublic,
        machine: &Machine,
        req: &RegisterRequest,
    ) -> Result<RegisterResponse> {
        let current = machine.node_key;
        let rotating = req.old_node_key.is_some() && req.old_node_key == current;

        match req.node_key {
            Some(node_key) if rotating => {
                self.registry
                    .update_node_key(machine_key, &node_key, req.disco_key.as_ref())?;
                info!(machine = %machine.name, node_key = %node_key.short_string(), "Rotated node key");
            }
            Some(node_key) if current == Some(node_key) || current.is_none() => {
                if current.is_none() || req.disco_key.is_some() {
                    self.registry
                        .update_node_key(machine_key, &node_key, req.disco_key.as_ref())?;
                }
            }
            _ => {
                debug!(machine = %machine.name, "Node key mismatch on registered machine");
                return Ok(self.needs_approval(machine_key));
            }
        }

        Ok(RegisterResponse {
            machine_authorized: true,
            user: machine.namespace_name().to_string(),
            auth_url: String::new(),
        })
    }

    fn handle_pending(
        &self,
        machine_key: &MachinePublic,
        machine: &Machine,
        req: &RegisterRequest,
    ) -> Result<RegisterResponse> {
        if let Some(node_key) = req.node_key {
            self.registry
                .update_node_key(machine_key, &node_key, req.disco_key.as_ref())?;
        }
        if let Some(hostname) = req.hostinfo.as_ref().map(|h| h.hostname.trim()) {
            if !hostname.is_empty() && hostname != machine.name {
                self.registry.set_name(machine_key, hostname)?;
            }
        }

        let auth_key = req.auth.as_ref().map(|a| a.auth_key.as_str()).unwrap_or("");
        if auth_key.is_empty() {
            debug!(machine_key = %machine_key.short_string(), "Machine awaiting approval");
            return Ok(self.needs_approval(machine_key));
        }

        let registered = self
            .registry
            .register_with_pre_auth_key(machine_key, auth_key, None)?;
        Ok(RegisterResponse {
            machine_authorized: true,
            user: registered.namespace_name().to_string(),
            auth_url: String::new(),
        })
    }

    fn needs_approval(&self, machine_key: &MachinePublic) -> RegisterResponse {
        RegisterResponse {
            machine_authorized: false,
            user: String::new(),
            auth_url: format!("{}/register?key={}", self.server_url, machine_key.to_hex()),
        }
    }
}
