//! Machine registry
//!
//! A machine moves `Unknown -> Pending -> Registered`. Pending rows are
//! created on first contact, keyed by machine key; registration assigns the
//! owning namespace and addresses in a single store transaction.

use chrono::Utc;
use meshgate_common::{
    DiscoPublic, Error, Machine, MachinePublic, NodePublic, RegisterMethod, Result,
};
use tracing::{debug, info, warn};

use crate::allocator::AddressAllocator;
use crate::preauth::PreAuthKeyService;
use crate::store::{CoordinatorDb, Registration};

/// Attempts for a registration that keeps losing address races
pub const REGISTER_ATTEMPTS: usize = 3;

#[derive(Clone)]
pub struct MachineRegistry {
    db: CoordinatorDb,
    allocator: AddressAllocator,
    keys: PreAuthKeyService,
}

impl MachineRegistry {
    pub fn new(db: CoordinatorDb, allocator: AddressAllocator) -> Self {
        Self {
            keys: PreAuthKeyService::new(db.clone()),
            db,
            allocator,
        }
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    /// Return the machine for `machine_key`, creating a pending one if needed
    pub fn lookup_or_create_pending(&self, machine_key: &MachinePublic) -> Result<Machine> {
        if let Some(machine) = self.db.get_machine_by_key(machine_key)? {
            return Ok(machine);
        }
        let name = format!("machine-{}", &machine_key.to_hex()[..8]);
        let machine = self.db.insert_pending_machine(machine_key, &name)?;
        info!(machine_key = %machine_key.short_string(), id = machine.id, "New pending machine");
        Ok(machine)
    }

    pub fn get_by_id(&self, id: i64) -> Result<Machine> {
        self.db
            .get_machine_by_id(id)?
            .ok_or_else(|| Error::MachineNotFound(id.to_string()))
    }

    pub fn get_by_machine_key(&self, machine_key: &MachinePublic) -> Result<Machine> {
        self.db
            .get_machine_by_key(machine_key)?
            .ok_or_else(|| Error::MachineNotFound(machine_key.to_string()))
    }

    /// Machine `name` owned by `namespace`
    pub fn get(&self, namespace: &str, name: &str) -> Result<Machine> {
        let ns = self
            .db
            .get_namespace_by_name(namespace)?
            .ok_or_else(|| Error::NamespaceNotFound(namespace.to_string()))?;
        self.db
            .get_machine_by_name(ns.id, name)?
            .ok_or_else(|| Error::MachineNotFound(format!("{}/{}", namespace, name)))
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Operator approval: move a pending machine into `namespace`.
    pub fn register_with_namespace(
        &self,
        machine_key: &MachinePublic,
        namespace: &str,
    ) -> Result<Machine> {
        let machine = self.pending(machine_key)?;
        let ns = self
            .db
            .get_namespace_by_name(namespace)?
            .ok_or_else(|| Error::NamespaceNotFound(namespace.to_string()))?;

        self.commit(machine_key, &machine, ns.id, RegisterMethod::Cli, None, false)
    }

    /// Unattended registration with a pre-auth key.
    ///
    /// Single-use keys are claimed in the same transaction as the
    /// registration, so a key validated by two callers registers one machine.
    /// Ephemeral keys are never consumed.
    pub fn register_with_pre_auth_key(
        &self,
        machine_key: &MachinePublic,
        key: &str,
        expected_namespace: Option<&str>,
    ) -> Result<Machine> {
        let machine = self.pending(machine_key)?;
        let pak = self.keys.validate(key, expected_namespace)?;
        let consume = !pak.reusable && !pak.ephemeral;

        self.commit(
            machine_key,
            &machine,
            pak.namespace.id,
            RegisterMethod::AuthKey,
            Some(pak.id),
            consume,
        )
    }

    fn pending(&self, machine_key: &MachinePublic) -> Result<Machine> {
        let machine = self.get_by_machine_key(machine_key)?;
        if machine.registered {
            return Err(Error::AlreadyRegistered(machine_key.to_string()));
        }
        Ok(machine)
    }

    /// Allocate and persist. Losing an address race to a concurrent
    /// registration is retried with a fresh allocation, up to
    /// `REGISTER_ATTEMPTS` times.
    fn commit(
        &self,
        machine_key: &MachinePublic,
        machine: &Machine,
        namespace_id: i64,
        method: RegisterMethod,
        auth_key_id: Option<i64>,
        consume_key: bool,
    ) -> Result<Machine> {
        let mut attempt = 1;
        loop {
            let addresses = self.allocator.allocate(&self.db)?;
            debug!(machine_key = %machine_key.short_string(), %addresses, attempt, "Allocated addresses");

            let committed = self.db.commit_registration(&Registration {
                machine_id: machine.id,
                namespace_id,
                addresses,
                method,
                auth_key_id,
                consume_key,
            });
            match committed {
                Ok(()) => break,
                Err(e) if e.is_retryable() && attempt < REGISTER_ATTEMPTS => {
                    warn!(attempt, error = %e, "Registration lost an address race, retrying");
                    attempt += 1;
                }
                Err(Error::AlreadyRegistered(_)) => {
                    return Err(Error::AlreadyRegistered(machine_key.to_string()))
                }
                Err(e) => return Err(e),
            }
        }

        let machine = self.get_by_id(machine.id)?;
        info!(
            machine = %machine.name,
            namespace = machine.namespace_name(),
            addresses = %machine.ip_addresses,
            method = %method,
            "Registered machine"
        );
        Ok(machine)
    }

    // ========================================================================
    // Updates
    // ========================================================================

    /// Record a rotated node key and, when given, a new disco key
    pub fn update_node_key(
        &self,
        machine_key: &MachinePublic,
        node_key: &NodePublic,
        disco_key: Option<&DiscoPublic>,
    ) -> Result<Machine> {
        let machine = self.get_by_machine_key(machine_key)?;
        self.db.update_machine_keys(machine.id, Some(node_key), disco_key)?;
        debug!(machine = %machine.name, node_key = %node_key.short_string(), "Updated node key");
        self.get_by_id(machine.id)
    }

    /// Mark the machine as seen now
    pub fn touch(&self, machine_id: i64) -> Result<()> {
        self.db.touch_machine(machine_id, Utc::now())
    }

    pub fn set_name(&self, machine_key: &MachinePublic, name: &str) -> Result<Machine> {
        let machine = self.get_by_machine_key(machine_key)?;
        if machine.name != name {
            self.db.set_machine_name(&machine, name)?;
        }
        self.get_by_id(machine.id)
    }

    /// Remove the machine; its addresses are free for the next allocation
    pub fn delete(&self, machine: &Machine) -> Result<()> {
        if !self.db.delete_machine(machine.id)? {
            return Err(Error::MachineNotFound(machine.id.to_string()));
        }
        info!(machine = %machine.name, addresses = %machine.ip_addresses, "Deleted machine");
        Ok(())
    }
}
