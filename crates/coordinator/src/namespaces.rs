//! Namespaces and cross-namespace sharing
//!
//! A machine is owned by exactly one namespace. A share grant makes it
//! visible to one more namespace without changing ownership.

use meshgate_common::{Error, Machine, Namespace, Result};
use tracing::info;

use crate::store::CoordinatorDb;

#[derive(Clone)]
pub struct NamespaceService {
    db: CoordinatorDb,
}

impl NamespaceService {
    pub fn new(db: CoordinatorDb) -> Self {
        Self { db }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    pub fn create_namespace(&self, name: &str) -> Result<Namespace> {
        let ns = self.db.create_namespace(name)?;
        info!(namespace = %ns.name, id = ns.id, "Created namespace");
        Ok(ns)
    }

    pub fn get_namespace(&self, name: &str) -> Result<Namespace> {
        self.db
            .get_namespace_by_name(name)?
            .ok_or_else(|| Error::NamespaceNotFound(name.to_string()))
    }

    pub fn list_namespaces(&self) -> Result<Vec<Namespace>> {
        self.db.list_namespaces()
    }

    pub fn rename_namespace(&self, old_name: &str, new_name: &str) -> Result<Namespace> {
        let mut ns = self.get_namespace(old_name)?;
        self.db.rename_namespace(ns.id, new_name)?;
        ns.name = new_name.to_string();
        info!(from = old_name, to = new_name, "Renamed namespace");
        Ok(ns)
    }

    /// Delete a namespace that owns no machines, with its keys and inbound grants
    pub fn destroy_namespace(&self, name: &str) -> Result<()> {
        let ns = self.get_namespace(name)?;
        self.db.delete_namespace(&ns)?;
        info!(namespace = name, "Destroyed namespace");
        Ok(())
    }

    // ========================================================================
    // Membership
    // ========================================================================

    pub fn list_owned_machines(&self, namespace: &str) -> Result<Vec<Machine>> {
        let ns = self.get_namespace(namespace)?;
        self.db.list_machines_in_namespace(ns.id)
    }

    /// Machines shared into `namespace`, never including its own
    pub fn list_shared_machines(&self, namespace: &str) -> Result<Vec<Machine>> {
        let ns = self.get_namespace(namespace)?;
        self.db.list_shared_machines(ns.id)
    }

    /// Owned machines followed by shared-in machines
    pub fn visible_machines(&self, namespace: &str) -> Result<Vec<Machine>> {
        let ns = self.get_namespace(namespace)?;
        let mut machines = self.db.list_machines_in_namespace(ns.id)?;
        machines.extend(self.db.list_shared_machines(ns.id)?);
        Ok(machines)
    }

    // ========================================================================
    // Sharing
    // ========================================================================

    pub fn add_share(&self, machine: &Machine, namespace: &str) -> Result<()> {
        let ns = self.get_namespace(namespace)?;
        if machine.namespace_id() == Some(ns.id) {
            return Err(Error::SelfShare {
                machine: machine.name.clone(),
                namespace: ns.name,
            });
        }

        self.db.insert_share(machine, &ns)?;
        info!(machine = %machine.name, namespace = %ns.name, "Shared machine");
        Ok(())
    }

    pub fn remove_share(&self, machine: &Machine, namespace: &str) -> Result<()> {
        let ns = self.get_namespace(namespace)?;
        if !self.db.delete_share(machine.id, ns.id)? {
            return Err(Error::GrantNotFound {
                machine: machine.name.clone(),
                namespace: ns.name,
            });
        }
        info!(machine = %machine.name, namespace = %ns.name, "Removed machine share");
        Ok(())
    }
}
