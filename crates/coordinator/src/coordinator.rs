//! Coordinator facade
//!
//! Builds every service over one shared database handle and exposes the
//! operations the operator CLI needs.

use chrono::{DateTime, Utc};
use meshgate_common::{Database, Error, Machine, MachinePrivate, MachinePublic, Namespace, PreAuthKey, Result};
use tracing::info;

use crate::allocator::AddressAllocator;
use crate::config::CoordinatorConfig;
use crate::handshake::HandshakeService;
use crate::namespaces::NamespaceService;
use crate::preauth::PreAuthKeyService;
use crate::registry::MachineRegistry;
use crate::store::CoordinatorDb;

#[derive(Clone)]
pub struct Coordinator {
    registry: MachineRegistry,
    namespaces: NamespaceService,
    pre_auth_keys: PreAuthKeyService,
    handshake: HandshakeService,
}

impl Coordinator {
    /// Open the on-disk store and coordinator key described by `config`
    pub fn open(config: &CoordinatorConfig) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.store_path)?;

        let db = Database::open(config.db_path())?;
        let private_key = config.load_or_generate_private_key()?;
        Self::new(db, config, private_key)
    }

    pub fn new(db: Database, config: &CoordinatorConfig, private_key: MachinePrivate) -> Result<Self> {
        let db = CoordinatorDb::new(db);
        db.init_schema()?;

        let allocator = AddressAllocator::new(config.ip_prefixes.clone())?;
        let registry = MachineRegistry::new(db.clone(), allocator);
        let handshake = HandshakeService::new(registry.clone(), private_key, &config.server_url);

        info!(prefixes = ?config.ip_prefixes, "Coordinator ready");
        Ok(Self {
            namespaces: NamespaceService::new(db.clone()),
            pre_auth_keys: PreAuthKeyService::new(db),
            registry,
            handshake,
        })
    }

    pub fn registry(&self) -> &MachineRegistry {
        &self.registry
    }

    pub fn namespaces(&self) -> &NamespaceService {
        &self.namespaces
    }

    pub fn pre_auth_keys(&self) -> &PreAuthKeyService {
        &self.pre_auth_keys
    }

    pub fn handshake(&self) -> &HandshakeService {
        &self.handshake
    }

    // ========================================================================
    // Machines
    // ========================================================================

    /// Approve the pending machine with `machine_key` into `namespace`.
    ///
    /// Accepts the key with or without its `mkey:` prefix.
    pub fn register_machine(&self, machine_key: &str, namespace: &str) -> Result<Machine> {
        let key = MachinePublic::parse(machine_key)?;
        self.registry.register_with_namespace(&key, namespace)
    }

    pub fn list_machines_in_namespace(&self, namespace: &str) -> Result<Vec<Machine>> {
        self.namespaces.list_owned_machines(namespace)
    }

    pub fn list_shared_machines_in_namespace(&self, namespace: &str) -> Result<Vec<Machine>> {
        self.namespaces.list_shared_machines(namespace)
    }

    pub fn get_machine_by_id(&self, id: i64) -> Result<Machine> {
        self.registry.get_by_id(id)
    }

    pub fn delete_machine(&self, id: i64) -> Result<Machine> {
        let machine = self.registry.get_by_id(id)?;
        self.registry.delete(&machine)?;
        Ok(machine)
    }

    pub fn add_shared_machine_to_namespace(&self, id: i64, namespace: &str) -> Result<Machine> {
        let machine = self.registry.get_by_id(id)?;
        if !machine.registered {
            return Err(Error::MachineNotFound(format!("{} (not registered)", id)));
        }
        self.namespaces.add_share(&machine, namespace)?;
        Ok(machine)
    }

    pub fn remove_shared_machine_from_namespace(&self, id: i64, namespace: &str) -> Result<Machine> {
        let machine = self.registry.get_by_id(id)?;
        self.namespaces.remove_share(&machine, namespace)?;
        Ok(machine)
    }

    // ========================================================================
    // Namespaces
    // ========================================================================

    pub fn create_namespace(&self, name: &str) -> Result<Namespace> {
        self.namespaces.create_namespace(name)
    }

    pub fn get_namespace(&self, name: &str) -> Result<Namespace> {
        self.namespaces.get_namespace(name)
    }

    pub fn list_namespaces(&self) -> Result<Vec<Namespace>> {
        self.namespaces.list_namespaces()
    }

    pub fn rename_namespace(&self, old_name: &str, new_name: &str) -> Result<Namespace> {
        self.namespaces.rename_namespace(old_name, new_name)
    }

    pub fn destroy_namespace(&self, name: &str) -> Result<()> {
        self.namespaces.destroy_namespace(name)
    }

    // ========================================================================
    // Pre-auth keys
    // ========================================================================

    pub fn create_pre_auth_key(
        &self,
        namespace: &str,
        reusable: bool,
        ephemeral: bool,
        expiration: Option<DateTime<Utc>>,
        acl_tags: &[String],
    ) -> Result<PreAuthKey> {
        self.pre_auth_keys
            .create(namespace, reusable, ephemeral, expiration, acl_tags)
    }

    pub fn list_pre_auth_keys(&self, namespace: &str) -> Result<Vec<PreAuthKey>> {
        self.pre_auth_keys.list(namespace)
    }

    pub fn expire_pre_auth_key(&self, namespace: &str, key: &str) -> Result<PreAuthKey> {
        self.pre_auth_keys.expire(namespace, key)
    }
}
