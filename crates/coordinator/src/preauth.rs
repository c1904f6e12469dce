//! Pre-auth keys: namespace-scoped credentials for unattended registration

use chrono::{DateTime, Utc};
use meshgate_common::{Error, KeyRejection, PreAuthKey, Result};
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{debug, info};

use crate::store::CoordinatorDb;

/// Random bytes per key; hex-encoded to 48 characters
const KEY_BYTES: usize = 24;

#[derive(Clone)]
pub struct PreAuthKeyService {
    db: CoordinatorDb,
}

impl PreAuthKeyService {
    pub fn new(db: CoordinatorDb) -> Self {
        Self { db }
    }

    pub fn create(
        &self,
        namespace: &str,
        reusable: bool,
        ephemeral: bool,
        expiration: Option<DateTime<Utc>>,
        acl_tags: &[String],
    ) -> Result<PreAuthKey> {
        let ns = self
            .db
            .get_namespace_by_name(namespace)?
            .ok_or_else(|| Error::NamespaceNotFound(namespace.to_string()))?;

        let mut bytes = [0u8; KEY_BYTES];
        OsRng.fill_bytes(&mut bytes);
        let key = self.db.create_pre_auth_key(
            &ns,
            &hex::encode(bytes),
            reusable,
            ephemeral,
            expiration,
            acl_tags,
        )?;

        info!(namespace = %ns.name, id = key.id, reusable, ephemeral, "Created pre-auth key");
        Ok(key)
    }

    pub fn list(&self, namespace: &str) -> Result<Vec<PreAuthKey>> {
        let ns = self
            .db
            .get_namespace_by_name(namespace)?
            .ok_or_else(|| Error::NamespaceNotFound(namespace.to_string()))?;
        self.db.list_pre_auth_keys(ns.id)
    }

    /// Make a key unusable from now on
    pub fn expire(&self, namespace: &str, key: &str) -> Result<PreAuthKey> {
        let mut pak = self
            .db
            .get_pre_auth_key(key)?
            .ok_or(Error::InvalidOrUsedKey(KeyRejection::Unknown))?;
        if pak.namespace.name != namespace {
            return Err(Error::InvalidOrUsedKey(KeyRejection::WrongNamespace));
        }

        let now = Utc::now();
        self.db.set_pre_auth_key_expiration(pak.id, now)?;
        pak.expiration = Some(now);

        info!(namespace, id = pak.id, "Expired pre-auth key");
        Ok(pak)
    }

    /// Return the key if it may register a machine right now.
    ///
    /// `expected_namespace` pins the key to one namespace when the caller
    /// already knows where the machine is going.
    pub fn validate(&self, key: &str, expected_namespace: Option<&str>) -> Result<PreAuthKey> {
        let pak = self.db.get_pre_auth_key(key)?;
        check(pak, expected_namespace, Utc::now()).map_err(|reason| {
            debug!(%reason, "Rejected pre-auth key");
            Error::InvalidOrUsedKey(reason)
        })
    }
}

fn check(
    pak: Option<PreAuthKey>,
    expected_namespace: Option<&str>,
    now: DateTime<Utc>,
) -> std::result::Result<PreAuthKey, KeyRejection> {
    let pak = pak.ok_or(KeyRejection::Unknown)?;
    if let Some(expected) = expected_namespace {
        if pak.namespace.name != expected {
            return Err(KeyRejection::WrongNamespace);
        }
    }
    if pak.is_expired(now) {
        return Err(KeyRejection::Expired);
    }
    if pak.used && !pak.reusable {
        return Err(KeyRejection::Used);
    }
    Ok(pak)
}
