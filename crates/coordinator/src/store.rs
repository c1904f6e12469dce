//! Coordinator database schema and operations
//!
//! Tables:
//! - namespaces: isolation domains
//! - pre_auth_keys: namespace-scoped registration credentials
//! - machines: pending and registered machines
//! - machine_addresses: one row per held address, `address` is UNIQUE
//! - shared_machines: cross-namespace visibility grants
//!
//! The UNIQUE constraint on `machine_addresses.address` is what keeps two
//! concurrent registrations from persisting the same address: the allocator
//! scan is not atomic with the write, so the loser's transaction fails and
//! surfaces as `Error::DuplicateAddress`.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use meshgate_common::{
    Database, DiscoPublic, Error, KeyRejection, MachineAddresses, MachinePublic, Machine, Namespace,
    NodePublic, PreAuthKey, RegisterMethod, Result,
};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info};

/// Coordinator database wrapper
#[derive(Clone)]
pub struct CoordinatorDb {
    db: Database,
}

/// Everything written when a pending machine becomes registered
#[derive(Debug, Clone)]
pub struct Registration {
    pub machine_id: i64,
    pub namespace_id: i64,
    pub addresses: MachineAddresses,
    pub method: RegisterMethod,
    pub auth_key_id: Option<i64>,
    /// Flip the key's `used` flag in the same transaction
    pub consume_key: bool,
}

const MACHINE_SELECT: &str = "SELECT m.id, m.machine_key, m.node_key, m.disco_key, m.name, m.registered, \
     m.register_method, m.auth_key_id, m.last_seen, m.created_at, \
     n.id, n.name, n.created_at, COALESCE(k.ephemeral, 0) \
     FROM machines m \
     LEFT JOIN namespaces n ON n.id = m.namespace_id \
     LEFT JOIN pre_auth_keys k ON k.id = m.auth_key_id";

const PRE_AUTH_KEY_SELECT: &str = "SELECT k.id, k.key, k.reusable, k.ephemeral, k.used, k.expiration, \
     k.acl_tags, k.created_at, n.id, n.name, n.created_at \
     FROM pre_auth_keys k JOIN namespaces n ON n.id = k.namespace_id";

impl CoordinatorDb {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Initialize coordinator schema
    pub fn init_schema(&self) -> Result<()> {
        let conn = self.db.connection();
        let conn = conn.lock();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS namespaces (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS pre_auth_keys (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                key TEXT NOT NULL UNIQUE,
                namespace_id INTEGER NOT NULL,
                reusable INTEGER NOT NULL DEFAULT 0,
                ephemeral INTEGER NOT NULL DEFAULT 0,
                used INTEGER NOT NULL DEFAULT 0,
                expiration INTEGER,
                acl_tags TEXT NOT NULL DEFAULT '[]',
                created_at INTEGER NOT NULL,
                FOREIGN KEY(namespace_id) REFERENCES namespaces(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_pre_auth_keys_namespace ON pre_auth_keys(namespace_id);

            CREATE TABLE IF NOT EXISTS machines (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                machine_key TEXT NOT NULL UNIQUE,
                node_key TEXT,
                disco_key TEXT,
                name TEXT NOT NULL,
                namespace_id INTEGER,
                registered INTEGER NOT NULL DEFAULT 0,
                register_method TEXT,
                auth_key_id INTEGER,
                last_seen INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                FOREIGN KEY(namespace_id) REFERENCES namespaces(id),
                FOREIGN KEY(auth_key_id) REFERENCES pre_auth_keys(id) ON DELETE SET NULL
            );
            CREATE INDEX IF NOT EXISTS idx_machines_namespace ON machines(namespace_id);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_machines_namespace_name
                ON machines(namespace_id, name) WHERE namespace_id IS NOT NULL;

            CREATE TABLE IF NOT EXISTS machine_addresses (
                machine_id INTEGER NOT NULL,
                position INTEGER NOT NULL,
                address TEXT NOT NULL UNIQUE,
                PRIMARY KEY(machine_id, position),
                FOREIGN KEY(machine_id) REFERENCES machines(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS shared_machines (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                machine_id INTEGER NOT NULL,
                namespace_id INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                UNIQUE(machine_id, namespace_id),
                FOREIGN KEY(machine_id) REFERENCES machines(id) ON DELETE CASCADE,
                FOREIGN KEY(namespace_id) REFERENCES namespaces(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_shared_machines_namespace ON shared_machines(namespace_id);
            "#,
        )?;

        info!("Coordinator database schema initialized");
        Ok(())
    }

    // ========================================================================
    // Namespace operations
    // ========================================================================

    pub fn create_namespace(&self, name: &str) -> Result<Namespace> {
        let now = Utc::now();
        let conn = self.db.connection();
        let conn = conn.lock();
        conn.execute(
            "INSERT INTO namespaces (name, created_at) VALUES (?1, ?2)",
            params![name, now.timestamp()],
        )
        .map_err(|e| unique_or(e, || duplicate_namespace(name)))?;

        Ok(Namespace {
            id: conn.last_insert_rowid(),
            name: name.to_string(),
            created_at: from_epoch(now.timestamp()),
        })
    }

    pub fn get_namespace_by_name(&self, name: &str) -> Result<Option<Namespace>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let namespace = conn
            .query_row(
                "SELECT id, name, created_at FROM namespaces WHERE name = ?1",
                params![name],
                |row| namespace_from_row(row, 0),
            )
            .optional()?;
        Ok(namespace)
    }

    pub fn list_namespaces(&self) -> Result<Vec<Namespace>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let mut stmt = conn.prepare("SELECT id, name, created_at FROM namespaces ORDER BY id")?;
        let rows = stmt.query_map([], |row| namespace_from_row(row, 0))?;

        let mut namespaces = Vec::new();
        for row in rows {
            namespaces.push(row?);
        }
        Ok(namespaces)
    }

    pub fn rename_namespace(&self, id: i64, new_name: &str) -> Result<()> {
        let conn = self.db.connection();
        let conn = conn.lock();
        conn.execute(
            "UPDATE namespaces SET name = ?1 WHERE id = ?2",
            params![new_name, id],
        )
        .map_err(|e| unique_or(e, || duplicate_namespace(new_name)))?;
        Ok(())
    }

    /// Delete an empty namespace together with its pre-auth keys.
    pub fn delete_namespace(&self, namespace: &Namespace) -> Result<()> {
        self.db.transaction(|tx| {
            let owned: i64 = tx.query_row(
                "SELECT COUNT(*) FROM machines WHERE namespace_id = ?1",
                params![namespace.id],
                |row| row.get(0),
            )?;
            if owned > 0 {
                return Err(Error::NamespaceNotEmpty(namespace.name.clone()));
            }
            tx.execute(
                "DELETE FROM pre_auth_keys WHERE namespace_id = ?1",
                params![namespace.id],
            )?;
            tx.execute("DELETE FROM namespaces WHERE id = ?1", params![namespace.id])?;
            Ok(())
        })
    }

    // ========================================================================
    // Pre-auth key operations
    // ========================================================================

    pub fn create_pre_auth_key(
        &self,
        namespace: &Namespace,
        key: &str,
        reusable: bool,
        ephemeral: bool,
        expiration: Option<DateTime<Utc>>,
        acl_tags: &[String],
    ) -> Result<PreAuthKey> {
        let now = Utc::now().timestamp();
        let conn = self.db.connection();
        let conn = conn.lock();
        conn.execute(
            "INSERT INTO pre_auth_keys (key, namespace_id, reusable, ephemeral, used, expiration, acl_tags, created_at) \
             VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6, ?7)",
            params![
                key,
                namespace.id,
                reusable,
                ephemeral,
                expiration.map(|e| e.timestamp()),
                serde_json::to_string(acl_tags)?,
                now,
            ],
        )?;

        Ok(PreAuthKey {
            id: conn.last_insert_rowid(),
            key: key.to_string(),
            namespace: namespace.clone(),
            reusable,
            ephemeral,
            used: false,
            expiration: expiration.map(|e| from_epoch(e.timestamp())),
            acl_tags: acl_tags.to_vec(),
            created_at: from_epoch(now),
        })
    }

    pub fn get_pre_auth_key(&self, key: &str) -> Result<Option<PreAuthKey>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let key = conn
            .query_row(
                &format!("{} WHERE k.key = ?1", PRE_AUTH_KEY_SELECT),
                params![key],
                pre_auth_key_from_row,
            )
            .optional()?;
        Ok(key)
    }

    pub fn list_pre_auth_keys(&self, namespace_id: i64) -> Result<Vec<PreAuthKey>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let mut stmt = conn.prepare(&format!(
            "{} WHERE k.namespace_id = ?1 ORDER BY k.id",
            PRE_AUTH_KEY_SELECT
        ))?;
        let rows = stmt.query_map(params![namespace_id], pre_auth_key_from_row)?;

        let mut keys = Vec::new();
        for row in rows {
            keys.push(row?);
        }
        Ok(keys)
    }

    pub fn set_pre_auth_key_expiration(&self, id: i64, expiration: DateTime<Utc>) -> Result<()> {
        let conn = self.db.connection();
        let conn = conn.lock();
        conn.execute(
            "UPDATE pre_auth_keys SET expiration = ?1 WHERE id = ?2",
            params![expiration.timestamp(), id],
        )?;
        Ok(())
    }

    // ========================================================================
    // Machine operations
    // ========================================================================

    /// Insert a pending machine, or return the existing row for the key.
    pub fn insert_pending_machine(&self, machine_key: &MachinePublic, name: &str) -> Result<Machine> {
        let now = Utc::now().timestamp();
        {
            let conn = self.db.connection();
            let conn = conn.lock();
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO machines (machine_key, name, registered, created_at, updated_at) \
                 VALUES (?1, ?2, 0, ?3, ?3)",
                params![machine_key.to_hex(), name, now],
            )?;
            if inserted > 0 {
                debug!(machine_key = %machine_key.short_string(), "Created pending machine");
            }
        }
        self.get_machine_by_key(machine_key)?
            .ok_or_else(|| Error::MachineNotFound(machine_key.to_string()))
    }

    pub fn get_machine_by_key(&self, machine_key: &MachinePublic) -> Result<Option<Machine>> {
        self.query_machine("m.machine_key = ?1", params![machine_key.to_hex()])
    }

    pub fn get_machine_by_id(&self, id: i64) -> Result<Option<Machine>> {
        self.query_machine("m.id = ?1", params![id])
    }

    pub fn get_machine_by_name(&self, namespace_id: i64, name: &str) -> Result<Option<Machine>> {
        self.query_machine("m.namespace_id = ?1 AND m.name = ?2", params![namespace_id, name])
    }

    /// Machines owned by a namespace
    pub fn list_machines_in_namespace(&self, namespace_id: i64) -> Result<Vec<Machine>> {
        self.query_machines(
            &format!("{} WHERE m.namespace_id = ?1 ORDER BY m.id", MACHINE_SELECT),
            params![namespace_id],
        )
    }

    /// Machines shared into a namespace, excluding the ones it owns
    pub fn list_shared_machines(&self, namespace_id: i64) -> Result<Vec<Machine>> {
        self.query_machines(
            &format!(
                "{} JOIN shared_machines s ON s.machine_id = m.id \
                 WHERE s.namespace_id = ?1 AND (m.namespace_id IS NULL OR m.namespace_id != ?1) \
                 ORDER BY m.id",
                MACHINE_SELECT
            ),
            params![namespace_id],
        )
    }

    pub fn update_machine_keys(
        &self,
        id: i64,
        node_key: Option<&NodePublic>,
        disco_key: Option<&DiscoPublic>,
    ) -> Result<()> {
        let conn = self.db.connection();
        let conn = conn.lock();
        conn.execute(
            "UPDATE machines SET node_key = COALESCE(?1, node_key), disco_key = COALESCE(?2, disco_key), \
             updated_at = ?3 WHERE id = ?4",
            params![
                node_key.map(NodePublic::to_hex),
                disco_key.map(DiscoPublic::to_hex),
                Utc::now().timestamp(),
                id
            ],
        )?;
        Ok(())
    }

    pub fn set_machine_name(&self, machine: &Machine, name: &str) -> Result<()> {
        let conn = self.db.connection();
        let conn = conn.lock();
        conn.execute(
            "UPDATE machines SET name = ?1, updated_at = ?2 WHERE id = ?3",
            params![name, Utc::now().timestamp(), machine.id],
        )
        .map_err(|e| {
            unique_or(e, || Error::DuplicateName {
                kind: "Machine",
                name: name.to_string(),
            })
        })?;
        Ok(())
    }

    pub fn touch_machine(&self, id: i64, seen: DateTime<Utc>) -> Result<()> {
        let conn = self.db.connection();
        let conn = conn.lock();
        conn.execute(
            "UPDATE machines SET last_seen = ?1 WHERE id = ?2",
            params![seen.timestamp(), id],
        )?;
        Ok(())
    }

    /// Remove a machine; its addresses and grants go with it.
    pub fn delete_machine(&self, id: i64) -> Result<bool> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let rows = conn.execute("DELETE FROM machines WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    /// Every address currently held by any machine
    pub fn used_addresses(&self) -> Result<Vec<IpAddr>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let mut stmt = conn.prepare("SELECT address FROM machine_addresses")?;
        let rows = stmt.query_map([], |row| parse_column(row, 0, |s: &str| s.parse::<IpAddr>()))?;

        let mut addresses = Vec::new();
        for row in rows {
            addresses.push(row?);
        }
        Ok(addresses)
    }

    /// Turn a pending machine into a registered one in a single transaction.
    ///
    /// Readers never see `registered = 1` without its addresses or the reverse.
    /// A name already taken in the target namespace gets the first eight hex
    /// digits of the machine key appended. A single-use key is claimed here,
    /// so of two registrations that validated it concurrently only one commits.
    pub fn commit_registration(&self, registration: &Registration) -> Result<()> {
        self.db.transaction(|tx| {
            let (name, machine_key): (String, String) = tx
                .query_row(
                    "SELECT name, machine_key FROM machines WHERE id = ?1",
                    params![registration.machine_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?
                .ok_or_else(|| Error::MachineNotFound(registration.machine_id.to_string()))?;

            let taken: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM machines WHERE namespace_id = ?1 AND name = ?2 AND id != ?3)",
                params![registration.namespace_id, name, registration.machine_id],
                |row| row.get(0),
            )?;
            let name = if taken {
                let renamed = format!("{}-{}", name, machine_key.get(..8).unwrap_or(machine_key.as_str()));
                debug!(from = %name, to = %renamed, "Machine name taken in namespace");
                renamed
            } else {
                name
            };

            let updated = tx
                .execute(
                    "UPDATE machines SET namespace_id = ?1, name = ?2, registered = 1, register_method = ?3, \
                     auth_key_id = ?4, updated_at = ?5 WHERE id = ?6 AND registered = 0",
                    params![
                        registration.namespace_id,
                        name,
                        registration.method.to_string(),
                        registration.auth_key_id,
                        Utc::now().timestamp(),
                        registration.machine_id,
                    ],
                )
                .map_err(|e| {
                    unique_or(e, || Error::DuplicateName {
                        kind: "Machine",
                        name: name.clone(),
                    })
                })?;
            if updated == 0 {
                return Err(Error::AlreadyRegistered(registration.machine_id.to_string()));
            }

            for (position, address) in registration.addresses.iter().enumerate() {
                tx.execute(
                    "INSERT INTO machine_addresses (machine_id, position, address) VALUES (?1, ?2, ?3)",
                    params![registration.machine_id, position as i64, address.to_string()],
                )
                .map_err(|e| unique_or(e, || Error::DuplicateAddress(*address)))?;
            }

            if let Some(key_id) = registration.auth_key_id {
                claim_pre_auth_key(tx, key_id, registration.consume_key)?;
            }
            Ok(())
        })
    }

    // ========================================================================
    // Sharing operations
    // ========================================================================

    pub fn insert_share(&self, machine: &Machine, namespace: &Namespace) -> Result<()> {
        let conn = self.db.connection();
        let conn = conn.lock();
        conn.execute(
            "INSERT INTO shared_machines (machine_id, namespace_id, created_at) VALUES (?1, ?2, ?3)",
            params![machine.id, namespace.id, Utc::now().timestamp()],
        )
        .map_err(|e| {
            unique_or(e, || Error::AlreadyShared {
                machine: machine.name.clone(),
                namespace: namespace.name.clone(),
            })
        })?;
        Ok(())
    }

    pub fn delete_share(&self, machine_id: i64, namespace_id: i64) -> Result<bool> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let rows = conn.execute(
            "DELETE FROM shared_machines WHERE machine_id = ?1 AND namespace_id = ?2",
            params![machine_id, namespace_id],
        )?;
        Ok(rows > 0)
    }

    // ========================================================================
    // Row helpers
    // ========================================================================

    fn query_machine(&self, filter: &str, params: impl rusqlite::Params) -> Result<Option<Machine>> {
        let mut machines = self.query_machines(&format!("{} WHERE {}", MACHINE_SELECT, filter), params)?;
        Ok(machines.pop())
    }

    fn query_machines(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<Machine>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, machine_from_row)?;

        let mut machines = Vec::new();
        for row in rows {
            let mut machine = row?;
            machine.ip_addresses = load_addresses(&conn, machine.id)?;
            machines.push(machine);
        }
        Ok(machines)
    }
}

fn load_addresses(conn: &Connection, machine_id: i64) -> Result<MachineAddresses> {
    let mut stmt = conn.prepare_cached(
        "SELECT address FROM machine_addresses WHERE machine_id = ?1 ORDER BY position",
    )?;
    let rows = stmt.query_map(params![machine_id], |row| {
        parse_column(row, 0, |s: &str| s.parse::<IpAddr>())
    })?;

    let mut addresses = Vec::new();
    for row in rows {
        addresses.push(row?);
    }
    Ok(MachineAddresses(addresses))
}

/// Re-check a pre-auth key inside the registration transaction, flipping
/// `used` when `consume` is set. Only an unused, unexpired key is claimed.
fn claim_pre_auth_key(conn: &Connection, key_id: i64, consume: bool) -> Result<()> {
    let now = Utc::now().timestamp();
    if consume {
        let claimed = conn.execute(
            "UPDATE pre_auth_keys SET used = 1 \
             WHERE id = ?1 AND used = 0 AND (expiration IS NULL OR expiration > ?2)",
            params![key_id, now],
        )?;
        if claimed == 1 {
            return Ok(());
        }
    }

    let state: Option<(bool, Option<i64>)> = conn
        .query_row(
            "SELECT used, expiration FROM pre_auth_keys WHERE id = ?1",
            params![key_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    match state {
        None => Err(Error::InvalidOrUsedKey(KeyRejection::Unknown)),
        Some((_, Some(expiration))) if expiration <= now => {
            Err(Error::InvalidOrUsedKey(KeyRejection::Expired))
        }
        Some((true, _)) if consume => Err(Error::InvalidOrUsedKey(KeyRejection::Used)),
        Some(_) => Ok(()),
    }
}

fn machine_from_row(row: &Row<'_>) -> rusqlite::Result<Machine> {
    let namespace = match row.get::<_, Option<i64>>(10)? {
        Some(_) => Some(namespace_from_row(row, 10)?),
        None => None,
    };
    let node_key: Option<String> = row.get(2)?;
    let disco_key: Option<String> = row.get(3)?;
    let register_method: Option<String> = row.get(6)?;

    Ok(Machine {
        id: row.get(0)?,
        machine_key: parse_column(row, 1, MachinePublic::parse)?,
        node_key: node_key
            .map(|k| NodePublic::parse(&k).map_err(|e| conversion_error(2, e)))
            .transpose()?,
        disco_key: disco_key
            .map(|k| DiscoPublic::parse(&k).map_err(|e| conversion_error(3, e)))
            .transpose()?,
        name: row.get(4)?,
        namespace,
        ip_addresses: MachineAddresses::default(),
        registered: row.get(5)?,
        register_method: register_method.and_then(|m| m.parse().ok()),
        auth_key_id: row.get(7)?,
        ephemeral: row.get(13)?,
        last_seen: row.get::<_, Option<i64>>(8)?.map(from_epoch),
        created_at: from_epoch(row.get(9)?),
    })
}

fn namespace_from_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<Namespace> {
    Ok(Namespace {
        id: row.get(offset)?,
        name: row.get(offset + 1)?,
        created_at: from_epoch(row.get(offset + 2)?),
    })
}

fn pre_auth_key_from_row(row: &Row<'_>) -> rusqlite::Result<PreAuthKey> {
    let tags: String = row.get(6)?;
    Ok(PreAuthKey {
        id: row.get(0)?,
        key: row.get(1)?,
        reusable: row.get(2)?,
        ephemeral: row.get(3)?,
        used: row.get(4)?,
        expiration: row.get::<_, Option<i64>>(5)?.map(from_epoch),
        acl_tags: serde_json::from_str(&tags).map_err(|e| conversion_error(6, e))?,
        created_at: from_epoch(row.get(7)?),
        namespace: namespace_from_row(row, 8)?,
    })
}

fn parse_column<T, E>(row: &Row<'_>, idx: usize, parse: impl FnOnce(&str) -> std::result::Result<T, E>) -> rusqlite::Result<T>
where
    E: std::error::Error + Send + Sync + 'static,
{
    let value: String = row.get(idx)?;
    parse(&value).map_err(|e| conversion_error(idx, e))
}

fn conversion_error<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn from_epoch(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

fn duplicate_namespace(name: &str) -> Error {
    Error::DuplicateName {
        kind: "Namespace",
        name: name.to_string(),
    }
}

/// Map a UNIQUE violation to a typed conflict; anything else stays a storage error.
fn unique_or(e: rusqlite::Error, conflict: impl FnOnce() -> Error) -> Error {
    match &e {
        rusqlite::Error::SqliteFailure(err, _)
            if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE =>
        {
            conflict()
        }
        _ => Error::Storage(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preauth::PreAuthKeyService;
    use meshgate_common::MachinePrivate;

    fn test_db() -> CoordinatorDb {
        let db = Database::open_memory().unwrap();
        let cdb = CoordinatorDb::new(db);
        cdb.init_schema().unwrap();
        cdb
    }

    fn pending(db: &CoordinatorDb, name: &str) -> Machine {
        db.insert_pending_machine(&MachinePrivate::generate().public(), name)
            .unwrap()
    }

    fn registration(machine: &Machine, ns: &Namespace, address: &str) -> Registration {
        Registration {
            machine_id: machine.id,
            namespace_id: ns.id,
            addresses: MachineAddresses(vec![address.parse().unwrap()]),
            method: RegisterMethod::Cli,
            auth_key_id: None,
            consume_key: false,
        }
    }

    #[test]
    fn test_namespace_crud() {
        let db = test_db();
        let ns = db.create_namespace("alpha").unwrap();
        assert_eq!(db.get_namespace_by_name("alpha").unwrap().unwrap().id, ns.id);

        let dup = db.create_namespace("alpha");
        assert!(matches!(dup, Err(Error::DuplicateName { kind: "Namespace", .. })));

        db.rename_namespace(ns.id, "beta").unwrap();
        assert!(db.get_namespace_by_name("alpha").unwrap().is_none());
        assert_eq!(db.list_namespaces().unwrap().len(), 1);
    }

    #[test]
    fn test_pending_machine_is_idempotent() {
        let db = test_db();
        let key = MachinePrivate::generate().public();

        let first = db.insert_pending_machine(&key, "laptop").unwrap();
        let second = db.insert_pending_machine(&key, "other").unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.name, "laptop");
        assert!(!second.registered);
        assert!(second.namespace.is_none());
        assert!(second.ip_addresses.is_empty());
    }

    #[test]
    fn test_commit_registration_rejects_taken_address() {
        let db = test_db();
        let ns = db.create_namespace("alpha").unwrap();
        let a = db.insert_pending_machine(&MachinePrivate::generate().public(), "a").unwrap();
        let b = db.insert_pending_machine(&MachinePrivate::generate().public(), "b").unwrap();
        let addresses = MachineAddresses(vec!["10.0.0.1".parse().unwrap()]);

        let registration = |machine_id| Registration {
            machine_id,
            namespace_id: ns.id,
            addresses: addresses.clone(),
            method: RegisterMethod::Cli,
            auth_key_id: None,
            consume_key: false,
        };

        db.commit_registration(&registration(a.id)).unwrap();
        let err = db.commit_registration(&registration(b.id)).unwrap_err();
        assert!(matches!(err, Error::DuplicateAddress(ip) if ip == addresses.0[0]));

        // The loser rolled back completely
        let b = db.get_machine_by_id(b.id).unwrap().unwrap();
        assert!(!b.registered);
        assert!(b.namespace.is_none());
        assert!(b.ip_addresses.is_empty());
    }

    #[test]
    fn test_delete_machine_releases_addresses() {
        let db = test_db();
        let ns = db.create_namespace("alpha").unwrap();
        let m = db.insert_pending_machine(&MachinePrivate::generate().public(), "a").unwrap();
        db.commit_registration(&Registration {
            machine_id: m.id,
            namespace_id: ns.id,
            addresses: MachineAddresses(vec!["10.0.0.1".parse().unwrap()]),
            method: RegisterMethod::Cli,
            auth_key_id: None,
            consume_key: false,
        })
        .unwrap();
        assert_eq!(db.used_addresses().unwrap().len(), 1);

        assert!(db.delete_machine(m.id).unwrap());
        assert!(db.used_addresses().unwrap().is_empty());
        assert!(!db.delete_machine(m.id).unwrap());
    }

    #[test]
    fn test_single_use_key_claimed_once() {
        let db = test_db();
        let ns = db.create_namespace("ops").unwrap();
        let pak = db
            .create_pre_auth_key(&ns, "0011223344556677", false, false, None, &[])
            .unwrap();
        let a = pending(&db, "a");
        let b = pending(&db, "b");

        // Both callers pass validation before either commits
        let keys = PreAuthKeyService::new(db.clone());
        let for_a = keys.validate(&pak.key, Some("ops")).unwrap();
        let for_b = keys.validate(&pak.key, Some("ops")).unwrap();

        let with_key = |machine: &Machine, key: &PreAuthKey, address: &str| Registration {
            method: RegisterMethod::AuthKey,
            auth_key_id: Some(key.id),
            consume_key: true,
            ..registration(machine, &ns, address)
        };

        db.commit_registration(&with_key(&a, &for_a, "10.0.0.1")).unwrap();
        let err = db
            .commit_registration(&with_key(&b, &for_b, "10.0.0.2"))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidOrUsedKey(KeyRejection::Used)));

        let b = db.get_machine_by_id(b.id).unwrap().unwrap();
        assert!(!b.registered);
        assert!(b.ip_addresses.is_empty());
        assert_eq!(db.used_addresses().unwrap(), vec!["10.0.0.1".parse::<IpAddr>().unwrap()]);
        assert!(db.get_pre_auth_key(&pak.key).unwrap().unwrap().used);
    }

    #[test]
    fn test_key_expired_before_commit_is_rejected() {
        let db = test_db();
        let ns = db.create_namespace("ops").unwrap();
        let pak = db
            .create_pre_auth_key(&ns, "8899aabbccddeeff", true, false, None, &[])
            .unwrap();
        let m = pending(&db, "a");
        db.set_pre_auth_key_expiration(pak.id, Utc::now() - chrono::Duration::minutes(1))
            .unwrap();

        let err = db
            .commit_registration(&Registration {
                method: RegisterMethod::AuthKey,
                auth_key_id: Some(pak.id),
                ..registration(&m, &ns, "10.0.0.1")
            })
            .unwrap_err();
        assert!(matches!(err, Error::InvalidOrUsedKey(KeyRejection::Expired)));
        assert!(db.used_addresses().unwrap().is_empty());
    }

    #[test]
    fn test_commit_for_deleted_machine_is_not_found() {
        let db = test_db();
        let ns = db.create_namespace("alpha").unwrap();
        let m = pending(&db, "a");
        assert!(db.delete_machine(m.id).unwrap());

        let err = db
            .commit_registration(&registration(&m, &ns, "10.0.0.1"))
            .unwrap_err();
        assert!(matches!(err, Error::MachineNotFound(_)));
    }

    #[test]
    fn test_commit_twice_is_already_registered() {
        let db = test_db();
        let ns = db.create_namespace("alpha").unwrap();
        let m = pending(&db, "a");
        db.commit_registration(&registration(&m, &ns, "10.0.0.1")).unwrap();

        let err = db
            .commit_registration(&registration(&m, &ns, "10.0.0.2"))
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyRegistered(_)));
        assert_eq!(db.used_addresses().unwrap().len(), 1);
    }

    #[test]
    fn test_taken_name_gets_key_suffix() {
        let db = test_db();
        let ns = db.create_namespace("alpha").unwrap();
        let first = pending(&db, "laptop");
        let second = pending(&db, "laptop");
        db.commit_registration(&registration(&first, &ns, "10.0.0.1")).unwrap();
        db.commit_registration(&registration(&second, &ns, "10.0.0.2")).unwrap();

        let first = db.get_machine_by_id(first.id).unwrap().unwrap();
        let second = db.get_machine_by_id(second.id).unwrap().unwrap();
        assert_eq!(first.name, "laptop");
        assert_eq!(
            second.name,
            format!("laptop-{}", &second.machine_key.to_hex()[..8])
        );
    }

    #[test]
    fn test_share_of_deleted_machine_is_not_a_conflict() {
        let db = test_db();
        let owner = db.create_namespace("alpha").unwrap();
        let other = db.create_namespace("beta").unwrap();
        let m = pending(&db, "a");
        db.commit_registration(&registration(&m, &owner, "10.0.0.1")).unwrap();
        db.insert_share(&m, &other).unwrap();
        assert!(matches!(db.insert_share(&m, &other), Err(Error::AlreadyShared { .. })));

        db.delete_machine(m.id).unwrap();
        assert!(matches!(db.insert_share(&m, &other), Err(Error::Storage(_))));
    }
}
