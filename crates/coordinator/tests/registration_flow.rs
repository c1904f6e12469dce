use meshgate_common::{Database, Error, KeyRejection, MachinePrivate, MachinePublic};
use meshgate_coordinator::{Coordinator, CoordinatorConfig};

fn coordinator(prefixes: &[&str]) -> Coordinator {
    let config = CoordinatorConfig {
        ip_prefixes: prefixes.iter().map(|p| p.parse().unwrap()).collect(),
        ..Default::default()
    };
    Coordinator::new(
        Database::open_memory().expect("open database"),
        &config,
        MachinePrivate::generate(),
    )
    .expect("build coordinator")
}

fn pending(c: &Coordinator) -> MachinePublic {
    let key = MachinePrivate::generate().public();
    c.registry()
        .lookup_or_create_pending(&key)
        .expect("create pending machine");
    key
}

/// Sharing Scenario
///
/// A machine owned by A and shared into B shows up as shared in B, never as
/// owned, and disappears from B when the share is removed.
#[test]
fn shared_machine_is_visible_without_changing_owner() {
    let c = coordinator(&["100.64.0.0/10", "fd7a:115c:a1e0::/48"]);
    c.create_namespace("A").expect("create A");
    c.create_namespace("B").expect("create B");

    let key = pending(&c);
    let m = c.register_machine(&key.to_string(), "A").expect("register");
    assert_eq!(m.ip_addresses.len(), 2, "one address per prefix");
    assert_eq!(m.ip_addresses.to_string(), "100.64.0.1, fd7a:115c:a1e0::1");

    c.add_shared_machine_to_namespace(m.id, "B").expect("share");

    let shared = c.list_shared_machines_in_namespace("B").expect("list shared");
    assert_eq!(shared.len(), 1);
    assert_eq!(shared[0].id, m.id);
    assert_eq!(shared[0].namespace_name(), "A", "ownership is unchanged");
    assert!(c.list_machines_in_namespace("B").expect("list owned").is_empty());
    assert!(c.list_shared_machines_in_namespace("A").expect("list shared").is_empty());
    assert_eq!(c.namespaces().visible_machines("B").expect("visible").len(), 1);

    assert!(matches!(
        c.add_shared_machine_to_namespace(m.id, "A"),
        Err(Error::SelfShare { .. })
    ));
    assert!(matches!(
        c.add_shared_machine_to_namespace(m.id, "B"),
        Err(Error::AlreadyShared { .. })
    ));

    c.remove_shared_machine_from_namespace(m.id, "B").expect("unshare");
    assert!(c.list_shared_machines_in_namespace("B").expect("list shared").is_empty());
    assert!(matches!(
        c.remove_shared_machine_from_namespace(m.id, "B"),
        Err(Error::GrantNotFound { .. })
    ));
}

/// Single-use Pre-auth Key
///
/// The first machine consumes the key; the second is rejected and stays pending.
#[test]
fn single_use_key_registers_one_machine() {
    let c = coordinator(&["10.27.0.0/23"]);
    c.create_namespace("ops").expect("create namespace");
    let pak = c
        .create_pre_auth_key("ops", false, false, None, &[])
        .expect("create key");

    let first = pending(&c);
    let second = pending(&c);

    let m = c
        .registry()
        .register_with_pre_auth_key(&first, &pak.key, Some("ops"))
        .expect("first registration");
    assert_eq!(m.namespace_name(), "ops");

    let err = c
        .registry()
        .register_with_pre_auth_key(&second, &pak.key, Some("ops"))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidOrUsedKey(KeyRejection::Used)));

    let keys = c.list_pre_auth_keys("ops").expect("list keys");
    assert!(keys[0].used);
    assert!(!c.registry().get_by_machine_key(&second).expect("lookup").registered);
}

/// Address Release
///
/// Deleting a registered machine frees its address for the next registration.
#[test]
fn deleted_machine_address_is_reused() {
    let c = coordinator(&["10.27.0.0/23"]);
    c.create_namespace("ops").expect("create namespace");

    let keys: Vec<_> = (0..3).map(|_| pending(&c)).collect();
    let machines: Vec<_> = keys
        .iter()
        .map(|k| c.register_machine(&k.to_string(), "ops").expect("register"))
        .collect();
    assert_eq!(machines[1].ip_addresses.to_string(), "10.27.0.2");

    c.delete_machine(machines[1].id).expect("delete");

    let next = pending(&c);
    let m = c.register_machine(&next.to_string(), "ops").expect("register");
    assert_eq!(m.ip_addresses.to_string(), "10.27.0.2");
}

/// Namespace Lifecycle
///
/// A namespace that still owns machines cannot be destroyed.
#[test]
fn namespace_with_machines_cannot_be_destroyed() {
    let c = coordinator(&["10.27.0.0/23"]);
    c.create_namespace("ops").expect("create namespace");
    c.create_pre_auth_key("ops", true, false, None, &[])
        .expect("create key");
    let key = pending(&c);
    let m = c.register_machine(&key.to_string(), "ops").expect("register");

    assert!(matches!(c.destroy_namespace("ops"), Err(Error::NamespaceNotEmpty(_))));

    c.delete_machine(m.id).expect("delete");
    c.destroy_namespace("ops").expect("destroy");
    assert!(matches!(c.get_namespace("ops"), Err(Error::NamespaceNotFound(_))));
}
