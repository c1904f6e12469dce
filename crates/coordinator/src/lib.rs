//! Meshgate coordination core
//!
//! Machine registry, address allocation, namespaces with cross-namespace
//! sharing, pre-auth keys and the registration handshake, all as stateless
//! services over one SQLite handle.

pub mod allocator;
pub mod config;
pub mod coordinator;
pub mod handshake;
pub mod namespaces;
pub mod preauth;
pub mod registry;
pub mod store;

pub use allocator::{AddressAllocator, UsedAddresses};
pub use config::CoordinatorConfig;
pub use coordinator::Coordinator;
pub use handshake::{AuthInfo, HandshakeService, HostInfo, RegisterRequest, RegisterResponse};
pub use namespaces::NamespaceService;
pub use preauth::PreAuthKeyService;
pub use registry::{MachineRegistry, REGISTER_ATTEMPTS};
pub use store::{CoordinatorDb, Registration};
