//! Key codec
//!
//! Keys travel as lowercase hex with a protocol-fixed prefix per key kind.
//! The prefixes are part of the control protocol and cannot be changed.
//! Each kind gets its own type so a node key can never be handed to a
//! function expecting a machine key.

use std::fmt;
use std::str::FromStr;

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::{Error, Result};

/// Length of every key in bytes
pub const KEY_LEN: usize = 32;

/// The four key kinds known to the control protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyKind {
    Node,
    Machine,
    Disco,
    Private,
}

impl KeyKind {
    pub const fn prefix(self) -> &'static str {
        match self {
            Self::Node => "nodekey:",
            Self::Machine => "mkey:",
            Self::Disco => "discokey:",
            Self::Private => "privkey:",
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Node => "node key",
            Self::Machine => "machine key",
            Self::Disco => "disco key",
            Self::Private => "private key",
        }
    }
}

/// Return `s` with the prefix for `kind`, adding it only when missing.
pub fn ensure_prefix(kind: KeyKind, s: &str) -> String {
    if s.starts_with(kind.prefix()) {
        s.to_string()
    } else {
        format!("{}{}", kind.prefix(), s)
    }
}

/// Return `s` without the prefix for `kind`, if it carries one.
pub fn strip_prefix(kind: KeyKind, s: &str) -> &str {
    s.strip_prefix(kind.prefix()).unwrap_or(s)
}

fn decode_key(kind: KeyKind, s: &str) -> Result<[u8; KEY_LEN]> {
    let bare = strip_prefix(kind, s.trim());
    let bytes = hex::decode(bare).map_err(|e| Error::MalformedKey {
        kind: kind.name(),
        reason: e.to_string(),
    })?;
    bytes.try_into().map_err(|bytes: Vec<u8>| Error::MalformedKey {
        kind: kind.name(),
        reason: format!("expected {} bytes, got {}", KEY_LEN, bytes.len()),
    })
}

macro_rules! public_key {
    ($(#[$meta:meta])* $name:ident, $kind:expr) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name([u8; KEY_LEN]);

        impl $name {
            pub const KIND: KeyKind = $kind;

            pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
                Self(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
                &self.0
            }

            /// Parse the prefixed or bare hex form of this kind.
            pub fn parse(s: &str) -> Result<Self> {
                decode_key(Self::KIND, s).map(Self)
            }

            /// Hex without the protocol prefix, as stored in the database
            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            /// Abbreviated form for tables and log lines
            pub fn short_string(&self) -> String {
                format!("[{}]", &self.to_hex()[..8])
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}{}", Self::KIND.prefix(), self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self)
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                Self::parse(s)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                Self::parse(&s).map_err(serde::de::Error::custom)
            }
        }
    };
}

public_key!(
    /// Long-term public key identifying a machine
    MachinePublic,
    KeyKind::Machine
);

public_key!(
    /// Session public key of a machine; rotates on re-handshake
    NodePublic,
    KeyKind::Node
);

public_key!(
    /// Peer-to-peer discovery public key
    DiscoPublic,
    KeyKind::Disco
);

/// Long-term private key of a machine or of the coordinator itself
#[derive(Clone)]
pub struct MachinePrivate {
    secret: StaticSecret,
}

impl MachinePrivate {
    pub const KIND: KeyKind = KeyKind::Private;

    /// Generate a new random private key
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self {
            secret: StaticSecret::from(bytes),
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        let bytes = decode_key(Self::KIND, s)?;
        Ok(Self {
            secret: StaticSecret::from(bytes),
        })
    }

    pub fn public(&self) -> MachinePublic {
        MachinePublic::from_bytes(PublicKey::from(&self.secret).to_bytes())
    }

    /// Serialized `privkey:` form. Deliberately not `Display`.
    pub fn to_prefixed_hex(&self) -> String {
        ensure_prefix(Self::KIND, &hex::encode(self.secret.to_bytes()))
    }

    pub(crate) fn secret(&self) -> &StaticSecret {
        &self.secret
    }
}

impl fmt::Debug for MachinePrivate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MachinePrivate")
            .field("public_key", &self.public())
            .finish()
    }
}
