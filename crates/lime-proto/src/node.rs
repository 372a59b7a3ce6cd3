//! Node addressing: `name@domain/instance`.
//!
//! An [`Identity`] is the `name@domain` pair that authentication operates
//! on; a [`Node`] adds the optional instance that distinguishes concurrent
//! connections of the same identity. Both serialize as plain strings on
//! the wire.

use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::EnvelopeError;

/// Instance substituted when a node address omits one.
pub const DEFAULT_INSTANCE: &str = "default";

/// A `name@domain` identity.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Identity {
    /// Account name, the part before `@`.
    pub name: String,
    /// Domain the account belongs to.
    pub domain: String,
}

impl Identity {
    /// Create an identity from name and domain parts.
    pub fn new(name: impl Into<String>, domain: impl Into<String>) -> Self {
        Self { name: name.into(), domain: domain.into() }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.domain)
    }
}

impl FromStr for Identity {
    type Err = EnvelopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('@') {
            Some((name, domain)) if !name.is_empty() && !domain.is_empty() => {
                Ok(Self::new(name, domain))
            },
            _ => Err(EnvelopeError::InvalidIdentity(s.to_string())),
        }
    }
}

/// A routable node address: an identity plus an optional instance.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Node {
    /// The `name@domain` identity part.
    pub identity: Identity,
    /// Connection instance; `None` means unspecified.
    pub instance: Option<String>,
}

impl Node {
    /// Create a node with an explicit instance.
    pub fn new(identity: Identity, instance: impl Into<String>) -> Self {
        Self { identity, instance: Some(instance.into()) }
    }

    /// Create a node without an instance.
    pub fn from_identity(identity: Identity) -> Self {
        Self { identity, instance: None }
    }

    /// Return a copy with [`DEFAULT_INSTANCE`] substituted when the
    /// instance is absent or empty.
    ///
    /// Registries key on resolved addresses so `a@b` and `a@b/default`
    /// name the same entry.
    pub fn resolve_instance(&self) -> Self {
        let instance = match self.instance.as_deref() {
            Some(i) if !i.is_empty() => i.to_string(),
            _ => DEFAULT_INSTANCE.to_string(),
        };
        Self { identity: self.identity.clone(), instance: Some(instance) }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.instance {
            Some(instance) => write!(f, "{}/{}", self.identity, instance),
            None => self.identity.fmt(f),
        }
    }
}

impl FromStr for Node {
    type Err = EnvelopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (identity, instance) = match s.split_once('/') {
            Some((identity, instance)) if !instance.is_empty() => {
                (identity, Some(instance.to_string()))
            },
            Some(_) => return Err(EnvelopeError::InvalidNode(s.to_string())),
            None => (s, None),
        };
        let identity =
            identity.parse().map_err(|_| EnvelopeError::InvalidNode(s.to_string()))?;
        Ok(Self { identity, instance })
    }
}

impl From<Identity> for Node {
    fn from(identity: Identity) -> Self {
        Self::from_identity(identity)
    }
}

impl Serialize for Node {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Node {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

impl Serialize for Identity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Identity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

/// Trust level assigned to an authenticated identity's domain.
///
/// Produced by authentication (including transport-level authentication)
/// and consumed by the server handshake: only `Member` or better may
/// establish a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DomainRole {
    /// Identity is not trusted in the domain.
    Unknown,
    /// Identity is a member of the domain.
    Member,
    /// Identity is an authority for the domain.
    Authority,
    /// Identity is an authority for the domain and its subdomains.
    RootAuthority,
}
