//! Typed identifiers for volumes, compressors, and engine requests.
//!
//! `VolumeId` is an opaque string that stays stable for the whole mounted
//! lifetime of an archive, including across process restarts. It is derived
//! deterministically (UUIDv5) from the durable token of the archive's source
//! handle, so mounting the same archive twice yields the same id and is
//! detected as a duplicate.
//!
//! The numeric ids are only unique *within their owner*: request ids are
//! allocated per volume or per compressor, open-request ids come from the
//! host. Never use one of them as a global lookup key on its own.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Namespace for deriving volume ids from source tokens.
const VOLUME_NAMESPACE: uuid::Uuid = uuid::Uuid::from_bytes([
    0x6a, 0x1e, 0x3c, 0x52, 0x9b, 0x0d, 0x4f, 0x61, 0x8e, 0x27, 0xd4, 0x90, 0x0b, 0x7a, 0x15, 0xc3,
]);

/// Identifier of one mounted archive (the host's `fileSystemId`).
#[derive(Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VolumeId(String);

impl VolumeId {
    /// Wrap an id received from the host or read back from storage.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive the id for an archive from its durable source token.
    pub fn for_source(token: &str) -> Self {
        Self(uuid::Uuid::new_v5(&VOLUME_NAMESPACE, token.as_bytes()).to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 8 characters, for human display only.
    pub fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(8)
            .map(|(i, _)| i)
            .unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VolumeId({})", self.short())
    }
}

impl From<&str> for VolumeId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for VolumeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identifier of one pack job (allocated by the compressor registry).
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CompressorId(u64);

/// Correlation id of one engine request, unique per volume or compressor.
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(u64);

/// Host-assigned id of an `openFile` request; later reads and the close
/// refer back to it.
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OpenRequestId(u64);

// ── Shared behavior ─────────────────────────────────────────────────────────

macro_rules! impl_numeric_id {
    ($T:ident, $name:literal) => {
        impl $T {
            pub const fn new(raw: u64) -> Self {
                Self(raw)
            }

            pub const fn get(self) -> u64 {
                self.0
            }

            /// The id following this one.
            pub const fn next(self) -> Self {
                Self(self.0.wrapping_add(1))
            }
        }

        impl From<u64> for $T {
            fn from(raw: u64) -> Self {
                Self(raw)
            }
        }

        impl fmt::Display for $T {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl fmt::Debug for $T {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", $name, self.0)
            }
        }
    };
}

impl_numeric_id!(CompressorId, "CompressorId");
impl_numeric_id!(RequestId, "RequestId");
impl_numeric_id!(OpenRequestId, "OpenRequestId");

/// The owner a correlation key belongs to.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum EntityId {
    Volume(VolumeId),
    Compressor(CompressorId),
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityId::Volume(id) => write!(f, "volume:{}", id.short()),
            EntityId::Compressor(id) => write!(f, "compressor:{id}"),
        }
    }
}

/// `(entityId, requestId)`: the only way an engine reply is matched to the
/// request that caused it.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct CorrelationKey {
    pub entity: EntityId,
    pub request: RequestId,
}

impl CorrelationKey {
    pub fn volume(id: VolumeId, request: RequestId) -> Self {
        Self {
            entity: EntityId::Volume(id),
            request,
        }
    }

    pub fn compressor(id: CompressorId, request: RequestId) -> Self {
        Self {
            entity: EntityId::Compressor(id),
            request,
        }
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.entity, self.request)
    }
}
