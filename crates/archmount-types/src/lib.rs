//! Shared identifiers and wire types for archmount.
//!
//! This crate is the leaf of the workspace: typed ids, archive entry
//! metadata, and the codec-engine message protocol. It has **no internal
//! archmount dependencies**.
//!
//! # Key Types
//!
//! |-------------------|----------------------------------------------|
//! | Type              | Purpose                                      |
//! |-------------------|----------------------------------------------|
//! | [`VolumeId`]      | Which mounted archive (host fileSystemId)    |
//! | [`CompressorId`]  | Which pack job                               |
//! | [`RequestId`]     | Engine request, unique per entity            |
//! | [`CorrelationKey`]| `(entity, request)` reply matching key       |
//! | [`EngineRequest`] | Orchestrator → engine (unpack / pack family) |
//! | [`EngineMessage`] | Engine → orchestrator (unpack / pack family) |
//! | [`EntryMetadata`] | One file or directory inside an archive      |
//! |-------------------|----------------------------------------------|

pub mod entry;
pub mod ids;
pub mod message;

pub use entry::{EngineSession, EntryMetadata, OpenMode};
pub use ids::{CompressorId, CorrelationKey, EntityId, OpenRequestId, RequestId, VolumeId};
pub use message::{EngineMessage, EngineRequest, PackEvent, PackOp, UnpackEvent, UnpackOp};
