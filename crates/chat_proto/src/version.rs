//! Forward-compatible version gating.
//!
//! Every versioned container (the envelope itself, the sealed header, the
//! encrypted body) carries a small metadata block next to its version number.
//! A client decodes the versions it knows structurally and folds every other
//! version into an `Unsupported { version, meta }` case. Consumers must handle
//! that case explicitly: when `meta.critical` is set the message is never
//! rendered.

use std::fmt;

use serde::{Deserialize, Serialize, Serializer};

/// Highest envelope (boxed message) version this client can open.
pub const MAX_ENVELOPE_VERSION: u32 = 1;
/// Highest header plaintext version this client can parse.
pub const MAX_HEADER_VERSION: u32 = 1;
/// Highest body plaintext version this client can parse.
pub const MAX_BODY_VERSION: u32 = 1;

/// The only thing a client is guaranteed to understand about a version it
/// cannot parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MetaInfo {
    #[serde(rename = "crit", default)]
    pub critical: bool,
}

impl MetaInfo {
    pub const CRITICAL: MetaInfo = MetaInfo { critical: true };
}

/// Which container a version error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionKind {
    Envelope,
    Header,
    Body,
}

impl VersionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            VersionKind::Envelope => "envelope",
            VersionKind::Header => "header",
            VersionKind::Body => "body",
        }
    }

    pub fn max_supported(&self) -> u32 {
        match self {
            VersionKind::Envelope => MAX_ENVELOPE_VERSION,
            VersionKind::Header => MAX_HEADER_VERSION,
            VersionKind::Body => MAX_BODY_VERSION,
        }
    }
}

impl fmt::Display for VersionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// On-wire shape of a versioned container: `{ "v": N, "mi": {...}, "data": ... }`.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct VersionedWire {
    pub v: u32,
    #[serde(default)]
    pub mi: MetaInfo,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[derive(Serialize)]
struct VersionedRef<'a, T: Serialize> {
    v: u32,
    mi: MetaInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<&'a T>,
}

pub(crate) fn serialize_versioned<S: Serializer, T: Serialize>(
    s: S,
    version: u32,
    meta: MetaInfo,
    data: Option<&T>,
) -> Result<S::Ok, S::Error> {
    VersionedRef { v: version, mi: meta, data }.serialize(s)
}
