//! Identifiers.
//!
//! Every identifier is an opaque byte string, displayed and serialised as
//! lowercase hex. Message IDs are the exception: they are server-assigned
//! unsigned integers, strictly increasing within a conversation but not
//! necessarily contiguous.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ProtoError;

macro_rules! byte_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        pub struct $name(Vec<u8>);

        impl $name {
            pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
                Self(bytes.into())
            }

            pub fn from_hex(s: &str) -> Result<Self, ProtoError> {
                Ok(Self(hex::decode(s).map_err(|e| ProtoError::InvalidId(e.to_string()))?))
            }

            pub fn as_bytes(&self) -> &[u8] {
                &self.0
            }

            pub fn to_hex(&self) -> String {
                hex::encode(&self.0)
            }

            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.to_hex())
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
                s.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
                let s = String::deserialize(d)?;
                hex::decode(&s).map(Self).map_err(serde::de::Error::custom)
            }
        }
    };
}

byte_id!(
    /// Server-side conversation identifier (derived from the conversation triple).
    ConversationId
);
byte_id!(
    /// Root identifier of a conversation (the folder/team the topic lives in).
    TlfId
);
byte_id!(
    /// Identifier of a topic within a root.
    TopicId
);
byte_id!(UserId);
byte_id!(DeviceId);
byte_id!(
    /// Locally generated identifier linking an outbox record to the boxed
    /// message the server eventually confirms.
    OutboxId
);

impl OutboxId {
    pub const LEN: usize = 8;

    /// Fresh random outbox ID.
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; Self::LEN];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes.to_vec())
    }

    /// Deterministic outbox ID from seed material, so a re-issued send of the
    /// same logical message reuses its ID.
    pub fn derive(seed: &[u8]) -> Self {
        Self(chat_crypto::hash::derive_short_id(seed).to_vec())
    }
}

/// Server-assigned message sequence number. `0` means "no message".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub u64);

impl MessageId {
    pub const NONE: MessageId = MessageId(0);

    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// `#[serde(with = "hex_bytes")]` for raw byte fields (hashes, ciphertexts).
pub mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_display_as_lowercase_hex() {
        let id = ConversationId::new(vec![0xAB, 0x01]);
        assert_eq!(id.to_string(), "ab01");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"ab01\"");
        let back: ConversationId = serde_json::from_str("\"ab01\"").unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn outbox_ids_are_eight_bytes() {
        assert_eq!(OutboxId::generate().as_bytes().len(), OutboxId::LEN);
        assert_eq!(OutboxId::derive(b"seed"), OutboxId::derive(b"seed"));
        assert_ne!(OutboxId::generate(), OutboxId::generate());
    }
}
