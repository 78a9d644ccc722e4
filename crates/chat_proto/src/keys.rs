//! Key collaborators consumed by the envelope codec.
//!
//! Key distribution is external. The codec only asks two questions:
//! "which verify key does (user, device, generation) have, and when was it
//! revoked" and "which symmetric keys does this device hold".

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use thiserror::Error;
use zeroize::Zeroizing;

use crate::ids::{ConversationId, DeviceId, UserId};

/// Directory entry for one sender device at one key generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderKeyInfo {
    pub verify_key: Vec<u8>,
    pub revoked_at: Option<DateTime<Utc>>,
}

/// The directory could not answer right now. Unboxing reports this as a
/// recoverable error.
#[derive(Debug, Error)]
#[error("key directory unavailable: {0}")]
pub struct KeyLookupError(pub String);

pub trait KeyDirectory: Send + Sync {
    /// `Ok(None)` means the directory has no such key.
    fn lookup(
        &self,
        user: &UserId,
        device: &DeviceId,
        generation: u32,
    ) -> Result<Option<SenderKeyInfo>, KeyLookupError>;
}

/// Symmetric keys held by the receiving device.
pub trait DecryptionKeys: Send + Sync {
    fn own_device(&self) -> &DeviceId;
    fn conversation_key(&self, conv: &ConversationId, generation: u32) -> Option<Zeroizing<[u8; 32]>>;
    fn ephemeral_seed(&self, conv: &ConversationId, generation: u32) -> Option<Zeroizing<[u8; 32]>>;
    /// Key shared between this device and `sender_device`.
    fn pairwise_key(&self, sender_device: &DeviceId) -> Option<Zeroizing<[u8; 32]>>;
}

#[derive(Debug, Default)]
pub struct MemoryKeyDirectory {
    keys: HashMap<(UserId, DeviceId, u32), SenderKeyInfo>,
    offline: bool,
}

impl MemoryKeyDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, user: UserId, device: DeviceId, generation: u32, verify_key: Vec<u8>) {
        self.keys
            .insert((user, device, generation), SenderKeyInfo { verify_key, revoked_at: None });
    }

    /// Mark every generation of `device` revoked at `at`.
    pub fn revoke(&mut self, user: &UserId, device: &DeviceId, at: DateTime<Utc>) {
        for ((u, d, _), info) in self.keys.iter_mut() {
            if u == user && d == device {
                info.revoked_at = Some(at);
            }
        }
    }

    /// Make every lookup fail as if the directory were unreachable.
    pub fn set_offline(&mut self, offline: bool) {
        self.offline = offline;
    }
}

impl KeyDirectory for MemoryKeyDirectory {
    fn lookup(
        &self,
        user: &UserId,
        device: &DeviceId,
        generation: u32,
    ) -> Result<Option<SenderKeyInfo>, KeyLookupError> {
        if self.offline {
            return Err(KeyLookupError("directory offline".into()));
        }
        Ok(self.keys.get(&(user.clone(), device.clone(), generation)).cloned())
    }
}

#[derive(Clone, Default)]
pub struct MemoryKeyRing {
    own_device: DeviceId,
    conv_keys: HashMap<(ConversationId, u32), [u8; 32]>,
    ephemeral_seeds: HashMap<(ConversationId, u32), [u8; 32]>,
    pairwise: HashMap<DeviceId, [u8; 32]>,
}

impl std::fmt::Debug for MemoryKeyRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryKeyRing")
            .field("own_device", &self.own_device)
            .field("conv_keys", &self.conv_keys.len())
            .field("ephemeral_seeds", &self.ephemeral_seeds.len())
            .field("pairwise", &self.pairwise.len())
            .finish()
    }
}

impl MemoryKeyRing {
    pub fn new(own_device: DeviceId) -> Self {
        Self {
            own_device,
            conv_keys: HashMap::new(),
            ephemeral_seeds: HashMap::new(),
            pairwise: HashMap::new(),
        }
    }

    pub fn add_conversation_key(&mut self, conv: ConversationId, generation: u32, key: [u8; 32]) {
        self.conv_keys.insert((conv, generation), key);
    }

    pub fn add_ephemeral_seed(&mut self, conv: ConversationId, generation: u32, seed: [u8; 32]) {
        self.ephemeral_seeds.insert((conv, generation), seed);
    }

    pub fn add_pairwise_key(&mut self, peer_device: DeviceId, key: [u8; 32]) {
        self.pairwise.insert(peer_device, key);
    }
}

impl DecryptionKeys for MemoryKeyRing {
    fn own_device(&self) -> &DeviceId {
        &self.own_device
    }

    fn conversation_key(&self, conv: &ConversationId, generation: u32) -> Option<Zeroizing<[u8; 32]>> {
        self.conv_keys.get(&(conv.clone(), generation)).map(|k| Zeroizing::new(*k))
    }

    fn ephemeral_seed(&self, conv: &ConversationId, generation: u32) -> Option<Zeroizing<[u8; 32]>> {
        self.ephemeral_seeds.get(&(conv.clone(), generation)).map(|k| Zeroizing::new(*k))
    }

    fn pairwise_key(&self, sender_device: &DeviceId) -> Option<Zeroizing<[u8; 32]>> {
        self.pairwise.get(sender_device).map(|k| Zeroizing::new(*k))
    }
}

impl Drop for MemoryKeyRing {
    fn drop(&mut self) {
        use zeroize::Zeroize;
        for key in self
            .conv_keys
            .values_mut()
            .chain(self.ephemeral_seeds.values_mut())
            .chain(self.pairwise.values_mut())
        {
            key.zeroize();
        }
    }
}
