//! Keys for sealing outgoing messages.

use std::collections::HashMap;

use zeroize::Zeroizing;

use chat_crypto::identity::DeviceKeyPair;
use chat_proto::ids::{ConversationId, DeviceId};
use chat_proto::keys::{DecryptionKeys, MemoryKeyRing};

/// Sender-side key source. Extends the receive-side ring with this device's
/// signing key and the generation new messages are sealed under.
pub trait SealingKeys: DecryptionKeys {
    fn device_key(&self) -> &DeviceKeyPair;

    /// Newest key generation for `conv`, if this device holds any.
    fn current_generation(&self, conv: &ConversationId) -> Option<u32>;

    /// Recipient devices that get a pairwise MAC on messages in `conv`.
    fn pairwise_recipients(&self, _conv: &ConversationId) -> Vec<(DeviceId, Zeroizing<[u8; 32]>)> {
        Vec::new()
    }
}

/// In-memory sealing keys for a single device.
pub struct LocalKeys {
    device_key: DeviceKeyPair,
    ring: MemoryKeyRing,
    generations: HashMap<ConversationId, u32>,
    pairwise_recipients: HashMap<ConversationId, Vec<(DeviceId, [u8; 32])>>,
}

impl LocalKeys {
    pub fn new(own_device: DeviceId, device_key: DeviceKeyPair) -> Self {
        Self {
            device_key,
            ring: MemoryKeyRing::new(own_device),
            generations: HashMap::new(),
            pairwise_recipients: HashMap::new(),
        }
    }

    /// Register a conversation key. The highest generation seen becomes the
    /// sealing generation.
    pub fn add_conversation_key(&mut self, conv: ConversationId, generation: u32, key: [u8; 32]) {
        let current = self.generations.entry(conv.clone()).or_insert(generation);
        *current = (*current).max(generation);
        self.ring.add_conversation_key(conv, generation, key);
    }

    pub fn add_ephemeral_seed(&mut self, conv: ConversationId, generation: u32, seed: [u8; 32]) {
        self.ring.add_ephemeral_seed(conv, generation, seed);
    }

    /// Key shared with `peer_device`, used to verify its MACs.
    pub fn add_pairwise_key(&mut self, peer_device: DeviceId, key: [u8; 32]) {
        self.ring.add_pairwise_key(peer_device, key);
    }

    /// Attach a MAC for `device` to everything sent in `conv`.
    pub fn add_pairwise_recipient(&mut self, conv: ConversationId, device: DeviceId, key: [u8; 32]) {
        self.pairwise_recipients.entry(conv).or_default().push((device, key));
    }
}

impl DecryptionKeys for LocalKeys {
    fn own_device(&self) -> &DeviceId {
        self.ring.own_device()
    }

    fn conversation_key(&self, conv: &ConversationId, generation: u32) -> Option<Zeroizing<[u8; 32]>> {
        self.ring.conversation_key(conv, generation)
    }

    fn ephemeral_seed(&self, conv: &ConversationId, generation: u32) -> Option<Zeroizing<[u8; 32]>> {
        self.ring.ephemeral_seed(conv, generation)
    }

    fn pairwise_key(&self, sender_device: &DeviceId) -> Option<Zeroizing<[u8; 32]>> {
        self.ring.pairwise_key(sender_device)
    }
}

impl SealingKeys for LocalKeys {
    fn device_key(&self) -> &DeviceKeyPair {
        &self.device_key
    }

    fn current_generation(&self, conv: &ConversationId) -> Option<u32> {
        self.generations.get(conv).copied()
    }

    fn pairwise_recipients(&self, conv: &ConversationId) -> Vec<(DeviceId, Zeroizing<[u8; 32]>)> {
        self.pairwise_recipients
            .get(conv)
            .map(|entries| {
                entries
                    .iter()
                    .map(|(device, key)| (device.clone(), Zeroizing::new(*key)))
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl Drop for LocalKeys {
    fn drop(&mut self) {
        use zeroize::Zeroize;
        for entries in self.pairwise_recipients.values_mut() {
            for (_, key) in entries.iter_mut() {
                key.zeroize();
            }
        }
    }
}
