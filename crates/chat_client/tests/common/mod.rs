#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use tempfile::TempDir;

use chat_client::{
    ChatTransport, DeliveryConfig, Deliverer, FullInbox, LocalKeys, SealingKeys, ThreadLoader,
    TransportError,
};
use chat_crypto::identity::DeviceKeyPair;
use chat_proto::header::{ClientHeader, ConversationTriple, MessageType, TopicType};
use chat_proto::ids::{ConversationId, DeviceId, MessageId, TlfId, TopicId, UserId};
use chat_proto::keys::MemoryKeyDirectory;
use chat_proto::message::{MessageBody, MessagePlaintext};
use chat_proto::sync::{Conversation, ConversationStatus, InboxVersion, SyncResult};
use chat_proto::thread::{Pagination, ThreadViewBoxed};
use chat_proto::{BoxedMessage, Boxer, PaddingMode, ServerHeader};
use chat_store::{Inbox, Outbox, Store, Vault};

pub const GENERATION: u32 = 1;

/// Scriptable in-memory server.
#[derive(Default)]
pub struct MockState {
    /// Oldest first.
    pub threads: HashMap<ConversationId, Vec<BoxedMessage>>,
    pub last_message_id: u64,
    /// Returned, in order, by the next posts instead of accepting them.
    pub post_failures: VecDeque<TransportError>,
    pub post_delay: Option<Duration>,
    pub post_calls: usize,

    pub version: InboxVersion,
    pub conversations: BTreeMap<ConversationId, Conversation>,
    /// Returned, in order, by the next `sync_inbox` calls.
    pub sync_script: VecDeque<SyncResult>,
    pub sync_failure: Option<TransportError>,
    pub sync_delay: Option<Duration>,
    pub sync_calls: usize,
    pub sync_all_calls: usize,
}

#[derive(Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
}

impl MockTransport {
    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock()
    }

    pub fn thread(&self, conv_id: &ConversationId) -> Vec<BoxedMessage> {
        self.state().threads.get(conv_id).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl ChatTransport for MockTransport {
    async fn post(&self, conv_id: &ConversationId, boxed: &BoxedMessage) -> Result<ServerHeader, TransportError> {
        let delay = self.state().post_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state();
        state.post_calls += 1;
        if let Some(err) = state.post_failures.pop_front() {
            return Err(err);
        }
        state.last_message_id += 1;
        let header = ServerHeader {
            message_id: MessageId(state.last_message_id),
            superseded_by: MessageId::NONE,
            ctime: Utc::now(),
            rtime: None,
        };
        state
            .threads
            .entry(conv_id.clone())
            .or_default()
            .push(boxed.clone().with_server_header(header.clone()));
        Ok(header)
    }

    async fn get_thread(
        &self,
        conv_id: &ConversationId,
        pagination: &Pagination,
    ) -> Result<ThreadViewBoxed, TransportError> {
        let state = self.state();
        let mut messages: Vec<BoxedMessage> =
            state.threads.get(conv_id).cloned().unwrap_or_default();
        messages.reverse();
        if pagination.num > 0 {
            messages.truncate(pagination.num as usize);
        }
        Ok(ThreadViewBoxed { messages, pagination: None })
    }

    async fn sync_inbox(&self, version: InboxVersion) -> Result<SyncResult, TransportError> {
        let delay = {
            let mut state = self.state();
            state.sync_calls += 1;
            state.sync_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state();
        if let Some(err) = state.sync_failure.take() {
            return Err(err);
        }
        if let Some(result) = state.sync_script.pop_front() {
            return Ok(result);
        }
        if version == state.version {
            return Ok(SyncResult::Current);
        }
        Ok(SyncResult::Incremental {
            version: state.version,
            conversations: state.conversations.values().cloned().collect(),
        })
    }

    async fn sync_all(&self) -> Result<FullInbox, TransportError> {
        let mut state = self.state();
        state.sync_all_calls += 1;
        Ok(FullInbox {
            version: state.version,
            conversations: state.conversations.values().cloned().collect(),
        })
    }
}

pub fn sender() -> (UserId, DeviceId) {
    (UserId::new(vec![0xaa]), DeviceId::new(vec![0xbb]))
}

pub fn triple(tag: u8) -> ConversationTriple {
    ConversationTriple {
        tlf_id: TlfId::new(vec![0x10, tag]),
        topic_id: TopicId::new(vec![0x30, tag]),
        topic_type: TopicType::Chat,
    }
}

pub fn conversation(tag: u8, max: u64) -> Conversation {
    let triple = triple(tag);
    Conversation {
        id: triple.conversation_id(),
        triple,
        tlf_name: format!("alice,bob{tag}"),
        status: ConversationStatus::Unfiled,
        max_msg_id: MessageId(max),
        read_msg_id: MessageId::NONE,
        mtime: DateTime::<Utc>::from_timestamp(1_700_000_000 + i64::from(tag), 0).unwrap_or_default(),
        members: vec![],
    }
}

pub fn delivery_config() -> DeliveryConfig {
    DeliveryConfig {
        send_timeout: Duration::from_secs(5),
        max_attempts: 5,
        expiry: chrono::Duration::minutes(60),
        error_purge_cutoff: chrono::Duration::days(7),
        ephemeral_purge_cutoff: chrono::Duration::hours(24),
        interval: Duration::from_secs(1),
    }
}

pub struct Fixture {
    pub dir: TempDir,
    pub store: Store,
    pub outbox: Outbox,
    pub inbox: Inbox,
    pub transport: Arc<MockTransport>,
    pub keys: Arc<LocalKeys>,
    pub directory: Arc<MemoryKeyDirectory>,
    pub triple: ConversationTriple,
    pub conv: ConversationId,
}

impl Fixture {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::open(&dir.path().join("chat.db"), Vault::new())
            .await
            .expect("open store");
        store.vault.unlock_with_key([7u8; 32]).await;

        let triple = triple(1);
        let conv = triple.conversation_id();
        let (user, device) = sender();

        let device_key = DeviceKeyPair::generate();
        let mut directory = MemoryKeyDirectory::new();
        directory.insert(user, device.clone(), GENERATION, device_key.public.0.clone());

        let mut keys = LocalKeys::new(device, device_key);
        keys.add_conversation_key(conv.clone(), GENERATION, [9u8; 32]);
        keys.add_ephemeral_seed(conv.clone(), GENERATION, [5u8; 32]);

        Self {
            outbox: Outbox::new(store.clone()),
            inbox: Inbox::new(store.clone()),
            store,
            dir,
            transport: Arc::new(MockTransport::default()),
            keys: Arc::new(keys),
            directory: Arc::new(directory),
            triple,
            conv,
        }
    }

    pub fn plaintext(&self, text: &str) -> MessagePlaintext {
        let (sender, sender_device) = sender();
        MessagePlaintext {
            client_header: ClientHeader {
                conv: self.triple.clone(),
                tlf_name: "alice,bob1".into(),
                tlf_public: false,
                message_type: MessageType::Text,
                prev: vec![],
                sender,
                sender_device,
                ctime: Utc::now(),
                outbox_id: None,
                outbox_info: None,
                merkle_root: None,
                ephemeral_metadata: None,
                bot_uid: None,
            },
            body: MessageBody::Text { body: text.into() },
            recipients: vec![UserId::new(vec![0xbc])],
        }
    }

    pub fn deliverer(&self, config: DeliveryConfig) -> Deliverer {
        let keys: Arc<dyn SealingKeys> = self.keys.clone();
        Deliverer::new(
            self.outbox.clone(),
            self.transport.clone(),
            keys,
            Boxer::new(PaddingMode::Buckets),
            config,
        )
    }

    pub fn loader(&self) -> ThreadLoader {
        ThreadLoader::new(
            self.transport.clone(),
            self.outbox.clone(),
            Boxer::new(PaddingMode::Buckets),
            self.directory.clone(),
            self.keys.clone(),
            Duration::from_secs(5),
        )
    }
}
