use chrono::Utc;

use crate::header::{ClientHeader, ConversationTriple, MessageType, TopicType};
use crate::ids::{DeviceId, TlfId, TopicId, UserId};
use crate::message::{MessageBody, MessagePlaintext};

pub(crate) fn plaintext(text: &str) -> MessagePlaintext {
    MessagePlaintext {
        client_header: ClientHeader {
            conv: ConversationTriple {
                tlf_id: TlfId::new(vec![0x10, 0x20]),
                topic_id: TopicId::new(vec![0x30]),
                topic_type: TopicType::Chat,
            },
            tlf_name: "alice,bob".into(),
            tlf_public: false,
            message_type: MessageType::Text,
            prev: vec![],
            sender: UserId::new(vec![0xaa]),
            sender_device: DeviceId::new(vec![0xbb]),
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
