mod common;

use chat_client::DeliveryOutcome;
use chat_proto::header::MessagePreviousPointer;
use chat_proto::thread::{Cursor, Pagination};
use chat_proto::{UnboxErrorKind, UnboxedMessage};
use chat_store::outbox::EnqueueOptions;

use common::{delivery_config, Fixture};

async fn send(f: &Fixture, text: &str) -> UnboxedMessage {
    let deliverer = f.deliverer(delivery_config());
    deliverer.queue(&f.conv, f.plaintext(text), EnqueueOptions::default()).await.unwrap();
    let mut outcomes = deliverer.deliver_pending().await.unwrap();
    match outcomes.pop() {
        Some(DeliveryOutcome::Sent { message, .. }) => *message,
        other => panic!("expected Sent, got {other:?}"),
    }
}

#[tokio::test]
async fn first_page_merges_pending_outbox_on_top() {
    let f = Fixture::new().await;
    let older = send(&f, "hello").await;
    let newer = send(&f, "world").await;
    let pending = f
        .outbox
        .enqueue(&f.conv, f.plaintext("still typing"), EnqueueOptions::default())
        .await
        .unwrap();

    let load = f.loader().load(&f.conv, &Pagination::first_page(50)).await.unwrap();
    assert_eq!(load.outbox_merged, 1);
    assert!(load.prev_mismatches.is_empty());
    let ids: Vec<_> = load.view.messages.iter().map(|m| m.message_id()).collect();
    assert_eq!(
        ids,
        vec![chat_proto::MessageId::NONE, newer.message_id(), older.message_id()]
    );
    assert_eq!(load.view.messages[0].outbox_id(), Some(&pending.outbox_id));
    assert_eq!(
        load.view.messages[1].as_valid().map(|v| v.body.clone()),
        newer.as_valid().map(|v| v.body.clone())
    );
}

#[tokio::test]
async fn later_pages_leave_the_outbox_out() {
    let f = Fixture::new().await;
    send(&f, "hello").await;
    f.outbox
        .enqueue(&f.conv, f.plaintext("pending"), EnqueueOptions::default())
        .await
        .unwrap();

    let page = Pagination { next: Some(Cursor::new(vec![1, 2, 3])), ..Pagination::first_page(50) };
    let load = f.loader().load(&f.conv, &page).await.unwrap();
    assert_eq!(load.outbox_merged, 0);
    assert!(load.view.messages.iter().all(|m| m.as_outbox().is_none()));
}

#[tokio::test]
async fn tampered_message_loads_as_error() {
    let f = Fixture::new().await;
    send(&f, "intact").await;
    send(&f, "tampered").await;
    {
        let mut state = f.transport.state();
        let thread = state.threads.get_mut(&f.conv).unwrap();
        thread[1].body_ciphertext[0] ^= 0x01;
    }

    let load = f.loader().load(&f.conv, &Pagination::first_page(50)).await.unwrap();
    let messages = &load.view.messages;
    assert_eq!(messages.len(), 2);
    let err = messages[0].as_error().expect("tampered message must not be valid");
    assert_eq!(err.kind, UnboxErrorKind::Misc);
    assert!(!err.recoverable);
    assert!(messages[1].is_valid());
}

#[tokio::test]
async fn wrong_prev_hash_is_reported() {
    let f = Fixture::new().await;
    let first = send(&f, "first").await;

    let mut msg = f.plaintext("second");
    msg.client_header.prev = vec![MessagePreviousPointer {
        id: first.message_id(),
        hash: vec![0u8; 32],
    }];
    let deliverer = f.deliverer(delivery_config());
    deliverer.queue(&f.conv, msg, EnqueueOptions::default()).await.unwrap();
    deliverer.deliver_pending().await.unwrap();

    let load = f.loader().load(&f.conv, &Pagination::first_page(50)).await.unwrap();
    assert_eq!(load.prev_mismatches.len(), 1);
    let mismatch = &load.prev_mismatches[0];
    assert_eq!(mismatch.prev_id, first.message_id());
    assert_eq!(Some(&mismatch.actual), first.as_valid().map(|v| &v.header_hash));
}
