#![forbid(unsafe_code)]

use tidemark_domain::{Seq, Topic, UserId};

use crate::server::store::{NewMessage, SyncStore};

fn topic(s: &str) -> Topic {
	Topic::parse(s).expect("valid topic")
}

fn user(s: &str) -> UserId {
	UserId::new(s).expect("valid user id")
}

fn new_message(t: &Topic, sender: &str, body: &str) -> NewMessage {
	NewMessage {
		topic: t.clone(),
		sender: user(sender),
		body: body.to_string(),
		attachments: Vec::new(),
		quoted_message_id: None,
		quoted_text: None,
	}
}

async fn store() -> SyncStore {
	SyncStore::connect("sqlite::memory:").await.expect("connect in-memory sqlite")
}

#[tokio::test]
async fn sequences_are_per_topic_and_gap_free() {
	let store = store().await;
	let t1 = topic("dm:a");
	let t2 = topic("dm:b");

	let m1 = store.append_message(new_message(&t1, "u1", "one"), 1).await.unwrap();
	let m2 = store.append_message(new_message(&t2, "u1", "other topic"), 2).await.unwrap();
	let m3 = store.append_message(new_message(&t1, "u2", "two"), 3).await.unwrap();

	assert_eq!(m1.seq, Seq(1));
	assert_eq!(m2.seq, Seq(1));
	assert_eq!(m3.seq, Seq(2));

	assert_eq!(store.latest_seq(&t1).await.unwrap(), Seq(2));
	assert_eq!(store.latest_seq(&t2).await.unwrap(), Seq(1));
	assert_eq!(store.latest_seq(&topic("dm:none")).await.unwrap(), Seq::ZERO);
}

#[tokio::test]
async fn messages_since_pages_in_sequence_order() {
	let store = store().await;
	let t = topic("group:g1/general");

	for i in 1..=5 {
		store.append_message(new_message(&t, "u1", &format!("m-{i}")), i).await.unwrap();
	}

	let page = store.messages_since(&t, Seq(2), 2).await.unwrap();
	assert_eq!(page.len(), 2);
	assert_eq!(page[0].seq, Seq(3));
	assert_eq!(page[1].seq, Seq(4));

	let rest = store.messages_since(&t, Seq(4), 100).await.unwrap();
	assert_eq!(rest.len(), 1);
	assert_eq!(rest[0].body, "m-5");
}

#[tokio::test]
async fn append_roundtrips_attachments_and_quotes() {
	let store = store().await;
	let t = topic("dm:a");

	let first = store.append_message(new_message(&t, "u1", "original"), 1).await.unwrap();

	let mut quoted = new_message(&t, "u2", "reply");
	quoted.attachments = vec!["blob://cover.png".to_string()];
	quoted.quoted_message_id = Some(first.id);
	quoted.quoted_text = Some("original".to_string());
	store.append_message(quoted, 2).await.unwrap();

	let listed = store.messages_since(&t, Seq(1), 10).await.unwrap();
	assert_eq!(listed.len(), 1);
	assert_eq!(listed[0].attachments, vec!["blob://cover.png".to_string()]);
	assert_eq!(listed[0].quoted_message_id, Some(first.id));
	assert_eq!(listed[0].quoted_text.as_deref(), Some("original"));
}

#[tokio::test]
async fn unread_counts_exclude_own_messages() {
	let store = store().await;
	let t = topic("dm:a");
	let reader = user("alice");

	store.append_message(new_message(&t, "bob", "from bob"), 1).await.unwrap();
	store.append_message(new_message(&t, "alice", "from alice"), 2).await.unwrap();
	store.append_message(new_message(&t, "bob", "from bob again"), 3).await.unwrap();

	// Sending without reading must not hide earlier messages.
	assert_eq!(store.count_unread(&t, Seq::ZERO, &reader).await.unwrap(), 2);
	assert_eq!(store.count_unread(&t, Seq(1), &reader).await.unwrap(), 1);
}

#[tokio::test]
async fn mark_read_is_monotonic_and_ignores_stale_acks() {
	let store = store().await;
	let t = topic("dm:a");
	let reader = user("alice");

	for i in 1..=3 {
		store.append_message(new_message(&t, "bob", &format!("m-{i}")), i).await.unwrap();
	}

	assert_eq!(store.count_unread(&t, Seq::ZERO, &reader).await.unwrap(), 3);

	let first = store.mark_read(&reader, &t, Seq(2), 10).await.unwrap();
	assert!(first.applied);
	assert_eq!(first.watermark, Seq(2));

	// Stale ack: ignored, never decreased-then-reapplied.
	let stale = store.mark_read(&reader, &t, Seq(1), 11).await.unwrap();
	assert!(!stale.applied);
	assert_eq!(stale.watermark, Seq(2));

	let pos = store.read_position(&reader, &t).await.unwrap().expect("position exists");
	assert_eq!(pos.last_ack_seq, Seq(2));
	assert_eq!(store.count_unread(&t, pos.last_ack_seq, &reader).await.unwrap(), 1);
}

#[tokio::test]
async fn mark_read_never_runs_ahead_of_the_log() {
	let store = store().await;
	let t = topic("dm:a");
	let reader = user("alice");

	store.append_message(new_message(&t, "bob", "only one"), 1).await.unwrap();

	let outcome = store.mark_read(&reader, &t, Seq(50), 10).await.unwrap();
	assert_eq!(outcome.watermark, Seq(1));
}

#[tokio::test]
async fn read_position_is_created_lazily() {
	let store = store().await;
	let t = topic("dm:a");
	let reader = user("alice");

	assert!(store.read_position(&reader, &t).await.unwrap().is_none());

	store.append_message(new_message(&t, "bob", "hello"), 1).await.unwrap();
	store.mark_read(&reader, &t, Seq(1), 2).await.unwrap();

	assert!(store.read_position(&reader, &t).await.unwrap().is_some());
}

#[tokio::test]
async fn soft_deleted_messages_leave_history_and_unread_counts() {
	let store = store().await;
	let t = topic("dm:a");
	let reader = user("alice");

	let m1 = store.append_message(new_message(&t, "bob", "m-1"), 1).await.unwrap();
	store.append_message(new_message(&t, "bob", "m-2"), 2).await.unwrap();

	assert_eq!(store.count_unread(&t, Seq::ZERO, &reader).await.unwrap(), 2);

	assert!(store.soft_delete_message(m1.id, 5).await.unwrap());
	// Second delete of the same id is a no-op.
	assert!(!store.soft_delete_message(m1.id, 6).await.unwrap());

	assert_eq!(store.count_unread(&t, Seq::ZERO, &reader).await.unwrap(), 1);

	let listed = store.messages_since(&t, Seq::ZERO, 10).await.unwrap();
	assert_eq!(listed.len(), 1);
	assert_eq!(listed[0].body, "m-2");

	// Sequences stay gap-free; the latest seq is unaffected by deletion.
	assert_eq!(store.latest_seq(&t).await.unwrap(), Seq(2));
}
