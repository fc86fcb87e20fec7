#![forbid(unsafe_code)]

use anyhow::{Context, anyhow};
use tidemark_domain::{Message, MessageId, ReadPosition, Seq, Topic, UserId};

/// New-message input; the store assigns id, sequence, and timestamp ordering.
#[derive(Debug, Clone)]
pub struct NewMessage {
	pub topic: Topic,
	pub sender: UserId,
	pub body: String,
	pub attachments: Vec<String>,
	pub quoted_message_id: Option<MessageId>,
	pub quoted_text: Option<String>,
}

/// Result of a `mark_read` call. `watermark` is the stored value after the
/// call, which may exceed the requested one when the request was stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkReadOutcome {
	pub watermark: Seq,
	pub applied: bool,
}

/// Durable message log and read-position store.
///
/// Sequences are per-topic, gap-free, and assigned transactionally; they are
/// the sole ordering key. Read-position writes are atomic monotonic upserts
/// (compare-and-set, never read-modify-write).
#[derive(Clone)]
pub struct SyncStore {
	backend: Backend,
}

#[derive(Clone)]
enum Backend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
}

type MessageRow = (
	String,
	String,
	i64,
	String,
	String,
	Option<String>,
	Option<String>,
	Option<String>,
	i64,
);

fn row_to_message(row: MessageRow) -> anyhow::Result<Message> {
	let (id, topic, seq, sender, body, attachments, quoted_id, quoted_text, created_at_ms) = row;

	let quoted_message_id = match quoted_id {
		Some(s) => Some(MessageId(uuid::Uuid::parse_str(&s).context("parse quoted message id")?)),
		None => None,
	};

	Ok(Message {
		id: MessageId(uuid::Uuid::parse_str(&id).context("parse message id")?),
		topic: Topic::parse(&topic).context("parse stored topic")?,
		sender: UserId::new(sender).context("parse stored sender")?,
		body,
		attachments: match attachments {
			Some(json) => serde_json::from_str(&json).context("parse stored attachments")?,
			None => Vec::new(),
		},
		quoted_message_id,
		quoted_text,
		seq: Seq(seq as u64),
		created_at_unix_ms: created_at_ms,
	})
}

const MESSAGE_COLUMNS: &str = "id, topic, seq, sender_id, body, attachments, quoted_message_id, quoted_text, created_at_ms";

impl SyncStore {
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		if database_url.starts_with("sqlite:") {
			// In-memory sqlite is per-connection; the pool must be pinned to a
			// single connection or each checkout sees an empty database.
			let opts = sqlx::sqlite::SqlitePoolOptions::new();
			let opts = if database_url.contains(":memory:") {
				opts.max_connections(1).idle_timeout(None).max_lifetime(None)
			} else {
				opts
			};

			let pool = opts.connect(database_url).await.context("connect sqlite")?;
			sqlx::migrate!("migrations/sqlite")
				.run(&pool)
				.await
				.context("run sqlite migrations")?;

			Ok(Self {
				backend: Backend::Sqlite(pool),
			})
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = sqlx::PgPool::connect(database_url).await.context("connect postgres")?;
			sqlx::migrate!("migrations/postgres")
				.run(&pool)
				.await
				.context("run postgres migrations")?;

			Ok(Self {
				backend: Backend::Postgres(pool),
			})
		} else {
			Err(anyhow!("unsupported database_url (use sqlite: or postgres:)"))
		}
	}

	/// Append a message, assigning the next per-topic sequence number inside
	/// a transaction.
	pub async fn append_message(&self, new: NewMessage, now_ms: i64) -> anyhow::Result<Message> {
		let id = MessageId::new_v4();
		let topic_s = new.topic.to_string();
		let attachments_json = if new.attachments.is_empty() {
			None
		} else {
			Some(serde_json::to_string(&new.attachments).context("serialize attachments")?)
		};
		let quoted_id_s = new.quoted_message_id.map(|m| m.to_string());

		let seq = match &self.backend {
			Backend::Sqlite(pool) => {
				let mut tx = pool.begin().await.context("begin sqlite tx")?;

				let row: Option<(i64,)> = sqlx::query_as("SELECT seq FROM topic_sequences WHERE topic = ?")
					.bind(&topic_s)
					.fetch_optional(&mut *tx)
					.await
					.context("select topic sequence (sqlite)")?;

				let next = row.map(|(s,)| s as u64 + 1).unwrap_or(1);
				sqlx::query(
					"INSERT INTO topic_sequences (topic, seq) VALUES (?, ?) \
					ON CONFLICT(topic) DO UPDATE SET seq = excluded.seq",
				)
				.bind(&topic_s)
				.bind(next as i64)
				.execute(&mut *tx)
				.await
				.context("advance topic sequence (sqlite)")?;

				sqlx::query(
					"INSERT INTO messages (id, topic, seq, sender_id, body, attachments, quoted_message_id, quoted_text, created_at_ms) \
					VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
				)
				.bind(id.to_string())
				.bind(&topic_s)
				.bind(next as i64)
				.bind(new.sender.as_str())
				.bind(&new.body)
				.bind(&attachments_json)
				.bind(&quoted_id_s)
				.bind(&new.quoted_text)
				.bind(now_ms)
				.execute(&mut *tx)
				.await
				.context("insert message (sqlite)")?;

				tx.commit().await.context("commit sqlite tx")?;
				next
			}
			Backend::Postgres(pool) => {
				let mut tx = pool.begin().await.context("begin postgres tx")?;

				let row: Option<(i64,)> = sqlx::query_as("SELECT seq FROM topic_sequences WHERE topic = $1 FOR UPDATE")
					.bind(&topic_s)
					.fetch_optional(&mut *tx)
					.await
					.context("select topic sequence (postgres)")?;

				let next = row.map(|(s,)| s as u64 + 1).unwrap_or(1);
				sqlx::query(
					"INSERT INTO topic_sequences (topic, seq) VALUES ($1, $2) \
					ON CONFLICT (topic) DO UPDATE SET seq = EXCLUDED.seq",
				)
				.bind(&topic_s)
				.bind(next as i64)
				.execute(&mut *tx)
				.await
				.context("advance topic sequence (postgres)")?;

				sqlx::query(
					"INSERT INTO messages (id, topic, seq, sender_id, body, attachments, quoted_message_id, quoted_text, created_at_ms) \
					VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
				)
				.bind(id.to_string())
				.bind(&topic_s)
				.bind(next as i64)
				.bind(new.sender.as_str())
				.bind(&new.body)
				.bind(&attachments_json)
				.bind(&quoted_id_s)
				.bind(&new.quoted_text)
				.bind(now_ms)
				.execute(&mut *tx)
				.await
				.context("insert message (postgres)")?;

				tx.commit().await.context("commit postgres tx")?;
				next
			}
		};

		Ok(Message {
			id,
			topic: new.topic,
			sender: new.sender,
			body: new.body,
			attachments: new.attachments,
			quoted_message_id: new.quoted_message_id,
			quoted_text: new.quoted_text,
			seq: Seq(seq),
			created_at_unix_ms: now_ms,
		})
	}

	/// Highest sequence ever assigned for a topic; zero when none.
	pub async fn latest_seq(&self, topic: &Topic) -> anyhow::Result<Seq> {
		let topic_s = topic.to_string();

		let row: Option<(i64,)> = match &self.backend {
			Backend::Sqlite(pool) => sqlx::query_as("SELECT seq FROM topic_sequences WHERE topic = ?")
				.bind(&topic_s)
				.fetch_optional(pool)
				.await
				.context("select latest seq (sqlite)")?,
			Backend::Postgres(pool) => sqlx::query_as("SELECT seq FROM topic_sequences WHERE topic = $1")
				.bind(&topic_s)
				.fetch_optional(pool)
				.await
				.context("select latest seq (postgres)")?,
		};

		Ok(Seq(row.map(|(s,)| s as u64).unwrap_or(0)))
	}

	/// Messages with `seq > after`, ascending, soft-deleted rows excluded.
	pub async fn messages_since(&self, topic: &Topic, after: Seq, limit: u32) -> anyhow::Result<Vec<Message>> {
		let topic_s = topic.to_string();

		let rows: Vec<MessageRow> = match &self.backend {
			Backend::Sqlite(pool) => sqlx::query_as(&format!(
				"SELECT {MESSAGE_COLUMNS} FROM messages \
				WHERE topic = ? AND seq > ? AND deleted_at_ms IS NULL \
				ORDER BY seq ASC LIMIT ?"
			))
			.bind(&topic_s)
			.bind(after.0 as i64)
			.bind(limit as i64)
			.fetch_all(pool)
			.await
			.context("list messages (sqlite)")?,
			Backend::Postgres(pool) => sqlx::query_as(&format!(
				"SELECT {MESSAGE_COLUMNS} FROM messages \
				WHERE topic = $1 AND seq > $2 AND deleted_at_ms IS NULL \
				ORDER BY seq ASC LIMIT $3"
			))
			.bind(&topic_s)
			.bind(after.0 as i64)
			.bind(limit as i64)
			.fetch_all(pool)
			.await
			.context("list messages (postgres)")?,
		};

		rows.into_iter().map(row_to_message).collect()
	}

	/// Unread count for a reader: messages past `after` not sent by the
	/// reader, soft-deleted rows excluded retroactively.
	pub async fn count_unread(&self, topic: &Topic, after: Seq, reader: &UserId) -> anyhow::Result<u64> {
		let topic_s = topic.to_string();

		let (count,): (i64,) = match &self.backend {
			Backend::Sqlite(pool) => sqlx::query_as(
				"SELECT COUNT(*) FROM messages \
				WHERE topic = ? AND seq > ? AND sender_id != ? AND deleted_at_ms IS NULL",
			)
			.bind(&topic_s)
			.bind(after.0 as i64)
			.bind(reader.as_str())
			.fetch_one(pool)
			.await
			.context("count unread (sqlite)")?,
			Backend::Postgres(pool) => sqlx::query_as(
				"SELECT COUNT(*) FROM messages \
				WHERE topic = $1 AND seq > $2 AND sender_id != $3 AND deleted_at_ms IS NULL",
			)
			.bind(&topic_s)
			.bind(after.0 as i64)
			.bind(reader.as_str())
			.fetch_one(pool)
			.await
			.context("count unread (postgres)")?,
		};

		Ok(count as u64)
	}

	pub async fn read_position(&self, user: &UserId, topic: &Topic) -> anyhow::Result<Option<ReadPosition>> {
		let topic_s = topic.to_string();

		let row: Option<(i64, i64)> = match &self.backend {
			Backend::Sqlite(pool) => {
				sqlx::query_as("SELECT last_ack_seq, updated_at_ms FROM read_positions WHERE user_id = ? AND topic = ?")
					.bind(user.as_str())
					.bind(&topic_s)
					.fetch_optional(pool)
					.await
					.context("select read position (sqlite)")?
			}
			Backend::Postgres(pool) => {
				sqlx::query_as("SELECT last_ack_seq, updated_at_ms FROM read_positions WHERE user_id = $1 AND topic = $2")
					.bind(user.as_str())
					.bind(&topic_s)
					.fetch_optional(pool)
					.await
					.context("select read position (postgres)")?
			}
		};

		Ok(row.map(|(seq, updated_at_ms)| ReadPosition {
			user: user.clone(),
			topic: topic.clone(),
			last_ack_seq: Seq(seq as u64),
			updated_at_unix_ms: updated_at_ms,
		}))
	}

	/// Monotonic compare-and-set upsert of the read position. Stale
	/// watermarks are ignored, never an error; the ack is clamped so it can
	/// never run ahead of the topic's log.
	pub async fn mark_read(&self, user: &UserId, topic: &Topic, up_to: Seq, now_ms: i64) -> anyhow::Result<MarkReadOutcome> {
		let cap = self.latest_seq(topic).await?;
		let target = up_to.min(cap);
		let topic_s = topic.to_string();

		let applied = match &self.backend {
			Backend::Sqlite(pool) => {
				let res = sqlx::query(
					"INSERT INTO read_positions (user_id, topic, last_ack_seq, updated_at_ms) VALUES (?, ?, ?, ?) \
					ON CONFLICT(user_id, topic) DO UPDATE \
					SET last_ack_seq = excluded.last_ack_seq, updated_at_ms = excluded.updated_at_ms \
					WHERE excluded.last_ack_seq > read_positions.last_ack_seq",
				)
				.bind(user.as_str())
				.bind(&topic_s)
				.bind(target.0 as i64)
				.bind(now_ms)
				.execute(pool)
				.await
				.context("upsert read position (sqlite)")?;
				res.rows_affected() > 0
			}
			Backend::Postgres(pool) => {
				let res = sqlx::query(
					"INSERT INTO read_positions (user_id, topic, last_ack_seq, updated_at_ms) VALUES ($1, $2, $3, $4) \
					ON CONFLICT (user_id, topic) DO UPDATE \
					SET last_ack_seq = EXCLUDED.last_ack_seq, updated_at_ms = EXCLUDED.updated_at_ms \
					WHERE EXCLUDED.last_ack_seq > read_positions.last_ack_seq",
				)
				.bind(user.as_str())
				.bind(&topic_s)
				.bind(target.0 as i64)
				.bind(now_ms)
				.execute(pool)
				.await
				.context("upsert read position (postgres)")?;
				res.rows_affected() > 0
			}
		};

		let watermark = self
			.read_position(user, topic)
			.await?
			.map(|p| p.last_ack_seq)
			.unwrap_or(Seq::ZERO);

		Ok(MarkReadOutcome { watermark, applied })
	}

	/// Soft-delete a message. The row keeps its sequence number (sequences
	/// stay gap-free) but is excluded from history and unread counts from
	/// this point on. Returns false when the id is unknown or already
	/// deleted.
	pub async fn soft_delete_message(&self, id: MessageId, now_ms: i64) -> anyhow::Result<bool> {
		let affected = match &self.backend {
			Backend::Sqlite(pool) => {
				sqlx::query("UPDATE messages SET deleted_at_ms = ? WHERE id = ? AND deleted_at_ms IS NULL")
					.bind(now_ms)
					.bind(id.to_string())
					.execute(pool)
					.await
					.context("soft delete message (sqlite)")?
					.rows_affected()
			}
			Backend::Postgres(pool) => {
				sqlx::query("UPDATE messages SET deleted_at_ms = $1 WHERE id = $2 AND deleted_at_ms IS NULL")
					.bind(now_ms)
					.bind(id.to_string())
					.execute(pool)
					.await
					.context("soft delete message (postgres)")?
					.rows_affected()
			}
		};

		Ok(affected > 0)
	}
}
