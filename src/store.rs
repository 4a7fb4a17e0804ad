//! SQLite persistence for sessions, the identity record and local pre-keys.
//!
//! `Database` is an explicit handle: it is opened once, cloned into every store that needs it, and closed explicitly. All SQLite work runs on tokio's blocking pool. The connection guard lives only inside the closure handed to `Database::call`, so it is released on every exit path.
//!
//! The schema is versioned with `PRAGMA user_version`. Opening a database applies each missing upgrade step once, each inside its own transaction together with the version bump.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info};
use rusqlite::{params, Connection, OptionalExtension};
use zeroize::Zeroizing;

use crate::crypto::{fingerprint, KEY_LENGTH};
use crate::error::StoreError;
use crate::ratchet::{Chain, ChainKey, MessageKey, RootKey, SessionState};

/// SCHEMA_VERSION is the version this build writes
pub const SCHEMA_VERSION: u32 = 2;

/// Version 1: sessions keyed by peer, single-row identity table.
const SCHEMA_V1: &str = "
    CREATE TABLE IF NOT EXISTS sessions (
        recipient_id TEXT PRIMARY KEY,
        root_key BLOB NOT NULL,
        sending_key BLOB NOT NULL,
        sending_counter INTEGER NOT NULL,
        receiving_key BLOB NOT NULL,
        receiving_counter INTEGER NOT NULL,
        last_used INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS sessions_last_used_idx ON sessions(last_used);
    CREATE TABLE IF NOT EXISTS identity (
        id TEXT PRIMARY KEY,
        public_key BLOB NOT NULL,
        private_key BLOB NOT NULL,
        created_at INTEGER NOT NULL
    );
";

/// Version 2: ratchet key, handshake header and peer identity on sessions, skipped message keys, local pre-keys.
const SCHEMA_V2: &str = "
    ALTER TABLE sessions ADD COLUMN ratchet_key BLOB NOT NULL DEFAULT x'';
    ALTER TABLE sessions ADD COLUMN handshake_header BLOB;
    ALTER TABLE sessions ADD COLUMN peer_identity BLOB NOT NULL DEFAULT x'';
    CREATE TABLE IF NOT EXISTS skipped_keys (
        recipient_id TEXT NOT NULL,
        counter INTEGER NOT NULL,
        message_key BLOB NOT NULL,
        PRIMARY KEY (recipient_id, counter)
    );
    CREATE TABLE IF NOT EXISTS prekeys (
        public_key BLOB PRIMARY KEY,
        private_key BLOB NOT NULL,
        kind TEXT NOT NULL,
        signature BLOB,
        created_at INTEGER NOT NULL
    );
";

const MIGRATIONS: [&str; SCHEMA_VERSION as usize] = [SCHEMA_V1, SCHEMA_V2];

/// Shared handle to the session database.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Option<Connection>>>,
}

impl Database {
    /// open opens (or creates) the database file and brings its schema up to date
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open_at_version(Some(path.as_ref().to_path_buf()), SCHEMA_VERSION).await
    }

    /// open_in_memory is a private, non-durable database
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        Self::open_at_version(None, SCHEMA_VERSION).await
    }

    pub(crate) async fn open_at_version(path: Option<PathBuf>, version: u32) -> Result<Self, StoreError> {
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection, StoreError> {
            let mut conn = match &path {
                Some(path) => Connection::open(path)?,
                None => Connection::open_in_memory()?,
            };
            conn.busy_timeout(Duration::from_secs(5))?;
            migrate(&mut conn, version)?;
            debug!("opened session database at {:?}", path);
            Ok(conn)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("storage task failed: {e}")))??;
        Ok(Self {
            conn: Arc::new(Mutex::new(Some(conn))),
        })
    }

    /// close releases the connection. Every clone of this handle sees the database as closed afterwards.
    pub async fn close(&self) -> Result<(), StoreError> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::Unavailable("connection lock poisoned".into()))?;
            if let Some(conn) = guard.take() {
                conn.close().map_err(|(_, e)| StoreError::Sql(e))?;
                debug!("closed session database");
            }
            Ok(())
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("storage task failed: {e}")))?
    }

    pub async fn schema_version(&self) -> Result<u32, StoreError> {
        self.call(|conn| Ok(conn.pragma_query_value(None, "user_version", |row| row.get(0))?))
            .await
    }

    /// call runs `f` against the connection on the blocking pool
    pub(crate) async fn call<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::Unavailable("connection lock poisoned".into()))?;
            let conn = guard
                .as_mut()
                .ok_or_else(|| StoreError::Unavailable("database is closed".into()))?;
            f(conn)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("storage task failed: {e}")))?
    }
}

fn migrate(conn: &mut Connection, target: u32) -> Result<(), StoreError> {
    let found: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    if found > target {
        return Err(StoreError::SchemaTooNew {
            found,
            supported: target,
        });
    }
    for version in (found + 1)..=target {
        let tx = conn.transaction()?;
        tx.execute_batch(MIGRATIONS[(version - 1) as usize])?;
        tx.pragma_update(None, "user_version", version)?;
        tx.commit()?;
        info!("session store upgraded to schema version {version}");
    }
    Ok(())
}

pub(crate) fn to_millis(time: DateTime<Utc>) -> i64 {
    time.timestamp_millis()
}

pub(crate) fn from_millis(millis: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp {millis} out of range")))
}

pub(crate) fn key_from_blob(blob: &[u8], what: &str) -> Result<[u8; KEY_LENGTH], StoreError> {
    blob.try_into()
        .map_err(|_| StoreError::Corrupt(format!("{what} is {} bytes, expected {KEY_LENGTH}", blob.len())))
}

/// Session records keyed by peer id.
#[derive(Clone)]
pub struct SessionStore {
    db: Database,
}

impl SessionStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn get_session(&self, recipient_id: &str) -> Result<Option<SessionState>, StoreError> {
        let recipient_id = recipient_id.to_string();
        self.db.call(move |conn| read_session(conn, &recipient_id)).await
    }

    /// save_session upserts the record and its skipped-key cache in one transaction
    pub async fn save_session(&self, session: &SessionState) -> Result<(), StoreError> {
        let session = session.clone();
        self.db.call(move |conn| write_session(conn, &session, None)).await
    }

    /// save_session_consuming_prekey also deletes the one-time pre-key the session was built from. If another session already consumed it nothing is written.
    pub(crate) async fn save_session_consuming_prekey(
        &self,
        session: &SessionState,
        one_time_prekey: [u8; KEY_LENGTH],
    ) -> Result<(), StoreError> {
        let session = session.clone();
        self.db
            .call(move |conn| write_session(conn, &session, Some(one_time_prekey)))
            .await
    }

    /// clear_all_sessions wipes every session; identity and pre-keys are kept
    pub async fn clear_all_sessions(&self) -> Result<(), StoreError> {
        self.db
            .call(|conn| {
                let tx = conn.transaction()?;
                let removed = tx.execute("DELETE FROM sessions", [])?;
                tx.execute("DELETE FROM skipped_keys", [])?;
                tx.commit()?;
                info!("cleared {removed} sessions");
                Ok(())
            })
            .await
    }

    /// recent_sessions lists peers by most recent activity
    pub async fn recent_sessions(&self, limit: usize) -> Result<Vec<(String, DateTime<Utc>)>, StoreError> {
        self.db
            .call(move |conn| {
                let mut stmt =
                    conn.prepare("SELECT recipient_id, last_used FROM sessions ORDER BY last_used DESC LIMIT ?1")?;
                let rows = stmt
                    .query_map(params![limit as i64], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                rows.into_iter()
                    .map(|(id, millis)| -> Result<_, StoreError> { Ok((id, from_millis(millis)?)) })
                    .collect()
            })
            .await
    }
}

fn read_session(conn: &mut Connection, recipient_id: &str) -> Result<Option<SessionState>, StoreError> {
    let tx = conn.transaction()?;
    let row = tx
        .query_row(
            "SELECT root_key, sending_key, sending_counter, receiving_key, receiving_counter,
                    last_used, ratchet_key, handshake_header, peer_identity
             FROM sessions WHERE recipient_id = ?1",
            params![recipient_id],
            |row| {
                Ok((
                    Zeroizing::new(row.get::<_, Vec<u8>>(0)?),
                    Zeroizing::new(row.get::<_, Vec<u8>>(1)?),
                    row.get::<_, u32>(2)?,
                    Zeroizing::new(row.get::<_, Vec<u8>>(3)?),
                    row.get::<_, u32>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, Vec<u8>>(6)?,
                    row.get::<_, Option<Vec<u8>>>(7)?,
                    row.get::<_, Vec<u8>>(8)?,
                ))
            },
        )
        .optional()?;
    let Some((
        root,
        sending,
        sending_counter,
        receiving,
        receiving_counter,
        last_used,
        ratchet_key,
        handshake_header,
        peer_identity,
    )) = row
    else {
        return Ok(None);
    };

    let mut skipped_keys = BTreeMap::new();
    {
        let mut stmt = tx.prepare("SELECT counter, message_key FROM skipped_keys WHERE recipient_id = ?1")?;
        let mut rows = stmt.query(params![recipient_id])?;
        while let Some(row) = rows.next()? {
            let counter: u32 = row.get(0)?;
            let key = Zeroizing::new(row.get::<_, Vec<u8>>(1)?);
            skipped_keys.insert(counter, MessageKey::from_bytes(key_from_blob(&key, "skipped message key")?));
        }
    }
    tx.commit()?;

    Ok(Some(SessionState {
        recipient_id: recipient_id.to_string(),
        root_key: RootKey::from_bytes(key_from_blob(&root, "root key")?),
        sending_chain: Chain::new(ChainKey::from_bytes(key_from_blob(&sending, "sending chain key")?), sending_counter),
        receiving_chain: Chain::new(
            ChainKey::from_bytes(key_from_blob(&receiving, "receiving chain key")?),
            receiving_counter,
        ),
        ratchet_key,
        handshake_header,
        peer_identity,
        skipped_keys,
        last_used: from_millis(last_used)?,
    }))
}

fn write_session(
    conn: &mut Connection,
    session: &SessionState,
    consumed_prekey: Option<[u8; KEY_LENGTH]>,
) -> Result<(), StoreError> {
    let tx = conn.transaction()?;
    if let Some(public_key) = consumed_prekey {
        let removed = tx.execute(
            "DELETE FROM prekeys WHERE public_key = ?1 AND kind = 'one_time'",
            params![&public_key[..]],
        )?;
        if removed == 0 {
            // Dropping the transaction rolls it back
            return Err(StoreError::PreKeyConsumed(fingerprint(&public_key)));
        }
    }
    tx.execute(
        "INSERT INTO sessions (recipient_id, root_key, sending_key, sending_counter, receiving_key,
                               receiving_counter, last_used, ratchet_key, handshake_header, peer_identity)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
         ON CONFLICT(recipient_id) DO UPDATE SET
            root_key = excluded.root_key,
            sending_key = excluded.sending_key,
            sending_counter = excluded.sending_counter,
            receiving_key = excluded.receiving_key,
            receiving_counter = excluded.receiving_counter,
            last_used = excluded.last_used,
            ratchet_key = excluded.ratchet_key,
            handshake_header = excluded.handshake_header,
            peer_identity = excluded.peer_identity",
        params![
            session.recipient_id,
            &session.root_key.as_bytes()[..],
            &session.sending_chain.key().as_bytes()[..],
            session.sending_chain.counter(),
            &session.receiving_chain.key().as_bytes()[..],
            session.receiving_chain.counter(),
            to_millis(session.last_used),
            session.ratchet_key,
            session.handshake_header,
            session.peer_identity,
        ],
    )?;
    tx.execute(
        "DELETE FROM skipped_keys WHERE recipient_id = ?1",
        params![session.recipient_id],
    )?;
    {
        let mut stmt =
            tx.prepare("INSERT INTO skipped_keys (recipient_id, counter, message_key) VALUES (?1, ?2, ?3)")?;
        for (counter, key) in &session.skipped_keys {
            stmt.execute(params![session.recipient_id, counter, &key.as_bytes()[..]])?;
        }
    }
    tx.commit()?;
    Ok(())
}

/* ------------------------------------------------------------------------- */

// TESTS
