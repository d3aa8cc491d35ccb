//! Per-list digest mailboxes
//!
//! Every list has one live MMDF mailbox at `lists/{list_id}/digest.mmdf` and
//! a sidecar `digest.mmdf.ids` holding one dedupe key per appended message.
//! All access goes through [`DigestMailboxes::lock`], which serializes
//! appenders and the dispatcher per list. Rotation renames both files to
//! `digest.{volume}.{number}.mmdf[.ids]`; the next append recreates the live
//! mailbox.

use crate::message::Message;
use listrust_common::{Error, Result};
use listrust_storage::FileStorage;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

const MMDF_SEPARATOR: &[u8] = b"\x01\x01\x01\x01\n";
const IDS_SUFFIX: &str = ".ids";

pub fn mailbox_path(list_id: &str) -> String {
    format!("lists/{}/digest.mmdf", list_id)
}

pub fn rotated_path(list_id: &str, volume: i32, number: i32) -> String {
    format!("lists/{}/digest.{}.{}.mmdf", list_id, volume, number)
}

fn ids_path(mailbox: &str) -> String {
    format!("{}{}", mailbox, IDS_SUFFIX)
}

/// Owner of every list's digest mailbox
pub struct DigestMailboxes {
    storage: Arc<dyn FileStorage>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl DigestMailboxes {
    pub fn new(storage: Arc<dyn FileStorage>) -> Self {
        Self {
            storage,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Exclusive access to one list's live mailbox until the guard drops
    pub async fn lock(&self, list_id: &str) -> MailboxGuard {
        let lock = self
            .locks
            .lock()
            .await
            .entry(list_id.to_string())
            .or_default()
            .clone();

        MailboxGuard {
            _guard: lock.lock_owned().await,
            storage: self.storage.clone(),
            path: mailbox_path(list_id),
        }
    }

    /// Messages of a rotated mailbox, or `None` if it is gone
    pub async fn load(&self, path: &str) -> Result<Option<Vec<Message>>> {
        match self.storage.read(path).await {
            Ok(bytes) => Ok(Some(parse_mmdf(&bytes))),
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Delete a rotated mailbox and its index
    pub async fn remove(&self, path: &str) -> Result<()> {
        for file in [path.to_string(), ids_path(path)] {
            match self.storage.delete(&file).await {
                Ok(()) | Err(Error::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// Scoped access to one live mailbox; the lock is released on drop
pub struct MailboxGuard {
    _guard: OwnedMutexGuard<()>,
    storage: Arc<dyn FileStorage>,
    path: String,
}

impl MailboxGuard {
    /// Append a message unless a copy was already appended
    ///
    /// Returns `false` for a redelivered message.
    pub async fn append(&self, message: &Message) -> Result<bool> {
        let key = message.dedupe_key();
        let ids_path = ids_path(&self.path);

        let seen = match self.storage.read(&ids_path).await {
            Ok(bytes) => String::from_utf8_lossy(&bytes)
                .lines()
                .any(|line| line == key),
            Err(Error::NotFound(_)) => false,
            Err(e) => return Err(e),
        };
        if seen {
            debug!(mailbox = %self.path, key = %key, "Message already in digest");
            return Ok(false);
        }

        let mut record = Vec::with_capacity(message.len() + 2 * MMDF_SEPARATOR.len() + 1);
        record.extend_from_slice(MMDF_SEPARATOR);
        record.extend_from_slice(message.raw());
        if !message.raw().ends_with(b"\n") {
            record.push(b'\n');
        }
        record.extend_from_slice(MMDF_SEPARATOR);

        // Mailbox first: a crash in between costs a duplicate, never a loss
        self.storage.append(&self.path, &record).await?;
        self.storage
            .append(&ids_path, format!("{}\n", key).as_bytes())
            .await?;

        Ok(true)
    }

    /// Size of the live mailbox in bytes; a missing mailbox is empty
    pub async fn size(&self) -> Result<u64> {
        match self.storage.size(&self.path).await {
            Ok(size) => Ok(size),
            Err(Error::NotFound(_)) => Ok(0),
            Err(e) => Err(e),
        }
    }

    /// Hand the live mailbox off under its volume/issue name
    ///
    /// Returns the rotated path, or `None` when there was nothing to rotate.
    pub async fn rotate(&self, list_id: &str, volume: i32, number: i32) -> Result<Option<String>> {
        let target = rotated_path(list_id, volume, number);

        match self.storage.rename(&self.path, &target).await {
            Ok(()) => {}
            Err(Error::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        }

        match self
            .storage
            .rename(&ids_path(&self.path), &ids_path(&target))
            .await
        {
            Ok(()) | Err(Error::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        debug!(from = %self.path, to = %target, "Rotated digest mailbox");

        Ok(Some(target))
    }
}

/// Split an MMDF mailbox into messages, skipping entries that do not parse
pub fn parse_mmdf(bytes: &[u8]) -> Vec<Message> {
    let mut messages = Vec::new();
    let mut current: Vec<u8> = Vec::new();
    let mut inside = false;

    for line in bytes.split_inclusive(|b| *b == b'\n') {
        if line == MMDF_SEPARATOR {
            if inside && !current.is_empty() {
                match Message::from_bytes(std::mem::take(&mut current)) {
                    Ok(message) => messages.push(message),
                    Err(e) => warn!(error = %e, "Skipping unparsable digest entry"),
                }
            }
            current.clear();
            inside = !inside;
        } else if inside {
            current.extend_from_slice(line);
        }
    }

    messages
}
