//! Digest dispatch
//!
//! Decides when a list's live mailbox becomes a digest issue. Dispatching
//! leaves a trigger on the `digest` queue for the builder, advances the
//! list's counters and rotates the mailbox under the issue's name.

use super::mailbox::{rotated_path, DigestMailboxes};
use super::rollover::bump_digest_number_and_volume;
use crate::message::Message;
use crate::metadata::{keys, MessageData};
use crate::queue::Switchboard;
use chrono::Utc;
use listrust_common::{Error, Result};
use listrust_storage::{DigestState, MailingListStore};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, error, info};

pub struct DigestDispatcher {
    lists: Arc<dyn MailingListStore>,
    mailboxes: Arc<DigestMailboxes>,
    digest_queue: Arc<Switchboard>,
}

impl DigestDispatcher {
    pub fn new(
        lists: Arc<dyn MailingListStore>,
        mailboxes: Arc<DigestMailboxes>,
        digest_queue: Arc<Switchboard>,
    ) -> Self {
        Self {
            lists,
            mailboxes,
            digest_queue,
        }
    }

    /// Dispatch digests that are due
    ///
    /// With a list id only that list is considered and its errors are
    /// returned; without one every list is checked and a failing list is
    /// logged and skipped. Returns the number of digests dispatched.
    pub async fn maybe_send_digest_now(&self, list_id: Option<&str>, force: bool) -> Result<usize> {
        match list_id {
            Some(list_id) => Ok(self.dispatch(list_id, force).await? as usize),
            None => {
                let ids: Vec<String> = self
                    .lists
                    .all()
                    .await?
                    .into_iter()
                    .map(|list| list.list_id)
                    .collect();
                Ok(self.dispatch_each(ids, force).await)
            }
        }
    }

    /// Forced dispatch for every list with periodic digests turned on
    pub async fn send_periodic_digests(&self) -> Result<usize> {
        let ids: Vec<String> = self
            .lists
            .all()
            .await?
            .into_iter()
            .filter(|list| list.digests_enabled && list.digest_send_periodic)
            .map(|list| list.list_id)
            .collect();

        let sent = self.dispatch_each(ids, true).await;
        if sent > 0 {
            info!(sent, "Periodic digests dispatched");
        }
        Ok(sent)
    }

    async fn dispatch_each(&self, ids: Vec<String>, force: bool) -> usize {
        let mut sent = 0;

        for list_id in ids {
            match self.dispatch(&list_id, force).await {
                Ok(true) => sent += 1,
                Ok(false) => {}
                Err(e @ Error::FatalConfiguration(_)) => {
                    error!(list_id = %list_id, error = %e, "Invariant violation: digest dispatch aborted");
                }
                Err(e) => {
                    error!(list_id = %list_id, error = %e, "Digest dispatch failed");
                }
            }
        }

        sent
    }

    /// Dispatch one list if its mailbox is due; returns whether it was
    async fn dispatch(&self, list_id: &str, force: bool) -> Result<bool> {
        let mailbox = self.mailboxes.lock(list_id).await;

        // Counters are read under the mailbox lock so concurrent dispatches
        // of one list see each other's updates
        let mut list = self
            .lists
            .get(list_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("mailing list {}", list_id)))?;

        let size = mailbox.size().await?;
        let threshold = list.digest_size_threshold_bytes();
        if size == 0 || !(force || size >= threshold) {
            debug!(list_id, size, threshold, force, "Digest not due");
            return Ok(false);
        }

        let (volume, number) = (list.volume, list.next_digest_number);
        bump_digest_number_and_volume(&mut list, Utc::now())?;

        // The trigger goes first: until it is durable nothing has moved, and
        // the builder waits on this lock before it reads the rotated file
        let digest_path = rotated_path(list_id, volume, number);
        let mut extras = Map::new();
        extras.insert(keys::DIGEST_PATH.to_string(), Value::from(digest_path.clone()));
        extras.insert(keys::VOLUME.to_string(), Value::from(volume));
        extras.insert(keys::DIGEST_NUMBER.to_string(), Value::from(number));

        self.digest_queue
            .enqueue(&Message::empty(), MessageData::for_list(list_id), extras)
            .await?;

        self.lists
            .save_digest_state(list_id, DigestState::from(&list))
            .await?;

        if mailbox.rotate(list_id, volume, number).await?.is_none() {
            return Ok(false);
        }
        drop(mailbox);

        info!(list_id, volume, number, digest_path = %digest_path, size, "Digest dispatched");

        Ok(true)
    }
}
