//! Ordered message list with optimistic records and their reconciliation.

use std::collections::{HashMap, HashSet};

use shared::{domain::MessageStatus, protocol::Message};
use tracing::{debug, warn};

/// How an inbound message was folded into the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ingested {
    Appended,
    /// It confirmed one of our own pending sends, replaced in place.
    Confirmed,
    Duplicate,
}

#[derive(Debug, Default)]
pub struct MessageLedger {
    messages: Vec<Message>,
    /// client id -> server id, for confirmed sends still in `messages`.
    confirmed: HashMap<String, String>,
}

impl MessageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        self.messages.iter().find(|message| message.id == id)
    }

    pub fn pending_count(&self) -> usize {
        self.messages.iter().filter(|message| message.is_pending()).count()
    }

    /// Appends a locally created message as `Sending`. The message keeps the
    /// client id as its id until the server assigns one.
    pub fn record_optimistic(&mut self, client_id: impl Into<String>, mut message: Message) -> &Message {
        let client_id = client_id.into();
        if message.id.is_empty() {
            message.id = client_id.clone();
        }
        message.client_id = Some(client_id);
        message.status = MessageStatus::Sending;
        let index = self.messages.len();
        self.messages.push(message);
        &self.messages[index]
    }

    /// Replaces the pending record for `client_id` with the server's record,
    /// at the same position. A separate copy of the server record that arrived
    /// earlier (a broadcast echo) is removed.
    pub fn confirm(&mut self, client_id: &str, mut server: Message) -> Option<&Message> {
        let Some(mut index) = self.pending_index(client_id) else {
            if self.confirmed.contains_key(client_id) {
                debug!(client_id, "confirmation already applied");
            } else {
                warn!(client_id, id = %server.id, "dropping confirmation for unknown client id");
            }
            return None;
        };

        if let Some(echo) = self
            .messages
            .iter()
            .position(|message| !message.is_pending() && message.id == server.id)
        {
            self.messages.remove(echo);
            if echo < index {
                index -= 1;
            }
        }

        server.client_id = None;
        self.confirmed
            .insert(client_id.to_string(), server.id.clone());
        self.messages[index] = server;
        Some(&self.messages[index])
    }

    /// Folds a server-pushed message into the list, confirming a pending send
    /// when it carries our client id and skipping ids already present.
    pub fn ingest(&mut self, message: Message) -> Ingested {
        if let Some(client_id) = message.client_id.clone() {
            if self.pending_index(&client_id).is_some() {
                self.confirm(&client_id, message);
                return Ingested::Confirmed;
            }
            if self.confirmed.contains_key(&client_id) {
                debug!(%client_id, "echo of a confirmed send");
                return Ingested::Duplicate;
            }
        }

        if self
            .messages
            .iter()
            .any(|existing| !existing.is_pending() && existing.id == message.id)
        {
            debug!(id = %message.id, "duplicate message ignored");
            return Ingested::Duplicate;
        }

        let mut message = message;
        message.client_id = None;
        self.messages.push(message);
        Ingested::Appended
    }

    /// Applies a status to the message with the given authoritative id.
    /// Frames for ids that are not (yet) confirmed are dropped.
    pub fn update_status(&mut self, id: &str, status: MessageStatus) -> Option<&Message> {
        let Some(message) = self
            .messages
            .iter_mut()
            .find(|message| !message.is_pending() && message.id == id)
        else {
            warn!(id, ?status, "dropping status for unknown message id");
            return None;
        };
        message.status = status;
        Some(&*message)
    }

    pub fn mark_failed(&mut self, client_id: &str) -> Option<&Message> {
        let index = self.pending_index(client_id)?;
        let message = &mut self.messages[index];
        message.status = MessageStatus::Error;
        Some(&*message)
    }

    /// Moves a failed pending message back to `Sending` for another delivery
    /// attempt. Returns a copy of the record to re-send.
    pub fn mark_resending(&mut self, client_id: &str) -> Option<Message> {
        let index = self.pending_index(client_id)?;
        let message = &mut self.messages[index];
        if message.status != MessageStatus::Error {
            return None;
        }
        message.status = MessageStatus::Sending;
        Some(message.clone())
    }

    /// Removes a message by authoritative id or by client id.
    pub fn remove(&mut self, id: &str) -> Option<Message> {
        let index = self.messages.iter().position(|message| {
            message.id == id || message.client_id.as_deref() == Some(id)
        })?;
        let removed = self.messages.remove(index);
        self.confirmed.retain(|_, server_id| *server_id != removed.id);
        Some(removed)
    }

    /// Installs a freshly loaded history (oldest first). Messages already in
    /// the list that the history does not cover, such as pending sends, stay
    /// after it in their current order.
    pub fn replace_history(&mut self, history: Vec<Message>) {
        let history = self.settle(history);
        let ids: HashSet<String> = history.iter().map(|message| message.id.clone()).collect();
        let retained: Vec<Message> = self
            .messages
            .drain(..)
            .filter(|message| message.is_pending() || !ids.contains(&message.id))
            .collect();
        let mut messages = history;
        messages.extend(retained);
        self.messages = messages;
    }

    /// Puts an older page (oldest first) in front of the list, skipping ids
    /// that are already present. Returns how many messages were added.
    pub fn prepend_history(&mut self, older: Vec<Message>) -> usize {
        let older = self.settle(older);
        let known: HashSet<String> = self
            .messages
            .iter()
            .map(|message| message.id.clone())
            .collect();
        let mut fresh: Vec<Message> = older
            .into_iter()
            .filter(|message| !known.contains(&message.id))
            .collect();
        let added = fresh.len();
        fresh.append(&mut self.messages);
        self.messages = fresh;
        added
    }

    /// Cursor for paging older history.
    pub fn oldest_confirmed_id(&self) -> Option<&str> {
        self.messages
            .iter()
            .find(|message| !message.is_pending())
            .map(|message| message.id.as_str())
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.confirmed.clear();
    }

    /// Strips client ids from server records. A pending send named by one of
    /// them is dropped; the server record takes its place.
    fn settle(&mut self, records: Vec<Message>) -> Vec<Message> {
        records
            .into_iter()
            .map(|mut message| {
                if let Some(client_id) = message.client_id.take() {
                    if let Some(index) = self.pending_index(&client_id) {
                        debug!(%client_id, id = %message.id, "history confirms a pending send");
                        self.messages.remove(index);
                    }
                    self.confirmed.insert(client_id, message.id.clone());
                }
                message
            })
            .collect()
    }

    fn pending_index(&self, client_id: &str) -> Option<usize> {
        self.messages
            .iter()
            .position(|message| message.client_id.as_deref() == Some(client_id))
    }
}

#[cfg(test)]
#[path = "tests/ledger_tests.rs"]
mod tests;
