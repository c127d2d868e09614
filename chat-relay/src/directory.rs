use std::{collections::BTreeMap, io, sync::Arc};

use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::{Mutex, MutexGuard},
};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, info};

use crate::envelope::{Envelope, write_envelope};

/// Outbound half of one connection.
///
/// Clones share the same writer and the same retirement signal. Once a sink is
/// retired nothing more is written to it, and the owning session treats the
/// signal as a request to terminate.
pub struct Sink<W> {
    writer: Arc<Mutex<W>>,
    retired: CancellationToken,
}

impl<W> Clone for Sink<W> {
    fn clone(&self) -> Self {
        Self {
            writer: Arc::clone(&self.writer),
            retired: self.retired.clone(),
        }
    }
}

impl<W> Sink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(writer: W) -> Self {
        Self {
            writer: Arc::new(Mutex::new(writer)),
            retired: CancellationToken::new(),
        }
    }

    /// Writes one envelope. Writes to a retired sink are silently skipped.
    pub async fn send(&self, envelope: &Envelope) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        if self.retired.is_cancelled() {
            return Ok(());
        }
        write_envelope(&mut *writer, envelope).await
    }

    /// Exclusive access to the writer, used to order the registration reply
    /// ahead of any broadcast aimed at a freshly inserted entry.
    pub(crate) async fn lock(&self) -> MutexGuard<'_, W> {
        self.writer.lock().await
    }

    pub fn retire(&self) {
        self.retired.cancel();
    }

    pub(crate) fn is_retired(&self) -> bool {
        self.retired.is_cancelled()
    }

    /// Resolves once the sink has been retired, by its own session or by a
    /// broadcaster that failed to write to it.
    pub fn retired(&self) -> WaitForCancellationFuture<'_> {
        self.retired.cancelled()
    }

    /// Retires the sink and shuts the underlying writer down.
    pub async fn close(&self) -> io::Result<()> {
        self.retire();
        let mut writer = self.writer.lock().await;
        writer.shutdown().await
    }

    fn same(&self, other: &Sink<W>) -> bool {
        Arc::ptr_eq(&self.writer, &other.writer)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegisterError {
    #[error("username '{0}' is already in use")]
    UsernameTaken(String),
}

/// Registry of connected users, shared by every session.
///
/// The map lock is only held while inserting, removing or taking a snapshot;
/// network writes always happen after it has been released.
pub struct Directory<W> {
    entries: Mutex<BTreeMap<String, Sink<W>>>,
    drained: CancellationToken,
}

impl<W> Default for Directory<W> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            drained: CancellationToken::new(),
        }
    }
}

impl<W> Directory<W>
where
    W: AsyncWrite + Unpin + Send,
{
    /// Inserts `username -> sink` and returns the roster including the new entry.
    pub async fn register(
        &self,
        username: &str,
        sink: &Sink<W>,
    ) -> Result<Vec<String>, RegisterError> {
        let mut entries = self.entries.lock().await;
        if entries.contains_key(username) {
            return Err(RegisterError::UsernameTaken(username.to_string()));
        }

        entries.insert(username.to_string(), sink.clone());
        Ok(entries.keys().cloned().collect())
    }

    /// Removes `username` if it is still bound to `sink`, returning the
    /// remaining roster. A name that has since been claimed by another
    /// connection is left alone.
    pub async fn remove(&self, username: &str, sink: &Sink<W>) -> Option<Vec<String>> {
        let mut entries = self.entries.lock().await;
        match entries.get(username) {
            Some(current) if current.same(sink) => {}
            _ => return None,
        }
        entries.remove(username);

        let remaining: Vec<String> = entries.keys().cloned().collect();
        if remaining.is_empty() {
            self.drained.cancel();
        }
        Some(remaining)
    }

    #[cfg(test)]
    pub(crate) async fn contains(&self, username: &str) -> bool {
        self.entries.lock().await.contains_key(username)
    }

    pub async fn usernames(&self) -> Vec<String> {
        self.entries.lock().await.keys().cloned().collect()
    }

    #[cfg(test)]
    pub(crate) async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Resolves once a removal has left the directory empty.
    pub fn drained(&self) -> WaitForCancellationFuture<'_> {
        self.drained.cancelled()
    }

    /// Writes `envelope` to every registered sink, skipping `sender` unless
    /// `include_self` is set. Recipients are served in no particular order.
    pub async fn broadcast(&self, sender: &str, include_self: bool, envelope: &Envelope) {
        let recipients: Vec<(String, Sink<W>)> = {
            let entries = self.entries.lock().await;
            entries
                .iter()
                .filter(|(username, _)| include_self || username.as_str() != sender)
                .map(|(username, sink)| (username.clone(), sink.clone()))
                .collect()
        };

        for (username, sink) in recipients {
            self.deliver(&username, &sink, envelope).await;
        }
    }

    /// Writes `envelope` to the sink registered for `username` only.
    /// Returns false when no such user is connected or the write failed.
    pub async fn send_to(&self, username: &str, envelope: &Envelope) -> bool {
        let sink = self.entries.lock().await.get(username).cloned();
        match sink {
            Some(sink) => self.deliver(username, &sink, envelope).await,
            None => false,
        }
    }

    async fn deliver(&self, username: &str, sink: &Sink<W>, envelope: &Envelope) -> bool {
        match sink.send(envelope).await {
            Ok(()) => true,
            Err(error) => {
                debug!(%username, ?error, "failed to deliver envelope");
                self.evict(username, sink).await;
                false
            }
        }
    }

    /// Drops a recipient whose sink is broken and tells its session to stop.
    async fn evict(&self, username: &str, sink: &Sink<W>) {
        if self.remove(username, sink).await.is_some() {
            info!(%username, "evicted unreachable client");
        }
        sink.retire();
    }
}
