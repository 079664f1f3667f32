//! Scoped store transaction.
//!
//! A [`Transaction`] owns the store session for the duration of one engine
//! call. It must be finished with [`commit`](Transaction::commit) or
//! [`abort`](Transaction::abort); dropping it while still open (early
//! return, panic, cancelled future) releases the session, which discards
//! every pending write.

use std::fmt::Display;

use bson::{Bson, Document};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::store::{DocumentStore, FindOptions, Predicate, StoreError, StoreResult};

pub struct Transaction<'s, S: DocumentStore> {
    store: &'s S,
    session: Option<S::Session>,
    id: Uuid,
    writes: usize,
}

impl<'s, S: DocumentStore> Transaction<'s, S> {
    pub async fn begin(store: &'s S) -> StoreResult<Transaction<'s, S>> {
        let session = store.begin_transaction().await?;
        let id = Uuid::new_v4();
        debug!(txn = %id, "Transaction started");
        Ok(Transaction {
            store,
            session: Some(session),
            id,
            writes: 0,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Number of write operations issued so far.
    pub fn writes(&self) -> usize {
        self.writes
    }

    fn session(&mut self) -> StoreResult<&mut S::Session> {
        self.session.as_mut().ok_or(StoreError::TransactionClosed)
    }

    pub async fn insert(&mut self, collection: &str, document: Document) -> StoreResult<Bson> {
        let store = self.store;
        self.writes += 1;
        store.insert(collection, document, self.session()?).await
    }

    pub async fn update_one(
        &mut self,
        collection: &str,
        filter: &Predicate,
        set: Document,
    ) -> StoreResult<u64> {
        let store = self.store;
        self.writes += 1;
        store.update_one(collection, filter, set, self.session()?).await
    }

    pub async fn delete_one(&mut self, collection: &str, filter: &Predicate) -> StoreResult<u64> {
        let store = self.store;
        self.writes += 1;
        store.delete_one(collection, filter, self.session()?).await
    }

    pub async fn delete_many(&mut self, collection: &str, filter: &Predicate) -> StoreResult<u64> {
        let store = self.store;
        self.writes += 1;
        store.delete_many(collection, filter, self.session()?).await
    }

    /// Reads through the transaction: sees its own writes and records the
    /// returned documents for conflict detection.
    pub async fn find(&mut self, collection: &str, filter: &Predicate) -> StoreResult<Vec<Document>> {
        let store = self.store;
        store
            .find(collection, filter, &FindOptions::default(), Some(self.session()?))
            .await
    }

    pub async fn commit(mut self) -> StoreResult<()> {
        let mut session = self.session.take().ok_or(StoreError::TransactionClosed)?;
        if let Err(e) = self.store.commit(&mut session).await {
            warn!(txn = %self.id, writes = self.writes, "Commit failed, transaction discarded: {}", e);
            return Err(e);
        }
        debug!(txn = %self.id, writes = self.writes, "Transaction committed");
        Ok(())
    }

    /// Rolls back every write, logging what caused it.
    pub async fn abort(mut self, cause: &dyn Display) {
        warn!(txn = %self.id, writes = self.writes, "Aborting transaction: {}", cause);
        if let Some(mut session) = self.session.take() {
            if let Err(e) = self.store.abort(&mut session).await {
                // The session is released below either way.
                warn!(txn = %self.id, "Abort failed: {}", e);
            }
        }
    }
}

impl<S: DocumentStore> Drop for Transaction<'_, S> {
    fn drop(&mut self) {
        if self.session.is_some() {
            warn!(
                txn = %self.id,
                writes = self.writes,
                "Transaction dropped while open, discarding its writes"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::{Arc, Mutex};

    use bson::doc;
    use tracing_subscriber::fmt::MakeWriter;

    use super::*;
    use crate::store::MemoryStore;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Captured {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Captured {
        type Writer = Captured;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[tokio::test]
    async fn commit_publishes_writes() {
        let store = MemoryStore::new();
        let mut txn = Transaction::begin(&store).await.unwrap();
        txn.insert("subject", doc! { "name": "Physics" }).await.unwrap();
        assert_eq!(txn.writes(), 1);
        assert_eq!(txn.find("subject", &Predicate::all()).await.unwrap().len(), 1);
        txn.commit().await.unwrap();
        assert_eq!(store.count("subject").await, 1);
    }

    #[tokio::test]
    async fn abort_and_drop_discard_writes() {
        let store = MemoryStore::new();

        let mut txn = Transaction::begin(&store).await.unwrap();
        txn.insert("subject", doc! { "name": "Physics" }).await.unwrap();
        txn.abort(&"test").await;

        {
            let mut txn = Transaction::begin(&store).await.unwrap();
            txn.insert("subject", doc! { "name": "Chemistry" }).await.unwrap();
        }

        assert_eq!(store.count("subject").await, 0);
    }

    #[tokio::test]
    async fn failed_commit_is_logged() {
        let logs = Captured::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(logs.clone())
            .with_ansi(false)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let store = MemoryStore::new();
        let mut reader = Transaction::begin(&store).await.unwrap();
        assert!(reader.find("subject", &Predicate::all()).await.unwrap().is_empty());
        let id = reader.id();

        let mut writer = Transaction::begin(&store).await.unwrap();
        writer.insert("subject", doc! { "name": "Physics" }).await.unwrap();
        writer.commit().await.unwrap();

        let err = reader.commit().await.unwrap_err();
        assert!(matches!(err, StoreError::WriteConflict(_)));

        let text = logs.text();
        let line = text
            .lines()
            .find(|line| line.contains("Commit failed"))
            .expect("commit failure logged");
        assert!(line.contains(&id.to_string()));
        assert!(line.contains("WARN"));
        assert!(!text.contains("dropped while open"));
    }
}
