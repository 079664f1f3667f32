//! In-process document store.
//!
//! Transactions run against a private copy of the committed data taken at
//! `begin_transaction`. Every document a transaction reads or writes is
//! recorded, as is every filter it queried with; commit fails with
//! [`StoreError::WriteConflict`] when a transaction that committed in the
//! meantime changed one of those documents or wrote a document matching
//! one of those filters.
//! Unique indexes are enforced on every write and again at commit, so two
//! transactions racing for the same unique value cannot both succeed.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bson::oid::ObjectId;
use bson::{Bson, Document};
use tokio::sync::RwLock;

use super::{DocumentStore, FindOptions, IndexSpec, Predicate, StoreError, StoreResult};
use crate::data::value::{set_path, values_at, values_equal};
use crate::pipeline::eval::{compare_by_keys, evaluate, CollectionSource};
use crate::pipeline::Pipeline;

type Key = (String, ObjectId);

#[derive(Debug, Default)]
struct State {
    /// Number of committed transactions.
    clock: u64,
    collections: HashMap<String, Vec<Document>>,
    /// Clock value of the last commit that wrote each document.
    versions: HashMap<Key, u64>,
    indexes: Vec<IndexSpec>,
}

impl CollectionSource for HashMap<String, Vec<Document>> {
    fn documents(&self, collection: &str) -> Vec<Document> {
        self.get(collection).cloned().unwrap_or_default()
    }
}

#[derive(Debug)]
pub struct MemorySession {
    start: u64,
    view: HashMap<String, Vec<Document>>,
    observed: HashSet<Key>,
    /// Filters of reads made through the session.
    scans: Vec<(String, Predicate)>,
    written: Vec<Key>,
    active: bool,
}

impl MemorySession {
    fn ensure_active(&self) -> StoreResult<()> {
        if self.active {
            Ok(())
        } else {
            Err(StoreError::TransactionClosed)
        }
    }

    fn observe(&mut self, collection: &str, doc: &Document) {
        if let Some(id) = object_id(doc) {
            self.observed.insert((collection.to_string(), id));
        }
    }

    fn write(&mut self, collection: &str, id: ObjectId) {
        let key = (collection.to_string(), id);
        if !self.written.contains(&key) {
            self.written.push(key.clone());
        }
        self.observed.insert(key);
    }
}

fn object_id(doc: &Document) -> Option<ObjectId> {
    doc.get_object_id("_id").ok()
}

fn duplicate(index: &IndexSpec, value: &Bson) -> StoreError {
    StoreError::DuplicateKey {
        collection: index.collection.clone(),
        field: index.field.clone(),
        value: match value {
            Bson::String(s) => s.clone(),
            other => other.to_string(),
        },
    }
}

/// Fails when `candidate` shares a unique value with another document.
/// Documents without a value for the field are not indexed.
fn check_unique(
    indexes: &[IndexSpec],
    collection: &str,
    docs: &[Document],
    candidate: &Document,
) -> StoreResult<()> {
    let own_id = candidate.get("_id");
    for index in indexes
        .iter()
        .filter(|i| i.unique && i.collection == collection)
    {
        for value in values_at(candidate, &index.field) {
            if matches!(value, Bson::Null) {
                continue;
            }
            let taken = docs
                .iter()
                .filter(|other| other.get("_id") != own_id)
                .any(|other| {
                    values_at(other, &index.field)
                        .into_iter()
                        .any(|v| values_equal(v, value))
                });
            if taken {
                return Err(duplicate(index, value));
            }
        }
    }
    Ok(())
}

fn sorted_page(mut docs: Vec<Document>, options: &FindOptions) -> Vec<Document> {
    if !options.sort.is_empty() {
        docs.sort_by(|a, b| compare_by_keys(a, b, &options.sort));
    }
    let skip = options.skip.unwrap_or(0) as usize;
    let limit = options.limit.map(|l| l as usize).unwrap_or(usize::MAX);
    docs.into_iter().skip(skip).take(limit).collect()
}

/// Emulated store. Clones share the same data.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    /// Committed documents of a collection in insertion order.
    pub async fn documents(&self, collection: &str) -> Vec<Document> {
        self.state.read().await.collections.documents(collection)
    }

    pub async fn count(&self, collection: &str) -> usize {
        self.state
            .read()
            .await
            .collections
            .get(collection)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub async fn indexes(&self) -> Vec<IndexSpec> {
        self.state.read().await.indexes.clone()
    }

    async fn unique_indexes(&self, collection: &str) -> Vec<IndexSpec> {
        self.state
            .read()
            .await
            .indexes
            .iter()
            .filter(|i| i.unique && i.collection == collection)
            .cloned()
            .collect()
    }
}

impl DocumentStore for MemoryStore {
    type Session = MemorySession;

    async fn begin_transaction(&self) -> StoreResult<MemorySession> {
        tokio::task::yield_now().await;
        let state = self.state.read().await;
        Ok(MemorySession {
            start: state.clock,
            view: state.collections.clone(),
            observed: HashSet::new(),
            scans: Vec::new(),
            written: Vec::new(),
            active: true,
        })
    }

    async fn commit(&self, session: &mut MemorySession) -> StoreResult<()> {
        tokio::task::yield_now().await;
        session.ensure_active()?;
        session.active = false;

        let mut state = self.state.write().await;

        for key in &session.observed {
            if state.versions.get(key).is_some_and(|v| *v > session.start) {
                return Err(StoreError::WriteConflict(format!(
                    "{} {} changed since the transaction started",
                    key.0, key.1
                )));
            }
        }

        let changed_since_start = |collection: &str, doc: &Document| {
            object_id(doc)
                .and_then(|id| state.versions.get(&(collection.to_string(), id)))
                .is_some_and(|v| *v > session.start)
        };
        for (collection, filter) in &session.scans {
            let matcher = filter.compile()?;
            let phantom = state
                .collections
                .get(collection)
                .into_iter()
                .flatten()
                .any(|doc| matcher.matches(doc) && changed_since_start(collection, doc));
            if phantom {
                return Err(StoreError::WriteConflict(format!(
                    "{} gained matching documents since the transaction started",
                    collection
                )));
            }
        }

        let mut staged: HashMap<String, Vec<Document>> = HashMap::new();
        for (collection, id) in &session.written {
            let target = staged
                .entry(collection.clone())
                .or_insert_with(|| state.collections.documents(collection));
            let position = target.iter().position(|d| object_id(d) == Some(*id));
            let latest = session
                .view
                .get(collection)
                .and_then(|docs| docs.iter().find(|d| object_id(d) == Some(*id)));
            match (position, latest) {
                (Some(i), Some(doc)) => target[i] = doc.clone(),
                (None, Some(doc)) => target.push(doc.clone()),
                (Some(i), None) => {
                    target.remove(i);
                }
                (None, None) => {}
            }
        }

        for (collection, id) in &session.written {
            if let Some(docs) = staged.get(collection) {
                if let Some(doc) = docs.iter().find(|d| object_id(d) == Some(*id)) {
                    check_unique(&state.indexes, collection, docs, doc)?;
                }
            }
        }

        state.clock += 1;
        let clock = state.clock;
        for key in session.written.drain(..) {
            state.versions.insert(key, clock);
        }
        state.collections.extend(staged);
        session.view.clear();
        Ok(())
    }

    async fn abort(&self, session: &mut MemorySession) -> StoreResult<()> {
        session.ensure_active()?;
        session.active = false;
        session.view.clear();
        session.scans.clear();
        session.written.clear();
        Ok(())
    }

    async fn insert(
        &self,
        collection: &str,
        mut document: Document,
        session: &mut MemorySession,
    ) -> StoreResult<Bson> {
        tokio::task::yield_now().await;
        session.ensure_active()?;

        let id = match document.get("_id") {
            None => {
                let id = ObjectId::new();
                document.insert("_id", id);
                id
            }
            Some(Bson::ObjectId(id)) => *id,
            Some(other) => {
                return Err(StoreError::Other(format!(
                    "document _id must be an ObjectId, got {}",
                    other
                )))
            }
        };

        let unique = self.unique_indexes(collection).await;
        let docs = session.view.entry(collection.to_string()).or_default();
        if docs.iter().any(|d| object_id(d) == Some(id)) {
            return Err(StoreError::DuplicateKey {
                collection: collection.to_string(),
                field: "_id".to_string(),
                value: id.to_hex(),
            });
        }
        check_unique(&unique, collection, docs, &document)?;
        docs.push(document);
        session.write(collection, id);
        Ok(Bson::ObjectId(id))
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: &Predicate,
        set: Document,
        session: &mut MemorySession,
    ) -> StoreResult<u64> {
        tokio::task::yield_now().await;
        session.ensure_active()?;
        if set.contains_key("_id") {
            return Err(StoreError::Other("_id is immutable".to_string()));
        }

        let matcher = filter.compile()?;
        let unique = self.unique_indexes(collection).await;
        let docs = session.view.entry(collection.to_string()).or_default();
        let Some(position) = docs.iter().position(|d| matcher.matches(d)) else {
            return Ok(0);
        };

        let mut updated = docs[position].clone();
        for (path, value) in set {
            set_path(&mut updated, &path, value);
        }
        check_unique(&unique, collection, docs, &updated)?;
        let id = object_id(&updated);
        docs[position] = updated;
        if let Some(id) = id {
            session.write(collection, id);
        }
        Ok(1)
    }

    async fn delete_one(
        &self,
        collection: &str,
        filter: &Predicate,
        session: &mut MemorySession,
    ) -> StoreResult<u64> {
        tokio::task::yield_now().await;
        session.ensure_active()?;
        let matcher = filter.compile()?;
        let docs = session.view.entry(collection.to_string()).or_default();
        let Some(position) = docs.iter().position(|d| matcher.matches(d)) else {
            return Ok(0);
        };
        let removed = docs.remove(position);
        if let Some(id) = object_id(&removed) {
            session.write(collection, id);
        }
        Ok(1)
    }

    async fn delete_many(
        &self,
        collection: &str,
        filter: &Predicate,
        session: &mut MemorySession,
    ) -> StoreResult<u64> {
        tokio::task::yield_now().await;
        session.ensure_active()?;
        let matcher = filter.compile()?;
        let docs = session.view.entry(collection.to_string()).or_default();
        let (removed, kept): (Vec<_>, Vec<_>) =
            docs.drain(..).partition(|d| matcher.matches(d));
        *docs = kept;
        for doc in &removed {
            if let Some(id) = object_id(doc) {
                session.write(collection, id);
            }
        }
        Ok(removed.len() as u64)
    }

    async fn find(
        &self,
        collection: &str,
        filter: &Predicate,
        options: &FindOptions,
        session: Option<&mut MemorySession>,
    ) -> StoreResult<Vec<Document>> {
        tokio::task::yield_now().await;
        let matcher = filter.compile()?;
        let found = match session {
            Some(session) => {
                session.ensure_active()?;
                let found: Vec<Document> = session
                    .view
                    .documents(collection)
                    .into_iter()
                    .filter(|d| matcher.matches(d))
                    .collect();
                for doc in &found {
                    session.observe(collection, doc);
                }
                session.scans.push((collection.to_string(), filter.clone()));
                found
            }
            None => self
                .state
                .read()
                .await
                .collections
                .get(collection)
                .into_iter()
                .flatten()
                .filter(|d| matcher.matches(d))
                .cloned()
                .collect(),
        };
        Ok(sorted_page(found, options))
    }

    async fn run_aggregate(&self, pipeline: &Pipeline) -> StoreResult<Vec<Document>> {
        tokio::task::yield_now().await;
        let state = self.state.read().await;
        evaluate(pipeline, &state.collections)
    }

    async fn create_index(&self, index: &IndexSpec) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if state.indexes.contains(index) {
            return Ok(());
        }
        if index.unique {
            let docs = state.collections.documents(&index.collection);
            for doc in &docs {
                check_unique(std::slice::from_ref(index), &index.collection, &docs, doc)?;
            }
        }
        state.indexes.push(index.clone());
        Ok(())
    }

    async fn close(self) -> StoreResult<()> {
        Ok(())
    }
}
