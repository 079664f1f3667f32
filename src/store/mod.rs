use std::fmt::{Display, Formatter};

use bson::{Bson, Document};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod filter;
pub mod memory;
pub mod mongo;

pub use filter::Predicate;
pub use memory::MemoryStore;
pub use mongo::MongoStore;

use crate::pipeline::Pipeline;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    /// Another writer touched the same documents first.
    #[error("write conflict: {0}")]
    WriteConflict(String),

    #[error("duplicate value {value} for unique key {collection}.{field}")]
    DuplicateKey {
        collection: String,
        field: String,
        value: String,
    },

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("invalid pipeline: {0}")]
    InvalidPipeline(String),

    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    #[error("transaction is no longer active")]
    TransactionClosed,

    #[error("store error: {0}")]
    Other(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Asc,
    Desc,
}

impl Direction {
    pub fn as_i32(self) -> i32 {
        match self {
            Direction::Asc => 1,
            Direction::Desc => -1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SortKey {
    pub field: String,
    pub direction: Direction,
}

impl SortKey {
    pub fn asc(field: impl Into<String>) -> SortKey {
        SortKey {
            field: field.into(),
            direction: Direction::Asc,
        }
    }

    pub fn desc(field: impl Into<String>) -> SortKey {
        SortKey {
            field: field.into(),
            direction: Direction::Desc,
        }
    }
}

/// Renders sort keys, with an ascending `_id` appended unless a key
/// already sorts on it. The server's `$sort` does not keep ties in input
/// order.
pub(crate) fn sort_document(keys: &[SortKey]) -> Document {
    let mut sort: Document = keys
        .iter()
        .map(|k| (k.field.clone(), Bson::Int32(k.direction.as_i32())))
        .collect();
    if !sort.contains_key("_id") {
        sort.insert("_id", Bson::Int32(Direction::Asc.as_i32()));
    }
    sort
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    pub sort: Vec<SortKey>,
    pub skip: Option<u64>,
    pub limit: Option<u64>,
}

impl FindOptions {
    pub fn sorted(mut self, key: SortKey) -> Self {
        self.sort.push(key);
        self
    }

    pub fn skip(mut self, skip: u64) -> Self {
        self.skip = Some(skip);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Single-field index on a collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IndexSpec {
    pub collection: String,
    pub field: String,
    pub unique: bool,
}

impl IndexSpec {
    /// Server-style default name.
    pub fn name(&self) -> String {
        format!("{}_1", self.field)
    }
}

impl Display for IndexSpec {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.collection, self.field)?;
        if self.unique {
            write!(f, " (unique)")?;
        }
        Ok(())
    }
}

/// Store operations used by the engine.
///
/// Writes always go through a session that was opened with
/// [`begin_transaction`](DocumentStore::begin_transaction). Dropping a
/// session without committing it must discard its writes.
#[allow(async_fn_in_trait)]
pub trait DocumentStore {
    type Session;

    async fn begin_transaction(&self) -> StoreResult<Self::Session>;

    async fn commit(&self, session: &mut Self::Session) -> StoreResult<()>;

    async fn abort(&self, session: &mut Self::Session) -> StoreResult<()>;

    /// Inserts a document and returns its `_id`, generating one when the
    /// document has none.
    async fn insert(
        &self,
        collection: &str,
        document: Document,
        session: &mut Self::Session,
    ) -> StoreResult<Bson>;

    /// Applies `set` to the first matching document. Returns the number
    /// of matched documents.
    async fn update_one(
        &self,
        collection: &str,
        filter: &Predicate,
        set: Document,
        session: &mut Self::Session,
    ) -> StoreResult<u64>;

    async fn delete_one(
        &self,
        collection: &str,
        filter: &Predicate,
        session: &mut Self::Session,
    ) -> StoreResult<u64>;

    async fn delete_many(
        &self,
        collection: &str,
        filter: &Predicate,
        session: &mut Self::Session,
    ) -> StoreResult<u64>;

    /// Reads committed data, or the transaction's view of it when a
    /// session is given.
    async fn find(
        &self,
        collection: &str,
        filter: &Predicate,
        options: &FindOptions,
        session: Option<&mut Self::Session>,
    ) -> StoreResult<Vec<Document>>;

    async fn run_aggregate(&self, pipeline: &Pipeline) -> StoreResult<Vec<Document>>;

    async fn create_index(&self, index: &IndexSpec) -> StoreResult<()>;

    /// Releases connections. The store must not be used afterwards.
    async fn close(self) -> StoreResult<()>
    where
        Self: Sized;
}
