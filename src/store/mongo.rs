use bson::{doc, Bson, Document};
use futures::TryStreamExt;
use mongodb::error::{ErrorKind, WriteFailure, TRANSIENT_TRANSACTION_ERROR, UNKNOWN_TRANSACTION_COMMIT_RESULT};
use mongodb::options::{Acknowledgment, IndexOptions, ReadConcern, TransactionOptions, WriteConcern};
use mongodb::{Client, ClientSession, Collection, Database, IndexModel};
use regex::Regex;

use super::{sort_document, DocumentStore, FindOptions, IndexSpec, Predicate, StoreError, StoreResult};
use crate::pipeline::Pipeline;

const DUPLICATE_KEY: i32 = 11000;
const WRITE_CONFLICT: i32 = 112;
const COMMIT_ATTEMPTS: usize = 3;

lazy_static! {
    static ref DUP_KEY_MESSAGE: Regex =
        Regex::new(r#"collection: \S+\.(\S+) index: (\S+?)_-?1 dup key: \{ [^:]+: "?([^"}]*?)"? \}"#)
            .expect("valid duplicate key pattern");
}

fn duplicate_key(message: &str) -> StoreError {
    match DUP_KEY_MESSAGE.captures(message) {
        Some(c) => StoreError::DuplicateKey {
            collection: c[1].to_string(),
            field: c[2].to_string(),
            value: c[3].to_string(),
        },
        None => StoreError::DuplicateKey {
            collection: String::new(),
            field: String::new(),
            value: message.to_string(),
        },
    }
}

impl From<mongodb::error::Error> for StoreError {
    fn from(e: mongodb::error::Error) -> Self {
        if e.contains_label(TRANSIENT_TRANSACTION_ERROR) {
            return StoreError::WriteConflict(e.to_string());
        }

        match e.kind.as_ref() {
            ErrorKind::Write(WriteFailure::WriteError(w)) if w.code == DUPLICATE_KEY => {
                duplicate_key(&w.message)
            }
            ErrorKind::Command(c) if c.code == DUPLICATE_KEY => duplicate_key(&c.message),
            ErrorKind::Command(c) if c.code == WRITE_CONFLICT => {
                StoreError::WriteConflict(c.message.clone())
            }
            ErrorKind::Command(c) if c.code_name.starts_with("Location") => {
                StoreError::InvalidPipeline(c.message.clone())
            }
            ErrorKind::Io(_)
            | ErrorKind::ServerSelection { .. }
            | ErrorKind::ConnectionPoolCleared { .. }
            | ErrorKind::DnsResolve { .. }
            | ErrorKind::Authentication { .. } => StoreError::Unavailable(e.to_string()),
            ErrorKind::Transaction { .. } => StoreError::TransactionClosed,
            _ => StoreError::Other(e.to_string()),
        }
    }
}

pub struct MongoSession {
    session: ClientSession,
}

/// Connection to one database. Transactions need a replica set or a
/// sharded cluster.
pub struct MongoStore {
    client: Client,
    db: Database,
}

impl MongoStore {
    pub async fn connect(uri: &str, database: &str) -> StoreResult<MongoStore> {
        let client = Client::with_uri_str(uri).await?;
        let db = client.database(database);

        // Fail early when the deployment can't be reached.
        db.run_command(doc! { "ping": 1 }, None).await?;

        Ok(MongoStore { client, db })
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    fn collection(&self, name: &str) -> Collection<Document> {
        self.db.collection(name)
    }
}

fn find_options(options: &FindOptions) -> mongodb::options::FindOptions {
    mongodb::options::FindOptions::builder()
        .sort((!options.sort.is_empty()).then(|| sort_document(&options.sort)))
        .skip(options.skip)
        .limit(options.limit.map(|l| l as i64))
        .build()
}

impl DocumentStore for MongoStore {
    type Session = MongoSession;

    async fn begin_transaction(&self) -> StoreResult<MongoSession> {
        let mut session = self.client.start_session(None).await?;
        let options = TransactionOptions::builder()
            .read_concern(ReadConcern::snapshot())
            .write_concern(WriteConcern::builder().w(Acknowledgment::Majority).build())
            .build();
        session.start_transaction(options).await?;
        Ok(MongoSession { session })
    }

    async fn commit(&self, session: &mut MongoSession) -> StoreResult<()> {
        let mut attempt = 1;
        loop {
            match session.session.commit_transaction().await {
                Ok(()) => return Ok(()),
                Err(e)
                    if e.contains_label(UNKNOWN_TRANSACTION_COMMIT_RESULT)
                        && attempt < COMMIT_ATTEMPTS =>
                {
                    tracing::debug!("Commit result unknown, retrying: {}", e);
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn abort(&self, session: &mut MongoSession) -> StoreResult<()> {
        Ok(session.session.abort_transaction().await?)
    }

    async fn insert(
        &self,
        collection: &str,
        document: Document,
        session: &mut MongoSession,
    ) -> StoreResult<Bson> {
        let result = self
            .collection(collection)
            .insert_one_with_session(document, None, &mut session.session)
            .await?;
        Ok(result.inserted_id)
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: &Predicate,
        set: Document,
        session: &mut MongoSession,
    ) -> StoreResult<u64> {
        let result = self
            .collection(collection)
            .update_one_with_session(
                filter.to_document(),
                doc! { "$set": set },
                None,
                &mut session.session,
            )
            .await?;
        Ok(result.matched_count)
    }

    async fn delete_one(
        &self,
        collection: &str,
        filter: &Predicate,
        session: &mut MongoSession,
    ) -> StoreResult<u64> {
        let result = self
            .collection(collection)
            .delete_one_with_session(filter.to_document(), None, &mut session.session)
            .await?;
        Ok(result.deleted_count)
    }

    async fn delete_many(
        &self,
        collection: &str,
        filter: &Predicate,
        session: &mut MongoSession,
    ) -> StoreResult<u64> {
        let result = self
            .collection(collection)
            .delete_many_with_session(filter.to_document(), None, &mut session.session)
            .await?;
        Ok(result.deleted_count)
    }

    async fn find(
        &self,
        collection: &str,
        filter: &Predicate,
        options: &FindOptions,
        session: Option<&mut MongoSession>,
    ) -> StoreResult<Vec<Document>> {
        let coll = self.collection(collection);
        let options = find_options(options);
        match session {
            Some(s) => {
                let mut cursor = coll
                    .find_with_session(filter.to_document(), options, &mut s.session)
                    .await?;
                Ok(cursor.stream(&mut s.session).try_collect().await?)
            }
            None => Ok(coll
                .find(filter.to_document(), options)
                .await?
                .try_collect()
                .await?),
        }
    }

    async fn run_aggregate(&self, pipeline: &Pipeline) -> StoreResult<Vec<Document>> {
        Ok(self
            .collection(&pipeline.collection)
            .aggregate(pipeline.to_documents(), None)
            .await?
            .try_collect()
            .await?)
    }

    async fn create_index(&self, index: &IndexSpec) -> StoreResult<()> {
        let model = IndexModel::builder()
            .keys(doc! { index.field.as_str(): 1 })
            .options(
                IndexOptions::builder()
                    .name(index.name())
                    .unique(index.unique)
                    .build(),
            )
            .build();
        self.collection(&index.collection)
            .create_index(model, None)
            .await?;
        Ok(())
    }

    async fn close(self) -> StoreResult<()> {
        self.client.shutdown().await;
        Ok(())
    }
}
