use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bson::oid::ObjectId;
use bson::Document;
use tracing::{info, warn};
use tracing_futures::Instrument;

use crate::cascade::{self, CascadeOutcome, CascadePlan};
use crate::config::Config;
use crate::error::EngineError;
use crate::index::IndexPlan;
use crate::orchestrator::{self, CommitResult, GraphOp};
use crate::pipeline::{run_pipeline, Pipeline};
use crate::report::Report;
use crate::schema::{EntityKind, SchemaRegistry};
use crate::store::DocumentStore;
use crate::txn::Transaction;

pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_CASCADE_DEPTH: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOptions {
    pub operation_timeout: Duration,
    pub max_cascade_depth: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions {
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            max_cascade_depth: DEFAULT_MAX_CASCADE_DEPTH,
        }
    }
}

impl From<&Config> for EngineOptions {
    fn from(config: &Config) -> Self {
        EngineOptions {
            operation_timeout: config.operation_timeout(),
            max_cascade_depth: config.max_cascade_depth,
        }
    }
}

pub struct Engine<S: DocumentStore> {
    store: S,
    registry: Arc<SchemaRegistry>,
    options: EngineOptions,
}

impl<S: DocumentStore> Engine<S> {
    pub fn new(store: S, registry: Arc<SchemaRegistry>) -> Self {
        Engine {
            store,
            registry,
            options: EngineOptions::default(),
        }
    }

    pub fn with_options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    pub fn options(&self) -> EngineOptions {
        self.options
    }

    /// Runs `operation` under the operation timeout. On expiry the future
    /// is dropped, which discards any open transaction.
    async fn bounded<T>(
        &self,
        name: &'static str,
        operation: impl Future<Output = Result<T, EngineError>>,
    ) -> Result<T, EngineError> {
        let timeout = self.options.operation_timeout;
        let span = tracing::debug_span!("operation", name);
        match tokio::time::timeout(timeout, operation.instrument(span)).await {
            Ok(result) => result,
            Err(_) => {
                warn!("{} timed out after {:?}", name, timeout);
                Err(EngineError::TransientStore {
                    reason: format!("{} timed out after {:?}", name, timeout),
                })
            }
        }
    }

    /// Inserts a batch of related entities atomically and returns their
    /// ids in op order.
    #[tracing::instrument(skip_all, fields(ops = ops.len()))]
    pub async fn create_entity_graph(&self, ops: Vec<GraphOp>) -> Result<Vec<ObjectId>, EngineError> {
        Ok(self.run_graph_write(ops).await?.inserted)
    }

    #[tracing::instrument(skip_all, fields(ops = ops.len()))]
    pub async fn run_graph_write(&self, ops: Vec<GraphOp>) -> Result<CommitResult, EngineError> {
        self.bounded(
            "run_graph_write",
            orchestrator::run_graph_write(&self.store, &self.registry, ops),
        )
        .await
    }

    /// Deletes `kind` `id` and everything its cascade edges reach, in one
    /// transaction.
    #[tracing::instrument(skip(self))]
    pub async fn cascade_delete(&self, kind: EntityKind, id: ObjectId) -> Result<CascadeOutcome, EngineError> {
        let outcome = self
            .bounded("cascade_delete", async {
                let mut txn = Transaction::begin(&self.store).await?;
                match self.delete_in(&mut txn, kind, id).await {
                    Ok(outcome) => {
                        txn.commit().await?;
                        Ok(outcome)
                    }
                    Err(e) => {
                        txn.abort(&e).await;
                        Err(e)
                    }
                }
            })
            .await?;
        info!(
            deleted = outcome.deleted_count,
            embedded = outcome.embedded_count,
            "Cascade delete of {} {} committed",
            kind,
            id
        );
        Ok(outcome)
    }

    async fn delete_in(
        &self,
        txn: &mut Transaction<'_, S>,
        kind: EntityKind,
        id: ObjectId,
    ) -> Result<CascadeOutcome, EngineError> {
        let plan = cascade::plan_cascade_delete(&self.registry, txn, kind, id, self.options.max_cascade_depth).await?;
        let deleted_count = cascade::execute(&self.registry, txn, &plan).await?;
        Ok(CascadeOutcome {
            deleted_count,
            embedded_count: plan.embedded,
            plan,
        })
    }

    /// What [`cascade_delete`](Engine::cascade_delete) would remove, without
    /// removing it.
    #[tracing::instrument(skip(self))]
    pub async fn plan_cascade_delete(&self, kind: EntityKind, id: ObjectId) -> Result<CascadePlan, EngineError> {
        self.bounded("plan_cascade_delete", async {
            let mut txn = Transaction::begin(&self.store).await?;
            let planned =
                cascade::plan_cascade_delete(&self.registry, &mut txn, kind, id, self.options.max_cascade_depth).await;
            match planned {
                Ok(plan) => {
                    txn.commit().await?;
                    Ok(plan)
                }
                Err(e) => {
                    txn.abort(&e).await;
                    Err(e)
                }
            }
        })
        .await
    }

    #[tracing::instrument(skip_all, fields(collection = %pipeline.collection))]
    pub async fn run_report(&self, pipeline: &Pipeline) -> Result<Vec<Document>, EngineError> {
        self.bounded("run_report", run_pipeline(&self.store, &self.registry, pipeline))
            .await
    }

    /// Runs a built-in report in the registry's layout.
    pub async fn report(&self, report: Report, user: Option<ObjectId>) -> Result<Vec<Document>, EngineError> {
        let pipeline = report.pipeline(&self.registry, user)?;
        self.run_report(&pipeline).await
    }

    #[tracing::instrument(skip(self))]
    pub async fn apply_index_plan(&self) -> Result<usize, EngineError> {
        let plan = IndexPlan::for_registry(&self.registry)?;
        self.bounded("apply_index_plan", plan.apply(&self.store)).await
    }

    /// Closes the store connection.
    pub async fn shutdown(self) -> Result<(), EngineError> {
        info!("Shutting down engine");
        Ok(self.store.close().await?)
    }
}

#[cfg(test)]
mod tests {
    use bson::doc;

    use super::*;
    use crate::data::op_ref;
    use crate::schema::Layout;
    use crate::store::MemoryStore;

    fn engine() -> Engine<MemoryStore> {
        let registry = SchemaRegistry::for_layout(Layout::Normalized).unwrap();
        Engine::new(MemoryStore::new(), Arc::new(registry))
    }

    #[tokio::test]
    async fn plan_does_not_delete() {
        let engine = engine();
        let ids = engine
            .create_entity_graph(vec![
                GraphOp::insert(
                    EntityKind::User,
                    doc! { "username": "t", "email": "t@example.com", "password": "x", "role": "teacher" },
                ),
                GraphOp::insert(EntityKind::Subject, doc! { "name": "Physics" }),
                GraphOp::insert(
                    EntityKind::Classroom,
                    doc! { "name": "Physics 101", "teacher_id": op_ref(0), "subject_id": op_ref(1) },
                ),
                GraphOp::insert(
                    EntityKind::Section,
                    doc! { "title": "Kinematics", "description": "Motion", "classroom_id": op_ref(2) },
                ),
            ])
            .await
            .unwrap();

        let plan = engine.plan_cascade_delete(EntityKind::Classroom, ids[2]).await.unwrap();
        assert_eq!(plan.targets.len(), 2);
        assert_eq!(engine.store().count("section").await, 1);

        let outcome = engine.cascade_delete(EntityKind::Classroom, ids[2]).await.unwrap();
        assert_eq!(outcome.deleted_count, 2);
        assert_eq!(outcome.plan, plan);
        assert_eq!(engine.store().count("classroom").await, 0);
    }

    #[tokio::test]
    async fn timeout_is_transient() {
        let engine = engine().with_options(EngineOptions {
            operation_timeout: Duration::from_millis(1),
            ..EngineOptions::default()
        });
        let result = engine
            .bounded("sleep", async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(EngineError::TransientStore { .. })));
        assert!(result.unwrap_err().is_retryable());
    }

    #[tokio::test]
    async fn shutdown_closes_store() {
        engine().shutdown().await.unwrap();
    }
}
