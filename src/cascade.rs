use std::collections::{BTreeMap, HashSet};

use bson::oid::ObjectId;
use bson::Document;
use serde::Serialize;
use tracing::debug;

use crate::data::value::subdocuments;
use crate::error::{EngineError, FieldProblem, ProblemReason};
use crate::orchestrator::PreparedOp;
use crate::schema::{EntityKind, RegistryError, SchemaRegistry};
use crate::store::{DocumentStore, Predicate};
use crate::txn::Transaction;
use crate::validator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct CascadeTarget {
    pub kind: EntityKind,
    pub id: ObjectId,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CascadePlan {
    /// Deepest dependents first, the root last.
    pub targets: Vec<CascadeTarget>,
    /// Embedded sub-entities removed together with their documents.
    pub embedded: usize,
}

impl CascadePlan {
    pub fn root(&self) -> Option<&CascadeTarget> {
        self.targets.last()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CascadeOutcome {
    pub deleted_count: u64,
    pub embedded_count: usize,
    pub plan: CascadePlan,
}

fn count_embedded(
    registry: &SchemaRegistry,
    kind: EntityKind,
    document: &Document,
) -> Result<usize, RegistryError> {
    let mut count = 0;
    for (def, location) in registry.document_entities(kind)? {
        if def.kind != kind {
            count += subdocuments(document, location.prefix.trim_end_matches('.')).len();
        }
    }
    Ok(count)
}

/// Collects everything deleting `kind` `id` takes with it, reading
/// through `txn`.
///
/// Walks cascade edges level by level with one lookup per dependent edge
/// and level. More than `max_depth` levels below the root is a schema
/// error.
pub async fn plan_cascade_delete<S: DocumentStore>(
    registry: &SchemaRegistry,
    txn: &mut Transaction<'_, S>,
    kind: EntityKind,
    id: ObjectId,
    max_depth: usize,
) -> Result<CascadePlan, EngineError> {
    if !registry.entity(kind)?.is_root() {
        let root = registry.root_of(kind)?;
        return Err(EngineError::validation(FieldProblem::new(
            None,
            Some(kind),
            "_id",
            ProblemReason::EmbeddedWrite { root },
        )));
    }

    let location = registry.location(kind)?;
    let roots = txn.find(location.collection, &Predicate::by_id(id)).await?;
    let Some(root) = roots.first() else {
        return Err(EngineError::not_found(kind, id));
    };
    let mut embedded = count_embedded(registry, kind, root)?;

    let mut seen = HashSet::from([(kind, id)]);
    let mut levels: Vec<Vec<CascadeTarget>> = Vec::new();
    let mut frontier = BTreeMap::from([(kind, vec![id])]);

    loop {
        let mut next: BTreeMap<EntityKind, Vec<ObjectId>> = BTreeMap::new();
        for (parent, ids) in &frontier {
            for dependent in registry.dependents_of(*parent).iter().filter(|d| d.edge.cascade) {
                let source = registry.location(dependent.source)?;
                let filter = Predicate::is_in(source.path(dependent.edge.foreign_key), ids.iter().copied());
                for document in txn.find(source.collection, &filter).await? {
                    let Ok(child) = document.get_object_id("_id") else {
                        continue;
                    };
                    if seen.insert((dependent.source, child)) {
                        embedded += count_embedded(registry, dependent.source, &document)?;
                        next.entry(dependent.source).or_default().push(child);
                    }
                }
            }
        }
        if next.is_empty() {
            break;
        }

        levels.push(
            next.iter()
                .flat_map(|(kind, ids)| ids.iter().map(|id| CascadeTarget { kind: *kind, id: *id }))
                .collect(),
        );
        if levels.len() > max_depth {
            return Err(RegistryError::CascadeDepthExceeded {
                root: kind,
                depth: max_depth,
            }
            .into());
        }
        frontier = next;
    }

    let mut targets: Vec<CascadeTarget> = levels.into_iter().rev().flatten().collect();
    targets.push(CascadeTarget { kind, id });
    debug!(txn = %txn.id(), root = %kind, targets = targets.len(), embedded, "Planned cascade");

    Ok(CascadePlan { targets, embedded })
}

/// Deletes every target of `plan` and checks nothing still points at
/// them. Returns the number of deleted documents.
pub async fn execute<S: DocumentStore>(
    registry: &SchemaRegistry,
    txn: &mut Transaction<'_, S>,
    plan: &CascadePlan,
) -> Result<u64, EngineError> {
    let mut deleted = 0;
    for run in plan.targets.chunk_by(|a, b| a.kind == b.kind) {
        let kind = run[0].kind;
        let collection = registry.location(kind)?.collection;
        let filter = Predicate::is_in("_id", run.iter().map(|t| t.id));
        deleted += txn.delete_many(collection, &filter).await?;
    }

    let ops: Vec<PreparedOp> = plan
        .targets
        .iter()
        .map(|t| PreparedOp::delete(t.kind, t.id))
        .collect();
    validator::validate(registry, txn, &ops).await?;
    Ok(deleted)
}
