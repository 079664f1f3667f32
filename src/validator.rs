use std::collections::{BTreeMap, HashMap, HashSet};

use bson::oid::ObjectId;
use tracing::debug;

use crate::data::ids_at;
use crate::error::{EngineError, FieldProblem, ProblemReason};
use crate::orchestrator::{Action, PreparedOp};
use crate::schema::{EntityKind, SchemaRegistry};
use crate::store::{DocumentStore, Predicate};
use crate::txn::Transaction;

struct Reference {
    op: Option<usize>,
    entity: EntityKind,
    path: String,
    target: EntityKind,
    id: ObjectId,
}

/// Validates the effect of `ops` as seen by `txn`.
///
/// Inserted and updated documents must only reference existing records.
/// Deleted records must not be referenced by any surviving record.
pub(crate) async fn validate<S: DocumentStore>(
    registry: &SchemaRegistry,
    txn: &mut Transaction<'_, S>,
    ops: &[PreparedOp],
) -> Result<(), EngineError> {
    let mut problems = check_references(registry, txn, ops).await?;
    problems.extend(check_dependents(registry, txn, ops).await?);

    if problems.is_empty() {
        debug!(txn = %txn.id(), ops = ops.len(), "Batch is consistent");
        Ok(())
    } else {
        Err(EngineError::Validation(problems))
    }
}

async fn check_references<S: DocumentStore>(
    registry: &SchemaRegistry,
    txn: &mut Transaction<'_, S>,
    ops: &[PreparedOp],
) -> Result<Vec<FieldProblem>, EngineError> {
    let mut references = Vec::new();
    for op in ops {
        let document = match &op.action {
            Action::Insert(document) | Action::Update(document) => document,
            Action::Delete => continue,
        };
        for (def, location) in registry.document_entities(op.entity)? {
            for edge in &def.edges {
                let path = location.path(edge.foreign_key);
                for id in ids_at(document, &path) {
                    references.push(Reference {
                        op: op.index,
                        entity: def.kind,
                        path: path.clone(),
                        target: edge.target,
                        id,
                    });
                }
            }
        }
    }

    let mut wanted: BTreeMap<EntityKind, Vec<ObjectId>> = BTreeMap::new();
    for reference in &references {
        let ids = wanted.entry(reference.target).or_default();
        if !ids.contains(&reference.id) {
            ids.push(reference.id);
        }
    }

    let mut found: HashMap<EntityKind, HashSet<ObjectId>> = HashMap::new();
    for (target, ids) in wanted {
        let location = registry.location(target)?;
        let id_path = location.path("_id");
        let documents = txn
            .find(location.collection, &Predicate::is_in(id_path.as_str(), ids))
            .await?;
        found
            .entry(target)
            .or_default()
            .extend(documents.iter().flat_map(|doc| ids_at(doc, &id_path)));
    }

    Ok(references
        .into_iter()
        .filter(|r| !found.get(&r.target).is_some_and(|ids| ids.contains(&r.id)))
        .map(|r| {
            FieldProblem::new(
                r.op,
                Some(r.entity),
                r.path,
                ProblemReason::Unresolved {
                    target: r.target,
                    id: r.id.to_hex(),
                },
            )
        })
        .collect())
}

async fn check_dependents<S: DocumentStore>(
    registry: &SchemaRegistry,
    txn: &mut Transaction<'_, S>,
    ops: &[PreparedOp],
) -> Result<Vec<FieldProblem>, EngineError> {
    let mut deleted: BTreeMap<EntityKind, Vec<(Option<usize>, ObjectId)>> = BTreeMap::new();
    for op in ops.iter().filter(|op| op.action == Action::Delete) {
        deleted.entry(op.entity).or_default().push((op.index, op.id));
    }

    let mut problems = Vec::new();
    for (kind, targets) in deleted {
        let ids: Vec<ObjectId> = targets.iter().map(|(_, id)| *id).collect();
        for dependent in registry.dependents_of(kind) {
            let location = registry.location(dependent.source)?;
            let path = location.path(dependent.edge.foreign_key);
            let documents = txn
                .find(location.collection, &Predicate::is_in(path.as_str(), ids.iter().copied()))
                .await?;
            if documents.is_empty() {
                continue;
            }

            let mut counts: HashMap<ObjectId, usize> = HashMap::new();
            for id in documents.iter().flat_map(|doc| ids_at(doc, &path)) {
                *counts.entry(id).or_default() += 1;
            }
            for (op, id) in &targets {
                if let Some(count) = counts.get(id) {
                    problems.push(FieldProblem::new(
                        *op,
                        Some(kind),
                        "_id",
                        ProblemReason::StillReferenced {
                            by: dependent.source,
                            count: *count,
                        },
                    ));
                }
            }
        }
    }
    Ok(problems)
}
