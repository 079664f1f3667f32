//! Atomic multi-entity writes.
//!
//! A batch of [`GraphOp`]s is checked as a whole before anything touches
//! the store, then applied in order inside one transaction. References
//! between entities are verified by the [`validator`](crate::validator)
//! right before commit, so a batch either lands completely or not at all.

use bson::oid::ObjectId;
use bson::{doc, Bson, Document};
use tracing::{debug, info};

use crate::data::value::subdocuments_mut;
use crate::data::IdRef;
use crate::error::{EngineError, FieldProblem, ProblemReason};
use crate::role::Role;
use crate::schema::{Cardinality, EntityKind, FieldKind, SchemaRegistry};
use crate::store::{DocumentStore, Predicate};
use crate::txn::Transaction;
use crate::validator;

#[derive(Debug, Clone, PartialEq)]
pub enum GraphOp {
    /// Creates an entity. Its id is assigned by the engine; other ops of
    /// the batch refer to it with [`op_ref`](crate::data::op_ref).
    Insert {
        entity: EntityKind,
        document: Document,
    },
    /// Sets top-level fields of an existing entity.
    Update {
        entity: EntityKind,
        target: IdRef,
        changes: Document,
    },
    Delete {
        entity: EntityKind,
        target: IdRef,
    },
}

impl GraphOp {
    pub fn insert(entity: EntityKind, document: Document) -> GraphOp {
        GraphOp::Insert { entity, document }
    }

    pub fn update(entity: EntityKind, target: impl Into<IdRef>, changes: Document) -> GraphOp {
        GraphOp::Update {
            entity,
            target: target.into(),
            changes,
        }
    }

    pub fn delete(entity: EntityKind, target: impl Into<IdRef>) -> GraphOp {
        GraphOp::Delete {
            entity,
            target: target.into(),
        }
    }

    pub fn entity(&self) -> EntityKind {
        match self {
            GraphOp::Insert { entity, .. }
            | GraphOp::Update { entity, .. }
            | GraphOp::Delete { entity, .. } => *entity,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitResult {
    /// Ids of the inserted entities, in op order.
    pub inserted: Vec<ObjectId>,
    pub modified: u64,
    pub deleted: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Action {
    Insert(Document),
    Update(Document),
    Delete,
}

/// An op with every id resolved and every field checked.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PreparedOp {
    /// Position in the caller's batch. `None` for ops the engine derived
    /// itself, like cascade deletes.
    pub index: Option<usize>,
    pub entity: EntityKind,
    pub id: ObjectId,
    pub action: Action,
}

impl PreparedOp {
    pub fn delete(entity: EntityKind, id: ObjectId) -> PreparedOp {
        PreparedOp {
            index: None,
            entity,
            id,
            action: Action::Delete,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    Insert,
    Update,
}

fn check_value(kind: FieldKind, value: &Bson) -> Result<(), ProblemReason> {
    let ok = match (kind, value) {
        (FieldKind::Text, Bson::String(_)) => true,
        (FieldKind::Email, Bson::String(s)) => s.contains('@'),
        (FieldKind::Bool, Bson::Boolean(_)) => true,
        (FieldKind::Role, Bson::String(s)) => s.parse::<Role>().is_ok(),
        _ => false,
    };
    if ok {
        Ok(())
    } else {
        Err(ProblemReason::WrongType {
            expected: kind.describe(),
        })
    }
}

struct Checker<'r> {
    registry: &'r SchemaRegistry,
    /// Engine-assigned id and kind of every insert, by op index.
    assigned: Vec<Option<(EntityKind, ObjectId)>>,
    problems: Vec<FieldProblem>,
}

impl<'r> Checker<'r> {
    fn problem(&mut self, op: usize, entity: EntityKind, field: impl Into<String>, reason: ProblemReason) {
        self.problems
            .push(FieldProblem::new(Some(op), Some(entity), field, reason));
    }

    /// Reads an id field. Op references must name an earlier insert of
    /// `target`, when the field references an entity.
    fn normalize_id(&self, op: usize, target: Option<EntityKind>, value: &Bson) -> Result<Bson, ProblemReason> {
        match IdRef::from_bson(value) {
            Ok(IdRef::Id(id)) => Ok(Bson::ObjectId(id)),
            Ok(IdRef::Op(index)) => match self.assigned.get(index) {
                Some(Some((kind, id))) if index < op && target.map_or(true, |t| t == *kind) => {
                    Ok(Bson::ObjectId(*id))
                }
                _ => Err(ProblemReason::UnknownOpRef { index }),
            },
            Err(value) => Err(ProblemReason::MalformedId { value }),
        }
    }

    /// Targets may only point at inserts earlier in the batch, of the same
    /// kind.
    fn resolve_target(&mut self, op: usize, entity: EntityKind, target: IdRef) -> Option<ObjectId> {
        match target {
            IdRef::Id(id) => Some(id),
            IdRef::Op(index) => match self.assigned.get(index) {
                Some(Some((kind, id))) if index < op && *kind == entity => Some(*id),
                _ => {
                    self.problem(op, entity, "target", ProblemReason::UnknownOpRef { index });
                    None
                }
            },
        }
    }

    /// Checks fields of the root entity and of every embedded entity found
    /// in `document`, normalizes id fields to ObjectIds and gives embedded
    /// entities their ids.
    fn check_document(
        &mut self,
        op: usize,
        root: EntityKind,
        mut document: Document,
        mode: Mode,
    ) -> Result<Document, EngineError> {
        if document.remove("_id").is_some() {
            self.problem(op, root, "_id", ProblemReason::EngineAssignedId);
        }
        if mode == Mode::Update {
            if document.is_empty() {
                self.problem(op, root, "changes", ProblemReason::Missing);
            }
            let nested: Vec<String> = document
                .keys()
                .filter(|key| key.contains('.'))
                .cloned()
                .collect();
            for key in nested {
                self.problem(op, root, key, ProblemReason::NestedPath);
            }
        }

        for (def, location) in self.registry.document_entities(root)? {
            let is_root = def.kind == root;
            let prefix = location.prefix.trim_end_matches('.');
            let mut problems = Vec::new();

            for sub in subdocuments_mut(&mut document, prefix) {
                if !is_root {
                    // Embedded entities keep their ids across updates of the
                    // enclosing document.
                    let existing = sub.get("_id").map(|id| matches!(id, Bson::ObjectId(_)));
                    match existing {
                        None => {
                            sub.insert("_id", ObjectId::new());
                        }
                        Some(true) if mode == Mode::Update => {}
                        Some(_) => problems.push((location.path("_id"), ProblemReason::EngineAssignedId)),
                    }
                }

                for field in &def.fields {
                    let path = location.path(field.name);
                    let enforce_required = !(is_root && mode == Mode::Update);
                    let Some(value) = sub.get_mut(field.name) else {
                        if field.required && enforce_required {
                            problems.push((path, ProblemReason::Missing));
                        }
                        continue;
                    };
                    if matches!(value, Bson::Null) {
                        if field.required {
                            problems.push((path, ProblemReason::Missing));
                        }
                        continue;
                    }
                    let checked = match field.kind {
                        FieldKind::Id => {
                            let target = def.edge(field.name).map(|edge| edge.target);
                            self.normalize_id(op, target, value).map(|id| *value = id)
                        }
                        kind => check_value(kind, value),
                    };
                    if let Err(reason) = checked {
                        problems.push((path, reason));
                    }
                }

                for edge in def.edges.iter().filter(|e| e.cardinality == Cardinality::Many) {
                    let path = location.path(edge.foreign_key);
                    match sub.get_mut(edge.foreign_key) {
                        None | Some(Bson::Null) => {}
                        Some(Bson::Array(items)) => {
                            for item in items.iter_mut() {
                                match self.normalize_id(op, Some(edge.target), item) {
                                    Ok(id) => *item = id,
                                    Err(reason) => problems.push((path.clone(), reason)),
                                }
                            }
                        }
                        Some(_) => problems.push((
                            path,
                            ProblemReason::WrongType {
                                expected: "array of object ids",
                            },
                        )),
                    }
                }
            }

            for (path, reason) in problems {
                self.problem(op, def.kind, path, reason);
            }
        }

        Ok(document)
    }
}

fn with_id(id: ObjectId, document: Document) -> Document {
    let mut out = doc! { "_id": id };
    for (key, value) in document {
        out.insert(key, value);
    }
    out
}

/// Validates a batch without touching the store and assigns ids to its
/// inserts. Every problem found is reported at once.
pub(crate) fn prepare(
    registry: &SchemaRegistry,
    ops: Vec<GraphOp>,
) -> Result<Vec<PreparedOp>, EngineError> {
    let assigned = ops
        .iter()
        .map(|op| match op {
            GraphOp::Insert { entity, .. } => Some((*entity, ObjectId::new())),
            _ => None,
        })
        .collect();
    let mut checker = Checker {
        registry,
        assigned,
        problems: Vec::new(),
    };
    let mut prepared = Vec::with_capacity(ops.len());

    for (i, op) in ops.into_iter().enumerate() {
        let entity = op.entity();
        if !registry.entity(entity)?.is_root() {
            let root = registry.root_of(entity)?;
            checker.problem(i, entity, "_id", ProblemReason::EmbeddedWrite { root });
            continue;
        }

        match op {
            GraphOp::Insert { document, .. } => {
                let document = checker.check_document(i, entity, document, Mode::Insert)?;
                if let Some(Some((_, id))) = checker.assigned.get(i).copied() {
                    prepared.push(PreparedOp {
                        index: Some(i),
                        entity,
                        id,
                        action: Action::Insert(with_id(id, document)),
                    });
                }
            }
            GraphOp::Update {
                target, changes, ..
            } => {
                let id = checker.resolve_target(i, entity, target);
                let changes = checker.check_document(i, entity, changes, Mode::Update)?;
                if let Some(id) = id {
                    prepared.push(PreparedOp {
                        index: Some(i),
                        entity,
                        id,
                        action: Action::Update(changes),
                    });
                }
            }
            GraphOp::Delete { target, .. } => {
                if let Some(id) = checker.resolve_target(i, entity, target) {
                    prepared.push(PreparedOp {
                        index: Some(i),
                        entity,
                        id,
                        action: Action::Delete,
                    });
                }
            }
        }
    }

    if checker.problems.is_empty() {
        Ok(prepared)
    } else {
        Err(EngineError::Validation(checker.problems))
    }
}

async fn apply<S: DocumentStore>(
    registry: &SchemaRegistry,
    txn: &mut Transaction<'_, S>,
    ops: &[PreparedOp],
) -> Result<CommitResult, EngineError> {
    let mut result = CommitResult::default();

    for op in ops {
        let collection = registry.location(op.entity)?.collection;
        let by_id = Predicate::by_id(op.id);
        match &op.action {
            Action::Insert(document) => {
                txn.insert(collection, document.clone()).await?;
                result.inserted.push(op.id);
            }
            Action::Update(changes) => {
                let matched = txn.update_one(collection, &by_id, changes.clone()).await?;
                if matched == 0 {
                    return Err(EngineError::not_found(op.entity, op.id));
                }
                result.modified += matched;
            }
            Action::Delete => {
                let deleted = txn.delete_one(collection, &by_id).await?;
                if deleted == 0 {
                    return Err(EngineError::not_found(op.entity, op.id));
                }
                result.deleted += deleted;
            }
        }
        debug!(txn = %txn.id(), op = ?op.index, entity = %op.entity, id = %op.id, "Applied op");
    }

    validator::validate(registry, txn, ops).await?;
    Ok(result)
}

/// Applies a batch atomically. Nothing is written when any op fails.
pub async fn run_graph_write<S: DocumentStore>(
    store: &S,
    registry: &SchemaRegistry,
    ops: Vec<GraphOp>,
) -> Result<CommitResult, EngineError> {
    let prepared = prepare(registry, ops)?;
    let mut txn = Transaction::begin(store).await?;
    let id = txn.id();

    match apply(registry, &mut txn, &prepared).await {
        Ok(result) => {
            txn.commit().await?;
            info!(
                txn = %id,
                inserted = result.inserted.len(),
                modified = result.modified,
                deleted = result.deleted,
                "Graph write committed"
            );
            Ok(result)
        }
        Err(e) => {
            txn.abort(&e).await;
            Err(e)
        }
    }
}
