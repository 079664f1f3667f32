use bson::Document;
use tracing::debug;

use super::{Accumulator, Expr, Pipeline, Stage};
use crate::error::{EngineError, FieldProblem, ProblemReason};
use crate::schema::SchemaRegistry;
use crate::store::DocumentStore;

fn problem(stage: usize, message: impl Into<String>) -> FieldProblem {
    FieldProblem::new(
        None,
        None,
        format!("stages[{}]", stage),
        ProblemReason::InvalidPipeline {
            message: message.into(),
        },
    )
}

fn is_collection(registry: &SchemaRegistry, name: &str) -> bool {
    registry
        .entities()
        .filter_map(|def| registry.location(def.kind).ok())
        .any(|loc| loc.is_root() && loc.collection == name)
}

fn check_output_name(name: &str) -> Option<&'static str> {
    if name.is_empty() {
        Some("output field name is empty")
    } else if name.starts_with('$') {
        Some("output field name starts with '$'")
    } else {
        None
    }
}

fn check_expr(expr: &Expr, out: &mut Vec<String>) {
    match expr {
        Expr::Field(path) | Expr::Size(path) | Expr::Sum(path) if path.is_empty() => {
            out.push("field path is empty".to_string())
        }
        Expr::Add(terms) | Expr::Multiply(terms) => terms.iter().for_each(|t| check_expr(t, out)),
        Expr::Subtract(a, b) | Expr::Divide(a, b) => {
            check_expr(a, out);
            check_expr(b, out);
        }
        _ => {}
    }
}

/// Checks a pipeline against the registry before anything is sent to the
/// store. Every problem is reported, not just the first.
pub fn validate_pipeline(registry: &SchemaRegistry, pipeline: &Pipeline) -> Result<(), EngineError> {
    let mut problems = Vec::new();

    if !is_collection(registry, &pipeline.collection) {
        problems.push(FieldProblem::new(
            None,
            None,
            "collection",
            ProblemReason::InvalidPipeline {
                message: format!("unknown collection '{}'", pipeline.collection),
            },
        ));
    }

    for (i, stage) in pipeline.stages.iter().enumerate() {
        let mut messages = Vec::new();
        match stage {
            Stage::Match(predicate) => {
                if let Err(e) = predicate.compile() {
                    messages.push(e.to_string());
                }
            }
            Stage::Lookup {
                from,
                local_field,
                foreign_field,
                as_field,
            } => {
                if !is_collection(registry, from) {
                    messages.push(format!("unknown collection '{}'", from));
                }
                if local_field.is_empty() || foreign_field.is_empty() {
                    messages.push("join fields must not be empty".to_string());
                }
                if let Some(m) = check_output_name(as_field) {
                    messages.push(m.to_string());
                }
            }
            Stage::AddFields(fields) => {
                if fields.is_empty() {
                    messages.push("no fields to add".to_string());
                }
                for (name, expr) in fields {
                    if let Some(m) = check_output_name(name) {
                        messages.push(m.to_string());
                    }
                    check_expr(expr, &mut messages);
                }
            }
            Stage::Group { key, fields } => {
                if let Some(key) = key {
                    check_expr(key, &mut messages);
                }
                for (name, acc) in fields {
                    if let Some(m) = check_output_name(name) {
                        messages.push(m.to_string());
                    }
                    if name == "_id" || name.contains('.') {
                        messages.push(format!("'{}' is not a valid group output", name));
                    }
                    match acc {
                        Accumulator::Count => {}
                        Accumulator::Sum(expr) | Accumulator::Avg(expr) => {
                            check_expr(expr, &mut messages)
                        }
                    }
                }
            }
            Stage::Project(fields) => {
                if fields.is_empty() {
                    messages.push("projection is empty".to_string());
                }
            }
            Stage::Sort(keys) => {
                if keys.is_empty() {
                    messages.push("sort needs at least one key".to_string());
                }
            }
            Stage::Unwind(path) => {
                if path.is_empty() {
                    messages.push("unwind path is empty".to_string());
                }
            }
            Stage::Count(name) => {
                if let Some(m) = check_output_name(name) {
                    messages.push(m.to_string());
                }
                if name.contains('.') {
                    messages.push("count field can't contain '.'".to_string());
                }
            }
            Stage::Limit(0) => messages.push("limit must be positive".to_string()),
            Stage::Skip(_) | Stage::Limit(_) => {}
        }
        problems.extend(messages.into_iter().map(|m| problem(i, m)));
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(EngineError::Validation(problems))
    }
}

/// Validates and runs a pipeline. Reads committed data only.
pub async fn run_pipeline<S: DocumentStore>(
    store: &S,
    registry: &SchemaRegistry,
    pipeline: &Pipeline,
) -> Result<Vec<Document>, EngineError> {
    validate_pipeline(registry, pipeline)?;
    debug!(
        collection = %pipeline.collection,
        stages = pipeline.stages.len(),
        "Running pipeline"
    );
    Ok(store.run_aggregate(pipeline).await?)
}
