use bson::{Bson, Document};

use super::{Accumulator, Expr, Pipeline, Stage};
use crate::data::value::{compare, matches_value, resolve, set_path, values_at, values_equal, Number};
use crate::store::{Direction, SortKey, StoreError, StoreResult};

/// Read access to whole collections, used for the pipeline input and for
/// `lookup` targets.
pub trait CollectionSource {
    fn documents(&self, collection: &str) -> Vec<Document>;
}

pub fn evaluate(pipeline: &Pipeline, source: &impl CollectionSource) -> StoreResult<Vec<Document>> {
    let mut docs = source.documents(&pipeline.collection);
    for stage in &pipeline.stages {
        docs = apply(stage, docs, source)?;
    }
    Ok(docs)
}

fn apply(
    stage: &Stage,
    docs: Vec<Document>,
    source: &impl CollectionSource,
) -> StoreResult<Vec<Document>> {
    match stage {
        Stage::Match(predicate) => {
            let matcher = predicate
                .compile()
                .map_err(|e| StoreError::InvalidPipeline(e.to_string()))?;
            Ok(docs.into_iter().filter(|doc| matcher.matches(doc)).collect())
        }
        Stage::Lookup {
            from,
            local_field,
            foreign_field,
            as_field,
        } => {
            let foreign = source.documents(from);
            Ok(docs
                .into_iter()
                .map(|mut doc| {
                    let joined = join(&doc, local_field, &foreign, foreign_field);
                    set_path(&mut doc, as_field, Bson::Array(joined));
                    doc
                })
                .collect())
        }
        Stage::AddFields(fields) => docs
            .into_iter()
            .map(|mut doc| {
                for (name, expr) in fields {
                    if let Some(value) = eval_expr(expr, &doc)? {
                        set_path(&mut doc, name, value);
                    }
                }
                Ok(doc)
            })
            .collect(),
        Stage::Group { key, fields } => group(&docs, key.as_ref(), fields),
        Stage::Project(fields) => Ok(docs.iter().map(|doc| project(doc, fields)).collect()),
        Stage::Sort(keys) => {
            let mut docs = docs;
            docs.sort_by(|a, b| compare_by_keys(a, b, keys));
            Ok(docs)
        }
        Stage::Unwind(path) => Ok(docs.into_iter().flat_map(|doc| unwind(doc, path)).collect()),
        Stage::Count(name) => Ok(if docs.is_empty() {
            Vec::new()
        } else {
            let mut out = Document::new();
            out.insert(name.clone(), Number::Int(docs.len() as i64).into_bson());
            vec![out]
        }),
        Stage::Skip(n) => Ok(docs.into_iter().skip(*n as usize).collect()),
        Stage::Limit(n) => Ok(docs.into_iter().take(*n as usize).collect()),
    }
}

/// Foreign documents whose `foreign_field` equals a local value. A
/// missing local or foreign value compares as `null`.
fn join(doc: &Document, local_field: &str, foreign: &[Document], foreign_field: &str) -> Vec<Bson> {
    let mut locals: Vec<Bson> = Vec::new();
    for value in values_at(doc, local_field) {
        match value {
            Bson::Array(items) => locals.extend(items.iter().cloned()),
            other => locals.push(other.clone()),
        }
    }
    if locals.is_empty() {
        locals.push(Bson::Null);
    }

    foreign
        .iter()
        .filter(|candidate| {
            let values = values_at(candidate, foreign_field);
            locals.iter().any(|local| {
                if values.is_empty() {
                    matches!(local, Bson::Null)
                } else {
                    values.iter().any(|v| matches_value(v, local))
                }
            })
        })
        .cloned()
        .map(Bson::Document)
        .collect()
}

fn unwind(doc: Document, path: &str) -> Vec<Document> {
    match resolve(&doc, path) {
        None | Some(Bson::Null) => Vec::new(),
        Some(Bson::Array(items)) => items
            .into_iter()
            .map(|item| {
                let mut out = doc.clone();
                set_path(&mut out, path, item);
                out
            })
            .collect(),
        Some(_) => vec![doc],
    }
}

fn invalid(message: impl Into<String>) -> StoreError {
    StoreError::InvalidPipeline(message.into())
}

/// Evaluates an expression. `None` stands for a missing value.
pub fn eval_expr(expr: &Expr, doc: &Document) -> StoreResult<Option<Bson>> {
    match expr {
        Expr::Field(path) => Ok(resolve(doc, path)),
        Expr::Literal(value) => Ok(Some(value.clone())),
        Expr::Size(path) => match resolve(doc, path) {
            None | Some(Bson::Null) => Ok(Some(Bson::Int32(0))),
            Some(Bson::Array(items)) => Ok(Some(Number::Int(items.len() as i64).into_bson())),
            Some(other) => Err(invalid(format!(
                "$size of '{}' requires an array, found {:?}",
                path,
                other.element_type()
            ))),
        },
        Expr::Sum(path) => {
            let total = match resolve(doc, path) {
                Some(Bson::Array(items)) => items
                    .iter()
                    .filter_map(Number::from_bson)
                    .fold(Number::Int(0), Number::add),
                Some(value) => Number::from_bson(&value).unwrap_or(Number::Int(0)),
                None => Number::Int(0),
            };
            Ok(Some(total.into_bson()))
        }
        Expr::Add(terms) => fold_numbers("$add", terms, doc, Number::Int(0), Number::add),
        Expr::Multiply(factors) => {
            fold_numbers("$multiply", factors, doc, Number::Int(1), Number::mul)
        }
        Expr::Subtract(a, b) => {
            let a = number_operand("$subtract", a, doc)?;
            let b = number_operand("$subtract", b, doc)?;
            let (Some(a), Some(b)) = (a, b) else {
                return Ok(Some(Bson::Null));
            };
            Ok(Some(a.sub(b).into_bson()))
        }
        Expr::Divide(a, b) => {
            let a = number_operand("$divide", a, doc)?;
            let b = number_operand("$divide", b, doc)?;
            let (Some(a), Some(b)) = (a, b) else {
                return Ok(Some(Bson::Null));
            };
            if b.as_f64() == 0.0 {
                return Err(invalid("$divide by zero"));
            }
            Ok(Some(Bson::Double(a.as_f64() / b.as_f64())))
        }
    }
}

/// `Ok(None)` when the operand is missing or null, which makes the whole
/// arithmetic expression null.
fn number_operand(op: &str, expr: &Expr, doc: &Document) -> StoreResult<Option<Number>> {
    match eval_expr(expr, doc)? {
        None | Some(Bson::Null) => Ok(None),
        Some(value) => Number::from_bson(&value)
            .map(Some)
            .ok_or_else(|| invalid(format!("{} only supports numeric operands, got {}", op, value))),
    }
}

fn fold_numbers(
    op: &str,
    exprs: &[Expr],
    doc: &Document,
    init: Number,
    f: fn(Number, Number) -> Number,
) -> StoreResult<Option<Bson>> {
    let mut acc = init;
    for expr in exprs {
        match number_operand(op, expr, doc)? {
            Some(n) => acc = f(acc, n),
            None => return Ok(Some(Bson::Null)),
        }
    }
    Ok(Some(acc.into_bson()))
}

enum State {
    Count(i64),
    Sum(Number),
    Avg { total: f64, n: u64 },
}

impl State {
    fn new(acc: &Accumulator) -> State {
        match acc {
            Accumulator::Count => State::Count(0),
            Accumulator::Sum(_) => State::Sum(Number::Int(0)),
            Accumulator::Avg(_) => State::Avg { total: 0.0, n: 0 },
        }
    }

    fn feed(&mut self, acc: &Accumulator, doc: &Document) -> StoreResult<()> {
        match (self, acc) {
            (State::Count(n), _) => *n += 1,
            (State::Sum(sum), Accumulator::Sum(expr)) => {
                if let Some(n) = eval_expr(expr, doc)?.as_ref().and_then(Number::from_bson) {
                    *sum = sum.add(n);
                }
            }
            (State::Avg { total, n }, Accumulator::Avg(expr)) => {
                if let Some(x) = eval_expr(expr, doc)?.as_ref().and_then(Number::from_bson) {
                    *total += x.as_f64();
                    *n += 1;
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn finish(self) -> Bson {
        match self {
            State::Count(n) => Number::Int(n).into_bson(),
            State::Sum(sum) => sum.into_bson(),
            State::Avg { n: 0, .. } => Bson::Null,
            State::Avg { total, n } => Bson::Double(total / n as f64),
        }
    }
}

/// Groups appear in order of first occurrence. A group only exists when
/// at least one document fell into it.
fn group(
    docs: &[Document],
    key: Option<&Expr>,
    fields: &[(String, Accumulator)],
) -> StoreResult<Vec<Document>> {
    let mut groups: Vec<(Bson, Vec<State>)> = Vec::new();

    for doc in docs {
        let id = match key {
            Some(expr) => eval_expr(expr, doc)?.unwrap_or(Bson::Null),
            None => Bson::Null,
        };
        let index = match groups.iter().position(|(k, _)| values_equal(k, &id)) {
            Some(index) => index,
            None => {
                groups.push((id, fields.iter().map(|(_, acc)| State::new(acc)).collect()));
                groups.len() - 1
            }
        };
        for (state, (_, acc)) in groups[index].1.iter_mut().zip(fields) {
            state.feed(acc, doc)?;
        }
    }

    Ok(groups
        .into_iter()
        .map(|(id, states)| {
            let mut out = Document::new();
            out.insert("_id", id);
            for (state, (name, _)) in states.into_iter().zip(fields) {
                out.insert(name.clone(), state.finish());
            }
            out
        })
        .collect())
}

fn project(doc: &Document, fields: &[String]) -> Document {
    let mut out = Document::new();
    if let Some(id) = doc.get("_id") {
        out.insert("_id", id.clone());
    }
    for field in fields {
        if let Some(value) = resolve(doc, field) {
            set_path(&mut out, field, value);
        }
    }
    out
}

/// Orders by `keys`, then by ascending `_id` the way `sort_document`
/// tells the server to.
pub(crate) fn compare_by_keys(a: &Document, b: &Document, keys: &[SortKey]) -> std::cmp::Ordering {
    let tiebreak = SortKey::asc("_id");
    let by_id = (!keys.iter().any(|k| k.field == "_id")).then_some(&tiebreak);
    for key in keys.iter().chain(by_id) {
        let left = resolve(a, &key.field).unwrap_or(Bson::Null);
        let right = resolve(b, &key.field).unwrap_or(Bson::Null);
        let ord = match key.direction {
            Direction::Asc => compare(&left, &right),
            Direction::Desc => compare(&right, &left),
        };
        if ord.is_ne() {
            return ord;
        }
    }
    std::cmp::Ordering::Equal
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use bson::doc;
    use proptest::prelude::*;

    use super::*;
    use crate::store::Predicate;

    struct Fixture(HashMap<&'static str, Vec<Document>>);

    impl CollectionSource for Fixture {
        fn documents(&self, collection: &str) -> Vec<Document> {
            self.0.get(collection).cloned().unwrap_or_default()
        }
    }

    fn forum() -> Fixture {
        let posts = vec![
            doc! { "_id": 1, "title": "P1", "user_id": 10, "type": "discuss" },
            doc! { "_id": 2, "title": "P2", "user_id": 10, "type": "news" },
            doc! { "_id": 3, "title": "P3", "user_id": 11, "type": "discuss" },
        ];
        let comments = vec![
            doc! { "_id": 100, "forumPost_id": 1 },
            doc! { "_id": 101, "forumPost_id": 1 },
            doc! { "_id": 102, "forumPost_id": 2 },
            doc! { "_id": 103, "forumPost_id": 1 },
        ];
        Fixture(HashMap::from([("forumPost", posts), ("forumComment", comments)]))
    }

    fn titles(docs: &[Document]) -> Vec<&str> {
        docs.iter().map(|d| d.get_str("title").unwrap()).collect()
    }

    #[test]
    fn lookup_is_a_left_outer_join() {
        let pipeline = Pipeline::on("forumPost")
            .lookup("forumComment", "_id", "forumPost_id", "comments")
            .add_field("comment_count", Expr::size("comments"))
            .project(&["title", "comment_count"])
            .sort_by("comment_count", Direction::Desc);
        let rows = evaluate(&pipeline, &forum()).unwrap();

        assert_eq!(titles(&rows), vec!["P1", "P2", "P3"]);
        assert_eq!(rows[2], doc! { "_id": 3, "title": "P3", "comment_count": 0 });
        assert_eq!(rows[0].get_i32("comment_count").unwrap(), 3);
    }

    #[test]
    fn group_only_yields_populated_groups() {
        let pipeline = Pipeline::on("forumComment").group(
            Some(Expr::field("forumPost_id")),
            vec![("count", Accumulator::Count)],
        );
        let rows = evaluate(&pipeline, &forum()).unwrap();
        assert_eq!(
            rows,
            vec![doc! { "_id": 1, "count": 3 }, doc! { "_id": 2, "count": 1 }]
        );
    }

    #[test]
    fn averages() {
        let pipeline = Pipeline::on("forumPost")
            .lookup("forumComment", "_id", "forumPost_id", "comments")
            .group(None, vec![("avg", Accumulator::Avg(Expr::size("comments")))]);
        let rows = evaluate(&pipeline, &forum()).unwrap();
        assert_eq!(rows, vec![doc! { "_id": Bson::Null, "avg": 4.0 / 3.0 }]);

        let empty = Pipeline::on("forumPost")
            .matching(Predicate::eq("type", "poll"))
            .group(None, vec![("avg", Accumulator::Avg(Expr::field("likes")))]);
        assert!(evaluate(&empty, &forum()).unwrap().is_empty());

        let no_numbers = Pipeline::on("forumPost")
            .group(None, vec![("avg", Accumulator::Avg(Expr::field("title")))]);
        assert_eq!(
            evaluate(&no_numbers, &forum()).unwrap(),
            vec![doc! { "_id": Bson::Null, "avg": Bson::Null }]
        );
    }

    #[test]
    fn match_count_skip_limit() {
        let count = Pipeline::on("forumPost")
            .matching(Predicate::eq("user_id", 10))
            .count("total_posts");
        assert_eq!(
            evaluate(&count, &forum()).unwrap(),
            vec![doc! { "total_posts": 2 }]
        );

        let none = Pipeline::on("forumPost")
            .matching(Predicate::eq("user_id", 99))
            .count("total_posts");
        assert!(evaluate(&none, &forum()).unwrap().is_empty());

        let page = Pipeline::on("forumPost").skip(1).limit(1);
        assert_eq!(titles(&evaluate(&page, &forum()).unwrap()), vec!["P2"]);
    }

    #[test]
    fn unwind_nested_arrays() {
        let classroom = doc! {
            "_id": 1,
            "forum_posts": [
                { "_id": 10, "comments": [ { "c": 1 }, { "c": 2 } ] },
                { "_id": 11, "comments": [] },
                { "_id": 12 },
            ],
        };
        let fixture = Fixture(HashMap::from([("classroom", vec![classroom])]));

        let posts = Pipeline::on("classroom").unwind("forum_posts");
        assert_eq!(evaluate(&posts, &fixture).unwrap().len(), 3);

        let comments = Pipeline::on("classroom")
            .unwind("forum_posts")
            .unwind("forum_posts.comments")
            .group(
                Some(Expr::field("forum_posts._id")),
                vec![("count", Accumulator::Count)],
            );
        assert_eq!(
            evaluate(&comments, &fixture).unwrap(),
            vec![doc! { "_id": 10, "count": 2 }]
        );
    }

    #[test]
    fn arithmetic_and_errors() {
        let doc = doc! { "likes": 6, "comments": [1, 2], "title": "x" };
        let ratio = Expr::field("likes").divide(Expr::size("comments"));
        assert_eq!(eval_expr(&ratio, &doc).unwrap(), Some(Bson::Double(3.0)));

        let missing = Expr::Add(vec![Expr::field("likes"), Expr::field("shares")]);
        assert_eq!(eval_expr(&missing, &doc).unwrap(), Some(Bson::Null));

        assert_eq!(eval_expr(&Expr::sum("comments"), &doc).unwrap(), Some(Bson::Int32(3)));
        assert_eq!(eval_expr(&Expr::field("shares"), &doc).unwrap(), None);

        assert!(eval_expr(&Expr::size("title"), &doc).is_err());
        assert!(eval_expr(&Expr::field("likes").divide(Expr::literal(0)), &doc).is_err());
        assert!(eval_expr(&Expr::field("title").subtract(Expr::literal(1)), &doc).is_err());
    }

    #[test]
    fn sort_ties_fall_back_to_id() {
        let docs = vec![
            doc! { "_id": 3, "k": 1 },
            doc! { "_id": 1, "k": 1 },
            doc! { "_id": 2, "k": 5 },
            doc! { "_id": 0, "k": 1 },
        ];
        let fixture = Fixture(HashMap::from([("c", docs)]));
        let rows = evaluate(&Pipeline::on("c").sort_by("k", Direction::Desc), &fixture).unwrap();
        let ids: Vec<_> = rows.iter().map(|d| d.get_i32("_id").unwrap()).collect();
        assert_eq!(ids, vec![2, 0, 1, 3]);

        let rows = evaluate(&Pipeline::on("c").sort_by("_id", Direction::Desc), &fixture).unwrap();
        let ids: Vec<_> = rows.iter().map(|d| d.get_i32("_id").unwrap()).collect();
        assert_eq!(ids, vec![3, 2, 1, 0]);
    }

    proptest! {
        #[test]
        fn sort_without_ids_is_stable(keys in proptest::collection::vec(0i32..4, 0..40)) {
            let docs: Vec<Document> = keys
                .iter()
                .enumerate()
                .map(|(i, k)| doc! { "k": *k, "seq": i as i64 })
                .collect();
            let fixture = Fixture(HashMap::from([("c", docs)]));
            let rows = evaluate(&Pipeline::on("c").sort_by("k", Direction::Desc), &fixture).unwrap();

            prop_assert_eq!(rows.len(), keys.len());
            for pair in rows.windows(2) {
                let (a, b) = (pair[0].get_i32("k").unwrap(), pair[1].get_i32("k").unwrap());
                prop_assert!(a >= b);
                if a == b {
                    prop_assert!(pair[0].get_i64("seq").unwrap() < pair[1].get_i64("seq").unwrap());
                }
            }
        }
    }
}
