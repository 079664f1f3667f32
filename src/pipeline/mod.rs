use bson::{doc, Bson, Document};

use crate::schema::{EntityKind, Location};
use crate::store::{sort_document, Direction, Predicate, SortKey};

pub mod eval;
pub mod executor;

pub use executor::{run_pipeline, validate_pipeline};

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Value at a dotted path. Paths through arrays yield arrays.
    Field(String),
    Literal(Bson),
    /// Length of the array at a path. Missing or null counts as empty.
    Size(String),
    /// Sum of the numbers at a path, or of the array found there.
    Sum(String),
    Add(Vec<Expr>),
    Subtract(Box<Expr>, Box<Expr>),
    Multiply(Vec<Expr>),
    Divide(Box<Expr>, Box<Expr>),
}

impl Expr {
    pub fn field(path: impl Into<String>) -> Expr {
        Expr::Field(path.into())
    }

    pub fn literal(value: impl Into<Bson>) -> Expr {
        Expr::Literal(value.into())
    }

    pub fn size(path: impl Into<String>) -> Expr {
        Expr::Size(path.into())
    }

    pub fn sum(path: impl Into<String>) -> Expr {
        Expr::Sum(path.into())
    }

    pub fn subtract(self, other: Expr) -> Expr {
        Expr::Subtract(Box::new(self), Box::new(other))
    }

    pub fn divide(self, other: Expr) -> Expr {
        Expr::Divide(Box::new(self), Box::new(other))
    }

    pub fn to_bson(&self) -> Bson {
        match self {
            Expr::Field(path) => Bson::String(format!("${}", path)),
            Expr::Literal(value) => Bson::Document(doc! { "$literal": value.clone() }),
            Expr::Size(path) => {
                Bson::Document(doc! { "$size": { "$ifNull": [format!("${}", path), []] } })
            }
            Expr::Sum(path) => Bson::Document(doc! { "$sum": format!("${}", path) }),
            Expr::Add(terms) => Bson::Document(doc! { "$add": render_all(terms) }),
            Expr::Subtract(a, b) => {
                Bson::Document(doc! { "$subtract": [a.to_bson(), b.to_bson()] })
            }
            Expr::Multiply(factors) => Bson::Document(doc! { "$multiply": render_all(factors) }),
            Expr::Divide(a, b) => Bson::Document(doc! { "$divide": [a.to_bson(), b.to_bson()] }),
        }
    }
}

fn render_all(exprs: &[Expr]) -> Vec<Bson> {
    exprs.iter().map(Expr::to_bson).collect()
}

#[derive(Debug, Clone, PartialEq)]
pub enum Accumulator {
    /// Number of documents in the group, as int32.
    Count,
    Sum(Expr),
    /// Mean of the numeric values. `null` when the group has none.
    Avg(Expr),
}

impl Accumulator {
    pub fn to_bson(&self) -> Bson {
        match self {
            Accumulator::Count => Bson::Document(doc! { "$sum": 1 }),
            Accumulator::Sum(expr) => Bson::Document(doc! { "$sum": expr.to_bson() }),
            Accumulator::Avg(expr) => Bson::Document(doc! { "$avg": expr.to_bson() }),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    Match(Predicate),
    /// Left outer join. Unmatched documents get an empty array.
    Lookup {
        from: String,
        local_field: String,
        foreign_field: String,
        as_field: String,
    },
    AddFields(Vec<(String, Expr)>),
    /// `key: None` collapses the input into one global group.
    Group {
        key: Option<Expr>,
        fields: Vec<(String, Accumulator)>,
    },
    /// Keeps `_id` and the named fields.
    Project(Vec<String>),
    /// Ties are ordered by ascending `_id`.
    Sort(Vec<SortKey>),
    /// One output document per element of the array at the path.
    /// Documents where it is missing, null or empty are dropped.
    Unwind(String),
    /// Replaces the input with `{ name: n }`, or nothing when empty.
    Count(String),
    Skip(u64),
    Limit(u64),
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Match(_) => "$match",
            Stage::Lookup { .. } => "$lookup",
            Stage::AddFields(_) => "$addFields",
            Stage::Group { .. } => "$group",
            Stage::Project(_) => "$project",
            Stage::Sort(_) => "$sort",
            Stage::Unwind(_) => "$unwind",
            Stage::Count(_) => "$count",
            Stage::Skip(_) => "$skip",
            Stage::Limit(_) => "$limit",
        }
    }

    pub fn to_document(&self) -> Document {
        let body = match self {
            Stage::Match(predicate) => Bson::Document(predicate.to_document()),
            Stage::Lookup {
                from,
                local_field,
                foreign_field,
                as_field,
            } => Bson::Document(doc! {
                "from": from,
                "localField": local_field,
                "foreignField": foreign_field,
                "as": as_field,
            }),
            Stage::AddFields(fields) => Bson::Document(
                fields
                    .iter()
                    .map(|(name, expr)| (name.clone(), expr.to_bson()))
                    .collect(),
            ),
            Stage::Group { key, fields } => {
                let mut group = doc! {
                    "_id": key.as_ref().map(Expr::to_bson).unwrap_or(Bson::Null),
                };
                for (name, acc) in fields {
                    group.insert(name.clone(), acc.to_bson());
                }
                Bson::Document(group)
            }
            Stage::Project(fields) => Bson::Document(
                fields
                    .iter()
                    .map(|field| (field.clone(), Bson::Int32(1)))
                    .collect(),
            ),
            Stage::Sort(keys) => Bson::Document(sort_document(keys)),
            Stage::Unwind(path) => Bson::String(format!("${}", path)),
            Stage::Count(name) => Bson::String(name.clone()),
            Stage::Skip(n) => Bson::Int64(*n as i64),
            Stage::Limit(n) => Bson::Int64(*n as i64),
        };
        doc! { self.name(): body }
    }
}

/// A pipeline over the documents of one collection.
#[derive(Debug, Clone, PartialEq)]
pub struct Pipeline {
    pub collection: String,
    pub stages: Vec<Stage>,
}

impl Pipeline {
    pub fn on(collection: impl Into<String>) -> Pipeline {
        Pipeline {
            collection: collection.into(),
            stages: Vec::new(),
        }
    }

    /// Pipeline over the collection holding `location`'s documents.
    pub fn on_location(location: &Location) -> Pipeline {
        Pipeline::on(location.collection)
    }

    /// Pipeline over an entity kind in the normalized layout.
    pub fn on_entity(kind: EntityKind) -> Pipeline {
        Pipeline::on(kind.name())
    }

    pub fn stage(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn matching(self, predicate: Predicate) -> Self {
        self.stage(Stage::Match(predicate))
    }

    pub fn lookup(
        self,
        from: impl Into<String>,
        local_field: impl Into<String>,
        foreign_field: impl Into<String>,
        as_field: impl Into<String>,
    ) -> Self {
        self.stage(Stage::Lookup {
            from: from.into(),
            local_field: local_field.into(),
            foreign_field: foreign_field.into(),
            as_field: as_field.into(),
        })
    }

    pub fn add_field(self, name: impl Into<String>, expr: Expr) -> Self {
        self.stage(Stage::AddFields(vec![(name.into(), expr)]))
    }

    pub fn group(self, key: Option<Expr>, fields: Vec<(&str, Accumulator)>) -> Self {
        self.stage(Stage::Group {
            key,
            fields: fields
                .into_iter()
                .map(|(name, acc)| (name.to_string(), acc))
                .collect(),
        })
    }

    pub fn project(self, fields: &[&str]) -> Self {
        self.stage(Stage::Project(
            fields.iter().map(|field| field.to_string()).collect(),
        ))
    }

    pub fn sort_by(self, field: impl Into<String>, direction: Direction) -> Self {
        self.stage(Stage::Sort(vec![SortKey {
            field: field.into(),
            direction,
        }]))
    }

    pub fn unwind(self, path: impl Into<String>) -> Self {
        self.stage(Stage::Unwind(path.into()))
    }

    pub fn count(self, name: impl Into<String>) -> Self {
        self.stage(Stage::Count(name.into()))
    }

    pub fn skip(self, n: u64) -> Self {
        self.stage(Stage::Skip(n))
    }

    pub fn limit(self, n: u64) -> Self {
        self.stage(Stage::Limit(n))
    }

    /// Stage documents for `Collection::aggregate`.
    pub fn to_documents(&self) -> Vec<Document> {
        self.stages.iter().map(Stage::to_document).collect()
    }
}
