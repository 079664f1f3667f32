use bson::oid::ObjectId;
use bson::{doc, Bson, Document};
use regex::{Regex, RegexBuilder};

use super::StoreError;
use crate::data::value::{matches_value, values_at};

#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Eq(String, Bson),
    In(String, Vec<Bson>),
    Regex {
        field: String,
        pattern: String,
        case_insensitive: bool,
    },
    /// Conjunction. Empty matches every document.
    And(Vec<Predicate>),
}

impl Predicate {
    pub fn all() -> Predicate {
        Predicate::And(Vec::new())
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Bson>) -> Predicate {
        Predicate::Eq(field.into(), value.into())
    }

    #[inline]
    pub fn by_id(id: ObjectId) -> Predicate {
        Predicate::eq("_id", id)
    }

    pub fn is_in<V: Into<Bson>>(field: impl Into<String>, values: impl IntoIterator<Item = V>) -> Predicate {
        Predicate::In(field.into(), values.into_iter().map(Into::into).collect())
    }

    pub fn regex(field: impl Into<String>, pattern: impl Into<String>) -> Predicate {
        Predicate::Regex {
            field: field.into(),
            pattern: pattern.into(),
            case_insensitive: false,
        }
    }

    /// Makes a regex predicate ignore case. No effect on other kinds.
    pub fn case_insensitive(mut self) -> Predicate {
        if let Predicate::Regex {
            case_insensitive, ..
        } = &mut self
        {
            *case_insensitive = true;
        }
        self
    }

    pub fn and(self, other: Predicate) -> Predicate {
        match self {
            Predicate::And(mut all) => {
                all.push(other);
                Predicate::And(all)
            }
            single => Predicate::And(vec![single, other]),
        }
    }

    /// MongoDB query document for this predicate.
    pub fn to_document(&self) -> Document {
        match self {
            Predicate::Eq(field, value) => doc! { field: { "$eq": value.clone() } },
            Predicate::In(field, values) => doc! { field: { "$in": values.clone() } },
            Predicate::Regex {
                field,
                pattern,
                case_insensitive,
            } => {
                let options = if *case_insensitive { "i" } else { "" };
                doc! { field: { "$regex": pattern.clone(), "$options": options } }
            }
            Predicate::And(all) if all.is_empty() => Document::new(),
            Predicate::And(all) => {
                let parts: Vec<Bson> = all.iter().map(|p| Bson::Document(p.to_document())).collect();
                doc! { "$and": parts }
            }
        }
    }

    /// Compiles regexes once so the predicate can be applied to many
    /// documents.
    pub fn compile(&self) -> Result<Matcher<'_>, StoreError> {
        Ok(match self {
            Predicate::Eq(field, value) => Matcher::Eq(field, value),
            Predicate::In(field, values) => Matcher::In(field, values),
            Predicate::Regex {
                field,
                pattern,
                case_insensitive,
            } => {
                let regex = RegexBuilder::new(pattern)
                    .case_insensitive(*case_insensitive)
                    .build()
                    .map_err(|e| StoreError::InvalidFilter(e.to_string()))?;
                Matcher::Regex(field, regex)
            }
            Predicate::And(all) => {
                Matcher::And(all.iter().map(Predicate::compile).collect::<Result<_, _>>()?)
            }
        })
    }
}

pub enum Matcher<'a> {
    Eq(&'a str, &'a Bson),
    In(&'a str, &'a [Bson]),
    Regex(&'a str, Regex),
    And(Vec<Matcher<'a>>),
}

impl Matcher<'_> {
    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Matcher::Eq(field, expected) => field_matches(doc, field, |v| matches_value(v, expected)),
            Matcher::In(field, candidates) => field_matches(doc, field, |v| {
                candidates.iter().any(|candidate| matches_value(v, candidate))
            }),
            Matcher::Regex(field, regex) => values_at(doc, field).into_iter().any(|v| match v {
                Bson::String(s) => regex.is_match(s),
                Bson::Array(items) => items
                    .iter()
                    .any(|item| matches!(item, Bson::String(s) if regex.is_match(s))),
                _ => false,
            }),
            Matcher::And(all) => all.iter().all(|m| m.matches(doc)),
        }
    }
}

/// A missing field behaves like `null`, as it does on the server.
fn field_matches(doc: &Document, field: &str, test: impl Fn(&Bson) -> bool) -> bool {
    let values = values_at(doc, field);
    if values.is_empty() {
        test(&Bson::Null)
    } else {
        values.into_iter().any(test)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn post() -> Document {
        doc! {
            "title": "Understanding Newton's First Law",
            "type": "discuss",
            "tags": ["physics", "motion"],
            "likes": 4,
        }
    }

    #[test]
    fn equality_and_membership() {
        let doc = post();
        assert!(Predicate::eq("type", "discuss").compile().unwrap().matches(&doc));
        assert!(Predicate::eq("likes", 4i64).compile().unwrap().matches(&doc));
        assert!(Predicate::eq("tags", "motion").compile().unwrap().matches(&doc));
        assert!(Predicate::eq("author", Bson::Null).compile().unwrap().matches(&doc));
        assert!(!Predicate::eq("type", "news").compile().unwrap().matches(&doc));
        assert!(Predicate::is_in("type", ["news", "discuss"])
            .compile()
            .unwrap()
            .matches(&doc));
    }

    #[test]
    fn regex_with_options() {
        let doc = post();
        let sensitive = Predicate::regex("title", "newton");
        assert!(!sensitive.compile().unwrap().matches(&doc));
        let insensitive = sensitive.case_insensitive();
        assert!(insensitive.compile().unwrap().matches(&doc));
        assert_eq!(
            insensitive.to_document(),
            doc! { "title": { "$regex": "newton", "$options": "i" } }
        );
        assert!(matches!(
            Predicate::regex("title", "(").compile(),
            Err(StoreError::InvalidFilter(_))
        ));
    }

    #[test]
    fn conjunction() {
        let doc = post();
        let both = Predicate::eq("type", "discuss").and(Predicate::regex("title", "^Under"));
        assert!(both.compile().unwrap().matches(&doc));
        let neither = both.and(Predicate::eq("likes", 5));
        assert!(!neither.compile().unwrap().matches(&doc));
        assert!(Predicate::all().compile().unwrap().matches(&doc));
        assert_eq!(Predicate::all().to_document(), Document::new());
    }

    #[test]
    fn renders_query_documents() {
        let id = ObjectId::new();
        assert_eq!(Predicate::by_id(id).to_document(), doc! { "_id": { "$eq": id } });
        assert_eq!(
            Predicate::is_in("section_id", [id]).to_document(),
            doc! { "section_id": { "$in": [id] } }
        );
    }
}
