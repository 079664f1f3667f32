use serde_json::{Map, Value};
use std::fmt::{Display, Formatter};

use crate::error::{EngineError, FieldProblem};

pub const BAD_REQUEST: u16 = 400;
pub const NOT_FOUND: u16 = 404;
pub const CONFLICT: u16 = 409;
pub const INTERNAL_SERVER_ERROR: u16 = 500;
pub const SERVICE_UNAVAILABLE: u16 = 503;

/// Implements [RFC7807](https://tools.ietf.org/html/rfc7807).
///
/// `status` is the HTTP status the API layer should answer with.
#[derive(Debug, Clone, PartialEq)]
pub struct Problem {
    pub status: u16,
    pub type_uri: String,
    pub title: String,

    pub detail: Option<String>,
    pub instance_uri: Option<String>,

    pub body: Map<String, Value>,
}

impl Default for Problem {
    fn default() -> Self {
        Problem {
            status: INTERNAL_SERVER_ERROR,
            type_uri: "about:blank".to_string(),
            title: "Problem".to_string(),
            detail: None,
            instance_uri: None,
            body: Map::new(),
        }
    }
}

impl Problem {
    pub fn new(status: u16, type_uri: impl ToString, title: impl ToString) -> Problem {
        Problem {
            status,
            type_uri: type_uri.to_string(),
            title: title.to_string(),
            ..Default::default()
        }
    }

    pub fn new_untyped(status: u16, title: impl ToString) -> Problem {
        Problem::new(status, "about:blank", title)
    }

    pub fn detail(&mut self, value: impl ToString) -> &mut Problem {
        self.detail = Some(value.to_string());
        self
    }

    pub fn instance_uri(&mut self, value: String) -> &mut Problem {
        self.instance_uri = Some(value);
        self
    }

    pub fn insert_json_value(&mut self, key: impl ToString, value: Value) -> &mut Problem {
        self.body.insert(key.to_string(), value);
        self
    }

    pub fn insert_str(&mut self, key: impl ToString, value: impl ToString) -> &mut Problem {
        self.body
            .insert(key.to_string(), Value::String(value.to_string()));
        self
    }

    /// The `application/problem+json` body.
    pub fn to_json(&self) -> Value {
        let mut body = self.body.clone();

        // Following are required by rfc7807
        body.insert(String::from("type"), Value::from(self.type_uri.clone()));
        body.insert(String::from("title"), Value::from(self.title.clone()));

        // Optional parameters as specified by rfc7807
        if let Some(detail) = &self.detail {
            body.insert(String::from("detail"), Value::from(detail.clone()));
        }
        body.insert(String::from("status"), Value::from(self.status));
        if let Some(instance) = &self.instance_uri {
            body.insert(String::from("instance"), Value::from(instance.clone()));
        }

        Value::Object(body)
    }
}

impl Display for Problem {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.status, self.title)
    }
}

fn problem_entry(problem: &FieldProblem) -> Value {
    let mut entry = Map::new();
    if let Some(op) = problem.op {
        entry.insert("op".to_string(), Value::from(op));
    }
    if let Some(entity) = problem.entity {
        entry.insert("entity".to_string(), Value::from(entity.name()));
    }
    entry.insert("field".to_string(), Value::from(problem.field.clone()));
    entry.insert("reason".to_string(), Value::from(problem.reason.to_string()));
    Value::Object(entry)
}

impl From<&EngineError> for Problem {
    fn from(e: &EngineError) -> Self {
        let mut problem = match e {
            EngineError::Validation(problems) => {
                let mut p = Problem::new_untyped(BAD_REQUEST, "The request failed validation.");
                p.insert_json_value(
                    "problems",
                    Value::Array(problems.iter().map(problem_entry).collect()),
                );
                p
            }
            EngineError::NotFound { entity, id } => {
                let mut p = Problem::new_untyped(NOT_FOUND, "Requested record doesn't exist.");
                p.insert_str("entity", entity).insert_str("id", id);
                p
            }
            EngineError::Conflict { .. } => Problem::new_untyped(
                CONFLICT,
                "The request conflicted with a concurrent change. Retry it.",
            ),
            EngineError::TransientStore { .. } => Problem::new_untyped(
                SERVICE_UNAVAILABLE,
                "The database is temporarily unavailable.",
            ),
            EngineError::Registry(_) => Problem::new_untyped(
                INTERNAL_SERVER_ERROR,
                "The server's schema is misconfigured.",
            ),
        };
        problem.detail(e);
        problem
    }
}

impl From<EngineError> for Problem {
    fn from(e: EngineError) -> Self {
        Problem::from(&e)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::error::ProblemReason;
    use crate::schema::EntityKind;

    #[test]
    fn validation_lists_problems() {
        let err = EngineError::validation(FieldProblem::new(
            Some(1),
            Some(EntityKind::Section),
            "classroom_id",
            ProblemReason::Missing,
        ));
        let problem = Problem::from(&err);
        assert_eq!(problem.status, BAD_REQUEST);

        let body = problem.to_json();
        assert_eq!(body["status"], json!(400));
        assert_eq!(body["type"], json!("about:blank"));
        assert_eq!(
            body["problems"],
            json!([{ "op": 1, "entity": "section", "field": "classroom_id", "reason": "required field is missing" }])
        );
    }

    #[test]
    fn not_found_names_the_record() {
        let mut problem = Problem::from(EngineError::not_found(EntityKind::Classroom, "abc"));
        problem.instance_uri("eduweb-admin/plan-cascade/classroom/abc".to_string());

        let body = problem.to_json();
        assert_eq!(body["entity"], json!("classroom"));
        assert_eq!(body["id"], json!("abc"));
        assert_eq!(body["instance"], json!("eduweb-admin/plan-cascade/classroom/abc"));
        assert!(body["detail"].as_str().unwrap().contains("abc"));
        assert_eq!(problem.to_string(), "404: Requested record doesn't exist.");
    }

    #[test]
    fn statuses() {
        let cases = [
            (EngineError::not_found(EntityKind::User, "x"), NOT_FOUND),
            (EngineError::Conflict { reason: "r".into() }, CONFLICT),
            (EngineError::TransientStore { reason: "r".into() }, SERVICE_UNAVAILABLE),
        ];
        for (err, status) in cases {
            assert_eq!(Problem::from(err).status, status);
        }
    }
}
