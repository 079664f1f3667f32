use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

mod layouts;
pub mod registry;

pub use registry::{Dependent, EntityBuilder, RegistryBuilder, RegistryError, SchemaRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntityKind {
    User,
    Subject,
    Classroom,
    Section,
    SectionFile,
    Submission,
    SubmissionFile,
    Participant,
    TestQuestion,
    Question,
    Answer,
    ForumPost,
    ForumComment,
}

impl EntityKind {
    pub const ALL: [EntityKind; 13] = [
        EntityKind::User,
        EntityKind::Subject,
        EntityKind::Classroom,
        EntityKind::Section,
        EntityKind::SectionFile,
        EntityKind::Submission,
        EntityKind::SubmissionFile,
        EntityKind::Participant,
        EntityKind::TestQuestion,
        EntityKind::Question,
        EntityKind::Answer,
        EntityKind::ForumPost,
        EntityKind::ForumComment,
    ];

    /// Canonical name, also used as the collection name when the entity
    /// lives in its own collection.
    pub fn name(self) -> &'static str {
        match self {
            EntityKind::User => "user",
            EntityKind::Subject => "subject",
            EntityKind::Classroom => "classroom",
            EntityKind::Section => "section",
            EntityKind::SectionFile => "sectionFile",
            EntityKind::Submission => "submission",
            EntityKind::SubmissionFile => "submissionFile",
            EntityKind::Participant => "participant",
            EntityKind::TestQuestion => "testQuestion",
            EntityKind::Question => "question",
            EntityKind::Answer => "answer",
            EntityKind::ForumPost => "forumPost",
            EntityKind::ForumComment => "forumComment",
        }
    }
}

impl Display for EntityKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

fn fold_name(name: &str) -> String {
    name.chars()
        .filter(|c| *c != '_' && *c != '-')
        .flat_map(char::to_lowercase)
        .collect()
}

impl FromStr for EntityKind {
    type Err = RegistryError;

    /// Accepts `forumPost`, `ForumPost`, `forum_post` and `forum-post`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let folded = fold_name(s);
        EntityKind::ALL
            .into_iter()
            .find(|kind| fold_name(kind.name()) == folded)
            .ok_or_else(|| RegistryError::UnknownEntityType(s.to_string()))
    }
}

/// Physical layout of a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layout {
    /// One collection per entity kind, linked by id fields.
    #[default]
    Normalized,
    /// Classroom documents embed their dependents as sub-documents.
    Denormalized,
}

impl FromStr for Layout {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "normalized" => Ok(Layout::Normalized),
            "denormalized" => Ok(Layout::Denormalized),
            other => Err(format!("unknown layout '{}'", other)),
        }
    }
}

impl Display for Layout {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Layout::Normalized => write!(f, "normalized"),
            Layout::Denormalized => write!(f, "denormalized"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    /// Text containing an `@`.
    Email,
    Bool,
    /// An entity id. Accepts an ObjectId or its 24 character hex form.
    Id,
    /// One of the [`Role`](crate::role::Role) names.
    Role,
}

impl FieldKind {
    pub fn describe(self) -> &'static str {
        match self {
            FieldKind::Text => "string",
            FieldKind::Email => "e-mail address",
            FieldKind::Bool => "boolean",
            FieldKind::Id => "object id",
            FieldKind::Role => "role (student, teacher or admin)",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDef {
    pub name: &'static str,
    pub kind: FieldKind,
    pub required: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cardinality {
    One,
    Many,
}

/// A foreign-key edge pointing from a dependent entity to its parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    pub target: EntityKind,
    pub foreign_key: &'static str,
    /// `One` holds a single id, `Many` an array of ids.
    pub cardinality: Cardinality,
    /// Deleting the target deletes the dependent. Non-cascading edges
    /// restrict deletion of the target instead.
    pub cascade: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    Collection(&'static str),
    Embedded {
        parent: EntityKind,
        path: &'static str,
        cardinality: Cardinality,
    },
}

/// Point-in-time copy of another entity stored inside a document.
///
/// Snapshots are never resynchronized with their source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotDef {
    pub field: &'static str,
    pub of: EntityKind,
    pub cardinality: Cardinality,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityDef {
    pub kind: EntityKind,
    pub placement: Placement,
    pub fields: Vec<FieldDef>,
    pub edges: Vec<Edge>,
    pub snapshots: Vec<SnapshotDef>,
}

impl EntityDef {
    pub fn is_root(&self) -> bool {
        matches!(self.placement, Placement::Collection(_))
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn edge(&self, foreign_key: &str) -> Option<&Edge> {
        self.edges.iter().find(|e| e.foreign_key == foreign_key)
    }
}

/// Where documents of an entity kind physically live.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Location {
    pub collection: &'static str,
    /// Dotted path from the root document down to the entity, with a
    /// trailing dot. Empty for root entities.
    pub prefix: String,
}

impl Location {
    pub fn path(&self, field: &str) -> String {
        format!("{}{}", self.prefix, field)
    }

    pub fn is_root(&self) -> bool {
        self.prefix.is_empty()
    }
}
