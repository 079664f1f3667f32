use std::fmt::{Display, Formatter};
use std::str::FromStr;

use bson::oid::ObjectId;
use bson::{doc, Bson, Document};

pub mod value;

/// Key of a placeholder document standing for an id generated in the
/// same batch.
pub const OP_REF_KEY: &str = "$op";

/// Placeholder for the id generated for the insert at `index` in the same
/// batch. Usable in any id-typed field of another op's document.
pub fn op_ref(index: usize) -> Bson {
    Bson::Document(doc! { OP_REF_KEY: index as i64 })
}

/// Target of an update or delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdRef {
    Id(ObjectId),
    /// Id generated for the insert at this index of the batch.
    Op(usize),
}

impl From<ObjectId> for IdRef {
    fn from(id: ObjectId) -> Self {
        IdRef::Id(id)
    }
}

impl FromStr for IdRef {
    type Err = bson::oid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ObjectId::parse_str(s).map(IdRef::Id)
    }
}

impl Display for IdRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            IdRef::Id(id) => write!(f, "{}", id),
            IdRef::Op(index) => write!(f, "ops[{}]", index),
        }
    }
}

impl IdRef {
    /// Reads an id-typed field value.
    ///
    /// Accepts an ObjectId, its 24 character hex form, or an [`op_ref`]
    /// placeholder. Anything else is returned back as its display form for
    /// error reporting.
    pub fn from_bson(value: &Bson) -> Result<IdRef, String> {
        match value {
            Bson::ObjectId(id) => Ok(IdRef::Id(*id)),
            Bson::String(s) => ObjectId::parse_str(s)
                .map(IdRef::Id)
                .map_err(|_| s.clone()),
            Bson::Document(d) if d.len() == 1 => match d.get(OP_REF_KEY) {
                Some(Bson::Int32(i)) if *i >= 0 => Ok(IdRef::Op(*i as usize)),
                Some(Bson::Int64(i)) if *i >= 0 => Ok(IdRef::Op(*i as usize)),
                _ => Err(value.to_string()),
            },
            other => Err(other.to_string()),
        }
    }
}

/// Object ids stored at `path`, including the elements of id arrays.
pub fn ids_at(doc: &Document, path: &str) -> Vec<ObjectId> {
    let mut out = Vec::new();
    for value in value::values_at(doc, path) {
        match value {
            Bson::ObjectId(id) => out.push(*id),
            Bson::Array(items) => out.extend(items.iter().filter_map(Bson::as_object_id)),
            _ => {}
        }
    }
    out
}
