use tracing::info;

use crate::error::EngineError;
use crate::schema::{EntityKind, SchemaRegistry};
use crate::store::{DocumentStore, IndexSpec};

const UNIQUE: [(EntityKind, &str); 2] = [(EntityKind::User, "email"), (EntityKind::User, "username")];

/// Frequently filtered fields.
const LOOKUPS: [(EntityKind, &str); 3] = [
    (EntityKind::Classroom, "teacher_id"),
    (EntityKind::SectionFile, "section_id"),
    (EntityKind::ForumPost, "type"),
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexPlan {
    indexes: Vec<IndexSpec>,
}

impl IndexPlan {
    pub fn for_registry(registry: &SchemaRegistry) -> Result<IndexPlan, EngineError> {
        let mut plan = IndexPlan::default();

        for (kind, field) in UNIQUE {
            plan.add(registry, kind, field, true)?;
        }
        for (kind, field) in LOOKUPS {
            // Only where the layout keeps the field at all.
            if registry.entity(kind)?.field(field).is_some() {
                plan.add(registry, kind, field, false)?;
            }
        }
        for def in registry.entities() {
            for edge in &def.edges {
                plan.add(registry, def.kind, edge.foreign_key, false)?;
            }
        }

        Ok(plan)
    }

    fn add(
        &mut self,
        registry: &SchemaRegistry,
        kind: EntityKind,
        field: &str,
        unique: bool,
    ) -> Result<(), EngineError> {
        let location = registry.location(kind)?;
        let index = IndexSpec {
            collection: location.collection.to_string(),
            field: location.path(field),
            unique,
        };
        let exists = self
            .indexes
            .iter()
            .any(|i| i.collection == index.collection && i.field == index.field);
        if !exists {
            self.indexes.push(index);
        }
        Ok(())
    }

    pub fn indexes(&self) -> &[IndexSpec] {
        &self.indexes
    }

    /// Creates every index of the plan. Existing indexes are left alone.
    pub async fn apply<S: DocumentStore>(&self, store: &S) -> Result<usize, EngineError> {
        for index in &self.indexes {
            store.create_index(index).await?;
            info!("Ensured index {}", index);
        }
        Ok(self.indexes.len())
    }
}
