use std::collections::{HashMap, HashSet};

use thiserror::Error;

use super::{
    Cardinality, Edge, EntityDef, EntityKind, FieldDef, FieldKind, Layout, Location, Placement,
    SnapshotDef,
};

/// Configuration errors in the schema. All of them are fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("unknown entity type '{0}'")]
    UnknownEntityType(String),

    #[error("entity '{0}' is not declared in the registry")]
    Undeclared(EntityKind),

    #[error("entity '{0}' is declared twice")]
    DuplicateEntity(EntityKind),

    #[error("edge {from}.{foreign_key} points at undeclared entity '{target}'")]
    UnknownEdgeTarget {
        from: EntityKind,
        foreign_key: &'static str,
        target: EntityKind,
    },

    #[error("entity '{kind}' is embedded in undeclared entity '{parent}'")]
    UnknownParent { kind: EntityKind, parent: EntityKind },

    #[error("embedding chain of '{0}' never reaches a collection")]
    EmbeddingCycle(EntityKind),

    #[error("cascade edge {from}.{foreign_key} starts at an embedded entity")]
    EmbeddedCascade {
        from: EntityKind,
        foreign_key: &'static str,
    },

    #[error("cascade edges form a cycle through '{0}'")]
    CascadeCycle(EntityKind),

    #[error("cascade from {root} exceeded the depth bound of {depth}")]
    CascadeDepthExceeded { root: EntityKind, depth: usize },
}

/// An edge seen from its target: `source` holds `edge.foreign_key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependent {
    pub source: EntityKind,
    pub edge: Edge,
}

#[derive(Debug)]
pub struct SchemaRegistry {
    layout: Layout,
    order: Vec<EntityKind>,
    entities: HashMap<EntityKind, EntityDef>,
    locations: HashMap<EntityKind, Location>,
    dependents: HashMap<EntityKind, Vec<Dependent>>,
}

impl SchemaRegistry {
    pub fn builder(layout: Layout) -> RegistryBuilder {
        RegistryBuilder::new(layout)
    }

    /// Registry of the built-in education schema for a layout.
    pub fn for_layout(layout: Layout) -> Result<SchemaRegistry, RegistryError> {
        match layout {
            Layout::Normalized => super::layouts::normalized(),
            Layout::Denormalized => super::layouts::denormalized(),
        }
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn entity(&self, kind: EntityKind) -> Result<&EntityDef, RegistryError> {
        self.entities
            .get(&kind)
            .ok_or(RegistryError::Undeclared(kind))
    }

    /// Polymorphic lookup by entity type name.
    pub fn lookup(&self, name: &str) -> Result<&EntityDef, RegistryError> {
        self.entity(name.parse()?)
    }

    /// Entities in declaration order.
    pub fn entities(&self) -> impl Iterator<Item = &EntityDef> {
        self.order.iter().filter_map(|kind| self.entities.get(kind))
    }

    pub fn edges_from(&self, kind: EntityKind) -> Result<&[Edge], RegistryError> {
        Ok(&self.entity(kind)?.edges)
    }

    /// Edges pointing at `kind`, in declaration order of their sources.
    pub fn dependents_of(&self, kind: EntityKind) -> &[Dependent] {
        self.dependents
            .get(&kind)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn location(&self, kind: EntityKind) -> Result<&Location, RegistryError> {
        self.locations
            .get(&kind)
            .ok_or(RegistryError::Undeclared(kind))
    }

    /// Collection-placed entity whose documents hold `kind`.
    pub fn root_of(&self, kind: EntityKind) -> Result<EntityKind, RegistryError> {
        let mut current = kind;
        while let Placement::Embedded { parent, .. } = self.entity(current)?.placement {
            current = parent;
        }
        Ok(current)
    }

    /// `root` and every entity embedded, at any depth, in its documents.
    /// Root first, then in declaration order.
    pub fn document_entities(
        &self,
        root: EntityKind,
    ) -> Result<Vec<(&EntityDef, &Location)>, RegistryError> {
        let mut out = Vec::new();
        for def in self.entities() {
            if self.root_of(def.kind)? == root {
                out.push((def, self.location(def.kind)?));
            }
        }
        out.sort_by_key(|(def, _)| def.kind != root);
        Ok(out)
    }

    /// Entities stored directly inside documents of `kind`.
    pub fn embedded_children(&self, kind: EntityKind) -> impl Iterator<Item = &EntityDef> {
        self.entities().filter(move |def| {
            matches!(def.placement, Placement::Embedded { parent, .. } if parent == kind)
        })
    }
}

#[derive(Debug)]
pub struct RegistryBuilder {
    layout: Layout,
    entities: Vec<EntityDef>,
}

impl RegistryBuilder {
    pub fn new(layout: Layout) -> Self {
        RegistryBuilder {
            layout,
            entities: Vec::new(),
        }
    }

    /// Declare an entity stored in its own collection.
    pub fn collection(&mut self, kind: EntityKind) -> EntityBuilder<'_> {
        self.entity(kind, Placement::Collection(kind.name()))
    }

    /// Declare an entity stored inside documents of `parent` under `path`.
    pub fn embedded(
        &mut self,
        kind: EntityKind,
        parent: EntityKind,
        path: &'static str,
        cardinality: Cardinality,
    ) -> EntityBuilder<'_> {
        self.entity(
            kind,
            Placement::Embedded {
                parent,
                path,
                cardinality,
            },
        )
    }

    fn entity(&mut self, kind: EntityKind, placement: Placement) -> EntityBuilder<'_> {
        EntityBuilder {
            builder: self,
            def: EntityDef {
                kind,
                placement,
                fields: Vec::new(),
                edges: Vec::new(),
                snapshots: Vec::new(),
            },
        }
    }

    pub fn build(self) -> Result<SchemaRegistry, RegistryError> {
        let mut entities = HashMap::new();
        let mut order = Vec::new();
        for def in self.entities {
            if entities.contains_key(&def.kind) {
                return Err(RegistryError::DuplicateEntity(def.kind));
            }
            order.push(def.kind);
            entities.insert(def.kind, def);
        }

        let mut dependents: HashMap<EntityKind, Vec<Dependent>> = HashMap::new();
        for kind in &order {
            let def = &entities[kind];

            if let Placement::Embedded { parent, .. } = def.placement {
                if !entities.contains_key(&parent) {
                    return Err(RegistryError::UnknownParent {
                        kind: def.kind,
                        parent,
                    });
                }
            }

            for edge in &def.edges {
                if !entities.contains_key(&edge.target) {
                    return Err(RegistryError::UnknownEdgeTarget {
                        from: def.kind,
                        foreign_key: edge.foreign_key,
                        target: edge.target,
                    });
                }
                if edge.cascade && !def.is_root() {
                    return Err(RegistryError::EmbeddedCascade {
                        from: def.kind,
                        foreign_key: edge.foreign_key,
                    });
                }
                dependents.entry(edge.target).or_default().push(Dependent {
                    source: def.kind,
                    edge: edge.clone(),
                });
            }
        }

        let mut locations = HashMap::new();
        for kind in &order {
            locations.insert(*kind, resolve_location(*kind, &entities)?);
        }

        check_cascade_acyclic(&order, &dependents)?;

        Ok(SchemaRegistry {
            layout: self.layout,
            order,
            entities,
            locations,
            dependents,
        })
    }
}

fn resolve_location(
    kind: EntityKind,
    entities: &HashMap<EntityKind, EntityDef>,
) -> Result<Location, RegistryError> {
    let mut segments = Vec::new();
    let mut current = kind;

    // An embedding chain longer than the number of entities loops.
    for _ in 0..=entities.len() {
        match &entities[&current].placement {
            Placement::Collection(collection) => {
                segments.reverse();
                let prefix = segments
                    .iter()
                    .map(|segment| format!("{}.", segment))
                    .collect();
                return Ok(Location {
                    collection: *collection,
                    prefix,
                });
            }
            Placement::Embedded { parent, path, .. } => {
                segments.push(*path);
                current = *parent;
            }
        }
    }

    Err(RegistryError::EmbeddingCycle(kind))
}

fn check_cascade_acyclic(
    order: &[EntityKind],
    dependents: &HashMap<EntityKind, Vec<Dependent>>,
) -> Result<(), RegistryError> {
    fn visit(
        kind: EntityKind,
        dependents: &HashMap<EntityKind, Vec<Dependent>>,
        on_path: &mut HashSet<EntityKind>,
        done: &mut HashSet<EntityKind>,
    ) -> Result<(), RegistryError> {
        if done.contains(&kind) {
            return Ok(());
        }
        if !on_path.insert(kind) {
            return Err(RegistryError::CascadeCycle(kind));
        }
        for dependent in dependents.get(&kind).into_iter().flatten() {
            if dependent.edge.cascade {
                visit(dependent.source, dependents, on_path, done)?;
            }
        }
        on_path.remove(&kind);
        done.insert(kind);
        Ok(())
    }

    let mut done = HashSet::new();
    for kind in order {
        visit(*kind, dependents, &mut HashSet::new(), &mut done)?;
    }
    Ok(())
}

pub struct EntityBuilder<'a> {
    builder: &'a mut RegistryBuilder,
    def: EntityDef,
}

impl<'a> EntityBuilder<'a> {
    pub fn field(mut self, name: &'static str, kind: FieldKind, required: bool) -> Self {
        self.def.fields.push(FieldDef {
            name,
            kind,
            required,
        });
        self
    }

    /// Required text field.
    pub fn text(self, name: &'static str) -> Self {
        self.field(name, FieldKind::Text, true)
    }

    /// Single-id foreign key. The field itself is declared as required.
    pub fn reference(mut self, foreign_key: &'static str, target: EntityKind, cascade: bool) -> Self {
        self.def.edges.push(Edge {
            target,
            foreign_key,
            cardinality: Cardinality::One,
            cascade,
        });
        self.field(foreign_key, FieldKind::Id, true)
    }

    /// Array-of-ids foreign key.
    pub fn references(mut self, foreign_key: &'static str, target: EntityKind, cascade: bool) -> Self {
        self.def.edges.push(Edge {
            target,
            foreign_key,
            cardinality: Cardinality::Many,
            cascade,
        });
        self
    }

    pub fn snapshot(mut self, field: &'static str, of: EntityKind, cardinality: Cardinality) -> Self {
        self.def.snapshots.push(SnapshotDef {
            field,
            of,
            cardinality,
        });
        self
    }

    pub fn done(self) {
        self.builder.entities.push(self.def);
    }
}
