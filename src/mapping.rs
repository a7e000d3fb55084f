//! Entity metadata: mappings supplied by the application and the persisters built from them.
//!
//! A [`Metamodel`] is built once and shared by every session of a factory. Property access goes through a fixed
//! [`AccessorTable`] resolved at build time; inheritance is a [`InheritanceStrategy`] value on the root of a hierarchy
//! rather than a hierarchy of persister types.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

use crate::cascade::CascadeStyle;
use crate::error::OrmError;
use crate::error::Result;
use crate::instance::CollectionRef;
use crate::instance::EntityRef;
use crate::key::CollectionKey;
use crate::key::EntityKey;
use crate::key::TenantId;
use crate::types::Identifier;
use crate::types::IdentifierType;
use crate::types::Value;

/// How identifiers of new entities are obtained.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum IdGenerator {
    /// The application sets the identifier before `persist`.
    #[default]
    Assigned,
    /// Drawn from the storage before the insert is queued.
    Sequence,
    /// Produced by the storage when the row is inserted. Such inserts are executed early, at `persist` time.
    Identity,
    /// Random UUID text identifier.
    Uuid,
}

impl IdGenerator {
    #[inline]
    pub fn is_assigned(&self) -> bool {
        matches!(self, IdGenerator::Assigned)
    }

    #[inline]
    pub fn generates_on_insert(&self) -> bool {
        matches!(self, IdGenerator::Identity)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum InheritanceStrategy {
    /// Whole hierarchy in the root table.
    #[default]
    SingleTable,
    /// One table per class, rows joined by identifier.
    Joined,
    /// One complete table per concrete class.
    UnionSubclass,
}

#[derive(Clone, Debug)]
pub enum PropertyKind {
    Basic,
    /// Integer version used for optimistic locking. At most one per hierarchy.
    Version,
    ManyToOne {
        target:  Arc<str>,
        cascade: CascadeStyle,
        lazy:    bool,
    },
    /// One-to-many collection persisted as rows of `(owner id, element id)`.
    Collection {
        element: Arc<str>,
        cascade: CascadeStyle,
        lazy:    bool,
    },
}

#[derive(Clone, Debug)]
pub struct PropertyMapping {
    name:     Arc<str>,
    kind:     PropertyKind,
    nullable: bool,
}

impl PropertyMapping {
    #[inline]
    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    #[inline]
    pub fn kind(&self) -> &PropertyKind {
        &self.kind
    }

    #[inline]
    pub fn is_nullable(&self) -> bool {
        self.nullable
    }

    pub fn cascade(&self) -> CascadeStyle {
        match self.kind {
            PropertyKind::ManyToOne { cascade, .. } | PropertyKind::Collection { cascade, .. } => cascade,
            _ => CascadeStyle::none(),
        }
    }

    #[inline]
    pub fn is_association(&self) -> bool {
        matches!(
            self.kind,
            PropertyKind::ManyToOne { .. } | PropertyKind::Collection { .. }
        )
    }

    #[inline]
    pub fn is_collection(&self) -> bool {
        matches!(self.kind, PropertyKind::Collection { .. })
    }

    pub fn is_lazy(&self) -> bool {
        match self.kind {
            PropertyKind::ManyToOne { lazy, .. } | PropertyKind::Collection { lazy, .. } => lazy,
            _ => false,
        }
    }

    pub fn target_entity(&self) -> Option<&Arc<str>> {
        match self.kind {
            PropertyKind::ManyToOne { ref target, .. } => Some(target),
            PropertyKind::Collection { ref element, .. } => Some(element),
            _ => None,
        }
    }
}

/// Mapping of one entity type as supplied by the application.
///
/// ```ignore
/// let parent = EntityMapping::new("Parent")
///     .id_generator(IdGenerator::Sequence)
///     .version("version")
///     .property("name")
///     .one_to_many("children", "Child", CascadeStyle::all_delete_orphan())
///     .cacheable(true);
/// ```
#[derive(Clone, Debug)]
pub struct EntityMapping {
    name:         Arc<str>,
    table:        Option<String>,
    extends:      Option<Arc<str>>,
    strategy:     Option<InheritanceStrategy>,
    id_generator: IdGenerator,
    id_type:      IdentifierType,
    properties:   Vec<PropertyMapping>,
    cacheable:    bool,
}

impl EntityMapping {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            name:         name.into(),
            table:        None,
            extends:      None,
            strategy:     None,
            id_generator: IdGenerator::default(),
            id_type:      IdentifierType::Int,
            properties:   Vec::new(),
            cacheable:    false,
        }
    }

    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    /// Declares this entity a subclass of `parent`.
    pub fn extends(mut self, parent: impl Into<Arc<str>>) -> Self {
        self.extends = Some(parent.into());
        self
    }

    /// Storage strategy of the hierarchy. Only valid on a root entity.
    pub fn inheritance(mut self, strategy: InheritanceStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn id_generator(mut self, generator: IdGenerator) -> Self {
        self.id_generator = generator;
        if generator == IdGenerator::Uuid {
            self.id_type = IdentifierType::Text;
        }
        self
    }

    pub fn id_type(mut self, id_type: IdentifierType) -> Self {
        self.id_type = id_type;
        self
    }

    pub fn cacheable(mut self, cacheable: bool) -> Self {
        self.cacheable = cacheable;
        self
    }

    fn push(mut self, name: impl Into<Arc<str>>, kind: PropertyKind, nullable: bool) -> Self {
        self.properties.push(PropertyMapping {
            name: name.into(),
            kind,
            nullable,
        });
        self
    }

    pub fn property(self, name: impl Into<Arc<str>>) -> Self {
        self.push(name, PropertyKind::Basic, true)
    }

    pub fn required_property(self, name: impl Into<Arc<str>>) -> Self {
        self.push(name, PropertyKind::Basic, false)
    }

    pub fn version(self, name: impl Into<Arc<str>>) -> Self {
        self.push(name, PropertyKind::Version, false)
    }

    pub fn many_to_one(self, name: impl Into<Arc<str>>, target: impl Into<Arc<str>>, cascade: CascadeStyle) -> Self {
        self.push(
            name,
            PropertyKind::ManyToOne {
                target: target.into(),
                cascade,
                lazy: true,
            },
            true,
        )
    }

    /// Many-to-one association resolved when the owner is loaded.
    pub fn eager_many_to_one(
        self,
        name: impl Into<Arc<str>>,
        target: impl Into<Arc<str>>,
        cascade: CascadeStyle,
    ) -> Self {
        self.push(
            name,
            PropertyKind::ManyToOne {
                target: target.into(),
                cascade,
                lazy: false,
            },
            true,
        )
    }

    pub fn one_to_many(self, name: impl Into<Arc<str>>, element: impl Into<Arc<str>>, cascade: CascadeStyle) -> Self {
        self.push(
            name,
            PropertyKind::Collection {
                element: element.into(),
                cascade,
                lazy: true,
            },
            true,
        )
    }

    /// Collection initialized right after its owner finishes loading.
    pub fn eager_one_to_many(
        self,
        name: impl Into<Arc<str>>,
        element: impl Into<Arc<str>>,
        cascade: CascadeStyle,
    ) -> Self {
        self.push(
            name,
            PropertyKind::Collection {
                element: element.into(),
                cascade,
                lazy: false,
            },
            true,
        )
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Resolved accessor for one property slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PropertyAccessor {
    index: usize,
}

impl PropertyAccessor {
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline]
    pub fn get(&self, entity: &EntityRef) -> Result<Value> {
        entity.value(self.index)
    }

    #[inline]
    pub fn set(&self, entity: &EntityRef, value: Value) -> Result<()> {
        entity.set_value(self.index, value)
    }
}

/// Name to slot table of a persistent type.
#[derive(Clone, Debug, Default)]
pub struct AccessorTable {
    names: Vec<Arc<str>>,
    index: HashMap<Arc<str>, usize>,
}

impl AccessorTable {
    fn new(properties: &[PropertyMapping]) -> Self {
        let names: Vec<Arc<str>> = properties.iter().map(|p| p.name.clone()).collect();
        let index = names.iter().enumerate().map(|(i, n)| (n.clone(), i)).collect();
        Self { names, index }
    }

    pub fn accessor(&self, name: &str) -> Option<PropertyAccessor> {
        self.index.get(name).map(|&index| PropertyAccessor { index })
    }

    #[inline]
    pub fn names(&self) -> &[Arc<str>] {
        &self.names
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Optional features of a persister.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PersisterCapabilities {
    /// Slot of the version property.
    pub versioning:  Option<usize>,
    pub caching:     bool,
    pub multi_table: bool,
}

/// Runtime metadata of one entity type.
#[derive(Debug)]
pub struct EntityPersister {
    entity_name:       Arc<str>,
    root_entity_name:  Arc<str>,
    super_entity_name: Option<Arc<str>>,
    // All descendants, sorted by name.
    subclasses:        Vec<Arc<str>>,
    strategy:          InheritanceStrategy,
    // Tables from the root down to this entity.
    table_chain:       Vec<String>,
    descendant_tables: Vec<String>,
    capabilities:      PersisterCapabilities,
    id_generator:      IdGenerator,
    id_type:           IdentifierType,
    properties:        Vec<PropertyMapping>,
    accessors:         AccessorTable,
    fk_rank:           usize,
}

impl EntityPersister {
    #[inline]
    pub fn entity_name(&self) -> &Arc<str> {
        &self.entity_name
    }

    #[inline]
    pub fn root_entity_name(&self) -> &Arc<str> {
        &self.root_entity_name
    }

    #[inline]
    pub fn super_entity_name(&self) -> Option<&Arc<str>> {
        self.super_entity_name.as_ref()
    }

    #[inline]
    pub fn strategy(&self) -> InheritanceStrategy {
        self.strategy
    }

    #[inline]
    pub fn capabilities(&self) -> PersisterCapabilities {
        self.capabilities
    }

    #[inline]
    pub fn is_versioned(&self) -> bool {
        self.capabilities.versioning.is_some()
    }

    #[inline]
    pub fn version_index(&self) -> Option<usize> {
        self.capabilities.versioning
    }

    #[inline]
    pub fn is_cacheable(&self) -> bool {
        self.capabilities.caching
    }

    #[inline]
    pub fn id_generator(&self) -> IdGenerator {
        self.id_generator
    }

    #[inline]
    pub fn id_type(&self) -> IdentifierType {
        self.id_type
    }

    #[inline]
    pub fn properties(&self) -> &[PropertyMapping] {
        &self.properties
    }

    #[inline]
    pub fn property_names(&self) -> &[Arc<str>] {
        self.accessors.names()
    }

    #[inline]
    pub fn accessors(&self) -> &AccessorTable {
        &self.accessors
    }

    /// Position in the insert order of entity types. Referenced types rank lower.
    #[inline]
    pub fn fk_rank(&self) -> usize {
        self.fk_rank
    }

    pub fn accessor(&self, property: &str) -> Result<PropertyAccessor> {
        self.accessors.accessor(property).ok_or_else(|| {
            OrmError::IllegalArgument(format!("entity '{}' has no property '{property}'", self.entity_name))
        })
    }

    /// Table of the concrete class; the root table for single-table hierarchies.
    pub fn table(&self) -> &str {
        match self.strategy {
            InheritanceStrategy::SingleTable => &self.table_chain[0],
            InheritanceStrategy::Joined | InheritanceStrategy::UnionSubclass => {
                &self.table_chain[self.table_chain.len() - 1]
            }
        }
    }

    /// Tables written by an insert of this entity, in insert order.
    pub fn write_tables(&self) -> Vec<&str> {
        match self.strategy {
            InheritanceStrategy::SingleTable | InheritanceStrategy::UnionSubclass => vec![self.table()],
            InheritanceStrategy::Joined => self.table_chain.iter().map(String::as_str).collect(),
        }
    }

    /// Tables a polymorphic query over this entity reads.
    pub fn query_spaces(&self) -> Vec<String> {
        let mut spaces = match self.strategy {
            InheritanceStrategy::SingleTable => vec![self.table_chain[0].clone()],
            InheritanceStrategy::Joined => self
                .table_chain
                .iter()
                .chain(self.descendant_tables.iter())
                .cloned()
                .collect(),
            InheritanceStrategy::UnionSubclass => std::iter::once(self.table().to_string())
                .chain(self.descendant_tables.iter().cloned())
                .collect(),
        };
        spaces.sort();
        spaces.dedup();
        spaces
    }

    pub fn is_subclass_entity_name(&self, name: &str) -> bool {
        *self.entity_name == *name || self.subclasses.iter().any(|s| **s == *name)
    }

    pub fn subclass_entity_names(&self) -> &[Arc<str>] {
        &self.subclasses
    }

    /// Role name of a collection property. Roles are qualified by the root entity so subclasses share them.
    pub fn collection_role(&self, property: &str) -> String {
        format!("{}.{property}", self.root_entity_name)
    }

    pub fn entity_key(&self, id: Identifier, tenant: &TenantId) -> EntityKey {
        EntityKey::new(self.root_entity_name.clone(), id, tenant.clone())
    }

    pub fn version_of(&self, state: &[Value]) -> Option<i64> {
        self.capabilities
            .versioning
            .and_then(|i| state.get(i))
            .and_then(Value::as_int)
    }

    pub fn check_identifier_kind(&self, id: &Identifier) -> bool {
        id.kind() == self.id_type
    }

    /// A transient instance with every basic property null and an empty collection per collection property.
    pub fn instantiate(&self) -> EntityRef {
        let state = self
            .properties
            .iter()
            .map(|p| match p.kind {
                PropertyKind::Collection { .. } => Value::Collection(CollectionRef::new(self.collection_role(&p.name))),
                _ => Value::Null,
            })
            .collect();
        EntityRef::new_initialized(self.entity_name.clone(), None, state)
    }
}

/// Runtime metadata of a collection role.
#[derive(Debug)]
pub struct CollectionPersister {
    role:           Arc<str>,
    owner:          Arc<str>,
    property_index: usize,
    element:        Arc<str>,
    table:          String,
    cascade:        CascadeStyle,
    lazy:           bool,
}

impl CollectionPersister {
    #[inline]
    pub fn role(&self) -> &Arc<str> {
        &self.role
    }

    #[inline]
    pub fn owner_entity_name(&self) -> &Arc<str> {
        &self.owner
    }

    #[inline]
    pub fn property_index(&self) -> usize {
        self.property_index
    }

    #[inline]
    pub fn element_entity_name(&self) -> &Arc<str> {
        &self.element
    }

    #[inline]
    pub fn table(&self) -> &str {
        &self.table
    }

    #[inline]
    pub fn cascade(&self) -> CascadeStyle {
        self.cascade
    }

    #[inline]
    pub fn is_lazy(&self) -> bool {
        self.lazy
    }

    #[inline]
    pub fn has_orphan_delete(&self) -> bool {
        self.cascade.has_orphan_delete()
    }

    pub fn collection_key(&self, owner_id: Identifier, tenant: &TenantId) -> CollectionKey {
        CollectionKey::new(self.role.clone(), owner_id, tenant.clone())
    }
}

/// All persisters of a factory.
#[derive(Debug)]
pub struct Metamodel {
    entities:    HashMap<Arc<str>, Arc<EntityPersister>>,
    collections: HashMap<Arc<str>, Arc<CollectionPersister>>,
}

impl Metamodel {
    pub fn builder() -> MetamodelBuilder {
        MetamodelBuilder::default()
    }

    pub fn entity_persister(&self, entity_name: &str) -> Result<&Arc<EntityPersister>> {
        self.entities
            .get(entity_name)
            .ok_or_else(|| OrmError::IllegalArgument(format!("unknown entity '{entity_name}'")))
    }

    pub fn collection_persister(&self, role: &str) -> Result<&Arc<CollectionPersister>> {
        self.collections
            .get(role)
            .ok_or_else(|| OrmError::IllegalArgument(format!("unknown collection role '{role}'")))
    }

    pub fn persister_of(&self, entity: &EntityRef) -> Result<&Arc<EntityPersister>> {
        self.entity_persister(&entity.entity_name())
    }

    pub fn entity_names(&self) -> impl Iterator<Item = &Arc<str>> {
        self.entities.keys()
    }

    pub fn persisters(&self) -> impl Iterator<Item = &Arc<EntityPersister>> {
        self.entities.values()
    }

    pub fn instantiate(&self, entity_name: &str) -> Result<EntityRef> {
        Ok(self.entity_persister(entity_name)?.instantiate())
    }

    /// A transient instance carrying an application-assigned identifier.
    pub fn instantiate_with_id(&self, entity_name: &str, id: impl Into<Identifier>) -> Result<EntityRef> {
        let persister = self.entity_persister(entity_name)?;
        let id = id.into();
        if !persister.check_identifier_kind(&id) {
            return Err(OrmError::IllegalArgument(format!(
                "identifier {id} has the wrong type for entity '{entity_name}'"
            )));
        }
        let entity = persister.instantiate();
        entity.set_id(Some(id));
        Ok(entity)
    }

    pub fn property(&self, entity: &EntityRef, property: &str) -> Result<Value> {
        self.persister_of(entity)?.accessor(property)?.get(entity)
    }

    pub fn set_property(&self, entity: &EntityRef, property: &str, value: impl Into<Value>) -> Result<()> {
        self.persister_of(entity)?.accessor(property)?.set(entity, value.into())
    }
}

#[derive(Default)]
pub struct MetamodelBuilder {
    mappings: Vec<EntityMapping>,
}

impl MetamodelBuilder {
    pub fn entity(mut self, mapping: EntityMapping) -> Self {
        self.mappings.push(mapping);
        self
    }

    pub fn build(self) -> Result<Metamodel> {
        let mut by_name: BTreeMap<Arc<str>, EntityMapping> = BTreeMap::new();
        for mapping in self.mappings {
            if by_name.contains_key(&mapping.name) {
                return Err(OrmError::Configuration(format!("duplicate entity '{}'", mapping.name)));
            }
            by_name.insert(mapping.name.clone(), mapping);
        }

        // Ancestry chains, root first.
        let mut chains: HashMap<Arc<str>, Vec<Arc<str>>> = HashMap::new();
        for name in by_name.keys() {
            let mut chain = vec![name.clone()];
            let mut seen = HashSet::from([name.clone()]);
            let mut current = by_name[name].extends.clone();
            while let Some(parent) = current {
                let Some(parent_mapping) = by_name.get(&parent)
                else {
                    return Err(OrmError::Configuration(format!(
                        "entity '{}' extends unknown entity '{parent}'",
                        chain[chain.len() - 1]
                    )));
                };
                if !seen.insert(parent.clone()) {
                    return Err(OrmError::Configuration(format!("inheritance cycle through '{parent}'")));
                }
                chain.push(parent.clone());
                current = parent_mapping.extends.clone();
            }
            chain.reverse();
            chains.insert(name.clone(), chain);
        }

        for mapping in by_name.values() {
            if mapping.extends.is_some() && mapping.strategy.is_some() {
                return Err(OrmError::Configuration(format!(
                    "inheritance strategy may only be declared on a root entity, not on '{}'",
                    mapping.name
                )));
            }
        }

        let table_of = |name: &Arc<str>| by_name[name].table.clone().unwrap_or_else(|| name.to_lowercase());

        let mut entities = HashMap::new();
        let mut collections = HashMap::new();
        let mut roots: HashMap<Arc<str>, Arc<str>> = HashMap::new();

        for (name, mapping) in by_name.iter() {
            let chain = &chains[name];
            let root = chain[0].clone();
            let root_mapping = &by_name[&root];
            let strategy = root_mapping.strategy.unwrap_or_default();
            roots.insert(name.clone(), root.clone());

            let mut properties: Vec<PropertyMapping> = Vec::new();
            for ancestor in chain {
                for prop in &by_name[ancestor].properties {
                    if properties.iter().any(|p| p.name == prop.name) {
                        return Err(OrmError::Configuration(format!(
                            "property '{}' of '{name}' is declared more than once in its hierarchy",
                            prop.name
                        )));
                    }
                    if let Some(target) = prop.target_entity() {
                        if !by_name.contains_key(target) {
                            return Err(OrmError::Configuration(format!(
                                "property '{}' of '{ancestor}' references unknown entity '{target}'",
                                prop.name
                            )));
                        }
                    }
                    properties.push(prop.clone());
                }
            }

            let versions: Vec<usize> = properties
                .iter()
                .enumerate()
                .filter(|(_, p)| matches!(p.kind, PropertyKind::Version))
                .map(|(i, _)| i)
                .collect();
            if versions.len() > 1 {
                return Err(OrmError::Configuration(format!("entity '{name}' declares more than one version")));
            }

            let mut subclasses: Vec<Arc<str>> = chains
                .iter()
                .filter(|(other, c)| *other != name && c.contains(name))
                .map(|(other, _)| other.clone())
                .collect();
            subclasses.sort();

            let table_chain: Vec<String> = match strategy {
                InheritanceStrategy::SingleTable => vec![table_of(&root)],
                InheritanceStrategy::Joined => chain.iter().map(|n| table_of(n)).collect(),
                InheritanceStrategy::UnionSubclass => vec![table_of(name)],
            };
            let descendant_tables = match strategy {
                InheritanceStrategy::SingleTable => Vec::new(),
                _ => subclasses.iter().map(|n| table_of(n)).collect(),
            };

            for (index, prop) in properties.iter().enumerate() {
                if let PropertyKind::Collection {
                    ref element,
                    cascade,
                    lazy,
                } = prop.kind
                {
                    let role: Arc<str> = Arc::from(format!("{root}.{}", prop.name));
                    collections.entry(role.clone()).or_insert_with(|| {
                        Arc::new(CollectionPersister {
                            role: role.clone(),
                            owner: root.clone(),
                            property_index: index,
                            element: element.clone(),
                            table: format!("{}_{}", table_of(&root), prop.name.to_lowercase()),
                            cascade,
                            lazy,
                        })
                    });
                }
            }

            entities.insert(
                name.clone(),
                EntityPersister {
                    entity_name: name.clone(),
                    root_entity_name: root.clone(),
                    super_entity_name: mapping.extends.clone(),
                    subclasses,
                    strategy,
                    capabilities: PersisterCapabilities {
                        versioning:  versions.first().copied(),
                        caching:     root_mapping.cacheable,
                        multi_table: strategy == InheritanceStrategy::Joined && chain.len() > 1,
                    },
                    id_generator: root_mapping.id_generator,
                    id_type: root_mapping.id_type,
                    accessors: AccessorTable::new(&properties),
                    properties,
                    table_chain,
                    descendant_tables,
                    fk_rank: 0,
                },
            );
        }

        let ranks = foreign_key_ranks(&entities, &roots)?;
        let entities = entities
            .into_iter()
            .map(|(name, mut persister)| {
                persister.fk_rank = ranks.get(&persister.root_entity_name).copied().unwrap_or(0);
                (name, Arc::new(persister))
            })
            .collect::<HashMap<_, _>>();

        debug!(
            "Metamodel built: {} entities, {} collection roles",
            entities.len(),
            collections.len()
        );

        Ok(Metamodel { entities, collections })
    }
}

// Dependency rank of every root entity over many-to-one edges. Self references are left to instance-level ordering;
// any other cycle cannot be ordered by type and is rejected.
fn foreign_key_ranks(
    entities: &HashMap<Arc<str>, EntityPersister>,
    roots: &HashMap<Arc<str>, Arc<str>>,
) -> Result<HashMap<Arc<str>, usize>> {
    let mut edges: BTreeMap<Arc<str>, HashSet<Arc<str>>> = BTreeMap::new();
    for persister in entities.values() {
        let from = persister.root_entity_name.clone();
        let targets = edges.entry(from.clone()).or_default();
        for prop in &persister.properties {
            if let PropertyKind::ManyToOne { ref target, .. } = prop.kind {
                let to = roots[target].clone();
                if to != from {
                    targets.insert(to);
                }
            }
        }
    }

    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit(
        node: &Arc<str>,
        edges: &BTreeMap<Arc<str>, HashSet<Arc<str>>>,
        marks: &mut HashMap<Arc<str>, Mark>,
        ranks: &mut HashMap<Arc<str>, usize>,
        path: &mut Vec<Arc<str>>,
    ) -> Result<usize> {
        match marks.get(node) {
            Some(Mark::Done) => return Ok(ranks[node]),
            Some(Mark::Visiting) => {
                path.push(node.clone());
                let cycle = path.iter().map(|n| n.to_string()).collect::<Vec<_>>().join(" -> ");
                return Err(OrmError::Configuration(format!(
                    "foreign key cycle between entity types: {cycle}"
                )));
            }
            None => (),
        }
        marks.insert(node.clone(), Mark::Visiting);
        path.push(node.clone());
        let mut rank = 0;
        if let Some(targets) = edges.get(node) {
            let mut targets: Vec<_> = targets.iter().cloned().collect();
            targets.sort();
            for target in targets {
                rank = rank.max(visit(&target, edges, marks, ranks, path)? + 1);
            }
        }
        path.pop();
        marks.insert(node.clone(), Mark::Done);
        ranks.insert(node.clone(), rank);
        Ok(rank)
    }

    let mut marks = HashMap::new();
    let mut ranks = HashMap::new();
    for node in edges.keys() {
        visit(node, &edges, &mut marks, &mut ranks, &mut Vec::new())?;
    }
    Ok(ranks)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> Metamodel {
        Metamodel::builder()
            .entity(
                EntityMapping::new("Parent")
                    .id_generator(IdGenerator::Sequence)
                    .version("version")
                    .property("name")
                    .one_to_many("children", "Child", CascadeStyle::all_delete_orphan()),
            )
            .entity(
                EntityMapping::new("Child")
                    .property("name")
                    .many_to_one("parent", "Parent", CascadeStyle::none()),
            )
            .entity(
                EntityMapping::new("Animal")
                    .inheritance(InheritanceStrategy::Joined)
                    .property("name"),
            )
            .entity(EntityMapping::new("Dog").extends("Animal").property("breed"))
            .build()
            .unwrap()
    }

    #[test]
    fn ranks_follow_foreign_keys() {
        let model = model();
        let parent = model.entity_persister("Parent").unwrap();
        let child = model.entity_persister("Child").unwrap();
        assert!(parent.fk_rank() < child.fk_rank());
    }

    #[test]
    fn accessors_resolve_by_name() {
        let model = model();
        let parent = model.entity_persister("Parent").unwrap();
        assert_eq!(parent.accessor("name").unwrap().index(), 1);
        assert_eq!(parent.version_index(), Some(0));
        assert!(parent.accessor("missing").is_err());

        let e = model.instantiate("Parent").unwrap();
        model.set_property(&e, "name", "p").unwrap();
        assert_eq!(model.property(&e, "name").unwrap(), Value::from("p"));
        assert!(model.property(&e, "children").unwrap().as_collection().is_some());
    }

    #[test]
    fn joined_hierarchy() {
        let model = model();
        let dog = model.entity_persister("Dog").unwrap();
        assert_eq!(&**dog.root_entity_name(), "Animal");
        assert_eq!(dog.property_names().len(), 2);
        assert_eq!(dog.write_tables(), vec!["animal", "dog"]);
        assert!(dog.capabilities().multi_table);

        let animal = model.entity_persister("Animal").unwrap();
        assert_eq!(animal.query_spaces(), vec!["animal".to_string(), "dog".to_string()]);
        assert!(animal.is_subclass_entity_name("Dog"));
    }

    #[test]
    fn type_level_cycle_is_rejected() {
        let err = Metamodel::builder()
            .entity(EntityMapping::new("A").many_to_one("b", "B", CascadeStyle::none()))
            .entity(EntityMapping::new("B").many_to_one("a", "A", CascadeStyle::none()))
            .build()
            .unwrap_err();
        assert!(matches!(err, OrmError::Configuration(ref m) if m.contains("cycle")));
    }

    #[test]
    fn self_reference_is_allowed() {
        let model = Metamodel::builder()
            .entity(EntityMapping::new("Node").many_to_one("next", "Node", CascadeStyle::none()))
            .build()
            .unwrap();
        assert_eq!(model.entity_persister("Node").unwrap().fk_rank(), 0);
    }

    #[test]
    fn unknown_target_is_rejected() {
        let err = Metamodel::builder()
            .entity(EntityMapping::new("A").many_to_one("b", "Nope", CascadeStyle::none()))
            .build()
            .unwrap_err();
        assert!(matches!(err, OrmError::Configuration(_)));
    }
}
