#![allow(dead_code)]

use std::sync::Arc;
use wb_session::cascade::CascadeStyle;
use wb_session::mapping::EntityMapping;
use wb_session::mapping::Metamodel;
use wb_session::storage::memory::Statement;
use wb_session::storage::memory::StatementKind;
use wb_session::types::Datum;
use wb_session::types::Identifier;
use wb_session::types::Value;
use wb_session::EntityRef;
use wb_session::MemoryStorage;
use wb_session::SessionFactory;
use wb_session::SessionFactoryOptions;

pub struct Fixture {
    pub model:   Arc<Metamodel>,
    pub storage: MemoryStorage,
    pub factory: Arc<SessionFactory>,
}

/// Parents own their children through a cascading, orphan-removing collection; children point back at their parent
/// without cascading. Nodes form chains with persist-cascading links.
pub fn metamodel() -> Arc<Metamodel> {
    Arc::new(
        Metamodel::builder()
            .entity(
                EntityMapping::new("Parent")
                    .version("version")
                    .property("name")
                    .one_to_many("children", "Child", CascadeStyle::all_delete_orphan())
                    .cacheable(true),
            )
            .entity(
                EntityMapping::new("Child")
                    .property("name")
                    .many_to_one("parent", "Parent", CascadeStyle::none()),
            )
            .entity(
                EntityMapping::new("Node")
                    .property("label")
                    .many_to_one("next", "Node", CascadeStyle::persist()),
            )
            .build()
            .unwrap(),
    )
}

pub fn fixture() -> Fixture {
    fixture_with(SessionFactoryOptions::default())
}

pub fn fixture_with(options: SessionFactoryOptions) -> Fixture {
    wb_session::logging::init();
    let model = metamodel();
    let storage = MemoryStorage::new(model.clone());
    let factory = SessionFactory::new(model.clone(), Arc::new(storage.clone()), options).unwrap();
    Fixture {
        model,
        storage,
        factory,
    }
}

impl Fixture {
    pub fn seed_parent(&self, id: i64, version: i64, name: &str) {
        self.storage.put_row(
            "Parent",
            Identifier::Int(id),
            vec![Datum::Int(version), Datum::Text(name.into()), Datum::Null],
        );
    }

    pub fn seed_child(&self, id: i64, name: &str, parent: i64) {
        self.storage.put_row(
            "Child",
            Identifier::Int(id),
            vec![Datum::Text(name.into()), Datum::Int(parent)],
        );
    }

    pub fn new_parent(&self, id: i64, name: &str) -> EntityRef {
        let parent = self.model.instantiate_with_id("Parent", id).unwrap();
        self.model.set_property(&parent, "name", name).unwrap();
        parent
    }

    /// A new child attached to both ends of the association.
    pub fn new_child(&self, id: i64, name: &str, parent: &EntityRef) -> EntityRef {
        let child = self.model.instantiate_with_id("Child", id).unwrap();
        self.model.set_property(&child, "name", name).unwrap();
        self.model.set_property(&child, "parent", parent).unwrap();
        if let Value::Collection(children) = self.model.property(parent, "children").unwrap() {
            children.add(child.clone());
        }
        child
    }

    pub fn text(&self, entity: &EntityRef, property: &str) -> String {
        match self.model.property(entity, property).unwrap() {
            Value::Text(s) => s,
            other => panic!("property '{property}' is not text: {other:?}"),
        }
    }

    pub fn stored_name(&self, entity_name: &str, id: i64) -> Option<Datum> {
        let row = self.storage.row(entity_name, &Identifier::Int(id))?;
        let index = match entity_name {
            "Parent" => 1,
            _ => 0,
        };
        row.values.get(index).cloned()
    }

    /// Statements of `kind`, as `(table, id)`.
    pub fn executed(&self, kind: StatementKind) -> Vec<(String, Option<Identifier>)> {
        self.storage
            .statements_of(kind)
            .into_iter()
            .map(|s| (s.table, s.id))
            .collect()
    }

    pub fn position_of(&self, kind: StatementKind, table: &str) -> Option<usize> {
        self.storage
            .statements()
            .iter()
            .position(|s: &Statement| s.kind == kind && s.table == table)
    }
}
