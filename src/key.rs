use serde::Deserialize;
use serde::Serialize;
use std::fmt::Display;
use std::sync::Arc;

use crate::types::Identifier;

/// Tenant discriminator. Sessions without a tenant use the [`TenantId::Default`] sentinel so that keys built with
/// and without an explicit "no tenant" compare equal.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TenantId {
    #[default]
    Default,
    Named(String),
}

impl TenantId {
    pub fn from_option<S: Into<String>>(tenant: Option<S>) -> Self {
        tenant.map_or(TenantId::Default, |t| TenantId::Named(t.into()))
    }
}

impl Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TenantId::Default => write!(f, "<default>"),
            TenantId::Named(t) => write!(f, "{t}"),
        }
    }
}

/// Identity of an entity row within a session: `(root entity name, identifier, tenant)`.
///
/// Construction is pure and never fails; an absent identifier must be reported by the caller before a key is
/// attempted.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityKey {
    entity_name: Arc<str>,
    id:          Identifier,
    tenant:      TenantId,
}

impl EntityKey {
    pub fn new(entity_name: impl Into<Arc<str>>, id: Identifier, tenant: TenantId) -> Self {
        Self {
            entity_name: entity_name.into(),
            id,
            tenant,
        }
    }

    #[inline]
    pub fn entity_name(&self) -> &str {
        &self.entity_name
    }

    #[inline]
    pub fn id(&self) -> &Identifier {
        &self.id
    }

    #[inline]
    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }
}

impl Display for EntityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.tenant {
            TenantId::Default => write!(f, "{}#{}", self.entity_name, self.id),
            TenantId::Named(ref t) => write!(f, "{}#{}@{t}", self.entity_name, self.id),
        }
    }
}

/// Identity of a persistent collection: the collection role and the owner's identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CollectionKey {
    role:     Arc<str>,
    owner_id: Identifier,
    tenant:   TenantId,
}

impl CollectionKey {
    pub fn new(role: impl Into<Arc<str>>, owner_id: Identifier, tenant: TenantId) -> Self {
        Self {
            role: role.into(),
            owner_id,
            tenant,
        }
    }

    #[inline]
    pub fn role(&self) -> &str {
        &self.role
    }

    #[inline]
    pub fn owner_id(&self) -> &Identifier {
        &self.owner_id
    }

    #[inline]
    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }
}

impl Display for CollectionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.role, self.owner_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;
    use std::hash::Hash;
    use std::hash::Hasher;

    fn hash_of<T: Hash>(v: &T) -> u64 {
        let mut h = DefaultHasher::new();
        v.hash(&mut h);
        h.finish()
    }

    #[test]
    fn equal_inputs_make_equal_keys() {
        let a = EntityKey::new("Parent", Identifier::Int(7), TenantId::Default);
        let b = EntityKey::new("Parent", Identifier::Int(7), TenantId::from_option(None::<String>));
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
    }

    #[test]
    fn every_field_participates() {
        let base = EntityKey::new("Parent", Identifier::Int(7), TenantId::Default);
        assert_ne!(base, EntityKey::new("Child", Identifier::Int(7), TenantId::Default));
        assert_ne!(base, EntityKey::new("Parent", Identifier::Int(8), TenantId::Default));
        assert_ne!(
            base,
            EntityKey::new("Parent", Identifier::Int(7), TenantId::Named("acme".into()))
        );
        assert_ne!(
            EntityKey::new("Parent", Identifier::Int(7), TenantId::Default),
            EntityKey::new("Parent", Identifier::Text("7".into()), TenantId::Default)
        );
    }

    #[test]
    fn display_includes_tenant() {
        let key = EntityKey::new("Parent", Identifier::Int(1), TenantId::Named("acme".into()));
        assert_eq!(key.to_string(), "Parent#1@acme");
    }
}
