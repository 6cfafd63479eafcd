//! Package-prefix based limits on what a snapshot maps.
//!
//! Prefixes are matched with `starts_with` on binary names (`java` also
//! matches `javax`), field RCNs and variable RCNs.

use rcn_config::MappingConfig;

use crate::model::{Access, TypeKey, TypeNode, TypeRef, ValueType};

const SDK_EXCLUDED_PACKAGES: &[&str] = &[
    "sun",
    "jdk",
    "java.security",
    "java.lang.reflect",
    "java.lang.ref",
    "java.lang.module",
    "java.lang.invoke",
    "java.lang.annotation",
    "java.net",
    "java.nio",
    "java.util.concurrent",
];

const SDK_SHALLOW_PACKAGES: &[&str] = &["java"];

#[derive(Debug, Clone, Default)]
pub struct MappingLimiter {
    excluded: Vec<String>,
    shallow: Vec<String>,
    deep: Vec<String>,
}

impl MappingLimiter {
    pub fn new(config: &MappingConfig) -> Self {
        let mut excluded = config.excluded_packages.clone();
        let mut shallow = config.shallow_packages.clone();
        if config.limit_sdk {
            excluded.extend(SDK_EXCLUDED_PACKAGES.iter().map(|p| p.to_string()));
            shallow.extend(SDK_SHALLOW_PACKAGES.iter().map(|p| p.to_string()));
        }
        for list in [&mut excluded, &mut shallow] {
            list.retain(|prefix| !prefix.is_empty());
            list.sort();
            list.dedup();
        }
        Self {
            excluded,
            shallow,
            deep: config.deep_fields.clone(),
        }
    }

    pub fn is_limiting(&self) -> bool {
        !self.excluded.is_empty() || !self.shallow.is_empty()
    }

    fn is_excluded(&self, name: &str) -> bool {
        self.excluded.iter().any(|prefix| name.starts_with(prefix.as_str()))
    }

    /// Excluded packages are shallow too.
    pub fn is_shallow(&self, name: &str) -> bool {
        self.is_excluded(name) || self.shallow.iter().any(|prefix| name.starts_with(prefix.as_str()))
    }

    fn is_deep(&self, rcn: &str) -> bool {
        self.deep.iter().any(|prefix| rcn.starts_with(prefix.as_str()))
    }

    /// For types no loader has loaded; only the name is known.
    pub fn can_unloaded_type_be_skipped(&self, name: &str) -> bool {
        self.is_excluded(name)
    }

    /// Excluded types, and non-public types of shallow packages. An array is
    /// skipped when its component type would be.
    pub fn can_type_be_skipped<'a, F>(&self, node: &TypeNode, lookup: &F) -> bool
    where
        F: Fn(&TypeKey) -> Option<&'a TypeNode>,
    {
        if self.is_excluded(&node.key.name) {
            return true;
        }
        if !self.is_shallow(&node.key.name) {
            return false;
        }
        match &node.component {
            None => node.access != Access::Public,
            Some(ValueType::Reference(TypeRef::Loaded { key, .. })) => match lookup(key) {
                Some(component) => self.can_type_be_skipped(component, lookup),
                None => self.can_unloaded_type_be_skipped(&key.name),
            },
            Some(ValueType::Reference(TypeRef::Unprepared { name, .. })) => {
                self.can_unloaded_type_be_skipped(name)
            }
            Some(ValueType::Primitive(_) | ValueType::Void) => false,
        }
    }

    /// Members of skipped types, and non-public members of shallow types.
    pub fn can_member_be_skipped(&self, owner_skipped: bool, owner: &str, access: Access) -> bool {
        owner_skipped || (self.is_shallow(owner) && access != Access::Public)
    }

    /// Whether the fields of an instance of `runtime_type` are left unread.
    pub fn can_instance_be_skipped(&self, runtime_type: &str) -> bool {
        self.is_shallow(runtime_type)
    }

    /// Whether the elements of an array are left out, given the RCNs of the
    /// fields and variables that refer to it. Without any limits every array
    /// is captured; otherwise only arrays reachable from a deep field are.
    pub fn can_sequence_be_skipped<'r>(&self, referrers: impl IntoIterator<Item = &'r str>) -> bool {
        if !self.is_limiting() {
            return false;
        }
        !referrers.into_iter().any(|rcn| self.is_deep(rcn))
    }
}
