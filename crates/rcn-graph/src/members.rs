use std::{collections::HashMap, sync::Arc};

use futures::future::try_join_all;
use parking_lot::Mutex;
use rcn_jdwp::{
    types::{
        MODIFIER_ABSTRACT, MODIFIER_JDWP_SYNTHETIC, MODIFIER_NATIVE, MODIFIER_STATIC,
        MODIFIER_SYNTHETIC,
    },
    MethodInfo, ObjectId, ReferenceTypeId,
};

use crate::{
    debuggee::MethodDebugInfo,
    error::{RcnError, RcnResult},
    model::{
        Access, ConstructorDescriptor, FieldDescriptor, Linkage, MemberDescriptor, MemberKey,
        MethodDescriptor, SourceLocation, TypeKey, TypeRef, ValueType, VariableDescriptor,
        VariableKey,
    },
    names::{field_rcn, method_rcn, variable_rcn},
    resolver::TypeResolver,
};

const CONSTRUCTOR_NAME: &str = "<init>";

/// Declared fields, methods and constructors of resolved types.
#[derive(Debug, Clone)]
pub struct MemberExtractor {
    resolver: TypeResolver,
    cache: Arc<Mutex<HashMap<TypeKey, Arc<Vec<MemberDescriptor>>>>>,
}

impl MemberExtractor {
    pub fn new(resolver: TypeResolver) -> Self {
        Self {
            resolver,
            cache: Arc::default(),
        }
    }

    pub fn resolver(&self) -> &TypeResolver {
        &self.resolver
    }

    /// Members in declaration order. Fails with [`RcnError::UnresolvedType`]
    /// for types that are not prepared.
    pub async fn members(&self, type_id: ReferenceTypeId) -> RcnResult<Arc<Vec<MemberDescriptor>>> {
        let resolved = self.resolver.resolve_entry(type_id).await?;
        let node = resolved.node;
        if let Some(members) = self.cache.lock().get(&node.key) {
            return Ok(members.clone());
        }
        let Some(metadata) = resolved.metadata else {
            return Err(RcnError::UnresolvedType {
                identity: node.key.name.clone(),
            });
        };

        let loader = node.key.loader;
        let has_value = node.linkage == Linkage::Initialized;
        let mut members = Vec::with_capacity(metadata.fields.len() + metadata.methods.len());

        for field in &metadata.fields {
            let declared_type = self.resolver.value_type(loader, &field.signature).await?;
            let synthetic = field.mod_bits & (MODIFIER_SYNTHETIC | MODIFIER_JDWP_SYNTHETIC) != 0;
            members.push(MemberDescriptor::Field(FieldDescriptor {
                key: member_key(&node.key, &field.name, &field.signature),
                rcn: field_rcn(&node.rcn, &field.name),
                field_id: field.field_id,
                outer_instance: field.name.starts_with("this$") && node.enclosing.is_some(),
                declared_type,
                is_static: field.mod_bits & MODIFIER_STATIC != 0,
                access: Access::from_modifiers(field.mod_bits),
                synthetic,
                has_value,
            }));
        }

        let debuggee = self.resolver.debuggee();
        let type_id = node.type_id;
        let source_file = async {
            if metadata.methods.is_empty() {
                return Ok(None);
            }
            debuggee.source_file(type_id).await
        };
        let debug_info = try_join_all(metadata.methods.iter().map(|method| async move {
            if !has_body(method) {
                return Ok(MethodDebugInfo::default());
            }
            debuggee.method_debug_info(type_id, method.method_id).await
        }));
        let (source_file, debug_info) = tokio::try_join!(source_file, debug_info)?;
        let path = source_file.map(|file| source_path(&node.key.name, &file));

        for (method, info) in metadata.methods.iter().zip(&debug_info) {
            let (parameters, return_type) =
                self.resolver.method_types(loader, &method.signature).await?;
            let key = member_key(&node.key, &method.name, &method.signature);
            let access = Access::from_modifiers(method.mod_bits);
            let params = parameters.iter().map(ValueType::rcn);
            let rcn = if method.name == CONSTRUCTOR_NAME {
                method_rcn(&node.rcn, "void", CONSTRUCTOR_NAME, params)
            } else {
                method_rcn(&node.rcn, return_type.rcn(), &method.name, params)
            };
            let location = info
                .lines
                .as_ref()
                .and_then(|lines| lines.first_line())
                .and_then(|line| u32::try_from(line).ok())
                .map(|line| SourceLocation {
                    source_path: path.clone(),
                    line,
                });
            let variables = self.variables(loader, &key, &rcn, info).await?;

            let descriptor = if method.name == CONSTRUCTOR_NAME {
                MemberDescriptor::Constructor(ConstructorDescriptor {
                    rcn,
                    key,
                    method_id: method.method_id,
                    parameters,
                    access,
                    location,
                    variables,
                })
            } else {
                // Static initializers (`<clinit>`) are reported as static methods.
                MemberDescriptor::Method(MethodDescriptor {
                    rcn,
                    key,
                    method_id: method.method_id,
                    parameters,
                    return_type,
                    is_static: method.mod_bits & MODIFIER_STATIC != 0,
                    is_abstract: method.mod_bits & MODIFIER_ABSTRACT != 0,
                    access,
                    location,
                    variables,
                })
            };
            members.push(descriptor);
        }

        let members = Arc::new(members);
        // `has_value` changes once the initializer runs.
        if !node.is_partial() && has_value {
            self.cache.lock().insert(node.key.clone(), members.clone());
        }
        Ok(members)
    }

    async fn variables(
        &self,
        loader: Option<ObjectId>,
        method: &MemberKey,
        owner_rcn: &str,
        info: &MethodDebugInfo,
    ) -> RcnResult<Vec<VariableDescriptor>> {
        let Some(table) = &info.variables else {
            return Ok(Vec::new());
        };
        // `this` and the captured `this$N` are slots, not declared variables.
        let declared = table
            .iter()
            .filter(|variable| variable.name != "this" && !variable.name.starts_with("this$"))
            .collect::<Vec<_>>();

        let mut variables = Vec::with_capacity(declared.len());
        for variable in &declared {
            let ambiguous = declared
                .iter()
                .filter(|other| other.name == variable.name)
                .count()
                > 1;
            variables.push(VariableDescriptor {
                key: VariableKey {
                    method: method.clone(),
                    name: variable.name.clone(),
                    scope_start: variable.code_index,
                },
                rcn: variable_rcn(
                    owner_rcn,
                    &variable.name,
                    ambiguous.then_some(variable.code_index),
                ),
                declared_type: self.resolver.value_type(loader, &variable.signature).await?,
                line: info
                    .lines
                    .as_ref()
                    .and_then(|lines| lines.line_at(variable.code_index))
                    .and_then(|line| u32::try_from(line).ok()),
                is_parameter: variable.slot < info.argument_slots,
            });
        }
        Ok(variables)
    }

    /// Members of the type `name` as seen from `loader`.
    pub async fn members_of_name(
        &self,
        loader: Option<ObjectId>,
        name: &str,
    ) -> RcnResult<Arc<Vec<MemberDescriptor>>> {
        match self.resolver.find_type(loader, name).await? {
            Some(type_id) => self.members(type_id).await,
            None => Err(RcnError::UnresolvedType {
                identity: name.to_owned(),
            }),
        }
    }

    /// Drops cached members that mention a type no loader had loaded yet.
    pub fn forget_unprepared(&self) {
        self.cache.lock().retain(|_, members| {
            !members.iter().any(|member| {
                member
                    .mentioned_types()
                    .into_iter()
                    .chain(member.variables().iter().map(|variable| &variable.declared_type))
                    .any(|ty| matches!(ty, ValueType::Reference(TypeRef::Unprepared { .. })))
            })
        });
    }

    pub fn forget(&self, key: &TypeKey) {
        self.cache.lock().remove(key);
    }

    pub fn clear(&self) {
        self.cache.lock().clear();
    }
}

fn has_body(method: &MethodInfo) -> bool {
    method.mod_bits & (MODIFIER_ABSTRACT | MODIFIER_NATIVE) == 0
}

/// Source path as JDI reports it: package directories, then the file name.
fn source_path(type_name: &str, source_file: &str) -> String {
    match type_name.rsplit_once('.') {
        Some((package, _)) => format!("{}/{source_file}", package.replace('.', "/")),
        None => source_file.to_owned(),
    }
}

fn member_key(owner: &TypeKey, name: &str, signature: &str) -> MemberKey {
    MemberKey {
        owner: owner.clone(),
        name: name.to_owned(),
        signature: signature.to_owned(),
    }
}
