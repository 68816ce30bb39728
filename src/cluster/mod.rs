//! The test cluster: callables of the target module and their type
//! information, as seen by test synthesis.
//!
//! Types are an explicit sum (`any` at the top, `none` at the bottom of
//! non-optional slots) with a partial subtyping order. They guide candidate
//! selection only; the VM never enforces them.

use std::collections::BTreeMap;
use std::sync::Arc;

use rand::Rng;

use crate::lang::ast::{AssignTarget, Expr, ModuleAst, Stmt, TypeExpr};

/// Type information attached to parameters, returns, and references.
#[derive(Debug, Clone, PartialEq)]
pub enum TypeInfo {
    Any,
    None,
    Bool,
    Int,
    Float,
    Str,
    /// Generic list parameterized by its element type.
    List(Box<TypeInfo>),
    /// A user-defined class of the target module.
    Class(String),
    Union(Vec<TypeInfo>),
    /// A callable signature (parameter types and return type).
    Callable {
        params: Vec<TypeInfo>,
        returns: Box<TypeInfo>,
    },
}

impl TypeInfo {
    /// Resolves a source annotation. Unknown names become class references;
    /// a missing annotation is `any`.
    #[must_use]
    pub fn from_annotation(annotation: Option<&TypeExpr>) -> Self {
        match annotation {
            None => TypeInfo::Any,
            Some(TypeExpr::Name(name)) => match name.as_str() {
                "any" => TypeInfo::Any,
                "none" => TypeInfo::None,
                "bool" => TypeInfo::Bool,
                "int" => TypeInfo::Int,
                "float" => TypeInfo::Float,
                "str" => TypeInfo::Str,
                "list" => TypeInfo::List(Box::new(TypeInfo::Any)),
                other => TypeInfo::Class(other.to_string()),
            },
            Some(TypeExpr::Union(parts)) => {
                let parts = parts
                    .iter()
                    .map(|p| TypeInfo::from_annotation(Some(p)))
                    .collect();
                TypeInfo::Union(parts)
            }
        }
    }

    /// Whether a value of `self` can fill a slot of type `slot`.
    /// `any` accepts everything and satisfies everything; `none` satisfies
    /// only optional slots.
    #[must_use]
    pub fn satisfies(&self, slot: &TypeInfo) -> bool {
        match (self, slot) {
            (_, TypeInfo::Any) | (TypeInfo::Any, _) => true,
            (TypeInfo::Union(parts), _) => parts.iter().all(|p| p.satisfies(slot)),
            (_, TypeInfo::Union(parts)) => parts.iter().any(|p| self.satisfies(p)),
            (TypeInfo::None, TypeInfo::None) => true,
            (TypeInfo::None, _) | (_, TypeInfo::None) => false,
            (TypeInfo::Bool, TypeInfo::Bool)
            | (TypeInfo::Int, TypeInfo::Int)
            | (TypeInfo::Float, TypeInfo::Float)
            | (TypeInfo::Str, TypeInfo::Str) => true,
            // ints are acceptable where floats are expected
            (TypeInfo::Bool | TypeInfo::Int, TypeInfo::Float) => true,
            (TypeInfo::List(a), TypeInfo::List(b)) => a.satisfies(b),
            (TypeInfo::Class(a), TypeInfo::Class(b)) => a == b,
            (TypeInfo::Callable { .. }, TypeInfo::Callable { .. }) => true,
            _ => false,
        }
    }

    /// The type observed for a runtime type name.
    #[must_use]
    pub fn from_runtime_name(name: &str) -> Self {
        match name {
            "none" => TypeInfo::None,
            "bool" => TypeInfo::Bool,
            "int" => TypeInfo::Int,
            "float" => TypeInfo::Float,
            "str" => TypeInfo::Str,
            "list" => TypeInfo::List(Box::new(TypeInfo::Any)),
            other => TypeInfo::Class(other.to_string()),
        }
    }

    #[must_use]
    pub fn is_primitive(&self) -> bool {
        matches!(
            self,
            TypeInfo::None | TypeInfo::Bool | TypeInfo::Int | TypeInfo::Float | TypeInfo::Str
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallableKind {
    Function,
    Constructor,
    Method,
    FieldRead,
    FieldWrite,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParameterInfo {
    pub name: String,
    pub type_info: TypeInfo,
    pub has_default: bool,
}

/// Immutable description of one callable under test.
#[derive(Debug, Clone, PartialEq)]
pub struct CallableDescriptor {
    pub qualified_name: String,
    pub name: String,
    pub kind: CallableKind,
    /// Owning class for methods and field accessors.
    pub owner: Option<String>,
    /// Declared parameters, excluding the receiver.
    pub params: Vec<ParameterInfo>,
    pub return_type: TypeInfo,
    pub public: bool,
}

/// Filters applied while building the cluster.
#[derive(Debug, Clone, Default)]
pub struct ClusterFilters {
    /// Qualified names to include even when private.
    pub include_methods: Vec<String>,
    /// Qualified names to exclude.
    pub exclude_methods: Vec<String>,
}

/// Lookup service over the callables of the target module.
#[derive(Debug, Clone)]
pub struct TestCluster {
    module_name: String,
    accessible: Vec<Arc<CallableDescriptor>>,
    /// Methods and field writes per owning class.
    modifiers: BTreeMap<String, Vec<Arc<CallableDescriptor>>>,
    /// Public instance fields per class, harvested from constructors.
    fields: BTreeMap<String, Vec<String>>,
    /// Field read/write accessor descriptors per class.
    field_accessors: BTreeMap<String, Vec<Arc<CallableDescriptor>>>,
}

impl TestCluster {
    /// Enumerates the callables of a parsed module.
    #[must_use]
    pub fn from_module(ast: &ModuleAst, filters: &ClusterFilters) -> Self {
        let mut accessible: Vec<Arc<CallableDescriptor>> = Vec::new();
        let mut modifiers: BTreeMap<String, Vec<Arc<CallableDescriptor>>> = BTreeMap::new();

        let admitted = |qualified: &str, name: &str| -> bool {
            if filters.exclude_methods.iter().any(|m| m == qualified) {
                return false;
            }
            !name.starts_with('_') || filters.include_methods.iter().any(|m| m == qualified)
        };

        for function in &ast.functions {
            let qualified = format!("{}.{}", ast.name, function.name);
            if !admitted(&qualified, &function.name) {
                continue;
            }
            accessible.push(Arc::new(CallableDescriptor {
                qualified_name: qualified,
                name: function.name.clone(),
                kind: CallableKind::Function,
                owner: None,
                params: function
                    .params
                    .iter()
                    .map(|p| ParameterInfo {
                        name: p.name.clone(),
                        type_info: TypeInfo::from_annotation(p.annotation.as_ref()),
                        has_default: p.default.is_some(),
                    })
                    .collect(),
                return_type: TypeInfo::from_annotation(function.return_type.as_ref()),
                public: !function.name.starts_with('_'),
            }));
        }

        for class in &ast.classes {
            let class_entry = modifiers.entry(class.name.clone()).or_default();
            for method in &class.methods {
                let qualified = format!("{}.{}.{}", ast.name, class.name, method.name);
                let params: Vec<ParameterInfo> = method
                    .params
                    .iter()
                    .skip(1) // receiver
                    .map(|p| ParameterInfo {
                        name: p.name.clone(),
                        type_info: TypeInfo::from_annotation(p.annotation.as_ref()),
                        has_default: p.default.is_some(),
                    })
                    .collect();
                if method.name == "init" {
                    accessible.push(Arc::new(CallableDescriptor {
                        qualified_name: format!("{}.{}", ast.name, class.name),
                        name: class.name.clone(),
                        kind: CallableKind::Constructor,
                        owner: Some(class.name.clone()),
                        params,
                        return_type: TypeInfo::Class(class.name.clone()),
                        public: true,
                    }));
                    continue;
                }
                if !admitted(&qualified, &method.name) {
                    continue;
                }
                let descriptor = Arc::new(CallableDescriptor {
                    qualified_name: qualified,
                    name: method.name.clone(),
                    kind: CallableKind::Method,
                    owner: Some(class.name.clone()),
                    params,
                    return_type: TypeInfo::from_annotation(method.return_type.as_ref()),
                    public: !method.name.starts_with('_'),
                });
                accessible.push(descriptor.clone());
                class_entry.push(descriptor);
            }
            // classes without an explicit constructor are still constructible
            if !class.methods.iter().any(|m| m.name == "init") {
                accessible.push(Arc::new(CallableDescriptor {
                    qualified_name: format!("{}.{}", ast.name, class.name),
                    name: class.name.clone(),
                    kind: CallableKind::Constructor,
                    owner: Some(class.name.clone()),
                    params: Vec::new(),
                    return_type: TypeInfo::Class(class.name.clone()),
                    public: true,
                }));
            }
        }

        let mut fields = BTreeMap::new();
        let mut field_accessors: BTreeMap<String, Vec<Arc<CallableDescriptor>>> = BTreeMap::new();
        for class in &ast.classes {
            let mut class_fields = Vec::new();
            if let Some(init) = class.methods.iter().find(|m| m.name == "init") {
                harvest_self_fields(&init.body, &mut class_fields);
            }
            class_fields.retain(|f| !f.starts_with('_'));
            let accessors = field_accessors.entry(class.name.clone()).or_default();
            for field in &class_fields {
                let qualified = format!("{}.{}.{}", ast.name, class.name, field);
                accessors.push(Arc::new(CallableDescriptor {
                    qualified_name: qualified.clone(),
                    name: field.clone(),
                    kind: CallableKind::FieldRead,
                    owner: Some(class.name.clone()),
                    params: Vec::new(),
                    return_type: TypeInfo::Any,
                    public: true,
                }));
                let writer = Arc::new(CallableDescriptor {
                    qualified_name: qualified,
                    name: field.clone(),
                    kind: CallableKind::FieldWrite,
                    owner: Some(class.name.clone()),
                    params: vec![ParameterInfo {
                        name: "value".to_string(),
                        type_info: TypeInfo::Any,
                        has_default: false,
                    }],
                    return_type: TypeInfo::None,
                    public: true,
                });
                accessors.push(writer.clone());
                modifiers.entry(class.name.clone()).or_default().push(writer);
            }
            fields.insert(class.name.clone(), class_fields);
        }

        Self {
            module_name: ast.name.clone(),
            accessible,
            modifiers,
            fields,
            field_accessors,
        }
    }

    /// Field read/write accessors of a class.
    #[must_use]
    pub fn field_accessors_of(&self, class_name: &str) -> &[Arc<CallableDescriptor>] {
        self.field_accessors
            .get(class_name)
            .map_or(&[], |accessors| accessors.as_slice())
    }

    /// Public fields of a class, in constructor-assignment order.
    #[must_use]
    pub fn fields_of(&self, class_name: &str) -> &[String] {
        self.fields
            .get(class_name)
            .map_or(&[], |fields| fields.as_slice())
    }

    #[must_use]
    pub fn module_name(&self) -> &str {
        &self.module_name
    }

    /// All callables admitted for direct invocation from tests.
    #[must_use]
    pub fn accessible(&self) -> &[Arc<CallableDescriptor>] {
        &self.accessible
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.accessible.is_empty()
    }

    /// A uniformly random accessible callable.
    #[must_use]
    pub fn random_accessible(&self, rng: &mut impl Rng) -> Option<Arc<CallableDescriptor>> {
        if self.accessible.is_empty() {
            None
        } else {
            Some(self.accessible[rng.gen_range(0..self.accessible.len())].clone())
        }
    }

    /// Callables whose return type satisfies the requested slot, used by
    /// back-chaining synthesis.
    #[must_use]
    pub fn generators_for(&self, slot: &TypeInfo) -> Vec<Arc<CallableDescriptor>> {
        self.accessible
            .iter()
            .filter(|c| c.return_type.satisfies(slot) && c.return_type != TypeInfo::None)
            .cloned()
            .collect()
    }

    /// Methods modifying instances of the given class.
    #[must_use]
    pub fn modifiers_of(&self, class_name: &str) -> &[Arc<CallableDescriptor>] {
        self.modifiers
            .get(class_name)
            .map_or(&[], |methods| methods.as_slice())
    }

    /// Constructors among the accessible callables.
    #[must_use]
    pub fn constructors(&self) -> Vec<Arc<CallableDescriptor>> {
        self.accessible
            .iter()
            .filter(|c| c.kind == CallableKind::Constructor)
            .cloned()
            .collect()
    }
}

fn harvest_self_fields(body: &[Stmt], fields: &mut Vec<String>) {
    for stmt in body {
        match stmt {
            Stmt::Assign {
                target: AssignTarget::Attr { object, name },
                ..
            } => {
                if matches!(object, Expr::Name(n) if n == "self") && !fields.contains(name) {
                    fields.push(name.clone());
                }
            }
            Stmt::If {
                then_body,
                else_body,
                ..
            } => {
                harvest_self_fields(then_body, fields);
                harvest_self_fields(else_body, fields);
            }
            Stmt::While { body, .. } | Stmt::For { body, .. } => {
                harvest_self_fields(body, fields);
            }
            Stmt::Try { body, handlers, .. } => {
                harvest_self_fields(body, fields);
                for handler in handlers {
                    harvest_self_fields(&handler.body, fields);
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::parser::parse_module;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn cluster_for(source: &str) -> TestCluster {
        let ast = parse_module("m", source).expect("parse");
        TestCluster::from_module(&ast, &ClusterFilters::default())
    }

    #[test]
    fn enumerates_functions_methods_and_constructor() {
        let cluster = cluster_for(
            r#"
def top(a: int) -> int { return a }
def _hidden() { return none }
class Queue {
    def init(self) { self.items = [] }
    def enqueue(self, value: int) { self.items.append(value) }
}
"#,
        );
        let names: Vec<&str> = cluster
            .accessible()
            .iter()
            .map(|c| c.qualified_name.as_str())
            .collect();
        assert!(names.contains(&"m.top"));
        assert!(names.contains(&"m.Queue"));
        assert!(names.contains(&"m.Queue.enqueue"));
        assert!(!names.iter().any(|n| n.contains("_hidden")));
        // enqueue plus the writer accessor of the harvested `items` field
        assert_eq!(cluster.modifiers_of("Queue").len(), 2);
        let accessors = cluster.field_accessors_of("Queue");
        assert_eq!(accessors.len(), 2);
        assert!(accessors.iter().any(|a| a.kind == CallableKind::FieldRead));
        assert!(accessors.iter().any(|a| a.kind == CallableKind::FieldWrite));
    }

    #[test]
    fn subtyping_treats_any_as_top() {
        assert!(TypeInfo::Int.satisfies(&TypeInfo::Any));
        assert!(TypeInfo::Any.satisfies(&TypeInfo::Int));
        assert!(TypeInfo::Int.satisfies(&TypeInfo::Float));
        assert!(!TypeInfo::Float.satisfies(&TypeInfo::Int));
        assert!(!TypeInfo::None.satisfies(&TypeInfo::Int));
        let optional = TypeInfo::Union(vec![TypeInfo::Int, TypeInfo::None]);
        assert!(TypeInfo::None.satisfies(&optional));
        assert!(TypeInfo::Int.satisfies(&optional));
        assert!(!TypeInfo::Str.satisfies(&optional));
    }

    #[test]
    fn generators_match_return_types() {
        let cluster = cluster_for(
            "def make(n: int) -> int { return n }\ndef tag() -> str { return \"t\" }",
        );
        let ints = cluster.generators_for(&TypeInfo::Int);
        assert_eq!(ints.len(), 1);
        assert_eq!(ints[0].name, "make");
        let mut rng = StdRng::seed_from_u64(3);
        assert!(cluster.random_accessible(&mut rng).is_some());
    }
}
