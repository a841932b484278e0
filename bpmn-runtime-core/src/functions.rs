//! Named data transformations (for data mappings) and script actions.

use crate::types::Variables;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

pub type TransformFn = Arc<dyn Fn(&Value) -> Result<Value, String> + Send + Sync>;
pub type ActionFn = Arc<dyn Fn(&mut Variables) -> Result<(), ActionError> + Send + Sync>;

/// Failure raised by a script action. `code` is what error boundaries and
/// error event sub-processes match on.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("[{code}] {message}")]
pub struct ActionError {
    pub code: String,
    pub message: String,
}

impl ActionError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

#[derive(Default)]
pub struct FunctionRegistry {
    transforms: RwLock<HashMap<String, TransformFn>>,
    actions: RwLock<HashMap<String, ActionFn>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with `identity`, `to_string`, `upper`, `lower`
    /// and `not`.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register_transform("identity", |v| Ok(v.clone()));
        registry.register_transform("to_string", |v| {
            Ok(match v {
                Value::String(s) => Value::String(s.clone()),
                other => Value::String(other.to_string()),
            })
        });
        registry.register_transform("upper", |v| match v {
            Value::String(s) => Ok(Value::String(s.to_uppercase())),
            other => Err(format!("upper expects a string, got {other}")),
        });
        registry.register_transform("lower", |v| match v {
            Value::String(s) => Ok(Value::String(s.to_lowercase())),
            other => Err(format!("lower expects a string, got {other}")),
        });
        registry.register_transform("not", |v| match v {
            Value::Bool(b) => Ok(Value::Bool(!b)),
            other => Err(format!("not expects a boolean, got {other}")),
        });
        registry
    }

    pub fn register_transform<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(&Value) -> Result<Value, String> + Send + Sync + 'static,
    {
        let mut guard = self.transforms.write().unwrap_or_else(|e| e.into_inner());
        guard.insert(name.into(), Arc::new(f));
    }

    pub fn register_action<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(&mut Variables) -> Result<(), ActionError> + Send + Sync + 'static,
    {
        let mut guard = self.actions.write().unwrap_or_else(|e| e.into_inner());
        guard.insert(name.into(), Arc::new(f));
    }

    pub fn transform(&self, name: &str) -> Option<TransformFn> {
        let guard = self.transforms.read().unwrap_or_else(|e| e.into_inner());
        guard.get(name).cloned()
    }

    pub fn action(&self, name: &str) -> Option<ActionFn> {
        let guard = self.actions.read().unwrap_or_else(|e| e.into_inner());
        guard.get(name).cloned()
    }
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let transforms = self.transforms.read().unwrap_or_else(|e| e.into_inner());
        let actions = self.actions.read().unwrap_or_else(|e| e.into_inner());
        f.debug_struct("FunctionRegistry")
            .field("transforms", &transforms.keys().collect::<Vec<_>>())
            .field("actions", &actions.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builtins_transform_values() {
        let registry = FunctionRegistry::with_builtins();
        let upper = registry.transform("upper").unwrap();
        assert_eq!(upper(&json!("abc")).unwrap(), json!("ABC"));
        assert!(upper(&json!(1)).is_err());
        let to_string = registry.transform("to_string").unwrap();
        assert_eq!(to_string(&json!(42)).unwrap(), json!("42"));
        assert!(registry.transform("missing").is_none());
    }

    #[test]
    fn actions_mutate_variables() {
        let registry = FunctionRegistry::new();
        registry.register_action("bump", |vars| {
            let n = vars.get("n").and_then(Value::as_i64).unwrap_or(0);
            vars.insert("n".into(), json!(n + 1));
            Ok(())
        });
        let mut vars = Variables::new();
        (registry.action("bump").unwrap())(&mut vars).unwrap();
        assert_eq!(vars.get("n"), Some(&json!(1)));
    }
}
