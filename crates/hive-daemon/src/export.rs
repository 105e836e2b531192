//! Named capabilities a plugin attaches to an instance for other plugins.

use std::any::Any;
use std::fmt;
use std::rc::Rc;

use serde_json::Value;

use crate::instance::Instance;

type FunctionFn = dyn Fn(&[Value]) -> anyhow::Result<Value>;
type MethodFn = dyn Fn(&mut Instance, &[Value]) -> anyhow::Result<Value>;

/// An exported value or function.
///
/// `Method` is the instance-prepending form: the instance the export lives
/// on is passed as the first argument of every call. `Function` receives the
/// call arguments only.
#[derive(Clone)]
pub enum Export {
    Value(Value),
    Object(Rc<dyn Any>),
    Function(Rc<FunctionFn>),
    Method(Rc<MethodFn>),
}

impl Export {
    pub fn value(value: impl Into<Value>) -> Self {
        Self::Value(value.into())
    }

    pub fn object<T: Any>(object: T) -> Self {
        Self::Object(Rc::new(object))
    }

    pub fn function<F>(func: F) -> Self
    where
        F: Fn(&[Value]) -> anyhow::Result<Value> + 'static,
    {
        Self::Function(Rc::new(func))
    }

    pub fn method<F>(func: F) -> Self
    where
        F: Fn(&mut Instance, &[Value]) -> anyhow::Result<Value> + 'static,
    {
        Self::Method(Rc::new(func))
    }

    #[must_use]
    pub const fn is_callable(&self) -> bool {
        matches!(self, Self::Function(_) | Self::Method(_))
    }

    #[must_use]
    pub const fn as_value(&self) -> Option<&Value> {
        match self {
            Self::Value(v) => Some(v),
            _ => None,
        }
    }

    /// Downcast an `Object` export.
    #[must_use]
    pub fn downcast<T: Any>(&self) -> Option<Rc<T>> {
        match self {
            Self::Object(obj) => Rc::clone(obj).downcast::<T>().ok(),
            _ => None,
        }
    }
}

impl fmt::Debug for Export {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Self::Object(_) => f.write_str("Object(..)"),
            Self::Function(_) => f.write_str("Function(..)"),
            Self::Method(_) => f.write_str("Method(..)"),
        }
    }
}

/// An export together with the plugin that claimed its name.
#[derive(Debug, Clone)]
pub struct ExportEntry {
    pub owner: String,
    pub export: Export,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::RefCell;

    #[test]
    fn test_value_export() {
        let export = Export::value(json!({"zoom": 2}));
        assert!(!export.is_callable());
        assert_eq!(export.as_value(), Some(&json!({"zoom": 2})));
        assert!(export.downcast::<String>().is_none());
    }

    #[test]
    fn test_object_downcast() {
        let export = Export::object(RefCell::new(vec![1, 2, 3]));
        let shared = export.downcast::<RefCell<Vec<i32>>>().unwrap();
        shared.borrow_mut().push(4);

        let again = export.downcast::<RefCell<Vec<i32>>>().unwrap();
        assert_eq!(*again.borrow(), vec![1, 2, 3, 4]);
        assert!(export.downcast::<String>().is_none());
    }

    #[test]
    fn test_function_export() {
        let export = Export::function(|args| Ok(json!(args.len())));
        assert!(export.is_callable());
        let Export::Function(func) = export else {
            panic!("Expected function");
        };
        assert_eq!(func(&[json!(1), json!(2)]).unwrap(), json!(2));
    }

    #[test]
    fn test_debug_hides_closures() {
        assert_eq!(format!("{:?}", Export::method(|_, _| Ok(Value::Null))), "Method(..)");
    }
}
