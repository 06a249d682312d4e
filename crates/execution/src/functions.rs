//! Scalar function registry injected into expression compilation.

use std::collections::HashMap;
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, Float64Array, Int64Array, StringArray};
use arrow_schema::DataType;
use colex_common::{ColexError, Result};
use parking_lot::RwLock;

/// Runtime scalar function contract.
pub trait ScalarFunction: Send + Sync {
    /// Stable lowercase function name (`upper`).
    fn name(&self) -> &str;
    /// Return type inference from argument types.
    fn return_type(&self, arg_types: &[DataType]) -> Result<DataType>;
    /// Batch-wise invocation with Arrow arrays.
    fn invoke(&self, args: &[ArrayRef]) -> Result<ArrayRef>;
}

/// Name-keyed function table owned by the bootstrap and shared via `Arc`.
#[derive(Default)]
pub struct FunctionRegistry {
    functions: RwLock<HashMap<String, Arc<dyn ScalarFunction>>>,
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self.functions.read().keys().cloned().collect();
        f.debug_struct("FunctionRegistry")
            .field("functions", &names)
            .finish()
    }
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with `abs` and `upper`.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register(Arc::new(AbsFunction));
        registry.register(Arc::new(UpperFunction));
        registry
    }

    /// Register or replace a function.
    ///
    /// Returns `true` when an existing function with same name was replaced.
    pub fn register(&self, function: Arc<dyn ScalarFunction>) -> bool {
        self.functions
            .write()
            .insert(function.name().to_ascii_lowercase(), function)
            .is_some()
    }

    /// Deregister a function by name.
    pub fn deregister(&self, name: &str) -> bool {
        self.functions
            .write()
            .remove(&name.to_ascii_lowercase())
            .is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ScalarFunction>> {
        self.functions
            .read()
            .get(&name.to_ascii_lowercase())
            .cloned()
    }
}

struct AbsFunction;

impl ScalarFunction for AbsFunction {
    fn name(&self) -> &str {
        "abs"
    }

    fn return_type(&self, arg_types: &[DataType]) -> Result<DataType> {
        match arg_types {
            [DataType::Int64] => Ok(DataType::Int64),
            [DataType::Float64] => Ok(DataType::Float64),
            other => Err(ColexError::Execution(format!(
                "abs expects one Int64 or Float64 argument, got {other:?}"
            ))),
        }
    }

    fn invoke(&self, args: &[ArrayRef]) -> Result<ArrayRef> {
        let arg = args
            .first()
            .ok_or_else(|| ColexError::Execution("abs expects one argument".to_string()))?;
        match arg.data_type() {
            DataType::Int64 => {
                let a = arg
                    .as_any()
                    .downcast_ref::<Int64Array>()
                    .ok_or_else(|| ColexError::Execution("expected Int64 array".to_string()))?;
                let out: Int64Array = a.iter().map(|v| v.map(i64::wrapping_abs)).collect();
                Ok(Arc::new(out))
            }
            DataType::Float64 => {
                let a = arg
                    .as_any()
                    .downcast_ref::<Float64Array>()
                    .ok_or_else(|| ColexError::Execution("expected Float64 array".to_string()))?;
                let out: Float64Array = a.iter().map(|v| v.map(f64::abs)).collect();
                Ok(Arc::new(out))
            }
            other => Err(ColexError::Execution(format!(
                "abs is not defined for {other:?}"
            ))),
        }
    }
}

struct UpperFunction;

impl ScalarFunction for UpperFunction {
    fn name(&self) -> &str {
        "upper"
    }

    fn return_type(&self, arg_types: &[DataType]) -> Result<DataType> {
        match arg_types {
            [DataType::Utf8] => Ok(DataType::Utf8),
            other => Err(ColexError::Execution(format!(
                "upper expects one Utf8 argument, got {other:?}"
            ))),
        }
    }

    fn invoke(&self, args: &[ArrayRef]) -> Result<ArrayRef> {
        let arg = args
            .first()
            .ok_or_else(|| ColexError::Execution("upper expects one argument".to_string()))?;
        let a = arg
            .as_any()
            .downcast_ref::<StringArray>()
            .ok_or_else(|| ColexError::Execution("expected Utf8 array".to_string()))?;
        let out: StringArray = a.iter().map(|v| v.map(str::to_uppercase)).collect();
        Ok(Arc::new(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_case_insensitive_and_replaceable() {
        let registry = FunctionRegistry::with_builtins();
        assert!(registry.get("UPPER").is_some());
        assert!(registry.register(Arc::new(UpperFunction)));
        assert!(registry.deregister("upper"));
        assert!(registry.get("upper").is_none());
    }

    #[test]
    fn abs_handles_nulls() {
        let registry = FunctionRegistry::with_builtins();
        let abs = registry.get("abs").expect("abs");
        let input: ArrayRef = Arc::new(Int64Array::from(vec![Some(-3), None, Some(4)]));
        let out = abs.invoke(&[input]).expect("invoke");
        let out = out.as_any().downcast_ref::<Int64Array>().expect("int64");
        assert_eq!(out.value(0), 3);
        assert!(out.is_null(1));
        assert_eq!(out.value(2), 4);
    }
}
