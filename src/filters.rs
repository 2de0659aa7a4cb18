// Filter trait, built-in filters and the filter pipeline

use anyhow::Result;
use std::collections::HashMap;

use crate::error::TemplateError;
use crate::value::Value;

/// A pure value transformation referenced by name from `[[ value | name(args) ]]`.
pub trait Filter: Send + Sync {
    fn name(&self) -> &str;
    fn apply(&self, value: &Value, args: &[Value]) -> Result<Value>;
}

/// URL-encode filter
pub struct EncodeFilter;

impl Filter for EncodeFilter {
    fn name(&self) -> &str {
        "encode"
    }

    fn apply(&self, value: &Value, _args: &[Value]) -> Result<Value> {
        Ok(Value::String(
            urlencoding::encode(&value.to_output()).to_string(),
        ))
    }
}

/// Trim whitespace filter
pub struct TrimFilter;

impl Filter for TrimFilter {
    fn name(&self) -> &str {
        "trim"
    }

    fn apply(&self, value: &Value, _args: &[Value]) -> Result<Value> {
        Ok(Value::String(value.to_output().trim().to_string()))
    }
}

pub struct UpperFilter;

impl Filter for UpperFilter {
    fn name(&self) -> &str {
        "upper"
    }

    fn apply(&self, value: &Value, _args: &[Value]) -> Result<Value> {
        Ok(Value::String(value.to_output().to_uppercase()))
    }
}

pub struct LowerFilter;

impl Filter for LowerFilter {
    fn name(&self) -> &str {
        "lower"
    }

    fn apply(&self, value: &Value, _args: &[Value]) -> Result<Value> {
        Ok(Value::String(value.to_output().to_lowercase()))
    }
}

/// Adapter so a closure can be registered as a filter.
pub struct FnFilter<F> {
    name: String,
    func: F,
}

impl<F> FnFilter<F>
where
    F: Fn(&Value, &[Value]) -> Result<Value> + Send + Sync,
{
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

impl<F> Filter for FnFilter<F>
where
    F: Fn(&Value, &[Value]) -> Result<Value> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, value: &Value, args: &[Value]) -> Result<Value> {
        (self.func)(value, args)
    }
}

/// Registry of filters, applied left-to-right by [`FilterPipeline::apply`].
pub struct FilterPipeline {
    filters: HashMap<String, Box<dyn Filter>>,
}

impl FilterPipeline {
    pub fn new() -> Self {
        let mut pipeline = Self::empty();
        pipeline.register(Box::new(EncodeFilter));
        pipeline.register(Box::new(TrimFilter));
        pipeline.register(Box::new(UpperFilter));
        pipeline.register(Box::new(LowerFilter));
        pipeline
    }

    /// A pipeline with no built-in filters.
    pub fn empty() -> Self {
        Self {
            filters: HashMap::new(),
        }
    }

    pub fn register(&mut self, filter: Box<dyn Filter>) -> &mut Self {
        self.filters.insert(filter.name().to_string(), filter);
        self
    }

    pub fn register_fn<F>(&mut self, name: &str, func: F) -> &mut Self
    where
        F: Fn(&Value, &[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        self.register(Box::new(FnFilter::new(name, func)))
    }

    pub fn get(&self, name: &str) -> Option<&dyn Filter> {
        self.filters.get(name).map(|b| b.as_ref())
    }

    pub fn has(&self, name: &str) -> bool {
        self.filters.contains_key(name)
    }

    /// Run `value` through each `(name, args)` stage in order.
    pub fn apply(
        &self,
        value: Value,
        stages: &[(&str, Vec<Value>)],
    ) -> std::result::Result<Value, TemplateError> {
        stages.iter().try_fold(value, |current, (name, args)| {
            let filter = self.get(name).ok_or_else(|| TemplateError::FilterNotFound {
                name: name.to_string(),
            })?;
            filter
                .apply(&current, args)
                .map_err(|source| TemplateError::Filter {
                    name: name.to_string(),
                    source: source.into(),
                })
        })
    }
}

impl Default for FilterPipeline {
    fn default() -> Self {
        Self::new()
    }
}
