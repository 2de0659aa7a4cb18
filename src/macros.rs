// Macro registry: named callables invoked with `##name(args)##`

use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::TemplateError;
use crate::value::Value;

/// The single capability every registered macro provides.
pub trait MacroHandler: Send + Sync {
    fn execute(&self, args: &[Value]) -> Result<Value>;
}

/// A stateful macro object that knows its own name.
pub trait Macro: MacroHandler {
    fn name(&self) -> &str;
}

/// Adapter for plain closures.
pub struct FnMacro<F>(F);

impl<F> MacroHandler for FnMacro<F>
where
    F: Fn(&[Value]) -> Result<Value> + Send + Sync,
{
    fn execute(&self, args: &[Value]) -> Result<Value> {
        (self.0)(args)
    }
}

struct InstanceMacro(Arc<dyn Macro>);

impl MacroHandler for InstanceMacro {
    fn execute(&self, args: &[Value]) -> Result<Value> {
        self.0.execute(args)
    }
}

/// Name-keyed registry of macros. Mutators return `&mut Self` for chaining.
#[derive(Default)]
pub struct MacroRegistry {
    macros: HashMap<String, Arc<dyn MacroHandler>>,
}

impl MacroRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: &str, callable: F) -> &mut Self
    where
        F: Fn(&[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        self.macros
            .insert(name.to_string(), Arc::new(FnMacro(callable)));
        self
    }

    pub fn register_instance(&mut self, instance: impl Macro + 'static) -> &mut Self {
        let instance: Arc<dyn Macro> = Arc::new(instance);
        self.macros
            .insert(instance.name().to_string(), Arc::new(InstanceMacro(instance)));
        self
    }

    pub fn has(&self, name: &str) -> bool {
        self.macros.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn MacroHandler>, TemplateError> {
        self.macros
            .get(name)
            .cloned()
            .ok_or_else(|| TemplateError::MacroNotFound {
                name: name.to_string(),
            })
    }

    pub fn call(&self, name: &str, args: &[Value]) -> Result<Value, TemplateError> {
        let handler = self.get(name)?;
        handler.execute(args).map_err(|source| TemplateError::Macro {
            name: name.to_string(),
            source: source.into(),
        })
    }

    pub fn remove(&mut self, name: &str) -> &mut Self {
        self.macros.remove(name);
        self
    }

    pub fn clear(&mut self) -> &mut Self {
        self.macros.clear();
        self
    }

    pub fn count(&self) -> usize {
        self.macros.len()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.macros.keys().cloned().collect();
        names.sort();
        names
    }
}
