//! Calculator type registry.
//!
//! Maps calculator names (as referenced by [`NodeConfig::calculator`]) to a
//! contract function and a factory closure. A registry is explicit state with
//! a defined lifecycle: populate it once at startup, hand a reference to
//! [`CalculatorGraph::new`], and leave it untouched while runs are active.
//!
//! [`NodeConfig::calculator`]: crate::config::NodeConfig
//! [`CalculatorGraph::new`]: crate::graph::CalculatorGraph::new

use crate::calculator::{Calculator, CalculatorContract};
use crate::error::{GraphError, Result};
use std::collections::HashMap;
use std::sync::Arc;

type ContractFn = fn(&mut CalculatorContract) -> Result<()>;
type FactoryFn = Arc<dyn Fn() -> Box<dyn Calculator> + Send + Sync>;

struct CalculatorEntry {
    contract: ContractFn,
    factory: FactoryFn,
}

/// A name → calculator-type table.
#[derive(Default)]
pub struct CalculatorRegistry {
    entries: HashMap<String, CalculatorEntry>,
}

impl CalculatorRegistry {
    /// An empty registry.
    pub fn new() -> CalculatorRegistry {
        CalculatorRegistry::default()
    }

    /// Registers `C` under `name`, constructing instances with `C::default()`.
    ///
    /// Registering the same name twice replaces the earlier entry.
    pub fn register<C>(&mut self, name: impl Into<String>)
    where
        C: Calculator + Default + 'static,
    {
        self.register_with(name, C::default);
    }

    /// Registers a calculator type with an explicit factory, for types whose
    /// construction takes parameters captured by the closure.
    pub fn register_with<C, F>(&mut self, name: impl Into<String>, factory: F)
    where
        C: Calculator + 'static,
        F: Fn() -> C + Send + Sync + 'static,
    {
        let name = name.into();
        let replaced = self
            .entries
            .insert(
                name.clone(),
                CalculatorEntry {
                    contract: C::contract,
                    factory: Arc::new(move || Box::new(factory()) as Box<dyn Calculator>),
                },
            )
            .is_some();
        if replaced {
            tracing::warn!(calculator = %name, "replacing existing calculator registration");
        }
    }

    /// True if `name` is registered.
    pub fn is_registered(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// The registered names, unordered.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub(crate) fn fill_contract(&self, name: &str, contract: &mut CalculatorContract) -> Result<()> {
        let entry = self.lookup(name)?;
        (entry.contract)(contract)
    }

    /// Constructs a fresh instance of the calculator registered under `name`.
    pub fn instantiate(&self, name: &str) -> Result<Box<dyn Calculator>> {
        let entry = self.lookup(name)?;
        Ok((entry.factory)())
    }

    /// The factory for `name`, shared so graphs can construct fresh
    /// instances on every run without holding the registry.
    pub(crate) fn factory(&self, name: &str) -> Result<FactoryFn> {
        Ok(self.lookup(name)?.factory.clone())
    }

    fn lookup(&self, name: &str) -> Result<&CalculatorEntry> {
        self.entries.get(name).ok_or_else(|| {
            GraphError::Validation(format!("calculator type '{name}' is not registered"))
        })
    }
}
