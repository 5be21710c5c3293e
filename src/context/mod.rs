//! Process-wide registries for template filters and validator functions.
//!
//! Both registries are populated once before any scheduling starts and are
//! read-only afterwards; the `OnceLock` storage enforces that. User
//! extensions register through [`install`], the binary falls back to the
//! shipped packs via [`install_defaults`].

use std::sync::OnceLock;

use indexmap::IndexMap;

use crate::errors::{MonitorError, Result};
use crate::expr::{Env, NativeFn, Value};

/// Named collection of native functions.
#[derive(Default, Clone)]
pub struct Registry {
    entries: IndexMap<String, NativeFn>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, func: NativeFn) {
        self.entries.insert(name.into(), func);
    }

    pub fn get(&self, name: &str) -> Option<&NativeFn> {
        self.entries.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    /// Bind every entry into `env` as a callable value.
    pub fn bind_into(&self, env: &mut Env) {
        for (name, func) in &self.entries {
            env.bind(name.clone(), Value::Func(func.clone()));
        }
    }
}

static FILTERS: OnceLock<Registry> = OnceLock::new();
static VALIDATORS: OnceLock<Registry> = OnceLock::new();

/// Install custom registries. Fails once scheduling has started (or any
/// earlier call installed them).
pub fn install(filters: Registry, validators: Registry) -> Result<()> {
    FILTERS
        .set(filters)
        .map_err(|_| MonitorError::Config("filter registry already installed".into()))?;
    VALIDATORS
        .set(validators)
        .map_err(|_| MonitorError::Config("validator registry already installed".into()))?;
    Ok(())
}

/// Install the shipped filter and validator packs unless registries are
/// already present.
pub fn install_defaults() {
    FILTERS.get_or_init(crate::filters::default_filters);
    VALIDATORS.get_or_init(crate::validators::default_validators);
}

fn filters() -> &'static Registry {
    install_defaults();
    FILTERS.get().expect("installed above")
}

fn validators() -> &'static Registry {
    install_defaults();
    VALIDATORS.get().expect("installed above")
}

/// Rendering environment: registered filters plus the given globals.
/// Builtins are deliberately absent; templates only see filters and the
/// scheduler-provided constants.
pub fn filter_env(globals: &[(&str, Value)]) -> Env {
    let mut env = Env::new();
    filters().bind_into(&mut env);
    for (name, value) in globals {
        env.bind(*name, value.clone());
    }
    env
}

/// Validator environment: the builtin allow-list plus registered validator
/// functions (which may shadow builtins, never the other way around).
pub fn validator_env() -> Env {
    let mut env = crate::expr::builtin_env();
    validators().bind_into(&mut env);
    env
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_env_contains_filters_and_globals() {
        let env = filter_env(&[("BASETIME", Value::Int(1))]);
        assert!(env.contains("dt_add"));
        assert!(env.contains("BASETIME"));
        // builtins stay out of template scope
        assert!(!env.contains("len"));
    }

    #[test]
    fn validator_env_contains_builtins_and_validators() {
        let env = validator_env();
        assert!(env.contains("len"));
        assert!(env.contains("claim"));
        assert!(env.contains("gt"));
    }
}
