use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use flowrun_core::traits::RecordSource;
use flowrun_core::{FlowError, GuardrailConfig, Result};

use super::{CompanyCount, Guardrail, MinimumNumber, RecordCheck, RecordGuardrail, RequiredKeys};

/// Shared collaborators handed to guardrail factories.
#[derive(Clone, Default)]
pub struct GuardrailDeps {
    pub records: Option<Arc<dyn RecordSource>>,
}

type Factory = Box<dyn Fn(&GuardrailConfig, &GuardrailDeps) -> Result<Arc<dyn Guardrail>> + Send + Sync>;

/// Maps guardrail type tags to constructors.
pub struct GuardrailRegistry {
    factories: HashMap<String, Factory>,
    deps: GuardrailDeps,
}

impl GuardrailRegistry {
    pub fn new(deps: GuardrailDeps) -> Self {
        Self {
            factories: HashMap::new(),
            deps,
        }
    }

    /// Registry with every built-in guardrail. Record-backed tags are
    /// registered even without a record source; creating one then fails.
    pub fn with_builtins(records: Option<Arc<dyn RecordSource>>) -> Self {
        let mut registry = Self::new(GuardrailDeps { records });

        registry.register("minimum_number", |cfg, _| {
            Ok(Arc::new(MinimumNumber::from_config(cfg)?) as Arc<dyn Guardrail>)
        });
        registry.register("company_count", |cfg, _| {
            Ok(Arc::new(CompanyCount::from_config(cfg)?) as Arc<dyn Guardrail>)
        });
        registry.register("required_keys", |cfg, _| {
            Ok(Arc::new(RequiredKeys::from_config(cfg)?) as Arc<dyn Guardrail>)
        });
        for tag in [
            "empty_data_processing",
            "data_processing",
            "data_processing_count",
            "company_name_not_null",
        ] {
            registry.register(tag, record_factory);
        }

        registry
    }

    /// Register or replace a factory for a type tag.
    pub fn register<F>(&mut self, tag: impl Into<String>, factory: F)
    where
        F: Fn(&GuardrailConfig, &GuardrailDeps) -> Result<Arc<dyn Guardrail>> + Send + Sync + 'static,
    {
        self.factories.insert(tag.into(), Box::new(factory));
    }

    /// Build a validator. Unknown tags are a configuration error.
    pub fn create(&self, config: &GuardrailConfig) -> Result<Arc<dyn Guardrail>> {
        let factory = self.factories.get(&config.guardrail_type).ok_or_else(|| {
            FlowError::Configuration(format!("unknown guardrail type: {}", config.guardrail_type))
        })?;
        let guardrail = factory(config, &self.deps)?;
        debug!(guardrail = %config.guardrail_type, "Created guardrail");
        Ok(guardrail)
    }

    /// Registered tags, sorted.
    pub fn types(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.factories.keys().cloned().collect();
        tags.sort();
        tags
    }
}

fn record_factory(config: &GuardrailConfig, deps: &GuardrailDeps) -> Result<Arc<dyn Guardrail>> {
    let check = RecordCheck::from_config(config)?;
    let source = deps.records.clone().ok_or_else(|| {
        FlowError::Configuration(format!(
            "guardrail {} requires a record source, none is configured",
            config.guardrail_type
        ))
    })?;
    Ok(Arc::new(RecordGuardrail::new(check, source)))
}
