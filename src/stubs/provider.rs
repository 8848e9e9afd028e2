use std::{collections::HashMap, sync::Arc};

use crate::{
    core::{
        domain::Language,
        traits::backend::{Backend, BackendError, BackendProvider},
    },
    native::interpreter::InterpreterBackend,
    stubs::{backend::BackendStub, engine::ScriptEngine},
};

/// Provider backed by in-process stubs. Languages without a stub are reported
/// as not installed.
#[derive(Debug, Default, Clone)]
pub struct StubProvider {
    engines: HashMap<Language, Arc<ScriptEngine>>,
    backends: HashMap<Language, BackendStub>,
}

impl StubProvider {
    pub fn with_engine(mut self, language: Language, engine: Arc<ScriptEngine>) -> Self {
        self.engines.insert(language, engine);
        self
    }

    pub fn with_backend(mut self, language: Language, backend: BackendStub) -> Self {
        self.backends.insert(language, backend);
        self
    }
}

impl BackendProvider for StubProvider {
    fn backend(&self, language: Language) -> Result<Arc<dyn Backend>, BackendError> {
        if let Some(engine) = self.engines.get(&language) {
            return Ok(Arc::new(InterpreterBackend::new(engine.clone())));
        }
        match self.backends.get(&language) {
            Some(backend) => Ok(Arc::new(backend.clone())),
            None => Err(BackendError::NotInstalled {
                toolchain: format!("The {language} backend"),
                path: "stub://none".to_string(),
            }),
        }
    }
}
