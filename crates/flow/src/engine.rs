// Archivo: engine.rs
// Propósito: `FlowEngine`, fachada que reúne almacén, locks y
// configuración. Crea builders de flujo y expone lecturas de
// administración sobre contextos y trazas.
use crate::builder::FlowBuilder;
use crate::config::EngineConfig;
use crate::domain::{stream_id, FlowContext};
use crate::errors::Result;
use crate::locks::FlowLocks;
use crate::repository::FlowContextRepository;
use crate::stubs::{InMemoryFlowContextRepository, MemoryFlowLocks};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Motor de flujos.
///
/// Todos los flujos creados desde un mismo motor comparten almacén y
/// proveedor de locks; cada uno mantiene su propio registro de sesiones.
#[derive(Clone)]
pub struct FlowEngine {
    repo: Arc<dyn FlowContextRepository>,
    locks: Arc<dyn FlowLocks>,
    config: EngineConfig,
}

impl FlowEngine {
    pub fn new(repo: Arc<dyn FlowContextRepository>, locks: Arc<dyn FlowLocks>, config: EngineConfig) -> Self {
        Self { repo, locks, config }
    }

    /// Motor con almacén y locks en memoria.
    pub fn in_memory(config: EngineConfig) -> Self {
        Self::new(Arc::new(InMemoryFlowContextRepository::new()),
                  Arc::new(MemoryFlowLocks::new()),
                  config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn repository(&self) -> &Arc<dyn FlowContextRepository> {
        &self.repo
    }

    pub fn locks(&self) -> &Arc<dyn FlowLocks> {
        &self.locks
    }

    /// Empieza a construir el flujo `meta_id` en la versión `version`.
    pub fn create<D>(&self, meta_id: &str, version: &str) -> FlowBuilder<D, D> {
        FlowBuilder::new(stream_id(meta_id, version),
                         self.repo.clone(),
                         self.locks.clone(),
                         self.config.clone())
    }

    pub fn contexts_of_trace(&self, trace_id: &Uuid) -> Result<Vec<FlowContext>> {
        self.repo.get_contexts_by_trace(trace_id)
    }

    pub fn is_trace_terminated(&self, trace_id: &Uuid) -> Result<bool> {
        self.repo.is_traces_terminate(std::slice::from_ref(trace_id))
    }

    /// Contextos aún pendientes de cualquier versión de `meta_id`.
    pub fn running_contexts(&self, meta_id: &str) -> Result<Vec<FlowContext>> {
        self.repo.find_running_context_by_meta_id(meta_id)
    }

    /// Borra contextos y trazas de una versión. Devuelve los contextos
    /// borrados.
    pub fn purge(&self, meta_id: &str, version: &str) -> Result<usize> {
        let stream = stream_id(meta_id, version);
        let removed = self.repo.delete(&stream)?;
        info!(stream = %stream, removed, "contextos purgados");
        Ok(removed)
    }
}
