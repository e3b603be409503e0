// Archivo: repository.rs
// Propósito: definir el contrato `FlowContextRepository` que deben cumplir
// los almacenes de contextos y trazas (memoria, SQL, KV distribuido...).
//
// Las mutaciones son estrechas: cada método cambia sólo los campos de su
// responsabilidad. `status` y `position` se tocan únicamente vía
// `update_status`, `update_to_sent` o `commit_step`.
use crate::domain::{ContextStatus, FlowContext, FlowTrace};
use crate::errors::{FlowError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Filtro evaluado por el almacén antes de devolver contextos.
pub type ContextFilter = Arc<dyn Fn(&FlowContext) -> bool + Send + Sync>;

/// Resultado de `request_producing_context`.
#[derive(Debug, Clone, Default)]
pub struct ProducedContexts {
    /// Contextos que pasaron el filtro; siguen `Pending`.
    pub kept: Vec<FlowContext>,
    /// Contextos rechazados; el almacén ya los dejó `Terminated`.
    pub dropped: Vec<FlowContext>,
}

/// Un avance completo de nodo: lo consumido pasa a `Sent`, lo descartado a
/// `Terminated` y lo producido se guarda `Pending` en su nueva posición.
#[derive(Debug, Clone, Default)]
pub struct StepCommit {
    pub consumed: Vec<FlowContext>,
    pub dropped: Vec<FlowContext>,
    pub produced: Vec<FlowContext>,
}

impl StepCommit {
    pub fn is_empty(&self) -> bool {
        self.consumed.is_empty() && self.dropped.is_empty() && self.produced.is_empty()
    }
}

/// Contrato del almacén de contextos.
///
/// Todas las operaciones deben ser seguras con llamadores concurrentes,
/// también entre procesos. Cualquier método puede fallar con
/// `FlowError::StoreUnavailable`; el motor reintenta el paso completo.
pub trait FlowContextRepository: Send + Sync {
    /// Contextos en alguna de `positions` con el estado dado.
    fn get_contexts_by_position(&self,
                                stream_id: &str,
                                positions: &[String],
                                status: ContextStatus)
                                -> Result<Vec<FlowContext>>;

    /// Contextos de un lote en una posición.
    fn get_contexts_by_batch(&self,
                             stream_id: &str,
                             position: &str,
                             batch_id: &Uuid,
                             status: ContextStatus)
                             -> Result<Vec<FlowContext>>;

    fn get_contexts_by_trace(&self, trace_id: &Uuid) -> Result<Vec<FlowContext>>;

    fn get_contexts_by_parallel(&self, parallel_id: &Uuid) -> Result<Vec<FlowContext>>;

    /// Devuelve `FlowError::NotFound` si no existe.
    fn get_by_id(&self, id: &Uuid) -> Result<FlowContext>;

    /// Los ids inexistentes se omiten.
    fn get_by_ids(&self, ids: &[Uuid]) -> Result<Vec<FlowContext>>;

    fn get_pending_and_sent_by_ids(&self, ids: &[Uuid]) -> Result<Vec<FlowContext>>;

    /// Inserta (o reemplaza) contextos completos.
    fn save(&self, contexts: &[FlowContext]) -> Result<()>;

    /// Actualiza el contenido (`data`, `batch_id`, `parallel_id`, `retries`).
    fn update(&self, contexts: &[FlowContext]) -> Result<()>;

    /// Actualiza sólo `data`.
    fn update_flow_data(&self, contexts: &[FlowContext]) -> Result<()>;

    /// Cambia estado y posición.
    fn update_status(&self, contexts: &[FlowContext], status: ContextStatus, position: &str) -> Result<()>;

    fn update_index(&self, contexts: &[FlowContext]) -> Result<()>;

    /// Marca como consumidos en su posición actual.
    fn update_to_sent(&self, contexts: &[FlowContext]) -> Result<()>;

    /// Hasta `limit` contextos `Pending` en `positions`, ordenados por
    /// sesión (orden de llegada) y por `index` dentro de cada sesión.
    /// `sessions` limita cuántos contextos de cada sesión listada se
    /// devuelven en esta petición; las sesiones ausentes no tienen límite.
    fn request_mapping_context(&self,
                               stream_id: &str,
                               positions: &[String],
                               sessions: &HashMap<Uuid, u64>,
                               limit: usize)
                               -> Result<Vec<FlowContext>>;

    /// Como `request_mapping_context` pero aplicando `filter` en el
    /// almacén. Los rechazados se marcan `Terminated` en la misma operación
    /// y se informan en `dropped` para que el llamador los contabilice.
    fn request_producing_context(&self,
                                 stream_id: &str,
                                 positions: &[String],
                                 filter: &ContextFilter,
                                 limit: usize)
                                 -> Result<ProducedContexts>;

    fn find_by_stream_id(&self, stream_id: &str) -> Result<Vec<FlowContext>> {
        Err(FlowError::Unsupported(format!("find_by_stream_id({stream_id})")))
    }

    /// Contextos `Pending` de cualquier versión de la definición `meta_id`.
    fn find_running_context_by_meta_id(&self, meta_id: &str) -> Result<Vec<FlowContext>> {
        Err(FlowError::Unsupported(format!("find_running_context_by_meta_id({meta_id})")))
    }

    /// Borra contextos y trazas del stream. Devuelve cuántos contextos borró.
    fn delete(&self, stream_id: &str) -> Result<usize> {
        Err(FlowError::Unsupported(format!("delete({stream_id})")))
    }

    fn save_trace(&self, trace: &FlowTrace) -> Result<()>;

    fn get_trace(&self, trace_id: &Uuid) -> Result<FlowTrace>;

    /// Cierra las trazas sin contextos `Pending`: sus `Sent` pasan a
    /// `Terminated` y la traza queda `Completed` (o `Failed` si alguno
    /// terminó en `Error`). Devuelve las trazas cerradas.
    fn update_to_terminated(&self, trace_ids: &[Uuid]) -> Result<Vec<Uuid>>;

    /// `true` si todas las trazas están cerradas.
    fn is_traces_terminate(&self, trace_ids: &[Uuid]) -> Result<bool>;

    /// Aplica un avance de nodo. La versión por defecto compone las
    /// mutaciones estrechas; un almacén transaccional debe sobrescribirla
    /// para que el avance sea todo o nada.
    fn commit_step(&self, step: &StepCommit) -> Result<()> {
        if !step.produced.is_empty() {
            self.save(&step.produced)?;
        }
        if !step.consumed.is_empty() {
            self.update_to_sent(&step.consumed)?;
        }
        for ctx in &step.dropped {
            self.update_status(std::slice::from_ref(ctx), ContextStatus::Terminated, &ctx.position)?;
        }
        Ok(())
    }
}
