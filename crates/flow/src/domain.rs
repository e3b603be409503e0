// Archivo: domain.rs
// Propósito: tipos de datos persistidos por el almacén de contextos:
// `FlowContext` (un dato en tránsito) y `FlowTrace` (una unidad de trabajo).
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeSet;
use uuid::Uuid;

/// Identificador de stream de una definición de flujo en una versión.
pub fn stream_id(meta_id: &str, version: &str) -> String {
    format!("{meta_id}-{version}")
}

/// Estado de un contexto.
///
/// `Pending` espera ser tomado en su posición; `Sent` ya fue consumido y su
/// resultado vive en la posición siguiente; `Error` es un fallo terminal;
/// `Terminated` es el estado terminal propio de este almacén (descartado por
/// un filtro, entregado por el End o archivado al cerrar la traza).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContextStatus {
    Pending,
    Sent,
    Error,
    Terminated,
}

impl ContextStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ContextStatus::Error | ContextStatus::Terminated)
    }
}

/// Un item de datos en tránsito por el flujo.
///
/// `position` y `status` sólo los cambia el nodo responsable de esa posición,
/// bajo su lock, y siempre mediante `update_status`/`commit_step` del
/// repositorio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowContext<T = JsonValue> {
    pub id: Uuid,
    pub trace_id: Uuid,
    pub stream_id: String,
    pub position: String,
    pub batch_id: Uuid,
    pub status: ContextStatus,
    pub data: T,
    /// Orden relativo dentro de la sesión en esta posición.
    pub index: u64,
    pub parallel_id: Option<Uuid>,
    pub session_id: Uuid,
    pub retries: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl<T> FlowContext<T> {
    /// Crea un contexto `Pending` en `position`.
    pub fn new(stream_id: &str,
               position: &str,
               trace_id: Uuid,
               session_id: Uuid,
               batch_id: Uuid,
               index: u64,
               data: T)
               -> Self {
        let now = Utc::now();
        Self { id: Uuid::new_v4(),
               trace_id,
               stream_id: stream_id.to_string(),
               position: position.to_string(),
               batch_id,
               status: ContextStatus::Pending,
               data,
               index,
               parallel_id: None,
               session_id,
               retries: 0,
               created_at: now,
               updated_at: now }
    }

    /// Contexto hijo en la posición siguiente: conserva traza, sesión y
    /// correlación paralela del origen.
    pub fn derive<U>(&self, position: &str, batch_id: Uuid, index: u64, data: U) -> FlowContext<U> {
        let mut next = FlowContext::new(&self.stream_id,
                                        position,
                                        self.trace_id,
                                        self.session_id,
                                        batch_id,
                                        index,
                                        data);
        next.parallel_id = self.parallel_id;
        next
    }

    pub fn map_data<U>(self, f: impl FnOnce(T) -> U) -> FlowContext<U> {
        FlowContext { id: self.id,
                      trace_id: self.trace_id,
                      stream_id: self.stream_id,
                      position: self.position,
                      batch_id: self.batch_id,
                      status: self.status,
                      data: f(self.data),
                      index: self.index,
                      parallel_id: self.parallel_id,
                      session_id: self.session_id,
                      retries: self.retries,
                      created_at: self.created_at,
                      updated_at: self.updated_at }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TraceStatus {
    Running,
    Completed,
    Failed,
}

/// Una unidad de trabajo: un `offer` y todo lo que provoca aguas abajo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowTrace {
    pub id: Uuid,
    pub stream_id: String,
    pub session_id: Uuid,
    /// Contextos de la traza que aún no alcanzaron un estado terminal.
    pub context_pool: BTreeSet<Uuid>,
    pub status: TraceStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl FlowTrace {
    pub fn new(stream_id: &str, session_id: Uuid) -> Self {
        Self { id: Uuid::new_v4(),
               stream_id: stream_id.to_string(),
               session_id,
               context_pool: BTreeSet::new(),
               status: TraceStatus::Running,
               started_at: Utc::now(),
               ended_at: None }
    }

    pub fn is_terminated(&self) -> bool {
        self.status != TraceStatus::Running
    }
}
