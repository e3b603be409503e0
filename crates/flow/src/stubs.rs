// Archivo: stubs.rs
// Propósito: implementaciones en memoria para pruebas y uso standalone.
//
// Incluye un almacén de contextos en memoria
// (`InMemoryFlowContextRepository`) y un proveedor de locks local
// (`MemoryFlowLocks`). No son durables ni coordinan entre procesos.
use crate::domain::{ContextStatus, FlowContext, FlowTrace, TraceStatus};
use crate::errors::{FlowError, Result};
use crate::locks::{FlowLock, FlowLocks};
use crate::repository::{ContextFilter, FlowContextRepository, ProducedContexts, StepCommit};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use indexmap::IndexMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{Semaphore, TryAcquireError};
use uuid::Uuid;

/// Almacén de contextos en memoria.
///
/// Cada operación toma los mutex internos una sola vez, así que es atómica
/// respecto a otros llamadores del mismo proceso. `commit_step` valida que
/// lo consumido siga `Pending` antes de mutar nada.
pub struct InMemoryFlowContextRepository {
    contexts: Mutex<IndexMap<Uuid, FlowContext>>,
    traces: Mutex<HashMap<Uuid, FlowTrace>>,
}

impl InMemoryFlowContextRepository {
    pub fn new() -> Self {
        Self { contexts: Mutex::new(IndexMap::new()),
               traces: Mutex::new(HashMap::new()) }
    }

    fn lock<'a, T>(&self, m: &'a Mutex<T>) -> Result<MutexGuard<'a, T>> {
        m.lock()
         .map_err(|e| FlowError::StoreUnavailable(format!("mutex poisoned: {:?}", e)))
    }

    /// Número total de contextos guardados (cualquier estado).
    pub fn len(&self) -> usize {
        self.contexts.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn candidates<'a>(contexts: &'a IndexMap<Uuid, FlowContext>,
                      stream_id: &str,
                      positions: &[String])
                      -> Vec<&'a FlowContext> {
        let mut found: Vec<&FlowContext> =
            contexts.values()
                    .filter(|c| {
                        c.status == ContextStatus::Pending && c.stream_id == stream_id && positions.contains(&c.position)
                    })
                    .collect();
        let mut rank: HashMap<Uuid, usize> = HashMap::new();
        for c in &found {
            let next = rank.len();
            rank.entry(c.session_id).or_insert(next);
        }
        found.sort_by_key(|c| (rank.get(&c.session_id).copied().unwrap_or(usize::MAX), c.index));
        found
    }

    fn apply<F>(&self, contexts: &[FlowContext], mut f: F) -> Result<()>
        where F: FnMut(&mut FlowContext, &FlowContext)
    {
        let mut stored = self.lock(&self.contexts)?;
        let mut traces = self.lock(&self.traces)?;
        for ctx in contexts {
            if !stored.contains_key(&ctx.id) {
                return Err(FlowError::NotFound(format!("contexto {}", ctx.id)));
            }
        }
        let now = Utc::now();
        for ctx in contexts {
            if let Some(current) = stored.get_mut(&ctx.id) {
                f(current, ctx);
                current.updated_at = now;
                track(&mut traces, current);
            }
        }
        Ok(())
    }
}

impl Default for InMemoryFlowContextRepository {
    fn default() -> Self {
        Self::new()
    }
}

/// Mantiene el pool de contextos vivos de la traza.
fn track(traces: &mut HashMap<Uuid, FlowTrace>, ctx: &FlowContext) {
    if let Some(trace) = traces.get_mut(&ctx.trace_id) {
        if ctx.status.is_terminal() {
            trace.context_pool.remove(&ctx.id);
        } else {
            trace.context_pool.insert(ctx.id);
        }
    }
}

impl FlowContextRepository for InMemoryFlowContextRepository {
    fn get_contexts_by_position(&self,
                                stream_id: &str,
                                positions: &[String],
                                status: ContextStatus)
                                -> Result<Vec<FlowContext>> {
        let contexts = self.lock(&self.contexts)?;
        Ok(contexts.values()
                   .filter(|c| c.status == status && c.stream_id == stream_id && positions.contains(&c.position))
                   .cloned()
                   .collect())
    }

    fn get_contexts_by_batch(&self,
                             stream_id: &str,
                             position: &str,
                             batch_id: &Uuid,
                             status: ContextStatus)
                             -> Result<Vec<FlowContext>> {
        let contexts = self.lock(&self.contexts)?;
        Ok(contexts.values()
                   .filter(|c| {
                       c.stream_id == stream_id && c.position == position && c.batch_id == *batch_id && c.status == status
                   })
                   .cloned()
                   .collect())
    }

    fn get_contexts_by_trace(&self, trace_id: &Uuid) -> Result<Vec<FlowContext>> {
        let contexts = self.lock(&self.contexts)?;
        Ok(contexts.values().filter(|c| c.trace_id == *trace_id).cloned().collect())
    }

    fn get_contexts_by_parallel(&self, parallel_id: &Uuid) -> Result<Vec<FlowContext>> {
        let contexts = self.lock(&self.contexts)?;
        Ok(contexts.values()
                   .filter(|c| c.parallel_id == Some(*parallel_id))
                   .cloned()
                   .collect())
    }

    fn get_by_id(&self, id: &Uuid) -> Result<FlowContext> {
        let contexts = self.lock(&self.contexts)?;
        contexts.get(id)
                .cloned()
                .ok_or_else(|| FlowError::NotFound(format!("contexto {id}")))
    }

    fn get_by_ids(&self, ids: &[Uuid]) -> Result<Vec<FlowContext>> {
        let contexts = self.lock(&self.contexts)?;
        Ok(ids.iter().filter_map(|id| contexts.get(id).cloned()).collect())
    }

    fn get_pending_and_sent_by_ids(&self, ids: &[Uuid]) -> Result<Vec<FlowContext>> {
        let contexts = self.lock(&self.contexts)?;
        Ok(ids.iter()
              .filter_map(|id| contexts.get(id))
              .filter(|c| matches!(c.status, ContextStatus::Pending | ContextStatus::Sent))
              .cloned()
              .collect())
    }

    fn save(&self, contexts: &[FlowContext]) -> Result<()> {
        let mut stored = self.lock(&self.contexts)?;
        let mut traces = self.lock(&self.traces)?;
        for ctx in contexts {
            stored.insert(ctx.id, ctx.clone());
            track(&mut traces, ctx);
        }
        Ok(())
    }

    fn update(&self, contexts: &[FlowContext]) -> Result<()> {
        self.apply(contexts, |current, incoming| {
                current.data = incoming.data.clone();
                current.batch_id = incoming.batch_id;
                current.parallel_id = incoming.parallel_id;
                current.retries = incoming.retries;
            })
    }

    fn update_flow_data(&self, contexts: &[FlowContext]) -> Result<()> {
        self.apply(contexts, |current, incoming| current.data = incoming.data.clone())
    }

    fn update_status(&self, contexts: &[FlowContext], status: ContextStatus, position: &str) -> Result<()> {
        self.apply(contexts, |current, _| {
                current.status = status;
                current.position = position.to_string();
            })
    }

    fn update_index(&self, contexts: &[FlowContext]) -> Result<()> {
        self.apply(contexts, |current, incoming| current.index = incoming.index)
    }

    fn update_to_sent(&self, contexts: &[FlowContext]) -> Result<()> {
        self.apply(contexts, |current, _| current.status = ContextStatus::Sent)
    }

    fn request_mapping_context(&self,
                               stream_id: &str,
                               positions: &[String],
                               sessions: &HashMap<Uuid, u64>,
                               limit: usize)
                               -> Result<Vec<FlowContext>> {
        let contexts = self.lock(&self.contexts)?;
        let mut taken: HashMap<Uuid, u64> = HashMap::new();
        let mut out = Vec::new();
        for ctx in Self::candidates(&contexts, stream_id, positions) {
            if out.len() >= limit {
                break;
            }
            if let Some(cap) = sessions.get(&ctx.session_id) {
                let count = taken.entry(ctx.session_id).or_insert(0);
                if *count >= *cap {
                    continue;
                }
                *count += 1;
            }
            out.push(ctx.clone());
        }
        Ok(out)
    }

    fn request_producing_context(&self,
                                 stream_id: &str,
                                 positions: &[String],
                                 filter: &ContextFilter,
                                 limit: usize)
                                 -> Result<ProducedContexts> {
        let mut contexts = self.lock(&self.contexts)?;
        let mut traces = self.lock(&self.traces)?;
        let mut kept = Vec::new();
        let mut rejected = Vec::new();
        for ctx in Self::candidates(&contexts, stream_id, positions) {
            if kept.len() >= limit {
                break;
            }
            if filter(ctx) {
                kept.push(ctx.clone());
            } else {
                rejected.push(ctx.id);
            }
        }
        let now = Utc::now();
        let mut dropped = Vec::with_capacity(rejected.len());
        for id in rejected {
            if let Some(ctx) = contexts.get_mut(&id) {
                ctx.status = ContextStatus::Terminated;
                ctx.updated_at = now;
                track(&mut traces, ctx);
                dropped.push(ctx.clone());
            }
        }
        Ok(ProducedContexts { kept, dropped })
    }

    fn find_by_stream_id(&self, stream_id: &str) -> Result<Vec<FlowContext>> {
        let contexts = self.lock(&self.contexts)?;
        Ok(contexts.values().filter(|c| c.stream_id == stream_id).cloned().collect())
    }

    fn find_running_context_by_meta_id(&self, meta_id: &str) -> Result<Vec<FlowContext>> {
        let prefix = format!("{meta_id}-");
        let contexts = self.lock(&self.contexts)?;
        Ok(contexts.values()
                   .filter(|c| c.status == ContextStatus::Pending && c.stream_id.starts_with(&prefix))
                   .cloned()
                   .collect())
    }

    fn delete(&self, stream_id: &str) -> Result<usize> {
        let mut contexts = self.lock(&self.contexts)?;
        let mut traces = self.lock(&self.traces)?;
        let before = contexts.len();
        contexts.retain(|_, c| c.stream_id != stream_id);
        traces.retain(|_, t| t.stream_id != stream_id);
        Ok(before - contexts.len())
    }

    fn save_trace(&self, trace: &FlowTrace) -> Result<()> {
        let mut traces = self.lock(&self.traces)?;
        traces.insert(trace.id, trace.clone());
        Ok(())
    }

    fn get_trace(&self, trace_id: &Uuid) -> Result<FlowTrace> {
        let traces = self.lock(&self.traces)?;
        traces.get(trace_id)
              .cloned()
              .ok_or_else(|| FlowError::NotFound(format!("traza {trace_id}")))
    }

    fn update_to_terminated(&self, trace_ids: &[Uuid]) -> Result<Vec<Uuid>> {
        let mut contexts = self.lock(&self.contexts)?;
        let mut traces = self.lock(&self.traces)?;
        let now = Utc::now();
        let mut closed = Vec::new();
        for trace_id in trace_ids {
            let trace = traces.get_mut(trace_id)
                              .ok_or_else(|| FlowError::NotFound(format!("traza {trace_id}")))?;
            if trace.is_terminated() {
                continue;
            }
            let owned: Vec<Uuid> = contexts.values()
                                           .filter(|c| c.trace_id == *trace_id)
                                           .map(|c| c.id)
                                           .collect();
            let pending = owned.iter()
                               .filter_map(|id| contexts.get(id))
                               .any(|c| c.status == ContextStatus::Pending);
            if pending {
                continue;
            }
            let mut failed = false;
            for id in owned {
                if let Some(ctx) = contexts.get_mut(&id) {
                    match ctx.status {
                        ContextStatus::Sent => {
                            ctx.status = ContextStatus::Terminated;
                            ctx.updated_at = now;
                        }
                        ContextStatus::Error => failed = true,
                        _ => {}
                    }
                }
            }
            trace.context_pool.clear();
            trace.status = if failed { TraceStatus::Failed } else { TraceStatus::Completed };
            trace.ended_at = Some(now);
            closed.push(*trace_id);
        }
        Ok(closed)
    }

    fn is_traces_terminate(&self, trace_ids: &[Uuid]) -> Result<bool> {
        let traces = self.lock(&self.traces)?;
        for trace_id in trace_ids {
            let trace = traces.get(trace_id)
                              .ok_or_else(|| FlowError::NotFound(format!("traza {trace_id}")))?;
            if !trace.is_terminated() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn commit_step(&self, step: &StepCommit) -> Result<()> {
        let mut contexts = self.lock(&self.contexts)?;
        let mut traces = self.lock(&self.traces)?;
        for ctx in step.consumed.iter().chain(step.dropped.iter()) {
            match contexts.get(&ctx.id) {
                Some(current) if current.status == ContextStatus::Pending && current.position == ctx.position => {}
                Some(current) => {
                    return Err(FlowError::Conflict(format!("contexto {} ya está {:?} en '{}'",
                                                           ctx.id, current.status, current.position)));
                }
                None => return Err(FlowError::NotFound(format!("contexto {}", ctx.id))),
            }
        }
        let now = Utc::now();
        for (list, status) in [(&step.consumed, ContextStatus::Sent), (&step.dropped, ContextStatus::Terminated)] {
            for ctx in list {
                if let Some(current) = contexts.get_mut(&ctx.id) {
                    current.status = status;
                    current.updated_at = now;
                    track(&mut traces, current);
                }
            }
        }
        for ctx in &step.produced {
            contexts.insert(ctx.id, ctx.clone());
            track(&mut traces, ctx);
        }
        Ok(())
    }
}

struct LockCell {
    permit: Semaphore,
    held: AtomicBool,
    refs: AtomicUsize,
}

impl LockCell {
    fn new() -> Self {
        Self { permit: Semaphore::new(1),
               held: AtomicBool::new(false),
               refs: AtomicUsize::new(0) }
    }
}

/// Proveedor de locks locales.
///
/// Cada clave tiene una celda con contador de referencias; la celda se
/// elimina cuando nadie la referencia y no está tomada.
#[derive(Clone, Default)]
pub struct MemoryFlowLocks {
    cells: Arc<DashMap<String, Arc<LockCell>>>,
}

impl MemoryFlowLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claves con celda viva.
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

impl FlowLocks for MemoryFlowLocks {
    fn local_lock(&self, key: &str) -> Arc<dyn FlowLock> {
        let cell = {
            let entry = self.cells
                            .entry(key.to_string())
                            .or_insert_with(|| Arc::new(LockCell::new()));
            entry.refs.fetch_add(1, Ordering::SeqCst);
            entry.value().clone()
        };
        Arc::new(MemoryLock { key: key.to_string(),
                              cell,
                              holding: AtomicBool::new(false),
                              cells: self.cells.clone() })
    }
}

/// Handle de lock. Sólo el handle que tomó el lock puede liberarlo.
struct MemoryLock {
    key: String,
    cell: Arc<LockCell>,
    holding: AtomicBool,
    cells: Arc<DashMap<String, Arc<LockCell>>>,
}

impl MemoryLock {
    fn unavailable(&self, reason: &str) -> FlowError {
        FlowError::LockUnavailable(format!("{}: {}", self.key, reason))
    }

    fn take(&self) {
        self.cell.held.store(true, Ordering::SeqCst);
        self.holding.store(true, Ordering::SeqCst);
    }

    fn give_back(&self) -> bool {
        if self.holding
               .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
               .is_err()
        {
            return false;
        }
        self.cell.held.store(false, Ordering::SeqCst);
        self.cell.permit.add_permits(1);
        true
    }
}

#[async_trait]
impl FlowLock for MemoryLock {
    fn key(&self) -> &str {
        &self.key
    }

    async fn lock(&self) -> Result<()> {
        let permit = self.cell
                         .permit
                         .acquire()
                         .await
                         .map_err(|_| self.unavailable("semáforo cerrado"))?;
        permit.forget();
        self.take();
        Ok(())
    }

    fn try_lock(&self) -> Result<bool> {
        match self.cell.permit.try_acquire() {
            Ok(permit) => {
                permit.forget();
                self.take();
                Ok(true)
            }
            Err(TryAcquireError::NoPermits) => Ok(false),
            Err(TryAcquireError::Closed) => Err(self.unavailable("semáforo cerrado")),
        }
    }

    async fn try_lock_for(&self, timeout: Duration) -> Result<bool> {
        match tokio::time::timeout(timeout, self.lock()).await {
            Ok(res) => res.map(|_| true),
            Err(_) => Ok(false),
        }
    }

    fn unlock(&self) -> Result<()> {
        if !self.give_back() {
            return Err(self.unavailable("unlock desde un handle que no tiene el lock"));
        }
        Ok(())
    }
}

// Soltar el handle que tiene el lock lo libera.
impl Drop for MemoryLock {
    fn drop(&mut self) {
        self.give_back();
        self.cell.refs.fetch_sub(1, Ordering::SeqCst);
        self.cells.remove_if(&self.key, |_, cell| {
                      cell.refs.load(Ordering::SeqCst) == 0 && !cell.held.load(Ordering::SeqCst)
                  });
    }
}
