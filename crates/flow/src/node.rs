// Archivo: node.rs
// Propósito: ejecución de nodos.
//
// Cada nodo corre en su propia tarea y repite el ciclo
// lock → tomar pendientes → aplicar operador → avanzar → evaluar ventanas.
// El avance (guardar salidas y marcar entradas `Sent`) es el último paso del
// ciclo, así que un fallo del almacén o del lock antes de ese punto permite
// repetir el ciclo entero.
use crate::config::EngineConfig;
use crate::domain::{ContextStatus, FlowContext, FlowTrace};
use crate::errors::{FlowError, Result};
use crate::locks::{FlowLockGuard, FlowLocks, PROCESS};
use crate::operators::{ErrorAction, ErrorHandler, InitFn, ItemOutcome, Join, Operator, ReduceFn, ValidatorFn};
use crate::registry::{Accumulator, JoinPane, SessionRegistry};
use crate::repository::{ContextFilter, FlowContextRepository, StepCommit};
use crate::session::{FlowSession, StateContext};
use crate::window::{Window, WindowArg, WindowCondition};
use futures::stream::{self, StreamExt};
use indexmap::IndexMap;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, Notify, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Id del nodo End de todo flujo.
pub const END: &str = "end";

/// Configuración de un nodo.
#[derive(Clone)]
pub struct NodeConfig {
    /// Items del lote procesados en paralelo.
    pub concurrency: usize,
    /// Contextos tomados por ciclo; `None` equivale a `concurrency`.
    pub batch_size: Option<usize>,
    /// Contextos pendientes admitidos antes de frenar a los productores.
    pub backlog: usize,
    pub max_retries: u32,
    pub retry_backoff: Duration,
    /// Condición de panel para Reduce/Produce.
    pub window: WindowCondition,
    pub error_handler: Option<ErrorHandler>,
}

impl NodeConfig {
    pub fn from_engine(cfg: &EngineConfig) -> Self {
        Self { concurrency: cfg.default_concurrency.max(1),
               batch_size: cfg.default_batch_size,
               backlog: cfg.default_backlog.max(1),
               max_retries: cfg.max_retries,
               retry_backoff: cfg.retry_backoff(),
               window: WindowCondition::session_complete(),
               error_handler: None }
    }

    pub fn batch(&self) -> usize {
        self.batch_size.unwrap_or(self.concurrency).max(1)
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self::from_engine(&EngineConfig::default())
    }
}

impl fmt::Debug for NodeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeConfig")
         .field("concurrency", &self.concurrency)
         .field("batch_size", &self.batch())
         .field("backlog", &self.backlog)
         .field("max_retries", &self.max_retries)
         .field("retry_backoff", &self.retry_backoff)
         .field("error_handler", &self.error_handler.is_some())
         .finish()
    }
}

pub(crate) enum Stage {
    Op(Operator),
    /// Copia cada item a todas las ramas con un `parallel_id` nuevo.
    Fork,
    /// Reúne las ramas de cada bifurcación.
    Join(Join),
    End,
}

/// Permisos de contextos pendientes de un nodo. Quien produce hacia el nodo
/// reserva antes de guardar; el nodo devuelve al consumir.
pub(crate) struct Backlog {
    permits: Semaphore,
    capacity: usize,
    held: AtomicUsize,
}

impl Backlog {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self { permits: Semaphore::new(capacity),
               capacity,
               held: AtomicUsize::new(0) }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    /// Reserva hasta `n` permisos (como mucho la capacidad). Devuelve los
    /// reservados.
    pub(crate) async fn reserve(&self, n: usize) -> Result<usize> {
        let take = n.min(self.capacity);
        if take == 0 {
            return Ok(0);
        }
        let permit = self.permits
                         .acquire_many(take as u32)
                         .await
                         .map_err(|_| FlowError::Other("backlog cerrado".into()))?;
        permit.forget();
        self.held.fetch_add(take, Ordering::SeqCst);
        Ok(take)
    }

    pub(crate) fn release(&self, n: usize) {
        if n == 0 {
            return;
        }
        if let Ok(prev) = self.held
                              .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |held| Some(held - n.min(held)))
        {
            let give = n.min(prev);
            if give > 0 {
                self.permits.add_permits(give);
            }
        }
    }
}

/// Salida del flujo: entrega al emitter tipado.
pub(crate) trait Outlet: Send + Sync {
    fn deliver(&self, data: JsonValue, session: &FlowSession) -> Result<()>;
    fn complete(&self, session: &FlowSession, traces: &[Uuid], failed: bool);
    fn fail(&self, error: &FlowError, session: &FlowSession);
}

pub(crate) struct Node {
    pub(crate) id: String,
    pub(crate) stage: Stage,
    pub(crate) config: NodeConfig,
    pub(crate) next: Vec<String>,
    pub(crate) upstreams: usize,
    pub(crate) backlog: Backlog,
    pub(crate) notify: Notify,
}

impl Node {
    pub(crate) fn new(id: String, stage: Stage, config: NodeConfig, next: Vec<String>, upstreams: usize) -> Self {
        let backlog = Backlog::new(config.backlog);
        Self { id,
               stage,
               config,
               next,
               upstreams,
               backlog,
               notify: Notify::new() }
    }

    fn single_next(&self) -> Result<&str> {
        self.next
            .first()
            .map(String::as_str)
            .ok_or_else(|| FlowError::NotFound(format!("nodo siguiente de '{}'", self.id)))
    }
}

struct Reservation {
    node: Arc<Node>,
    window: Arc<Window>,
    count: u64,
    permits: usize,
}

/// Estado compartido por las tareas de nodo de un flujo.
pub(crate) struct Runtime {
    pub(crate) stream_id: String,
    pub(crate) repo: Arc<dyn FlowContextRepository>,
    pub(crate) locks: Arc<dyn FlowLocks>,
    pub(crate) registry: Arc<SessionRegistry>,
    pub(crate) outlet: Arc<dyn Outlet>,
    pub(crate) nodes: IndexMap<String, Arc<Node>>,
    pub(crate) start: String,
}

impl Runtime {
    pub(crate) fn node(&self, id: &str) -> Result<&Arc<Node>> {
        self.nodes
            .get(id)
            .ok_or_else(|| FlowError::NotFound(format!("nodo '{id}'")))
    }

    pub(crate) fn window_at(&self, session_id: &Uuid, node_id: &str) -> Result<Arc<Window>> {
        let node = self.node(node_id)?;
        self.registry.node_window(session_id, node_id, node.upstreams)
    }

    /// Marca la sesión como fallida y avisa a los listeners una sola vez.
    pub(crate) fn escalate(&self, session: &FlowSession, error: FlowError) {
        if self.registry.mark_failed(&session.id(), error.clone()) {
            error!(session = %session.id(), error = %error, "error escalado a los listeners");
            self.outlet.fail(&error, session);
        }
    }

    /// Introduce datos en `position` para la sesión. Reserva backlog por
    /// tramos, así que espera si el nodo de entrada va atrasado.
    pub(crate) async fn inject(&self, position: &str, session: &FlowSession, values: Vec<JsonValue>) -> Result<Uuid> {
        let start = session.window();
        if start.is_fulfilled() {
            return Err(FlowError::WindowViolation(format!("sesión {} ya completada", session.id())));
        }
        let node = self.node(position)?.clone();
        self.registry.register(session);
        let trace = FlowTrace::new(&self.stream_id, session.id());
        self.repo.save_trace(&trace)?;
        self.registry.add_trace(&session.id(), trace.id)?;

        let mut values = values.into_iter();
        loop {
            let chunk: Vec<JsonValue> = values.by_ref().take(node.backlog.capacity()).collect();
            if chunk.is_empty() {
                break;
            }
            let n = chunk.len() as u64;
            let first = start.accept(n)?;
            let permits = match node.backlog.reserve(chunk.len()).await {
                Ok(p) => p,
                Err(e) => {
                    start.retract(n);
                    return Err(e);
                }
            };
            let saved = self.save_chunk(position, session, trace.id, first, chunk);
            if let Err(e) = saved {
                start.retract(n);
                node.backlog.release(permits);
                return Err(e);
            }
            start.consume(n);
            node.notify.notify_one();
        }
        debug!(session = %session.id(), trace = %trace.id, position, "datos ofrecidos");
        self.try_close_start(session)?;
        Ok(trace.id)
    }

    fn save_chunk(&self,
                  position: &str,
                  session: &FlowSession,
                  trace_id: Uuid,
                  first: u64,
                  chunk: Vec<JsonValue>)
                  -> Result<()> {
        let n = chunk.len() as u64;
        let window = self.window_at(&session.id(), position)?;
        window.accept(n)?;
        let batch_id = Uuid::new_v4();
        let contexts: Vec<FlowContext> =
            chunk.into_iter()
                 .enumerate()
                 .map(|(i, data)| {
                     FlowContext::new(&self.stream_id, position, trace_id, session.id(), batch_id, first + i as u64, data)
                 })
                 .collect();
        if let Err(e) = self.repo.save(&contexts) {
            window.retract(n);
            return Err(e);
        }
        Ok(())
    }

    /// Señala que la sesión no recibirá más datos.
    pub(crate) fn complete_session(&self, session: &FlowSession) -> Result<()> {
        let start = session.window();
        if start.is_fulfilled() {
            return Err(FlowError::WindowViolation(format!("sesión {} ya completada", session.id())));
        }
        self.registry.register(session);
        start.complete_upstream();
        self.try_close_start(session)
    }

    // Dispara la ventana de inicio si la sesión terminó y no queda nada por
    // entregar al primer nodo.
    fn try_close_start(&self, session: &FlowSession) -> Result<()> {
        let start = session.window();
        if start.is_fulfilled() || !start.evaluate()? {
            return Ok(());
        }
        if start.fire().is_ok() {
            self.window_at(&session.id(), &self.start)?.complete_upstream();
            self.node(&self.start)?.notify.notify_one();
        }
        Ok(())
    }

    async fn reserve(&self, session_id: &Uuid, produced: &[FlowContext]) -> Result<Vec<Reservation>> {
        let mut counts: IndexMap<&str, u64> = IndexMap::new();
        for ctx in produced {
            *counts.entry(ctx.position.as_str()).or_insert(0) += 1;
        }
        let mut reserved = Vec::with_capacity(counts.len());
        for (position, count) in counts {
            match self.reserve_one(session_id, position, count).await {
                Ok(r) => reserved.push(r),
                Err(e) => {
                    self.rollback(reserved);
                    return Err(e);
                }
            }
        }
        Ok(reserved)
    }

    async fn reserve_one(&self, session_id: &Uuid, position: &str, count: u64) -> Result<Reservation> {
        let node = self.node(position)?.clone();
        let window = self.window_at(session_id, position)?;
        let permits = node.backlog.reserve(count as usize).await?;
        if let Err(e) = window.accept(count) {
            node.backlog.release(permits);
            return Err(e);
        }
        Ok(Reservation { node,
                         window,
                         count,
                         permits })
    }

    fn rollback(&self, reserved: Vec<Reservation>) {
        for r in reserved {
            r.window.retract(r.count);
            r.node.backlog.release(r.permits);
        }
    }

    fn dispatch(&self, reserved: Vec<Reservation>) {
        for r in reserved {
            r.node.notify.notify_one();
        }
    }

    /// Persiste un avance: reserva aguas abajo, confirma en el almacén y
    /// sólo entonces descuenta la ventana y el backlog propios.
    async fn advance(&self, node: &Node, window: &Window, session_id: &Uuid, step: StepCommit) -> Result<()> {
        if step.is_empty() {
            return Ok(());
        }
        if !self.registry.contains(session_id) {
            return self.discard(node, session_id, step);
        }
        let reserved = match self.reserve(session_id, &step.produced).await {
            Ok(reserved) => reserved,
            Err(FlowError::NotFound(_)) if !self.registry.contains(session_id) => {
                return self.discard(node, session_id, step);
            }
            Err(e) => return Err(e),
        };
        if let Err(e) = self.repo.commit_step(&step) {
            self.rollback(reserved);
            return Err(e);
        }
        self.dispatch(reserved);
        if !matches!(node.stage, Stage::Join(_))
           && step.consumed.iter().chain(&step.dropped).any(|c| c.parallel_id.is_some())
        {
            self.wake_joins();
        }
        let settled = step.consumed.len() + step.dropped.len();
        window.consume(settled as u64);
        node.backlog.release(settled);
        debug!(node = %node.id,
               session = %session_id,
               consumed = step.consumed.len(),
               dropped = step.dropped.len(),
               produced = step.produced.len(),
               "avance confirmado");
        Ok(())
    }

    /// Cierra el avance de una sesión liberada: lo tomado queda `Terminated`,
    /// lo producido no se guarda y el backlog propio se devuelve.
    fn discard(&self, node: &Node, session_id: &Uuid, step: StepCommit) -> Result<()> {
        let mut dropped = step.consumed;
        dropped.extend(step.dropped);
        let n = dropped.len();
        if n > 0 {
            self.repo.commit_step(&StepCommit { dropped,
                                                ..Default::default() })?;
        }
        node.backlog.release(n);
        debug!(node = %node.id,
               session = %session_id,
               count = n,
               lost = step.produced.len(),
               "sesión liberada: resultados descartados");
        Ok(())
    }

    fn settle_error(&self, node: &Node, window: &Window, ctx: &FlowContext) -> Result<()> {
        self.repo
            .update_status(std::slice::from_ref(ctx), ContextStatus::Error, &node.id)?;
        window.consume(1);
        node.backlog.release(1);
        if ctx.parallel_id.is_some() {
            self.wake_joins();
        }
        Ok(())
    }

    // Una rama que termina sin producir no llega al join: se le avisa para
    // que revise sus bifurcaciones abiertas.
    fn wake_joins(&self) {
        for node in self.nodes.values().filter(|n| matches!(n.stage, Stage::Join(_))) {
            node.notify.notify_one();
        }
    }
}

/// Bucle de la tarea de un nodo: espera avisos y drena hasta quedarse sin
/// trabajo.
pub(crate) async fn run(rt: Arc<Runtime>, node: Arc<Node>, mut shutdown: broadcast::Receiver<()>) {
    debug!(node = %node.id, "nodo en marcha");
    let mut releases = rt.registry.releases();
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = node.notify.notified() => drain(&rt, &node).await,
            changed = releases.changed() => {
                if changed.is_err() {
                    break;
                }
                drain(&rt, &node).await
            }
        }
    }
    debug!(node = %node.id, "nodo detenido");
}

async fn drain(rt: &Runtime, node: &Arc<Node>) {
    loop {
        match cycle(rt, node).await {
            Ok(true) => continue,
            Ok(false) => break,
            Err(e) if e.is_transient() => {
                warn!(node = %node.id, error = %e, "ciclo abortado, se repite");
                tokio::time::sleep(node.config.retry_backoff).await;
            }
            // Lo tomado sigue `Pending`: se vuelve a intentar tras la espera.
            Err(e) => {
                error!(node = %node.id, error = %e, "ciclo fallido, se reprograma");
                tokio::time::sleep(node.config.retry_backoff).await;
                node.notify.notify_one();
                break;
            }
        }
    }
}

/// Un ciclo completo bajo el lock del nodo. Devuelve `false` si no había
/// nada que tomar.
pub(crate) async fn cycle(rt: &Runtime, node: &Arc<Node>) -> Result<bool> {
    let key = rt.locks.lock_key(&rt.stream_id, &node.id, PROCESS);
    let _guard = FlowLockGuard::acquire(rt.locks.distributed_lock(&key)).await?;

    let positions = [node.id.clone()];
    let limit = node.config.batch();
    let (pulled, dropped) = match &node.stage {
        Stage::Op(Operator::Filter(whether)) => {
            let whether = whether.clone();
            let filter: ContextFilter = Arc::new(move |ctx: &FlowContext| whether(&ctx.data));
            let batch = rt.repo
                          .request_producing_context(&rt.stream_id, &positions, &filter, limit)?;
            (batch.kept, batch.dropped)
        }
        _ => {
            let pulled = rt.repo
                           .request_mapping_context(&rt.stream_id, &positions, &HashMap::new(), limit)?;
            (pulled, Vec::new())
        }
    };

    // El almacén ya dejó `Terminated` lo rechazado por el filtro.
    for ctx in &dropped {
        if let Ok(window) = rt.window_at(&ctx.session_id, &node.id) {
            window.consume(1);
        }
        node.backlog.release(1);
    }
    if dropped.iter().any(|c| c.parallel_id.is_some()) {
        rt.wake_joins();
    }

    if pulled.is_empty() && dropped.is_empty() {
        settle_windows(rt, node).await?;
        return Ok(false);
    }

    let mut groups: IndexMap<Uuid, Vec<FlowContext>> = IndexMap::new();
    for ctx in pulled {
        groups.entry(ctx.session_id).or_default().push(ctx);
    }
    let mut retried = 0;
    for (session_id, contexts) in groups {
        match run_group(rt, node, session_id, contexts).await {
            Ok(n) => retried += n,
            // Lo que quedó `Pending` se descarta en el próximo ciclo.
            Err(e) if !rt.registry.contains(&session_id) => {
                debug!(node = %node.id, session = %session_id, error = %e, "sesión liberada durante el ciclo");
            }
            Err(e) => return Err(e),
        }
    }
    settle_windows(rt, node).await?;
    if retried > 0 {
        tokio::time::sleep(node.config.retry_backoff).await;
    }
    Ok(true)
}

async fn run_group(rt: &Runtime, node: &Arc<Node>, session_id: Uuid, contexts: Vec<FlowContext>) -> Result<usize> {
    let Some(session) = rt.registry.session(&session_id) else {
        rt.discard(node, &session_id, StepCommit { dropped: contexts,
                                                   ..Default::default() })?;
        return Ok(0);
    };
    let window = rt.window_at(&session_id, &node.id)?;
    match &node.stage {
        Stage::End => {
            deliver_end(rt, node, &session, &window, contexts)?;
            Ok(0)
        }
        Stage::Fork => fork_items(rt, node, &session, &window, contexts).await,
        Stage::Join(_) => park_joined(rt, node, &session, &window, contexts).await,
        Stage::Op(Operator::Validator(f)) => apply_validator(rt, node, f, &session, &window, contexts).await,
        Stage::Op(op) if op.is_accumulator() => accumulate(rt, node, op, &session, &window, contexts).await,
        Stage::Op(op) => apply_items(rt, node, op, &session, &window, contexts).await,
    }
}

async fn apply_items(rt: &Runtime,
                     node: &Node,
                     op: &Operator,
                     session: &FlowSession,
                     window: &Window,
                     contexts: Vec<FlowContext>)
                     -> Result<usize> {
    let state = StateContext::new(session.clone());
    let results: Vec<(FlowContext, Result<ItemOutcome>)> =
        stream::iter(contexts.into_iter().map(|ctx| {
                                             let op = op.clone();
                                             let state = state.clone();
                                             let node_id = node.id.clone();
                                             async move {
                                                 let data = ctx.data.clone();
                                                 let res = match tokio::task::spawn_blocking(move || {
                                                                     op.apply_item(data, &state)
                                                                 }).await
                                                 {
                                                     Ok(Ok(out)) => Ok(out),
                                                     Ok(Err(e)) => Err(FlowError::operator(&node_id, e)),
                                                     Err(e) => Err(FlowError::OperatorFailure { node: node_id,
                                                                                                message: format!("tarea abortada: {e}") }),
                                                 };
                                                 (ctx, res)
                                             }
                                         }))
        .buffered(node.config.concurrency.max(1))
        .collect()
        .await;

    let flat_map = matches!(op, Operator::FlatMap(_));
    let cycle_batch = Uuid::new_v4();
    let mut step = StepCommit::default();
    let mut failures = Vec::new();
    for (ctx, res) in results {
        match res {
            Ok(ItemOutcome::One(data)) => {
                step.produced
                    .push(ctx.derive(node.single_next()?, cycle_batch, ctx.index, data));
                step.consumed.push(ctx);
            }
            Ok(ItemOutcome::Routed(target, data)) => {
                step.produced.push(ctx.derive(&target, cycle_batch, ctx.index, data));
                step.consumed.push(ctx);
            }
            Ok(ItemOutcome::Many(items)) => {
                let next = node.single_next()?;
                let batch_id = Uuid::new_v4();
                let n = items.len() as u64;
                let (first, parallel_id) = if flat_map {
                    let source = rt.registry.flat_map_source(session, &node.id)?;
                    (source.record(ctx.id, n)?, ctx.parallel_id.or(Some(source.session().id())))
                } else {
                    (window.allocate(n), ctx.parallel_id)
                };
                for (i, data) in items.into_iter().enumerate() {
                    let mut out = ctx.derive(next, batch_id, first + i as u64, data);
                    out.parallel_id = parallel_id;
                    step.produced.push(out);
                }
                step.consumed.push(ctx);
            }
            Ok(ItemOutcome::Dropped) => step.dropped.push(ctx),
            Err(e) => failures.push((ctx, e)),
        }
    }
    rt.advance(node, window, &session.id(), step).await?;
    handle_failures(rt, node, session, window, failures)
}

async fn apply_validator(rt: &Runtime,
                         node: &Node,
                         f: &ValidatorFn,
                         session: &FlowSession,
                         window: &Window,
                         contexts: Vec<FlowContext>)
                         -> Result<usize> {
    let data: Vec<JsonValue> = contexts.iter().map(|c| c.data.clone()).collect();
    let f = f.clone();
    let verdict = match tokio::task::spawn_blocking(move || f(&data)).await {
        Ok(Ok(mask)) if mask.len() == contexts.len() => Ok(mask),
        Ok(Ok(mask)) => Err(FlowError::OperatorFailure { node: node.id.clone(),
                                                         message: format!("el validador devolvió {} veredictos para {} items",
                                                                          mask.len(),
                                                                          contexts.len()) }),
        Ok(Err(e)) => Err(FlowError::operator(&node.id, e)),
        Err(e) => Err(FlowError::OperatorFailure { node: node.id.clone(),
                                                   message: format!("tarea abortada: {e}") }),
    };
    let mask = match verdict {
        Ok(mask) => mask,
        Err(e) => {
            let failures = contexts.into_iter().map(|ctx| (ctx, e.clone())).collect();
            return handle_failures(rt, node, session, window, failures);
        }
    };
    let next = node.single_next()?;
    let batch_id = Uuid::new_v4();
    let mut step = StepCommit::default();
    for (ctx, keep) in contexts.into_iter().zip(mask) {
        if keep {
            let data = ctx.data.clone();
            step.produced.push(ctx.derive(next, batch_id, ctx.index, data));
            step.consumed.push(ctx);
        } else {
            step.dropped.push(ctx);
        }
    }
    rt.advance(node, window, &session.id(), step).await?;
    Ok(0)
}

async fn fork_items(rt: &Runtime,
                    node: &Node,
                    session: &FlowSession,
                    window: &Window,
                    contexts: Vec<FlowContext>)
                    -> Result<usize> {
    let batch_id = Uuid::new_v4();
    let mut step = StepCommit::default();
    for ctx in contexts {
        let parallel_id = Uuid::new_v4();
        rt.registry
          .record_fork(&session.id(), parallel_id, ctx.parallel_id)?;
        for branch in &node.next {
            let mut out = ctx.derive(branch, batch_id, ctx.index, ctx.data.clone());
            out.parallel_id = Some(parallel_id);
            step.produced.push(out);
        }
        step.consumed.push(ctx);
    }
    rt.advance(node, window, &session.id(), step).await?;
    Ok(0)
}

// El join consume en cuanto recibe y guarda el dato en el panel de su
// bifurcación; la salida se decide en `flush_joins`.
async fn park_joined(rt: &Runtime,
                     node: &Node,
                     session: &FlowSession,
                     window: &Window,
                     contexts: Vec<FlowContext>)
                     -> Result<usize> {
    let parked: Vec<(Uuid, Uuid, u64, JsonValue)> =
        contexts.iter()
                .map(|c| (c.parallel_id.unwrap_or(c.id), c.trace_id, c.index, c.data.clone()))
                .collect();
    rt.advance(node, window, &session.id(), StepCommit { consumed: contexts,
                                                         ..Default::default() })
      .await?;
    for (parallel_id, trace_id, index, data) in parked {
        let pane = rt.registry
                     .join_pane(&session.id(), &node.id, parallel_id, trace_id, index)?;
        lock_pane(&pane).values.push(data);
    }
    Ok(0)
}

fn lock_pane(pane: &Mutex<JoinPane>) -> MutexGuard<'_, JoinPane> {
    pane.lock().unwrap_or_else(|e| e.into_inner())
}

/// Resuelve los paneles del join. Una bifurcación está lista cuando ningún
/// contexto con su `parallel_id` sigue `Pending`.
async fn flush_joins(rt: &Runtime, node: &Node, join: &Join, session: &FlowSession, window: &Window) -> Result<()> {
    let session_id = session.id();
    for (parallel_id, pane) in rt.registry.join_panes(&session_id, &node.id) {
        let ready = !rt.repo
                       .get_contexts_by_parallel(&parallel_id)?
                       .iter()
                       .any(|c| c.status == ContextStatus::Pending);
        let (values, trace_id, index, emitted) = {
            let p = lock_pane(&pane);
            (p.values.clone(), p.trace_id, p.index, p.emitted)
        };
        let output = match join {
            Join::Any if emitted => None,
            Join::Any => values.into_iter().next(),
            Join::All { .. } if !ready => continue,
            Join::All { .. } if values.is_empty() => None,
            Join::All { init, reducer } => match fold_join(node, init, reducer, values).await {
                Ok(value) => Some(value),
                Err(e) => {
                    pane_failure(rt, node, session, e);
                    None
                }
            },
        };
        if let Some(data) = output {
            let mut out = FlowContext::new(&rt.stream_id,
                                           node.single_next()?,
                                           trace_id,
                                           session_id,
                                           Uuid::new_v4(),
                                           index,
                                           data);
            out.parallel_id = rt.registry.fork_parent(&session_id, &parallel_id);
            rt.advance(node, window, &session_id, StepCommit { produced: vec![out],
                                                               ..Default::default() })
              .await?;
            lock_pane(&pane).emitted = true;
            debug!(node = %node.id, session = %session_id, parallel = %parallel_id, "join emitido");
        }
        if ready {
            rt.registry.finish_join(&session_id, &node.id, &parallel_id);
        }
    }
    Ok(())
}

async fn fold_join(node: &Node, init: &InitFn, reducer: &ReduceFn, values: Vec<JsonValue>) -> Result<JsonValue> {
    let (init, reducer) = (init.clone(), reducer.clone());
    let folded = tokio::task::spawn_blocking(move || -> anyhow::Result<JsonValue> {
                     let mut acc = init()?;
                     for value in values {
                         acc = reducer(acc, value)?;
                     }
                     Ok(acc)
                 }).await;
    match folded {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(FlowError::operator(&node.id, e)),
        Err(e) => Err(FlowError::OperatorFailure { node: node.id.clone(),
                                                   message: format!("tarea abortada: {e}") }),
    }
}

fn lock_acc(acc: &Mutex<Accumulator>) -> MutexGuard<'_, Accumulator> {
    acc.lock().unwrap_or_else(|e| e.into_inner())
}

// Pliega los items en orden. Un item que falla no altera el acumulado.
fn fold<F>(seed: JsonValue, items: Vec<JsonValue>, f: F) -> (JsonValue, Vec<Option<String>>)
    where F: Fn(JsonValue, JsonValue) -> anyhow::Result<JsonValue>
{
    let mut acc = seed;
    let mut errors = Vec::with_capacity(items.len());
    for item in items {
        match f(acc.clone(), item) {
            Ok(next) => {
                acc = next;
                errors.push(None);
            }
            Err(e) => errors.push(Some(format!("{e:#}"))),
        }
    }
    (acc, errors)
}

type Folded = (Option<JsonValue>, Vec<Option<String>>);

// Semilla del panel. Si `init` falla, todos los items del lote fallan con
// ese error.
fn seeded(seed: Option<JsonValue>, init: &InitFn, total: usize) -> std::result::Result<JsonValue, Folded> {
    match seed {
        Some(seed) => Ok(seed),
        None => init().map_err(|e| (None, vec![Some(format!("valor inicial: {e:#}")); total])),
    }
}

async fn accumulate(rt: &Runtime,
                    node: &Node,
                    op: &Operator,
                    session: &FlowSession,
                    window: &Window,
                    contexts: Vec<FlowContext>)
                    -> Result<usize> {
    let acc = rt.registry
                .accumulator(&session.id(), &node.id, &node.config.window)?;
    let seed = lock_acc(&acc).value.clone();
    let state = StateContext::new(session.clone());
    let items: Vec<JsonValue> = contexts.iter().map(|c| c.data.clone()).collect();
    let total = items.len();

    let folded = match op {
        Operator::Reduce { init, reducer } => {
            let (init, reducer) = (init.clone(), reducer.clone());
            tokio::task::spawn_blocking(move || {
                let seed = match seeded(seed, &init, total) {
                    Ok(seed) => seed,
                    Err(failed) => return failed,
                };
                let (value, errors) = fold(seed, items, |acc, item| reducer(acc, item));
                (Some(value), errors)
            }).await
        }
        Operator::ProcessReduce { init, reducer } => {
            let (init, reducer) = (init.clone(), reducer.clone());
            tokio::task::spawn_blocking(move || {
                let seed = match seeded(seed, &init, total) {
                    Ok(seed) => seed,
                    Err(failed) => return failed,
                };
                let (value, errors) = fold(seed, items, |acc, item| reducer(acc, item, &state));
                (Some(value), errors)
            }).await
        }
        _ => Ok((None, vec![None; total])),
    };
    let (value, errors) = folded.unwrap_or_else(|e| (None, vec![Some(format!("tarea abortada: {e}")); total]));

    let mut step = StepCommit::default();
    let mut failures = Vec::new();
    let mut kept = Vec::new();
    for (ctx, err) in contexts.into_iter().zip(errors) {
        match err {
            None => {
                kept.push(ctx.data.clone());
                step.consumed.push(ctx);
            }
            Some(message) => failures.push((ctx,
                                            FlowError::OperatorFailure { node: node.id.clone(),
                                                                         message })),
        }
    }
    let first_trace = step.consumed.first().map(|c| c.trace_id);
    let folded_count = kept.len() as u64;
    rt.advance(node, window, &session.id(), step).await?;
    {
        let mut pane = lock_acc(&acc);
        if matches!(op, Operator::Produce(_)) {
            pane.items.extend(kept);
        } else if folded_count > 0 {
            pane.value = value;
        }
        pane.count += folded_count;
        if pane.trace_id.is_none() {
            pane.trace_id = first_trace;
        }
    }
    handle_failures(rt, node, session, window, failures)
}

fn handle_failures(rt: &Runtime,
                   node: &Node,
                   session: &FlowSession,
                   window: &Window,
                   failures: Vec<(FlowContext, FlowError)>)
                   -> Result<usize> {
    let mut retried = 0;
    for (mut ctx, error) in failures {
        let retryable = ctx.retries < node.config.max_retries;
        let action = match &node.config.error_handler {
            Some(handler) => handler(&error, retryable, std::slice::from_ref(&ctx)),
            None if retryable => ErrorAction::Retry,
            None => ErrorAction::Escalate,
        };
        warn!(node = %node.id, context = %ctx.id, retries = ctx.retries, ?action, error = %error, "fallo de operador");
        match action {
            ErrorAction::Retry if retryable => {
                ctx.retries += 1;
                rt.repo.update(std::slice::from_ref(&ctx))?;
                retried += 1;
            }
            ErrorAction::Fail => rt.settle_error(node, window, &ctx)?,
            ErrorAction::Retry | ErrorAction::Escalate => {
                rt.settle_error(node, window, &ctx)?;
                rt.escalate(session, error);
            }
        }
    }
    Ok(retried)
}

fn deliver_end(rt: &Runtime,
               node: &Node,
               session: &FlowSession,
               window: &Window,
               contexts: Vec<FlowContext>)
               -> Result<()> {
    let step = StepCommit { dropped: contexts,
                            ..Default::default() };
    rt.repo.commit_step(&step)?;
    let n = step.dropped.len();
    window.consume(n as u64);
    node.backlog.release(n);
    // Otra tarea puede escalar un error a mitad del lote: se comprueba antes
    // de cada entrega.
    for (i, ctx) in step.dropped.into_iter().enumerate() {
        if rt.registry.is_failed(&session.id()) {
            debug!(session = %session.id(), held = n - i, "sesión fallida: resultados retenidos");
            break;
        }
        if let Err(e) = rt.outlet.deliver(ctx.data, session) {
            rt.escalate(session, e);
            break;
        }
    }
    Ok(())
}

/// Evalúa las ventanas abiertas del nodo: emite paneles cumplidos y cierra
/// las sesiones drenadas.
async fn settle_windows(rt: &Runtime, node: &Arc<Node>) -> Result<()> {
    for (session_id, window) in rt.registry.windows_for_node(&node.id) {
        if window.is_fulfilled() {
            continue;
        }
        let Some(session) = rt.registry.session(&session_id) else {
            continue;
        };
        if let Err(e) = settle_window(rt, node, &session, &window).await {
            if rt.registry.contains(&session_id) {
                return Err(e);
            }
            debug!(node = %node.id, session = %session_id, error = %e, "sesión liberada al evaluar su ventana");
        }
    }
    Ok(())
}

async fn settle_window(rt: &Runtime, node: &Arc<Node>, session: &FlowSession, window: &Window) -> Result<()> {
    let drained = window.evaluate()?;
    match &node.stage {
        Stage::Op(op) if op.is_accumulator() => flush_pane(rt, node, op, session, window, drained).await?,
        Stage::Join(join) => flush_joins(rt, node, join, session, window).await?,
        _ => {}
    }
    if drained {
        close_window(rt, node, session, window)?;
    }
    Ok(())
}

async fn flush_pane(rt: &Runtime,
                    node: &Node,
                    op: &Operator,
                    session: &FlowSession,
                    window: &Window,
                    drained: bool)
                    -> Result<()> {
    let acc = rt.registry
                .accumulator(&session.id(), &node.id, &node.config.window)?;
    let (pane, value, items, count, trace_id) = {
        let a = lock_acc(&acc);
        (a.window.clone(), a.value.clone(), a.items.clone(), a.count, a.trace_id)
    };
    let Some(trace_id) = trace_id else {
        return Ok(());
    };
    if count == 0 {
        return Ok(());
    }
    let arg = WindowArg { is_session_complete: drained,
                          data_length: count,
                          count_to_now: window.consumed(),
                          time_to_now: pane.elapsed() };
    if !drained && !pane.evaluate_with(&arg)? {
        return Ok(());
    }

    let outputs = match op {
        Operator::Produce(f) => {
            let f = f.clone();
            let produced = match tokio::task::spawn_blocking(move || f(items)).await {
                Ok(Ok(out)) => Ok(out),
                Ok(Err(e)) => Err(FlowError::operator(&node.id, e)),
                Err(e) => Err(FlowError::OperatorFailure { node: node.id.clone(),
                                                           message: format!("tarea abortada: {e}") }),
            };
            match produced {
                Ok(out) => out,
                Err(e) => {
                    pane_failure(rt, node, session, e);
                    Vec::new()
                }
            }
        }
        _ => value.into_iter().collect(),
    };

    let next = node.single_next()?;
    let first = window.allocate(outputs.len() as u64);
    let produced = outputs.into_iter()
                          .enumerate()
                          .map(|(i, data)| {
                              FlowContext::new(&rt.stream_id,
                                               next,
                                               trace_id,
                                               session.id(),
                                               pane.key(),
                                               first + i as u64,
                                               data)
                          })
                          .collect();
    rt.advance(node, window, &session.id(), StepCommit { produced,
                                                         ..Default::default() })
      .await?;
    pane.fire()?;
    rt.registry
      .reset_accumulator(&session.id(), &node.id, &node.config.window)?;
    debug!(node = %node.id, session = %session.id(), count, "panel emitido");
    Ok(())
}

// Un panel fallido ya no puede reintentarse: sus entradas están `Sent`.
fn pane_failure(rt: &Runtime, node: &Node, session: &FlowSession, error: FlowError) {
    let action = match &node.config.error_handler {
        Some(handler) => handler(&error, false, &[]),
        None => ErrorAction::Escalate,
    };
    match action {
        ErrorAction::Fail => warn!(node = %node.id, error = %error, "panel descartado"),
        ErrorAction::Retry | ErrorAction::Escalate => rt.escalate(session, error),
    }
}

fn close_window(rt: &Runtime, node: &Node, session: &FlowSession, window: &Window) -> Result<()> {
    let session_id = session.id();
    match &node.stage {
        Stage::End => {
            let traces = rt.registry.traces(&session_id);
            let closed = rt.repo.update_to_terminated(&traces)?;
            window.fire()?;
            rt.registry.drop_window(&session_id, &node.id);
            let failed = rt.registry.is_failed(&session_id);
            rt.registry.release(&session_id);
            rt.outlet.complete(session, &traces, failed);
            info!(session = %session_id, traces = traces.len(), closed = closed.len(), failed, "sesión completada");
        }
        stage => {
            if matches!(stage, Stage::Op(Operator::FlatMap(_))) {
                if let Some(source) = rt.registry.find_flat_map_source(&session_id, &node.id) {
                    source.close()?;
                }
            }
            window.fire()?;
            rt.registry.drop_window(&session_id, &node.id);
            for next in &node.next {
                rt.window_at(&session_id, next)?.complete_upstream();
                rt.node(next)?.notify.notify_one();
            }
            debug!(node = %node.id, session = %session_id, "ventana de nodo cumplida");
        }
    }
    Ok(())
}
