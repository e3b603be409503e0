// Archivo: emitter.rs
// Propósito: canal de notificación de resultados (`Emitter`) y puente
// sincrónico `ConverseLatch` para esperar a que una sesión termine.
use crate::errors::{FlowError, Result};
use crate::session::FlowSession;
use indexmap::IndexMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

pub type ListenerId = u64;

/// Consumidor de resultados de un flujo.
pub trait EmitterListener<O>: Send + Sync {
    fn handle(&self, data: &O, session: &FlowSession);

    /// La sesión terminó sin error.
    fn on_complete(&self, _session: &FlowSession) {}

    /// La sesión terminó con un error escalado; no llegarán más datos.
    fn on_error(&self, _error: &FlowError, _session: &FlowSession) {}
}

impl<O, F> EmitterListener<O> for F where F: Fn(&O, &FlowSession) + Send + Sync
{
    fn handle(&self, data: &O, session: &FlowSession) {
        self(data, session)
    }
}

/// Difusión a varios listeners.
pub struct Emitter<O> {
    listeners: RwLock<IndexMap<ListenerId, Arc<dyn EmitterListener<O>>>>,
    next_id: AtomicU64,
}

impl<O> Default for Emitter<O> {
    fn default() -> Self {
        Self { listeners: RwLock::new(IndexMap::new()),
               next_id: AtomicU64::new(1) }
    }
}

impl<O> Emitter<O> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, listener: Arc<dyn EmitterListener<O>>) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, listener);
        id
    }

    /// Devuelve `false` si el listener no estaba registrado.
    pub fn unregister(&self, id: ListenerId) -> bool {
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .shift_remove(&id)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.listeners.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Copia la lista para no retener el lock mientras corren los listeners.
    fn snapshot(&self) -> Vec<Arc<dyn EmitterListener<O>>> {
        self.listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn emit(&self, data: &O, session: &FlowSession) {
        for listener in self.snapshot() {
            listener.handle(data, session);
        }
    }

    pub fn complete(&self, session: &FlowSession) {
        for listener in self.snapshot() {
            listener.on_complete(session);
        }
    }

    pub fn error(&self, error: &FlowError, session: &FlowSession) {
        for listener in self.snapshot() {
            listener.on_error(error, session);
        }
    }
}

pub type ConsumeFn<R> = Arc<dyn Fn(&R) + Send + Sync>;

type Outcome = Option<Result<()>>;

struct LatchListener<R> {
    session_id: Uuid,
    results: Arc<Mutex<Vec<R>>>,
    done: watch::Sender<Outcome>,
    on_consume: Option<ConsumeFn<R>>,
}

impl<R> LatchListener<R> {
    fn settle(&self, outcome: Result<()>) {
        self.done.send_if_modified(|current| {
                     if current.is_some() {
                         return false;
                     }
                     *current = Some(outcome);
                     true
                 });
    }
}

impl<R: Clone + Send + Sync> EmitterListener<R> for LatchListener<R> {
    fn handle(&self, data: &R, session: &FlowSession) {
        if session.id() != self.session_id {
            return;
        }
        if let Some(f) = &self.on_consume {
            f(data);
        }
        self.results
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(data.clone());
    }

    fn on_complete(&self, session: &FlowSession) {
        if session.id() == self.session_id {
            self.settle(Ok(()));
        }
    }

    fn on_error(&self, error: &FlowError, session: &FlowSession) {
        if session.id() == self.session_id {
            self.settle(Err(error.clone()));
        }
    }
}

/// Puente sincrónico de una conversación: acumula los resultados de una
/// sesión y se resuelve cuando la sesión termina o falla.
///
/// Soltar o cancelar el latch lo desengancha del emitter sin afectar al
/// resto de listeners.
pub struct ConverseLatch<R: 'static> {
    session_id: Uuid,
    listener_id: ListenerId,
    emitter: Arc<Emitter<R>>,
    results: Arc<Mutex<Vec<R>>>,
    done: watch::Receiver<Outcome>,
}

impl<R> ConverseLatch<R> where R: Clone + Send + Sync + 'static
{
    /// Registra el latch en `emitter` para la sesión `session_id`.
    pub fn attach(emitter: Arc<Emitter<R>>, session_id: Uuid, on_consume: Option<ConsumeFn<R>>) -> Self {
        let (tx, rx) = watch::channel(None);
        let results = Arc::new(Mutex::new(Vec::new()));
        let listener = LatchListener { session_id,
                                       results: results.clone(),
                                       done: tx,
                                       on_consume };
        let listener_id = emitter.register(Arc::new(listener));
        Self { session_id,
               listener_id,
               emitter,
               results,
               done: rx }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn listener_id(&self) -> ListenerId {
        self.listener_id
    }

    /// Resultados recibidos hasta ahora.
    pub fn results(&self) -> Vec<R> {
        self.results.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    async fn wait(&mut self) -> Result<()> {
        match self.done.wait_for(|outcome| outcome.is_some()).await {
            Ok(outcome) => (*outcome).clone().unwrap_or(Ok(())),
            Err(_) => Err(FlowError::Cancelled(format!("conversación {} desenganchada", self.session_id))),
        }
    }

    fn take_results(&self) -> Vec<R> {
        std::mem::take(&mut *self.results.lock().unwrap_or_else(|e| e.into_inner()))
    }

    /// Espera el fin de la sesión y devuelve sus resultados, o el error
    /// escalado.
    pub async fn await_result(mut self) -> Result<Vec<R>> {
        self.wait().await?;
        Ok(self.take_results())
    }

    pub async fn await_timeout(mut self, timeout: Duration) -> Result<Vec<R>> {
        match tokio::time::timeout(timeout, self.wait()).await {
            Ok(outcome) => {
                outcome?;
                Ok(self.take_results())
            }
            Err(_) => Err(FlowError::Timeout(format!("conversación {} tras {:?}", self.session_id, timeout))),
        }
    }

    /// Desengancha el latch del emitter.
    pub fn cancel(self) {}
}

impl<R: 'static> Drop for ConverseLatch<R> {
    fn drop(&mut self) {
        self.emitter.unregister(self.listener_id);
    }
}
