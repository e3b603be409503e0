// Archivo: flow.rs
// Propósito: `Flow`, el grafo ya ensamblado y en marcha. Expone la entrada
// (offer), los puntos etiquetados, la sesión por defecto, los listeners y
// la conversación sincrónica.
use crate::emitter::{ConsumeFn, ConverseLatch, Emitter, EmitterListener, ListenerId};
use crate::errors::{FlowError, Result};
use crate::node::{self, Outlet, Runtime};
use crate::registry::SessionRegistry;
use crate::session::{FlowSession, CONVERSE_KEY};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// Callback de fin de sesión: recibe la sesión y sus trazas.
pub type CompletionFn = Arc<dyn Fn(&FlowSession, &[Uuid]) + Send + Sync>;

pub(crate) struct TypedOutlet<R> {
    emitter: Arc<Emitter<R>>,
    completions: RwLock<Vec<CompletionFn>>,
}

impl<R> TypedOutlet<R> {
    pub(crate) fn new() -> Self {
        Self { emitter: Arc::new(Emitter::new()),
               completions: RwLock::new(Vec::new()) }
    }
}

impl<R> Outlet for TypedOutlet<R> where R: DeserializeOwned + Send + Sync + 'static
{
    fn deliver(&self, data: JsonValue, session: &FlowSession) -> Result<()> {
        let value: R = serde_json::from_value(data)?;
        self.emitter.emit(&value, session);
        Ok(())
    }

    fn complete(&self, session: &FlowSession, traces: &[Uuid], failed: bool) {
        if !failed {
            self.emitter.complete(session);
        }
        let callbacks = self.completions.read().unwrap_or_else(|e| e.into_inner()).clone();
        for cb in callbacks {
            cb(session, traces);
        }
    }

    fn fail(&self, error: &FlowError, session: &FlowSession) {
        self.emitter.error(error, session);
    }
}

/// Flujo en ejecución. `D` es el tipo de entrada y `R` el de salida.
///
/// Cada nodo corre en una tarea tokio; soltar el `Flow` las detiene.
pub struct Flow<D, R: 'static> {
    stream_id: String,
    runtime: Arc<Runtime>,
    outlet: Arc<TypedOutlet<R>>,
    tags: HashMap<String, String>,
    default_session: Mutex<FlowSession>,
    shutdown: broadcast::Sender<()>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    _input: PhantomData<fn(D)>,
}

impl<D, R> Flow<D, R>
    where D: Serialize,
          R: DeserializeOwned + Clone + Send + Sync + 'static
{
    pub(crate) fn launch(runtime: Arc<Runtime>, outlet: Arc<TypedOutlet<R>>, tags: HashMap<String, String>) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        let handles = runtime.nodes
                             .values()
                             .map(|n| tokio::spawn(node::run(runtime.clone(), n.clone(), shutdown.subscribe())))
                             .collect();
        debug!(stream = %runtime.stream_id, nodes = runtime.nodes.len(), "flujo en marcha");
        Self { stream_id: runtime.stream_id.clone(),
               runtime,
               outlet,
               tags,
               default_session: Mutex::new(FlowSession::new(false)),
               shutdown,
               handles: Mutex::new(handles),
               _input: PhantomData }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Ids de los nodos en orden de construcción (el último es el End).
    pub fn node_ids(&self) -> Vec<String> {
        self.runtime.nodes.keys().cloned().collect()
    }

    /// Nodo que recibe lo ofrecido por `offer`.
    pub fn start_node(&self) -> &str {
        &self.runtime.start
    }

    pub fn tag_node(&self, tag: &str) -> Option<&str> {
        self.tags.get(tag).map(String::as_str)
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.runtime.registry
    }

    pub fn emitter(&self) -> &Arc<Emitter<R>> {
        &self.outlet.emitter
    }

    /// Sesión por defecto (no acotada) usada por `offer`.
    pub fn default_session(&self) -> FlowSession {
        self.default_session.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Ofrece datos en la sesión por defecto. Devuelve el id de la traza.
    pub async fn offer(&self, items: Vec<D>) -> Result<Uuid> {
        let session = self.default_session();
        self.offer_with(items, &session).await
    }

    /// Ofrece datos en una sesión explícita. Una sesión acotada se completa
    /// tras el offer.
    #[instrument(skip_all, fields(stream = %self.stream_id, session = %session.id()))]
    pub async fn offer_with(&self, items: Vec<D>, session: &FlowSession) -> Result<Uuid> {
        let values = encode(items)?;
        let start = self.runtime.start.clone();
        let trace_id = self.runtime.inject(&start, session, values).await?;
        if session.is_bounded() {
            self.runtime.complete_session(session)?;
        }
        Ok(trace_id)
    }

    /// Reentrada en un nodo etiquetado: los datos no pasan por los nodos
    /// anteriores.
    #[instrument(skip_all, fields(stream = %self.stream_id, tag = %tag))]
    pub async fn offer_to<V: Serialize>(&self, tag: &str, items: Vec<V>, session: &FlowSession) -> Result<Uuid> {
        let position = self.tags
                           .get(tag)
                           .cloned()
                           .ok_or_else(|| FlowError::NotFound(format!("tag '{tag}'")))?;
        let values = encode(items)?;
        self.runtime.inject(&position, session, values).await
    }

    /// Conecta un emitter externo con un nodo etiquetado: cada dato emitido
    /// entra en esa posición dentro de `session` y el fin del emitter
    /// completa la sesión. Devuelve el id del listener registrado en
    /// `source`.
    #[instrument(skip_all, fields(stream = %self.stream_id, tag = %tag, session = %session.id()))]
    pub fn offer_from<V>(&self, tag: &str, source: &Arc<Emitter<V>>, session: &FlowSession) -> Result<ListenerId>
        where V: Serialize + Send + Sync + 'static
    {
        let position = self.tags
                           .get(tag)
                           .cloned()
                           .ok_or_else(|| FlowError::NotFound(format!("tag '{tag}'")))?;
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(forward(self.runtime.clone(),
                                          position,
                                          session.clone(),
                                          rx,
                                          self.shutdown.subscribe()));
        self.handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
        Ok(source.register(Arc::new(FeedListener { tx })))
    }

    /// Indica que la sesión no recibirá más datos. Completar dos veces es
    /// un `WindowViolation`.
    pub fn complete_session(&self, session: &FlowSession) -> Result<()> {
        self.runtime.complete_session(session)
    }

    /// Libera la sesión y su estado. Lo que siga en vuelo se descarta en
    /// cada nodo al encontrarla liberada.
    pub fn release(&self, session: &FlowSession) {
        self.runtime.registry.release(&session.id());
    }

    /// Completa la sesión por defecto y abre una nueva.
    pub fn complete(&self) -> Result<()> {
        let previous = {
            let mut current = self.default_session.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *current, FlowSession::new(false))
        };
        self.runtime.complete_session(&previous)
    }

    /// Conversación sincrónica: ofrece datos y devuelve un latch que se
    /// resuelve al terminar la sesión.
    pub fn converse(&self) -> Converse<'_, D, R> {
        Converse { flow: self,
                   session: None,
                   on_consume: None }
    }

    pub fn register(&self, listener: Arc<dyn EmitterListener<R>>) -> ListenerId {
        self.outlet.emitter.register(listener)
    }

    pub fn unregister(&self, id: ListenerId) -> bool {
        self.outlet.emitter.unregister(id)
    }

    /// Callback al completarse cualquier sesión, fallida o no.
    pub fn on_complete(&self, f: impl Fn(&FlowSession, &[Uuid]) + Send + Sync + 'static) {
        self.outlet
            .completions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::new(f));
    }

    /// Detiene las tareas de nodo y espera a que terminen.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(());
        let handles = std::mem::take(&mut *self.handles.lock().unwrap_or_else(|e| e.into_inner()));
        for handle in handles {
            let _ = handle.await;
        }
    }
}

impl<D, R: 'static> Drop for Flow<D, R> {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
    }
}

enum Feed {
    Data(JsonValue),
    Complete,
    Error(FlowError),
}

// Listener sobre un emitter externo; el orden de emisión se conserva en el
// canal.
struct FeedListener {
    tx: mpsc::UnboundedSender<Feed>,
}

impl<V: Serialize> EmitterListener<V> for FeedListener {
    fn handle(&self, data: &V, _session: &FlowSession) {
        let feed = match serde_json::to_value(data) {
            Ok(value) => Feed::Data(value),
            Err(e) => Feed::Error(e.into()),
        };
        let _ = self.tx.send(feed);
    }

    fn on_complete(&self, _session: &FlowSession) {
        let _ = self.tx.send(Feed::Complete);
    }

    fn on_error(&self, error: &FlowError, _session: &FlowSession) {
        let _ = self.tx.send(Feed::Error(error.clone()));
    }
}

// Vuelca en `position` lo recibido del emitter externo, agrupando en un
// mismo offer lo que ya esté en el canal.
async fn forward(rt: Arc<Runtime>,
                 position: String,
                 session: FlowSession,
                 mut rx: mpsc::UnboundedReceiver<Feed>,
                 mut shutdown: broadcast::Receiver<()>) {
    loop {
        let first = tokio::select! {
            _ = shutdown.recv() => break,
            feed = rx.recv() => match feed {
                Some(feed) => feed,
                None => break,
            },
        };
        let mut batch = Vec::new();
        let mut tail = None;
        match first {
            Feed::Data(value) => batch.push(value),
            other => tail = Some(other),
        }
        while tail.is_none() {
            match rx.try_recv() {
                Ok(Feed::Data(value)) => batch.push(value),
                Ok(other) => tail = Some(other),
                Err(_) => break,
            }
        }
        if !batch.is_empty() {
            if let Err(e) = rt.inject(&position, &session, batch).await {
                warn!(session = %session.id(), position = %position, error = %e, "no se pudo volcar lo emitido");
                rt.registry.register(&session);
                rt.escalate(&session, e);
                break;
            }
        }
        match tail {
            Some(Feed::Complete) => {
                if let Err(e) = rt.complete_session(&session) {
                    debug!(session = %session.id(), error = %e, "la sesión ya estaba completada");
                }
                break;
            }
            Some(Feed::Error(e)) => {
                rt.registry.register(&session);
                rt.escalate(&session, e);
                break;
            }
            _ => {}
        }
    }
}

fn encode<V: Serialize>(items: Vec<V>) -> Result<Vec<JsonValue>> {
    items.iter()
         .map(|item| serde_json::to_value(item).map_err(FlowError::from))
         .collect()
}

/// Constructor de una conversación.
pub struct Converse<'a, D, R: 'static> {
    flow: &'a Flow<D, R>,
    session: Option<FlowSession>,
    on_consume: Option<ConsumeFn<R>>,
}

impl<'a, D, R> Converse<'a, D, R>
    where D: Serialize,
          R: DeserializeOwned + Clone + Send + Sync + 'static
{
    /// Usa una sesión propia en lugar de una nueva acotada.
    pub fn with_session(mut self, session: FlowSession) -> Self {
        self.session = Some(session);
        self
    }

    /// Callback por cada resultado de la conversación, antes de acumularlo.
    pub fn do_on_consume(mut self, f: impl Fn(&R) + Send + Sync + 'static) -> Self {
        self.on_consume = Some(Arc::new(f));
        self
    }

    pub async fn offer(self, items: Vec<D>) -> Result<ConverseLatch<R>> {
        let session = self.session.unwrap_or_else(|| FlowSession::new(true));
        let latch = ConverseLatch::attach(self.flow.outlet.emitter.clone(), session.id(), self.on_consume);
        session.set_inner_state(CONVERSE_KEY, JsonValue::from(latch.listener_id()));
        self.flow.offer_with(items, &session).await?;
        Ok(latch)
    }
}
