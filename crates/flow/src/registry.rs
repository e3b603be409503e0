// Archivo: registry.rs
// Propósito: registro de sesiones del runtime de un flujo.
//
// Guarda, por id de sesión, las ventanas de cada nodo, los acumuladores, las
// sesiones siguientes y las ventanas de flat-map. Todo se crea al primer uso
// y se destruye con `release`. Se inyecta en los nodos como dependencia; una
// implementación distribuida puede sustituirlo sin tocar el bucle de nodo.
use crate::errors::{FlowError, Result};
use crate::session::FlowSession;
use crate::window::{FlatMapSourceWindow, Window, WindowCondition};
use dashmap::DashMap;
use serde_json::Value as JsonValue;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

/// Estado de un panel de acumulación (Reduce/Produce) de un nodo.
pub struct Accumulator {
    /// Ventana del panel: se dispara una vez al emitir el resultado.
    pub window: Arc<Window>,
    pub value: Option<JsonValue>,
    pub items: Vec<JsonValue>,
    pub count: u64,
    pub trace_id: Option<Uuid>,
}

impl Accumulator {
    fn new(condition: &WindowCondition) -> Self {
        Self { window: Arc::new(Window::new(condition.clone(), 1)),
               value: None,
               items: Vec::new(),
               count: 0,
               trace_id: None }
    }
}

/// Resultados de las ramas de un `parallel` recibidos por su join.
pub struct JoinPane {
    pub trace_id: Uuid,
    /// Índice del item que se bifurcó; lo hereda la salida del join.
    pub index: u64,
    pub values: Vec<JsonValue>,
    pub emitted: bool,
}

#[derive(Default)]
struct SessionCache {
    windows: DashMap<String, Arc<Window>>,
    accumulators: DashMap<String, Arc<Mutex<Accumulator>>>,
    next_sessions: DashMap<Uuid, FlowSession>,
    flat_maps: DashMap<String, Arc<FlatMapSourceWindow>>,
    // parallel_id de cada bifurcación -> parallel_id del item bifurcado.
    forks: DashMap<Uuid, Option<Uuid>>,
    joins: DashMap<(String, Uuid), Arc<Mutex<JoinPane>>>,
    traces: Mutex<Vec<Uuid>>,
    failure: Mutex<Option<FlowError>>,
}

/// Registro de sesiones con ciclo de vida explícito.
pub struct SessionRegistry {
    sessions: DashMap<Uuid, FlowSession>,
    caches: DashMap<Uuid, Arc<SessionCache>>,
    // Generación de liberaciones; los nodos la observan para descartar lo
    // que quede pendiente de sesiones liberadas.
    releases: watch::Sender<u64>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self { sessions: DashMap::new(),
               caches: DashMap::new(),
               releases: watch::channel(0).0 }
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receptor que cambia cada vez que se libera una sesión.
    pub fn releases(&self) -> watch::Receiver<u64> {
        self.releases.subscribe()
    }

    /// Registra la sesión si no lo estaba.
    pub fn register(&self, session: &FlowSession) {
        self.sessions
            .entry(session.id())
            .or_insert_with(|| session.clone());
    }

    pub fn session(&self, id: &Uuid) -> Option<FlowSession> {
        self.sessions.get(id).map(|s| s.value().clone())
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.sessions.contains_key(id)
    }

    /// Número de sesiones vivas.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn cache(&self, session_id: &Uuid) -> Result<Arc<SessionCache>> {
        if !self.sessions.contains_key(session_id) {
            return Err(FlowError::NotFound(format!("sesión {session_id}")));
        }
        Ok(self.caches.entry(*session_id).or_default().value().clone())
    }

    /// Ventana del nodo `node_id` para la sesión; se crea al primer uso
    /// esperando `upstreams` señales de fin.
    pub fn node_window(&self, session_id: &Uuid, node_id: &str, upstreams: usize) -> Result<Arc<Window>> {
        let cache = self.cache(session_id)?;
        let window = cache.windows
                          .entry(node_id.to_string())
                          .or_insert_with(|| Arc::new(Window::new(WindowCondition::session_complete(), upstreams)))
                          .value()
                          .clone();
        Ok(window)
    }

    /// Quita la ventana de un nodo una vez disparada.
    pub fn drop_window(&self, session_id: &Uuid, node_id: &str) {
        if let Some(cache) = self.caches.get(session_id) {
            cache.windows.remove(node_id);
        }
    }

    /// Ventanas abiertas del nodo en todas las sesiones.
    pub fn windows_for_node(&self, node_id: &str) -> Vec<(Uuid, Arc<Window>)> {
        self.caches
            .iter()
            .filter_map(|entry| {
                entry.value()
                     .windows
                     .get(node_id)
                     .map(|w| (*entry.key(), w.value().clone()))
            })
            .collect()
    }

    pub fn accumulator(&self,
                       session_id: &Uuid,
                       node_id: &str,
                       condition: &WindowCondition)
                       -> Result<Arc<Mutex<Accumulator>>> {
        let cache = self.cache(session_id)?;
        let acc = cache.accumulators
                       .entry(node_id.to_string())
                       .or_insert_with(|| Arc::new(Mutex::new(Accumulator::new(condition))))
                       .value()
                       .clone();
        Ok(acc)
    }

    /// Sustituye el panel actual por uno vacío.
    pub fn reset_accumulator(&self, session_id: &Uuid, node_id: &str, condition: &WindowCondition) -> Result<()> {
        let cache = self.cache(session_id)?;
        cache.accumulators
             .insert(node_id.to_string(), Arc::new(Mutex::new(Accumulator::new(condition))));
        Ok(())
    }

    /// Sesión siguiente asociada a una ventana: hija de `parent`, creada una
    /// vez por clave de ventana y liberada junto con el padre.
    pub fn next_session(&self, parent: &FlowSession, window_key: Uuid) -> Result<FlowSession> {
        let cache = self.cache(&parent.id())?;
        if let Some(existing) = cache.next_sessions.get(&window_key) {
            return Ok(existing.value().clone());
        }
        let child = parent.child();
        self.register(&child);
        cache.next_sessions.insert(window_key, child.clone());
        Ok(child)
    }

    /// Ventana de flat-map del nodo para la sesión.
    pub fn flat_map_source(&self, session: &FlowSession, node_id: &str) -> Result<Arc<FlatMapSourceWindow>> {
        let cache = self.cache(&session.id())?;
        if let Some(existing) = cache.flat_maps.get(node_id) {
            return Ok(existing.value().clone());
        }
        let window = Arc::new(Window::new(WindowCondition::session_complete(), 1));
        let child = self.next_session(session, window.key())?;
        let source = Arc::new(FlatMapSourceWindow::new(window, child));
        cache.flat_maps.insert(node_id.to_string(), source.clone());
        Ok(source)
    }

    pub fn find_flat_map_source(&self, session_id: &Uuid, node_id: &str) -> Option<Arc<FlatMapSourceWindow>> {
        self.caches
            .get(session_id)
            .and_then(|cache| cache.flat_maps.get(node_id).map(|f| f.value().clone()))
    }

    /// Anota una bifurcación y la correlación que tenía el item de origen.
    pub fn record_fork(&self, session_id: &Uuid, parallel_id: Uuid, parent: Option<Uuid>) -> Result<()> {
        self.cache(session_id)?.forks.insert(parallel_id, parent);
        Ok(())
    }

    pub fn fork_parent(&self, session_id: &Uuid, parallel_id: &Uuid) -> Option<Uuid> {
        self.caches
            .get(session_id)
            .and_then(|cache| cache.forks.get(parallel_id).and_then(|p| *p.value()))
    }

    /// Panel del join `node_id` para la bifurcación `parallel_id`; se crea
    /// con la traza e índice del primer resultado que llega.
    pub fn join_pane(&self,
                     session_id: &Uuid,
                     node_id: &str,
                     parallel_id: Uuid,
                     trace_id: Uuid,
                     index: u64)
                     -> Result<Arc<Mutex<JoinPane>>> {
        let cache = self.cache(session_id)?;
        let pane = cache.joins
                        .entry((node_id.to_string(), parallel_id))
                        .or_insert_with(|| {
                            Arc::new(Mutex::new(JoinPane { trace_id,
                                                           index,
                                                           values: Vec::new(),
                                                           emitted: false }))
                        })
                        .value()
                        .clone();
        Ok(pane)
    }

    /// Paneles abiertos del join `node_id` en la sesión.
    pub fn join_panes(&self, session_id: &Uuid, node_id: &str) -> Vec<(Uuid, Arc<Mutex<JoinPane>>)> {
        let Some(cache) = self.caches.get(session_id).map(|c| c.value().clone()) else {
            return Vec::new();
        };
        cache.joins
             .iter()
             .filter(|entry| entry.key().0 == node_id)
             .map(|entry| (entry.key().1, entry.value().clone()))
             .collect()
    }

    /// Olvida el panel y la bifurcación una vez resuelto el join.
    pub fn finish_join(&self, session_id: &Uuid, node_id: &str, parallel_id: &Uuid) {
        if let Some(cache) = self.caches.get(session_id) {
            cache.joins.remove(&(node_id.to_string(), *parallel_id));
            cache.forks.remove(parallel_id);
        }
    }

    pub fn add_trace(&self, session_id: &Uuid, trace_id: Uuid) -> Result<()> {
        let cache = self.cache(session_id)?;
        cache.traces.lock().unwrap_or_else(|e| e.into_inner()).push(trace_id);
        Ok(())
    }

    pub fn traces(&self, session_id: &Uuid) -> Vec<Uuid> {
        self.caches
            .get(session_id)
            .map(|cache| cache.traces.lock().unwrap_or_else(|e| e.into_inner()).clone())
            .unwrap_or_default()
    }

    /// Marca la sesión como fallida. Devuelve `true` sólo la primera vez.
    pub fn mark_failed(&self, session_id: &Uuid, error: FlowError) -> bool {
        let Ok(cache) = self.cache(session_id) else {
            return false;
        };
        let mut failure = cache.failure.lock().unwrap_or_else(|e| e.into_inner());
        if failure.is_some() {
            return false;
        }
        *failure = Some(error);
        true
    }

    pub fn failure(&self, session_id: &Uuid) -> Option<FlowError> {
        self.caches
            .get(session_id)
            .and_then(|cache| cache.failure.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    pub fn is_failed(&self, session_id: &Uuid) -> bool {
        self.failure(session_id).is_some()
    }

    /// Libera la sesión y todo lo cacheado para ella, incluidas sus
    /// sesiones siguientes. Los contextos que aún la referencien quedan sin
    /// ruta y el nodo que los tome los descarta.
    pub fn release(&self, session_id: &Uuid) {
        self.forget(session_id);
        self.releases.send_modify(|generation| *generation += 1);
    }

    fn forget(&self, session_id: &Uuid) {
        self.sessions.remove(session_id);
        if let Some((_, cache)) = self.caches.remove(session_id) {
            let children: Vec<Uuid> = cache.next_sessions.iter().map(|s| s.value().id()).collect();
            for child in children {
                self.forget(&child);
            }
        }
        debug!(session = %session_id, "sesión liberada");
    }
}
