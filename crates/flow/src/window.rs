// Archivo: window.rs
// Propósito: ventanas de sesión. Una ventana cuenta lo aceptado y lo
// consumido en un nodo para una sesión, sabe cuántos upstreams deben
// completarse y se cumple (dispara) como mucho una vez.
use crate::errors::{FlowError, Result};
use crate::session::FlowSession;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Argumentos que recibe una `WindowCondition`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowArg {
    /// Todos los upstreams terminaron y no queda nada aceptado sin consumir.
    pub is_session_complete: bool,
    /// Datos acumulados en la ventana actual.
    pub data_length: u64,
    /// Datos consumidos hasta ahora en la sesión.
    pub count_to_now: u64,
    /// Tiempo desde la apertura de la ventana.
    pub time_to_now: Duration,
}

type ConditionFn = dyn Fn(&WindowArg) -> bool + Send + Sync;

/// Predicado "ventana cumplida".
#[derive(Clone)]
pub struct WindowCondition(Arc<ConditionFn>);

impl WindowCondition {
    pub fn new(f: impl Fn(&WindowArg) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    /// Se cumple cuando la sesión terminó.
    pub fn session_complete() -> Self {
        Self::new(|arg| arg.is_session_complete)
    }

    /// Se cumple al acumular `n` datos o al terminar la sesión.
    pub fn count(n: u64) -> Self {
        Self::new(move |arg| arg.data_length >= n || arg.is_session_complete)
    }

    /// Se cumple tras `period` con datos acumulados o al terminar la sesión.
    pub fn elapsed(period: Duration) -> Self {
        Self::new(move |arg| (arg.data_length > 0 && arg.time_to_now >= period) || arg.is_session_complete)
    }

    pub fn test(&self, arg: &WindowArg) -> bool {
        (self.0)(arg)
    }
}

impl Default for WindowCondition {
    fn default() -> Self {
        Self::session_complete()
    }
}

impl fmt::Debug for WindowCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WindowCondition(..)")
    }
}

type Callback = Box<dyn FnOnce(&Window) + Send>;

/// Unidad de ventana de una sesión en una posición.
pub struct Window {
    key: Uuid,
    condition: WindowCondition,
    upstreams: usize,
    completed: AtomicUsize,
    accepted: AtomicU64,
    consumed: AtomicU64,
    sequence: AtomicU64,
    created_at: Instant,
    fulfilled: AtomicBool,
    callbacks: Mutex<Vec<Callback>>,
}

impl Window {
    pub fn new(condition: WindowCondition, upstreams: usize) -> Self {
        Self { key: Uuid::new_v4(),
               condition,
               upstreams,
               completed: AtomicUsize::new(0),
               accepted: AtomicU64::new(0),
               consumed: AtomicU64::new(0),
               sequence: AtomicU64::new(0),
               created_at: Instant::now(),
               fulfilled: AtomicBool::new(false),
               callbacks: Mutex::new(Vec::new()) }
    }

    pub fn key(&self) -> Uuid {
        self.key
    }

    /// Registra `n` datos entrantes. Devuelve el total aceptado antes de
    /// esta llamada, que la ventana de inicio usa como primer índice.
    pub fn accept(&self, n: u64) -> Result<u64> {
        if self.is_fulfilled() {
            return Err(FlowError::WindowViolation(format!("ventana {} ya cumplida: no admite datos", self.key)));
        }
        Ok(self.accepted.fetch_add(n, Ordering::SeqCst))
    }

    /// Deshace un `accept` cuyo guardado falló.
    pub fn retract(&self, n: u64) {
        let _ = self.accepted
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| Some(v.saturating_sub(n)));
    }

    pub fn consume(&self, n: u64) {
        self.consumed.fetch_add(n, Ordering::SeqCst);
    }

    /// Reserva `n` índices consecutivos para salidas nuevas.
    pub fn allocate(&self, n: u64) -> u64 {
        self.sequence.fetch_add(n, Ordering::SeqCst)
    }

    pub fn complete_upstream(&self) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::SeqCst)
    }

    pub fn consumed(&self) -> u64 {
        self.consumed.load(Ordering::SeqCst)
    }

    pub fn is_session_complete(&self) -> bool {
        self.completed.load(Ordering::SeqCst) >= self.upstreams && self.consumed() >= self.accepted()
    }

    pub fn elapsed(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn arg(&self) -> WindowArg {
        WindowArg { is_session_complete: self.is_session_complete(),
                    data_length: self.accepted().saturating_sub(self.consumed()),
                    count_to_now: self.consumed(),
                    time_to_now: self.elapsed() }
    }

    /// Evalúa la condición con el estado propio de la ventana.
    pub fn evaluate(&self) -> Result<bool> {
        self.evaluate_with(&self.arg())
    }

    /// Evalúa la condición con argumentos externos. Evaluar una ventana ya
    /// cumplida es un `WindowViolation`.
    pub fn evaluate_with(&self, arg: &WindowArg) -> Result<bool> {
        if self.is_fulfilled() {
            return Err(FlowError::WindowViolation(format!("ventana {} evaluada tras cumplirse", self.key)));
        }
        Ok(self.condition.test(arg))
    }

    /// Marca la ventana como cumplida y ejecuta sus callbacks. Sólo la
    /// primera llamada tiene efecto; las siguientes devuelven
    /// `WindowViolation`.
    pub fn fire(&self) -> Result<()> {
        if self.fulfilled
               .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
               .is_err()
        {
            return Err(FlowError::WindowViolation(format!("ventana {} disparada dos veces", self.key)));
        }
        let callbacks = std::mem::take(&mut *self.callbacks.lock().unwrap_or_else(|e| e.into_inner()));
        for cb in callbacks {
            cb(self);
        }
        Ok(())
    }

    pub fn is_fulfilled(&self) -> bool {
        self.fulfilled.load(Ordering::SeqCst)
    }

    /// Registra un callback de cumplimiento. Si la ventana ya se cumplió se
    /// ejecuta en el acto.
    pub fn on_fulfilled(&self, f: impl FnOnce(&Window) + Send + 'static) {
        let mut callbacks = self.callbacks.lock().unwrap_or_else(|e| e.into_inner());
        if self.is_fulfilled() {
            drop(callbacks);
            f(self);
        } else {
            callbacks.push(Box::new(f));
        }
    }
}

impl fmt::Debug for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Window")
         .field("key", &self.key)
         .field("upstreams", &self.upstreams)
         .field("completed", &self.completed.load(Ordering::SeqCst))
         .field("accepted", &self.accepted())
         .field("consumed", &self.consumed())
         .field("fulfilled", &self.is_fulfilled())
         .finish()
    }
}

/// Ventana de abanico de un flat-map: agrupa las salidas que genera cada
/// entrada para que aguas abajo puedan tratarse como un único lote.
///
/// Lleva una sesión hija (la del sub-flujo) cuyo id viaja como
/// `parallel_id` en los contextos generados, salvo que la entrada ya venga
/// de una rama de `parallel`.
pub struct FlatMapSourceWindow {
    window: Arc<Window>,
    session: FlowSession,
    sources: Mutex<HashMap<Uuid, (u64, u64)>>,
}

impl FlatMapSourceWindow {
    pub fn new(window: Arc<Window>, session: FlowSession) -> Self {
        Self { window,
               session,
               sources: Mutex::new(HashMap::new()) }
    }

    pub fn window(&self) -> &Arc<Window> {
        &self.window
    }

    pub fn session(&self) -> &FlowSession {
        &self.session
    }

    /// Reserva `count` índices consecutivos para las salidas de `source` y
    /// devuelve el primero. Repetir la misma entrada (un ciclo que se
    /// reintenta) devuelve el rango ya reservado.
    pub fn record(&self, source: Uuid, count: u64) -> Result<u64> {
        let mut sources = self.sources.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((start, recorded)) = sources.get(&source).copied() {
            if recorded == count {
                return Ok(start);
            }
        }
        self.window.accept(count)?;
        let start = self.window.allocate(count);
        sources.insert(source, (start, count));
        Ok(start)
    }

    /// Rango `(primer índice, cantidad)` generado por `source`.
    pub fn source_range(&self, source: &Uuid) -> Option<(u64, u64)> {
        self.sources
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(source)
            .copied()
    }

    /// Cierra el abanico: no habrá más entradas.
    pub fn close(&self) -> Result<()> {
        if self.window.is_fulfilled() {
            return Ok(());
        }
        self.window.complete_upstream();
        self.window.consume(self.window.accepted().saturating_sub(self.window.consumed()));
        if self.window.evaluate()? {
            self.window.fire()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_condition_uses_data_length() {
        let cond = WindowCondition::count(3);
        let mut arg = WindowArg { is_session_complete: false,
                                  data_length: 2,
                                  count_to_now: 2,
                                  time_to_now: Duration::ZERO };
        assert!(!cond.test(&arg));
        arg.data_length = 3;
        assert!(cond.test(&arg));
    }

    #[test]
    fn session_complete_needs_every_upstream_and_consumption() {
        let w = Window::new(WindowCondition::session_complete(), 2);
        w.accept(2).expect("accept");
        w.complete_upstream();
        w.complete_upstream();
        assert!(!w.evaluate().expect("eval"));
        w.consume(2);
        assert!(w.evaluate().expect("eval"));
    }
}
