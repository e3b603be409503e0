// Archivo: locks.rs
// Propósito: contrato del proveedor de locks de nodo.
//
// Un nodo mantiene el lock de `(stream, nodo)` durante todo el ciclo
// tomar-procesar-emitir-avanzar. Los locks son consultivos: si quien lo
// tiene muere, la recuperación es externa.
use crate::errors::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Prefijo de las claves de lock de nodo.
pub const LOCK_PREFIX: &str = "flow-node";
/// Tipo de proceso del ciclo principal de un nodo.
pub const PROCESS: &str = "process";

/// Lock de exclusión mutua.
#[async_trait]
pub trait FlowLock: Send + Sync {
    fn key(&self) -> &str;

    /// Espera hasta obtener el lock.
    async fn lock(&self) -> Result<()>;

    /// Intenta obtenerlo sin esperar.
    fn try_lock(&self) -> Result<bool>;

    /// Espera como mucho `timeout`. Abandonar la espera no deja el lock
    /// tomado.
    async fn try_lock_for(&self, timeout: Duration) -> Result<bool>;

    fn unlock(&self) -> Result<()>;
}

/// Proveedor de locks locales y distribuidos.
pub trait FlowLocks: Send + Sync {
    /// Lock del proceso actual.
    fn local_lock(&self, key: &str) -> Arc<dyn FlowLock>;

    /// Lock entre procesos. Sin coordinador externo delega en el local.
    fn distributed_lock(&self, key: &str) -> Arc<dyn FlowLock> {
        self.local_lock(key)
    }

    /// Clave `{prefijo}-{stream}-{nodo}-{tipo}`.
    fn lock_key(&self, stream_id: &str, node_id: &str, process_type: &str) -> String {
        format!("{LOCK_PREFIX}-{stream_id}-{node_id}-{process_type}")
    }
}

/// Guarda RAII: libera el lock al salir de ámbito.
pub struct FlowLockGuard {
    lock: Arc<dyn FlowLock>,
}

impl FlowLockGuard {
    pub async fn acquire(lock: Arc<dyn FlowLock>) -> Result<Self> {
        lock.lock().await?;
        Ok(Self { lock })
    }

    pub fn key(&self) -> &str {
        self.lock.key()
    }
}

impl Drop for FlowLockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.lock.unlock() {
            warn!(key = %self.lock.key(), error = %e, "no se pudo liberar el lock");
        }
    }
}
