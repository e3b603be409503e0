// Archivo: config.rs
// Propósito: configuración del motor y valores por defecto de los nodos.
//
// Los valores pueden venir de variables de entorno (`FLOW_*`), cargando antes
// un `.env` opcional con `dotenvy`.
use crate::errors::{FlowError, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Valores por defecto que reciben los nodos al construirse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Items procesados en paralelo dentro de un lote.
    pub default_concurrency: usize,
    /// Tamaño de lote por ciclo. `None` equivale a la concurrencia.
    pub default_batch_size: Option<usize>,
    /// Contextos pendientes que un nodo admite antes de frenar a sus
    /// productores.
    pub default_backlog: usize,
    /// Reintentos por contexto antes de escalar el fallo.
    pub max_retries: u32,
    /// Espera entre reintentos y tras fallos transitorios.
    pub retry_backoff_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { default_concurrency: 1,
               default_batch_size: None,
               default_backlog: 64,
               max_retries: 3,
               retry_backoff_ms: 50 }
    }
}

impl EngineConfig {
    /// Lee la configuración del entorno. Las variables ausentes conservan el
    /// valor por defecto; las presentes pero inválidas producen
    /// `FlowError::Config`.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        let defaults = Self::default();
        let batch = match std::env::var("FLOW_BATCH_SIZE") {
            Ok(raw) => Some(parse_var("FLOW_BATCH_SIZE", &raw)?),
            Err(_) => defaults.default_batch_size,
        };
        let cfg = Self { default_concurrency: env_or("FLOW_CONCURRENCY", defaults.default_concurrency)?,
                         default_batch_size: batch,
                         default_backlog: env_or("FLOW_BACKLOG", defaults.default_backlog)?,
                         max_retries: env_or("FLOW_MAX_RETRIES", defaults.max_retries)?,
                         retry_backoff_ms: env_or("FLOW_RETRY_BACKOFF_MS", defaults.retry_backoff_ms)? };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Rechaza valores que dejarían un nodo sin capacidad de avanzar.
    pub fn validate(&self) -> Result<()> {
        if self.default_concurrency == 0 {
            return Err(FlowError::Config("FLOW_CONCURRENCY debe ser > 0".into()));
        }
        if self.default_backlog == 0 {
            return Err(FlowError::Config("FLOW_BACKLOG debe ser > 0".into()));
        }
        if self.default_batch_size == Some(0) {
            return Err(FlowError::Config("FLOW_BATCH_SIZE debe ser > 0".into()));
        }
        Ok(())
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(raw) => parse_var(name, &raw),
        Err(_) => Ok(default),
    }
}

fn parse_var<T: FromStr>(name: &str, raw: &str) -> Result<T> {
    raw.trim()
       .parse::<T>()
       .map_err(|_| FlowError::Config(format!("{name}='{raw}' no es válido")))
}
