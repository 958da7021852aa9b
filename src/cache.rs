use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::ScriptError;
use crate::interp::CompiledUnit;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct CacheKey([u8; 32]);

impl CacheKey {
    pub(crate) fn new(url: &str, validator: &str) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(url.as_bytes());
        hasher.update(&[0]);
        hasher.update(validator.as_bytes());
        Self(*hasher.finalize().as_bytes())
    }
}

// map lock held across a miss's compile; concurrent loads compile once
pub(crate) struct CompileCache {
    units: Mutex<HashMap<CacheKey, Arc<CompiledUnit>>>,
    compiles: AtomicU64,
}

impl CompileCache {
    pub(crate) fn new() -> Self {
        Self { units: Mutex::new(HashMap::new()), compiles: AtomicU64::new(0) }
    }

    pub(crate) fn get_or_compile(
        &self,
        key: CacheKey,
        compile: impl FnOnce() -> Result<CompiledUnit, ScriptError>,
    ) -> Result<Arc<CompiledUnit>, ScriptError> {
        let mut units = self.units.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(unit) = units.get(&key) {
            return Ok(unit.clone());
        }
        let unit = Arc::new(compile()?);
        self.compiles.fetch_add(1, Ordering::Relaxed);
        units.insert(key, unit.clone());
        Ok(unit)
    }

    pub(crate) fn compile_count(&self) -> u64 {
        self.compiles.load(Ordering::Relaxed)
    }

    pub(crate) fn len(&self) -> usize {
        self.units.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}
