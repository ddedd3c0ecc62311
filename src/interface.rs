//! Shared runtime surface for invoking compiled procedures.
//!
//! The engine itself serializes every procedure call on its adapter; this
//! module adds the thin, cloneable handle that multiple callers (threads,
//! a web layer, scripts) share. Each `invoke` maps a procedure name to one
//! ACID transaction and returns the result tree.
//!
//! The goal is to keep sharing concerns here without invasive changes to
//! the engine: callers clone the runtime and submit invocations; the
//! engine's lock guarantees one transaction at a time.

use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use crate::adapter::Adapter;
use crate::error::Result;
use crate::parley::{Arguments, Engine};

/// Cloneable handle over a parsed engine.
pub struct Runtime<A: Adapter> {
    engine: Arc<Engine<A>>,
}

impl<A: Adapter> Clone for Runtime<A> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
        }
    }
}

impl<A: Adapter> Runtime<A> {
    pub fn new(engine: Engine<A>) -> Self {
        Self {
            engine: Arc::new(engine),
        }
    }

    pub fn engine(&self) -> &Engine<A> {
        &self.engine
    }

    /// Names of the procedures this runtime can invoke.
    pub fn procedures(&self) -> Vec<String> {
        self.engine
            .procedures()
            .into_iter()
            .map(|name| name.to_string())
            .collect()
    }

    /// Invoke one procedure as one transaction.
    pub fn invoke(&self, name: &str, args: Arguments) -> Result<serde_json::Value> {
        let started = Instant::now();
        let result = self.engine.call(name, args);
        debug!(
            procedure = %name,
            ms = started.elapsed().as_millis(),
            ok = result.is_ok(),
            "invocation finished"
        );
        result
    }
}
