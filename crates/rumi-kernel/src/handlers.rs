//! Built-in `kernel:*` handlers (§9 "Dynamic handler registry").
//!
//! These are the handlers available to `handler`-typed Steps out of the
//! box, independent of anything a Pack contributes. Every key here must be
//! present in [`crate::REQUIRED_HANDLER_KEYS`].

use std::sync::Arc;

use async_trait::async_trait;
use rumi_dict::SharedDict;
use rumi_error::{ErrorKind, RumiError};
use rumi_flow::KernelHandler;
use serde_json::Value;
use tokio::sync::Mutex;

/// Echoes `args` back unchanged. Useful as a Flow-composition placeholder
/// and in tests that exercise the handler dispatch path without a real
/// side effect.
pub struct NoopHandler;

#[async_trait]
impl KernelHandler for NoopHandler {
    async fn call(&self, args: Value) -> Result<Value, RumiError> {
        Ok(args)
    }
}

fn field<'a>(args: &'a Value, key: &str) -> Result<&'a str, RumiError> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| RumiError::new(ErrorKind::SchemaInvalid, format!("missing or non-string `{key}`")))
}

/// `kernel:shared_dict.resolve` — `{namespace, token}` -> resolved value.
pub struct SharedDictResolveHandler {
    dict: Arc<Mutex<SharedDict>>,
}

impl SharedDictResolveHandler {
    /// Build a handler over the Kernel's shared `SharedDict`.
    pub fn new(dict: Arc<Mutex<SharedDict>>) -> Self {
        Self { dict }
    }
}

#[async_trait]
impl KernelHandler for SharedDictResolveHandler {
    async fn call(&self, args: Value) -> Result<Value, RumiError> {
        let namespace = field(&args, "namespace")?;
        let token = field(&args, "token")?;
        let dict = self.dict.lock().await;
        let result = dict.resolve(namespace, token).map_err(RumiError::from)?;
        Ok(serde_json::json!({ "value": result.value, "hop_limit": result.hop_limit }))
    }
}

/// `kernel:shared_dict.propose` — `{namespace, token, value, provenance}`.
pub struct SharedDictProposeHandler {
    dict: Arc<Mutex<SharedDict>>,
}

impl SharedDictProposeHandler {
    /// Build a handler over the Kernel's shared `SharedDict`.
    pub fn new(dict: Arc<Mutex<SharedDict>>) -> Self {
        Self { dict }
    }
}

#[async_trait]
impl KernelHandler for SharedDictProposeHandler {
    async fn call(&self, args: Value) -> Result<Value, RumiError> {
        let namespace = field(&args, "namespace")?;
        let token = field(&args, "token")?;
        let provenance = field(&args, "provenance")?;
        let value = field(&args, "value")?;
        let mut dict = self.dict.lock().await;
        dict.propose(namespace, token, value, provenance).map_err(RumiError::from)?;
        Ok(Value::Bool(true))
    }
}
