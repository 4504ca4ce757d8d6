// SPDX-License-Identifier: MIT OR Apache-2.0
//! FlowExecutor: ordered, cancellable, fail-soft step dispatch (§4.2).
//!
//! Deliberately holds no dependency on `rumi-host`/`rumi-block`/
//! `rumi-capability` — `handler` and `python_file_call` dispatch are
//! reached through the [`KernelHandler`]/[`BlockDispatcher`] trait objects
//! the Kernel composition root wires in, keeping the crate graph acyclic
//! (see DESIGN.md).

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use rumi_core::ordering::sort_steps;
use rumi_core::{CancellationToken, Flow, Step, StepType};
use rumi_error::{ErrorKind, RumiError};
use rumi_integrity::ApprovalStore;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::condition::IfInput;
use crate::substitution::substitute_value;
use crate::FlowError;

/// A registered kernel-side handler, reachable from `handler`-typed Steps
/// by name.
#[async_trait]
pub trait KernelHandler: Send + Sync {
    /// Invoke this handler with already-substituted `args`, returning its
    /// result value.
    async fn call(&self, args: Value) -> Result<Value, RumiError>;
}

/// Runs a `python_file_call`-typed Step's target file inside an isolated
/// Pack container. Implemented by `rumi-block`; injected here so this
/// crate never links container/process concerns directly.
#[async_trait]
pub trait BlockDispatcher: Send + Sync {
    /// Execute `file` belonging to `owner_pack` with `input_data`, returning
    /// the block's `output_data`. `cancel` is observed at the container I/O
    /// boundary and triggers cleanup of the in-flight container.
    async fn run(
        &self,
        owner_pack: &str,
        file: &str,
        input_data: Value,
        exec_context: rumi_protocol::BlockExecContext,
        cancel: CancellationToken,
    ) -> Result<Value, RumiError>;
}

/// One Step's dispatch failure, recorded even when `fail_soft` lets
/// execution continue past it.
#[derive(Debug, Clone)]
pub struct StepFailure {
    /// The failing Step's id.
    pub step_id: String,
    /// Human-readable failure detail.
    pub error: String,
}

/// The result of a completed (possibly partially failed, if `fail_soft`)
/// Flow execution.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    /// Final execution context, including every Step's recorded `output`.
    pub ctx: Value,
    /// Steps that failed along the way (empty on a clean run).
    pub step_failures: Vec<StepFailure>,
}

fn set_ctx(ctx: &mut Value, key: &str, value: Value) {
    if let Value::Object(map) = ctx {
        map.insert(key.to_string(), value);
    }
}

/// Ordered, cancellable, fail-soft Flow step dispatcher.
pub struct FlowExecutor {
    handlers: BTreeMap<String, Arc<dyn KernelHandler>>,
    dispatcher: Arc<dyn BlockDispatcher>,
    approvals: Arc<Mutex<ApprovalStore>>,
    audit: Arc<rumi_audit::AuditLog>,
}

impl FlowExecutor {
    /// Build an executor over an explicit handler registry, block
    /// dispatcher, shared `ApprovalStore`, and audit log.
    pub fn new(
        handlers: BTreeMap<String, Arc<dyn KernelHandler>>,
        dispatcher: Arc<dyn BlockDispatcher>,
        approvals: Arc<Mutex<ApprovalStore>>,
        audit: Arc<rumi_audit::AuditLog>,
    ) -> Self {
        Self { handlers, dispatcher, approvals, audit }
    }

    /// Execute `flow` with the given `inputs`, observing `cancel` between
    /// steps and at I/O boundaries. Fail-soft behavior follows
    /// `flow.defaults.fail_soft` for both top-level steps and `if`-branch
    /// bodies (same scope as the enclosing Flow, §9).
    pub async fn execute(
        &self,
        flow: &Flow,
        inputs: Value,
        cancel: CancellationToken,
    ) -> Result<ExecutionOutcome, FlowError> {
        let mut steps = flow.steps.clone();
        sort_steps(&flow.phases, &mut steps);

        let mut ctx_map = serde_json::Map::new();
        ctx_map.insert("inputs".to_string(), inputs);
        let mut ctx = Value::Object(ctx_map);

        let mut failures = Vec::new();
        self.execute_steps(&steps, flow, &mut ctx, flow.defaults.fail_soft, &cancel, &mut failures)
            .await?;

        Ok(ExecutionOutcome { ctx, step_failures: failures })
    }

    fn execute_steps<'s>(
        &'s self,
        steps: &'s [Step],
        flow: &'s Flow,
        ctx: &'s mut Value,
        fail_soft: bool,
        cancel: &'s CancellationToken,
        failures: &'s mut Vec<StepFailure>,
    ) -> Pin<Box<dyn Future<Output = Result<(), FlowError>> + Send + 's>> {
        Box::pin(async move {
            for (order_index, step) in steps.iter().enumerate() {
                if cancel.is_cancelled() {
                    return Err(FlowError::Cancelled);
                }

                if step.step_type == StepType::If {
                    match self.dispatch_if(step, ctx) {
                        Ok(branch_steps) => {
                            let mut branch_sorted = branch_steps;
                            sort_steps(&flow.phases, &mut branch_sorted);
                            self.record_step_audit(flow, step, order_index, true, None).await;
                            self.execute_steps(&branch_sorted, flow, ctx, fail_soft, cancel, failures)
                                .await?;
                        }
                        Err(e) => {
                            self.record_step_audit(flow, step, order_index, false, Some(e.to_string()))
                                .await;
                            failures.push(StepFailure { step_id: step.id.clone(), error: e.to_string() });
                            if !fail_soft {
                                return Err(FlowError::ExecutionFailed(format!(
                                    "step `{}`: {e}",
                                    step.id
                                )));
                            }
                        }
                    }
                    continue;
                }

                let result = self.execute_one(step, flow, ctx, cancel).await;
                self.record_step_audit(
                    flow,
                    step,
                    order_index,
                    result.is_ok(),
                    result.as_ref().err().map(|e: &RumiError| e.to_string()),
                )
                .await;
                if let Err(e) = result {
                    // Cancellation hard-aborts the Flow regardless of fail_soft,
                    // the same way the between-steps check above does.
                    if e.kind == ErrorKind::Cancelled {
                        return Err(FlowError::Cancelled);
                    }
                    failures.push(StepFailure { step_id: step.id.clone(), error: e.to_string() });
                    if !fail_soft {
                        return Err(FlowError::ExecutionFailed(format!("step `{}`: {e}", step.id)));
                    }
                }
            }
            Ok(())
        })
    }

    fn dispatch_if(&self, step: &Step, ctx: &Value) -> Result<Vec<Step>, RumiError> {
        let if_input: IfInput = serde_json::from_value(step.input.clone()).map_err(|e| {
            RumiError::new(ErrorKind::SchemaInvalid, format!("invalid `if` step input: {e}"))
        })?;
        let branch = if if_input.cond.eval(ctx) { if_input.then } else { if_input.else_ };
        Ok(branch)
    }

    async fn execute_one(
        &self,
        step: &Step,
        flow: &Flow,
        ctx: &mut Value,
        cancel: &CancellationToken,
    ) -> Result<(), RumiError> {
        let substituted = substitute_value(&step.input, ctx);

        match step.step_type {
            StepType::Set => {
                if let Some(key) = &step.output {
                    set_ctx(ctx, key, substituted);
                }
                Ok(())
            }
            StepType::Handler => {
                let handler_name = substituted.get("handler").and_then(Value::as_str).ok_or_else(|| {
                    RumiError::new(ErrorKind::SchemaInvalid, "handler step input missing `handler` field")
                })?;
                let handler = self.handlers.get(handler_name).ok_or_else(|| {
                    RumiError::new(ErrorKind::SchemaInvalid, format!("unknown handler `{handler_name}`"))
                        .with_context("handler", handler_name)
                })?;
                let args = substituted.get("args").cloned().unwrap_or(Value::Null);
                let output = handler.call(args).await?;
                if let Some(key) = &step.output {
                    set_ctx(ctx, key, output);
                }
                Ok(())
            }
            StepType::PythonFileCall => {
                self.execute_python_file_call(step, flow, &substituted, ctx, cancel).await
            }
            StepType::If => unreachable!("if-typed steps are dispatched by execute_steps directly"),
        }
    }

    async fn execute_python_file_call(
        &self,
        step: &Step,
        flow: &Flow,
        substituted: &Value,
        ctx: &mut Value,
        cancel: &CancellationToken,
    ) -> Result<(), RumiError> {
        let owner_pack = step.owner_pack.as_deref().ok_or_else(|| {
            RumiError::new(ErrorKind::SchemaInvalid, "python_file_call step missing owner_pack")
        })?;
        let file = step
            .file
            .as_deref()
            .ok_or_else(|| RumiError::new(ErrorKind::SchemaInvalid, "python_file_call step missing file"))?;

        if let Some(claimed) = substituted.get("principal_id").and_then(Value::as_str) {
            if claimed != owner_pack {
                let mut entry =
                    rumi_audit::new_entry(rumi_core::AuditCategory::Security, "principal_override_attempt");
                entry.severity = rumi_core::AuditSeverity::Security;
                entry.pack_id = Some(owner_pack.to_string());
                entry.flow_id = Some(flow.flow_id.clone());
                entry.step_id = Some(step.id.clone());
                entry
                    .details
                    .insert("claimed_principal".into(), Value::String(claimed.to_string()));
                entry.details.insert("enforced_principal".into(), Value::String(owner_pack.to_string()));
                let _ = self.audit.record(entry).await;
            }
        }

        let authorized = {
            let mut approvals = self.approvals.lock().await;
            approvals.is_authorized(owner_pack).await.map_err(RumiError::from)?
        };
        if !authorized {
            return Err(RumiError::new(
                ErrorKind::NotApproved,
                format!("pack `{owner_pack}` is not authorized to execute code"),
            )
            .with_context("pack_id", owner_pack));
        }

        let exec_context = rumi_protocol::BlockExecContext {
            flow_id: flow.flow_id.clone(),
            step_id: step.id.clone(),
            phase: step.phase.clone(),
            ts: chrono::Utc::now().to_rfc3339(),
            owner_pack: owner_pack.to_string(),
        };

        let output =
            self.dispatcher.run(owner_pack, file, substituted.clone(), exec_context, cancel.clone()).await?;
        if let Some(key) = &step.output {
            set_ctx(ctx, key, output);
        }
        Ok(())
    }

    async fn record_step_audit(
        &self,
        flow: &Flow,
        step: &Step,
        order_index: usize,
        success: bool,
        rejection_reason: Option<String>,
    ) {
        let mut entry = rumi_audit::new_entry(rumi_core::AuditCategory::FlowExecution, "step_dispatch");
        entry.success = success;
        entry.flow_id = Some(flow.flow_id.clone());
        entry.step_id = Some(step.id.clone());
        entry.phase = Some(step.phase.clone());
        entry.pack_id = step.owner_pack.clone();
        entry.details.insert("order_index".into(), serde_json::json!(order_index));
        entry.details.insert("priority".into(), serde_json::json!(step.priority));
        if !success {
            entry.severity = rumi_core::AuditSeverity::Error;
        }
        entry.rejection_reason = rejection_reason;
        let _ = self.audit.record(entry).await;
    }
}
