// SPDX-License-Identifier: MIT OR Apache-2.0
//! rumi-kernel
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! `KernelCore`: the composition root (§9). Wires `ApprovalStore`,
//! `GrantStore`, `SharedDict`, and `AuditLog` to a `FlowExecutor` and the
//! Egress/Capability brokers, owns the `kernel:*` handler registry, and
//! supervises one broker-listener task pair per Approved Pack.
//!
//! Request flow for a Flow execution: [`KernelCore::run_flow`] composes the
//! Flow via `FlowLoader`, then hands it to the shared `FlowExecutor`, which
//! dispatches `handler`-typed Steps to this registry and `python_file_call`
//! Steps to a `BlockExecutor`.

pub mod handlers;
pub mod pending;

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rumi_audit::AuditLog;
use rumi_block::{BlockExecutor, BlockExecutorConfig};
use rumi_candidate::{CandidateManager, PipDiscoverer};
use rumi_capability::{CapabilityBroker, CapabilityDiscoverer};
use rumi_config::{RumiConfig, SecurityMode};
use rumi_core::{CancellationToken, Flow, NetworkGrant, Pack, PackState, SharedDictRule};
use rumi_dict::{ResolveResult, SharedDict};
use rumi_egress::EgressBroker;
use rumi_error::{ErrorKind, RumiError};
use rumi_flow::{BlockDispatcher, ExecutionOutcome, FlowExecutor, FlowLoader, KernelHandler};
use rumi_grant::GrantStore;
use rumi_integrity::{ApprovalStore, VerifyResult};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{info, warn};

use pending::{PendingSummary, SubsystemSummary};

/// `kernel:*` handler keys every `KernelCore` must register before it is
/// considered started (§9 "startup assertion that every declared key is
/// present").
pub const REQUIRED_HANDLER_KEYS: &[&str] =
    &["kernel:noop", "kernel:shared_dict.resolve", "kernel:shared_dict.propose"];

/// Interface names this Kernel always advertises to the `InterfaceRegistry`
/// consulted by Modifier `requires.interfaces` evaluation.
const BUILTIN_INTERFACES: &[&str] = &["kernel.shared_dict", "kernel.flow"];

/// Errors raised while starting or operating a `KernelCore`.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    /// Configuration failed validation.
    #[error("configuration error: {0}")]
    Config(#[from] rumi_config::ConfigError),
    /// Filesystem I/O failure during startup.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// A subsystem error, already normalized to the shared taxonomy.
    #[error(transparent)]
    Rumi(#[from] RumiError),
}

/// Start-time overrides not carried by [`RumiConfig`] because they are
/// operational rather than persisted settings.
#[derive(Debug, Clone)]
pub struct KernelOptions {
    /// Highest-precedence Flow/Modifier search-path root (§4.1). Absence is
    /// the common case; a missing directory contributes nothing.
    pub flows_dir: PathBuf,
}

impl Default for KernelOptions {
    fn default() -> Self {
        Self { flows_dir: PathBuf::from("flows") }
    }
}

fn count_pending_packs(store: &ApprovalStore) -> usize {
    store.all().filter(|p| matches!(p.state, PackState::Pending | PackState::Modified)).count()
}

fn count_actionable<D: rumi_candidate::CandidateDiscoverer>(mgr: &CandidateManager<D>) -> usize {
    mgr.all().filter(|(_, _, state)| state.is_actionable()).count()
}

fn block_executor_config(config: &RumiConfig) -> BlockExecutorConfig {
    BlockExecutorConfig {
        egress_sock_dir: PathBuf::from(&config.egress_sock_dir),
        capability_sock_dir: PathBuf::from(&config.capability_sock_dir),
        egress_socket_gid: config.egress_socket_gid,
        capability_socket_gid: config.capability_socket_gid,
        default_memory_limit_mb: config.default_memory_limit_mb,
        permissive_fallback: matches!(config.security_mode, SecurityMode::Permissive),
        ..BlockExecutorConfig::default()
    }
}

fn assert_handlers_present(handlers: &BTreeMap<String, Arc<dyn KernelHandler>>) -> Result<(), KernelError> {
    for key in REQUIRED_HANDLER_KEYS {
        if !handlers.contains_key(*key) {
            return Err(RumiError::new(
                ErrorKind::SchemaInvalid,
                format!("handler registry missing required key `{key}`"),
            )
            .into());
        }
    }
    Ok(())
}

/// The running Kernel: every store, broker, and the Flow executor, plus the
/// supervisory tasks that keep broker sockets listening for Approved Packs.
pub struct KernelCore {
    user_data_root: PathBuf,
    ecosystem_root: PathBuf,
    flows_dir: PathBuf,
    interfaces: BTreeSet<String>,
    approvals: Arc<Mutex<ApprovalStore>>,
    grants: Arc<GrantStore>,
    dict: Arc<Mutex<SharedDict>>,
    audit: Arc<AuditLog>,
    executor: Arc<FlowExecutor>,
    egress: Arc<EgressBroker>,
    capability: Arc<CapabilityBroker>,
    capability_candidates: Mutex<CandidateManager<CapabilityDiscoverer>>,
    pip_candidates: Mutex<CandidateManager<PipDiscoverer>>,
    tasks: Mutex<JoinSet<()>>,
}

impl KernelCore {
    /// Run the full startup sequence (§9): open every store, scan Packs and
    /// candidates, build the handler registry, stand up the brokers, spawn
    /// a listener pair for every currently Approved Pack, and write the
    /// pending-export snapshot. A per-subsystem scan failure is captured in
    /// the pending export rather than aborting startup.
    pub async fn start(config: RumiConfig, options: KernelOptions) -> Result<Self, KernelError> {
        for warning in rumi_config::validate_config(&config)? {
            warn!(target: "rumi.kernel.start", %warning, "configuration warning");
        }

        let user_data_root = PathBuf::from(&config.user_data_root);
        let ecosystem_root = PathBuf::from(&config.ecosystem_root);
        tokio::fs::create_dir_all(&user_data_root).await?;

        let grants = Arc::new(GrantStore::open(&user_data_root).map_err(RumiError::from)?);
        let dict = Arc::new(Mutex::new(SharedDict::open(&user_data_root).map_err(RumiError::from)?));
        let audit = Arc::new(AuditLog::open(&user_data_root).await.map_err(RumiError::from)?);

        let mut approvals_store =
            ApprovalStore::load(&user_data_root).map_err(RumiError::from)?.with_security_hooks(grants.clone(), audit.clone());
        let packs_summary = match approvals_store.scan(&ecosystem_root).await {
            Ok(_) => SubsystemSummary::ok(count_pending_packs(&approvals_store)),
            Err(err) => SubsystemSummary::failed(err.to_string()),
        };
        let approvals = Arc::new(Mutex::new(approvals_store));

        let capability_discoverer = CapabilityDiscoverer::new(&ecosystem_root, &user_data_root);
        let mut capability_mgr =
            CandidateManager::load(capability_discoverer, user_data_root.join("capabilities/candidates.json"))
                .map_err(RumiError::from)?;
        let capability_summary = match capability_mgr.scan() {
            Ok(_) => SubsystemSummary::ok(count_actionable(&capability_mgr)),
            Err(err) => SubsystemSummary::failed(err.to_string()),
        };

        let pip_discoverer = PipDiscoverer::new(&ecosystem_root);
        let mut pip_mgr = CandidateManager::load(pip_discoverer, user_data_root.join("pip/candidates.json"))
            .map_err(RumiError::from)?;
        let pip_summary = match pip_mgr.scan() {
            Ok(_) => SubsystemSummary::ok(count_actionable(&pip_mgr)),
            Err(err) => SubsystemSummary::failed(err.to_string()),
        };

        let mut handlers: BTreeMap<String, Arc<dyn KernelHandler>> = BTreeMap::new();
        handlers.insert("kernel:noop".to_string(), Arc::new(handlers::NoopHandler));
        handlers.insert(
            "kernel:shared_dict.resolve".to_string(),
            Arc::new(handlers::SharedDictResolveHandler::new(dict.clone())),
        );
        handlers.insert(
            "kernel:shared_dict.propose".to_string(),
            Arc::new(handlers::SharedDictProposeHandler::new(dict.clone())),
        );
        assert_handlers_present(&handlers)?;

        let block_executor = BlockExecutor::new(
            approvals.clone(),
            audit.clone(),
            &user_data_root,
            block_executor_config(&config),
        );
        let executor = Arc::new(FlowExecutor::new(
            handlers,
            Arc::new(block_executor) as Arc<dyn BlockDispatcher>,
            approvals.clone(),
            audit.clone(),
        ));

        let egress = Arc::new(EgressBroker::new(grants.clone(), audit.clone(), &config.egress_sock_dir).map_err(RumiError::from)?);
        let capability = Arc::new(
            CapabilityBroker::new(grants.clone(), audit.clone(), &user_data_root, &config.capability_sock_dir)
                .await
                .map_err(RumiError::from)?,
        );

        let interfaces: BTreeSet<String> = BUILTIN_INTERFACES.iter().map(|s| s.to_string()).collect();

        let kernel = Self {
            user_data_root: user_data_root.clone(),
            ecosystem_root,
            flows_dir: options.flows_dir,
            interfaces,
            approvals,
            grants,
            dict,
            audit,
            executor,
            egress,
            capability,
            capability_candidates: Mutex::new(capability_mgr),
            pip_candidates: Mutex::new(pip_mgr),
            tasks: Mutex::new(JoinSet::new()),
        };

        kernel.spawn_broker_tasks_for_approved_packs().await;

        let summary = PendingSummary {
            generated_at: chrono::Utc::now(),
            packs: packs_summary,
            capability: capability_summary,
            pip: pip_summary,
        };
        if let Err(err) = summary.write(&user_data_root).await {
            warn!(target: "rumi.kernel.start", error = %err, "failed to write pending export");
        }

        info!(target: "rumi.kernel.start", user_data_root = %user_data_root.display(), "kernel started");
        Ok(kernel)
    }

    async fn spawn_broker_tasks_for_pack(&self, pack_id: String) {
        let mut tasks = self.tasks.lock().await;

        let egress = self.egress.clone();
        let egress_pack_id = pack_id.clone();
        tasks.spawn(async move {
            if let Err(err) = egress.listen(egress_pack_id.clone()).await {
                warn!(target: "rumi.kernel.egress", pack_id = %egress_pack_id, error = %err, "egress listener exited");
            }
        });

        let capability = self.capability.clone();
        tasks.spawn(async move {
            if let Err(err) = capability.listen(pack_id.clone()).await {
                warn!(target: "rumi.kernel.capability", pack_id = %pack_id, error = %err, "capability listener exited");
            }
        });
    }

    async fn spawn_broker_tasks_for_approved_packs(&self) {
        let approved: Vec<String> = {
            let approvals = self.approvals.lock().await;
            approvals.all().filter(|p| p.state == PackState::Approved).map(|p| p.pack_id.clone()).collect()
        };
        for pack_id in approved {
            self.spawn_broker_tasks_for_pack(pack_id).await;
        }
    }

    /// Orderly shutdown (§9 "avoid fire and forget starts; every container
    /// handle has a registered cleanup"): stop accepting new broker
    /// connections by aborting every supervisory listener task.
    pub async fn shutdown(&self) {
        let mut tasks = self.tasks.lock().await;
        tasks.shutdown().await;
        info!(target: "rumi.kernel.shutdown", "kernel stopped");
    }

    // -- Pack approval lifecycle (§4, §9) -----------------------------------

    /// Rescan `ecosystem_root` for new or drifted Packs.
    pub async fn scan_packs(&self) -> Result<Vec<String>, RumiError> {
        let mut approvals = self.approvals.lock().await;
        approvals.scan(&self.ecosystem_root).await.map_err(RumiError::from)
    }

    /// Approve a Pack and start its broker listener pair.
    pub async fn approve_pack(&self, pack_id: &str) -> Result<(), RumiError> {
        {
            let mut approvals = self.approvals.lock().await;
            approvals.approve(pack_id).map_err(RumiError::from)?;
        }
        self.spawn_broker_tasks_for_pack(pack_id.to_string()).await;
        Ok(())
    }

    /// Reject a Pack with `reason`.
    pub async fn reject_pack(&self, pack_id: &str, reason: &str) -> Result<(), RumiError> {
        let mut approvals = self.approvals.lock().await;
        approvals.reject(pack_id, reason).map_err(RumiError::from)
    }

    /// Re-verify an Approved Pack's manifest against its current file tree.
    pub async fn verify_pack(&self, pack_id: &str) -> Result<VerifyResult, RumiError> {
        let mut approvals = self.approvals.lock().await;
        approvals.verify(pack_id).await.map_err(RumiError::from)
    }

    /// Current approval state of `pack_id`, if known.
    pub async fn pack_status(&self, pack_id: &str) -> Option<PackState> {
        self.approvals.lock().await.status(pack_id)
    }

    /// Snapshot of every known Pack.
    pub async fn list_packs(&self) -> Vec<Pack> {
        self.approvals.lock().await.all().cloned().collect()
    }

    // -- Capability candidate lifecycle (§4.6) ------------------------------

    /// Rescan for capability-handler candidates.
    pub async fn scan_capability_candidates(&self) -> Result<Vec<String>, RumiError> {
        self.capability_candidates.lock().await.scan().map_err(RumiError::from)
    }

    /// Approve a capability-handler candidate and reload the live handler
    /// registry so it takes effect immediately.
    pub async fn approve_capability_candidate(&self, key: &str) -> Result<(), RumiError> {
        {
            let mut mgr = self.capability_candidates.lock().await;
            mgr.approve(key).map_err(RumiError::from)?;
        }
        self.capability.reload_handlers().await.map_err(RumiError::from)
    }

    /// Reject a capability-handler candidate with `reason`.
    pub async fn reject_capability_candidate(&self, key: &str, reason: &str) -> Result<(), RumiError> {
        self.capability_candidates.lock().await.reject(key, reason).map_err(RumiError::from)
    }

    /// Clear strikes/cooldown on a blocked capability-handler candidate.
    pub async fn unblock_capability_candidate(&self, key: &str) -> Result<(), RumiError> {
        self.capability_candidates.lock().await.unblock(key).map_err(RumiError::from)
    }

    /// Every tracked capability-handler candidate, with its current state.
    pub async fn list_capability_candidates(
        &self,
    ) -> Vec<(String, rumi_core::CapabilityCandidate, rumi_core::candidate::CandidateState)> {
        self.capability_candidates
            .lock()
            .await
            .all()
            .map(|(key, candidate, state)| (key.clone(), candidate.clone(), state))
            .collect()
    }

    // -- Pip candidate lifecycle ---------------------------------------------

    /// Rescan for pip requirement candidates.
    pub async fn scan_pip_candidates(&self) -> Result<Vec<String>, RumiError> {
        self.pip_candidates.lock().await.scan().map_err(RumiError::from)
    }

    /// Approve a pip requirement candidate.
    pub async fn approve_pip_candidate(&self, key: &str) -> Result<(), RumiError> {
        self.pip_candidates.lock().await.approve(key).map_err(RumiError::from)
    }

    /// Reject a pip requirement candidate with `reason`.
    pub async fn reject_pip_candidate(&self, key: &str, reason: &str) -> Result<(), RumiError> {
        self.pip_candidates.lock().await.reject(key, reason).map_err(RumiError::from)
    }

    /// Clear strikes/cooldown on a blocked pip requirement candidate.
    pub async fn unblock_pip_candidate(&self, key: &str) -> Result<(), RumiError> {
        self.pip_candidates.lock().await.unblock(key).map_err(RumiError::from)
    }

    /// Every tracked pip requirement candidate, with its current state.
    pub async fn list_pip_candidates(
        &self,
    ) -> Vec<(String, rumi_core::PipCandidate, rumi_core::candidate::CandidateState)> {
        self.pip_candidates
            .lock()
            .await
            .all()
            .map(|(key, candidate, state)| (key.clone(), candidate.clone(), state))
            .collect()
    }

    // -- Grants (§4.5, §4.6) --------------------------------------------------

    /// Issue (or replace) a signed network grant for `pack_id`.
    pub fn issue_network_grant(
        &self,
        pack_id: &str,
        allowed_domains: Vec<String>,
        allowed_ports: Vec<u16>,
        granted_by: &str,
    ) -> Result<NetworkGrant, RumiError> {
        self.grants.issue_network_grant(pack_id, allowed_domains, allowed_ports, granted_by).map_err(RumiError::from)
    }

    /// Revoke `pack_id`'s network grant.
    pub fn invalidate_network_grant(&self, pack_id: &str) -> Result<(), RumiError> {
        self.grants.invalidate_network_grant(pack_id).map_err(RumiError::from)
    }

    /// Grant `permission_id` to `principal_id`, independent of candidate
    /// install/trust state.
    pub fn grant_capability(&self, principal_id: &str, permission_id: &str, granted_by: &str) -> Result<(), RumiError> {
        self.grants.grant_capability(principal_id, permission_id, granted_by).map_err(RumiError::from)
    }

    // -- SharedDict (§4.7) ----------------------------------------------------

    /// Propose a `(namespace, token) -> value` rule.
    pub async fn shared_dict_propose(
        &self,
        namespace: &str,
        token: &str,
        value: &str,
        provenance: &str,
    ) -> Result<(), RumiError> {
        self.dict.lock().await.propose(namespace, token, value, provenance).map_err(RumiError::from)
    }

    /// Resolve a token, following its chain to a terminal value.
    pub async fn shared_dict_resolve(&self, namespace: &str, token: &str) -> Result<ResolveResult, RumiError> {
        self.dict.lock().await.resolve(namespace, token).map_err(RumiError::from)
    }

    /// Explain the resolution chain for `token` without resolving it.
    pub async fn shared_dict_explain(&self, namespace: &str, token: &str) -> Vec<String> {
        self.dict.lock().await.explain(namespace, token)
    }

    /// List every rule currently bound under `namespace`.
    pub async fn shared_dict_list(&self, namespace: &str) -> Vec<SharedDictRule> {
        self.dict.lock().await.list(namespace).into_iter().cloned().collect()
    }

    /// Remove a `(namespace, token)` rule.
    pub async fn shared_dict_remove(&self, namespace: &str, token: &str) -> Result<(), RumiError> {
        self.dict.lock().await.remove(namespace, token).map_err(RumiError::from)
    }

    // -- Flows (§4.1, §4.2) ---------------------------------------------------

    /// Compose and return every reachable Flow, keyed by `flow_id`.
    pub async fn list_flows(&self) -> BTreeMap<String, Flow> {
        let approvals = self.approvals.lock().await;
        let dict = self.dict.lock().await;
        let loader = FlowLoader::new(
            &self.flows_dir,
            &self.user_data_root,
            &self.ecosystem_root,
            self.interfaces.clone(),
            &approvals,
            &dict,
            &self.audit,
        );
        loader.load_all().await
    }

    /// Compose and run `flow_id` against `inputs`, honoring `cancel`.
    pub async fn run_flow(
        &self,
        flow_id: &str,
        inputs: Value,
        cancel: CancellationToken,
    ) -> Result<ExecutionOutcome, RumiError> {
        let flow = {
            let approvals = self.approvals.lock().await;
            let dict = self.dict.lock().await;
            let loader = FlowLoader::new(
                &self.flows_dir,
                &self.user_data_root,
                &self.ecosystem_root,
                self.interfaces.clone(),
                &approvals,
                &dict,
                &self.audit,
            );
            loader.load_one(flow_id).await.map_err(RumiError::from)?
        };
        self.executor.execute(&flow, inputs, cancel).await.map_err(RumiError::from)
    }

    // -- Audit (§4.8) ---------------------------------------------------------

    /// The most recent `limit` audit entries across every category.
    pub async fn audit_tail(&self, limit: usize) -> Result<Vec<rumi_core::AuditEntry>, RumiError> {
        self.audit.tail(limit).await.map_err(RumiError::from)
    }

    /// Borrow the shared `AuditLog` directly, for callers that need
    /// category/date-scoped reads.
    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }
}
