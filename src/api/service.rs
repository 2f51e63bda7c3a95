//! Signing orchestrator
//!
//! Every request moves `Unauthenticated -> Authenticated -> PolicyChecked`
//! and ends in exactly one terminal state. A signature is produced only on
//! the transition into `Signed`; every terminal transition appends one audit
//! entry. The liveness probe is the only call that skips both.

use crate::api::auth::{AuthTier, AuthVerifier};
use crate::api::request::{operation_name, Approval, InboundRequest, Operation};
use crate::audit::{trace_entry, AuditEntry, AuditSink, JsonlAuditLog, Outcome};
use crate::config::Config;
use crate::crypto::parse_address;
use crate::errors::{ProxyError, Refusal, Result};
use crate::keystore::KeyCustodian;
use crate::policy::{
    authorization_context, message_context, transaction_context, EvaluationContext,
    PolicyEngine, PolicyStore, SigningMethod, Verdict,
};
use crate::signer::{Authorization, Quantity, TransactionRequest};
use chrono::Utc;
use secrecy::SecretString;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Transport-neutral reply
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProxyResponse {
    pub status: u16,
    pub body: Value,
}

impl ProxyResponse {
    fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }

    fn refused(err: &ProxyError) -> Self {
        let refusal = Refusal::from(err);
        let status = refusal.status;
        let body = serde_json::to_value(&refusal)
            .unwrap_or_else(|_| json!({ "error": err.tag() }));
        Self { status, body }
    }

    pub fn is_success(&self) -> bool {
        self.status == 200
    }
}

/// What the audit entry needs to know about a request in flight
#[derive(Default)]
struct Trail {
    tier: Option<AuthTier>,
    wallet: Option<String>,
    verdict: Option<Verdict>,
}

/// The policy-gated signing service
pub struct SigningProxy {
    auth: AuthVerifier,
    custodian: Arc<KeyCustodian>,
    policies: Arc<PolicyStore>,
    engine: PolicyEngine,
    audit: Option<Arc<dyn AuditSink>>,
    default_chain_id: u64,
}

impl SigningProxy {
    pub fn new(
        auth: AuthVerifier,
        custodian: Arc<KeyCustodian>,
        policies: Arc<PolicyStore>,
        default_chain_id: u64,
    ) -> Self {
        Self {
            auth,
            custodian,
            policies,
            engine: PolicyEngine::new(),
            audit: None,
            default_chain_id,
        }
    }

    /// Wire up every component from configuration and the three secrets
    pub fn from_config(
        config: &Config,
        keystore_password: SecretString,
        operational_secret: SecretString,
        admin_secret: Option<SecretString>,
    ) -> Result<Self> {
        let auth = AuthVerifier::from_config(&config.auth, operational_secret, admin_secret);
        let custodian = Arc::new(KeyCustodian::from_config(config, keystore_password)?);
        let policies = Arc::new(PolicyStore::open(&config.storage.policy_path)?);

        let mut proxy = Self::new(auth, custodian, policies, config.signing.default_chain_id);
        if let Some(path) = &config.storage.audit_path {
            proxy = proxy.with_audit_sink(Arc::new(JsonlAuditLog::open(path)?));
        }
        Ok(proxy)
    }

    /// Persist audit entries to `sink` in addition to the `audit` trace target
    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    pub fn custodian(&self) -> &Arc<KeyCustodian> {
        &self.custodian
    }

    pub fn policies(&self) -> &Arc<PolicyStore> {
        &self.policies
    }

    /// Handle one request to completion
    pub fn handle(&self, request: &InboundRequest) -> ProxyResponse {
        let operation = Operation::decode(&request.method, &request.path, &request.body);
        if let Ok(Operation::Health) = operation {
            return ProxyResponse::ok(json!({ "status": "ok" }));
        }

        let name = match &operation {
            Ok(op) => op.name().to_string(),
            Err(_) => operation_name(&request.path),
        };
        let signing = matches!(&operation, Ok(op) if op.signing_method().is_some());

        let mut trail = Trail::default();
        let result = self.process(request, operation, &mut trail);

        let (entry, response) = match result {
            Ok(body) => {
                let outcome = if signing {
                    Outcome::Signed
                } else {
                    Outcome::Completed
                };
                info!("{} {} -> {:?}", request.method, request.path, outcome);
                let verdict = trail.verdict.as_ref();
                let entry = AuditEntry::new(&request.method, &name, &request.path, outcome)
                    .with_decision(
                        verdict.and_then(|v| v.allowed_by.as_deref()),
                        verdict.and_then(|v| v.policy_id.as_deref()),
                    );
                (entry, ProxyResponse::ok(body))
            }
            Err(err) => {
                if err.status_code() >= 500 {
                    error!("{} {} failed: {}", request.method, request.path, err);
                } else {
                    info!("{} {} refused: {}", request.method, request.path, err.tag());
                }
                (
                    AuditEntry::refused(&request.method, &name, &request.path, &err),
                    ProxyResponse::refused(&err),
                )
            }
        };

        self.record(
            entry
                .with_tier(trail.tier)
                .with_origin(request.origin.as_deref())
                .with_wallet(trail.wallet.as_deref()),
        );
        response
    }

    fn record(&self, entry: AuditEntry) {
        trace_entry(&entry);
        if let Some(sink) = &self.audit {
            if let Err(e) = sink.record(&entry) {
                error!("Failed to append audit entry {}: {}", entry.id, e);
            }
        }
    }

    fn process(
        &self,
        request: &InboundRequest,
        operation: Result<Operation>,
        trail: &mut Trail,
    ) -> Result<Value> {
        let tier = self.auth.verify(
            &request.method,
            &request.path,
            &request.body,
            request.timestamp.as_deref(),
            request.signature.as_deref(),
        )?;
        trail.tier = Some(tier);

        let operation = operation?;
        if operation.is_admin() {
            self.auth.require_admin(tier)?;
        }

        match operation {
            Operation::Health => Ok(json!({ "status": "ok" })),
            Operation::CreateWallet => {
                let address = self.custodian.create_account()?;
                trail.wallet = Some(address.clone());
                Ok(json!({ "address": address }))
            }
            Operation::HasWallet => Ok(json!({ "hasWallet": self.custodian.has_account() })),
            Operation::GetAddress => {
                let address = self.custodian.get_address()?;
                trail.wallet = Some(address.clone());
                Ok(json!({ "address": address }))
            }
            Operation::SignMessage { message } => {
                self.sign_message(&message, request.approval, trail)
            }
            Operation::SignTransaction { tx, abi } => {
                self.sign_transaction(&tx, abi.as_ref(), request.approval, trail)
            }
            Operation::SignAuthorization {
                address,
                chain_id,
                nonce,
            } => self.sign_authorization(&address, chain_id, nonce, request.approval, trail),
            Operation::ListPolicies => Ok(serde_json::to_value(self.policies.list()?)?),
            Operation::CreatePolicy(draft) => Ok(serde_json::to_value(self.policies.create(draft)?)?),
            Operation::GetPolicy(id) => Ok(serde_json::to_value(self.policies.get(&id)?)?),
            Operation::UpdatePolicy { id, draft } => {
                Ok(serde_json::to_value(self.policies.update(&id, draft)?)?)
            }
            Operation::DeletePolicy(id) => {
                self.policies.delete(&id)?;
                Ok(json!({ "deleted": id }))
            }
            Operation::ListBindings(wallet) => {
                trail.wallet = Some(wallet.clone());
                Ok(json!({ "wallet": wallet, "bindings": self.policies.bindings(&wallet)? }))
            }
            Operation::AttachPolicy { wallet, policy_id } => {
                trail.wallet = Some(wallet.clone());
                let bindings = self.policies.attach(&wallet, &policy_id)?;
                Ok(json!({ "wallet": wallet, "bindings": bindings }))
            }
            Operation::DetachPolicy { wallet, policy_id } => {
                trail.wallet = Some(wallet.clone());
                self.policies.detach(&wallet, &policy_id)?;
                Ok(json!({ "wallet": wallet, "detached": policy_id }))
            }
        }
    }

    fn sign_message(&self, message: &str, approval: Approval, trail: &mut Trail) -> Result<Value> {
        let address = self.wallet(trail)?;
        let ctx = message_context(message, Utc::now());
        self.authorize(&address, SigningMethod::SignMessage, &ctx, approval, trail)?;

        let signature = self.custodian.sign_message(message.as_bytes())?;
        Ok(json!({ "signature": signature.to_hex(), "address": address }))
    }

    fn sign_transaction(
        &self,
        tx: &TransactionRequest,
        abi: Option<&Value>,
        approval: Approval,
        trail: &mut Trail,
    ) -> Result<Value> {
        let address = self.wallet(trail)?;
        let typed = tx.build()?;
        let ctx = transaction_context(tx, abi, Utc::now())?;
        self.authorize(&address, SigningMethod::SignTransaction, &ctx, approval, trail)?;

        let signed = self.custodian.sign_transaction(typed)?;
        Ok(json!({
            "signedTransaction": signed.signed_transaction,
            "hash": signed.hash,
            "address": address,
        }))
    }

    fn sign_authorization(
        &self,
        target: &str,
        chain_id: Option<Quantity>,
        nonce: Option<Quantity>,
        approval: Approval,
        trail: &mut Trail,
    ) -> Result<Value> {
        let address = self.wallet(trail)?;
        let target = parse_address(target.trim())?;
        let chain_id = match chain_id {
            Some(chain_id) => chain_id.to_u64()?,
            None => self.default_chain_id,
        };
        let nonce = match nonce {
            Some(nonce) => nonce.to_u64()?,
            None => 0,
        };

        let authorization = Authorization::new(chain_id, target, nonce);
        let ctx = authorization_context(&authorization, Utc::now());
        self.authorize(&address, SigningMethod::SignAuthorization, &ctx, approval, trail)?;

        let signed = self.custodian.sign_authorization(authorization)?;
        Ok(json!({ "signedAuthorization": signed, "address": address }))
    }

    /// Address of the provisioned wallet, noted for the audit entry
    fn wallet(&self, trail: &mut Trail) -> Result<String> {
        let address = self.custodian.get_address()?;
        trail.wallet = Some(address.clone());
        Ok(address)
    }

    /// Policy check followed by the external approval verdict
    fn authorize(
        &self,
        address: &str,
        method: SigningMethod,
        ctx: &EvaluationContext,
        approval: Approval,
        trail: &mut Trail,
    ) -> Result<()> {
        let policies = self.policies.policies_for(address)?;
        let verdict = self.engine.evaluate(&policies, method, ctx);
        debug!("{} for {}: {}", method, address, verdict.reason);

        if !verdict.allowed {
            return Err(ProxyError::PolicyDenied {
                reason: verdict.reason,
                rule: verdict.denied_by,
                policy_id: verdict.policy_id,
            });
        }

        if let Err(e) = approval.check() {
            warn!("{} for {} allowed by policy but {}", method, address, e);
            return Err(e);
        }

        trail.verdict = Some(verdict);
        Ok(())
    }
}
