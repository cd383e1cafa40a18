//! Failover client for the CubeFS master (control-plane) HTTP API.
//!
//! A call is tried against each master in list order:
//!
//! * a transport or parse failure is logged and the next master is tried;
//! * code `0` is success;
//! * a non-zero code matching one of the operation's [`NoOpRule`]s is an
//!   idempotent success (e.g. "duplicate vol" on create);
//! * any other non-zero code ends the call immediately.  A master that is
//!   reachable and answers with a semantic error is taken as authoritative,
//!   so the remaining masters are not consulted.
//!
//! When every master fails at the transport layer the call fails with
//! [`CsiError::Unavailable`] naming the last cause.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::descriptor::VolumeDescriptor;
use crate::error::CsiError;

/// Code returned by `/vol/delete` when the volume does not exist.
pub const ERR_CODE_VOL_NOT_EXISTS: i64 = 7;
/// Message fragment returned by `/admin/createVol` for an existing volume.
pub const ERR_MSG_DUPLICATE_VOL: &str = "duplicate vol";

/// Envelope of every master response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MasterResponse {
    pub code: i64,
    #[serde(default)]
    pub msg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// A single GET against the master API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterRequest {
    pub path: &'static str,
    pub query: Vec<(&'static str, String)>,
}

impl MasterRequest {
    pub fn create_volume(desc: &VolumeDescriptor, capacity_gib: u64) -> Self {
        Self {
            path: "/admin/createVol",
            query: vec![
                ("name", desc.name.clone()),
                ("capacity", capacity_gib.to_string()),
                ("owner", desc.owner.clone()),
                ("volType", desc.vol_type.clone()),
            ],
        }
    }

    pub fn delete_volume(desc: &VolumeDescriptor) -> Self {
        Self {
            path: "/vol/delete",
            query: vec![("name", desc.name.clone()), ("authKey", desc.auth_key())],
        }
    }
}

/// Control-plane operations issued by this driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    CreateVolume,
    DeleteVolume,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::CreateVolume => "CreateVolume",
            Self::DeleteVolume => "DeleteVolume",
        })
    }
}

/// Non-zero response that still means the goal state holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoOpRule {
    Code(i64),
    MessageContains(String),
}

impl NoOpRule {
    fn matches(&self, resp: &MasterResponse) -> bool {
        match self {
            Self::Code(code) => resp.code == *code,
            Self::MessageContains(fragment) => resp.msg.contains(fragment.as_str()),
        }
    }
}

/// Which non-zero responses count as idempotent success, per operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailoverPolicy {
    pub create: Vec<NoOpRule>,
    pub delete: Vec<NoOpRule>,
}

impl Default for FailoverPolicy {
    fn default() -> Self {
        Self {
            create: vec![NoOpRule::MessageContains(ERR_MSG_DUPLICATE_VOL.to_owned())],
            delete: vec![NoOpRule::Code(ERR_CODE_VOL_NOT_EXISTS)],
        }
    }
}

impl FailoverPolicy {
    pub fn rules(&self, op: Operation) -> &[NoOpRule] {
        match op {
            Operation::CreateVolume => &self.create,
            Operation::DeleteVolume => &self.delete,
        }
    }

    fn is_no_op(&self, op: Operation, resp: &MasterResponse) -> bool {
        self.rules(op).iter().any(|rule| rule.matches(resp))
    }
}

/// Successful outcome of a failover call.  Failures are the `Err` arm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MasterOutcome {
    Success,
    /// The goal state already held; carries the master's message.
    IdempotentNoOp(String),
}

/// Sends one request to one master.  Every `Err` is treated as a transport
/// failure and moves on to the next master.
#[async_trait]
pub trait MasterTransport: Send + Sync {
    async fn get(&self, endpoint: &str, req: &MasterRequest) -> Result<MasterResponse, CsiError>;
}

/// Plain-HTTP transport backed by `reqwest`.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self, CsiError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(CsiError::internal)?;
        Ok(Self { client })
    }
}

#[async_trait]
impl MasterTransport for HttpTransport {
    async fn get(&self, endpoint: &str, req: &MasterRequest) -> Result<MasterResponse, CsiError> {
        let url = if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            format!("{endpoint}{}", req.path)
        } else {
            format!("http://{endpoint}{}", req.path)
        };
        debug!(%url, query = ?req.query, "master request");

        let resp = self
            .client
            .get(&url)
            .query(&req.query)
            .send()
            .await
            .map_err(|e| CsiError::Unavailable(format!("request {url} failed: {e}")))?;
        let body = resp
            .bytes()
            .await
            .map_err(|e| CsiError::Unavailable(format!("read body of {url}: {e}")))?;
        serde_json::from_slice(&body).map_err(|e| {
            CsiError::Unavailable(format!(
                "unmarshal body of {url} ({} bytes): {e}",
                body.len()
            ))
        })
    }
}

/// Issues control-plane operations against an ordered master list.
pub struct MasterClient {
    transport: Arc<dyn MasterTransport>,
    policy: FailoverPolicy,
}

impl MasterClient {
    pub fn new(transport: Arc<dyn MasterTransport>, policy: FailoverPolicy) -> Self {
        Self { transport, policy }
    }

    pub async fn create_volume(
        &self,
        desc: &VolumeDescriptor,
        capacity_gib: u64,
    ) -> Result<MasterOutcome, CsiError> {
        let req = MasterRequest::create_volume(desc, capacity_gib);
        self.call(Operation::CreateVolume, &desc.master_addrs, &req).await
    }

    pub async fn delete_volume(&self, desc: &VolumeDescriptor) -> Result<MasterOutcome, CsiError> {
        let req = MasterRequest::delete_volume(desc);
        self.call(Operation::DeleteVolume, &desc.master_addrs, &req).await
    }

    async fn call(
        &self,
        op: Operation,
        endpoints: &[String],
        req: &MasterRequest,
    ) -> Result<MasterOutcome, CsiError> {
        let transport = &self.transport;
        failover(op, endpoints, &self.policy, |endpoint| async move {
            transport.get(endpoint, req).await
        })
        .await
    }
}

/// Try `send` against each endpoint in order, applying `policy` to the
/// responses.
pub async fn failover<'a, F, Fut>(
    op: Operation,
    endpoints: &'a [String],
    policy: &FailoverPolicy,
    mut send: F,
) -> Result<MasterOutcome, CsiError>
where
    F: FnMut(&'a str) -> Fut,
    Fut: Future<Output = Result<MasterResponse, CsiError>>,
{
    let mut last_err = None;

    for endpoint in endpoints {
        let resp = match send(endpoint.as_str()).await {
            Ok(resp) => resp,
            Err(e) => {
                warn!(stage = %op, addr = %endpoint, error = %e, "try master addr failed");
                last_err = Some(e);
                continue;
            }
        };

        if resp.code == 0 {
            debug!(stage = %op, addr = %endpoint, "master call succeeded");
            return Ok(MasterOutcome::Success);
        }
        if policy.is_no_op(op, &resp) {
            info!(
                stage = %op,
                addr = %endpoint,
                code = resp.code,
                msg = %resp.msg,
                "goal state already holds on master, treating as success",
            );
            return Ok(MasterOutcome::IdempotentNoOp(resp.msg));
        }
        return Err(CsiError::MasterRejected {
            operation: op.to_string(),
            endpoint: endpoint.clone(),
            code: resp.code,
            msg: resp.msg,
        });
    }

    match last_err {
        Some(e) => {
            error!(stage = %op, error = %e, "failed with all masters");
            Err(CsiError::Unavailable(format!(
                "{op} failed with all endpoints, last error: {e}"
            )))
        }
        None => Err(CsiError::InvalidArgument(format!(
            "{op}: no master endpoints configured"
        ))),
    }
}
