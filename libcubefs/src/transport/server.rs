//! QUIC server that dispatches incoming CSI requests to the trait
//! implementations enabled by the [`ServiceMode`].

use std::net::SocketAddr;
use std::sync::Arc;

use quinn::crypto::rustls::QuicServerConfig;
use tracing::{debug, error, info, instrument, warn};

use super::MAX_MESSAGE_BYTES;
use crate::config::ServiceMode;
use crate::controller::CsiController;
use crate::error::CsiError;
use crate::identity::CsiIdentity;
use crate::message::CsiMessage;
use crate::node::CsiNode;

/// A CSI server that accepts QUIC connections and dispatches
/// [`CsiMessage`] requests to a [`CsiIdentity`] + [`CsiController`] +
/// [`CsiNode`] implementation.
pub struct CsiServer<T> {
    endpoint: quinn::Endpoint,
    handler: Arc<T>,
    mode: ServiceMode,
}

impl<T> CsiServer<T>
where
    T: CsiIdentity + CsiController + CsiNode + 'static,
{
    /// Create a new server bound to `addr`.
    pub fn new(
        addr: SocketAddr,
        tls_config: rustls::ServerConfig,
        handler: Arc<T>,
        mode: ServiceMode,
    ) -> Result<Self, CsiError> {
        let quic_server_config = QuicServerConfig::try_from(tls_config)
            .map_err(|e| CsiError::InvalidArgument(format!("invalid TLS config: {e}")))?;
        let server_config = quinn::ServerConfig::with_crypto(Arc::new(quic_server_config));
        let endpoint = quinn::Endpoint::server(server_config, addr)
            .map_err(|e| CsiError::Internal(format!("bind {addr}: {e}")))?;
        info!(%addr, %mode, "CSI QUIC server listening");
        Ok(Self {
            endpoint,
            handler,
            mode,
        })
    }

    /// Accept connections in a loop until the endpoint is closed.
    ///
    /// Each accepted connection spawns a Tokio task, and each bi-stream
    /// within a connection is handled concurrently.
    pub async fn serve(&self) -> Result<(), CsiError> {
        while let Some(incoming) = self.endpoint.accept().await {
            let handler = Arc::clone(&self.handler);
            let mode = self.mode;
            tokio::spawn(async move {
                match incoming.await {
                    Ok(conn) => {
                        let remote = conn.remote_address();
                        debug!(%remote, "CSI connection accepted");
                        if let Err(e) = Self::handle_connection(conn, handler, mode).await {
                            warn!(%remote, error = %e, "CSI connection error");
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "CSI incoming connection failed");
                    }
                }
            });
        }
        Ok(())
    }

    async fn handle_connection(
        conn: quinn::Connection,
        handler: Arc<T>,
        mode: ServiceMode,
    ) -> Result<(), CsiError> {
        loop {
            let (send, recv) = match conn.accept_bi().await {
                Ok(stream) => stream,
                Err(quinn::ConnectionError::ApplicationClosed(_)) => return Ok(()),
                Err(e) => return Err(CsiError::unavailable(e)),
            };

            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                if let Err(e) = Self::handle_stream(send, recv, &handler, mode).await {
                    error!(error = %e, "CSI stream handler error");
                }
            });
        }
    }

    /// Process a single bi-stream: read request → dispatch → write response.
    #[instrument(skip_all)]
    async fn handle_stream(
        mut send: quinn::SendStream,
        mut recv: quinn::RecvStream,
        handler: &T,
        mode: ServiceMode,
    ) -> Result<(), CsiError> {
        let buf = recv
            .read_to_end(MAX_MESSAGE_BYTES)
            .await
            .map_err(CsiError::unavailable)?;

        let response = match serde_json::from_slice::<CsiMessage>(&buf) {
            Ok(request) => {
                debug!(%request, "CSI request received");
                dispatch(handler, mode, request).await
            }
            Err(e) => CsiMessage::Error(CsiError::InvalidArgument(format!(
                "malformed request: {e}"
            ))),
        };

        let payload = serde_json::to_vec(&response).map_err(CsiError::internal)?;
        send.write_all(&payload)
            .await
            .map_err(CsiError::unavailable)?;
        send.finish().map_err(CsiError::unavailable)?;
        Ok(())
    }

    /// Return a reference to the underlying QUIC endpoint, useful for
    /// obtaining the local address or shutting down.
    pub fn endpoint(&self) -> &quinn::Endpoint {
        &self.endpoint
    }
}

fn reply<V>(method: &str, res: Result<V, CsiError>, wrap: impl FnOnce(V) -> CsiMessage) -> CsiMessage {
    match res {
        Ok(v) => wrap(v),
        Err(e) => {
            let code = e.code();
            if code.is_server_fault() {
                error!(method, %code, error = %e, "CSI call failed");
            } else {
                warn!(method, %code, error = %e, "CSI call rejected");
            }
            CsiMessage::Error(e)
        }
    }
}

/// Map a request to the trait method serving it and wrap the result in a
/// response.  Requests for a service not enabled by `mode`, and methods the
/// driver does not provide, are answered with [`CsiError::Unimplemented`].
pub async fn dispatch<T>(handler: &T, mode: ServiceMode, request: CsiMessage) -> CsiMessage
where
    T: CsiIdentity + CsiController + CsiNode,
{
    use CsiMessage as M;

    let method = request.to_string();
    let is_controller = matches!(
        request,
        M::CreateVolume(_)
            | M::DeleteVolume(_)
            | M::ListVolumes
            | M::GetCapacity
            | M::ValidateVolumeCapabilities { .. }
            | M::ControllerGetCapabilities
    ) || matches!(request, M::Unsupported(m) if !m.is_node());
    let is_node = matches!(
        request,
        M::StageVolume(_)
            | M::UnstageVolume { .. }
            | M::PublishVolume(_)
            | M::UnpublishVolume { .. }
            | M::GetNodeInfo
            | M::NodeGetCapabilities
    ) || matches!(request, M::Unsupported(m) if m.is_node());

    if (is_controller && !mode.serves_controller()) || (is_node && !mode.serves_node()) {
        debug!(%method, %mode, "service not enabled in this mode");
        return M::Error(CsiError::Unimplemented(format!("{method} in {mode} mode")));
    }

    match request {
        // --- Identity -------------------------------------------------------
        M::Probe => reply("Probe", handler.probe().await, M::ProbeResult),
        M::GetPluginInfo => reply("GetPluginInfo", handler.get_plugin_info().await, M::PluginInfoResponse),
        M::GetPluginCapabilities => reply(
            "GetPluginCapabilities",
            handler.get_plugin_capabilities().await,
            M::PluginCapabilitiesResponse,
        ),

        // --- Controller -----------------------------------------------------
        M::CreateVolume(req) => reply("CreateVolume", handler.create_volume(req).await, M::VolumeCreated),
        M::DeleteVolume(req) => reply("DeleteVolume", handler.delete_volume(req).await, |()| M::Ok),
        M::ListVolumes => reply("ListVolumes", handler.list_volumes().await, M::VolumeList),
        M::GetCapacity => reply("GetCapacity", handler.get_capacity().await, M::Capacity),
        M::ValidateVolumeCapabilities {
            volume_id,
            capabilities,
        } => reply(
            "ValidateVolumeCapabilities",
            handler
                .validate_volume_capabilities(&volume_id, &capabilities)
                .await,
            M::CapabilitiesValid,
        ),
        M::ControllerGetCapabilities => reply(
            "ControllerGetCapabilities",
            CsiController::get_capabilities(handler).await,
            M::ControllerCapabilitiesResponse,
        ),

        // --- Node -----------------------------------------------------------
        M::StageVolume(req) => reply("NodeStageVolume", handler.stage_volume(req).await, |()| M::Ok),
        M::UnstageVolume {
            volume_id,
            staging_target_path,
        } => reply(
            "NodeUnstageVolume",
            handler
                .unstage_volume(&volume_id, &staging_target_path)
                .await,
            |()| M::Ok,
        ),
        M::PublishVolume(req) => reply("NodePublishVolume", handler.publish_volume(req).await, |()| M::Ok),
        M::UnpublishVolume {
            volume_id,
            target_path,
        } => reply(
            "NodeUnpublishVolume",
            handler.unpublish_volume(&volume_id, &target_path).await,
            |()| M::Ok,
        ),
        M::GetNodeInfo => reply("NodeGetInfo", handler.get_info().await, M::NodeInfoResponse),
        M::NodeGetCapabilities => reply(
            "NodeGetCapabilities",
            CsiNode::get_capabilities(handler).await,
            M::NodeCapabilitiesResponse,
        ),

        M::Unsupported(m) => {
            debug!(method = %m, "unsupported CSI method called");
            M::Error(CsiError::unimplemented(&m.to_string()))
        }

        // --- Response variants should never arrive as requests --------------
        other => {
            warn!(msg = %other, "unexpected message variant received as request");
            M::Error(CsiError::InvalidArgument(format!("unexpected message: {other}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::message::UnsupportedMethod;
    use crate::types::*;

    struct Stub;

    #[async_trait]
    impl CsiIdentity for Stub {
        async fn get_plugin_info(&self) -> Result<PluginInfo, CsiError> {
            Ok(PluginInfo {
                name: "csi.cubefs.com".into(),
                vendor_version: "test".into(),
            })
        }
        async fn probe(&self) -> Result<bool, CsiError> {
            Ok(true)
        }
        async fn get_plugin_capabilities(&self) -> Result<Vec<PluginCapability>, CsiError> {
            Ok(vec![PluginCapability::ControllerService])
        }
    }

    #[async_trait]
    impl CsiController for Stub {
        async fn create_volume(&self, req: CreateVolumeRequest) -> Result<Volume, CsiError> {
            Ok(Volume {
                volume_id: VolumeId(req.name),
                capacity_bytes: 0,
                volume_context: Default::default(),
            })
        }
        async fn delete_volume(&self, _req: DeleteVolumeRequest) -> Result<(), CsiError> {
            Err(CsiError::Unknown("master said no".into()))
        }
        async fn get_capabilities(&self) -> Result<Vec<ControllerCapability>, CsiError> {
            Ok(vec![ControllerCapability::CreateDeleteVolume])
        }
    }

    #[async_trait]
    impl CsiNode for Stub {
        async fn stage_volume(&self, _req: NodeStageVolumeRequest) -> Result<(), CsiError> {
            Ok(())
        }
        async fn unstage_volume(&self, _id: &VolumeId, _path: &str) -> Result<(), CsiError> {
            Ok(())
        }
        async fn publish_volume(&self, _req: NodePublishVolumeRequest) -> Result<(), CsiError> {
            Err(CsiError::NotFound("staging path".into()))
        }
        async fn unpublish_volume(&self, _id: &VolumeId, _path: &str) -> Result<(), CsiError> {
            Ok(())
        }
        async fn get_info(&self) -> Result<NodeInfo, CsiError> {
            Ok(NodeInfo {
                node_id: "node-1".into(),
                max_volumes: 0,
            })
        }
        async fn get_capabilities(&self) -> Result<Vec<NodeCapability>, CsiError> {
            Ok(vec![NodeCapability::StageUnstageVolume])
        }
    }

    fn create(name: &str) -> CsiMessage {
        CsiMessage::CreateVolume(CreateVolumeRequest {
            name: name.into(),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn routes_requests_to_services() {
        let resp = dispatch(&Stub, ServiceMode::All, create("vol1")).await;
        assert!(matches!(resp, CsiMessage::VolumeCreated(v) if v.volume_id.as_str() == "vol1"));

        let resp = dispatch(&Stub, ServiceMode::All, CsiMessage::NodeGetCapabilities).await;
        assert!(matches!(
            resp,
            CsiMessage::NodeCapabilitiesResponse(caps) if caps == [NodeCapability::StageUnstageVolume]
        ));

        let resp = dispatch(&Stub, ServiceMode::All, CsiMessage::ControllerGetCapabilities).await;
        assert!(matches!(
            resp,
            CsiMessage::ControllerCapabilitiesResponse(caps)
                if caps == [ControllerCapability::CreateDeleteVolume]
        ));
    }

    #[tokio::test]
    async fn errors_are_returned_not_raised() {
        let publish = CsiMessage::PublishVolume(NodePublishVolumeRequest {
            volume_id: "vol1".into(),
            staging_target_path: "/stage/vol1".into(),
            target_path: "/target/pod1".into(),
            volume_capability: None,
            read_only: false,
        });
        let resp = dispatch(&Stub, ServiceMode::All, publish).await;
        assert!(matches!(resp, CsiMessage::Error(CsiError::NotFound(_))));
    }

    #[tokio::test]
    async fn unsupported_methods_are_unimplemented() {
        for msg in [
            CsiMessage::ListVolumes,
            CsiMessage::GetCapacity,
            CsiMessage::Unsupported(UnsupportedMethod::CreateSnapshot),
            CsiMessage::Unsupported(UnsupportedMethod::NodeGetVolumeStats),
        ] {
            let resp = dispatch(&Stub, ServiceMode::All, msg).await;
            assert!(
                matches!(resp, CsiMessage::Error(CsiError::Unimplemented(_))),
                "{resp}"
            );
        }
    }

    #[tokio::test]
    async fn mode_gates_services() {
        let resp = dispatch(&Stub, ServiceMode::Node, create("vol1")).await;
        assert!(matches!(resp, CsiMessage::Error(CsiError::Unimplemented(_))));

        let resp = dispatch(&Stub, ServiceMode::Controller, CsiMessage::GetNodeInfo).await;
        assert!(matches!(resp, CsiMessage::Error(CsiError::Unimplemented(_))));

        // Identity is served in every mode.
        let resp = dispatch(&Stub, ServiceMode::Node, CsiMessage::Probe).await;
        assert!(matches!(resp, CsiMessage::ProbeResult(true)));
    }

    #[tokio::test]
    async fn responses_are_rejected_as_requests() {
        let resp = dispatch(&Stub, ServiceMode::All, CsiMessage::Ok).await;
        assert!(matches!(resp, CsiMessage::Error(CsiError::InvalidArgument(_))));
    }
}
