//! CSI protocol messages transmitted over QUIC.
//!
//! [`CsiMessage`] is the top-level envelope for all request and response
//! variants exchanged between the CSI client (RKS side) and the controller
//! server via QUIC bi-directional streams.  [`dispatch`] maps a request onto
//! the [`CsiIdentity`] and [`CsiController`] services.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::controller::CsiController;
use crate::error::CsiError;
use crate::identity::CsiIdentity;
use crate::serializer::CallContext;
use crate::types::*;

/// Top-level message envelope for CSI over QUIC.
///
/// Each QUIC bi-stream carries exactly one request followed by one response.
/// The client sends a *request* variant and the server replies with the
/// corresponding *response* variant (or [`CsiMessage::Error`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CsiMessage {
    // ----- Requests --------------------------------------------------------
    CreateVolume(CreateVolumeRequest),
    DeleteVolume(DeleteVolumeRequest),
    ControllerPublishVolume(ControllerPublishVolumeRequest),
    ControllerUnpublishVolume(ControllerUnpublishVolumeRequest),
    ValidateVolumeCapabilities(ValidateVolumeCapabilitiesRequest),
    ListVolumes(ListVolumesRequest),
    GetCapacity(GetCapacityRequest),
    ControllerGetCapabilities,

    Probe,
    GetPluginInfo,
    GetPluginCapabilities,

    // ----- Responses -------------------------------------------------------
    VolumeCreated(Volume),
    /// Publish context for the node plugin.
    Published(HashMap<String, String>),
    Validation(ValidationResult),
    VolumeList(ListVolumesResponse),
    /// Available capacity in bytes.
    Capacity(u64),
    ControllerCapabilitiesResponse(Vec<ControllerCapability>),
    PluginInfoResponse(PluginInfo),
    PluginCapabilitiesResponse(Vec<PluginCapability>),

    /// Generic success acknowledgement (no payload).
    Ok,
    ProbeResult(bool),
    Error(CsiError),
}

impl CsiMessage {
    /// Whether this variant is sent by clients.
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            Self::CreateVolume(_)
                | Self::DeleteVolume(_)
                | Self::ControllerPublishVolume(_)
                | Self::ControllerUnpublishVolume(_)
                | Self::ValidateVolumeCapabilities(_)
                | Self::ListVolumes(_)
                | Self::GetCapacity(_)
                | Self::ControllerGetCapabilities
                | Self::Probe
                | Self::GetPluginInfo
                | Self::GetPluginCapabilities
        )
    }
}

// Secrets never appear here; requests are rendered by their identifiers only.
impl std::fmt::Display for CsiMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CreateVolume(req) => write!(f, "CreateVolume(name={})", req.name),
            Self::DeleteVolume(req) => write!(f, "DeleteVolume({})", req.volume_id),
            Self::ControllerPublishVolume(req) => write!(
                f,
                "ControllerPublishVolume({}, node={})",
                req.volume_id, req.node_id
            ),
            Self::ControllerUnpublishVolume(req) => match &req.node_id {
                Some(node) => write!(f, "ControllerUnpublishVolume({}, node={node})", req.volume_id),
                None => write!(f, "ControllerUnpublishVolume({}, all nodes)", req.volume_id),
            },
            Self::ValidateVolumeCapabilities(req) => {
                write!(f, "ValidateVolumeCapabilities({})", req.volume_id)
            }
            Self::ListVolumes(req) => write!(f, "ListVolumes(max={})", req.max_entries),
            Self::GetCapacity(_) => f.write_str("GetCapacity"),
            Self::ControllerGetCapabilities => f.write_str("ControllerGetCapabilities"),
            Self::Probe => f.write_str("Probe"),
            Self::GetPluginInfo => f.write_str("GetPluginInfo"),
            Self::GetPluginCapabilities => f.write_str("GetPluginCapabilities"),
            Self::VolumeCreated(v) => write!(f, "VolumeCreated({})", v.volume_id),
            Self::Published(ctx) => write!(f, "Published(keys={})", ctx.len()),
            Self::Validation(r) => write!(f, "Validation(supported={})", r.supported),
            Self::VolumeList(page) => write!(f, "VolumeList(count={})", page.entries.len()),
            Self::Capacity(c) => write!(f, "Capacity({c})"),
            Self::ControllerCapabilitiesResponse(caps) => {
                write!(f, "ControllerCapabilities(count={})", caps.len())
            }
            Self::PluginInfoResponse(info) => write!(f, "PluginInfo(name={})", info.name),
            Self::PluginCapabilitiesResponse(caps) => {
                write!(f, "PluginCapabilities(count={})", caps.len())
            }
            Self::Ok => f.write_str("Ok"),
            Self::ProbeResult(ok) => write!(f, "ProbeResult({ok})"),
            Self::Error(e) => write!(f, "Error({e})"),
        }
    }
}

fn reply<T>(result: Result<T, CsiError>, wrap: impl FnOnce(T) -> CsiMessage) -> CsiMessage {
    match result {
        Ok(value) => wrap(value),
        Err(e) => CsiMessage::Error(e),
    }
}

/// Map a request onto the matching service call and wrap the result in a
/// response message.
pub async fn dispatch<T>(handler: &T, ctx: &CallContext, request: CsiMessage) -> CsiMessage
where
    T: CsiIdentity + CsiController + ?Sized,
{
    match request {
        // --- Identity -------------------------------------------------------
        CsiMessage::Probe => reply(handler.probe().await, CsiMessage::ProbeResult),
        CsiMessage::GetPluginInfo => {
            reply(handler.get_plugin_info().await, CsiMessage::PluginInfoResponse)
        }
        CsiMessage::GetPluginCapabilities => reply(
            handler.get_plugin_capabilities().await,
            CsiMessage::PluginCapabilitiesResponse,
        ),

        // --- Controller -----------------------------------------------------
        CsiMessage::CreateVolume(req) => {
            reply(handler.create_volume(ctx, req).await, CsiMessage::VolumeCreated)
        }
        CsiMessage::DeleteVolume(req) => {
            reply(handler.delete_volume(ctx, req).await, |()| CsiMessage::Ok)
        }
        CsiMessage::ControllerPublishVolume(req) => reply(
            handler.controller_publish_volume(ctx, req).await,
            CsiMessage::Published,
        ),
        CsiMessage::ControllerUnpublishVolume(req) => reply(
            handler.controller_unpublish_volume(ctx, req).await,
            |()| CsiMessage::Ok,
        ),
        CsiMessage::ValidateVolumeCapabilities(req) => reply(
            handler.validate_volume_capabilities(req).await,
            CsiMessage::Validation,
        ),
        CsiMessage::ListVolumes(req) => {
            reply(handler.list_volumes(req).await, CsiMessage::VolumeList)
        }
        CsiMessage::GetCapacity(req) => {
            reply(handler.get_capacity(req).await, CsiMessage::Capacity)
        }
        CsiMessage::ControllerGetCapabilities => reply(
            handler.controller_get_capabilities().await,
            CsiMessage::ControllerCapabilitiesResponse,
        ),

        // --- Response variants should never arrive as requests --------------
        other => {
            warn!(msg = %other, "unexpected message variant received as request");
            CsiMessage::Error(CsiError::InvalidArgument(format!(
                "unexpected message: {other}"
            )))
        }
    }
}
