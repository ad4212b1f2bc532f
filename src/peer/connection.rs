use crate::error::Result;
use crate::logger::dump_selected_pair;
use crate::peer::codec;
use crate::peer::ice::{analyze_candidates, wait_for_gathering, GATHER_TIMEOUT};
use crate::peer::types::{ChannelKind, SdpPayload, ServerConfig, SignalBundle};
use crate::utils::add_ice_url_scheme;
use std::sync::{Arc, Weak};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::{
    api::APIBuilder,
    ice_transport::ice_server::RTCIceServer,
    peer_connection::{
        configuration::RTCConfiguration, peer_connection_state::RTCPeerConnectionState,
        RTCPeerConnection,
    },
};

/// Creates a peer connection that can carry both data channels and PCMU audio.
///
/// `on_down` runs when the connection reaches `Failed` or `Closed`. A
/// `Disconnected` connection may still recover, so it only gets logged.
pub async fn new_peer<F>(ice_servers: &[ServerConfig], on_down: F) -> Result<Arc<RTCPeerConnection>>
where
    F: Fn() + Send + Sync + 'static,
{
    let mut media = MediaEngine::default();
    media.register_default_codecs()?;
    let registry = register_default_interceptors(Registry::new(), &mut media)?;

    // Both ends of every link live on this host
    let mut settings = SettingEngine::default();
    settings.set_include_loopback_candidate(true);

    let api = APIBuilder::new()
        .with_media_engine(media)
        .with_interceptor_registry(registry)
        .with_setting_engine(settings)
        .build();

    let pc = Arc::new(api.new_peer_connection(rtc_config(ice_servers)).await?);

    pc.on_ice_gathering_state_change(Box::new(move |state| {
        tracing::trace!("ICE gathering state changed to: {:?}", state);
        Box::pin(async {})
    }));

    // weak: the handler lives inside the connection it inspects
    let stats_pc: Weak<RTCPeerConnection> = Arc::downgrade(&pc);
    pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
        tracing::debug!("Peer connection state changed to: {:?}", st);
        match st {
            RTCPeerConnectionState::Connected => {
                if let Some(pc) = stats_pc.upgrade() {
                    tokio::spawn(async move {
                        dump_selected_pair(&pc, "CONNECTED").await;
                    });
                }
            }
            RTCPeerConnectionState::Disconnected => {
                tracing::warn!("Peer connection disconnected, waiting for ICE to recover");
            }
            RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed => on_down(),
            _ => {}
        }
        Box::pin(async {})
    }));

    Ok(pc)
}

fn rtc_config(servers: &[ServerConfig]) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: get_user_ice_servers(servers),
        ice_candidate_pool_size: 10,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

pub fn get_user_ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect()
}

/// Creates the offer, waits for ICE gathering and packs the full SDP.
pub async fn offer_bundle(
    pc: &RTCPeerConnection,
    kind: ChannelKind,
    negotiation: &str,
) -> Result<String> {
    let offer = pc.create_offer(None).await?;
    let mut gathered = pc.gathering_complete_promise().await;
    pc.set_local_description(offer).await?;
    wait_for_gathering(&mut gathered, GATHER_TIMEOUT).await;

    local_bundle(pc, kind, negotiation).await
}

/// Applies a remote offer and packs our answer.
pub async fn answer_bundle(
    pc: &RTCPeerConnection,
    kind: ChannelKind,
    negotiation: &str,
) -> Result<String> {
    let answer = pc.create_answer(None).await?;
    let mut gathered = pc.gathering_complete_promise().await;
    pc.set_local_description(answer).await?;
    wait_for_gathering(&mut gathered, GATHER_TIMEOUT).await;

    local_bundle(pc, kind, negotiation).await
}

async fn local_bundle(pc: &RTCPeerConnection, kind: ChannelKind, negotiation: &str) -> Result<String> {
    let sdp: RTCSessionDescription = pc
        .local_description()
        .await
        .ok_or_else(|| crate::error::TransportError::Negotiation("no local description".into()))?;

    let summary = analyze_candidates(&sdp.sdp);
    tracing::debug!("{:?} {} candidates: {}", kind, negotiation, summary);

    let bundle = SignalBundle {
        kind,
        sdp_payload: SdpPayload {
            sdp,
            id: negotiation.to_string(),
            ts: chrono::Utc::now().timestamp(),
        },
    };
    Ok(codec::encode(&bundle)?)
}
