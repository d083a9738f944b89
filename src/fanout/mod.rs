pub mod viewer;

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tracing::{info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::metrics;
use viewer::{ViewerEvent, ViewerTable};

/// One shared encoded track and a keyed table of per-viewer peer-connection
/// state machines. Every viewer references the same track; writing one
/// sample delivers it to every connected peer connection.
pub struct FanoutEngine {
    api: API,
    ice_servers: Vec<RTCIceServer>,
    track: Arc<TrackLocalStaticSample>,
    viewers: ViewerTable,
    signaling_tx: mpsc::UnboundedSender<(String, Value)>,
}

impl FanoutEngine {
    pub fn new(
        ice_servers: Vec<RTCIceServer>,
        signaling_tx: mpsc::UnboundedSender<(String, Value)>,
    ) -> anyhow::Result<(Arc<Self>, Arc<TrackLocalStaticSample>)> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_codec(codec::h264_codec_parameters(102), RTPCodecType::Video)?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let track = Arc::new(TrackLocalStaticSample::new(
            webrtc::api::media_engine::MIME_TYPE_H264.to_owned().into(),
            "video".to_owned(),
            "media-relay".to_owned(),
        ));

        Ok((
            Arc::new(Self {
                api,
                ice_servers,
                track: track.clone(),
                viewers: Arc::new(RwLock::new(HashMap::new())),
                signaling_tx,
            }),
            track,
        ))
    }

    pub async fn viewer_connected(self: &Arc<Self>, client_id: String) -> anyhow::Result<()> {
        if let Some(existing) = self.viewers.write().await.remove(&client_id) {
            let _ = existing.send(ViewerEvent::Close);
        }

        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };
        let pc = Arc::new(self.api.new_peer_connection(config).await?);

        pc.add_transceiver_from_track(
            Arc::clone(&self.track) as Arc<dyn TrackLocal + Send + Sync>,
            None,
        )
        .await?;
        if let Some(transceiver) = pc
            .get_transceivers()
            .await
            .into_iter()
            .find(|t| t.kind() == RTPCodecType::Video)
        {
            let _ = transceiver
                .set_direction(RTCRtpTransceiverDirection::Sendonly)
                .await;
        }

        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let id_for_ice = client_id.clone();
        let signaling_for_ice = self.signaling_tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let id = id_for_ice.clone();
            let tx = signaling_for_ice.clone();
            Box::pin(async move {
                if let Some(candidate) = candidate {
                    match viewer::on_ice_candidate_payload(&id, &candidate) {
                        Ok(payload) => {
                            let _ = tx.send((id, payload));
                        }
                        Err(e) => warn!("[{id}] failed to encode local candidate: {e}"),
                    }
                }
            })
        }));

        let id_for_ice_state = client_id.clone();
        let event_tx_ice = event_tx.clone();
        pc.on_ice_connection_state_change(Box::new(move |state| {
            let _ = event_tx_ice.send(ViewerEvent::IceStateChanged(state));
            let id = id_for_ice_state.clone();
            Box::pin(async move {
                info!("[{id}] ice connection state: changed");
            })
        }));

        let event_tx_pc = event_tx.clone();
        pc.on_peer_connection_state_change(Box::new(move |state| {
            let _ = event_tx_pc.send(ViewerEvent::PcStateChanged(state));
            Box::pin(async {})
        }));

        self.viewers
            .write()
            .await
            .insert(client_id.clone(), event_tx);
        metrics::VIEWERS_CONNECTED.set(self.viewers.read().await.len() as f64);

        let signaling_tx = self.signaling_tx.clone();
        let table = self.viewers.clone();
        tokio::spawn(viewer::run(client_id, pc, event_rx, signaling_tx, table));

        Ok(())
    }

    pub async fn dispatch_answer(&self, client_id: &str, sdp: String) {
        let answer = match RTCSessionDescription::answer(sdp) {
            Ok(answer) => answer,
            Err(e) => {
                warn!("[{client_id}] invalid SDP answer, dropping viewer entry: {e}");
                self.dispatch(client_id, |tx| {
                    let _ = tx.send(ViewerEvent::Close);
                })
                .await;
                return;
            }
        };
        self.dispatch(client_id, |tx| {
            let _ = tx.send(ViewerEvent::AnswerReceived(answer));
        })
        .await;
    }

    pub async fn dispatch_candidate(&self, client_id: &str, candidate: RTCIceCandidateInit) {
        self.dispatch(client_id, move |tx| {
            let _ = tx.send(ViewerEvent::CandidateReceived(candidate.clone()));
        })
        .await;
    }

    async fn dispatch(&self, client_id: &str, f: impl FnOnce(&mpsc::UnboundedSender<ViewerEvent>)) {
        let viewers = self.viewers.read().await;
        match viewers.get(client_id) {
            Some(tx) => f(tx),
            None => warn!("message for unknown viewer id {client_id}, dropping"),
        }
    }

    pub async fn viewer_count(&self) -> usize {
        self.viewers.read().await.len()
    }
}
