use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::metrics;

const DISCONNECTED_GRACE: Duration = Duration::from_secs(10);
const FAILED_GRACE: Duration = Duration::from_secs(5);
const RESTART_GRACE: Duration = Duration::from_secs(3);

/// Viewer lifecycle as an explicit tagged value rather than loose booleans,
/// matching each state and transition named by the recovery policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewerState {
    New,
    Offering,
    AwaitingAnswer,
    Negotiating,
    IceChecking,
    Connected,
    Disconnected,
    Failed,
    Restarting,
    Closed,
}

pub enum ViewerEvent {
    IceStateChanged(RTCIceConnectionState),
    PcStateChanged(RTCPeerConnectionState),
    AnswerReceived(RTCSessionDescription),
    CandidateReceived(RTCIceCandidateInit),
    Close,
}

pub type ViewerTable = Arc<RwLock<std::collections::HashMap<String, mpsc::UnboundedSender<ViewerEvent>>>>;

/// Runs for the lifetime of one viewer: owns its state, its recovery
/// timers, and its buffered-candidate discipline. Cooperative, not
/// callback-driven — callbacks on the peer connection only push events onto
/// `event_rx`; all transitions happen here.
pub async fn run(
    id: String,
    pc: Arc<RTCPeerConnection>,
    mut event_rx: mpsc::UnboundedReceiver<ViewerEvent>,
    signaling_tx: mpsc::UnboundedSender<(String, Value)>,
    table: ViewerTable,
) {
    let mut state = ViewerState::New;
    let mut remote_description_set = false;
    let mut pending_candidates: Vec<RTCIceCandidateInit> = Vec::new();
    let mut deadline: Option<Instant> = None;
    let mut ice_connected = false;
    let mut pc_connected = false;

    transition(&id, &mut state, ViewerState::Offering);
    if send_offer(&pc, &id, &signaling_tx, false).await.is_err() {
        transition(&id, &mut state, ViewerState::Closed);
    } else {
        transition(&id, &mut state, ViewerState::AwaitingAnswer);
    }

    while state != ViewerState::Closed {
        let sleep = async {
            match deadline {
                Some(d) => tokio::time::sleep_until(d.into()).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            event = event_rx.recv() => {
                match event {
                    Some(ev) => {
                        deadline = handle_event(
                            &id, &pc, &mut state, ev,
                            &mut remote_description_set, &mut pending_candidates,
                            &mut ice_connected, &mut pc_connected,
                            &signaling_tx,
                        ).await;
                    }
                    None => break,
                }
            }
            _ = sleep, if deadline.is_some() => {
                deadline = handle_timeout(&id, &pc, &mut state, &signaling_tx).await;
            }
        }
    }

    if let Err(e) = pc.close().await {
        warn!("[{id}] error closing peer connection: {e}");
    }
    info!("[{id}] viewer entry closed");
    table.write().await.remove(&id);
    metrics::VIEWERS_CONNECTED.set(table.read().await.len() as f64);
}

fn transition(id: &str, state: &mut ViewerState, next: ViewerState) {
    debug!("[{id}] {:?} -> {:?}", state, next);
    *state = next;
    if next == ViewerState::Connected {
        metrics::VIEWERS_CONNECTED.inc();
    }
}

async fn send_offer(
    pc: &Arc<RTCPeerConnection>,
    id: &str,
    signaling_tx: &mpsc::UnboundedSender<(String, Value)>,
    ice_restart: bool,
) -> anyhow::Result<()> {
    let offer = if ice_restart {
        pc.create_offer(Some(webrtc::peer_connection::offer_answer_options::RTCOfferOptions {
            ice_restart: true,
            ..Default::default()
        }))
        .await?
    } else {
        pc.create_offer(None).await?
    };
    pc.set_local_description(offer.clone()).await?;
    let payload = json!({
        "type": "offer",
        "clientId": id,
        "offer": { "type": "offer", "sdp": offer.sdp },
    });
    signaling_tx.send((id.to_string(), payload))?;
    Ok(())
}

/// States from which reaching ICE-connected and PC-connected jointly means
/// the viewer is `Connected` (spec.md's state table: "ICE + PC both
/// connected").
fn awaiting_joint_connect(state: ViewerState) -> bool {
    matches!(
        state,
        ViewerState::IceChecking | ViewerState::Negotiating | ViewerState::Disconnected | ViewerState::Restarting
    )
}

async fn handle_event(
    id: &str,
    pc: &Arc<RTCPeerConnection>,
    state: &mut ViewerState,
    event: ViewerEvent,
    remote_description_set: &mut bool,
    pending_candidates: &mut Vec<RTCIceCandidateInit>,
    ice_connected: &mut bool,
    pc_connected: &mut bool,
    signaling_tx: &mpsc::UnboundedSender<(String, Value)>,
) -> Option<Instant> {
    match event {
        ViewerEvent::IceStateChanged(ice_state) => {
            match (*state, ice_state) {
                (s, RTCIceConnectionState::Connected) if awaiting_joint_connect(s) => {
                    *ice_connected = true;
                    if *pc_connected {
                        transition(id, state, ViewerState::Connected);
                    }
                    return None;
                }
                (ViewerState::Connected, RTCIceConnectionState::Disconnected) => {
                    *ice_connected = false;
                    transition(id, state, ViewerState::Disconnected);
                    return Some(Instant::now() + DISCONNECTED_GRACE);
                }
                (_, RTCIceConnectionState::Checking) if *state == ViewerState::Negotiating => {
                    transition(id, state, ViewerState::IceChecking);
                    return None;
                }
                (_, RTCIceConnectionState::Failed) => {
                    *ice_connected = false;
                    transition(id, state, ViewerState::Failed);
                    return Some(Instant::now() + FAILED_GRACE);
                }
                _ => {}
            }
            None
        }
        ViewerEvent::PcStateChanged(pc_state) => {
            match pc_state {
                RTCPeerConnectionState::Connected => {
                    *pc_connected = true;
                    if *ice_connected && awaiting_joint_connect(*state) {
                        transition(id, state, ViewerState::Connected);
                    }
                }
                RTCPeerConnectionState::Failed if *state != ViewerState::Failed => {
                    *pc_connected = false;
                    transition(id, state, ViewerState::Failed);
                    return Some(Instant::now() + FAILED_GRACE);
                }
                _ => {}
            }
            None
        }
        ViewerEvent::AnswerReceived(answer) => {
            if *state != ViewerState::AwaitingAnswer && *state != ViewerState::Restarting {
                warn!("[{id}] answer received in unexpected state {:?}", state);
            }
            if let Err(e) = pc.set_remote_description(answer).await {
                warn!("[{id}] failed to apply remote description: {e}");
                transition(id, state, ViewerState::Closed);
                return None;
            }
            *remote_description_set = true;
            for c in pending_candidates.drain(..) {
                if let Err(e) = pc.add_ice_candidate(c).await {
                    warn!("[{id}] failed to apply buffered candidate: {e}");
                }
            }
            transition(id, state, ViewerState::Negotiating);
            None
        }
        ViewerEvent::CandidateReceived(candidate) => {
            if *remote_description_set {
                if let Err(e) = pc.add_ice_candidate(candidate).await {
                    warn!("[{id}] failed to apply candidate: {e}");
                }
            } else {
                pending_candidates.push(candidate);
            }
            None
        }
        ViewerEvent::Close => {
            transition(id, state, ViewerState::Closed);
            None
        }
    }
}

async fn handle_timeout(
    id: &str,
    pc: &Arc<RTCPeerConnection>,
    state: &mut ViewerState,
    signaling_tx: &mpsc::UnboundedSender<(String, Value)>,
) -> Option<Instant> {
    match *state {
        ViewerState::Disconnected => {
            transition(id, state, ViewerState::Failed);
            Some(Instant::now() + FAILED_GRACE)
        }
        ViewerState::Failed => {
            transition(id, state, ViewerState::Restarting);
            if send_offer(pc, id, signaling_tx, true).await.is_err() {
                transition(id, state, ViewerState::Closed);
                return None;
            }
            Some(Instant::now() + RESTART_GRACE)
        }
        ViewerState::Restarting => {
            warn!("[{id}] ICE restart did not recover within grace window, closing");
            transition(id, state, ViewerState::Closed);
            None
        }
        _ => None,
    }
}

pub fn on_ice_candidate_payload(id: &str, candidate: &RTCIceCandidate) -> anyhow::Result<Value> {
    let init = candidate.to_json()?;
    Ok(json!({
        "type": "candidate",
        "clientId": id,
        "candidate": {
            "candidate": init.candidate,
            "sdpMLineIndex": init.sdp_mline_index,
            "sdpMid": init.sdp_mid,
        },
    }))
}
