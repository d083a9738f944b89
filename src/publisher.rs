//! Publisher process: drives the Transcoder Driver and NAL Parser (spec.md
//! §4.1–4.2), feeds the Frame Distributor (§4.3) into the Fan-out Engine's
//! shared track (§4.4), and maintains the Reconnect Supervisor's connection
//! to the Signaling Broker (§4.6) over a raw WebSocket client.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::media::Sample;
use webrtc::track::track_local::TrackLocalWriter;

use crate::{config::Config, distributor, envelope, fanout::FanoutEngine, helper, metrics};
use nal::Assembler;
use transcoder::{DriverEvent, Transcoder, TranscoderConfig};

/// Two fixed backoff tiers, matching the original rather than inventing
/// exponential semantics (spec.md §9 Open Questions; see DESIGN.md).
const RECONNECT_BACKOFF: [Duration; 2] = [Duration::from_secs(2), Duration::from_secs(5)];
const FIRST_FRAME_WARMUP: Duration = Duration::from_secs(15);
const DISTRIBUTOR_CAPACITY: usize = 4;

/// Runs the publisher until a shutdown signal resolves: wires the ingest
/// pipeline, the fan-out engine's writer task, and the reconnect supervisor
/// together, per spec.md §2's data/control path.
pub async fn run(cfg: Config) -> anyhow::Result<()> {
    let (signaling_tx, signaling_rx) = mpsc::unbounded_channel::<(String, Value)>();
    let ice_servers = cfg.ice_servers.iter().cloned().map(Into::into).collect();
    let (engine, track) = FanoutEngine::new(ice_servers, signaling_tx)?;

    let (dist_tx, dist_rx) = distributor::channel(DISTRIBUTOR_CAPACITY);
    let ingest_done = Arc::new(tokio::sync::Notify::new());
    tokio::spawn(ingest_loop(cfg.clone(), dist_tx, ingest_done.clone()));
    tokio::spawn(writer_loop(dist_rx, track, ingest_done));

    tokio::select! {
        _ = reconnect_supervisor(cfg.signaling_ws_url.clone(), engine, signaling_rx) => {}
        _ = helper::shutdown_signal() => {
            info!("shutdown signal received, exiting");
        }
    }

    Ok(())
}

/// Drives the transcoder (or the mock fallback source), parses its byte
/// stream into access units and hands each to the Frame Distributor. Notifies
/// `done` on exit so the writer task, which would otherwise block forever on
/// a Distributor that will never receive another unit, can abort too
/// (spec.md §4.4: fatal transcoder events abort the writer).
async fn ingest_loop(cfg: Config, dist_tx: distributor::DistributorSender, done: Arc<tokio::sync::Notify>) {
    match &cfg.rtsp_url {
        Some(rtsp_url) => transcoder_ingest(rtsp_url.clone(), cfg, dist_tx).await,
        None => mock_source_ingest(cfg.video_fps, dist_tx).await,
    }
    done.notify_one();
}

async fn transcoder_ingest(rtsp_url: String, cfg: Config, dist_tx: distributor::DistributorSender) {
    let transcoder_cfg = TranscoderConfig {
        rtsp_url,
        binary: cfg.transcoder_binary.clone(),
        initial_fps: cfg.video_fps,
    };

    let mut child = match Transcoder::start(&transcoder_cfg).await {
        Ok(child) => child,
        Err(e) => {
            error!("failed to start transcoder: {e}");
            return;
        }
    };

    let mut assembler = Assembler::new(cfg.video_fps as f64);
    let mut stdout = child.stdout;
    let mut buf = vec![0u8; 64 * 1024];
    let mut first_frame_emitted = false;
    let mut warmup_fired = false;
    let warmup = tokio::time::sleep(FIRST_FRAME_WARMUP);
    tokio::pin!(warmup);

    use tokio::io::AsyncReadExt;
    loop {
        tokio::select! {
            event = child.poll() => {
                match event {
                    Some(DriverEvent::FpsDetected(fps)) => {
                        assembler.set_fps(fps);
                        metrics::OBSERVED_FPS.set(fps);
                        debug!("observed fps updated to {fps}");
                    }
                    Some(DriverEvent::FatalStderr(msg)) => {
                        error!("transcoder fatal: {msg}");
                        break;
                    }
                    Some(DriverEvent::ExitedWithError(msg)) => {
                        error!("transcoder exited with error: {msg}");
                        break;
                    }
                    Some(DriverEvent::ExitedClean) => {
                        warn!("transcoder exited cleanly");
                        break;
                    }
                    None => break,
                }
            }
            read = stdout.read(&mut buf) => {
                match read {
                    Ok(0) => {
                        warn!("transcoder stdout closed");
                        break;
                    }
                    Ok(n) => {
                        for unit in assembler.feed(&buf[..n]) {
                            if !first_frame_emitted {
                                first_frame_emitted = true;
                            }
                            dist_tx.push(unit);
                        }
                    }
                    Err(e) => {
                        warn!("transcoder stdout read error: {e}");
                        break;
                    }
                }
            }
            _ = &mut warmup, if !first_frame_emitted && !warmup_fired => {
                warmup_fired = true;
                info!("no access unit emitted within warm-up window, streaming continues");
            }
        }
    }

    child.close();
}

/// Test-only path per spec.md §9 Open Questions: emits periodic placeholder
/// access units at the configured rate so the pipeline can be exercised
/// without a real RTSP source or transcoder. Never produces a real encoded
/// bitstream.
async fn mock_source_ingest(fps: u32, dist_tx: distributor::DistributorSender) {
    warn!("RTSP_URL not set, using mock test-pattern source");
    let period = Duration::from_secs_f64(1.0 / fps.max(1) as f64);
    let mut ticker = tokio::time::interval(period);
    let mut seq: u64 = 0;
    loop {
        ticker.tick().await;
        seq += 1;
        let is_idr = seq % (fps.max(1) as u64) == 1;
        let nal_type: u8 = if is_idr { 0x65 } else { 0x61 };
        let data = bytes::Bytes::from(vec![0, 0, 0, 1, nal_type, 0]);
        dist_tx.push(nal::AccessUnit {
            data,
            contains_idr: is_idr,
            duration: period,
        });
    }
}

/// Reads the Frame Distributor and writes each access unit to the shared
/// encoded track. Write failures are counted and logged with suppression so
/// a single disconnected/slow consumer never blocks the pipeline. Aborts once
/// `ingest_done` fires, since a dead ingest loop will never feed the
/// Distributor another unit (spec.md §4.4).
async fn writer_loop(
    mut dist_rx: distributor::DistributorReceiver,
    track: Arc<webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample>,
    ingest_done: Arc<tokio::sync::Notify>,
) {
    let mut consecutive_errors: u32 = 0;
    loop {
        let unit = tokio::select! {
            unit = dist_rx.recv() => unit,
            _ = ingest_done.notified() => {
                warn!("ingest loop exited, aborting writer");
                return;
            }
        };
        let sample = Sample {
            data: unit.data,
            duration: unit.duration,
            ..Default::default()
        };
        match track.write_sample(&sample).await {
            Ok(()) => consecutive_errors = 0,
            Err(e) => {
                consecutive_errors += 1;
                if consecutive_errors.is_power_of_two() {
                    warn!("track write failed ({consecutive_errors} consecutive): {e}");
                }
            }
        }
    }
}

/// Publisher-side reconnection to the broker with bounded backoff
/// (spec.md §4.6). Existing viewer entries are untouched across a reconnect
/// — their own ICE recovery policy governs their lifetime independently.
async fn reconnect_supervisor(
    url: String,
    engine: Arc<FanoutEngine>,
    mut signaling_rx: mpsc::UnboundedReceiver<(String, Value)>,
) {
    let mut attempt: usize = 0;
    loop {
        info!("connecting to signaling broker at {url}");
        match tokio_tungstenite::connect_async(&url).await {
            Ok((ws_stream, _)) => {
                attempt = 0;
                let (mut sink, mut stream) = ws_stream.split();

                loop {
                    tokio::select! {
                        outbound = signaling_rx.recv() => {
                            match outbound {
                                Some((_client_id, payload)) => {
                                    if sink.send(WsMessage::Text(payload.to_string())).await.is_err() {
                                        warn!("signaling write failed, reconnecting");
                                        break;
                                    }
                                }
                                None => return,
                            }
                        }
                        inbound = stream.next() => {
                            match inbound {
                                Some(Ok(WsMessage::Text(text))) => {
                                    dispatch_inbound(&engine, &text).await;
                                }
                                Some(Ok(WsMessage::Close(_))) | None => {
                                    warn!("signaling connection closed, reconnecting");
                                    break;
                                }
                                Some(Err(e)) => {
                                    warn!("signaling read error: {e}, reconnecting");
                                    break;
                                }
                                _ => {}
                            }
                        }
                    }
                }
            }
            Err(e) => {
                warn!("failed to connect to signaling broker: {e}");
            }
        }

        let delay = RECONNECT_BACKOFF[attempt.min(RECONNECT_BACKOFF.len() - 1)];
        attempt += 1;
        tokio::time::sleep(delay).await;
    }
}

async fn dispatch_inbound(engine: &Arc<FanoutEngine>, text: &str) {
    let Ok(value) = serde_json::from_str::<Value>(text) else {
        warn!("failed to parse inbound signaling message");
        return;
    };
    match envelope::message_type(&value) {
        Some("viewer_connected") => {
            if let Some(client_id) = value.get("clientId").and_then(Value::as_str) {
                if let Err(e) = engine.viewer_connected(client_id.to_string()).await {
                    warn!("[{client_id}] failed to create viewer entry: {e}");
                }
            }
        }
        Some("answer") => {
            let Some(client_id) = envelope::target_client_id(&value).map(str::to_owned) else {
                warn!("answer message missing clientId/fromClientId");
                return;
            };
            let Some(sdp) = value.get("answer").and_then(|a| a.get("sdp")).and_then(Value::as_str) else {
                warn!("[{client_id}] answer message missing sdp");
                return;
            };
            engine.dispatch_answer(&client_id, sdp.to_string()).await;
        }
        Some("candidate") => {
            let Some(client_id) = envelope::target_client_id(&value).map(str::to_owned) else {
                warn!("candidate message missing clientId/fromClientId");
                return;
            };
            let Some(candidate_value) = value.get("candidate").cloned() else {
                warn!("[{client_id}] candidate message missing candidate");
                return;
            };
            match serde_json::from_value::<RTCIceCandidateInit>(candidate_value) {
                Ok(candidate) => engine.dispatch_candidate(&client_id, candidate).await,
                Err(e) => warn!("[{client_id}] failed to parse candidate: {e}"),
            }
        }
        other => {
            debug!("ignoring signaling message of type {:?}", other);
        }
    }
}
