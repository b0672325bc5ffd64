use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use super::data_types::{MediaKind, SdpKind, SessionDescription};
use super::errors::NegotiationError;
use super::events::{SessionEvent, SessionEventKind};
use super::session::{PeerSession, PeerSessionFactory, SessionGeneration};

pub type LocalTrack = Arc<dyn TrackLocal + Send + Sync>;

/// creates webrtc-rs peer connections.
///
/// capturing media into the local tracks and rendering the remote ones is the caller's job
pub struct RtcSessionFactory {
    api: Arc<webrtc::api::API>,
    ice_servers: Vec<String>,
    local_tracks: Vec<(MediaKind, LocalTrack)>,
    remote_track_chan: Option<mpsc::UnboundedSender<Arc<TrackRemote>>>,
}

impl RtcSessionFactory {
    pub fn new(ice_servers: Vec<String>) -> Result<Self> {
        Ok(Self {
            api: Arc::new(create_api()?),
            ice_servers,
            local_tracks: vec![],
            remote_track_chan: None,
        })
    }

    /// the track is added to every session and can be switched with `set_media_enabled`
    pub fn with_local_track(mut self, kind: MediaKind, track: LocalTrack) -> Self {
        self.local_tracks.push((kind, track));
        self
    }

    /// tracks added by the remote side are sent here
    pub fn with_remote_track_chan(mut self, chan: mpsc::UnboundedSender<Arc<TrackRemote>>) -> Self {
        self.remote_track_chan = Some(chan);
        self
    }
}

impl PeerSessionFactory for RtcSessionFactory {
    fn create(
        &mut self,
        generation: SessionGeneration,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<Box<dyn PeerSession>> {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let args = WorkerArgs {
            api: self.api.clone(),
            ice_servers: self.ice_servers.clone(),
            local_tracks: self.local_tracks.clone(),
            remote_track_chan: self.remote_track_chan.clone(),
            generation,
            events,
        };
        tokio::spawn(async move {
            run(args, cmd_rx).await;
        });
        Ok(Box::new(RtcSession {
            cmd_tx: Some(cmd_tx),
        }))
    }
}

enum SessionCmd {
    Offer,
    Answer,
    ApplyRemote(SessionDescription),
    AddIce(String),
    SetMedia(MediaKind, bool),
}

/// commands are run in order by a background task that owns the RTCPeerConnection
pub struct RtcSession {
    cmd_tx: Option<mpsc::UnboundedSender<SessionCmd>>,
}

impl RtcSession {
    fn cmd(&self, cmd: SessionCmd) {
        match &self.cmd_tx {
            Some(tx) => {
                if tx.send(cmd).is_err() {
                    log::warn!("peer session worker is gone");
                }
            }
            None => log::warn!("command sent to a destroyed peer session"),
        }
    }
}

impl PeerSession for RtcSession {
    fn offer(&mut self) {
        self.cmd(SessionCmd::Offer);
    }

    fn answer(&mut self) {
        self.cmd(SessionCmd::Answer);
    }

    fn apply_remote(&mut self, description: SessionDescription) {
        self.cmd(SessionCmd::ApplyRemote(description));
    }

    fn add_ice_candidate(&mut self, candidate: String) {
        self.cmd(SessionCmd::AddIce(candidate));
    }

    fn set_media_enabled(&mut self, kind: MediaKind, enabled: bool) {
        self.cmd(SessionCmd::SetMedia(kind, enabled));
    }

    fn destroy(&mut self) {
        // the worker closes the connection once the channel drains
        self.cmd_tx = None;
    }
}

struct WorkerArgs {
    api: Arc<webrtc::api::API>,
    ice_servers: Vec<String>,
    local_tracks: Vec<(MediaKind, LocalTrack)>,
    remote_track_chan: Option<mpsc::UnboundedSender<Arc<TrackRemote>>>,
    generation: SessionGeneration,
    events: mpsc::UnboundedSender<SessionEvent>,
}

struct SessionWorker {
    generation: SessionGeneration,
    events: mpsc::UnboundedSender<SessionEvent>,
    connection: Arc<RTCPeerConnection>,
    senders: HashMap<MediaKind, (Arc<RTCRtpSender>, LocalTrack)>,
}

async fn run(args: WorkerArgs, mut rx: mpsc::UnboundedReceiver<SessionCmd>) {
    let generation = args.generation;
    let events = args.events.clone();
    let mut worker = match SessionWorker::connect(args).await {
        Ok(w) => w,
        Err(e) => {
            log::error!("failed to create peer connection: {}", e);
            let _ = events.send(SessionEvent {
                generation,
                kind: SessionEventKind::Failed(NegotiationError::PeerConnection(e.to_string())),
            });
            return;
        }
    };

    while let Some(cmd) = rx.recv().await {
        if let Err(e) = worker.handle(cmd).await {
            worker.emit(SessionEventKind::Failed(e));
        }
    }

    if let Err(e) = worker.connection.close().await {
        log::warn!("failed to close peer connection {}: {}", generation, e);
    }
    log::debug!("peer session {} closed", generation);
}

impl SessionWorker {
    async fn connect(args: WorkerArgs) -> Result<Self> {
        let mut config = RTCConfiguration::default();
        if !args.ice_servers.is_empty() {
            config.ice_servers = vec![RTCIceServer {
                urls: args.ice_servers,
                ..Default::default()
            }];
        }
        let connection = Arc::new(args.api.new_peer_connection(config).await?);

        let mut senders = HashMap::new();
        for (kind, track) in args.local_tracks {
            let sender = connection.add_track(track.clone()).await?;
            senders.insert(kind, (sender, track));
        }

        // send discovered ice candidates (for self) to remote peer
        let tx = args.events.clone();
        let generation = args.generation;
        connection.on_ice_candidate(Box::new(move |c: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                let Some(candidate) = c else {
                    return;
                };
                let serialized = candidate
                    .to_json()
                    .map_err(anyhow::Error::from)
                    .and_then(|init| Ok(encode_candidate(init)?));
                match serialized {
                    Ok(s) => {
                        let _ = tx.send(SessionEvent {
                            generation,
                            kind: SessionEventKind::LocalIce(s),
                        });
                    }
                    Err(e) => log::error!("failed to serialize ice candidate: {}", e),
                }
            })
        }));

        let tx = args.events.clone();
        connection.on_ice_connection_state_change(Box::new(
            move |connection_state: RTCIceConnectionState| {
                log::info!(
                    "ICE state for session {} changed to {}",
                    generation,
                    connection_state
                );
                if connection_state == RTCIceConnectionState::Failed {
                    let _ = tx.send(SessionEvent {
                        generation,
                        kind: SessionEventKind::Disconnected,
                    });
                }
                Box::pin(async {})
            },
        ));

        let remote_track_chan = args.remote_track_chan;
        connection.on_track(Box::new(
            move |track: Option<Arc<TrackRemote>>, _receiver: Option<Arc<RTCRtpReceiver>>| {
                if let (Some(track), Some(chan)) = (track, &remote_track_chan) {
                    log::debug!("remote track added to session {}", generation);
                    if chan.send(track).is_err() {
                        log::warn!("remote track dropped, nobody is listening");
                    }
                }
                Box::pin(async {})
            },
        ));

        Ok(Self {
            generation: args.generation,
            events: args.events,
            connection,
            senders,
        })
    }

    async fn handle(&mut self, cmd: SessionCmd) -> Result<(), NegotiationError> {
        match cmd {
            SessionCmd::Offer => {
                let offer = self
                    .connection
                    .create_offer(None)
                    .await
                    .map_err(|e| NegotiationError::Sdp(e.to_string()))?;
                // Note: this starts the gathering of ICE candidates
                self.connection
                    .set_local_description(offer.clone())
                    .await
                    .map_err(|e| NegotiationError::Sdp(e.to_string()))?;
                self.emit(SessionEventKind::LocalSdp(SessionDescription::offer(offer.sdp)));
            }
            SessionCmd::Answer => {
                let answer = self
                    .connection
                    .create_answer(None)
                    .await
                    .map_err(|e| NegotiationError::Sdp(e.to_string()))?;
                self.connection
                    .set_local_description(answer.clone())
                    .await
                    .map_err(|e| NegotiationError::Sdp(e.to_string()))?;
                self.emit(SessionEventKind::LocalSdp(SessionDescription::answer(answer.sdp)));
            }
            SessionCmd::ApplyRemote(description) => {
                let remote = match description.kind {
                    SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
                    SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
                }
                .map_err(|e| NegotiationError::Sdp(e.to_string()))?;
                self.connection
                    .set_remote_description(remote)
                    .await
                    .map_err(|e| NegotiationError::Sdp(e.to_string()))?;
            }
            SessionCmd::AddIce(candidate) => {
                let init = parse_candidate(&candidate)?;
                self.connection
                    .add_ice_candidate(init)
                    .await
                    .map_err(|e| NegotiationError::InvalidCandidate(e.to_string()))?;
            }
            SessionCmd::SetMedia(kind, enabled) => {
                let Some((sender, track)) = self.senders.get(&kind) else {
                    log::debug!("no local {} track to switch", kind);
                    return Ok(());
                };
                let track = if enabled { Some(track.clone()) } else { None };
                sender
                    .replace_track(track)
                    .await
                    .map_err(|e| NegotiationError::Media(e.to_string()))?;
            }
        }
        Ok(())
    }

    fn emit(&self, kind: SessionEventKind) {
        if let Err(e) = self.events.send(SessionEvent {
            generation: self.generation,
            kind,
        }) {
            log::error!("failed to send session event: {}", e);
        }
    }
}

/// the ICE payload on the wire. org.webrtc peers name the candidate line `sdp`,
/// browsers and webrtc-rs name it `candidate`. either is read and both are written
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CandidatePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    candidate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sdp: Option<String>,
    #[serde(default)]
    sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    username_fragment: Option<String>,
}

fn encode_candidate(init: RTCIceCandidateInit) -> Result<String, serde_json::Error> {
    serde_json::to_string(&CandidatePayload {
        candidate: Some(init.candidate.clone()),
        sdp: Some(init.candidate),
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    })
}

fn parse_candidate(payload: &str) -> Result<RTCIceCandidateInit, NegotiationError> {
    let payload: CandidatePayload = serde_json::from_str(payload)
        .map_err(|e| NegotiationError::InvalidCandidate(e.to_string()))?;
    let Some(candidate) = payload.candidate.or(payload.sdp) else {
        return Err(NegotiationError::InvalidCandidate(
            "no candidate line".into(),
        ));
    };
    Ok(RTCIceCandidateInit {
        candidate,
        sdp_mid: payload.sdp_mid,
        sdp_mline_index: payload.sdp_mline_index,
        username_fragment: payload.username_fragment,
    })
}

// todo: add support for more codecs. perhaps make it configurable
fn create_api() -> Result<webrtc::api::API> {
    let mut media = MediaEngine::default();
    media.register_default_codecs()?;

    // the default interceptors provide NACKs, RTCP reports and the like
    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media)?;

    Ok(APIBuilder::new()
        .with_media_engine(media)
        .with_interceptor_registry(registry)
        .build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEventKind {
        let ev = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for a session event")
            .expect("session channel closed");
        ev.kind
    }

    const HOST_CANDIDATE: &str = "candidate:1 1 UDP 2122252543 192.168.1.2 54321 typ host";

    #[test]
    fn reads_org_webrtc_candidates() {
        let raw = format!(
            r#"{{"sdpMid":"0","sdpMLineIndex":0,"sdp":"{}","serverUrl":"","adapterType":"UNKNOWN"}}"#,
            HOST_CANDIDATE
        );
        let init = parse_candidate(&raw).unwrap();
        assert_eq!(init.candidate, HOST_CANDIDATE);
        assert_eq!(init.sdp_mid.as_deref(), Some("0"));
        assert_eq!(init.sdp_mline_index, Some(0));
    }

    #[test]
    fn reads_browser_candidates() {
        let raw = format!(
            r#"{{"candidate":"{}","sdpMid":"audio","sdpMLineIndex":1,"usernameFragment":"abcd"}}"#,
            HOST_CANDIDATE
        );
        let init = parse_candidate(&raw).unwrap();
        assert_eq!(init.candidate, HOST_CANDIDATE);
        assert_eq!(init.sdp_mid.as_deref(), Some("audio"));
        assert_eq!(init.sdp_mline_index, Some(1));
        assert_eq!(init.username_fragment.as_deref(), Some("abcd"));
    }

    #[test]
    fn writes_both_candidate_names() {
        let encoded = encode_candidate(RTCIceCandidateInit {
            candidate: HOST_CANDIDATE.into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        })
        .unwrap();
        let value: serde_json::Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(value["sdp"], HOST_CANDIDATE);
        assert_eq!(value["candidate"], HOST_CANDIDATE);
        assert_eq!(value["sdpMid"], "0");
        assert_eq!(value["sdpMLineIndex"], 0);
        assert_eq!(parse_candidate(&encoded).unwrap().candidate, HOST_CANDIDATE);
    }

    #[test]
    fn candidate_without_a_line_is_invalid() {
        assert!(matches!(
            parse_candidate(r#"{"sdpMid":"0"}"#),
            Err(NegotiationError::InvalidCandidate(_))
        ));
    }

    #[tokio::test]
    async fn offer_produces_local_description() {
        let mut factory = RtcSessionFactory::new(vec![]).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut session = factory.create(7, tx).unwrap();
        session.offer();
        match next_event(&mut rx).await {
            SessionEventKind::LocalSdp(d) => {
                assert_eq!(d.kind, SdpKind::Offer);
                assert!(d.sdp.starts_with("v=0"));
            }
            other => panic!("unexpected event {:?}", other),
        }
        session.destroy();
    }

    #[tokio::test]
    async fn bad_candidate_is_reported_not_fatal() {
        let mut factory = RtcSessionFactory::new(vec![]).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut session = factory.create(3, tx).unwrap();
        session.add_ice_candidate("not a candidate".into());
        assert!(matches!(
            next_event(&mut rx).await,
            SessionEventKind::Failed(NegotiationError::InvalidCandidate(_))
        ));

        // the session still works afterwards
        session.offer();
        assert!(matches!(
            next_event(&mut rx).await,
            SessionEventKind::LocalSdp(_)
        ));
    }

    #[tokio::test]
    async fn garbage_description_is_reported() {
        let mut factory = RtcSessionFactory::new(vec![]).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut session = factory.create(4, tx).unwrap();
        session.apply_remote(SessionDescription::answer("garbage"));
        assert!(matches!(
            next_event(&mut rx).await,
            SessionEventKind::Failed(NegotiationError::Sdp(_))
        ));
        session.destroy();
    }

    #[tokio::test]
    async fn destroyed_session_ignores_commands() {
        let mut factory = RtcSessionFactory::new(vec![]).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut session = factory.create(5, tx).unwrap();
        session.destroy();
        session.offer();
        session.destroy();
        // the worker shuts down and drops its sender without producing anything
        let closed = tokio::time::timeout(Duration::from_secs(10), async {
            while let Some(ev) = rx.recv().await {
                if matches!(ev.kind, SessionEventKind::LocalSdp(_)) {
                    return false;
                }
            }
            true
        })
        .await
        .expect("worker did not shut down");
        assert!(closed);
    }
}
