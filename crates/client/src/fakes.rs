// ============================
// meshroom-client/src/fakes.rs
// ============================
//! Recording transport used by the unit tests.
use crate::error::NegotiationError;
use crate::transport::{
    IceCandidate, LocalTrack, PeerTransport, SdpType, SessionDescription, TrackKind,
    TransportEvents, TransportFactory,
};
use async_trait::async_trait;
use meshroom_common::PeerId;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    CreateOffer { ice_restart: bool },
    CreateAnswer,
    SetLocal(SdpType),
    SetRemote(SdpType),
    Rollback,
    AddCandidate(String),
    AddSender(TrackKind, Option<String>),
    ReplaceTrack(TrackKind, Option<String>),
    Close,
}

#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<Call>>>);

impl CallLog {
    fn push(&self, call: Call) {
        self.0.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.0.lock().unwrap().clone()
    }

    pub fn contains(&self, call: &Call) -> bool {
        self.0.lock().unwrap().contains(call)
    }

    pub fn count(&self, call: &Call) -> usize {
        self.0.lock().unwrap().iter().filter(|c| *c == call).count()
    }

    pub fn clear(&self) {
        self.0.lock().unwrap().clear();
    }
}

pub struct FakeTransport {
    log: CallLog,
    offers: u32,
    answers: u32,
}

impl FakeTransport {
    pub fn new(log: CallLog) -> Self {
        Self { log, offers: 0, answers: 0 }
    }
}

#[async_trait]
impl PeerTransport for FakeTransport {
    async fn create_offer(&mut self, ice_restart: bool) -> Result<SessionDescription, NegotiationError> {
        self.log.push(Call::CreateOffer { ice_restart });
        self.offers += 1;
        Ok(SessionDescription::offer(format!("offer-{}", self.offers)))
    }

    async fn create_answer(&mut self) -> Result<SessionDescription, NegotiationError> {
        self.log.push(Call::CreateAnswer);
        self.answers += 1;
        Ok(SessionDescription::answer(format!("answer-{}", self.answers)))
    }

    async fn set_local_description(&mut self, desc: SessionDescription) -> Result<(), NegotiationError> {
        self.log.push(Call::SetLocal(desc.sdp_type));
        Ok(())
    }

    async fn set_remote_description(&mut self, desc: SessionDescription) -> Result<(), NegotiationError> {
        self.log.push(Call::SetRemote(desc.sdp_type));
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), NegotiationError> {
        self.log.push(Call::Rollback);
        Ok(())
    }

    async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        self.log.push(Call::AddCandidate(candidate.candidate));
        Ok(())
    }

    async fn add_sender(&mut self, kind: TrackKind, track: Option<LocalTrack>) -> Result<(), NegotiationError> {
        self.log.push(Call::AddSender(kind, track.map(|t| t.id)));
        Ok(())
    }

    async fn replace_track(&mut self, kind: TrackKind, track: Option<LocalTrack>) -> Result<(), NegotiationError> {
        self.log.push(Call::ReplaceTrack(kind, track.map(|t| t.id)));
        Ok(())
    }

    async fn close(&mut self) {
        self.log.push(Call::Close);
    }
}

/// Hands out `FakeTransport`s and remembers every one it built
#[derive(Clone, Default)]
pub struct FakeFactory {
    created: Arc<Mutex<Vec<(PeerId, u64, CallLog)>>>,
}

impl FakeFactory {
    /// Log of the newest transport built for `peer_id`
    pub fn log_for(&self, peer_id: &str) -> CallLog {
        self.created
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(peer, _, _)| peer == peer_id)
            .map(|(_, _, log)| log.clone())
            .unwrap_or_else(|| panic!("no transport built for {peer_id}"))
    }

    pub fn created_for(&self, peer_id: &str) -> usize {
        self.created
            .lock()
            .unwrap()
            .iter()
            .filter(|(peer, _, _)| peer == peer_id)
            .count()
    }
}

impl TransportFactory for FakeFactory {
    type Transport = FakeTransport;

    fn create(&mut self, events: TransportEvents) -> Result<FakeTransport, NegotiationError> {
        let log = CallLog::default();
        self.created.lock().unwrap().push((
            events.peer_id().to_string(),
            events.generation(),
            log.clone(),
        ));
        Ok(FakeTransport::new(log))
    }
}
