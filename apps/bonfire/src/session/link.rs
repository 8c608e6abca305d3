use std::{
    collections::VecDeque,
    sync::{Arc, Weak},
};

use bonfire_proto::{IceCandidate, PeerId, SessionDescription};
use tracing::{debug, trace};

use crate::transport::{DataChannel, LinkId, LinkRole, PeerTransport, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationPhase {
    OfferSent,
    OfferReceived,
}

/// Offer/answer progress of one link. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Idle,
    Negotiating(NegotiationPhase),
    Stable,
    Closed,
}

/// One negotiated or negotiating connection to a single remote peer.
///
/// Candidates that arrive before the remote description are parked in
/// `pending_candidates` and applied, in arrival order, right after it lands.
pub struct PeerLink {
    pub id: LinkId,
    pub peer: Option<PeerId>,
    pub role: LinkRole,
    pub state: SignalingState,
    remote_description_set: bool,
    pending_candidates: VecDeque<IceCandidate>,
    transport: Arc<dyn PeerTransport>,
    channel: Option<Weak<dyn DataChannel>>,
}

impl PeerLink {
    pub fn new(
        id: LinkId,
        peer: Option<PeerId>,
        role: LinkRole,
        transport: Arc<dyn PeerTransport>,
    ) -> Self {
        Self {
            id,
            peer,
            role,
            state: SignalingState::Idle,
            remote_description_set: false,
            pending_candidates: VecDeque::new(),
            transport,
            channel: None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state == SignalingState::Closed
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    /// Remembers the channel without owning it; the registry does.
    pub fn attach_channel(&mut self, channel: &Arc<dyn DataChannel>) {
        self.channel = Some(Arc::downgrade(channel));
    }

    pub fn channel(&self) -> Option<Arc<dyn DataChannel>> {
        self.channel.as_ref().and_then(Weak::upgrade)
    }

    pub fn queue_candidate(&mut self, candidate: IceCandidate) {
        self.pending_candidates.push_back(candidate);
    }

    pub async fn create_offer(&mut self) -> Result<SessionDescription, TransportError> {
        let offer = self.transport.create_offer().await?;
        self.state = SignalingState::Negotiating(NegotiationPhase::OfferSent);
        Ok(offer)
    }

    pub async fn create_answer(&mut self) -> Result<SessionDescription, TransportError> {
        let answer = self.transport.create_answer().await?;
        self.state = SignalingState::Stable;
        Ok(answer)
    }

    /// Answerer path: remote offer in, pending candidates flushed, answer out.
    pub async fn accept_offer(
        &mut self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, TransportError> {
        self.state = SignalingState::Negotiating(NegotiationPhase::OfferReceived);
        self.apply_remote_description(offer).await?;
        self.create_answer().await
    }

    pub async fn accept_answer(&mut self, answer: SessionDescription) -> Result<(), TransportError> {
        self.apply_remote_description(answer).await?;
        self.state = SignalingState::Stable;
        Ok(())
    }

    /// Applies now when possible, otherwise queues behind the remote description.
    pub async fn add_candidate(&mut self, candidate: IceCandidate) -> Result<(), TransportError> {
        if self.is_closed() {
            return Ok(());
        }
        if !self.remote_description_set {
            trace!(target: "bonfire::signaling", link = %self.id, "queueing candidate until remote description");
            self.queue_candidate(candidate);
            return Ok(());
        }
        self.transport.add_candidate(candidate).await
    }

    /// Installs the remote description, then drains the candidate queue.
    pub async fn apply_remote_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::LinkClosed);
        }
        self.transport.apply_remote_description(description).await?;
        self.remote_description_set = true;
        if self.pending_candidates.is_empty() {
            return Ok(());
        }
        debug!(
            target: "bonfire::signaling",
            link = %self.id,
            count = self.pending_candidates.len(),
            "flushing buffered candidates"
        );
        while let Some(candidate) = self.pending_candidates.pop_front() {
            self.transport.add_candidate(candidate).await?;
        }
        Ok(())
    }

    /// The single teardown path for a link. Safe to call repeatedly.
    pub async fn close(&mut self) {
        if self.is_closed() {
            return;
        }
        self.state = SignalingState::Closed;
        self.pending_candidates.clear();
        if let Some(channel) = self.channel() {
            if let Err(err) = channel.close().await {
                debug!(target: "bonfire::transport", link = %self.id, error = %err, "data channel close reported an error");
            }
        }
        self.channel = None;
        self.transport.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{LinkOp, MemoryAdapter, MemoryNetwork};
    use crate::transport::TransportAdapter;
    use tokio::sync::mpsc;

    fn candidate(tag: &str) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{tag}"),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    #[tokio::test]
    async fn candidates_wait_for_the_remote_description() {
        let network = MemoryNetwork::new();
        let offerer = MemoryAdapter::new(&network);
        let answerer = MemoryAdapter::new(&network);
        let (events, _rx) = mpsc::unbounded_channel();

        let offer_side = offerer
            .create_link(LinkId(1), LinkRole::Offerer, events.clone())
            .await
            .unwrap();
        let answer_side = answerer
            .create_link(LinkId(1), LinkRole::Answerer, events)
            .await
            .unwrap();
        let offer = offer_side.create_offer().await.unwrap();

        let mut link = PeerLink::new(LinkId(1), Some("a".into()), LinkRole::Answerer, answer_side);
        link.add_candidate(candidate("1")).await.unwrap();
        link.add_candidate(candidate("2")).await.unwrap();
        assert_eq!(link.pending_candidates(), 2);
        assert!(answerer.ops(LinkId(1)).is_empty());

        link.apply_remote_description(offer).await.unwrap();
        link.add_candidate(candidate("3")).await.unwrap();
        assert_eq!(link.pending_candidates(), 0);
        assert_eq!(
            answerer.ops(LinkId(1)),
            vec![
                LinkOp::RemoteDescription(bonfire_proto::SdpKind::Offer),
                LinkOp::Candidate("candidate:1".into()),
                LinkOp::Candidate("candidate:2".into()),
                LinkOp::Candidate("candidate:3".into()),
            ]
        );
    }

    #[tokio::test]
    async fn close_twice_closes_the_transport_once() {
        let network = MemoryNetwork::new();
        let adapter = MemoryAdapter::new(&network);
        let (events, _rx) = mpsc::unbounded_channel();
        let transport = adapter
            .create_link(LinkId(4), LinkRole::Offerer, events)
            .await
            .unwrap();
        let mut link = PeerLink::new(LinkId(4), None, LinkRole::Offerer, transport);
        link.queue_candidate(candidate("x"));

        link.close().await;
        link.close().await;
        assert_eq!(link.state, SignalingState::Closed);
        assert_eq!(link.pending_candidates(), 0);
        assert_eq!(adapter.ops(LinkId(4)), vec![LinkOp::Close]);
        assert!(link.add_candidate(candidate("late")).await.is_ok());
    }
}
