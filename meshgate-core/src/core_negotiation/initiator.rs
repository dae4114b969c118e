/*
    Initiator - earns access by proving it retrieved assigned data

    InitiatorMachine is the pure state machine; `Initiator::run` drives it
    over a broadcast channel:

      subscribe -> poll subscriber_count until the mesh has formed
      -> REQUEST_WORK now and on every retry tick until Authorized
      -> ASSIGNMENT: FETCH_DATA for the first ref
      -> DATA_DELIVERY: store locally, SUBMIT_PROOF
      -> ACCESS_GRANTED: unsubscribe and return

    Messages are lossy and may repeat. The state only moves forward; a
    repeated ASSIGNMENT or DATA_DELIVERY re-sends the corresponding request
    without moving it back. A lost FETCH_DATA, DATA_DELIVERY or SUBMIT_PROOF
    is recovered by the retry tick, whose REQUEST_WORK draws a fresh
    ASSIGNMENT (or a repeat ACCESS_GRANTED once the responder has granted).
*/

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use super::{NegotiationError, NegotiationMessage};
use crate::config::NegotiationConfig;
use crate::core_content::{ContentRef, ContentStore};
use crate::core_pubsub::BroadcastChannel;
use crate::metrics;
use crate::shutdown::ShutdownListener;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum InitiatorState {
    Idle,
    AwaitingPeer,
    RequestingWork,
    AwaitingAssignment,
    FetchingData,
    SubmittingProof,
    Authorized,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitiatorAction {
    Send(NegotiationMessage),
    /// Keep a delivered blob in the local content store
    Store { content_ref: ContentRef, content: Vec<u8> },
    Authorized { responder: String },
}

#[derive(Debug)]
pub struct InitiatorMachine {
    identity: String,
    state: InitiatorState,
    fetching: Option<ContentRef>,
    responder: Option<String>,
}

impl InitiatorMachine {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            state: InitiatorState::Idle,
            fetching: None,
            responder: None,
        }
    }

    pub fn state(&self) -> InitiatorState {
        self.state
    }

    /// Ref picked from the assignment, once known
    pub fn fetching(&self) -> Option<ContentRef> {
        self.fetching
    }

    pub fn responder(&self) -> Option<&str> {
        self.responder.as_deref()
    }

    fn advance(&mut self, to: InitiatorState) {
        if to > self.state {
            trace!(from = ?self.state, ?to, "Initiator state");
            self.state = to;
        }
    }

    /// Subscribed; waiting for the mesh to form
    pub fn subscribed(&mut self) {
        self.advance(InitiatorState::AwaitingPeer);
    }

    pub fn mesh_ready(&mut self) {
        self.advance(InitiatorState::RequestingWork);
    }

    /// REQUEST_WORK to send now, unless already authorized
    pub fn request_work(&mut self) -> Option<NegotiationMessage> {
        if self.state == InitiatorState::Authorized {
            return None;
        }
        self.advance(InitiatorState::AwaitingAssignment);
        Some(NegotiationMessage::RequestWork)
    }

    pub fn on_message(&mut self, from: &str, message: &NegotiationMessage) -> Vec<InitiatorAction> {
        if from == self.identity || self.state == InitiatorState::Authorized {
            return Vec::new();
        }
        match message.target() {
            Some(target) if target == self.identity => {}
            _ => return Vec::new(),
        }

        match message {
            NegotiationMessage::Assignment { refs, .. } => {
                if self.state < InitiatorState::AwaitingAssignment {
                    return Vec::new();
                }
                // keep the pinned ref while it is still offered
                let content_ref = match (self.fetching, refs.first()) {
                    (Some(current), _) if refs.contains(&current) => current,
                    (_, Some(first)) => *first,
                    (_, None) => return Vec::new(),
                };
                self.fetching = Some(content_ref);
                self.advance(InitiatorState::FetchingData);
                vec![InitiatorAction::Send(NegotiationMessage::FetchData { content_ref })]
            }
            NegotiationMessage::DataDelivery {
                content_ref, content, ..
            } => {
                if self.fetching != Some(*content_ref) {
                    return Vec::new();
                }
                if !content_ref.matches(content) {
                    debug!(content_ref = %content_ref.short(), "Delivered content does not match its ref");
                    return Vec::new();
                }
                self.advance(InitiatorState::SubmittingProof);
                vec![
                    InitiatorAction::Store {
                        content_ref: *content_ref,
                        content: content.clone(),
                    },
                    InitiatorAction::Send(NegotiationMessage::SubmitProof {
                        content_ref: *content_ref,
                        content: content.clone(),
                    }),
                ]
            }
            NegotiationMessage::AccessGranted { .. } => {
                self.advance(InitiatorState::Authorized);
                self.responder = Some(from.to_string());
                vec![InitiatorAction::Authorized {
                    responder: from.to_string(),
                }]
            }
            _ => Vec::new(),
        }
    }
}

/// Result of a completed handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authorization {
    pub responder: String,
    pub proven_ref: Option<ContentRef>,
    pub requests_sent: u32,
    pub elapsed: Duration,
}

pub struct Initiator {
    channel: Arc<dyn BroadcastChannel>,
    content: Arc<dyn ContentStore>,
    config: NegotiationConfig,
}

impl Initiator {
    pub fn new(
        channel: Arc<dyn BroadcastChannel>,
        content: Arc<dyn ContentStore>,
        config: NegotiationConfig,
    ) -> Self {
        Self {
            channel,
            content,
            config,
        }
    }

    /// Run the handshake to completion, or until shutdown or the optional
    /// request budget runs out.
    pub async fn run(&self, shutdown: &mut ShutdownListener) -> Result<Authorization, NegotiationError> {
        let started = Instant::now();
        let topic = self.config.topic.as_str();
        let mut machine = InitiatorMachine::new(self.channel.local_identity());

        let mut subscription = self.channel.subscribe(topic).await?;
        machine.subscribed();
        info!(topic, "Waiting for negotiation peers");

        let mut poll = tokio::time::interval(self.config.mesh_poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => return self.abandon(NegotiationError::Cancelled).await,
                _ = poll.tick() => {
                    let peers = self.channel.subscriber_count(topic).await;
                    if peers > 0 {
                        debug!(peers, "Negotiation mesh ready");
                        break;
                    }
                    trace!("No negotiation peers yet");
                }
            }
        }
        machine.mesh_ready();

        let mut requests_sent = 0u32;
        let retry = self.config.request_retry_interval;
        let mut retry_tick = tokio::time::interval_at(Instant::now() + retry, retry);
        retry_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        if let Some(request) = machine.request_work() {
            requests_sent += 1;
            self.send(&request).await;
        }

        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => return self.abandon(NegotiationError::Cancelled).await,
                inbound = subscription.recv() => {
                    let Some(inbound) = inbound else {
                        return Err(NegotiationError::SubscriptionClosed);
                    };
                    let message = match NegotiationMessage::decode(&inbound.data) {
                        Ok(message) => message,
                        Err(e) => {
                            trace!(from = %inbound.from, error = %e, "Dropping negotiation payload");
                            continue;
                        }
                    };
                    for action in machine.on_message(&inbound.from, &message) {
                        match action {
                            InitiatorAction::Send(reply) => self.send(&reply).await,
                            InitiatorAction::Store { content_ref, content } => {
                                if let Err(e) = self.content.put(content).await {
                                    warn!(content_ref = %content_ref.short(), error = %e, "Could not store delivered data");
                                    break;
                                }
                            }
                            InitiatorAction::Authorized { responder } => {
                                info!(responder = %responder, requests_sent, "Access granted");
                                if let Err(e) = self.channel.unsubscribe(topic).await {
                                    debug!(error = %e, "Negotiation unsubscribe failed");
                                }
                                return Ok(Authorization {
                                    responder,
                                    proven_ref: machine.fetching(),
                                    requests_sent,
                                    elapsed: started.elapsed(),
                                });
                            }
                        }
                    }
                }
                _ = retry_tick.tick() => {
                    if let Some(max) = self.config.max_request_attempts {
                        if requests_sent >= max {
                            warn!(requests_sent, "Negotiation retry budget exhausted");
                            return self
                                .abandon(NegotiationError::RetryBudgetExhausted { attempts: requests_sent })
                                .await;
                        }
                    }
                    if let Some(request) = machine.request_work() {
                        requests_sent += 1;
                        debug!(attempt = requests_sent, state = ?machine.state(), "Re-requesting work");
                        self.send(&request).await;
                    }
                }
            }
        }
    }

    async fn send(&self, message: &NegotiationMessage) {
        metrics::negotiation_message(message.kind());
        let bytes = match message.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "Could not encode negotiation message");
                return;
            }
        };
        if let Err(e) = self.channel.publish(&self.config.topic, bytes).await {
            debug!(kind = message.kind(), error = %e, "Negotiation message not delivered");
        }
    }

    async fn abandon(&self, error: NegotiationError) -> Result<Authorization, NegotiationError> {
        if let Err(e) = self.channel.unsubscribe(&self.config.topic).await {
            debug!(error = %e, "Negotiation unsubscribe failed");
        }
        Err(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assignment(target: &str, refs: &[ContentRef]) -> NegotiationMessage {
        NegotiationMessage::Assignment {
            target: target.to_string(),
            refs: refs.to_vec(),
        }
    }

    fn delivery(target: &str, content: &[u8]) -> NegotiationMessage {
        NegotiationMessage::DataDelivery {
            target: target.to_string(),
            content_ref: ContentRef::for_bytes(content),
            content: content.to_vec(),
        }
    }

    fn ready_machine() -> InitiatorMachine {
        let mut m = InitiatorMachine::new("me");
        m.subscribed();
        m.mesh_ready();
        assert_eq!(m.request_work(), Some(NegotiationMessage::RequestWork));
        m
    }

    #[test]
    fn test_full_path_to_authorized() {
        let mut m = ready_machine();
        let data = b"[ASSET-1-7]";
        let r = ContentRef::for_bytes(data);

        let actions = m.on_message("relay", &assignment("me", &[r, ContentRef::for_bytes(b"other")]));
        assert_eq!(
            actions,
            vec![InitiatorAction::Send(NegotiationMessage::FetchData { content_ref: r })]
        );
        assert_eq!(m.state(), InitiatorState::FetchingData);

        let actions = m.on_message("relay", &delivery("me", data));
        assert_eq!(actions.len(), 2);
        assert!(matches!(actions[0], InitiatorAction::Store { .. }));
        assert_eq!(
            actions[1],
            InitiatorAction::Send(NegotiationMessage::SubmitProof {
                content_ref: r,
                content: data.to_vec()
            })
        );
        assert_eq!(m.state(), InitiatorState::SubmittingProof);

        let actions = m.on_message("relay", &NegotiationMessage::AccessGranted { target: "me".to_string() });
        assert_eq!(
            actions,
            vec![InitiatorAction::Authorized {
                responder: "relay".to_string()
            }]
        );
        assert_eq!(m.state(), InitiatorState::Authorized);
        assert_eq!(m.request_work(), None);
    }

    #[test]
    fn test_messages_for_others_are_ignored() {
        let mut m = ready_machine();
        let r = ContentRef::for_bytes(b"x");
        assert!(m.on_message("relay", &assignment("someone-else", &[r])).is_empty());
        assert!(m
            .on_message("relay", &NegotiationMessage::AccessGranted { target: "someone-else".to_string() })
            .is_empty());
        assert!(m.on_message("me", &assignment("me", &[r])).is_empty());
        assert!(m.on_message("peer", &NegotiationMessage::RequestWork).is_empty());
        assert_eq!(m.state(), InitiatorState::AwaitingAssignment);
    }

    #[test]
    fn test_repeat_assignment_refetches_same_ref_without_regressing() {
        let mut m = ready_machine();
        let first = ContentRef::for_bytes(b"a");
        let second = ContentRef::for_bytes(b"b");
        m.on_message("relay", &assignment("me", &[first]));
        m.on_message("relay", &delivery("me", b"a"));
        assert_eq!(m.state(), InitiatorState::SubmittingProof);

        let actions = m.on_message("relay", &assignment("me", &[second, first]));
        assert_eq!(
            actions,
            vec![InitiatorAction::Send(NegotiationMessage::FetchData { content_ref: first })]
        );
        assert_eq!(m.state(), InitiatorState::SubmittingProof);
    }

    #[test]
    fn test_assignment_without_pinned_ref_switches_to_its_first() {
        use crate::core_negotiation::{DataLibrary, Responder};

        let old = DataLibrary::from_contents((1..=5).map(|i| format!("[ASSET-{}-old]", i).into_bytes()));
        let new = DataLibrary::from_contents((1..=5).map(|i| format!("[ASSET-{}-new]", i).into_bytes()));
        let mut m = ready_machine();
        m.on_message("relay", &assignment("me", &old.first(5)));
        assert_eq!(m.fetching(), Some(old.first(1)[0]));

        // the delivery was lost and the relay came back with a fresh library
        let mut responder = Responder::new(new.clone(), 5);
        let mut outbox = vec![m.request_work().unwrap()];
        for _ in 0..10 {
            let Some(request) = outbox.pop() else { break };
            let Some(reply) = responder.handle("me", &request).reply else { break };
            for action in m.on_message("relay", &reply) {
                if let InitiatorAction::Send(next) = action {
                    outbox.push(next);
                }
            }
        }

        assert_eq!(m.state(), InitiatorState::Authorized);
        assert_eq!(m.fetching(), Some(new.first(1)[0]));
        assert!(responder.is_authorized("me"));
    }

    #[test]
    fn test_unrequested_or_corrupt_delivery_is_ignored() {
        let mut m = ready_machine();
        let r = ContentRef::for_bytes(b"wanted");
        m.on_message("relay", &assignment("me", &[r]));

        assert!(m.on_message("relay", &delivery("me", b"unwanted")).is_empty());

        let forged = NegotiationMessage::DataDelivery {
            target: "me".to_string(),
            content_ref: r,
            content: b"forged".to_vec(),
        };
        assert!(m.on_message("relay", &forged).is_empty());
        assert_eq!(m.state(), InitiatorState::FetchingData);
    }

    #[test]
    fn test_replays_after_authorized_are_noops() {
        let mut m = ready_machine();
        let r = ContentRef::for_bytes(b"a");
        m.on_message("relay", &assignment("me", &[r]));
        m.on_message("relay", &delivery("me", b"a"));
        m.on_message("relay", &NegotiationMessage::AccessGranted { target: "me".to_string() });

        for replay in [
            assignment("me", &[r]),
            delivery("me", b"a"),
            NegotiationMessage::AccessGranted { target: "me".to_string() },
        ] {
            assert!(m.on_message("relay", &replay).is_empty());
        }
        assert_eq!(m.state(), InitiatorState::Authorized);
    }

    #[test]
    fn test_assignment_before_request_is_ignored() {
        let mut m = InitiatorMachine::new("me");
        m.subscribed();
        assert!(m
            .on_message("relay", &assignment("me", &[ContentRef::for_bytes(b"a")]))
            .is_empty());
        assert_eq!(m.state(), InitiatorState::AwaitingPeer);
    }
}
