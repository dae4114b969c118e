/*
    Responder - gatekeeper side of the handshake

    Holds a library of generated assets and one session per initiator:

        Unassigned -> Assigned -> Verifying -> Granted

    REQUEST_WORK assigns the first `assignment_batch` refs, FETCH_DATA serves
    any library ref, SUBMIT_PROOF compares bytes against the library. A match
    grants access exactly once; a mismatch gets no reply at all. A granted
    peer asking again is simply told ACCESS_GRANTED again.

    Replies go out after `settle_delay`, giving the requester's side of the
    mesh time to form so the reply is not lost.
*/

use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, info, trace, warn};

use super::{NegotiationError, NegotiationMessage};
use crate::config::NegotiationConfig;
use crate::core_content::{ContentError, ContentRef, ContentStore};
use crate::core_pubsub::{BroadcastChannel, InboundMessage};
use crate::metrics;
use crate::shutdown::ShutdownListener;

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Asset {
    pub content_ref: ContentRef,
    pub content: Vec<u8>,
}

/// Assets an initiator may be asked to retrieve
#[derive(Debug, Clone, Default)]
pub struct DataLibrary {
    assets: Vec<Asset>,
    index: HashMap<ContentRef, usize>,
}

impl DataLibrary {
    pub fn from_contents<I>(contents: I) -> Self
    where
        I: IntoIterator<Item = Vec<u8>>,
    {
        let mut library = Self::default();
        for content in contents {
            library.push(ContentRef::for_bytes(&content), content);
        }
        library
    }

    /// `size` fresh `[ASSET-<i>-<random>]` blobs, each stored in `store`
    pub async fn generate(size: usize, store: &dyn ContentStore) -> Result<Self, ContentError> {
        let mut library = Self::default();
        for i in 1..=size {
            let nonce: u64 = rand::rng().random();
            let content = format!("[ASSET-{}-{}]", i, nonce).into_bytes();
            let content_ref = store.put(content.clone()).await?;
            library.push(content_ref, content);
        }
        debug!(assets = library.len(), "Data library ready");
        Ok(library)
    }

    fn push(&mut self, content_ref: ContentRef, content: Vec<u8>) {
        if self.index.contains_key(&content_ref) {
            return;
        }
        self.index.insert(content_ref, self.assets.len());
        self.assets.push(Asset { content_ref, content });
    }

    pub fn first(&self, n: usize) -> Vec<ContentRef> {
        self.assets.iter().take(n).map(|a| a.content_ref).collect()
    }

    pub fn get(&self, content_ref: &ContentRef) -> Option<&[u8]> {
        self.index
            .get(content_ref)
            .map(|&i| self.assets[i].content.as_slice())
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Unassigned,
    Assigned,
    Verifying,
    Granted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiationSession {
    pub state: SessionState,
    pub assigned_refs: Vec<ContentRef>,
    pub proven_ref: Option<ContentRef>,
}

impl NegotiationSession {
    fn new() -> Self {
        Self {
            state: SessionState::Unassigned,
            assigned_refs: Vec::new(),
            proven_ref: None,
        }
    }

    fn advance(&mut self, to: SessionState) {
        if to > self.state {
            self.state = to;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponderEvent {
    Authorized { identity: String, proven_ref: ContentRef },
}

/// What handling one request produced
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Handled {
    pub reply: Option<NegotiationMessage>,
    /// Set only on the request that granted access
    pub granted: Option<ContentRef>,
}

/// Session bookkeeping, free of I/O
#[derive(Debug)]
pub struct Responder {
    library: DataLibrary,
    assignment_batch: usize,
    sessions: HashMap<String, NegotiationSession>,
}

impl Responder {
    pub fn new(library: DataLibrary, assignment_batch: usize) -> Self {
        Self {
            library,
            assignment_batch,
            sessions: HashMap::new(),
        }
    }

    pub fn library(&self) -> &DataLibrary {
        &self.library
    }

    pub fn session(&self, identity: &str) -> Option<&NegotiationSession> {
        self.sessions.get(identity)
    }

    pub fn is_authorized(&self, identity: &str) -> bool {
        self.sessions
            .get(identity)
            .is_some_and(|s| s.state == SessionState::Granted)
    }

    pub fn authorized_peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.state == SessionState::Granted)
            .map(|(id, _)| id.clone())
            .collect();
        peers.sort();
        peers
    }

    pub fn handle(&mut self, from: &str, message: &NegotiationMessage) -> Handled {
        match message {
            NegotiationMessage::RequestWork => {
                let refs = self.library.first(self.assignment_batch);
                let session = self
                    .sessions
                    .entry(from.to_string())
                    .or_insert_with(NegotiationSession::new);
                if session.state == SessionState::Granted {
                    return Handled {
                        reply: Some(NegotiationMessage::AccessGranted {
                            target: from.to_string(),
                        }),
                        granted: None,
                    };
                }
                if refs.is_empty() {
                    return Handled::default();
                }
                if session.assigned_refs.is_empty() {
                    session.assigned_refs = refs.clone();
                }
                session.advance(SessionState::Assigned);
                Handled {
                    reply: Some(NegotiationMessage::Assignment {
                        target: from.to_string(),
                        refs: session.assigned_refs.clone(),
                    }),
                    granted: None,
                }
            }
            NegotiationMessage::FetchData { content_ref } => {
                let Some(content) = self.library.get(content_ref) else {
                    trace!(from, content_ref = %content_ref.short(), "Fetch for unknown ref");
                    return Handled::default();
                };
                let content = content.to_vec();
                if let Some(session) = self.sessions.get_mut(from) {
                    if session.assigned_refs.contains(content_ref) {
                        session.advance(SessionState::Verifying);
                    }
                }
                Handled {
                    reply: Some(NegotiationMessage::DataDelivery {
                        target: from.to_string(),
                        content_ref: *content_ref,
                        content,
                    }),
                    granted: None,
                }
            }
            NegotiationMessage::SubmitProof { content_ref, content } => {
                let matches = self
                    .library
                    .get(content_ref)
                    .is_some_and(|expected| expected == content.as_slice());
                if !matches {
                    metrics::negotiation_proof_rejected();
                    debug!(from, content_ref = %content_ref.short(), "Proof rejected");
                    return Handled::default();
                }

                // only a ref this peer was assigned counts as proof
                let Some(session) = self
                    .sessions
                    .get_mut(from)
                    .filter(|s| s.assigned_refs.contains(content_ref))
                else {
                    metrics::negotiation_proof_rejected();
                    debug!(from, content_ref = %content_ref.short(), "Proof for unassigned ref");
                    return Handled::default();
                };
                let reply = Some(NegotiationMessage::AccessGranted {
                    target: from.to_string(),
                });
                if session.state == SessionState::Granted {
                    return Handled { reply, granted: None };
                }
                session.advance(SessionState::Granted);
                session.proven_ref = Some(*content_ref);
                Handled {
                    reply,
                    granted: Some(*content_ref),
                }
            }
            // replies from some other responder
            _ => Handled::default(),
        }
    }
}

/// Serves the handshake on the negotiation topic until shutdown
pub struct ResponderService {
    responder: Responder,
    channel: Arc<dyn BroadcastChannel>,
    topic: String,
    settle_delay: Duration,
    event_tx: broadcast::Sender<ResponderEvent>,
}

impl ResponderService {
    pub fn new(responder: Responder, channel: Arc<dyn BroadcastChannel>, config: &NegotiationConfig) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            responder,
            channel,
            topic: config.topic.clone(),
            settle_delay: config.settle_delay,
            event_tx,
        }
    }

    pub fn events(&self) -> broadcast::Receiver<ResponderEvent> {
        self.event_tx.subscribe()
    }

    /// Runs until shutdown; returns the final session table for inspection
    pub async fn run(mut self, mut shutdown: ShutdownListener) -> Result<Responder, NegotiationError> {
        let mut subscription = self.channel.subscribe(&self.topic).await?;
        info!(
            topic = %self.topic,
            assets = self.responder.library().len(),
            "Negotiation responder started"
        );
        let mut replies = JoinSet::new();

        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => break,
                inbound = subscription.recv() => match inbound {
                    Some(inbound) => self.on_message(inbound, &mut replies),
                    None => {
                        warn!(topic = %self.topic, "Negotiation subscription closed");
                        break;
                    }
                },
                Some(_) = replies.join_next() => {}
            }
        }

        replies.shutdown().await;
        if let Err(e) = self.channel.unsubscribe(&self.topic).await {
            debug!(error = %e, "Negotiation unsubscribe failed");
        }
        info!(authorized = self.responder.authorized_peers().len(), "Negotiation responder stopped");
        Ok(self.responder)
    }

    fn on_message(&mut self, inbound: InboundMessage, replies: &mut JoinSet<()>) {
        if inbound.from == self.channel.local_identity() {
            return;
        }
        let message = match NegotiationMessage::decode(&inbound.data) {
            Ok(message) => message,
            Err(e) => {
                debug!(from = %inbound.from, error = %e, "Bad negotiation message");
                return;
            }
        };
        let from = inbound.from;
        debug!(from = %short_id(&from), kind = message.kind(), "Negotiation message");
        metrics::negotiation_message(message.kind());

        let handled = self.responder.handle(&from, &message);
        if let Some(proven_ref) = handled.granted {
            metrics::negotiation_granted();
            info!(peer = %short_id(&from), "Access granted");
            let _ = self.event_tx.send(ResponderEvent::Authorized {
                identity: from.clone(),
                proven_ref,
            });
        }
        let Some(reply) = handled.reply else {
            return;
        };

        let channel = self.channel.clone();
        let topic = self.topic.clone();
        let settle_delay = self.settle_delay;
        replies.spawn(async move {
            tokio::time::sleep(settle_delay).await;
            let subscribers = channel.subscriber_count(&topic).await;
            debug!(subscribers, kind = reply.kind(), "Broadcasting reply");
            let bytes = match reply.encode() {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(error = %e, "Could not encode negotiation reply");
                    return;
                }
            };
            metrics::negotiation_message(reply.kind());
            if let Err(e) = channel.publish(&topic, bytes).await {
                debug!(kind = reply.kind(), error = %e, "Reply not delivered");
            }
        });
    }
}

fn short_id(identity: &str) -> &str {
    let start = identity.len().saturating_sub(6);
    identity.get(start..).unwrap_or(identity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_content::MemoryContentStore;

    fn library() -> DataLibrary {
        DataLibrary::from_contents((1..=8).map(|i| format!("[ASSET-{}-0]", i).into_bytes()))
    }

    fn proof(library: &DataLibrary, index: usize) -> NegotiationMessage {
        let content_ref = library.first(index + 1)[index];
        NegotiationMessage::SubmitProof {
            content_ref,
            content: library.get(&content_ref).unwrap().to_vec(),
        }
    }

    #[tokio::test]
    async fn test_generated_library_is_stored() {
        let store = MemoryContentStore::new();
        let library = DataLibrary::generate(100, &store).await.unwrap();
        assert_eq!(library.len(), 100);
        assert_eq!(store.len(), 100);

        let first = library.first(1)[0];
        let content = String::from_utf8(store.get(&first).await.unwrap()).unwrap();
        assert!(content.starts_with("[ASSET-1-") && content.ends_with(']'));
        assert_eq!(library.get(&first), Some(content.as_bytes()));
    }

    #[test]
    fn test_exact_exchange_grants_once() {
        let lib = library();
        let mut responder = Responder::new(lib.clone(), 5);

        let handled = responder.handle("peer", &NegotiationMessage::RequestWork);
        let Some(NegotiationMessage::Assignment { target, refs }) = handled.reply else {
            panic!("expected assignment");
        };
        assert_eq!(target, "peer");
        assert_eq!(refs, lib.first(5));
        assert_eq!(responder.session("peer").unwrap().state, SessionState::Assigned);

        let handled = responder.handle("peer", &NegotiationMessage::FetchData { content_ref: refs[0] });
        assert!(matches!(handled.reply, Some(NegotiationMessage::DataDelivery { .. })));
        assert_eq!(responder.session("peer").unwrap().state, SessionState::Verifying);

        let handled = responder.handle("peer", &proof(&lib, 0));
        assert_eq!(handled.granted, Some(refs[0]));
        assert_eq!(
            handled.reply,
            Some(NegotiationMessage::AccessGranted {
                target: "peer".to_string()
            })
        );
        assert!(responder.is_authorized("peer"));
        assert_eq!(responder.session("peer").unwrap().proven_ref, Some(refs[0]));
    }

    #[test]
    fn test_tampered_proof_never_grants() {
        let lib = library();
        let mut responder = Responder::new(lib.clone(), 5);
        responder.handle("peer", &NegotiationMessage::RequestWork);
        let r = lib.first(1)[0];
        responder.handle("peer", &NegotiationMessage::FetchData { content_ref: r });

        let mut tampered = lib.get(&r).unwrap().to_vec();
        tampered.push(b'!');
        let handled = responder.handle(
            "peer",
            &NegotiationMessage::SubmitProof {
                content_ref: r,
                content: tampered,
            },
        );
        assert_eq!(handled, Handled::default());

        let unknown = responder.handle(
            "peer",
            &NegotiationMessage::SubmitProof {
                content_ref: ContentRef::for_bytes(b"nope"),
                content: b"nope".to_vec(),
            },
        );
        assert_eq!(unknown, Handled::default());
        assert!(!responder.is_authorized("peer"));
        assert_eq!(responder.session("peer").unwrap().state, SessionState::Verifying);
    }

    #[test]
    fn test_replays_after_grant_have_no_side_effects() {
        let lib = library();
        let mut responder = Responder::new(lib.clone(), 5);
        responder.handle("peer", &NegotiationMessage::RequestWork);
        assert!(responder.handle("peer", &proof(&lib, 0)).granted.is_some());
        let before = responder.session("peer").cloned();

        let again = responder.handle("peer", &proof(&lib, 0));
        assert_eq!(again.granted, None);
        assert!(matches!(again.reply, Some(NegotiationMessage::AccessGranted { .. })));

        let rerequest = responder.handle("peer", &NegotiationMessage::RequestWork);
        assert_eq!(
            rerequest.reply,
            Some(NegotiationMessage::AccessGranted {
                target: "peer".to_string()
            })
        );
        responder.handle("peer", &NegotiationMessage::FetchData { content_ref: lib.first(1)[0] });
        assert_eq!(responder.session("peer").cloned(), before);
        assert_eq!(responder.authorized_peers(), vec!["peer".to_string()]);
    }

    #[test]
    fn test_proof_for_unassigned_ref_is_rejected() {
        let lib = library();
        let mut responder = Responder::new(lib.clone(), 5);

        // no session yet
        assert_eq!(responder.handle("peer", &proof(&lib, 0)), Handled::default());
        assert!(responder.session("peer").is_none());

        responder.handle("peer", &NegotiationMessage::RequestWork);
        // genuine library content, but outside the assigned batch
        assert_eq!(responder.handle("peer", &proof(&lib, 6)), Handled::default());
        assert_eq!(responder.session("peer").unwrap().state, SessionState::Assigned);

        assert!(responder.handle("peer", &proof(&lib, 4)).granted.is_some());
    }

    #[test]
    fn test_sessions_are_per_peer() {
        let lib = library();
        let mut responder = Responder::new(lib.clone(), 5);
        responder.handle("a", &NegotiationMessage::RequestWork);
        responder.handle("b", &NegotiationMessage::RequestWork);
        responder.handle("a", &proof(&lib, 1));

        assert!(responder.is_authorized("a"));
        assert!(!responder.is_authorized("b"));
        assert_eq!(responder.session("b").unwrap().state, SessionState::Assigned);
    }

    #[test]
    fn test_ignores_other_responders_replies_and_unknown_fetches() {
        let mut responder = Responder::new(library(), 5);
        let handled = responder.handle(
            "other-relay",
            &NegotiationMessage::AccessGranted {
                target: "x".to_string(),
            },
        );
        assert_eq!(handled, Handled::default());
        let fetch = responder.handle(
            "peer",
            &NegotiationMessage::FetchData {
                content_ref: ContentRef::for_bytes(b"missing"),
            },
        );
        assert_eq!(fetch, Handled::default());
        assert!(responder.session("other-relay").is_none());
    }

    #[test]
    fn test_short_id() {
        assert_eq!(short_id("12D3KooWabcdef"), "abcdef");
        assert_eq!(short_id("xy"), "xy");
    }
}
