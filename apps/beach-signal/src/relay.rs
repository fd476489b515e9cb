use tracing::{debug, info, warn};

use crate::envelope::{Envelope, InboundEnvelope, MessageType};
use crate::registry::{PeerHandle, Registry};

/// What the relay did with one inbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Not a usable envelope; dropped
    Malformed,
    Registered { superseded: bool },
    /// Delivered to the destination's connection
    Forwarded,
    ReceiverNotFound,
    ReceiverNotOpen,
    /// `initiate_call` to an offline callee; the caller got an error envelope
    CallerNotified,
    UnknownType,
}

/// Connection registry plus message dispatch. One instance per process,
/// shared by the socket handlers and the HTTP debug endpoints.
#[derive(Debug, Default)]
pub struct Relay {
    registry: Registry,
}

impl Relay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Bind an identity that was verified at admission time
    pub fn admit(&self, identity: &str, peer: &PeerHandle) {
        self.registry.bind(identity, peer.clone());
        info!("User {} admitted on connection {}", identity, peer.id());
    }

    /// Remove whatever bindings `peer` still owns
    pub fn disconnect(&self, peer: &PeerHandle) {
        let released = self.registry.release(peer.id());
        if released.is_empty() {
            debug!("Connection {} closed with no live binding", peer.id());
        }
        for identity in released {
            info!("User {} disconnected", identity);
        }
    }

    pub fn handle_text(&self, origin: &PeerHandle, text: &str) -> RouteOutcome {
        let envelope = match InboundEnvelope::parse(text) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(
                    "Invalid WebSocket message format from connection {}: {}",
                    origin.id(),
                    err
                );
                return RouteOutcome::Malformed;
            }
        };

        debug!("Handling message: {} from: {}", envelope.kind, envelope.from);

        let Some(kind) = envelope.message_type() else {
            warn!("Unknown message type: {}", envelope.kind);
            return RouteOutcome::UnknownType;
        };

        if kind.requires_destination() && envelope.to.is_none() {
            warn!("Dropping {} from {}: missing destination", kind, envelope.from);
            return RouteOutcome::Malformed;
        }

        match kind {
            MessageType::Register => {
                let superseded = self.registry.bind(&envelope.from, origin.clone()).is_some();
                info!("User {} registered", envelope.from);
                RouteOutcome::Registered { superseded }
            }
            MessageType::Offer | MessageType::Answer | MessageType::Candidate => {
                self.forward_verbatim(kind, &envelope, text)
            }
            MessageType::InitiateCall => self.initiate_call(origin, &envelope),
            MessageType::AcceptCall => self.answer_call(MessageType::CallAccepted, &envelope),
            MessageType::DeclineCall => self.answer_call(MessageType::CallDeclined, &envelope),
            MessageType::CallAccepted
            | MessageType::CallDeclined
            | MessageType::Error
            | MessageType::Chat => {
                warn!("Unknown message type: {}", kind);
                RouteOutcome::UnknownType
            }
        }
    }

    fn forward_verbatim(&self, kind: MessageType, envelope: &InboundEnvelope, text: &str) -> RouteOutcome {
        let to = envelope.to.as_deref().unwrap_or_default();
        let Some(receiver) = self.registry.get(to) else {
            warn!("Receiver {} not found", to);
            return RouteOutcome::ReceiverNotFound;
        };
        self.deliver(&receiver, to, kind, text.to_string())
    }

    fn initiate_call(&self, origin: &PeerHandle, envelope: &InboundEnvelope) -> RouteOutcome {
        let to = envelope.to.as_deref().unwrap_or_default();
        let outcome = match self.registry.get(to) {
            Some(receiver) => {
                let call = Envelope::call_control(
                    MessageType::InitiateCall,
                    &envelope.from,
                    to,
                    envelope.call_id.clone(),
                );
                self.deliver_envelope(&receiver, to, &call)
            }
            None => {
                warn!("Receiver {} not found", to);
                RouteOutcome::ReceiverNotFound
            }
        };
        if outcome == RouteOutcome::Forwarded {
            return outcome;
        }

        let reply = Envelope::recipient_offline(&envelope.from, to, envelope.call_id.clone());
        self.deliver_envelope(origin, &envelope.from, &reply);
        RouteOutcome::CallerNotified
    }

    /// accept_call / decline_call: tell the original caller, no reply to the
    /// answering side when the caller is gone
    fn answer_call(&self, kind: MessageType, envelope: &InboundEnvelope) -> RouteOutcome {
        let to = envelope.to.as_deref().unwrap_or_default();
        let Some(receiver) = self.registry.get(to) else {
            warn!("Receiver {} not found for {}", to, kind);
            return RouteOutcome::ReceiverNotFound;
        };
        let reply = Envelope::call_control(kind, &envelope.from, to, envelope.call_id.clone());
        self.deliver_envelope(&receiver, to, &reply)
    }

    fn deliver_envelope(&self, receiver: &PeerHandle, to: &str, envelope: &Envelope) -> RouteOutcome {
        match serde_json::to_string(envelope) {
            Ok(frame) => self.deliver(receiver, to, envelope.kind, frame),
            Err(err) => {
                warn!("Failed to encode {} for {}: {}", envelope.kind, to, err);
                RouteOutcome::Malformed
            }
        }
    }

    fn deliver(&self, receiver: &PeerHandle, to: &str, kind: MessageType, frame: String) -> RouteOutcome {
        if !receiver.is_open() {
            warn!("Receiver {} WebSocket is not open", to);
            return RouteOutcome::ReceiverNotOpen;
        }
        match receiver.send(frame) {
            Ok(()) => {
                debug!("Sent {} to {}", kind, to);
                RouteOutcome::Forwarded
            }
            Err(err) => {
                warn!("Failed to send {} to {}: {}", kind, to, err);
                RouteOutcome::ReceiverNotOpen
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use tokio::sync::mpsc;

    struct Client {
        handle: PeerHandle,
        rx: mpsc::UnboundedReceiver<String>,
    }

    impl Client {
        fn new() -> Self {
            let (tx, rx) = mpsc::unbounded_channel();
            Self {
                handle: PeerHandle::new(tx),
                rx,
            }
        }

        fn next_frame(&mut self) -> Option<String> {
            self.rx.try_recv().ok()
        }

        fn next_json(&mut self) -> Option<Value> {
            self.next_frame()
                .map(|frame| serde_json::from_str(&frame).unwrap())
        }
    }

    fn register(relay: &Relay, client: &Client, identity: &str) -> RouteOutcome {
        relay.handle_text(
            &client.handle,
            &json!({"type": "register", "from": identity}).to_string(),
        )
    }

    #[test_timeout::timeout]
    fn offer_reaches_destination_unchanged() {
        let relay = Relay::new();
        let a = Client::new();
        let mut b = Client::new();
        register(&relay, &a, "A");
        register(&relay, &b, "B");

        let frame = r#"{"type":"offer","from":"A","to":"B","sdp":"X"}"#;
        assert_eq!(relay.handle_text(&a.handle, frame), RouteOutcome::Forwarded);
        assert_eq!(b.next_frame().as_deref(), Some(frame));
        assert!(b.next_frame().is_none());
    }

    #[test_timeout::timeout]
    fn non_string_call_id_is_forwarded_unchanged() {
        let relay = Relay::new();
        let a = Client::new();
        let mut b = Client::new();
        register(&relay, &a, "A");
        register(&relay, &b, "B");

        let frame = r#"{"type":"offer","from":"A","to":"B","sdp":"X","callId":42}"#;
        assert_eq!(relay.handle_text(&a.handle, frame), RouteOutcome::Forwarded);
        assert_eq!(b.next_frame().as_deref(), Some(frame));

        relay.handle_text(
            &a.handle,
            &json!({"type": "initiate_call", "from": "A", "to": "B", "callId": {"n": 7}})
                .to_string(),
        );
        assert_eq!(
            b.next_json(),
            Some(json!({"type": "initiate_call", "from": "A", "to": "B", "callId": {"n": 7}}))
        );
    }

    #[test_timeout::timeout]
    fn register_ignores_non_string_to() {
        let relay = Relay::new();
        let a = Client::new();

        let outcome = relay.handle_text(&a.handle, r#"{"type":"register","from":"A","to":5}"#);
        assert_eq!(outcome, RouteOutcome::Registered { superseded: false });
        assert_eq!(relay.registry().identities(), vec!["A".to_string()]);
    }

    #[test_timeout::timeout]
    fn answer_and_candidate_keep_opaque_payloads() {
        let relay = Relay::new();
        let mut a = Client::new();
        let b = Client::new();
        register(&relay, &a, "A");
        register(&relay, &b, "B");

        let answer = r#"{"type":"answer","from":"B","to":"A","sdp":{"type":"answer","sdp":"v=0\r\n"},"extra":[1,2]}"#;
        let candidate = r#"{"type":"candidate","from":"B","to":"A","candidate":{"candidate":"candidate:1 1 udp 2122260223 10.0.0.2 54321 typ host","sdpMid":"0"}}"#;
        relay.handle_text(&b.handle, answer);
        relay.handle_text(&b.handle, candidate);

        assert_eq!(a.next_frame().as_deref(), Some(answer));
        assert_eq!(a.next_frame().as_deref(), Some(candidate));
    }

    #[test_timeout::timeout]
    fn unbound_destination_is_dropped_without_reply() {
        let relay = Relay::new();
        let mut a = Client::new();
        register(&relay, &a, "A");

        let outcome = relay.handle_text(
            &a.handle,
            &json!({"type": "offer", "from": "A", "to": "nobody", "sdp": "X"}).to_string(),
        );
        assert_eq!(outcome, RouteOutcome::ReceiverNotFound);
        assert!(a.next_frame().is_none());
    }

    #[test_timeout::timeout]
    fn closed_destination_is_dropped() {
        let relay = Relay::new();
        let mut a = Client::new();
        let b = Client::new();
        register(&relay, &a, "A");
        register(&relay, &b, "B");
        drop(b.rx);

        let outcome = relay.handle_text(
            &a.handle,
            &json!({"type": "candidate", "from": "A", "to": "B", "candidate": "c"}).to_string(),
        );
        assert_eq!(outcome, RouteOutcome::ReceiverNotOpen);
        assert!(a.next_frame().is_none());
    }

    #[test_timeout::timeout]
    fn initiate_call_is_rebuilt_for_callee() {
        let relay = Relay::new();
        let mut a = Client::new();
        let mut b = Client::new();
        register(&relay, &a, "A");
        register(&relay, &b, "B");

        let outcome = relay.handle_text(
            &a.handle,
            &json!({"type": "initiate_call", "from": "A", "to": "B", "callId": "c1", "sdp": "dropped"})
                .to_string(),
        );
        assert_eq!(outcome, RouteOutcome::Forwarded);
        assert_eq!(
            b.next_json(),
            Some(json!({"type": "initiate_call", "from": "A", "to": "B", "callId": "c1"}))
        );
        assert!(a.next_frame().is_none());
    }

    #[test_timeout::timeout]
    fn initiate_call_to_offline_callee_echoes_one_error() {
        let relay = Relay::new();
        let mut a = Client::new();
        register(&relay, &a, "A");

        let outcome = relay.handle_text(
            &a.handle,
            &json!({"type": "initiate_call", "from": "A", "to": "C", "callId": "c1"}).to_string(),
        );
        assert_eq!(outcome, RouteOutcome::CallerNotified);
        assert_eq!(
            a.next_json(),
            Some(json!({
                "type": "error",
                "from": "C",
                "to": "A",
                "callId": "c1",
                "message": "Recipient not online",
            }))
        );
        assert!(a.next_frame().is_none());
    }

    #[test_timeout::timeout]
    fn initiate_call_to_closed_callee_echoes_error() {
        let relay = Relay::new();
        let mut a = Client::new();
        let c = Client::new();
        register(&relay, &a, "A");
        register(&relay, &c, "C");
        drop(c.rx);

        let outcome = relay.handle_text(
            &a.handle,
            &json!({"type": "initiate_call", "from": "A", "to": "C", "callId": "c2"}).to_string(),
        );
        assert_eq!(outcome, RouteOutcome::CallerNotified);
        let reply = a.next_json().unwrap();
        assert_eq!(reply["type"], "error");
        assert_eq!(reply["callId"], "c2");
    }

    #[test_timeout::timeout]
    fn accept_and_decline_notify_caller() {
        let relay = Relay::new();
        let mut a = Client::new();
        let mut b = Client::new();
        register(&relay, &a, "A");
        register(&relay, &b, "B");

        relay.handle_text(
            &b.handle,
            &json!({"type": "accept_call", "from": "B", "to": "A", "callId": "c1"}).to_string(),
        );
        relay.handle_text(
            &b.handle,
            &json!({"type": "decline_call", "from": "B", "to": "A", "callId": "c2"}).to_string(),
        );

        assert_eq!(
            a.next_json(),
            Some(json!({"type": "call_accepted", "from": "B", "to": "A", "callId": "c1"}))
        );
        assert_eq!(
            a.next_json(),
            Some(json!({"type": "call_declined", "from": "B", "to": "A", "callId": "c2"}))
        );
        assert!(b.next_frame().is_none());
    }

    #[test_timeout::timeout]
    fn accept_to_missing_caller_sends_nothing() {
        let relay = Relay::new();
        let mut b = Client::new();
        register(&relay, &b, "B");

        let outcome = relay.handle_text(
            &b.handle,
            &json!({"type": "accept_call", "from": "B", "to": "A", "callId": "c1"}).to_string(),
        );
        assert_eq!(outcome, RouteOutcome::ReceiverNotFound);
        assert!(b.next_frame().is_none());
    }

    #[test_timeout::timeout]
    fn decline_to_missing_caller_sends_nothing() {
        let relay = Relay::new();
        let mut b = Client::new();
        register(&relay, &b, "B");

        let outcome = relay.handle_text(
            &b.handle,
            &json!({"type": "decline_call", "from": "B", "to": "A", "callId": "c1"}).to_string(),
        );
        assert_eq!(outcome, RouteOutcome::ReceiverNotFound);
        assert!(b.next_frame().is_none());
    }

    #[test_timeout::timeout]
    fn answer_to_closed_caller_sends_nothing() {
        let relay = Relay::new();
        let a = Client::new();
        let mut b = Client::new();
        register(&relay, &a, "A");
        register(&relay, &b, "B");
        drop(a.rx);

        for kind in ["accept_call", "decline_call"] {
            let outcome = relay.handle_text(
                &b.handle,
                &json!({"type": kind, "from": "B", "to": "A", "callId": "c1"}).to_string(),
            );
            assert_eq!(outcome, RouteOutcome::ReceiverNotOpen);
        }
        assert!(b.next_frame().is_none());
        assert!(relay.registry().get("A").is_some());
    }

    #[test_timeout::timeout]
    fn malformed_and_unknown_frames_are_dropped() {
        let relay = Relay::new();
        let mut a = Client::new();
        register(&relay, &a, "A");

        assert_eq!(relay.handle_text(&a.handle, "{"), RouteOutcome::Malformed);
        assert_eq!(
            relay.handle_text(&a.handle, r#"{"type":"offer","to":"A"}"#),
            RouteOutcome::Malformed
        );
        assert_eq!(
            relay.handle_text(&a.handle, r#"{"type":"offer","from":"A"}"#),
            RouteOutcome::Malformed
        );
        assert_eq!(
            relay.handle_text(&a.handle, r#"{"type":"wave","from":"A","to":"A"}"#),
            RouteOutcome::UnknownType
        );
        assert_eq!(
            relay.handle_text(&a.handle, r#"{"type":"chat","from":"A","to":"A","message":"hi"}"#),
            RouteOutcome::UnknownType
        );
        assert!(a.next_frame().is_none());
        assert_eq!(relay.registry().identities(), vec!["A".to_string()]);
    }

    #[test_timeout::timeout]
    fn register_sequence_keeps_latest_connection() {
        let relay = Relay::new();
        let first = Client::new();
        let second = Client::new();
        let third = Client::new();

        assert_eq!(
            register(&relay, &first, "A"),
            RouteOutcome::Registered { superseded: false }
        );
        assert_eq!(
            register(&relay, &second, "A"),
            RouteOutcome::Registered { superseded: true }
        );
        register(&relay, &third, "B");
        register(&relay, &first, "B");

        let registry = relay.registry();
        assert_eq!(registry.get("A").unwrap().id(), second.handle.id());
        assert_eq!(registry.get("B").unwrap().id(), first.handle.id());
    }

    #[test_timeout::timeout]
    fn disconnect_of_stale_connection_keeps_new_binding() {
        let relay = Relay::new();
        let mut sender = Client::new();
        let stale = Client::new();
        let mut fresh = Client::new();
        register(&relay, &sender, "S");
        register(&relay, &stale, "B");
        register(&relay, &fresh, "B");

        relay.disconnect(&stale.handle);

        let frame = r#"{"type":"offer","from":"S","to":"B","sdp":"X"}"#;
        assert_eq!(relay.handle_text(&sender.handle, frame), RouteOutcome::Forwarded);
        assert_eq!(fresh.next_frame().as_deref(), Some(frame));

        relay.disconnect(&fresh.handle);
        assert_eq!(
            relay.handle_text(&sender.handle, frame),
            RouteOutcome::ReceiverNotFound
        );
        assert!(sender.next_frame().is_none());
        relay.disconnect(&fresh.handle);
    }

    #[test_timeout::timeout]
    fn admit_binds_before_any_message() {
        let relay = Relay::new();
        let mut a = Client::new();
        let b = Client::new();
        relay.admit("A", &a.handle);
        register(&relay, &b, "B");

        let frame = r#"{"type":"answer","from":"B","to":"A","sdp":"Y"}"#;
        assert_eq!(relay.handle_text(&b.handle, frame), RouteOutcome::Forwarded);
        assert_eq!(a.next_frame().as_deref(), Some(frame));
    }
}
