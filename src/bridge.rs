//! Bridge plug-in contract: lets an embedding application route messages
//! through an external transport (OSC/MQTT/WebSocket/shared memory) without
//! the core depending on any of them directly.

use async_trait::async_trait;

use crate::codec::Message;
use crate::error::Result;

/// What a bridge should do with the message it was just handed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryDecision {
    /// The bridge has fully handled delivery; the core can forget it.
    Complete,
    /// The bridge cannot deliver it yet (e.g. backpressure); the core
    /// should retry on a later `poll()`.
    Postpone,
}

/// An external transport plugged into the core at a service boundary.
///
/// `poll` is called once per core poll-loop iteration and may return a
/// message the bridge received from its external side, to be dispatched
/// locally. `send` is called when the core has a message addressed to a
/// service this bridge offers.
#[async_trait]
pub trait Bridge: Send {
    /// A stable identifier for this bridge, used in service-offer records
    /// and error messages.
    fn id(&self) -> &str;

    /// Non-blocking poll for an inbound message from the external side.
    async fn poll(&mut self) -> Result<Option<Message>>;

    /// Hand a message to the bridge for delivery to its external side.
    async fn send(&mut self, message: &Message) -> Result<DeliveryDecision>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct LoopbackBridge {
        inbound: VecDeque<Message>,
        sent: Vec<Message>,
    }

    #[async_trait]
    impl Bridge for LoopbackBridge {
        fn id(&self) -> &str {
            "loopback"
        }

        async fn poll(&mut self) -> Result<Option<Message>> {
            Ok(self.inbound.pop_front())
        }

        async fn send(&mut self, message: &Message) -> Result<DeliveryDecision> {
            self.sent.push(message.clone());
            Ok(DeliveryDecision::Complete)
        }
    }

    #[tokio::test]
    async fn send_reports_completion_for_a_simple_adapter() {
        let mut bridge = LoopbackBridge {
            inbound: VecDeque::new(),
            sent: Vec::new(),
        };
        let msg = Message {
            address: "/x".into(),
            args: vec![],
            ttl: 0,
            reliable: true,
            timestamp: 0.0,
        };
        let decision = bridge.send(&msg).await.unwrap();
        assert_eq!(decision, DeliveryDecision::Complete);
        assert_eq!(bridge.sent.len(), 1);
    }
}
