//! Outbound transport selection.
//!
//! Pure decision logic: the manager passes the envelope and its registered
//! transports in registration order, the strategy names one or none.

use std::sync::Arc;

use crate::envelope::Envelope;
use crate::transport::Transport;

/// Picks the transport that carries an outbound envelope.
pub trait RoutingStrategy: Send + Sync {
    /// `transports` is in registration order and may include inactive
    /// entries; implementations must only return an active one.
    fn select(
        &self,
        envelope: &Envelope,
        transports: &[Arc<dyn Transport>],
    ) -> Option<Arc<dyn Transport>>;
}

/// Latency-sensitive control traffic (ping, pong, error) goes to the
/// active transport with the lowest measured RTT; everything else, and
/// control traffic when nothing has been measured, to the first active
/// transport.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultRoutingStrategy;

impl RoutingStrategy for DefaultRoutingStrategy {
    fn select(
        &self,
        envelope: &Envelope,
        transports: &[Arc<dyn Transport>],
    ) -> Option<Arc<dyn Transport>> {
        let mut active = transports.iter().filter(|t| t.is_active());

        if envelope.message_type().is_latency_sensitive() {
            let fastest = transports
                .iter()
                .filter(|t| t.is_active())
                .map(|t| (t, t.metrics().avg_rtt_ms))
                .filter(|(_, rtt)| *rtt > 0.0)
                // Strict comparison keeps the earliest registration on ties.
                .fold(None::<(&Arc<dyn Transport>, f64)>, |best, (t, rtt)| match best {
                    Some((_, best_rtt)) if best_rtt <= rtt => best,
                    _ => Some((t, rtt)),
                });
            if let Some((t, _)) = fastest {
                return Some(Arc::clone(t));
            }
        }

        active.next().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::MessageType;
    use crate::mock::MockTransport;

    async fn transport(id: &str, rtt: f64, active: bool) -> Arc<MockTransport> {
        let t = Arc::new(MockTransport::new(id));
        t.set_rtt(rtt);
        if active {
            t.start().await.unwrap();
        }
        t
    }

    fn as_dyn(ts: &[Arc<MockTransport>]) -> Vec<Arc<dyn Transport>> {
        ts.iter().map(|t| Arc::clone(t) as Arc<dyn Transport>).collect()
    }

    fn envelope(kind: MessageType) -> Envelope {
        Envelope::builder("alice@n1", kind).build()
    }

    #[tokio::test]
    async fn ping_takes_fastest_message_takes_first() {
        let a = transport("A", 50.0, true).await;
        let b = transport("B", 10.0, true).await;
        let c = transport("C", 1.0, false).await;
        let all = as_dyn(&[a, b, c]);
        let s = DefaultRoutingStrategy;

        assert_eq!(s.select(&envelope(MessageType::Ping), &all).unwrap().id(), "B");
        assert_eq!(s.select(&envelope(MessageType::Pong), &all).unwrap().id(), "B");
        assert_eq!(s.select(&envelope(MessageType::Error), &all).unwrap().id(), "B");
        assert_eq!(s.select(&envelope(MessageType::Message), &all).unwrap().id(), "A");
        assert_eq!(s.select(&envelope(MessageType::Privmsg), &all).unwrap().id(), "A");
    }

    #[tokio::test]
    async fn unmeasured_rtt_falls_back_to_first_active() {
        let a = transport("A", 0.0, false).await;
        let b = transport("B", 0.0, true).await;
        let c = transport("C", -1.0, true).await;
        let all = as_dyn(&[a, b, c]);
        let picked = DefaultRoutingStrategy.select(&envelope(MessageType::Ping), &all);
        assert_eq!(picked.unwrap().id(), "B");
    }

    #[tokio::test]
    async fn equal_rtt_prefers_registration_order() {
        let a = transport("A", 20.0, true).await;
        let b = transport("B", 20.0, true).await;
        let all = as_dyn(&[a, b]);
        let picked = DefaultRoutingStrategy.select(&envelope(MessageType::Ping), &all);
        assert_eq!(picked.unwrap().id(), "A");
    }

    #[tokio::test]
    async fn nothing_active_selects_nothing() {
        let a = transport("A", 5.0, false).await;
        let all = as_dyn(&[a]);
        assert!(DefaultRoutingStrategy.select(&envelope(MessageType::Ping), &all).is_none());
        assert!(DefaultRoutingStrategy.select(&envelope(MessageType::Message), &[]).is_none());
    }
}
