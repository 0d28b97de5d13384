use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::LinkError;
use crate::models::ArgValue;
use crate::protocol::Response;

type Resolution = Result<Vec<ArgValue>, LinkError>;

struct PendingSlot {
    tx: oneshot::Sender<Resolution>,
    submitted_at: Instant,
}

/// Matches outgoing requests to their eventual responses.
///
/// Correlation identifiers are drawn from a monotonically increasing counter
/// and never reused, so concurrent in-flight requests cannot cross-talk even
/// when responses arrive out of submission order.
pub struct Correlator {
    pending: DashMap<u64, PendingSlot>,
    next_id: AtomicU64,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

impl Correlator {
    pub fn new() -> Self {
        Self {
            pending: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocates a correlation id and registers its resolution channel.
    ///
    /// The returned [`SlotGuard`] frees the slot if the caller goes away
    /// before resolution, so a late response is discarded instead of being
    /// delivered to a cancelled caller.
    pub fn register(&self) -> (SlotGuard<'_>, oneshot::Receiver<Resolution>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            id,
            PendingSlot {
                tx,
                submitted_at: Instant::now(),
            },
        );
        (
            SlotGuard {
                correlator: self,
                id,
                armed: true,
            },
            rx,
        )
    }

    /// Resolves the outstanding request matching `response`, if any.
    ///
    /// A response with an unknown identifier is a protocol anomaly, not a
    /// fatal error: it is dropped and logged. This also covers late responses
    /// for requests that already timed out or were cancelled.
    pub fn resolve(&self, response: Response) {
        let Some((id, slot)) = self.pending.remove(&response.id) else {
            warn!(id = response.id, "dropping response with unknown correlation id");
            return;
        };
        let outcome = match response.result {
            Ok(args) => Ok(args),
            Err(failure) => Err(LinkError::Remote {
                code: failure.code,
                message: failure.message,
            }),
        };
        if slot.tx.send(outcome).is_err() {
            debug!(
                id,
                elapsed_ms = slot.submitted_at.elapsed().as_millis() as u64,
                "response arrived after the caller went away"
            );
        }
    }

    /// Fails every outstanding request, emptying the table.
    ///
    /// Used on connection loss: pending requests are failed rather than
    /// queued across reconnection.
    pub fn fail_all(&self, make_error: impl Fn() -> LinkError) {
        let ids: Vec<u64> = self.pending.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, slot)) = self.pending.remove(&id) {
                debug!(
                    id,
                    elapsed_ms = slot.submitted_at.elapsed().as_millis() as u64,
                    "failing in-flight request"
                );
                let _ = slot.tx.send(Err(make_error()));
            }
        }
    }

    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }

    fn discard(&self, id: u64) {
        if self.pending.remove(&id).is_some() {
            debug!(id, "released correlation slot without resolution");
        }
    }
}

/// Releases the correlation slot on drop unless the request resolved.
pub struct SlotGuard<'a> {
    correlator: &'a Correlator,
    id: u64,
    armed: bool,
}

impl SlotGuard<'_> {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Marks the request resolved; the slot was already removed by `resolve`.
    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.correlator.discard(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ArgValue;

    fn ok_response(id: u64, args: Vec<ArgValue>) -> Response {
        Response {
            id,
            result: Ok(args),
        }
    }

    #[tokio::test]
    async fn identifiers_are_unique_and_increasing() {
        let correlator = Correlator::new();
        let (a, _rx_a) = correlator.register();
        let (b, _rx_b) = correlator.register();
        assert!(b.id() > a.id());
    }

    #[tokio::test]
    async fn out_of_order_responses_reach_the_right_callers() {
        let correlator = Correlator::new();
        let (first, rx_first) = correlator.register();
        let (second, rx_second) = correlator.register();

        // Resolve in reverse submission order.
        correlator.resolve(ok_response(second.id(), vec![ArgValue::Int(2)]));
        correlator.resolve(ok_response(first.id(), vec![ArgValue::Int(1)]));

        assert_eq!(rx_first.await.unwrap().unwrap(), vec![ArgValue::Int(1)]);
        assert_eq!(rx_second.await.unwrap().unwrap(), vec![ArgValue::Int(2)]);
        first.disarm();
        second.disarm();
        assert_eq!(correlator.outstanding(), 0);
    }

    #[tokio::test]
    async fn unknown_identifier_is_dropped_not_fatal() {
        let correlator = Correlator::new();
        correlator.resolve(ok_response(9999, vec![]));
        assert_eq!(correlator.outstanding(), 0);
    }

    #[tokio::test]
    async fn cancelled_caller_releases_its_slot() {
        let correlator = Correlator::new();
        let (guard, rx) = correlator.register();
        let id = guard.id();
        drop(rx);
        drop(guard);
        assert_eq!(correlator.outstanding(), 0);

        // The late response for the cancelled request is discarded quietly.
        correlator.resolve(ok_response(id, vec![ArgValue::Int(1)]));
    }

    #[tokio::test]
    async fn fail_all_empties_the_table() {
        let correlator = Correlator::new();
        let (_g1, rx1) = correlator.register();
        let (_g2, rx2) = correlator.register();

        correlator.fail_all(|| LinkError::ConnectionLost);

        assert!(matches!(rx1.await.unwrap(), Err(LinkError::ConnectionLost)));
        assert!(matches!(rx2.await.unwrap(), Err(LinkError::ConnectionLost)));
        assert_eq!(correlator.outstanding(), 0);
    }

    #[tokio::test]
    async fn remote_failure_maps_to_remote_error() {
        let correlator = Correlator::new();
        let (guard, rx) = correlator.register();
        correlator.resolve(Response {
            id: guard.id(),
            result: Err(crate::models::RemoteFailure {
                code: "bad_coords".into(),
                message: "y out of range".into(),
            }),
        });
        guard.disarm();

        match rx.await.unwrap() {
            Err(LinkError::Remote { code, message }) => {
                assert_eq!(code, "bad_coords");
                assert_eq!(message, "y out of range");
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }
}
