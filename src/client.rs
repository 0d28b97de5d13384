use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::broadcast;
use tracing::warn;

use crate::cache::WorldCache;
use crate::correlator::Correlator;
use crate::error::LinkError;
use crate::models::{ArgValue, BlockState, Command, Event, LinkOptions, Position, Snapshot};
use crate::protocol::encode_command;
use crate::transport::Session;

/// Client handle for one remote mod instance.
///
/// Owns a single persistent connection; multiple independent clients may
/// coexist in one process. Cheap to share behind an `Arc`; all operations
/// take `&self`.
pub struct LinkClient {
    session: Session,
    correlator: Arc<Correlator>,
    cache: Arc<WorldCache>,
    events: broadcast::Sender<Event>,
    default_timeout: Duration,
}

impl LinkClient {
    /// Connects to the mod's listener at `address` (`host` or `host:port`).
    pub async fn connect(address: &str, options: LinkOptions) -> Result<Self, LinkError> {
        let correlator = Arc::new(Correlator::new());
        let cache = Arc::new(WorldCache::new(options.staleness_window));
        let (events, _) = broadcast::channel(options.event_capacity);
        let default_timeout = options.read_timeout;

        let session = Session::connect(
            address,
            options,
            correlator.clone(),
            cache.clone(),
            events.clone(),
        )
        .await?;

        Ok(Self {
            session,
            correlator,
            cache,
            events,
            default_timeout,
        })
    }

    /// Submits a raw command and waits for its correlated response.
    ///
    /// Uses the session's default timeout; see
    /// [`submit_with_timeout`](Self::submit_with_timeout).
    pub async fn submit(&self, command: Command) -> Result<Vec<ArgValue>, LinkError> {
        self.submit_with_timeout(command, self.default_timeout).await
    }

    /// Submits a raw command with an explicit per-request timeout.
    ///
    /// Exactly one terminal outcome per call: the result payload, a
    /// `Remote` error, `RequestTimeout`, or `ConnectionLost`. A timed-out or
    /// cancelled call releases its correlation slot so a late response is
    /// discarded instead of reaching the wrong caller.
    pub async fn submit_with_timeout(
        &self,
        command: Command,
        timeout: Duration,
    ) -> Result<Vec<ArgValue>, LinkError> {
        let (guard, rx) = self.correlator.register();
        let frame = encode_command(guard.id(), &command);
        self.session.send(frame.as_bytes()).await?;

        match tokio::time::timeout(timeout, rx).await {
            Err(_) => Err(LinkError::RequestTimeout),
            Ok(Err(_)) => Err(LinkError::ConnectionLost),
            Ok(Ok(outcome)) => {
                guard.disarm();
                outcome
            }
        }
    }

    /// Explicit opt-in batching: encodes every command into one buffer and
    /// writes it in a single locked write, then awaits all the correlated
    /// responses. Per-command outcomes are independent.
    pub async fn submit_batch(
        &self,
        commands: &[Command],
    ) -> Result<Vec<Result<Vec<ArgValue>, LinkError>>, LinkError> {
        let mut buffer = String::new();
        let mut slots = Vec::with_capacity(commands.len());
        for command in commands {
            let (guard, rx) = self.correlator.register();
            buffer.push_str(&encode_command(guard.id(), command));
            slots.push((guard, rx));
        }
        self.session.send(buffer.as_bytes()).await?;

        let deadline = self.default_timeout;
        let outcomes = futures::future::join_all(slots.into_iter().map(|(guard, rx)| async move {
            match tokio::time::timeout(deadline, rx).await {
                Err(_) => Err(LinkError::RequestTimeout),
                Ok(Err(_)) => Err(LinkError::ConnectionLost),
                Ok(Ok(outcome)) => {
                    guard.disarm();
                    outcome
                }
            }
        }))
        .await;
        Ok(outcomes)
    }

    /// Queries one block. Command `world.get_block`, argument `c:x,y,z`,
    /// result `s:kind`.
    pub async fn get_block(&self, x: i64, y: i64, z: i64) -> Result<BlockState, LinkError> {
        let args = self
            .submit(Command::new("world.get_block").arg((x, y, z)))
            .await?;
        let kind = single_str(&args, "world.get_block")?;
        Ok(BlockState { x, y, z, kind })
    }

    /// Places one block. Command `world.set_block`, arguments `c:x,y,z`
    /// `s:kind`, empty result.
    pub async fn set_block(&self, x: i64, y: i64, z: i64, kind: &str) -> Result<(), LinkError> {
        self.submit(Command::new("world.set_block").arg((x, y, z)).arg(kind))
            .await?;
        Ok(())
    }

    /// Reads the player position. Command `player.get_pos`, no arguments,
    /// result `f:x f:y f:z`.
    pub async fn player_position(&self) -> Result<Position, LinkError> {
        let args = self.submit(Command::new("player.get_pos")).await?;
        triple_float(&args, "player.get_pos")
    }

    /// Teleports the player. Command `player.set_pos`, arguments
    /// `f:x f:y f:z`, empty result.
    pub async fn set_player_position(&self, x: f64, y: f64, z: f64) -> Result<(), LinkError> {
        self.submit(Command::new("player.set_pos").arg(x).arg(y).arg(z))
            .await?;
        Ok(())
    }

    /// Posts a chat message. Command `chat.post`, argument `s:message`,
    /// empty result.
    pub async fn post_chat(&self, message: &str) -> Result<(), LinkError> {
        self.submit(Command::new("chat.post").arg(message)).await?;
        Ok(())
    }

    /// Returns the snapshot for a world object, serving from the cache when
    /// it is current. On a miss, issues `entity.get s:target` (result: one
    /// `s:` argument holding a JSON attribute object), caches, and returns
    /// the fresh value. If a pushed event overtook the query in flight, the
    /// newer event-derived snapshot wins.
    pub async fn snapshot(&self, target: &str) -> Result<Snapshot, LinkError> {
        if let Some(snapshot) = self.cache.lookup(target) {
            return Ok(snapshot);
        }
        let observed = self.cache.version_of(target);
        let args = self.submit(Command::new("entity.get").arg(target)).await?;
        let text = single_str(&args, "entity.get")?;
        let attrs: Value = serde_json::from_str(&text)?;
        if !attrs.is_object() {
            return Err(LinkError::UnexpectedResponse(format!(
                "entity.get returned non-object attributes: {}",
                text
            )));
        }
        Ok(self.cache.store_fetched(target, attrs, observed))
    }

    /// Sets one attribute on a world object. Command `entity.set`, arguments
    /// `s:target s:key s:json-value`, empty result.
    pub async fn set_entity_attr(
        &self,
        target: &str,
        key: &str,
        value: &Value,
    ) -> Result<(), LinkError> {
        self.submit(
            Command::new("entity.set")
                .arg(target)
                .arg(key)
                .arg(value.to_string()),
        )
        .await?;
        Ok(())
    }

    /// Registers an event listener. Dropping the subscription unregisters
    /// it. Slow subscribers skip missed events rather than stalling the read
    /// loop.
    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription {
            rx: self.events.subscribe(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    /// Current connection generation; bumps on every reconnect.
    pub fn generation(&self) -> u64 {
        self.session.generation()
    }

    pub fn cached_snapshots(&self) -> usize {
        self.cache.len()
    }

    /// Tears the session down. All pending and subsequent calls fail with
    /// `ConnectionLost`.
    pub fn close(&self) {
        self.session.close();
    }
}

impl Drop for LinkClient {
    fn drop(&mut self) {
        self.session.close();
    }
}

/// A registered event listener; a pollable queue fed by the read loop.
pub struct EventSubscription {
    rx: broadcast::Receiver<Event>,
}

impl EventSubscription {
    /// Waits for the next event. Fails with `ConnectionLost` once the client
    /// is gone and the queue is drained.
    pub async fn recv(&mut self) -> Result<Event, LinkError> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Ok(event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "event subscriber lagged; skipping");
                }
                Err(broadcast::error::RecvError::Closed) => return Err(LinkError::ConnectionLost),
            }
        }
    }

    /// Non-blocking poll; `None` when no event is queued.
    pub fn try_recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                    warn!(missed, "event subscriber lagged; skipping");
                }
                Err(_) => return None,
            }
        }
    }
}

fn single_str(args: &[ArgValue], op: &str) -> Result<String, LinkError> {
    match args {
        [ArgValue::Str(s)] => Ok(s.clone()),
        other => Err(LinkError::UnexpectedResponse(format!(
            "{} returned {:?}",
            op, other
        ))),
    }
}

fn triple_float(args: &[ArgValue], op: &str) -> Result<Position, LinkError> {
    match args {
        [x, y, z] => match (x.as_float(), y.as_float(), z.as_float()) {
            (Some(x), Some(y), Some(z)) => Ok(Position { x, y, z }),
            _ => Err(LinkError::UnexpectedResponse(format!(
                "{} returned non-numeric coordinates: {:?}",
                op, args
            ))),
        },
        other => Err(LinkError::UnexpectedResponse(format!(
            "{} returned {} values, expected 3",
            op,
            other.len()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_str_rejects_wrong_shapes() {
        assert!(single_str(&[ArgValue::Str("stone".into())], "op").is_ok());
        assert!(matches!(
            single_str(&[ArgValue::Int(1)], "op"),
            Err(LinkError::UnexpectedResponse(_))
        ));
        assert!(matches!(
            single_str(&[], "op"),
            Err(LinkError::UnexpectedResponse(_))
        ));
    }

    #[test]
    fn triple_float_accepts_int_widening() {
        let pos = triple_float(
            &[ArgValue::Int(1), ArgValue::Float(64.5), ArgValue::Int(-3)],
            "op",
        )
        .unwrap();
        assert_eq!(pos, Position { x: 1.0, y: 64.5, z: -3.0 });
    }
}
