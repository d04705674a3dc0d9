//! Command-id correlation for one connection.
//!
//! The router is plain data owned by the connection task. It never touches
//! the socket: every operation returns the frames that must be written.

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::Result;
use crate::error::{Error, ServerError};
use crate::types::request::Request;
use crate::types::response::{ServerMessage, parse_message};
use crate::types::{Event, Sequenced};

pub(crate) type Reply<T> = oneshot::Sender<Result<T>>;
pub(crate) type EventSink = mpsc::UnboundedSender<Sequenced<Event>>;

/// Local handle of a subscription record. Stable across reconnects, unlike the
/// server-side id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct SubscriptionKey(u64);

/// Work handed to the connection task by [`crate::ws::Connection`] handles.
pub(crate) enum Command {
    Request {
        request: Request,
        reply: Reply<Sequenced<Value>>,
    },
    Subscribe {
        event_type: Option<String>,
        sink: EventSink,
        reply: Reply<SubscriptionKey>,
    },
    Unsubscribe {
        key: SubscriptionKey,
        reply: Option<Reply<()>>,
    },
    Close,
}

enum Pending {
    Request(Reply<Sequenced<Value>>),
    /// `reply` is `None` for subscriptions replayed after a reconnect
    Subscribe {
        key: SubscriptionKey,
        reply: Option<Reply<SubscriptionKey>>,
    },
    Unsubscribe {
        key: SubscriptionKey,
        reply: Option<Reply<()>>,
    },
    /// Cleanup of a server subscription nobody listens to anymore
    Discard,
}

struct Subscriber {
    event_type: Option<String>,
    sink: EventSink,
    /// Id of the `subscribe_events` command in the current session
    server_id: Option<u64>,
}

#[derive(Default)]
pub(crate) struct Router {
    next_id: u64,
    next_key: u64,
    seq: u64,
    pending: HashMap<u64, Pending>,
    subscriptions: HashMap<SubscriptionKey, Subscriber>,
    by_server_id: HashMap<u64, SubscriptionKey>,
}

impl Router {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Start a freshly authenticated session.
    ///
    /// Ids restart at 1 and every surviving subscription record is
    /// re-subscribed, oldest first. Returns the frames to send.
    pub(crate) fn begin_session(&mut self) -> Vec<String> {
        self.next_id = 0;

        let mut keys: Vec<SubscriptionKey> = self.subscriptions.keys().copied().collect();
        keys.sort_unstable();

        #[cfg(feature = "tracing")]
        if !keys.is_empty() {
            tracing::debug!(count = keys.len(), "replaying event subscriptions");
        }

        keys.into_iter()
            .filter_map(|key| self.send_subscribe(key, None))
            .collect()
    }

    /// Register a command. Returns the frame to send, if any.
    pub(crate) fn handle_command(&mut self, command: Command) -> Option<String> {
        match command {
            Command::Request { request, reply } => {
                let id = self.alloc_id();
                match request.to_frame(id) {
                    Ok(frame) => {
                        self.pending.insert(id, Pending::Request(reply));
                        Some(frame)
                    }
                    Err(e) => {
                        _ = reply.send(Err(e.into()));
                        None
                    }
                }
            }
            Command::Subscribe {
                event_type,
                sink,
                reply,
            } => {
                let key = SubscriptionKey(self.next_key);
                self.next_key += 1;
                self.subscriptions.insert(
                    key,
                    Subscriber {
                        event_type,
                        sink,
                        server_id: None,
                    },
                );
                self.send_subscribe(key, Some(reply))
            }
            Command::Unsubscribe { key, reply } => self.unsubscribe(key, reply),
            Command::Close => None,
        }
    }

    /// Answer a command that arrives while no socket is open.
    pub(crate) fn reject_offline(&mut self, command: Command) {
        match command {
            Command::Request { reply, .. } => {
                _ = reply.send(Err(Error::connection_lost()));
            }
            Command::Subscribe { reply, .. } => {
                _ = reply.send(Err(Error::connection_lost()));
            }
            Command::Unsubscribe { key, reply } => {
                self.subscriptions.remove(&key);
                respond(reply, Ok(()));
            }
            Command::Close => {}
        }
    }

    /// Issue a heartbeat `ping`.
    pub(crate) fn ping(&mut self) -> Option<(String, oneshot::Receiver<Result<Sequenced<Value>>>)> {
        let (reply, rx) = oneshot::channel();
        let frame = self.handle_command(Command::Request {
            request: Request::Ping,
            reply,
        })?;
        Some((frame, rx))
    }

    /// Process one inbound text frame. Returns follow-up frames to send.
    pub(crate) fn handle_text(&mut self, text: &str) -> Vec<String> {
        self.seq += 1;
        let seq = self.seq;

        let message = match parse_message(text.as_bytes()) {
            Ok(message) => message,
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(%text, error = %e, "Failed to parse WebSocket message");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
                return Vec::new();
            }
        };

        match message {
            ServerMessage::Result(frame) => {
                let id = frame.id;
                self.complete(seq, id, frame.into_result())
            }
            ServerMessage::Pong { id } => self.complete(seq, id, Ok(Value::Null)),
            ServerMessage::Event { id, event } => self.deliver(seq, id, event),
            other => {
                #[cfg(feature = "tracing")]
                tracing::debug!(message = ?other, "ignoring frame");
                #[cfg(not(feature = "tracing"))]
                let _ = &other;
                Vec::new()
            }
        }
    }

    /// Reject everything in flight after the socket went away.
    ///
    /// Subscription records survive with their server ids cleared, except
    /// those whose caller was still waiting on the first `subscribe_events`
    /// or already asked to unsubscribe.
    pub(crate) fn fail_pending(&mut self) {
        for (_, pending) in std::mem::take(&mut self.pending) {
            match pending {
                Pending::Request(reply) => {
                    _ = reply.send(Err(Error::connection_lost()));
                }
                Pending::Subscribe {
                    key,
                    reply: Some(reply),
                } => {
                    self.subscriptions.remove(&key);
                    _ = reply.send(Err(Error::connection_lost()));
                }
                Pending::Unsubscribe { key, reply } => {
                    self.subscriptions.remove(&key);
                    respond(reply, Ok(()));
                }
                Pending::Subscribe { reply: None, .. } | Pending::Discard => {}
            }
        }

        self.by_server_id.clear();
        for subscriber in self.subscriptions.values_mut() {
            subscriber.server_id = None;
        }
    }

    fn alloc_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn send_subscribe(
        &mut self,
        key: SubscriptionKey,
        reply: Option<Reply<SubscriptionKey>>,
    ) -> Option<String> {
        let event_type = self.subscriptions.get(&key)?.event_type.clone();
        let id = self.alloc_id();

        match Request::subscribe_events(event_type.as_deref()).to_frame(id) {
            Ok(frame) => {
                self.pending.insert(id, Pending::Subscribe { key, reply });
                Some(frame)
            }
            Err(e) => {
                self.subscriptions.remove(&key);
                respond(reply, Err(e.into()));
                None
            }
        }
    }

    fn unsubscribe(&mut self, key: SubscriptionKey, reply: Option<Reply<()>>) -> Option<String> {
        let Some(subscriber) = self.subscriptions.get_mut(&key) else {
            respond(reply, Ok(()));
            return None;
        };

        let Some(server_id) = subscriber.server_id.take() else {
            // Not bound on the server (yet); a late subscribe result is discarded
            self.subscriptions.remove(&key);
            respond(reply, Ok(()));
            return None;
        };

        // Stop delivering now, drop the record once the server confirms
        self.by_server_id.remove(&server_id);
        let id = self.alloc_id();
        match (Request::UnsubscribeEvents {
            subscription: server_id,
        })
        .to_frame(id)
        {
            Ok(frame) => {
                self.pending.insert(id, Pending::Unsubscribe { key, reply });
                Some(frame)
            }
            Err(e) => {
                self.subscriptions.remove(&key);
                respond(reply, Err(e.into()));
                None
            }
        }
    }

    fn complete(
        &mut self,
        seq: u64,
        id: u64,
        outcome: std::result::Result<Value, ServerError>,
    ) -> Vec<String> {
        let Some(pending) = self.pending.remove(&id) else {
            #[cfg(feature = "tracing")]
            tracing::warn!(id, "result for unknown command id");
            return Vec::new();
        };

        match pending {
            Pending::Request(reply) => {
                _ = reply.send(
                    outcome
                        .map(|value| Sequenced { seq, value })
                        .map_err(Error::from),
                );
            }
            Pending::Subscribe { key, reply } => {
                return self.complete_subscribe(id, key, reply, outcome);
            }
            Pending::Unsubscribe { key, reply } => {
                self.subscriptions.remove(&key);
                respond(reply, outcome.map(drop).map_err(Error::from));
            }
            Pending::Discard => {
                #[cfg(feature = "tracing")]
                if let Err(e) = &outcome {
                    tracing::debug!(id, error = %e, "discarding subscription failed");
                }
            }
        }

        Vec::new()
    }

    fn complete_subscribe(
        &mut self,
        id: u64,
        key: SubscriptionKey,
        reply: Option<Reply<SubscriptionKey>>,
        outcome: std::result::Result<Value, ServerError>,
    ) -> Vec<String> {
        if let Err(e) = outcome {
            self.subscriptions.remove(&key);
            match reply {
                Some(reply) => {
                    _ = reply.send(Err(e.into()));
                }
                None => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(error = %e, "replaying subscription failed, dropping it");
                    #[cfg(not(feature = "tracing"))]
                    let _ = &e;
                }
            }
            return Vec::new();
        }

        let Some(subscriber) = self.subscriptions.get_mut(&key) else {
            // Unsubscribed while the subscribe was in flight
            return self.discard(id).into_iter().collect();
        };
        subscriber.server_id = Some(id);
        self.by_server_id.insert(id, key);

        if let Some(reply) = reply
            && reply.send(Ok(key)).is_err()
        {
            self.subscriptions.remove(&key);
            self.by_server_id.remove(&id);
            return self.discard(id).into_iter().collect();
        }

        Vec::new()
    }

    fn deliver(&mut self, seq: u64, id: u64, event: Event) -> Vec<String> {
        let Some(&key) = self.by_server_id.get(&id) else {
            #[cfg(feature = "tracing")]
            tracing::warn!(id, event_type = %event.event_type, "event for unknown subscription");
            return Vec::new();
        };

        let closed = self
            .subscriptions
            .get(&key)
            .is_none_or(|subscriber| subscriber.sink.send(Sequenced { seq, value: event }).is_err());

        if closed {
            // Receiver dropped without unsubscribing
            self.subscriptions.remove(&key);
            self.by_server_id.remove(&id);
            return self.discard(id).into_iter().collect();
        }

        Vec::new()
    }

    fn discard(&mut self, server_id: u64) -> Option<String> {
        let id = self.alloc_id();
        let frame = (Request::UnsubscribeEvents {
            subscription: server_id,
        })
        .to_frame(id)
        .ok()?;
        self.pending.insert(id, Pending::Discard);
        Some(frame)
    }
}

fn respond<T>(reply: Option<Reply<T>>, outcome: Result<T>) {
    if let Some(reply) = reply {
        _ = reply.send(outcome);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::error::Kind;

    fn frame_json(frame: &str) -> Value {
        serde_json::from_str(frame).unwrap()
    }

    fn request(router: &mut Router, request: Request) -> (Value, oneshot::Receiver<Result<Sequenced<Value>>>) {
        let (reply, rx) = oneshot::channel();
        let frame = router
            .handle_command(Command::Request { request, reply })
            .unwrap();
        (frame_json(&frame), rx)
    }

    fn subscribe(
        router: &mut Router,
        event_type: Option<&str>,
    ) -> (
        Value,
        oneshot::Receiver<Result<SubscriptionKey>>,
        mpsc::UnboundedReceiver<Sequenced<Event>>,
    ) {
        let (sink, events) = mpsc::unbounded_channel();
        let (reply, rx) = oneshot::channel();
        let frame = router
            .handle_command(Command::Subscribe {
                event_type: event_type.map(str::to_owned),
                sink,
                reply,
            })
            .unwrap();
        (frame_json(&frame), rx, events)
    }

    fn ok_result(id: u64, result: &Value) -> String {
        json!({"id": id, "type": "result", "success": true, "result": result}).to_string()
    }

    fn event(id: u64, entity_id: &str) -> String {
        json!({
            "id": id,
            "type": "event",
            "event": {"event_type": "state_changed", "data": {"entity_id": entity_id}}
        })
        .to_string()
    }

    #[test]
    fn ids_strictly_increase() {
        let mut router = Router::new();
        let ids: Vec<u64> = (0..4)
            .map(|_| request(&mut router, Request::GetStates).0["id"].as_u64().unwrap())
            .collect();
        assert_eq!(ids, [1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn result_resolves_matching_request() {
        let mut router = Router::new();
        let (_, mut first) = request(&mut router, Request::GetStates);
        let (_, second) = request(&mut router, Request::GetConfig);

        assert!(router.handle_text(&ok_result(2, &json!({"version": "1"}))).is_empty(), "no follow-up");

        let resolved = second.await.unwrap().unwrap();
        assert_eq!(resolved.value["version"], "1");
        assert_eq!(resolved.seq, 1);
        assert!(first.try_recv().is_err(), "first command still pending");
    }

    #[tokio::test]
    async fn failed_result_carries_server_error() {
        let mut router = Router::new();
        let (_, rx) = request(&mut router, Request::call_service("light", "nope", None));

        router.handle_text(
            &json!({
                "id": 1, "type": "result", "success": false,
                "error": {"code": "not_found", "message": "Service not found."}
            })
            .to_string(),
        );

        let err = rx.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), Kind::Server);
        assert_eq!(err.server_error().unwrap().message, "Service not found.");
    }

    #[test]
    fn unknown_ids_and_garbage_are_ignored() {
        let mut router = Router::new();
        assert!(router.handle_text(&ok_result(42, &Value::Null)).is_empty(), "unknown result");
        assert!(router.handle_text(&event(42, "light.a")).is_empty(), "unknown event");
        assert!(router.handle_text("{not json").is_empty(), "garbage");
    }

    #[tokio::test]
    async fn pong_resolves_ping() {
        let mut router = Router::new();
        let (frame, rx) = router.ping().unwrap();
        assert_eq!(frame_json(&frame), json!({"id": 1, "type": "ping"}));

        router.handle_text(&json!({"id": 1, "type": "pong"}).to_string());
        assert_eq!(rx.await.unwrap().unwrap().value, Value::Null);
    }

    #[tokio::test]
    async fn events_route_to_subscriber_with_sequence() {
        let mut router = Router::new();
        let (frame, reply, mut events) = subscribe(&mut router, Some("state_changed"));
        assert_eq!(
            frame,
            json!({"id": 1, "type": "subscribe_events", "event_type": "state_changed"})
        );

        router.handle_text(&ok_result(1, &Value::Null));
        reply.await.unwrap().unwrap();

        router.handle_text(&event(1, "light.a"));
        router.handle_text(&event(1, "light.b"));

        let first = events.recv().await.unwrap();
        let second = events.recv().await.unwrap();
        assert_eq!(first.value.data["entity_id"], "light.a");
        assert!(first.seq < second.seq, "sequence follows arrival order");
    }

    #[tokio::test]
    async fn disconnect_fails_requests_and_keeps_subscriptions() {
        let mut router = Router::new();
        let (_, _reply, mut events) = subscribe(&mut router, Some("state_changed"));
        router.handle_text(&ok_result(1, &Value::Null));
        let (_, pending) = request(&mut router, Request::GetStates);

        router.fail_pending();

        let err = pending.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), Kind::ConnectionLost);

        // Old server ids are dead
        router.handle_text(&event(1, "light.stale"));
        assert!(events.try_recv().is_err(), "no delivery while unbound");

        // New session replays with ids starting from 1
        let replay = router.begin_session();
        assert_eq!(replay.len(), 1);
        assert_eq!(
            frame_json(&replay[0]),
            json!({"id": 1, "type": "subscribe_events", "event_type": "state_changed"})
        );

        router.handle_text(&ok_result(1, &Value::Null));
        router.handle_text(&event(1, "light.fresh"));
        assert_eq!(
            events.recv().await.unwrap().value.data["entity_id"],
            "light.fresh"
        );
    }

    #[tokio::test]
    async fn subscribe_in_flight_fails_on_disconnect() {
        let mut router = Router::new();
        let (_, reply, _events) = subscribe(&mut router, None);

        router.fail_pending();

        let err = reply.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), Kind::ConnectionLost);
        assert!(router.begin_session().is_empty(), "nothing left to replay");
    }

    #[tokio::test]
    async fn offline_commands_are_rejected_immediately() {
        let mut router = Router::new();
        let (reply, rx) = oneshot::channel();
        router.reject_offline(Command::Request {
            request: Request::GetStates,
            reply,
        });
        assert_eq!(rx.await.unwrap().unwrap_err().kind(), Kind::ConnectionLost);

        let (reply, rx) = oneshot::channel();
        router.reject_offline(Command::Unsubscribe {
            key: SubscriptionKey(9),
            reply: Some(reply),
        });
        rx.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn unsubscribe_sends_server_id_and_stops_delivery() {
        let mut router = Router::new();
        let (_, reply, mut events) = subscribe(&mut router, None);
        router.handle_text(&ok_result(1, &Value::Null));
        let key = reply.await.unwrap().unwrap();

        let (reply, done) = oneshot::channel();
        let frame = router
            .handle_command(Command::Unsubscribe {
                key,
                reply: Some(reply),
            })
            .unwrap();
        assert_eq!(
            frame_json(&frame),
            json!({"id": 2, "type": "unsubscribe_events", "subscription": 1})
        );

        router.handle_text(&event(1, "light.late"));
        router.handle_text(&ok_result(2, &Value::Null));
        done.await.unwrap().unwrap();

        assert!(events.try_recv().is_err(), "nothing after unsubscribe");
        assert!(router.subscriptions.is_empty(), "record removed");

        // Idempotent
        let (reply, again) = oneshot::channel();
        assert!(
            router
                .handle_command(Command::Unsubscribe {
                    key,
                    reply: Some(reply)
                })
                .is_none(),
            "no frame for a missing record"
        );
        again.await.unwrap().unwrap();
    }

    #[test]
    fn late_subscribe_result_is_discarded() {
        let mut router = Router::new();
        let (_, reply, _events) = subscribe(&mut router, None);
        drop(reply);

        let follow_up = router.handle_text(&ok_result(1, &Value::Null));
        assert_eq!(follow_up.len(), 1);
        assert_eq!(
            frame_json(&follow_up[0]),
            json!({"id": 2, "type": "unsubscribe_events", "subscription": 1})
        );
        assert!(router.subscriptions.is_empty(), "record removed");
    }

    #[test]
    fn dropped_receiver_unsubscribes_on_next_event() {
        let mut router = Router::new();
        let (_, _reply, events) = subscribe(&mut router, None);
        router.handle_text(&ok_result(1, &Value::Null));
        drop(events);

        let follow_up = router.handle_text(&event(1, "light.a"));
        assert_eq!(frame_json(&follow_up[0])["type"], "unsubscribe_events");
    }
}
