use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::{mpsc, oneshot};

use super::router::{Command, SubscriptionKey};
use crate::Result;
use crate::types::{Event, Sequenced};

/// A live `subscribe_events` registration.
///
/// Yields every event the server pushes for it, across reconnects: the
/// connection re-subscribes on its own after the socket is replaced. The
/// stream ends if the server refuses a replayed subscription or the
/// connection closes.
///
/// Dropping the subscription unsubscribes in the background. Use
/// [`EventSubscription::unsubscribe`] to wait for the server to confirm.
///
/// ```ignore
/// use futures::StreamExt as _;
///
/// let mut events = connection.subscribe_events(Some("state_changed")).await?;
/// while let Some(event) = events.next().await {
///     println!("{}", event.data["entity_id"]);
/// }
/// ```
pub struct EventSubscription {
    key: SubscriptionKey,
    events: mpsc::UnboundedReceiver<Sequenced<Event>>,
    commands: mpsc::UnboundedSender<Command>,
    active: bool,
}

impl EventSubscription {
    pub(crate) fn new(
        key: SubscriptionKey,
        events: mpsc::UnboundedReceiver<Sequenced<Event>>,
        commands: mpsc::UnboundedSender<Command>,
    ) -> Self {
        Self {
            key,
            events,
            commands,
            active: true,
        }
    }

    /// Wait for the next event. `None` once the subscription is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        self.events.recv().await.map(|event| event.value)
    }

    /// Cancel the server-side subscription.
    ///
    /// Succeeds without a round trip when the connection is down, since the
    /// server forgets subscriptions with the socket anyway.
    pub async fn unsubscribe(mut self) -> Result<()> {
        self.active = false;

        let (reply, rx) = oneshot::channel();
        if self
            .commands
            .send(Command::Unsubscribe {
                key: self.key,
                reply: Some(reply),
            })
            .is_err()
        {
            return Ok(());
        }

        rx.await.unwrap_or(Ok(()))
    }
}

impl Stream for EventSubscription {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events
            .poll_recv(cx)
            .map(|event| event.map(|event| event.value))
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        if self.active {
            _ = self.commands.send(Command::Unsubscribe {
                key: self.key,
                reply: None,
            });
        }
    }
}
