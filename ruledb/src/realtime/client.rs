use super::{HubInner, Message};
use crate::caller::CallerContext;
use crate::error::{Result, RuleDbError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

/// Forward messages from the dispatcher into the bounded outbound queue.
///
/// If the queue stays full for longer than `grace`, the connection is
/// removed from the hub and flagged as overflowed.
pub(super) fn spawn_delivery(
    runtime: &Handle,
    hub: Weak<HubInner>,
    client_id: String,
    mut inbound: mpsc::UnboundedReceiver<Message>,
    outbound: mpsc::Sender<Message>,
    overflowed: Arc<AtomicBool>,
    grace: Duration,
) {
    runtime.spawn(async move {
        while let Some(message) = inbound.recv().await {
            match tokio::time::timeout(grace, outbound.send(message)).await {
                Ok(Ok(())) => {}
                // Subscriber handle dropped.
                Ok(Err(_)) => break,
                Err(_) => {
                    log::warn!("realtime client {client_id} overflowed its queue; disconnecting");
                    overflowed.store(true, Ordering::SeqCst);
                    if let Some(hub) = hub.upgrade() {
                        hub.remove_client(&client_id);
                    }
                    break;
                }
            }
        }
    });
}

/// A live realtime connection. Dropping it disconnects.
#[derive(Debug)]
pub struct Subscriber {
    id: String,
    rx: mpsc::Receiver<Message>,
    overflowed: Arc<AtomicBool>,
    hub: Weak<HubInner>,
}

impl Subscriber {
    pub(super) fn new(
        id: String,
        rx: mpsc::Receiver<Message>,
        overflowed: Arc<AtomicBool>,
        hub: Weak<HubInner>,
    ) -> Self {
        Subscriber {
            id,
            rx,
            overflowed,
            hub,
        }
    }

    /// The client id assigned on connect.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the next message. `Ok(None)` means the hub went away; an
    /// overflowed connection reports `SubscriberOverflow` once its queue is
    /// drained.
    pub async fn next_message(&mut self) -> Result<Option<Message>> {
        match self.rx.recv().await {
            Some(message) => Ok(Some(message)),
            None => self.closed(),
        }
    }

    /// Take a queued message without waiting.
    pub fn try_next_message(&mut self) -> Result<Option<Message>> {
        match self.rx.try_recv() {
            Ok(message) => Ok(Some(message)),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => self.closed(),
        }
    }

    fn closed(&self) -> Result<Option<Message>> {
        if self.overflowed.load(Ordering::SeqCst) {
            Err(RuleDbError::SubscriberOverflow(self.id.clone()))
        } else {
            Ok(None)
        }
    }

    fn hub(&self) -> Result<Arc<HubInner>> {
        self.hub
            .upgrade()
            .ok_or_else(|| RuleDbError::Other("realtime hub is gone".into()))
    }

    pub fn subscribe(&self, topic: &str) -> Result<()> {
        self.hub()?.subscribe(&self.id, topic)
    }

    pub fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.hub()?.unsubscribe(&self.id, topic)
    }

    /// Replace all subscriptions of this connection.
    pub fn set_subscriptions(&self, topics: &[&str]) -> Result<()> {
        self.hub()?.set_subscriptions(&self.id, topics)
    }

    pub fn set_caller(&self, caller: CallerContext) -> Result<()> {
        self.hub()?.set_caller(&self.id, caller)
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.remove_client(&self.id);
        }
    }
}
