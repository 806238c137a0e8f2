//! # Realtime hub
//!
//! Committed record changes reach the hub through a channel fed by the write
//! gate, in commit order. A dispatcher thread matches each change against the
//! live subscriptions, re-checks the collection's `view` rule for every
//! subscriber and pushes the authorized messages to per-connection delivery
//! tasks.
//!
//! ```text
//! write gate ──commit──▶ std mpsc ──▶ dispatcher thread
//!                                        │ rule check per caller
//!                                        ▼
//!                       unbounded mpsc per client ──▶ delivery task
//!                                                         │ bounded, grace period
//!                                                         ▼
//!                                                     Subscriber
//! ```
//!
//! The registry lock is only held to add, remove or enumerate clients. Rule
//! evaluation and storage reads happen outside of it.

mod client;
mod event;

pub use client::Subscriber;
pub use event::{Action, ChangeEvent};

use crate::caller::CallerContext;
use crate::config::RealtimeConfig;
use crate::error::{Result, RuleDbError, ValidationErrors};
use crate::record::Record;
use crate::rules::{compile_rule, RequestInfo};
use crate::schema::{Collection, Operation, Schema};
use crate::store::{load_auth_record, snapshot_matches};
use crate::system_db::SystemDb;
use serde_json::{json, Value as JsonValue};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::AtomicBool;
use std::sync::mpsc::{self as std_mpsc, RecvTimeoutError};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

/// How often the dispatcher checks whether the hub was dropped.
const DISPATCH_POLL: Duration = Duration::from_millis(100);

/// A message delivered to a subscriber.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// The subscription topic that matched.
    pub topic: String,
    pub action: Action,
    /// The record as the subscriber may see it.
    pub record: Record,
}

impl Message {
    pub fn to_json(&self) -> JsonValue {
        json!({
            "topic": self.topic,
            "action": self.action.as_str(),
            "record": self.record.to_json(),
        })
    }
}

/// A parsed subscription topic.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Topic {
    /// `posts` or `posts/*`
    Collection(String),
    /// `posts/<id>`
    Record(String, String),
}

impl Topic {
    fn parse(topic: &str) -> Result<Topic> {
        let invalid = || {
            RuleDbError::Validation(ValidationErrors::single(
                "topic",
                format!("invalid topic '{topic}'"),
            ))
        };
        let mut parts = topic.trim().split('/');
        let collection = parts.next().filter(|c| !c.is_empty()).ok_or_else(invalid)?;
        let parsed = match parts.next() {
            None | Some("*") => Topic::Collection(collection.to_string()),
            Some("") => return Err(invalid()),
            Some(id) => Topic::Record(collection.to_string(), id.to_string()),
        };
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(parsed)
    }

    fn matches(&self, record: &Record) -> bool {
        let same_collection = |name: &str| {
            name.eq_ignore_ascii_case(&record.collection_name) || name == record.collection_id
        };
        match self {
            Topic::Collection(name) => same_collection(name),
            Topic::Record(name, id) => same_collection(name) && *id == record.id,
        }
    }
}

struct ClientEntry {
    caller: CallerContext,
    topics: BTreeSet<String>,
    sender: mpsc::UnboundedSender<Message>,
}

impl ClientEntry {
    fn matching_topics(&self, record: &Record) -> Vec<String> {
        self.topics
            .iter()
            .filter(|t| Topic::parse(t).is_ok_and(|topic| topic.matches(record)))
            .cloned()
            .collect()
    }
}

pub(crate) struct HubInner {
    db: Arc<SystemDb>,
    config: RealtimeConfig,
    runtime: Handle,
    clients: Mutex<HashMap<String, ClientEntry>>,
}

impl HubInner {
    fn with_client<T>(&self, id: &str, f: impl FnOnce(&mut ClientEntry) -> T) -> Result<T> {
        let mut clients = self
            .clients
            .lock()
            .map_err(crate::error::poisoned)?;
        let entry = clients
            .get_mut(id)
            .ok_or_else(|| RuleDbError::Other(format!("unknown realtime client {id}")))?;
        Ok(f(entry))
    }

    pub(crate) fn subscribe(&self, id: &str, topic: &str) -> Result<()> {
        Topic::parse(topic)?;
        self.with_client(id, |entry| {
            entry.topics.insert(topic.trim().to_string());
        })
    }

    pub(crate) fn unsubscribe(&self, id: &str, topic: &str) -> Result<()> {
        self.with_client(id, |entry| {
            entry.topics.remove(topic.trim());
        })
    }

    pub(crate) fn set_subscriptions(&self, id: &str, topics: &[&str]) -> Result<()> {
        for topic in topics {
            Topic::parse(topic)?;
        }
        self.with_client(id, |entry| {
            entry.topics = topics.iter().map(|t| t.trim().to_string()).collect();
        })
    }

    pub(crate) fn set_caller(&self, id: &str, caller: CallerContext) -> Result<()> {
        self.with_client(id, |entry| entry.caller = caller)
    }

    pub(crate) fn remove_client(&self, id: &str) -> bool {
        match self.clients.lock() {
            Ok(mut clients) => {
                let removed = clients.remove(id).is_some();
                if removed {
                    log::debug!("realtime client {id} disconnected");
                }
                removed
            }
            Err(_) => false,
        }
    }

    /// Reload the auth record behind a caller. A deleted record degrades the
    /// caller to a guest.
    fn refresh_caller(&self, schema: &Schema, caller: &CallerContext) -> CallerContext {
        let Some(auth) = caller.auth_record() else {
            return caller.clone();
        };
        let reloaded = self
            .db
            .read(|conn| load_auth_record(conn, schema, &auth.collection_id, &auth.id));
        match reloaded {
            Ok(Some(record)) => CallerContext::Record(record),
            Ok(None) => CallerContext::Guest,
            Err(e) => {
                log::warn!("could not reload realtime caller {}: {e}", auth.id);
                CallerContext::Guest
            }
        }
    }

    fn authorized(
        &self,
        schema: &Schema,
        collection: &Collection,
        caller: &CallerContext,
        record: &Record,
    ) -> Result<bool> {
        let rule = compile_rule(
            schema,
            collection,
            &collection.name,
            Operation::View,
            RequestInfo { caller, data: None },
        )?;
        self.db
            .read(|conn| snapshot_matches(conn, collection, record, &rule))
    }

    fn dispatch(&self, event: &ChangeEvent) {
        let targets: Vec<(CallerContext, Vec<String>, mpsc::UnboundedSender<Message>)> = {
            let Ok(clients) = self.clients.lock() else {
                log::error!("realtime registry lock poisoned");
                return;
            };
            clients
                .values()
                .filter_map(|entry| {
                    let topics = entry.matching_topics(&event.record);
                    (!topics.is_empty()).then(|| (entry.caller.clone(), topics, entry.sender.clone()))
                })
                .collect()
        };
        if targets.is_empty() {
            return;
        }

        let schema = match self.db.schema() {
            Ok(schema) => schema,
            Err(e) => {
                log::warn!("realtime dispatch skipped, schema unavailable: {e}");
                return;
            }
        };
        let Some(collection) = schema.by_id(event.collection_id()) else {
            return;
        };

        // One rule evaluation per distinct caller.
        let mut verdicts: HashMap<String, (CallerContext, bool)> = HashMap::new();
        for (caller, topics, sender) in targets {
            let key = caller.cache_key();
            let (caller, allowed) = verdicts
                .entry(key)
                .or_insert_with(|| {
                    let caller = self.refresh_caller(&schema, &caller);
                    let allowed = self
                        .authorized(&schema, collection, &caller, &event.record)
                        .unwrap_or_else(|e| {
                            log::warn!("realtime rule check failed for {}: {e}", collection.name);
                            false
                        });
                    (caller, allowed)
                })
                .clone();
            if !allowed {
                continue;
            }
            let record = event.record.clone().visible_to(collection, &caller);
            for topic in topics {
                let message = Message {
                    topic,
                    action: event.action,
                    record: record.clone(),
                };
                if sender.send(message).is_err() {
                    break;
                }
            }
        }
    }
}

/// Distributes committed changes to subscribers. Cheap to clone.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

impl Hub {
    /// Attach a hub to the database's change feed and start the dispatcher.
    pub(crate) fn start(db: Arc<SystemDb>, config: RealtimeConfig, runtime: Handle) -> Result<Hub> {
        let (tx, rx) = std_mpsc::channel::<ChangeEvent>();
        let inner = Arc::new(HubInner {
            db,
            config,
            runtime,
            clients: Mutex::new(HashMap::new()),
        });
        inner.db.set_change_sender(tx)?;

        let weak: Weak<HubInner> = Arc::downgrade(&inner);
        std::thread::Builder::new()
            .name("ruledb-realtime".into())
            .spawn(move || {
                loop {
                    match rx.recv_timeout(DISPATCH_POLL) {
                        Ok(event) => match weak.upgrade() {
                            Some(hub) => hub.dispatch(&event),
                            None => break,
                        },
                        Err(RecvTimeoutError::Timeout) => {
                            if weak.strong_count() == 0 {
                                break;
                            }
                        }
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                log::debug!("realtime dispatcher stopped");
            })?;
        log::info!("realtime hub started");
        Ok(Hub { inner })
    }

    /// Open a connection for `caller`.
    pub fn connect(&self, caller: CallerContext) -> Result<Subscriber> {
        let id = uuid::Uuid::new_v4().to_string();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::channel(self.inner.config.queue_capacity.max(1));
        let overflowed = Arc::new(AtomicBool::new(false));

        self.inner
            .clients
            .lock()
            .map_err(crate::error::poisoned)?
            .insert(
                id.clone(),
                ClientEntry {
                    caller,
                    topics: BTreeSet::new(),
                    sender: inbound_tx,
                },
            );
        client::spawn_delivery(
            &self.inner.runtime,
            Arc::downgrade(&self.inner),
            id.clone(),
            inbound_rx,
            outbound_tx,
            overflowed.clone(),
            self.inner.config.grace_period(),
        );
        log::debug!("realtime client {id} connected");
        Ok(Subscriber::new(id, outbound_rx, overflowed, Arc::downgrade(&self.inner)))
    }

    pub fn subscribe(&self, client_id: &str, topic: &str) -> Result<()> {
        self.inner.subscribe(client_id, topic)
    }

    pub fn unsubscribe(&self, client_id: &str, topic: &str) -> Result<()> {
        self.inner.unsubscribe(client_id, topic)
    }

    /// Replace every subscription of a client.
    pub fn set_subscriptions(&self, client_id: &str, topics: &[&str]) -> Result<()> {
        self.inner.set_subscriptions(client_id, topics)
    }

    pub fn set_caller(&self, client_id: &str, caller: CallerContext) -> Result<()> {
        self.inner.set_caller(client_id, caller)
    }

    /// Drop a client. Returns false if it was not connected.
    pub fn disconnect(&self, client_id: &str) -> bool {
        self.inner.remove_client(client_id)
    }

    pub fn client_count(&self) -> usize {
        self.inner.clients.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// Topics a client is subscribed to.
    pub fn subscriptions(&self, client_id: &str) -> Result<Vec<String>> {
        self.inner
            .with_client(client_id, |entry| entry.topics.iter().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;
    use std::collections::BTreeMap;

    fn record(collection: &str, id: &str) -> Record {
        Record {
            collection_id: format!("{collection}_id"),
            collection_name: collection.to_string(),
            id: id.to_string(),
            data: Map::new(),
            expand: BTreeMap::new(),
        }
    }

    #[test]
    fn test_topic_parse() {
        assert_eq!(Topic::parse("posts").unwrap(), Topic::Collection("posts".into()));
        assert_eq!(Topic::parse("posts/*").unwrap(), Topic::Collection("posts".into()));
        assert_eq!(
            Topic::parse("posts/abc").unwrap(),
            Topic::Record("posts".into(), "abc".into())
        );
        for bad in ["", "/x", "posts/", "posts/a/b"] {
            assert!(Topic::parse(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn test_topic_matches() {
        let post = record("posts", "abc");
        assert!(Topic::parse("POSTS").unwrap().matches(&post));
        assert!(Topic::parse("posts_id/*").unwrap().matches(&post));
        assert!(Topic::parse("posts/abc").unwrap().matches(&post));
        assert!(!Topic::parse("posts/xyz").unwrap().matches(&post));
        assert!(!Topic::parse("users").unwrap().matches(&post));
    }

    #[test]
    fn test_message_json() {
        let message = Message {
            topic: "posts/*".into(),
            action: Action::Delete,
            record: record("posts", "abc"),
        };
        let json = message.to_json();
        assert_eq!(json["action"], "delete");
        assert_eq!(json["record"]["id"], "abc");
    }
}
