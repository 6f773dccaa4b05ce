//! Declarative event subscriptions for managed kinds.
//!
//! Each managed kind carries a filter naming the event types that should
//! wake the owning Lolcow. Events that pass the filter are forwarded to the
//! controller, which maps the object back to its owner through the
//! controlling owner reference.

use crate::error::ControllerError;
use futures::{Stream, StreamExt, future};
use kube::{Api, Resource};
use kube_runtime::watcher::{self, Event};
use kube_runtime::WatchStreamExt;
use kube_runtime::reflector::store::Writer;
use resource_store::ResourceKind;
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::hash::Hash;
use std::str::FromStr;

/// Kind of change observed on a managed object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    /// Object created or modified (including the initial listing)
    Apply,
    /// Object removed
    Delete,
}

impl FromStr for EventType {
    type Err = ControllerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "apply" => Ok(EventType::Apply),
            "delete" => Ok(EventType::Delete),
            other => Err(ControllerError::InvalidConfig(format!(
                "unknown event type '{}', expected apply or delete",
                other
            ))),
        }
    }
}

/// Which events of one managed kind trigger a reconcile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionFilter {
    kind: ResourceKind,
    events: Vec<EventType>,
}

impl SubscriptionFilter {
    pub fn new(kind: ResourceKind, mut events: Vec<EventType>) -> Self {
        events.dedup();
        Self { kind, events }
    }

    /// Subscribe to every event of `kind`
    pub fn all(kind: ResourceKind) -> Self {
        Self::new(kind, vec![EventType::Apply, EventType::Delete])
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn accepts(&self, event: EventType) -> bool {
        self.events.contains(&event)
    }

    /// Whether any event of this kind is subscribed at all
    pub fn is_active(&self) -> bool {
        !self.events.is_empty()
    }

    /// Applies the filter to a raw watch event.
    ///
    /// Bookkeeping events (`Init`, `InitDone`) are dropped; watch errors are
    /// always passed through so the controller can log and back off.
    pub fn filter_event<K>(&self, event: Result<Event<K>, watcher::Error>) -> Option<Result<K, watcher::Error>> {
        match event {
            Ok(Event::Apply(obj)) | Ok(Event::InitApply(obj)) => self.accepts(EventType::Apply).then_some(Ok(obj)),
            Ok(Event::Delete(obj)) => self.accepts(EventType::Delete).then_some(Ok(obj)),
            Ok(Event::Init) | Ok(Event::InitDone) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

/// Objects a primary-kind event should reconcile: applied and deleted ones
/// alike. Deleted objects are gone from the reflector store by the time the
/// controller looks them up, which it reports as `ObjectNotFound`.
pub fn touched<K>(event: Result<Event<K>, watcher::Error>) -> Option<Result<K, watcher::Error>> {
    match event {
        Ok(Event::Apply(obj) | Event::InitApply(obj) | Event::Delete(obj)) => Some(Ok(obj)),
        Ok(Event::Init | Event::InitDone) => None,
        Err(e) => Some(Err(e)),
    }
}

/// Feeds `events` into the reflector behind `writer` and yields the touched objects
pub fn primary_triggers<K, S>(events: S, writer: Writer<K>) -> impl Stream<Item = Result<K, watcher::Error>> + Send
where
    K: Resource + Clone + Send + Sync + 'static,
    K::DynamicType: Eq + Hash + Clone + Send + Sync,
    S: Stream<Item = Result<Event<K>, watcher::Error>> + Send,
{
    events
        .reflect(writer)
        .filter_map(|event| future::ready(touched(event)))
}

/// Watches the primary kind, keeping `writer`'s store in sync
pub fn subscribe_primary<K>(api: Api<K>, writer: Writer<K>) -> impl Stream<Item = Result<K, watcher::Error>> + Send + 'static
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Eq + Hash + Clone + Send + Sync,
{
    primary_triggers(watcher::watcher(api, watcher::Config::default()).default_backoff(), writer)
}

/// Watches objects of a managed kind and yields those whose events pass `filter`
pub fn subscribe<K>(api: Api<K>, filter: SubscriptionFilter) -> impl Stream<Item = Result<K, watcher::Error>> + Send + 'static
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
{
    watcher::watcher(api, watcher::Config::default())
        .default_backoff()
        .filter_map(move |event| future::ready(filter.filter_event(event)))
}
