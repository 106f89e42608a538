//! In-memory page, channel, navigator and probe for driving captures in tests

use std::{
    cell::{Cell, RefCell},
    collections::BTreeMap,
    rc::Rc,
    time::Duration,
};

use anyhow::{Result, bail};

use super::{CapturePage, EventSink, Feed, ListenerId, Navigator, NetworkChannel, NetworkEvent};
use crate::{Headers, validate::Reachability};

pub fn request(url: &str, headers: &[(&str, &str)]) -> NetworkEvent {
    NetworkEvent::Request {
        url: url.to_string(),
        headers: Some(
            headers
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect::<Headers>(),
        ),
    }
}

pub fn response(url: &str) -> NetworkEvent {
    NetworkEvent::Response {
        url: url.to_string(),
    }
}

#[derive(Debug, Default)]
pub struct Listeners {
    next_id: Cell<u64>,
    sinks: RefCell<BTreeMap<ListenerId, EventSink>>,
}

impl Listeners {
    fn add(&self, sink: EventSink) -> ListenerId {
        let id = ListenerId(self.next_id.get());
        self.next_id.set(id.0 + 1);
        self.sinks.borrow_mut().insert(id, sink);
        id
    }

    fn remove(&self, id: ListenerId) {
        self.sinks.borrow_mut().remove(&id);
    }

    pub fn count(&self) -> usize {
        self.sinks.borrow().len()
    }

    fn sink(&self, feed: Feed) -> Option<EventSink> {
        self.sinks
            .borrow()
            .values()
            .find(|sink| sink.feed() == feed)
            .cloned()
    }
}

#[derive(Debug, Default)]
pub struct FakeState {
    pub page: Listeners,
    pub channel: Listeners,
    pub enabled: Cell<bool>,
    pub detached: Cell<bool>,
    pub fail_open: Cell<bool>,
    pub fail_enable: Cell<bool>,
    pub fail_listen: Cell<bool>,
    pub fail_detach: Cell<bool>,
}

#[derive(Debug, Default, Clone)]
pub struct FakePage {
    pub state: Rc<FakeState>,
}

impl FakePage {
    /// Current sink registered for `feed`, wherever it lives
    pub fn sink(&self, feed: Feed) -> Option<EventSink> {
        if Feed::CHANNEL.contains(&feed) {
            self.state.channel.sink(feed)
        } else {
            self.state.page.sink(feed)
        }
    }

    pub fn emit(&self, feed: Feed, event: NetworkEvent) -> bool {
        self.sink(feed).is_some_and(|sink| sink.emit(event))
    }

    /// Every listener is gone, and the channel is detached if one was opened
    pub fn assert_released(&self) {
        assert_eq!(self.state.page.count(), 0, "page listeners left behind");
        assert_eq!(self.state.channel.count(), 0, "channel listeners left behind");
        if self.state.enabled.get() {
            assert!(self.state.detached.get(), "channel was not detached");
        }
    }
}

#[derive(Debug)]
pub struct FakeChannel {
    state: Rc<FakeState>,
}

impl NetworkChannel for FakeChannel {
    async fn enable(&self) -> Result<()> {
        if self.state.fail_enable.get() {
            bail!("Network.enable rejected");
        }
        self.state.enabled.set(true);
        Ok(())
    }

    fn add_listener(&self, sink: EventSink) -> Result<ListenerId> {
        if self.state.fail_listen.get() && self.state.channel.count() > 0 {
            bail!("Event domain not enabled");
        }
        Ok(self.state.channel.add(sink))
    }

    fn remove_listener(&self, id: ListenerId) {
        self.state.channel.remove(id);
    }

    async fn detach(self) -> Result<()> {
        self.state.detached.set(true);
        if self.state.fail_detach.get() {
            bail!("Target closed");
        }
        Ok(())
    }
}

impl CapturePage for FakePage {
    type Channel = FakeChannel;

    async fn open_network_channel(&self) -> Result<FakeChannel> {
        if self.state.fail_open.get() {
            bail!("Session with given id not found");
        }
        Ok(FakeChannel {
            state: Rc::clone(&self.state),
        })
    }

    fn add_listener(&self, sink: EventSink) -> Result<ListenerId> {
        Ok(self.state.page.add(sink))
    }

    fn remove_listener(&self, id: ListenerId) {
        self.state.page.remove(id);
    }
}

/// Emits scripted events while "loading" a page
#[derive(Debug, Default)]
pub struct ScriptedNavigator {
    /// Delivered synchronously during navigation
    pub events: Vec<(Feed, NetworkEvent)>,
    /// Delivered from a background task after the given delay
    pub late_events: Vec<(Duration, Feed, NetworkEvent)>,
    /// Makes navigation fail after delivering the events
    pub error: Option<String>,
    pub navigated: RefCell<Vec<String>>,
    pub spawned_sinks: RefCell<Vec<EventSink>>,
}

impl ScriptedNavigator {
    pub fn with_events(events: Vec<(Feed, NetworkEvent)>) -> Self {
        Self {
            events,
            ..Self::default()
        }
    }
}

impl Navigator<FakePage> for ScriptedNavigator {
    type Profile = ();

    async fn navigate(&self, page: &FakePage, url: &str, _profile: &()) -> Result<()> {
        self.navigated.borrow_mut().push(url.to_string());

        for (feed, event) in &self.events {
            page.emit(*feed, event.clone());
        }

        for (delay, feed, event) in &self.late_events {
            let Some(sink) = page.sink(*feed) else {
                continue;
            };
            self.spawned_sinks.borrow_mut().push(sink.clone());

            let (delay, event) = (*delay, event.clone());
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                sink.emit(event);
            });
        }

        if let Some(e) = &self.error {
            bail!("{e}");
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct StubProbe {
    reachable: bool,
    pub probed: RefCell<Vec<String>>,
}

impl StubProbe {
    pub fn reachable() -> Self {
        Self {
            reachable: true,
            ..Self::default()
        }
    }

    pub fn unreachable() -> Self {
        Self::default()
    }
}

impl Reachability for StubProbe {
    async fn is_reachable(&self, url: &str) -> bool {
        self.probed.borrow_mut().push(url.to_string());
        self.reachable
    }
}
