use std::fmt;

use anyhow::Result;
use tokio::sync::mpsc;

use crate::Headers;

/// One of the four network event feeds a capture listens to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feed {
    /// DevTools `Network.requestWillBeSent`, carries the full outbound headers
    RequestWillBeSent,
    /// DevTools `Network.responseReceived`, carries the final URL only
    ResponseReceived,
    /// Page-level `request` notification
    PageRequest,
    /// Page-level `response` notification
    PageResponse,
}

impl Feed {
    /// Feeds served by the low-level [`NetworkChannel`]
    pub const CHANNEL: [Self; 2] = [Self::RequestWillBeSent, Self::ResponseReceived];
    /// Feeds served by the [`CapturePage`] itself
    pub const PAGE: [Self; 2] = [Self::PageRequest, Self::PageResponse];
}

impl fmt::Display for Feed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::RequestWillBeSent => "Network.requestWillBeSent",
            Self::ResponseReceived => "Network.responseReceived",
            Self::PageRequest => "page request",
            Self::PageResponse => "page response",
        })
    }
}

/// A network event observed while the page loads
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    Request {
        url: String,
        headers: Option<Headers>,
    },
    Response { url: String },
}

impl NetworkEvent {
    #[must_use]
    pub fn url(&self) -> &str {
        match self {
            Self::Request { url, .. } | Self::Response { url } => url,
        }
    }
}

pub(crate) type Sighting = (Feed, NetworkEvent);

/// Handed to an event source on registration; forwards its events into the capture
#[derive(Debug, Clone)]
pub struct EventSink {
    feed: Feed,
    tx: mpsc::UnboundedSender<Sighting>,
}

impl EventSink {
    pub(crate) fn new(feed: Feed, tx: mpsc::UnboundedSender<Sighting>) -> Self {
        Self { feed, tx }
    }

    #[must_use]
    pub const fn feed(&self) -> Feed {
        self.feed
    }

    /// Forwards an event. Returns `false` once the capture is no longer listening.
    pub fn emit(&self, event: NetworkEvent) -> bool {
        self.tx.send((self.feed, event)).is_ok()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Registration handle minted by an event source, used to unregister later
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub u64);

/// Low-level network observation channel (e.g. a DevTools session) opened on a page
#[allow(async_fn_in_trait)]
pub trait NetworkChannel {
    /// Turns on network traffic reporting
    async fn enable(&self) -> Result<()>;

    /// Starts forwarding the events of `sink.feed()` into `sink`
    fn add_listener(&self, sink: EventSink) -> Result<ListenerId>;

    fn remove_listener(&self, id: ListenerId);

    /// Releases the channel. May fail if the page is already going away.
    async fn detach(self) -> Result<()>;
}

/// A browser page that can be observed while it loads
#[allow(async_fn_in_trait)]
pub trait CapturePage {
    type Channel: NetworkChannel;

    async fn open_network_channel(&self) -> Result<Self::Channel>;

    /// Starts forwarding page-level events of `sink.feed()` into `sink`
    fn add_listener(&self, sink: EventSink) -> Result<ListenerId>;

    fn remove_listener(&self, id: ListenerId);
}

/// Drives a page to a URL; site-specific waits and logins live behind this
#[allow(async_fn_in_trait)]
pub trait Navigator<P> {
    /// Site profile telling the navigator how to load a given site
    type Profile;

    /// Resolves once the page is considered loaded
    async fn navigate(&self, page: &P, url: &str, profile: &Self::Profile) -> Result<()>;
}
