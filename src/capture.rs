use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::{Headers, pattern::is_manifest_url, validate::Reachability};

mod events;
#[cfg(test)]
pub(crate) mod fake;

use events::Sighting;
pub use events::{
    CapturePage, EventSink, Feed, ListenerId, Navigator, NetworkChannel, NetworkEvent,
};

pub const DEFAULT_CAPTURE_TIMEOUT: Duration = Duration::from_millis(15_000);

#[derive(Debug, Clone)]
pub struct CaptureOptions {
    /// How long to keep listening once the page has loaded
    pub timeout: Duration,
    /// Aborts the capture early when cancelled
    pub cancel: Option<CancellationToken>,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_CAPTURE_TIMEOUT,
            cancel: None,
        }
    }
}

/// A manifest URL that was seen on the wire and answered a probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedManifest {
    pub m3u8_url: String,
    /// Outbound headers of the winning request; `None` when a response won the race
    pub request_headers: Option<Headers>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CaptureError {
    #[error(
        "No M3U8 link detected in network traffic within timeout period ({}ms).",
        .0.as_millis()
    )]
    Timeout(Duration),

    #[error("Captured M3U8 URL is not accessible: {0}")]
    Unreachable(String),

    #[error("M3U8 capture was cancelled.")]
    Cancelled,

    /// Attaching, registering listeners or navigating failed
    #[error("M3U8 capture error: {0}")]
    Setup(String),
}

/// Loads `url` in `page` and returns the first manifest URL seen in its traffic
///
/// Listens to the DevTools request/response feeds of a freshly opened
/// [`NetworkChannel`] and to the page's own request/response feeds. The first event
/// from any of them whose URL passes [`is_manifest_url`] wins; request events bring
/// their headers along. The winner must then pass `validator`.
///
/// Never panics or propagates errors from the page: every failure is reported as a
/// [`CaptureError`]. All listeners are removed and the channel is detached on every path.
#[instrument(skip(page, navigator, profile, options, validator))]
pub async fn capture_from_network<P, N, V>(
    page: &P,
    navigator: &N,
    url: &str,
    profile: &N::Profile,
    options: &CaptureOptions,
    validator: &V,
) -> Result<CapturedManifest, CaptureError>
where
    P: CapturePage,
    N: Navigator<P>,
    V: Reachability + ?Sized,
{
    let mut session = CaptureSession::new(page);
    let outcome = session
        .run(navigator, url, profile, options, validator)
        .await;
    session.detach().await;

    outcome
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Attached,
    Listening,
    Resolved,
    TimedOut,
    Errored,
    Detached,
}

enum Wake {
    Sighting(Sighting),
    Cancelled,
    Deadline,
}

/// State of a single capture call
struct CaptureSession<'p, P: CapturePage> {
    page: &'p P,
    phase: Phase,
    channel: Option<P::Channel>,
    channel_listeners: Vec<ListenerId>,
    page_listeners: Vec<ListenerId>,
    tx: mpsc::UnboundedSender<Sighting>,
    rx: mpsc::UnboundedReceiver<Sighting>,
}

impl<'p, P: CapturePage> CaptureSession<'p, P> {
    fn new(page: &'p P) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            page,
            phase: Phase::Idle,
            channel: None,
            channel_listeners: Vec::new(),
            page_listeners: Vec::new(),
            tx,
            rx,
        }
    }

    fn enter(&mut self, phase: Phase) {
        debug!("M3U8 capture {:?} -> {phase:?}", self.phase);
        self.phase = phase;
    }

    async fn run<N, V>(
        &mut self,
        navigator: &N,
        url: &str,
        profile: &N::Profile,
        options: &CaptureOptions,
        validator: &V,
    ) -> Result<CapturedManifest, CaptureError>
    where
        N: Navigator<P>,
        V: Reachability + ?Sized,
    {
        let setup = tokio::select! {
            res = self.setup(navigator, url, profile) => {
                res.map_err(|e| CaptureError::Setup(format!("{e:#}")))
            }
            () = cancelled(options.cancel.as_ref()) => Err(CaptureError::Cancelled),
        };
        if let Err(e) = setup {
            if matches!(e, CaptureError::Setup(_)) {
                error!("{e}");
            } else {
                info!("{e}");
            }
            self.enter(Phase::Errored);
            return Err(e);
        }

        info!("Page loaded, monitoring network traffic for M3U8.");
        let manifest = self.wait_for_manifest(url, options).await?;

        if !validator.is_reachable(&manifest.m3u8_url).await {
            self.enter(Phase::Errored);
            return Err(CaptureError::Unreachable(manifest.m3u8_url));
        }

        info!("M3U8 captured and validated: {}", manifest.m3u8_url);
        self.enter(Phase::Resolved);
        Ok(manifest)
    }

    async fn setup<N: Navigator<P>>(
        &mut self,
        navigator: &N,
        url: &str,
        profile: &N::Profile,
    ) -> Result<()> {
        let channel = self
            .page
            .open_network_channel()
            .await
            .context("Opening network channel")?;
        let channel = self.channel.insert(channel);
        channel
            .enable()
            .await
            .context("Enabling network monitoring")?;

        for feed in Feed::CHANNEL {
            let id = channel
                .add_listener(EventSink::new(feed, self.tx.clone()))
                .with_context(|| format!("Listening to {feed}"))?;
            self.channel_listeners.push(id);
        }
        self.enter(Phase::Attached);
        info!("Network monitoring enabled for M3U8 capture.");

        for feed in Feed::PAGE {
            let id = self
                .page
                .add_listener(EventSink::new(feed, self.tx.clone()))
                .with_context(|| format!("Listening to {feed}"))?;
            self.page_listeners.push(id);
        }
        self.enter(Phase::Listening);

        navigator
            .navigate(self.page, url, profile)
            .await
            .with_context(|| format!("Navigating to {url}"))
    }

    /// Takes sightings in delivery order until one is a manifest or time runs out
    async fn wait_for_manifest(
        &mut self,
        url: &str,
        options: &CaptureOptions,
    ) -> Result<CapturedManifest, CaptureError> {
        let deadline = tokio::time::sleep(options.timeout);
        tokio::pin!(deadline);

        loop {
            let wake = tokio::select! {
                biased;
                () = cancelled(options.cancel.as_ref()) => Wake::Cancelled,
                Some(sighting) = self.rx.recv() => Wake::Sighting(sighting),
                () = &mut deadline => Wake::Deadline,
            };

            match wake {
                Wake::Sighting((feed, event)) => {
                    if let Some(manifest) = manifest_from(feed, event) {
                        return Ok(manifest);
                    }
                    if !deadline.is_elapsed() {
                        continue;
                    }
                }
                Wake::Cancelled => {
                    info!("M3U8 capture cancelled for {url}");
                    self.enter(Phase::Errored);
                    return Err(CaptureError::Cancelled);
                }
                Wake::Deadline => {}
            }

            warn!(
                "M3U8 capture timeout ({}ms) for {url}",
                options.timeout.as_millis()
            );
            self.enter(Phase::TimedOut);
            return Err(CaptureError::Timeout(options.timeout));
        }
    }

    /// Unregisters every listener and releases the channel
    async fn detach(mut self) {
        for id in self.page_listeners.drain(..) {
            self.page.remove_listener(id);
        }

        if let Some(channel) = self.channel.take() {
            for id in self.channel_listeners.drain(..) {
                channel.remove_listener(id);
            }
            // The page may already be closing
            if let Err(e) = channel.detach().await {
                debug!("Ignoring network channel detach error: {e:#}");
            }
        }

        self.rx.close();
        self.enter(Phase::Detached);
    }
}

fn manifest_from(feed: Feed, event: NetworkEvent) -> Option<CapturedManifest> {
    if !is_manifest_url(event.url()) {
        return None;
    }

    let (m3u8_url, request_headers) = match event {
        NetworkEvent::Request { url, headers } => (url, headers),
        NetworkEvent::Response { url } => (url, None),
    };
    info!("M3U8 link detected via {feed}: {m3u8_url}");
    Some(CapturedManifest {
        m3u8_url,
        request_headers,
    })
}

async fn cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}
