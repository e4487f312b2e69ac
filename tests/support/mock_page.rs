//! Scripted page sessions.
//!
//! A [`MockPage`] fires pre-recorded events when an action is clicked. Events
//! listed under [`MockPage::on_load`] fire on the first `arm`, which is how a
//! popup delivers what it loaded. Signals that have no scripted event are
//! dropped right after a click so races end without waiting, unless the page
//! is built with [`MockPage::hold_open`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use casefile_core::resolve::{
    ActionRef, DownloadSignal, ObservedResponse, PageError, PageProvider, PageSession,
    ResponseFilter, SignalSenders, SignalWatch, signal_channel,
};
use casefile_core::Fetcher;
use tokio::sync::oneshot;

/// One scripted effect of a click.
pub enum Event {
    Download(DownloadSignal),
    Popup(MockPage),
    Response(ObservedResponse),
    Navigation(String),
}

/// Observable state that outlives the boxed session.
#[derive(Clone, Default)]
pub struct Probe {
    closed: Arc<AtomicBool>,
    clicks: Arc<Mutex<Vec<String>>>,
    navigations: Arc<Mutex<Vec<String>>>,
}

impl Probe {
    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn clicks(&self) -> Vec<String> {
        self.clicks.lock().unwrap().clone()
    }

    pub fn navigations(&self) -> Vec<String> {
        self.navigations.lock().unwrap().clone()
    }
}

pub struct MockPage {
    url: Mutex<String>,
    html: String,
    fetcher: Arc<dyn Fetcher>,
    on_click: Mutex<HashMap<String, Vec<Event>>>,
    on_load: Mutex<Vec<Event>>,
    labels: Vec<(String, ActionRef)>,
    attributes: HashMap<(String, String), Vec<String>>,
    /// Click holds the senders open instead of dropping unscripted ones.
    hold_open: bool,
    armed: Mutex<Option<SignalSenders>>,
    held: Mutex<Vec<Unfired>>,
    probe: Probe,
}

impl MockPage {
    pub fn new(url: impl Into<String>, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            url: Mutex::new(url.into()),
            html: "<html><body></body></html>".to_string(),
            fetcher,
            on_click: Mutex::new(HashMap::new()),
            on_load: Mutex::new(Vec::new()),
            labels: Vec::new(),
            attributes: HashMap::new(),
            hold_open: false,
            armed: Mutex::new(None),
            held: Mutex::new(Vec::new()),
            probe: Probe::default(),
        }
    }

    pub fn with_html(mut self, html: impl Into<String>) -> Self {
        self.html = html.into();
        self
    }

    pub fn on_click(self, action: &str, event: Event) -> Self {
        self.on_click
            .lock()
            .unwrap()
            .entry(action.to_string())
            .or_default()
            .push(event);
        self
    }

    pub fn on_load(self, event: Event) -> Self {
        self.on_load.lock().unwrap().push(event);
        self
    }

    pub fn with_label(mut self, label: &str, action: &str) -> Self {
        self.labels.push((label.to_string(), ActionRef::new(action)));
        self
    }

    pub fn with_attribute(mut self, tag: &str, attribute: &str, value: &str) -> Self {
        self.attributes
            .entry((tag.to_string(), attribute.to_string()))
            .or_default()
            .push(value.to_string());
        self
    }

    /// Unscripted signals stay pending until their timeouts.
    pub fn hold_open(mut self) -> Self {
        self.hold_open = true;
        self
    }

    pub fn probe(&self) -> Probe {
        self.probe.clone()
    }

    /// Sends `events` through `senders` and returns the senders left unused.
    fn fire(senders: SignalSenders, events: Vec<Event>) -> Unfired {
        let mut unfired = Unfired {
            download: Some(senders.download),
            popup: Some(senders.popup),
            response: Some(senders.response),
            navigation: Some(senders.navigation),
        };

        for event in events {
            match event {
                Event::Download(signal) => {
                    if let Some(tx) = unfired.download.take() {
                        let _ = tx.send(signal);
                    }
                }
                Event::Popup(page) => {
                    if let Some(tx) = unfired.popup.take() {
                        let _ = tx.send(Box::new(page) as Box<dyn PageSession>);
                    }
                }
                Event::Response(observed) => {
                    if let Some(tx) = unfired.response.take() {
                        let _ = tx.send(observed);
                    }
                }
                Event::Navigation(url) => {
                    if let Some(tx) = unfired.navigation.take() {
                        let _ = tx.send(url);
                    }
                }
            }
        }
        unfired
    }
}

/// Senders a click did not use.
#[derive(Default)]
struct Unfired {
    download: Option<oneshot::Sender<DownloadSignal>>,
    popup: Option<oneshot::Sender<Box<dyn PageSession>>>,
    response: Option<oneshot::Sender<ObservedResponse>>,
    navigation: Option<oneshot::Sender<String>>,
}

#[async_trait]
impl PageSession for MockPage {
    async fn current_url(&self) -> Result<String, PageError> {
        Ok(self.url.lock().unwrap().clone())
    }

    async fn navigate(&self, url: &str) -> Result<(), PageError> {
        self.probe.navigations.lock().unwrap().push(url.to_string());
        *self.url.lock().unwrap() = url.to_string();
        Ok(())
    }

    async fn arm(&self, _filter: &ResponseFilter) -> Result<SignalWatch, PageError> {
        if self.probe.closed() {
            return Err(PageError::Closed);
        }
        let (senders, watch) = signal_channel();
        let load_events: Vec<Event> = self.on_load.lock().unwrap().drain(..).collect();
        if load_events.is_empty() {
            *self.armed.lock().unwrap() = Some(senders);
        } else {
            Self::fire(senders, load_events);
        }
        Ok(watch)
    }

    async fn click(&self, action: &ActionRef) -> Result<(), PageError> {
        self.probe
            .clicks
            .lock()
            .unwrap()
            .push(action.as_str().to_string());
        let events = self
            .on_click
            .lock()
            .unwrap()
            .remove(action.as_str())
            .unwrap_or_default();
        let armed = self.armed.lock().unwrap().take();
        if let Some(senders) = armed {
            let unfired = Self::fire(senders, events);
            if self.hold_open {
                self.held.lock().unwrap().push(unfired);
            }
        }
        Ok(())
    }

    async fn find_by_label(&self, pattern: &str) -> Result<Option<ActionRef>, PageError> {
        let regex = regex::Regex::new(pattern).map_err(|e| PageError::Action {
            message: e.to_string(),
        })?;
        Ok(self
            .labels
            .iter()
            .find(|(label, _)| regex.is_match(label))
            .map(|(_, action)| action.clone()))
    }

    async fn attribute_values(
        &self,
        selector: &str,
        attribute: &str,
    ) -> Result<Vec<String>, PageError> {
        Ok(self
            .attributes
            .get(&(selector.to_string(), attribute.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    fn fetcher(&self) -> Arc<dyn Fetcher> {
        Arc::clone(&self.fetcher)
    }

    async fn snapshot(&self) -> Result<String, PageError> {
        Ok(self.html.clone())
    }

    async fn close(&self) -> Result<(), PageError> {
        self.probe.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands out pre-built pages by URL, once each.
#[derive(Default)]
pub struct MockProvider {
    pages: Mutex<HashMap<String, MockPage>>,
}

impl MockProvider {
    pub fn with_page(self, page: MockPage) -> Self {
        let url = page.url.lock().unwrap().clone();
        self.pages.lock().unwrap().insert(url, page);
        self
    }
}

#[async_trait]
impl PageProvider for MockProvider {
    async fn open(&self, url: &str) -> Result<Box<dyn PageSession>, PageError> {
        self.pages
            .lock()
            .unwrap()
            .remove(url)
            .map(|page| Box::new(page) as Box<dyn PageSession>)
            .ok_or_else(|| PageError::Navigation {
                url: url.to_string(),
                message: "no scripted page".to_string(),
            })
    }
}
