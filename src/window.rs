//! The window a widget runs in, reduced to what the bridge instruments.
//!
//! Browsers hand the bridge a live `contentWindow` to patch. Here the seams
//! are explicit: history is a swappable [`HistoryApi`] object, and everything
//! the page does surfaces as a [`WindowEvent`] on a subscription.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::time::Instant;
use tracing::debug;
use url::Url;

use crate::dom::{DomError, Document, LayoutBox, NodeId};
use crate::value::RpcValue;

#[derive(Debug, Error)]
pub enum WindowError {
    #[error(transparent)]
    Dom(#[from] DomError),
    #[error("invalid url {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleLevel {
    Log,
    Info,
    Debug,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WindowEvent {
    Load,
    Console {
        level: ConsoleLevel,
        args: Vec<RpcValue>,
    },
    /// Uncaught error reaching the global `error` handler.
    Error {
        message: String,
        stack: Option<String>,
        source: Option<String>,
        line: Option<u32>,
        column: Option<u32>,
    },
    UnhandledRejection {
        reason: RpcValue,
    },
    SecurityPolicyViolation {
        blocked_uri: String,
        violated_directive: String,
        source_file: Option<String>,
    },
    Click {
        target: NodeId,
    },
    /// An `<img>` had its `src` assigned.
    ImageSrc {
        element: NodeId,
        src: String,
    },
    Resize,
    /// One mutation record. `target` is the element whose child list or
    /// attribute changed.
    Mutation {
        target: NodeId,
        removed: Vec<NodeId>,
        attribute: Option<String>,
    },
    WindowOpen {
        url: String,
    },
    KeyDown {
        key: String,
    },
    PopState {
        state: RpcValue,
    },
    HashChange {
        old_url: String,
        new_url: String,
    },
    /// The frame hosting the window went away.
    Removed,
}

/// `window.history`, as an object the bridge can decorate.
pub trait HistoryApi: Send + Sync {
    fn push_state(&self, state: RpcValue, url: Option<&str>);
    fn replace_state(&self, state: RpcValue, url: Option<&str>);
    fn back(&self) {
        self.go(-1);
    }
    fn forward(&self) {
        self.go(1);
    }
    fn go(&self, delta: i64);
    fn state(&self) -> RpcValue;
    fn length(&self) -> usize;
}

/// `navigator.userActivation.isActive`. `None` when the environment has no
/// such API.
pub trait UserActivation: Send + Sync {
    fn is_active(&self) -> Option<bool>;
}

pub trait InstrumentableWindow: UserActivation {
    fn location(&self) -> Url;

    fn origin(&self) -> String {
        self.location().origin().ascii_serialization()
    }

    fn history(&self) -> Arc<dyn HistoryApi>;

    /// Replace `window.history`; returns the object that was installed.
    fn set_history(&self, history: Arc<dyn HistoryApi>) -> Arc<dyn HistoryApi>;

    fn subscribe(&self) -> UnboundedReceiver<WindowEvent>;

    /// `document.open(); document.write(html); document.close()`.
    fn write_document(&self, html: &str);

    fn document(&self) -> MutexGuard<'_, Document>;

    fn set_global(&self, name: &str, value: RpcValue);

    fn global(&self, name: &str) -> Option<RpcValue>;
}

#[derive(Default)]
struct EventBus {
    subscribers: Mutex<Vec<UnboundedSender<WindowEvent>>>,
}

impl EventBus {
    fn subscribe(&self) -> UnboundedReceiver<WindowEvent> {
        let (sender, receiver) = unbounded_channel();
        lock(&self.subscribers).push(sender);
        receiver
    }

    fn emit(&self, event: WindowEvent) {
        lock(&self.subscribers).retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct HistoryEntry {
    state: RpcValue,
    url: Url,
}

struct HistoryStack {
    entries: Vec<HistoryEntry>,
    index: usize,
}

/// Session history of a [`HeadlessWindow`]. Traversals fire `popstate` and,
/// when the fragment differs, `hashchange`.
pub struct HeadlessHistory {
    stack: Mutex<HistoryStack>,
    location: Arc<RwLock<Url>>,
    events: Arc<EventBus>,
}

impl HeadlessHistory {
    fn resolve(&self, url: Option<&str>) -> Url {
        let current = self
            .location
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        match url {
            Some(url) => current.join(url).unwrap_or(current),
            None => current,
        }
    }

    fn set_location(&self, url: Url) {
        *self
            .location
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = url;
    }

    /// Fragment navigation: a new entry with a null state and a
    /// `hashchange`, without `popstate`.
    fn navigate_hash(&self, hash: &str) {
        let old_url = self.resolve(None);
        let mut new_url = old_url.clone();
        new_url.set_fragment(Some(hash.trim_start_matches('#')));
        if new_url == old_url {
            return;
        }
        {
            let mut stack = lock(&self.stack);
            let keep = stack.index + 1;
            stack.entries.truncate(keep);
            stack.entries.push(HistoryEntry {
                state: RpcValue::Null,
                url: new_url.clone(),
            });
            stack.index = keep;
        }
        self.set_location(new_url.clone());
        self.events.emit(WindowEvent::HashChange {
            old_url: old_url.to_string(),
            new_url: new_url.to_string(),
        });
    }
}

impl HistoryApi for HeadlessHistory {
    fn push_state(&self, state: RpcValue, url: Option<&str>) {
        let url = self.resolve(url);
        {
            let mut stack = lock(&self.stack);
            let keep = stack.index + 1;
            stack.entries.truncate(keep);
            stack.entries.push(HistoryEntry {
                state,
                url: url.clone(),
            });
            stack.index = keep;
        }
        self.set_location(url);
    }

    fn replace_state(&self, state: RpcValue, url: Option<&str>) {
        let url = self.resolve(url);
        {
            let mut stack = lock(&self.stack);
            let index = stack.index;
            stack.entries[index] = HistoryEntry {
                state,
                url: url.clone(),
            };
        }
        self.set_location(url);
    }

    /// Out-of-range deltas are ignored. `go(0)` stands in for a reload and
    /// re-fires `popstate` for the current entry.
    fn go(&self, delta: i64) {
        let (state, old_url, new_url) = {
            let mut stack = lock(&self.stack);
            let target = stack.index as i64 + delta;
            if target < 0 || target >= stack.entries.len() as i64 {
                debug!(target = "navigation", delta, "history traversal out of range");
                return;
            }
            let old_url = stack.entries[stack.index].url.clone();
            stack.index = target as usize;
            let entry = &stack.entries[stack.index];
            (entry.state.clone(), old_url, entry.url.clone())
        };
        self.set_location(new_url.clone());
        self.events.emit(WindowEvent::PopState { state });
        if old_url.fragment() != new_url.fragment() {
            self.events.emit(WindowEvent::HashChange {
                old_url: old_url.to_string(),
                new_url: new_url.to_string(),
            });
        }
    }

    fn state(&self) -> RpcValue {
        let stack = lock(&self.stack);
        stack.entries[stack.index].state.clone()
    }

    fn length(&self) -> usize {
        lock(&self.stack).entries.len()
    }
}

/// How long a gesture keeps the window activated.
pub const TRANSIENT_ACTIVATION: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
enum Activation {
    Unsupported,
    Inactive,
    Since(Instant),
}

/// In-memory window with no script engine. Whatever a widget would do is
/// driven from the outside through the `dispatch_*`/`set_*` methods.
pub struct HeadlessWindow {
    location: Arc<RwLock<Url>>,
    events: Arc<EventBus>,
    document: Mutex<Document>,
    native_history: Arc<HeadlessHistory>,
    history: RwLock<Arc<dyn HistoryApi>>,
    globals: Mutex<BTreeMap<String, RpcValue>>,
    activation: Mutex<Activation>,
}

impl HeadlessWindow {
    pub fn new(location: Url) -> Self {
        let events = Arc::new(EventBus::default());
        let shared_location = Arc::new(RwLock::new(location.clone()));
        let native_history = Arc::new(HeadlessHistory {
            stack: Mutex::new(HistoryStack {
                entries: vec![HistoryEntry {
                    state: RpcValue::Null,
                    url: location,
                }],
                index: 0,
            }),
            location: Arc::clone(&shared_location),
            events: Arc::clone(&events),
        });
        let history: Arc<dyn HistoryApi> = native_history.clone();
        Self {
            location: shared_location,
            events,
            document: Mutex::new(Document::default()),
            native_history,
            history: RwLock::new(history),
            globals: Mutex::new(BTreeMap::new()),
            activation: Mutex::new(Activation::Inactive),
        }
    }

    pub fn parse(location: &str) -> Result<Self, WindowError> {
        let url = Url::parse(location).map_err(|source| WindowError::InvalidUrl {
            url: location.to_string(),
            source,
        })?;
        Ok(Self::new(url))
    }

    pub fn emit(&self, event: WindowEvent) {
        self.events.emit(event);
    }

    /// `None` models an environment without `navigator.userActivation`.
    /// `Some(true)` starts a fresh activation window.
    pub fn set_user_activation(&self, active: Option<bool>) {
        *lock(&self.activation) = match active {
            None => Activation::Unsupported,
            Some(false) => Activation::Inactive,
            Some(true) => Activation::Since(Instant::now()),
        };
    }

    /// A click is a user gesture; it activates the window first for
    /// [`TRANSIENT_ACTIVATION`].
    pub fn dispatch_click(&self, target: NodeId) {
        {
            let mut activation = lock(&self.activation);
            if !matches!(*activation, Activation::Unsupported) {
                *activation = Activation::Since(Instant::now());
            }
        }
        self.emit(WindowEvent::Click { target });
    }

    pub fn dispatch_key(&self, key: &str) {
        self.emit(WindowEvent::KeyDown {
            key: key.to_string(),
        });
    }

    pub fn console(&self, level: ConsoleLevel, args: Vec<RpcValue>) {
        self.emit(WindowEvent::Console { level, args });
    }

    pub fn navigate_hash(&self, hash: &str) {
        self.native_history.navigate_hash(hash);
    }

    pub fn set_layout(&self, id: NodeId, layout: LayoutBox) -> Result<(), WindowError> {
        self.document().set_layout(id, layout)?;
        self.emit(WindowEvent::Resize);
        Ok(())
    }

    pub fn set_attribute(&self, id: NodeId, name: &str, value: &str) -> Result<(), WindowError> {
        self.document().set_attr(id, name, value)?;
        self.emit(WindowEvent::Mutation {
            target: id,
            removed: Vec::new(),
            attribute: Some(name.to_string()),
        });
        Ok(())
    }

    /// `img.src = src`, routed through the interceptor.
    pub fn set_image_src(&self, element: NodeId, src: &str) -> Result<(), WindowError> {
        self.document().set_attr(element, "src", src)?;
        self.emit(WindowEvent::ImageSrc {
            element,
            src: src.to_string(),
        });
        Ok(())
    }

    /// Remove every child of `parent` for which `keep` is false, as one
    /// mutation record.
    pub fn remove_children(
        &self,
        parent: NodeId,
        keep: impl Fn(&Document, NodeId) -> bool,
    ) -> Result<(), WindowError> {
        let removed = {
            let mut document = self.document();
            let doomed: Vec<NodeId> = document
                .children(parent)
                .iter()
                .copied()
                .filter(|child| !keep(&document, *child))
                .collect();
            for child in &doomed {
                document.remove_child(parent, *child)?;
            }
            doomed
        };
        if !removed.is_empty() {
            self.emit(WindowEvent::Mutation {
                target: parent,
                removed,
                attribute: None,
            });
        }
        Ok(())
    }

    pub fn open(&self, url: &str) {
        self.emit(WindowEvent::WindowOpen {
            url: url.to_string(),
        });
    }

    pub fn remove_frame(&self) {
        self.emit(WindowEvent::Removed);
    }
}

impl UserActivation for HeadlessWindow {
    fn is_active(&self) -> Option<bool> {
        match *lock(&self.activation) {
            Activation::Unsupported => None,
            Activation::Inactive => Some(false),
            Activation::Since(at) => Some(at.elapsed() < TRANSIENT_ACTIVATION),
        }
    }
}

impl InstrumentableWindow for HeadlessWindow {
    fn location(&self) -> Url {
        self.location
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn history(&self) -> Arc<dyn HistoryApi> {
        self.history
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn set_history(&self, history: Arc<dyn HistoryApi>) -> Arc<dyn HistoryApi> {
        let mut slot = self
            .history
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        std::mem::replace(&mut *slot, history)
    }

    fn subscribe(&self) -> UnboundedReceiver<WindowEvent> {
        self.events.subscribe()
    }

    fn write_document(&self, html: &str) {
        *self.document() = Document::parse(html);
        self.emit(WindowEvent::Load);
    }

    fn document(&self) -> MutexGuard<'_, Document> {
        lock(&self.document)
    }

    fn set_global(&self, name: &str, value: RpcValue) {
        lock(&self.globals).insert(name.to_string(), value);
    }

    fn global(&self, name: &str) -> Option<RpcValue> {
        lock(&self.globals).get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window() -> HeadlessWindow {
        HeadlessWindow::parse("https://sandbox.example/app").unwrap()
    }

    #[tokio::test]
    async fn traversal_fires_popstate_and_hashchange() {
        let window = window();
        let mut events = window.subscribe();
        let history = window.history();
        history.push_state(RpcValue::from("a"), Some("#a"));
        assert_eq!(window.location().fragment(), Some("a"));
        history.back();

        assert_eq!(
            events.recv().await,
            Some(WindowEvent::PopState {
                state: RpcValue::Null
            })
        );
        assert!(matches!(
            events.recv().await,
            Some(WindowEvent::HashChange { .. })
        ));
        assert_eq!(window.location().fragment(), None);
    }

    #[tokio::test]
    async fn out_of_range_traversal_is_ignored() {
        let window = window();
        let mut events = window.subscribe();
        window.history().go(-1);
        window.emit(WindowEvent::Resize);
        assert_eq!(events.recv().await, Some(WindowEvent::Resize));
    }

    #[test]
    fn history_can_be_swapped() {
        let window = window();
        let original = window.history();
        let previous = window.set_history(original.clone());
        assert_eq!(
            Arc::as_ptr(&previous).cast::<()>(),
            Arc::as_ptr(&original).cast::<()>()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn activation_expires_after_the_gesture_window() {
        let window = window();
        window.dispatch_click(0);
        assert_eq!(window.is_active(), Some(true));

        tokio::time::advance(TRANSIENT_ACTIVATION).await;
        assert_eq!(window.is_active(), Some(false));

        window.dispatch_click(0);
        assert_eq!(window.is_active(), Some(true));
    }

    #[test]
    fn clicks_activate_only_when_supported() {
        let window = window();
        window.dispatch_click(0);
        assert_eq!(window.is_active(), Some(true));

        window.set_user_activation(None);
        window.dispatch_click(0);
        assert_eq!(window.is_active(), None);
    }
}
