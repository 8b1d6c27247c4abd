//! History virtualization for the sandboxed window.
//!
//! Widgets call the history API however they like; the decorated history keeps
//! its own id stack and hash list so the host sees a consistent series of
//! push/replace/pop/update notifications.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::debug;
use url::Url;

use crate::value::RpcValue;
use crate::window::{HistoryApi, InstrumentableWindow, WindowEvent};

const NAVIGATION_ID_KEY: &str = "__bridgeNavigationId";
const STATE_KEY: &str = "state";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NavigationKind {
    Push,
    Replace,
    Pop,
    Update,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NavigationNotification {
    pub kind: NavigationKind,
    pub index: usize,
    pub length: usize,
    pub can_go_back: bool,
    pub can_go_forward: bool,
    pub hash: String,
}

pub type NavigationListener = Arc<dyn Fn(NavigationNotification) + Send + Sync>;

/// Entries pushed since installation. The document's own entry sits below
/// the stack: the first pushed entry is index 0 and cannot go back.
#[derive(Debug)]
struct NavigationState {
    stack: Vec<u64>,
    hashes: Vec<String>,
    initial_hash: String,
    current_index: usize,
    counter: u64,
    pending_delta: Option<i64>,
}

impl NavigationState {
    fn new(hash: String) -> Self {
        Self {
            stack: Vec::new(),
            hashes: Vec::new(),
            initial_hash: hash,
            current_index: 0,
            counter: 0,
            pending_delta: None,
        }
    }

    fn current_hash(&self) -> &str {
        self.hashes
            .get(self.current_index)
            .unwrap_or(&self.initial_hash)
    }

    fn push_entry(&mut self, hash: String) -> u64 {
        self.counter += 1;
        let keep = if self.stack.is_empty() {
            0
        } else {
            self.current_index + 1
        };
        self.stack.truncate(keep);
        self.hashes.truncate(keep);
        self.stack.push(self.counter);
        self.hashes.push(hash);
        self.current_index = keep;
        self.counter
    }

    /// Rewrite the current entry's hash, returning its id. Before the first
    /// push that is the document's own entry.
    fn replace_entry(&mut self, hash: String) -> u64 {
        match self.hashes.get_mut(self.current_index) {
            Some(current) => {
                *current = hash;
                self.stack[self.current_index]
            }
            None => {
                self.initial_hash = hash;
                0
            }
        }
    }

    fn last_index(&self) -> usize {
        self.stack.len().saturating_sub(1)
    }

    /// Move to `target`, classifying the move by its direction.
    fn move_to(&mut self, target: usize) -> NavigationKind {
        let target = target.min(self.last_index());
        let kind = classify(target as i64 - self.current_index as i64);
        self.current_index = target;
        kind
    }

    fn apply_delta(&mut self, delta: i64) -> NavigationKind {
        let target = (self.current_index as i64 + delta).clamp(0, self.last_index() as i64);
        self.current_index = target as usize;
        classify(delta)
    }

    fn snapshot(&self, kind: NavigationKind) -> NavigationNotification {
        NavigationNotification {
            kind,
            index: self.current_index,
            length: self.stack.len(),
            can_go_back: self.current_index > 0,
            can_go_forward: self.current_index + 1 < self.stack.len(),
            hash: self.current_hash().to_string(),
        }
    }
}

fn classify(delta: i64) -> NavigationKind {
    match delta {
        d if d < 0 => NavigationKind::Pop,
        d if d > 0 => NavigationKind::Push,
        _ => NavigationKind::Update,
    }
}

fn hash_of(url: &Url) -> String {
    match url.fragment() {
        Some(fragment) if !fragment.is_empty() => format!("#{fragment}"),
        _ => String::new(),
    }
}

/// The hash a `pushState`/`replaceState` URL argument leads to.
fn hash_for(url: Option<&str>, current: &str) -> String {
    match url {
        None => current.to_string(),
        Some(url) => match url.split_once('#') {
            Some((_, fragment)) if !fragment.is_empty() => format!("#{fragment}"),
            _ => String::new(),
        },
    }
}

fn tag_state(state: RpcValue, id: u64) -> RpcValue {
    RpcValue::object([
        (NAVIGATION_ID_KEY, RpcValue::Number(id as f64)),
        (STATE_KEY, state),
    ])
}

fn tagged_id(state: &RpcValue) -> Option<u64> {
    state
        .get(NAVIGATION_ID_KEY)
        .and_then(RpcValue::as_f64)
        .map(|id| id as u64)
}

fn untag_state(state: RpcValue) -> RpcValue {
    if tagged_id(&state).is_some() {
        state.get(STATE_KEY).cloned().unwrap_or_default()
    } else {
        state
    }
}

struct Tracker {
    original: Arc<dyn HistoryApi>,
    window: Weak<dyn InstrumentableWindow>,
    state: Mutex<NavigationState>,
    listener: NavigationListener,
}

impl Tracker {
    fn lock(&self) -> MutexGuard<'_, NavigationState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn current_hash(&self) -> Option<String> {
        self.window.upgrade().map(|window| hash_of(&window.location()))
    }

    fn notify(&self, notification: NavigationNotification) {
        debug!(
            target = "navigation",
            kind = ?notification.kind,
            index = notification.index,
            length = notification.length,
            "navigation"
        );
        (self.listener)(notification);
    }

    fn push(&self, state: RpcValue, url: Option<&str>) {
        let (id, notification) = {
            let mut nav = self.lock();
            let hash = hash_for(url, nav.current_hash());
            let id = nav.push_entry(hash);
            (id, nav.snapshot(NavigationKind::Push))
        };
        self.original.push_state(tag_state(state, id), url);
        self.notify(notification);
    }

    fn replace(&self, state: RpcValue, url: Option<&str>) {
        let (id, notification) = {
            let mut nav = self.lock();
            let hash = hash_for(url, nav.current_hash());
            let id = nav.replace_entry(hash);
            (id, nav.snapshot(NavigationKind::Replace))
        };
        self.original.replace_state(tag_state(state, id), url);
        self.notify(notification);
    }

    fn traverse(&self, delta: i64) {
        {
            let mut nav = self.lock();
            let target = nav.current_index as i64 + delta;
            if target < 0 || target >= nav.stack.len() as i64 {
                debug!(target = "navigation", delta, "ignoring traversal outside the stack");
                return;
            }
            nav.pending_delta = Some(delta);
        }
        self.original.go(delta);
    }

    fn pop_to_root(&self) {
        let index = self.lock().current_index;
        if index > 0 {
            self.traverse(-(index as i64));
        }
    }

    fn on_pop_state(&self, state: &RpcValue) {
        let notification = {
            let mut nav = self.lock();
            if let Some(delta) = nav.pending_delta.take() {
                let kind = nav.apply_delta(delta);
                Some(nav.snapshot(kind))
            } else if let Some(id) = tagged_id(state) {
                match nav.stack.iter().position(|entry| *entry == id) {
                    Some(position) => {
                        let kind = nav.move_to(position);
                        Some(nav.snapshot(kind))
                    }
                    None => {
                        debug!(target = "navigation", id, "popstate for an unknown entry");
                        None
                    }
                }
            } else {
                drop(nav);
                match self.current_hash() {
                    Some(hash) => return self.reconcile_hash(hash),
                    None => None,
                }
            }
        };
        if let Some(notification) = notification {
            self.notify(notification);
        }
    }

    fn on_hash_change(&self, new_url: &str) {
        let Ok(url) = Url::parse(new_url) else {
            debug!(target = "navigation", %new_url, "unparseable hashchange url");
            return;
        };
        let hash = hash_of(&url);
        let notification = {
            let mut nav = self.lock();
            match nav.pending_delta.take() {
                Some(delta) => {
                    let kind = nav.apply_delta(delta);
                    Some(nav.snapshot(kind))
                }
                None => None,
            }
        };
        match notification {
            Some(notification) => self.notify(notification),
            None => self.reconcile_hash(hash),
        }
    }

    /// A hash change nobody asked for: ignore it when it matches the current
    /// entry, jump when the hash is already known, push otherwise.
    fn reconcile_hash(&self, hash: String) {
        let mut tag = None;
        let notification = {
            let mut nav = self.lock();
            if nav.current_hash() == hash {
                return;
            }
            match nav.hashes.iter().position(|known| *known == hash) {
                Some(position) => {
                    let kind = nav.move_to(position);
                    nav.snapshot(kind)
                }
                None => {
                    tag = Some(nav.push_entry(hash));
                    nav.snapshot(NavigationKind::Push)
                }
            }
        };
        if let Some(id) = tag {
            let state = self.original.state();
            self.original.replace_state(tag_state(state, id), None);
        }
        self.notify(notification);
    }
}

struct DecoratedHistory {
    tracker: Arc<Tracker>,
}

impl HistoryApi for DecoratedHistory {
    fn push_state(&self, state: RpcValue, url: Option<&str>) {
        self.tracker.push(state, url);
    }

    fn replace_state(&self, state: RpcValue, url: Option<&str>) {
        self.tracker.replace(state, url);
    }

    fn go(&self, delta: i64) {
        self.tracker.traverse(delta);
    }

    fn state(&self) -> RpcValue {
        untag_state(self.tracker.original.state())
    }

    fn length(&self) -> usize {
        self.tracker.original.length()
    }
}

/// Handle on an installed decoration. Tearing it down (or dropping it)
/// restores the window's original history.
pub struct VirtualHistory {
    tracker: Arc<Tracker>,
    listener: Option<JoinHandle<()>>,
}

impl VirtualHistory {
    pub fn install(window: &Arc<dyn InstrumentableWindow>, listener: NavigationListener) -> Self {
        let original = window.history();
        let hash = hash_of(&window.location());
        original.replace_state(tag_state(original.state(), 0), None);

        let tracker = Arc::new(Tracker {
            original,
            window: Arc::downgrade(window),
            state: Mutex::new(NavigationState::new(hash)),
            listener,
        });
        let mut events = window.subscribe();
        window.set_history(Arc::new(DecoratedHistory {
            tracker: Arc::clone(&tracker),
        }));

        let task_tracker = Arc::clone(&tracker);
        let listener = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    WindowEvent::PopState { state } => task_tracker.on_pop_state(&state),
                    WindowEvent::HashChange { new_url, .. } => task_tracker.on_hash_change(&new_url),
                    WindowEvent::Removed => break,
                    _ => {}
                }
            }
        });

        Self {
            tracker,
            listener: Some(listener),
        }
    }

    /// Go back to the first entry with a single traversal.
    pub fn pop_to_root(&self) {
        self.tracker.pop_to_root();
    }

    pub fn current_index(&self) -> usize {
        self.tracker.lock().current_index
    }

    pub fn teardown(&mut self) {
        let Some(listener) = self.listener.take() else {
            return;
        };
        listener.abort();
        if let Some(window) = self.tracker.window.upgrade() {
            window.set_history(Arc::clone(&self.tracker.original));
        }
    }
}

impl Drop for VirtualHistory {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::window::HeadlessWindow;
    use std::time::Duration;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    struct RecordingHistory {
        inner: Arc<dyn HistoryApi>,
        traversals: Mutex<Vec<i64>>,
    }

    impl HistoryApi for RecordingHistory {
        fn push_state(&self, state: RpcValue, url: Option<&str>) {
            self.inner.push_state(state, url);
        }
        fn replace_state(&self, state: RpcValue, url: Option<&str>) {
            self.inner.replace_state(state, url);
        }
        fn go(&self, delta: i64) {
            self.traversals.lock().unwrap().push(delta);
            self.inner.go(delta);
        }
        fn state(&self) -> RpcValue {
            self.inner.state()
        }
        fn length(&self) -> usize {
            self.inner.length()
        }
    }

    fn setup() -> (
        Arc<HeadlessWindow>,
        VirtualHistory,
        UnboundedReceiver<NavigationNotification>,
    ) {
        let window = Arc::new(HeadlessWindow::parse("https://sandbox.example/app").unwrap());
        let (sender, receiver) = unbounded_channel();
        let dyn_window: Arc<dyn InstrumentableWindow> = window.clone();
        let history = VirtualHistory::install(
            &dyn_window,
            Arc::new(move |notification| {
                let _ = sender.send(notification);
            }),
        );
        (window, history, receiver)
    }

    async fn next(receiver: &mut UnboundedReceiver<NavigationNotification>) -> NavigationNotification {
        tokio::time::timeout(Duration::from_secs(1), receiver.recv())
            .await
            .expect("notification")
            .expect("listener alive")
    }

    #[tokio::test]
    async fn three_pushes_then_two_backs_reach_the_bottom_of_the_stack() {
        let (window, _history, mut notifications) = setup();
        let history = window.history();
        history.push_state(RpcValue::from("a"), Some("/a"));
        history.push_state(RpcValue::from("b"), Some("/b"));
        history.push_state(RpcValue::from("c"), Some("/c"));
        let first = next(&mut notifications).await;
        assert_eq!((first.kind, first.index, first.can_go_back), (NavigationKind::Push, 0, false));
        next(&mut notifications).await;
        let third = next(&mut notifications).await;
        assert_eq!((third.index, third.length), (2, 3));

        history.back();
        let first = next(&mut notifications).await;
        assert_eq!((first.kind, first.index), (NavigationKind::Pop, 1));
        assert!(first.can_go_back);
        assert!(first.can_go_forward);

        history.back();
        let second = next(&mut notifications).await;
        assert_eq!((second.kind, second.index), (NavigationKind::Pop, 0));
        assert!(!second.can_go_back);
        assert_eq!(history.state(), RpcValue::from("a"));
    }

    #[tokio::test]
    async fn back_before_any_push_is_ignored() {
        let (window, _history, mut notifications) = setup();
        window.history().back();
        window.history().replace_state(RpcValue::Null, Some("#top"));
        let replaced = next(&mut notifications).await;
        assert_eq!(
            (replaced.kind, replaced.length, replaced.hash.as_str()),
            (NavigationKind::Replace, 0, "#top")
        );
    }

    #[tokio::test]
    async fn pop_to_root_uses_a_single_traversal() {
        let window = Arc::new(HeadlessWindow::parse("https://sandbox.example/app").unwrap());
        let recording = Arc::new(RecordingHistory {
            inner: window.history(),
            traversals: Mutex::new(Vec::new()),
        });
        window.set_history(recording.clone());

        let (sender, mut notifications) = unbounded_channel();
        let dyn_window: Arc<dyn InstrumentableWindow> = window.clone();
        let virtual_history = VirtualHistory::install(
            &dyn_window,
            Arc::new(move |notification| {
                let _ = sender.send(notification);
            }),
        );
        let history = window.history();
        history.push_state(RpcValue::Null, Some("/a"));
        history.push_state(RpcValue::Null, Some("/b"));
        history.push_state(RpcValue::Null, Some("/c"));
        for _ in 0..3 {
            next(&mut notifications).await;
        }

        virtual_history.pop_to_root();
        let popped = next(&mut notifications).await;
        assert_eq!((popped.kind, popped.index), (NavigationKind::Pop, 0));
        assert_eq!(*recording.traversals.lock().unwrap(), vec![-2]);
    }

    #[tokio::test]
    async fn hash_changes_reconcile_against_known_hashes() {
        let (window, _history, mut notifications) = setup();
        window.navigate_hash("a");
        let pushed = next(&mut notifications).await;
        assert_eq!((pushed.kind, pushed.hash.as_str()), (NavigationKind::Push, "#a"));
        window.navigate_hash("b");
        assert_eq!(next(&mut notifications).await.index, 1);

        window.emit(WindowEvent::HashChange {
            old_url: "https://sandbox.example/app#b".into(),
            new_url: "https://sandbox.example/app#a".into(),
        });
        let jumped = next(&mut notifications).await;
        assert_eq!((jumped.kind, jumped.index), (NavigationKind::Pop, 0));

        // same hash as the current entry
        window.emit(WindowEvent::HashChange {
            old_url: "https://sandbox.example/app#b".into(),
            new_url: "https://sandbox.example/app#a".into(),
        });
        window.history().replace_state(RpcValue::Null, None);
        assert_eq!(next(&mut notifications).await.kind, NavigationKind::Replace);
    }

    #[tokio::test]
    async fn teardown_restores_original_history() {
        let window = Arc::new(HeadlessWindow::parse("https://sandbox.example/").unwrap());
        let original = window.history();
        let dyn_window: Arc<dyn InstrumentableWindow> = window.clone();
        let mut history = VirtualHistory::install(&dyn_window, Arc::new(|_| {}));
        assert_ne!(
            Arc::as_ptr(&window.history()).cast::<()>(),
            Arc::as_ptr(&original).cast::<()>()
        );
        history.teardown();
        assert_eq!(
            Arc::as_ptr(&window.history()).cast::<()>(),
            Arc::as_ptr(&original).cast::<()>()
        );
    }
}
