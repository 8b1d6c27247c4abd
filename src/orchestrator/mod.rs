//! Drives the sandboxed document through one widget run at a time and turns
//! what happens inside it into [`HtmlRunEvent`]s and host notifications.

mod cache;
mod console;
mod events;
mod measure;

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, Context};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures_util::stream::{self, StreamExt};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::abort::AbortSignal;
use crate::csp::CspManager;
use crate::dom::{Document, NodeId};
use crate::host_api::{HostApiGateway, HostApiSlot};
use crate::iterator::{create_async_iterator, AsyncIter, IteratorController};
use crate::methods::SandboxMethod;
use crate::navigation::{NavigationListener, VirtualHistory};
use crate::rpc::{generator_handler, request_handler, MethodHandler, RpcError};
use crate::value::RpcValue;
use crate::window::{ConsoleLevel, InstrumentableWindow, WindowEvent};

pub use cache::LruTtlCache;
pub use console::{
    describe_reason, format_console_args, remap_stack, IdentityMapper, MappedPosition,
    PositionMapper,
};
pub use events::{EnvironmentStatus, HtmlRunEvent, WidgetRunParams};
pub use measure::{background_color, intrinsic_height};

pub const CUSTOM_PROTOCOLS: [&str; 2] = ["sediment://", "file-service://"];

const OPENAI_GLOBAL: &str = "openai";
const DATA_READY: &str = "data-ready";
const DATA_FATAL: &str = "data-fatal";
const DATA_INSTRUMENT: &str = "data-instrument";

const TRANSPARENT_GIF: [u8; 42] = [
    0x47, 0x49, 0x46, 0x38, 0x39, 0x61, 0x01, 0x00, 0x01, 0x00, 0x80, 0x00, 0x00, 0x00, 0x00,
    0x00, 0xff, 0xff, 0xff, 0x21, 0xf9, 0x04, 0x01, 0x00, 0x00, 0x00, 0x00, 0x2c, 0x00, 0x00,
    0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x02, 0x01, 0x44, 0x00, 0x3b,
];

/// Image shown while a custom-protocol asset is being resolved.
pub fn placeholder_image() -> String {
    format!("data:image/gif;base64,{}", STANDARD.encode(TRANSPARENT_GIF))
}

pub fn is_custom_protocol(src: &str) -> bool {
    CUSTOM_PROTOCOLS
        .iter()
        .any(|protocol| src.trim_start().starts_with(protocol))
}

#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    pub download_cache_entries: usize,
    pub download_cache_ttl: Duration,
    pub extra_third_party_domains: Vec<String>,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            download_cache_entries: 100,
            download_cache_ttl: Duration::from_secs(300),
            extra_third_party_domains: Vec::new(),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct ActiveRun {
    events: IteratorController<HtmlRunEvent>,
    task: JoinHandle<()>,
}

pub struct WidgetOrchestrator {
    window: Arc<dyn InstrumentableWindow>,
    host: HostApiSlot,
    mapper: Arc<dyn PositionMapper>,
    downloads: Arc<Mutex<LruTtlCache<String, String>>>,
    csp: Arc<Mutex<CspManager>>,
    current: Mutex<Option<ActiveRun>>,
    navigation: Mutex<Option<VirtualHistory>>,
}

impl WidgetOrchestrator {
    pub fn new(
        window: Arc<dyn InstrumentableWindow>,
        host: HostApiSlot,
        options: OrchestratorOptions,
    ) -> Self {
        Self {
            window,
            host,
            mapper: Arc::new(IdentityMapper),
            downloads: Arc::new(Mutex::new(LruTtlCache::new(
                options.download_cache_entries,
                options.download_cache_ttl,
            ))),
            csp: Arc::new(Mutex::new(CspManager::new(options.extra_third_party_domains))),
            current: Mutex::new(None),
            navigation: Mutex::new(None),
        }
    }

    pub fn with_position_mapper(mut self, mapper: Arc<dyn PositionMapper>) -> Self {
        self.mapper = mapper;
        self
    }

    pub fn window(&self) -> &Arc<dyn InstrumentableWindow> {
        &self.window
    }

    /// Start a run, cancelling the previous one. The stream ends after the
    /// run's single `RUN_COMPLETE`.
    pub fn run(&self, params: WidgetRunParams, signal: AbortSignal) -> AsyncIter<HtmlRunEvent> {
        self.cancel_current();
        self.ensure_navigation();

        create_async_iterator(|events| {
            // subscribe before the document is written so `Load` is seen
            let window_events = self.window.subscribe();
            let run = RunContext {
                window: Arc::clone(&self.window),
                host: self.host.clone(),
                mapper: Arc::clone(&self.mapper),
                downloads: Arc::clone(&self.downloads),
                csp: Arc::clone(&self.csp),
                events: events.clone(),
            };
            let task = tokio::spawn(run.drive(params, window_events, signal));
            *lock(&self.current) = Some(ActiveRun { events, task });
        })
    }

    /// End the active run, if any, with `RUN_COMPLETE{wasCancelled: true}`.
    pub fn cancel_current(&self) {
        if let Some(active) = lock(&self.current).take() {
            if !active.events.is_terminated() {
                info!(target = "orchestrator", "cancelling widget run");
                active.events.push(HtmlRunEvent::cancelled());
                active.events.complete();
            }
            active.task.abort();
        }
    }

    pub fn stop(&self) {
        self.cancel_current();
    }

    fn ensure_navigation(&self) {
        let mut navigation = lock(&self.navigation);
        if navigation.is_some() {
            return;
        }
        let host = self.host.clone();
        let listener: NavigationListener = Arc::new(move |notification| {
            let Some(gateway) = host.get() else {
                return;
            };
            let Ok(runtime) = tokio::runtime::Handle::try_current() else {
                return;
            };
            runtime.spawn(async move {
                if let Err(err) = gateway.notify_navigation(&notification).await {
                    debug!(target = "orchestrator", error = %err, "navigation notification failed");
                }
            });
        });
        *navigation = Some(VirtualHistory::install(&self.window, listener));
    }

    fn update_global(&self, update: impl FnOnce(&mut BTreeMap<String, RpcValue>)) {
        let mut fields = match self.window.global(OPENAI_GLOBAL) {
            Some(RpcValue::Object(fields)) => fields,
            _ => BTreeMap::new(),
        };
        update(&mut fields);
        self.window.set_global(OPENAI_GLOBAL, RpcValue::Object(fields));
    }

    /// Merge new props into the widget's globals.
    pub fn set_widget_props(&self, props: RpcValue) {
        match props {
            RpcValue::Object(props) => self.update_global(|fields| fields.extend(props)),
            other => warn!(target = "orchestrator", props = ?other, "ignoring non-object widget props"),
        }
    }

    pub fn set_theme(&self, theme: &str) {
        let theme = RpcValue::from(theme);
        self.update_global(|fields| {
            fields.insert("theme".into(), theme);
        });
    }

    pub fn set_safe_area(&self, safe_area: RpcValue) {
        self.update_global(|fields| {
            fields.insert("safeArea".into(), safe_area);
        });
    }

    /// `window.openai.setWidgetState`: keep it locally and hand it to the
    /// host for persistence.
    pub async fn set_widget_state(&self, state: RpcValue) -> Result<(), RpcError> {
        let local = state.clone();
        self.update_global(|fields| {
            fields.insert("widgetState".into(), local);
        });
        if let Some(host) = self.host.get() {
            host.set_widget_state(state).await?;
        }
        Ok(())
    }

    pub fn navigate(&self, path: &str) {
        self.ensure_navigation();
        self.window.history().push_state(RpcValue::Null, Some(path));
    }

    pub fn current_path(&self) -> String {
        let location = self.window.location();
        let mut path = location.path().to_string();
        if let Some(query) = location.query() {
            path.push('?');
            path.push_str(query);
        }
        if let Some(fragment) = location.fragment() {
            path.push('#');
            path.push_str(fragment);
        }
        path
    }

    pub fn pop_to_root(&self) {
        if let Some(navigation) = lock(&self.navigation).as_ref() {
            navigation.pop_to_root();
        }
    }

    pub fn dispose(&self) {
        self.cancel_current();
        if let Some(mut navigation) = lock(&self.navigation).take() {
            navigation.teardown();
        }
    }

    /// Handlers for every sandbox method, served to the host at handshake.
    pub fn handlers(self: &Arc<Self>) -> BTreeMap<SandboxMethod, MethodHandler> {
        let mut handlers = BTreeMap::new();

        let this = Arc::clone(self);
        handlers.insert(
            SandboxMethod::RunWidgetCode,
            MethodHandler::Generator(generator_handler(move |ctx, args| {
                let params = args
                    .first()
                    .ok_or_else(|| anyhow!("runWidgetCode expects widget params"))
                    .and_then(|value| {
                        value
                            .deserialize::<WidgetRunParams>()
                            .context("invalid widget params")
                    });
                match params {
                    Ok(params) => this
                        .run(params, ctx.signal().clone())
                        .map(|event| {
                            event.and_then(|event| {
                                RpcValue::from_serialize(&event).map_err(anyhow::Error::from)
                            })
                        })
                        .boxed(),
                    Err(err) => stream::once(async move { Err::<RpcValue, _>(err) }).boxed(),
                }
            })),
        );

        let this = Arc::clone(self);
        handlers.insert(
            SandboxMethod::SetWidgetProps,
            MethodHandler::Request(request_handler(move |_ctx, args| {
                let this = Arc::clone(&this);
                async move {
                    this.set_widget_props(first_arg(args));
                    Ok(RpcValue::Undefined)
                }
            })),
        );

        let this = Arc::clone(self);
        handlers.insert(
            SandboxMethod::SetTheme,
            MethodHandler::Request(request_handler(move |_ctx, args| {
                let this = Arc::clone(&this);
                async move {
                    let theme = first_arg(args);
                    let theme = theme.as_str().context("setTheme expects a string")?;
                    this.set_theme(theme);
                    Ok::<_, anyhow::Error>(RpcValue::Undefined)
                }
            })),
        );

        let this = Arc::clone(self);
        handlers.insert(
            SandboxMethod::SetSafeArea,
            MethodHandler::Request(request_handler(move |_ctx, args| {
                let this = Arc::clone(&this);
                async move {
                    this.set_safe_area(first_arg(args));
                    Ok(RpcValue::Undefined)
                }
            })),
        );

        let this = Arc::clone(self);
        handlers.insert(
            SandboxMethod::Navigate,
            MethodHandler::Request(request_handler(move |_ctx, args| {
                let this = Arc::clone(&this);
                async move {
                    let path = first_arg(args);
                    let path = path.as_str().context("navigate expects a path")?;
                    this.navigate(path);
                    Ok::<_, anyhow::Error>(RpcValue::Undefined)
                }
            })),
        );

        let this = Arc::clone(self);
        handlers.insert(
            SandboxMethod::Stop,
            MethodHandler::Request(request_handler(move |_ctx, _args| {
                let this = Arc::clone(&this);
                async move {
                    this.stop();
                    Ok(RpcValue::Undefined)
                }
            })),
        );

        let this = Arc::clone(self);
        handlers.insert(
            SandboxMethod::GetCurrentPath,
            MethodHandler::Request(request_handler(move |_ctx, _args| {
                let this = Arc::clone(&this);
                async move { Ok(RpcValue::from(this.current_path())) }
            })),
        );

        handlers
    }
}

impl Drop for WidgetOrchestrator {
    fn drop(&mut self) {
        self.cancel_current();
    }
}

fn first_arg(args: Vec<RpcValue>) -> RpcValue {
    args.into_iter().next().unwrap_or_default()
}

fn openai_global(params: &WidgetRunParams) -> RpcValue {
    RpcValue::object([
        ("toolInput", RpcValue::from(params.tool_input.clone())),
        ("toolOutput", RpcValue::from(params.tool_output.clone())),
        (
            "toolResponseMetadata",
            RpcValue::from(params.tool_response_metadata.clone()),
        ),
        ("widgetState", RpcValue::from(params.widget_state.clone())),
        ("theme", RpcValue::from(params.theme.clone())),
        ("safeArea", RpcValue::from(params.safe_area.clone())),
        ("maxHeight", RpcValue::from(params.max_height)),
        ("userAgent", RpcValue::from(params.user_agent.clone())),
        ("locale", RpcValue::from(params.locale.clone())),
        (
            "displayMode",
            RpcValue::from(params.display_mode.clone().unwrap_or_else(|| "inline".into())),
        ),
    ])
}

enum Flow {
    Continue,
    Finish(HtmlRunEvent),
}

#[derive(Default)]
struct RunState {
    ready: bool,
    last_height: Option<f64>,
    last_background: Option<String>,
}

/// Everything one run's task needs, detached from the orchestrator.
struct RunContext {
    window: Arc<dyn InstrumentableWindow>,
    host: HostApiSlot,
    mapper: Arc<dyn PositionMapper>,
    downloads: Arc<Mutex<LruTtlCache<String, String>>>,
    csp: Arc<Mutex<CspManager>>,
    events: IteratorController<HtmlRunEvent>,
}

impl RunContext {
    async fn drive(
        self,
        params: WidgetRunParams,
        mut window_events: UnboundedReceiver<WindowEvent>,
        signal: AbortSignal,
    ) {
        self.events
            .push(HtmlRunEvent::status(EnvironmentStatus::Initializing));
        if let Err(err) = self.prepare(&params) {
            let message = format!("{err:#}");
            warn!(target = "orchestrator", error = %message, "widget run failed to start");
            self.finish(vec![HtmlRunEvent::error(message), HtmlRunEvent::fatal()]);
            return;
        }

        let mut state = RunState::default();
        loop {
            let event = tokio::select! {
                event = window_events.recv() => event,
                _ = signal.cancelled() => {
                    self.finish(vec![HtmlRunEvent::cancelled()]);
                    return;
                }
            };
            let Some(event) = event else {
                self.finish(vec![HtmlRunEvent::finished()]);
                return;
            };
            if let Flow::Finish(terminal) = self.handle(event, &mut state) {
                self.finish(vec![terminal]);
                return;
            }
        }
    }

    fn finish(&self, last: Vec<HtmlRunEvent>) {
        for event in last {
            self.events.push(event);
        }
        self.events.complete();
    }

    fn prepare(&self, params: &WidgetRunParams) -> anyhow::Result<()> {
        self.events
            .push(HtmlRunEvent::status(EnvironmentStatus::InstallingPackages));
        self.window.write_document(&params.html);
        {
            let mut csp = lock(&self.csp);
            csp.reset();
            let mut document = self.window.document();
            csp.apply(&mut document, &params.csp.clone().unwrap_or_default())
                .context("failed to apply content security policy")?;
        }
        self.window.set_global(OPENAI_GLOBAL, openai_global(params));
        for (name, value) in &params.additional_globals {
            self.window.set_global(name, RpcValue::from(value.clone()));
        }
        debug!(
            target = "orchestrator",
            widget_id = params.widget_id.as_deref().unwrap_or("-"),
            "widget document written"
        );
        Ok(())
    }

    fn handle(&self, event: WindowEvent, state: &mut RunState) -> Flow {
        match event {
            WindowEvent::Load => {
                let images: Vec<(NodeId, String)> = {
                    let document = self.window.document();
                    document
                        .elements_by_tag("img")
                        .into_iter()
                        .filter_map(|id| document.attr(id, "src").map(|src| (id, src.to_string())))
                        .collect()
                };
                for (element, src) in images {
                    self.intercept_image(element, &src);
                }
                if let Some(terminal) = self.check_readiness(state) {
                    return Flow::Finish(terminal);
                }
                self.measure(state);
            }
            WindowEvent::Mutation {
                target,
                removed,
                attribute,
            } => {
                if attribute.is_some() || !removed.is_empty() {
                    if let Some(terminal) = self.check_readiness(state) {
                        return Flow::Finish(terminal);
                    }
                }
                if !removed.is_empty() && self.body_wiped(target) {
                    warn!(target = "orchestrator", "widget removed all of its content");
                    return Flow::Finish(HtmlRunEvent::fatal());
                }
                self.measure(state);
            }
            WindowEvent::Resize => self.measure(state),
            WindowEvent::Console { level, args } => {
                let message = format_console_args(&args);
                match level {
                    ConsoleLevel::Error => self.events.push(HtmlRunEvent::error(message)),
                    level => self.events.push(HtmlRunEvent::Log { level, message }),
                }
            }
            WindowEvent::Error {
                message,
                stack,
                source,
                line,
                column,
            } => self.report_error(message, stack, source, line, column),
            WindowEvent::UnhandledRejection { reason } => {
                let (message, stack) = describe_reason(&reason);
                self.report_error(
                    format!("Unhandled promise rejection: {message}"),
                    stack,
                    None,
                    None,
                    None,
                );
            }
            WindowEvent::SecurityPolicyViolation {
                blocked_uri,
                violated_directive,
                source_file,
            } => {
                let message = format!(
                    "Refused to load '{blocked_uri}' because it violates the Content Security Policy directive '{violated_directive}'"
                );
                self.events.push(HtmlRunEvent::Error {
                    message,
                    stack: None,
                    line: None,
                    column: None,
                    source: source_file.clone(),
                });
                let report = RpcValue::object([
                    ("blockedURI", RpcValue::from(blocked_uri)),
                    ("violatedDirective", RpcValue::from(violated_directive)),
                    ("sourceFile", RpcValue::from(source_file)),
                ]);
                self.with_host("notifySecurityPolicyViolation", move |host| async move {
                    host.notify_security_policy_violation(report).await
                });
            }
            WindowEvent::Click { target } => self.handle_click(target),
            WindowEvent::ImageSrc { element, src } => self.intercept_image(element, &src),
            WindowEvent::WindowOpen { url } => {
                let href = self
                    .window
                    .location()
                    .join(&url)
                    .map(|url| url.to_string())
                    .unwrap_or(url);
                self.with_host("openExternal", move |host| async move {
                    host.open_external(&href).await
                });
            }
            WindowEvent::KeyDown { key } => {
                if key == "Escape" {
                    self.with_host("notifyEscapeKey", |host| async move {
                        host.notify_escape_key().await
                    });
                }
            }
            WindowEvent::PopState { .. } | WindowEvent::HashChange { .. } => {}
            WindowEvent::Removed => {
                info!(target = "orchestrator", "sandbox frame removed");
                return Flow::Finish(HtmlRunEvent::finished());
            }
        }
        Flow::Continue
    }

    /// Emit `RUNNING_CODE` once the page is ready. Pages that set
    /// `data-ready` or `data-fatal` on `<html>` signal readiness and failure
    /// themselves.
    fn check_readiness(&self, state: &mut RunState) -> Option<HtmlRunEvent> {
        let (ready_attr, fatal) = {
            let document = self.window.document();
            match document.document_element() {
                Some(html) => (
                    document.attr(html, DATA_READY).map(str::to_string),
                    document.attr(html, DATA_FATAL).is_some(),
                ),
                None => (None, false),
            }
        };
        let explicit = fatal || ready_attr.is_some();
        let ready = ready_attr.as_deref() == Some("true");
        if fatal {
            warn!(target = "orchestrator", "widget reported a fatal error");
            return Some(HtmlRunEvent::fatal());
        }
        if !state.ready && (ready || !explicit) {
            state.ready = true;
            self.events
                .push(HtmlRunEvent::status(EnvironmentStatus::RunningCode));
        }
        None
    }

    /// A removal from `<body>` left it holding nothing but comments and
    /// whitespace, while the page has not opted into explicit signalling.
    fn body_wiped(&self, target: NodeId) -> bool {
        let document = self.window.document();
        let Some(body) = document.body() else {
            return false;
        };
        if target != body {
            return false;
        }
        if let Some(html) = document.document_element() {
            let explicit = document.attr(html, DATA_READY).is_some()
                || document.attr(html, DATA_FATAL).is_some();
            if explicit {
                return false;
            }
        }
        document
            .children(body)
            .iter()
            .all(|child| document.is_ignorable(*child))
    }

    fn measure(&self, state: &mut RunState) {
        let (height, background) = {
            let document = self.window.document();
            (intrinsic_height(&document), background_color(&document))
        };
        if let Some(height) = height {
            if state.last_height != Some(height) {
                state.last_height = Some(height);
                self.with_host("notifyIntrinsicHeight", move |host| async move {
                    host.notify_intrinsic_height(height).await
                });
            }
        }
        if let Some(background) = background {
            if state.last_background.as_ref() != Some(&background) {
                state.last_background = Some(background.clone());
                self.with_host("notifyBackgroundColor", move |host| async move {
                    host.notify_background_color(&background).await
                });
            }
        }
    }

    fn report_error(
        &self,
        message: String,
        stack: Option<String>,
        source: Option<String>,
        line: Option<u32>,
        column: Option<u32>,
    ) {
        let mapped = match (&source, line, column) {
            (Some(source), Some(line), Some(column)) => self.mapper.map(source, line, column),
            _ => None,
        };
        let (source, line, column) = match mapped {
            Some(position) => (Some(position.source), Some(position.line), Some(position.column)),
            None => (source, line, column),
        };
        let stack = stack.map(|stack| remap_stack(&stack, self.mapper.as_ref()));

        let report = RpcValue::object([
            ("message", RpcValue::from(message.clone())),
            ("stack", RpcValue::from(stack.clone())),
        ]);
        self.events.push(HtmlRunEvent::Error {
            message,
            stack,
            line,
            column,
            source,
        });
        self.with_host("notifyError", move |host| async move {
            host.notify_error(report).await
        });
    }

    fn handle_click(&self, target: NodeId) {
        let (instrument, href) = {
            let document = self.window.document();
            let instrument = document
                .closest_with_attr(target, DATA_INSTRUMENT)
                .and_then(|id| document.attr(id, DATA_INSTRUMENT))
                .map(str::to_string);
            let href = document
                .ancestors_inclusive(target)
                .into_iter()
                .find(|id| document.tag_name(*id) == Some("a"))
                .and_then(|id| document.attr(id, "href"))
                .map(str::to_string);
            (instrument, href)
        };

        if let Some(name) = instrument {
            let event = RpcValue::object([
                ("type", RpcValue::from("count")),
                ("name", RpcValue::from(name)),
            ]);
            self.with_host("logTelemetry", move |host| async move {
                host.log_telemetry(event).await
            });
        }

        let Some(href) = href else {
            return;
        };
        let location = self.window.location();
        let Ok(resolved) = location.join(&href) else {
            return;
        };
        if resolved.origin() != location.origin() {
            let href = resolved.to_string();
            self.with_host("openExternal", move |host| async move {
                host.open_external(&href).await
            });
        }
    }

    /// Swap custom-protocol sources for a placeholder, then for the resolved
    /// URL once the host provides one. Failures leave the placeholder.
    fn intercept_image(&self, element: NodeId, src: &str) {
        if !is_custom_protocol(src) {
            return;
        }
        let uri = src.trim().to_string();
        let cached = lock(&self.downloads).get(&uri);
        if let Some(resolved) = cached {
            set_image_source(&mut self.window.document(), element, &resolved);
            return;
        }
        let placeholder = placeholder_image();
        set_image_source(&mut self.window.document(), element, &placeholder);

        let Some(host) = self.host.get() else {
            debug!(target = "orchestrator", %uri, "no host api to resolve download");
            return;
        };
        let window = Arc::clone(&self.window);
        let downloads = Arc::clone(&self.downloads);
        tokio::spawn(async move {
            match host.resolve_download_url(&uri).await {
                Ok(Some(resolved)) => {
                    lock(&downloads).insert(uri, resolved.clone());
                    let mut document = window.document();
                    if document.attr(element, "src") == Some(placeholder.as_str()) {
                        set_image_source(&mut document, element, &resolved);
                    }
                }
                Ok(None) => debug!(target = "orchestrator", %uri, "download url not resolved"),
                Err(err) => debug!(target = "orchestrator", %uri, error = %err, "download resolution failed"),
            }
        });
    }

    fn with_host<F, Fut>(&self, method: &'static str, call: F)
    where
        F: FnOnce(Arc<HostApiGateway>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<RpcValue>, RpcError>> + Send + 'static,
    {
        let Some(host) = self.host.get() else {
            debug!(target = "orchestrator", method, "host api not published yet");
            return;
        };
        tokio::spawn(async move {
            if let Err(err) = call(host).await {
                debug!(target = "orchestrator", method, error = %err, "host call failed");
            }
        });
    }
}

fn set_image_source(document: &mut Document, element: NodeId, src: &str) {
    if let Err(err) = document.set_attr(element, "src", src) {
        debug!(target = "orchestrator", error = %err, "image element went away");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abort::AbortController;
    use crate::dom::LayoutBox;
    use crate::host_api::HostApi;
    use crate::methods::HostMethod;
    use crate::rpc::RemoteGenerator;
    use crate::window::HeadlessWindow;
    use futures_util::future::BoxFuture;

    const RESOLVED: &str = "https://cdn.example/file_1.png";

    #[derive(Default)]
    struct FakeHost {
        calls: Mutex<Vec<(HostMethod, Vec<RpcValue>)>>,
    }

    impl FakeHost {
        fn count(&self, method: HostMethod) -> usize {
            lock(&self.calls).iter().filter(|(m, _)| *m == method).count()
        }
    }

    impl HostApi for FakeHost {
        fn has_method(&self, _method: HostMethod) -> bool {
            true
        }

        fn call(&self, method: HostMethod, args: Vec<RpcValue>) -> BoxFuture<'_, Result<RpcValue, RpcError>> {
            lock(&self.calls).push((method, args));
            Box::pin(async move {
                Ok(match method {
                    HostMethod::ResolveDownloadUrl => RpcValue::object([("url", RpcValue::from(RESOLVED))]),
                    _ => RpcValue::Undefined,
                })
            })
        }

        fn stream(&self, _method: HostMethod, _args: Vec<RpcValue>) -> Result<RemoteGenerator, RpcError> {
            Err(RpcError::Disconnected)
        }
    }

    struct Fixture {
        window: Arc<HeadlessWindow>,
        host: Arc<FakeHost>,
        orchestrator: WidgetOrchestrator,
    }

    fn fixture() -> Fixture {
        let window = Arc::new(HeadlessWindow::parse("https://sandbox.example/index.html").unwrap());
        let host = Arc::new(FakeHost::default());
        let slot = HostApiSlot::default();
        slot.publish(Arc::new(HostApiGateway::new(host.clone(), window.clone())));
        let orchestrator = WidgetOrchestrator::new(window.clone(), slot, OrchestratorOptions::default());
        Fixture {
            window,
            host,
            orchestrator,
        }
    }

    fn params(html: &str) -> WidgetRunParams {
        WidgetRunParams {
            html: html.to_string(),
            ..Default::default()
        }
    }

    async fn next(events: &mut AsyncIter<HtmlRunEvent>) -> Option<HtmlRunEvent> {
        tokio::time::timeout(Duration::from_secs(1), events.next())
            .await
            .expect("event in time")
            .map(|event| event.unwrap())
    }

    async fn until_running(events: &mut AsyncIter<HtmlRunEvent>) {
        assert_eq!(next(events).await, Some(HtmlRunEvent::status(EnvironmentStatus::Initializing)));
        assert_eq!(
            next(events).await,
            Some(HtmlRunEvent::status(EnvironmentStatus::InstallingPackages))
        );
        assert_eq!(next(events).await, Some(HtmlRunEvent::status(EnvironmentStatus::RunningCode)));
    }

    async fn eventually(check: impl Fn() -> bool) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition never held");
    }

    #[tokio::test]
    async fn console_output_becomes_log_and_error_events() {
        let f = fixture();
        let mut events = f.orchestrator.run(params("<div id=root>hi</div>"), AbortSignal::never());
        until_running(&mut events).await;

        f.window.console(ConsoleLevel::Info, vec!["hello".into(), 2.0.into()]);
        f.window.console(ConsoleLevel::Error, vec!["bad".into()]);
        assert_eq!(
            next(&mut events).await,
            Some(HtmlRunEvent::Log {
                level: ConsoleLevel::Info,
                message: "hello 2".into()
            })
        );
        assert_eq!(next(&mut events).await, Some(HtmlRunEvent::error("bad")));

        f.window.remove_frame();
        assert_eq!(next(&mut events).await, Some(HtmlRunEvent::finished()));
        assert_eq!(next(&mut events).await, None);
    }

    #[tokio::test]
    async fn writes_globals_and_csp_before_running() {
        let f = fixture();
        let mut run = params("<html><head></head><body></body></html>");
        run.theme = Some("dark".into());
        run.additional_globals
            .insert("widgetConfig".into(), serde_json::json!({"a": 1}));
        let mut events = f.orchestrator.run(run, AbortSignal::never());
        until_running(&mut events).await;

        let openai = f.window.global("openai").unwrap();
        assert_eq!(openai.get("theme"), Some(&RpcValue::from("dark")));
        assert_eq!(openai.get("displayMode"), Some(&RpcValue::from("inline")));
        assert!(f.window.global("widgetConfig").is_some());
        assert!(f.window.document().serialize().contains("Content-Security-Policy"));

        f.orchestrator.set_theme("light");
        let openai = f.window.global("openai").unwrap();
        assert_eq!(openai.get("theme"), Some(&RpcValue::from("light")));
    }

    #[tokio::test]
    async fn wiping_the_body_is_fatal() {
        let f = fixture();
        let mut events = f.orchestrator.run(params("<p>content</p><!-- note -->"), AbortSignal::never());
        until_running(&mut events).await;

        let body = f.window.document().body().unwrap();
        f.window
            .remove_children(body, |document, child| document.tag_name(child).is_none())
            .unwrap();
        assert_eq!(next(&mut events).await, Some(HtmlRunEvent::fatal()));
        assert_eq!(next(&mut events).await, None);
    }

    #[tokio::test]
    async fn removals_outside_the_body_are_not_fatal() {
        let f = fixture();
        let html = "<html><head><title>t</title></head><body>\n  </body></html>";
        let mut events = f.orchestrator.run(params(html), AbortSignal::never());
        until_running(&mut events).await;

        let head = f.window.document().head().unwrap();
        f.window.remove_children(head, |_, _| false).unwrap();
        f.window.console(ConsoleLevel::Log, vec!["still here".into()]);
        assert_eq!(
            next(&mut events).await,
            Some(HtmlRunEvent::Log {
                level: ConsoleLevel::Log,
                message: "still here".into()
            })
        );
    }

    #[tokio::test]
    async fn explicit_readiness_waits_for_the_page() {
        let f = fixture();
        let mut events = f.orchestrator.run(
            params("<html data-ready=false><body><p>x</p></body></html>"),
            AbortSignal::never(),
        );
        assert_eq!(next(&mut events).await, Some(HtmlRunEvent::status(EnvironmentStatus::Initializing)));
        assert_eq!(
            next(&mut events).await,
            Some(HtmlRunEvent::status(EnvironmentStatus::InstallingPackages))
        );

        let html = f.window.document().document_element().unwrap();
        f.window.set_attribute(html, "data-fatal", "boom").unwrap();
        assert_eq!(next(&mut events).await, Some(HtmlRunEvent::fatal()));
        assert_eq!(next(&mut events).await, None);
    }

    #[tokio::test]
    async fn abort_signal_cancels_the_run() {
        let f = fixture();
        let controller = AbortController::new();
        let mut events = f.orchestrator.run(params("<p>x</p>"), controller.signal());
        until_running(&mut events).await;

        controller.abort();
        assert_eq!(next(&mut events).await, Some(HtmlRunEvent::cancelled()));
        assert_eq!(next(&mut events).await, None);
    }

    #[tokio::test]
    async fn a_new_run_cancels_the_previous_one() {
        let f = fixture();
        let mut first = f.orchestrator.run(params("<p>one</p>"), AbortSignal::never());
        until_running(&mut first).await;

        let mut second = f.orchestrator.run(params("<p>two</p>"), AbortSignal::never());
        assert_eq!(next(&mut first).await, Some(HtmlRunEvent::cancelled()));
        assert_eq!(next(&mut first).await, None);
        until_running(&mut second).await;
    }

    #[tokio::test]
    async fn custom_protocol_images_resolve_through_the_host() {
        let f = fixture();
        let html = "<img id=pic src=\"sediment://file_1\">";
        let mut events = f.orchestrator.run(params(html), AbortSignal::never());
        until_running(&mut events).await;

        let window = f.window.clone();
        let src = move || {
            let document = window.document();
            let pic = document.element_by_id("pic").unwrap();
            document.attr(pic, "src").map(str::to_string)
        };
        eventually(|| src().as_deref() == Some(RESOLVED)).await;

        // second run hits the cache
        let mut events = f.orchestrator.run(params(html), AbortSignal::never());
        until_running(&mut events).await;
        assert_eq!(src().as_deref(), Some(RESOLVED));
        assert_eq!(f.host.count(HostMethod::ResolveDownloadUrl), 1);
    }

    #[tokio::test]
    async fn unresolved_images_keep_the_placeholder() {
        let window = Arc::new(HeadlessWindow::parse("https://sandbox.example/").unwrap());
        let orchestrator = WidgetOrchestrator::new(window.clone(), HostApiSlot::default(), OrchestratorOptions::default());
        let mut events = orchestrator.run(params("<img id=pic src=\"file-service://x\">"), AbortSignal::never());
        until_running(&mut events).await;

        let document = window.document();
        let pic = document.element_by_id("pic").unwrap();
        assert_eq!(document.attr(pic, "src"), Some(placeholder_image().as_str()));
    }

    #[tokio::test]
    async fn height_changes_are_reported_once() {
        let f = fixture();
        let mut events = f.orchestrator.run(params("<div id=root></div>"), AbortSignal::never());
        until_running(&mut events).await;

        let root = f.window.document().element_by_id("root").unwrap();
        f.window.set_layout(root, LayoutBox::new(0.0, 120.4)).unwrap();
        f.window.set_layout(root, LayoutBox::new(0.0, 120.2)).unwrap();
        f.window.dispatch_key("Escape");
        eventually(|| f.host.count(HostMethod::NotifyEscapeKey) == 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let heights: Vec<_> = lock(&f.host.calls)
            .iter()
            .filter(|(method, _)| *method == HostMethod::NotifyIntrinsicHeight)
            .map(|(_, args)| args[0].clone())
            .collect();
        assert_eq!(heights, vec![RpcValue::Number(121.0)]);
    }

    #[tokio::test]
    async fn instrumented_clicks_log_telemetry_and_open_links() {
        let f = fixture();
        let html = "<a id=cta data-instrument=cta-click href=\"https://other.example/page\"><span id=label>go</span></a>";
        let mut events = f.orchestrator.run(params(html), AbortSignal::never());
        until_running(&mut events).await;

        let label = f.window.document().element_by_id("label").unwrap();
        f.window.dispatch_click(label);
        eventually(|| f.host.count(HostMethod::OpenExternal) == 1).await;

        let calls = lock(&f.host.calls);
        let telemetry = calls
            .iter()
            .find(|(method, _)| *method == HostMethod::LogTelemetry)
            .map(|(_, args)| args[0].clone());
        assert_eq!(
            telemetry.as_ref().and_then(|event| event.get("name")),
            Some(&RpcValue::from("cta-click"))
        );
        let opened = calls
            .iter()
            .find(|(method, _)| *method == HostMethod::OpenExternal)
            .map(|(_, args)| args[0].clone());
        assert_eq!(
            opened.as_ref().and_then(|payload| payload.get("href")),
            Some(&RpcValue::from("https://other.example/page"))
        );
    }

    #[tokio::test]
    async fn same_origin_links_stay_inside_the_frame() {
        let f = fixture();
        let mut events = f.orchestrator.run(params("<a id=home href=\"/home\">home</a>"), AbortSignal::never());
        until_running(&mut events).await;

        let link = f.window.document().element_by_id("home").unwrap();
        f.window.dispatch_click(link);
        f.window.dispatch_key("Escape");
        eventually(|| f.host.count(HostMethod::NotifyEscapeKey) == 1).await;
        assert_eq!(f.host.count(HostMethod::OpenExternal), 0);
    }
}
