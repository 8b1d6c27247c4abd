use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use futures_util::StreamExt;
use sandbox_bridge::config::BridgeConfig;
use sandbox_bridge::frame::ANY_ORIGIN;
use sandbox_bridge::handshake::target_origin;
use sandbox_bridge::orchestrator::EnvironmentStatus;
use sandbox_bridge::{
    telemetry, CallOptions, HeadlessWindow, HostCallbackRegistry, HostMethod, HostSession,
    HtmlRunEvent, RpcValue, SandboxSession, WidgetRunParams,
};
use tracing::info;

const FALLBACK_HOST_ORIGIN: &str = "https://localhost";

struct Args {
    html: PathBuf,
    app: String,
    once: bool,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut html = None;
    let mut app = String::from("chatgpt");
    let mut once = false;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--once" => once = true,
            "--app" => app = args.next().context("--app needs a value")?,
            other if html.is_none() => html = Some(PathBuf::from(other)),
            other => bail!("unexpected argument {other}"),
        }
    }
    let Some(html) = html else {
        bail!("usage: sandbox-bridge <widget.html> [--app NAME] [--once]");
    };
    Ok(Args { html, app, once })
}

/// Host callbacks that just log what the widget asked for.
fn logging_registry() -> anyhow::Result<HostCallbackRegistry> {
    let mut registry = HostCallbackRegistry::new();
    for method in HostMethod::ALL {
        if method.is_generator() {
            continue;
        }
        registry.on(method, move |_ctx, args: Vec<RpcValue>| async move {
            let args: Vec<_> = args.iter().map(RpcValue::to_json).collect();
            info!(target = "host_api", %method, args = %serde_json::Value::from(args), "widget called host");
            Ok(RpcValue::Undefined)
        })?;
    }
    Ok(registry)
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = BridgeConfig::load_default().unwrap_or_else(|err| {
        eprintln!("Failed to load bridge configuration: {err}. Using defaults.");
        BridgeConfig::default()
    });
    let html = std::fs::read_to_string(&args.html)
        .with_context(|| format!("failed to read {}", args.html.display()))?;

    let mut host_origin = target_origin(&args.app, &config.app_origins);
    if host_origin == ANY_ORIGIN {
        host_origin = FALLBACK_HOST_ORIGIN.to_string();
    }
    let (host, frame_window) =
        HostSession::create(&config, &args.app, logging_registry()?, &host_origin)?;
    let window = Arc::new(HeadlessWindow::new(host.frame().src().clone()));
    let sandbox = SandboxSession::new(frame_window, window, &args.app, &config);

    let (remote, _gateway) = tokio::try_join!(host.connect(), sandbox.announce())?;
    let params = WidgetRunParams {
        html,
        locale: Some(config.locale.clone()),
        ..Default::default()
    };
    let mut events = remote.run_widget_events(&params, CallOptions::default())?;

    loop {
        let event = tokio::select! {
            event = events.next() => event,
            _ = tokio::signal::ctrl_c() => {
                remote.stop().await?;
                continue;
            }
        };
        let Some(event) = event else {
            break;
        };
        let event = event?;
        println!("{}", serde_json::to_string(&event)?);
        let ready = event == HtmlRunEvent::status(EnvironmentStatus::RunningCode);
        if ready && args.once {
            remote.stop().await?;
        }
        if event.is_terminal() {
            break;
        }
    }

    sandbox.dispose();
    host.dispose();
    Ok(())
}

fn main() {
    telemetry::init_tracing();

    let args = parse_args().unwrap_or_else(|err| {
        eprintln!("{err}");
        std::process::exit(2);
    });

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap_or_else(|err| {
            eprintln!("Failed to start runtime: {err}");
            std::process::exit(1);
        });

    if let Err(err) = rt.block_on(run(args)) {
        eprintln!("{err:#}");
        std::process::exit(1);
    }
}
