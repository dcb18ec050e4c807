use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use http::{Method, StatusCode};
use wikiserve::server::{start_listeners, SHUTDOWN_GRACE};
use wikiserve::{
    BodyFormat, ListenerConfig, RequestState, RouteNode, Router, RuntimeConfig, SecurityCheck,
    SendFileOptions,
};

#[derive(Parser)]
#[command(name = "wikiserve")]
#[command(about = "Embedded HTTP engine for the wikiserve wiki server", long_about = None)]
struct Cli {
    /// Port to listen on ("0" lets the OS choose; default from $PORT)
    #[arg(short, long)]
    port: Option<String>,

    /// Host to bind
    #[arg(long)]
    host: Option<String>,

    /// Path prefix mounted in front of every route
    #[arg(long, default_value = "")]
    prefix: String,

    /// Serve TLS with this certificate (PEM); requires --key
    #[arg(long, requires = "key")]
    cert: Option<PathBuf>,

    /// TLS private key (PEM)
    #[arg(long, requires = "cert")]
    key: Option<PathBuf>,

    /// Static file root served under /files/
    #[arg(long)]
    root: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let runtime = RuntimeConfig::from_env();

    let default_filter = if runtime.debug { "wikiserve=debug" } else { "wikiserve=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();

    may::config().set_stack_size(runtime.stack_size);

    let listener = ListenerConfig {
        port: cli.port,
        host: cli.host,
        prefix: cli.prefix,
        secure: cli.cert.is_some(),
        cert: cli.cert,
        key: cli.key,
        ..Default::default()
    };

    let router = Arc::new(build_router(cli.root)?);
    let handles = start_listeners(std::slice::from_ref(&listener), router)?;
    for handle in &handles {
        tracing::info!(addr = %handle.local_addr(), "serving");
    }
    for handle in handles {
        handle.join();
    }
    wikiserve::server::shutdown(SHUTDOWN_GRACE);
    Ok(())
}

fn build_router(root: Option<PathBuf>) -> anyhow::Result<Router> {
    let mut router = Router::new();
    router.register_requested_with("TiddlyWiki");

    router.root_mut().mount(
        RouteNode::literal("/status")
            .methods(&[Method::GET, Method::HEAD])
            .handler(|state: &mut RequestState| {
                let ended = state.send_json(
                    StatusCode::OK,
                    &serde_json::json!({ "status": "ok", "engine": env!("CARGO_PKG_VERSION") }),
                )?;
                Ok(ended.into())
            }),
    );

    router.root_mut().mount(
        RouteNode::literal("/echo")
            .methods(&[Method::POST])
            .body_format(BodyFormat::Json)
            .security(SecurityCheck::RequestedWithHeader)
            .handler(|state: &mut RequestState| {
                let body = state.data.clone().unwrap_or(serde_json::Value::Null);
                let ended = state.send_json(StatusCode::OK, &body)?;
                Ok(ended.into())
            }),
    );

    if let Some(root) = root {
        router.root_mut().mount(
            RouteNode::prefix_regex(r"/files/(?P<path>.*)")?
                .methods(&[Method::GET, Method::HEAD])
                .handler(move |state: &mut RequestState| {
                    let path = state.path_params.get("path").cloned().unwrap_or_default();
                    let ended = state.send_file(&path, SendFileOptions::new(root.clone()))?;
                    Ok(ended.into())
                }),
        );
    }

    Ok(router)
}
