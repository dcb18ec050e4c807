//! Listener set: one bound socket per configured endpoint.
//!
//! Each listener accepts on its own coroutine and serves every connection on
//! another; the protocol adapter is chosen per connection (ALPN over TLS,
//! preface sniffing on cleartext). Listeners subscribe to `exit` and close on
//! trigger; `EACCES`/`EADDRINUSE` at bind time are fatal with exit code 4.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use may::coroutine::JoinHandle;
use may::net::TcpListener;

use super::channel::Protocol;
use super::conn::{accept_stream, load_tls_config, Accepted};
use super::{h1, h2};
use crate::config::ListenerConfig;
use crate::events::{bus, EventName, EventPayload, Flow};
use crate::router::{ListenerContext, Router, ACTIVE_REQUESTS};

/// How long in-flight requests get after `exit` before the process goes down.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

struct Shared {
    accept_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn cancel(&self) {
        if let Some(handle) = self.accept_handle.lock().unwrap().take() {
            unsafe {
                handle.coroutine().cancel();
            }
            let _ = handle.join();
        }
    }
}

/// Handle to one running listener.
pub struct ListenerHandle {
    addr: SocketAddr,
    shared: Arc<Shared>,
    exit_hook: crate::events::HookId,
}

impl ListenerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Poll until the socket accepts connections.
    pub fn wait_ready(&self) -> io::Result<()> {
        for _ in 0..50 {
            if std::net::TcpStream::connect(self.addr).is_ok() {
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        Err(io::Error::new(io::ErrorKind::TimedOut, "listener not ready"))
    }

    /// Close the socket and stop accepting. Idempotent with the exit event.
    pub fn stop(self) {
        bus().off(&EventName::Exit, self.exit_hook);
        self.shared.cancel();
    }

    /// Block until the accept loop ends (exit event or cancellation).
    pub fn join(self) {
        let handle = self.shared.accept_handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

/// Bind and start serving one listener.
///
/// `EACCES` and `EADDRINUSE` are fatal: diagnostic then exit code 4. Other
/// bind errors are returned to the caller.
pub fn start_listener(cfg: &ListenerConfig, router: Arc<Router>) -> anyhow::Result<ListenerHandle> {
    cfg.validate()?;
    let tls = match (cfg.secure, &cfg.key, &cfg.cert) {
        (true, Some(key), Some(cert)) => Some(load_tls_config(cert, key)?),
        _ => None,
    };

    let bind_addr = cfg.bind_addr();
    let listener = match TcpListener::bind(&bind_addr) {
        Ok(listener) => listener,
        Err(err)
            if matches!(
                err.kind(),
                io::ErrorKind::AddrInUse | io::ErrorKind::PermissionDenied
            ) =>
        {
            tracing::error!(addr = %bind_addr, error = %err, "cannot bind listener");
            std::process::exit(4);
        }
        Err(err) => return Err(err.into()),
    };
    let addr = listener.local_addr()?;
    tracing::info!(
        addr = %addr,
        secure = cfg.secure,
        prefix = %cfg.prefix,
        "listener started"
    );

    let ctx = ListenerContext {
        prefix: cfg.prefix.clone(),
        secure: cfg.secure,
        max_body_bytes: cfg.max_body_bytes,
        redirect: cfg.redirect,
    };

    let accept_router = Arc::clone(&router);
    let handle = may::go!(move || {
        accept_loop(listener, tls, accept_router, ctx);
    });

    let shared = Arc::new(Shared {
        accept_handle: Mutex::new(Some(handle)),
    });
    let exit_shared = Arc::clone(&shared);
    let exit_hook = bus().on(EventName::Exit, move |_: &mut EventPayload<'_>| {
        exit_shared.cancel();
        Ok(Flow::Continue)
    });

    Ok(ListenerHandle {
        addr,
        shared,
        exit_hook,
    })
}

/// Start the whole listener set; fails fast if any endpoint cannot start.
pub fn start_listeners(
    configs: &[ListenerConfig],
    router: Arc<Router>,
) -> anyhow::Result<Vec<ListenerHandle>> {
    bus().emit(&EventName::ListenRouterInit, &mut EventPayload::None);
    let mut handles = Vec::with_capacity(configs.len());
    for cfg in configs {
        handles.push(start_listener(cfg, Arc::clone(&router))?);
    }
    Ok(handles)
}

fn accept_loop(
    listener: TcpListener,
    tls: Option<Arc<rustls::ServerConfig>>,
    router: Arc<Router>,
    ctx: ListenerContext,
) {
    for stream in listener.incoming() {
        match stream {
            Ok(tcp) => {
                let router = Arc::clone(&router);
                let tls = tls.clone();
                let ctx = ctx.clone();
                may::go!(move || {
                    serve_connection(tcp, tls, router, ctx);
                });
            }
            Err(err) => {
                tracing::warn!(error = %err, "accept failed");
            }
        }
    }
}

fn serve_connection(
    tcp: may::net::TcpStream,
    tls: Option<Arc<rustls::ServerConfig>>,
    router: Arc<Router>,
    ctx: ListenerContext,
) {
    let Accepted {
        stream,
        leftover,
        protocol,
    } = match accept_stream(tcp, tls) {
        Ok(accepted) => accepted,
        Err(err) => {
            tracing::debug!(error = %err, "connection setup failed");
            return;
        }
    };
    match protocol {
        Protocol::Http1 => serve_h1(stream, leftover, &router, &ctx),
        Protocol::Http2 => serve_h2(stream, leftover, &router, &ctx),
    }
}

fn serve_h1(
    stream: Box<dyn super::conn::ByteStream>,
    leftover: Vec<u8>,
    router: &Router,
    ctx: &ListenerContext,
) {
    let mut conn = h1::H1Conn::new(stream, leftover);
    loop {
        let (head, body, meta) = match conn.read_head() {
            Ok(parsed) => parsed,
            Err(h1::H1Error::Eof) => return,
            Err(h1::H1Error::BadRequest(reason)) => {
                tracing::debug!(reason, "rejecting malformed request");
                conn.reject(http::StatusCode::BAD_REQUEST);
                return;
            }
            Err(h1::H1Error::Io(err)) => {
                tracing::debug!(error = %err, "connection read failed");
                return;
            }
        };
        let channel = Box::new(h1::H1Channel::new(conn, body, meta.keep_alive, meta.http10));
        match router.handle(head, channel, ctx) {
            Some(channel) => match channel.into_h1() {
                Some(reusable) => conn = reusable,
                None => return,
            },
            None => return,
        }
    }
}

fn serve_h2(
    stream: Box<dyn super::conn::ByteStream>,
    leftover: Vec<u8>,
    router: &Router,
    ctx: &ListenerContext,
) {
    let mut conn = h2::H2Conn::new(stream, leftover);
    if let Err(err) = conn.handshake() {
        tracing::debug!(error = %err, "h2 handshake failed");
        return;
    }
    loop {
        match conn.next_request() {
            Ok(Some((head, stream_id, end_stream))) => {
                let channel = Box::new(h2::H2Channel::new(conn, stream_id, end_stream));
                match router.handle(head, channel, ctx) {
                    Some(channel) => match channel.into_h2() {
                        Some(reusable) => conn = reusable,
                        None => return,
                    },
                    None => return,
                }
            }
            Ok(None) => return,
            Err(err) => {
                tracing::debug!(error = %err, "h2 connection failed");
                return;
            }
        }
    }
}

/// Graceful shutdown: emit `exit` (listeners close, SSE streams end), then
/// wait up to the grace period for in-flight requests to drain.
pub fn shutdown(grace: Duration) {
    tracing::info!("shutting down");
    bus().emit_async(&EventName::Exit, &mut EventPayload::None);
    let deadline = Instant::now() + grace;
    while ACTIVE_REQUESTS.load(std::sync::atomic::Ordering::SeqCst) > 0
        && Instant::now() < deadline
    {
        std::thread::sleep(Duration::from_millis(50));
    }
    let leftover = ACTIVE_REQUESTS.load(std::sync::atomic::Ordering::SeqCst);
    if leftover > 0 {
        tracing::warn!(in_flight = leftover, "grace period expired with requests in flight");
    }
}
