//! Per-core worker event loop.
//!
//! One process, one `current_thread` tokio runtime, one CPU pinned (best
//! effort). Two listeners — plain and TLS — share the slot pool, rate
//! limiter, and ACL; accepted connections are driven as `spawn_local` tasks
//! on a `LocalSet`, one task per connection.

use std::cell::{Cell, RefCell};
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::LocalSet;

use crate::acl::{Acl, AddrList};
use crate::config::Config;
use crate::connection::{admit, Connection, WorkerShared};
use crate::io_stream::IoStream;
use crate::ratelimit::RateLimiter;
use crate::rpc::RpcManager;
use crate::slots::SlotPool;
use crate::static_files::StaticSet;
use crate::tls::TlsTerminator;

/// Bind a listener with `SO_REUSEPORT` so the kernel load-balances accepted
/// connections across every worker process bound to the same port.
fn bind_reuseport(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_reuse_port(true)?;
    if addr.is_ipv6() {
        socket.set_only_v6(false)?; // dual-stack IPv6 with IPv4 mapping
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    TcpListener::from_std(socket.into())
}

/// Best-effort CPU affinity so each worker owns one core.
fn pin_to_core(worker_index: usize) {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        let ncpus = libc::sysconf(libc::_SC_NPROCESSORS_ONLN).max(1) as usize;
        libc::CPU_SET(worker_index % ncpus, &mut set);
        libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
    }
}

pub struct WorkerArgs {
    pub worker_id: u32,
    pub config: Config,
}

/// Entry point for a forked worker process: builds all per-worker state,
/// binds listeners, and runs the event loop until drain or a fatal accept
/// error. Never returns an `Err` that the caller should retry — exits the
/// process directly once the loop ends.
pub fn run(args: WorkerArgs) {
    pin_to_core(args.worker_id as usize);

    if args.config.security.seccomp {
        // Installed after all sockets/files are open; the
        // actual policy program is an external collaborator.
        tracing::info!(worker = args.worker_id, "seccomp policy would install here");
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build current_thread runtime");

    let local = LocalSet::new();
    local.block_on(&runtime, run_async(args));
}

async fn run_async(args: WorkerArgs) {
    let cfg = &args.config;

    let block_list = match &cfg.security.block_list {
        Some(path) => AddrList::load_file(std::path::Path::new(path)).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to load blocklist, using empty list");
            AddrList::empty()
        }),
        None => AddrList::empty(),
    };
    let allow_list = match &cfg.security.allow_list {
        Some(path) => AddrList::load_file(std::path::Path::new(path)).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to load allowlist, using empty list");
            AddrList::empty()
        }),
        None => AddrList::empty(),
    };

    let statics = match &cfg.static_.dir {
        Some(dir) => StaticSet::load(std::path::Path::new(dir), cfg.static_.banner.as_deref())
            .expect("static file set failed to load"),
        None => StaticSet::empty(),
    };

    let rpc = RpcManager::new(&cfg.rpc_chains).expect("rpc manager configuration invalid");

    let shared = Rc::new(WorkerShared {
        worker_id: args.worker_id,
        slots: RefCell::new(SlotPool::new(cfg.slots.normal, cfg.slots.large, cfg.slots.huge)),
        ratelimiter: RefCell::new(RateLimiter::new(cfg.ratelimit.rate, cfg.ratelimit.burst)),
        acl: RefCell::new(Acl::new(block_list, allow_list)),
        counters: RefCell::new(crate::metrics::Counters::default()),
        statics,
        rpc: RefCell::new(rpc),
        max_buffer_size: cfg.buffer.max_buffer_size,
        large_threshold: cfg.tiers.large_threshold,
        huge_threshold: cfg.tiers.huge_threshold,
        acme_dir: cfg.acme.challenge_dir.as_ref().map(std::path::PathBuf::from),
        draining: Cell::new(false),
        active_connections: Cell::new(0),
        request_counter: Cell::new(0),
        clock_start: std::time::Instant::now(),
        drain_notify: tokio::sync::Notify::new(),
    });

    let tls = if cfg.tls.enabled {
        let cert = cfg.tls.cert_path.as_deref().expect("tls.enabled requires cert_path");
        let key = cfg.tls.key_path.as_deref().expect("tls.enabled requires key_path");
        let http2_enabled = true;
        Some(Rc::new(
            TlsTerminator::load(std::path::Path::new(cert), std::path::Path::new(key), http2_enabled)
                .expect("failed to load TLS certificate/key"),
        ))
    } else {
        None
    };
    if let Some(t) = &tls {
        shared.counters.borrow_mut().tls_cert_expiry = t.cert_expiry();
    }

    let plain_addr: SocketAddr = format!("[::]:{}", cfg.server.plain_port).parse().unwrap();
    let plain_listener = bind_reuseport(plain_addr).expect("failed to bind plain listener");

    let tls_listener = if tls.is_some() {
        let tls_addr: SocketAddr = format!("[::]:{}", cfg.server.tls_port).parse().unwrap();
        Some(bind_reuseport(tls_addr).expect("failed to bind tls listener"))
    } else {
        None
    };

    tokio::task::spawn_local(cleanup_timer(Rc::clone(&shared)));

    let mut sigusr1 = signal(SignalKind::user_defined1()).expect("failed to install SIGUSR1 handler");
    let mut sigusr2 = signal(SignalKind::user_defined2()).expect("failed to install SIGUSR2 handler");

    loop {
        tokio::select! {
            accepted = plain_listener.accept() => {
                if let Ok((stream, addr)) = accepted {
                    spawn_plain(Rc::clone(&shared), stream, addr);
                }
            }
            accepted = accept_tls(tls_listener.as_ref()) => {
                if let Some((stream, addr)) = accepted {
                    if let Some(tls) = tls.clone() {
                        spawn_tls(Rc::clone(&shared), tls, stream, addr);
                    }
                }
            }
            _ = sigusr1.recv() => {
                tracing::info!(worker = shared.worker_id, "draining");
                shared.draining.set(true);
            }
            _ = sigusr2.recv() => {
                if let Some(tls) = &tls {
                    if let Err(e) = tls.reload() {
                        tracing::error!(error = %e, "tls reload failed");
                    } else {
                        shared.counters.borrow_mut().tls_cert_expiry = tls.cert_expiry();
                    }
                }
            }
            // Woken on every connection/stream close so a drain in progress
            // notices `active_connections` reaching zero even when no new
            // accept or signal would otherwise wake this loop.
            _ = shared.drain_notify.notified() => {}
        }

        if shared.draining.get() && shared.active_connections.get() == 0 {
            break;
        }
    }
}

async fn accept_tls(listener: Option<&TcpListener>) -> Option<(tokio::net::TcpStream, SocketAddr)> {
    match listener {
        Some(l) => l.accept().await.ok(),
        None => std::future::pending().await,
    }
}

fn spawn_plain(shared: Rc<WorkerShared>, stream: tokio::net::TcpStream, addr: SocketAddr) {
    let _ = stream.set_nodelay(true);
    let ip = addr.ip().to_string();
    match admit(&shared, &ip) {
        Ok(()) => {
            tokio::task::spawn_local(async move {
                let conn = Connection::new(shared, IoStream::Plain(stream), ip);
                conn.run().await;
            });
        }
        Err(kind) => {
            // Plaintext, so the rejection response can be written directly
            // before closing.
            tokio::task::spawn_local(async move {
                let mut stream = stream;
                let body = kind.as_http("-");
                let _ = stream.write_all(&body).await;
            });
        }
    }
}

fn spawn_tls(shared: Rc<WorkerShared>, tls: Rc<TlsTerminator>, stream: tokio::net::TcpStream, addr: SocketAddr) {
    let _ = stream.set_nodelay(true);
    let ip = addr.ip().to_string();
    match admit(&shared, &ip) {
        Ok(()) => {
            tokio::task::spawn_local(async move {
                let acceptor = tokio_rustls::TlsAcceptor::from(tls.current());
                match acceptor.accept(stream).await {
                    Ok(tls_stream) => {
                        let alpn = tls_stream.get_ref().1.alpn_protocol().map(|p| p.to_vec());
                        if alpn.as_deref() == Some(&b"h2"[..]) {
                            crate::h2session::run(tls_stream, shared).await;
                        } else {
                            let conn = Connection::new(shared, IoStream::Tls(Box::new(tls_stream)), ip);
                            conn.run().await;
                        }
                    }
                    Err(_) => {
                        shared.counters.borrow_mut().tls_handshake_errors += 1;
                        shared.counters.borrow_mut().errors_tls += 1;
                    }
                }
            });
        }
        // Rejection happens before the TLS handshake begins, so
        // there is no session to carry an HTTP response over; the
        // connection is simply closed.
        Err(_) => drop(stream),
    }
}

/// Periodic 30 s timer that runs rate-limiter TTL reclamation.
async fn cleanup_timer(shared: Rc<WorkerShared>) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        shared.ratelimiter.borrow_mut().cleanup();
    }
}
