//! WebSocket transport over a non-blocking TCP listener.
//!
//! Every session negotiates a `Sec-WebSocket-Protocol`; the selected name is
//! the channel the session belongs to. Sessions offering none of the
//! registered names are refused during the HTTP upgrade. A service round is
//! one `poll(2)` over the listener and all sessions, followed by:
//!
//! 1. accepting new TCP connections and starting their upgrade,
//! 2. advancing pending upgrades (filter, then established),
//! 3. reading complete messages until the socket would block,
//! 4. finishing partial writes and reporting writable sessions.
//!
//! A write the socket cannot take stays in tungstenite's buffer; the session
//! is then watched for `WRITABLE` through [`TransportEvent::ChangeWatch`]
//! until the buffer drains. Closing a session with buffered data keeps it
//! around, watched for writes, for at most [`CLOSE_LINGER`].
//!
//! UTF-8 payloads are sent as text frames, anything else as binary frames.

// Rust guideline compliant 2026-02

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::fd::{AsRawFd, RawFd};
use std::rc::Rc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tungstenite::handshake::server::{Callback, ErrorResponse, Request, Response, ServerHandshake};
use tungstenite::handshake::{HandshakeError, MidHandshake};
use tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tungstenite::http::{HeaderValue, StatusCode};
use tungstenite::{Message, WebSocket};

use super::{Transport, TransportContext, TransportEvent, Verdict};
use crate::hub::poll_loop::poll_fds;
use crate::hub::readiness::Interest;

/// How long a closed session may keep flushing buffered frames.
pub const CLOSE_LINGER: Duration = Duration::from_secs(5);

/// Picks the first offered subprotocol that names a registered channel.
struct ProtocolSelect {
    protocols: Rc<[String]>,
    selected: Rc<RefCell<Option<String>>>,
}

impl Callback for ProtocolSelect {
    fn on_request(self, request: &Request, mut response: Response) -> Result<Response, ErrorResponse> {
        let offered: Vec<&str> = request
            .headers()
            .get_all(SEC_WEBSOCKET_PROTOCOL)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .map(str::trim)
            .collect();

        let Some(protocol) = offered
            .iter()
            .find(|offer| self.protocols.iter().any(|name| name == *offer))
        else {
            log::info!("[Transport] Refusing upgrade, no known protocol in {offered:?}");
            return Err(error_response(StatusCode::BAD_REQUEST, "No supported channel protocol"));
        };

        let value = HeaderValue::from_str(protocol)
            .map_err(|_| error_response(StatusCode::BAD_REQUEST, "Invalid protocol name"))?;
        response.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
        *self.selected.borrow_mut() = Some((*protocol).to_string());
        Ok(response)
    }
}

fn error_response(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}

type Upgrade = MidHandshake<ServerHandshake<TcpStream, ProtocolSelect>>;

enum Peer {
    Upgrading {
        upgrade: Upgrade,
        selected: Rc<RefCell<Option<String>>>,
    },
    Open {
        ws: WebSocket<TcpStream>,
        protocol: String,
        flush_pending: bool,
    },
    /// Closed by the hub, still flushing.
    Closing {
        ws: WebSocket<TcpStream>,
        deadline: Instant,
    },
}

/// Result of advancing one pending upgrade.
enum UpgradeStep {
    Pending(Peer),
    Done(WebSocket<TcpStream>, Option<String>),
    Failed(tungstenite::Error),
}

/// WebSocket listener multiplexing all channels on one port.
pub struct WsTransport {
    listener: TcpListener,
    listener_fd: RawFd,
    protocols: Rc<[String]>,
    peers: HashMap<RawFd, Peer>,
    announced: bool,
}

impl std::fmt::Debug for WsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsTransport")
            .field("listener_fd", &self.listener_fd)
            .field("protocols", &self.protocols)
            .field("peers", &self.peers.len())
            .finish_non_exhaustive()
    }
}

impl WsTransport {
    /// Bind the listener. `protocols` are the channel names, in the order the
    /// hub registered them.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound or the socket cannot be
    /// switched to non-blocking mode.
    pub fn bind(addr: impl ToSocketAddrs, protocols: Vec<String>) -> Result<Self> {
        let listener = TcpListener::bind(addr).context("Failed to bind WebSocket listener")?;
        listener
            .set_nonblocking(true)
            .context("Failed to make listener non-blocking")?;
        let listener_fd = listener.as_raw_fd();

        if let Ok(local) = listener.local_addr() {
            log::info!("[Transport] Listening on ws://{local} ({})", protocols.join(", "));
        }

        Ok(Self {
            listener,
            listener_fd,
            protocols: protocols.into(),
            peers: HashMap::new(),
            announced: false,
        })
    }

    /// Address the listener is bound to.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the socket address cannot be read.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Sessions currently upgrading, open, or flushing before close.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.peers.len()
    }

    fn accept_new(&mut self, ctx: &mut dyn TransportContext) {
        loop {
            let (stream, addr) = match self.listener.accept() {
                Ok(accepted) => accepted,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::error!("[Transport] Accept error: {e}");
                    break;
                }
            };
            if let Err(e) = stream.set_nonblocking(true) {
                log::warn!("[Transport] Dropping {addr}: {e}");
                continue;
            }
            // Small control messages; don't batch them.
            let _ = stream.set_nodelay(true);

            let fd = stream.as_raw_fd();
            log::debug!("[Transport] Accepted {addr} on fd {fd}");
            ctx.on_transport_event(TransportEvent::AddWatch {
                fd,
                interest: Interest::READABLE,
            });

            let selected = Rc::new(RefCell::new(None));
            let callback = ProtocolSelect {
                protocols: Rc::clone(&self.protocols),
                selected: Rc::clone(&selected),
            };
            let step = match tungstenite::accept_hdr(stream, callback) {
                Ok(ws) => UpgradeStep::Done(ws, selected.borrow_mut().take()),
                Err(HandshakeError::Interrupted(upgrade)) => {
                    UpgradeStep::Pending(Peer::Upgrading { upgrade, selected })
                }
                Err(HandshakeError::Failure(e)) => UpgradeStep::Failed(e),
            };
            self.finish_upgrade(fd, step, ctx);
        }
    }

    fn advance_upgrades(&mut self, ctx: &mut dyn TransportContext) {
        let upgrading: Vec<RawFd> = self
            .peers
            .iter()
            .filter(|(_, peer)| matches!(peer, Peer::Upgrading { .. }))
            .map(|(fd, _)| *fd)
            .collect();

        for fd in upgrading {
            let Some(Peer::Upgrading { upgrade, selected }) = self.peers.remove(&fd) else {
                continue;
            };
            let step = match upgrade.handshake() {
                Ok(ws) => UpgradeStep::Done(ws, selected.borrow_mut().take()),
                Err(HandshakeError::Interrupted(upgrade)) => {
                    UpgradeStep::Pending(Peer::Upgrading { upgrade, selected })
                }
                Err(HandshakeError::Failure(e)) => UpgradeStep::Failed(e),
            };
            self.finish_upgrade(fd, step, ctx);
        }
    }

    fn finish_upgrade(&mut self, fd: RawFd, step: UpgradeStep, ctx: &mut dyn TransportContext) {
        match step {
            UpgradeStep::Pending(peer) => {
                self.peers.insert(fd, peer);
            }
            UpgradeStep::Failed(e) => {
                log::debug!("[Transport] Upgrade failed on fd {fd}: {e}");
                ctx.on_transport_event(TransportEvent::RemoveWatch { fd });
            }
            UpgradeStep::Done(mut ws, None) => {
                log::warn!("[Transport] Upgrade on fd {fd} finished without a protocol");
                let _ = ws.close(None);
                let _ = ws.flush();
                ctx.on_transport_event(TransportEvent::RemoveWatch { fd });
            }
            UpgradeStep::Done(mut ws, Some(protocol)) => {
                let verdict = ctx.on_transport_event(TransportEvent::FilterConnection {
                    fd,
                    protocol: &protocol,
                });
                if verdict == Verdict::Reject {
                    log::info!("[Transport] Session on fd {fd} ('{protocol}') rejected");
                    let _ = ws.close(None);
                    let _ = ws.flush();
                    ctx.on_transport_event(TransportEvent::RemoveWatch { fd });
                    return;
                }
                ctx.on_transport_event(TransportEvent::Established {
                    fd,
                    protocol: &protocol,
                });
                self.peers.insert(
                    fd,
                    Peer::Open {
                        ws,
                        protocol,
                        flush_pending: false,
                    },
                );
            }
        }
    }

    /// Read every complete message buffered on `fd`. Returns `false` once the
    /// session is gone.
    fn read_messages(&mut self, fd: RawFd, ctx: &mut dyn TransportContext) -> bool {
        let Some(Peer::Open { ws, protocol, .. }) = self.peers.get_mut(&fd) else {
            return true;
        };
        loop {
            match ws.read() {
                Ok(Message::Text(text)) => {
                    ctx.on_transport_event(TransportEvent::Receive {
                        fd,
                        data: text.as_bytes(),
                    });
                }
                Ok(Message::Binary(data)) => {
                    ctx.on_transport_event(TransportEvent::Receive { fd, data: &data });
                }
                Ok(Message::Close(frame)) => {
                    log::debug!("[Transport] '{protocol}' on fd {fd} sent close: {frame:?}");
                }
                // Pings are answered by the protocol layer.
                Ok(_) => {}
                Err(tungstenite::Error::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => {
                    return true;
                }
                Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                    log::debug!("[Transport] '{protocol}' on fd {fd} closed");
                    return false;
                }
                Err(e) => {
                    log::warn!("[Transport] '{protocol}' on fd {fd} failed: {e}");
                    return false;
                }
            }
        }
    }

    /// Finish a partial write on `fd`, withdrawing the write interest it
    /// needed. Returns `false` once the session is gone.
    fn finish_flush(&mut self, fd: RawFd, ctx: &mut dyn TransportContext) -> bool {
        let Some(Peer::Open {
            ws,
            protocol,
            flush_pending,
        }) = self.peers.get_mut(&fd)
        else {
            return true;
        };
        match ws.flush() {
            Ok(()) => {
                *flush_pending = false;
                log::trace!("[Transport] fd {fd} drained");
                ctx.on_transport_event(TransportEvent::ChangeWatch {
                    fd,
                    set: Interest::NONE,
                    clear: Interest::WRITABLE,
                });
                true
            }
            Err(tungstenite::Error::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => true,
            Err(e) => {
                log::warn!("[Transport] Flush to '{protocol}' on fd {fd} failed: {e}");
                false
            }
        }
    }

    /// Flush sessions closed by the hub. Drained, failed and overdue ones are
    /// dropped and unwatched.
    fn drain_closing(&mut self, ctx: &mut dyn TransportContext) {
        let closing: Vec<RawFd> = self
            .peers
            .iter()
            .filter(|(_, peer)| matches!(peer, Peer::Closing { .. }))
            .map(|(fd, _)| *fd)
            .collect();

        let now = Instant::now();
        for fd in closing {
            let Some(Peer::Closing { ws, deadline }) = self.peers.get_mut(&fd) else {
                continue;
            };
            let done = match ws.flush() {
                Err(tungstenite::Error::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => {
                    if now >= *deadline {
                        log::debug!("[Transport] Closing fd {fd} did not drain in time, dropping it");
                    }
                    now >= *deadline
                }
                _ => true,
            };
            if done {
                self.peers.remove(&fd);
                ctx.on_transport_event(TransportEvent::RemoveWatch { fd });
            }
        }
    }

    fn drop_peer(&mut self, fd: RawFd, ctx: &mut dyn TransportContext) {
        self.peers.remove(&fd);
        ctx.on_transport_event(TransportEvent::Closed { fd });
        ctx.on_transport_event(TransportEvent::RemoveWatch { fd });
    }

    fn poll_set(&self, ctx: &dyn TransportContext) -> Vec<libc::pollfd> {
        let mut fds = Vec::with_capacity(self.peers.len() + 1);
        fds.push(libc::pollfd {
            fd: self.listener_fd,
            events: libc::POLLIN,
            revents: 0,
        });
        for (fd, peer) in &self.peers {
            let interest = match peer {
                Peer::Upgrading { .. } => Interest::READABLE,
                Peer::Open { flush_pending, .. } => {
                    let mut interest = Interest::READABLE;
                    if *flush_pending || ctx.interest(*fd).contains(Interest::WRITABLE) {
                        interest.insert(Interest::WRITABLE);
                    }
                    interest
                }
                Peer::Closing { .. } => Interest::WRITABLE,
            };
            fds.push(libc::pollfd {
                fd: *fd,
                events: interest.to_poll_events(),
                revents: 0,
            });
        }
        fds
    }
}

impl Transport for WsTransport {
    fn service(&mut self, max_wait: Duration, ctx: &mut dyn TransportContext) -> Result<()> {
        if !self.announced {
            ctx.on_transport_event(TransportEvent::AddWatch {
                fd: self.listener_fd,
                interest: Interest::READABLE,
            });
            self.announced = true;
        }

        let mut fds = self.poll_set(ctx);
        poll_fds(&mut fds, max_wait).context("poll failed")?;

        if fds[0].revents & libc::POLLIN != 0 {
            self.accept_new(ctx);
        }
        // Upgrades are retried every round: a stalled response write leaves
        // nothing to read.
        self.advance_upgrades(ctx);
        self.drain_closing(ctx);

        for pfd in &fds[1..] {
            let fd = pfd.fd;
            if !matches!(self.peers.get(&fd), Some(Peer::Open { .. })) {
                continue;
            }
            if pfd.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0
                && !self.read_messages(fd, ctx)
            {
                self.drop_peer(fd, ctx);
                continue;
            }
            if pfd.revents & libc::POLLOUT == 0 {
                continue;
            }
            let pending = matches!(
                self.peers.get(&fd),
                Some(Peer::Open {
                    flush_pending: true,
                    ..
                })
            );
            if pending && !self.finish_flush(fd, ctx) {
                self.drop_peer(fd, ctx);
                continue;
            }
            let still_pending = matches!(
                self.peers.get(&fd),
                Some(Peer::Open {
                    flush_pending: true,
                    ..
                })
            );
            if !still_pending && ctx.interest(fd).contains(Interest::WRITABLE) {
                ctx.on_transport_event(TransportEvent::Writable { fd });
            }
        }
        Ok(())
    }

    fn write(&mut self, fd: RawFd, payload: &[u8], ctx: &mut dyn TransportContext) -> Result<()> {
        let Some(Peer::Open {
            ws, flush_pending, ..
        }) = self.peers.get_mut(&fd)
        else {
            bail!("No open session on fd {fd}");
        };
        let message = match std::str::from_utf8(payload) {
            Ok(text) => Message::Text(text.to_string()),
            Err(_) => Message::Binary(payload.to_vec()),
        };
        match ws.send(message) {
            Ok(()) => Ok(()),
            // The frame is buffered; it goes out on the next writable round.
            Err(tungstenite::Error::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => {
                if !*flush_pending {
                    *flush_pending = true;
                    log::trace!("[Transport] fd {fd} backed up, waiting for POLLOUT");
                    ctx.on_transport_event(TransportEvent::ChangeWatch {
                        fd,
                        set: Interest::WRITABLE,
                        clear: Interest::NONE,
                    });
                }
                Ok(())
            }
            Err(e) => Err(e).with_context(|| format!("WebSocket write on fd {fd} failed")),
        }
    }

    fn close(&mut self, fd: RawFd, ctx: &mut dyn TransportContext) {
        match self.peers.remove(&fd) {
            Some(Peer::Open { mut ws, protocol, .. }) => {
                log::debug!("[Transport] Closing '{protocol}' on fd {fd}");
                if let Err(tungstenite::Error::Io(e)) = ws.close(None) {
                    if e.kind() == io::ErrorKind::WouldBlock {
                        log::debug!("[Transport] '{protocol}' on fd {fd} still flushing");
                        ctx.on_transport_event(TransportEvent::AddWatch {
                            fd,
                            interest: Interest::WRITABLE,
                        });
                        self.peers.insert(
                            fd,
                            Peer::Closing {
                                ws,
                                deadline: Instant::now() + CLOSE_LINGER,
                            },
                        );
                    }
                }
            }
            Some(peer @ Peer::Closing { .. }) => {
                self.peers.insert(fd, peer);
            }
            Some(Peer::Upgrading { .. }) => {
                log::debug!("[Transport] Dropping upgrade on fd {fd}");
            }
            None => {}
        }
    }
}
