// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Socket of the shared memory transport. Only metadata headers travel on
// the wire; payload bytes stay in the shared segment. The underlying
// stream layer is host-local (unix domain sockets, or tcp for
// convenience), with a small length prefix delimiting each metadata
// message. Blocking operations run soft 100 ms loops so the factory's
// interrupt flag is observed promptly.

use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, error};

use crate::common::{MetaHeader, SOCKET_LOOP_PERIOD_MS};
use crate::errors::{Error, Result, TransferError, TransferResult};
use crate::manager::Manager;
use crate::message::Message;

/// Upper bound on a metadata frame; anything larger is corruption.
const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Messaging pattern of a socket. `pub`/`sub` are not representable: the
/// wire content is a buffer handle, and multicast sharing of references is
/// not defined for this transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SocketType {
    Push,
    Pull,
    Req,
    Rep,
    Pair,
}

impl SocketType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "push" => Some(Self::Push),
            "pull" => Some(Self::Pull),
            "req" => Some(Self::Req),
            "rep" => Some(Self::Rep),
            "pair" => Some(Self::Pair),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Push => "push",
            Self::Pull => "pull",
            Self::Req => "req",
            Self::Rep => "rep",
            Self::Pair => "pair",
        }
    }

    pub(crate) fn can_send(&self) -> bool {
        !matches!(self, Self::Pull)
    }

    pub(crate) fn can_receive(&self) -> bool {
        !matches!(self, Self::Push)
    }
}

enum StreamKind {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl StreamKind {
    fn set_nonblocking(&self) -> io::Result<()> {
        match self {
            Self::Unix(s) => s.set_nonblocking(true),
            Self::Tcp(s) => s.set_nonblocking(true),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Unix(s) => s.read(buf),
            Self::Tcp(s) => s.read(buf),
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Unix(s) => s.write(buf),
            Self::Tcp(s) => s.write(buf),
        }
    }
}

impl AsRawFd for StreamKind {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Self::Unix(s) => s.as_raw_fd(),
            Self::Tcp(s) => s.as_raw_fd(),
        }
    }
}

enum ListenerKind {
    Unix(UnixListener),
    Tcp(TcpListener),
}

impl ListenerKind {
    fn accept(&self) -> io::Result<StreamKind> {
        match self {
            Self::Unix(l) => l.accept().map(|(s, _)| StreamKind::Unix(s)),
            Self::Tcp(l) => l.accept().map(|(s, _)| StreamKind::Tcp(s)),
        }
    }
}

impl AsRawFd for ListenerKind {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Self::Unix(l) => l.as_raw_fd(),
            Self::Tcp(l) => l.as_raw_fd(),
        }
    }
}

enum Address {
    Ipc(PathBuf),
    Tcp(String),
}

fn parse_address(address: &str) -> Result<Address> {
    if let Some(path) = address.strip_prefix("ipc://") {
        if path.is_empty() {
            return Err(Error::Socket(format!("invalid ipc address: {address}")));
        }
        Ok(Address::Ipc(PathBuf::from(path)))
    } else if let Some(hostport) = address.strip_prefix("tcp://") {
        Ok(Address::Tcp(hostport.to_string()))
    } else {
        Err(Error::Socket(format!(
            "unsupported address '{address}' (expected ipc:// or tcp://)"
        )))
    }
}

struct Peer {
    stream: StreamKind,
}

/// Readiness snapshot shared with pollers: the listener fd (if bound) and
/// the fds of all connected peers.
pub(crate) struct FdSnapshot {
    pub listener: Option<RawFd>,
    pub peers: Vec<RawFd>,
}

pub(crate) struct FdRegistry {
    pub inner: Mutex<FdSnapshot>,
}

fn poll_one(fd: RawFd, events: i16, timeout_ms: i32) -> bool {
    let mut item = libc::pollfd {
        fd,
        events,
        revents: 0,
    };
    let rc = unsafe { libc::poll(&mut item, 1, timeout_ms) };
    rc > 0 && (item.revents & events) != 0
}

enum FrameOutcome {
    Done,
    NotReady,
    PeerGone,
}

/// A sub-socket of a channel. Carries only `MetaHeader` bytes; the payload
/// stays in shared memory.
pub struct Socket {
    manager: Arc<Manager>,
    id: String,
    socket_type: SocketType,
    listener: Option<ListenerKind>,
    bound_ipc_path: Option<PathBuf>,
    peers: Vec<Peer>,
    next_send_peer: usize,
    next_recv_peer: usize,
    /// req: peer of the outstanding request; rep: peer awaiting the reply.
    sticky_peer: usize,
    /// req: a request is in flight; rep: a reply is owed.
    awaiting: bool,
    bytes_tx: u64,
    bytes_rx: u64,
    messages_tx: u64,
    messages_rx: u64,
    linger_ms: i32,
    snd_buf_size: i32,
    rcv_buf_size: i32,
    snd_kernel_size: i32,
    rcv_kernel_size: i32,
    metadata_msg_size: usize,
    fd_registry: Arc<FdRegistry>,
    closed: bool,
}

impl Socket {
    pub(crate) fn new(
        manager: Arc<Manager>,
        type_str: &str,
        name: &str,
        factory_id: &str,
    ) -> Result<Self> {
        if type_str == "sub" || type_str == "pub" || type_str == "xsub" || type_str == "xpub" {
            error!("PUB/SUB socket type is not supported for shared memory transport");
            return Err(Error::Transport(
                "PUB/SUB socket type is not supported for shared memory transport".to_string(),
            ));
        }
        let socket_type = SocketType::parse(type_str)
            .ok_or_else(|| Error::Transport(format!("unknown socket type '{type_str}'")))?;

        let id = format!("{factory_id}.{name}.{type_str}");
        let metadata_msg_size = manager.metadata_msg_size();
        debug!("created socket {id}");

        Ok(Self {
            manager,
            id,
            socket_type,
            listener: None,
            bound_ipc_path: None,
            peers: Vec::new(),
            next_send_peer: 0,
            next_recv_peer: 0,
            sticky_peer: 0,
            awaiting: false,
            bytes_tx: 0,
            bytes_rx: 0,
            messages_tx: 0,
            messages_rx: 0,
            linger_ms: 1000,
            snd_buf_size: 0,
            rcv_buf_size: 0,
            snd_kernel_size: 0,
            rcv_kernel_size: 0,
            metadata_msg_size,
            fd_registry: Arc::new(FdRegistry {
                inner: Mutex::new(FdSnapshot {
                    listener: None,
                    peers: Vec::new(),
                }),
            }),
            closed: false,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn socket_type(&self) -> SocketType {
        self.socket_type
    }

    pub(crate) fn fd_registry(&self) -> Arc<FdRegistry> {
        Arc::clone(&self.fd_registry)
    }

    /// Bind to an endpoint. Returns false (with a log) on failure, like the
    /// underlying transport contract.
    pub fn bind(&mut self, address: &str) -> bool {
        let parsed = match parse_address(address) {
            Ok(a) => a,
            Err(e) => {
                error!("failed binding socket {}: {e}", self.id);
                return false;
            }
        };
        let result = match parsed {
            Address::Ipc(path) => {
                // A stale socket file from a crashed process blocks bind.
                let _ = std::fs::remove_file(&path);
                UnixListener::bind(&path).map(|l| {
                    self.bound_ipc_path = Some(path);
                    ListenerKind::Unix(l)
                })
            }
            Address::Tcp(hostport) => TcpListener::bind(&hostport).map(ListenerKind::Tcp),
        };
        match result {
            Ok(listener) => {
                if let Err(e) = match &listener {
                    ListenerKind::Unix(l) => l.set_nonblocking(true),
                    ListenerKind::Tcp(l) => l.set_nonblocking(true),
                } {
                    error!("failed configuring listener for {}: {e}", self.id);
                    return false;
                }
                self.listener = Some(listener);
                self.update_registry();
                true
            }
            Err(e) => {
                error!("failed binding socket {} to {address}: {e}", self.id);
                false
            }
        }
    }

    /// Connect to an endpoint. Returns false (with a log) on failure.
    pub fn connect(&mut self, address: &str) -> bool {
        let parsed = match parse_address(address) {
            Ok(a) => a,
            Err(e) => {
                error!("failed connecting socket {}: {e}", self.id);
                return false;
            }
        };
        let result = match parsed {
            Address::Ipc(path) => UnixStream::connect(&path).map(StreamKind::Unix),
            Address::Tcp(hostport) => TcpStream::connect(&hostport).map(StreamKind::Tcp),
        };
        match result {
            Ok(stream) => {
                if let Err(e) = stream.set_nonblocking() {
                    error!("failed configuring stream for {}: {e}", self.id);
                    return false;
                }
                self.apply_kernel_sizes(&stream);
                self.peers.push(Peer { stream });
                self.update_registry();
                true
            }
            Err(e) => {
                error!("failed connecting socket {} to {address}: {e}", self.id);
                false
            }
        }
    }

    fn apply_kernel_sizes(&self, stream: &StreamKind) {
        let fd = stream.as_raw_fd();
        if self.snd_kernel_size > 0 {
            unsafe {
                libc::setsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    libc::SO_SNDBUF,
                    &self.snd_kernel_size as *const i32 as *const libc::c_void,
                    std::mem::size_of::<i32>() as libc::socklen_t,
                );
            }
        }
        if self.rcv_kernel_size > 0 {
            unsafe {
                libc::setsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    libc::SO_RCVBUF,
                    &self.rcv_kernel_size as *const i32 as *const libc::c_void,
                    std::mem::size_of::<i32>() as libc::socklen_t,
                );
            }
        }
    }

    /// Accept pending connections and refresh the poller fd snapshot.
    pub(crate) fn process_events(&mut self) {
        let mut changed = false;
        if let Some(listener) = &self.listener {
            loop {
                match listener.accept() {
                    Ok(stream) => {
                        if stream.set_nonblocking().is_ok() {
                            self.apply_kernel_sizes(&stream);
                            self.peers.push(Peer { stream });
                            changed = true;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        error!("accept failed on socket {}: {e}", self.id);
                        break;
                    }
                }
            }
        }
        if changed {
            self.update_registry();
        }
    }

    fn update_registry(&self) {
        let mut snapshot = self.fd_registry.inner.lock().unwrap();
        snapshot.listener = self.listener.as_ref().map(|l| l.as_raw_fd());
        snapshot.peers = self.peers.iter().map(|p| p.stream.as_raw_fd()).collect();
    }

    fn drop_peer(&mut self, index: usize) {
        self.peers.remove(index);
        if self.next_send_peer >= self.peers.len() {
            self.next_send_peer = 0;
        }
        if self.next_recv_peer >= self.peers.len() {
            self.next_recv_peer = 0;
        }
        if self.sticky_peer >= self.peers.len() {
            self.sticky_peer = 0;
        }
        self.update_registry();
    }

    // --- frame IO ---------------------------------------------------------

    fn write_frame(&mut self, peer_index: usize, payload: &[u8]) -> FrameOutcome {
        let mut frame = Vec::with_capacity(4 + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_ne_bytes());
        frame.extend_from_slice(payload);

        let peer = &mut self.peers[peer_index];
        let mut written = 0usize;
        loop {
            match peer.stream.write(&frame[written..]) {
                Ok(0) => return FrameOutcome::PeerGone,
                Ok(n) => {
                    written += n;
                    if written == frame.len() {
                        return FrameOutcome::Done;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if written == 0 {
                        return FrameOutcome::NotReady;
                    }
                    // A started frame is completed whole; frames are tiny.
                    poll_one(
                        peer.stream.as_raw_fd(),
                        libc::POLLOUT,
                        SOCKET_LOOP_PERIOD_MS as i32,
                    );
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    debug!("peer write failed on socket {}: {e}", self.id);
                    return FrameOutcome::PeerGone;
                }
            }
        }
    }

    fn read_frame(&mut self, peer_index: usize) -> (FrameOutcome, Vec<u8>) {
        let mut len_buf = [0u8; 4];
        match self.read_exact_from(peer_index, &mut len_buf, true) {
            FrameOutcome::Done => {}
            other => return (other, Vec::new()),
        }
        let len = u32::from_ne_bytes(len_buf) as usize;
        if len == 0 || len > MAX_FRAME_SIZE {
            error!("invalid frame length {len} on socket {}", self.id);
            return (FrameOutcome::PeerGone, Vec::new());
        }
        let mut payload = vec![0u8; len];
        match self.read_exact_from(peer_index, &mut payload, false) {
            FrameOutcome::Done => (FrameOutcome::Done, payload),
            other => (other, Vec::new()),
        }
    }

    fn read_exact_from(
        &mut self,
        peer_index: usize,
        buf: &mut [u8],
        bail_if_empty: bool,
    ) -> FrameOutcome {
        let peer = &mut self.peers[peer_index];
        let mut read = 0usize;
        loop {
            match peer.stream.read(&mut buf[read..]) {
                Ok(0) => return FrameOutcome::PeerGone,
                Ok(n) => {
                    read += n;
                    if read == buf.len() {
                        return FrameOutcome::Done;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if read == 0 && bail_if_empty {
                        return FrameOutcome::NotReady;
                    }
                    // Mid-frame: wait for the remainder.
                    poll_one(
                        peer.stream.as_raw_fd(),
                        libc::POLLIN,
                        SOCKET_LOOP_PERIOD_MS as i32,
                    );
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    debug!("peer read failed on socket {}: {e}", self.id);
                    return FrameOutcome::PeerGone;
                }
            }
        }
    }

    // --- transfer loop plumbing -------------------------------------------

    /// One soft-blocking step of a transfer loop: bounded wait for peer
    /// readiness in the wanted direction (or a pending connection), with
    /// timeout accounting and interrupt observation.
    fn check_wait(
        &self,
        timeout_ms: i64,
        start: Instant,
        peer_events: i16,
    ) -> std::result::Result<(), TransferError> {
        if timeout_ms == 0 {
            return Err(TransferError::Timeout);
        }
        if self.manager.interrupted() {
            return Err(TransferError::Interrupted);
        }
        let mut wait = SOCKET_LOOP_PERIOD_MS;
        if timeout_ms > 0 {
            let elapsed = start.elapsed().as_millis() as u64;
            if elapsed >= timeout_ms as u64 {
                return Err(TransferError::Timeout);
            }
            wait = wait.min(timeout_ms as u64 - elapsed);
        }

        let mut fds: Vec<libc::pollfd> = self
            .peers
            .iter()
            .map(|p| libc::pollfd {
                fd: p.stream.as_raw_fd(),
                events: peer_events,
                revents: 0,
            })
            .collect();
        if let Some(listener) = &self.listener {
            fds.push(libc::pollfd {
                fd: listener.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            });
        }
        if fds.is_empty() {
            std::thread::sleep(Duration::from_millis(wait));
        } else {
            unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, wait as i32) };
        }

        if self.manager.interrupted() {
            return Err(TransferError::Interrupted);
        }
        Ok(())
    }

    fn pick_send_peer(&mut self) -> Option<usize> {
        if self.peers.is_empty() {
            return None;
        }
        match self.socket_type {
            SocketType::Pair | SocketType::Rep => Some(self.sticky_peer.min(self.peers.len() - 1)),
            _ => {
                let index = self.next_send_peer % self.peers.len();
                self.next_send_peer = (index + 1) % self.peers.len();
                Some(index)
            }
        }
    }

    fn check_send_state(&self) -> std::result::Result<(), TransferError> {
        if self.closed {
            return Err(TransferError::Socket("socket is closed".to_string()));
        }
        if !self.socket_type.can_send() {
            return Err(TransferError::Socket(format!(
                "{} socket cannot send",
                self.socket_type.as_str()
            )));
        }
        match self.socket_type {
            SocketType::Req if self.awaiting => Err(TransferError::Socket(
                "req socket already has a request in flight".to_string(),
            )),
            SocketType::Rep if !self.awaiting => Err(TransferError::Socket(
                "rep socket has no request to reply to".to_string(),
            )),
            _ => Ok(()),
        }
    }

    fn check_receive_state(&self) -> std::result::Result<(), TransferError> {
        if self.closed {
            return Err(TransferError::Socket("socket is closed".to_string()));
        }
        if !self.socket_type.can_receive() {
            return Err(TransferError::Socket(format!(
                "{} socket cannot receive",
                self.socket_type.as_str()
            )));
        }
        match self.socket_type {
            SocketType::Req if !self.awaiting => Err(TransferError::Socket(
                "req socket has no request in flight".to_string(),
            )),
            SocketType::Rep if self.awaiting => Err(TransferError::Socket(
                "rep socket owes a reply before receiving".to_string(),
            )),
            _ => Ok(()),
        }
    }

    fn after_send(&mut self, peer_index: usize) {
        match self.socket_type {
            SocketType::Req => {
                self.sticky_peer = peer_index;
                self.awaiting = true;
            }
            SocketType::Rep => {
                self.awaiting = false;
            }
            _ => {}
        }
    }

    fn after_receive(&mut self, peer_index: usize) {
        match self.socket_type {
            SocketType::Req => {
                self.awaiting = false;
            }
            SocketType::Rep => {
                self.sticky_peer = peer_index;
                self.awaiting = true;
            }
            _ => {}
        }
    }

    /// Peers this socket may receive from right now.
    fn receive_candidates(&self) -> Vec<usize> {
        match self.socket_type {
            // A req socket only listens to the peer it asked.
            SocketType::Req => {
                if self.peers.is_empty() {
                    Vec::new()
                } else {
                    vec![self.sticky_peer.min(self.peers.len() - 1)]
                }
            }
            _ => {
                let n = self.peers.len();
                (0..n).map(|i| (self.next_recv_peer + i) % n).collect()
            }
        }
    }

    fn send_payload(
        &mut self,
        payload: &[u8],
        timeout_ms: i64,
    ) -> std::result::Result<usize, TransferError> {
        let start = Instant::now();
        loop {
            self.process_events();

            if let Some(index) = self.pick_send_peer() {
                match self.write_frame(index, payload) {
                    FrameOutcome::Done => return Ok(index),
                    FrameOutcome::NotReady => {}
                    FrameOutcome::PeerGone => {
                        debug!("dropping dead peer on socket {}", self.id);
                        self.drop_peer(index);
                        continue;
                    }
                }
            }

            self.check_wait(timeout_ms, start, libc::POLLOUT)?;
        }
    }

    fn receive_payload(
        &mut self,
        timeout_ms: i64,
    ) -> std::result::Result<(usize, Vec<u8>), TransferError> {
        let start = Instant::now();
        loop {
            self.process_events();

            let candidates = self.receive_candidates();
            let mut dead: Option<usize> = None;
            for index in candidates {
                if !poll_one(self.peers[index].stream.as_raw_fd(), libc::POLLIN, 0) {
                    continue;
                }
                match self.read_frame(index) {
                    (FrameOutcome::Done, payload) => {
                        self.next_recv_peer = (index + 1) % self.peers.len().max(1);
                        return Ok((index, payload));
                    }
                    (FrameOutcome::NotReady, _) => {}
                    (FrameOutcome::PeerGone, _) => {
                        dead = Some(index);
                        break;
                    }
                }
            }
            if let Some(index) = dead {
                debug!("dropping dead peer on socket {}", self.id);
                self.drop_peer(index);
                continue;
            }

            self.check_wait(timeout_ms, start, libc::POLLIN)?;
        }
    }

    // --- transfers --------------------------------------------------------

    /// Send one message: transmits its metadata header (padded to the
    /// configured minimum) and transfers buffer ownership to the wire.
    /// Returns the payload size.
    pub fn send(&mut self, msg: &mut Message, timeout_ms: i64) -> TransferResult {
        self.check_send_state()?;

        let payload_len = self.metadata_msg_size.max(MetaHeader::WIRE_SIZE);
        let mut payload = vec![0u8; payload_len];
        msg.meta().write_to(&mut payload[..MetaHeader::WIRE_SIZE]);

        let peer_index = self.send_payload(&payload, timeout_ms)?;

        msg.set_queued();
        self.after_send(peer_index);
        let size = msg.size() as u64;
        self.messages_tx += 1;
        self.bytes_tx += size;
        Ok(size)
    }

    /// Receive one message, rebuilding it from the metadata header.
    /// Returns the payload size.
    pub fn receive(&mut self, msg: &mut Message, timeout_ms: i64) -> TransferResult {
        self.check_receive_state()?;

        let (peer_index, payload) = self.receive_payload(timeout_ms)?;
        if payload.len() < MetaHeader::WIRE_SIZE {
            return Err(TransferError::Socket(format!(
                "received message is not a valid shared memory metadata message: expected minimum size of {} bytes, received {}",
                MetaHeader::WIRE_SIZE,
                payload.len()
            )));
        }

        msg.set_meta(MetaHeader::read_from(&payload[..MetaHeader::WIRE_SIZE]));
        self.after_receive(peer_index);
        let size = msg.size() as u64;
        self.messages_rx += 1;
        self.bytes_rx += size;
        Ok(size)
    }

    /// Send a multi-part message as one atomic frame:
    /// `[n | MetaHeader_1 | … | MetaHeader_n | padding]`.
    /// Returns the summed payload size.
    pub fn send_vec(&mut self, msgs: &mut [Message], timeout_ms: i64) -> TransferResult {
        self.check_send_state()?;
        if msgs.is_empty() {
            return Err(TransferError::Socket("empty message vector".to_string()));
        }

        let needed = 8 + msgs.len() * MetaHeader::WIRE_SIZE;
        let payload_len = self.metadata_msg_size.max(needed);
        let mut payload = vec![0u8; payload_len];
        payload[..8].copy_from_slice(&(msgs.len() as u64).to_ne_bytes());
        for (i, msg) in msgs.iter().enumerate() {
            let at = 8 + i * MetaHeader::WIRE_SIZE;
            msg.meta().write_to(&mut payload[at..at + MetaHeader::WIRE_SIZE]);
        }

        let peer_index = self.send_payload(&payload, timeout_ms)?;

        let mut total = 0u64;
        for msg in msgs.iter_mut() {
            msg.set_queued();
            total += msg.size() as u64;
        }
        self.after_send(peer_index);
        self.messages_tx += 1;
        self.bytes_tx += total;
        Ok(total)
    }

    /// Receive a multi-part frame, appending one rebuilt message per part.
    /// Returns the summed payload size.
    pub fn receive_vec(&mut self, msgs: &mut Vec<Message>, timeout_ms: i64) -> TransferResult {
        self.check_receive_state()?;

        let (peer_index, payload) = self.receive_payload(timeout_ms)?;
        if payload.len() < 8 {
            return Err(TransferError::Socket(
                "received multi-part frame is too short".to_string(),
            ));
        }
        let n = u64::from_ne_bytes(payload[..8].try_into().unwrap()) as usize;
        if n > MAX_FRAME_SIZE / MetaHeader::WIRE_SIZE {
            return Err(TransferError::Socket(format!(
                "received multi-part frame claims an implausible part count {n}"
            )));
        }
        if payload.len() < 8 + n * MetaHeader::WIRE_SIZE {
            return Err(TransferError::Socket(format!(
                "received multi-part frame of {} bytes cannot hold {n} headers",
                payload.len()
            )));
        }

        let mut total = 0u64;
        msgs.reserve(n);
        for i in 0..n {
            let at = 8 + i * MetaHeader::WIRE_SIZE;
            let meta = MetaHeader::read_from(&payload[at..at + MetaHeader::WIRE_SIZE]);
            let msg = Message::from_meta(Arc::clone(&self.manager), meta);
            total += msg.size() as u64;
            msgs.push(msg);
        }
        self.after_receive(peer_index);
        self.messages_rx += 1;
        self.bytes_rx += total;
        Ok(total)
    }

    // --- options & stats --------------------------------------------------

    pub fn set_linger(&mut self, value: i32) {
        self.linger_ms = value;
    }

    pub fn linger(&self) -> i32 {
        self.linger_ms
    }

    pub fn set_snd_buf_size(&mut self, value: i32) {
        self.snd_buf_size = value;
    }

    pub fn snd_buf_size(&self) -> i32 {
        self.snd_buf_size
    }

    pub fn set_rcv_buf_size(&mut self, value: i32) {
        self.rcv_buf_size = value;
    }

    pub fn rcv_buf_size(&self) -> i32 {
        self.rcv_buf_size
    }

    pub fn set_snd_kernel_size(&mut self, value: i32) {
        self.snd_kernel_size = value;
        let streams: Vec<RawFd> = self.peers.iter().map(|p| p.stream.as_raw_fd()).collect();
        for fd in streams {
            unsafe {
                libc::setsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    libc::SO_SNDBUF,
                    &self.snd_kernel_size as *const i32 as *const libc::c_void,
                    std::mem::size_of::<i32>() as libc::socklen_t,
                );
            }
        }
    }

    pub fn snd_kernel_size(&self) -> i32 {
        self.snd_kernel_size
    }

    pub fn set_rcv_kernel_size(&mut self, value: i32) {
        self.rcv_kernel_size = value;
        let streams: Vec<RawFd> = self.peers.iter().map(|p| p.stream.as_raw_fd()).collect();
        for fd in streams {
            unsafe {
                libc::setsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    libc::SO_RCVBUF,
                    &self.rcv_kernel_size as *const i32 as *const libc::c_void,
                    std::mem::size_of::<i32>() as libc::socklen_t,
                );
            }
        }
    }

    pub fn rcv_kernel_size(&self) -> i32 {
        self.rcv_kernel_size
    }

    /// Current readiness: (input pending, output possible).
    pub fn events(&mut self) -> (bool, bool) {
        self.process_events();
        let mut input = false;
        let mut output = false;
        for peer in &self.peers {
            let fd = peer.stream.as_raw_fd();
            if poll_one(fd, libc::POLLIN, 0) {
                input = true;
            }
            if poll_one(fd, libc::POLLOUT, 0) {
                output = true;
            }
        }
        (input, output)
    }

    /// Number of currently connected peers.
    pub fn get_number_of_connected_peers(&mut self) -> usize {
        self.process_events();
        self.peers.len()
    }

    pub fn bytes_tx(&self) -> u64 {
        self.bytes_tx
    }

    pub fn bytes_rx(&self) -> u64 {
        self.bytes_rx
    }

    pub fn messages_tx(&self) -> u64 {
        self.messages_tx
    }

    pub fn messages_rx(&self) -> u64 {
        self.messages_rx
    }

    /// Close the socket. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.peers.clear();
        self.listener = None;
        if let Some(path) = self.bound_ipc_path.take() {
            let _ = std::fs::remove_file(&path);
        }
        self.update_registry();
        self.closed = true;
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.close();
    }
}
