// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Poller: multiplexes readiness across the sub-sockets of one or more
// channels. The events polled per socket follow its pattern — req/rep/pair
// poll both directions, push polls output, pull polls input.

use std::collections::HashMap;

use crate::channel::Channel;
use crate::errors::{Error, Result};
use crate::socket::{FdRegistry, SocketType};

use std::sync::Arc;

struct PollEntry {
    registry: Arc<FdRegistry>,
    socket_type: SocketType,
    input: bool,
    output: bool,
}

fn wanted_events(socket_type: SocketType) -> (bool, bool) {
    match socket_type {
        SocketType::Req | SocketType::Rep | SocketType::Pair => (true, true),
        SocketType::Push => (false, true),
        SocketType::Pull => (true, false),
    }
}

/// Readiness multiplexer over an ordered set of sockets, addressable by
/// flat index or by (channel name, sub-socket index).
pub struct Poller {
    entries: Vec<PollEntry>,
    offsets: HashMap<String, usize>,
}

impl Poller {
    /// Build a poller over the sub-sockets of the given channels, in
    /// order. Duplicate channel names are a configuration error.
    pub fn new(channels: &[&Channel]) -> Result<Self> {
        let mut entries = Vec::new();
        let mut offsets = HashMap::new();

        for channel in channels {
            if offsets.contains_key(channel.name()) {
                return Err(Error::Transport(format!(
                    "duplicate channel '{}' in poller configuration",
                    channel.name()
                )));
            }
            offsets.insert(channel.name().to_string(), entries.len());
            for socket in channel.sockets() {
                entries.push(PollEntry {
                    registry: socket.fd_registry(),
                    socket_type: socket.socket_type(),
                    input: false,
                    output: false,
                });
            }
        }

        Ok(Self { entries, offsets })
    }

    /// Build a poller over `channel_list` entries of `channels`, in list
    /// order. An unknown channel key is a fatal configuration error.
    pub fn from_map(
        channels: &HashMap<String, Channel>,
        channel_list: &[&str],
    ) -> Result<Self> {
        let mut selected = Vec::with_capacity(channel_list.len());
        for name in channel_list {
            let channel = channels.get(*name).ok_or_else(|| {
                Error::Transport(format!(
                    "invalid channel key '{name}' in poller configuration"
                ))
            })?;
            selected.push(channel);
        }
        Self::new(&selected)
    }

    /// Wait up to `timeout_ms` (-1 = infinite) for readiness on any
    /// socket. Returns the number of sockets with events.
    pub fn poll(&mut self, timeout_ms: i64) -> Result<usize> {
        // (entry index, is_listener_fd)
        let mut fds: Vec<libc::pollfd> = Vec::new();
        let mut owners: Vec<(usize, bool)> = Vec::new();

        for (index, entry) in self.entries.iter_mut().enumerate() {
            entry.input = false;
            entry.output = false;
            let (want_in, want_out) = wanted_events(entry.socket_type);
            let mut events: i16 = 0;
            if want_in {
                events |= libc::POLLIN;
            }
            if want_out {
                events |= libc::POLLOUT;
            }

            let snapshot = entry.registry.inner.lock().unwrap();
            for fd in &snapshot.peers {
                fds.push(libc::pollfd {
                    fd: *fd,
                    events,
                    revents: 0,
                });
                owners.push((index, false));
            }
            // A pending connection wakes the poll; the readiness itself is
            // decided by the subsequent transfer call.
            if let Some(listener) = snapshot.listener {
                fds.push(libc::pollfd {
                    fd: listener,
                    events: libc::POLLIN,
                    revents: 0,
                });
                owners.push((index, true));
            }
        }

        if fds.is_empty() {
            if timeout_ms > 0 {
                std::thread::sleep(std::time::Duration::from_millis(timeout_ms as u64));
            }
            return Ok(0);
        }

        let rc = unsafe {
            libc::poll(
                fds.as_mut_ptr(),
                fds.len() as libc::nfds_t,
                timeout_ms as i32,
            )
        };
        if rc < 0 {
            let e = std::io::Error::last_os_error();
            if e.kind() == std::io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(Error::Io(e));
        }

        for (item, (index, is_listener)) in fds.iter().zip(owners.iter()) {
            if item.revents == 0 {
                continue;
            }
            let entry = &mut self.entries[*index];
            if *is_listener {
                if (item.revents & libc::POLLIN) != 0 {
                    entry.input = true;
                }
                continue;
            }
            if (item.revents & libc::POLLIN) != 0 {
                entry.input = true;
            }
            if (item.revents & libc::POLLOUT) != 0 {
                entry.output = true;
            }
        }

        Ok(self
            .entries
            .iter()
            .filter(|e| e.input || e.output)
            .count())
    }

    /// Input readiness of the socket at flat `index`.
    pub fn check_input(&self, index: usize) -> bool {
        self.entries.get(index).map(|e| e.input).unwrap_or(false)
    }

    /// Output readiness of the socket at flat `index`.
    pub fn check_output(&self, index: usize) -> bool {
        self.entries.get(index).map(|e| e.output).unwrap_or(false)
    }

    /// Input readiness of sub-socket `index` of `channel`.
    pub fn check_input_by_name(&self, channel: &str, index: usize) -> Result<bool> {
        let offset = self.offset_of(channel)?;
        Ok(self.check_input(offset + index))
    }

    /// Output readiness of sub-socket `index` of `channel`.
    pub fn check_output_by_name(&self, channel: &str, index: usize) -> Result<bool> {
        let offset = self.offset_of(channel)?;
        Ok(self.check_output(offset + index))
    }

    fn offset_of(&self, channel: &str) -> Result<usize> {
        self.offsets.get(channel).copied().ok_or_else(|| {
            Error::Transport(format!(
                "invalid channel key '{channel}' in poller configuration"
            ))
        })
    }
}
