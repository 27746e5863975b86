// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// A channel is a named collection of sub-sockets. The device maps a name
// (e.g. "data") to a sequence of endpoints; each sub-socket binds or
// connects independently.

use crate::socket::Socket;

pub struct Channel {
    name: String,
    sockets: Vec<Socket>,
}

impl Channel {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            sockets: Vec::new(),
        }
    }

    pub fn with_sockets(name: &str, sockets: Vec<Socket>) -> Self {
        Self {
            name: name.to_string(),
            sockets,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add_socket(&mut self, socket: Socket) {
        self.sockets.push(socket);
    }

    pub fn sockets(&self) -> &[Socket] {
        &self.sockets
    }

    pub fn sockets_mut(&mut self) -> &mut [Socket] {
        &mut self.sockets
    }

    /// Sub-socket at `index`.
    pub fn at(&self, index: usize) -> Option<&Socket> {
        self.sockets.get(index)
    }

    /// Mutable sub-socket at `index`.
    pub fn at_mut(&mut self, index: usize) -> Option<&mut Socket> {
        self.sockets.get_mut(index)
    }

    pub fn len(&self) -> usize {
        self.sockets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }
}
