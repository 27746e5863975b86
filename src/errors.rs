// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Error taxonomy of the shared memory transport.
//
// Fatal conditions surface as `Error`; the transfer path never fails with
// an `Error` directly — `Send`/`Receive` return `TransferError` so that
// timeouts and interruptions stay ordinary, matchable outcomes.

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Failure to open/create shared objects, socket creation, or invalid
    /// configuration. Fatal to the transport factory.
    #[error("transport error: {0}")]
    Transport(String),

    /// The managed segment is out of space and the retry policy is
    /// exhausted.
    #[error("bad alloc: {0}")]
    BadAlloc(String),

    /// Unrecoverable state of a single socket. The socket must be rebuilt;
    /// the factory continues.
    #[error("socket error: {0}")]
    Socket(String),

    /// Message invariant violated (alive-message counter non-zero on reset,
    /// refcount misuse).
    #[error("message error: {0}")]
    Message(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Outcome of a timed or interrupted transfer. Not an error in the fatal
/// sense: `Timeout` and `Interrupted` are expected control-flow results.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Non-blocking or timed mode elapsed without progress.
    #[error("transfer timed out")]
    Timeout,

    /// The transport factory is interrupted.
    #[error("transfer interrupted")]
    Interrupted,

    /// Fatal, the socket remains closed.
    #[error("socket failure: {0}")]
    Socket(String),
}

/// `Ok(n)` carries the payload size in bytes (0 for an empty message).
pub type TransferResult = std::result::Result<u64, TransferError>;
