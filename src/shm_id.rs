// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Session identity and shared-object naming.
// A session is a per-user namespace: the canonical id is a truncated
// SHA-256 over `uid || session name`, short enough to compose into POSIX
// shm names under the length limits of some platforms.

use sha2::{Digest, Sha256};

/// Number of hex digits kept from the session hash.
const SHM_ID_LEN: usize = 8;

/// Derive the session shm id from a session name and a user id.
pub fn build_shm_id_from_session_and_uid(session: &str, uid: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(uid.to_string().as_bytes());
    hasher.update(session.as_bytes());
    let digest = hasher.finalize();
    let mut id = String::with_capacity(SHM_ID_LEN);
    for byte in digest.iter().take(SHM_ID_LEN / 2) {
        id.push_str(&format!("{byte:02x}"));
    }
    id
}

/// Derive the session shm id for the effective user of this process.
pub fn build_shm_id(session: &str) -> String {
    build_shm_id_from_session_and_uid(session, effective_uid())
}

/// 64-bit integer form of the session id, used as a region-cache key.
pub fn build_shm_id_u64(session: &str, uid: u32) -> u64 {
    let id = build_shm_id_from_session_and_uid(session, uid);
    u64::from_str_radix(&id, 16).unwrap_or(0)
}

/// Effective user id of the calling process.
pub fn effective_uid() -> u32 {
    #[cfg(unix)]
    unsafe {
        libc::geteuid() as u32
    }
    #[cfg(not(unix))]
    0
}

/// Name of a session-scoped shared object, e.g. `fmq_ab12cd34_mng`.
pub fn shm_name(shm_id: &str, suffix: &str) -> String {
    format!("fmq_{shm_id}_{suffix}")
}

/// Name of an id-carrying shared object, e.g. `fmq_ab12cd34_m_0`.
pub fn shm_name_id(shm_id: &str, suffix: &str, id: u16) -> String {
    format!("fmq_{shm_id}_{suffix}_{id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shm_id_is_short_hex() {
        let id = build_shm_id_from_session_and_uid("demo", 1000);
        assert_eq!(id.len(), SHM_ID_LEN);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn shm_id_is_deterministic() {
        let a = build_shm_id_from_session_and_uid("demo", 1000);
        let b = build_shm_id_from_session_and_uid("demo", 1000);
        assert_eq!(a, b);
    }

    #[test]
    fn shm_id_separates_users_and_sessions() {
        let a = build_shm_id_from_session_and_uid("demo", 1000);
        let b = build_shm_id_from_session_and_uid("demo", 1001);
        let c = build_shm_id_from_session_and_uid("demo2", 1000);
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn shm_id_u64_matches_hex_form() {
        let id = build_shm_id_from_session_and_uid("demo", 1000);
        let id64 = build_shm_id_u64("demo", 1000);
        assert_eq!(u64::from_str_radix(&id, 16).unwrap(), id64);
    }

    #[test]
    fn object_names() {
        assert_eq!(shm_name("ab12cd34", "mng"), "fmq_ab12cd34_mng");
        assert_eq!(shm_name_id("ab12cd34", "m", 0), "fmq_ab12cd34_m_0");
        assert_eq!(shm_name_id("ab12cd34", "rgq", 1024), "fmq_ab12cd34_rgq_1024");
    }
}
