//! Backend identities for delivery attempts
//!
//! Backends restrict the characters and length of job/task names, and Batch
//! compares task IDs case-insensitively. A message ID that is already a valid
//! name is used as is; any other ID is normalised and suffixed with a digest
//! of the raw ID, so two distinct IDs never share a name.

use sha2::{Digest, Sha256};

const DIGEST_HEX_LEN: usize = 8;

/// Short hex digest of a raw message ID
pub fn id_digest(message_id: &str) -> String {
    let digest = Sha256::digest(message_id.as_bytes());
    hex::encode(&digest[..DIGEST_HEX_LEN / 2])
}

/// Character rules of one backend's names
pub struct NameRules {
    pub max_len: usize,
    /// Characters a name may contain verbatim
    pub allowed: fn(char) -> bool,
    /// Maps any character to an allowed one
    pub normalise: fn(char) -> char,
}

impl NameRules {
    /// `<base>-v<delivery_count>` for one delivery attempt
    pub fn attempt_name(&self, message_id: &str, delivery_count: u32) -> String {
        let suffix = format!("-v{}", delivery_count);

        let verbatim = !message_id.is_empty()
            && !message_id.starts_with('-')
            && message_id.chars().all(self.allowed)
            && message_id.len() + suffix.len() <= self.max_len;
        if verbatim {
            return format!("{}{}", message_id, suffix);
        }

        let digest = id_digest(message_id);
        let mut base: String = message_id
            .chars()
            .map(self.normalise)
            .collect::<String>()
            .trim_start_matches('-')
            .to_string();
        // normalise yields ASCII, so byte truncation stays on a char boundary
        base.truncate(
            self.max_len
                .saturating_sub(suffix.len() + digest.len() + 1),
        );
        let base = base.trim_end_matches('-');

        if base.is_empty() {
            format!("{}{}", digest, suffix)
        } else {
            format!("{}-{}{}", base, digest, suffix)
        }
    }
}
