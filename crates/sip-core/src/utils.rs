//! Identifier generation for branches, tags and Call-IDs.

use uuid::Uuid;

use crate::types::via::BRANCH_MAGIC_COOKIE;

/// New RFC 3261 branch parameter (`z9hG4bK` + random suffix)
pub fn generate_branch() -> String {
    format!("{}{:016x}", BRANCH_MAGIC_COOKIE, rand::random::<u64>())
}

/// New From/To tag, 32 random bits in hex
pub fn generate_tag() -> String {
    format!("{:08x}", rand::random::<u32>())
}

/// New globally unique Call-ID
pub fn generate_call_id() -> String {
    Uuid::new_v4().simple().to_string()
}
