//! Description fingerprinting for the categorization cache
//!
//! A fingerprint is a SHA-256 over the normalized description plus the
//! construction stage token. Normalization lowercases, collapses whitespace,
//! and strips leading/trailing punctuation so trivial formatting differences
//! share a cache entry.

use sha2::{Digest, Sha256};

/// Normalize a description for fingerprinting and ML feature extraction.
pub fn normalize(description: &str) -> String {
    let lowered = description.to_lowercase();
    let trimmed = lowered
        .trim()
        .trim_matches(|c: char| c.is_ascii_punctuation());
    let mut out = String::with_capacity(trimmed.len());
    let mut last_space = false;
    for c in trimmed.chars() {
        if c.is_whitespace() {
            if !last_space && !out.is_empty() {
                out.push(' ');
                last_space = true;
            }
        } else {
            out.push(c);
            last_space = false;
        }
    }
    while out.ends_with(' ') {
        out.pop();
    }
    out
}

/// Fingerprint over (normalized description, stage).
pub fn fingerprint(description: &str, stage: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize(description).as_bytes());
    hasher.update(b"\n");
    hasher.update(stage.trim().to_lowercase().as_bytes());
    hex(&hasher.finalize())
}

/// SHA-256 of raw file bytes, hex-encoded. Computed exactly once at upload.
pub fn file_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex(&hasher.finalize())
}

/// Hash an in-memory key (cooldowns, attention sessions) so PII never sits
/// in process maps.
pub fn key_hash(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for p in parts {
        hasher.update(p.as_bytes());
        hasher.update(b"\x1f");
    }
    hex(&hasher.finalize())[..16].to_string()
}

fn hex(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{:02x}", b));
    }
    s
}
