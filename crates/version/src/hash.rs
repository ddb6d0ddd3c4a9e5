//! Version hashing.

use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use serde::Serialize;

/// Characters used to encode version hashes, 5 bits each.
const ALPHABET: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyz012345";
/// Length of an encoded version (8 characters = 40 bits of the hash).
pub const VERSION_LEN: usize = 8;

/// Hash any serializable key into a short, identifier-safe version string.
///
/// The key is serialized as canonical JSON (object keys sorted) before
/// hashing, so structurally equal keys always produce the same version
/// regardless of how they were built.
pub fn version<T: Serialize + ?Sized>(key: &T) -> Result<String> {
    // `Value` objects are `BTreeMap`s, which sorts the keys.
    let canonical = serde_json::to_value(key).or_raise(|| ErrorKind::InvalidKey)?;
    let json = serde_json::to_string(&canonical).or_raise(|| ErrorKind::InvalidKey)?;
    Ok(encode(blake3::hash(json.as_bytes()).as_bytes()))
}

/// Version of raw bytes, for names that aren't derived from a key.
pub(crate) fn short_hash(bytes: &[u8]) -> String {
    encode(blake3::hash(bytes).as_bytes())
}

fn encode(hash: &[u8; 32]) -> String {
    let mut bits = [0u8; 8];
    bits[..5].copy_from_slice(&hash[..5]);
    let mut n = u64::from_le_bytes(bits);
    let mut out = String::with_capacity(VERSION_LEN);
    for _ in 0..VERSION_LEN {
        out.push(char::from(ALPHABET[(n & 31) as usize]));
        n >>= 5;
    }
    out
}

/// Structure version of a build: what the table looks like.
///
/// `definition` is everything that shapes the table (the load query over the
/// full build range, index statements, unique keys); it excludes anything
/// describing *when* the data was loaded.
pub fn structure_version<T: Serialize + ?Sized>(definition: &T) -> Result<String> {
    version(definition)
}

/// Content version of a build: the structure plus the current results of
/// its invalidation key queries.
pub fn content_version<T, K>(definition: &T, invalidation_keys: &K) -> Result<String>
where
    T: Serialize + ?Sized,
    K: Serialize + ?Sized,
{
    version(&(definition, invalidation_keys))
}
