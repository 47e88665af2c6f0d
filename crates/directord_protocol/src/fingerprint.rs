//! SHA3-224 fingerprints over job content and files.
//!
//! A job fingerprint is computed over the canonical JSON form of the item
//! with the id fields removed, so two submissions with identical normalized
//! content always hash identically regardless of assigned ids.

use crate::{JobItem, ProtocolError};
use serde_json::Value;
use sha3::{Digest, Sha3_224};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Keys stripped before hashing a job item: the assigned ids plus the
/// submission-side controls that must not perturb content identity
/// (restrict filters are expressed in terms of the resulting hash).
const STRIP_KEYS: [&str; 6] = [
    "job_id",
    "job_sha3_224",
    "parent_id",
    "parent_sha3_224",
    "restrict",
    "skip_cache",
];

/// Hash an arbitrary JSON value.
///
/// serde_json serializes object keys in sorted order, which makes the
/// serialized form canonical.
pub fn object_sha3_224(value: &Value) -> String {
    let serialized = value.to_string();
    let mut hasher = Sha3_224::new();
    hasher.update(serialized.as_bytes());
    hex_digest(hasher)
}

/// Fingerprint a job item, ignoring its id fields.
pub fn job_sha3_224(job: &JobItem) -> Result<String, ProtocolError> {
    let mut value = serde_json::to_value(job)?;
    if let Value::Object(map) = &mut value {
        for key in STRIP_KEYS {
            map.remove(key);
        }
    }
    Ok(object_sha3_224(&value))
}

/// Hash a file's content in transfer-sized chunks.
pub fn file_sha3_224(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha3_224::new();
    let mut buffer = vec![0u8; crate::TRANSFER_CHUNK_SIZE];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex_digest(hasher))
}

fn hex_digest(hasher: Sha3_224) -> String {
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::VerbPayload;
    use std::io::Write;

    fn run_job(command: &str) -> JobItem {
        JobItem::new(VerbPayload::Run {
            command: command.to_string(),
            no_block: false,
        })
    }

    #[test]
    fn test_ids_do_not_affect_fingerprint() {
        let mut a = run_job("echo hi");
        let mut b = run_job("echo hi");
        a.job_id = "one".to_string();
        a.parent_id = "p-one".to_string();
        b.job_id = "two".to_string();
        b.parent_id = "p-two".to_string();

        assert_eq!(job_sha3_224(&a).unwrap(), job_sha3_224(&b).unwrap());
    }

    #[test]
    fn test_content_changes_fingerprint() {
        let a = run_job("echo hi");
        let b = run_job("echo bye");
        assert_ne!(job_sha3_224(&a).unwrap(), job_sha3_224(&b).unwrap());
    }

    #[test]
    fn test_restrict_and_skip_cache_do_not_perturb() {
        let plain = run_job("echo hi");
        let mut controlled = run_job("echo hi");
        controlled.skip_cache = true;
        controlled.restrict = Some(vec!["aabbcc".to_string()]);
        assert_eq!(
            job_sha3_224(&plain).unwrap(),
            job_sha3_224(&controlled).unwrap()
        );
    }

    #[test]
    fn test_fingerprint_is_sha3_224_hex() {
        let sha = job_sha3_224(&run_job("true")).unwrap();
        assert_eq!(sha.len(), 56);
        assert!(sha.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_object_hash_is_key_order_independent() {
        let a: Value = serde_json::from_str(r#"{"x":1,"y":2}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"y":2,"x":1}"#).unwrap();
        assert_eq!(object_sha3_224(&a), object_sha3_224(&b));
    }

    #[test]
    fn test_file_fingerprint() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"directord").unwrap();
        let first = file_sha3_224(file.path()).unwrap();
        let second = file_sha3_224(file.path()).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 56);
    }
}
