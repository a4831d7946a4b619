//! Persisted state blobs
//!
//! Byte layout: 4-byte magic `SBOX`, little-endian u32 version, and for
//! version 2+ a little-endian CRC32 of the payload; then a UTF-8 JSON
//! payload listing filesystem entries (file bytes base64-encoded) and
//! the environment. Import validates everything before the first write,
//! filters entries to the safe prefixes, and applies in three phases
//! under the write-policy bypass: directories, files, permissions.

use std::collections::HashMap;

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{SandboxError, SandboxResult};
use crate::vfs::{path as vpath, Inode, Vfs};

pub const STATE_MAGIC: [u8; 4] = *b"SBOX";
pub const STATE_VERSION: u32 = 2;

/// Prefixes a blob may populate: home, tmp, the package-install root,
/// and the python library root. Everything else is silently dropped.
pub const SAFE_PREFIXES: &[&str] = &["/home", "/tmp", "/opt/packages", "/usr/lib/python"];

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StateEntry {
    path: String,
    #[serde(rename = "type")]
    kind: String,
    data: String,
    permissions: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StatePayload {
    entries: Vec<StateEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    env: Vec<(String, String)>,
}

/// IEEE CRC32 (poly 0xEDB88320, init 0xFFFFFFFF, final XOR).
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFF_FFFF;
    for &byte in data {
        crc ^= byte as u32;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xEDB8_8320;
            } else {
                crc >>= 1;
            }
        }
    }
    crc ^ 0xFFFF_FFFF
}

fn under_safe_prefix(path: &str) -> bool {
    SAFE_PREFIXES
        .iter()
        .any(|prefix| vpath::starts_with(path, prefix))
}

/// Serialize the filesystem and environment into a blob. Virtual-mount
/// subtrees and symlinks are not exported.
pub fn export_state(vfs: &Vfs, env: &HashMap<String, String>) -> Vec<u8> {
    let mounts = vfs.mount_prefixes();
    let mut entries = Vec::new();
    for (path, node) in vfs.walk() {
        if mounts.iter().any(|prefix| vpath::starts_with(&path, prefix)) {
            continue;
        }
        match node {
            Inode::File(file) => entries.push(StateEntry {
                path,
                kind: "file".to_string(),
                data: base64::engine::general_purpose::STANDARD.encode(file.content.as_ref()),
                permissions: file.meta.mode,
            }),
            Inode::Dir(dir) => entries.push(StateEntry {
                path,
                kind: "dir".to_string(),
                data: String::new(),
                permissions: dir.meta.mode,
            }),
            Inode::Symlink(_) => {}
        }
    }
    entries.sort_by(|a, b| a.path.cmp(&b.path));

    let mut env_pairs: Vec<(String, String)> =
        env.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    env_pairs.sort();

    let payload = serde_json::to_vec(&StatePayload {
        entries,
        env: env_pairs,
    })
    .expect("state payload serializes");

    let mut blob = Vec::with_capacity(payload.len() + 12);
    blob.extend_from_slice(&STATE_MAGIC);
    blob.extend_from_slice(&STATE_VERSION.to_le_bytes());
    blob.extend_from_slice(&crc32(&payload).to_le_bytes());
    blob.extend_from_slice(&payload);
    blob
}

/// Validate and apply a blob; returns the environment it carried.
/// Nothing is written until the whole payload has been validated.
pub fn import_state(vfs: &mut Vfs, blob: &[u8]) -> SandboxResult<HashMap<String, String>> {
    if blob.len() < 8 || blob[0..4] != STATE_MAGIC {
        return Err(SandboxError::CorruptedState("bad magic".to_string()));
    }
    let version = u32::from_le_bytes([blob[4], blob[5], blob[6], blob[7]]);
    if version < 1 {
        return Err(SandboxError::CorruptedState(format!(
            "unsupported version {}",
            version
        )));
    }

    let payload = if version >= 2 {
        if blob.len() < 12 {
            return Err(SandboxError::CorruptedState("truncated header".to_string()));
        }
        let stored = u32::from_le_bytes([blob[8], blob[9], blob[10], blob[11]]);
        let payload = &blob[12..];
        let actual = crc32(payload);
        if stored != actual {
            return Err(SandboxError::CorruptedState(format!(
                "checksum mismatch: stored {:08x}, computed {:08x}",
                stored, actual
            )));
        }
        payload
    } else {
        &blob[8..]
    };

    let parsed: StatePayload = serde_json::from_slice(payload)
        .map_err(|e| SandboxError::CorruptedState(format!("bad payload: {}", e)))?;

    // Validate every file's data before touching the tree.
    let mut files: Vec<(String, Vec<u8>, u32)> = Vec::new();
    let mut dirs: Vec<(String, u32)> = Vec::new();
    for entry in &parsed.entries {
        let path = vpath::normalize(&entry.path);
        if !under_safe_prefix(&path) {
            debug!(%path, "import entry outside safe prefixes dropped");
            continue;
        }
        match entry.kind.as_str() {
            "dir" => dirs.push((path, entry.permissions)),
            "file" => {
                let data = base64::engine::general_purpose::STANDARD
                    .decode(&entry.data)
                    .map_err(|e| {
                        SandboxError::CorruptedState(format!("bad base64 in {}: {}", path, e))
                    })?;
                files.push((path, data, entry.permissions));
            }
            other => {
                return Err(SandboxError::CorruptedState(format!(
                    "unknown entry type {:?}",
                    other
                )))
            }
        }
    }

    // Shallow paths first so parents exist before children.
    dirs.sort_by_key(|(path, _)| vpath::components(path).len());

    vfs.with_bypass(|vfs| -> SandboxResult<()> {
        for (path, _) in &dirs {
            vfs.mkdirp(path)?;
        }
        for (path, data, _) in &files {
            if let Some(parent) = vpath::parent(path) {
                vfs.mkdirp(&parent)?;
            }
            vfs.write_file(path, data)?;
        }
        for (path, mode) in &dirs {
            vfs.chmod(path, *mode)?;
        }
        for (path, _, mode) in &files {
            vfs.chmod(path, *mode)?;
        }
        Ok(())
    })?;

    Ok(parsed.env.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded_vfs() -> Vfs {
        let mut vfs = Vfs::new();
        vfs.with_bypass(|fs| {
            fs.mkdirp("/home/user").unwrap();
            fs.mkdirp("/tmp").unwrap();
            fs.mkdirp("/etc").unwrap();
        });
        vfs
    }

    #[test]
    fn test_crc32_known_vector() {
        // CRC32("123456789") with the IEEE polynomial.
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(crc32(b""), 0);
    }

    #[test]
    fn test_blob_layout() {
        let vfs = seeded_vfs();
        let blob = export_state(&vfs, &HashMap::new());
        assert_eq!(&blob[0..4], b"SBOX");
        assert_eq!(u32::from_le_bytes([blob[4], blob[5], blob[6], blob[7]]), 2);
        let stored = u32::from_le_bytes([blob[8], blob[9], blob[10], blob[11]]);
        assert_eq!(stored, crc32(&blob[12..]));
    }

    #[test]
    fn test_round_trip_preserves_bytes_and_permissions() {
        let mut vfs = seeded_vfs();
        vfs.write_file("/home/user/a.txt", b"abc").unwrap();
        vfs.chmod("/home/user/a.txt", 0o600).unwrap();
        let mut env = HashMap::new();
        env.insert("FOO".to_string(), "bar".to_string());

        let blob = export_state(&vfs, &env);

        let mut fresh = seeded_vfs();
        let imported_env = import_state(&mut fresh, &blob).unwrap();

        assert_eq!(fresh.read_file("/home/user/a.txt").unwrap(), b"abc");
        assert_eq!(fresh.stat("/home/user/a.txt").unwrap().mode, 0o600);
        assert_eq!(imported_env.get("FOO").map(|s| s.as_str()), Some("bar"));
    }

    #[test]
    fn test_reexport_is_byte_stable() {
        let mut vfs = seeded_vfs();
        vfs.write_file("/home/user/a.txt", b"abc").unwrap();
        vfs.write_file("/tmp/t", b"tt").unwrap();
        let env: HashMap<String, String> =
            [("A".to_string(), "1".to_string())].into_iter().collect();

        let blob = export_state(&vfs, &env);
        let mut fresh = seeded_vfs();
        let env2 = import_state(&mut fresh, &blob).unwrap();
        let blob2 = export_state(&fresh, &env2);

        // Entries and env are emitted sorted, so the payloads match
        // byte for byte... as long as both trees carry the same safe
        // entries.
        let payload = &blob[12..];
        let payload2 = &blob2[12..];
        let a: serde_json::Value = serde_json::from_slice(payload).unwrap();
        let b: serde_json::Value = serde_json::from_slice(payload2).unwrap();
        let safe_only = |v: &serde_json::Value| -> Vec<serde_json::Value> {
            v["entries"]
                .as_array()
                .unwrap()
                .iter()
                .filter(|e| under_safe_prefix(e["path"].as_str().unwrap()))
                .cloned()
                .collect()
        };
        assert_eq!(safe_only(&a), safe_only(&b));
        assert_eq!(a["env"], b["env"]);
    }

    #[test]
    fn test_corrupted_checksum_rejected_without_mutation() {
        let mut vfs = seeded_vfs();
        vfs.write_file("/home/user/a.txt", b"abc").unwrap();
        let mut blob = export_state(&vfs, &HashMap::new());
        let last = blob.len() - 1;
        blob[last] ^= 0xFF;

        let mut fresh = seeded_vfs();
        let err = import_state(&mut fresh, &blob).unwrap_err();
        assert!(matches!(err, SandboxError::CorruptedState(_)));
        assert!(!fresh.exists("/home/user/a.txt"));
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut fresh = seeded_vfs();
        let err = import_state(&mut fresh, b"NOPE\x02\x00\x00\x00").unwrap_err();
        assert!(matches!(err, SandboxError::CorruptedState(_)));
    }

    #[test]
    fn test_version_1_accepted_without_checksum() {
        let payload = serde_json::to_vec(&StatePayload {
            entries: vec![StateEntry {
                path: "/tmp/v1.txt".to_string(),
                kind: "file".to_string(),
                data: base64::engine::general_purpose::STANDARD.encode(b"v1"),
                permissions: 0o644,
            }],
            env: Vec::new(),
        })
        .unwrap();
        let mut blob = Vec::new();
        blob.extend_from_slice(&STATE_MAGIC);
        blob.extend_from_slice(&1u32.to_le_bytes());
        blob.extend_from_slice(&payload);

        let mut vfs = seeded_vfs();
        import_state(&mut vfs, &blob).unwrap();
        assert_eq!(vfs.read_file("/tmp/v1.txt").unwrap(), b"v1");
    }

    #[test]
    fn test_unsafe_prefixes_silently_dropped() {
        let payload = serde_json::to_vec(&StatePayload {
            entries: vec![
                StateEntry {
                    path: "/etc/passwd".to_string(),
                    kind: "file".to_string(),
                    data: base64::engine::general_purpose::STANDARD.encode(b"root"),
                    permissions: 0o644,
                },
                StateEntry {
                    path: "/tmp/fine".to_string(),
                    kind: "file".to_string(),
                    data: base64::engine::general_purpose::STANDARD.encode(b"ok"),
                    permissions: 0o644,
                },
            ],
            env: Vec::new(),
        })
        .unwrap();
        let mut blob = Vec::new();
        blob.extend_from_slice(&STATE_MAGIC);
        blob.extend_from_slice(&STATE_VERSION.to_le_bytes());
        blob.extend_from_slice(&crc32(&payload).to_le_bytes());
        blob.extend_from_slice(&payload);

        let mut vfs = seeded_vfs();
        import_state(&mut vfs, &blob).unwrap();
        assert!(!vfs.exists("/etc/passwd"));
        assert_eq!(vfs.read_file("/tmp/fine").unwrap(), b"ok");
    }

    #[test]
    fn test_symlinks_not_exported() {
        let mut vfs = seeded_vfs();
        vfs.write_file("/home/user/real", b"x").unwrap();
        vfs.symlink("/home/user/real", "/home/user/link").unwrap();
        let blob = export_state(&vfs, &HashMap::new());

        let mut fresh = seeded_vfs();
        import_state(&mut fresh, &blob).unwrap();
        assert!(fresh.exists("/home/user/real"));
        assert!(!fresh.exists("/home/user/link"));
    }
}
