use anyhow::{Context, Result};
use memmap2::Mmap;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Content address of an archive: lowercase hex SHA-256 of the raw bytes.
/// Depends on nothing but the bytes (no file name, no timestamps).
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Compute the BLAKE3 hash of a byte slice.
pub fn hash_bytes(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// Memory-map a file for read-only access.
///
/// # Safety
/// The mapping is read-only. Cache records are written once to a staging
/// directory and never modified after the namespace is committed.
pub fn mmap_file(path: &Path) -> Result<Mmap> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open file: {}", path.display()))?;
    // SAFETY: committed record files are immutable.
    unsafe {
        Mmap::map(&file)
            .with_context(|| format!("Failed to memory-map file: {}", path.display()))
    }
}

/// Collect regular files directly under `dir` with the given extension, sorted.
pub fn list_files_with_extension(dir: &Path, ext: &str) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry =
            entry.with_context(|| format!("Failed to read directory entry in {}", dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        if entry.path().extension().and_then(|e| e.to_str()) == Some(ext) {
            out.push(entry.path().to_path_buf());
        }
    }
    out.sort();
    Ok(out)
}

/// Collect the names of directories directly under `dir`, sorted.
pub fn list_subdirectories(dir: &Path) -> Result<Vec<String>> {
    let mut out = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry =
            entry.with_context(|| format!("Failed to read directory entry in {}", dir.display()))?;
        if !entry.file_type().is_dir() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            out.push(name.to_string());
        }
    }
    out.sort();
    Ok(out)
}

fn is_uri_component_unreserved(b: u8) -> bool {
    b.is_ascii_alphanumeric()
        || matches!(b, b'-' | b'_' | b'.' | b'!' | b'~' | b'*' | b'\'' | b'(' | b')')
}

/// Percent-encode with the same unreserved set as `encodeURIComponent`.
pub fn encode_uri_component(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for &b in input.as_bytes() {
        if is_uri_component_unreserved(b) {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

/// Percent-decode. Returns `None` for truncated escapes or non-UTF-8 output.
pub fn decode_uri_component(input: &str) -> Option<String> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes.get(i + 1..i + 3)?;
            let hex = std::str::from_utf8(hex).ok()?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

/// Encode each `/`-separated segment, keeping the separators.
pub fn encode_path_segments(path: &str) -> String {
    path.split('/')
        .map(encode_uri_component)
        .collect::<Vec<_>>()
        .join("/")
}

/// Make sure a base URL or pathname ends with exactly one trailing slash.
pub fn with_trailing_slash(base: &str) -> String {
    let trimmed = base.trim_end_matches('/');
    format!("{trimmed}/")
}

/// Lowercase base-36 rendering, like `Number.prototype.toString(36)`.
pub fn to_base36(mut n: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

/// `<prefix><random base36><sep><unix millis base36>`; ids for bridge clients.
pub fn random_client_id(prefix: &str, sep: &str) -> String {
    let random: u64 = rand::thread_rng().gen_range(0..36u64.pow(8));
    let millis = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default();
    format!("{prefix}{}{sep}{}", to_base36(random), to_base36(millis))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_sha256_is_deterministic() {
        let data = vec![7u8; 4096];
        assert_eq!(sha256_hex(&data), sha256_hex(&data.clone()));
        assert_ne!(sha256_hex(&data), sha256_hex(&data[1..]));
    }

    #[test]
    fn test_encode_uri_component_matches_js() {
        assert_eq!(encode_uri_component("a b/c?d"), "a%20b%2Fc%3Fd");
        assert_eq!(encode_uri_component("it's(ok)!~*"), "it's(ok)!~*");
        assert_eq!(encode_uri_component("中"), "%E4%B8%AD");
    }

    #[test]
    fn test_decode_uri_component() {
        assert_eq!(decode_uri_component("a%20b%2Fc").as_deref(), Some("a b/c"));
        assert_eq!(decode_uri_component("%E4%B8%AD").as_deref(), Some("中"));
        assert_eq!(decode_uri_component("%E4%B8"), None);
        assert_eq!(decode_uri_component("%2"), None);
    }

    #[test]
    fn test_encode_path_segments_keeps_slashes() {
        assert_eq!(encode_path_segments("assets/my file.js"), "assets/my%20file.js");
    }

    #[test]
    fn test_with_trailing_slash() {
        assert_eq!(with_trailing_slash("http://x/dist"), "http://x/dist/");
        assert_eq!(with_trailing_slash("http://x/dist//"), "http://x/dist/");
        assert_eq!(with_trailing_slash("/"), "/");
    }

    #[test]
    fn test_base36() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(35), "z");
        assert_eq!(to_base36(36), "10");
        assert_eq!(to_base36(1_700_000_000_000), "loyw3v28");
    }

    #[test]
    fn test_client_ids_are_distinct() {
        let a = random_client_id("hb-client-", "-");
        let b = random_client_id("hb-client-", "-");
        assert!(a.starts_with("hb-client-"));
        assert_eq!(a.matches('-').count(), 3);
        assert_ne!(a, b);
    }
}
