//! Tar-format selector: picks the narrowest tar header format
//! (POSIX USTAR vs PAX) that can represent a rewritten layer losslessly.

use std::path::Path;

/// The header format a rewritten layer should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TarFormat {
    /// POSIX USTAR. Preferred: no extended-header overhead.
    Ustar,
    /// PAX extended headers. Required when any member exceeds a USTAR limit.
    Pax,
}

/// USTAR's maximum basename length (the `name` field).
const USTAR_MAX_NAME: usize = 100;
/// USTAR's maximum prefix length (the `prefix` field, joined to `name` with `/`).
const USTAR_MAX_PREFIX: usize = 155;
/// USTAR's maximum symlink target length.
const USTAR_MAX_LINKNAME: usize = 100;
/// USTAR's maximum representable file size (8 GiB, the classic octal-field limit).
const USTAR_MAX_SIZE: u64 = 8 * 1024 * 1024 * 1024;
/// USTAR's maximum uid/gid (2^21 - 1, the classic octal-field limit for those fields).
const USTAR_MAX_ID: u64 = (1 << 21) - 1;

/// One tar member's relevant metadata, as read off a (post-transform) entry.
/// Constructed by the caller (the rewriting filter/writer) from whatever tar
/// crate's entry type it's iterating.
#[derive(Debug, Clone)]
pub struct MemberInfo<'a> {
    /// The member's path within the archive.
    pub path: &'a Path,
    /// The symlink target, if this member is a symlink.
    pub link_name: Option<&'a Path>,
    /// The member's size in bytes.
    pub size: u64,
    /// The member's uid.
    pub uid: u64,
    /// The member's gid.
    pub gid: u64,
}

/// Whether a single member can be represented in USTAR.
fn ustar_representable(member: &MemberInfo<'_>) -> bool {
    let path_str = member.path.to_string_lossy();
    if !path_str.is_ascii() {
        return false;
    }

    if path_str.len() > USTAR_MAX_PREFIX + USTAR_MAX_NAME + 1 {
        return false;
    }

    // USTAR can split a long path at a `/` into a <=155-byte prefix and a
    // <=100-byte name. A path that fits entirely within 100 bytes needs no split.
    if path_str.len() > USTAR_MAX_NAME && !has_valid_ustar_split(&path_str) {
        return false;
    }

    if let Some(basename) = member.path.file_name() {
        if basename.len() > USTAR_MAX_NAME {
            return false;
        }
    }

    if let Some(link) = member.link_name {
        let link_str = link.to_string_lossy();
        if !link_str.is_ascii() || link_str.len() > USTAR_MAX_LINKNAME {
            return false;
        }
    }

    if member.size >= USTAR_MAX_SIZE {
        return false;
    }

    if member.uid >= USTAR_MAX_ID || member.gid >= USTAR_MAX_ID {
        return false;
    }

    true
}

/// Whether `path` has a `/`-delimited split point leaving a prefix of at most
/// 155 bytes and a name of at most 100 bytes.
fn has_valid_ustar_split(path: &str) -> bool {
    let bytes = path.as_bytes();
    for (i, b) in bytes.iter().enumerate() {
        if *b != b'/' {
            continue;
        }
        let prefix_len = i;
        let name_len = bytes.len() - i - 1;
        if prefix_len <= USTAR_MAX_PREFIX && name_len > 0 && name_len <= USTAR_MAX_NAME {
            return true;
        }
    }
    false
}

/// Pre-scan a (post-transform) member list and choose the narrowest format
/// that represents every member losslessly. Short-circuits to PAX on the
/// first disqualifying member.
pub fn select_format<'a>(members: impl IntoIterator<Item = MemberInfo<'a>>) -> TarFormat {
    for member in members {
        if !ustar_representable(&member) {
            return TarFormat::Pax;
        }
    }
    TarFormat::Ustar
}

/// Outer tarballs (sink-produced containers whose member names are short
/// content-addressed hashes) always use USTAR without scanning.
pub fn outer_format() -> TarFormat {
    TarFormat::Ustar
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn member(path: &str, size: u64) -> MemberInfo<'_> {
        MemberInfo {
            path: Path::new(path),
            link_name: None,
            size,
            uid: 0,
            gid: 0,
        }
    }

    #[test]
    fn short_paths_choose_ustar() {
        let members = vec![member("usr/bin/sh", 100), member("etc/passwd", 200)];
        assert_eq!(select_format(members), TarFormat::Ustar);
    }

    #[test]
    fn long_basename_forces_pax() {
        let long_name = "a".repeat(120);
        let path = PathBuf::from(format!("usr/{long_name}"));
        let members = vec![MemberInfo {
            path: &path,
            link_name: None,
            size: 10,
            uid: 0,
            gid: 0,
        }];
        assert_eq!(select_format(members), TarFormat::Pax);
    }

    #[test]
    fn large_file_forces_pax() {
        let members = vec![member("big.bin", 9 * 1024 * 1024 * 1024)];
        assert_eq!(select_format(members), TarFormat::Pax);
    }

    #[test]
    fn large_uid_forces_pax() {
        let members = vec![MemberInfo {
            path: Path::new("file"),
            link_name: None,
            size: 1,
            uid: 1 << 22,
            gid: 0,
        }];
        assert_eq!(select_format(members), TarFormat::Pax);
    }

    #[test]
    fn non_ascii_name_forces_pax() {
        let members = vec![member("usr/bin/caf\u{e9}", 1)];
        assert_eq!(select_format(members), TarFormat::Pax);
    }

    #[test]
    fn long_path_with_valid_split_stays_ustar() {
        // 130-byte prefix (<=155) + '/' + 9-byte name (<=100), 140 bytes total (>100).
        let prefix = "a".repeat(130);
        let path = PathBuf::from(format!("{prefix}/short.txt"));
        let members = vec![MemberInfo {
            path: &path,
            link_name: None,
            size: 1,
            uid: 0,
            gid: 0,
        }];
        assert_eq!(select_format(members), TarFormat::Ustar);
    }

    #[test]
    fn outer_is_always_ustar() {
        assert_eq!(outer_format(), TarFormat::Ustar);
    }
}
