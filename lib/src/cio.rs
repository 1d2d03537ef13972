//! Container file system operations.

use std::path::{Path, PathBuf};

use astral_tokio_tar::{Archive, Entry};
use async_tempfile::TempFile;
use bytes::{Bytes, BytesMut};
use color_eyre::{
    eyre::{Context, OptionExt},
    Result,
};
use futures_lite::{Stream, StreamExt};
use os_str_bytes::OsStrBytesExt;
use serde::de::DeserializeOwned;
use tap::Pipe;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::{debug, warn};

use crate::{
    transform::{self, Chunk},
    Digest, FilterMatch, Filters, Layer, LayerMediaType, LayerMediaTypeFlag,
};

/// Unwrap a value, logging an error and performing the provided action if it fails.
macro_rules! unwrap_warn {
    ($expr:expr, $action:expr) => {
        unwrap_warn!($expr, $action,)
    };
    ($expr:expr, $action:expr, $($msg:tt)*) => {
        match $expr {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(error = ?e, $($msg)*);
                $action;
            }
        }
    };
}

/// Hash the specified file on disk.
pub async fn file_digest(path: &Path) -> Result<Digest> {
    use sha2::{Digest as _, Sha256};
    let mut hasher = Sha256::new();
    let mut file = tokio::fs::File::open(path).await.context("open file")?;
    let mut buffer = BytesMut::with_capacity(1024);
    while let Ok(n) = file.read_buf(&mut buffer).await {
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        buffer.clear();
    }

    let hash = hasher.finalize().to_vec();
    Ok(Digest::from_hash(hash))
}

/// Transform an OCI image layer (based on its media type) into its underlying tarball.
/// Foreign layers return `None`.
#[tracing::instrument(skip(stream))]
pub fn peel_layer(
    layer: &Layer,
    stream: impl Stream<Item = Chunk> + Send + Unpin + 'static,
) -> Option<std::pin::Pin<Box<dyn Stream<Item = Chunk> + Send>>> {
    match &layer.media_type {
        LayerMediaType::Oci(flags) => {
            if flags.contains(&LayerMediaTypeFlag::Foreign) {
                warn!("skip: foreign layer");
                return None;
            }

            Some(match flags.as_slice() {
                [] => Box::pin(stream),
                [LayerMediaTypeFlag::Zstd] => Box::pin(transform::zstd(stream)),
                [LayerMediaTypeFlag::Gzip] => Box::pin(transform::gzip(stream)),
                _ => Box::pin(transform::sequence(stream, flags)),
            })
        }
    }
}

/// Sink the stream into a temporary file.
#[tracing::instrument(skip(stream))]
pub async fn collect_tmp<E: std::error::Error + Send + Sync + 'static>(
    mut stream: impl Stream<Item = Result<Bytes, E>> + Unpin,
) -> Result<TempFile> {
    let file = TempFile::new().await.context("create temp file")?;
    let mut writer = BufWriter::new(file);

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("read chunk")?;
        writer.write_all(&chunk).await.context("write chunk")?;
    }
    writer.flush().await.context("flush writer")?;

    let file = writer.into_inner();
    file.sync_all().await.context("sync file")?;
    Ok(file)
}

/// Buffer the contents of a byte stream.
/// Limited to 100MB of memory.
#[tracing::instrument(skip(stream))]
pub async fn collect_buf(stream: impl Stream<Item = Chunk> + Unpin) -> Result<Bytes> {
    let mut read = StreamReader::new(stream.take(100 * 1024 * 1024));
    let mut buf = Vec::new();
    read.read_to_end(&mut buf).await.context("read file")?;
    Ok(Bytes::from(buf))
}

/// Collect the contents of a byte stream and parse them as JSON.
#[tracing::instrument(skip(stream))]
pub async fn collect_json<T: DeserializeOwned>(
    stream: impl Stream<Item = Chunk> + Unpin,
) -> Result<T> {
    let content = collect_buf(stream).await?;
    serde_json::from_slice(&content).context("parse json")
}

/// Read the buffered contents of a specific file out of a tarball, parsed as JSON.
/// Returns `None` if no entry satisfies the closure.
#[tracing::instrument(skip(closure))]
pub async fn extract_json<T: DeserializeOwned>(
    tarball: &Path,
    closure: impl Fn(&Path) -> bool,
) -> Result<Option<T>> {
    match extract_file(tarball, closure).await? {
        Some(stream) => collect_json(stream).await.map(Some),
        None => Ok(None),
    }
}

/// Read the buffered contents of a specific file out of a tarball.
#[tracing::instrument(skip(closure))]
pub async fn extract_file_buf(
    tarball: &Path,
    closure: impl Fn(&Path) -> bool,
) -> Result<Option<Bytes>> {
    match extract_file(tarball, closure).await? {
        Some(stream) => collect_buf(stream).await.map(Some),
        None => Ok(None),
    }
}

/// Read the contents of a specific file out of a tarball as a stream.
/// Returns the contents of the first file for which the closure evaluates to `true`.
#[tracing::instrument(skip(closure))]
pub async fn extract_file(
    tarball: &Path,
    closure: impl Fn(&Path) -> bool,
) -> Result<Option<impl Stream<Item = Chunk>>> {
    let archive = tokio::fs::File::open(tarball)
        .await
        .context("open docker tarball")?;

    let mut archive = Archive::new(archive);
    let mut entries = archive.entries().context("read entries")?;
    while let Some(entry) = entries.next().await {
        let entry = entry.context("read entry")?;
        let path = entry.path().context("read entry path")?.to_path_buf();
        if !closure(&path) {
            continue;
        }

        debug!(?path, "extracting file");
        let stream = ReaderStream::new(entry);
        return Ok(Some(stream));
    }

    Ok(None)
}

/// How a tarball's whiteout markers should be handled during extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyMode {
    /// Preserve whiteout/opaque marker files exactly as they appear in the
    /// tar, unapplied. Used for per-layer views, where a later consumer may
    /// still want to see which paths a layer deleted.
    Literal,
    /// Resolve whiteouts against what has already been applied: a
    /// `.wh.<name>` marker deletes the path it names, and a `.wh..wh..opq`
    /// marker clears everything already written in that directory. Used for
    /// merged views, where layers must be applied in order for this to be
    /// correct.
    Resolved,
}

/// Detect a buffered layer blob's compression by magic bytes and wrap it in a
/// streaming decompressor. Used by sources that have no declared media type
/// to go on (a content-addressable docker-save tarball's `layer.tar` entries,
/// or a daemon export's blobs), as opposed to [`peel_layer`], which trusts a
/// registry-declared media type.
#[tracing::instrument]
pub async fn peel_sniffed(
    path: &Path,
) -> Result<(LayerMediaType, std::pin::Pin<Box<dyn Stream<Item = Chunk> + Send>>)> {
    let mut peek = tokio::fs::File::open(path).await.context("open buffered layer")?;
    let mut prefix = [0u8; 4];
    let n = peek.read(&mut prefix).await.context("peek layer prefix")?;
    let compression = transform::detect_compression(&prefix[..n]);

    let file = tokio::fs::File::open(path).await.context("reopen buffered layer")?;
    let stream: std::pin::Pin<Box<dyn Stream<Item = Chunk> + Send>> = Box::pin(ReaderStream::new(file));
    let (media_type, stream) = match compression {
        transform::Compression::None => (LayerMediaType::oci([]), stream),
        transform::Compression::Gzip => (
            LayerMediaType::oci([LayerMediaTypeFlag::Gzip]),
            Box::pin(transform::gzip(stream)) as _,
        ),
        transform::Compression::Zstd => (
            LayerMediaType::oci([LayerMediaTypeFlag::Zstd]),
            Box::pin(transform::zstd(stream)) as _,
        ),
    };
    Ok((media_type, stream))
}

/// Apply a layer diff tarball to a location on disk.
///
/// `mode` controls whiteout handling: `Literal` leaves whiteout/opaque marker
/// files in place for the caller to interpret later; `Resolved` deletes the
/// paths they name immediately, which is only correct when layers are
/// applied in order.
#[tracing::instrument(skip(stream))]
pub async fn apply_tarball(
    path_filters: &Filters,
    stream: impl Stream<Item = Chunk> + Unpin,
    output: &Path,
    mode: ApplyMode,
) -> Result<()> {
    let reader = StreamReader::new(stream);
    let mut archive = Archive::new(reader);
    let mut entries = archive.entries().context("read entries from tar")?;

    while let Some(entry) = entries.next().await {
        let mut entry = unwrap_warn!(entry, continue, "read entry");
        let path = unwrap_warn!(entry.path(), continue, "read entry path").to_path_buf();
        let path = output.join(path);

        if !path_filters.matches(&path) {
            debug!(?path, "skip: path filter");
            continue;
        }

        if mode == ApplyMode::Resolved {
            if is_opaque_marker(&path) {
                if let Some(parent) = path.parent() {
                    unwrap_warn!(clear_dir(parent).await, continue, "opaque marker: {parent:?}");
                }
                debug!(?path, "opaque marker");
                continue;
            }

            if let Some(target) = is_whiteout(&path) {
                unwrap_warn!(remove_path(&target).await, continue, "whiteout: {target:?}");
                debug!(?path, "whiteout");
                continue;
            }
        }

        if entry.header().entry_type().is_symlink() {
            let handled = unwrap_warn!(
                safe_symlink(&entry, output).await,
                continue,
                "create symlink {path:?}"
            );
            if handled {
                continue;
            }
        }

        if !unwrap_warn!(entry.unpack_in(output).await, continue, "unpack {path:?}") {
            warn!(?path, "skip: tried to write outside of output directory");
            continue;
        }

        debug!(?path, "apply");
    }

    Ok(())
}

/// Enumerate files in a tarball.
#[tracing::instrument(skip(stream))]
pub async fn enumerate_tarball(stream: impl Stream<Item = Chunk> + Unpin) -> Result<Vec<String>> {
    let reader = StreamReader::new(stream);
    let mut archive = Archive::new(reader);
    let mut entries = archive.entries().context("read entries from tar")?;

    let mut files = Vec::new();
    while let Some(entry) = entries.next().await {
        let entry = unwrap_warn!(entry, continue, "read entry");
        let path = unwrap_warn!(entry.path(), continue, "read entry path");
        debug!(?path, "enumerate");
        files.push(path.to_string_lossy().to_string());
    }

    Ok(files)
}

/// Special handling for symlinks that link to an absolute path.
/// Returns true if the symlink was handled; false to fall back to standard
/// tar-crate handling.
#[tracing::instrument(skip(entry))]
pub async fn safe_symlink<R: AsyncRead + Unpin>(entry: &Entry<R>, dir: &Path) -> Result<bool> {
    let header = entry.header();
    let kind = header.entry_type();
    if !kind.is_symlink() {
        return Ok(false);
    }

    let link = entry.path().context("read symlink source")?;
    let target = header
        .link_name()
        .context("read symlink target")?
        .ok_or_eyre("no symlink target")?;

    if !target.is_absolute() {
        return Ok(false);
    }

    let safe_link = dir.join(&link);
    let safe_target = dir.join(strip_root(&target));

    let rel_target = compute_symlink_target(&safe_link, &safe_target)
        .with_context(|| format!("compute relative path from {safe_link:?} to {safe_target:?}"))?;
    debug!(
        ?link,
        ?target,
        ?safe_link,
        ?safe_target,
        ?rel_target,
        "create symlink"
    );

    if let Some(parent) = safe_link.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .context("create parent directory")?;
    }

    symlink(&rel_target, &safe_link)
        .await
        .map(|_| true)
        .with_context(|| {
            format!("create symlink from {safe_link:?} to {safe_target:?} as {rel_target:?}")
        })
}

/// Compute the relative path from a source to a destination.
#[tracing::instrument]
pub fn compute_symlink_target(src: &Path, dst: &Path) -> Result<PathBuf> {
    let common_prefix = src
        .components()
        .zip(dst.components())
        .by_ref()
        .take_while(|(src, dst)| src == dst)
        .map(|(src, _)| src)
        .collect::<PathBuf>();

    let src_rel = src
        .strip_prefix(&common_prefix)
        .context("strip common prefix from src")?;
    let dst_rel = dst
        .strip_prefix(&common_prefix)
        .context("strip common prefix from dst")?;

    let bridge = src_rel
        .components()
        .skip(1)
        .map(|_| "..")
        .collect::<PathBuf>();
    let rel = bridge.join(dst_rel);

    if rel.to_string_lossy().is_empty() {
        Ok(PathBuf::from("."))
    } else {
        Ok(rel)
    }
}

/// Strips any root and prefix from a path, if they exist.
pub fn strip_root(path: impl AsRef<Path>) -> PathBuf {
    path.as_ref()
        .components()
        .filter(|c| {
            !matches!(
                c,
                std::path::Component::Prefix(_) | std::path::Component::RootDir
            )
        })
        .pipe(PathBuf::from_iter)
}

#[cfg(windows)]
pub async fn symlink(src: &Path, dst: &Path) -> std::io::Result<()> {
    let (src, dst) = (src.to_owned(), dst.to_owned());
    tokio::task::spawn_blocking(|| std::os::windows::fs::symlink_file(src, dst))
        .await
        .expect("join tokio task")
}

#[cfg(any(unix, target_os = "redox"))]
pub async fn symlink(src: &Path, dst: &Path) -> std::io::Result<()> {
    tokio::fs::symlink(src, dst).await
}

/// The sentinel prefix marking a whiteout file.
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// The sentinel basename marking a directory opaque.
pub const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// Returns the path to the file that would be deleted by a whiteout file, if the
/// path is a whiteout file. If the path is not a whiteout file, returns `None`.
pub fn is_whiteout(path: &Path) -> Option<PathBuf> {
    let name = path.file_name()?.strip_prefix(WHITEOUT_PREFIX)?;
    Some(match path.parent() {
        Some(parent) => PathBuf::from(parent).join(name),
        None => PathBuf::from(name),
    })
}

/// Whether the given path is the opaque-directory marker.
pub fn is_opaque_marker(path: &Path) -> bool {
    path.file_name()
        .map(|name| name == OPAQUE_WHITEOUT)
        .unwrap_or(false)
}

/// Remove whatever is at `path`, file or directory, tolerating its absence
/// (a whiteout for a path no earlier layer wrote is not an error).
async fn remove_path(path: &Path) -> Result<()> {
    let meta = match tokio::fs::symlink_metadata(path).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e).context("stat path"),
    };
    if meta.is_dir() {
        tokio::fs::remove_dir_all(path).await.context("remove directory")
    } else {
        tokio::fs::remove_file(path).await.context("remove file")
    }
}

/// Remove every entry already present in `dir`, leaving the directory itself
/// in place for subsequent layers to repopulate.
async fn clear_dir(dir: &Path) -> Result<()> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e).context("read directory"),
    };
    while let Some(entry) = entries.next_entry().await.context("read dir entry")? {
        remove_path(&entry.path()).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use simple_test_case::test_case;

    #[test]
    fn test_is_whiteout() {
        assert_eq!(None, is_whiteout(Path::new("foo")));
        assert_eq!(
            Some(PathBuf::from("foo")),
            is_whiteout(Path::new(".wh.foo")),
        );
    }

    #[test]
    fn test_is_opaque_marker() {
        assert!(is_opaque_marker(Path::new("a/b/.wh..wh..opq")));
        assert!(!is_opaque_marker(Path::new("a/b/.wh.foo")));
    }

    #[test_case(Path::new("/a/b/c"), Path::new("/a/b/d/e/f"), PathBuf::from("d/e/f"); "one_level")]
    #[test_case(Path::new("/usr/local/bin/ls"), Path::new("/bin/ls"), PathBuf::from("../../../bin/ls"); "usr_local_bin_to_bin")]
    #[test_case(Path::new("/usr/local/bin/ls"), Path::new("/usr/bin/ls"), PathBuf::from("../../bin/ls"); "usr_local_bin_to_usr_bin")]
    #[test_case(Path::new("/usr/local/bin/ls"), Path::new("/usr/local/bin/ls"), PathBuf::from("."); "same_file")]
    #[test_case(Path::new("/usr/local/bin/eza"), Path::new("/usr/local/bin/ls"), PathBuf::from("ls"); "same_dir")]
    #[tokio::test]
    async fn compute_symlink_target(src: &Path, dst: &Path, expected: PathBuf) -> Result<()> {
        let relative = compute_symlink_target(src, dst)?;
        pretty_assertions::assert_eq!(expected, relative);
        Ok(())
    }
}
