//! Shared rewrite core for filters that re-tar a layer and must keep the
//! image config's diffID list in sync: `normalize-timestamps` and `exclude`.
//! Both filters are, per their own description, otherwise identical.

use std::path::{Path, PathBuf};

use astral_tokio_tar::{Archive, Builder, EntryType};
use async_tempfile::TempFile;
use color_eyre::{eyre::Context, Result};
use futures_lite::StreamExt;

use crate::{
    cio,
    element::ByteStream,
    tarfmt::{self, MemberInfo, TarFormat},
    Digest,
};

/// Whether a rewrite pass keeps or drops a given tar member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Keep {
    Yes,
    No,
}

/// Re-tar a layer's (uncompressed) member stream, dropping members `keep`
/// rejects and, when `fixed_time` is set, overwriting every kept member's
/// mtime (and, under PAX, its atime extension record) to that value.
///
/// Buffers the input to a scratch file first: the tar-format selector needs
/// the full (post-filter) member list before the first byte is written, and
/// the input stream isn't seekable.
pub(super) async fn rewrite(
    handle: ByteStream,
    keep: impl Fn(&Path) -> Keep,
    fixed_time: Option<u64>,
) -> Result<(TempFile, Digest, i64)> {
    let input = cio::collect_tmp(handle)
        .await
        .context("buffer layer for rewrite")?;
    let format = prescan(input.file_path(), &keep).await?;

    let scratch = TempFile::new().await.context("create scratch tarball")?;
    let mut builder = Builder::new(scratch);

    let file = tokio::fs::File::open(input.file_path())
        .await
        .context("reopen buffered layer")?;
    let mut archive = Archive::new(file);
    let mut entries = archive.entries().context("read layer entries")?;

    while let Some(entry) = entries.next().await {
        let mut entry = entry.context("read layer entry")?;
        let path = entry.path().context("read entry path")?.to_path_buf();
        if keep(&path) == Keep::No {
            continue;
        }

        let mut header = entry.header().clone();
        if let Some(mtime) = fixed_time {
            header.set_mtime(mtime);
        }

        if format == TarFormat::Pax {
            if let Some(atime) = fixed_time {
                builder
                    .append_pax_extensions([("atime", atime.to_string().as_bytes())])
                    .await
                    .context("write pax atime extension")?;
            }
        }

        match header.entry_type() {
            EntryType::Symlink | EntryType::Link => {
                let target = entry
                    .link_name()
                    .context("read link target")?
                    .context("symlink/hardlink entry missing target")?
                    .into_owned();
                builder
                    .append_link(&mut header, &path, &target)
                    .await
                    .context("append link entry")?;
            }
            _ => {
                builder
                    .append_data(&mut header, &path, &mut entry)
                    .await
                    .context("append data entry")?;
            }
        }
    }

    let scratch = builder.into_inner().await.context("finish rewritten tarball")?;
    scratch.sync_all().await.context("sync rewritten tarball")?;

    let digest = cio::file_digest(scratch.file_path())
        .await
        .context("digest rewritten tarball")?;
    let size = tokio::fs::metadata(scratch.file_path())
        .await
        .context("stat rewritten tarball")?
        .len() as i64;

    Ok((scratch, digest, size))
}

/// Pre-scan the (post-filter) member list to choose USTAR or PAX.
async fn prescan(path: &Path, keep: &impl Fn(&Path) -> Keep) -> Result<TarFormat> {
    let file = tokio::fs::File::open(path)
        .await
        .context("reopen buffered layer")?;
    let mut archive = Archive::new(file);
    let mut entries = archive.entries().context("read layer entries")?;

    let mut infos: Vec<(PathBuf, Option<PathBuf>, u64, u64, u64)> = Vec::new();
    while let Some(entry) = entries.next().await {
        let entry = entry.context("read layer entry")?;
        let path = entry.path().context("read entry path")?.to_path_buf();
        if keep(&path) == Keep::No {
            continue;
        }

        let link_name = entry
            .link_name()
            .context("read link target")?
            .map(|c| c.into_owned());
        let header = entry.header();
        infos.push((
            path,
            link_name,
            header.size().context("read entry size")?,
            header.uid().context("read entry uid")?,
            header.gid().context("read entry gid")?,
        ));
    }

    let format = tarfmt::select_format(infos.iter().map(|(path, link_name, size, uid, gid)| {
        MemberInfo {
            path,
            link_name: link_name.as_deref(),
            size: *size,
            uid: *uid,
            gid: *gid,
        }
    }));
    Ok(format)
}

/// Re-open a scratch tarball on disk as a boxed byte stream ready to hand to
/// the next consumer in the chain.
pub(super) async fn into_byte_stream(scratch: &TempFile) -> Result<ByteStream> {
    let file = tokio::fs::File::open(scratch.file_path())
        .await
        .context("reopen rewritten layer")?;
    Ok(Box::pin(tokio_util::io::ReaderStream::new(file)))
}
