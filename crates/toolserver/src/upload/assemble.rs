use std::path::{Path, PathBuf};
use tokio::io::{AsyncWriteExt, BufWriter};

use super::{part_path, UploadError};

/// Checks that parts `0..total` all exist under `chunk_dir`.
pub async fn verify_parts(chunk_dir: &Path, total: u32) -> Result<(), UploadError> {
    for index in 0..total {
        match tokio::fs::metadata(part_path(chunk_dir, index)).await {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => return Err(UploadError::MissingPart(index)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(UploadError::MissingPart(index))
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

/// Concatenates parts `0..total` in index order into `temp`.
///
/// When `expected_size` is set the result must match it exactly. On any
/// failure `temp` is removed so nothing partial survives.
pub async fn concat_parts(
    chunk_dir: &Path,
    total: u32,
    expected_size: Option<u64>,
    temp: PathBuf,
) -> Result<u64, UploadError> {
    let outcome = write_concatenation(chunk_dir, total, &temp).await;
    let written = match outcome {
        Ok(written) => written,
        Err(err) => {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(err);
        }
    };

    if let Some(expected) = expected_size {
        if expected != written {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(UploadError::SizeMismatch {
                expected,
                actual: written,
            });
        }
    }
    Ok(written)
}

async fn write_concatenation(chunk_dir: &Path, total: u32, temp: &Path) -> Result<u64, UploadError> {
    let file = tokio::fs::File::create(temp).await?;
    let mut out = BufWriter::new(file);
    let mut written = 0u64;

    for index in 0..total {
        let mut part = match tokio::fs::File::open(part_path(chunk_dir, index)).await {
            Ok(part) => part,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(UploadError::MissingPart(index))
            }
            Err(err) => return Err(err.into()),
        };
        written += tokio::io::copy(&mut part, &mut out).await?;
    }

    out.flush().await?;
    out.into_inner().sync_all().await?;
    Ok(written)
}
