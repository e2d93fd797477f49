//! Writing OCR text next to the source image.

use std::io::Write as _;

use tempfile::Builder;

use crate::{async_utils::spawn_blocking_propagating_panics, prelude::*};

/// Suffix for the temporary files we write before renaming into place.
const PARTIAL_SUFFIX: &str = ".partial";

/// Suffix appended to an image's file stem to name its OCR output.
pub const OUTPUT_SUFFIX: &str = "_ocr.txt";

/// Compute the sibling output path for an image: `dir/page1.tif` becomes
/// `dir/page1_ocr.txt`.
pub fn output_path_for(image_path: &Path) -> PathBuf {
    let mut name = image_path
        .file_stem()
        .map(|stem| stem.to_os_string())
        .unwrap_or_default();
    name.push(OUTPUT_SUFFIX);
    image_path.with_file_name(name)
}

/// Write `text` to `output_path` as UTF-8, replacing any existing file.
///
/// We write to a uniquely named hidden temporary file in the same directory
/// and rename it into place, so a failed write never leaves a truncated result
/// behind, and concurrent writers never share a temporary file.
#[instrument(level = "debug", skip(text), fields(output_path = %output_path.display()))]
pub async fn write_ocr_result(output_path: &Path, text: &str) -> Result<()> {
    let output_path = output_path.to_owned();
    let text = text.to_owned();
    spawn_blocking_propagating_panics(move || write_ocr_result_blocking(&output_path, &text))
        .await
}

/// Blocking implementation of [`write_ocr_result`].
fn write_ocr_result_blocking(output_path: &Path, text: &str) -> Result<()> {
    let dir = match output_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut tmp = Builder::new()
        .prefix(".")
        .suffix(PARTIAL_SUFFIX)
        .tempfile_in(dir)
        .with_context(|| format!("Failed to create temporary file in {:?}", dir))?;
    tmp.write_all(text.as_bytes())
        .with_context(|| format!("Failed to write {:?}", tmp.path()))?;
    // Temporary files are private, but OCR text should be as readable as any
    // other file the user creates.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt as _;
        tmp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o644))
            .with_context(|| format!("Failed to set permissions on {:?}", tmp.path()))?;
    }
    // If this fails, the temporary file is deleted when the error is dropped.
    tmp.persist(output_path)
        .with_context(|| format!("Failed to move OCR text into {:?}", output_path))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use futures::future;
    use tokio::fs;

    use super::*;

    #[test]
    fn output_path_replaces_extension() {
        assert_eq!(
            output_path_for(Path::new("root/sub/page1.tif")),
            PathBuf::from("root/sub/page1_ocr.txt")
        );
        assert_eq!(
            output_path_for(Path::new("scan.v2.JPEG")),
            PathBuf::from("scan.v2_ocr.txt")
        );
    }

    #[tokio::test]
    async fn write_creates_and_overwrites() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let output = dir.path().join("page1_ocr.txt");

        write_ocr_result(&output, "first run").await?;
        assert_eq!(fs::read_to_string(&output).await?, "first run");

        write_ocr_result(&output, "second run: ünïcödé").await?;
        assert_eq!(fs::read_to_string(&output).await?, "second run: ünïcödé");

        // Only the output file should remain.
        let mut entries = std::fs::read_dir(dir.path())?.collect::<Vec<_>>();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries.pop().unwrap()?.path(), output);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writes_to_one_output_all_succeed() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let output = dir.path().join("p_ocr.txt");
        let texts = (0..64).map(|i| format!("text {i}")).collect::<Vec<_>>();
        let results =
            future::join_all(texts.iter().map(|text| write_ocr_result(&output, text))).await;
        for result in results {
            result?;
        }

        let written = fs::read_to_string(&output).await?;
        assert!(texts.contains(&written));
        let entries = std::fs::read_dir(dir.path())?.collect::<Vec<_>>();
        assert_eq!(entries.len(), 1);
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn output_is_readable_by_others() -> Result<()> {
        use std::os::unix::fs::PermissionsExt as _;

        let dir = tempfile::tempdir()?;
        let output = dir.path().join("page1_ocr.txt");
        write_ocr_result(&output, "text").await?;
        let mode = std::fs::metadata(&output)?.permissions().mode();
        assert_eq!(mode & 0o777, 0o644);
        Ok(())
    }

    #[tokio::test]
    async fn write_into_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("missing").join("page1_ocr.txt");
        assert!(write_ocr_result(&output, "text").await.is_err());
    }
}
