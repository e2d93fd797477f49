//! CLI test cases.
//!
//! These run the real binary against scratch directories using the `echo`
//! driver, which "transcribes" every image as the prompt text. That lets us
//! check discovery, output naming, failure handling and exit codes without a
//! network connection or API key.

use std::{fs, path::Path, process::Command};

use assert_cmd::prelude::*;
use image::{ImageFormat, Rgb, RgbImage};
use predicates::prelude::*;
use tempfile::TempDir;

/// The prompt used when none is supplied.
static DEFAULT_PROMPT: &str = "Extract all text visible in this image. \
     Maintain the original structure and layout as much as possible.";

/// Environment variables which would change the outcome of our tests.
static CONFIG_ENV_VARS: &[&str] = &[
    "ROOT_DIRECTORY",
    "MODEL_NAME",
    "GEMINI_API_KEY",
    "GEMINI_API_BASE",
    "OCR_DRIVER",
    "MAX_WORKERS",
    "SKIP_EXISTING",
    "OPENAI_API_KEY",
    "OPENAI_API_BASE",
    "RUST_LOG",
];

/// Create a new `Command` with our binary, isolated from the caller's
/// configuration. We run in `dir` so that no stray `.env` file is loaded.
fn cmd(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("tiff-ocr").unwrap();
    for var in CONFIG_ENV_VARS {
        cmd.env_remove(var);
    }
    cmd.current_dir(dir);
    cmd
}

/// A command using the echo driver on `root`.
fn echo_cmd(dir: &Path, root: &Path) -> Command {
    let mut cmd = cmd(dir);
    cmd.env("OCR_DRIVER", "echo").env("ROOT_DIRECTORY", root);
    cmd
}

/// Write a small image to `path`, creating parent directories.
fn write_image(path: &Path, format: ImageFormat) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    let img = RgbImage::from_fn(32, 16, |x, y| Rgb([(x * 8) as u8, (y * 16) as u8, 128]));
    img.save_with_format(path, format).unwrap();
}

/// Write arbitrary bytes to `path`, creating parent directories.
fn write_bytes(path: &Path, bytes: &[u8]) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, bytes).unwrap();
}

/// Build a scratch directory with a `root` folder of scans.
fn scans() -> (TempDir, std::path::PathBuf) {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("root");
    write_image(&root.join("sub/page1.tif"), ImageFormat::Tiff);
    write_image(&root.join("photo.JPG"), ImageFormat::Jpeg);
    write_bytes(&root.join("readme.pdf"), b"%PDF-1.4\n");
    (dir, root)
}

#[test]
fn test_help() {
    let dir = TempDir::new().unwrap();
    cmd(dir.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("GEMINI_API_KEY"));
}

#[test]
fn test_version() {
    let dir = TempDir::new().unwrap();
    cmd(dir.path()).arg("--version").assert().success();
}

#[test]
fn test_missing_root_directory_fails() {
    let dir = TempDir::new().unwrap();
    cmd(dir.path())
        .env("OCR_DRIVER", "echo")
        .assert()
        .failure()
        .stderr(predicate::str::contains("ROOT_DIRECTORY"));
}

#[test]
fn test_missing_api_key_fails() {
    let (dir, root) = scans();
    cmd(dir.path())
        .env("ROOT_DIRECTORY", &root)
        .env("MODEL_NAME", "gemini-2.0-flash")
        .assert()
        .failure()
        .stderr(predicate::str::contains("GEMINI_API_KEY"));
    assert!(!root.join("sub/page1_ocr.txt").exists());
}

#[test]
fn test_missing_model_fails() {
    let (dir, root) = scans();
    cmd(dir.path())
        .env("ROOT_DIRECTORY", &root)
        .env("GEMINI_API_KEY", "not-a-real-key")
        .assert()
        .failure()
        .stderr(predicate::str::contains("MODEL_NAME"));
}

#[test]
fn test_nonexistent_root_fails() {
    let dir = TempDir::new().unwrap();
    echo_cmd(dir.path(), &dir.path().join("nope"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("does not exist"));
}

#[test]
fn test_root_that_is_a_file_fails() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("scan.tif");
    write_image(&file, ImageFormat::Tiff);
    echo_cmd(dir.path(), &file)
        .assert()
        .failure()
        .stderr(predicate::str::contains("is not a directory"));
}

#[test]
fn test_writes_sibling_output_files() {
    let (dir, root) = scans();
    echo_cmd(dir.path(), &root).assert().success();

    assert_eq!(
        fs::read_to_string(root.join("sub/page1_ocr.txt")).unwrap(),
        DEFAULT_PROMPT
    );
    assert_eq!(
        fs::read_to_string(root.join("photo_ocr.txt")).unwrap(),
        DEFAULT_PROMPT
    );
    assert!(!root.join("readme_ocr.txt").exists());
}

#[test]
fn test_flags_work_without_environment() {
    let (dir, root) = scans();
    cmd(dir.path())
        .args(["--driver", "echo", "--jobs", "1", "--root-directory"])
        .arg(&root)
        .assert()
        .success();
    assert!(root.join("sub/page1_ocr.txt").exists());
}

#[test]
fn test_custom_prompt() {
    let (dir, root) = scans();
    let prompt = dir.path().join("prompt.txt");
    write_bytes(&prompt, b"Transcribe the handwriting only.\n");
    echo_cmd(dir.path(), &root)
        .arg("--prompt")
        .arg(&prompt)
        .assert()
        .success();
    assert_eq!(
        fs::read_to_string(root.join("sub/page1_ocr.txt")).unwrap(),
        "Transcribe the handwriting only."
    );
}

#[test]
fn test_one_bad_file_does_not_stop_the_others() {
    let (dir, root) = scans();
    write_bytes(&root.join("sub/corrupt.tif"), b"this is not an image");
    echo_cmd(dir.path(), &root)
        .assert()
        .success()
        .stderr(predicate::str::contains("corrupt.tif"))
        .stderr(predicate::str::contains("Failed: 1"));

    assert!(root.join("sub/page1_ocr.txt").exists());
    assert!(root.join("photo_ocr.txt").exists());
    assert!(!root.join("sub/corrupt_ocr.txt").exists());
}

#[test]
fn test_allowed_failure_rate_is_enforced() {
    let (dir, root) = scans();
    write_bytes(&root.join("sub/corrupt.tif"), b"this is not an image");
    echo_cmd(dir.path(), &root)
        .args(["--allowed-failure-rate", "0.1"])
        .assert()
        .failure();
    // We still do all the work we can.
    assert!(root.join("sub/page1_ocr.txt").exists());
}

#[test]
fn test_all_files_failing_is_an_error() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("root");
    write_bytes(&root.join("a.tif"), b"junk");
    write_bytes(&root.join("b.jpeg"), b"more junk");
    echo_cmd(dir.path(), &root)
        .assert()
        .failure()
        .stderr(predicate::str::contains("None of the 2 images"));
}

#[test]
fn test_no_images_is_not_an_error() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("root");
    write_bytes(&root.join("notes.txt"), b"hello");
    echo_cmd(dir.path(), &root)
        .assert()
        .success()
        .stderr(predicate::str::contains("No TIFF or JPEG images found"));
}

#[test]
fn test_rerun_overwrites_output() {
    let (dir, root) = scans();
    write_bytes(&root.join("sub/page1_ocr.txt"), b"stale text");
    echo_cmd(dir.path(), &root).assert().success();
    assert_eq!(
        fs::read_to_string(root.join("sub/page1_ocr.txt")).unwrap(),
        DEFAULT_PROMPT
    );
}

#[test]
fn test_skip_existing_keeps_output() {
    let (dir, root) = scans();
    write_bytes(&root.join("sub/page1_ocr.txt"), b"stale text");
    echo_cmd(dir.path(), &root)
        .env("SKIP_EXISTING", "true")
        .assert()
        .success()
        .stderr(predicate::str::contains("Skipped: 1"));
    assert_eq!(
        fs::read_to_string(root.join("sub/page1_ocr.txt")).unwrap(),
        "stale text"
    );
    assert!(root.join("photo_ocr.txt").exists());
}

#[test]
fn test_report_has_one_line_per_image() {
    let (dir, root) = scans();
    write_bytes(&root.join("sub/corrupt.tif"), b"this is not an image");
    let report = dir.path().join("report.jsonl");
    echo_cmd(dir.path(), &root)
        .arg("--report")
        .arg(&report)
        .assert()
        .success();

    let report = fs::read_to_string(&report).unwrap();
    let mut records = report
        .lines()
        .map(|line| serde_json::from_str::<serde_json::Value>(line).unwrap())
        .collect::<Vec<_>>();
    assert_eq!(records.len(), 3);
    records.sort_by_key(|r| r["path"].as_str().unwrap().to_owned());
    let statuses = records
        .iter()
        .map(|r| r["status"].as_str().unwrap())
        .collect::<Vec<_>>();
    assert_eq!(statuses, vec!["ok", "failed", "ok"]);
    assert!(
        records[0]["output_path"]
            .as_str()
            .unwrap()
            .ends_with("photo_ocr.txt")
    );
    assert!(records[1]["output_path"].is_null());
}

/// Count the `_ocr.txt` files under `root`.
fn output_count(root: &Path) -> usize {
    let mut count = 0;
    let mut dirs = vec![root.to_owned()];
    while let Some(dir) = dirs.pop() {
        for entry in fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                dirs.push(path);
            } else if path.to_string_lossy().ends_with("_ocr.txt") {
                count += 1;
            }
        }
    }
    count
}

#[test]
fn test_images_sharing_a_stem_do_not_share_output() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("root");
    write_image(&root.join("p.jpeg"), ImageFormat::Jpeg);
    write_image(&root.join("p.jpg"), ImageFormat::Jpeg);
    write_image(&root.join("q.jpg"), ImageFormat::Jpeg);
    echo_cmd(dir.path(), &root)
        .args(["--jobs", "8"])
        .assert()
        .success()
        .stderr(predicate::str::contains("p.jpg"))
        .stderr(predicate::str::contains("would overwrite the output of"))
        .stderr(predicate::str::contains("Successful: 2"))
        .stderr(predicate::str::contains("Failed: 1"));
    assert_eq!(
        fs::read_to_string(root.join("p_ocr.txt")).unwrap(),
        DEFAULT_PROMPT
    );
    assert_eq!(output_count(&root), 2);
}

#[cfg(unix)]
#[test]
fn test_unreadable_directory_is_listed_in_summary() {
    use std::os::unix::fs::PermissionsExt;

    let (dir, root) = scans();
    write_image(&root.join("locked/hidden.tif"), ImageFormat::Tiff);
    let locked = root.join("locked");
    fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();
    if fs::read_dir(&locked).is_ok() {
        // Running with privileges that ignore permissions.
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();
        return;
    }

    let assert = echo_cmd(dir.path(), &root).assert();
    fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();
    assert
        .success()
        .stderr(predicate::str::contains("1 images could not be processed"))
        .stderr(predicate::str::contains(locked.display().to_string()));
    assert!(root.join("sub/page1_ocr.txt").exists());
    assert!(root.join("photo_ocr.txt").exists());
    assert!(!locked.join("hidden_ocr.txt").exists());
}

#[test]
fn test_take_first_limits_outputs() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("root");
    for name in ["a.tif", "b.tif", "c.tif"] {
        write_image(&root.join(name), ImageFormat::Tiff);
    }
    write_image(&root.join("d.jpg"), ImageFormat::Jpeg);
    echo_cmd(dir.path(), &root)
        .args(["--take-first", "2"])
        .assert()
        .success()
        .stderr(predicate::str::contains("Total: 2"));
    assert_eq!(output_count(&root), 2);
    assert!(root.join("a_ocr.txt").exists());
    assert!(root.join("b_ocr.txt").exists());
}

#[test]
fn test_take_first_skips_finished_images() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("root");
    for name in ["a.tif", "b.tif", "c.tif"] {
        write_image(&root.join(name), ImageFormat::Tiff);
    }
    write_bytes(&root.join("a_ocr.txt"), b"stale text");
    echo_cmd(dir.path(), &root)
        .args(["--take-first", "1", "--skip-existing"])
        .assert()
        .success()
        .stderr(predicate::str::contains("Successful: 1, Skipped: 1"));
    assert_eq!(
        fs::read_to_string(root.join("a_ocr.txt")).unwrap(),
        "stale text"
    );
    assert!(root.join("b_ocr.txt").exists());
    assert!(!root.join("c_ocr.txt").exists());
}
