use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

static NEXT_DIR: AtomicUsize = AtomicUsize::new(0);

/// A fresh directory under the system temp dir, unique per test invocation.
///
/// Test binaries may run in parallel, so the path mixes the process id with a
/// per-process counter.
pub fn unique_test_temp_dir(prefix: &str) -> PathBuf {
    let n = NEXT_DIR.fetch_add(1, Ordering::SeqCst);
    let dir = std::env::temp_dir().join(format!(
        "conductor-{prefix}-{}-{n}",
        std::process::id()
    ));
    std::fs::create_dir_all(&dir).expect("create test temp dir");
    dir
}
