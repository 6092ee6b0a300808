use std::cell::RefCell;
use std::io::Write;

use tracing_subscriber::EnvFilter;

/// Logs go through QEMU's plugin output so they interleave with QEMU's own diagnostics.
///
/// Filtering is controlled by the `GT_LOG` environment variable.
pub fn initialize_logging() {
    // A second plugin instance in the same process keeps the first subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_env("GT_LOG"))
        .with_ansi(false)
        .with_writer(|| QemuOutput)
        .try_init();
}

struct QemuOutput;

impl Write for QemuOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        OUTPUT_BUFFER.with_borrow_mut(|output| {
            output.clear();
            output.extend(buf.iter().copied().filter(|&b| b != 0));
            output.push(0);
            // SAFETY: interior nul bytes were filtered out and a trailing one was just pushed
            unsafe {
                let s = std::ffi::CStr::from_bytes_with_nul_unchecked(output.as_slice());
                crate::qemu::qemu_plugin_outs(s.as_ptr());
            }
        });
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

thread_local! {
    static OUTPUT_BUFFER: RefCell<Vec<u8>> = RefCell::new(Vec::new());
}
