//! Echo of data pulled in by an RDMA read.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use tracing::warn;

/// Where received bulk data is echoed. Failures are logged, never fatal.
#[derive(Debug, Clone, Default)]
pub struct DataEcho {
    verbose: bool,
    output_file: Option<PathBuf>,
}

impl DataEcho {
    /// Echo to stdout when `verbose`, append to `output_file` when set.
    pub fn new(verbose: bool, output_file: Option<PathBuf>) -> Self {
        Self {
            verbose,
            output_file,
        }
    }

    /// True when at least one sink is configured.
    pub fn is_enabled(&self) -> bool {
        self.verbose || self.output_file.is_some()
    }

    /// Echo `data` to every configured sink.
    pub fn echo(&self, data: &[u8]) {
        if self.verbose {
            let text = data.split(|b| *b == 0).next().unwrap_or_default();
            println!("server ping data: {}", String::from_utf8_lossy(text));
        }
        if let Some(path) = &self.output_file {
            let written = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .and_then(|mut f| f.write_all(data));
            if let Err(e) = written {
                warn!(path = %path.display(), error = %e, "failed to write received data");
            }
        }
    }
}
