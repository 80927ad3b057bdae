//! Process-wide logging: rotated run log duplicated to the console.
//!
//! Every run appends timestamped progress lines to `DFT_ADSORPTION.log`
//! inside the base directory and mirrors them to stdout. On restart an
//! existing log is renamed to `DFT_ADSORPTION.log.old` unconditionally; a
//! second consecutive restart therefore overwrites the previous `.old`
//! file. That lossy single-slot rotation is intentional and matches the
//! documented behavior of the workflow.

use log::LevelFilter;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;

/// File name of the run log inside the base directory.
pub const LOG_FILE: &str = "DFT_ADSORPTION.log";

/// Suffix slot for the previous run's log.
pub const LOG_FILE_OLD: &str = "DFT_ADSORPTION.log.old";

/// Rotates an existing log file into the single `.old` slot.
///
/// If `log_path` exists it is renamed to its sibling `.old` file,
/// replacing whatever was there. Returns whether a rotation happened.
pub fn rotate_log_file(log_path: &Path) -> io::Result<bool> {
    if log_path.exists() {
        let old = log_path.with_file_name(match log_path.file_name().and_then(|n| n.to_str()) {
            Some(name) => format!("{}.old", name),
            None => LOG_FILE_OLD.to_string(),
        });
        fs::rename(log_path, old)?;
        Ok(true)
    } else {
        Ok(false)
    }
}

/// Writer that duplicates every record to the log file and stdout.
///
/// The file is flushed after each write so the log survives abnormal
/// termination of the process.
struct Tee {
    file: File,
}

impl Write for Tee {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write_all(buf)?;
        self.file.flush()?;
        io::stdout().write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()?;
        io::stdout().flush()
    }
}

/// Record timestamp, local time with second resolution.
fn timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Rotates any prior log and initializes the process-wide logger.
///
/// Must be called once, at process start, after the base directory exists.
pub fn init(log_path: &Path) -> io::Result<()> {
    rotate_log_file(log_path)?;
    let file = File::create(log_path)?;
    env_logger::Builder::from_default_env()
        .filter_level(LevelFilter::Info)
        .format(|buf, record| {
            writeln!(buf, "{}\t{}\t{}", timestamp(), record.level(), record.args())
        })
        .target(env_logger::Target::Pipe(Box::new(Tee { file })))
        .init();
    Ok(())
}
