//! Tracing setup. Stdout carries the machine-readable result, so diagnostics
//! go to stderr, or to a file when the config asks for one.

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;

use crate::net::NetResult;

pub fn init(log_to_file: Option<&Path>) -> NetResult<()> {
    match log_to_file {
        Some(path) => {
            let file = open_log_file(path)?;
            tracing_subscriber::fmt()
                .with_env_filter(
                    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
                )
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(
                    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
                )
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}

fn open_log_file(path: &Path) -> NetResult<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn log_file_is_appended_not_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stitch.log");

        let mut first = open_log_file(&path).unwrap();
        writeln!(first, "one").unwrap();
        drop(first);

        let mut second = open_log_file(&path).unwrap();
        writeln!(second, "two").unwrap();
        drop(second);

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "one\ntwo\n");
    }
}
