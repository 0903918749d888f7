//! Portfile read/write.
//!
//! The chosen listen port is written as decimal ASCII to a well-known path
//! so shell integration can find the running proxy without guessing.

use std::io;
use std::path::{Path, PathBuf};

/// `~/.local/state/llm-proxy/port`, following XDG state conventions.
pub fn default_portfile_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_default();
    Path::new(&home)
        .join(".local")
        .join("state")
        .join("llm-proxy")
        .join("port")
}

/// Write the port, creating parent directories as needed.
pub fn write_portfile(path: &Path, port: u16) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, port.to_string())
}

pub fn read_portfile(path: &Path) -> io::Result<u16> {
    let contents = std::fs::read_to_string(path)?;
    contents
        .trim()
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("invalid portfile: {e}")))
}
