use std::{io, path::Path};

use shared::types::FoundPair;
use tokio::fs;
use tracing::*;

/// One address per line, newline terminated. The search program reads this file,
/// so a failure here must stop the worker.
pub async fn write_address_file(path: &Path, addresses: &[String]) -> io::Result<()> {
    let mut content = addresses.join("\n");
    content.push('\n');
    fs::write(path, content).await?;
    info!("addresses saved to '{}', total: {}", path.display(), addresses.len());
    Ok(())
}

pub async fn clear_file(path: &Path) {
    if let Err(err) = fs::write(path, b"").await {
        warn!("fail to clear '{}': {err}", path.display());
    }
}

/// Non-empty lines of the result file, `None` when it does not exist or cannot be read.
/// Bytes that are not UTF-8 are replaced, they never drop the rest of the file.
pub async fn read_output_lines(path: &Path) -> Option<Vec<String>> {
    match fs::read(path).await {
        Ok(bytes) => Some(split_lines(&bytes)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            warn!("file '{}' not found for processing", path.display());
            None
        }
        Err(err) => {
            error!("error processing file '{}': {err}", path.display());
            None
        }
    }
}

fn split_lines(bytes: &[u8]) -> Vec<String> {
    bytes
        .split(|b| *b == b'\n')
        .map(|line| String::from_utf8_lossy(line).trim_end_matches('\r').to_string())
        .filter(|line| !line.is_empty())
        .collect()
}

/// `address:key` per line, replacing any previous record.
pub async fn write_found_keys(path: &Path, found: &[FoundPair]) -> io::Result<()> {
    let mut content = found.iter().map(FoundPair::to_string).collect::<Vec<_>>().join("\n");
    content.push('\n');
    fs::write(path, content).await
}
