use serde::Serialize;
use tether_core::{Result, SyncError};

/// One JSON document per line on stdout.
pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let line = serde_json::to_string(value).map_err(|e| SyncError::json("encode output", e))?;
    println!("{line}");
    Ok(())
}
