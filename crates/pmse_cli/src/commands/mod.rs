//! CLI command implementations.

pub mod inspect;
pub mod repair;
pub mod verify;

use pmse_core::{DataDir, IdentList};
use std::path::Path;

/// Opens the data directory and its metadata pool without creating either.
pub(crate) fn open_metadata(path: &Path) -> Result<(DataDir, IdentList), Box<dyn std::error::Error>> {
    let dir = DataDir::open(path, false)?;
    let list_path = dir.identlist_path();
    if !list_path.exists() {
        return Err(format!("No pmse data directory at {:?}", path).into());
    }
    let list = IdentList::open(&list_path)?;
    Ok((dir, list))
}
