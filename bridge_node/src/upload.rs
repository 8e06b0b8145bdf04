use crate::common::{now_millis, BridgeError, Result};
use crate::storage::{SourceFile, StateStore};
use ethers::types::Address;
use log::info;
use std::path::Path;

/// Record an uploaded file so the bundling job picks it up.
///
/// The file must already sit inside `source_dir`, one of the watched
/// upload directories.
pub async fn register_upload(
    store: &dyn StateStore,
    wallet: &str,
    source_dir: &Path,
    file_path: &Path,
) -> Result<SourceFile> {
    wallet
        .trim()
        .parse::<Address>()
        .map_err(|e| BridgeError::InvalidInput(format!("wallet {wallet:?}: {e}")))?;
    if !file_path.starts_with(source_dir) {
        return Err(BridgeError::InvalidInput(format!(
            "{} is outside upload directory {}",
            file_path.display(),
            source_dir.display()
        )));
    }

    let meta = tokio::fs::metadata(file_path).await?;
    if !meta.is_file() {
        return Err(BridgeError::InvalidInput(format!("{} is not a file", file_path.display())));
    }
    let file_name = file_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| BridgeError::InvalidInput(format!("{} has no file name", file_path.display())))?;

    let file = store
        .insert_source_file(SourceFile {
            id: 0,
            content_id: None,
            wallet_address: wallet.trim().to_string(),
            file_name,
            file_path: file_path.to_path_buf(),
            source_dir: source_dir.to_path_buf(),
            file_size: meta.len(),
            created_at: now_millis(),
        })
        .await?;
    info!("Upload {} registered as source file {}", file.file_name, file.id);
    Ok(file)
}
