use std::path::{Path, PathBuf};

/// File name of the stored remote model API key.
const REMOTE_KEY_FILE: &str = "remote.key";

fn state_dir() -> PathBuf {
    if let Ok(path) = std::env::var("KAONASI_CONFIG") {
        if let Some(parent) = Path::new(&path).parent() {
            return parent.to_path_buf();
        }
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
    PathBuf::from(home).join(".kaonasi")
}

fn credentials_dir_for(state_dir: &Path) -> PathBuf {
    state_dir.join("credentials")
}

#[cfg(unix)]
fn restrict_permissions(path: &Path, mode: u32) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .map_err(|e| anyhow::anyhow!("failed to chmod {mode:o} {}: {e}", path.display()))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path, _mode: u32) -> anyhow::Result<()> {
    Ok(())
}

/// Write the remote API key under `{state_dir}/credentials/` (dir 0700, file 0600).
pub fn write_key_to(state_dir: &Path, api_key: &str) -> anyhow::Result<PathBuf> {
    let api_key = api_key.trim();
    if api_key.is_empty() {
        anyhow::bail!("API key cannot be empty");
    }

    let dir = credentials_dir_for(state_dir);
    std::fs::create_dir_all(&dir)
        .map_err(|e| anyhow::anyhow!("failed to create {}: {e}", dir.display()))?;
    restrict_permissions(&dir, 0o700)?;

    let path = dir.join(REMOTE_KEY_FILE);
    std::fs::write(&path, api_key)
        .map_err(|e| anyhow::anyhow!("failed to write {}: {e}", path.display()))?;
    restrict_permissions(&path, 0o600)?;
    Ok(path)
}

pub fn read_key_from(state_dir: &Path) -> Option<String> {
    let value = std::fs::read_to_string(credentials_dir_for(state_dir).join(REMOTE_KEY_FILE)).ok()?;
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

/// Store the remote API key in ~/.kaonasi/credentials/remote.key.
pub fn store_api_key(api_key: &str) -> anyhow::Result<PathBuf> {
    write_key_to(&state_dir(), api_key)
}

/// Load the remote API key from ~/.kaonasi/credentials/remote.key.
pub fn load_api_key() -> Option<String> {
    read_key_from(&state_dir())
}
