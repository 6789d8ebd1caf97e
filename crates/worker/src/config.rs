use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Node identity persisted across restarts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeIdentity {
    #[serde(default)]
    pub machine_code: String,
}

fn xdg_config_home() -> anyhow::Result<PathBuf> {
    if let Some(dir) = std::env::var_os("XDG_CONFIG_HOME") {
        let dir = PathBuf::from(dir);
        if dir.as_os_str().is_empty() {
            anyhow::bail!("XDG_CONFIG_HOME is set but empty");
        }
        return Ok(dir);
    }

    let home = std::env::var_os("HOME").ok_or_else(|| anyhow::anyhow!("HOME is not set"))?;
    let home = PathBuf::from(home);
    if home.as_os_str().is_empty() {
        anyhow::bail!("HOME is set but empty");
    }
    Ok(home.join(".config"))
}

pub fn identity_path() -> anyhow::Result<PathBuf> {
    Ok(xdg_config_home()?.join("drover").join("identity.json"))
}

/// Load the stored identity, generating and saving one on first run.
pub fn ensure_identity() -> anyhow::Result<NodeIdentity> {
    let path = identity_path()?;
    if path.exists() {
        let raw = std::fs::read_to_string(&path)?;
        let identity: NodeIdentity = serde_json::from_str(&raw)?;
        if !identity.machine_code.is_empty() {
            return Ok(identity);
        }
    }

    let identity = NodeIdentity {
        machine_code: uuid::Uuid::new_v4().simple().to_string(),
    };
    let dir = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("invalid identity path: {}", path.display()))?;
    std::fs::create_dir_all(dir)?;

    let json = serde_json::to_string_pretty(&identity)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(tmp, path)?;
    Ok(identity)
}
