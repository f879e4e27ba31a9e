use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// File name of the receipt inside a keg. A keg counts as installed only
/// while this file exists.
pub const RECEIPT_FILE: &str = "INSTALL_RECEIPT.json";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct InstallReceipt {
    pub name: String,
    pub version: String,
    pub sha256: String,
    pub source: String,
    /// Seconds since the unix epoch.
    pub installed_at: u64,
    /// Names of the dependencies that were resolved for this install.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Whether the test recipe ran and passed.
    pub tested: bool,
}

impl InstallReceipt {
    pub fn new(name: &str, version: &str, sha256: &str, source: &str) -> Self {
        let installed_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        InstallReceipt {
            name: name.to_string(),
            version: version.to_string(),
            sha256: sha256.to_string(),
            source: source.to_string(),
            installed_at,
            dependencies: Vec::new(),
            tested: false,
        }
    }

    /// Reads the receipt of a keg, if it has one.
    pub fn load<P: AsRef<Path>>(keg: P) -> Result<Option<Self>> {
        let path = keg.as_ref().join(RECEIPT_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        let receipt = serde_json::from_str(&content)
            .with_context(|| format!("Corrupt receipt {}", path.display()))?;
        Ok(Some(receipt))
    }

    /// Writes the receipt, registering the keg.
    ///
    /// The file appears under its final name only once fully written.
    pub fn save<P: AsRef<Path>>(&self, keg: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        let path = keg.as_ref().join(RECEIPT_FILE);
        let partial = keg.as_ref().join(format!("{RECEIPT_FILE}.incomplete"));
        fs::write(&partial, content)
            .with_context(|| format!("Could not write receipt {}", partial.display()))?;
        fs::rename(&partial, &path)
            .with_context(|| format!("Could not move receipt into place {}", path.display()))?;
        Ok(())
    }
}

/// Finds the registered keg of `name` in the cellar, newest version first.
pub fn find_installed(cellar: &Path, name: &str) -> Result<Option<(PathBuf, InstallReceipt)>> {
    let rack = cellar.join(name);
    if !rack.is_dir() {
        return Ok(None);
    }
    let mut found = Vec::new();
    for entry in fs::read_dir(&rack)? {
        let keg = entry?.path();
        if let Some(receipt) = InstallReceipt::load(&keg)? {
            found.push((keg, receipt));
        }
    }
    found.sort_by(|(_, a), (_, b)| compare_versions(&b.version, &a.version));
    Ok(found.into_iter().next())
}

/// Every registered keg in the cellar, sorted by name.
pub fn installed_kegs(cellar: &Path) -> Result<Vec<(PathBuf, InstallReceipt)>> {
    let mut kegs = Vec::new();
    if !cellar.is_dir() {
        return Ok(kegs);
    }
    for entry in fs::read_dir(cellar)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if let Some(found) = find_installed(cellar, &name)? {
            kegs.push(found);
        }
    }
    kegs.sort_by(|(_, a), (_, b)| a.name.cmp(&b.name));
    Ok(kegs)
}

fn compare_versions(a: &str, b: &str) -> std::cmp::Ordering {
    match (semver::Version::parse(a), semver::Version::parse(b)) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        _ => a.cmp(b),
    }
}
