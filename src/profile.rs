use anyhow::{anyhow, Context, Result};
use directories::ProjectDirs;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::models::UserProfile;

/// Where the pipeline reads a user's resolved profile from.
pub trait ProfileSource: Send + Sync {
    /// `Ok(None)` when the user has no profile.
    fn load(&self, user_id: &str) -> Result<Option<UserProfile>>;
}

/// Profiles stored as `<dir>/<user_id>.json`.
pub struct JsonProfileStore {
    dir: PathBuf,
}

impl JsonProfileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn open_default() -> Result<Self> {
        Ok(Self::new(Self::default_dir()?))
    }

    pub fn default_dir() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("", "", "scout")
            .ok_or_else(|| anyhow!("Could not determine data directory"))?;
        Ok(proj_dirs.data_dir().join("profiles"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, user_id: &str) -> Result<PathBuf> {
        // User ids become file names; refuse anything that could escape the dir
        let valid = !user_id.is_empty()
            && user_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
            && !user_id.starts_with('.');
        if !valid {
            return Err(anyhow!("Invalid user id '{}'", user_id));
        }
        Ok(self.dir.join(format!("{}.json", user_id)))
    }
}

impl ProfileSource for JsonProfileStore {
    fn load(&self, user_id: &str) -> Result<Option<UserProfile>> {
        let path = self.path_for(user_id)?;
        if !path.exists() {
            return Ok(None);
        }

        let raw = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read profile {}", path.display()))?;
        let mut profile: UserProfile = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse profile {}", path.display()))?;

        // The file name is the owner; postings are stored under it
        if profile.id != user_id {
            if !profile.id.is_empty() {
                warn!(user_id, file_id = %profile.id, "Profile id does not match file name, using file name");
            }
            profile.id = user_id.to_string();
        }
        Ok(Some(profile))
    }
}
