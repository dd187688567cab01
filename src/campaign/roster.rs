//! Roster files and asset checks.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::error::CampaignError;

/// Reads a newline-separated list.
///
/// Lines are trimmed, blank lines skipped, and repeated names dropped
/// keeping the first occurrence.
pub fn read_lines(path: &Path) -> Result<Vec<String>, CampaignError> {
    let contents = std::fs::read_to_string(path).map_err(|source| CampaignError::RosterFile {
        path: path.to_path_buf(),
        source,
    })?;

    Ok(dedup(contents.lines().map(str::trim).filter(|l| !l.is_empty())))
}

/// Removes repeated names, keeping first occurrences in order.
pub fn dedup<I, S>(names: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut seen = HashSet::new();
    names
        .into_iter()
        .map(Into::into)
        .filter(|name: &String| seen.insert(name.clone()))
        .collect()
}

/// Where bot and map assets live.
///
/// A bot exists iff `bot_dir/<bot>/` is a directory; a map exists iff
/// `map_dir/<map>` is a file.
#[derive(Debug, Clone)]
pub struct AssetDirs {
    pub bot_dir: PathBuf,
    pub map_dir: PathBuf,
}

impl AssetDirs {
    pub fn new(bot_dir: impl Into<PathBuf>, map_dir: impl Into<PathBuf>) -> Self {
        Self {
            bot_dir: bot_dir.into(),
            map_dir: map_dir.into(),
        }
    }

    /// Fails on the first bot without a directory.
    pub fn check_bots(&self, bots: &[String]) -> Result<(), CampaignError> {
        for bot in bots {
            let path = self.bot_dir.join(bot);
            if !path.is_dir() {
                return Err(CampaignError::MissingAsset {
                    kind: "bot",
                    name: bot.clone(),
                    path,
                });
            }
        }
        Ok(())
    }

    /// Fails on the first map without a file.
    pub fn check_maps(&self, maps: &[String]) -> Result<(), CampaignError> {
        for map in maps {
            let path = self.map_dir.join(map);
            if !path.is_file() {
                return Err(CampaignError::MissingAsset {
                    kind: "map",
                    name: map.clone(),
                    path,
                });
            }
        }
        Ok(())
    }
}
