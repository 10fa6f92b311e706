use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::catalog::DefinitionDefaults;
use crate::error::{RepoError, Result};
use crate::schema::{parse_definition_str, Definition};

/// Retrieves definition documents addressed by URL
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch_text(&self, url: &str) -> Result<String>;
}

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Self {
        HttpFetcher {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch_text(&self, url: &str) -> Result<String> {
        let response = self.client.get(url).send().await?.error_for_status()?;
        Ok(response.text().await?)
    }
}

/// Turns definition locators (paths, globs, `~/...`, URLs) into parsed definitions
pub struct DefinitionResolver {
    base_dir: PathBuf,
    fetcher: std::sync::Arc<dyn Fetcher>,
}

impl DefinitionResolver {
    pub fn new(base_dir: impl Into<PathBuf>, fetcher: std::sync::Arc<dyn Fetcher>) -> Self {
        DefinitionResolver {
            base_dir: base_dir.into(),
            fetcher,
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Resolve a locator to one definition per matched document. The file
    /// stem becomes the default name when neither the document nor `defaults` names one.
    pub async fn resolve(
        &self,
        locator: &str,
        defaults: &DefinitionDefaults,
    ) -> Result<Vec<(Definition, DefinitionDefaults)>> {
        if is_remote(locator) {
            let text = self.fetcher.fetch_text(locator).await?;
            let definition = parse_definition_str(&text).map_err(|e| located(locator, e))?;
            return Ok(vec![(definition, with_stem(defaults, url_stem(locator)))]);
        }

        let path = self.resolve_path(locator)?;
        let mut resolved = Vec::new();
        for file in expand(&path)? {
            let text = tokio::fs::read_to_string(&file).await?;
            let definition = parse_definition_str(&text).map_err(|e| located(&file.display().to_string(), e))?;
            let stem = file.file_stem().and_then(|s| s.to_str()).map(str::to_string);
            resolved.push((definition, with_stem(defaults, stem)));
        }
        log::debug!("Locator {locator} resolved to {} definition(s)", resolved.len());
        Ok(resolved)
    }

    /// Expand `~` and anchor relative paths at the base directory
    pub fn resolve_path(&self, locator: &str) -> Result<PathBuf> {
        if locator == "~" || locator.starts_with("~/") {
            let home = dirs::home_dir()
                .ok_or_else(|| RepoError::Config("Cannot resolve '~': no home directory".into()))?;
            return Ok(home.join(locator.trim_start_matches('~').trim_start_matches('/')));
        }
        let path = Path::new(locator);
        if path.is_absolute() {
            Ok(path.to_path_buf())
        } else {
            Ok(self.base_dir.join(path))
        }
    }
}

fn is_remote(locator: &str) -> bool {
    locator.starts_with("http://") || locator.starts_with("https://")
}

fn url_stem(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let last = path.rsplit('/').next()?;
    Path::new(last)
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn with_stem(defaults: &DefinitionDefaults, stem: Option<String>) -> DefinitionDefaults {
    defaults.clone().or(&DefinitionDefaults { name: stem, db: None })
}

fn located(source: &str, err: RepoError) -> RepoError {
    RepoError::Config(format!("Invalid definition document {source}: {err}"))
}

/// Matching files for a path that may contain glob patterns, in sorted order.
/// A plain path must exist.
fn expand(path: &Path) -> Result<Vec<PathBuf>> {
    let pattern = path.to_string_lossy();
    if !pattern.contains(['*', '?', '[']) {
        if !path.is_file() {
            return Err(RepoError::Config(format!(
                "Definition file not found: {}",
                path.display()
            )));
        }
        return Ok(vec![path.to_path_buf()]);
    }

    let entries = glob::glob(&pattern)
        .map_err(|e| RepoError::Config(format!("Invalid definition pattern {pattern}: {e}")))?;
    let mut files = Vec::new();
    for entry in entries {
        match entry {
            Ok(file) if file.is_file() => files.push(file),
            Ok(_) => {}
            Err(e) => log::warn!("Skipping unreadable definition path: {e}"),
        }
    }
    files.sort();
    Ok(files)
}
