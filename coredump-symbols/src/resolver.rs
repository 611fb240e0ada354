//! Content-hash keyed debug symbol retrieval and unstripping.

use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use futures_util::future;
use md5::{Digest, Md5};
use reqwest::Client;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use coredump_common::Module;

use crate::{run_tool, SymbolError};

/// Where debug symbols live and which modules participate in lookup.
#[derive(Debug, Clone)]
pub struct SymbolStoreConfig {
    /// Root of the on-disk cache, laid out as `{root}/{hash}/{stem}.dbg`.
    pub cache_root: PathBuf,
    /// URL template with `{hash}` and `{file}` placeholders. `None` disables
    /// remote retrieval entirely.
    pub url_template: Option<String>,
    /// Module file-name fragments that opt a module into symbol lookup.
    pub vendor_name_fragments: Vec<String>,
    /// Module path fragments that opt a module into symbol lookup.
    pub vendor_path_fragments: Vec<String>,
    /// The eu-unstrip executable.
    pub unstrip_tool: String,
    pub download_timeout: Duration,
}

impl Default for SymbolStoreConfig {
    fn default() -> SymbolStoreConfig {
        SymbolStoreConfig {
            cache_root: PathBuf::from("/debugsymbols"),
            url_template: None,
            vendor_name_fragments: vec!["libruxit".into(), "liboneagent".into()],
            vendor_path_fragments: vec![
                "/lib/ruxit".into(),
                "/lib64/ruxit".into(),
                "/lib/oneagent".into(),
                "/lib64/oneagent".into(),
            ],
            unstrip_tool: "eu-unstrip".into(),
            download_timeout: Duration::from_secs(300),
        }
    }
}

/// Fetches debug symbol files for the modules of one reconstruction and
/// merges them back into the stripped binaries.
pub struct DebugSymbolResolver {
    config: SymbolStoreConfig,
    client: Client,
}

impl DebugSymbolResolver {
    pub fn new(config: SymbolStoreConfig) -> DebugSymbolResolver {
        let client = Client::builder()
            .timeout(config.download_timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        DebugSymbolResolver { config, client }
    }

    /// Resolves debug symbols for every distinct module path, concurrently.
    ///
    /// Duplicate paths are resolved once; the first occurrence in list order
    /// carries the result.
    pub async fn resolve_all(&self, modules: &mut [Module]) {
        let mut seen = HashSet::new();
        let tasks: Vec<_> = modules
            .iter_mut()
            .filter(|module| seen.insert(module.path.clone()))
            .map(|module| self.resolve_module(module))
            .collect();
        future::join_all(tasks).await;
    }

    async fn resolve_module(&self, module: &mut Module) {
        let Some(local_path) = module.local_path.clone() else {
            return;
        };
        if !self.is_vendor_module(module) {
            return;
        }
        let hash = match file_md5(&local_path).await {
            Ok(hash) => hash,
            Err(e) => {
                warn!("could not hash {}: {e}", local_path.display());
                return;
            }
        };
        let debug_file = self.debug_file_path(&local_path, &hash);
        if debug_file.is_file() {
            module.debug_symbol_path = Some(debug_file.clone());
        } else {
            match self.download(&local_path, &hash, &debug_file).await {
                Ok(()) => {
                    info!(
                        "downloaded debug symbols for {} to {}",
                        module.path,
                        debug_file.display()
                    );
                    module.debug_symbol_path = Some(debug_file.clone());
                }
                Err(SymbolError::NoStore) => {
                    debug!("no symbol store configured, skipping {}", module.path)
                }
                Err(e) => warn!("failed to fetch debug symbols for {}: {e}", module.path),
            }
        }

        if module.debug_symbol_path.is_some() {
            self.unstrip(&local_path, &debug_file).await;
        }
    }

    fn is_vendor_module(&self, module: &Module) -> bool {
        self.config
            .vendor_name_fragments
            .iter()
            .any(|fragment| module.name.contains(fragment))
            || self
                .config
                .vendor_path_fragments
                .iter()
                .any(|fragment| module.path.contains(fragment))
    }

    /// `{cache_root}/{hash}/{stem}.dbg`
    fn debug_file_path(&self, local_path: &Path, hash: &str) -> PathBuf {
        self.config
            .cache_root
            .join(hash)
            .join(debug_file_name(local_path))
    }

    async fn download(
        &self,
        local_path: &Path,
        hash: &str,
        destination: &Path,
    ) -> Result<(), SymbolError> {
        let template = self.config.url_template.as_ref().ok_or(SymbolError::NoStore)?;
        let url = template
            .replace("{hash}", hash)
            .replace("{file}", &debug_file_name(local_path));
        debug!("trying {url}");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .and_then(|r| r.error_for_status())?;
        let body = response.bytes().await?;

        // Write through a temp file so a concurrent analysis never sees a
        // partially downloaded symbol file in the cache.
        let parent = destination.parent().ok_or(SymbolError::NotFound)?;
        std::fs::create_dir_all(parent)?;
        let mut temp = NamedTempFile::new_in(parent)?;
        temp.write_all(&body)?;
        temp.persist(destination).map_err(|e| e.error)?;
        Ok(())
    }

    /// Replaces the stripped binary with a fully symboled one.
    ///
    /// Best effort: on any failure the original binary is left in place (or
    /// restored from the `.old` copy) and the pipeline continues stripped.
    async fn unstrip(&self, local_path: &Path, debug_file: &Path) {
        let old = with_old_suffix(local_path);
        if let Err(e) = tokio::fs::rename(local_path, &old).await {
            warn!("could not move {} aside: {e}", local_path.display());
            return;
        }
        let result = run_tool(
            &self.config.unstrip_tool,
            &[
                "-o",
                &local_path.to_string_lossy(),
                &old.to_string_lossy(),
                &debug_file.to_string_lossy(),
            ],
        )
        .await;
        match result {
            Ok(_) if local_path.is_file() => {
                let _ = tokio::fs::remove_file(&old).await;
            }
            other => {
                if let Err(e) = other {
                    warn!("unstrip of {} failed: {e}", local_path.display());
                }
                // Put the stripped binary back so later stages still have one.
                let _ = tokio::fs::rename(&old, local_path).await;
            }
        }
    }
}

/// `libfoo.so` -> `libfoo.dbg`
fn debug_file_name(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("{stem}.dbg")
}

fn with_old_suffix(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".old");
    PathBuf::from(name)
}

/// MD5 of the whole file, lowercase hex. The remote store keys symbol files
/// by this digest of the stripped binary.
pub async fn file_md5(path: &Path) -> std::io::Result<String> {
    let contents = tokio::fs::read(path).await?;
    let digest = Md5::digest(&contents);
    Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vendor_module(name: &str, path: &str) -> Module {
        let mut module = Module::new(path, 0x1000, 0x2000, 0);
        module.name = name.to_string();
        module
    }

    #[test]
    fn test_vendor_filter() {
        let resolver = DebugSymbolResolver::new(SymbolStoreConfig::default());
        assert!(resolver.is_vendor_module(&vendor_module(
            "liboneagentproc.so",
            "/opt/liboneagentproc.so"
        )));
        assert!(resolver.is_vendor_module(&vendor_module(
            "libsomething.so",
            "/usr/lib64/ruxit/libsomething.so"
        )));
        assert!(!resolver.is_vendor_module(&vendor_module("libc.so.6", "/usr/lib64/libc.so.6")));
    }

    #[test]
    fn test_debug_file_name_replaces_extension() {
        assert_eq!(debug_file_name(Path::new("/x/libruxit.so")), "libruxit.dbg");
        assert_eq!(debug_file_name(Path::new("agent")), "agent.dbg");
    }

    #[test]
    fn test_debug_file_path_layout() {
        let resolver = DebugSymbolResolver::new(SymbolStoreConfig {
            cache_root: PathBuf::from("/debugsymbols"),
            ..Default::default()
        });
        assert_eq!(
            resolver.debug_file_path(Path::new("/lib/liboneagent.so"), "abc123"),
            PathBuf::from("/debugsymbols/abc123/liboneagent.dbg")
        );
    }

    #[tokio::test]
    async fn test_file_md5_known_digest() {
        let mut temp = NamedTempFile::new().unwrap();
        temp.write_all(b"hello world").unwrap();
        let hash = file_md5(temp.path()).await.unwrap();
        assert_eq!(hash, "5eb63bbbe01eeed093cb22bb8f5acdc3");
    }

    #[tokio::test]
    async fn test_resolve_all_skips_modules_without_local_binary() {
        let resolver = DebugSymbolResolver::new(SymbolStoreConfig::default());
        let mut modules = vec![vendor_module("liboneagent.so", "/lib/oneagent/liboneagent.so")];
        resolver.resolve_all(&mut modules).await;
        assert!(modules[0].debug_symbol_path.is_none());
    }
}
