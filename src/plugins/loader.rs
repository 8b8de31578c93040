// 插件加载器
// 扫描插件目录并解析清单，坏清单只影响自身

use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::config::PluginsConfig;
use crate::errors::{CoreError, CoreResult};
use crate::plugins::interface::{PluginDescriptor, PluginManifest};

/// 插件加载器
pub struct PluginLoader {
    config: PluginsConfig,
}

impl PluginLoader {
    /// 创建新的插件加载器
    pub fn new(config: Option<PluginsConfig>) -> Self {
        Self {
            config: config.unwrap_or_default(),
        }
    }

    /// 扫描插件目录
    ///
    /// 目录不存在时返回空列表。每个候选产生一个描述符，清单无效或名称重复的为 `Failed`。
    pub async fn scan(&self, directory: &Path) -> CoreResult<Vec<PluginDescriptor>> {
        debug!("扫描插件目录: {}", directory.display());

        if fs::metadata(directory).await.is_err() {
            warn!("插件目录不存在: {}", directory.display());
            return Ok(Vec::new());
        }

        let candidates = self.candidates(directory).await?;
        let mut descriptors = Vec::with_capacity(candidates.len());
        let mut seen = HashSet::new();

        for path in candidates {
            let mut descriptor = self.read_manifest(&path).await;
            if descriptor.manifest.is_some() && !seen.insert(descriptor.name.clone()) {
                let reason = CoreError::manifest_invalid(
                    path.display().to_string(),
                    format!("插件名称 '{}' 重复", descriptor.name),
                );
                warn!(plugin = %descriptor.name, path = %path.display(), "忽略重复的插件清单");
                descriptor = PluginDescriptor::rejected(
                    descriptor.name.clone(),
                    path,
                    descriptor.checksum.clone(),
                    descriptor.size_bytes,
                    &reason,
                );
            }
            descriptors.push(descriptor);
        }

        info!("扫描到 {} 个插件清单", descriptors.len());
        Ok(descriptors)
    }

    /// 候选清单：`<子目录>/<manifest_file>` 或目录下的 `*.toml`，按路径排序
    async fn candidates(&self, directory: &Path) -> CoreResult<Vec<PathBuf>> {
        let mut entries = fs::read_dir(directory).await?;
        let mut candidates = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                let manifest = path.join(&self.config.manifest_file);
                if fs::metadata(&manifest).await.is_ok() {
                    candidates.push(manifest);
                }
            } else if path.extension().is_some_and(|ext| ext == "toml") {
                candidates.push(path);
            }
        }

        candidates.sort();
        Ok(candidates)
    }

    /// 读取单个清单；任何错误都转为 `Failed` 描述符
    pub async fn read_manifest(&self, path: &Path) -> PluginDescriptor {
        let fallback = fallback_name(path, &self.config.manifest_file);
        let source = path.display().to_string();

        let size_bytes = match fs::metadata(path).await {
            Ok(metadata) => metadata.len(),
            Err(err) => {
                let reason = CoreError::manifest_invalid(&source, format!("无法读取: {}", err));
                return PluginDescriptor::rejected(fallback, path.to_path_buf(), None, 0, &reason);
            }
        };

        if size_bytes > self.config.max_manifest_bytes {
            let reason = CoreError::manifest_invalid(
                &source,
                format!(
                    "清单过大: {} 字节，最大允许: {} 字节",
                    size_bytes, self.config.max_manifest_bytes
                ),
            );
            warn!(path = %source, size_bytes, "插件清单超过大小限制");
            return PluginDescriptor::rejected(fallback, path.to_path_buf(), None, size_bytes, &reason);
        }

        let content = match fs::read(path).await {
            Ok(content) => content,
            Err(err) => {
                let reason = CoreError::manifest_invalid(&source, format!("无法读取: {}", err));
                return PluginDescriptor::rejected(fallback, path.to_path_buf(), None, size_bytes, &reason);
            }
        };
        let checksum = checksum(&content);

        let parsed = String::from_utf8(content)
            .map_err(|_| CoreError::manifest_invalid(&source, "清单不是合法的 UTF-8 文本"))
            .and_then(|text| PluginManifest::parse(&text, &source));

        match parsed {
            Ok(manifest) => {
                debug!(plugin = %manifest.name, version = %manifest.version, path = %source, "解析插件清单");
                PluginDescriptor::discovered(manifest, path.to_path_buf(), checksum, size_bytes)
            }
            Err(reason) => {
                warn!(path = %source, error = %reason, "插件清单无效");
                PluginDescriptor::rejected(fallback, path.to_path_buf(), Some(checksum), size_bytes, &reason)
            }
        }
    }
}

/// 清单 SHA-256（十六进制）
pub fn checksum(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}

/// 清单无效时用目录名或文件名作为插件名
fn fallback_name(path: &Path, manifest_file: &str) -> String {
    let is_manifest_file = path.file_name().is_some_and(|name| name == manifest_file);
    let stem = if is_manifest_file {
        path.parent().and_then(Path::file_name)
    } else {
        path.file_stem()
    };
    stem.map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
