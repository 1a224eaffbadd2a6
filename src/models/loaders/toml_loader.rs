//! 评分标准与作答文件的加载

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::error::{AppResult, FileError};
use crate::models::guide::MarkingGuide;

/// 支持识别的作答文件扩展名
const SUBMISSION_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp", "bmp", "tif", "tiff"];

/// 从 TOML 文件加载评分标准
pub async fn load_guide(toml_file_path: &Path) -> AppResult<MarkingGuide> {
    let path = toml_file_path.display().to_string();
    if !toml_file_path.exists() {
        return Err(FileError::NotFound { path }.into());
    }

    let content = fs::read_to_string(toml_file_path)
        .await
        .map_err(|source| FileError::ReadFailed {
            path: path.clone(),
            source,
        })?;

    let mut guide: MarkingGuide =
        toml::from_str(&content).map_err(|source| FileError::TomlParseFailed {
            path: path.clone(),
            source,
        })?;

    let invalid = |reason: String| FileError::InvalidGuide {
        path: path.clone(),
        reason,
    };
    if guide.questions.is_empty() {
        return Err(invalid("没有题目".to_string()).into());
    }

    let mut seen = HashSet::new();
    for question in &guide.questions {
        if !seen.insert(question.id.as_str()) {
            return Err(invalid(format!("题号重复: {}", question.id)).into());
        }
        if !(question.max_score > 0.0) {
            return Err(invalid(format!("题目 {} 的满分必须大于 0", question.id)).into());
        }
    }

    // 设置文件路径
    guide.file_path = Some(path);

    tracing::info!(
        "成功加载评分标准: {} ({} 道题, 满分 {})",
        guide.title,
        guide.questions.len(),
        guide.total_marks()
    );

    Ok(guide)
}

/// 列出文件夹中所有待识别的作答图片（按文件名排序）
pub async fn list_submission_files(folder_path: &str) -> AppResult<Vec<PathBuf>> {
    let folder = PathBuf::from(folder_path);

    if !folder.exists() {
        return Err(FileError::NotFound {
            path: folder_path.to_string(),
        }
        .into());
    }

    let read_failed = |source| FileError::ReadFailed {
        path: folder_path.to_string(),
        source,
    };
    let mut files = Vec::new();
    let mut entries = fs::read_dir(&folder).await.map_err(read_failed)?;

    while let Some(entry) = entries.next_entry().await.map_err(read_failed)? {
        let path = entry.path();
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .map(|s| s.to_ascii_lowercase());
        if ext.as_deref().is_some_and(|e| SUBMISSION_EXTENSIONS.contains(&e)) {
            files.push(path);
        }
    }

    if files.is_empty() {
        tracing::warn!("在文件夹 {} 中没有找到作答图片", folder_path);
    }

    files.sort();
    Ok(files)
}
