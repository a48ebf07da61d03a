use anyhow::{anyhow, Context, Result};
use chrono::{Local, NaiveDate};
use log::{info, warn};
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::constants::ARCHIVE_DATE_FORMAT;

/// 把已发送的文件移动到按日期划分的归档目录
#[derive(Debug, Clone)]
pub struct ArchiveMover {
    root: PathBuf,
}

impl ArchiveMover {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn dir_for(&self, date: NaiveDate) -> PathBuf {
        self.root.join(date.format(ARCHIVE_DATE_FORMAT).to_string())
    }

    pub async fn archive(&self, path: &Path) -> Result<PathBuf> {
        self.archive_on(path, Local::now().date_naive()).await
    }

    pub async fn archive_on(&self, path: &Path, date: NaiveDate) -> Result<PathBuf> {
        let file_name = path
            .file_name()
            .ok_or_else(|| anyhow!("无效的文件路径: {}", path.display()))?;

        let dest_dir = self.dir_for(date);
        fs::create_dir_all(&dest_dir)
            .await
            .with_context(|| format!("无法创建归档目录 {}", dest_dir.display()))?;

        let dest = free_destination(&dest_dir, Path::new(file_name)).await;
        move_file(path, &dest).await?;

        info!("文件已移动到归档: {}", dest.display());
        Ok(dest)
    }
}

/// 目标文件名已存在时依次尝试 name_1.ext, name_2.ext ...
async fn free_destination(dir: &Path, file_name: &Path) -> PathBuf {
    let candidate = dir.join(file_name);
    if !exists(&candidate).await {
        return candidate;
    }

    let stem = file_name
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = file_name
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    let mut counter = 1u32;
    loop {
        let candidate = dir.join(format!("{}_{}{}", stem, counter, ext));
        if !exists(&candidate).await {
            return candidate;
        }
        counter += 1;
    }
}

async fn exists(path: &Path) -> bool {
    fs::symlink_metadata(path).await.is_ok()
}

async fn move_file(from: &Path, to: &Path) -> Result<()> {
    let rename_err = match fs::rename(from, to).await {
        Ok(()) => return Ok(()),
        Err(e) => e,
    };

    // 归档目录可能在另一个文件系统上，退回到复制后删除
    warn!(
        "重命名失败，尝试复制: {} -> {}: {}",
        from.display(),
        to.display(),
        rename_err
    );
    fs::copy(from, to).await.with_context(|| {
        format!("无法移动文件到归档 {} -> {}", from.display(), to.display())
    })?;
    if let Err(e) = fs::remove_file(from).await {
        // 源文件删不掉时撤销复制，文件只留在发送目录
        let _ = fs::remove_file(to).await;
        return Err(anyhow!("复制后无法删除源文件 {}: {}", from.display(), e));
    }
    Ok(())
}
