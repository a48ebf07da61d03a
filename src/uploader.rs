use anyhow::{Context, Result};
use colored::Colorize;
use log::{debug, info};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use url::Url;

use crate::config::Config;
use crate::constants::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_REQUEST_TIMEOUT};
use crate::tls;
use crate::types::{TransferSnapshot, TransferStats};

/// multipart表单中文件字段的名称
pub const FILE_FIELD: &str = "file";

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("文件不存在: {}", .0.display())]
    FileNotFound(PathBuf),
    #[error("无法读取文件 {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("请求发送失败: {0}")]
    Request(#[from] reqwest::Error),
    #[error("服务器响应错误: {status} - {body}")]
    BadStatus { status: StatusCode, body: String },
}

#[derive(Debug, Clone)]
pub struct UploadReceipt {
    pub file_name: String,
    pub bytes: u64,
    pub stats: TransferSnapshot,
}

/// 创建HTTP客户端，启用HTTPS时加载客户端证书
pub fn build_client(config: &Config) -> Result<Client> {
    let mut builder = Client::builder()
        .use_rustls_tls()
        .connect_timeout(*DEFAULT_CONNECT_TIMEOUT)
        .timeout(*DEFAULT_REQUEST_TIMEOUT);

    if config.use_https {
        let identity = tls::load_identity(&config.cert_file, &config.key_file)?;
        builder = builder.identity(identity);
    }

    builder.build().context("无法创建HTTP客户端")
}

#[derive(Debug, Clone)]
pub struct Uploader {
    client: Client,
    endpoint: Url,
    username: String,
    password: String,
    stats: Arc<TransferStats>,
}

impl Uploader {
    pub fn new(
        client: Client,
        endpoint: Url,
        username: String,
        password: String,
        stats: Arc<TransferStats>,
    ) -> Self {
        Uploader {
            client,
            endpoint,
            username,
            password,
            stats,
        }
    }

    pub fn from_config(config: &Config, stats: Arc<TransferStats>) -> Result<Self> {
        let client = build_client(config)?;
        Ok(Self::new(
            client,
            config.endpoint_url()?,
            config.username.clone(),
            config.password.clone(),
            stats,
        ))
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// 把一个文件作为multipart表单上传，只有200 OK算成功
    pub async fn upload(&self, path: &Path) -> Result<UploadReceipt, UploadError> {
        info!("开始发送文件: {}", path.display());

        let content = match tokio::fs::read(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(UploadError::FileNotFound(path.to_path_buf()))
            }
            Err(e) => {
                return Err(UploadError::Io {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        let bytes = content.len() as u64;
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        let part = Part::bytes(content)
            .file_name(file_name.clone())
            .mime_str("application/octet-stream")?;
        let form = Form::new().part(FILE_FIELD, part);

        let response = self
            .client
            .post(self.endpoint.clone())
            .basic_auth(&self.username, Some(&self.password))
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(UploadError::BadStatus { status, body });
        }
        debug!("连接成功: {} -POST- {}", self.endpoint, status);

        let stats = self.stats.record(&file_name, bytes);
        println!(
            "{}",
            format!("文件发送成功: {} | {}", file_name, stats).green()
        );

        Ok(UploadReceipt {
            file_name,
            bytes,
            stats,
        })
    }
}
