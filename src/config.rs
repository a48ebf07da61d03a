use anyhow::{anyhow, Context, Result};
use std::env;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use url::Url;

use crate::constants::DEFAULT_WORKERS;

/// 配置项: (环境变量名, 默认值, 说明)
const DEFAULTS: &[(&str, &str, &str)] = &[
    ("SERVER_HOST", "127.0.0.1", "上传服务器地址"),
    ("SERVER_PORT", "14080", "上传服务器端口"),
    ("SERVER_CONTEXT", "upload", "上传接口路径"),
    ("USE_HTTPS", "false", "是否使用HTTPS"),
    ("CERT_FILE", "server.crt", "HTTPS客户端证书"),
    ("KEY_FILE", "server.key", "HTTPS客户端私钥"),
    ("AUTH_USERNAME", "user", "Basic认证用户名"),
    ("AUTH_PASSWORD", "password", "Basic认证密码"),
    ("SEND_DIR", "./send/", "待发送文件目录"),
    ("ARCHIVE_DIR", "./archive/", "已发送文件归档目录"),
    ("LOG_DIR", "./logs/", "日志目录"),
    ("LOG_FILE", "app_daily.log", "日志文件名"),
    ("NUM_WORKERS", "8", "并发上传数"),
];

#[derive(Debug, Clone)]
pub struct Config {
    // 服务器配置
    pub host: String,
    pub port: u16,
    pub context: String,
    pub use_https: bool,
    pub cert_file: PathBuf,
    pub key_file: PathBuf,

    // 认证
    pub username: String,
    pub password: String,

    // 目录
    pub send_dir: PathBuf,
    pub archive_dir: PathBuf,
    pub log_dir: PathBuf,
    pub log_file: String,

    pub num_workers: usize,
}

impl Config {
    /// 从.env文件和环境变量读取配置，调用前需要先执行ensure_env_file
    pub fn load(env_path: &Path) -> Result<Self> {
        dotenv::from_path(env_path)
            .with_context(|| format!("无法加载配置文件 {}", env_path.display()))?;
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// 从任意键值来源构建配置，缺失或为空的键使用默认值
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| -> String {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| default_value(key).to_string())
        };

        let port = get("SERVER_PORT")
            .parse::<u16>()
            .map_err(|e| anyhow!("SERVER_PORT必须是有效的端口号: {}", e))?;

        let num_workers = get("NUM_WORKERS")
            .parse::<usize>()
            .map_err(|e| anyhow!("NUM_WORKERS必须是非负整数: {}", e))?
            .max(1);

        let use_https = parse_bool(&get("USE_HTTPS"));

        Ok(Config {
            host: get("SERVER_HOST"),
            port,
            context: get("SERVER_CONTEXT").trim_matches('/').to_string(),
            use_https,
            cert_file: PathBuf::from(get("CERT_FILE")),
            key_file: PathBuf::from(get("KEY_FILE")),
            username: get("AUTH_USERNAME"),
            password: get("AUTH_PASSWORD"),
            send_dir: PathBuf::from(get("SEND_DIR")),
            archive_dir: PathBuf::from(get("ARCHIVE_DIR")),
            log_dir: PathBuf::from(get("LOG_DIR")),
            log_file: get("LOG_FILE"),
            num_workers,
        })
    }

    pub fn scheme(&self) -> &'static str {
        if self.use_https {
            "https"
        } else {
            "http"
        }
    }

    /// 上传地址: scheme://host:port/context
    pub fn endpoint_url(&self) -> Result<Url> {
        let raw = format!("{}://{}:{}/{}", self.scheme(), self.host, self.port, self.context);
        Url::parse(&raw).with_context(|| format!("无效的服务器地址: {}", raw))
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: default_value("SERVER_HOST").to_string(),
            port: 14080,
            context: default_value("SERVER_CONTEXT").to_string(),
            use_https: false,
            cert_file: PathBuf::from(default_value("CERT_FILE")),
            key_file: PathBuf::from(default_value("KEY_FILE")),
            username: default_value("AUTH_USERNAME").to_string(),
            password: default_value("AUTH_PASSWORD").to_string(),
            send_dir: PathBuf::from(default_value("SEND_DIR")),
            archive_dir: PathBuf::from(default_value("ARCHIVE_DIR")),
            log_dir: PathBuf::from(default_value("LOG_DIR")),
            log_file: default_value("LOG_FILE").to_string(),
            num_workers: DEFAULT_WORKERS,
        }
    }
}

fn default_value(key: &str) -> &'static str {
    DEFAULTS
        .iter()
        .find(|(name, _, _)| *name == key)
        .map(|(_, value, _)| *value)
        .unwrap_or("")
}

fn parse_bool(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "true" | "1" | "yes")
}

/// 创建默认的.env文件（如果不存在），否则补充缺失的配置项。
/// 返回本次写入的配置项名称
pub fn ensure_env_file(path: &Path) -> Result<Vec<String>> {
    if !path.exists() {
        let mut content = String::from("# 文件发送程序配置\n");
        for (key, value, comment) in DEFAULTS {
            content.push_str(&format!("# {}\n{}={}\n", comment, key, value));
        }
        fs::write(path, content)
            .with_context(|| format!("无法创建配置文件 {}", path.display()))?;
        return Ok(DEFAULTS.iter().map(|(key, _, _)| key.to_string()).collect());
    }

    let existing = fs::read_to_string(path)
        .with_context(|| format!("无法读取配置文件 {}", path.display()))?;
    let present: Vec<&str> = existing
        .lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .filter(|(_, value)| !value.trim().is_empty())
        .map(|(key, _)| key.trim())
        .collect();

    let missing: Vec<&(&str, &str, &str)> = DEFAULTS
        .iter()
        .filter(|(key, _, _)| !present.contains(key))
        .collect();
    if missing.is_empty() {
        return Ok(Vec::new());
    }

    let mut file = OpenOptions::new()
        .append(true)
        .open(path)
        .with_context(|| format!("无法写入配置文件 {}", path.display()))?;
    if !existing.is_empty() && !existing.ends_with('\n') {
        writeln!(file)?;
    }
    let mut added = Vec::with_capacity(missing.len());
    for (key, value, comment) in missing {
        writeln!(file, "# {}\n{}={}", comment, key, value)?;
        added.push(key.to_string());
    }
    Ok(added)
}
