use anyhow::{anyhow, Context, Result};
use log::info;
use reqwest::Identity;
use std::io::BufReader;
use std::path::Path;

/// 读取PEM格式的证书和私钥，生成HTTPS客户端身份
pub fn load_identity(cert_file: &Path, key_file: &Path) -> Result<Identity> {
    let cert_pem = std::fs::read(cert_file)
        .with_context(|| format!("无法读取证书文件 {}", cert_file.display()))?;
    let key_pem = std::fs::read(key_file)
        .with_context(|| format!("无法读取私钥文件 {}", key_file.display()))?;

    let certs = rustls_pemfile::certs(&mut BufReader::new(cert_pem.as_slice()))
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("证书文件格式错误 {}", cert_file.display()))?;
    if certs.is_empty() {
        return Err(anyhow!("证书文件中没有证书: {}", cert_file.display()));
    }

    if rustls_pemfile::private_key(&mut BufReader::new(key_pem.as_slice()))
        .with_context(|| format!("私钥文件格式错误 {}", key_file.display()))?
        .is_none()
    {
        return Err(anyhow!("私钥文件中没有私钥: {}", key_file.display()));
    }

    // reqwest需要私钥和证书放在同一个PEM中
    let mut pem = key_pem;
    if !pem.ends_with(b"\n") {
        pem.push(b'\n');
    }
    pem.extend_from_slice(&cert_pem);

    let identity = Identity::from_pem(&pem).context("无法创建客户端身份")?;
    info!("已加载客户端证书: {} ({} 个证书)", cert_file.display(), certs.len());
    Ok(identity)
}
