//! Client certificate minting.
//!
//! The server hands every new user a certificate/key pair and remembers the
//! certificate's fingerprint. Minting sits behind [`CertificateMinter`] so the
//! built-in rcgen CA and an external issuing program are interchangeable.

use crate::error::{DepotError, Result};
use crate::tls;
use anyhow::Context;
use async_trait::async_trait;
use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
    KeyUsagePurpose,
};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// 新签发的证书
#[derive(Debug, Clone)]
pub struct MintedCertificate {
    pub cert_pem: String,
    pub key_pem: String,
    pub fingerprint: String,
}

/// 证书签发方
#[async_trait]
pub trait CertificateMinter: Send + Sync {
    /// 启动前检查依赖是否就绪，失败时服务器不应启动
    fn preflight(&self) -> Result<()> {
        Ok(())
    }

    async fn mint(&self, identity: &str) -> Result<MintedCertificate>;
}

/// 写入私钥文件（Unix 下权限 0600）
pub fn write_private(path: &Path, contents: &str) -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;

        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .with_context(|| format!("Failed to write private key to {:?}", path))?;
        file.write_all(contents.as_bytes())
            .with_context(|| format!("Failed to write private key to {:?}", path))?;
    }

    #[cfg(not(unix))]
    std::fs::write(path, contents)
        .with_context(|| format!("Failed to write private key to {:?}", path))?;

    Ok(())
}

fn ca_params(org_name: &str) -> CertificateParams {
    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params
        .distinguished_name
        .push(DnType::CommonName, format!("{} CA", org_name));
    params
        .distinguished_name
        .push(DnType::OrganizationName, org_name);
    params.key_usages.push(KeyUsagePurpose::KeyCertSign);
    params.key_usages.push(KeyUsagePurpose::CrlSign);
    params
}

fn generation_error(e: rcgen::Error) -> DepotError {
    DepotError::Other(anyhow::anyhow!("Certificate generation error: {}", e))
}

/// 存储目录中的 CA
pub struct CertificateAuthority {
    params: CertificateParams,
    key_pair: KeyPair,
    cert_pem: String,
}

impl CertificateAuthority {
    /// 生成新的自签名 CA
    pub fn generate(org_name: &str) -> Result<Self> {
        let params = ca_params(org_name);
        let key_pair = KeyPair::generate().map_err(generation_error)?;
        let cert = params.self_signed(&key_pair).map_err(generation_error)?;
        Ok(Self {
            cert_pem: cert.pem(),
            params,
            key_pair,
        })
    }

    /// 读取已有 CA，不存在时生成并写入
    pub fn load_or_create(cert_path: &Path, key_path: &Path, org_name: &str) -> Result<Self> {
        if cert_path.exists() && key_path.exists() {
            let key_pem = std::fs::read_to_string(key_path)
                .with_context(|| format!("Failed to read CA key {:?}", key_path))?;
            let cert_pem = std::fs::read_to_string(cert_path)
                .with_context(|| format!("Failed to read CA certificate {:?}", cert_path))?;
            let key_pair = KeyPair::from_pem(&key_pem).map_err(generation_error)?;
            // 签发者名称取自已有证书，与 ca.crt 保持一致
            let params = CertificateParams::from_ca_cert_pem(&cert_pem).map_err(generation_error)?;
            debug!("Loaded certificate authority from {:?}", cert_path);
            return Ok(Self {
                params,
                key_pair,
                cert_pem,
            });
        }

        let ca = Self::generate(org_name)?;
        std::fs::write(cert_path, &ca.cert_pem)
            .with_context(|| format!("Failed to write CA certificate {:?}", cert_path))?;
        write_private(key_path, &ca.key_pair.serialize_pem())?;
        info!("Generated certificate authority at {:?}", cert_path);
        Ok(ca)
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// 签发客户端证书，CN 为用户名
    pub fn issue_client(&self, identity: &str) -> Result<MintedCertificate> {
        let issuer = Issuer::from_params(&self.params, &self.key_pair);

        let mut params = CertificateParams::default();
        params.distinguished_name.push(DnType::CommonName, identity);
        params
            .extended_key_usages
            .push(ExtendedKeyUsagePurpose::ClientAuth);

        let key = KeyPair::generate().map_err(generation_error)?;
        let cert = params.signed_by(&key, &issuer).map_err(generation_error)?;

        Ok(MintedCertificate {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
            fingerprint: tls::fingerprint(cert.der()),
        })
    }
}

/// 内置签发方：使用存储目录中的 CA
pub struct RcgenMinter {
    ca: CertificateAuthority,
}

impl RcgenMinter {
    pub fn new(ca: CertificateAuthority) -> Self {
        Self { ca }
    }
}

#[async_trait]
impl CertificateMinter for RcgenMinter {
    async fn mint(&self, identity: &str) -> Result<MintedCertificate> {
        self.ca.issue_client(identity)
    }
}

/// 外部程序签发方
///
/// 以 `program [args...] <identity> <out_dir>` 调用，程序需写出
/// `<out_dir>/<identity>.crt` 与 `<out_dir>/<identity>.key`，并可在标准输出
/// 打印 `fingerprint=<hex>`；打印的指纹必须与证书一致。
pub struct CommandMinter {
    program: String,
    args: Vec<String>,
    out_dir: PathBuf,
}

impl CommandMinter {
    pub fn new(program: impl Into<String>, args: Vec<String>, out_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args,
            out_dir: out_dir.into(),
        }
    }

    fn locate_program(&self) -> Option<PathBuf> {
        let candidate = Path::new(&self.program);
        if candidate.components().count() > 1 {
            return candidate.is_file().then(|| candidate.to_path_buf());
        }
        let search = std::env::var_os("PATH")?;
        std::env::split_paths(&search)
            .map(|dir| dir.join(&self.program))
            .find(|p| p.is_file())
    }
}

/// 从程序输出中提取指纹（支持 `fingerprint=` 与 openssl 的 `SHA256 Fingerprint=`）
pub fn scrape_fingerprint(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let (label, value) = line.split_once('=')?;
        if !label.trim().to_ascii_lowercase().ends_with("fingerprint") {
            return None;
        }
        let normalized: String = value
            .trim()
            .chars()
            .filter(|c| *c != ':')
            .collect::<String>()
            .to_ascii_lowercase();
        (!normalized.is_empty() && normalized.chars().all(|c| c.is_ascii_hexdigit()))
            .then_some(normalized)
    })
}

#[async_trait]
impl CertificateMinter for CommandMinter {
    fn preflight(&self) -> Result<()> {
        match self.locate_program() {
            Some(path) => {
                debug!("Certificate minter found at {:?}", path);
                Ok(())
            }
            None => Err(DepotError::Other(anyhow::anyhow!(
                "Certificate minting program '{}' not found",
                self.program
            ))),
        }
    }

    async fn mint(&self, identity: &str) -> Result<MintedCertificate> {
        let output = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .arg(identity)
            .arg(&self.out_dir)
            .output()
            .await
            .with_context(|| format!("Failed to run {}", self.program))?;

        if !output.status.success() {
            return Err(DepotError::Other(anyhow::anyhow!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let cert_path = self.out_dir.join(format!("{}.crt", identity));
        let key_path = self.out_dir.join(format!("{}.key", identity));
        let cert_pem = tokio::fs::read_to_string(&cert_path)
            .await
            .with_context(|| format!("Minter did not produce {:?}", cert_path))?;
        let key_pem = tokio::fs::read_to_string(&key_path)
            .await
            .with_context(|| format!("Minter did not produce {:?}", key_path))?;

        let fingerprint = tls::fingerprint_pem(&cert_pem)?;
        match scrape_fingerprint(&String::from_utf8_lossy(&output.stdout)) {
            Some(reported) if reported != fingerprint => {
                return Err(DepotError::Other(anyhow::anyhow!(
                    "Minter reported fingerprint {} but certificate hashes to {}",
                    reported,
                    fingerprint
                )));
            }
            Some(_) => {}
            None => warn!("{} did not report a fingerprint", self.program),
        }

        Ok(MintedCertificate {
            cert_pem,
            key_pem,
            fingerprint,
        })
    }
}
