use crate::error::DepotError;
use anyhow::{Context, Result};
use rcgen::generate_simple_self_signed;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::WebPkiSupportedAlgorithms;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{
    CertificateError, DigitallySignedStruct, DistinguishedName, OtherError, SignatureScheme,
};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::rustls;

/// 证书指纹：DER 的 sha256 十六进制
pub fn fingerprint(der: &[u8]) -> String {
    hex::encode(Sha256::digest(der))
}

/// 计算 PEM 证书（第一张）的指纹
pub fn fingerprint_pem(cert_pem: &str) -> Result<String> {
    let certs = certs_from_pem(cert_pem)?;
    let leaf = certs.first().context("No certificate found in PEM data")?;
    Ok(fingerprint(leaf.as_ref()))
}

/// 解析 PEM 证书链
pub fn certs_from_pem(pem: &str) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = pem.as_bytes();
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("Failed to parse certificates")?;
    if certs.is_empty() {
        anyhow::bail!("No certificate found in PEM data");
    }
    Ok(certs)
}

/// 解析 PEM 私钥
pub fn key_from_pem(pem: &str) -> Result<PrivateKeyDer<'static>> {
    let mut reader = pem.as_bytes();
    rustls_pemfile::private_key(&mut reader)
        .context("Failed to parse private key")?
        .context("No private key found")
}

fn read_pem(path: &Path, what: &str) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Failed to open {} file: {:?}", what, path))
}

/// HTTP/2 的 ALPN 标识
pub const ALPN_H2: &[u8] = b"h2";

/// 加载服务器 TLS 配置
///
/// 请求但不强制客户端证书：注册流程在持有证书之前进行，
/// 身份由证书指纹在应用层判定，握手签名仍然校验。
pub fn load_server_config(cert_path: &Path, key_path: &Path) -> Result<Arc<rustls::ServerConfig>> {
    let certs = certs_from_pem(&read_pem(cert_path, "cert")?)?;
    let key = key_from_pem(&read_pem(key_path, "key")?)?;

    let mut config = rustls::ServerConfig::builder()
        .with_client_cert_verifier(Arc::new(OptionalClientCert::new()))
        .with_single_cert(certs, key)
        .context("Failed to create server config")?;
    config.alpn_protocols = vec![ALPN_H2.to_vec()];

    Ok(Arc::new(config))
}

/// 加载客户端 TLS 配置
///
/// 服务器证书不走 CA 校验，而是在握手中与固定指纹比对，不匹配时握手失败。
/// `identity` 为 (证书 PEM, 私钥 PEM)；`pin` 为空时接受任何证书（注册阶段）。
pub fn load_client_config(
    identity: Option<(&str, &str)>,
    pin: Option<&str>,
) -> Result<Arc<rustls::ClientConfig>> {
    let builder = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(PinnedServerCert::new(pin)));

    let mut config = match identity {
        Some((cert_pem, key_pem)) => builder
            .with_client_auth_cert(certs_from_pem(cert_pem)?, key_from_pem(key_pem)?)
            .context("Failed to load client certificate")?,
        None => builder.with_no_client_auth(),
    };
    config.alpn_protocols = vec![ALPN_H2.to_vec()];

    Ok(Arc::new(config))
}

/// 生成自签名证书和私钥并写入指定路径
pub fn generate_self_signed_cert(
    common_name: &str,
    alt_names: &[String],
    cert_out: &Path,
    key_out: &Path,
) -> Result<String> {
    let mut names: Vec<String> = alt_names.to_vec();
    if !names.iter().any(|n| n == common_name) {
        names.push(common_name.to_string());
    }

    let cert =
        generate_simple_self_signed(names).context("Failed to generate self-signed certificate")?;
    let cert_pem = cert.cert.pem();
    let key_pem = cert.signing_key.serialize_pem();

    std::fs::write(cert_out, &cert_pem)
        .with_context(|| format!("Failed to write certificate to {:?}", cert_out))?;
    crate::certs::write_private(key_out, &key_pem)?;

    Ok(fingerprint(cert.cert.der()))
}

fn signature_algorithms() -> WebPkiSupportedAlgorithms {
    rustls::crypto::aws_lc_rs::default_provider().signature_verification_algorithms
}

/// 从 TLS 握手错误中取出指纹不匹配的详情
pub fn fingerprint_mismatch(err: &std::io::Error) -> Option<DepotError> {
    let tls_err = err.get_ref()?.downcast_ref::<rustls::Error>()?;
    let rustls::Error::InvalidCertificate(CertificateError::Other(other)) = tls_err else {
        return None;
    };
    match other.0.downcast_ref::<DepotError>()? {
        DepotError::FingerprintMismatch { expected, actual } => {
            Some(DepotError::FingerprintMismatch {
                expected: expected.clone(),
                actual: actual.clone(),
            })
        }
        _ => None,
    }
}

/// 服务端证书验证器：信任由指纹比对完成，握手签名照常校验
#[derive(Debug)]
struct PinnedServerCert {
    algorithms: WebPkiSupportedAlgorithms,
    pin: Option<String>,
}

impl PinnedServerCert {
    fn new(pin: Option<&str>) -> Self {
        Self {
            algorithms: signature_algorithms(),
            pin: pin.map(str::to_ascii_lowercase),
        }
    }
}

impl ServerCertVerifier for PinnedServerCert {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer,
        _intermediates: &[CertificateDer],
        _server_name: &ServerName,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let Some(expected) = &self.pin else {
            return Ok(ServerCertVerified::assertion());
        };
        let actual = fingerprint(end_entity.as_ref());
        if &actual != expected {
            let mismatch = DepotError::FingerprintMismatch {
                expected: expected.clone(),
                actual,
            };
            return Err(rustls::Error::InvalidCertificate(CertificateError::Other(
                OtherError(Arc::new(mismatch)),
            )));
        }
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// 客户端证书验证器：证书可选，链不校验，握手签名照常校验
#[derive(Debug)]
struct OptionalClientCert {
    algorithms: WebPkiSupportedAlgorithms,
}

impl OptionalClientCert {
    fn new() -> Self {
        Self {
            algorithms: signature_algorithms(),
        }
    }
}

impl ClientCertVerifier for OptionalClientCert {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        false
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer,
        _intermediates: &[CertificateDer],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_and_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("server.crt");
        let key = dir.path().join("server.key");

        let fp = generate_self_signed_cert("localhost", &["127.0.0.1".to_string()], &cert, &key)
            .unwrap();
        assert_eq!(fp.len(), 64);

        let pem = std::fs::read_to_string(&cert).unwrap();
        assert_eq!(fingerprint_pem(&pem).unwrap(), fp);
        let config = load_server_config(&cert, &key).unwrap();
        assert_eq!(config.alpn_protocols, vec![ALPN_H2.to_vec()]);
    }

    #[test]
    fn test_client_config_with_identity() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("c.crt");
        let key = dir.path().join("c.key");
        generate_self_signed_cert("client", &[], &cert, &key).unwrap();

        let cert_pem = std::fs::read_to_string(&cert).unwrap();
        let key_pem = std::fs::read_to_string(&key).unwrap();
        assert!(load_client_config(Some((&cert_pem, &key_pem)), None).is_ok());
        let pinned = load_client_config(None, Some(&"ab".repeat(32))).unwrap();
        assert_eq!(pinned.alpn_protocols, vec![ALPN_H2.to_vec()]);
    }

    #[test]
    fn test_pinned_verifier() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("server.crt");
        let key = dir.path().join("server.key");
        let fp = generate_self_signed_cert("localhost", &[], &cert, &key).unwrap();
        let der = certs_from_pem(&std::fs::read_to_string(&cert).unwrap()).unwrap();
        let name = ServerName::try_from("localhost").unwrap();
        let verify = |pin: Option<&str>| {
            PinnedServerCert::new(pin).verify_server_cert(&der[0], &[], &name, &[], UnixTime::now())
        };

        assert!(verify(None).is_ok());
        assert!(verify(Some(&fp.to_uppercase())).is_ok());

        let err = verify(Some(&"00".repeat(32))).unwrap_err();
        let wrapped = std::io::Error::new(std::io::ErrorKind::InvalidData, err);
        match fingerprint_mismatch(&wrapped) {
            Some(DepotError::FingerprintMismatch { expected, actual }) => {
                assert_eq!(expected, "00".repeat(32));
                assert_eq!(actual, fp);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(fingerprint_mismatch(&std::io::Error::other("reset")).is_none());
    }

    #[test]
    fn test_bad_pem() {
        assert!(fingerprint_pem("garbage").is_err());
        assert!(key_from_pem("garbage").is_err());
    }
}
