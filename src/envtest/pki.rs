//! Throwaway PKI for the ephemeral control plane
//!
//! Everything here lives for one test run: a self-signed CA, a serving
//! certificate for the API server on loopback, an admin client certificate
//! in `system:masters`, and a service-account signing key.

use std::path::{Path, PathBuf};

use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};

use crate::Error;

/// Subject of the admin client certificate
pub const ADMIN_USER: &str = "retval-admin";
/// Group granting cluster-admin through the default RBAC bootstrap policy
pub const ADMIN_GROUP: &str = "system:masters";

/// Certificates are valid for one day; the control plane lives for minutes
const VALIDITY_DAYS: i64 = 1;

fn pki_error(msg: impl Into<String>) -> Error {
    Error::environment_with_context("pki", msg)
}

fn validity() -> (::time::OffsetDateTime, ::time::OffsetDateTime) {
    let now = ::time::OffsetDateTime::now_utc();
    // Backdate slightly so clock skew between processes never matters
    let not_before = now - ::time::Duration::minutes(5);
    (not_before, now + ::time::Duration::days(VALIDITY_DAYS))
}

fn distinguished_name(common_name: &str, organization: Option<&str>) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String(common_name.to_string()),
    );
    if let Some(org) = organization {
        dn.push(
            DnType::OrganizationName,
            DnValue::Utf8String(org.to_string()),
        );
    }
    dn
}

/// PEM material for one control-plane instance
#[derive(Clone)]
pub struct ControlPlanePki {
    /// CA certificate that signed everything below
    pub ca_cert_pem: String,
    ca_key_pem: String,
    /// API server serving certificate
    pub serving_cert_pem: String,
    /// API server serving key
    pub serving_key_pem: String,
    /// Admin client certificate
    pub client_cert_pem: String,
    /// Admin client key
    pub client_key_pem: String,
    /// Service-account token signing key (also used for verification)
    pub service_account_key_pem: String,
}

impl std::fmt::Debug for ControlPlanePki {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlPlanePki").finish_non_exhaustive()
    }
}

/// Where [`ControlPlanePki::write_to`] put each file
#[derive(Debug, Clone)]
pub struct PkiPaths {
    /// CA certificate
    pub ca_cert: PathBuf,
    /// Serving certificate
    pub serving_cert: PathBuf,
    /// Serving key
    pub serving_key: PathBuf,
    /// Service-account key
    pub service_account_key: PathBuf,
}

impl ControlPlanePki {
    /// Generate a fresh CA and the certificates signed by it
    pub fn generate() -> Result<Self, Error> {
        let mut ca_params = CertificateParams::default();
        ca_params.distinguished_name = distinguished_name("retval-demo-ca", Some("retval-demo"));
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let (not_before, not_after) = validity();
        ca_params.not_before = not_before;
        ca_params.not_after = not_after;

        let ca_key = KeyPair::generate()
            .map_err(|e| pki_error(format!("failed to generate CA key: {}", e)))?;
        let ca_cert = ca_params
            .self_signed(&ca_key)
            .map_err(|e| pki_error(format!("failed to create CA cert: {}", e)))?;
        let ca_cert_pem = ca_cert.pem();
        let ca_key_pem = ca_key.serialize_pem();

        let mut pki = Self {
            ca_cert_pem,
            ca_key_pem,
            serving_cert_pem: String::new(),
            serving_key_pem: String::new(),
            client_cert_pem: String::new(),
            client_key_pem: String::new(),
            service_account_key_pem: String::new(),
        };

        let (serving_cert_pem, serving_key_pem) = pki.sign_serving_cert()?;
        pki.serving_cert_pem = serving_cert_pem;
        pki.serving_key_pem = serving_key_pem;

        let (client_cert_pem, client_key_pem) = pki.sign_client_cert(ADMIN_USER, ADMIN_GROUP)?;
        pki.client_cert_pem = client_cert_pem;
        pki.client_key_pem = client_key_pem;

        pki.service_account_key_pem = KeyPair::generate()
            .map_err(|e| pki_error(format!("failed to generate service-account key: {}", e)))?
            .serialize_pem();

        Ok(pki)
    }

    fn sign(&self, params: CertificateParams) -> Result<(String, String), Error> {
        let key = KeyPair::generate()
            .map_err(|e| pki_error(format!("failed to generate key: {}", e)))?;
        let ca_key = KeyPair::from_pem(&self.ca_key_pem)
            .map_err(|e| pki_error(format!("failed to load CA key: {}", e)))?;
        let issuer = Issuer::from_ca_cert_pem(&self.ca_cert_pem, &ca_key)
            .map_err(|e| pki_error(format!("failed to create issuer: {}", e)))?;
        let cert = params
            .signed_by(&key, &issuer)
            .map_err(|e| pki_error(format!("failed to sign certificate: {}", e)))?;
        Ok((cert.pem(), key.serialize_pem()))
    }

    fn sign_serving_cert(&self) -> Result<(String, String), Error> {
        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name("kube-apiserver", None);
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        let (not_before, not_after) = validity();
        params.not_before = not_before;
        params.not_after = not_after;
        params.subject_alt_names = vec![
            SanType::DnsName(
                Ia5String::try_from("localhost")
                    .map_err(|e| pki_error(format!("invalid DNS name: {}", e)))?,
            ),
            SanType::IpAddress(std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST)),
        ];
        self.sign(params)
    }

    fn sign_client_cert(&self, user: &str, group: &str) -> Result<(String, String), Error> {
        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(user, Some(group));
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        let (not_before, not_after) = validity();
        params.not_before = not_before;
        params.not_after = not_after;
        self.sign(params)
    }

    /// Write the files kube-apiserver reads into `dir`
    pub fn write_to(&self, dir: &Path) -> Result<PkiPaths, Error> {
        let paths = PkiPaths {
            ca_cert: dir.join("ca.crt"),
            serving_cert: dir.join("apiserver.crt"),
            serving_key: dir.join("apiserver.key"),
            service_account_key: dir.join("sa.key"),
        };
        std::fs::write(&paths.ca_cert, &self.ca_cert_pem)?;
        std::fs::write(&paths.serving_cert, &self.serving_cert_pem)?;
        std::fs::write(&paths.serving_key, &self.serving_key_pem)?;
        std::fs::write(&paths.service_account_key, &self.service_account_key_pem)?;
        Ok(paths)
    }
}
