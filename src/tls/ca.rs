//! Minimal self-signed certificate authority.
//!
//! Issues short-lived server certificates for TLS servers on the mock
//! network. Keys are ECDSA P-256; everything is exchanged as PEM.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SerialNumber,
};
use time::OffsetDateTime;

use crate::config::CertificateConfig;
use crate::tls::TlsError;

/// Subject of the authority when none is configured.
pub const DEFAULT_AUTHORITY_SUBJECT: &str = "C=US/ST=Colorado/L=Denver/CN=Example-Root-CA";

const LEAF_SUBJECT_PREFIX: &str = "C=US/ST=Colorado/L=Denver/CN=";
const DEFAULT_VALIDITY: Duration = Duration::from_secs(300);
const DEFAULT_BACKDATE: Duration = Duration::from_secs(1);

/// Parameters for a certificate. Unset fields fall back to the authority's
/// defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertOptions {
    pub not_before: Option<SystemTime>,
    pub not_after: Option<SystemTime>,
    /// Subject in `K=V/K=V` form.
    pub subject: Option<String>,
    /// DNS names; `None` means `["localhost"]`.
    pub names: Option<Vec<String>>,
}

impl CertOptions {
    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.names = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn validity(mut self, not_before: SystemTime, not_after: SystemTime) -> Self {
        self.not_before = Some(not_before);
        self.not_after = Some(not_after);
        self
    }
}

impl From<&CertificateConfig> for CertOptions {
    fn from(config: &CertificateConfig) -> Self {
        Self {
            not_before: None,
            not_after: None,
            subject: config.subject.clone(),
            names: Some(config.names.clone()),
        }
    }
}

/// PEM output of [`CertificateAuthority::issue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCertificate {
    pub certificate: String,
    pub private_key: String,
    pub issuer_certificate: String,
}

/// A self-signed CA that signs leaf certificates.
pub struct CertificateAuthority {
    certificate: Certificate,
    key: KeyPair,
    subject: String,
    validity: Duration,
    backdate: Duration,
    next_serial: AtomicU64,
}

impl CertificateAuthority {
    /// A CA with the default subject, valid from one second ago for five
    /// minutes.
    pub fn new() -> Result<Self, TlsError> {
        Self::with_options(&CertOptions::default())
    }

    /// A CA whose own certificate follows `options`. `names` are ignored.
    pub fn with_options(options: &CertOptions) -> Result<Self, TlsError> {
        Self::build(options, DEFAULT_VALIDITY, DEFAULT_BACKDATE)
    }

    pub fn from_config(config: &CertificateConfig) -> Result<Self, TlsError> {
        let options = CertOptions::default().subject(config.authority_subject.clone());
        Self::build(
            &options,
            Duration::from_secs(config.validity_secs),
            Duration::from_secs(config.backdate_secs),
        )
    }

    fn build(options: &CertOptions, validity: Duration, backdate: Duration) -> Result<Self, TlsError> {
        let subject = options
            .subject
            .clone()
            .unwrap_or_else(|| DEFAULT_AUTHORITY_SUBJECT.to_string());
        let (not_before, not_after) = window(options, validity, backdate)?;

        let mut params = CertificateParams::new(Vec::<String>::new())?;
        params.distinguished_name = parse_subject(&subject)?;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.serial_number = Some(SerialNumber::from(1u64));
        params.not_before = not_before;
        params.not_after = not_after;

        let key = KeyPair::generate()?;
        let certificate = params.self_signed(&key)?;
        tracing::debug!(subject = %subject, "Certificate authority created");

        Ok(Self {
            certificate,
            key,
            subject,
            validity,
            backdate,
            next_serial: AtomicU64::new(2),
        })
    }

    /// The authority's own certificate.
    pub fn certificate_pem(&self) -> String {
        self.certificate.pem()
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Issue a server certificate signed by this authority.
    pub fn issue(&self, options: &CertOptions) -> Result<IssuedCertificate, TlsError> {
        let names = options
            .names
            .clone()
            .unwrap_or_else(|| vec!["localhost".to_string()]);
        let subject = match (&options.subject, names.first()) {
            (Some(subject), _) => subject.clone(),
            (None, Some(name)) => format!("{LEAF_SUBJECT_PREFIX}{name}"),
            (None, None) => return Err(TlsError::MissingSubject),
        };
        let (not_before, not_after) = window(options, self.validity, self.backdate)?;

        let mut params = CertificateParams::new(names.clone())?;
        params.distinguished_name = parse_subject(&subject)?;
        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::ContentCommitment,
            KeyUsagePurpose::KeyEncipherment,
            KeyUsagePurpose::DataEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.use_authority_key_identifier_extension = true;
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        params.serial_number = Some(SerialNumber::from(serial));
        params.not_before = not_before;
        params.not_after = not_after;

        let key = KeyPair::generate()?;
        let certificate = params.signed_by(&key, &self.certificate, &self.key)?;
        tracing::debug!(subject = %subject, serial, names = ?names, "Certificate issued");

        Ok(IssuedCertificate {
            certificate: certificate.pem(),
            private_key: key.serialize_pem(),
            issuer_certificate: self.certificate.pem(),
        })
    }
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("subject", &self.subject)
            .field("validity", &self.validity)
            .finish()
    }
}

fn window(
    options: &CertOptions,
    validity: Duration,
    backdate: Duration,
) -> Result<(OffsetDateTime, OffsetDateTime), TlsError> {
    let now = SystemTime::now();
    let not_before = options
        .not_before
        .unwrap_or_else(|| now.checked_sub(backdate).unwrap_or(now));
    let not_after = match options.not_after {
        Some(at) => at,
        None => now.checked_add(validity).ok_or(TlsError::InvalidValidity)?,
    };
    if not_after <= not_before {
        return Err(TlsError::InvalidValidity);
    }
    Ok((not_before.into(), not_after.into()))
}

/// Parse a `K=V/K=V` subject. Keys are C, ST, L, O, OU and CN.
pub fn parse_subject(subject: &str) -> Result<DistinguishedName, TlsError> {
    let invalid = || TlsError::InvalidSubject(subject.to_string());
    let mut name = DistinguishedName::new();
    let mut any = false;

    for part in subject.split('/').filter(|p| !p.is_empty()) {
        let (key, value) = part.split_once('=').ok_or_else(invalid)?;
        let kind = match key.trim() {
            "C" => DnType::CountryName,
            "ST" => DnType::StateOrProvinceName,
            "L" => DnType::LocalityName,
            "O" => DnType::OrganizationName,
            "OU" => DnType::OrganizationalUnitName,
            "CN" => DnType::CommonName,
            _ => return Err(invalid()),
        };
        name.push(kind, value.trim());
        any = true;
    }

    if any {
        Ok(name)
    } else {
        Err(invalid())
    }
}
