//! Authenticated caller identity.
//!
//! The gateway never forwards the caller's own credentials upstream; it
//! authenticates locally and impersonates the resulting [`UserInfo`] with
//! the standard `Impersonate-*` headers.

use std::collections::BTreeMap;

use der::asn1::{ObjectIdentifier, PrintableStringRef, Utf8StringRef};
use rustls::pki_types::CertificateDer;
use x509_cert::Certificate;
use x509_cert::der::Decode;

/// Username reported for unauthenticated callers.
pub const ANONYMOUS_USER: &str = "system:anonymous";
/// Group attached to unauthenticated callers.
pub const UNAUTHENTICATED_GROUP: &str = "system:unauthenticated";
/// Group attached to every authenticated caller.
pub const AUTHENTICATED_GROUP: &str = "system:authenticated";

/// Username prefix used by service account tokens.
pub const SERVICE_ACCOUNT_PREFIX: &str = "system:serviceaccount:";

/// Impersonation header carrying the username. Header names are kept
/// lower-case so they can be used as static `HeaderName`s.
pub const IMPERSONATE_USER_HEADER: &str = "impersonate-user";
/// Impersonation header carrying one group per value.
pub const IMPERSONATE_GROUP_HEADER: &str = "impersonate-group";
/// Prefix for impersonated extra key/value pairs.
pub const IMPERSONATE_EXTRA_PREFIX: &str = "impersonate-extra-";

const OID_COMMON_NAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.3");
const OID_ORGANIZATION: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.10");

/// Identity of the authenticated caller, as consumed by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    pub username: String,
    pub uid: String,
    pub groups: Vec<String>,
    pub extra: BTreeMap<String, Vec<String>>,
}

impl UserInfo {
    /// The anonymous identity used when no authenticator succeeded.
    pub fn anonymous() -> Self {
        Self {
            username: ANONYMOUS_USER.to_string(),
            uid: String::new(),
            groups: vec![UNAUTHENTICATED_GROUP.to_string()],
            extra: BTreeMap::new(),
        }
    }

    /// Build an authenticated identity, appending `system:authenticated`.
    pub fn authenticated(
        username: impl Into<String>,
        uid: impl Into<String>,
        mut groups: Vec<String>,
    ) -> Self {
        if !groups.iter().any(|g| g == AUTHENTICATED_GROUP) {
            groups.push(AUTHENTICATED_GROUP.to_string());
        }
        Self {
            username: username.into(),
            uid: uid.into(),
            groups,
            extra: BTreeMap::new(),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.username == ANONYMOUS_USER
    }

    /// Derive an identity from a verified client certificate, following the
    /// Kubernetes x509 convention: subject CN is the username, each O is a
    /// group.
    pub fn from_client_cert(der: &CertificateDer<'_>) -> Option<Self> {
        let cert = Certificate::from_der(der.as_ref()).ok()?;
        let mut username = None;
        let mut groups = Vec::new();
        for rdn in cert.tbs_certificate.subject.0.iter() {
            for atv in rdn.0.iter() {
                if atv.oid == OID_COMMON_NAME {
                    username = decode_directory_string(&atv.value);
                } else if atv.oid == OID_ORGANIZATION
                    && let Some(org) = decode_directory_string(&atv.value)
                {
                    groups.push(org);
                }
            }
        }
        let username = username?;
        if username.is_empty() {
            return None;
        }
        Some(Self::authenticated(username, "", groups))
    }

    /// Split a service account username into `(namespace, name)`.
    pub fn service_account_parts(&self) -> Option<(&str, &str)> {
        let rest = self.username.strip_prefix(SERVICE_ACCOUNT_PREFIX)?;
        rest.split_once(':')
    }
}

fn decode_directory_string(value: &der::Any) -> Option<String> {
    if let Ok(s) = value.decode_as::<Utf8StringRef<'_>>() {
        return Some(s.as_str().to_string());
    }
    if let Ok(s) = value.decode_as::<PrintableStringRef<'_>>() {
        return Some(s.as_str().to_string());
    }
    None
}
