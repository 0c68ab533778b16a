//! # Identity Assembler
//!
//! Combines three inputs supplied by distinct parties into the `Identity`
//! installed on a claimed device:
//!
//! - the identity certificate (certificate authority)
//! - the about data (the device itself, read-only)
//! - user input (the administrator)
//!
//! Pure combination: no I/O, no retries.

use std::collections::BTreeMap;

use uuid::Uuid;

use crate::domain::PublicKey;
use crate::error::IdentityError;

/// Self-declared application metadata.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AboutData {
    pub app_id: Uuid,
    pub app_name: String,
    pub device_name: String,
    pub manufacturer: String,
    pub model_number: String,
    /// Vendor-specific fields
    pub extra: BTreeMap<String, String>,
}

/// Administrator-supplied identity fields.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UserInput {
    /// Friendly name shown in administrator tooling
    pub friendly_name: String,
    pub fields: BTreeMap<String, String>,
}

impl UserInput {
    /// User input carrying only a friendly name.
    pub fn named(friendly_name: impl Into<String>) -> Self {
        Self {
            friendly_name: friendly_name.into(),
            fields: BTreeMap::new(),
        }
    }

    /// `true` if nothing was supplied.
    pub fn is_empty(&self) -> bool {
        self.friendly_name.is_empty() && self.fields.is_empty()
    }
}

/// Structured extension fields attached to the identity.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClaimData {
    pub fields: BTreeMap<String, String>,
}

/// Signed identity credential. The encoding is opaque to this crate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityCertificate {
    pub serial_number: u64,
    /// Key the certificate is issued to
    pub subject: PublicKey,
    /// Key of the issuing authority
    pub issuer: PublicKey,
    /// Encoded certificate as produced by the authority
    pub encoded: Vec<u8>,
}

/// Provisioning payload for one claim attempt.
///
/// Immutable once assembled; consumed by the remote provisioning exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    identity_certificate: IdentityCertificate,
    about_data: AboutData,
    user_input: UserInput,
    claim_data: ClaimData,
}

impl Identity {
    pub fn identity_certificate(&self) -> &IdentityCertificate {
        &self.identity_certificate
    }

    pub fn about_data(&self) -> &AboutData {
        &self.about_data
    }

    pub fn user_input(&self) -> &UserInput {
        &self.user_input
    }

    pub fn claim_data(&self) -> &ClaimData {
        &self.claim_data
    }

    /// Certificate chain installed on the device (leaf first).
    pub fn certificate_chain(&self) -> Vec<IdentityCertificate> {
        vec![self.identity_certificate.clone()]
    }
}

/// Builds `Identity` values.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityAssembler;

impl IdentityAssembler {
    /// Assemble an identity for the application known under `subject`.
    ///
    /// Fails if the certificate or about data is absent, or if the
    /// certificate was issued to a different key. User input and claim data
    /// may be empty.
    pub fn assemble(
        subject: &PublicKey,
        certificate: Option<IdentityCertificate>,
        about_data: Option<AboutData>,
        user_input: UserInput,
        claim_data: ClaimData,
    ) -> Result<Identity, IdentityError> {
        let identity_certificate = certificate.ok_or(IdentityError::MissingCertificate)?;
        let about_data = about_data.ok_or(IdentityError::MissingAboutData)?;

        if identity_certificate.subject != *subject {
            return Err(IdentityError::SubjectMismatch {
                certificate: identity_certificate.subject.fingerprint(),
                application: subject.fingerprint(),
            });
        }

        Ok(Identity {
            identity_certificate,
            about_data,
            user_input,
            claim_data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;

    fn key(seed: u8) -> PublicKey {
        PublicKey::from_verifying_key(&SigningKey::from_bytes(&[seed; 32]).verifying_key())
    }

    fn certificate(subject: PublicKey) -> IdentityCertificate {
        IdentityCertificate {
            serial_number: 1,
            subject,
            issuer: key(200),
            encoded: vec![0xAB; 16],
        }
    }

    fn about() -> AboutData {
        AboutData {
            app_name: "thermostat".into(),
            ..AboutData::default()
        }
    }

    #[test]
    fn test_assemble_complete_identity() {
        let subject = key(1);
        let identity = IdentityAssembler::assemble(
            &subject,
            Some(certificate(subject)),
            Some(about()),
            UserInput::named("Living room"),
            ClaimData::default(),
        )
        .unwrap();

        assert_eq!(identity.about_data().app_name, "thermostat");
        assert_eq!(identity.user_input().friendly_name, "Living room");
        assert_eq!(identity.certificate_chain().len(), 1);
    }

    #[test]
    fn test_empty_user_input_is_allowed() {
        let subject = key(1);
        let identity = IdentityAssembler::assemble(
            &subject,
            Some(certificate(subject)),
            Some(about()),
            UserInput::default(),
            ClaimData::default(),
        )
        .unwrap();
        assert!(identity.user_input().is_empty());
    }

    #[test]
    fn test_missing_parts_are_incomplete() {
        let subject = key(1);
        assert_eq!(
            IdentityAssembler::assemble(
                &subject,
                None,
                Some(about()),
                UserInput::default(),
                ClaimData::default()
            ),
            Err(IdentityError::MissingCertificate)
        );
        assert_eq!(
            IdentityAssembler::assemble(
                &subject,
                Some(certificate(subject)),
                None,
                UserInput::default(),
                ClaimData::default()
            ),
            Err(IdentityError::MissingAboutData)
        );
    }

    #[test]
    fn test_subject_mismatch_rejected() {
        let result = IdentityAssembler::assemble(
            &key(1),
            Some(certificate(key(2))),
            Some(about()),
            UserInput::default(),
            ClaimData::default(),
        );
        assert!(matches!(result, Err(IdentityError::SubjectMismatch { .. })));
    }
}
