//! Signature verification. Every failure path yields an invalid result;
//! nothing here can report a message as valid by accident.

use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use rsa::{
    Pkcs1v15Sign, RsaPublicKey,
    pkcs1::DecodeRsaPublicKey,
    pkcs8::DecodePublicKey,
};
use sha2::{Digest, Sha256};

use crate::{
    DkimError, Result,
    message::{ParsedMessage, normalize_line_endings},
    signature::{DkimSignature, HEADER_NAME, parse_tag_list, strip_signature_value},
};

/// TXT lookups for `{selector}._domainkey.{domain}`.
#[async_trait]
pub trait TxtResolver: Send + Sync {
    /// Each returned string is one TXT record with its character strings
    /// already concatenated.
    async fn lookup_txt(&self, name: &str) -> Result<Vec<String>>;
}

/// A parsed `v=DKIM1; k=rsa; p=...` key record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DkimKeyRecord {
    /// Decoded `p=`. Empty means the key has been revoked.
    pub public_key: Vec<u8>,
    pub testing: bool,
}

impl DkimKeyRecord {
    pub fn parse(record: &str) -> Result<Self> {
        let tags = parse_tag_list(record).map_err(|e| DkimError::KeyRecord(e.to_string()))?;
        let tag = |name: &str| tags.iter().find(|(n, _)| n == name).map(|(_, v)| v.as_str());

        if let Some(version) = tag("v")
            && version != "DKIM1"
        {
            return Err(DkimError::KeyRecord(format!("unsupported version {version}")));
        }

        if let Some(key_type) = tag("k")
            && !key_type.eq_ignore_ascii_case("rsa")
        {
            return Err(DkimError::KeyRecord(format!("unsupported key type {key_type}")));
        }

        if let Some(hashes) = tag("h")
            && !hashes
                .split(':')
                .any(|h| h.trim().eq_ignore_ascii_case("sha256"))
        {
            return Err(DkimError::KeyRecord(format!(
                "key does not allow sha256 (h={hashes})"
            )));
        }

        let p: String = tag("p")
            .ok_or_else(|| DkimError::KeyRecord("missing p= tag".to_string()))?
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();

        let public_key = BASE64
            .decode(p)
            .map_err(|e| DkimError::KeyRecord(format!("p= is not base64: {e}")))?;

        let testing = tag("t").is_some_and(|flags| flags.split(':').any(|f| f.trim() == "y"));

        Ok(Self {
            public_key,
            testing,
        })
    }

    #[must_use]
    pub fn is_revoked(&self) -> bool {
        self.public_key.is_empty()
    }

    fn rsa_key(&self) -> Result<RsaPublicKey> {
        if self.is_revoked() {
            return Err(DkimError::KeyRecord("key has been revoked".to_string()));
        }

        RsaPublicKey::from_public_key_der(&self.public_key)
            .or_else(|_| RsaPublicKey::from_pkcs1_der(&self.public_key))
            .map_err(|e| DkimError::KeyRecord(format!("unusable public key: {e}")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationResult {
    pub valid: bool,
    pub domain: Option<String>,
    pub selector: Option<String>,
    /// Why the signature did not verify.
    pub reason: Option<String>,
}

impl VerificationResult {
    fn pass(signature: &DkimSignature) -> Self {
        Self {
            valid: true,
            domain: Some(signature.domain.clone()),
            selector: Some(signature.selector.clone()),
            reason: None,
        }
    }

    fn fail(signature: Option<&DkimSignature>, error: &DkimError) -> Self {
        Self {
            valid: false,
            domain: signature.map(|s| s.domain.clone()),
            selector: signature.map(|s| s.selector.clone()),
            reason: Some(error.to_string()),
        }
    }
}

/// Verifies the first `DKIM-Signature` of a message against the key
/// published in DNS.
#[derive(Clone)]
pub struct DkimVerifier {
    resolver: Arc<dyn TxtResolver>,
}

impl DkimVerifier {
    #[must_use]
    pub fn new(resolver: Arc<dyn TxtResolver>) -> Self {
        Self { resolver }
    }

    pub async fn verify(&self, message: &[u8]) -> VerificationResult {
        let normalized = normalize_line_endings(message);
        let (parsed, signature) = match signature_of(&normalized) {
            Ok(found) => found,
            Err(error) => return VerificationResult::fail(None, &error),
        };

        let name = signature.key_record_name();
        let records = match self.resolver.lookup_txt(&name).await {
            Ok(records) => records,
            Err(error) => return VerificationResult::fail(Some(&signature), &error),
        };

        // More than one DKIM1 record at the name is ambiguous.
        let mut candidates = records
            .iter()
            .filter(|r| r.trim_start().starts_with("v=DKIM1") || r.contains("p="));
        let record = match (candidates.next(), candidates.next()) {
            (Some(record), None) => record,
            (None, _) => {
                let error = DkimError::KeyRecord(format!("no key record at {name}"));
                return VerificationResult::fail(Some(&signature), &error);
            }
            (Some(_), Some(_)) => {
                let error = DkimError::KeyRecord(format!("multiple key records at {name}"));
                return VerificationResult::fail(Some(&signature), &error);
            }
        };

        let outcome = DkimKeyRecord::parse(record)
            .and_then(|key| check(&parsed, &signature, &key, now()));
        match outcome {
            Ok(()) => VerificationResult::pass(&signature),
            Err(error) => VerificationResult::fail(Some(&signature), &error),
        }
    }
}

/// Verify against a key record supplied directly instead of fetched from DNS.
#[must_use]
pub fn verify_with_record(message: &[u8], record: &str) -> VerificationResult {
    let normalized = normalize_line_endings(message);
    let (parsed, signature) = match signature_of(&normalized) {
        Ok(found) => found,
        Err(error) => return VerificationResult::fail(None, &error),
    };

    match DkimKeyRecord::parse(record).and_then(|key| check(&parsed, &signature, &key, now())) {
        Ok(()) => VerificationResult::pass(&signature),
        Err(error) => VerificationResult::fail(Some(&signature), &error),
    }
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

fn signature_of(message: &[u8]) -> Result<(ParsedMessage<'_>, DkimSignature)> {
    let parsed = ParsedMessage::parse(message)?;
    let field = parsed
        .fields(HEADER_NAME)
        .next()
        .ok_or_else(|| DkimError::InvalidSignature("message is not signed".to_string()))?;
    let signature = DkimSignature::parse(field.value())?;
    Ok((parsed, signature))
}

fn check(
    parsed: &ParsedMessage<'_>,
    signature: &DkimSignature,
    key: &DkimKeyRecord,
    now: u64,
) -> Result<()> {
    let public_key = key.rsa_key()?;

    if let Some(expiration) = signature.expiration
        && expiration < now
    {
        return Err(DkimError::InvalidSignature(format!(
            "signature expired at {expiration}"
        )));
    }

    let mut body = signature.body_canonicalization.body(parsed.body);
    if let Some(length) = signature.body_length {
        if length > body.len() {
            return Err(DkimError::InvalidSignature(
                "l= is longer than the body".to_string(),
            ));
        }
        body.truncate(length);
    }
    if Sha256::digest(&body).as_slice() != signature.body_hash.as_slice() {
        return Err(DkimError::InvalidSignature("body hash mismatch".to_string()));
    }

    let field = parsed
        .fields(HEADER_NAME)
        .next()
        .ok_or_else(|| DkimError::InvalidSignature("message is not signed".to_string()))?;

    let canonicalization = signature.header_canonicalization;
    let mut data = String::new();
    for selected in parsed.select(&signature.signed_headers) {
        data.push_str(&canonicalization.header(selected));
    }
    data.push_str(
        &canonicalization.header_without_crlf(field.name, &strip_signature_value(field.raw)),
    );

    let digest = Sha256::digest(data.as_bytes());
    public_key
        .verify(Pkcs1v15Sign::new::<Sha256>(), &digest, &signature.signature)
        .map_err(|_| DkimError::InvalidSignature("signature does not verify".to_string()))
}
