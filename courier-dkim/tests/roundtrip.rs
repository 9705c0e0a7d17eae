use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use courier_dkim::{
    Canonicalization, DkimError, DkimSigner, DkimVerifier, TxtResolver, verify_with_record,
};

const KEY: &str = include_str!("fixtures/test_key.pem");
const PUBLIC: &str = include_str!("fixtures/test_key.pub.b64");
const OTHER_PUBLIC: &str = include_str!("fixtures/other_key.pub.b64");

const MESSAGE: &[u8] = b"From: Alice <alice@example.com>\r\n\
To: bob@example.org\r\n\
Subject: Quarterly   numbers\r\n\
Date: Tue, 1 Oct 2024 10:00:00 +0000\r\n\
Message-ID: <1234@example.com>\r\n\
\r\n\
Hi Bob,\r\n\
\r\n\
The numbers are attached.   \r\n\
\r\n\
\r\n";

fn record(public: &str) -> String {
    format!("v=DKIM1; k=rsa; p={}", public.trim())
}

fn signer() -> DkimSigner {
    DkimSigner::from_pem("example.com", "mail", KEY).unwrap()
}

struct StaticTxt(HashMap<String, Vec<String>>);

#[async_trait]
impl TxtResolver for StaticTxt {
    async fn lookup_txt(&self, name: &str) -> courier_dkim::Result<Vec<String>> {
        self.0.get(name).cloned().ok_or_else(|| DkimError::Dns {
            name: name.to_string(),
            reason: "NXDOMAIN".to_string(),
        })
    }
}

fn verifier(records: &[(&str, String)]) -> DkimVerifier {
    let table = records
        .iter()
        .map(|(name, value)| ((*name).to_string(), vec![value.clone()]))
        .collect();
    DkimVerifier::new(Arc::new(StaticTxt(table)))
}

#[test]
fn signed_message_verifies() {
    let signed = signer().sign_message(MESSAGE).unwrap();
    let result = verify_with_record(&signed, &record(PUBLIC));
    assert!(result.valid, "{:?}", result.reason);
    assert_eq!(result.domain.as_deref(), Some("example.com"));
}

#[test]
fn every_canonicalization_pair_verifies() {
    for header in [Canonicalization::Simple, Canonicalization::Relaxed] {
        for body in [Canonicalization::Simple, Canonicalization::Relaxed] {
            let signed = signer()
                .with_canonicalization(header, body)
                .sign_message(MESSAGE)
                .unwrap();
            let result = verify_with_record(&signed, &record(PUBLIC));
            assert!(result.valid, "{header}/{body}: {:?}", result.reason);
        }
    }
}

#[test]
fn flipping_a_body_byte_invalidates() {
    let signed = signer().sign_message(MESSAGE).unwrap();
    let body_start = signed.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;

    for offset in [0, 3, 12] {
        let mut tampered = signed.clone();
        tampered[body_start + offset] ^= 0x01;
        let result = verify_with_record(&tampered, &record(PUBLIC));
        assert!(!result.valid, "tampered byte {offset} still verified");
    }
}

#[test]
fn changing_a_signed_header_invalidates() {
    let signed = signer().sign_message(MESSAGE).unwrap();
    let text = String::from_utf8(signed).unwrap();
    let tampered = text.replace("Subject: Quarterly", "Subject: Annual");

    assert!(!verify_with_record(tampered.as_bytes(), &record(PUBLIC)).valid);
}

#[test]
fn relaxed_tolerates_whitespace_changes() {
    let signed = signer().sign_message(MESSAGE).unwrap();
    let text = String::from_utf8(signed).unwrap();
    let rewrapped = text
        .replace("Subject: Quarterly   numbers", "Subject:  Quarterly\r\n numbers")
        .replace("attached.   \r\n", "attached.\r\n");

    let result = verify_with_record(rewrapped.as_bytes(), &record(PUBLIC));
    assert!(result.valid, "{:?}", result.reason);
}

#[tokio::test]
async fn signatures_not_covering_from_are_rejected() {
    let signed = signer().sign_message(MESSAGE).unwrap();
    let text = String::from_utf8(signed).unwrap();
    assert!(text.contains(" h=from:"));
    let unsigned_from = text.replacen(" h=from:", " h=", 1);

    let result = verify_with_record(unsigned_from.as_bytes(), &record(PUBLIC));
    assert!(!result.valid);
    assert!(result.reason.unwrap().contains("From is not among the signed headers"));

    let dns = verifier(&[("mail._domainkey.example.com", record(PUBLIC))]);
    let result = dns.verify(unsigned_from.as_bytes()).await;
    assert!(!result.valid);
    assert!(result.reason.unwrap().contains("From is not among the signed headers"));
}

#[test]
fn revoked_key_never_verifies() {
    let signed = signer().sign_message(MESSAGE).unwrap();
    let result = verify_with_record(&signed, "v=DKIM1; k=rsa; p=");
    assert!(!result.valid);
    assert!(result.reason.unwrap().contains("revoked"));
}

#[test]
fn wrong_key_fails() {
    let signed = signer().sign_message(MESSAGE).unwrap();
    assert!(!verify_with_record(&signed, &record(OTHER_PUBLIC)).valid);
}

#[test]
fn unsigned_and_garbage_records_fail() {
    assert!(!verify_with_record(MESSAGE, &record(PUBLIC)).valid);

    let signed = signer().sign_message(MESSAGE).unwrap();
    assert!(!verify_with_record(&signed, "v=DKIM1; p=!!!notbase64").valid);
    assert!(!verify_with_record(&signed, "v=DKIM1; k=ed25519; p=AAAA").valid);
    assert!(!verify_with_record(&signed, "v=DKIM1; p=AAAA").valid);
}

#[test]
fn lf_only_input_signs_and_verifies() {
    let lf: Vec<u8> = String::from_utf8_lossy(MESSAGE)
        .replace("\r\n", "\n")
        .into_bytes();
    let signed = signer().sign_message(&lf).unwrap();
    let result = verify_with_record(&signed, &record(PUBLIC));
    assert!(result.valid, "{:?}", result.reason);
}

#[test]
fn expired_signature_fails() {
    let signed = signer()
        .with_expiration(Some(std::time::Duration::from_secs(60)))
        .sign_at(MESSAGE, 1_000)
        .unwrap();
    let mut message = signed.header_line().into_bytes();
    message.extend_from_slice(b"\r\n");
    message.extend_from_slice(MESSAGE);

    let result = verify_with_record(&message, &record(PUBLIC));
    assert!(!result.valid);
    assert!(result.reason.unwrap().contains("expired"));
}

#[tokio::test]
async fn verifier_fetches_key_from_dns() {
    let signed = signer().sign_message(MESSAGE).unwrap();

    let good = verifier(&[("mail._domainkey.example.com", record(PUBLIC))]);
    let result = good.verify(&signed).await;
    assert!(result.valid, "{:?}", result.reason);
    assert_eq!(result.selector.as_deref(), Some("mail"));

    let revoked = verifier(&[("mail._domainkey.example.com", "v=DKIM1; p=".to_string())]);
    assert!(!revoked.verify(&signed).await.valid);

    let missing = verifier(&[]);
    let result = missing.verify(&signed).await;
    assert!(!result.valid);
    assert!(result.reason.unwrap().contains("NXDOMAIN"));
}
