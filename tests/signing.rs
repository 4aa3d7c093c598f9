//! Signing pipeline through the public API
//!
//! Drives a request from PKCS#10 bytes through the admission gate and the CA
//! signer without a cluster.

use std::time::Duration;

use k8s_openapi::api::certificates::v1::{
    CertificateSigningRequest, CertificateSigningRequestCondition,
    CertificateSigningRequestSpec, CertificateSigningRequestStatus,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use rcgen::{CertificateParams, DistinguishedName, DnType, DnValue, KeyPair};

use signer_ca::controller::{classify, IgnoreReason, Outcome};
use signer_ca::csr::{self, ParsedCsr};
use signer_ca::pki::{is_issued_by, parse_pem, CaSigner, CertificateAuthority, CsrSigner};

const SIGNER: &str = "example.com/foo";

fn request_pem(cn: &str) -> String {
    let key = KeyPair::generate().unwrap();
    let mut params = CertificateParams::new(vec![format!("{cn}.svc")]).unwrap();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, DnValue::Utf8String(cn.to_string()));
    params.distinguished_name = dn;
    params.serialize_request(&key).unwrap().pem().unwrap()
}

fn approved_csr(name: &str, signer: &str) -> CertificateSigningRequest {
    CertificateSigningRequest {
        metadata: ObjectMeta {
            name: Some(name.into()),
            resource_version: Some("1".into()),
            ..Default::default()
        },
        spec: CertificateSigningRequestSpec {
            signer_name: signer.into(),
            request: ByteString(request_pem(name).into_bytes()),
            usages: Some(vec!["digital signature".into(), "server auth".into()]),
            ..Default::default()
        },
        status: Some(CertificateSigningRequestStatus {
            conditions: Some(vec![CertificateSigningRequestCondition {
                type_: "Approved".into(),
                status: "True".into(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
    }
}

#[test]
fn approved_request_yields_a_certificate_chained_to_the_ca() {
    let ca = CertificateAuthority::generate("integration CA", Duration::from_secs(86400)).unwrap();
    let ca_pem = ca.ca_cert_pem().to_string();
    let signer = CaSigner::new(ca, Duration::from_secs(3600));

    let request = approved_csr("web", SIGNER);
    assert_eq!(classify(&request, SIGNER), Outcome::Proceed);

    let parsed = ParsedCsr::parse(&request.spec.request.0).unwrap();
    assert_eq!(parsed.common_name(), "web");

    let cert = signer.sign(&parsed, csr::usages(&request)).unwrap();
    let der = parse_pem(std::str::from_utf8(&cert).unwrap()).unwrap();
    assert!(is_issued_by(&der, &ca_pem).unwrap());
}

#[test]
fn request_for_another_signer_never_reaches_the_ca() {
    let request = approved_csr("web", "example.com/bar");
    assert_eq!(
        classify(&request, SIGNER),
        Outcome::Ignore(IgnoreReason::SignerMismatch)
    );
}
