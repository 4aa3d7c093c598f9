//! Mapping from Kubernetes key usage strings to X.509 extensions
//!
//! The vocabulary is the one accepted in `spec.usages` of a
//! CertificateSigningRequest.

use rcgen::{ExtendedKeyUsagePurpose, KeyUsagePurpose};

use super::PkiError;

/// Key usages and extended key usages derived from a CSR's usage strings
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ResolvedUsages {
    /// keyUsage extension bits
    pub key_usages: Vec<KeyUsagePurpose>,
    /// extKeyUsage extension purposes
    pub extended_key_usages: Vec<ExtendedKeyUsagePurpose>,
}

enum Usage {
    Key(KeyUsagePurpose),
    Extended(ExtendedKeyUsagePurpose),
}

fn lookup(usage: &str) -> Option<Usage> {
    use ExtendedKeyUsagePurpose as Ext;
    use KeyUsagePurpose as Key;

    let usage = match usage {
        "signing" | "digital signature" => Usage::Key(Key::DigitalSignature),
        "content commitment" => Usage::Key(Key::ContentCommitment),
        "key encipherment" => Usage::Key(Key::KeyEncipherment),
        "key agreement" => Usage::Key(Key::KeyAgreement),
        "data encipherment" => Usage::Key(Key::DataEncipherment),
        "cert sign" => Usage::Key(Key::KeyCertSign),
        "crl sign" => Usage::Key(Key::CrlSign),
        "encipher only" => Usage::Key(Key::EncipherOnly),
        "decipher only" => Usage::Key(Key::DecipherOnly),
        "any" => Usage::Extended(Ext::Any),
        "server auth" => Usage::Extended(Ext::ServerAuth),
        "client auth" => Usage::Extended(Ext::ClientAuth),
        "code signing" => Usage::Extended(Ext::CodeSigning),
        "email protection" | "s/mime" => Usage::Extended(Ext::EmailProtection),
        "timestamping" => Usage::Extended(Ext::TimeStamping),
        "ocsp signing" => Usage::Extended(Ext::OcspSigning),
        // id-kp-ipsecEndSystem / ipsecTunnel / ipsecUser (RFC 2459)
        "ipsec end system" => Usage::Extended(Ext::Other(vec![1, 3, 6, 1, 5, 5, 7, 3, 5])),
        "ipsec tunnel" => Usage::Extended(Ext::Other(vec![1, 3, 6, 1, 5, 5, 7, 3, 6])),
        "ipsec user" => Usage::Extended(Ext::Other(vec![1, 3, 6, 1, 5, 5, 7, 3, 7])),
        "microsoft sgc" => Usage::Extended(Ext::Other(vec![1, 3, 6, 1, 4, 1, 311, 10, 3, 3])),
        "netscape sgc" => Usage::Extended(Ext::Other(vec![2, 16, 840, 1, 113730, 4, 1])),
        _ => return None,
    };
    Some(usage)
}

/// Resolve usage strings into extension values
///
/// Duplicates (including aliases like `signing` / `digital signature`) are
/// collapsed. An unrecognized string fails the whole resolution.
pub fn resolve(usages: &[String]) -> Result<ResolvedUsages, PkiError> {
    let mut resolved = ResolvedUsages::default();
    for usage in usages {
        match lookup(usage) {
            Some(Usage::Key(k)) => {
                if !resolved.key_usages.contains(&k) {
                    resolved.key_usages.push(k);
                }
            }
            Some(Usage::Extended(e)) => {
                if !resolved.extended_key_usages.contains(&e) {
                    resolved.extended_key_usages.push(e);
                }
            }
            None => return Err(PkiError::UnsupportedUsage(usage.clone())),
        }
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[rstest]
    #[case("signing", KeyUsagePurpose::DigitalSignature)]
    #[case("digital signature", KeyUsagePurpose::DigitalSignature)]
    #[case("content commitment", KeyUsagePurpose::ContentCommitment)]
    #[case("key encipherment", KeyUsagePurpose::KeyEncipherment)]
    #[case("key agreement", KeyUsagePurpose::KeyAgreement)]
    #[case("data encipherment", KeyUsagePurpose::DataEncipherment)]
    #[case("cert sign", KeyUsagePurpose::KeyCertSign)]
    #[case("crl sign", KeyUsagePurpose::CrlSign)]
    #[case("encipher only", KeyUsagePurpose::EncipherOnly)]
    #[case("decipher only", KeyUsagePurpose::DecipherOnly)]
    fn key_usages_map(#[case] usage: &str, #[case] expected: KeyUsagePurpose) {
        let resolved = resolve(&strings(&[usage])).expect("usage should resolve");
        assert_eq!(resolved.key_usages, vec![expected]);
        assert!(resolved.extended_key_usages.is_empty());
    }

    #[rstest]
    #[case("any", ExtendedKeyUsagePurpose::Any)]
    #[case("server auth", ExtendedKeyUsagePurpose::ServerAuth)]
    #[case("client auth", ExtendedKeyUsagePurpose::ClientAuth)]
    #[case("code signing", ExtendedKeyUsagePurpose::CodeSigning)]
    #[case("email protection", ExtendedKeyUsagePurpose::EmailProtection)]
    #[case("s/mime", ExtendedKeyUsagePurpose::EmailProtection)]
    #[case("timestamping", ExtendedKeyUsagePurpose::TimeStamping)]
    #[case("ocsp signing", ExtendedKeyUsagePurpose::OcspSigning)]
    fn extended_usages_map(#[case] usage: &str, #[case] expected: ExtendedKeyUsagePurpose) {
        let resolved = resolve(&strings(&[usage])).expect("usage should resolve");
        assert!(resolved.key_usages.is_empty());
        assert_eq!(resolved.extended_key_usages, vec![expected]);
    }

    #[test]
    fn legacy_purposes_map_to_raw_oids() {
        let resolved = resolve(&strings(&["ipsec tunnel", "netscape sgc"])).unwrap();
        assert_eq!(
            resolved.extended_key_usages,
            vec![
                ExtendedKeyUsagePurpose::Other(vec![1, 3, 6, 1, 5, 5, 7, 3, 6]),
                ExtendedKeyUsagePurpose::Other(vec![2, 16, 840, 1, 113730, 4, 1]),
            ]
        );
    }

    #[test]
    fn aliases_are_deduplicated() {
        let resolved = resolve(&strings(&[
            "signing",
            "digital signature",
            "email protection",
            "s/mime",
        ]))
        .unwrap();
        assert_eq!(resolved.key_usages, vec![KeyUsagePurpose::DigitalSignature]);
        assert_eq!(
            resolved.extended_key_usages,
            vec![ExtendedKeyUsagePurpose::EmailProtection]
        );
    }

    #[test]
    fn empty_usages_resolve_to_nothing() {
        assert_eq!(resolve(&[]).unwrap(), ResolvedUsages::default());
    }

    #[test]
    fn unknown_usage_is_rejected() {
        let err = resolve(&strings(&["client auth", "teleport"])).unwrap_err();
        assert!(matches!(err, PkiError::UnsupportedUsage(ref u) if u == "teleport"));
    }

    #[test]
    fn usages_are_case_sensitive() {
        assert!(resolve(&strings(&["Client Auth"])).is_err());
    }
}
