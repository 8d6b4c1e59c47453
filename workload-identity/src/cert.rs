//! Reading SPIFFE identity out of DER-encoded X.509 certificates.

use crate::error::{Error, Result};
use spiffe::SpiffeId;
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::GeneralName;

const SPIFFE_URI_PREFIX: &str = "spiffe://";

fn parse(der: &[u8]) -> Result<X509Certificate<'_>> {
    x509_parser::parse_x509_certificate(der)
        .map(|(_, cert)| cert)
        .map_err(|e| Error::CertParse(e.to_string()))
}

/// Extracts the SPIFFE ID from the URI SAN of a DER certificate.
///
/// An X.509-SVID carries exactly one `spiffe://` URI SAN. Other URI SANs are
/// ignored.
///
/// # Errors
///
/// * [`Error::CertParse`] if the bytes are not a certificate.
/// * [`Error::MissingSpiffeId`] if there is no SPIFFE URI SAN.
/// * [`Error::MultipleSpiffeIds`] if there is more than one.
/// * [`Error::InvalidSpiffeId`] if the URI is not a valid SPIFFE ID.
pub fn spiffe_id_from_der(der: &[u8]) -> Result<SpiffeId> {
    let cert = parse(der)?;
    let san = cert
        .subject_alternative_name()
        .map_err(|e| Error::CertParse(e.to_string()))?
        .ok_or(Error::MissingSpiffeId)?;

    let mut uris = san
        .value
        .general_names
        .iter()
        .filter_map(|name| match name {
            GeneralName::URI(uri) if uri.starts_with(SPIFFE_URI_PREFIX) => Some(*uri),
            _ => None,
        });

    let uri = uris.next().ok_or(Error::MissingSpiffeId)?;
    if uris.next().is_some() {
        return Err(Error::MultipleSpiffeIds);
    }

    SpiffeId::new(uri).map_err(|e| Error::InvalidSpiffeId(e.to_string()))
}

/// Returns the certificate's `notAfter` as seconds since the Unix epoch.
///
/// # Errors
///
/// Returns [`Error::CertParse`] if the bytes are not a certificate.
pub fn not_after(der: &[u8]) -> Result<i64> {
    Ok(parse(der)?.validity().not_after.timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestCa;

    #[test]
    fn extracts_single_spiffe_id() {
        let ca = TestCa::new("example.org");
        let (leaf, _) = ca.issue(&["spiffe://example.org/ns/demo/sa/ping-pong-client"]);

        let id = spiffe_id_from_der(leaf.as_ref()).unwrap();
        assert_eq!(
            id.to_string(),
            "spiffe://example.org/ns/demo/sa/ping-pong-client"
        );
    }

    #[test]
    fn ignores_non_spiffe_uris() {
        let ca = TestCa::new("example.org");
        let (leaf, _) = ca.issue(&["https://example.org/x", "spiffe://example.org/svc"]);

        let id = spiffe_id_from_der(leaf.as_ref()).unwrap();
        assert_eq!(id.to_string(), "spiffe://example.org/svc");
    }

    #[test]
    fn missing_spiffe_id() {
        let ca = TestCa::new("example.org");
        let (leaf, _) = ca.issue(&[]);

        assert!(matches!(
            spiffe_id_from_der(leaf.as_ref()),
            Err(Error::MissingSpiffeId)
        ));
    }

    #[test]
    fn multiple_spiffe_ids() {
        let ca = TestCa::new("example.org");
        let (leaf, _) = ca.issue(&["spiffe://example.org/a", "spiffe://example.org/b"]);

        assert!(matches!(
            spiffe_id_from_der(leaf.as_ref()),
            Err(Error::MultipleSpiffeIds)
        ));
    }

    #[test]
    fn garbage_is_a_parse_error() {
        assert!(matches!(
            spiffe_id_from_der(b"not a certificate"),
            Err(Error::CertParse(_))
        ));
        assert!(matches!(not_after(&[0x30, 0x01]), Err(Error::CertParse(_))));
    }

    #[test]
    fn reads_not_after() {
        let ca = TestCa::new("example.org");
        let (leaf, _) = ca.issue(&["spiffe://example.org/svc"]);

        // rcgen defaults to a validity ending in 4096.
        assert!(not_after(leaf.as_ref()).unwrap() > 4_000_000_000);
    }
}
