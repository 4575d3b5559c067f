//! Fixed certificate fixtures for identity and provisioning tests.
//!
//! `DEVICE_ONE_CERT_PEM` and `DEVICE_ONE_REISSUED_CERT_PEM` are two P-256
//! certificates issued for the same key pair; `DEVICE_TWO_CERT_PEM` uses a
//! different key. The SKID constants were computed independently of this crate
//! from each certificate's subjectKeyIdentifier extension.

pub const DEVICE_ONE_SKID: &str = "08cc4174fa1e2dec22eab5cea149c0fe4f6a0914";
pub const DEVICE_TWO_SKID: &str = "709efaa583b86f6353940362ed4f54dfa960e704";

pub const DEVICE_ONE_CERT_PEM: &str = "\
-----BEGIN CERTIFICATE-----\n\
MIIBgjCCASegAwIBAgIUV0B+3zznJj0UfDQUWQ+0ptUXWJEwCgYIKoZIzj0EAwIw\n\
FjEUMBIGA1UEAwwLenQtZGV2aWNlLTEwHhcNMjYxMDE3MTUwMzQwWhcNMzYxMDE0\n\
MTUwMzQwWjAWMRQwEgYDVQQDDAt6dC1kZXZpY2UtMTBZMBMGByqGSM49AgEGCCqG\n\
SM49AwEHA0IABCmiW/ywe75D91+Pj//0XrDPJKkgoY22JMQia/Knt4xCYisbwrP+\n\
k7LMkAaBhyUYsflDymc34NWcFW3ZXUEgVYijUzBRMB8GA1UdIwQYMBaAFAjMQXT6\n\
Hi3sIuq1zqFJwP5PagkUMA8GA1UdEwEB/wQFMAMBAf8wHQYDVR0OBBYEFAjMQXT6\n\
Hi3sIuq1zqFJwP5PagkUMAoGCCqGSM49BAMCA0kAMEYCIQDpOJ1xbP98fuX9Fvqf\n\
/vnezTiE0in+YaKBnevPLYidsAIhAIeoQx9GSqlIkBZs+aRg4gxxHxKoBlUp8F+O\n\
VNX/bZx3\n\
-----END CERTIFICATE-----\n\
";

pub const DEVICE_ONE_REISSUED_CERT_PEM: &str = "\
-----BEGIN CERTIFICATE-----\n\
MIIBkjCCATmgAwIBAgIUDIb8i20bJbtDjqi7J1UOyfDagMgwCgYIKoZIzj0EAwIw\n\
HzEdMBsGA1UEAwwUenQtZGV2aWNlLTEtcmVpc3N1ZWQwHhcNMjYxMDE3MTUwMzQw\n\
WhcNMzYxMDE0MTUwMzQwWjAfMR0wGwYDVQQDDBR6dC1kZXZpY2UtMS1yZWlzc3Vl\n\
ZDBZMBMGByqGSM49AgEGCCqGSM49AwEHA0IABCmiW/ywe75D91+Pj//0XrDPJKkg\n\
oY22JMQia/Knt4xCYisbwrP+k7LMkAaBhyUYsflDymc34NWcFW3ZXUEgVYijUzBR\n\
MB8GA1UdIwQYMBaAFAjMQXT6Hi3sIuq1zqFJwP5PagkUMA8GA1UdEwEB/wQFMAMB\n\
Af8wHQYDVR0OBBYEFAjMQXT6Hi3sIuq1zqFJwP5PagkUMAoGCCqGSM49BAMCA0cA\n\
MEQCIDRiMU8HqsCqmB6olzltPe3kEuxAEWiZAZfiekfYo+DcAiAm70zzuH6IDbo7\n\
Wys19xsESrg0Oe7kKnmzARhuQSGpdQ==\n\
-----END CERTIFICATE-----\n\
";

pub const DEVICE_TWO_CERT_PEM: &str = "\
-----BEGIN CERTIFICATE-----\n\
MIIBgTCCASegAwIBAgIUPwRwJRZ0N9qAJhLqwQyZWAr27XEwCgYIKoZIzj0EAwIw\n\
FjEUMBIGA1UEAwwLenQtZGV2aWNlLTIwHhcNMjYxMDE3MTUwMzQwWhcNMzYxMDE0\n\
MTUwMzQwWjAWMRQwEgYDVQQDDAt6dC1kZXZpY2UtMjBZMBMGByqGSM49AgEGCCqG\n\
SM49AwEHA0IABOd7uYh7ke6vjTAqTuOQdjbueCqlR06UjWC+wLB++1jL1OpNr/4B\n\
33xT6SCwOSCcpiLhDLHYjsX1WxNm87+dwoajUzBRMB8GA1UdIwQYMBaAFHCe+qWD\n\
uG9jU5QDYu1PVN+pYOcEMA8GA1UdEwEB/wQFMAMBAf8wHQYDVR0OBBYEFHCe+qWD\n\
uG9jU5QDYu1PVN+pYOcEMAoGCCqGSM49BAMCA0gAMEUCICbUmx8jtBhYs+/nGnfu\n\
V64Z+NcarFIhd0Ym32sAHgE0AiEApfZNG+9XFjQXwE3twEil79kgaR6d8BWITYI1\n\
xK6INHw=\n\
-----END CERTIFICATE-----\n\
";
