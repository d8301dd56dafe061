use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::{Choice, ConstantTimeEq};

type HmacSha256 = Hmac<Sha256>;

/// Checks callback signatures against the configured shared secrets.
///
/// A signature is the lowercase hex HMAC-SHA256 of the raw request body.
/// Every configured secret is tried, so the caller may rotate secrets.
#[derive(Clone)]
pub struct SignatureValidator {
    secrets: Vec<String>,
}

impl SignatureValidator {
    pub fn new<I, S>(secrets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            secrets: secrets.into_iter().map(Into::into).collect(),
        }
    }

    /// Sign a body with a secret
    pub fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac =
            HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    /// Validate a signature against every secret.
    ///
    /// All secrets are compared in constant time, without stopping at the
    /// first match.
    pub fn validate(&self, signature: Option<&str>, body: &[u8]) -> bool {
        let Some(signature) = signature else {
            return false;
        };

        let matched = self
            .secrets
            .iter()
            .map(|secret| Self::sign(secret, body).as_bytes().ct_eq(signature.as_bytes()))
            .fold(Choice::from(0), |acc, eq| acc | eq);

        matched.into()
    }
}

impl std::fmt::Debug for SignatureValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureValidator")
            .field("secrets", &self.secrets.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &[u8] = br#"{"key":"k","state":"ready","extraParameters":{}}"#;

    #[test]
    fn test_any_configured_secret_validates() {
        let validator = SignatureValidator::new(["old-secret", "new-secret"]);

        assert!(validator.validate(Some(&SignatureValidator::sign("old-secret", BODY)), BODY));
        assert!(validator.validate(Some(&SignatureValidator::sign("new-secret", BODY)), BODY));
        assert!(!validator.validate(Some(&SignatureValidator::sign("other", BODY)), BODY));
    }

    #[test]
    fn test_known_digest() {
        assert_eq!(
            SignatureValidator::sign("key", b"The quick brown fox jumps over the lazy dog"),
            "f7bc83f430538424b13298e6aa6fb143ef4d59a14946175997479dbc2d1a3cd8"
        );
    }

    #[test]
    fn test_missing_or_empty_inputs_fail() {
        let validator = SignatureValidator::new(["secret"]);
        assert!(!validator.validate(None, BODY));
        assert!(!validator.validate(Some(""), BODY));

        let empty = SignatureValidator::new(Vec::<String>::new());
        assert!(!empty.validate(Some(&SignatureValidator::sign("secret", BODY)), BODY));
    }

    #[test]
    fn test_single_bit_mutation_of_signature_fails() {
        let validator = SignatureValidator::new(["secret"]);
        let signature = SignatureValidator::sign("secret", BODY);

        for index in 0..signature.len() {
            for bit in 0..8 {
                let mut mutated = signature.clone().into_bytes();
                mutated[index] ^= 1 << bit;
                let mutated = String::from_utf8_lossy(&mutated).into_owned();
                assert!(!validator.validate(Some(&mutated), BODY), "byte {index} bit {bit}");
            }
        }
    }

    #[test]
    fn test_single_bit_mutation_of_body_fails() {
        let validator = SignatureValidator::new(["secret"]);
        let signature = SignatureValidator::sign("secret", BODY);

        for index in 0..BODY.len() {
            for bit in 0..8 {
                let mut mutated = BODY.to_vec();
                mutated[index] ^= 1 << bit;
                assert!(!validator.validate(Some(&signature), &mutated), "byte {index} bit {bit}");
            }
        }
    }

    #[test]
    fn test_uppercase_signature_rejected() {
        let validator = SignatureValidator::new(["secret"]);
        let signature = SignatureValidator::sign("secret", BODY).to_uppercase();
        assert!(!validator.validate(Some(&signature), BODY));
    }
}
