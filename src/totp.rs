use thiserror::Error;
use totp_rs::{Algorithm, Secret, TOTP};

#[derive(Debug, Error)]
pub enum TotpError {
    #[error("invalid one-time-code seed: {0}")]
    BadSeed(String),
    #[error("system clock error: {0}")]
    Clock(String),
}

/// Seed-to-code generator for the two-factor stage. Six digits, 30 second
/// step, SHA-1, matching what the provider's authenticator-app enrollment
/// hands out.
pub struct CodeGenerator {
    totp: TOTP,
}

impl CodeGenerator {
    pub fn new(seed: &str) -> Result<Self, TotpError> {
        let secret = Secret::Encoded(seed.trim().replace(' ', "").to_uppercase())
            .to_bytes()
            .map_err(|e| TotpError::BadSeed(format!("{e:?}")))?;
        // Provider seeds are commonly 80 bits, below the RFC 4226 minimum the
        // checked constructor enforces.
        Ok(Self {
            totp: TOTP::new_unchecked(Algorithm::SHA1, 6, 1, 30, secret),
        })
    }

    /// The code valid right now.
    pub fn current(&self) -> Result<String, TotpError> {
        self.totp
            .generate_current()
            .map_err(|e| TotpError::Clock(e.to_string()))
    }

    pub fn code_at(&self, unix_seconds: u64) -> String {
        self.totp.generate(unix_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 6238 appendix B test secret, base32-encoded.
    const RFC_SEED: &str = "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ";

    #[test]
    fn known_vector() {
        let gen = CodeGenerator::new(RFC_SEED).unwrap();
        // T=59 falls in the second step; the 8-digit reference value is
        // 94287082, so the 6-digit code is its tail.
        assert_eq!(gen.code_at(59), "287082");
    }

    #[test]
    fn seed_is_normalized() {
        let spaced = "gezd gnbv gy3t qojq gezd gnbv gy3t qojq";
        let gen = CodeGenerator::new(spaced).unwrap();
        assert_eq!(gen.code_at(59), "287082");
    }

    #[test]
    fn short_provider_seed_is_accepted() {
        let gen = CodeGenerator::new("JBSWY3DPEHPK3PXP").unwrap();
        let code = gen.code_at(0);
        assert_eq!(code.len(), 6);
        assert!(code.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn garbage_seed_is_rejected() {
        assert!(CodeGenerator::new("not base32 at all!!!").is_err());
    }
}
