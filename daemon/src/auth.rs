use sha2::{Digest, Sha256};

/// Optional shared-password gate. Clients present the SHA-256 hex digest of
/// the configured password as their token.
pub struct AccessGate {
    token: Option<String>,
}

impl AccessGate {
    pub fn new(password: Option<&str>) -> Self {
        Self {
            token: password.map(sha256_hex),
        }
    }

    pub fn enabled(&self) -> bool {
        self.token.is_some()
    }

    pub fn verify(&self, supplied: &str) -> bool {
        match &self.token {
            Some(token) => constant_time_eq(supplied.trim(), token),
            None => false,
        }
    }

    /// The auth routes themselves stay reachable so a client can verify its
    /// token; everything else requires one when the gate is enabled.
    pub fn allows(&self, path: &str, supplied: Option<&str>) -> bool {
        if self.token.is_none() || path.starts_with("/api/auth/") {
            return true;
        }
        supplied.map(|value| self.verify(value)).unwrap_or(false)
    }
}

pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Bitwise fold over the whole input so the comparison time does not depend
/// on where the first mismatch sits.
fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
