use bytes::Bytes;
use parking_lot::RwLock;
use sha1::{Digest, Sha1};
use std::net::SocketAddrV4;
use tracing::debug;

struct TokenSecrets {
    current: [u8; 16],
    previous: [u8; 16],
}

/// Issues and checks the opaque tokens that authorize `announce_peer`.
///
/// A token is a digest of the remote IP and a rotating secret, so it proves
/// the announcer recently completed a `get_peers` from that address. The
/// port plays no part: tokens issued to one IP verify regardless of source
/// port. Verification accepts the current and the previous secret, so a
/// token stays valid for one rotation past the epoch that issued it.
pub struct TokenManager {
    secrets: RwLock<TokenSecrets>,
}

impl TokenManager {
    pub fn new() -> Self {
        Self {
            secrets: RwLock::new(TokenSecrets {
                current: rand::random(),
                previous: rand::random(),
            }),
        }
    }

    /// Issues a token for the remote endpoint under the current secret.
    pub fn generate(&self, addr: &SocketAddrV4) -> Bytes {
        digest(addr, &self.secrets.read().current)
    }

    /// Checks a token against the current and previous secrets.
    pub fn verify(&self, addr: &SocketAddrV4, token: &[u8]) -> bool {
        let secrets = self.secrets.read();

        digest(addr, &secrets.current) == token || digest(addr, &secrets.previous) == token
    }

    /// Retires the current secret to previous and draws a fresh one.
    pub fn rotate(&self) {
        let mut secrets = self.secrets.write();
        secrets.previous = secrets.current;
        secrets.current = rand::random();
        debug!("announce token secret rotated");
    }
}

impl Default for TokenManager {
    fn default() -> Self {
        Self::new()
    }
}

fn digest(addr: &SocketAddrV4, secret: &[u8; 16]) -> Bytes {
    let mut hasher = Sha1::new();
    hasher.update(addr.ip().octets());
    hasher.update(secret);

    let result = hasher.finalize();
    Bytes::copy_from_slice(&result[..8])
}
