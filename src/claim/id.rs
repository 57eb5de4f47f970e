use std::sync::atomic::{AtomicU64, Ordering};

use rand::Rng;
use serde::{Deserialize, Serialize};

const SECRET_LEN: usize = 20;

/// An unguessable claim token: `<addr>#<birthday>#<sequence>#<secret>`.
///
/// `Display` and `Debug` print only the public part, so tokens never end up
/// in logs or public records.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClaimId(String);

impl ClaimId {
    pub fn from_token(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The full secret token. Only sent to the claim's owner.
    pub fn secret(&self) -> &str {
        &self.0
    }

    /// Exact comparison against a token presented by a remote party.
    pub fn matches(&self, presented: &str) -> bool {
        self.0 == presented
    }

    /// The token with its secret part blanked (`<addr>#<bday>#<seq>#...`).
    pub fn public_id(&self) -> String {
        match self.0.rfind('#') {
            Some(pos) => format!("{}#...", &self.0[..pos]),
            None => "...".to_string(),
        }
    }

    /// Sequence number embedded in the token, if it is well-formed.
    pub fn sequence(&self) -> Option<u64> {
        self.0.split('#').nth(2).and_then(|s| s.parse().ok())
    }
}

impl std::fmt::Display for ClaimId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.public_id())
    }
}

impl std::fmt::Debug for ClaimId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ClaimId({})", self.public_id())
    }
}

/// Generates claim tokens for one daemon instance.
#[derive(Debug)]
pub struct ClaimIdFactory {
    address: String,
    birthday: i64,
    sequence: AtomicU64,
}

impl ClaimIdFactory {
    pub fn new(address: impl Into<String>, birthday: i64) -> Self {
        Self {
            address: address.into(),
            birthday,
            sequence: AtomicU64::new(0),
        }
    }

    pub fn next_id(&self) -> ClaimId {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let mut rng = rand::thread_rng();
        let secret: String = (0..SECRET_LEN)
            .map(|_| char::from_digit(rng.gen_range(0..16), 16).unwrap_or('0'))
            .collect();
        ClaimId(format!(
            "<{}>#{}#{}#{}",
            self.address, self.birthday, seq, secret
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn token_format() {
        let factory = ClaimIdFactory::new("10.0.0.5:9618", 1_700_000_000);
        let id = factory.next_id();
        let parts: Vec<_> = id.secret().split('#').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0], "<10.0.0.5:9618>");
        assert_eq!(parts[1], "1700000000");
        assert_eq!(parts[2], "1");
        assert_eq!(parts[3].len(), SECRET_LEN);
        assert!(parts[3].chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(id.sequence(), Some(1));
    }

    #[test]
    fn display_hides_secret() {
        let factory = ClaimIdFactory::new("host:1", 7);
        let id = factory.next_id();
        let secret_part = id.secret().rsplit('#').next().unwrap().to_string();
        assert_eq!(id.to_string(), "<host:1>#7#1#...");
        assert!(!format!("{:?}", id).contains(&secret_part));
    }

    #[test]
    fn tokens_are_unique_and_match_exactly() {
        let factory = ClaimIdFactory::new("host:1", 7);
        let ids: Vec<_> = (0..100).map(|_| factory.next_id()).collect();
        let unique: HashSet<_> = ids.iter().map(|id| id.secret().to_string()).collect();
        assert_eq!(unique.len(), 100);

        assert!(ids[0].matches(ids[0].secret()));
        assert!(!ids[0].matches(ids[1].secret()));
        assert!(!ids[0].matches(&ids[0].public_id()));
    }
}
