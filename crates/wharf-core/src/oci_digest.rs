use digest::{Digest, DynDigest};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::Sha256;
use sha2::Sha512;

use crate::{Error, Result};

// https://github.com/opencontainers/image-spec/blob/main/descriptor.md#digests
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OciDigest {
    algorithm: RegisteredImageSpecAlgorithm,
    encoded: String,
}

impl TryFrom<&str> for OciDigest {
    type Error = Error;
    fn try_from(s: &str) -> Result<Self> {
        let (algo, encoded) = match s.split_once(':') {
            Some((a, e)) if !a.is_empty() && !e.is_empty() => (a, e),
            _ => return Err(Error::InvalidDigest(s.to_string())),
        };
        let algorithm = match algo {
            "sha256" => RegisteredImageSpecAlgorithm::Sha256,
            "sha512" => RegisteredImageSpecAlgorithm::Sha512,
            a if a.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()) => {
                return Err(Error::UnsupportedDigestAlgorithm(a.to_string()));
            }
            _ => return Err(Error::InvalidDigest(s.to_string())),
        };
        if encoded.len() != algorithm.encoded_len()
            || !encoded
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
        {
            return Err(Error::InvalidDigest(s.to_string()));
        }

        Ok(Self {
            algorithm,
            encoded: encoded.to_string(),
        })
    }
}

impl std::str::FromStr for OciDigest {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        s.try_into()
    }
}

impl From<&[u8]> for OciDigest {
    /// Digest arbitrary content with the default (sha256) algorithm.
    fn from(bs: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        Digest::update(&mut hasher, bs);
        let s = hasher.finalize();

        Self {
            algorithm: RegisteredImageSpecAlgorithm::Sha256,
            encoded: format!("{:x}", s),
        }
    }
}

impl std::fmt::Display for OciDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}:{}", self.algorithm.as_str(), self.encoded)
    }
}

impl From<&OciDigest> for String {
    fn from(d: &OciDigest) -> String {
        d.to_string()
    }
}

impl Serialize for OciDigest {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for OciDigest {
    fn deserialize<D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.as_str().try_into().map_err(serde::de::Error::custom)
    }
}

impl OciDigest {
    pub fn is_valid(s: &str) -> bool {
        OciDigest::try_from(s).is_ok()
    }

    pub fn algorithm(&self) -> &str {
        self.algorithm.as_str()
    }

    /// The hex-encoded hash value without the algorithm prefix.
    pub fn encoded(&self) -> &str {
        &self.encoded
    }

    pub fn digester(&self) -> Digester {
        match self.algorithm {
            RegisteredImageSpecAlgorithm::Sha256 => Digester::new(Box::new(Sha256::new())),
            RegisteredImageSpecAlgorithm::Sha512 => Digester::new(Box::new(Sha512::new())),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
enum RegisteredImageSpecAlgorithm {
    Sha256,
    Sha512,
}

impl RegisteredImageSpecAlgorithm {
    fn as_str(&self) -> &'static str {
        match self {
            RegisteredImageSpecAlgorithm::Sha256 => "sha256",
            RegisteredImageSpecAlgorithm::Sha512 => "sha512",
        }
    }

    fn encoded_len(&self) -> usize {
        match self {
            RegisteredImageSpecAlgorithm::Sha256 => 64,
            RegisteredImageSpecAlgorithm::Sha512 => 128,
        }
    }
}

/// Incrementally digests a byte stream with the algorithm of the expected
/// digest, tracking the number of bytes seen.
pub struct Digester {
    digester: Box<dyn DynDigest + 'static + Send>,
    bytes: u64,
}

impl Digester {
    pub fn new(digester: Box<dyn DynDigest + 'static + Send>) -> Self {
        Self { digester, bytes: 0 }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.digester.update(data);
        self.bytes += data.len() as u64;
    }

    #[inline]
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Consume the digester and return the lowercase hex encoding of the
    /// accumulated hash.
    pub fn finalize(self) -> String {
        let out = self.digester.finalize();
        let mut s = String::with_capacity(out.len() * 2);
        for b in out.iter() {
            s.push_str(&format!("{:02x}", b));
        }
        s
    }
}

impl Default for Digester {
    fn default() -> Self {
        Self::new(Box::new(Sha256::new()))
    }
}
