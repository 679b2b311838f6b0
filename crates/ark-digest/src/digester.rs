use std::collections::BTreeMap;
use std::fmt;

use sha2::Digest;

use crate::algorithm::{DigestAlgorithm, DigestError};

/// Digests of one piece of content keyed by algorithm name.
pub type DigestSet = BTreeMap<String, String>;

/// One incremental hasher.
#[derive(Clone)]
pub enum Digester {
    Sha512(sha2::Sha512),
    Sha256(sha2::Sha256),
    Sha1(sha1::Sha1),
    Md5(md5::Md5),
    Blake3(Box<blake3::Hasher>),
}

impl Digester {
    pub fn new(alg: DigestAlgorithm) -> Self {
        match alg {
            DigestAlgorithm::Sha512 => Self::Sha512(sha2::Sha512::new()),
            DigestAlgorithm::Sha256 => Self::Sha256(sha2::Sha256::new()),
            DigestAlgorithm::Sha1 => Self::Sha1(sha1::Sha1::new()),
            DigestAlgorithm::Md5 => Self::Md5(md5::Md5::new()),
            DigestAlgorithm::Blake3 => Self::Blake3(Box::new(blake3::Hasher::new())),
        }
    }

    pub fn algorithm(&self) -> DigestAlgorithm {
        match self {
            Self::Sha512(_) => DigestAlgorithm::Sha512,
            Self::Sha256(_) => DigestAlgorithm::Sha256,
            Self::Sha1(_) => DigestAlgorithm::Sha1,
            Self::Md5(_) => DigestAlgorithm::Md5,
            Self::Blake3(_) => DigestAlgorithm::Blake3,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha512(h) => h.update(data),
            Self::Sha256(h) => h.update(data),
            Self::Sha1(h) => h.update(data),
            Self::Md5(h) => h.update(data),
            Self::Blake3(h) => {
                h.update(data);
            }
        }
    }

    /// Consume the hasher and return the lowercase hex digest.
    pub fn finish_hex(self) -> String {
        match self {
            Self::Sha512(h) => hex::encode(h.finalize()),
            Self::Sha256(h) => hex::encode(h.finalize()),
            Self::Sha1(h) => hex::encode(h.finalize()),
            Self::Md5(h) => hex::encode(h.finalize()),
            Self::Blake3(h) => h.finalize().to_hex().to_string(),
        }
    }
}

impl fmt::Debug for Digester {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digester({})", self.algorithm())
    }
}

/// Hex digest of `data` in one call.
pub fn digest_hex(alg: DigestAlgorithm, data: &[u8]) -> String {
    let mut d = Digester::new(alg);
    d.update(data);
    d.finish_hex()
}

/// Several digesters fed by a single pass over the content.
///
/// Keeps the caller's algorithm names, so the resulting [`DigestSet`] is keyed
/// exactly as configured.
#[derive(Clone, Debug)]
pub struct MultiDigester {
    digesters: Vec<(String, Digester)>,
}

impl MultiDigester {
    /// Build digesters for every named algorithm. Fails on the first name that
    /// isn't recognized, before any data is consumed. Duplicate names are
    /// digested once.
    pub fn new<S: AsRef<str>>(algorithms: &[S]) -> Result<Self, DigestError> {
        let mut digesters: Vec<(String, Digester)> = Vec::with_capacity(algorithms.len());
        for name in algorithms {
            let name = name.as_ref();
            let alg: DigestAlgorithm = name.parse()?;
            if digesters.iter().any(|(n, _)| n == name) {
                continue;
            }
            digesters.push((name.to_string(), Digester::new(alg)));
        }
        Ok(Self { digesters })
    }

    pub fn update(&mut self, data: &[u8]) {
        for (_, d) in &mut self.digesters {
            d.update(data);
        }
    }

    pub fn len(&self) -> usize {
        self.digesters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.digesters.is_empty()
    }

    pub fn finish(self) -> DigestSet {
        self.digesters
            .into_iter()
            .map(|(name, d)| (name, d.finish_hex()))
            .collect()
    }
}
