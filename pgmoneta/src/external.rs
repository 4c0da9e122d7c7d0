//! Seams the core calls through for compression, encryption, and
//! hashing, without implementing those external collaborators itself
//! (spec.md §1 Non-goals; SPEC_FULL.md ambient-stack notes). Each trait
//! has a pass-through "none" implementation so the rest of the crate can
//! always call through the boundary.

use sha2::{Digest, Sha256};
use std::io::{self, Read, Write};

pub trait Codec: Send + Sync {
    fn compress(&self, input: &mut dyn Read, output: &mut dyn Write) -> io::Result<()>;
    fn decompress(&self, input: &mut dyn Read, output: &mut dyn Write) -> io::Result<()>;
}

pub trait Encryptor: Send + Sync {
    fn encrypt(&self, input: &mut dyn Read, output: &mut dyn Write) -> io::Result<()>;
    fn decrypt(&self, input: &mut dyn Read, output: &mut dyn Write) -> io::Result<()>;
}

pub trait Hasher: Send + Sync {
    fn digest(&self, input: &mut dyn Read) -> io::Result<Vec<u8>>;
}

pub struct NoneCodec;

impl Codec for NoneCodec {
    fn compress(&self, input: &mut dyn Read, output: &mut dyn Write) -> io::Result<()> {
        io::copy(input, output).map(|_| ())
    }

    fn decompress(&self, input: &mut dyn Read, output: &mut dyn Write) -> io::Result<()> {
        io::copy(input, output).map(|_| ())
    }
}

pub struct NoneEncryptor;

impl Encryptor for NoneEncryptor {
    fn encrypt(&self, input: &mut dyn Read, output: &mut dyn Write) -> io::Result<()> {
        io::copy(input, output).map(|_| ())
    }

    fn decrypt(&self, input: &mut dyn Read, output: &mut dyn Write) -> io::Result<()> {
        io::copy(input, output).map(|_| ())
    }
}

/// SHA-256 is in the workspace stack already (`sha2`, used by SCRAM), so
/// the default hasher is a real digest rather than a no-op — it is the
/// one named by `backup_manifest`'s checksum field and by the SHA-verify
/// worker (spec.md §4.9 `verification_cb`).
pub struct Sha256Hasher;

impl Hasher for Sha256Hasher {
    fn digest(&self, input: &mut dyn Read) -> io::Result<Vec<u8>> {
        let mut hasher = Sha256::new();
        io::copy(input, &mut hasher)?;
        Ok(hasher.finalize().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn none_codec_is_identity() {
        let codec = NoneCodec;
        let mut input = Cursor::new(b"hello world".to_vec());
        let mut output = Vec::new();
        codec.compress(&mut input, &mut output).unwrap();
        assert_eq!(output, b"hello world");
    }

    #[test]
    fn sha256_hasher_matches_known_digest() {
        let hasher = Sha256Hasher;
        let mut input = Cursor::new(b"abc".to_vec());
        let digest = hasher.digest(&mut input).unwrap();
        assert_eq!(
            hex::encode(digest),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
