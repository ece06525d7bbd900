//! Encryption & Decryption.
//!
//! Each engine generates an ephemeral key pair and agrees on a symmetric key with
//! the configured server public key via ECDH. Every item is then encrypted on its
//! own, so items can be decrypted independently of each other.

use thiserror::Error;

use crate::Sealed;

/// Errors that can be occurred during encryption or decryption.
#[derive(Error, Clone, Debug)]
pub enum Error {
    /// An error that occurs during padding or unpadding.
    #[error("padding error")]
    Padding,
    /// An error that occurs during ECDH.
    #[error("ECDH error")]
    Ecdh,
    /// A key could not be parsed from its hex representation.
    #[error("malformed key: {0}")]
    Key(String),
}

/// Represents the type of encryption keys.
///
/// Encryption keys are 16 bytes long (128 bits).
pub type EncryptionKey = [u8; 16];

/// Represents the length of the public key.
///
/// A public key is a compressed elliptic curve point.
/// With length: 1 byte (encoding tag) + 32 bytes (256 bits).
pub const PUBLIC_KEY_LEN: usize = 33;

/// Represents a target for encrypted data or decrypted data.
pub(crate) trait Sink: crate::Sink<Error> {}

impl<T> Sink for T where T: crate::Sink<Error> {}

/// Represents an encryptor that encrypts one self-contained message at a time.
pub(crate) trait Encryptor: Sealed {
    fn encrypt<S>(&mut self, input: &[u8], sink: &mut S) -> Result<(), S::Error>
    where
        S: Sink;
}

/// Represents a decryptor that decrypts one message produced by an [`Encryptor`].
pub(crate) trait Decryptor: Sealed {
    fn decrypt<S>(&mut self, input: &[u8], sink: &mut S) -> Result<(), S::Error>
    where
        S: Sink;
}

pub use ecdh::{gen_ecdh_key_pair, public_key_from_hex, secret_key_from_hex, PublicKey, SecretKey};

/// `Elliptic Curve Diffie–Hellman (ECDH)` Support.
///
/// Using the NIST P-256 (a.k.a. secp256r1, prime256v1) elliptic curve.
pub(crate) mod ecdh {
    use std::mem;

    use p256::{ecdh::diffie_hellman, elliptic_curve, EncodedPoint};
    use rand_core::OsRng;

    use crate::encrypt::{EncryptionKey, Error, PUBLIC_KEY_LEN};

    /// Represents the type of secret keys.
    ///
    /// With length: 32 bytes (256 bits).
    pub type SecretKey = [u8; 32];

    /// Represents the type of public keys.
    ///
    /// A public key is a compressed elliptic curve point.
    /// With length: 1 byte (encoding tag) + 32 bytes (256 bits).
    pub type PublicKey = [u8; PUBLIC_KEY_LEN];

    /// The empty public key, it means no encryption.
    pub(crate) const EMPTY_PUBLIC_KEY: PublicKey = [0; PUBLIC_KEY_LEN];

    impl From<elliptic_curve::Error> for Error {
        #[inline]
        fn from(_: elliptic_curve::Error) -> Self {
            Self::Ecdh
        }
    }

    /// Generates an ECDH key pair.
    pub fn gen_ecdh_key_pair() -> (SecretKey, PublicKey) {
        let secret_key = p256::SecretKey::random(&mut OsRng);
        (secret_key.to_bytes().into(), compressed(&secret_key.public_key()))
    }

    /// Parses a hex encoded public key and checks that it is a point on the curve.
    pub fn public_key_from_hex(encoded: &str) -> Result<PublicKey, Error> {
        let key: PublicKey = decode_hex(encoded)?;
        p256::PublicKey::from_sec1_bytes(&key)?;
        Ok(key)
    }

    /// Parses a hex encoded secret key and checks that it is a valid scalar.
    pub fn secret_key_from_hex(encoded: &str) -> Result<SecretKey, Error> {
        let key: SecretKey = decode_hex(encoded)?;
        p256::SecretKey::from_slice(&key)?;
        Ok(key)
    }

    fn decode_hex<const N: usize>(encoded: &str) -> Result<[u8; N], Error> {
        let bytes = hex::decode(encoded.trim()).map_err(|err| Error::Key(err.to_string()))?;
        let len = bytes.len();
        bytes.try_into().map_err(|_| Error::Key(format!("expected {N} bytes, found {len}")))
    }

    fn compressed(public_key: &p256::PublicKey) -> PublicKey {
        let point = EncodedPoint::from(public_key).compress();
        let mut bytes = EMPTY_PUBLIC_KEY;
        bytes.copy_from_slice(point.as_bytes());
        bytes
    }

    fn encryption_key(shared_secret: &p256::ecdh::SharedSecret) -> Result<EncryptionKey, Error> {
        shared_secret.raw_secret_bytes().as_slice()[..mem::size_of::<EncryptionKey>()]
            .try_into()
            .map_err(|_| Error::Ecdh)
    }

    /// Represents the public and symmetric keys generated in the initialization of
    /// an engine.
    pub(crate) struct Keys {
        /// Represents the public key stamped into every chunk.
        pub(crate) public_key: PublicKey,
        /// Represents the symmetric key during record encryption.
        pub(crate) encryption_key: EncryptionKey,
    }

    impl Keys {
        /// Constructs the `Keys` via Elliptic Curve Diffie-Hellman (ECDH) with a
        /// fresh ephemeral secret key.
        pub(crate) fn new(server_key: &PublicKey) -> Result<Self, Error> {
            let server_key = p256::PublicKey::from_sec1_bytes(server_key)?;
            let secret_key = p256::SecretKey::random(&mut OsRng);

            let shared_secret =
                diffie_hellman(secret_key.to_nonzero_scalar(), server_key.as_affine());
            let encryption_key = encryption_key(&shared_secret)?;

            Ok(Self { public_key: compressed(&secret_key.public_key()), encryption_key })
        }
    }

    /// Negotiates the symmetric key via Elliptic Curve Diffie-Hellman (ECDH).
    pub(crate) fn ecdh_encryption_key(
        secret_key: &SecretKey,
        public_key: &PublicKey,
    ) -> Result<EncryptionKey, Error> {
        let secret_key = p256::SecretKey::from_slice(secret_key)?;
        let public_key = p256::PublicKey::from_sec1_bytes(public_key)?;

        let shared_secret = diffie_hellman(secret_key.to_nonzero_scalar(), public_key.as_affine());
        encryption_key(&shared_secret)
    }
}

pub(crate) use aes::{Decryptor as AesDecryptor, Encryptor as AesEncryptor};

/// `Encryptor` and `Decryptor` for the `AES 128` encryption, with `ECB` mode and
/// `PKCS#7` padding.
///
/// `ECB` mode trades security for speed here; the bytes are compressed before
/// they are encrypted.
pub(crate) mod aes {
    use aes::{Aes128Dec, Aes128Enc};
    use cipher::{
        block_padding::{Pkcs7, UnpadError},
        inout::PadError,
        BlockDecrypt, BlockEncrypt, KeyInit,
    };

    use crate::{
        encrypt::{
            Decryptor as DecryptorTrait, EncryptionKey, Encryptor as EncryptorTrait, Error, Sink,
        },
        Sealed,
    };

    /// 128-bit AES block.
    const BLOCK_SIZE: usize = 16;

    impl From<PadError> for Error {
        #[inline]
        fn from(_: PadError) -> Self {
            Self::Padding
        }
    }

    impl From<UnpadError> for Error {
        #[inline]
        fn from(_: UnpadError) -> Self {
            Self::Padding
        }
    }

    /// The `AES` encryptor.
    pub(crate) struct Encryptor {
        inner: Aes128Enc,
        buffer: Vec<u8>,
    }

    impl Encryptor {
        /// Constructs a new `Encryptor` with encryption key.
        #[inline]
        pub(crate) fn new(key: &EncryptionKey) -> Self {
            Self { inner: Aes128Enc::new(key.into()), buffer: Vec::new() }
        }
    }

    impl EncryptorTrait for Encryptor {
        fn encrypt<S>(&mut self, input: &[u8], sink: &mut S) -> Result<(), S::Error>
        where
            S: Sink,
        {
            // Room for at most one block of padding.
            self.buffer.clear();
            self.buffer.extend_from_slice(input);
            self.buffer.resize(input.len() + BLOCK_SIZE, 0);

            let bytes = self
                .inner
                .encrypt_padded::<Pkcs7>(&mut self.buffer, input.len())
                .map_err(Error::from)?;
            sink.sink(bytes)
        }
    }

    impl Sealed for Encryptor {}

    /// The `AES` decryptor.
    pub(crate) struct Decryptor {
        inner: Aes128Dec,
        buffer: Vec<u8>,
    }

    impl Decryptor {
        /// Constructs a new `Decryptor` with encryption key.
        #[inline]
        pub(crate) fn new(key: &EncryptionKey) -> Self {
            Self { inner: Aes128Dec::new(key.into()), buffer: Vec::new() }
        }
    }

    impl DecryptorTrait for Decryptor {
        fn decrypt<S>(&mut self, input: &[u8], sink: &mut S) -> Result<(), S::Error>
        where
            S: Sink,
        {
            if input.is_empty() || input.len() % BLOCK_SIZE != 0 {
                return Err(Error::Padding.into());
            }

            self.buffer.clear();
            self.buffer.extend_from_slice(input);
            let bytes = self.inner.decrypt_padded::<Pkcs7>(&mut self.buffer).map_err(Error::from)?;
            sink.sink(bytes)
        }
    }

    impl Sealed for Decryptor {}
}

impl<T> Encryptor for Option<T>
where
    T: Encryptor,
{
    #[inline]
    fn encrypt<S>(&mut self, input: &[u8], sink: &mut S) -> Result<(), S::Error>
    where
        S: Sink,
    {
        match self {
            Some(encryptor) => encryptor.encrypt(input, sink),
            // Just writes its all input to the sink directly.
            None => sink.sink(input),
        }
    }
}

impl<T> Decryptor for Option<T>
where
    T: Decryptor,
{
    #[inline]
    fn decrypt<S>(&mut self, input: &[u8], sink: &mut S) -> Result<(), S::Error>
    where
        S: Sink,
    {
        match self {
            Some(decryptor) => decryptor.decrypt(input, sink),
            // Just writes its all input to the sink directly.
            None => sink.sink(input),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::encrypt::{
        ecdh::{ecdh_encryption_key, public_key_from_hex, secret_key_from_hex, Keys},
        gen_ecdh_key_pair, AesDecryptor, AesEncryptor, Decryptor, EncryptionKey, Encryptor,
        Error,
    };

    const KEY: EncryptionKey = [0x23; 16];

    fn aes_encrypt(key: &EncryptionKey, input: &[u8]) -> Vec<u8> {
        let mut sink = Vec::new();
        AesEncryptor::new(key).encrypt(input, &mut sink).unwrap();
        sink
    }

    fn aes_decrypt(key: &EncryptionKey, input: &[u8]) -> Result<Vec<u8>, Error> {
        let mut sink = Vec::new();
        AesDecryptor::new(key).decrypt(input, &mut sink)?;
        Ok(sink)
    }

    #[test]
    fn test_aes() {
        for data in [&b""[..], b"Hello World", b"123456789ABCDEFG", b"Hello, I'm a log line."] {
            let encrypted = aes_encrypt(&KEY, data);
            assert_eq!(encrypted.len() % 16, 0);
            assert!(encrypted.len() > data.len());
            assert_eq!(aes_decrypt(&KEY, &encrypted).unwrap(), data);
        }
    }

    #[test]
    fn test_aes_is_per_message() {
        // The same message always gives the same ciphertext: no state is carried.
        let mut encryptor = AesEncryptor::new(&KEY);
        let (mut first, mut second) = (Vec::new(), Vec::new());
        encryptor.encrypt(b"same", &mut first).unwrap();
        encryptor.encrypt(b"same", &mut second).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_aes_malformed_input() {
        assert!(aes_decrypt(&KEY, b"").is_err());
        assert!(aes_decrypt(&KEY, b"not a multiple of 16").is_err());

        // A wrong key leaves invalid padding behind (with overwhelming probability).
        let encrypted = aes_encrypt(&KEY, b"Hello World");
        assert_ne!(aes_decrypt(&[0x42; 16], &encrypted).ok(), Some(b"Hello World".to_vec()));
    }

    #[test]
    fn test_plaintext_passthrough() {
        let mut sink = Vec::new();
        None::<AesEncryptor>.encrypt(b"plain", &mut sink).unwrap();
        None::<AesDecryptor>.decrypt(&sink.clone(), &mut sink).unwrap();
        assert_eq!(sink, b"plainplain");
    }

    #[test]
    fn test_ecdh_symmetry() {
        let (server_secret, server_public) = gen_ecdh_key_pair();
        let (sender_secret, sender_public) = gen_ecdh_key_pair();

        let sender_side = ecdh_encryption_key(&sender_secret, &server_public).unwrap();
        let server_side = ecdh_encryption_key(&server_secret, &sender_public).unwrap();
        assert_eq!(sender_side, server_side);

        let encrypted = aes_encrypt(&sender_side, b"shared secret works");
        assert_eq!(aes_decrypt(&server_side, &encrypted).unwrap(), b"shared secret works");
    }

    #[test]
    fn test_keys() {
        let (server_secret, server_public) = gen_ecdh_key_pair();
        let keys = Keys::new(&server_public).unwrap();

        let recovered = ecdh_encryption_key(&server_secret, &keys.public_key).unwrap();
        assert_eq!(recovered, keys.encryption_key);

        // Every engine gets its own ephemeral key.
        assert_ne!(Keys::new(&server_public).unwrap().public_key, keys.public_key);
    }

    #[test]
    fn test_hex_keys() {
        let (secret, public) = gen_ecdh_key_pair();
        assert_eq!(secret_key_from_hex(&hex::encode(secret)).unwrap(), secret);
        assert_eq!(public_key_from_hex(&hex::encode(public)).unwrap(), public);

        assert!(matches!(public_key_from_hex("zz"), Err(Error::Key(_))));
        assert!(matches!(public_key_from_hex(&hex::encode([2; 12])), Err(Error::Key(_))));
        // Right length, but not a point on the curve.
        assert!(matches!(public_key_from_hex(&hex::encode([0xFF; 33])), Err(Error::Ecdh)));
    }
}
