//! Streaming AES-256-GCM over byte streams.
//!
//! Stored objects carry no framing: the blob is raw ciphertext, and the
//! 12-byte IV and 16-byte tag live on the share record. Changing the
//! algorithm or either size invalidates every stored share.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use actix_web::web::Bytes;
use futures::{ready, Stream};
use openssl::symm::{Cipher, Crypter, Mode};
use sodiumoxide::randombytes::randombytes_into;

use crate::error::ShareError;
use crate::keys::EncryptionKey;

pub const IV_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Iv([u8; IV_LEN]);

impl Iv {
    /// Fresh random IV. Every encryption gets its own, including retries.
    pub fn generate() -> Self {
        let mut bytes = [0u8; IV_LEN];
        randombytes_into(&mut bytes);
        Iv(bytes)
    }

    pub fn from_hex(value: &str) -> Option<Self> {
        let mut bytes = [0u8; IV_LEN];
        hex::decode_to_slice(value, &mut bytes).ok()?;
        Some(Iv(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthTag([u8; TAG_LEN]);

impl AuthTag {
    pub fn from_hex(value: &str) -> Option<Self> {
        let mut bytes = [0u8; TAG_LEN];
        hex::decode_to_slice(value, &mut bytes).ok()?;
        Some(AuthTag(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

#[derive(Clone)]
pub struct CipherStream {
    key: Arc<EncryptionKey>,
}

impl CipherStream {
    pub fn new(key: Arc<EncryptionKey>) -> Self {
        CipherStream { key }
    }

    /// Wrap `plaintext` so that polling it yields ciphertext. The tag is
    /// available from [`SealingStream::tag`] once the stream is exhausted.
    pub fn encrypt<S>(&self, plaintext: S) -> Result<SealingStream<S>, ShareError> {
        let iv = Iv::generate();
        let cipher = Cipher::aes_256_gcm();
        let crypter = Crypter::new(cipher, Mode::Encrypt, self.key.as_bytes(), Some(&iv.0[..]))?;

        Ok(SealingStream {
            inner: plaintext,
            crypter,
            block_size: cipher.block_size(),
            iv,
            tag: None,
            done: false,
        })
    }

    /// Wrap `ciphertext` so that polling it yields plaintext. The final item
    /// is `Err(ShareError::Integrity)` when the tag does not verify.
    pub fn decrypt<S>(
        &self,
        ciphertext: S,
        iv: &Iv,
        tag: &AuthTag,
    ) -> Result<OpeningStream<S>, ShareError> {
        let cipher = Cipher::aes_256_gcm();
        let mut crypter = Crypter::new(cipher, Mode::Decrypt, self.key.as_bytes(), Some(&iv.0[..]))?;
        crypter.set_tag(&tag.0)?;

        Ok(OpeningStream {
            inner: ciphertext,
            crypter,
            block_size: cipher.block_size(),
            held: Bytes::new(),
            done: false,
        })
    }
}

fn transform(crypter: &mut Crypter, block_size: usize, chunk: &[u8]) -> Result<Bytes, ShareError> {
    if chunk.is_empty() {
        return Ok(Bytes::new());
    }
    let mut out = vec![0u8; chunk.len() + block_size];
    let written = crypter.update(chunk, &mut out)?;
    out.truncate(written);
    Ok(Bytes::from(out))
}

pub struct SealingStream<S> {
    inner: S,
    crypter: Crypter,
    block_size: usize,
    iv: Iv,
    tag: Option<AuthTag>,
    done: bool,
}

impl<S> SealingStream<S> {
    pub fn iv(&self) -> Iv {
        self.iv
    }

    /// `None` until the plaintext has been fully consumed.
    pub fn tag(&self) -> Option<AuthTag> {
        self.tag
    }

    fn seal(&mut self) -> Result<Bytes, ShareError> {
        let mut out = vec![0u8; self.block_size];
        let written = self.crypter.finalize(&mut out)?;
        out.truncate(written);

        let mut tag = [0u8; TAG_LEN];
        self.crypter.get_tag(&mut tag)?;
        self.tag = Some(AuthTag(tag));
        Ok(Bytes::from(out))
    }
}

impl<S> Stream for SealingStream<S>
where
    S: Stream<Item = Result<Bytes, ShareError>> + Unpin,
{
    type Item = Result<Bytes, ShareError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }

        match ready!(Pin::new(&mut this.inner).poll_next(cx)) {
            Some(Ok(chunk)) => {
                let out = transform(&mut this.crypter, this.block_size, &chunk);
                if out.is_err() {
                    this.done = true;
                }
                Poll::Ready(Some(out))
            }
            Some(Err(e)) => {
                this.done = true;
                Poll::Ready(Some(Err(e)))
            }
            None => {
                this.done = true;
                match this.seal() {
                    Ok(rest) if rest.is_empty() => Poll::Ready(None),
                    other => Poll::Ready(Some(other)),
                }
            }
        }
    }
}

/// Holds back the most recent plaintext chunk until the next one arrives, and
/// the last one until the tag has verified. A tampered object therefore never
/// yields its full length of plaintext.
pub struct OpeningStream<S> {
    inner: S,
    crypter: Crypter,
    block_size: usize,
    held: Bytes,
    done: bool,
}

impl<S> OpeningStream<S> {
    fn open(&mut self) -> Result<Bytes, ShareError> {
        let mut out = vec![0u8; self.block_size];
        let written = self
            .crypter
            .finalize(&mut out)
            .map_err(|_| ShareError::Integrity)?;
        let held = std::mem::take(&mut self.held);
        if written == 0 {
            return Ok(held);
        }
        out.truncate(written);
        Ok(Bytes::from([&held[..], &out[..]].concat()))
    }
}

impl<S> Stream for OpeningStream<S>
where
    S: Stream<Item = Result<Bytes, ShareError>> + Unpin,
{
    type Item = Result<Bytes, ShareError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if this.done {
                return Poll::Ready(None);
            }

            match ready!(Pin::new(&mut this.inner).poll_next(cx)) {
                Some(Ok(chunk)) => {
                    let out = match transform(&mut this.crypter, this.block_size, &chunk) {
                        Ok(out) => out,
                        Err(e) => {
                            this.done = true;
                            return Poll::Ready(Some(Err(e)));
                        }
                    };
                    if out.is_empty() {
                        continue;
                    }
                    let previous = std::mem::replace(&mut this.held, out);
                    if !previous.is_empty() {
                        return Poll::Ready(Some(Ok(previous)));
                    }
                }
                Some(Err(e)) => {
                    this.done = true;
                    this.held = Bytes::new();
                    return Poll::Ready(Some(Err(e)));
                }
                None => {
                    this.done = true;
                    return match this.open() {
                        Ok(last) if last.is_empty() => Poll::Ready(None),
                        other => Poll::Ready(Some(other)),
                    };
                }
            }
        }
    }
}
