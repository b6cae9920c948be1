use std::io;

use aes_gcm::aead::stream::{DecryptorBE32, EncryptorBE32};
use aes_gcm::aead::Payload;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::Aes256Gcm;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::StreamExt;

use super::cipher::{
    split_header, unwrap_cipher, CipherError, DecryptionError, STREAM_NONCE_SIZE,
    STREAM_VERSION, TAG_SIZE,
};
use super::keys::PrivateKey;
use crate::store::ByteStream;

/// Plaintext bytes per frame
pub const CHUNK_SIZE: usize = 64 * 1024;

const FLAG_NEXT: u8 = 0;
const FLAG_LAST: u8 = 1;
const FRAME_HEADER_SIZE: usize = 5;
const MAX_FRAME_SIZE: usize = CHUNK_SIZE + TAG_SIZE;

fn decryption_failed() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, DecryptionError)
}

fn frame(flag: u8, ciphertext: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + ciphertext.len());
    buf.put_u8(flag);
    buf.put_u32(ciphertext.len() as u32);
    buf.put_slice(ciphertext);
    buf.freeze()
}

pub(crate) struct EncryptStream {
    input: Option<ByteStream>,
    buffer: BytesMut,
    encryptor: Option<EncryptorBE32<Aes256Gcm>>,
    aad: Vec<u8>,
    preamble: Option<Bytes>,
}

impl EncryptStream {
    pub(crate) fn new(
        input: ByteStream,
        cipher: Aes256Gcm,
        nonce: &[u8; STREAM_NONCE_SIZE],
        aad: Vec<u8>,
        preamble: Bytes,
    ) -> Self {
        Self {
            input: Some(input),
            buffer: BytesMut::new(),
            encryptor: Some(EncryptorBE32::from_aead(
                cipher,
                GenericArray::from_slice(nonce),
            )),
            aad,
            preamble: Some(preamble),
        }
    }

    pub(crate) fn into_stream(self) -> ByteStream {
        futures::stream::try_unfold(self, |mut state| async move {
            let frame = state.next_frame().await?;
            Ok::<_, io::Error>(frame.map(|frame| (frame, state)))
        })
        .boxed()
    }

    async fn next_frame(&mut self) -> io::Result<Option<Bytes>> {
        if let Some(preamble) = self.preamble.take() {
            return Ok(Some(preamble));
        }

        loop {
            // a full chunk is only emitted once more data is known to follow,
            // so the final frame is always marked last
            if self.buffer.len() > CHUNK_SIZE {
                let chunk = self.buffer.split_to(CHUNK_SIZE);
                let encryptor = match self.encryptor.as_mut() {
                    Some(e) => e,
                    None => return Ok(None),
                };
                let ciphertext = encryptor
                    .encrypt_next(Payload {
                        msg: &chunk,
                        aad: &self.aad,
                    })
                    .map_err(|_| encrypt_failed())?;
                return Ok(Some(frame(FLAG_NEXT, &ciphertext)));
            }

            match self.input.as_mut() {
                Some(input) => match input.next().await {
                    Some(Ok(bytes)) => self.buffer.extend_from_slice(&bytes),
                    Some(Err(e)) => {
                        self.input = None;
                        self.encryptor = None;
                        return Err(e);
                    }
                    None => self.input = None,
                },
                None => {
                    let encryptor = match self.encryptor.take() {
                        Some(e) => e,
                        None => return Ok(None),
                    };
                    let rest = self.buffer.split();
                    let ciphertext = encryptor
                        .encrypt_last(Payload {
                            msg: &rest,
                            aad: &self.aad,
                        })
                        .map_err(|_| encrypt_failed())?;
                    return Ok(Some(frame(FLAG_LAST, &ciphertext)));
                }
            }
        }
    }
}

fn encrypt_failed() -> io::Error {
    io::Error::new(
        io::ErrorKind::Other,
        CipherError::Default(anyhow::anyhow!("stream encrypt error")),
    )
}

enum Phase {
    Header,
    Frames(DecryptorBE32<Aes256Gcm>),
    Done,
}

pub(crate) struct DecryptStream {
    input: Option<ByteStream>,
    buffer: BytesMut,
    private: PrivateKey,
    aad: Vec<u8>,
    phase: Phase,
}

impl DecryptStream {
    pub(crate) fn new(input: ByteStream, private: PrivateKey, aad: Vec<u8>) -> Self {
        Self {
            input: Some(input),
            buffer: BytesMut::new(),
            private,
            aad,
            phase: Phase::Header,
        }
    }

    pub(crate) fn into_stream(self) -> ByteStream {
        futures::stream::try_unfold(self, |mut state| async move {
            match state.next_plaintext().await {
                Ok(item) => Ok::<_, io::Error>(item.map(|plaintext| (plaintext, state))),
                Err(e) => {
                    state.close();
                    Err(e)
                }
            }
        })
        .boxed()
    }

    fn close(&mut self) {
        self.input = None;
        self.phase = Phase::Done;
    }

    async fn next_plaintext(&mut self) -> io::Result<Option<Bytes>> {
        loop {
            match self.phase {
                Phase::Header => {
                    if let Some((version, wrapped, rest)) = split_header(&self.buffer) {
                        if version != STREAM_VERSION {
                            return Err(decryption_failed());
                        }
                        if rest.len() >= STREAM_NONCE_SIZE {
                            let cipher = unwrap_cipher(&self.private, wrapped)
                                .map_err(|_| decryption_failed())?;
                            let decryptor = DecryptorBE32::from_aead(
                                cipher,
                                GenericArray::from_slice(&rest[..STREAM_NONCE_SIZE]),
                            );
                            let consumed = 3 + wrapped.len() + STREAM_NONCE_SIZE;
                            self.buffer.advance(consumed);
                            self.phase = Phase::Frames(decryptor);
                            continue;
                        }
                    }
                }
                Phase::Frames(_) => {
                    if let Some((flag, ciphertext)) = self.take_frame()? {
                        return self.open_frame(flag, &ciphertext).map(Some);
                    }
                }
                Phase::Done => {
                    // nothing may follow the last frame
                    while self.buffer.is_empty() && self.read_more().await? {}
                    if !self.buffer.is_empty() {
                        return Err(decryption_failed());
                    }
                    return Ok(None);
                }
            }

            if !self.read_more().await? {
                // input ended before the last frame
                return Err(decryption_failed());
            }
        }
    }

    /// Split one complete frame off the buffer
    fn take_frame(&mut self) -> io::Result<Option<(u8, BytesMut)>> {
        if self.buffer.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }
        let flag = self.buffer[0];
        let len = u32::from_be_bytes([
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
            self.buffer[4],
        ]) as usize;
        if len > MAX_FRAME_SIZE || (flag != FLAG_NEXT && flag != FLAG_LAST) {
            return Err(decryption_failed());
        }
        if self.buffer.len() < FRAME_HEADER_SIZE + len {
            return Ok(None);
        }
        self.buffer.advance(FRAME_HEADER_SIZE);
        Ok(Some((flag, self.buffer.split_to(len))))
    }

    fn open_frame(&mut self, flag: u8, ciphertext: &[u8]) -> io::Result<Bytes> {
        let payload = Payload {
            msg: ciphertext,
            aad: &self.aad,
        };
        let plaintext = if flag == FLAG_LAST {
            match std::mem::replace(&mut self.phase, Phase::Done) {
                Phase::Frames(decryptor) => decryptor.decrypt_last(payload),
                _ => return Err(decryption_failed()),
            }
        } else {
            match &mut self.phase {
                Phase::Frames(decryptor) => decryptor.decrypt_next(payload),
                _ => return Err(decryption_failed()),
            }
        };
        plaintext.map(Bytes::from).map_err(|_| decryption_failed())
    }

    /// Pull the next chunk into the buffer, `false` once the input is exhausted
    async fn read_more(&mut self) -> io::Result<bool> {
        let input = match self.input.as_mut() {
            Some(input) => input,
            None => return Ok(false),
        };
        match input.next().await {
            Some(Ok(bytes)) => {
                self.buffer.extend_from_slice(&bytes);
                Ok(true)
            }
            Some(Err(e)) => Err(e),
            None => {
                self.input = None;
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod test {
    use futures::TryStreamExt;

    use super::*;
    use crate::crypto::{is_decryption_error, test_keys, HybridCipher};

    fn chunked(data: &[u8], size: usize) -> ByteStream {
        let chunks: Vec<io::Result<Bytes>> = data
            .chunks(size)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        futures::stream::iter(chunks).boxed()
    }

    async fn collect(stream: ByteStream) -> io::Result<Vec<u8>> {
        let chunks: Vec<Bytes> = stream.try_collect().await?;
        Ok(chunks.concat())
    }

    async fn encrypt(data: &[u8], input_chunk: usize) -> Vec<u8> {
        let pair = test_keys::recipient();
        let stream =
            HybridCipher::encrypt_stream(&pair.public, chunked(data, input_chunk), "DIC1", "DMS1")
                .unwrap();
        collect(stream).await.unwrap()
    }

    #[tokio::test]
    async fn test_stream_round_trip_multi_frame() {
        let pair = test_keys::recipient();
        let data: Vec<u8> = (0..(CHUNK_SIZE * 3 + 123)).map(|i| (i % 251) as u8).collect();

        let envelope = encrypt(&data, 10_000).await;
        // re-chunk the ciphertext at an unrelated boundary
        let plain = HybridCipher::decrypt_stream(&pair.private, chunked(&envelope, 777), "DIC1", "DMS1");
        assert_eq!(collect(plain).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_stream_exact_chunk_and_empty() {
        let pair = test_keys::recipient();
        for data in [vec![], vec![1u8; CHUNK_SIZE], vec![2u8; CHUNK_SIZE * 2]] {
            let envelope = encrypt(&data, 4096).await;
            let plain =
                HybridCipher::decrypt_stream(&pair.private, chunked(&envelope, 4096), "DIC1", "DMS1");
            assert_eq!(collect(plain).await.unwrap(), data);
        }
    }

    #[tokio::test]
    async fn test_stream_aad_binding() {
        let pair = test_keys::recipient();
        let envelope = encrypt(b"streamed payload", 4).await;
        let plain =
            HybridCipher::decrypt_stream(&pair.private, chunked(&envelope, 64), "DIC1", "DMS2");
        let err = collect(plain).await.unwrap_err();
        assert!(is_decryption_error(&err));
    }

    #[tokio::test]
    async fn test_stream_truncation_detected() {
        let pair = test_keys::recipient();
        let data = vec![9u8; CHUNK_SIZE * 2 + 5];
        let envelope = encrypt(&data, CHUNK_SIZE).await;

        // drop the last frame entirely
        let last_frame = FRAME_HEADER_SIZE + 5 + TAG_SIZE;
        let truncated = &envelope[..envelope.len() - last_frame];
        let plain =
            HybridCipher::decrypt_stream(&pair.private, chunked(truncated, 1024), "DIC1", "DMS1");
        assert!(is_decryption_error(&collect(plain).await.unwrap_err()));
    }

    #[tokio::test]
    async fn test_stream_trailing_bytes_detected() {
        let pair = test_keys::recipient();
        let envelope = encrypt(b"streamed payload", 4).await;

        // trailing bytes arrive as a chunk of their own after the last frame
        let input: ByteStream = futures::stream::iter(vec![
            Ok(Bytes::from(envelope.clone())),
            Ok(Bytes::new()),
            Ok(Bytes::from_static(b"junk")),
        ])
        .boxed();
        let plain = HybridCipher::decrypt_stream(&pair.private, input, "DIC1", "DMS1");
        assert!(is_decryption_error(&collect(plain).await.unwrap_err()));

        // empty chunks after the last frame are fine
        let input: ByteStream =
            futures::stream::iter(vec![Ok(Bytes::from(envelope)), Ok(Bytes::new())]).boxed();
        let plain = HybridCipher::decrypt_stream(&pair.private, input, "DIC1", "DMS1");
        assert_eq!(collect(plain).await.unwrap(), b"streamed payload");
    }

    #[tokio::test]
    async fn test_stream_wrong_key() {
        let envelope = encrypt(b"secret", 3).await;
        let other = test_keys::sender();
        let plain =
            HybridCipher::decrypt_stream(&other.private, chunked(&envelope, 64), "DIC1", "DMS1");
        assert!(is_decryption_error(&collect(plain).await.unwrap_err()));
    }

    #[tokio::test]
    async fn test_buffer_envelope_rejected_by_stream() {
        let pair = test_keys::recipient();
        let envelope = HybridCipher::encrypt(&pair.public, b"buffered", "DIC1", "DMS1").unwrap();
        let plain =
            HybridCipher::decrypt_stream(&pair.private, chunked(&envelope, 64), "DIC1", "DMS1");
        assert!(is_decryption_error(&collect(plain).await.unwrap_err()));
    }

    #[tokio::test]
    async fn test_input_error_propagates() {
        let pair = test_keys::recipient();
        let input: ByteStream = futures::stream::iter(vec![
            Ok(Bytes::from_static(b"abc")),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")),
        ])
        .boxed();
        let stream = HybridCipher::encrypt_stream(&pair.public, input, "DIC1", "DMS1").unwrap();
        let err = collect(stream).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
        assert!(!is_decryption_error(&err));
    }
}
