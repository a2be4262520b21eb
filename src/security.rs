use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use rand::RngCore;
use tracing::debug;

use crate::error::{ChannelError, ChannelResult};

/// Negotiation state of a security session. `Failed` is terminal and surfaces as a
///  [ChannelError::SecurityFailure].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SessionState {
    NotEstablished,
    Establishing,
    Established,
    Failed,
}

/// The cryptographic context consumed by the transport core. The actual primitives
///  (key exchange, SSPI-style providers) live behind this trait; the core only drives
///  the ping-pong and frames the results.
pub trait SecuritySession: Send + Sync {
    fn state(&self) -> SessionState;

    /// Advance the handshake: feed the peer's packet (or `None` to initiate), get the
    ///  next packet to send, or `None` once the session is established.
    ///
    /// Receiving a duplicate handshake packet after establishment is a no-op, not an
    ///  error - carriers retransmit.
    fn establish(
        &mut self,
        input: Option<&[u8]>,
        connection_level: bool,
    ) -> ChannelResult<Option<Bytes>>;

    fn encrypt(&self, plain: &[u8]) -> ChannelResult<Bytes>;

    fn decrypt(&self, cipher: &[u8]) -> ChannelResult<Bytes>;
}

/// Factory handed to a connection manager; every new connection gets a fresh
///  session from it.
pub type SessionFactory = Arc<dyn Fn() -> Box<dyn SecuritySession> + Send + Sync>;

/// Security sub-stream framing: one flag byte, then either a handshake packet (the
///  session is still negotiating) or the encrypted payload.
pub const FLAG_HANDSHAKE: u8 = 0;
pub const FLAG_PAYLOAD: u8 = 1;

/// Second byte of a handshake frame: regular handshake data vs. a serialized failure
///  report, so the peer can distinguish "security rejected" from "network failure".
const HANDSHAKE_DATA: u8 = 0;
const HANDSHAKE_FAILURE: u8 = 1;

#[derive(Debug, Eq, PartialEq)]
pub enum SecurityEnvelope {
    Handshake(Bytes),
    Payload(Bytes),
}

pub fn seal_payload(session: &dyn SecuritySession, plain: &[u8]) -> ChannelResult<Bytes> {
    let cipher = session.encrypt(plain)?;
    let mut buf = BytesMut::with_capacity(1 + cipher.len());
    buf.put_u8(FLAG_PAYLOAD);
    buf.put_slice(&cipher);
    Ok(buf.freeze())
}

pub fn seal_handshake(packet: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(2 + packet.len());
    buf.put_u8(FLAG_HANDSHAKE);
    buf.put_u8(HANDSHAKE_DATA);
    buf.put_slice(packet);
    buf.freeze()
}

/// Report an establishment failure to the peer instead of silently truncating the
///  stream.
pub fn seal_handshake_failure(error: &ChannelError) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(FLAG_HANDSHAKE);
    buf.put_u8(HANDSHAKE_FAILURE);

    let identifier = error.identifier().as_bytes();
    buf.put_usize_varint(identifier.len());
    buf.put_slice(identifier);

    let message = error.to_string();
    buf.put_usize_varint(message.len());
    buf.put_slice(message.as_bytes());

    buf.freeze()
}

/// Split a framed security sub-stream, decrypting payloads and unpacking failure
///  reports into the corresponding error.
pub fn open_envelope(
    session: &dyn SecuritySession,
    mut framed: Bytes,
) -> ChannelResult<SecurityEnvelope> {
    let flag = framed.try_get_u8()
        .map_err(|_| ChannelError::incorrect_data("empty security envelope"))?;

    match flag {
        FLAG_PAYLOAD => {
            let plain = session.decrypt(&framed)?;
            Ok(SecurityEnvelope::Payload(plain))
        }
        FLAG_HANDSHAKE => {
            let sub = framed.try_get_u8()
                .map_err(|_| ChannelError::incorrect_data("truncated handshake envelope"))?;
            match sub {
                HANDSHAKE_DATA => Ok(SecurityEnvelope::Handshake(framed)),
                HANDSHAKE_FAILURE => {
                    let id_len = framed.try_get_usize_varint()
                        .map_err(|_| ChannelError::incorrect_data("truncated failure report"))?;
                    if id_len > framed.remaining() {
                        return Err(ChannelError::incorrect_data("truncated failure report"));
                    }
                    let identifier = framed.copy_to_bytes(id_len);

                    let msg_len = framed.try_get_usize_varint()
                        .map_err(|_| ChannelError::incorrect_data("truncated failure report"))?;
                    if msg_len > framed.remaining() {
                        return Err(ChannelError::incorrect_data("truncated failure report"));
                    }
                    let message = framed.copy_to_bytes(msg_len);

                    Err(ChannelError::SecurityFailure {
                        detail: format!(
                            "peer rejected establishment: {} ({})",
                            String::from_utf8_lossy(&message),
                            String::from_utf8_lossy(&identifier),
                        ),
                    })
                }
                _ => Err(ChannelError::incorrect_data("invalid handshake sub-marker")),
            }
        }
        _ => Err(ChannelError::IncorrectData {
            detail: format!("invalid security envelope flag {}", flag),
        }),
    }
}

/// Null session for carriers that run without security.
pub struct NoSecurity;

impl SecuritySession for NoSecurity {
    fn state(&self) -> SessionState {
        SessionState::Established
    }

    fn establish(
        &mut self,
        _input: Option<&[u8]>,
        _connection_level: bool,
    ) -> ChannelResult<Option<Bytes>> {
        Ok(None)
    }

    fn encrypt(&self, plain: &[u8]) -> ChannelResult<Bytes> {
        Ok(Bytes::copy_from_slice(plain))
    }

    fn decrypt(&self, cipher: &[u8]) -> ChannelResult<Bytes> {
        Ok(Bytes::copy_from_slice(cipher))
    }
}

/// AES-256-GCM session over a pre-shared key. The handshake is a challenge/response:
///  the initiator sends a random challenge, the acceptor proves key possession by
///  returning it encrypted, the initiator verifies.
///
/// Every encrypted packet is `[nonce: 12 bytes][ciphertext + 16-byte tag]`; the nonce
///  is a fixed random u32 plus an incrementing u64, so it is never reused for a key.
pub struct AesGcmSession {
    cipher: Aes256Gcm,
    nonce_fixed: u32,
    nonce_incremented: AtomicU64,
    state: SessionState,
    pending_challenge: Option<[u8; 16]>,
}

impl AesGcmSession {
    pub const NONCE_LEN: usize = 12;

    pub fn new(key: &[u8; 32]) -> AesGcmSession {
        AesGcmSession {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
            nonce_fixed: rand::thread_rng().next_u32(),
            nonce_incremented: AtomicU64::new(0),
            state: SessionState::NotEstablished,
            pending_challenge: None,
        }
    }

    fn next_nonce(&self) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce[..4].copy_from_slice(&self.nonce_fixed.to_be_bytes());
        nonce[4..].copy_from_slice(
            &self.nonce_incremented.fetch_add(1, Ordering::AcqRel).to_be_bytes(),
        );
        nonce
    }

    fn fail(&mut self, detail: impl Into<String>) -> ChannelError {
        self.state = SessionState::Failed;
        ChannelError::security(detail)
    }
}

impl SecuritySession for AesGcmSession {
    fn state(&self) -> SessionState {
        self.state
    }

    fn establish(
        &mut self,
        input: Option<&[u8]>,
        _connection_level: bool,
    ) -> ChannelResult<Option<Bytes>> {
        match (self.state, input) {
            (SessionState::Failed, _) => {
                Err(ChannelError::security("session establishment already failed"))
            }
            // retransmitted handshake packet after establishment: idempotent no-op
            (SessionState::Established, _) => Ok(None),

            // initiator: produce the challenge
            (SessionState::NotEstablished, None) => {
                let mut challenge = [0u8; 16];
                rand::thread_rng().fill_bytes(&mut challenge);
                self.pending_challenge = Some(challenge);
                self.state = SessionState::Establishing;
                Ok(Some(Bytes::copy_from_slice(&challenge)))
            }

            // acceptor: prove key possession by returning the challenge encrypted
            (SessionState::NotEstablished, Some(challenge)) => {
                let proof = self.encrypt(challenge)?;
                self.state = SessionState::Established;
                debug!("security session established (acceptor side)");
                Ok(Some(proof))
            }

            // initiator: verify the proof
            (SessionState::Establishing, Some(proof)) => {
                let expected = self.pending_challenge.take()
                    .ok_or_else(|| ChannelError::logic("establishing without a pending challenge"))?;
                let decrypted = self.decrypt(proof)
                    .map_err(|e| self.fail(format!("challenge proof rejected: {}", e)))?;
                if decrypted.as_ref() != expected {
                    return Err(self.fail("challenge proof mismatch"));
                }
                self.state = SessionState::Established;
                debug!("security session established (initiator side)");
                Ok(None)
            }

            (SessionState::Establishing, None) => {
                Err(ChannelError::logic("establish(None) on a session mid-handshake"))
            }
        }
    }

    fn encrypt(&self, plain: &[u8]) -> ChannelResult<Bytes> {
        let nonce = self.next_nonce();
        let ciphertext = self.cipher
            .encrypt(Nonce::from_slice(&nonce), plain)
            .map_err(|_| ChannelError::security("encryption failed"))?;

        let mut buf = BytesMut::with_capacity(Self::NONCE_LEN + ciphertext.len());
        buf.put_slice(&nonce);
        buf.put_slice(&ciphertext);
        Ok(buf.freeze())
    }

    fn decrypt(&self, cipher: &[u8]) -> ChannelResult<Bytes> {
        if cipher.len() < Self::NONCE_LEN {
            return Err(ChannelError::security("ciphertext shorter than the nonce"));
        }
        let (nonce, ciphertext) = cipher.split_at(Self::NONCE_LEN);
        let plain = self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| ChannelError::security("decryption or signature verification failed"))?;
        Ok(Bytes::from(plain))
    }
}
