//! External interfaces this crate consumes but does not implement (spec
//! §6): the DBus wire marshaller/unmarshaller and the on-the-wire method
//! shapes of the `Authentication`/`HeaderCompression`/`Session`
//! interfaces. `SimpleWireCodec` is a test double only -- a real
//! marshaller is out of scope (spec §1).

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};
use crate::guid::Guid;

/// The unmarshalled wire bytes of one message: header (authenticated but
/// not encrypted, AAD to the message-crypto layer) and body (encrypted
/// payload). This is "the message" the conversation hash feeds on (spec
/// §9 open question).
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub serial: u32,
    pub header: Vec<u8>,
    pub body: Vec<u8>,
}

impl RawMessage {
    pub fn to_wire_bytes(&self) -> Vec<u8> {
        let mut out = self.header.clone();
        out.extend_from_slice(&self.body);
        out
    }
}

/// The minimal contract this crate needs from a real DBus marshaller:
/// encode/decode the method shapes named in spec §6 to/from `Vec<u8>`.
pub trait WireCodec: Send + Sync {
    fn encode_exchange_guids(&self, local_guid: &Guid, version: u32) -> Vec<u8>;
    fn decode_exchange_guids_reply(&self, payload: &[u8]) -> Result<(Guid, u32)>;

    fn encode_gen_session_key(&self, local_guid: &Guid, remote_guid: &Guid, local_nonce: &[u8]) -> Vec<u8>;
    fn decode_gen_session_key_reply(&self, payload: &[u8]) -> Result<(Vec<u8>, [u8; 12])>;

    fn encode_exchange_group_keys(&self, key_bytes: &[u8]) -> Vec<u8>;
    fn decode_exchange_group_keys_reply(&self, payload: &[u8]) -> Result<Vec<u8>>;

    fn encode_exchange_suites(&self, suites: &[u32]) -> Vec<u8>;
    fn decode_exchange_suites_reply(&self, payload: &[u8]) -> Result<Vec<u32>>;

    fn encode_key_exchange(&self, auth_mask: u32, variant: &[u8]) -> Vec<u8>;
    fn decode_key_exchange_reply(&self, payload: &[u8]) -> Result<(u32, Vec<u8>)>;

    fn encode_key_authentication(&self, variant: &[u8]) -> Vec<u8>;
    fn decode_key_authentication_reply(&self, payload: &[u8]) -> Result<Vec<u8>>;

    fn encode_get_expansion(&self, token: u32) -> Vec<u8>;
    fn decode_get_expansion_reply(&self, payload: &[u8]) -> Result<Vec<(u8, Vec<u8>)>>;
}

fn write_blob(buf: &mut Vec<u8>, bytes: &[u8]) {
    let mut len = [0u8; 4];
    LittleEndian::write_u32(&mut len, bytes.len() as u32);
    buf.extend_from_slice(&len);
    buf.extend_from_slice(bytes);
}

fn read_blob<'a>(buf: &'a [u8], offset: &mut usize) -> Result<&'a [u8]> {
    if buf.len() < *offset + 4 {
        return Err(Error::WireCodec("truncated length prefix".into()));
    }
    let len = LittleEndian::read_u32(&buf[*offset..*offset + 4]) as usize;
    *offset += 4;
    if buf.len() < *offset + len {
        return Err(Error::WireCodec("truncated payload".into()));
    }
    let slice = &buf[*offset..*offset + len];
    *offset += len;
    Ok(slice)
}

/// Length-prefixed test-only encoding, used by this module's own
/// `#[cfg(test)] mod test` block and the inline tests elsewhere in the
/// crate to exercise full round trips without a real marshaller.
pub struct SimpleWireCodec;

impl WireCodec for SimpleWireCodec {
    fn encode_exchange_guids(&self, local_guid: &Guid, version: u32) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(local_guid.as_bytes());
        let mut v = [0u8; 4];
        LittleEndian::write_u32(&mut v, version);
        buf.extend_from_slice(&v);
        buf
    }

    fn decode_exchange_guids_reply(&self, payload: &[u8]) -> Result<(Guid, u32)> {
        if payload.len() < 20 {
            return Err(Error::WireCodec("short ExchangeGuids reply".into()));
        }
        let mut guid_bytes = [0u8; 16];
        guid_bytes.copy_from_slice(&payload[0..16]);
        let version = LittleEndian::read_u32(&payload[16..20]);
        Ok((Guid::from_bytes(guid_bytes), version))
    }

    fn encode_gen_session_key(&self, local_guid: &Guid, remote_guid: &Guid, local_nonce: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(local_guid.as_bytes());
        buf.extend_from_slice(remote_guid.as_bytes());
        write_blob(&mut buf, local_nonce);
        buf
    }

    fn decode_gen_session_key_reply(&self, payload: &[u8]) -> Result<(Vec<u8>, [u8; 12])> {
        let mut offset = 0;
        let nonce = read_blob(payload, &mut offset)?.to_vec();
        let verifier_slice = read_blob(payload, &mut offset)?;
        let mut verifier = [0u8; 12];
        if verifier_slice.len() != 12 {
            return Err(Error::WireCodec("verifier must be 12 bytes".into()));
        }
        verifier.copy_from_slice(verifier_slice);
        Ok((nonce, verifier))
    }

    fn encode_exchange_group_keys(&self, key_bytes: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        write_blob(&mut buf, key_bytes);
        buf
    }

    fn decode_exchange_group_keys_reply(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let mut offset = 0;
        Ok(read_blob(payload, &mut offset)?.to_vec())
    }

    fn encode_exchange_suites(&self, suites: &[u32]) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut count = [0u8; 4];
        LittleEndian::write_u32(&mut count, suites.len() as u32);
        buf.extend_from_slice(&count);
        for s in suites {
            let mut b = [0u8; 4];
            LittleEndian::write_u32(&mut b, *s);
            buf.extend_from_slice(&b);
        }
        buf
    }

    fn decode_exchange_suites_reply(&self, payload: &[u8]) -> Result<Vec<u32>> {
        if payload.len() < 4 {
            return Err(Error::WireCodec("short ExchangeSuites reply".into()));
        }
        let count = LittleEndian::read_u32(&payload[0..4]) as usize;
        let mut out = Vec::with_capacity(count);
        let mut offset = 4;
        for _ in 0..count {
            if payload.len() < offset + 4 {
                return Err(Error::WireCodec("truncated suite list".into()));
            }
            out.push(LittleEndian::read_u32(&payload[offset..offset + 4]));
            offset += 4;
        }
        Ok(out)
    }

    fn encode_key_exchange(&self, auth_mask: u32, variant: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut mask = [0u8; 4];
        LittleEndian::write_u32(&mut mask, auth_mask);
        buf.extend_from_slice(&mask);
        write_blob(&mut buf, variant);
        buf
    }

    fn decode_key_exchange_reply(&self, payload: &[u8]) -> Result<(u32, Vec<u8>)> {
        if payload.len() < 4 {
            return Err(Error::WireCodec("short KeyExchange reply".into()));
        }
        let mask = LittleEndian::read_u32(&payload[0..4]);
        let mut offset = 4;
        let variant = read_blob(payload, &mut offset)?.to_vec();
        Ok((mask, variant))
    }

    fn encode_key_authentication(&self, variant: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        write_blob(&mut buf, variant);
        buf
    }

    fn decode_key_authentication_reply(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let mut offset = 0;
        Ok(read_blob(payload, &mut offset)?.to_vec())
    }

    fn encode_get_expansion(&self, token: u32) -> Vec<u8> {
        let mut buf = [0u8; 4];
        LittleEndian::write_u32(&mut buf, token);
        buf.to_vec()
    }

    fn decode_get_expansion_reply(&self, payload: &[u8]) -> Result<Vec<(u8, Vec<u8>)>> {
        if payload.len() < 4 {
            return Err(Error::WireCodec("short GetExpansion reply".into()));
        }
        let count = LittleEndian::read_u32(&payload[0..4]) as usize;
        let mut offset = 4;
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            if payload.len() < offset + 1 {
                return Err(Error::WireCodec("truncated field tag".into()));
            }
            let tag = payload[offset];
            offset += 1;
            let value = read_blob(payload, &mut offset)?.to_vec();
            out.push((tag, value));
        }
        Ok(out)
    }
}
