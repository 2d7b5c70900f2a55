//! Key-server wire codec.
//!
//! Every message starts with `version(1) || message_type(1) || curve_id(1)`.
//! Multi-byte integers are big-endian. Parsing is strict: truncation,
//! trailing bytes, unknown type bytes and unknown error codes are all
//! structural failures, and the curve byte must match the suite of the
//! caller.

use crate::crypto::{CurveSuite, OneTimePreKey, SignedPreKey};
use crate::error::{Error, Result};

pub const PROTOCOL_VERSION: u8 = 0x01;

/// Message type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    RegisterUser = 0x01,
    DeleteUser = 0x02,
    PostSpk = 0x03,
    PostOpks = 0x04,
    GetPeerBundle = 0x05,
    PeerBundle = 0x06,
    Error = 0xff,
}

impl MessageType {
    fn from_u8(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Self::RegisterUser),
            0x02 => Ok(Self::DeleteUser),
            0x03 => Ok(Self::PostSpk),
            0x04 => Ok(Self::PostOpks),
            0x05 => Ok(Self::GetPeerBundle),
            0x06 => Ok(Self::PeerBundle),
            0xff => Ok(Self::Error),
            _ => Err(Error::ProtocolFormat("unknown message type")),
        }
    }
}

/// Server-reported failure cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCode {
    BadContentType = 0x00,
    BadCurve = 0x01,
    MissingSenderId = 0x02,
    BadProtocolVersion = 0x03,
    BadSize = 0x04,
    UserAlreadyIn = 0x05,
    UserNotFound = 0x06,
    DbError = 0x07,
    BadRequest = 0x08,
}

impl ErrorCode {
    fn from_u8(value: u8) -> Result<Self> {
        match value {
            0x00 => Ok(Self::BadContentType),
            0x01 => Ok(Self::BadCurve),
            0x02 => Ok(Self::MissingSenderId),
            0x03 => Ok(Self::BadProtocolVersion),
            0x04 => Ok(Self::BadSize),
            0x05 => Ok(Self::UserAlreadyIn),
            0x06 => Ok(Self::UserNotFound),
            0x07 => Ok(Self::DbError),
            0x08 => Ok(Self::BadRequest),
            _ => Err(Error::ProtocolFormat("unknown error code")),
        }
    }
}

/// One device's published key bundle, as carried in a `peerBundle` message.
#[derive(Clone)]
pub struct PeerBundle<C: CurveSuite> {
    pub device_id: String,
    pub ik: C::SigningPublic,
    pub spk: C::DhPublic,
    pub spk_id: u32,
    pub spk_signature: C::Signature,
    pub opk: Option<(u32, C::DhPublic)>,
}

/// Client request, parsed server-side.
pub enum Request<C: CurveSuite> {
    RegisterUser { ik: C::SigningPublic },
    DeleteUser,
    PostSpk {
        spk: C::DhPublic,
        signature: C::Signature,
        spk_id: u32,
    },
    PostOpks { opks: Vec<(u32, C::DhPublic)> },
    GetPeerBundles { device_ids: Vec<String> },
}

/// Server response, parsed client-side.
pub enum Response<C: CurveSuite> {
    /// Success echo for register / delete / post messages.
    Ack(MessageType),
    PeerBundles(Vec<PeerBundle<C>>),
    Error { code: ErrorCode, message: String },
}

fn header<C: CurveSuite>(message_type: MessageType) -> Vec<u8> {
    vec![PROTOCOL_VERSION, message_type as u8, C::CURVE_ID as u8]
}

pub fn encode_register_user<C: CurveSuite>(ik: &C::SigningPublic) -> Vec<u8> {
    let mut out = header::<C>(MessageType::RegisterUser);
    out.extend_from_slice(&C::signing_public_bytes(ik));
    out
}

/// The deleted identity comes from the transport sender header, so the body
/// is empty.
pub fn encode_delete_user<C: CurveSuite>() -> Vec<u8> {
    header::<C>(MessageType::DeleteUser)
}

pub fn encode_post_spk<C: CurveSuite>(spk: &SignedPreKey<C>) -> Vec<u8> {
    let mut out = header::<C>(MessageType::PostSpk);
    out.extend_from_slice(&C::dh_public_bytes(spk.public()));
    out.extend_from_slice(&C::signature_bytes(spk.signature()));
    out.extend_from_slice(&spk.id.to_be_bytes());
    out
}

pub fn encode_post_opks<C: CurveSuite>(opks: &[OneTimePreKey<C>]) -> Vec<u8> {
    let mut out = header::<C>(MessageType::PostOpks);
    out.extend_from_slice(&(opks.len() as u16).to_be_bytes());
    for opk in opks {
        out.extend_from_slice(&C::dh_public_bytes(opk.public()));
        out.extend_from_slice(&opk.id.to_be_bytes());
    }
    out
}

pub fn encode_get_peer_bundles<C: CurveSuite>(device_ids: &[&str]) -> Vec<u8> {
    let mut out = header::<C>(MessageType::GetPeerBundle);
    out.extend_from_slice(&(device_ids.len() as u16).to_be_bytes());
    for id in device_ids {
        out.extend_from_slice(&(id.len() as u16).to_be_bytes());
        out.extend_from_slice(id.as_bytes());
    }
    out
}

pub fn encode_peer_bundles<C: CurveSuite>(bundles: &[PeerBundle<C>]) -> Vec<u8> {
    let mut out = header::<C>(MessageType::PeerBundle);
    out.extend_from_slice(&(bundles.len() as u16).to_be_bytes());
    for bundle in bundles {
        out.extend_from_slice(&(bundle.device_id.len() as u16).to_be_bytes());
        out.extend_from_slice(bundle.device_id.as_bytes());
        out.push(u8::from(bundle.opk.is_some()));
        out.extend_from_slice(&C::signing_public_bytes(&bundle.ik));
        out.extend_from_slice(&C::dh_public_bytes(&bundle.spk));
        out.extend_from_slice(&bundle.spk_id.to_be_bytes());
        out.extend_from_slice(&C::signature_bytes(&bundle.spk_signature));
        if let Some((opk_id, opk)) = &bundle.opk {
            out.extend_from_slice(&C::dh_public_bytes(opk));
            out.extend_from_slice(&opk_id.to_be_bytes());
        }
    }
    out
}

pub fn encode_ack<C: CurveSuite>(message_type: MessageType) -> Vec<u8> {
    header::<C>(message_type)
}

pub fn encode_error<C: CurveSuite>(code: ErrorCode, message: &str) -> Vec<u8> {
    let mut out = header::<C>(MessageType::Error);
    out.push(code as u8);
    out.extend_from_slice(message.as_bytes());
    out
}

/// Strict forward-only reader over a message body.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.buf.len() - self.pos < len {
            return Err(Error::ProtocolFormat("message truncated"));
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16_be(&mut self) -> Result<u16> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn u32_be(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn remaining(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    fn finish(&self) -> Result<()> {
        if self.pos != self.buf.len() {
            return Err(Error::ProtocolFormat("trailing bytes"));
        }
        Ok(())
    }
}

fn parse_header<C: CurveSuite>(reader: &mut Reader<'_>) -> Result<MessageType> {
    if reader.u8()? != PROTOCOL_VERSION {
        return Err(Error::ProtocolFormat("bad protocol version"));
    }
    let message_type = MessageType::from_u8(reader.u8()?)?;
    if reader.u8()? != C::CURVE_ID as u8 {
        return Err(Error::ProtocolFormat("curve mismatch"));
    }
    Ok(message_type)
}

fn parse_device_id(reader: &mut Reader<'_>) -> Result<String> {
    let len = reader.u16_be()? as usize;
    let bytes = reader.take(len)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| Error::ProtocolFormat("device id not UTF-8"))
}

/// Parse a server response on the client side.
pub fn parse_response<C: CurveSuite>(bytes: &[u8]) -> Result<Response<C>> {
    let mut reader = Reader::new(bytes);
    let message_type = parse_header::<C>(&mut reader)?;
    match message_type {
        MessageType::RegisterUser
        | MessageType::DeleteUser
        | MessageType::PostSpk
        | MessageType::PostOpks => {
            reader.finish()?;
            Ok(Response::Ack(message_type))
        }
        MessageType::GetPeerBundle => Err(Error::ProtocolFormat("request type in response")),
        MessageType::PeerBundle => {
            let count = reader.u16_be()?;
            let mut bundles = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let device_id = parse_device_id(&mut reader)?;
                let has_opk = match reader.u8()? {
                    0 => false,
                    1 => true,
                    _ => return Err(Error::ProtocolFormat("bad OPK flag")),
                };
                let ik = C::signing_public_from_bytes(reader.take(C::SIGNING_PUBLIC_LEN)?)?;
                let spk = C::dh_public_from_bytes(reader.take(C::DH_PUBLIC_LEN)?)?;
                let spk_id = reader.u32_be()?;
                let spk_signature = C::signature_from_bytes(reader.take(C::SIGNATURE_LEN)?)?;
                let opk = if has_opk {
                    let opk = C::dh_public_from_bytes(reader.take(C::DH_PUBLIC_LEN)?)?;
                    let opk_id = reader.u32_be()?;
                    Some((opk_id, opk))
                } else {
                    None
                };
                bundles.push(PeerBundle {
                    device_id,
                    ik,
                    spk,
                    spk_id,
                    spk_signature,
                    opk,
                });
            }
            reader.finish()?;
            Ok(Response::PeerBundles(bundles))
        }
        MessageType::Error => {
            let code = ErrorCode::from_u8(reader.u8()?)?;
            let message = String::from_utf8_lossy(reader.remaining()).into_owned();
            Ok(Response::Error { code, message })
        }
    }
}

/// Parse a client request on the server side.
pub fn parse_request<C: CurveSuite>(bytes: &[u8]) -> Result<Request<C>> {
    let mut reader = Reader::new(bytes);
    let message_type = parse_header::<C>(&mut reader)?;
    match message_type {
        MessageType::RegisterUser => {
            let ik = C::signing_public_from_bytes(reader.take(C::SIGNING_PUBLIC_LEN)?)?;
            reader.finish()?;
            Ok(Request::RegisterUser { ik })
        }
        MessageType::DeleteUser => {
            reader.finish()?;
            Ok(Request::DeleteUser)
        }
        MessageType::PostSpk => {
            let spk = C::dh_public_from_bytes(reader.take(C::DH_PUBLIC_LEN)?)?;
            let signature = C::signature_from_bytes(reader.take(C::SIGNATURE_LEN)?)?;
            let spk_id = reader.u32_be()?;
            reader.finish()?;
            Ok(Request::PostSpk {
                spk,
                signature,
                spk_id,
            })
        }
        MessageType::PostOpks => {
            let count = reader.u16_be()?;
            let mut opks = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let opk = C::dh_public_from_bytes(reader.take(C::DH_PUBLIC_LEN)?)?;
                let opk_id = reader.u32_be()?;
                opks.push((opk_id, opk));
            }
            reader.finish()?;
            Ok(Request::PostOpks { opks })
        }
        MessageType::GetPeerBundle => {
            let count = reader.u16_be()?;
            let mut device_ids = Vec::with_capacity(count as usize);
            for _ in 0..count {
                device_ids.push(parse_device_id(&mut reader)?);
            }
            reader.finish()?;
            Ok(Request::GetPeerBundles { device_ids })
        }
        MessageType::PeerBundle | MessageType::Error => {
            Err(Error::ProtocolFormat("response type in request"))
        }
    }
}
