use tokio_util::bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

pub const MAX_SAFE_READ_COUNT: u16 = 123;

const READ_INPUT_REGISTERS: u8 = 4;
const EXCEPTION_FLAG: u8 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    pub device_id: u8,
    pub transaction_id: u16,
    pub operation: Operation,
}

impl Request {
    /// Estimate how many bytes the RTU response to this request will take.
    ///
    /// This is used to extend the response timeout on slow serial lines.
    pub fn expected_response_length(&self) -> u16 {
        let payload = match self.operation {
            Operation::ReadInputRegisters { address: _, count } => u32::from(count) * 2,
        };
        // Address, function, byte count and 2 bytes of CRC.
        u16::try_from(payload + 5).unwrap_or(u16::MAX)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Read `count` input registers starting at the 1-based register number `address`.
    ReadInputRegisters { address: u16, count: u16 },
}

#[derive(Debug, PartialEq, Eq)]
pub struct Response {
    pub device_id: u8,
    pub transaction_id: u16,
    pub kind: ResponseKind,
}

impl Response {
    pub fn exception_code(&self) -> Option<u8> {
        match &self.kind {
            ResponseKind::ErrorCode(c) => Some(*c),
            ResponseKind::InputRegisters { values: _ } => None,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ResponseKind {
    ErrorCode(u8),
    /// Big-endian register contents.
    InputRegisters { values: Vec<u8> },
}

/// Human readable name of a Modbus exception code.
pub fn exception_name(code: u8) -> &'static str {
    match code {
        1 => "illegal function",
        2 => "illegal data address",
        3 => "illegal data value",
        4 => "server device failure",
        5 => "acknowledge",
        6 => "server device busy",
        8 => "memory parity error",
        10 => "gateway path unavailable",
        11 => "gateway target device failed to respond",
        _ => "unknown exception",
    }
}

pub trait Codec:
    for<'a> Encoder<&'a Request, Error = std::io::Error>
    + Decoder<Item = Response, Error = std::io::Error>
{
}

fn encode_pdu(operation: &Operation, dst: &mut BytesMut) {
    match *operation {
        Operation::ReadInputRegisters { address, count } => {
            dst.extend([READ_INPUT_REGISTERS]);
            dst.extend(address.saturating_sub(1).to_be_bytes());
            dst.extend(count.to_be_bytes());
        }
    }
}

pub struct ModbusTCPCodec {}
impl Encoder<&Request> for ModbusTCPCodec {
    type Error = std::io::Error;
    fn encode(&mut self, req: &Request, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend(req.transaction_id.to_be_bytes());
        // Protocol identifier, then the number of bytes that follow: unit id and a 5 byte PDU.
        dst.extend(&[0, 0, 0, 6, req.device_id]);
        encode_pdu(&req.operation, dst);
        trace!(message="sending encoded", buffer=?dst);
        Ok(())
    }
}
impl Decoder for ModbusTCPCodec {
    type Item = Response;
    type Error = std::io::Error;
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            trace!(message="attempt at decoding", buffer=?src);
            if src.len() < 8 {
                return Ok(None);
            }
            let Some((tr_id_buffer, remainder)) = src.split_first_chunk::<2>() else {
                return Ok(None);
            };
            let transaction_id = u16::from_be_bytes(*tr_id_buffer);
            let Some((proto_buffer, remainder)) = remainder.split_first_chunk::<2>() else {
                return Ok(None);
            };
            let proto = u16::from_be_bytes(*proto_buffer);
            if proto != 0 {
                src.advance(1);
                continue;
            }
            let Some((length_buffer, remainder)) = remainder.split_first_chunk::<2>() else {
                return Ok(None);
            };
            let required_length = u16::from_be_bytes(*length_buffer);
            let Some((data, _)) = remainder.split_at_checked(required_length.into()) else {
                return Ok(None);
            };
            let [device_id, function_code, code, ..] = data else {
                src.advance(1);
                continue;
            };
            let (device_id, function_code, code) = (*device_id, *function_code, *code);
            let kind = if function_code & EXCEPTION_FLAG != 0 {
                ResponseKind::ErrorCode(code)
            } else if function_code == READ_INPUT_REGISTERS {
                // Trust the MBAP length over the byte count; gateways disagree on the latter for
                // large reads.
                ResponseKind::InputRegisters { values: data[3..].to_vec() }
            } else {
                src.advance(usize::from(required_length) + 6);
                continue;
            };
            src.advance(usize::from(required_length) + 6);
            return Ok(Some(Response { transaction_id, device_id, kind }));
        }
    }
}
impl Codec for ModbusTCPCodec {}

/// CRC-16/MODBUS.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc = crc_all::Crc::<u16>::new(0x8005, 16, 0xFFFF, 0x0000, true);
    crc.update(data);
    crc.finish()
}

/// Modbus RTU framing.
///
/// RTU frames carry no transaction ID, so responses are tagged with the ID of the request most
/// recently encoded. Only one request may be outstanding at a time.
#[derive(Default)]
pub struct ModbusRTUCodec {
    transaction_id: u16,
}
impl Encoder<&Request> for ModbusRTUCodec {
    type Error = std::io::Error;
    fn encode(&mut self, req: &Request, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let start = dst.len();
        dst.extend([req.device_id]);
        encode_pdu(&req.operation, dst);
        let crc = crc16(&dst[start..]);
        dst.extend(crc.to_le_bytes());
        self.transaction_id = req.transaction_id;
        trace!(message="sending encoded", buffer=?dst);
        Ok(())
    }
}
impl Decoder for ModbusRTUCodec {
    type Item = Response;
    type Error = std::io::Error;
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        trace!(message="attempt at decoding", buffer=?src);
        let &[device_id, function_code, code, ..] = &src[..] else {
            return Ok(None);
        };
        let frame_length = if function_code & EXCEPTION_FLAG != 0 {
            5
        } else if function_code == READ_INPUT_REGISTERS {
            3 + usize::from(code) + 2
        } else {
            src.clear();
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unexpected function code {function_code} in RTU response"),
            ));
        };
        let Some((frame, _)) = src.split_at_checked(frame_length) else {
            return Ok(None);
        };
        let (body, crc) = frame.split_at(frame_length - 2);
        let expected = crc16(body);
        let received = u16::from_le_bytes([crc[0], crc[1]]);
        if expected != received {
            src.clear();
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("RTU response CRC mismatch (expected {expected:#06x}, got {received:#06x})"),
            ));
        }
        let kind = if function_code & EXCEPTION_FLAG != 0 {
            ResponseKind::ErrorCode(code)
        } else {
            ResponseKind::InputRegisters { values: body[3..].to_vec() }
        };
        src.advance(frame_length);
        Ok(Some(Response { device_id, transaction_id: self.transaction_id, kind }))
    }
}
impl Codec for ModbusRTUCodec {}

/// Split big-endian register contents into words.
pub fn words(values: &[u8]) -> Vec<u16> {
    values.chunks_exact(2).map(|w| u16::from_be_bytes([w[0], w[1]])).collect()
}
