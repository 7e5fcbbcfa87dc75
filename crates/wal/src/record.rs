use std::io::Read;

use skdb_common::{Lsn, Result, TxId, WriteOp};

/// Value-length sentinel meaning "no value" (`Delete`).
const NO_VALUE: u32 = 0xFFFF_FFFF;

const OP_PUT: u8 = 1;
const OP_DELETE: u8 = 2;
const OP_PUT_TTL: u8 = 3;

/// Body = everything after the length prefix: lsn + tx_id + op_count + crc
/// at minimum.
const MIN_BODY_LEN: usize = 8 + 8 + 4 + 4;

/// Upper bound on a record body; a length prefix beyond this is treated as
/// corruption rather than an allocation request.
const MAX_BODY_LEN: usize = 1 << 30;

/// One committed transaction as it appears on the log:
/// `len_u32 | lsn_u64 | tx_id_u64 | op_count_u32 | [op]* | crc32c_u32`,
/// where each op is
/// `op_type_u8 | key_len_u32 | key | value_len_u32 | value?` and a value
/// length of `0xFFFF_FFFF` means "no value". `PutTtl` values carry their
/// 8-byte expiry first.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WalRecord {
    pub lsn: Lsn,
    pub tx_id: TxId,
    pub ops: Vec<WriteOp>,
}

/// Outcome of reading one record off the log.
#[derive(Debug)]
pub enum ReadOutcome {
    Record(WalRecord),
    /// Clean end of the segment.
    Eof,
    /// Short read, bad CRC, or an undecodable body: the torn tail starts
    /// here.
    Invalid,
}

/// Encode a record with its length prefix and trailing CRC.
pub fn encode_record(lsn: Lsn, tx_id: TxId, ops: &[WriteOp]) -> Vec<u8> {
    let mut body = Vec::with_capacity(64);
    body.extend_from_slice(&lsn.to_le_bytes());
    body.extend_from_slice(&tx_id.to_le_bytes());
    body.extend_from_slice(&(ops.len() as u32).to_le_bytes());
    for op in ops {
        encode_op(&mut body, op);
    }
    let crc = crc32c::crc32c(&body);
    body.extend_from_slice(&crc.to_le_bytes());

    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&body);
    out
}

fn encode_op(buf: &mut Vec<u8>, op: &WriteOp) {
    match op {
        WriteOp::Put { key, value } => {
            buf.push(OP_PUT);
            buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
            buf.extend_from_slice(key);
            buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
            buf.extend_from_slice(value);
        }
        WriteOp::Delete { key } => {
            buf.push(OP_DELETE);
            buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
            buf.extend_from_slice(key);
            buf.extend_from_slice(&NO_VALUE.to_le_bytes());
        }
        WriteOp::PutTtl { key, value, expiry_ms } => {
            buf.push(OP_PUT_TTL);
            buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
            buf.extend_from_slice(key);
            buf.extend_from_slice(&((value.len() + 8) as u32).to_le_bytes());
            buf.extend_from_slice(&expiry_ms.to_le_bytes());
            buf.extend_from_slice(value);
        }
    }
}

/// Read one record starting at the reader's position.
pub fn read_record(reader: &mut impl Read) -> Result<ReadOutcome> {
    let mut len_buf = [0u8; 4];
    match read_fully(reader, &mut len_buf)? {
        0 => return Ok(ReadOutcome::Eof),
        4 => {}
        _ => return Ok(ReadOutcome::Invalid),
    }
    let body_len = u32::from_le_bytes(len_buf) as usize;
    if !(MIN_BODY_LEN..=MAX_BODY_LEN).contains(&body_len) {
        return Ok(ReadOutcome::Invalid);
    }

    let mut body = vec![0u8; body_len];
    if read_fully(reader, &mut body)? != body_len {
        return Ok(ReadOutcome::Invalid);
    }

    let (payload, crc_bytes) = body.split_at(body_len - 4);
    let stored_crc = u32::from_le_bytes(crc_bytes.try_into().unwrap());
    if stored_crc != crc32c::crc32c(payload) {
        return Ok(ReadOutcome::Invalid);
    }

    match decode_body(payload) {
        Some(record) => Ok(ReadOutcome::Record(record)),
        None => Ok(ReadOutcome::Invalid),
    }
}

fn decode_body(payload: &[u8]) -> Option<WalRecord> {
    let lsn = Lsn::from_le_bytes(payload.get(0..8)?.try_into().ok()?);
    let tx_id = TxId::from_le_bytes(payload.get(8..16)?.try_into().ok()?);
    let op_count = u32::from_le_bytes(payload.get(16..20)?.try_into().ok()?) as usize;

    let mut pos = 20;
    let mut ops = Vec::with_capacity(op_count.min(1024));
    for _ in 0..op_count {
        let op_type = *payload.get(pos)?;
        pos += 1;
        let key_len = u32::from_le_bytes(payload.get(pos..pos + 4)?.try_into().ok()?) as usize;
        pos += 4;
        let key = payload.get(pos..pos + key_len)?.to_vec();
        pos += key_len;
        let value_len = u32::from_le_bytes(payload.get(pos..pos + 4)?.try_into().ok()?);
        pos += 4;

        let op = match (op_type, value_len) {
            (OP_DELETE, NO_VALUE) => WriteOp::Delete { key },
            (OP_PUT, len) if len != NO_VALUE => {
                let len = len as usize;
                let value = payload.get(pos..pos + len)?.to_vec();
                pos += len;
                WriteOp::Put { key, value }
            }
            (OP_PUT_TTL, len) if len != NO_VALUE && len >= 8 => {
                let len = len as usize;
                let raw = payload.get(pos..pos + len)?;
                pos += len;
                let expiry_ms = u64::from_le_bytes(raw[0..8].try_into().ok()?);
                WriteOp::PutTtl { key, value: raw[8..].to_vec(), expiry_ms }
            }
            _ => return None,
        };
        ops.push(op);
    }
    if pos != payload.len() {
        return None;
    }
    Some(WalRecord { lsn, tx_id, ops })
}

/// Read until the buffer is full or EOF; returns the bytes read.
fn read_fully(reader: &mut impl Read, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}
