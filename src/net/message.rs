// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Control-plane messages. Every message starts with the common head
// {version, opcode, destRankId} and encodes its body field by field.

use crate::alloc::AllocOptions;
use crate::error::{MmcError, Result};
use crate::meta::backup::JournalOp;
use crate::meta::blob::{BlobAction, BlobDesc};
use crate::meta::manager::{ObjectView, QueryInfo};
use crate::types::{Location, MediaType};

use super::codec::{Decoder, Encoder, Wire};

/// Protocol version stamped into every head.
pub const WIRE_VERSION: i16 = 1;

/// Control opcodes. Client ↔ Meta first, then Meta ↔ Local.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum OpCode {
    Ping = 0,
    Alloc = 1,
    Update = 2,
    Get = 3,
    BatchGet = 4,
    Remove = 5,
    BatchRemove = 6,
    IsExist = 7,
    BatchIsExist = 8,
    Query = 9,
    BatchQuery = 10,
    BmRegister = 11,
    BmUnregister = 12,
    MetaReplicate = 13,
    BlobCopy = 14,
}

/// Number of opcode slots a handler table carries.
pub const OPCODE_COUNT: usize = 16;

impl OpCode {
    pub fn from_i16(v: i16) -> Option<OpCode> {
        Some(match v {
            0 => OpCode::Ping,
            1 => OpCode::Alloc,
            2 => OpCode::Update,
            3 => OpCode::Get,
            4 => OpCode::BatchGet,
            5 => OpCode::Remove,
            6 => OpCode::BatchRemove,
            7 => OpCode::IsExist,
            8 => OpCode::BatchIsExist,
            9 => OpCode::Query,
            10 => OpCode::BatchQuery,
            11 => OpCode::BmRegister,
            12 => OpCode::BmUnregister,
            13 => OpCode::MetaReplicate,
            14 => OpCode::BlobCopy,
            _ => return None,
        })
    }
}

/// Common message head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgHead {
    pub version: i16,
    pub op: OpCode,
    pub dest_rank: u32,
}

impl MsgHead {
    pub fn new(op: OpCode) -> MsgHead {
        MsgHead {
            version: WIRE_VERSION,
            op,
            dest_rank: 0,
        }
    }

    /// Peek the opcode of a raw body without decoding the rest.
    pub fn peek(bytes: &[u8]) -> Result<MsgHead> {
        MsgHead::decode(&mut Decoder::new(bytes))
    }
}

impl Wire for MsgHead {
    fn encode(&self, enc: &mut Encoder) {
        enc.put_i16(self.version);
        enc.put_i16(self.op as i16);
        enc.put_u32(self.dest_rank);
    }

    fn decode(dec: &mut Decoder<'_>) -> Result<MsgHead> {
        let version = dec.get_i16()?;
        let op = dec.get_i16()?;
        let dest_rank = dec.get_u32()?;
        Ok(MsgHead {
            version,
            op: OpCode::from_i16(op)
                .ok_or_else(|| MmcError::Transport(format!("unknown opcode {op}")))?,
            dest_rank,
        })
    }
}

// ---------------------------------------------------------------------------
// Field helpers
// ---------------------------------------------------------------------------

impl Wire for BlobDesc {
    fn encode(&self, enc: &mut Encoder) {
        enc.put_u32(self.rank);
        enc.put_u8(self.media as u8);
        enc.put_u64(self.gva);
        enc.put_u64(self.size);
    }

    fn decode(dec: &mut Decoder<'_>) -> Result<BlobDesc> {
        Ok(BlobDesc {
            rank: dec.get_u32()?,
            media: MediaType::from_u8(dec.get_u8()?),
            gva: dec.get_u64()?,
            size: dec.get_u64()?,
        })
    }
}

impl Wire for ObjectView {
    fn encode(&self, enc: &mut Encoder) {
        enc.put_u64(self.size);
        enc.put_u16(self.prot);
        enc.put_u8(self.priority);
        enc.put_u64(self.lease);
        enc.put_vec(&self.blobs, |e, b| b.encode(e));
    }

    fn decode(dec: &mut Decoder<'_>) -> Result<ObjectView> {
        Ok(ObjectView {
            size: dec.get_u64()?,
            prot: dec.get_u16()?,
            priority: dec.get_u8()?,
            lease: dec.get_u64()?,
            blobs: dec.get_vec(BlobDesc::decode)?,
        })
    }
}

impl Wire for QueryInfo {
    fn encode(&self, enc: &mut Encoder) {
        enc.put_u64(self.size);
        enc.put_u16(self.prot);
        enc.put_u16(self.num_blobs);
        enc.put_u8(self.valid as u8);
        enc.put_vec(&self.placements, |e, loc| {
            e.put_u32(loc.rank);
            e.put_u8(loc.media as u8);
        });
    }

    fn decode(dec: &mut Decoder<'_>) -> Result<QueryInfo> {
        Ok(QueryInfo {
            size: dec.get_u64()?,
            prot: dec.get_u16()?,
            num_blobs: dec.get_u16()?,
            valid: dec.get_u8()? != 0,
            placements: dec.get_vec(|d| {
                let rank = d.get_u32()?;
                let media = MediaType::from_u8(d.get_u8()?);
                Ok(Location::new(rank, media))
            })?,
        })
    }
}

fn encode_alloc_options(enc: &mut Encoder, opts: &AllocOptions) {
    enc.put_u64(opts.blob_size);
    enc.put_u32(opts.num_blobs);
    enc.put_u8(opts.media as u8);
    enc.put_u32(opts.preferred_rank);
    enc.put_u32(opts.flags);
}

fn decode_alloc_options(dec: &mut Decoder<'_>) -> Result<AllocOptions> {
    Ok(AllocOptions {
        blob_size: dec.get_u64()?,
        num_blobs: dec.get_u32()?,
        media: MediaType::from_u8(dec.get_u8()?),
        preferred_rank: dec.get_u32()?,
        flags: dec.get_u32()?,
    })
}

fn put_keys(enc: &mut Encoder, keys: &[String]) {
    enc.put_vec(keys, |e, k| e.put_str(k));
}

fn get_keys(dec: &mut Decoder<'_>) -> Result<Vec<String>> {
    dec.get_vec(|d| d.get_str())
}

/// Declares head-plus-fields messages without repeating the scaffolding.
macro_rules! wire_message {
    ($name:ident, $op:expr, { $($field:ident : $ty:ty => $put:expr, $get:expr;)* }) => {
        #[derive(Debug, Clone)]
        pub struct $name {
            pub head: MsgHead,
            $(pub $field: $ty,)*
        }

        impl $name {
            #[allow(clippy::too_many_arguments)]
            pub fn new($($field: $ty),*) -> $name {
                $name {
                    head: MsgHead::new($op),
                    $($field,)*
                }
            }
        }

        impl Wire for $name {
            fn encode(&self, enc: &mut Encoder) {
                self.head.encode(enc);
                $( ($put)(enc, &self.$field); )*
            }

            fn decode(dec: &mut Decoder<'_>) -> Result<$name> {
                let head = MsgHead::decode(dec)?;
                $( let $field = ($get)(dec)?; )*
                Ok($name { head, $($field,)* })
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

wire_message!(PingMsg, OpCode::Ping, {
    num: u64 => |e: &mut Encoder, v: &u64| e.put_u64(*v), |d: &mut Decoder<'_>| d.get_u64();
});

wire_message!(AllocRequest, OpCode::Alloc, {
    key: String => |e: &mut Encoder, v: &String| e.put_str(v), |d: &mut Decoder<'_>| d.get_str();
    opts: AllocOptions => encode_alloc_options, decode_alloc_options;
    operate_id: u64 => |e: &mut Encoder, v: &u64| e.put_u64(*v), |d: &mut Decoder<'_>| d.get_u64();
});

wire_message!(GetRequest, OpCode::Get, {
    key: String => |e: &mut Encoder, v: &String| e.put_str(v), |d: &mut Decoder<'_>| d.get_str();
    operate_id: u64 => |e: &mut Encoder, v: &u64| e.put_u64(*v), |d: &mut Decoder<'_>| d.get_u64();
});

wire_message!(BatchGetRequest, OpCode::BatchGet, {
    keys: Vec<String> => put_keys, get_keys;
    operate_id: u64 => |e: &mut Encoder, v: &u64| e.put_u64(*v), |d: &mut Decoder<'_>| d.get_u64();
});

wire_message!(UpdateRequest, OpCode::Update, {
    action: u8 => |e: &mut Encoder, v: &u8| e.put_u8(*v), |d: &mut Decoder<'_>| d.get_u8();
    key: String => |e: &mut Encoder, v: &String| e.put_str(v), |d: &mut Decoder<'_>| d.get_str();
    rank: u32 => |e: &mut Encoder, v: &u32| e.put_u32(*v), |d: &mut Decoder<'_>| d.get_u32();
    media: u8 => |e: &mut Encoder, v: &u8| e.put_u8(*v), |d: &mut Decoder<'_>| d.get_u8();
    operate_id: u64 => |e: &mut Encoder, v: &u64| e.put_u64(*v), |d: &mut Decoder<'_>| d.get_u64();
});

impl UpdateRequest {
    pub fn blob_action(&self) -> Result<BlobAction> {
        BlobAction::from_u8(self.action)
            .ok_or_else(|| MmcError::Transport(format!("unknown blob action {}", self.action)))
    }
}

wire_message!(RemoveRequest, OpCode::Remove, {
    key: String => |e: &mut Encoder, v: &String| e.put_str(v), |d: &mut Decoder<'_>| d.get_str();
});

wire_message!(BatchRemoveRequest, OpCode::BatchRemove, {
    keys: Vec<String> => put_keys, get_keys;
});

wire_message!(IsExistRequest, OpCode::IsExist, {
    key: String => |e: &mut Encoder, v: &String| e.put_str(v), |d: &mut Decoder<'_>| d.get_str();
});

wire_message!(BatchIsExistRequest, OpCode::BatchIsExist, {
    keys: Vec<String> => put_keys, get_keys;
});

wire_message!(QueryRequest, OpCode::Query, {
    key: String => |e: &mut Encoder, v: &String| e.put_str(v), |d: &mut Decoder<'_>| d.get_str();
});

wire_message!(BatchQueryRequest, OpCode::BatchQuery, {
    keys: Vec<String> => put_keys, get_keys;
});

fn put_prior(enc: &mut Encoder, prior: &[(String, BlobDesc)]) {
    enc.put_vec(prior, |e, (key, desc)| {
        e.put_str(key);
        desc.encode(e);
    });
}

fn get_prior(dec: &mut Decoder<'_>) -> Result<Vec<(String, BlobDesc)>> {
    dec.get_vec(|d| {
        let key = d.get_str()?;
        let desc = BlobDesc::decode(d)?;
        Ok((key, desc))
    })
}

wire_message!(BmRegisterRequest, OpCode::BmRegister, {
    rank: u32 => |e: &mut Encoder, v: &u32| e.put_u32(*v), |d: &mut Decoder<'_>| d.get_u32();
    media: u8 => |e: &mut Encoder, v: &u8| e.put_u8(*v), |d: &mut Decoder<'_>| d.get_u8();
    base: u64 => |e: &mut Encoder, v: &u64| e.put_u64(*v), |d: &mut Decoder<'_>| d.get_u64();
    capacity: u64 => |e: &mut Encoder, v: &u64| e.put_u64(*v), |d: &mut Decoder<'_>| d.get_u64();
    prior: Vec<(String, BlobDesc)> => put_prior, get_prior;
});

wire_message!(BmUnregisterRequest, OpCode::BmUnregister, {
    rank: u32 => |e: &mut Encoder, v: &u32| e.put_u32(*v), |d: &mut Decoder<'_>| d.get_u32();
    media: u8 => |e: &mut Encoder, v: &u8| e.put_u8(*v), |d: &mut Decoder<'_>| d.get_u8();
});

wire_message!(MetaReplicateRequest, OpCode::MetaReplicate, {
    op: u8 => |e: &mut Encoder, v: &u8| e.put_u8(*v), |d: &mut Decoder<'_>| d.get_u8();
    key: String => |e: &mut Encoder, v: &String| e.put_str(v), |d: &mut Decoder<'_>| d.get_str();
    desc: BlobDesc => |e: &mut Encoder, v: &BlobDesc| v.encode(e), BlobDesc::decode;
});

impl MetaReplicateRequest {
    pub fn journal_op(&self) -> Result<JournalOp> {
        JournalOp::from_u8(self.op)
            .ok_or_else(|| MmcError::Transport(format!("unknown replicate op {}", self.op)))
    }
}

wire_message!(BlobCopyRequest, OpCode::BlobCopy, {
    src: BlobDesc => |e: &mut Encoder, v: &BlobDesc| v.encode(e), BlobDesc::decode;
    dst: BlobDesc => |e: &mut Encoder, v: &BlobDesc| v.encode(e), BlobDesc::decode;
});

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

fn put_statuses(enc: &mut Encoder, v: &[i32]) {
    enc.put_vec(v, |e, s| e.put_i32(*s));
}

fn get_statuses(dec: &mut Decoder<'_>) -> Result<Vec<i32>> {
    dec.get_vec(|d| d.get_i32())
}

wire_message!(StatusResponse, OpCode::Update, {
    ret: i32 => |e: &mut Encoder, v: &i32| e.put_i32(*v), |d: &mut Decoder<'_>| d.get_i32();
});

wire_message!(ViewResponse, OpCode::Alloc, {
    ret: i32 => |e: &mut Encoder, v: &i32| e.put_i32(*v), |d: &mut Decoder<'_>| d.get_i32();
    view: ObjectView => |e: &mut Encoder, v: &ObjectView| v.encode(e), ObjectView::decode;
});

wire_message!(BatchViewResponse, OpCode::BatchGet, {
    results: Vec<i32> => put_statuses, get_statuses;
    views: Vec<ObjectView> => |e: &mut Encoder, v: &Vec<ObjectView>| e.put_vec(v, |e, x| x.encode(e)),
                              |d: &mut Decoder<'_>| d.get_vec(ObjectView::decode);
});

wire_message!(BatchStatusResponse, OpCode::BatchRemove, {
    results: Vec<i32> => put_statuses, get_statuses;
});

wire_message!(QueryResponse, OpCode::Query, {
    ret: i32 => |e: &mut Encoder, v: &i32| e.put_i32(*v), |d: &mut Decoder<'_>| d.get_i32();
    info: QueryInfo => |e: &mut Encoder, v: &QueryInfo| v.encode(e), QueryInfo::decode;
});

wire_message!(BatchQueryResponse, OpCode::BatchQuery, {
    results: Vec<i32> => put_statuses, get_statuses;
    infos: Vec<QueryInfo> => |e: &mut Encoder, v: &Vec<QueryInfo>| e.put_vec(v, |e, x| x.encode(e)),
                             |d: &mut Decoder<'_>| d.get_vec(QueryInfo::decode);
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_request_round_trip() {
        let req = AllocRequest::new(
            "kv/layer-7".into(),
            AllocOptions::new(65536, 2, MediaType::Hbm, 3, 1),
            0x0000_0007_0000_002a,
        );
        let bytes = req.to_bytes();
        assert_eq!(MsgHead::peek(&bytes).unwrap().op, OpCode::Alloc);

        let back = AllocRequest::from_bytes(&bytes).unwrap();
        assert_eq!(back.key, "kv/layer-7");
        assert_eq!(back.opts.blob_size, 65536);
        assert_eq!(back.opts.num_blobs, 2);
        assert_eq!(back.opts.media, MediaType::Hbm);
        assert_eq!(back.operate_id, req.operate_id);
    }

    #[test]
    fn view_response_carries_blob_list() {
        let resp = ViewResponse::new(
            0,
            ObjectView {
                size: 4096,
                prot: 0,
                priority: 1,
                lease: 99,
                blobs: vec![
                    BlobDesc {
                        rank: 1,
                        media: MediaType::Dram,
                        gva: 0x100,
                        size: 4096,
                    },
                    BlobDesc {
                        rank: 2,
                        media: MediaType::Hbm,
                        gva: 0x200,
                        size: 4096,
                    },
                ],
            },
        );
        let back = ViewResponse::from_bytes(&resp.to_bytes()).unwrap();
        assert_eq!(back.view.blobs.len(), 2);
        assert_eq!(back.view.blobs[1].media, MediaType::Hbm);
    }

    #[test]
    fn register_request_ships_prior_blobs() {
        let req = BmRegisterRequest::new(
            4,
            MediaType::Dram as u8,
            0x5_0000_0000,
            1 << 21,
            vec![(
                "survivor".into(),
                BlobDesc {
                    rank: 4,
                    media: MediaType::Dram,
                    gva: 0x5_0000_1000,
                    size: 4096,
                },
            )],
        );
        let back = BmRegisterRequest::from_bytes(&req.to_bytes()).unwrap();
        assert_eq!(back.prior.len(), 1);
        assert_eq!(back.prior[0].0, "survivor");
    }

    #[test]
    fn bad_opcode_rejected() {
        let mut enc = Encoder::new();
        enc.put_i16(WIRE_VERSION);
        enc.put_i16(99);
        enc.put_u32(0);
        assert!(MsgHead::peek(enc.as_bytes()).is_err());
    }
}
