// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// RPC plumbing: the little-endian field codec, typed control messages,
// the sequence-number context store and the length-prefixed TCP engine.

pub mod codec;
pub mod ctx_store;
pub mod engine;
pub mod message;
