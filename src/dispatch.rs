//
// Copyright 2018 yvt, all rights reserved.
//
// This source code is a part of Nightingales.
//
//! Dispatch engine (C7): routes decoded frames to per-opcode handlers,
//! short-circuiting the remainder of a batch once the context goes fatal.

use std::collections::HashMap;

use crate::codec::{Decoder, Frame};
use crate::context::Context;

/// A per-opcode handler. Handlers read their inputs from `payload`, call
/// into the object/resource registries and the host driver, and write any
/// reply through `ctx`. They follow the uniform contract of §4.7: validate
/// referenced ids via the object registry before touching the driver.
pub type Handler = Box<dyn Fn(&Context, Frame<'_>) + Send + Sync>;

/// Holds the opcode → handler table. Built once at context construction;
/// never mutated afterward, so lookups need no lock.
#[derive(Default)]
pub struct DispatchEngine {
    handlers: HashMap<u16, Handler>,
}

impl DispatchEngine {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register(&mut self, opcode: u16, handler: Handler) {
        self.handlers.insert(opcode, handler);
    }

    /// Decodes and executes every frame in `buf` against `ctx`. A missing
    /// handler is a protocol violation (an unknown opcode) and marks the
    /// context fatal; from that point on, remaining frames are decoded
    /// (to advance the cursor for diagnostics) but not executed. A
    /// truncated trailing frame is likewise fatal. Zero-length input is a
    /// no-op (§8).
    pub fn dispatch_batch(&self, ctx: &Context, buf: &[u8]) {
        let mut decoder = Decoder::new(buf);
        while let Some(frame) = decoder.next_frame() {
            if ctx.is_fatal() {
                continue;
            }
            match self.handlers.get(&frame.opcode) {
                Some(handler) => handler(ctx, frame),
                None => {
                    log::warn!("unknown opcode {} on context {}", frame.opcode, ctx.ctx_id());
                    ctx.mark_fatal();
                }
            }
        }
        if decoder.truncated() {
            log::warn!("truncated command buffer on context {}", ctx.ctx_id());
            ctx.mark_fatal();
        }
    }
}
