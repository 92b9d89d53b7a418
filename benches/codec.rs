/*
 * Copyright (C) 2024-2025 the seqwire authors.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use criterion::{criterion_group, criterion_main, Criterion};
use seqwire::websocket::testutil::encode_frame;
use seqwire::websocket::{FrameDecoder, RsvBits, OPCODE_BINARY};
use std::io::Cursor;

fn encode(c: &mut Criterion) {
    let mut content = Vec::with_capacity(1024);
    for i in 0..1024 {
        content.push((i % 256) as u8);
    }

    c.bench_function("encode_frame_1k", |b| {
        b.iter(|| encode_frame(OPCODE_BINARY, true, RsvBits::none(), &content, Some([1, 2, 3, 4])))
    });
}

fn decode(c: &mut Criterion) {
    let mut content = Vec::with_capacity(1024);
    for i in 0..1024 {
        content.push((i % 256) as u8);
    }

    let wire = encode_frame(OPCODE_BINARY, true, RsvBits::none(), &content, Some([1, 2, 3, 4]));

    c.bench_function("decode_frame_1k", |b| {
        b.iter(|| {
            let mut decoder = FrameDecoder::new(1 << 20, RsvBits::none());

            let mut wire = wire.clone();
            let mut rbuf = Cursor::new(&mut wire[..]);

            decoder.decode(&mut rbuf).unwrap().unwrap()
        })
    });
}

criterion_group!(benches, encode, decode);
criterion_main!(benches);
