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

use crate::http1::ExtensionOffer;
use crate::websocket::{Frame, RsvBits};
use log::debug;
use miniz_oxide::deflate;
use miniz_oxide::inflate::stream::{inflate, InflateState};
use miniz_oxide::{DataFormat, MZError, MZFlush, MZStatus};
use std::fmt::Write as _;

const DEFAULT_MAX_WINDOW_BITS: u8 = 15;
const DEFLATE_SUFFIX: [u8; 4] = [0x00, 0x00, 0xff, 0xff];
const CODEC_CHUNK_SIZE: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("extensions {first} and {second} claim the same reserved bit")]
    RsvBitConflict {
        first: &'static str,
        second: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExtensionError {
    #[error("invalid extension parameter")]
    InvalidParams,

    #[error("extension {0} not agreed by peer")]
    NotAgreed(&'static str),

    #[error("compression failed")]
    Deflate,

    #[error("decompression failed")]
    Inflate,
}

// a per-session, activated extension. frames flow through activated
// extensions in installation order, outgoing before serialization and
// incoming before the application observes them
pub trait Extension: Send {
    fn name(&self) -> &'static str;

    fn rsv_bits(&self) -> RsvBits;

    fn process_outgoing(&mut self, frame: Frame) -> Result<Frame, ExtensionError>;

    fn process_incoming(&mut self, frame: Frame) -> Result<Frame, ExtensionError>;
}

// an installable extension. negotiation happens per connection; the
// factory stays immutable and shared
pub trait ExtensionFactory: Send + Sync {
    fn name(&self) -> &'static str;

    // the reserved bits this extension will use once activated
    fn rsv_bits(&self) -> RsvBits;

    // server side: given one offer from the client, either decline or
    // produce an activated extension plus the response header entry
    fn accept_offer(&self, offer: &ExtensionOffer)
        -> Option<(Box<dyn Extension>, String)>;

    // client side: the server agreed to this entry. error means the
    // server's parameters are unacceptable
    fn activate(&self, agreed: &ExtensionOffer) -> Result<Box<dyn Extension>, ExtensionError>;

    // client side: the entry to place in the request's offer header
    fn offer(&self) -> String;
}

// install-time registry. claiming an already-claimed reserved bit is a
// configuration failure, detected here and never deferred to a connection
pub struct ExtensionRegistry {
    factories: Vec<Box<dyn ExtensionFactory>>,
    claimed: RsvBits,
}

#[allow(clippy::new_without_default)]
impl ExtensionRegistry {
    pub fn new() -> Self {
        Self {
            factories: Vec::new(),
            claimed: RsvBits::none(),
        }
    }

    pub fn install(&mut self, factory: Box<dyn ExtensionFactory>) -> Result<(), ConfigError> {
        let bits = factory.rsv_bits();

        if self.claimed.intersects(bits) {
            // find the earlier claimant for the error message
            for f in self.factories.iter() {
                if f.rsv_bits().intersects(bits) {
                    return Err(ConfigError::RsvBitConflict {
                        first: f.name(),
                        second: factory.name(),
                    });
                }
            }

            unreachable!();
        }

        self.claimed = self.claimed.union(bits);
        self.factories.push(factory);

        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    // server side: match the client's offers against installed factories,
    // in installation order. returns the activated pipeline and the value
    // for the response's Sec-WebSocket-Extensions header
    pub fn negotiate_server(
        &self,
        offers: &[ExtensionOffer],
    ) -> (Vec<Box<dyn Extension>>, Option<String>) {
        let mut active = Vec::new();
        let mut header = String::new();

        for factory in self.factories.iter() {
            for offer in offers.iter() {
                if offer.name != factory.name() {
                    continue;
                }

                if let Some((ext, entry)) = factory.accept_offer(offer) {
                    debug!("negotiated extension {}", ext.name());

                    if !header.is_empty() {
                        header.push_str(", ");
                    }
                    header.push_str(&entry);

                    active.push(ext);
                    break;
                }
            }
        }

        let header = if header.is_empty() {
            None
        } else {
            Some(header)
        };

        (active, header)
    }

    // client side: activate installed extensions the server agreed to
    pub fn negotiate_client(
        &self,
        agreed: &[ExtensionOffer],
    ) -> Result<Vec<Box<dyn Extension>>, ExtensionError> {
        let mut active = Vec::new();

        for factory in self.factories.iter() {
            for entry in agreed.iter() {
                if entry.name == factory.name() {
                    active.push(factory.activate(entry)?);
                    break;
                }
            }
        }

        Ok(active)
    }

    // the value for a client request's offer header
    pub fn offers_header(&self) -> Option<String> {
        if self.factories.is_empty() {
            return None;
        }

        let mut header = String::new();

        for factory in self.factories.iter() {
            if !header.is_empty() {
                header.push_str(", ");
            }

            header.push_str(&factory.offer());
        }

        Some(header)
    }
}

// the reserved bits used by a set of activated extensions
pub fn active_rsv_bits(extensions: &[Box<dyn Extension>]) -> RsvBits {
    let mut bits = RsvBits::none();

    for ext in extensions.iter() {
        bits = bits.union(ext.rsv_bits());
    }

    bits
}

pub struct PerMessageDeflateConfig {
    pub client_no_context_takeover: bool,
    pub server_no_context_takeover: bool,
    pub client_max_window_bits: u8,
    pub server_max_window_bits: u8,
}

fn parse_empty(s: &str, dest: &mut bool) -> Result<(), ExtensionError> {
    // must not be set yet and value must be empty
    if *dest || !s.is_empty() {
        return Err(ExtensionError::InvalidParams);
    }

    *dest = true;

    Ok(())
}

// set default to allow the param with no value
fn parse_bits(
    s: &str,
    dest: &mut Option<u8>,
    default: Option<u8>,
) -> Result<(), ExtensionError> {
    // must not be set yet
    if dest.is_some() {
        return Err(ExtensionError::InvalidParams);
    }

    if s.is_empty() {
        if let Some(x) = default {
            *dest = Some(x);
            return Ok(());
        }
    }

    // must be a valid u8 between 8 and 15, inclusive
    let x: u8 = match s.parse() {
        Ok(x) => x,
        Err(_) => return Err(ExtensionError::InvalidParams),
    };

    if (8..=15).contains(&x) {
        *dest = Some(x);
        return Ok(());
    }

    Err(ExtensionError::InvalidParams)
}

impl PerMessageDeflateConfig {
    pub fn from_params(params: &[(String, String)]) -> Result<Self, ExtensionError> {
        let mut client_no_context_takeover = false;
        let mut server_no_context_takeover = false;
        let mut client_max_window_bits = None;
        let mut server_max_window_bits = None;

        for (k, v) in params.iter() {
            match k.as_str() {
                "client_no_context_takeover" => parse_empty(v, &mut client_no_context_takeover)?,
                "server_no_context_takeover" => parse_empty(v, &mut server_no_context_takeover)?,
                "client_max_window_bits" => parse_bits(v, &mut client_max_window_bits, Some(15))?,
                "server_max_window_bits" => parse_bits(v, &mut server_max_window_bits, None)?,
                _ => return Err(ExtensionError::InvalidParams), // undefined param
            }
        }

        Ok(Self {
            client_no_context_takeover,
            server_no_context_takeover,
            client_max_window_bits: client_max_window_bits.unwrap_or(DEFAULT_MAX_WINDOW_BITS),
            server_max_window_bits: server_max_window_bits.unwrap_or(DEFAULT_MAX_WINDOW_BITS),
        })
    }

    pub fn create_response(&self) -> Result<Self, ExtensionError> {
        // we don't support non-default server_max_window_bits
        if self.server_max_window_bits != DEFAULT_MAX_WINDOW_BITS {
            return Err(ExtensionError::InvalidParams);
        }

        Ok(Self {
            // ack. makes no difference to us
            client_no_context_takeover: self.client_no_context_takeover,
            // ack. we'll agree to whatever the client wants
            server_no_context_takeover: self.server_no_context_takeover,
            // ignore. we always support the maximum window size
            client_max_window_bits: DEFAULT_MAX_WINDOW_BITS,
            // ignore. we require the client to support the maximum window size
            server_max_window_bits: DEFAULT_MAX_WINDOW_BITS,
        })
    }

    pub fn serialize(&self, name: &str) -> String {
        let mut out = String::from(name);

        if self.client_no_context_takeover {
            out.push_str("; client_no_context_takeover");
        }

        if self.server_no_context_takeover {
            out.push_str("; server_no_context_takeover");
        }

        if self.client_max_window_bits != DEFAULT_MAX_WINDOW_BITS {
            write!(out, "; client_max_window_bits={}", self.client_max_window_bits).unwrap();
        }

        if self.server_max_window_bits != DEFAULT_MAX_WINDOW_BITS {
            write!(out, "; server_max_window_bits={}", self.server_max_window_bits).unwrap();
        }

        out
    }
}

impl Default for PerMessageDeflateConfig {
    fn default() -> Self {
        Self {
            client_no_context_takeover: false,
            server_no_context_takeover: false,
            client_max_window_bits: DEFAULT_MAX_WINDOW_BITS,
            server_max_window_bits: DEFAULT_MAX_WINDOW_BITS,
        }
    }
}

pub struct DeflateEncoder {
    enc: Box<deflate::core::CompressorOxide>,
}

impl DeflateEncoder {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        let mut enc = Box::new(deflate::core::CompressorOxide::default());

        enc.set_format_and_level(
            DataFormat::Raw,
            deflate::CompressionLevel::DefaultLevel as u8,
        );

        Self { enc }
    }

    pub fn reset(&mut self) {
        self.enc.reset();
    }

    fn run(&mut self, src: &[u8], flush: MZFlush) -> Result<Vec<u8>, ExtensionError> {
        let mut out = Vec::new();
        let mut chunk = [0; CODEC_CHUNK_SIZE];
        let mut pos = 0;

        loop {
            let result = deflate::stream::deflate(&mut self.enc, &src[pos..], &mut chunk, flush);

            match result.status {
                Ok(MZStatus::Ok) => {}
                Err(MZError::Buf) => {}
                _ => return Err(ExtensionError::Deflate),
            }

            pos += result.bytes_consumed;
            out.extend_from_slice(&chunk[..result.bytes_written]);

            if pos == src.len() && result.bytes_written < chunk.len() {
                break;
            }
        }

        Ok(out)
    }

    // compress one message fragment. when end is set, the message is
    // finished with a sync flush and the 00 00 ff ff tail is stripped
    pub fn encode(&mut self, src: &[u8], end: bool) -> Result<Vec<u8>, ExtensionError> {
        let flush = if end { MZFlush::Sync } else { MZFlush::None };

        let mut out = self.run(src, flush)?;

        if end {
            if !out.ends_with(&DEFLATE_SUFFIX) {
                return Err(ExtensionError::Deflate);
            }

            out.truncate(out.len() - DEFLATE_SUFFIX.len());
        }

        Ok(out)
    }
}

pub struct DeflateDecoder {
    dec: Box<InflateState>,
}

impl DeflateDecoder {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            dec: InflateState::new_boxed(DataFormat::Raw),
        }
    }

    pub fn reset(&mut self) {
        self.dec = InflateState::new_boxed(DataFormat::Raw);
    }

    fn run(&mut self, src: &[u8]) -> Result<Vec<u8>, ExtensionError> {
        let mut out = Vec::new();
        let mut chunk = [0; CODEC_CHUNK_SIZE];
        let mut pos = 0;

        loop {
            let result = inflate(&mut self.dec, &src[pos..], &mut chunk, MZFlush::None);

            match result.status {
                Ok(MZStatus::Ok) => {}
                Err(MZError::Buf) => {}
                _ => return Err(ExtensionError::Inflate),
            }

            pos += result.bytes_consumed;
            out.extend_from_slice(&chunk[..result.bytes_written]);

            if pos == src.len() && result.bytes_written < chunk.len() {
                break;
            }
        }

        Ok(out)
    }

    // decompress one message fragment. when end is set, the stripped
    // 00 00 ff ff tail is replayed to complete the message
    pub fn decode(&mut self, src: &[u8], end: bool) -> Result<Vec<u8>, ExtensionError> {
        let mut out = self.run(src)?;

        if end {
            out.extend(self.run(&DEFLATE_SUFFIX)?);
        }

        Ok(out)
    }
}

// permessage-deflate, RFC 7692. claims rsv1
pub struct PerMessageDeflate {
    server_no_context_takeover: bool,
}

#[allow(clippy::new_without_default)]
impl PerMessageDeflate {
    pub fn new() -> Self {
        Self {
            server_no_context_takeover: false,
        }
    }

    pub fn no_context_takeover(mut self) -> Self {
        self.server_no_context_takeover = true;

        self
    }
}

const PERMESSAGE_DEFLATE: &str = "permessage-deflate";

impl ExtensionFactory for PerMessageDeflate {
    fn name(&self) -> &'static str {
        PERMESSAGE_DEFLATE
    }

    fn rsv_bits(&self) -> RsvBits {
        RsvBits {
            rsv1: true,
            rsv2: false,
            rsv3: false,
        }
    }

    fn accept_offer(&self, offer: &ExtensionOffer) -> Option<(Box<dyn Extension>, String)> {
        let mut config = match PerMessageDeflateConfig::from_params(&offer.params) {
            Ok(config) => config,
            Err(_) => return None,
        };

        if self.server_no_context_takeover {
            config.server_no_context_takeover = true;
        }

        let response = match config.create_response() {
            Ok(response) => response,
            Err(_) => return None,
        };

        let entry = response.serialize(PERMESSAGE_DEFLATE);

        // as a server, our send context follows the server takeover param
        // and our receive context follows the client takeover param
        let ext = DeflateExtension::new(
            !response.server_no_context_takeover,
            !response.client_no_context_takeover,
        );

        Some((Box::new(ext), entry))
    }

    fn activate(&self, agreed: &ExtensionOffer) -> Result<Box<dyn Extension>, ExtensionError> {
        let config = PerMessageDeflateConfig::from_params(&agreed.params)?;

        // as a client, the roles flip
        Ok(Box::new(DeflateExtension::new(
            !config.client_no_context_takeover,
            !config.server_no_context_takeover,
        )))
    }

    fn offer(&self) -> String {
        let config = PerMessageDeflateConfig {
            server_no_context_takeover: self.server_no_context_takeover,
            ..Default::default()
        };

        config.serialize(PERMESSAGE_DEFLATE)
    }
}

struct DeflateExtension {
    enc: DeflateEncoder,
    dec: DeflateDecoder,
    enc_takeover: bool,
    dec_takeover: bool,
    send_mid_message: bool,
}

impl DeflateExtension {
    fn new(enc_takeover: bool, dec_takeover: bool) -> Self {
        Self {
            enc: DeflateEncoder::new(),
            dec: DeflateDecoder::new(),
            enc_takeover,
            dec_takeover,
            send_mid_message: false,
        }
    }
}

impl Extension for DeflateExtension {
    fn name(&self) -> &'static str {
        PERMESSAGE_DEFLATE
    }

    fn rsv_bits(&self) -> RsvBits {
        RsvBits {
            rsv1: true,
            rsv2: false,
            rsv3: false,
        }
    }

    fn process_outgoing(&mut self, mut frame: Frame) -> Result<Frame, ExtensionError> {
        if frame.is_control() {
            return Ok(frame);
        }

        let first = !self.send_mid_message;

        frame.data = self.enc.encode(&frame.data, frame.fin)?;

        // rsv1 marks the first frame of a compressed message
        if first {
            frame.rsv.rsv1 = true;
        }

        self.send_mid_message = !frame.fin;

        if frame.fin && !self.enc_takeover {
            self.enc.reset();
        }

        Ok(frame)
    }

    fn process_incoming(&mut self, mut frame: Frame) -> Result<Frame, ExtensionError> {
        if frame.is_control() || !frame.rsv.rsv1 {
            return Ok(frame);
        }

        frame.data = self.dec.decode(&frame.data, frame.fin)?;
        frame.rsv.rsv1 = false;

        if frame.fin && !self.dec_takeover {
            self.dec.reset();
        }

        Ok(frame)
    }
}
