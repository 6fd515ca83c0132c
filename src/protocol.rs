//! DMP FIFO wire format and the stateful packet decoder.
//!
//! Every packet starts with a little-endian `u16` tag. Physical sensor
//! packets are 16 bytes (`tag, x, y, z, i64 timestamp`), quaternion packets
//! are 24 bytes (`tag, pad, i32 x, i32 y, i32 z, i64 timestamp`), markers are
//! 8 bytes. A read may end in the middle of a packet; the tail is kept and
//! prepended to the next read.

// -- Data format tags --
pub const DATA_FORMAT_STEP: u16 = 0x0001;
pub const DATA_FORMAT_MARKER: u16 = 0x0010;
pub const DATA_FORMAT_EMPTY_MARKER: u16 = 0x0020;
pub const DATA_FORMAT_PED_STANDALONE: u16 = 0x0100;
pub const DATA_FORMAT_PED_QUAT: u16 = 0x0200;
pub const DATA_FORMAT_6_AXIS: u16 = 0x0400;
pub const DATA_FORMAT_QUAT: u16 = 0x0800;
pub const DATA_FORMAT_COMPASS: u16 = 0x1000;
pub const DATA_FORMAT_GYRO: u16 = 0x2000;
pub const DATA_FORMAT_ACCEL: u16 = 0x4000;
pub const DATA_FORMAT_PRESSURE: u16 = 0x8000;

// -- Packet geometry --
pub const BYTES_PER_SENSOR: usize = 8;
pub const BYTES_PER_SENSOR_PACKET: usize = 16;
pub const BYTES_QUAT_DATA: usize = 24;
pub const QUAT_ONLY_LAST_PACKET_OFFSET: usize = 16;

/// Upper bound on carried-over bytes between reads.
pub const MAX_LEFTOVER: usize = 1024;

/// Nominal DMP period: the processor always runs at 200 Hz.
pub const RATE_200HZ: i64 = 5_000_000;

/// Which DMP engine produced a quaternion packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuatKind {
    /// Low-power 3-axis quaternion.
    ThreeAxis,
    SixAxis,
    /// 16-bit quaternion emitted alongside the pedometer.
    Pedometer,
}

/// One decoded FIFO sample, in arrival order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sample {
    Gyro { raw: [i16; 3], timestamp: i64 },
    Accel { raw: [i16; 3], timestamp: i64 },
    Compass { raw: [i16; 3], timestamp: i64 },
    Quat { kind: QuatKind, quat: [i32; 3], timestamp: i64 },
    /// Raw pressure, non-zero.
    Pressure { value: i32, timestamp: i64 },
    /// A detected step. `standalone` steps come from the pedometer-only engine.
    Step { timestamp: i64, standalone: bool },
}

/// How a decode pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Every byte was consumed.
    Complete,
    /// A partial packet of this many bytes is held for the next pass.
    NeedMore(usize),
    /// Unknown tag; the rest of the pass was discarded.
    Corrupt(u16),
}

/// Result of one [`Decoder::decode`] pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    pub samples: Vec<Sample>,
    /// Union of the tags carrying step information in this pass.
    pub ped_update: u16,
    pub data_marker: bool,
    pub empty_marker: bool,
    pub outcome: Outcome,
}

impl Decoded {
    fn new() -> Self {
        Decoded {
            samples: Vec::new(),
            ped_update: 0,
            data_marker: false,
            empty_marker: false,
            outcome: Outcome::Complete,
        }
    }

    pub fn has_marker(&self) -> bool {
        self.data_marker || self.empty_marker
    }
}

/// Bounds-checked little-endian reader over one packet.
#[derive(Debug, Clone, Copy)]
pub struct Packet<'a> {
    bytes: &'a [u8],
}

impl<'a> Packet<'a> {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn array<const N: usize>(&self, offset: usize) -> Option<[u8; N]> {
        self.bytes.get(offset..offset + N)?.try_into().ok()
    }

    pub fn u16_at(&self, offset: usize) -> Option<u16> {
        self.array(offset).map(u16::from_le_bytes)
    }

    pub fn i16_at(&self, offset: usize) -> Option<i16> {
        self.array(offset).map(i16::from_le_bytes)
    }

    pub fn i32_at(&self, offset: usize) -> Option<i32> {
        self.array(offset).map(i32::from_le_bytes)
    }

    pub fn i64_at(&self, offset: usize) -> Option<i64> {
        self.array(offset).map(i64::from_le_bytes)
    }

    fn triple_i16(&self) -> Option<[i16; 3]> {
        Some([self.i16_at(2)?, self.i16_at(4)?, self.i16_at(6)?])
    }
}

/// Cursor over a byte slice that hands out whole packets.
#[derive(Debug)]
pub struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Cursor { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    pub fn peek_u16(&self) -> Option<u16> {
        let b = self.buf.get(self.pos..self.pos + 2)?;
        Some(u16::from_le_bytes([b[0], b[1]]))
    }

    /// Consume `len` bytes as a packet, or `None` if fewer remain.
    pub fn take(&mut self, len: usize) -> Option<Packet<'a>> {
        let bytes = self.buf.get(self.pos..self.pos + len)?;
        self.pos += len;
        Some(Packet { bytes })
    }
}

/// Whether `header` is one the DMP can emit.
pub fn is_valid_header(header: u16) -> bool {
    let tag = header & !DATA_FORMAT_STEP;
    matches!(
        tag,
        DATA_FORMAT_PED_STANDALONE
            | DATA_FORMAT_PED_QUAT
            | DATA_FORMAT_6_AXIS
            | DATA_FORMAT_QUAT
            | DATA_FORMAT_COMPASS
            | DATA_FORMAT_GYRO
            | DATA_FORMAT_ACCEL
            | DATA_FORMAT_PRESSURE
            | DATA_FORMAT_EMPTY_MARKER
            | DATA_FORMAT_MARKER
    ) || header == DATA_FORMAT_STEP
}

/// Bytes occupied by a packet with this (valid) header.
pub fn packet_len(header: u16) -> usize {
    match header & !DATA_FORMAT_STEP {
        DATA_FORMAT_MARKER | DATA_FORMAT_EMPTY_MARKER => BYTES_PER_SENSOR,
        DATA_FORMAT_QUAT | DATA_FORMAT_6_AXIS => BYTES_QUAT_DATA,
        _ => BYTES_PER_SENSOR_PACKET,
    }
}

/// Stateful FIFO decoder owning the leftover buffer.
#[derive(Debug, Default)]
pub struct Decoder {
    leftover: Vec<u8>,
}

impl Decoder {
    pub fn new() -> Self {
        Decoder {
            leftover: Vec::with_capacity(BYTES_QUAT_DATA),
        }
    }

    /// Bytes currently held from the previous pass.
    pub fn leftover(&self) -> &[u8] {
        &self.leftover
    }

    /// Decode `input`, prefixed by whatever the previous pass left behind.
    pub fn decode(&mut self, input: &[u8]) -> Decoded {
        let mut buf = std::mem::take(&mut self.leftover);
        buf.extend_from_slice(input);

        let mut out = Decoded::new();
        let mut cursor = Cursor::new(&buf);

        while cursor.remaining() > 0 {
            let Some(header) = cursor.peek_u16() else {
                out.outcome = Outcome::NeedMore(cursor.remaining());
                break;
            };
            if !is_valid_header(header) {
                log::error!("invalid data format 0x{:04x}, dropping {} bytes", header, cursor.remaining());
                out.outcome = Outcome::Corrupt(header);
                return out;
            }
            let Some(packet) = cursor.take(packet_len(header)) else {
                out.outcome = Outcome::NeedMore(cursor.remaining());
                break;
            };
            decode_packet(header, packet, &mut out);
        }

        if !self.keep_leftover(cursor.rest()) {
            out.outcome = Outcome::Corrupt(0);
        }
        out
    }

    /// Hold `rest` for the next pass. Anything past the carry-over limit is dropped.
    fn keep_leftover(&mut self, rest: &[u8]) -> bool {
        if rest.len() >= MAX_LEFTOVER {
            log::warn!("leftover of {} bytes exceeds FIFO carry-over, dropped", rest.len());
            return false;
        }
        self.leftover.extend_from_slice(rest);
        true
    }
}

fn decode_packet(header: u16, packet: Packet<'_>, out: &mut Decoded) {
    let step = header & DATA_FORMAT_STEP != 0;
    let tag = header & !DATA_FORMAT_STEP;
    if step {
        out.ped_update |= header;
    }

    let parsed = match tag {
        0 => packet
            .i64_at(BYTES_PER_SENSOR)
            .map(|timestamp| (None, timestamp)),
        DATA_FORMAT_MARKER => {
            out.data_marker = true;
            return;
        }
        DATA_FORMAT_EMPTY_MARKER => {
            out.empty_marker = true;
            return;
        }
        DATA_FORMAT_QUAT | DATA_FORMAT_6_AXIS => parse_quat(tag, &packet),
        DATA_FORMAT_PED_QUAT => parse_ped_quat(&packet),
        DATA_FORMAT_PED_STANDALONE => {
            out.ped_update |= tag;
            packet.i64_at(BYTES_PER_SENSOR).map(|timestamp| {
                (Some(Sample::Step { timestamp, standalone: true }), timestamp)
            })
        }
        DATA_FORMAT_PRESSURE => parse_pressure(&packet),
        DATA_FORMAT_GYRO | DATA_FORMAT_ACCEL | DATA_FORMAT_COMPASS => parse_vector(tag, &packet),
        _ => None,
    };

    let Some((sample, timestamp)) = parsed else {
        return;
    };
    if let Some(sample) = sample {
        out.samples.push(sample);
    }
    if step {
        out.samples.push(Sample::Step { timestamp, standalone: false });
    }
}

fn parse_vector(tag: u16, packet: &Packet<'_>) -> Option<(Option<Sample>, i64)> {
    let raw = packet.triple_i16()?;
    let timestamp = packet.i64_at(BYTES_PER_SENSOR)?;
    let sample = match tag {
        DATA_FORMAT_GYRO => Sample::Gyro { raw, timestamp },
        DATA_FORMAT_ACCEL => Sample::Accel { raw, timestamp },
        _ => Sample::Compass { raw, timestamp },
    };
    Some((Some(sample), timestamp))
}

fn parse_quat(tag: u16, packet: &Packet<'_>) -> Option<(Option<Sample>, i64)> {
    let quat = [packet.i32_at(4)?, packet.i32_at(8)?, packet.i32_at(12)?];
    let timestamp = packet.i64_at(QUAT_ONLY_LAST_PACKET_OFFSET)?;
    let kind = if tag == DATA_FORMAT_QUAT {
        QuatKind::ThreeAxis
    } else {
        QuatKind::SixAxis
    };
    Some((Some(Sample::Quat { kind, quat, timestamp }), timestamp))
}

fn parse_ped_quat(packet: &Packet<'_>) -> Option<(Option<Sample>, i64)> {
    let raw = packet.triple_i16()?;
    let timestamp = packet.i64_at(BYTES_PER_SENSOR)?;
    let quat = raw.map(|v| (v as i32) << 16);
    Some((
        Some(Sample::Quat { kind: QuatKind::Pedometer, quat, timestamp }),
        timestamp,
    ))
}

fn parse_pressure(packet: &Packet<'_>) -> Option<(Option<Sample>, i64)> {
    let high = packet.i16_at(4)? as i32;
    let low = packet.u16_at(6)? as i32;
    let value = (high << 16).wrapping_add(low);
    let timestamp = packet.i64_at(BYTES_PER_SENSOR)?;
    if value == 0 {
        return Some((None, timestamp));
    }
    Some((Some(Sample::Pressure { value, timestamp }), timestamp))
}
