//! Wire format: typed arguments, messages, bundles, and the coercion table.
//!
//! The layout is big-endian and 4-byte aligned throughout, encoded and
//! decoded with explicit `to_be_bytes`/`from_be_bytes` calls rather than
//! unions or pointer casts.

use crate::address::{decode_string, encode_string, padded_len};
use crate::error::{CoreError, Result};

/// One OSC-compatible argument value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int32(i32),
    Int64(i64),
    Float(f32),
    Double(f64),
    Time(f64),
    Char(char),
    Blob(Vec<u8>),
    String(String),
    Symbol(String),
    Bool(bool),
    Midi([u8; 4]),
    True,
    False,
    Nil,
    Infinitum,
    Vector(Vec<Value>),
    Array(Vec<Value>),
}

impl Value {
    /// The single-character type tag this value encodes as.
    pub fn type_tag(&self) -> char {
        match self {
            Value::Int32(_) => 'i',
            Value::Int64(_) => 'h',
            Value::Float(_) => 'f',
            Value::Double(_) => 'd',
            Value::Time(_) => 't',
            Value::Char(_) => 'c',
            Value::Blob(_) => 'b',
            Value::String(_) => 's',
            Value::Symbol(_) => 'S',
            Value::Bool(b) => {
                if *b {
                    'T'
                } else {
                    'F'
                }
            }
            Value::Midi(_) => 'm',
            Value::True => 'T',
            Value::False => 'F',
            Value::Nil => 'N',
            Value::Infinitum => 'I',
            Value::Vector(_) => 'v',
            Value::Array(_) => '[',
        }
    }

    fn is_numeric(&self) -> bool {
        matches!(
            self,
            Value::Int32(_) | Value::Int64(_) | Value::Float(_) | Value::Double(_) | Value::Time(_)
        )
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int32(v) => Some(*v as f64),
            Value::Int64(v) => Some(*v as f64),
            Value::Float(v) => Some(*v as f64),
            Value::Double(v) => Some(*v),
            Value::Time(v) => Some(*v),
            _ => None,
        }
    }
}

/// Coerce `value` to the requested type tag, implementing the documented
/// interpretation of the coercion table (see `SPEC_FULL.md` §9): numeric
/// types interconvert freely and are zero-testable to bool; `s`/`S`
/// interconvert; bool variants interconvert and accept numerics; blob,
/// midi, nil and infinitum coerce only to themselves.
pub fn coerce(value: &Value, want: char) -> Result<Value> {
    if value.type_tag() == want {
        return Ok(value.clone());
    }
    match want {
        'i' | 'h' | 'f' | 'd' | 't' => {
            let n = value
                .as_f64()
                .ok_or_else(|| type_mismatch(want, value.type_tag()))?;
            Ok(match want {
                'i' => Value::Int32(n as i32),
                'h' => Value::Int64(n as i64),
                'f' => Value::Float(n as f32),
                'd' => Value::Double(n),
                't' => Value::Time(n),
                _ => unreachable!(),
            })
        }
        'T' | 'F' => {
            let truthy = match value {
                Value::True | Value::False => want == value.type_tag(),
                _ if value.is_numeric() => value.as_f64().unwrap() != 0.0,
                _ => return Err(type_mismatch(want, value.type_tag())),
            };
            Ok(if truthy { Value::True } else { Value::False })
        }
        'B' => {
            let truthy = match value {
                Value::True => true,
                Value::False => false,
                _ if value.is_numeric() => value.as_f64().unwrap() != 0.0,
                _ => return Err(type_mismatch(want, value.type_tag())),
            };
            Ok(Value::Bool(truthy))
        }
        's' | 'S' => match value {
            Value::String(s) | Value::Symbol(s) => Ok(if want == 's' {
                Value::String(s.clone())
            } else {
                Value::Symbol(s.clone())
            }),
            _ => Err(type_mismatch(want, value.type_tag())),
        },
        _ => Err(type_mismatch(want, value.type_tag())),
    }
}

fn type_mismatch(expected: char, found: char) -> CoreError {
    CoreError::TypeMismatch { expected, found }
}

/// Flatten a `Vector`/`Array` argument list into a plain sequence of scalar
/// values, recursing into nested arrays in order.
pub fn flatten(values: &[Value]) -> Vec<Value> {
    let mut out = Vec::with_capacity(values.len());
    for v in values {
        match v {
            Value::Vector(inner) | Value::Array(inner) => out.extend(flatten(inner)),
            other => out.push(other.clone()),
        }
    }
    out
}

/// A fully-formed OSC-compatible message: an address plus its typed
/// argument list, plus the header fields a lone message needs to survive a
/// wire hop on its own (a bundle carries its timestamp once for every
/// element; a standalone message has to carry its own).
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub address: String,
    pub args: Vec<Value>,
    /// Tap hop count, incremented on every forward; see [`crate::tap::MAX_TAP_TTL`].
    pub ttl: u8,
    /// True if this message should travel over a reliable (TCP) transport
    /// hop rather than best-effort (UDP) when forwarded remotely.
    pub reliable: bool,
    /// Scheduled delivery time: `0.0` for immediate, matching
    /// `schedule_global`/`schedule_local`'s `due` semantics.
    pub timestamp: f64,
}

/// A timestamped group of messages or nested bundles, dispatched together.
#[derive(Debug, Clone, PartialEq)]
pub struct Bundle {
    pub timestamp: f64,
    pub elements: Vec<Packet>,
}

/// The unit of delivery: either a single message or a bundle of packets.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Message(Message),
    Bundle(Bundle),
}

const BUNDLE_MARKER: &str = "#bundle";

impl Packet {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        encode_packet(self, &mut out);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Packet> {
        decode_packet(buf)
    }
}

fn encode_packet(packet: &Packet, out: &mut Vec<u8>) {
    match packet {
        Packet::Message(msg) => encode_message(msg, out),
        Packet::Bundle(bundle) => encode_bundle(bundle, out),
    }
}

/// Flags packed into the low byte of a message's header word; only the
/// reliable-transport bit is defined so far.
const FLAG_RELIABLE: u32 = 0x01;

fn encode_message(msg: &Message, out: &mut Vec<u8>) {
    let flags_and_ttl = (if msg.reliable { FLAG_RELIABLE } else { 0 }) | ((msg.ttl as u32) << 8);
    out.extend_from_slice(&flags_and_ttl.to_be_bytes());
    out.extend_from_slice(&msg.timestamp.to_be_bytes());
    encode_string(&msg.address, out);
    let mut tags = String::with_capacity(msg.args.len() + 1);
    tags.push(',');
    for a in &msg.args {
        tags.push(a.type_tag());
    }
    encode_string(&tags, out);
    for a in &msg.args {
        encode_value(a, out);
    }
}

fn encode_bundle(bundle: &Bundle, out: &mut Vec<u8>) {
    encode_string(BUNDLE_MARKER, out);
    out.extend_from_slice(&bundle.timestamp.to_be_bytes());
    for el in &bundle.elements {
        let mut inner = Vec::new();
        encode_packet(el, &mut inner);
        out.extend_from_slice(&(inner.len() as i32).to_be_bytes());
        out.extend_from_slice(&inner);
    }
}

fn encode_value(v: &Value, out: &mut Vec<u8>) {
    match v {
        Value::Int32(n) => out.extend_from_slice(&n.to_be_bytes()),
        Value::Int64(n) => out.extend_from_slice(&n.to_be_bytes()),
        Value::Float(n) => out.extend_from_slice(&n.to_be_bytes()),
        Value::Double(n) => out.extend_from_slice(&n.to_be_bytes()),
        Value::Time(n) => out.extend_from_slice(&n.to_be_bytes()),
        Value::Char(c) => {
            let mut buf = [0u8; 4];
            buf[3] = *c as u8;
            out.extend_from_slice(&buf);
        }
        Value::Blob(b) => {
            out.extend_from_slice(&(b.len() as i32).to_be_bytes());
            out.extend_from_slice(b);
            let pad = padded_len(b.len()) - b.len();
            out.resize(out.len() + pad, 0);
        }
        Value::String(s) | Value::Symbol(s) => encode_string(s, out),
        Value::Midi(bytes) => out.extend_from_slice(bytes),
        Value::True | Value::False | Value::Nil | Value::Infinitum => {}
        Value::Bool(_) => {}
        Value::Vector(items) | Value::Array(items) => {
            for item in items {
                encode_value(item, out);
            }
        }
    }
}

/// `encode_string(BUNDLE_MARKER, ..)`'s exact output: `BUNDLE_MARKER` is 7
/// bytes so it pads to 8 with a single NUL. A message's header never starts
/// with these bytes (its first four are a flags/ttl word whose low byte is
/// the reliable flag), so checking this fixed prefix tells the two apart
/// without needing to decode a string that might not be one.
const BUNDLE_PREFIX: &[u8] = b"#bundle\0";

fn decode_packet(buf: &[u8]) -> Result<Packet> {
    if buf.starts_with(BUNDLE_PREFIX) {
        decode_bundle(buf).map(Packet::Bundle)
    } else {
        decode_message(buf).map(Packet::Message)
    }
}

fn decode_message(buf: &[u8]) -> Result<Message> {
    if buf.len() < 12 {
        return Err(CoreError::BadMessage("truncated message header".into()));
    }
    let flags_and_ttl = u32::from_be_bytes(buf[0..4].try_into().unwrap());
    let reliable = flags_and_ttl & FLAG_RELIABLE != 0;
    let ttl = ((flags_and_ttl >> 8) & 0xFF) as u8;
    let timestamp = f64::from_be_bytes(buf[4..12].try_into().unwrap());
    let (address, offset) = decode_string(buf, 12)?;
    let (tags, mut offset) = decode_string(buf, offset)?;
    if !tags.starts_with(',') {
        return Err(CoreError::BadMessage("type tag string missing ','".into()));
    }
    let mut args = Vec::new();
    for tag in tags.chars().skip(1) {
        let (value, next) = decode_value(tag, buf, offset)?;
        args.push(value);
        offset = next;
    }
    Ok(Message {
        address,
        args,
        ttl,
        reliable,
        timestamp,
    })
}

fn decode_bundle(buf: &[u8]) -> Result<Bundle> {
    let (_marker, offset) = decode_string(buf, 0)?;
    if offset + 8 > buf.len() {
        return Err(CoreError::BadMessage("truncated bundle timestamp".into()));
    }
    let timestamp = f64::from_be_bytes(buf[offset..offset + 8].try_into().unwrap());
    let mut cursor = offset + 8;
    let mut elements = Vec::new();
    while cursor < buf.len() {
        if cursor + 4 > buf.len() {
            return Err(CoreError::BadMessage("truncated bundle element length".into()));
        }
        let len = i32::from_be_bytes(buf[cursor..cursor + 4].try_into().unwrap()) as usize;
        cursor += 4;
        if cursor + len > buf.len() {
            return Err(CoreError::BadMessage("truncated bundle element".into()));
        }
        elements.push(decode_packet(&buf[cursor..cursor + len])?);
        cursor += len;
    }
    Ok(Bundle { timestamp, elements })
}

fn decode_value(tag: char, buf: &[u8], offset: usize) -> Result<(Value, usize)> {
    let need = |n: usize| -> Result<()> {
        if offset + n > buf.len() {
            Err(CoreError::BadMessage("truncated argument value".into()))
        } else {
            Ok(())
        }
    };
    match tag {
        'i' => {
            need(4)?;
            Ok((
                Value::Int32(i32::from_be_bytes(buf[offset..offset + 4].try_into().unwrap())),
                offset + 4,
            ))
        }
        'h' => {
            need(8)?;
            Ok((
                Value::Int64(i64::from_be_bytes(buf[offset..offset + 8].try_into().unwrap())),
                offset + 8,
            ))
        }
        'f' => {
            need(4)?;
            Ok((
                Value::Float(f32::from_be_bytes(buf[offset..offset + 4].try_into().unwrap())),
                offset + 4,
            ))
        }
        'd' => {
            need(8)?;
            Ok((
                Value::Double(f64::from_be_bytes(buf[offset..offset + 8].try_into().unwrap())),
                offset + 8,
            ))
        }
        't' => {
            need(8)?;
            Ok((
                Value::Time(f64::from_be_bytes(buf[offset..offset + 8].try_into().unwrap())),
                offset + 8,
            ))
        }
        'c' => {
            need(4)?;
            Ok((Value::Char(buf[offset + 3] as char), offset + 4))
        }
        'm' => {
            need(4)?;
            let mut arr = [0u8; 4];
            arr.copy_from_slice(&buf[offset..offset + 4]);
            Ok((Value::Midi(arr), offset + 4))
        }
        'b' => {
            need(4)?;
            let len = i32::from_be_bytes(buf[offset..offset + 4].try_into().unwrap()) as usize;
            let start = offset + 4;
            if start + len > buf.len() {
                return Err(CoreError::BadMessage("truncated blob".into()));
            }
            let blob = buf[start..start + len].to_vec();
            Ok((Value::Blob(blob), start + padded_len(len)))
        }
        's' => {
            let (s, next) = decode_string(buf, offset)?;
            Ok((Value::String(s), next))
        }
        'S' => {
            let (s, next) = decode_string(buf, offset)?;
            Ok((Value::Symbol(s), next))
        }
        'T' => Ok((Value::True, offset)),
        'F' => Ok((Value::False, offset)),
        'N' => Ok((Value::Nil, offset)),
        'I' => Ok((Value::Infinitum, offset)),
        other => Err(CoreError::BadMessage(format!("unknown type tag '{other}'"))),
    }
}

/// Incrementally stage an outgoing message before encoding it.
#[derive(Debug, Default)]
pub struct MessageBuilder {
    address: String,
    args: Vec<Value>,
}

impl MessageBuilder {
    pub fn start(address: impl Into<String>) -> Self {
        MessageBuilder {
            address: address.into(),
            args: Vec::new(),
        }
    }

    pub fn add(mut self, value: Value) -> Self {
        self.args.push(value);
        self
    }

    pub fn add_int32(self, v: i32) -> Self {
        self.add(Value::Int32(v))
    }

    pub fn add_float(self, v: f32) -> Self {
        self.add(Value::Float(v))
    }

    pub fn add_string(self, v: impl Into<String>) -> Self {
        self.add(Value::String(v.into()))
    }

    /// Finalize the message, stamping it with the delivery time and
    /// transport reliability it will carry on the wire.
    pub fn finish(self, timestamp: f64, reliable: bool) -> Message {
        Message {
            address: self.address,
            args: self.args,
            ttl: 0,
            reliable,
            timestamp,
        }
    }
}

/// Sequentially read typed arguments out of a decoded message, applying
/// [`coerce`] when the requested tag differs from the one on the wire.
pub struct MessageReader<'a> {
    args: &'a [Value],
    cursor: usize,
}

impl<'a> MessageReader<'a> {
    pub fn start(message: &'a Message) -> Self {
        MessageReader {
            args: &message.args,
            cursor: 0,
        }
    }

    pub fn get_next(&mut self, want: char) -> Result<Value> {
        let value = self
            .args
            .get(self.cursor)
            .ok_or_else(|| CoreError::BadMessage("not enough arguments".into()))?;
        self.cursor += 1;
        coerce(value, want)
    }

    pub fn remaining(&self) -> usize {
        self.args.len() - self.cursor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_round_trips_through_wire_bytes() {
        let msg = MessageBuilder::start("/synth/1/freq")
            .add_int32(42)
            .add_float(3.25)
            .add_string("hello")
            .finish(1234.5, true);
        let packet = Packet::Message(msg.clone());
        let encoded = packet.encode();
        let decoded = Packet::decode(&encoded).unwrap();
        assert_eq!(decoded, Packet::Message(msg));
    }

    #[test]
    fn bundle_round_trips_with_nested_message() {
        let inner = Message {
            address: "/x".into(),
            args: vec![Value::Int32(7)],
            ttl: 0,
            reliable: true,
            timestamp: 0.0,
        };
        let bundle = Bundle {
            timestamp: 12345.5,
            elements: vec![Packet::Message(inner)],
        };
        let packet = Packet::Bundle(bundle.clone());
        let encoded = packet.encode();
        let decoded = Packet::decode(&encoded).unwrap();
        assert_eq!(decoded, Packet::Bundle(bundle));
    }

    #[test]
    fn numeric_types_coerce_freely() {
        let v = Value::Int32(4);
        assert_eq!(coerce(&v, 'f').unwrap(), Value::Float(4.0));
        assert_eq!(coerce(&v, 'd').unwrap(), Value::Double(4.0));
        assert_eq!(coerce(&v, 'h').unwrap(), Value::Int64(4));
    }

    #[test]
    fn zero_numeric_coerces_to_false() {
        let v = Value::Int32(0);
        assert_eq!(coerce(&v, 'T').unwrap(), Value::False);
        let nz = Value::Float(1.0);
        assert_eq!(coerce(&nz, 'T').unwrap(), Value::True);
    }

    #[test]
    fn string_and_symbol_interconvert() {
        let v = Value::String("hi".into());
        assert_eq!(coerce(&v, 'S').unwrap(), Value::Symbol("hi".into()));
    }

    #[test]
    fn blob_does_not_coerce_to_numeric() {
        let v = Value::Blob(vec![1, 2, 3]);
        assert!(coerce(&v, 'i').is_err());
    }

    #[test]
    fn flatten_descends_into_nested_arrays() {
        let values = vec![
            Value::Int32(1),
            Value::Array(vec![Value::Int32(2), Value::Array(vec![Value::Int32(3)])]),
        ];
        let flat = flatten(&values);
        assert_eq!(flat, vec![Value::Int32(1), Value::Int32(2), Value::Int32(3)]);
    }

    #[test]
    fn reader_applies_coercion_per_requested_tag() {
        let msg = MessageBuilder::start("/x").add_int32(9).finish(0.0, true);
        let mut reader = MessageReader::start(&msg);
        assert_eq!(reader.get_next('f').unwrap(), Value::Float(9.0));
        assert_eq!(reader.remaining(), 0);
    }
}
