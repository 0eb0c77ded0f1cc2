use byteorder::{BigEndian, ReadBytesExt};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde_json::Value;
use std::error::Error;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tokio_postgres::types::{FromSql, Kind, Type};

type BoxError = Box<dyn Error + Sync + Send>;

const NUMERIC_NEG: u16 = 0x4000;
const NUMERIC_NAN: u16 = 0xC000;
const NUMERIC_PINF: u16 = 0xD000;
const NUMERIC_NINF: u16 = 0xF000;

/// A column value decoded from PostgreSQL's binary format into JSON.
///
/// Accepts every column type. Types without a JSON counterpart keep the text
/// PostgreSQL itself would print, and unknown types fall back to their raw
/// text, or `\x` hex when the payload is not UTF-8.
#[derive(Debug, Clone, PartialEq)]
pub struct PgValue(pub Value);

impl<'a> FromSql<'a> for PgValue {
    fn from_sql(ty: &Type, raw: &'a [u8]) -> Result<Self, BoxError> {
        decode(ty, raw).map(PgValue)
    }

    fn from_sql_null(_: &Type) -> Result<Self, BoxError> {
        Ok(PgValue(Value::Null))
    }

    fn accepts(_: &Type) -> bool {
        true
    }
}

/// Decode one non-null binary value of type `ty`
pub fn decode(ty: &Type, raw: &[u8]) -> Result<Value, BoxError> {
    match ty.kind() {
        Kind::Array(element) => return decode_array(element, raw),
        Kind::Domain(inner) => return decode(inner, raw),
        Kind::Enum(_) => return Ok(text_fallback(raw)),
        _ => {}
    }

    let value = if *ty == Type::BOOL {
        Value::Bool(bool::from_sql(ty, raw)?)
    } else if *ty == Type::INT2 {
        Value::from(i16::from_sql(ty, raw)?)
    } else if *ty == Type::INT4 {
        Value::from(i32::from_sql(ty, raw)?)
    } else if *ty == Type::INT8 {
        Value::from(i64::from_sql(ty, raw)?)
    } else if *ty == Type::OID {
        Value::from(u32::from_sql(ty, raw)?)
    } else if *ty == Type::FLOAT4 {
        float_value(f64::from(f32::from_sql(ty, raw)?))
    } else if *ty == Type::FLOAT8 {
        float_value(f64::from_sql(ty, raw)?)
    } else if *ty == Type::NUMERIC {
        Value::String(numeric_text(raw)?)
    } else if *ty == Type::MONEY {
        Value::String(money_text(i64::from_sql(&Type::INT8, raw)?))
    } else if *ty == Type::BYTEA {
        Value::String(bytes_to_text(raw))
    } else if *ty == Type::JSON || *ty == Type::JSONB {
        Value::from_sql(ty, raw)?
    } else if *ty == Type::UUID {
        Value::String(uuid::Uuid::from_sql(ty, raw)?.to_string())
    } else if *ty == Type::TIMESTAMP {
        match infinity_i64(raw) {
            Some(text) => Value::from(text),
            None => Value::String(timestamp_text(&NaiveDateTime::from_sql(ty, raw)?)),
        }
    } else if *ty == Type::TIMESTAMPTZ {
        match infinity_i64(raw) {
            Some(text) => Value::from(text),
            None => Value::String(DateTime::<Utc>::from_sql(ty, raw)?.to_rfc3339()),
        }
    } else if *ty == Type::DATE {
        match infinity_i32(raw) {
            Some(text) => Value::from(text),
            None => Value::String(NaiveDate::from_sql(ty, raw)?.to_string()),
        }
    } else if *ty == Type::TIME {
        Value::String(NaiveTime::from_sql(ty, raw)?.to_string())
    } else if *ty == Type::TIMETZ {
        Value::String(timetz_text(raw)?)
    } else if *ty == Type::INTERVAL {
        Value::String(interval_text(raw)?)
    } else if *ty == Type::INET || *ty == Type::CIDR {
        Value::String(inet_text(raw, *ty == Type::CIDR)?)
    } else if *ty == Type::CHAR {
        Value::String(char_text(raw))
    } else {
        // text, varchar, bpchar, name, xml and types this decoder does not know
        text_fallback(raw)
    };
    Ok(value)
}

fn float_value(v: f64) -> Value {
    if v.is_finite() {
        Value::from(v)
    } else if v.is_nan() {
        Value::from("NaN")
    } else if v > 0.0 {
        Value::from("Infinity")
    } else {
        Value::from("-Infinity")
    }
}

fn text_fallback(raw: &[u8]) -> Value {
    match std::str::from_utf8(raw) {
        Ok(text) => Value::String(text.to_string()),
        Err(_) => Value::String(format!("\\x{}", hex::encode(raw))),
    }
}

pub(crate) fn bytes_to_text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

pub(crate) fn timestamp_text(ts: &NaiveDateTime) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.f").to_string()
}

fn infinity_i64(raw: &[u8]) -> Option<&'static str> {
    match (&raw[..]).read_i64::<BigEndian>().ok()? {
        i64::MAX => Some("infinity"),
        i64::MIN => Some("-infinity"),
        _ => None,
    }
}

fn infinity_i32(raw: &[u8]) -> Option<&'static str> {
    match (&raw[..]).read_i32::<BigEndian>().ok()? {
        i32::MAX => Some("infinity"),
        i32::MIN => Some("-infinity"),
        _ => None,
    }
}

/// Exact decimal text of a binary NUMERIC, at any precision.
///
/// The payload is a header (digit count, weight of the first digit, sign,
/// display scale) followed by base-10000 digits.
pub fn numeric_text(raw: &[u8]) -> Result<String, BoxError> {
    let mut buf = raw;
    let ndigits = buf.read_i16::<BigEndian>()?;
    let weight = i32::from(buf.read_i16::<BigEndian>()?);
    let sign = buf.read_u16::<BigEndian>()?;
    let dscale = buf.read_i16::<BigEndian>()?;

    match sign {
        NUMERIC_NAN => return Ok("NaN".to_string()),
        NUMERIC_PINF => return Ok("Infinity".to_string()),
        NUMERIC_NINF => return Ok("-Infinity".to_string()),
        _ => {}
    }
    if ndigits < 0 || dscale < 0 {
        return Err("invalid numeric header".into());
    }

    let mut digits = Vec::with_capacity(ndigits as usize);
    for _ in 0..ndigits {
        let digit = buf.read_i16::<BigEndian>()?;
        if !(0..10000).contains(&digit) {
            return Err(format!("invalid numeric digit {digit}").into());
        }
        digits.push(digit);
    }
    let digit = |i: i32| -> i16 {
        usize::try_from(i)
            .ok()
            .and_then(|i| digits.get(i).copied())
            .unwrap_or(0)
    };

    let mut text = String::new();
    if sign == NUMERIC_NEG {
        text.push('-');
    }
    if weight < 0 {
        text.push('0');
    } else {
        for i in 0..=weight {
            if i == 0 {
                text.push_str(&digit(i).to_string());
            } else {
                text.push_str(&format!("{:04}", digit(i)));
            }
        }
    }

    let dscale = dscale as usize;
    if dscale > 0 {
        let mut fraction = String::with_capacity(dscale + 4);
        let mut i = weight + 1;
        while fraction.len() < dscale {
            fraction.push_str(&format!("{:04}", digit(i)));
            i += 1;
        }
        fraction.truncate(dscale);
        text.push('.');
        text.push_str(&fraction);
    }
    Ok(text)
}

fn money_text(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let cents = cents.unsigned_abs();
    format!("{sign}{}.{:02}", cents / 100, cents % 100)
}

fn plural(n: i32, unit: &str) -> String {
    if n == 1 {
        format!("{n} {unit}")
    } else {
        format!("{n} {unit}s")
    }
}

fn clock_text(micros: u64) -> String {
    let hours = micros / 3_600_000_000;
    let minutes = micros / 60_000_000 % 60;
    let seconds = micros / 1_000_000 % 60;
    let fraction = micros % 1_000_000;
    let mut text = format!("{hours:02}:{minutes:02}:{seconds:02}");
    if fraction != 0 {
        text.push('.');
        text.push_str(format!("{fraction:06}").trim_end_matches('0'));
    }
    text
}

/// INTERVAL in PostgreSQL's default output style, e.g. `1 year 2 mons 3 days 04:05:06.5`
pub fn interval_text(raw: &[u8]) -> Result<String, BoxError> {
    let mut buf = raw;
    let micros = buf.read_i64::<BigEndian>()?;
    let days = buf.read_i32::<BigEndian>()?;
    let months = buf.read_i32::<BigEndian>()?;

    let mut parts = Vec::new();
    if months / 12 != 0 {
        parts.push(plural(months / 12, "year"));
    }
    if months % 12 != 0 {
        parts.push(plural(months % 12, "mon"));
    }
    if days != 0 {
        parts.push(plural(days, "day"));
    }
    if micros != 0 || parts.is_empty() {
        let sign = if micros < 0 { "-" } else { "" };
        parts.push(format!("{sign}{}", clock_text(micros.unsigned_abs())));
    }
    Ok(parts.join(" "))
}

fn timetz_text(raw: &[u8]) -> Result<String, BoxError> {
    let mut buf = raw;
    let micros = buf.read_i64::<BigEndian>()?;
    // Stored as seconds west of UTC
    let offset = buf.read_i32::<BigEndian>()?.saturating_neg();

    let micros = u64::try_from(micros).map_err(|_| "invalid timetz")?;
    let sign = if offset < 0 { '-' } else { '+' };
    let offset = offset.unsigned_abs();
    let mut text = format!("{}{sign}{:02}", clock_text(micros), offset / 3600);
    if offset % 3600 != 0 {
        text.push_str(&format!(":{:02}", offset % 3600 / 60));
    }
    Ok(text)
}

/// INET / CIDR: family, prefix bits, cidr flag, address length, address
fn inet_text(raw: &[u8], cidr: bool) -> Result<String, BoxError> {
    if raw.len() < 4 {
        return Err("invalid inet: too short".into());
    }
    let bits = raw[1];
    let address = &raw[4..];
    let (addr, max_bits) = match address.len() {
        4 => (IpAddr::V4(Ipv4Addr::new(address[0], address[1], address[2], address[3])), 32),
        16 => {
            let octets: [u8; 16] = address.try_into()?;
            (IpAddr::V6(Ipv6Addr::from(octets)), 128)
        }
        n => return Err(format!("invalid inet address length {n}").into()),
    };
    if cidr || bits != max_bits {
        Ok(format!("{addr}/{bits}"))
    } else {
        Ok(addr.to_string())
    }
}

/// The single-byte `"char"` type; non-ASCII bytes print as octal escapes
fn char_text(raw: &[u8]) -> String {
    match raw.first() {
        None | Some(0) => String::new(),
        Some(&b) if b.is_ascii() => char::from(b).to_string(),
        Some(&b) => format!("\\{b:03o}"),
    }
}

/// Arrays become (nested) JSON arrays; lower bounds are not kept
fn decode_array(element: &Type, raw: &[u8]) -> Result<Value, BoxError> {
    let mut buf = raw;
    let ndim = buf.read_i32::<BigEndian>()?;
    let _has_nulls = buf.read_i32::<BigEndian>()?;
    let _element_oid = buf.read_u32::<BigEndian>()?;

    let mut dims = Vec::with_capacity(ndim.max(0) as usize);
    for _ in 0..ndim {
        let len = buf.read_i32::<BigEndian>()?;
        let _lower_bound = buf.read_i32::<BigEndian>()?;
        dims.push(usize::try_from(len).map_err(|_| "invalid array dimension")?);
    }
    if dims.is_empty() {
        return Ok(Value::Array(Vec::new()));
    }

    let total: usize = dims.iter().product();
    let mut elements = Vec::with_capacity(total.min(buf.len() / 4));
    for _ in 0..total {
        let len = buf.read_i32::<BigEndian>()?;
        if len < 0 {
            elements.push(Value::Null);
            continue;
        }
        let len = len as usize;
        if buf.len() < len {
            return Err("invalid array: truncated element".into());
        }
        let (item, rest) = buf.split_at(len);
        elements.push(decode(element, item)?);
        buf = rest;
    }
    Ok(nest(&dims, &mut elements.into_iter()))
}

fn nest<I: Iterator<Item = Value>>(dims: &[usize], elements: &mut I) -> Value {
    match dims.split_first() {
        Some((&len, [])) => Value::Array(elements.by_ref().take(len).collect()),
        Some((&len, inner)) => Value::Array((0..len).map(|_| nest(inner, elements)).collect()),
        None => Value::Array(Vec::new()),
    }
}
