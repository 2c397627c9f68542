//! Numeric coercion and number formatting.
//!
//! Arithmetic on strings first tries to read them as numbers: decimal
//! integers, decimal floats with exponents, hexadecimal integers (with
//! wrap-around), and hexadecimal floats. Only when parsing fails does the
//! metamethod path run.

use nocta_core::heap::Heap;
use nocta_core::string::{StringId, StringInterner};
use nocta_core::value::TValue;

/// A parsed numeric literal.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Parsed {
    Int(i64),
    Float(f64),
}

/// Numeric view of a value as f64: numbers directly, strings via parsing.
pub fn to_number(v: TValue, heap: &Heap, strings: &StringInterner) -> Option<f64> {
    if let Some(f) = v.as_float() {
        return Some(f);
    }
    if let Some(i) = v.as_full_integer(heap) {
        return Some(i as f64);
    }
    match parse_str_value(v, strings)? {
        Parsed::Int(i) => Some(i as f64),
        Parsed::Float(f) => Some(f),
    }
}

/// Integer view of a value: integers directly, floats and strings when
/// they represent an exact integer.
pub fn to_integer(v: TValue, heap: &Heap, strings: &StringInterner) -> Option<i64> {
    if let Some(i) = v.as_full_integer(heap) {
        return Some(i);
    }
    if let Some(f) = v.as_float() {
        return float_to_integer(f);
    }
    match parse_str_value(v, strings)? {
        Parsed::Int(i) => Some(i),
        Parsed::Float(f) => float_to_integer(f),
    }
}

fn parse_str_value(v: TValue, strings: &StringInterner) -> Option<Parsed> {
    let sid = v.as_string_id()?;
    let s = std::str::from_utf8(strings.get_bytes(sid)).ok()?;
    parse_number(s)
}

/// Exact float-to-integer conversion. Fails on fractional, infinite, NaN,
/// or out-of-range input.
pub fn float_to_integer(f: f64) -> Option<i64> {
    if !f.is_finite() || f.floor() != f {
        return None;
    }
    // i64::MIN is exactly representable; i64::MAX is not, so the upper
    // bound is the open interval below 2^63.
    const LOW: f64 = i64::MIN as f64;
    const HIGH: f64 = -(i64::MIN as f64); // 2^63, exact
    if !(LOW..HIGH).contains(&f) {
        return None;
    }
    Some(f as i64)
}

/// Parse a numeric literal with optional sign and surrounding whitespace.
pub fn parse_number(s: &str) -> Option<Parsed> {
    let t = s.trim();
    if t.is_empty() {
        return None;
    }
    let (neg, body) = match t.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, t.strip_prefix('+').unwrap_or(t)),
    };
    if body.starts_with(['+', '-']) {
        return None; // doubled sign
    }
    if let Some(hex) = body
        .strip_prefix("0x")
        .or_else(|| body.strip_prefix("0X"))
    {
        return parse_hex(hex, neg);
    }
    // Reject Rust-isms the language does not accept as numbers.
    let lower = body.to_ascii_lowercase();
    if lower.starts_with("inf") || lower.starts_with("nan") {
        return None;
    }
    if let Ok(i) = body.parse::<i64>() {
        return Some(Parsed::Int(if neg { i.wrapping_neg() } else { i }));
    }
    if let Ok(f) = body.parse::<f64>() {
        return Some(Parsed::Float(if neg { -f } else { f }));
    }
    None
}

/// Hexadecimal integer (wrapping modulo 2^64) or hexadecimal float with a
/// binary exponent (`0x1.8p1` = 3.0).
fn parse_hex(hex: &str, neg: bool) -> Option<Parsed> {
    if hex.is_empty() {
        return None;
    }
    if !hex.contains(['.', 'p', 'P']) {
        let mut val: u64 = 0;
        for c in hex.chars() {
            let digit = c.to_digit(16)? as u64;
            val = val.wrapping_mul(16).wrapping_add(digit);
        }
        let i = val as i64;
        return Some(Parsed::Int(if neg { i.wrapping_neg() } else { i }));
    }

    // Hex float: split off the binary exponent, then accumulate mantissa
    // digits into an f64 with a separate base-2 exponent so arbitrarily
    // long mantissas cannot overflow an integer accumulator.
    let (mantissa, exp) = match hex.find(['p', 'P']) {
        Some(p) => (&hex[..p], hex[p + 1..].parse::<i64>().ok()?),
        None => (hex, 0),
    };
    let (int_part, frac_part) = match mantissa.find('.') {
        Some(d) => (&mantissa[..d], &mantissa[d + 1..]),
        None => (mantissa, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }

    let mut value = 0.0f64;
    let mut bin_exp = exp;
    let mut push_digit = |value: &mut f64, bin_exp: &mut i64, c: char| -> Option<()> {
        let digit = c.to_digit(16)? as f64;
        *value = *value * 16.0 + digit;
        if *value > 1e18 {
            *value /= (1u64 << 52) as f64;
            *bin_exp += 52;
        }
        Some(())
    };
    for c in int_part.chars() {
        push_digit(&mut value, &mut bin_exp, c)?;
    }
    for c in frac_part.chars() {
        push_digit(&mut value, &mut bin_exp, c)?;
        bin_exp -= 4;
    }

    // ldexp in chunks; powi takes i32 and saturates poorly past ±1023.
    while bin_exp > 1023 {
        value *= 2.0f64.powi(1023);
        bin_exp -= 1023;
    }
    while bin_exp < -1023 {
        value *= 2.0f64.powi(-1023);
        bin_exp += 1023;
    }
    value *= 2.0f64.powi(bin_exp as i32);
    Some(Parsed::Float(if neg { -value } else { value }))
}

/// Stringify a value for concatenation; numbers format, everything else
/// declines.
pub fn to_concat_string(
    v: TValue,
    heap: &Heap,
    strings: &mut StringInterner,
) -> Option<StringId> {
    if let Some(sid) = v.as_string_id() {
        return Some(sid);
    }
    if let Some(i) = v.as_full_integer(heap) {
        return Some(strings.intern_or_create(i.to_string().as_bytes()));
    }
    if let Some(f) = v.as_float() {
        return Some(strings.intern_or_create(format_float(f).as_bytes()));
    }
    None
}

/// Format a float the way the language prints numbers (%.14g).
pub fn format_float(f: f64) -> String {
    if f.is_nan() {
        return "nan".to_string();
    }
    if f.is_infinite() {
        return if f > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if f == 0.0 {
        return if f.is_sign_negative() { "-0.0" } else { "0.0" }.to_string();
    }
    let exp = f.abs().log10().floor() as i32;
    if (-4..14).contains(&exp) {
        let decimals = (13 - exp).max(0) as usize;
        let mut s = format!("{f:.decimals$}");
        if s.contains('.') {
            let trimmed = s.trim_end_matches('0');
            s = if trimmed.ends_with('.') {
                format!("{trimmed}0")
            } else {
                trimmed.to_string()
            };
        }
        s
    } else {
        // Scientific, with a C-style two-digit signed exponent and the
        // mantissa stripped of trailing zeros.
        let s = format!("{f:.13e}");
        let (mantissa, exp_str) = s.split_once('e').unwrap_or((s.as_str(), "0"));
        let exp_num: i32 = exp_str.parse().unwrap_or(0);
        let mantissa = if mantissa.contains('.') {
            let t = mantissa.trim_end_matches('0');
            if t.ends_with('.') {
                format!("{t}0")
            } else {
                t.to_string()
            }
        } else {
            mantissa.to_string()
        };
        let sign = if exp_num < 0 { '-' } else { '+' };
        format!("{mantissa}e{sign}{:02}", exp_num.abs())
    }
}
