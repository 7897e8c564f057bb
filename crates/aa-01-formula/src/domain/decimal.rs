//! # Decimal Numbers
//!
//! Every number a formula touches is a [`Decimal`]: 15 significant digits,
//! rounded half-to-even after each operation. Magnitudes whose leading digit
//! sits above 1e308 are not finite and fail the operation; magnitudes below
//! 1e-324 flush to zero.
//!
//! Transcendental functions (`ln`, fractional powers) run in 30-digit
//! fixed point on `U256` before rounding back to 15 digits.

#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss
)]

use primitive_types::U256;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Number of significant digits kept.
pub const PRECISION: u32 = 15;

const MAX_ADJUSTED_EXP: i32 = 308;
const MIN_ADJUSTED_EXP: i32 = -324;

/// Digits of the fixed-point scale used by `ln` and `pow`.
const FX_DIGITS: u32 = 30;

/// ln(2) scaled by 10^30.
const LN2_FX: u128 = 693_147_180_559_945_309_417_232_121_458;

/// ln(10) scaled by 10^30.
const LN10_FX: u128 = 2_302_585_092_994_045_684_017_991_454_684;

/// Errors produced by decimal arithmetic.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecimalError {
    /// The result is outside the representable range.
    #[error("result is not finite")]
    NotFinite,

    /// Division or modulo by zero.
    #[error("division by zero")]
    DivisionByZero,

    /// The operation is undefined for its operands.
    #[error("{0}")]
    Invalid(&'static str),

    /// A string is not a decimal literal.
    #[error("not a number: {0}")]
    Parse(String),
}

/// Rounding direction for [`Decimal::round_dp`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundingMode {
    /// Nearest, ties to even.
    HalfEven,
    /// Towards negative infinity.
    Floor,
    /// Towards positive infinity.
    Ceil,
    /// Towards zero.
    Truncate,
}

/// A finite decimal number with 15 significant digits.
///
/// Always normalized: zero is `{false, 0, 0}` and a non-zero coefficient has
/// no trailing zeros, so derived equality is numeric equality.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Decimal {
    neg: bool,
    coef: u64,
    exp: i32,
}

// =============================================================================
// CONSTRUCTION
// =============================================================================

impl Decimal {
    /// 0
    pub const ZERO: Decimal = Decimal { neg: false, coef: 0, exp: 0 };
    /// 1
    pub const ONE: Decimal = Decimal { neg: false, coef: 1, exp: 0 };
    /// π rounded to 15 digits.
    pub const PI: Decimal = Decimal { neg: false, coef: 314_159_265_358_979, exp: -14 };
    /// e rounded to 15 digits.
    pub const E: Decimal = Decimal { neg: false, coef: 271_828_182_845_905, exp: -14 };

    fn finish(neg: bool, mut coef: u64, mut exp: i32) -> Result<Self, DecimalError> {
        if coef == 0 {
            return Ok(Self::ZERO);
        }
        while coef % 10 == 0 {
            coef /= 10;
            exp += 1;
        }
        let adjusted = exp + digits(u128::from(coef)) as i32 - 1;
        if adjusted > MAX_ADJUSTED_EXP {
            return Err(DecimalError::NotFinite);
        }
        if adjusted < MIN_ADJUSTED_EXP {
            return Ok(Self::ZERO);
        }
        Ok(Self { neg, coef, exp })
    }

    /// Rounds an exact-or-sticky magnitude to 15 digits, half-to-even.
    ///
    /// `sticky` marks a non-zero remainder below the last digit of `c`.
    fn round_from(neg: bool, mut c: u128, mut exp: i32, sticky: bool) -> Result<Self, DecimalError> {
        if c == 0 {
            return Ok(Self::ZERO);
        }
        let d = digits(c);
        if d > PRECISION {
            let drop = d - PRECISION;
            let div = pow10(drop);
            let (q, r) = (c / div, c % div);
            let half = div / 2;
            let up = r > half || (r == half && (sticky || q % 2 == 1));
            c = q + u128::from(up);
            exp += drop as i32;
            if c == pow10(PRECISION) {
                c /= 10;
                exp += 1;
            }
        }
        Self::finish(neg, c as u64, exp)
    }

    /// Exact conversion from an integer (rounded if it has more than 15 digits).
    #[must_use]
    pub fn from_i64(v: i64) -> Self {
        Self::round_from(v < 0, u128::from(v.unsigned_abs()), 0, false).unwrap_or(Self::ZERO)
    }

    /// Parses a string only if it has the strict numeric shape
    /// `-?digits(.digits)?(e[+-]?digits)?`.
    #[must_use]
    pub fn parse_strict(s: &str) -> Option<Self> {
        if !is_numeric_literal(s) {
            return None;
        }
        s.parse().ok()
    }
}

impl From<i64> for Decimal {
    fn from(v: i64) -> Self {
        Self::from_i64(v)
    }
}

impl From<u32> for Decimal {
    fn from(v: u32) -> Self {
        Self::from_i64(i64::from(v))
    }
}

impl Default for Decimal {
    fn default() -> Self {
        Self::ZERO
    }
}

// =============================================================================
// INSPECTION
// =============================================================================

impl Decimal {
    /// Whether the value is zero.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.coef == 0
    }

    /// Whether the value is strictly negative.
    #[must_use]
    pub fn is_negative(&self) -> bool {
        self.neg
    }

    /// Whether the value has no fractional part.
    #[must_use]
    pub fn is_integer(&self) -> bool {
        self.coef == 0 || self.exp >= 0
    }

    /// The value as an `i64`, if it is an integer in range.
    #[must_use]
    pub fn to_i64(&self) -> Option<i64> {
        if !self.is_integer() {
            return None;
        }
        if self.exp > 18 {
            return None;
        }
        let magnitude = u128::from(self.coef) * pow10(self.exp as u32);
        let magnitude = i64::try_from(magnitude).ok()?;
        Some(if self.neg { -magnitude } else { magnitude })
    }

    /// JSON number for this value: an integer when exact, a float otherwise.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        if let Some(i) = self.to_i64() {
            return serde_json::Value::from(i);
        }
        let f: f64 = self.to_string().parse().unwrap_or(0.0);
        serde_json::Number::from_f64(f).map_or(serde_json::Value::Null, serde_json::Value::Number)
    }

    /// Absolute value.
    #[must_use]
    pub fn abs(self) -> Self {
        Self { neg: false, ..self }
    }

    /// Negation.
    #[must_use]
    pub fn negate(self) -> Self {
        if self.coef == 0 {
            self
        } else {
            Self { neg: !self.neg, ..self }
        }
    }

    fn adjusted_exp(&self) -> i32 {
        self.exp + digits(u128::from(self.coef)) as i32 - 1
    }
}

// =============================================================================
// ARITHMETIC
// =============================================================================

impl Decimal {
    /// `self + other`
    ///
    /// # Errors
    ///
    /// `DecimalError::NotFinite` on overflow.
    pub fn checked_add(self, other: Self) -> Result<Self, DecimalError> {
        if self.coef == 0 {
            return Ok(other);
        }
        if other.coef == 0 {
            return Ok(self);
        }
        let (hi, lo) = if self.exp >= other.exp { (self, other) } else { (other, self) };
        let shift = (hi.exp - lo.exp) as u32;

        if shift <= 22 {
            let a = u128::from(hi.coef) * pow10(shift);
            let b = u128::from(lo.coef);
            if hi.neg == lo.neg {
                return Self::round_from(hi.neg, a + b, lo.exp, false);
            }
            return if a >= b {
                Self::round_from(hi.neg, a - b, lo.exp, false)
            } else {
                Self::round_from(lo.neg, b - a, lo.exp, false)
            };
        }

        // `lo` only reaches the last few guard digits of `hi`.
        let k = shift - 22;
        let hi_c = u128::from(hi.coef) * pow10(22);
        let (lo_int, rem) = if k >= 16 {
            (0, true)
        } else {
            let d = pow10(k);
            (u128::from(lo.coef) / d, u128::from(lo.coef) % d != 0)
        };
        let exp = hi.exp - 22;
        if hi.neg == lo.neg {
            Self::round_from(hi.neg, hi_c + lo_int, exp, rem)
        } else {
            let c = hi_c - lo_int - u128::from(rem);
            Self::round_from(hi.neg, c, exp, rem)
        }
    }

    /// `self - other`
    ///
    /// # Errors
    ///
    /// `DecimalError::NotFinite` on overflow.
    pub fn checked_sub(self, other: Self) -> Result<Self, DecimalError> {
        self.checked_add(other.negate())
    }

    /// `self * other`
    ///
    /// # Errors
    ///
    /// `DecimalError::NotFinite` on overflow.
    pub fn checked_mul(self, other: Self) -> Result<Self, DecimalError> {
        if self.coef == 0 || other.coef == 0 {
            return Ok(Self::ZERO);
        }
        let c = u128::from(self.coef) * u128::from(other.coef);
        Self::round_from(self.neg ^ other.neg, c, self.exp + other.exp, false)
    }

    /// `self / other`
    ///
    /// # Errors
    ///
    /// `DecimalError::DivisionByZero` or `DecimalError::NotFinite`.
    pub fn checked_div(self, other: Self) -> Result<Self, DecimalError> {
        if other.coef == 0 {
            return Err(DecimalError::DivisionByZero);
        }
        if self.coef == 0 {
            return Ok(Self::ZERO);
        }
        let pad = PRECISION - digits(u128::from(self.coef));
        let num = u128::from(self.coef) * pow10(pad + 22);
        let den = u128::from(other.coef);
        let (q, r) = (num / den, num % den);
        Self::round_from(
            self.neg ^ other.neg,
            q,
            self.exp - pad as i32 - 22 - other.exp,
            r != 0,
        )
    }

    /// Exact remainder of truncated division; takes the sign of `self`.
    ///
    /// # Errors
    ///
    /// `DecimalError::DivisionByZero` when `other` is zero.
    pub fn checked_rem(self, other: Self) -> Result<Self, DecimalError> {
        if other.coef == 0 {
            return Err(DecimalError::DivisionByZero);
        }
        if self.coef == 0 {
            return Ok(Self::ZERO);
        }
        let (coef, exp) = if self.exp >= other.exp {
            let m = u128::from(other.coef);
            let d = (self.exp - other.exp) as u32;
            let r = (u128::from(self.coef) % m) * pow10_mod(d, m) % m;
            (r, other.exp)
        } else {
            let d = (other.exp - self.exp) as u32;
            if d >= 16 {
                return Ok(self);
            }
            let m = u128::from(other.coef) * pow10(d);
            (u128::from(self.coef) % m, self.exp)
        };
        Self::finish(self.neg, coef as u64, exp)
    }

    /// Rounds to `places` decimal places in the given direction.
    ///
    /// # Errors
    ///
    /// `DecimalError::NotFinite` if rounding up overflows.
    pub fn round_dp(self, places: u32, mode: RoundingMode) -> Result<Self, DecimalError> {
        let target = -(places as i32);
        if self.coef == 0 || self.exp >= target {
            return Ok(self);
        }
        let drop = (target - self.exp) as u32;
        let (q, vs_half, inexact) = if drop > 20 {
            (0u128, Ordering::Less, true)
        } else {
            let div = pow10(drop);
            let c = u128::from(self.coef);
            (c / div, (c % div).cmp(&(div / 2)), c % div != 0)
        };
        let up = match mode {
            RoundingMode::HalfEven => {
                vs_half == Ordering::Greater || (vs_half == Ordering::Equal && q % 2 == 1)
            }
            RoundingMode::Floor => self.neg && inexact,
            RoundingMode::Ceil => !self.neg && inexact,
            RoundingMode::Truncate => false,
        };
        Self::round_from(self.neg, q + u128::from(up), target, false)
    }

    /// Square root.
    ///
    /// # Errors
    ///
    /// `DecimalError::Invalid` for negative input.
    pub fn sqrt(self) -> Result<Self, DecimalError> {
        if self.neg {
            return Err(DecimalError::Invalid("sqrt of a negative number"));
        }
        if self.coef == 0 {
            return Ok(Self::ZERO);
        }
        let d = digits(u128::from(self.coef));
        let mut k = 32 - d as i32;
        if (self.exp - k).rem_euclid(2) != 0 {
            k += 1;
        }
        let n = u128::from(self.coef) * pow10(k as u32);
        let root = isqrt(n);
        Self::round_from(false, root, (self.exp - k) / 2, root * root != n)
    }

    /// Natural logarithm.
    ///
    /// # Errors
    ///
    /// `DecimalError::Invalid` for non-positive input.
    pub fn ln(self) -> Result<Self, DecimalError> {
        if self.neg || self.coef == 0 {
            return Err(DecimalError::Invalid("ln of a non-positive number"));
        }
        let l = ln_fx(self);
        Self::round_from(l.neg, l.mag.low_u128(), -(FX_DIGITS as i32), false)
    }

    /// e raised to this value.
    ///
    /// # Errors
    ///
    /// `DecimalError::NotFinite` on overflow.
    pub fn exp(self) -> Result<Self, DecimalError> {
        let one = Fx { neg: false, mag: fx_scale() };
        match mul_decimal_fx(self, one) {
            Some(t) => exp_fx(t),
            None if self.neg => Ok(Self::ZERO),
            None => Err(DecimalError::NotFinite),
        }
    }

    /// `self ^ y`. Integer exponents are computed by squaring in extended
    /// precision; fractional ones as `exp(y * ln(self))`.
    ///
    /// # Errors
    ///
    /// `DecimalError::NotFinite`, `DecimalError::DivisionByZero` for `0 ^ -n`,
    /// `DecimalError::Invalid` for a fractional power of a negative number.
    pub fn checked_pow(self, y: Self) -> Result<Self, DecimalError> {
        if y.coef == 0 {
            return Ok(Self::ONE);
        }
        if self.coef == 0 {
            return if y.neg { Err(DecimalError::DivisionByZero) } else { Ok(Self::ZERO) };
        }
        if y.is_integer() {
            if let Some(n) = y.to_i64() {
                return self.pow_int(n);
            }
            // Integers too large for i64 are multiples of ten, hence even.
            return self.abs().pow_general(y);
        }
        if self.neg {
            return Err(DecimalError::Invalid("fractional power of a negative number"));
        }
        self.pow_general(y)
    }

    fn pow_general(self, y: Self) -> Result<Self, DecimalError> {
        let l = ln_fx(self);
        match mul_decimal_fx(y, l) {
            Some(t) => exp_fx(t),
            None if y.neg != l.neg => Ok(Self::ZERO),
            None => Err(DecimalError::NotFinite),
        }
    }

    fn pow_int(self, n: i64) -> Result<Self, DecimalError> {
        let mut result = Ext::one();
        let mut base = Ext::from_decimal(self.abs());
        let mut e = n.unsigned_abs();
        let magnitude = loop {
            if e & 1 == 1 {
                result = match result.mul(&base) {
                    Ok(r) => r,
                    Err(DecimalError::NotFinite) if n < 0 => return Ok(Self::ZERO),
                    Err(err) => return Err(err),
                };
            }
            e >>= 1;
            if e == 0 {
                break result.to_decimal()?;
            }
            base = match base.mul(&base) {
                Ok(b) => b,
                Err(DecimalError::NotFinite) if n < 0 => return Ok(Self::ZERO),
                Err(err) => return Err(err),
            };
        };
        let signed = if self.neg && n % 2 != 0 { magnitude.negate() } else { magnitude };
        if n < 0 {
            Self::ONE.checked_div(signed).map_err(|_| DecimalError::NotFinite)
        } else {
            Ok(signed)
        }
    }

    /// `sqrt(self^2 + other^2)`
    ///
    /// # Errors
    ///
    /// `DecimalError::NotFinite` on overflow.
    pub fn hypot(self, other: Self) -> Result<Self, DecimalError> {
        self.checked_mul(self)?.checked_add(other.checked_mul(other)?)?.sqrt()
    }
}

// =============================================================================
// ORDERING
// =============================================================================

impl Ord for Decimal {
    fn cmp(&self, other: &Self) -> Ordering {
        let sign = |d: &Decimal| match (d.coef == 0, d.neg) {
            (true, _) => 0i8,
            (false, true) => -1,
            (false, false) => 1,
        };
        let (s1, s2) = (sign(self), sign(other));
        if s1 != s2 || s1 == 0 {
            return s1.cmp(&s2);
        }
        let magnitude = {
            let (e1, e2) = (self.adjusted_exp(), other.adjusted_exp());
            if e1 == e2 {
                let c1 = u128::from(self.coef) * pow10(PRECISION - digits(u128::from(self.coef)));
                let c2 = u128::from(other.coef) * pow10(PRECISION - digits(u128::from(other.coef)));
                c1.cmp(&c2)
            } else {
                e1.cmp(&e2)
            }
        };
        if self.neg {
            magnitude.reverse()
        } else {
            magnitude
        }
    }
}

impl PartialOrd for Decimal {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// =============================================================================
// TEXT
// =============================================================================

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.coef == 0 {
            return f.write_str("0");
        }
        let digits = self.coef.to_string();
        let n = digits.len() as i32;
        let adjusted = self.exp + n - 1;
        let mut out = String::with_capacity(24);
        if self.neg {
            out.push('-');
        }
        if adjusted >= 21 || adjusted <= -7 {
            out.push_str(&digits[..1]);
            if n > 1 {
                out.push('.');
                out.push_str(&digits[1..]);
            }
            out.push('e');
            out.push(if adjusted > 0 { '+' } else { '-' });
            out.push_str(&adjusted.abs().to_string());
        } else if self.exp >= 0 {
            out.push_str(&digits);
            out.extend(std::iter::repeat('0').take(self.exp as usize));
        } else if adjusted >= 0 {
            let point = (adjusted + 1) as usize;
            out.push_str(&digits[..point]);
            out.push('.');
            out.push_str(&digits[point..]);
        } else {
            out.push_str("0.");
            out.extend(std::iter::repeat('0').take((-adjusted - 1) as usize));
            out.push_str(&digits);
        }
        f.write_str(&out)
    }
}

impl fmt::Debug for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Decimal({self})")
    }
}

/// Digit accumulator for parsing.
struct Accumulator {
    coef: u128,
    exp: i64,
    significant: u32,
    sticky: bool,
}

impl Accumulator {
    fn push(&mut self, digit: u8, fractional: bool) {
        if self.coef == 0 && digit == 0 {
            if fractional {
                self.exp -= 1;
            }
            return;
        }
        if self.significant < 38 {
            self.coef = self.coef * 10 + u128::from(digit);
            self.significant += 1;
            if fractional {
                self.exp -= 1;
            }
        } else {
            self.sticky |= digit != 0;
            if !fractional {
                self.exp += 1;
            }
        }
    }
}

impl FromStr for Decimal {
    type Err = DecimalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || DecimalError::Parse(s.to_string());
        let bytes = s.as_bytes();
        let mut i = 0;
        let neg = match bytes.first() {
            Some(b'-') => {
                i = 1;
                true
            }
            Some(b'+') => {
                i = 1;
                false
            }
            _ => false,
        };

        let mut acc = Accumulator { coef: 0, exp: 0, significant: 0, sticky: false };
        let mut any_digit = false;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            acc.push(bytes[i] - b'0', false);
            any_digit = true;
            i += 1;
        }
        if i < bytes.len() && bytes[i] == b'.' {
            i += 1;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                acc.push(bytes[i] - b'0', true);
                any_digit = true;
                i += 1;
            }
        }
        if !any_digit {
            return Err(err());
        }
        if i < bytes.len() && (bytes[i] == b'e' || bytes[i] == b'E') {
            i += 1;
            let exp_neg = match bytes.get(i) {
                Some(b'-') => {
                    i += 1;
                    true
                }
                Some(b'+') => {
                    i += 1;
                    false
                }
                _ => false,
            };
            let start = i;
            let mut e: i64 = 0;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                e = e.saturating_mul(10).saturating_add(i64::from(bytes[i] - b'0'));
                i += 1;
            }
            if i == start {
                return Err(err());
            }
            acc.exp = acc.exp.saturating_add(if exp_neg { -e } else { e });
        }
        if i != bytes.len() {
            return Err(err());
        }
        if acc.coef == 0 {
            return Ok(Self::ZERO);
        }
        match i32::try_from(acc.exp) {
            Ok(exp) if (-2000..=2000).contains(&exp) => Self::round_from(neg, acc.coef, exp, acc.sticky),
            _ if acc.exp > 0 => Err(DecimalError::NotFinite),
            _ => Ok(Self::ZERO),
        }
    }
}

/// Whether `s` has the strict shape `-?digits(.digits)?(e[+-]?digits)?`.
#[must_use]
pub fn is_numeric_literal(s: &str) -> bool {
    let b = s.as_bytes();
    let mut i = usize::from(b.first() == Some(&b'-'));
    let digits_from = |i: &mut usize| {
        let start = *i;
        while *i < b.len() && b[*i].is_ascii_digit() {
            *i += 1;
        }
        *i > start
    };
    if !digits_from(&mut i) {
        return false;
    }
    if i < b.len() && b[i] == b'.' {
        i += 1;
        if !digits_from(&mut i) {
            return false;
        }
    }
    if i < b.len() && (b[i] == b'e' || b[i] == b'E') {
        i += 1;
        if i < b.len() && (b[i] == b'+' || b[i] == b'-') {
            i += 1;
        }
        if !digits_from(&mut i) {
            return false;
        }
    }
    i == b.len()
}

impl Serialize for Decimal {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Decimal {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::Error;
        match serde_json::Value::deserialize(deserializer)? {
            serde_json::Value::String(s) => s.parse().map_err(D::Error::custom),
            serde_json::Value::Number(n) => n.to_string().parse().map_err(D::Error::custom),
            other => Err(D::Error::custom(format!("expected a decimal, got {other}"))),
        }
    }
}

// =============================================================================
// EXTENDED PRECISION HELPERS
// =============================================================================

fn pow10(n: u32) -> u128 {
    10u128.pow(n)
}

fn digits(mut c: u128) -> u32 {
    let mut d = 1;
    while c >= 10 {
        c /= 10;
        d += 1;
    }
    d
}

fn pow10_mod(mut e: u32, m: u128) -> u128 {
    let mut result = 1 % m;
    let mut base = 10 % m;
    while e > 0 {
        if e & 1 == 1 {
            result = result * base % m;
        }
        base = base * base % m;
        e >>= 1;
    }
    result
}

fn isqrt(n: u128) -> u128 {
    if n < 2 {
        return n;
    }
    let mut x = (n as f64).sqrt() as u128;
    while x * x > n {
        x -= 1;
    }
    while (x + 1) * (x + 1) <= n {
        x += 1;
    }
    x
}

fn fx_scale() -> U256 {
    U256::exp10(FX_DIGITS as usize)
}

/// Mantissa with 30 significant digits, for integer powers.
struct Ext {
    coef: U256,
    exp: i64,
    sticky: bool,
}

impl Ext {
    fn one() -> Self {
        Self { coef: U256::one(), exp: 0, sticky: false }
    }

    fn from_decimal(d: Decimal) -> Self {
        Self { coef: U256::from(d.coef), exp: i64::from(d.exp), sticky: false }
    }

    fn mul(&self, other: &Self) -> Result<Self, DecimalError> {
        let mut coef = self.coef * other.coef;
        let mut exp = self.exp + other.exp;
        let mut sticky = self.sticky || other.sticky;
        let limit = U256::exp10(FX_DIGITS as usize);
        if coef >= limit {
            let mut d = FX_DIGITS;
            let mut p = limit;
            while d < 76 && coef >= p * 10 {
                p = p * 10;
                d += 1;
            }
            let drop = U256::exp10((d + 1 - FX_DIGITS) as usize);
            sticky |= !(coef % drop).is_zero();
            coef = coef / drop;
            exp += i64::from(d + 1 - FX_DIGITS);
        }
        let adjusted = exp + i64::from(FX_DIGITS);
        if adjusted > 400 {
            return Err(DecimalError::NotFinite);
        }
        if adjusted < -400 {
            return Ok(Self { coef: U256::zero(), exp: 0, sticky: false });
        }
        Ok(Self { coef, exp, sticky })
    }

    fn to_decimal(&self) -> Result<Decimal, DecimalError> {
        if self.coef.is_zero() {
            return Ok(Decimal::ZERO);
        }
        let exp = i32::try_from(self.exp).map_err(|_| DecimalError::NotFinite)?;
        Decimal::round_from(false, self.coef.low_u128(), exp, self.sticky)
    }
}

/// Signed fixed-point number scaled by 10^30.
#[derive(Clone, Copy)]
struct Fx {
    neg: bool,
    mag: U256,
}

impl Fx {
    fn add(self, other: Fx) -> Fx {
        if self.neg == other.neg {
            return Fx { neg: self.neg, mag: self.mag + other.mag };
        }
        if self.mag >= other.mag {
            Fx { neg: self.neg, mag: self.mag - other.mag }
        } else {
            Fx { neg: other.neg, mag: other.mag - self.mag }
        }
    }
}

/// ln(x) for x > 0 in fixed point.
fn ln_fx(x: Decimal) -> Fx {
    let s = fx_scale();
    let d = digits(u128::from(x.coef));
    let k = x.exp + d as i32 - 1;
    let mut m = U256::from(x.coef) * U256::exp10((FX_DIGITS + 1 - d) as usize);

    let upper = s * 3 / 2;
    let mut halvings = 0u32;
    while m > upper {
        m = m / 2;
        halvings += 1;
    }

    // atanh series: ln(m) = 2 * (z + z^3/3 + z^5/5 + ...), z = (m-1)/(m+1)
    let (z_neg, z_num) = if m >= s { (false, m - s) } else { (true, s - m) };
    let z = z_num * s / (m + s);
    let z2 = z * z / s;
    let mut sum = z;
    let mut term = z;
    let mut n = 1u64;
    loop {
        term = term * z2 / s;
        n += 2;
        let t = term / n;
        if t.is_zero() {
            break;
        }
        sum = sum + t;
    }
    let ln_m = Fx { neg: z_neg, mag: sum * 2 };
    let ln2_part = Fx { neg: false, mag: U256::from(LN2_FX) * halvings };
    let ln10_part = Fx { neg: k < 0, mag: U256::from(LN10_FX) * k.unsigned_abs() };
    ln_m.add(ln2_part).add(ln10_part)
}

/// `y * l` where `y` is a decimal and `l` is fixed point; `None` when the
/// magnitude is beyond what `exp` can represent.
fn mul_decimal_fx(y: Decimal, l: Fx) -> Option<Fx> {
    let s = fx_scale();
    let limit = s * 1000;
    let p = U256::from(y.coef) * l.mag;
    let neg = y.neg != l.neg;
    if p.is_zero() {
        return Some(Fx { neg: false, mag: p });
    }
    let mag = if y.exp >= 0 {
        if y.exp > 40 {
            return None;
        }
        let f = U256::exp10(y.exp as usize);
        if p > limit / f {
            return None;
        }
        p * f
    } else {
        let e = -y.exp;
        if e > 70 {
            U256::zero()
        } else {
            p / U256::exp10(e as usize)
        }
    };
    if mag > limit {
        return None;
    }
    Some(Fx { neg, mag })
}

/// e^t for |t| <= 1000 in fixed point.
fn exp_fx(t: Fx) -> Result<Decimal, DecimalError> {
    let s = fx_scale();
    let ln10 = U256::from(LN10_FX);
    let (q, r) = (t.mag / ln10, t.mag % ln10);
    let q = q.low_u32() as i32;
    let (k, r) = if !t.neg {
        (q, r)
    } else if r.is_zero() {
        (-q, r)
    } else {
        (-q - 1, ln10 - r)
    };

    // e^r with r in [0, ln 10): reduce by 2^8 and square back
    let x = r / 256;
    let mut sum = s;
    let mut term = s;
    let mut n = 1u64;
    loop {
        term = term * x / s / n;
        if term.is_zero() {
            break;
        }
        sum = sum + term;
        n += 1;
    }
    for _ in 0..8 {
        sum = sum * sum / s;
    }
    Decimal::round_from(false, sum.low_u128(), k - FX_DIGITS as i32, false)
}

// =============================================================================
// TESTS
// =============================================================================
