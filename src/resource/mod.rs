//! Resource slot arithmetic.
//!
//! `ResourceSlots` is the typed, multi-dimensional quantity vector used
//! throughout admission, placement and usage accounting: CPU core counts,
//! memory/disk byte counts, and accelerator shares. All arithmetic is exact
//! decimal arithmetic — floats cannot guarantee the "never a negative
//! residual larger than one ulp" invariant this type is required to hold.

use std::collections::BTreeMap;
use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::{Error, Result};

/// The unit family a slot belongs to, used only for parsing/formatting —
/// arithmetic itself is plain decimal addition regardless of kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotKind {
    /// Discrete countable resource (vCPUs, GPU count).
    Count,
    /// Byte-denominated resource (memory, disk), accepts `k/m/g/t`-suffixed input.
    Bytes,
    /// Fractional share of a device, e.g. `0.5` of a GPU.
    Ratio,
}

/// Registry of known slot names to their kind, consulted only at
/// parse/format/normalize time.
#[derive(Debug, Clone, Default)]
pub struct KnownSlotTypes(BTreeMap<String, SlotKind>);

impl KnownSlotTypes {
    pub fn new() -> Self {
        let mut map = BTreeMap::new();
        map.insert("cpu".to_string(), SlotKind::Count);
        map.insert("mem".to_string(), SlotKind::Bytes);
        Self(map)
    }

    pub fn register(&mut self, slot: impl Into<String>, kind: SlotKind) {
        self.0.insert(slot.into(), kind);
    }

    pub fn kind_of(&self, slot: &str) -> SlotKind {
        self.0.get(slot).copied().unwrap_or(SlotKind::Ratio)
    }

    pub fn contains(&self, slot: &str) -> bool {
        self.0.contains_key(slot)
    }
}

/// A non-negative, multi-dimensional resource quantity vector.
///
/// Slots absent from the map are treated as zero. All public mutators are
/// pure (consuming `self` and returning a new value) so callers cannot
/// accidentally mutate a shared snapshot mid-tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSlots(BTreeMap<String, Decimal>);

impl ResourceSlots {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn from_pairs<I, K>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, Decimal)>,
        K: Into<String>,
    {
        Self(pairs.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn get(&self, slot: &str) -> Decimal {
        self.0.get(slot).copied().unwrap_or(Decimal::ZERO)
    }

    pub fn set(&mut self, slot: impl Into<String>, quantity: Decimal) {
        self.0.insert(slot.into(), quantity);
    }

    pub fn slots(&self) -> impl Iterator<Item = (&str, Decimal)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn is_empty_or_zero(&self) -> bool {
        self.0.values().all(|v| v.is_zero())
    }

    /// Union of keys present in `self` or `other`.
    fn key_union<'a>(&'a self, other: &'a Self) -> impl Iterator<Item = &'a str> {
        let mut keys: Vec<&str> = self.0.keys().map(String::as_str).collect();
        for k in other.0.keys() {
            if !keys.contains(&k.as_str()) {
                keys.push(k.as_str());
            }
        }
        keys.into_iter()
    }

    /// Component-wise addition.
    pub fn add(&self, other: &Self) -> Self {
        let mut result = BTreeMap::new();
        for key in self.key_union(other) {
            result.insert(key.to_string(), self.get(key) + other.get(key));
        }
        Self(result)
    }

    /// Component-wise subtraction. Returns an error if any resulting
    /// component would go negative (resource accounting must never imply
    /// more was released than was ever reserved).
    pub fn subtract(&self, other: &Self) -> Result<Self> {
        let mut result = BTreeMap::new();
        for key in self.key_union(other) {
            let value = self.get(key) - other.get(key);
            if value.is_sign_negative() && !value.is_zero() {
                return Err(Error::consistency(format!(
                    "resource slot '{key}' would go negative: {value}"
                )));
            }
            result.insert(key.to_string(), value);
        }
        Ok(Self(result))
    }

    /// True if every component of `self` is `<=` the corresponding component of `other`.
    pub fn fits_within(&self, other: &Self) -> bool {
        self.key_union(other).all(|key| self.get(key) <= other.get(key))
    }

    /// Normalizes away explicit zero entries so two logically-equal vectors compare equal.
    pub fn normalize(mut self) -> Self {
        self.0.retain(|_, v| !v.is_zero());
        self
    }

    /// Normalizes against a known-slot-types registry, rejecting any slot
    /// name the registry has never seen. Distinct from `normalize()`: this
    /// is a validation step at the resource-model boundary, not a pure
    /// comparison helper.
    pub fn normalize_against(self, known: &KnownSlotTypes) -> Result<Self> {
        for key in self.0.keys() {
            if !known.contains(key) {
                return Err(Error::validation(format!(
                    "unknown resource slot type: '{key}'"
                )));
            }
        }
        Ok(self.normalize())
    }

    /// Dominant share against a capacity vector: max over slots of
    /// `occupied[slot] / total[slot]`, used by the DRF scheduling strategy.
    /// Slots with zero total capacity are skipped (treated as unconstrained).
    pub fn dominant_share(&self, total_capacity: &Self) -> Decimal {
        self.key_union(total_capacity)
            .filter_map(|key| {
                let capacity = total_capacity.get(key);
                if capacity.is_zero() {
                    None
                } else {
                    Some(self.get(key) / capacity)
                }
            })
            .fold(Decimal::ZERO, Decimal::max)
    }
}

impl fmt::Display for ResourceSlots {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|(k, v)| format!("{k}={v}")).collect();
        write!(f, "{{{}}}", parts.join(", "))
    }
}

/// Parses a byte-unit-suffixed string (`"512m"`, `"2g"`, `"1024"`) into a
/// plain byte-count `Decimal`. Used when materializing `ResourceSlots` from
/// user-provided or stored string quantities for `Bytes`-kind slots.
pub fn parse_byte_quantity(raw: &str) -> Result<Decimal> {
    let raw = raw.trim();
    let (digits, multiplier) = match raw.chars().last() {
        Some('k') | Some('K') => (&raw[..raw.len() - 1], Decimal::from(1024)),
        Some('m') | Some('M') => (&raw[..raw.len() - 1], Decimal::from(1024 * 1024)),
        Some('g') | Some('G') => (&raw[..raw.len() - 1], Decimal::from(1024 * 1024 * 1024)),
        Some('t') | Some('T') => (
            &raw[..raw.len() - 1],
            Decimal::from(1024i64 * 1024 * 1024 * 1024),
        ),
        _ => (raw, Decimal::ONE),
    };
    let base: Decimal = digits
        .trim()
        .parse()
        .map_err(|_| Error::validation(format!("invalid byte quantity: '{raw}'")))?;
    Ok(base * multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slots(pairs: &[(&str, i64)]) -> ResourceSlots {
        ResourceSlots::from_pairs(pairs.iter().map(|(k, v)| (*k, Decimal::from(*v))))
    }

    #[test]
    fn add_then_subtract_is_identity() {
        let a = slots(&[("cpu", 4), ("mem", 1024)]);
        let b = slots(&[("cpu", 1), ("mem", 256)]);
        let round_tripped = a.add(&b).subtract(&b).unwrap();
        assert_eq!(round_tripped.normalize(), a.normalize());
    }

    #[test]
    fn subtract_below_zero_is_rejected() {
        let a = slots(&[("cpu", 1)]);
        let b = slots(&[("cpu", 2)]);
        assert!(a.subtract(&b).is_err());
    }

    #[test]
    fn fits_within_respects_every_dimension() {
        let request = slots(&[("cpu", 2), ("mem", 512)]);
        let capacity = slots(&[("cpu", 4), ("mem", 256)]);
        assert!(!request.fits_within(&capacity));
    }

    #[test]
    fn dominant_share_picks_max_dimension() {
        let occupied = slots(&[("cpu", 2), ("mem", 8)]);
        let total = slots(&[("cpu", 4), ("mem", 64)]);
        // cpu share = 0.5, mem share = 0.125 -> dominant is cpu
        assert_eq!(occupied.dominant_share(&total), Decimal::new(5, 1));
    }

    #[test]
    fn normalize_against_rejects_unknown_slots() {
        let known = KnownSlotTypes::new();
        let request = slots(&[("cpu", 1), ("tpu", 1)]);
        assert!(request.normalize_against(&known).is_err());
    }

    #[test]
    fn normalize_against_accepts_known_slots() {
        let known = KnownSlotTypes::new();
        let request = slots(&[("cpu", 1), ("mem", 0)]);
        let normalized = request.normalize_against(&known).unwrap();
        assert_eq!(normalized, slots(&[("cpu", 1)]));
    }

    #[test]
    fn byte_quantity_parses_suffixes() {
        assert_eq!(parse_byte_quantity("1g").unwrap(), Decimal::from(1024i64 * 1024 * 1024));
        assert_eq!(parse_byte_quantity("512").unwrap(), Decimal::from(512));
    }
}
