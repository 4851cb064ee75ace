//! Format descriptors (caps) for negotiation.
//!
//! A [`Caps`] value describes the set of data formats a pad can produce or
//! accept. It is either `Any` (unconstrained) or an ordered list of
//! [`Structure`] clauses, each mapping attribute names to a [`FieldSpec`]
//! constraint.
//!
//! # Caps Negotiation
//!
//! The caps system supports constraint-based negotiation:
//!
//! - [`FieldSpec`]: a value that can be fixed, an integer range, or a set
//! - [`Structure`]: a named clause of attribute constraints
//! - [`Caps`]: an ordered list of alternative clauses
//!
//! ```rust
//! use aqueduct::caps::{Caps, Structure};
//!
//! // Source produces "audio/x-test" at any rate in 1..=100
//! let src = Caps::from(Structure::new("audio/x-test").field("rate", 1..=100));
//!
//! // Sink accepts exactly rate 50
//! let sink = Caps::from(Structure::new("audio/x-test").field("rate", 50));
//!
//! // Intersection is non-empty and fixates to rate 50
//! let common = src.intersect(&sink);
//! assert!(!common.is_empty());
//! let fixed = common.fixate().unwrap();
//! assert_eq!(fixed.get("rate").and_then(|f| f.as_fixed_int()), Some(50));
//! ```
//!
//! Caps attached to buffers or pads are immutable and shared as `Arc<Caps>`.

use smallvec::SmallVec;
use std::fmt;

// ============================================================================
// Value
// ============================================================================

/// A scalar attribute value inside a format descriptor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    /// Signed integer.
    Int(i64),
    /// String (e.g. a layout or encoding name).
    Str(String),
    /// Boolean.
    Bool(bool),
    /// Exact fraction (e.g. a frame rate like 30000/1001).
    Fraction(i32, i32),
}

impl Value {
    /// Get the integer value, if this is an `Int`.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Get the string value, if this is a `Str`.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl PartialOrd for Value {
    /// Values of different variants are unordered.
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => a.partial_cmp(b),
            (Self::Str(a), Self::Str(b)) => a.partial_cmp(b),
            (Self::Bool(a), Self::Bool(b)) => a.partial_cmp(b),
            (Self::Fraction(an, ad), Self::Fraction(bn, bd)) => {
                // Compare as fractions: a/b vs c/d => a*d vs c*b. Flips
                // when exactly one denominator is negative; zero
                // denominators are unordered.
                if *ad == 0 || *bd == 0 {
                    return None;
                }
                let lhs = i64::from(*an) * i64::from(*bd);
                let rhs = i64::from(*bn) * i64::from(*ad);
                let ord = lhs.partial_cmp(&rhs)?;
                if (i64::from(*ad) * i64::from(*bd)) < 0 {
                    Some(ord.reverse())
                } else {
                    Some(ord)
                }
            }
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(v.into())
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Str(s) => write!(f, "{s}"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Fraction(n, d) => write!(f, "{n}/{d}"),
        }
    }
}

// ============================================================================
// FieldSpec - constraint on one attribute
// ============================================================================

/// A constraint on a single format attribute.
///
/// Supports intersection (finding common ground), subset testing, and
/// fixation (choosing a single value deterministically).
///
/// # Examples
///
/// ```rust
/// use aqueduct::caps::{FieldSpec, Value};
///
/// let fixed = FieldSpec::from(50);
/// let range = FieldSpec::from(1..=100);
///
/// // Intersection finds common ground
/// assert_eq!(fixed.intersect(&range), Some(FieldSpec::Fixed(Value::Int(50))));
///
/// // Fixation is deterministic: lowest value of a range
/// assert_eq!(range.fixate(), Some(Value::Int(1)));
/// ```
#[derive(Clone, Debug, PartialEq)]
pub enum FieldSpec {
    /// Exact value (fully constrained).
    Fixed(Value),
    /// Inclusive integer range.
    IntRange {
        /// Minimum acceptable value.
        min: i64,
        /// Maximum acceptable value.
        max: i64,
    },
    /// Discrete set of acceptable values (ordered by preference, first is
    /// best). An empty set accepts nothing.
    Set(Vec<Value>),
}

impl FieldSpec {
    /// Check if a value is accepted by this constraint.
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            Self::Fixed(v) => v == value,
            Self::IntRange { min, max } => {
                matches!(value, Value::Int(v) if v >= min && v <= max)
            }
            Self::Set(values) => values.contains(value),
        }
    }

    /// Intersect two constraints, finding common values.
    ///
    /// Returns `None` if there is no overlap. Commutative up to preference
    /// order within sets.
    pub fn intersect(&self, other: &Self) -> Option<Self> {
        match (self, other) {
            // Fixed vs Fixed: must be equal
            (Self::Fixed(a), Self::Fixed(b)) => {
                if a == b {
                    Some(Self::Fixed(a.clone()))
                } else {
                    None
                }
            }

            // Fixed vs Range: fixed must be in range
            (Self::Fixed(v), r @ Self::IntRange { .. })
            | (r @ Self::IntRange { .. }, Self::Fixed(v)) => {
                if r.accepts(v) {
                    Some(Self::Fixed(v.clone()))
                } else {
                    None
                }
            }

            // Fixed vs Set: fixed must be in the set
            (Self::Fixed(v), Self::Set(set)) | (Self::Set(set), Self::Fixed(v)) => {
                if set.contains(v) {
                    Some(Self::Fixed(v.clone()))
                } else {
                    None
                }
            }

            // Range vs Range: overlap
            (
                Self::IntRange {
                    min: min1,
                    max: max1,
                },
                Self::IntRange {
                    min: min2,
                    max: max2,
                },
            ) => {
                let min = (*min1).max(*min2);
                let max = (*max1).min(*max2);
                if min > max {
                    None
                } else if min == max {
                    Some(Self::Fixed(Value::Int(min)))
                } else {
                    Some(Self::IntRange { min, max })
                }
            }

            // Range vs Set: filter the set to values in range
            (r @ Self::IntRange { .. }, Self::Set(set))
            | (Self::Set(set), r @ Self::IntRange { .. }) => {
                let filtered: Vec<Value> =
                    set.iter().filter(|v| r.accepts(v)).cloned().collect();
                Self::from_values(filtered)
            }

            // Set vs Set: common values, preserving order from the first set
            (Self::Set(set1), Self::Set(set2)) => {
                let common: Vec<Value> =
                    set1.iter().filter(|v| set2.contains(v)).cloned().collect();
                Self::from_values(common)
            }
        }
    }

    /// Check whether every value this constraint accepts is also accepted
    /// by `other`.
    pub fn is_subset(&self, other: &Self) -> bool {
        match self {
            Self::Fixed(v) => other.accepts(v),
            Self::IntRange { min, max } => match other {
                Self::IntRange {
                    min: omin,
                    max: omax,
                } => min >= omin && max <= omax,
                Self::Fixed(_) => min == max && other.accepts(&Value::Int(*min)),
                Self::Set(_) => {
                    // Only tractable for small ranges.
                    (*max - *min) < 64 && (*min..=*max).all(|i| other.accepts(&Value::Int(i)))
                }
            },
            Self::Set(values) => values.iter().all(|v| other.accepts(v)),
        }
    }

    /// Fixate: choose a single value deterministically.
    ///
    /// Fixed returns itself, a range returns its minimum, a set returns its
    /// first (most preferred) entry. An empty set has no value to pick and
    /// returns `None`.
    pub fn fixate(&self) -> Option<Value> {
        match self {
            Self::Fixed(v) => Some(v.clone()),
            Self::IntRange { min, .. } => Some(Value::Int(*min)),
            Self::Set(values) => values.first().cloned(),
        }
    }

    /// Check if this is a fixed value.
    #[inline]
    pub fn is_fixed(&self) -> bool {
        matches!(self, Self::Fixed(_))
    }

    /// Get the fixed value if this is fixed.
    pub fn as_fixed(&self) -> Option<&Value> {
        match self {
            Self::Fixed(v) => Some(v),
            _ => None,
        }
    }

    /// Get the fixed integer value, if this is a fixed `Int`.
    pub fn as_fixed_int(&self) -> Option<i64> {
        self.as_fixed().and_then(Value::as_int)
    }

    /// Build a spec from a list of values: empty is no spec, one value is
    /// `Fixed`, more is a `Set`.
    fn from_values(mut values: Vec<Value>) -> Option<Self> {
        match values.len() {
            0 => None,
            1 => Some(Self::Fixed(values.remove(0))),
            _ => Some(Self::Set(values)),
        }
    }
}

impl From<Value> for FieldSpec {
    fn from(v: Value) -> Self {
        Self::Fixed(v)
    }
}

impl From<i64> for FieldSpec {
    fn from(v: i64) -> Self {
        Self::Fixed(Value::Int(v))
    }
}

impl From<i32> for FieldSpec {
    fn from(v: i32) -> Self {
        Self::Fixed(Value::Int(v.into()))
    }
}

impl From<&str> for FieldSpec {
    fn from(v: &str) -> Self {
        Self::Fixed(Value::Str(v.to_string()))
    }
}

impl From<bool> for FieldSpec {
    fn from(v: bool) -> Self {
        Self::Fixed(Value::Bool(v))
    }
}

impl From<std::ops::RangeInclusive<i64>> for FieldSpec {
    fn from(range: std::ops::RangeInclusive<i64>) -> Self {
        let (min, max) = range.into_inner();
        Self::IntRange { min, max }
    }
}

impl From<Vec<Value>> for FieldSpec {
    fn from(values: Vec<Value>) -> Self {
        Self::from_values(values).unwrap_or(Self::Set(Vec::new()))
    }
}

impl fmt::Display for FieldSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(v) => write!(f, "{v}"),
            Self::IntRange { min, max } => write!(f, "[{min},{max}]"),
            Self::Set(values) => {
                write!(f, "{{")?;
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

// ============================================================================
// Structure - one clause
// ============================================================================

/// One clause of a format descriptor: a media-type name plus an ordered
/// attribute map.
///
/// Attributes missing from a clause are unconstrained for that clause; the
/// intersection with a peer carries the peer's constraint through.
///
/// A structure is *fixed* when every field is [`FieldSpec::Fixed`].
/// Negotiation must converge to a fixed structure before steady-state flow.
#[derive(Clone, Debug, PartialEq)]
pub struct Structure {
    name: String,
    fields: Vec<(String, FieldSpec)>,
}

impl Structure {
    /// Create an empty structure with the given media-type name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    /// Builder: add or replace a field constraint.
    #[must_use]
    pub fn field(mut self, name: impl Into<String>, spec: impl Into<FieldSpec>) -> Self {
        self.set(name, spec);
        self
    }

    /// Add or replace a field constraint.
    pub fn set(&mut self, name: impl Into<String>, spec: impl Into<FieldSpec>) {
        let name = name.into();
        let spec = spec.into();
        if let Some(entry) = self.fields.iter_mut().find(|(n, _)| *n == name) {
            entry.1 = spec;
        } else {
            self.fields.push((name, spec));
        }
    }

    /// Get the media-type name of this clause.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get a field constraint by name.
    pub fn get(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, s)| s)
    }

    /// Iterate over the fields in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldSpec)> {
        self.fields.iter().map(|(n, s)| (n.as_str(), s))
    }

    /// Get the number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Check if the structure has no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Check if every field is fixed.
    pub fn is_fixed(&self) -> bool {
        self.fields.iter().all(|(_, s)| s.is_fixed())
    }

    /// Intersect two clauses.
    ///
    /// Clauses with different names never intersect. A field present on one
    /// side only is carried through unchanged (the absent side accepts any
    /// value for it).
    pub fn intersect(&self, other: &Self) -> Option<Self> {
        if self.name != other.name {
            return None;
        }
        let mut out = Structure::new(self.name.clone());
        for (name, spec) in &self.fields {
            match other.get(name) {
                Some(other_spec) => out.fields.push((name.clone(), spec.intersect(other_spec)?)),
                None => out.fields.push((name.clone(), spec.clone())),
            }
        }
        for (name, spec) in &other.fields {
            if self.get(name).is_none() {
                out.fields.push((name.clone(), spec.clone()));
            }
        }
        Some(out)
    }

    /// Check whether every format this clause accepts is also accepted by
    /// `other`.
    pub fn is_subset(&self, other: &Self) -> bool {
        if self.name != other.name {
            return false;
        }
        // Every constraint of `other` must be met by an equal-or-narrower
        // constraint of self. A field missing from self is unconstrained
        // here, so self can only be a subset if other is too.
        other.fields.iter().all(|(name, other_spec)| {
            self.get(name)
                .is_some_and(|spec| spec.is_subset(other_spec))
        })
    }

    /// Fixate every field deterministically. `None` when a field cannot be
    /// fixated (an empty set).
    pub fn fixate(&self) -> Option<Structure> {
        let mut fields = Vec::with_capacity(self.fields.len());
        for (n, s) in &self.fields {
            fields.push((n.clone(), FieldSpec::Fixed(s.fixate()?)));
        }
        Some(Structure {
            name: self.name.clone(),
            fields,
        })
    }
}

impl fmt::Display for Structure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        for (name, spec) in &self.fields {
            write!(f, ", {name}={spec}")?;
        }
        Ok(())
    }
}

// ============================================================================
// Caps
// ============================================================================

/// A format descriptor: `Any`, or an ordered list of [`Structure`]
/// alternatives (first is most preferred).
///
/// An empty caps (no clauses, not `Any`) represents "no format at all" and
/// is the result of a failed intersection.
#[derive(Clone, Debug, PartialEq)]
pub struct Caps {
    any: bool,
    clauses: SmallVec<[Structure; 2]>,
}

impl Caps {
    /// Caps that accept any format (unconstrained).
    pub fn any() -> Self {
        Self {
            any: true,
            clauses: SmallVec::new(),
        }
    }

    /// Caps that accept no format at all.
    pub fn empty() -> Self {
        Self {
            any: false,
            clauses: SmallVec::new(),
        }
    }

    /// Create caps from a list of clauses, ordered by preference.
    pub fn new(clauses: impl IntoIterator<Item = Structure>) -> Self {
        Self {
            any: false,
            clauses: clauses.into_iter().collect(),
        }
    }

    /// Check if this accepts any format.
    pub fn is_any(&self) -> bool {
        self.any
    }

    /// Check if this accepts no format.
    pub fn is_empty(&self) -> bool {
        !self.any && self.clauses.is_empty()
    }

    /// Check if this is exactly one fully-fixed clause.
    pub fn is_fixed(&self) -> bool {
        !self.any && self.clauses.len() == 1 && self.clauses[0].is_fixed()
    }

    /// Get the clauses, in preference order. Empty for `Any`.
    pub fn clauses(&self) -> &[Structure] {
        &self.clauses
    }

    /// Get the preferred (first) clause.
    pub fn preferred(&self) -> Option<&Structure> {
        self.clauses.first()
    }

    /// Append a clause.
    pub fn push(&mut self, clause: Structure) {
        debug_assert!(!self.any, "cannot append clauses to Caps::any()");
        self.clauses.push(clause);
    }

    /// Intersect two caps.
    ///
    /// Clause pairs are tried in preference order (self-major); every
    /// non-empty pairwise intersection is kept, preserving that order.
    /// The result as a set of clauses is independent of argument order.
    pub fn intersect(&self, other: &Self) -> Caps {
        if self.any {
            return other.clone();
        }
        if other.any {
            return self.clone();
        }
        let mut out = Caps::empty();
        for ours in &self.clauses {
            for theirs in &other.clauses {
                if let Some(clause) = ours.intersect(theirs) {
                    if !out.clauses.contains(&clause) {
                        out.clauses.push(clause);
                    }
                }
            }
        }
        out
    }

    /// Check if the two caps have any format in common.
    pub fn intersects(&self, other: &Self) -> bool {
        if self.any || other.any {
            return !(self.is_empty() || other.is_empty());
        }
        self.clauses
            .iter()
            .any(|a| other.clauses.iter().any(|b| a.intersect(b).is_some()))
    }

    /// Check whether every format accepted by self is accepted by `of`.
    pub fn is_subset(&self, of: &Self) -> bool {
        if of.any {
            return true;
        }
        if self.any {
            return false;
        }
        self.clauses
            .iter()
            .all(|clause| of.clauses.iter().any(|oc| clause.is_subset(oc)))
    }

    /// Fixate to a single concrete clause, deterministically.
    ///
    /// Picks the first (most preferred) clause and fixates each of its
    /// fields (lowest value of a range, first entry of a set). Returns
    /// `None` for `Any`, empty caps, or a clause that cannot be fixated.
    pub fn fixate(&self) -> Option<Structure> {
        if self.any {
            return None;
        }
        self.clauses.first().and_then(Structure::fixate)
    }

    /// Fixate into single-clause caps.
    pub fn fixate_caps(&self) -> Option<Caps> {
        self.fixate().map(Caps::from)
    }
}

impl From<Structure> for Caps {
    fn from(clause: Structure) -> Self {
        Self {
            any: false,
            clauses: smallvec::smallvec![clause],
        }
    }
}

impl fmt::Display for Caps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.any {
            return write!(f, "ANY");
        }
        if self.clauses.is_empty() {
            return write!(f, "EMPTY");
        }
        for (i, clause) in self.clauses.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{clause}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rated(min: i64, max: i64) -> Caps {
        Caps::from(Structure::new("audio/x-test").field("rate", min..=max))
    }

    #[test]
    fn test_field_intersect_fixed_range() {
        let fixed = FieldSpec::from(50);
        let range = FieldSpec::from(1..=100);
        assert_eq!(fixed.intersect(&range), Some(FieldSpec::Fixed(Value::Int(50))));
        assert_eq!(range.intersect(&fixed), Some(FieldSpec::Fixed(Value::Int(50))));

        let out_of_range = FieldSpec::from(500);
        assert_eq!(out_of_range.intersect(&range), None);
    }

    #[test]
    fn test_field_intersect_range_range() {
        let a = FieldSpec::from(1..=50);
        let b = FieldSpec::from(30..=100);
        assert_eq!(a.intersect(&b), Some(FieldSpec::IntRange { min: 30, max: 50 }));

        // Touching ranges collapse to a fixed value
        let c = FieldSpec::from(50..=60);
        assert_eq!(a.intersect(&c), Some(FieldSpec::Fixed(Value::Int(50))));

        // Disjoint ranges do not intersect
        let d = FieldSpec::from(70..=80);
        assert_eq!(a.intersect(&d), None);
    }

    #[test]
    fn test_field_intersect_sets_preserve_preference() {
        let a = FieldSpec::Set(vec![Value::Int(3), Value::Int(1), Value::Int(2)]);
        let b = FieldSpec::Set(vec![Value::Int(1), Value::Int(3)]);
        assert_eq!(
            a.intersect(&b),
            Some(FieldSpec::Set(vec![Value::Int(3), Value::Int(1)]))
        );
    }

    #[test]
    fn test_field_fixate_deterministic() {
        let range = FieldSpec::from(7..=100);
        assert_eq!(range.fixate(), Some(Value::Int(7)));
        assert_eq!(range.fixate(), range.fixate());

        let set = FieldSpec::Set(vec![Value::Str("a".into()), Value::Str("b".into())]);
        assert_eq!(set.fixate(), Some(Value::Str("a".into())));
    }

    #[test]
    fn test_empty_set_fixates_to_none() {
        assert_eq!(FieldSpec::Set(Vec::new()).fixate(), None);

        let mut clause = Structure::new("audio/x-test");
        clause.set("rate", FieldSpec::Set(Vec::new()));
        let caps = Caps::from(clause);
        assert!(caps.fixate().is_none());
        assert!(caps.fixate_caps().is_none());
    }

    #[test]
    fn test_fraction_ordering_normalizes_signs() {
        use std::cmp::Ordering;
        let half = Value::Fraction(1, 2);
        let neg_half = Value::Fraction(1, -2);
        let neg_half_alt = Value::Fraction(-1, 2);
        assert_eq!(neg_half.partial_cmp(&half), Some(Ordering::Less));
        assert_eq!(half.partial_cmp(&neg_half), Some(Ordering::Greater));
        assert_eq!(neg_half.partial_cmp(&neg_half_alt), Some(Ordering::Equal));
        assert_eq!(Value::Fraction(1, 0).partial_cmp(&half), None);
    }

    #[test]
    fn test_field_subset() {
        let narrow = FieldSpec::from(10..=20);
        let wide = FieldSpec::from(1..=100);
        assert!(narrow.is_subset(&wide));
        assert!(!wide.is_subset(&narrow));

        let fixed = FieldSpec::from(15);
        assert!(fixed.is_subset(&narrow));
        assert!(fixed.is_subset(&wide));
    }

    #[test]
    fn test_structure_intersect_different_names() {
        let a = Structure::new("audio/x-test");
        let b = Structure::new("video/x-test");
        assert!(a.intersect(&b).is_none());
    }

    #[test]
    fn test_structure_missing_field_is_unconstrained() {
        let a = Structure::new("audio/x-test").field("rate", 1..=100);
        let b = Structure::new("audio/x-test").field("channels", 2);

        let i = a.intersect(&b).unwrap();
        assert_eq!(i.get("rate"), Some(&FieldSpec::IntRange { min: 1, max: 100 }));
        assert_eq!(i.get("channels"), Some(&FieldSpec::Fixed(Value::Int(2))));
    }

    #[test]
    fn test_caps_intersection_commutative() {
        let a = rated(1, 100);
        let b = Caps::from(Structure::new("audio/x-test").field("rate", 50));

        let ab = a.intersect(&b);
        let ba = b.intersect(&a);
        assert_eq!(ab.clauses(), ba.clauses());
        assert!(!ab.is_empty());
    }

    #[test]
    fn test_caps_no_overlap_is_empty() {
        let a = Caps::from(Structure::new("audio/x-test").field("kind", "X"));
        let b = Caps::from(Structure::new("audio/x-test").field("kind", "Y"));
        let i = a.intersect(&b);
        assert!(i.is_empty());
        assert_eq!(b.intersect(&a).is_empty(), i.is_empty());
    }

    #[test]
    fn test_caps_any_intersect() {
        let a = Caps::any();
        let b = rated(1, 10);
        assert_eq!(a.intersect(&b), b);
        assert_eq!(b.intersect(&a), b);
    }

    #[test]
    fn test_caps_fixate_is_deterministic_and_fixed() {
        let caps = Caps::new([
            Structure::new("audio/x-test")
                .field("rate", 8..=48)
                .field("layout", vec![Value::Str("planar".into()), Value::Str("packed".into())]),
            Structure::new("audio/x-test").field("rate", 96),
        ]);
        let fixed = caps.fixate().unwrap();
        assert_eq!(fixed.get("rate").and_then(FieldSpec::as_fixed_int), Some(8));
        assert_eq!(
            fixed.get("layout").and_then(|f| f.as_fixed()).and_then(Value::as_str),
            Some("planar")
        );
        assert!(fixed.is_fixed());
        assert_eq!(caps.fixate(), caps.fixate());
    }

    #[test]
    fn test_caps_subset() {
        let narrow = rated(10, 20);
        let wide = rated(1, 100);
        assert!(narrow.is_subset(&wide));
        assert!(!wide.is_subset(&narrow));
        assert!(narrow.is_subset(&Caps::any()));
        assert!(!Caps::any().is_subset(&narrow));
        assert!(Caps::empty().is_subset(&narrow));
    }

    #[test]
    fn test_caps_display() {
        let caps = rated(1, 100);
        assert_eq!(format!("{caps}"), "audio/x-test, rate=[1,100]");
        assert_eq!(format!("{}", Caps::any()), "ANY");
        assert_eq!(format!("{}", Caps::empty()), "EMPTY");
    }
}
