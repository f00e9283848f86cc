use std::borrow::Cow;
use std::collections::BTreeMap;

use crate::shape::ShapeIndex;

pub const FLOPS: &str = "flops";
pub const TRANSCENDENTALS: &str = "transcendentals";
pub const BYTES_ACCESSED: &str = "bytes accessed";
pub const OPTIMAL_SECONDS: &str = "optimal_seconds";
pub const UTILIZATION: &str = "utilization";

pub fn operand_bytes_accessed_key(operand_num: usize, index: &ShapeIndex) -> String {
    format!("{}{}{}", BYTES_ACCESSED, operand_num, index)
}

pub fn operand_utilization_key(operand_num: usize, index: &ShapeIndex) -> String {
    format!("{}{}{}", UTILIZATION, operand_num, index)
}

pub fn output_bytes_accessed_key(index: &ShapeIndex) -> String {
    format!("{}out{}", BYTES_ACCESSED, index)
}

/// Named cost metrics. Reading a key that was never set yields 0, so an unknown cost looks the
/// same as no cost at all.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Properties(BTreeMap<String, f64>);

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> f64 {
        self.get_or(key, 0.0)
    }

    pub fn get_or(&self, key: &str, default: f64) -> f64 {
        self.0.get(key).copied().unwrap_or(default)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: f64) {
        self.0.insert(key.into(), value);
    }

    pub fn add(&mut self, key: &str, value: f64) {
        match self.0.get_mut(key) {
            Some(v) => *v += value,
            None => {
                self.0.insert(key.to_owned(), value);
            }
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<f64> {
        self.0.remove(key)
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(k, &v)| (k.as_str(), v))
    }

    /// Adds every key of `other` which `schema` counts towards a running total.
    pub fn accumulate(&mut self, other: &Properties, schema: &KeySchema) {
        for (key, value) in other.iter().filter(|(key, _)| schema.is_summable(key)) {
            self.add(key, value);
        }
    }

    /// Undoes a previous `accumulate` of `other`.
    pub fn subtract(&mut self, other: &Properties, schema: &KeySchema) {
        for (key, value) in other.iter().filter(|(key, _)| schema.is_summable(key)) {
            self.add(key, -value);
        }
    }

    /// Raises each key to at least its value in `other`. Keys only present in `other` are copied.
    pub fn max_with(&mut self, other: &Properties) {
        for (key, value) in other.iter() {
            match self.0.get_mut(key) {
                Some(v) => *v = v.max(value),
                None => {
                    self.0.insert(key.to_owned(), value);
                }
            }
        }
    }

    /// The subset of keys which a caller inherits from a computation it calls.
    pub fn propagated(&self, schema: &KeySchema) -> Properties {
        Properties(
            self.0
                .iter()
                .filter(|(key, _)| schema.propagates(key))
                .map(|(k, &v)| (k.clone(), v))
                .collect(),
        )
    }
}

impl<K: Into<String>> FromIterator<(K, f64)> for Properties {
    fn from_iter<I: IntoIterator<Item = (K, f64)>>(iter: I) -> Self {
        Properties(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum KeyPattern {
    Exact(Cow<'static, str>),
    Prefix(Cow<'static, str>),
}

impl KeyPattern {
    pub fn matches(&self, key: &str) -> bool {
        match self {
            KeyPattern::Exact(k) => key == &**k,
            KeyPattern::Prefix(p) => key.starts_with(&**p),
        }
    }
}

/// How one family of keys behaves when records are combined.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct KeyRule {
    pub pattern: KeyPattern,
    /// Counted in the running total over all committed records.
    pub summable: bool,
    /// Copied from a called computation's total into the caller's record.
    pub propagates: bool,
}

impl KeyRule {
    pub const fn exact(key: &'static str, summable: bool, propagates: bool) -> Self {
        KeyRule {
            pattern: KeyPattern::Exact(Cow::Borrowed(key)),
            summable,
            propagates,
        }
    }

    pub const fn prefix(prefix: &'static str, summable: bool, propagates: bool) -> Self {
        KeyRule {
            pattern: KeyPattern::Prefix(Cow::Borrowed(prefix)),
            summable,
            propagates,
        }
    }
}

const BUILTIN_RULES: [KeyRule; 6] = [
    KeyRule::exact(FLOPS, true, true),
    KeyRule::exact(TRANSCENDENTALS, true, true),
    KeyRule::exact(BYTES_ACCESSED, true, true),
    // Per-operand and per-output breakdowns describe one instruction's own operands.
    KeyRule::prefix(BYTES_ACCESSED, true, false),
    KeyRule::exact(OPTIMAL_SECONDS, true, false),
    KeyRule::prefix(UTILIZATION, false, false),
];

/// Classification of property keys. Rules are tried in order and the first match wins; keys no
/// rule matches are backend metrics which are both summed and propagated.
#[derive(Clone, Debug, PartialEq)]
pub struct KeySchema {
    rules: Vec<KeyRule>,
}

impl Default for KeySchema {
    fn default() -> Self {
        KeySchema {
            rules: BUILTIN_RULES.to_vec(),
        }
    }
}

impl KeySchema {
    /// Adds a rule which takes precedence over every existing one.
    pub fn with_rule(mut self, rule: KeyRule) -> Self {
        self.rules.insert(0, rule);
        self
    }

    fn rule(&self, key: &str) -> Option<&KeyRule> {
        self.rules.iter().find(|rule| rule.pattern.matches(key))
    }

    pub fn is_summable(&self, key: &str) -> bool {
        self.rule(key).map_or(true, |rule| rule.summable)
    }

    pub fn propagates(&self, key: &str) -> bool {
        self.rule(key).map_or(true, |rule| rule.propagates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_keys_read_as_zero() {
        let props = Properties::new();
        assert_eq!(props.get(FLOPS), 0.0);
        assert_eq!(props.get("made up"), 0.0);
        assert_eq!(props.get_or("made up", 7.0), 7.0);
    }

    #[test]
    fn key_formats() {
        assert_eq!(operand_bytes_accessed_key(1, &ShapeIndex::default()), "bytes accessed1{}");
        assert_eq!(operand_utilization_key(0, &ShapeIndex::new(&[2, 0])), "utilization0{2,0}");
        assert_eq!(output_bytes_accessed_key(&ShapeIndex::new(&[1])), "bytes accessedout{1}");
    }

    #[test]
    fn builtin_classification() {
        let schema = KeySchema::default();
        assert!(schema.propagates(FLOPS));
        assert!(schema.propagates(TRANSCENDENTALS));
        assert!(schema.propagates(BYTES_ACCESSED));
        assert!(schema.propagates("backend cycles"));
        assert!(!schema.propagates(&operand_bytes_accessed_key(0, &ShapeIndex::default())));
        assert!(!schema.propagates(&output_bytes_accessed_key(&ShapeIndex::default())));
        assert!(!schema.propagates(OPTIMAL_SECONDS));
        assert!(!schema.propagates(&operand_utilization_key(3, &ShapeIndex::default())));

        assert!(schema.is_summable(OPTIMAL_SECONDS));
        assert!(!schema.is_summable(UTILIZATION));
        assert!(!schema.is_summable(&operand_utilization_key(0, &ShapeIndex::default())));
    }

    #[test]
    fn backend_rules_take_precedence() {
        let schema = KeySchema::default().with_rule(KeyRule::prefix("scratch", false, false));
        assert!(!schema.is_summable("scratch bytes"));
        assert!(!schema.propagates("scratch bytes"));
        assert!(schema.propagates(FLOPS));
    }

    #[test]
    fn accumulate_then_subtract() {
        let schema = KeySchema::default();
        let record: Properties = [(FLOPS, 10.0), (UTILIZATION, 1.0), (BYTES_ACCESSED, 40.0)]
            .into_iter()
            .collect();
        let mut sum: Properties = [(FLOPS, 5.0)].into_iter().collect();
        sum.accumulate(&record, &schema);
        assert_eq!(sum.get(FLOPS), 15.0);
        assert_eq!(sum.get(BYTES_ACCESSED), 40.0);
        assert!(!sum.contains(UTILIZATION));
        sum.subtract(&record, &schema);
        assert_eq!(sum.get(FLOPS), 5.0);
        assert_eq!(sum.get(BYTES_ACCESSED), 0.0);
    }

    #[test]
    fn max_and_propagated() {
        let mut a: Properties = [(FLOPS, 3.0), (TRANSCENDENTALS, 9.0)].into_iter().collect();
        let b: Properties = [(FLOPS, 8.0), (OPTIMAL_SECONDS, 1.0)].into_iter().collect();
        a.max_with(&b);
        assert_eq!(a.get(FLOPS), 8.0);
        assert_eq!(a.get(TRANSCENDENTALS), 9.0);
        let up = a.propagated(&KeySchema::default());
        assert_eq!(up.len(), 2);
        assert!(!up.contains(OPTIMAL_SECONDS));
    }
}
