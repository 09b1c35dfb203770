//! Visibility rules attached to intro fields and step groups.
//!
//! Rules arrive as data from the backend (`showIf`). They are parsed into a
//! small tagged union and evaluated against the values currently entered in
//! the form; nothing is cached between evaluations.

use std::collections::{BTreeMap, HashMap};

use crate::{FieldRule, GroupRule, IntroField, StepGroup};

/// Field key → value as typed in the form.
pub type FieldValues = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Comparison {
    AtLeast(f64),
}

impl Comparison {
    /// Parse the operator string of a field rule. Only `>=N` is emitted by the backend.
    pub fn parse(raw: &str) -> Option<Self> {
        let rest = raw.trim().strip_prefix(">=")?;
        parse_number(rest).map(Comparison::AtLeast)
    }

    pub fn holds(&self, value: f64) -> bool {
        match self {
            Comparison::AtLeast(n) => value >= *n,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Rule {
    /// Numeric comparison on the source value, optionally mapped from a category.
    Compare {
        source: String,
        comparison: Comparison,
        map_to: HashMap<String, f64>,
    },
    /// Case-insensitive membership of the source value in an allow-list.
    OneOf { source: String, allowed: Vec<String> },
    /// The backend sent a rule we cannot read; the guarded element stays hidden.
    Unreadable,
    /// A group rule with no source or no allow-list guards nothing.
    Always,
}

impl Rule {
    pub fn from_field_rule(rule: &FieldRule) -> Self {
        match Comparison::parse(&rule.rule) {
            Some(comparison) => Rule::Compare {
                source: rule.field.clone(),
                comparison,
                map_to: rule.map_to.clone(),
            },
            None => Rule::Unreadable,
        }
    }

    pub fn from_group_rule(rule: &GroupRule) -> Self {
        if rule.field.trim().is_empty() || rule.allowed_values.is_empty() {
            return Rule::Always;
        }
        Rule::OneOf {
            source: rule.field.clone(),
            allowed: rule.allowed_values.clone(),
        }
    }

    pub fn source(&self) -> Option<&str> {
        match self {
            Rule::Compare { source, .. } | Rule::OneOf { source, .. } => Some(source.as_str()),
            Rule::Unreadable | Rule::Always => None,
        }
    }

    pub fn evaluate(&self, values: &FieldValues) -> bool {
        match self {
            Rule::Compare {
                source,
                comparison,
                map_to,
            } => {
                let Some(raw) = non_empty(values, source) else {
                    return false;
                };
                match numeric_value(raw, map_to) {
                    Some(n) => comparison.holds(n),
                    None => false,
                }
            }
            Rule::OneOf { source, allowed } => {
                let Some(raw) = non_empty(values, source) else {
                    return false;
                };
                let needle = normalize(raw);
                allowed.iter().any(|a| normalize(a) == needle)
            }
            Rule::Unreadable => false,
            Rule::Always => true,
        }
    }
}

fn non_empty<'a>(values: &'a FieldValues, key: &str) -> Option<&'a str> {
    values
        .get(key)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
}

fn normalize(s: &str) -> String {
    s.trim().to_lowercase()
}

/// Finite number from user input; a decimal comma is accepted.
pub fn parse_number(raw: &str) -> Option<f64> {
    let n: f64 = raw.trim().replace(',', ".").parse().ok()?;
    n.is_finite().then_some(n)
}

/// Categorical mapping first (exact, then case-insensitive), numeric parse second.
fn numeric_value(raw: &str, map_to: &HashMap<String, f64>) -> Option<f64> {
    if let Some(n) = map_to.get(raw) {
        return Some(*n);
    }
    let needle = normalize(raw);
    if let Some((_, n)) = map_to.iter().find(|(k, _)| normalize(k) == needle) {
        return Some(*n);
    }
    parse_number(raw)
}

pub fn should_show_field(field: &IntroField, values: &FieldValues) -> bool {
    match &field.show_if {
        None => true,
        Some(rule) => Rule::from_field_rule(rule).evaluate(values),
    }
}

pub fn should_show_group(group: &StepGroup, values: &FieldValues) -> bool {
    match &group.show_if {
        None => true,
        Some(rule) => Rule::from_group_rule(rule).evaluate(values),
    }
}

pub fn visible_fields<'a>(fields: &'a [IntroField], values: &FieldValues) -> Vec<&'a IntroField> {
    fields
        .iter()
        .filter(|f| should_show_field(f, values))
        .collect()
}

pub fn visible_groups<'a>(groups: &'a [StepGroup], values: &FieldValues) -> Vec<&'a StepGroup> {
    groups
        .iter()
        .filter(|g| should_show_group(g, values))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FieldKind;
    use proptest::prelude::*;

    fn field(rule: &str, map_to: &[(&str, f64)]) -> IntroField {
        IntroField {
            key: "target".into(),
            label: "Target".into(),
            kind: FieldKind::Text,
            required: false,
            options: vec![],
            show_if: Some(FieldRule {
                field: "src".into(),
                rule: rule.into(),
                map_to: map_to.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            }),
        }
    }

    fn group(allowed: &[&str]) -> StepGroup {
        StepGroup {
            category: "Outdoor unit".into(),
            keys: vec!["front".into()],
            labels: HashMap::new(),
            show_if: Some(GroupRule {
                field: "src".into(),
                allowed_values: allowed.iter().map(|s| s.to_string()).collect(),
            }),
        }
    }

    fn values(v: &str) -> FieldValues {
        let mut m = FieldValues::new();
        m.insert("src".into(), v.into());
        m
    }

    #[test]
    fn field_without_rule_is_always_shown() {
        let mut f = field(">=1", &[]);
        f.show_if = None;
        assert!(should_show_field(&f, &FieldValues::new()));
    }

    #[test]
    fn field_rule_uses_numeric_parse() {
        let f = field(">=2", &[]);
        assert!(should_show_field(&f, &values("2")));
        assert!(should_show_field(&f, &values(" 3,5 ")));
        assert!(!should_show_field(&f, &values("1.9")));
        assert!(!should_show_field(&f, &values("")));
        assert!(!should_show_field(&f, &FieldValues::new()));
        assert!(!should_show_field(&f, &values("two")));
    }

    #[test]
    fn field_rule_maps_categories_before_comparing() {
        let f = field(">=2", &[("Duplex", 2.0), ("studio", 0.0)]);
        assert!(should_show_field(&f, &values("Duplex")));
        assert!(should_show_field(&f, &values("duplex ")));
        assert!(!should_show_field(&f, &values("Studio")));
        assert!(!should_show_field(&f, &values("loft")));
    }

    #[test]
    fn unreadable_rule_hides_the_field() {
        let f = field("<=3", &[]);
        assert!(!should_show_field(&f, &values("1")));
        assert_eq!(Comparison::parse(">= 4"), Some(Comparison::AtLeast(4.0)));
        assert_eq!(Comparison::parse(">=abc"), None);
    }

    #[test]
    fn group_rule_is_case_insensitive_membership() {
        let g = group(&["Split", " Monobloc "]);
        assert!(should_show_group(&g, &values("split")));
        assert!(should_show_group(&g, &values("MONOBLOC")));
        assert!(!should_show_group(&g, &values("splitx")));
        assert!(!should_show_group(&g, &values("  ")));
    }

    #[test]
    fn group_rule_without_allow_list_guards_nothing() {
        let g = group(&[]);
        assert_eq!(Rule::from_group_rule(g.show_if.as_ref().unwrap()), Rule::Always);
        assert!(should_show_group(&g, &values("anything")));
        assert!(should_show_group(&g, &FieldValues::new()));

        let mut blank_source = group(&["yes"]);
        if let Some(rule) = blank_source.show_if.as_mut() {
            rule.field = " ".into();
        }
        assert!(should_show_group(&blank_source, &FieldValues::new()));
        assert_eq!(Rule::Always.source(), None);
    }

    #[test]
    fn visible_groups_keeps_order() {
        let mut open = group(&[]);
        open.show_if = None;
        open.category = "Always".into();
        let gated = group(&["yes"]);
        let groups = vec![gated.clone(), open.clone()];
        let shown: Vec<_> = visible_groups(&groups, &values("no"))
            .into_iter()
            .map(|g| g.category.as_str())
            .collect();
        assert_eq!(shown, vec!["Always"]);
        assert_eq!(visible_groups(&groups, &values("YES")).len(), 2);
    }

    proptest! {
        #[test]
        fn group_visibility_matches_normalized_allow_list(
            value in "[ a-cA-C]{0,4}",
            allowed in proptest::collection::vec("[ a-cA-C]{1,4}", 1..4),
        ) {
            let allowed_refs: Vec<&str> = allowed.iter().map(|s| s.as_str()).collect();
            let g = group(&allowed_refs);
            let needle = value.trim().to_lowercase();
            let expected = !needle.is_empty()
                && allowed.iter().any(|a| a.trim().to_lowercase() == needle);
            prop_assert_eq!(should_show_group(&g, &values(&value)), expected);
        }

        #[test]
        fn field_visibility_follows_threshold(threshold in -20i32..20, v in -40i32..40) {
            let f = field(&format!(">={threshold}"), &[]);
            prop_assert_eq!(should_show_field(&f, &values(&v.to_string())), v >= threshold);
        }

        #[test]
        fn unmapped_words_hide_the_field(word in "[g-z]{1,6}") {
            let f = field(">=0", &[("large", 5.0)]);
            prop_assume!(word.parse::<f64>().is_err());
            prop_assert!(!should_show_field(&f, &values(&word)));
        }
    }
}
