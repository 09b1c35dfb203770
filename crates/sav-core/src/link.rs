//! WhatsApp hand-off link generation.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::rules::{should_show_field, visible_groups, FieldValues};
use crate::{ContactCandidate, Sheet, StepGroup};

const WHATSAPP_BASE: &str = "https://wa.me";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkForm {
    pub contact: ContactCandidate,
    pub chantier_ref: String,
    pub product_id: String,
    pub sheet_id: String,
    pub intro_values: FieldValues,
    pub selected_steps: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "field", content = "key", rename_all = "snake_case")]
pub enum MissingField {
    ContactName,
    ContactPhone,
    ChantierRef,
    Product,
    Sheet,
    Intro(String),
    Steps,
}

impl fmt::Display for MissingField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MissingField::ContactName => write!(f, "contact name"),
            MissingField::ContactPhone => write!(f, "contact phone"),
            MissingField::ChantierRef => write!(f, "chantier reference"),
            MissingField::Product => write!(f, "product"),
            MissingField::Sheet => write!(f, "sheet"),
            MissingField::Intro(key) => write!(f, "field '{key}'"),
            MissingField::Steps => write!(f, "at least one step"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LinkControls {
    pub copy_enabled: bool,
    pub open_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GeneratedLink {
    /// Deep link opening a WhatsApp chat with the pre-filled message.
    pub url: String,
    /// The URL-encoded query string carried in the message.
    pub payload: String,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum LinkError {
    #[error("link not ready, missing: {}", join_missing(.0))]
    NotReady(Vec<MissingField>),
    #[error("whatsapp number '{0}' has no digits")]
    InvalidNumber(String),
}

fn join_missing(missing: &[MissingField]) -> String {
    missing
        .iter()
        .map(|m| m.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn blank(s: &str) -> bool {
    s.trim().is_empty()
}

impl LinkForm {
    pub fn select_contact(&mut self, contact: &ContactCandidate) {
        self.contact = contact.clone();
    }

    /// Switching product invalidates the sheet and everything derived from it.
    pub fn set_product(&mut self, product_id: &str) {
        if self.product_id != product_id {
            self.product_id = product_id.to_string();
            self.sheet_id.clear();
            self.intro_values.clear();
            self.selected_steps.clear();
        }
    }

    pub fn set_sheet(&mut self, sheet_id: &str) {
        if self.sheet_id != sheet_id {
            self.sheet_id = sheet_id.to_string();
            self.intro_values.clear();
            self.selected_steps.clear();
        }
    }

    pub fn set_intro_value(&mut self, key: &str, value: &str) {
        if value.is_empty() {
            self.intro_values.remove(key);
        } else {
            self.intro_values.insert(key.to_string(), value.to_string());
        }
    }

    /// Flip a step checkbox; returns whether it is now selected.
    pub fn toggle_step(&mut self, key: &str) -> bool {
        if self.selected_steps.remove(key) {
            false
        } else {
            self.selected_steps.insert(key.to_string());
            true
        }
    }

    /// Selected steps that belong to a currently visible group, in group order.
    pub fn effective_steps<'a>(&self, groups: &'a [StepGroup]) -> Vec<&'a str> {
        let mut seen = BTreeSet::new();
        visible_groups(groups, &self.intro_values)
            .into_iter()
            .flat_map(|g| g.keys.iter())
            .filter(|k| self.selected_steps.contains(*k) && seen.insert(k.as_str()))
            .map(|k| k.as_str())
            .collect()
    }

    pub fn missing_fields(&self, sheet: Option<&Sheet>, groups: &[StepGroup]) -> Vec<MissingField> {
        let mut missing = Vec::new();
        if blank(&self.contact.name) {
            missing.push(MissingField::ContactName);
        }
        if blank(&self.contact.phone) {
            missing.push(MissingField::ContactPhone);
        }
        if blank(&self.chantier_ref) {
            missing.push(MissingField::ChantierRef);
        }
        if blank(&self.product_id) {
            missing.push(MissingField::Product);
        }
        if blank(&self.sheet_id) {
            missing.push(MissingField::Sheet);
        }
        if let Some(sheet) = sheet {
            for field in &sheet.intro_fields {
                if !field.required || !should_show_field(field, &self.intro_values) {
                    continue;
                }
                let value = self.intro_values.get(&field.key).map(String::as_str);
                if value.map_or(true, blank) {
                    missing.push(MissingField::Intro(field.key.clone()));
                }
            }
        }
        if self.effective_steps(groups).is_empty() {
            missing.push(MissingField::Steps);
        }
        missing
    }

    pub fn is_ready(&self, sheet: Option<&Sheet>, groups: &[StepGroup]) -> bool {
        self.missing_fields(sheet, groups).is_empty()
    }

    pub fn controls(&self, sheet: Option<&Sheet>, groups: &[StepGroup]) -> LinkControls {
        let ready = self.is_ready(sheet, groups);
        LinkControls {
            copy_enabled: ready,
            open_enabled: ready,
        }
    }

    /// Query pairs carried by the link. Hidden fields and hidden steps are left out.
    pub fn query_pairs(&self, sheet: Option<&Sheet>, groups: &[StepGroup]) -> Vec<(String, String)> {
        let mut pairs = vec![("name".to_string(), self.contact.name.clone())];
        if !blank(&self.contact.company) {
            pairs.push(("company".into(), self.contact.company.clone()));
        }
        if !blank(&self.contact.email) {
            pairs.push(("email".into(), self.contact.email.clone()));
        }
        pairs.push(("phone".into(), self.contact.phone.clone()));
        pairs.push(("ref".into(), self.chantier_ref.clone()));
        pairs.push(("product".into(), self.product_id.clone()));
        pairs.push(("sheet".into(), self.sheet_id.clone()));
        pairs.push(("steps".into(), self.effective_steps(groups).join(",")));
        if let Some(sheet) = sheet {
            for field in &sheet.intro_fields {
                if !should_show_field(field, &self.intro_values) {
                    continue;
                }
                if let Some(value) = self.intro_values.get(&field.key).filter(|v| !blank(v)) {
                    pairs.push((format!("f.{}", field.key), value.clone()));
                }
            }
        }
        pairs
    }
}

/// Keep only the digits of a phone number, as wa.me expects.
pub fn whatsapp_digits(number: &str) -> String {
    number.chars().filter(|c| c.is_ascii_digit()).collect()
}

pub fn build_link(
    whatsapp_number: &str,
    form: &LinkForm,
    sheet: Option<&Sheet>,
    groups: &[StepGroup],
) -> Result<GeneratedLink, LinkError> {
    let missing = form.missing_fields(sheet, groups);
    if !missing.is_empty() {
        return Err(LinkError::NotReady(missing));
    }
    let digits = whatsapp_digits(whatsapp_number);
    if digits.is_empty() {
        return Err(LinkError::InvalidNumber(whatsapp_number.to_string()));
    }

    let payload = url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(form.query_pairs(sheet, groups))
        .finish();
    let mut url = Url::parse(WHATSAPP_BASE)
        .map_err(|_| LinkError::InvalidNumber(whatsapp_number.to_string()))?;
    url.set_path(&digits);
    url.query_pairs_mut().append_pair("text", &payload);

    Ok(GeneratedLink {
        url: url.to_string(),
        payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FieldKind, FieldRule, GroupRule, IntroField};
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn sheet() -> Sheet {
        Sheet {
            id: "sh1".into(),
            name: "Install".into(),
            intro_fields: vec![
                IntroField {
                    key: "floors".into(),
                    label: "Floors".into(),
                    kind: FieldKind::Number,
                    required: true,
                    options: vec![],
                    show_if: None,
                },
                IntroField {
                    key: "lift".into(),
                    label: "Lift access".into(),
                    kind: FieldKind::Text,
                    required: true,
                    options: vec![],
                    show_if: Some(FieldRule {
                        field: "floors".into(),
                        rule: ">=3".into(),
                        map_to: HashMap::new(),
                    }),
                },
            ],
        }
    }

    fn groups() -> Vec<StepGroup> {
        vec![
            StepGroup {
                category: "Unit".into(),
                keys: vec!["unit_front".into(), "unit_plate".into()],
                labels: HashMap::new(),
                show_if: None,
            },
            StepGroup {
                category: "Roof".into(),
                keys: vec!["roof".into()],
                labels: HashMap::new(),
                show_if: Some(GroupRule {
                    field: "floors".into(),
                    allowed_values: vec!["4".into()],
                }),
            },
        ]
    }

    fn filled() -> LinkForm {
        let mut form = LinkForm::default();
        form.select_contact(&ContactCandidate {
            name: "Léa Martin".into(),
            company: "Therm & Co".into(),
            phone: "+33 6 12 34 56 78".into(),
            ..Default::default()
        });
        form.chantier_ref = "CH 2024/17".into();
        form.set_product("p1");
        form.set_sheet("sh1");
        form.set_intro_value("floors", "2");
        form.toggle_step("unit_plate");
        form
    }

    #[test]
    fn ready_form_enables_controls() {
        let form = filled();
        let sheet = sheet();
        assert!(form.missing_fields(Some(&sheet), &groups()).is_empty());
        let controls = form.controls(Some(&sheet), &groups());
        assert!(controls.copy_enabled && controls.open_enabled);
    }

    #[test]
    fn any_missing_field_disables_controls() {
        let sheet = sheet();
        let mut form = filled();
        form.chantier_ref = "  ".into();
        assert_eq!(
            form.missing_fields(Some(&sheet), &groups()),
            vec![MissingField::ChantierRef]
        );
        assert!(!form.controls(Some(&sheet), &groups()).copy_enabled);

        let mut form = filled();
        form.toggle_step("unit_plate");
        assert_eq!(form.missing_fields(Some(&sheet), &groups()), vec![MissingField::Steps]);
        assert!(!form.controls(Some(&sheet), &groups()).open_enabled);
    }

    #[test]
    fn hidden_required_field_only_counts_when_visible() {
        let sheet = sheet();
        let mut form = filled();
        form.set_intro_value("floors", "3");
        assert_eq!(
            form.missing_fields(Some(&sheet), &groups()),
            vec![MissingField::Intro("lift".into())]
        );
        form.set_intro_value("lift", "yes");
        assert!(form.is_ready(Some(&sheet), &groups()));
    }

    #[test]
    fn selected_steps_in_hidden_groups_do_not_count() {
        let mut form = filled();
        form.toggle_step("unit_plate");
        form.toggle_step("roof");
        assert!(form.effective_steps(&groups()).is_empty());
        form.set_intro_value("floors", "4");
        assert_eq!(form.effective_steps(&groups()), vec!["roof"]);
    }

    #[test]
    fn link_query_matches_entered_values() {
        let sheet = sheet();
        let mut form = filled();
        form.toggle_step("unit_front");
        let link = build_link("+33 (0)7 00 00 00 01", &form, Some(&sheet), &groups()).unwrap();

        let url = Url::parse(&link.url).unwrap();
        assert_eq!(url.host_str(), Some("wa.me"));
        assert_eq!(url.path(), "/330700000001");
        let text = url
            .query_pairs()
            .find(|(k, _)| k == "text")
            .map(|(_, v)| v.into_owned())
            .unwrap();
        assert_eq!(text, link.payload);

        let pairs: Vec<(String, String)> = url::form_urlencoded::parse(text.as_bytes())
            .into_owned()
            .collect();
        let expect = |k: &str, v: &str| (k.to_string(), v.to_string());
        assert_eq!(
            pairs,
            vec![
                expect("name", "Léa Martin"),
                expect("company", "Therm & Co"),
                expect("phone", "+33 6 12 34 56 78"),
                expect("ref", "CH 2024/17"),
                expect("product", "p1"),
                expect("sheet", "sh1"),
                expect("steps", "unit_front,unit_plate"),
                expect("f.floors", "2"),
            ]
        );
        assert!(link.payload.contains("Therm+%26+Co"));
    }

    #[test]
    fn link_is_refused_until_ready() {
        let form = LinkForm::default();
        match build_link("123", &form, None, &groups()) {
            Err(LinkError::NotReady(missing)) => {
                assert!(missing.contains(&MissingField::ContactName));
                assert!(missing.contains(&MissingField::Steps));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            build_link("n/a", &filled(), Some(&sheet()), &groups()),
            Err(LinkError::InvalidNumber("n/a".into()))
        );
    }

    #[test]
    fn changing_product_resets_dependent_state() {
        let mut form = filled();
        form.set_product("p2");
        assert!(form.sheet_id.is_empty());
        assert!(form.intro_values.is_empty());
        assert!(form.selected_steps.is_empty());
    }
}
