// ABOUTME: Record Transformer - anonymizes sensitive columns before they reach a destination
// ABOUTME: Rules are deterministic per (table, primary key) so repeated runs are idempotent

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::value::{Record, Value};

/// Hash written into every `password` column: bcrypt of a well-known dev password.
pub const MASKED_PASSWORD_HASH: &str =
    "$2a$11$xLlTmByr6signynyPCofs.TG1SP06OX2WjL5pRtRk5SdgjqhMcRly";

/// How one column is masked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaskRule {
    /// Text derived from the row; `{id}` is the primary key value and
    /// `{table}` the table name. Skipped when the row has no key value.
    Template(String),
    /// The same text for every row.
    Fixed(String),
}

impl MaskRule {
    fn render(&self, table: &str, key: Option<&Value>) -> Option<Value> {
        match self {
            MaskRule::Fixed(text) => Some(Value::Text(text.clone())),
            MaskRule::Template(template) => {
                let key = key.filter(|k| !k.is_null())?;
                Some(Value::Text(
                    template
                        .replace("{id}", &key.to_string())
                        .replace("{table}", table),
                ))
            }
        }
    }
}

/// Column name → masking rule, applied to every table that has the column.
///
/// The rule set is a superset of the columns of any one table; columns a
/// record does not carry are left alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformPolicy {
    rules: BTreeMap<String, MaskRule>,
}

impl Default for TransformPolicy {
    fn default() -> Self {
        let mut rules = BTreeMap::new();
        rules.insert(
            "email".to_string(),
            MaskRule::Template("dev_hotel{id}@movefast.xyz".to_string()),
        );
        rules.insert(
            "hotel_email".to_string(),
            MaskRule::Template("hotel_arch{id}@movefast.xyz".to_string()),
        );
        rules.insert(
            "password".to_string(),
            MaskRule::Fixed(MASKED_PASSWORD_HASH.to_string()),
        );
        for phone in ["phone", "hotel_phone"] {
            rules.insert(phone.to_string(), MaskRule::Fixed("080-2222-2222".to_string()));
        }
        for whatsapp in ["whatsapp", "hotel_whatsapp"] {
            rules.insert(
                whatsapp.to_string(),
                MaskRule::Fixed("080-1111-1111".to_string()),
            );
        }
        Self { rules }
    }
}

impl TransformPolicy {
    /// A policy that masks nothing.
    pub fn empty() -> Self {
        Self {
            rules: BTreeMap::new(),
        }
    }

    pub fn with_rule(mut self, column: impl Into<String>, rule: MaskRule) -> Self {
        self.rules.insert(column.into(), rule);
        self
    }

    /// Overlay configured rules on top of this policy.
    pub fn merged(mut self, overrides: &BTreeMap<String, MaskRule>) -> Self {
        for (column, rule) in overrides {
            self.rules.insert(column.clone(), rule.clone());
        }
        self
    }

    pub fn rule(&self, column: &str) -> Option<&MaskRule> {
        self.rules.get(column)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Mask `record` in place. Returns the number of columns replaced.
    pub fn transform(&self, table: &str, record: &mut Record, primary_key: &str) -> usize {
        let key = record.get(primary_key).cloned();
        let mut replaced = 0;

        for (column, rule) in &self.rules {
            // The key itself is never masked; upserts and deletes depend on it
            if column == primary_key || !record.contains(column) {
                continue;
            }
            if let Some(value) = rule.render(table, key.as_ref()) {
                if record.replace(column, value) {
                    replaced += 1;
                }
            }
        }

        replaced
    }
}
