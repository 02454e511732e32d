//! Rule Registry: the ordered, enable/disable-able collection of rules
use crate::validation::{validate_name, validate_script};
use crate::RegistryError;
use authrules_core::RuleDefinition;
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Partial update addressed by rule name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub script: Option<String>,
    #[serde(default)]
    pub order: Option<i64>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

/// Immutable, ranked view of the enabled rules at one point in time.
///
/// Iterating it is cheap and can be repeated; later registry changes are
/// never visible through an existing snapshot.
#[derive(Debug, Clone)]
pub struct RuleSnapshot {
    rules: Arc<[RuleDefinition]>,
}

impl RuleSnapshot {
    pub fn iter(&self) -> std::slice::Iter<'_, RuleDefinition> {
        self.rules.iter()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.name.as_str()).collect()
    }

    /// Content digest over name, order and script of every rule.
    pub fn digest(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        for rule in self.rules.iter() {
            hasher.update(rule.name.as_bytes());
            hasher.update(&[0]);
            hasher.update(&rule.order.to_le_bytes());
            hasher.update(rule.script.as_bytes());
            hasher.update(&[0]);
        }
        format!("blake3:{}", hasher.finalize())
    }
}

impl<'a> IntoIterator for &'a RuleSnapshot {
    type Item = &'a RuleDefinition;
    type IntoIter = std::slice::Iter<'a, RuleDefinition>;

    fn into_iter(self) -> Self::IntoIter {
        self.rules.iter()
    }
}

#[derive(Debug, Default)]
struct Inner {
    rules: Vec<RuleDefinition>,
    next_sequence: u64,
}

impl Inner {
    fn position(&self, name: &str) -> Option<usize> {
        self.rules.iter().position(|r| r.name == name)
    }

    fn next_order(&self) -> Result<i64, RegistryError> {
        self.rules
            .iter()
            .map(|r| r.order)
            .max()
            .unwrap_or(0)
            .checked_add(1)
            .ok_or_else(|| {
                RegistryError::Validation(
                    "order is required when an existing rule has the maximum order".to_string(),
                )
            })
    }
}

#[derive(Debug, Default)]
pub struct RuleRegistry {
    inner: RwLock<Inner>,
}

impl RuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a rule. A missing `order` becomes `max(existing) + 1`.
    pub fn create(
        &self,
        name: impl Into<String>,
        script: impl Into<String>,
        order: Option<i64>,
        enabled: Option<bool>,
    ) -> Result<RuleDefinition, RegistryError> {
        let name = name.into();
        let script = script.into();
        validate_name(&name)?;
        validate_script(&script)?;

        let mut inner = self.inner.write();
        if inner.position(&name).is_some() {
            return Err(RegistryError::DuplicateName(name));
        }

        let order = match order {
            Some(order) => order,
            None => inner.next_order()?,
        };
        let now = Utc::now();
        let rule = RuleDefinition {
            id: Uuid::new_v4(),
            order,
            name,
            script,
            enabled: enabled.unwrap_or(true),
            created_at: now,
            updated_at: now,
            sequence: inner.next_sequence,
        };
        inner.next_sequence += 1;
        inner.rules.push(rule.clone());

        tracing::info!(
            rule = %rule.name,
            order = rule.order,
            enabled = rule.enabled,
            "rule created"
        );
        Ok(rule)
    }

    pub fn update(&self, name: &str, update: RuleUpdate) -> Result<RuleDefinition, RegistryError> {
        if let Some(new_name) = &update.name {
            validate_name(new_name)?;
        }
        if let Some(script) = &update.script {
            validate_script(script)?;
        }

        let mut inner = self.inner.write();
        let index = inner
            .position(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;

        if let Some(new_name) = &update.name {
            if new_name != name && inner.position(new_name).is_some() {
                return Err(RegistryError::DuplicateName(new_name.clone()));
            }
        }

        let rule = &mut inner.rules[index];
        if let Some(new_name) = update.name {
            rule.name = new_name;
        }
        if let Some(script) = update.script {
            rule.script = script;
        }
        if let Some(order) = update.order {
            rule.order = order;
        }
        if let Some(enabled) = update.enabled {
            rule.enabled = enabled;
        }
        rule.updated_at = Utc::now();

        tracing::info!(
            rule = %rule.name,
            order = rule.order,
            enabled = rule.enabled,
            "rule updated"
        );
        Ok(rule.clone())
    }

    pub fn delete(&self, name: &str) -> Result<RuleDefinition, RegistryError> {
        let mut inner = self.inner.write();
        let index = inner
            .position(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        let removed = inner.rules.remove(index);
        tracing::info!(rule = %removed.name, "rule deleted");
        Ok(removed)
    }

    pub fn enable(&self, name: &str) -> Result<RuleDefinition, RegistryError> {
        self.update(
            name,
            RuleUpdate {
                enabled: Some(true),
                ..Default::default()
            },
        )
    }

    pub fn disable(&self, name: &str) -> Result<RuleDefinition, RegistryError> {
        self.update(
            name,
            RuleUpdate {
                enabled: Some(false),
                ..Default::default()
            },
        )
    }

    pub fn get(&self, name: &str) -> Option<RuleDefinition> {
        let inner = self.inner.read();
        inner.position(name).map(|i| inner.rules[i].clone())
    }

    /// Every rule, enabled or not, in rank order.
    pub fn all(&self) -> Vec<RuleDefinition> {
        let mut rules = self.inner.read().rules.clone();
        rules.sort_by_key(|r| r.rank());
        rules
    }

    /// Enabled rules, ascending by `order`, earliest-created first on ties.
    pub fn list(&self) -> RuleSnapshot {
        let mut rules: Vec<RuleDefinition> = self
            .inner
            .read()
            .rules
            .iter()
            .filter(|r| r.enabled)
            .cloned()
            .collect();
        rules.sort_by_key(|r| r.rank());
        RuleSnapshot {
            rules: rules.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().rules.is_empty()
    }
}
