//! Prefix-partitioned storage configuration.

use crate::job::PrefixValue;
use std::collections::BTreeMap;

/// The declared type of a prefix column, constraining what values callers
/// may bind to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefixColumnKind {
    UuidText,
    Integer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefixColumn {
    pub name: String,
    pub kind: PrefixColumnKind,
}

impl PrefixColumn {
    pub fn uuid(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: PrefixColumnKind::UuidText,
        }
    }

    pub fn integer(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: PrefixColumnKind::Integer,
        }
    }
}

/// A storage instance's declared prefix columns and the fixed values this
/// particular instance is scoped to. An empty schema means no partitioning:
/// every query is scoped by `queue_name` alone.
#[derive(Debug, Clone, Default)]
pub struct PrefixSchema {
    columns: Vec<PrefixColumn>,
    values: BTreeMap<String, PrefixValue>,
}

impl PrefixSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(mut self, column: PrefixColumn, value: PrefixValue) -> Self {
        self.values.insert(column.name.clone(), value);
        self.columns.push(column);
        self
    }

    pub fn columns(&self) -> &[PrefixColumn] {
        &self.columns
    }

    pub fn values(&self) -> &BTreeMap<String, PrefixValue> {
        &self.values
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Table name derivation: `job_queue` bare, or
    /// `job_queue_<p1>_<p2>_...` with prefix column names appended in
    /// declaration order, so differently-shaped partitioning schemes never
    /// collide on one table.
    pub fn table_name(&self) -> String {
        if self.columns.is_empty() {
            return "job_queue".to_string();
        }
        let mut name = String::from("job_queue");
        for col in &self.columns {
            name.push('_');
            name.push_str(&col.name);
        }
        name
    }

    /// True if `other` is a strictly broader or equal scope that could
    /// observe rows written under `self` (used by the subscription manager
    /// to decide whether a custom filter needs its own polling loop).
    pub fn scopes_equal(&self, other: &PrefixSchema) -> bool {
        self.values == other.values
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn bare_table_name_has_no_suffix() {
        let schema = PrefixSchema::new();
        assert_eq!(schema.table_name(), "job_queue");
    }

    #[test]
    fn prefixed_table_name_appends_column_names() {
        let schema = PrefixSchema::new()
            .with_value(PrefixColumn::uuid("tenant"), PrefixValue::Uuid(Uuid::nil()))
            .with_value(PrefixColumn::integer("project"), PrefixValue::Int(7));
        assert_eq!(schema.table_name(), "job_queue_tenant_project");
    }

    #[test]
    fn distinct_partitioning_schemes_never_collide() {
        let a = PrefixSchema::new().with_value(PrefixColumn::uuid("tenant"), PrefixValue::Uuid(Uuid::nil()));
        let b = PrefixSchema::new().with_value(PrefixColumn::integer("shard"), PrefixValue::Int(1));
        assert_ne!(a.table_name(), b.table_name());
    }

    #[test]
    fn scopes_equal_compares_values() {
        let a = PrefixSchema::new().with_value(PrefixColumn::integer("tenant"), PrefixValue::Int(1));
        let b = PrefixSchema::new().with_value(PrefixColumn::integer("tenant"), PrefixValue::Int(1));
        let c = PrefixSchema::new().with_value(PrefixColumn::integer("tenant"), PrefixValue::Int(2));
        assert!(a.scopes_equal(&b));
        assert!(!a.scopes_equal(&c));
    }
}
