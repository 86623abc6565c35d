//! Joins: typed edges between two views

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::dependency::extract_references;

/// Declared cardinality of a join
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Relationship {
    OneToOne,
    #[default]
    ManyToOne,
    OneToMany,
    ManyToMany,
}

impl Relationship {
    pub fn inverse(&self) -> Self {
        match self {
            Relationship::OneToOne => Relationship::OneToOne,
            Relationship::ManyToOne => Relationship::OneToMany,
            Relationship::OneToMany => Relationship::ManyToOne,
            Relationship::ManyToMany => Relationship::ManyToMany,
        }
    }

    /// Returns true when one base row can match several joined rows
    pub fn is_fanout(&self) -> bool {
        matches!(self, Relationship::OneToMany | Relationship::ManyToMany)
    }

    /// Path cost used when searching for joins. Lower is preferred.
    pub fn weight(&self) -> u32 {
        match self {
            Relationship::OneToOne => 1,
            Relationship::ManyToOne => 2,
            Relationship::OneToMany => 3,
            Relationship::ManyToMany => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Relationship::OneToOne => "one_to_one",
            Relationship::ManyToOne => "many_to_one",
            Relationship::OneToMany => "one_to_many",
            Relationship::ManyToMany => "many_to_many",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JoinType {
    #[default]
    #[serde(alias = "left")]
    LeftOuter,
    Inner,
    #[serde(alias = "full")]
    FullOuter,
    Cross,
}

impl JoinType {
    pub fn as_sql(&self) -> &'static str {
        match self {
            JoinType::LeftOuter => "LEFT JOIN",
            JoinType::Inner => "INNER JOIN",
            JoinType::FullOuter => "FULL OUTER JOIN",
            JoinType::Cross => "CROSS JOIN",
        }
    }
}

/// A resolved join from `base_view` to `join_view`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Join {
    pub base_view: String,
    pub join_view: String,
    pub relationship: Relationship,
    pub join_type: JoinType,
    /// ON condition with `${view.field}` references
    pub sql_on: String,
}

impl Join {
    pub fn new(
        base_view: impl Into<String>,
        join_view: impl Into<String>,
        relationship: Relationship,
        sql_on: impl Into<String>,
    ) -> Self {
        Self {
            base_view: base_view.into(),
            join_view: join_view.into(),
            relationship,
            join_type: JoinType::LeftOuter,
            sql_on: sql_on.into(),
        }
    }

    pub fn with_join_type(mut self, join_type: JoinType) -> Self {
        self.join_type = join_type;
        self
    }

    /// The same join traversed from the other side
    pub fn inverted(&self) -> Self {
        Self {
            base_view: self.join_view.clone(),
            join_view: self.base_view.clone(),
            relationship: self.relationship.inverse(),
            join_type: self.join_type,
            sql_on: self.sql_on.clone(),
        }
    }

    /// Views named by qualified references in the ON condition
    pub fn referenced_views(&self) -> BTreeSet<String> {
        extract_references(&self.sql_on)
            .iter()
            .filter_map(|token| token.split_once('.').map(|(view, _)| view.trim().to_string()))
            .collect()
    }

    /// Views other than the two endpoints that must already be joined
    pub fn dependencies(&self) -> BTreeSet<String> {
        self.referenced_views()
            .into_iter()
            .filter(|v| v != &self.base_view && v != &self.join_view)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inverse_relationships() {
        assert_eq!(Relationship::ManyToOne.inverse(), Relationship::OneToMany);
        assert_eq!(Relationship::OneToOne.inverse(), Relationship::OneToOne);
        assert!(Relationship::OneToMany.is_fanout());
        assert!(!Relationship::ManyToOne.is_fanout());
        assert!(Relationship::OneToOne.weight() < Relationship::ManyToMany.weight());
    }

    #[test]
    fn test_join_dependencies() {
        let join = Join::new(
            "orders",
            "discounts",
            Relationship::ManyToOne,
            "${orders.order_id}=${discounts.order_id} and ${customers.region}=${discounts.region}",
        );

        let referenced = join.referenced_views();
        assert_eq!(referenced.len(), 3);
        assert_eq!(
            join.dependencies().into_iter().collect::<Vec<_>>(),
            vec!["customers".to_string()]
        );

        let inverted = join.inverted();
        assert_eq!(inverted.base_view, "discounts");
        assert_eq!(inverted.relationship, Relationship::OneToMany);
    }
}
