//! Views: named collections of fields bound to a table or derived SQL

use serde::{Deserialize, Serialize};

use super::field::{Field, FieldFilter, Grain};
use super::join::{JoinType, Relationship};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentifierType {
    Primary,
    Foreign,
    Join,
}

/// Join key declared on a view. Views sharing an identifier name are joinable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identifier {
    pub name: String,
    pub r#type: IdentifierType,
    /// Key SQL, defaults to `${<name>}`
    pub sql: Option<String>,
    /// Target view for `join` identifiers
    pub reference: Option<String>,
    pub relationship: Option<Relationship>,
    pub sql_on: Option<String>,
    pub join_type: Option<JoinType>,
    /// Parts of a composite key
    #[serde(default)]
    pub identifiers: Vec<Identifier>,
}

impl Identifier {
    fn new(name: impl Into<String>, r#type: IdentifierType) -> Self {
        Self {
            name: name.into(),
            r#type,
            sql: None,
            reference: None,
            relationship: None,
            sql_on: None,
            join_type: None,
            identifiers: Vec::new(),
        }
    }

    pub fn primary(name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            sql: Some(sql.into()),
            ..Self::new(name, IdentifierType::Primary)
        }
    }

    pub fn foreign(name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            sql: Some(sql.into()),
            ..Self::new(name, IdentifierType::Foreign)
        }
    }

    /// Explicit join to `reference`
    pub fn join(
        name: impl Into<String>,
        reference: impl Into<String>,
        relationship: Relationship,
        sql_on: impl Into<String>,
    ) -> Self {
        Self {
            reference: Some(reference.into()),
            relationship: Some(relationship),
            sql_on: Some(sql_on.into()),
            ..Self::new(name, IdentifierType::Join)
        }
    }

    pub fn with_join_type(mut self, join_type: JoinType) -> Self {
        self.join_type = Some(join_type);
        self
    }

    pub fn is_composite(&self) -> bool {
        !self.identifiers.is_empty()
    }
}

/// Row-level restriction driven by a user attribute
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessFilter {
    pub field: String,
    pub user_attribute: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DerivedTable {
    pub sql: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct View {
    pub name: String,
    pub model_name: Option<String>,
    pub sql_table_name: Option<String>,
    pub derived_table: Option<DerivedTable>,
    /// Dimension group used as the canon date of this view's measures
    pub default_date: Option<String>,
    #[serde(default)]
    pub fields: Vec<Field>,
    #[serde(default)]
    pub identifiers: Vec<Identifier>,
    #[serde(default)]
    pub access_filters: Vec<AccessFilter>,
    #[serde(default)]
    pub always_filter: Vec<FieldFilter>,
    #[serde(default)]
    pub required_access_grants: Vec<String>,
    /// Views this view may fan out to through identifiers
    #[serde(default)]
    pub allowed_fanouts: Vec<String>,
}

impl View {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            model_name: None,
            sql_table_name: None,
            derived_table: None,
            default_date: None,
            fields: Vec::new(),
            identifiers: Vec::new(),
            access_filters: Vec::new(),
            always_filter: Vec::new(),
            required_access_grants: Vec::new(),
            allowed_fanouts: Vec::new(),
        }
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.sql_table_name = Some(table.into());
        self
    }

    pub fn with_derived_sql(mut self, sql: impl Into<String>) -> Self {
        self.derived_table = Some(DerivedTable { sql: sql.into() });
        self
    }

    pub fn with_model(mut self, model_name: impl Into<String>) -> Self {
        self.model_name = Some(model_name.into());
        self
    }

    pub fn with_default_date(mut self, default_date: impl Into<String>) -> Self {
        self.default_date = Some(default_date.into());
        self
    }

    pub fn with_field(mut self, field: Field) -> Self {
        self.fields.push(field);
        self
    }

    pub fn with_identifier(mut self, identifier: Identifier) -> Self {
        self.identifiers.push(identifier);
        self
    }

    pub fn with_access_filter(mut self, field: impl Into<String>, user_attribute: impl Into<String>) -> Self {
        self.access_filters.push(AccessFilter {
            field: field.into(),
            user_attribute: user_attribute.into(),
        });
        self
    }

    pub fn with_always_filter(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.always_filter.push(FieldFilter::new(field, value));
        self
    }

    pub fn with_allowed_fanout(mut self, view: impl Into<String>) -> Self {
        self.allowed_fanouts.push(view.into());
        self
    }

    pub fn with_required_access_grant(mut self, grant: impl Into<String>) -> Self {
        self.required_access_grants.push(grant.into());
        self
    }

    /// Returns the primary key field, if one is declared
    pub fn primary_key(&self) -> Option<&Field> {
        self.fields.iter().find(|f| f.primary_key)
    }

    /// Finds a field by its requested name, including grain suffixes
    pub fn get_field(&self, name: &str) -> Option<(&Field, Option<Grain>)> {
        self.fields
            .iter()
            .find_map(|f| f.matches_name(name).map(|grain| (f, grain)))
    }

    pub fn fields_with_tag<'a>(&'a self, tag: &'a str) -> impl Iterator<Item = &'a Field> + 'a {
        self.fields.iter().filter(move |f| f.tags.iter().any(|t| t == tag))
    }

    pub fn has_composite_key(&self) -> bool {
        self.identifiers.iter().any(Identifier::is_composite)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::field::TimeFrame;

    fn create_test_view() -> View {
        View::new("orders")
            .with_table("analytics.orders")
            .with_default_date("order")
            .with_field(Field::dimension("id", "${TABLE}.id").with_primary_key())
            .with_field(Field::time_group("order", "${TABLE}.order_date", vec![TimeFrame::Date]))
            .with_field(Field::dimension("customer_id", "${TABLE}.customer_id").with_tag("customer"))
            .with_identifier(Identifier::primary("order_id", "${id}"))
    }

    #[test]
    fn test_primary_key() {
        let view = create_test_view();
        assert_eq!(view.primary_key().map(|f| f.name.as_str()), Some("id"));
    }

    #[test]
    fn test_get_field_with_grain() {
        let view = create_test_view();
        let (field, grain) = view.get_field("order_date").unwrap();
        assert_eq!(field.name, "order");
        assert_eq!(grain, Some(Grain::Time(TimeFrame::Date)));
        assert!(view.get_field("order_month").is_none());
    }

    #[test]
    fn test_fields_with_tag() {
        let view = create_test_view();
        let tagged: Vec<_> = view.fields_with_tag("customer").map(|f| f.name.as_str()).collect();
        assert_eq!(tagged, vec!["customer_id"]);
    }
}
