//! Topics: curated, connected subsets of views with overriding joins

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::field::FieldFilter;
use super::join::{Join, JoinType, Relationship};
use super::view::AccessFilter;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TopicJoin {
    #[serde(default)]
    pub join_type: JoinType,
    #[serde(default)]
    pub relationship: Relationship,
    pub sql_on: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TopicView {
    pub join: Option<TopicJoin>,
    #[serde(default)]
    pub override_access_filters: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Topic {
    pub name: String,
    pub model_name: Option<String>,
    pub base_view: String,
    #[serde(default)]
    pub views: BTreeMap<String, TopicView>,
    #[serde(default)]
    pub always_filter: Vec<FieldFilter>,
    #[serde(default)]
    pub access_filters: Vec<AccessFilter>,
    #[serde(default)]
    pub required_access_grants: Vec<String>,
}

impl Topic {
    pub fn new(name: impl Into<String>, base_view: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            model_name: None,
            base_view: base_view.into(),
            views: BTreeMap::new(),
            always_filter: Vec::new(),
            access_filters: Vec::new(),
            required_access_grants: Vec::new(),
        }
    }

    pub fn with_view(mut self, view: impl Into<String>) -> Self {
        self.views.insert(view.into(), TopicView::default());
        self
    }

    pub fn with_joined_view(
        mut self,
        view: impl Into<String>,
        relationship: Relationship,
        sql_on: impl Into<String>,
    ) -> Self {
        self.views.insert(
            view.into(),
            TopicView {
                join: Some(TopicJoin {
                    join_type: JoinType::LeftOuter,
                    relationship,
                    sql_on: sql_on.into(),
                }),
                override_access_filters: false,
            },
        );
        self
    }

    pub fn with_always_filter(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.always_filter.push(FieldFilter::new(field, value));
        self
    }

    /// Returns true if the view is the base view or listed in the topic
    pub fn contains_view(&self, view: &str) -> bool {
        view == self.base_view || self.views.contains_key(view)
    }

    pub fn view_names(&self) -> Vec<&str> {
        let mut names = vec![self.base_view.as_str()];
        names.extend(self.views.keys().map(String::as_str).filter(|v| *v != self.base_view));
        names
    }

    /// Joins declared in the topic. The joined side is the topic view; the base
    /// side is the first other view referenced in the ON condition.
    pub fn declared_joins(&self) -> Vec<Join> {
        let mut joins = Vec::new();
        for (view_name, topic_view) in &self.views {
            let Some(join) = &topic_view.join else {
                continue;
            };
            let candidate = Join::new("", view_name.clone(), join.relationship, join.sql_on.clone())
                .with_join_type(join.join_type);
            let base = candidate
                .referenced_views()
                .into_iter()
                .find(|v| v != view_name)
                .unwrap_or_else(|| self.base_view.clone());
            joins.push(Join {
                base_view: base,
                ..candidate
            });
        }
        joins
    }

    /// Returns true if the view's own access filters are replaced by the topic's
    pub fn overrides_access_filters(&self, view: &str) -> bool {
        self.views
            .get(view)
            .map(|v| v.override_access_filters)
            .unwrap_or(false)
    }
}
