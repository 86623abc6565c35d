//! JoinGraph: project-wide directed graph of joinable views
//!
//! Edges are derived from view identifiers. Views that share an identifier
//! name are joinable; the identifier types on either side decide the
//! relationship. Fan-out edges only exist when the source view allows them.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use once_cell::sync::Lazy;
use petgraph::algo::{astar, tarjan_scc};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::unionfind::UnionFind;
use petgraph::visit::{Bfs, EdgeRef};

use super::join::{Join, JoinType, Relationship};
use super::view::{Identifier, IdentifierType, View};
use regex::Regex;

static BARE_REFERENCE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\$\{([A-Za-z0-9_]+)\}").unwrap());

#[derive(Debug, Clone, Default)]
pub struct JoinGraph {
    graph: DiGraph<String, Join>,
    nodes: BTreeMap<String, NodeIndex>,
    bridge_views: BTreeSet<String>,
    component_hashes: HashMap<String, String>,
    merge_groups: HashMap<String, String>,
}

impl JoinGraph {
    /// Build the graph for a set of views
    pub fn from_views(views: &[View]) -> Self {
        let mut sorted: Vec<&View> = views.iter().collect();
        sorted.sort_by(|a, b| a.name.cmp(&b.name));

        let mut joins = Vec::new();
        let mut bridge_views = BTreeSet::new();

        for view in &sorted {
            if view.has_composite_key() {
                bridge_views.insert(view.name.clone());
            }
            for identifier in view.identifiers.iter().filter(|i| i.r#type == IdentifierType::Join) {
                joins.extend(explicit_joins(view, identifier));
            }
        }

        for a in &sorted {
            for b in &sorted {
                if a.name == b.name {
                    continue;
                }
                for ia in a.identifiers.iter().filter(|i| i.r#type != IdentifierType::Join) {
                    for ib in b.identifiers.iter().filter(|i| i.name == ia.name) {
                        if let Some(join) = identifier_join(a, ia, b, ib) {
                            joins.push(join);
                        }
                    }
                }
            }
        }

        Self::from_joins(sorted.iter().map(|v| v.name.clone()), joins, bridge_views)
    }

    /// Build a graph from explicit joins. The first join declared for a pair wins.
    pub fn from_joins(
        view_names: impl IntoIterator<Item = String>,
        joins: Vec<Join>,
        bridge_views: BTreeSet<String>,
    ) -> Self {
        let mut graph = Self {
            bridge_views,
            ..Self::default()
        };
        let mut names: Vec<String> = view_names.into_iter().collect();
        names.sort();
        names.dedup();
        for name in names {
            graph.add_view(&name);
        }
        for join in joins {
            graph.add_join(join);
        }
        graph.compute_component_hashes();
        graph.compute_merge_groups();
        graph
    }

    fn add_view(&mut self, name: &str) -> NodeIndex {
        if let Some(idx) = self.nodes.get(name) {
            return *idx;
        }
        let idx = self.graph.add_node(name.to_string());
        self.nodes.insert(name.to_string(), idx);
        idx
    }

    fn add_join(&mut self, join: Join) {
        let from = self.add_view(&join.base_view);
        let to = self.add_view(&join.join_view);
        if self.graph.find_edge(from, to).is_none() {
            self.graph.add_edge(from, to, join);
        }
    }

    fn compute_component_hashes(&mut self) {
        let mut components: Vec<Vec<String>> = tarjan_scc(&self.graph)
            .into_iter()
            .map(|component| {
                let mut names: Vec<String> = component.into_iter().map(|idx| self.graph[idx].clone()).collect();
                names.sort();
                names
            })
            .collect();
        components.sort_by(|a, b| (Reverse(a.len()), &a[0]).cmp(&(Reverse(b.len()), &b[0])));

        self.component_hashes.clear();
        for (i, component) in components.into_iter().enumerate() {
            for name in component {
                self.component_hashes.insert(name, format!("subquery_{i}"));
            }
        }
    }

    /// Weakly connected components, ignoring join direction
    fn compute_merge_groups(&mut self) {
        let mut sets = UnionFind::new(self.graph.node_count());
        for edge in self.graph.edge_references() {
            sets.union(edge.source().index(), edge.target().index());
        }
        let mut groups: BTreeMap<usize, Vec<String>> = BTreeMap::new();
        for (name, idx) in &self.nodes {
            groups.entry(sets.find(idx.index())).or_default().push(name.clone());
        }
        let mut groups: Vec<Vec<String>> = groups.into_values().collect();
        groups.sort_by(|a, b| (Reverse(a.len()), &a[0]).cmp(&(Reverse(b.len()), &b[0])));

        self.merge_groups.clear();
        for (i, group) in groups.into_iter().enumerate() {
            for name in group {
                self.merge_groups.insert(name, format!("graph_{i}"));
            }
        }
    }

    pub fn contains_view(&self, view: &str) -> bool {
        self.nodes.contains_key(view)
    }

    pub fn view_names(&self) -> impl Iterator<Item = &String> {
        self.nodes.keys()
    }

    /// Returns the direct join from one view to another
    pub fn join(&self, from: &str, to: &str) -> Option<&Join> {
        let from_idx = self.nodes.get(from)?;
        let to_idx = self.nodes.get(to)?;
        self.graph
            .find_edge(*from_idx, *to_idx)
            .map(|edge| &self.graph[edge])
    }

    /// Outgoing joins of a view, ordered by weight and then target name
    pub fn outgoing(&self, view: &str) -> Vec<&Join> {
        let Some(idx) = self.nodes.get(view) else {
            return Vec::new();
        };
        let mut joins: Vec<&Join> = self.graph.edges(*idx).map(|edge| edge.weight()).collect();
        joins.sort_by(|a, b| {
            (a.relationship.weight(), &a.join_view).cmp(&(b.relationship.weight(), &b.join_view))
        });
        joins
    }

    /// Every join in the graph, sorted by endpoints
    pub fn joins(&self) -> Vec<&Join> {
        let mut joins: Vec<&Join> = self.graph.edge_weights().collect();
        joins.sort_by(|a, b| (&a.base_view, &a.join_view).cmp(&(&b.base_view, &b.join_view)));
        joins
    }

    /// Cheapest weighted join path between two views
    pub fn shortest_path(&self, from: &str, to: &str) -> Option<Vec<Join>> {
        let start = *self.nodes.get(from)?;
        let goal = *self.nodes.get(to)?;
        if start == goal {
            return Some(Vec::new());
        }

        let (_, path) = astar(
            &self.graph,
            start,
            |node| node == goal,
            |edge| edge.weight().relationship.weight(),
            |_| 0,
        )?;

        path.windows(2)
            .map(|pair| {
                self.graph
                    .find_edge(pair[0], pair[1])
                    .map(|edge| self.graph[edge].clone())
            })
            .collect()
    }

    /// Views reachable from `view`, including itself
    pub fn reachable_from(&self, view: &str) -> BTreeSet<String> {
        let mut reachable = BTreeSet::new();
        let Some(start) = self.nodes.get(view) else {
            return reachable;
        };
        let mut bfs = Bfs::new(&self.graph, *start);
        while let Some(idx) = bfs.next(&self.graph) {
            reachable.insert(self.graph[idx].clone());
        }
        reachable
    }

    pub fn is_bridge(&self, view: &str) -> bool {
        self.bridge_views.contains(view)
    }

    /// Name of the strongly connected component holding the view
    pub fn join_graph_hash(&self, view: &str) -> Option<&str> {
        self.component_hashes.get(view).map(String::as_str)
    }

    /// Name of the weakly connected group holding the view. Metrics in one
    /// group are compiled together when merging results.
    pub fn merge_group(&self, view: &str) -> Option<&str> {
        self.merge_groups.get(view).map(String::as_str)
    }

    /// Subgraph over `views`. Joins in `overrides` replace any existing join
    /// into the same view.
    pub fn restricted_to(&self, views: &BTreeSet<String>, overrides: Vec<Join>) -> JoinGraph {
        let overridden: BTreeSet<String> = overrides.iter().map(|j| j.join_view.clone()).collect();

        let mut joins = Vec::new();
        for join in overrides {
            let inverse = join.inverted();
            joins.push(join);
            if !inverse.relationship.is_fanout() {
                joins.push(inverse);
            }
        }
        joins.extend(
            self.joins()
                .into_iter()
                .filter(|j| views.contains(&j.base_view) && views.contains(&j.join_view))
                .filter(|j| !overridden.contains(&j.join_view) && !overridden.contains(&j.base_view))
                .cloned(),
        );

        let bridge_views = self
            .bridge_views
            .iter()
            .filter(|v| views.contains(*v))
            .cloned()
            .collect();
        JoinGraph::from_joins(views.iter().cloned(), joins, bridge_views)
    }
}

/// Qualify an identifier's key SQL with its view
fn key_sql(view: &View, identifier: &Identifier) -> String {
    if identifier.is_composite() {
        return identifier
            .identifiers
            .iter()
            .map(|part| key_sql(view, part))
            .collect::<Vec<_>>()
            .join(", ");
    }
    let sql = identifier
        .sql
        .clone()
        .unwrap_or_else(|| format!("${{{}}}", identifier.name));
    qualify_references(&sql, &view.name)
}

/// Rewrites `${TABLE}` and bare `${field}` references into `${view.field}` form
fn qualify_references(sql: &str, view_name: &str) -> String {
    let sql = sql.replace("${TABLE}", view_name);
    BARE_REFERENCE
        .replace_all(&sql, |caps: &regex::Captures| format!("${{{}.{}}}", view_name, &caps[1]))
        .into_owned()
}

fn identifier_join(a: &View, ia: &Identifier, b: &View, ib: &Identifier) -> Option<Join> {
    let relationship = match (ia.r#type, ib.r#type) {
        (IdentifierType::Foreign, IdentifierType::Primary) => Relationship::ManyToOne,
        (IdentifierType::Primary, IdentifierType::Primary) => Relationship::OneToOne,
        (IdentifierType::Primary, IdentifierType::Foreign) => Relationship::OneToMany,
        (IdentifierType::Foreign, IdentifierType::Foreign) => Relationship::ManyToMany,
        _ => return None,
    };
    if relationship.is_fanout() && !a.allowed_fanouts.iter().any(|v| v == &b.name) {
        return None;
    }

    let sql_on = if ia.is_composite() && ib.is_composite() {
        ia.identifiers
            .iter()
            .filter_map(|pa| {
                ib.identifiers
                    .iter()
                    .find(|pb| pb.name == pa.name)
                    .map(|pb| format!("{}={}", key_sql(a, pa), key_sql(b, pb)))
            })
            .collect::<Vec<_>>()
            .join(" and ")
    } else {
        format!("{}={}", key_sql(a, ia), key_sql(b, ib))
    };

    Some(Join::new(a.name.clone(), b.name.clone(), relationship, sql_on))
}

fn explicit_joins(view: &View, identifier: &Identifier) -> Vec<Join> {
    let (Some(reference), Some(sql_on)) = (&identifier.reference, &identifier.sql_on) else {
        return Vec::new();
    };
    let relationship = identifier.relationship.unwrap_or_default();
    let join = Join::new(
        view.name.clone(),
        reference.clone(),
        relationship,
        qualify_references(sql_on, &view.name),
    )
    .with_join_type(identifier.join_type.unwrap_or(JoinType::LeftOuter));

    let inverse = join.inverted();
    if inverse.relationship.is_fanout() {
        vec![join]
    } else {
        vec![join, inverse]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::field::Field;

    fn create_test_views() -> Vec<View> {
        vec![
            View::new("order_lines")
                .with_table("analytics.order_line_items")
                .with_field(Field::dimension("order_line_id", "${TABLE}.order_line_id").with_primary_key())
                .with_identifier(Identifier::primary("order_line_id", "${order_line_id}"))
                .with_identifier(Identifier::foreign("order_id", "${TABLE}.order_unique_id"))
                .with_identifier(Identifier::foreign("customer_id", "${TABLE}.customer_id")),
            View::new("orders")
                .with_table("analytics.orders")
                .with_identifier(Identifier::primary("order_id", "${TABLE}.id"))
                .with_identifier(Identifier::foreign("customer_id", "${TABLE}.customer_id")),
            View::new("customers")
                .with_table("analytics.customers")
                .with_identifier(Identifier::primary("customer_id", "${TABLE}.customer_id")),
            View::new("sessions").with_table("analytics.sessions"),
        ]
    }

    #[test]
    fn test_identifier_edges() {
        let graph = JoinGraph::from_views(&create_test_views());

        let join = graph.join("order_lines", "orders").unwrap();
        assert_eq!(join.relationship, Relationship::ManyToOne);
        assert_eq!(join.sql_on, "order_lines.order_unique_id=orders.id");

        // Fan-out edges are not created without allowed_fanouts
        assert!(graph.join("orders", "order_lines").is_none());
        assert!(graph.join("order_lines", "sessions").is_none());
    }

    #[test]
    fn test_allowed_fanout_adds_edge() {
        let mut views = create_test_views();
        views[2] = views[2].clone().with_allowed_fanout("orders");
        let graph = JoinGraph::from_views(&views);
        let join = graph.join("customers", "orders").unwrap();
        assert_eq!(join.relationship, Relationship::OneToMany);
    }

    #[test]
    fn test_shortest_path_prefers_low_weight() {
        let graph = JoinGraph::from_views(&create_test_views());
        let path = graph.shortest_path("order_lines", "customers").unwrap();
        assert_eq!(path.len(), 1);
        assert_eq!(path[0].join_view, "customers");
        assert!(graph.shortest_path("customers", "order_lines").is_none());
    }

    #[test]
    fn test_component_hashes_are_stable() {
        let graph = JoinGraph::from_views(&create_test_views());
        let first = graph.join_graph_hash("orders").unwrap().to_string();
        let again = JoinGraph::from_views(&create_test_views());
        assert_eq!(again.join_graph_hash("orders").unwrap(), first);
        assert_ne!(graph.join_graph_hash("sessions"), graph.join_graph_hash("orders"));
    }

    #[test]
    fn test_merge_groups_ignore_direction() {
        let graph = JoinGraph::from_views(&create_test_views());
        assert_ne!(graph.join_graph_hash("orders"), graph.join_graph_hash("customers"));
        assert_eq!(graph.merge_group("orders"), Some("graph_0"));
        assert_eq!(graph.merge_group("customers"), Some("graph_0"));
        assert_eq!(graph.merge_group("sessions"), Some("graph_1"));
    }

    #[test]
    fn test_explicit_join_identifier() {
        let views = vec![
            View::new("accounts")
                .with_table("crm.accounts")
                .with_identifier(Identifier::join(
                    "account_owner",
                    "employees",
                    Relationship::ManyToOne,
                    "${owner_id}=${employees.id}",
                )),
            View::new("employees").with_table("hr.employees"),
        ];
        let graph = JoinGraph::from_views(&views);
        let join = graph.join("accounts", "employees").unwrap();
        assert_eq!(join.sql_on, "${accounts.owner_id}=${employees.id}");
        assert!(graph.join("employees", "accounts").is_none());
        assert_eq!(graph.reachable_from("accounts").len(), 2);
    }
}
