//! Design: the join plan for one query
//!
//! Picks an ordered join sequence from the base view to every view the query
//! needs, then derives the functional primary key of the joined rows and
//! which views need symmetric aggregates.

use std::collections::{BTreeSet, VecDeque};

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use tracing::debug;

use crate::core::{Join, JoinGraph, Project, Relationship, Topic, View};
use crate::error::{MetricsLayerError, Result};

/// Grain of the joined result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FunctionalPk {
    /// One row per row of this view
    View(String),
    /// The join fans out in incompatible directions
    DoesNotExist,
}

#[derive(Debug, Clone)]
pub struct Design<'p> {
    base_view: &'p View,
    joins: Vec<Join>,
    functional_pk: FunctionalPk,
    symmetric_views: BTreeSet<String>,
}

impl<'p> Design<'p> {
    /// Plan joins covering every view in `required`.
    ///
    /// In a topic the base view is the topic's. Otherwise candidates are tried
    /// in `preferred` order, then the remaining required views by name; the
    /// first root whose induced subgraph reaches every required view wins.
    pub fn new(
        project: &'p Project,
        required: &BTreeSet<String>,
        preferred: &[&str],
        topic: Option<&Topic>,
    ) -> Result<Self> {
        let (base_name, joins) = match topic {
            Some(topic) => {
                if let Some(outside) = required.iter().find(|v| !topic.contains_view(v)) {
                    return Err(MetricsLayerError::topic_join(format!(
                        "The view {outside} is not included in the topic {}. Add it to the topic or remove it from the query",
                        topic.name
                    )));
                }
                let mut required = required.clone();
                required.insert(topic.base_view.clone());
                let views: BTreeSet<String> = topic.view_names().into_iter().map(str::to_string).collect();
                let graph = project.join_graph().restricted_to(&views, topic.declared_joins());
                let joins = solve_joins(&graph, &topic.base_view, &required).map_err(|e| match e {
                    MetricsLayerError::Join { message, .. } => MetricsLayerError::topic_join(message),
                    other => other,
                })?;
                (topic.base_view.clone(), joins)
            }
            None => {
                let mut candidates: Vec<&str> = Vec::new();
                for name in preferred.iter().copied().chain(required.iter().map(String::as_str)) {
                    if required.contains(name) && !candidates.contains(&name) {
                        candidates.push(name);
                    }
                }
                solve_from_candidates(project.join_graph(), &candidates, required)?
            }
        };

        let base = project.get_view(&base_name)?;
        let functional_pk = functional_pk(&base.name, &joins);
        let symmetric_views = symmetric_views(&base.name, &joins, &functional_pk);
        debug!(
            base = %base.name,
            joins = ?joins.iter().map(|j| j.join_view.as_str()).collect::<Vec<_>>(),
            functional_pk = ?functional_pk,
            "resolved join path"
        );

        Ok(Self {
            base_view: base,
            joins,
            functional_pk,
            symmetric_views,
        })
    }

    pub fn base_view(&self) -> &'p View {
        self.base_view
    }

    pub fn joins(&self) -> &[Join] {
        &self.joins
    }

    pub fn functional_pk(&self) -> &FunctionalPk {
        &self.functional_pk
    }

    /// Views whose measures must use symmetric aggregates
    pub fn symmetric_views(&self) -> &BTreeSet<String> {
        &self.symmetric_views
    }

    pub fn views(&self) -> Vec<&str> {
        let mut views = vec![self.base_view.name.as_str()];
        views.extend(self.joins.iter().map(|j| j.join_view.as_str()));
        views
    }
}

/// Picks the base view and its joins. Every candidate is first tried with
/// the induced subgraph alone; only then are paths through other views used.
fn solve_from_candidates(
    graph: &JoinGraph,
    candidates: &[&str],
    required: &BTreeSet<String>,
) -> Result<(String, Vec<Join>)> {
    let Some(first) = candidates.first() else {
        return Err(MetricsLayerError::Query(
            "A query needs at least one field to choose a base view".to_string(),
        ));
    };
    if required.len() == 1 {
        return Ok((first.to_string(), Vec::new()));
    }
    for base in candidates {
        if let Some(joins) = induced_tree(graph, base, required) {
            return Ok((base.to_string(), joins));
        }
    }
    let mut first_error = None;
    for base in candidates {
        match solve_joins(graph, base, required) {
            Ok(joins) => return Ok((base.to_string(), joins)),
            Err(e) if e.is_recoverable_join_error() => {
                first_error.get_or_insert(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(first_error.unwrap_or_else(|| no_join_path(first, required)))
}

/// Ordered joins from `base` covering `required`
pub fn solve_joins(graph: &JoinGraph, base: &str, required: &BTreeSet<String>) -> Result<Vec<Join>> {
    if required.iter().all(|v| v == base) {
        return Ok(Vec::new());
    }

    if let Some(joins) = induced_tree(graph, base, required) {
        return Ok(joins);
    }

    if required.len() == 2 {
        let missing: BTreeSet<String> = required.iter().filter(|v| *v != base).cloned().collect();
        if let Some(other) = missing.iter().next() {
            if let Some(path) = graph.shortest_path(base, other) {
                return Ok(clean(base, path));
            }
        }
        return Err(no_join_path(base, &missing));
    }

    greedy(graph, base, required)
}

/// BFS over the subgraph induced by the required views, ordered through the
/// line graph of the tree's joins
fn induced_tree(graph: &JoinGraph, base: &str, required: &BTreeSet<String>) -> Option<Vec<Join>> {
    let mut visited = BTreeSet::from([base.to_string()]);
    let mut queue = VecDeque::from([base.to_string()]);
    let mut tree = Vec::new();
    while let Some(view) = queue.pop_front() {
        for join in graph.outgoing(&view) {
            if required.contains(&join.join_view) && visited.insert(join.join_view.clone()) {
                queue.push_back(join.join_view.clone());
                tree.push(join.clone());
            }
        }
    }
    if required.iter().any(|v| !visited.contains(v)) {
        return None;
    }
    if tree
        .iter()
        .any(|join| join.dependencies().iter().any(|dep| !visited.contains(dep)))
    {
        return None;
    }
    order_joins(tree).map(|ordered| clean(base, ordered))
}

/// Topologically sorts joins so each join follows the joins it builds on.
/// Among joins that are ready, the earliest in BFS order goes first.
fn order_joins(joins: Vec<Join>) -> Option<Vec<Join>> {
    let mut line: DiGraph<usize, ()> = DiGraph::new();
    let nodes: Vec<NodeIndex> = (0..joins.len()).map(|i| line.add_node(i)).collect();
    for (i, before) in joins.iter().enumerate() {
        for (j, after) in joins.iter().enumerate() {
            if i != j
                && (after.base_view == before.join_view || after.dependencies().contains(&before.join_view))
            {
                line.add_edge(nodes[i], nodes[j], ());
            }
        }
    }

    let mut in_degree: Vec<usize> = nodes
        .iter()
        .map(|idx| line.neighbors_directed(*idx, Direction::Incoming).count())
        .collect();
    let mut ready: BTreeSet<usize> = (0..joins.len()).filter(|i| in_degree[*i] == 0).collect();
    let mut order = Vec::with_capacity(joins.len());
    while let Some(next) = ready.pop_first() {
        order.push(next);
        for successor in line.neighbors_directed(nodes[next], Direction::Outgoing) {
            let position = line[successor];
            in_degree[position] -= 1;
            if in_degree[position] == 0 {
                ready.insert(position);
            }
        }
    }
    if order.len() != joins.len() {
        return None;
    }
    Some(order.into_iter().map(|i| joins[i].clone()).collect())
}

/// Drops self joins and joins into views that are already joined
fn clean(base: &str, joins: Vec<Join>) -> Vec<Join> {
    let mut joined = BTreeSet::from([base.to_string()]);
    joins
        .into_iter()
        .filter(|join| join.base_view != join.join_view && joined.insert(join.join_view.clone()))
        .collect()
}

fn reached(base: &str, joins: &[Join]) -> BTreeSet<String> {
    let mut views = BTreeSet::from([base.to_string()]);
    views.extend(joins.iter().map(|j| j.join_view.clone()));
    views
}

/// Approximate cover for more than two views: seed with each candidate edge,
/// then patch in missing views by the cheapest path from any reached view
fn greedy(graph: &JoinGraph, base: &str, required: &BTreeSet<String>) -> Result<Vec<Join>> {
    let mut candidates: Vec<&Join> = graph
        .joins()
        .into_iter()
        .filter(|j| required.contains(&j.base_view) || required.contains(&j.join_view))
        .collect();
    candidates.sort_by_key(|j| {
        let bridge = graph.is_bridge(&j.base_view) || graph.is_bridge(&j.join_view);
        let induced = required.contains(&j.base_view) && required.contains(&j.join_view);
        (!bridge, !induced, j.base_view.clone(), j.join_view.clone())
    });

    let mut fewest_missing: Option<BTreeSet<String>> = None;
    for candidate in candidates {
        let Some(mut seed) = graph.shortest_path(base, &candidate.base_view) else {
            continue;
        };
        seed.push(candidate.clone());
        let (joins, missing) = patch(graph, base, required, clean(base, seed));
        if missing.is_empty() {
            return Ok(joins);
        }
        if fewest_missing.as_ref().map_or(true, |m| missing.len() < m.len()) {
            fewest_missing = Some(missing);
        }
    }

    let (joins, missing) = patch(graph, base, required, Vec::new());
    if missing.is_empty() {
        return Ok(joins);
    }
    let missing = match fewest_missing {
        Some(fewest) if fewest.len() < missing.len() => fewest,
        _ => missing,
    };
    Err(no_join_path(base, &missing))
}

fn patch(
    graph: &JoinGraph,
    base: &str,
    required: &BTreeSet<String>,
    mut joins: Vec<Join>,
) -> (Vec<Join>, BTreeSet<String>) {
    loop {
        let reached_views = reached(base, &joins);
        let missing: BTreeSet<String> = required.difference(&reached_views).cloned().collect();
        if missing.is_empty() {
            return (joins, missing);
        }

        let mut best: Option<(u32, Vec<Join>)> = None;
        for target in &missing {
            for source in &reached_views {
                let Some(path) = graph.shortest_path(source, target) else {
                    continue;
                };
                let cost: u32 = path.iter().map(|j| j.relationship.weight()).sum();
                if best.as_ref().map_or(true, |(c, _)| cost < *c) {
                    best = Some((cost, path));
                }
            }
            if best.is_some() {
                break;
            }
        }

        match best {
            Some((_, path)) => {
                joins.extend(path);
                joins = clean(base, joins);
            }
            None => return (joins, missing),
        }
    }
}

fn no_join_path(base: &str, missing: &BTreeSet<String>) -> MetricsLayerError {
    MetricsLayerError::join(format!(
        "There was no join path between the view {base} and the views: {}. \
Check the identifiers on your views and make sure they are joinable.",
        missing.iter().cloned().collect::<Vec<_>>().join(", ")
    ))
}

/// Joins from the base view leading to joins[index], in order
fn path_to(joins: &[Join], index: usize, base: &str) -> Vec<usize> {
    let mut path = vec![index];
    let mut current = index;
    while joins[current].base_view != base {
        match (0..current).rev().find(|&k| joins[k].join_view == joins[current].base_view) {
            Some(parent) => {
                path.push(parent);
                current = parent;
            }
            None => break,
        }
    }
    path.reverse();
    path
}

fn functional_pk(base: &str, joins: &[Join]) -> FunctionalPk {
    if joins.is_empty() {
        return FunctionalPk::View(base.to_string());
    }
    if joins.iter().any(|j| j.relationship == Relationship::ManyToMany) {
        return FunctionalPk::DoesNotExist;
    }

    let mut sequences: Vec<Vec<&str>> = Vec::with_capacity(joins.len());
    for index in 0..joins.len() {
        let mut fanouts = Vec::new();
        let mut previous = None;
        for step in path_to(joins, index, base) {
            let join = &joins[step];
            if join.relationship == Relationship::OneToMany {
                if previous == Some(Relationship::ManyToOne) {
                    return FunctionalPk::DoesNotExist;
                }
                fanouts.push(join.join_view.as_str());
            }
            previous = Some(join.relationship);
        }
        sequences.push(fanouts);
    }

    let Some(longest) = sequences.iter().reduce(|a, b| if b.len() > a.len() { b } else { a }) else {
        return FunctionalPk::View(base.to_string());
    };
    if sequences.iter().any(|s| !longest.starts_with(s)) {
        return FunctionalPk::DoesNotExist;
    }
    FunctionalPk::View(longest.last().copied().unwrap_or(base).to_string())
}

fn symmetric_views(base: &str, joins: &[Join], functional_pk: &FunctionalPk) -> BTreeSet<String> {
    let views = reached(base, joins);
    let fanouts = joins
        .iter()
        .filter(|j| j.relationship == Relationship::OneToMany)
        .count();
    let grain = match functional_pk {
        FunctionalPk::View(grain) if fanouts <= 1 => grain,
        _ => return views,
    };

    // Views tied to the grain purely through one-to-one joins keep its row count
    let mut linked = BTreeSet::from([grain.clone()]);
    let mut queue = VecDeque::from([grain.clone()]);
    while let Some(view) = queue.pop_front() {
        for join in joins.iter().filter(|j| j.relationship == Relationship::OneToOne) {
            let neighbour = if join.base_view == view {
                &join.join_view
            } else if join.join_view == view {
                &join.base_view
            } else {
                continue;
            };
            if linked.insert(neighbour.clone()) {
                queue.push_back(neighbour.clone());
            }
        }
    }

    views.into_iter().filter(|v| !linked.contains(v)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Field, Identifier};

    fn create_test_project() -> Project {
        let order_lines = View::new("order_lines")
            .with_table("analytics.order_line_items")
            .with_field(Field::dimension("order_line_id", "${TABLE}.order_line_id").with_primary_key())
            .with_field(Field::dimension("order_unique_id", "${TABLE}.order_unique_id"))
            .with_field(Field::dimension("customer_id", "${TABLE}.customer_id"))
            .with_identifier(Identifier::foreign("order_id", "${order_unique_id}"))
            .with_identifier(Identifier::foreign("customer_id", "${customer_id}"));
        let orders = View::new("orders")
            .with_table("analytics.orders")
            .with_field(Field::dimension("id", "${TABLE}.id").with_primary_key())
            .with_field(Field::dimension("customer_id", "${TABLE}.customer_id"))
            .with_identifier(Identifier::primary("order_id", "${id}"))
            .with_identifier(Identifier::foreign("customer_id", "${customer_id}"))
            .with_allowed_fanout("order_lines")
            .with_allowed_fanout("payments");
        let customers = View::new("customers")
            .with_table("analytics.customers")
            .with_field(Field::dimension("customer_id", "${TABLE}.id").with_primary_key())
            .with_identifier(Identifier::primary("customer_id", "${customer_id}"));
        let customer_details = View::new("customer_details")
            .with_table("analytics.customer_details")
            .with_field(Field::dimension("customer_id", "${TABLE}.id").with_primary_key())
            .with_identifier(Identifier::primary("customer_id", "${customer_id}"));
        let payments = View::new("payments")
            .with_table("analytics.payments")
            .with_field(Field::dimension("id", "${TABLE}.id").with_primary_key())
            .with_field(Field::dimension("order_id", "${TABLE}.order_id"))
            .with_identifier(Identifier::foreign("order_id", "${order_id}"));
        let reviews = View::new("reviews")
            .with_table("analytics.reviews")
            .with_field(Field::dimension("id", "${TABLE}.id").with_primary_key());

        let topic = Topic::new("order_topic", "orders").with_view("customers");
        Project::new(
            vec![],
            vec![order_lines, orders, customers, customer_details, payments, reviews],
            vec![topic],
        )
    }

    fn views(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn join_targets(design: &Design<'_>) -> Vec<String> {
        design.joins().iter().map(|j| j.join_view.clone()).collect()
    }

    #[test]
    fn test_single_view_needs_no_joins() {
        let project = create_test_project();
        let design = Design::new(&project, &views(&["orders"]), &["orders"], None).unwrap();
        assert!(design.joins().is_empty());
        assert_eq!(design.functional_pk(), &FunctionalPk::View("orders".to_string()));
        assert!(design.symmetric_views().is_empty());
    }

    #[test]
    fn test_many_to_one_keeps_grain() {
        let project = create_test_project();
        let design = Design::new(&project, &views(&["order_lines", "orders"]), &["order_lines"], None).unwrap();
        assert_eq!(join_targets(&design), vec!["orders"]);
        assert_eq!(design.joins()[0].sql_on, "${order_lines.order_unique_id}=${orders.id}");
        assert_eq!(design.functional_pk(), &FunctionalPk::View("order_lines".to_string()));
        assert_eq!(design.symmetric_views(), &views(&["orders"]));
    }

    #[test]
    fn test_one_to_many_moves_grain() {
        let project = create_test_project();
        let design = Design::new(&project, &views(&["orders", "order_lines"]), &["orders"], None).unwrap();
        assert_eq!(design.functional_pk(), &FunctionalPk::View("order_lines".to_string()));
        assert_eq!(design.symmetric_views(), &views(&["orders"]));
    }

    #[test]
    fn test_two_fanouts_have_no_functional_pk() {
        let project = create_test_project();
        let design =
            Design::new(&project, &views(&["orders", "order_lines", "payments"]), &["orders"], None).unwrap();
        assert_eq!(design.functional_pk(), &FunctionalPk::DoesNotExist);
        assert_eq!(
            design.symmetric_views(),
            &views(&["order_lines", "orders", "payments"])
        );
    }

    #[test]
    fn test_fanout_after_many_to_one_through_shortest_path() {
        let project = create_test_project();
        let design = Design::new(&project, &views(&["order_lines", "payments"]), &["order_lines"], None).unwrap();
        assert_eq!(join_targets(&design), vec!["orders", "payments"]);
        assert_eq!(design.functional_pk(), &FunctionalPk::DoesNotExist);
    }

    #[test]
    fn test_base_view_follows_join_direction() {
        let project = create_test_project();
        let design = Design::new(&project, &views(&["customers", "orders"]), &["customers"], None).unwrap();
        assert_eq!(design.base_view().name, "orders");
        assert_eq!(join_targets(&design), vec!["customers"]);
    }

    #[test]
    fn test_one_to_one_views_share_the_grain() {
        let project = create_test_project();
        let design = Design::new(
            &project,
            &views(&["customers", "customer_details"]),
            &["customers"],
            None,
        )
        .unwrap();
        assert_eq!(design.joins()[0].relationship, Relationship::OneToOne);
        assert!(design.symmetric_views().is_empty());
    }

    #[test]
    fn test_three_views_are_joined_in_order() {
        let project = create_test_project();
        let design = Design::new(
            &project,
            &views(&["order_lines", "orders", "customers"]),
            &["order_lines"],
            None,
        )
        .unwrap();
        assert_eq!(join_targets(&design), vec!["customers", "orders"]);
        assert_eq!(design.views(), vec!["order_lines", "customers", "orders"]);
    }

    #[test]
    fn test_joins_follow_the_views_they_build_on() {
        let project = create_test_project();
        let required = views(&["order_lines", "orders", "payments"]);
        let design = Design::new(&project, &required, &["order_lines"], None).unwrap();
        assert_eq!(join_targets(&design), vec!["orders", "payments"]);

        let again = Design::new(&project, &required, &["order_lines"], None).unwrap();
        assert_eq!(join_targets(&again), join_targets(&design));
    }

    #[test]
    fn test_greedy_path_through_unrequested_view() {
        let project = create_test_project();
        let design = Design::new(
            &project,
            &views(&["order_lines", "customers", "payments"]),
            &["order_lines"],
            None,
        )
        .unwrap();
        let targets = join_targets(&design);
        assert!(targets.contains(&"orders".to_string()));
        assert!(targets.contains(&"payments".to_string()));
        assert!(targets.contains(&"customers".to_string()));
    }

    #[test]
    fn test_unreachable_view_is_a_recoverable_join_error() {
        let project = create_test_project();
        let err = Design::new(&project, &views(&["orders", "reviews"]), &["orders"], None).unwrap_err();
        assert!(err.is_recoverable_join_error());
        assert!(err.to_string().contains("reviews"));
    }

    #[test]
    fn test_topic_rejects_outside_views() {
        let project = create_test_project();
        let topic = project.get_topic("order_topic").unwrap();
        let err = Design::new(&project, &views(&["orders", "payments"]), &["orders"], Some(topic)).unwrap_err();
        assert!(matches!(err, MetricsLayerError::Join { .. }));
        assert!(!err.is_recoverable_join_error());

        let design = Design::new(&project, &views(&["orders", "customers"]), &["orders"], Some(topic)).unwrap();
        assert_eq!(join_targets(&design), vec!["customers"]);
    }

    #[test]
    fn test_join_planning_is_deterministic() {
        let project = create_test_project();
        let required = views(&["order_lines", "orders", "customers", "payments"]);
        let first = Design::new(&project, &required, &["order_lines"], None).unwrap();
        let second = Design::new(&project, &required, &["order_lines"], None).unwrap();
        assert_eq!(first.joins(), second.joins());
    }
}
