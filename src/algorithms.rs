use std::collections::{HashMap, HashSet, VecDeque};

use crate::models::{EntityId, Relationship};

pub type TableAdjacency<'a> = HashMap<&'a EntityId, Vec<&'a EntityId>>;

/// Edges `fk table -> pk table` for every identifying relationship.
pub fn identifying_adjacency<'a, I>(relationships: I) -> TableAdjacency<'a>
where
    I: IntoIterator<Item = &'a Relationship>,
{
    let mut adjacency: TableAdjacency<'a> = HashMap::new();
    for relationship in relationships {
        if !relationship.is_identifying() {
            continue;
        }
        adjacency.entry(&relationship.pk_table_id).or_default();
        adjacency
            .entry(&relationship.fk_table_id)
            .or_default()
            .push(&relationship.pk_table_id);
    }
    adjacency
}

/// Iterative BFS; `from == to` counts as reachable.
pub fn path_exists(adjacency: &TableAdjacency<'_>, from: &EntityId, to: &EntityId) -> bool {
    if from == to {
        return true;
    }

    let mut visited: HashSet<&EntityId> = HashSet::new();
    let mut queue = VecDeque::new();
    queue.push_back(from);
    visited.insert(from);

    while let Some(table_id) = queue.pop_front() {
        let Some(targets) = adjacency.get(table_id) else {
            continue;
        };
        for &target in targets {
            if target == to {
                return true;
            }
            if visited.insert(target) {
                queue.push_back(target);
            }
        }
    }

    false
}

pub fn has_cycle(adjacency: &TableAdjacency<'_>) -> bool {
    let mut indegree: HashMap<&EntityId, usize> = HashMap::with_capacity(adjacency.len());
    for (&table_id, targets) in adjacency {
        indegree.entry(table_id).or_insert(0);
        for &target in targets {
            *indegree.entry(target).or_insert(0) += 1;
        }
    }

    let mut queue = indegree
        .iter()
        .filter_map(|(table_id, degree)| if *degree == 0 { Some(*table_id) } else { None })
        .collect::<VecDeque<_>>();

    let mut visited_count = 0usize;
    while let Some(table_id) = queue.pop_front() {
        visited_count += 1;
        if let Some(targets) = adjacency.get(table_id) {
            for &target in targets {
                if let Some(degree) = indegree.get_mut(target) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(target);
                    }
                }
            }
        }
    }

    visited_count != indegree.len()
}
