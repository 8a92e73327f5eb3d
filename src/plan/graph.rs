//! Index-stable dependency graph over plan features.
//!
//! Features live in an arena (the plan's `Vec`); edges are indices. The graph
//! is rebuilt from the plan whenever it is needed, validated with Kahn's
//! algorithm, and used to compute re-index maps for moves and insertions.

use std::collections::BTreeSet;

use crate::errors::{Result, ShipyardError};

#[derive(Debug)]
pub struct FeatureGraph {
    /// index -> features it depends on
    dependencies: Vec<Vec<usize>>,
    /// index -> features that depend on it
    dependents: Vec<Vec<usize>>,
}

impl FeatureGraph {
    /// Build and validate. Out-of-range references and cycles are rejected.
    pub fn build<'a, I>(depends_on: I) -> Result<Self>
    where
        I: IntoIterator<Item = &'a BTreeSet<usize>>,
    {
        let deps: Vec<Vec<usize>> = depends_on
            .into_iter()
            .map(|set| set.iter().copied().collect())
            .collect();
        let len = deps.len();

        let mut dependents = vec![Vec::new(); len];
        for (index, list) in deps.iter().enumerate() {
            for &dep in list {
                if dep >= len {
                    return Err(ShipyardError::DependencyCycle {
                        message: format!(
                            "feature {index} depends on {dep}, but the plan only has {len} features"
                        ),
                        involved: vec![index],
                    });
                }
                if dep == index {
                    return Err(ShipyardError::DependencyCycle {
                        message: format!("feature {index} depends on itself"),
                        involved: vec![index],
                    });
                }
                dependents[dep].push(index);
            }
        }

        let graph = Self {
            dependencies: deps,
            dependents,
        };
        graph.validate_no_cycles()?;
        Ok(graph)
    }

    pub fn len(&self) -> usize {
        self.dependencies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dependencies.is_empty()
    }

    pub fn dependencies(&self, index: usize) -> &[usize] {
        self.dependencies.get(index).map_or(&[], |v| v.as_slice())
    }

    pub fn dependents(&self, index: usize) -> &[usize] {
        self.dependents.get(index).map_or(&[], |v| v.as_slice())
    }

    fn validate_no_cycles(&self) -> Result<()> {
        let mut in_degree: Vec<usize> = self.dependencies.iter().map(Vec::len).collect();
        let mut queue: Vec<usize> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, deg)| *deg == 0)
            .map(|(i, _)| i)
            .collect();
        let mut processed = 0;

        while let Some(node) = queue.pop() {
            processed += 1;
            for &dependent in self.dependents(node) {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    queue.push(dependent);
                }
            }
        }

        if processed != self.len() {
            let involved: Vec<usize> = in_degree
                .iter()
                .enumerate()
                .filter(|&(_, deg)| *deg > 0)
                .map(|(i, _)| i)
                .collect();
            return Err(ShipyardError::DependencyCycle {
                message: format!("cycle detected among features {involved:?}"),
                involved,
            });
        }
        Ok(())
    }
}

/// Old index -> new index after moving `from` to position `to`.
pub fn move_mapping(len: usize, from: usize, to: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..len).collect();
    let moved = order.remove(from);
    order.insert(to, moved);
    let mut mapping = vec![0; len];
    for (new_index, old_index) in order.into_iter().enumerate() {
        mapping[old_index] = new_index;
    }
    mapping
}

/// Old index -> new index after inserting a feature at `position`.
pub fn insert_mapping(len: usize, position: usize) -> Vec<usize> {
    (0..len)
        .map(|i| if i >= position { i + 1 } else { i })
        .collect()
}

/// Apply an index mapping to a dependency set.
pub fn remap(deps: &BTreeSet<usize>, mapping: &[usize]) -> BTreeSet<usize> {
    deps.iter().filter_map(|d| mapping.get(*d).copied()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sets(deps: &[&[usize]]) -> Vec<BTreeSet<usize>> {
        deps.iter().map(|d| d.iter().copied().collect()).collect()
    }

    #[test]
    fn test_build_simple_graph() {
        let deps = sets(&[&[], &[0], &[0], &[1, 2]]);
        let graph = FeatureGraph::build(&deps).unwrap();
        assert_eq!(graph.len(), 4);
        assert_eq!(graph.dependencies(3), &[1, 2]);
        assert_eq!(graph.dependents(0), &[1, 2]);
    }

    #[test]
    fn test_cycle_detection_names_members() {
        let deps = sets(&[&[], &[2], &[1], &[0]]);
        match FeatureGraph::build(&deps).unwrap_err() {
            ShipyardError::DependencyCycle { involved, .. } => assert_eq!(involved, vec![1, 2]),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_out_of_range_and_self_reference() {
        assert!(matches!(
            FeatureGraph::build(&sets(&[&[], &[5]])).unwrap_err(),
            ShipyardError::DependencyCycle { .. }
        ));
        assert!(matches!(
            FeatureGraph::build(&sets(&[&[0]])).unwrap_err(),
            ShipyardError::DependencyCycle { .. }
        ));
    }

    #[test]
    fn test_forward_references_are_allowed_when_acyclic() {
        let deps = sets(&[&[1], &[]]);
        assert!(FeatureGraph::build(&deps).is_ok());
    }

    #[test]
    fn test_move_mapping() {
        // [a, b, c, d] move 0 -> 2 gives [b, c, a, d]
        assert_eq!(move_mapping(4, 0, 2), vec![2, 0, 1, 3]);
        // move 3 -> 1 gives [a, d, b, c]
        assert_eq!(move_mapping(4, 3, 1), vec![0, 2, 3, 1]);
    }

    #[test]
    fn test_insert_mapping_and_remap() {
        let mapping = insert_mapping(3, 1);
        assert_eq!(mapping, vec![0, 2, 3]);
        let deps: BTreeSet<usize> = [0, 2].into_iter().collect();
        assert_eq!(remap(&deps, &mapping), [0, 3].into_iter().collect());
    }
}
