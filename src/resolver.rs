//! Dependency resolution - install ordering with cycle detection.
//!
//! Implements topological sort over the known-formula set using iterative DFS
//! with state tracking, so deep graphs cannot overflow the stack. A declared
//! dependency with no known formula is accepted only when an installed prefix
//! for it already exists on the host.

use crate::formula::{DepKind, Formula};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("dependency cycle detected: {chain}")]
    Cycle { chain: String },
    #[error("unknown dependency '{name}' (wanted by '{wanted_by}')")]
    Missing { name: String, wanted_by: String },
    #[error("unknown formula: {0}")]
    UnknownTarget(String),
}

/// A dependency bound to the prefix where it is installed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDependency {
    pub name: String,
    pub prefix: PathBuf,
    pub kind: DepKind,
}

/// Node state for the DFS traversal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeState {
    Unprocessed,
    Processing,
    Processed,
}

/// Resolver over the set of known formulas.
pub struct Resolver<'a> {
    known: &'a BTreeMap<String, Formula>,
    /// Names satisfied on the host without a known formula (already in the
    /// cellar); they terminate traversal instead of failing it.
    satisfied: BTreeSet<String>,
}

impl<'a> Resolver<'a> {
    pub fn new(known: &'a BTreeMap<String, Formula>) -> Self {
        Self {
            known,
            satisfied: BTreeSet::new(),
        }
    }

    /// Mark names that are already installed on the host.
    pub fn with_satisfied(mut self, names: impl IntoIterator<Item = String>) -> Self {
        self.satisfied = names.into_iter().collect();
        self
    }

    /// Compute the install order for the given targets: every dependency
    /// appears before its dependents, shared dependencies appear once.
    /// Already-satisfied names without a formula are omitted from the order.
    pub fn install_order(&self, targets: &[String]) -> Result<Vec<String>, ResolveError> {
        let mut state: HashMap<String, NodeState> = HashMap::new();
        let mut order: Vec<String> = Vec::new();

        for target in targets {
            if !self.known.contains_key(target) {
                return Err(ResolveError::UnknownTarget(target.clone()));
            }
            self.visit(target, &mut state, &mut order)?;
        }

        Ok(order)
    }

    /// The transitive runtime closure of one formula, dependency order,
    /// deduplicated. Build and test deps do not contribute.
    pub fn runtime_closure(&self, formula: &Formula) -> Result<Vec<String>, ResolveError> {
        let mut closure: Vec<String> = Vec::new();
        let mut seen: BTreeSet<String> = BTreeSet::new();
        let mut queue: Vec<String> = formula.runtime_deps().map(|d| d.name.clone()).collect();

        while !queue.is_empty() {
            let name = queue.remove(0);
            if !seen.insert(name.clone()) {
                continue;
            }
            match self.known.get(&name) {
                Some(dep) => {
                    queue.extend(dep.runtime_deps().map(|d| d.name.clone()));
                }
                None if self.satisfied.contains(&name) => {}
                None => {
                    return Err(ResolveError::Missing {
                        name,
                        wanted_by: formula.name.clone(),
                    });
                }
            }
            closure.push(name);
        }

        Ok(closure)
    }

    /// Iterative DFS with an explicit stack. The stack holds
    /// (node, index of the next dependency to examine).
    fn visit(
        &self,
        start: &str,
        state: &mut HashMap<String, NodeState>,
        order: &mut Vec<String>,
    ) -> Result<(), ResolveError> {
        let mut stack: Vec<(String, usize)> = vec![(start.to_string(), 0)];

        while let Some((node, child_idx)) = stack.pop() {
            let deps = self.known[&node].dep_names();

            match state.get(&node).copied().unwrap_or(NodeState::Unprocessed) {
                NodeState::Processed => continue,
                NodeState::Processing => {
                    if child_idx >= deps.len() {
                        // All dependencies settled - finalize this node
                        state.insert(node.clone(), NodeState::Processed);
                        order.push(node);
                        continue;
                    }
                }
                NodeState::Unprocessed => {
                    state.insert(node.clone(), NodeState::Processing);
                }
            }

            let mut descended = false;
            for i in child_idx..deps.len() {
                let dep = &deps[i];

                if !self.known.contains_key(dep) {
                    if self.satisfied.contains(dep) {
                        continue;
                    }
                    return Err(ResolveError::Missing {
                        name: dep.clone(),
                        wanted_by: node.clone(),
                    });
                }

                match state.get(dep).copied().unwrap_or(NodeState::Unprocessed) {
                    NodeState::Unprocessed => {
                        stack.push((node.clone(), i + 1));
                        stack.push((dep.clone(), 0));
                        descended = true;
                        break;
                    }
                    NodeState::Processing => {
                        return Err(ResolveError::Cycle {
                            chain: cycle_chain(&stack, &node, dep),
                        });
                    }
                    NodeState::Processed => {}
                }
            }

            if !descended {
                // Push back to finalize once every dependency is Processed
                stack.push((node, deps.len()));
            }
        }

        Ok(())
    }
}

/// Render the cycle for the error message from the DFS stack contents.
fn cycle_chain(stack: &[(String, usize)], node: &str, dep: &str) -> String {
    let mut chain: Vec<&str> = Vec::new();
    if let Some(pos) = stack.iter().position(|(name, _)| name == dep) {
        for (name, _) in &stack[pos..] {
            chain.push(name);
        }
    }
    chain.push(node);
    chain.push(dep);
    chain.join(" -> ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formula::Formula;

    fn formula(name: &str, deps: &[&str]) -> Formula {
        let mut toml = format!("name = \"{}\"\nversion = \"1.0\"\n", name);
        for dep in deps {
            toml.push_str(&format!("[[deps]]\nname = \"{}\"\n", dep));
        }
        Formula::from_toml(&toml).unwrap()
    }

    fn known(formulas: Vec<Formula>) -> BTreeMap<String, Formula> {
        formulas.into_iter().map(|f| (f.name.clone(), f)).collect()
    }

    #[test]
    fn test_linear_chain_order() {
        let known = known(vec![
            formula("a", &["b"]),
            formula("b", &["c"]),
            formula("c", &[]),
        ]);
        let order = Resolver::new(&known)
            .install_order(&["a".to_string()])
            .unwrap();
        assert_eq!(order, vec!["c", "b", "a"]);
    }

    #[test]
    fn test_diamond_dedup() {
        let known = known(vec![
            formula("top", &["left", "right"]),
            formula("left", &["base"]),
            formula("right", &["base"]),
            formula("base", &[]),
        ]);
        let order = Resolver::new(&known)
            .install_order(&["top".to_string()])
            .unwrap();
        assert_eq!(order.len(), 4);
        assert_eq!(order[0], "base");
        assert_eq!(order[3], "top");
        // every dependency precedes its dependent
        let pos = |n: &str| order.iter().position(|x| x == n).unwrap();
        assert!(pos("base") < pos("left"));
        assert!(pos("base") < pos("right"));
        assert!(pos("left") < pos("top"));
        assert!(pos("right") < pos("top"));
    }

    #[test]
    fn test_cycle_detected() {
        let known = known(vec![
            formula("a", &["b"]),
            formula("b", &["c"]),
            formula("c", &["a"]),
        ]);
        let err = Resolver::new(&known)
            .install_order(&["a".to_string()])
            .unwrap_err();
        match err {
            ResolveError::Cycle { chain } => {
                assert!(chain.contains("a"), "chain was: {}", chain);
            }
            other => panic!("expected Cycle, got: {}", other),
        }
    }

    #[test]
    fn test_missing_dependency() {
        let known = known(vec![formula("a", &["ghost"])]);
        let err = Resolver::new(&known)
            .install_order(&["a".to_string()])
            .unwrap_err();
        match err {
            ResolveError::Missing { name, wanted_by } => {
                assert_eq!(name, "ghost");
                assert_eq!(wanted_by, "a");
            }
            other => panic!("expected Missing, got: {}", other),
        }
    }

    #[test]
    fn test_missing_but_satisfied_on_host() {
        let known = known(vec![formula("a", &["system-zlib"])]);
        let order = Resolver::new(&known)
            .with_satisfied(["system-zlib".to_string()])
            .install_order(&["a".to_string()])
            .unwrap();
        // satisfied deps need no build, so they are not in the order
        assert_eq!(order, vec!["a"]);
    }

    #[test]
    fn test_runtime_closure_excludes_build_deps() {
        let top = Formula::from_toml(
            r#"
name = "top"
version = "1.0"
[[deps]]
name = "runtime-lib"
[[deps]]
name = "cmake"
kind = "build"
"#,
        )
        .unwrap();
        let known = known(vec![top, formula("runtime-lib", &[]), formula("cmake", &[])]);
        let closure = Resolver::new(&known)
            .runtime_closure(&known["top"])
            .unwrap();
        assert_eq!(closure, vec!["runtime-lib"]);
    }

    #[test]
    fn test_unknown_target() {
        let known = known(vec![]);
        let err = Resolver::new(&known)
            .install_order(&["nope".to_string()])
            .unwrap_err();
        assert!(matches!(err, ResolveError::UnknownTarget(_)));
    }
}
