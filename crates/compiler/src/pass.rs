//! Pass driver
//!
//! A pass is one depth-first traversal of the AST by one phase. The
//! driver runs an ordered list of phases, calling each phase's
//! pre-order handler before descending into a node's children and
//! its post-order handler after. Handlers dispatch internally on the
//! node kind (and, for expressions, the operator; for types, the
//! type kind), the tagged-union equivalent of handler tables.
//!
//! Handlers steer the traversal through [`Flow`]:
//!
//! - `Done` (from pre): skip the node's children and its post
//!   handler;
//! - `Restart` (from post): revisit the node, e.g. after a rewrite
//!   whose result must itself be processed. Restarted nodes must
//!   reach a fixed point; the driver enforces a bound;
//! - `Subpass` (from post): run the current phase over the node's
//!   subtree again right now;
//! - `Error`: abort the whole pass.
//!
//! The types flag selects whether type subtrees are descended into.

use crate::ast::{Ast, Loc, NodeId};

/// Traversal directives returned by handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Ok,
    Done,
    Restart,
    Subpass,
    Error,
}

/// Diagnostics payload carried by every phase.
#[derive(Debug, Default)]
pub struct Diag {
    pub errors: usize,
    pub warnings: usize,
    pub messages: Vec<String>,
}

impl Diag {
    pub fn error(&mut self, loc: Loc, msg: impl Into<String>) {
        self.errors += 1;
        self.messages.push(format!("{}: error: {}", loc, msg.into()));
    }

    pub fn warn(&mut self, loc: Loc, msg: impl Into<String>) {
        self.warnings += 1;
        self.messages.push(format!("{}: warning: {}", loc, msg.into()));
    }
}

/// Traversal context handed to handlers: the chain of ancestors of
/// the visited node, innermost last.
pub struct WalkCtx<'a> {
    pub parents: &'a [NodeId],
}

impl WalkCtx<'_> {
    pub fn parent(&self) -> Option<NodeId> {
        self.parents.last().copied()
    }
}

/// One semantic phase.
pub trait Phase {
    fn name(&self) -> &'static str;
    fn diag(&mut self) -> &mut Diag;

    fn pre(&mut self, _ast: &mut Ast, _ctx: &WalkCtx, _node: NodeId) -> Flow {
        Flow::Ok
    }
    fn post(&mut self, _ast: &mut Ast, _ctx: &WalkCtx, _node: NodeId) -> Flow {
        Flow::Ok
    }
}

/// Bound on restarts of a single node within one phase. The
/// rewrites are expected to reach a fixed point after one restart;
/// exceeding the bound is an internal compiler error.
const MAX_RESTARTS: u32 = 16;

/// Run the given phases, in order, over the tree rooted at `root`.
pub fn do_pass(
    ast: &mut Ast,
    root: NodeId,
    phases: &mut [&mut dyn Phase],
    f_types: bool,
) -> Result<(), String> {
    for phase in phases.iter_mut() {
        tracing::debug!(phase = phase.name(), "running phase");
        let mut parents = Vec::new();
        visit(ast, root, &mut **phase, f_types, &mut parents)
            .map_err(|e| format!("phase {}: {}", phase.name(), e))?;
    }
    Ok(())
}

fn visit(
    ast: &mut Ast,
    node: NodeId,
    phase: &mut dyn Phase,
    f_types: bool,
    parents: &mut Vec<NodeId>,
) -> Result<(), String> {
    let mut restarts = 0u32;
    loop {
        match phase.pre(ast, &WalkCtx { parents }, node) {
            Flow::Ok => {}
            Flow::Done => return Ok(()),
            Flow::Error => return Err("aborted".to_string()),
            Flow::Restart | Flow::Subpass => {
                return Err("restart/subpass from a pre-order handler".to_string())
            }
        }

        parents.push(node);
        // The children are re-read after every child visit: handlers
        // may rewrite the node they are under.
        let mut index = 0;
        loop {
            let children = ast.children(node);
            let Some(child) = children.get(index).copied() else {
                break;
            };
            if ast.is_type(child) && !f_types {
                index += 1;
                continue;
            }
            visit(ast, child, phase, f_types, parents)?;
            index += 1;
        }
        parents.pop();

        match phase.post(ast, &WalkCtx { parents }, node) {
            Flow::Ok | Flow::Done => return Ok(()),
            Flow::Error => return Err("aborted".to_string()),
            Flow::Restart => {
                restarts += 1;
                if restarts > MAX_RESTARTS {
                    return Err(format!(
                        "node {:?} did not reach a fixed point after {} restarts",
                        node, MAX_RESTARTS
                    ));
                }
                continue;
            }
            Flow::Subpass => {
                parents.push(node);
                let children = ast.children(node);
                for child in children {
                    if ast.is_type(child) && !f_types {
                        continue;
                    }
                    visit(ast, child, phase, f_types, parents)?;
                }
                parents.pop();
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::NodeKind;

    struct Counter {
        diag: Diag,
        pres: usize,
        posts: usize,
        restart_once: Option<NodeId>,
    }

    impl Phase for Counter {
        fn name(&self) -> &'static str {
            "counter"
        }
        fn diag(&mut self) -> &mut Diag {
            &mut self.diag
        }
        fn pre(&mut self, _ast: &mut Ast, _ctx: &WalkCtx, _node: NodeId) -> Flow {
            self.pres += 1;
            Flow::Ok
        }
        fn post(&mut self, _ast: &mut Ast, _ctx: &WalkCtx, node: NodeId) -> Flow {
            self.posts += 1;
            if self.restart_once == Some(node) {
                self.restart_once = None;
                return Flow::Restart;
            }
            Flow::Ok
        }
    }

    fn tiny_tree() -> (Ast, NodeId) {
        let mut ast = Ast::new();
        let a = ast.make_integer(Loc::default(), 1, 32, true);
        let b = ast.make_integer(Loc::default(), 2, 32, true);
        let e = ast.add(
            NodeKind::Exp {
                op: crate::ast::Op::Add,
                operands: vec![a, b],
                attr: None,
            },
            Loc::default(),
        );
        (ast, e)
    }

    #[test]
    fn pre_and_post_fire_once_per_node() {
        let (mut ast, root) = tiny_tree();
        let mut phase = Counter {
            diag: Diag::default(),
            pres: 0,
            posts: 0,
            restart_once: None,
        };
        do_pass(&mut ast, root, &mut [&mut phase], false).unwrap();
        // Root plus two integer children; type nodes skipped.
        assert_eq!(phase.pres, 3);
        assert_eq!(phase.posts, 3);
    }

    #[test]
    fn types_flag_descends_into_types() {
        let (mut ast, root) = tiny_tree();
        let mut phase = Counter {
            diag: Diag::default(),
            pres: 0,
            posts: 0,
            restart_once: None,
        };
        do_pass(&mut ast, root, &mut [&mut phase], true).unwrap();
        assert_eq!(phase.pres, 3);
    }

    #[test]
    fn restart_revisits_the_node() {
        let (mut ast, root) = tiny_tree();
        let mut phase = Counter {
            diag: Diag::default(),
            pres: 0,
            posts: 0,
            restart_once: Some(root),
        };
        do_pass(&mut ast, root, &mut [&mut phase], false).unwrap();
        // The root posts twice (once per round), the children once
        // per round.
        assert_eq!(phase.posts, 6);
        assert_eq!(phase.pres, 6);
    }
}
