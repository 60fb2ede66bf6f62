/*
 * Copyright 2020 Nikhil Marathe <nsm.nikhil@gmail.com>
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::collections::HashSet;

use petgraph::{algo::has_path_connecting, graph::NodeIndex, Direction};

use scoreboard_tasks::{Component, Task};

use crate::{interface::Rewriter, DepGraph};

/**
 * Merging replaces a writer and one of its readers with a single fused
 * instruction, so everything that depended on either now depends on the
 * fusion. That is only sound if the rewiring cannot invert an order the
 * graph already promised, and the dangerous parties are the *other*
 * dependents of the writer: instructions that read the writer's output but
 * are not part of the pair.
 *
 * Two ways such a bystander K can go wrong when fusing (first, second):
 *
 * 1. K reads something `second` writes. Before the merge K was free to run
 *    before `second`; after the merge K waits for the fusion, which contains
 *    `second`'s write, so K silently becomes a reader of the newer value.
 * 2. K is an ancestor of `second` (second depends on K, directly or through
 *    any chain of intermediate writers). Redirecting K onto the fusion would
 *    make the fusion both an ancestor and a descendant of K, a cycle, and
 *    nothing below it would ever become eligible.
 *
 * `can_merge_raw` rejects the pair in both cases. Only writer/reader pairs
 * are considered at all; fusing two writers of the same component is a
 * plausible extension but the bookkeeping for intervening readers is not
 * done, so it is deliberately not offered.
 */
#[derive(Debug)]
pub(crate) struct Merger<C, P>
where
    C: Component,
{
    rewriters: Vec<Registered<C, P>>,
}

#[derive(Debug)]
struct Registered<C, P>
where
    C: Component,
{
    rewriter: Box<dyn Rewriter<C, P>>,
    // Pending instructions this rewriter declared interest in. Weak handles,
    // kept live by the queue eagerly calling forget().
    interest: HashSet<NodeIndex>,
}

impl<C, P> Merger<C, P>
where
    C: Component,
{
    pub(crate) fn new() -> Self {
        Merger {
            rewriters: Vec::new(),
        }
    }

    pub(crate) fn register(&mut self, rewriter: Box<dyn Rewriter<C, P>>) {
        self.rewriters.push(Registered {
            rewriter,
            interest: HashSet::new(),
        });
    }

    /// Called for every instruction entering the graph, fused ones included.
    pub(crate) fn introduce(&mut self, graph: &DepGraph<C, P>, node: NodeIndex) {
        let task = &graph[node].task;
        for registered in &mut self.rewriters {
            if registered.rewriter.is_of_interest(task) {
                registered.interest.insert(node);
            }
        }
    }

    /// Called when an instruction leaves the graph, whether completed or
    /// superseded by a fusion.
    pub(crate) fn forget(&mut self, node: NodeIndex) {
        for registered in &mut self.rewriters {
            registered.interest.remove(&node);
        }
    }

    /// Looks for a reader of `first` that some rewriter is willing and safe
    /// to fuse with it. Returns the rewriter's index and the reader.
    pub(crate) fn find_candidate(
        &self,
        graph: &DepGraph<C, P>,
        first: NodeIndex,
    ) -> Option<(usize, NodeIndex)> {
        for second in graph.neighbors_directed(first, Direction::Incoming) {
            for (which, registered) in self.rewriters.iter().enumerate() {
                if registered.interest.contains(&first)
                    && registered.interest.contains(&second)
                    && can_merge_raw(graph, first, second)
                {
                    return Some((which, second));
                }
            }
        }
        None
    }

    pub(crate) fn rewrite(
        &self,
        which: usize,
        first: &Task<C, P>,
        second: &Task<C, P>,
    ) -> Option<Task<C, P>> {
        self.rewriters[which].rewriter.maybe_rewrite(first, second)
    }

    /// First interest-set entry that no longer names a live instruction, if
    /// any. Used by the queue's consistency check.
    pub(crate) fn stale_interest(&self, graph: &DepGraph<C, P>) -> Option<NodeIndex> {
        self.rewriters
            .iter()
            .flat_map(|registered| registered.interest.iter())
            .find(|node| graph.node_weight(**node).is_none())
            .copied()
    }
}

fn can_merge_raw<C, P>(graph: &DepGraph<C, P>, first: NodeIndex, second: NodeIndex) -> bool
where
    C: Component,
{
    for bystander in graph.neighbors_directed(first, Direction::Incoming) {
        if bystander == second {
            continue;
        }
        if graph[bystander].task.reads_output_of(&graph[second].task) {
            return false;
        }
        // A direct-edge check is not enough here: if `second` only reaches
        // the bystander through an intermediate writer, redirecting the
        // bystander onto the fusion still closes a cycle.
        if has_path_connecting(graph, second, bystander, None) {
            return false;
        }
    }
    true
}
