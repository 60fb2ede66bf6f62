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

use std::collections::{HashMap, HashSet};
use std::fmt;

use petgraph::{graph::NodeIndex, stable_graph::StableDiGraph, Direction};
use thiserror::Error;

use scoreboard_metrics::{count_event, time_scope};

pub mod interface;
mod merger;
mod queue;


pub use interface::{Execute, Rewriter};
pub use queue::{PriorityGenerator, ReadyQueue};
pub use scoreboard_tasks::{Component, Task};

use merger::Merger;

// Edges point from an instruction to the instructions it waits on, so a
// node's outgoing neighbors are its dependencies and its incoming neighbors
// are its dependents. The stable indices double as the weak handles held by
// the ready queue, the latest-writer map and the merger's interest sets; all
// three are purged or redirected whenever a node is removed, so a handle is
// always live.
pub(crate) type DepGraph<C, P> = StableDiGraph<Instruction<C, P>, ()>;

#[derive(Debug)]
pub(crate) struct Instruction<C, P>
where
    C: Component,
{
    task: Task<C, P>,
}

impl<C, P> Instruction<C, P>
where
    C: Component,
{
    pub(crate) fn new(task: Task<C, P>) -> Self {
        Instruction { task }
    }
}

/// A broken internal invariant. These are programming errors: the queue
/// aborts on them in debug builds and they are never recovered from.
#[derive(Error, Debug)]
pub enum InvariantViolation {
    #[error("ready queue entry [{0}] is not a live eligible instruction")]
    ReadyNotEligible(usize),
    #[error("eligible instruction [{0}] is missing from the ready queue")]
    EligibleNotReady(usize),
    #[error("ready queue entry [{0}] appears more than once")]
    DuplicateReady(usize),
    #[error("latest-writer entry for {0} does not name a live writer of it")]
    StaleWriter(String),
    #[error("interest set retains instruction [{0}] which is no longer pending")]
    StaleInterest(usize),
}

/// Reorders submitted tasks by their data dependencies.
///
/// Tasks writing a component are serialized against earlier writers of it,
/// and readers wait for the latest writer at the time they were enqueued.
/// Unrelated tasks are served by priority, with the ready queue's generator
/// deciding between lanes. Dequeuing hands the task to the caller and
/// releases its dependents immediately; execution is entirely the caller's
/// business, so a producer that needs to run after a dequeued task must
/// express that through the read and write sets.
#[derive(Debug)]
pub struct TaskQueue<C, P>
where
    C: Component,
{
    graph: DepGraph<C, P>,
    latest_writer: HashMap<C, NodeIndex>,
    ready: ReadyQueue<NodeIndex>,
    merger: Merger<C, P>,
}

impl<C, P> TaskQueue<C, P>
where
    C: Component,
{
    pub fn new() -> Self {
        TaskQueue {
            graph: DepGraph::new(),
            latest_writer: HashMap::new(),
            ready: ReadyQueue::new(),
            merger: Merger::new(),
        }
    }

    /// Admits a task. It becomes ready once every earlier writer of a
    /// component it touches has been dequeued; if there are none it is ready
    /// immediately. Never blocks.
    pub fn enqueue(&mut self, task: Task<C, P>) {
        time_scope!("enqueue");
        let reads: Vec<C> = task.read_set().iter().cloned().collect();
        let writes: Vec<C> = task.write_set().iter().cloned().collect();
        let priority = task.priority();
        let node = self.graph.add_node(Instruction::new(task));

        for component in reads {
            if let Some(&writer) = self.latest_writer.get(&component) {
                self.graph.update_edge(node, writer, ());
            }
        }
        for component in writes {
            if let Some(&writer) = self.latest_writer.get(&component) {
                self.graph.update_edge(node, writer, ());
            }
            self.latest_writer.insert(component, node);
        }

        if self.is_eligible(node) {
            self.ready.push(priority, node);
        }
        self.merger.introduce(&self.graph, node);
        self.offer_merges(node);
        self.debug_check();
    }

    /// Hands out the next runnable task, or None if nothing is ready.
    ///
    /// The instruction is completed before the task is returned: its
    /// dependents stop waiting for it from this moment, not from whenever
    /// the caller finishes executing it.
    pub fn dequeue(&mut self) -> Option<Task<C, P>> {
        time_scope!("dequeue");
        let node = self.ready.pop()?;
        let task = self.complete(node);
        self.debug_check();
        Some(task)
    }

    /// Registers a rewriter. It participates in merge decisions for every
    /// instruction introduced from now on. Rewriters are never removed.
    pub fn register_rewriter<R>(&mut self, rewriter: R)
    where
        R: Rewriter<C, P> + 'static,
    {
        self.merger.register(Box::new(rewriter));
    }

    /// True iff no instruction is ready. Every pending instruction then has
    /// an unfinished ancestor, which cannot happen with an empty graph, so
    /// this also means there is nothing to wait for.
    pub fn is_empty(&self) -> bool {
        self.ready.is_empty()
    }

    /// Number of pending instructions, ready or not.
    pub fn pending(&self) -> usize {
        self.graph.node_count()
    }

    fn is_eligible(&self, node: NodeIndex) -> bool {
        self.graph
            .neighbors_directed(node, Direction::Outgoing)
            .next()
            .is_none()
    }

    fn complete(&mut self, node: NodeIndex) -> Task<C, P> {
        self.merger.forget(node);
        let dependents: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(node, Direction::Incoming)
            .collect();
        let instruction = self
            .graph
            .remove_node(node)
            .expect("completed instruction was live");
        for component in instruction.task.write_set() {
            if self.latest_writer.get(component) == Some(&node) {
                self.latest_writer.remove(component);
            }
        }
        for dependent in dependents {
            if self.is_eligible(dependent) {
                self.ready
                    .push(self.graph[dependent].task.priority(), dependent);
            }
        }
        instruction.task
    }

    /// Offers the merger each instruction the new arrival reads from, as the
    /// writer half of a potential fusion. Chains fuse incrementally as their
    /// members arrive.
    fn offer_merges(&mut self, node: NodeIndex) {
        let ancestors: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(node, Direction::Outgoing)
            .collect();
        for first in ancestors {
            if self.graph.node_weight(first).is_none() {
                // Consumed by an earlier fusion in this loop.
                continue;
            }
            if self.try_merge_at(first).is_some() && self.graph.node_weight(node).is_none() {
                break;
            }
        }
    }

    fn try_merge_at(&mut self, first: NodeIndex) -> Option<NodeIndex> {
        count_event!("merge_offered");
        let (which, second) = self.merger.find_candidate(&self.graph, first)?;
        let fused = self
            .merger
            .rewrite(which, &self.graph[first].task, &self.graph[second].task)?;
        debug_assert!(
            fused.write_set().is_superset(self.graph[first].task.write_set())
                && fused.write_set().is_superset(self.graph[second].task.write_set()),
            "rewriter dropped a write of the pair it fused"
        );
        count_event!("merge_applied");

        let fused_priority = fused.priority();
        let dependents: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(first, Direction::Incoming)
            .chain(self.graph.neighbors_directed(second, Direction::Incoming))
            .collect();
        // The fusion must still wait on everything either half waited on.
        let ancestors: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(first, Direction::Outgoing)
            .chain(self.graph.neighbors_directed(second, Direction::Outgoing))
            .collect();

        let merged = self.graph.add_node(Instruction::new(fused));
        for dependent in dependents {
            if dependent != first && dependent != second {
                self.graph.update_edge(dependent, merged, ());
            }
        }
        for ancestor in ancestors {
            if ancestor != first && ancestor != second {
                self.graph.update_edge(merged, ancestor, ());
            }
        }

        for superseded in &[first, second] {
            let superseded = *superseded;
            let instruction = self
                .graph
                .remove_node(superseded)
                .expect("superseded instruction was live");
            self.ready.remove(instruction.task.priority(), &superseded);
            for component in instruction.task.write_set() {
                if self.latest_writer.get(component) == Some(&superseded) {
                    self.latest_writer.insert(component.clone(), merged);
                }
            }
            self.merger.forget(superseded);
        }

        if self.is_eligible(merged) {
            self.ready.push(fused_priority, merged);
        }
        self.merger.introduce(&self.graph, merged);
        Some(merged)
    }

    /// Validates the structural invariants over the live state. Everything
    /// here is maintained incrementally by enqueue/dequeue/merge; a failure
    /// is a bug in this crate, not in the caller.
    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        let mut seen = HashSet::new();
        for (lane, node) in self.ready.iter() {
            if !seen.insert(*node) {
                return Err(InvariantViolation::DuplicateReady(node.index()));
            }
            let live_and_eligible = match self.graph.node_weight(*node) {
                Some(instruction) => {
                    instruction.task.priority() == lane && self.is_eligible(*node)
                }
                None => false,
            };
            if !live_and_eligible {
                return Err(InvariantViolation::ReadyNotEligible(node.index()));
            }
        }
        for node in self.graph.node_indices() {
            if self.is_eligible(node) && !seen.contains(&node) {
                return Err(InvariantViolation::EligibleNotReady(node.index()));
            }
        }
        for (component, node) in &self.latest_writer {
            match self.graph.node_weight(*node) {
                Some(instruction) if instruction.task.write_set().contains(component) => {}
                _ => {
                    return Err(InvariantViolation::StaleWriter(format!("{:?}", component)));
                }
            }
        }
        if let Some(node) = self.merger.stale_interest(&self.graph) {
            return Err(InvariantViolation::StaleInterest(node.index()));
        }
        Ok(())
    }

    fn debug_check(&self) {
        if cfg!(debug_assertions) {
            if let Err(violation) = self.check_invariants() {
                panic!("task queue invariant violated: {}", violation);
            }
        }
    }
}

impl<C, P> Default for TaskQueue<C, P>
where
    C: Component,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<C, P> fmt::Display for TaskQueue<C, P>
where
    C: Component,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn sorted_set<C: Component>(set: &HashSet<C>) -> String {
            let mut items: Vec<String> = set.iter().map(|c| format!("{:?}", c)).collect();
            items.sort();
            format!("{{{}}}", items.join(", "))
        }

        writeln!(f, "TaskQueue{{")?;
        for node in self.graph.node_indices() {
            let task = &self.graph[node].task;
            let mut deps: Vec<usize> = self
                .graph
                .neighbors_directed(node, Direction::Outgoing)
                .map(|dep| dep.index())
                .collect();
            deps.sort();
            let deps: Vec<String> = deps.iter().map(|dep| dep.to_string()).collect();
            writeln!(
                f,
                "  [{}] priority={} reads={} writes={} deps=[{}]",
                node.index(),
                task.priority(),
                sorted_set(task.read_set()),
                sorted_set(task.write_set()),
                deps.join(", ")
            )?;
        }
        let ready: Vec<String> = self
            .ready
            .iter()
            .map(|(_, node)| node.index().to_string())
            .collect();
        write!(f, " ready: [{}]\n}}", ready.join(", "))
    }
}

/// Feeds dequeued tasks to the executor one at a time until the queue has no
/// runnable work or the executor fails, returning how many tasks completed.
pub async fn drain<C, P, X>(
    queue: &mut TaskQueue<C, P>,
    executor: &mut X,
) -> Result<usize, X::Error>
where
    C: Component,
    X: Execute<C, P> + ?Sized,
{
    let mut completed = 0;
    while let Some(task) = queue.dequeue() {
        executor.execute(task).await?;
        completed += 1;
    }
    Ok(completed)
}

#[cfg(test)]
mod test {
    use async_trait::async_trait;
    use insta::assert_display_snapshot;
    use thiserror::Error;
    use tokio::{runtime::Builder, task::LocalSet};

    use super::*;

    type TestQueue = TaskQueue<&'static str, &'static str>;
    type TestTask = Task<&'static str, &'static str>;

    fn block_on<F: std::future::Future>(future: F) -> F::Output {
        let mut runtime = Builder::new().basic_scheduler().build().unwrap();
        LocalSet::new().block_on(&mut runtime, future)
    }

    fn drain_payloads(queue: &mut TestQueue) -> Vec<&'static str> {
        let mut drained = Vec::new();
        while let Some(task) = queue.dequeue() {
            drained.push(*task.payload());
        }
        drained
    }

    /// Fuses exactly one (writer, reader) payload pair.
    struct PairRewriter {
        first: &'static str,
        second: &'static str,
        fused: &'static str,
        decline: bool,
    }

    impl PairRewriter {
        fn fusing(first: &'static str, second: &'static str, fused: &'static str) -> Self {
            PairRewriter {
                first,
                second,
                fused,
                decline: false,
            }
        }
    }

    impl Rewriter<&'static str, &'static str> for PairRewriter {
        fn is_of_interest(&self, task: &TestTask) -> bool {
            *task.payload() == self.first || *task.payload() == self.second
        }

        fn maybe_rewrite(&self, first: &TestTask, second: &TestTask) -> Option<TestTask> {
            if self.decline
                || *first.payload() != self.first
                || *second.payload() != self.second
            {
                return None;
            }
            let reads = first.read_set().iter().cloned().chain(
                second
                    .read_set()
                    .iter()
                    .filter(|component| !first.write_set().contains(*component))
                    .cloned(),
            );
            let writes = first
                .write_set()
                .iter()
                .chain(second.write_set().iter())
                .cloned();
            Some(
                Task::new(self.fused, first.priority().max(second.priority()))
                    .reads(reads)
                    .writes(writes),
            )
        }
    }

    #[test]
    fn empty_queue_has_nothing_to_offer() {
        let mut queue = TestQueue::new();
        assert!(queue.is_empty());
        assert_eq!(queue.pending(), 0);
        assert!(queue.dequeue().is_none());
    }

    #[test]
    fn fifo_at_equal_priority() {
        let mut queue = TestQueue::new();
        queue.enqueue(Task::new("t1", 0));
        queue.enqueue(Task::new("t2", 0));
        assert_eq!(drain_payloads(&mut queue), vec!["t1", "t2"]);
    }

    #[test]
    fn higher_priority_is_served_first() {
        let mut queue = TestQueue::new();
        queue.enqueue(Task::new("t1", 0));
        queue.enqueue(Task::new("t2", 1));
        queue.enqueue(Task::new("t3", 0));
        assert_eq!(drain_payloads(&mut queue), vec!["t2", "t1", "t3"]);
    }

    #[test]
    fn weighted_service_favours_the_higher_lane() {
        let mut queue = TestQueue::new();
        for payload in &["a1", "a2", "a3", "a4", "a5", "a6"] {
            queue.enqueue(Task::new(*payload, 0));
        }
        for payload in &["b1", "b2", "b3", "b4", "b5", "b6"] {
            queue.enqueue(Task::new(*payload, 1));
        }
        // Lane 1 is served twice per cycle, lane 0 once, until lane 1 runs
        // dry and lane 0 drains alone.
        assert_eq!(
            drain_payloads(&mut queue),
            vec!["b1", "b2", "a1", "b3", "b4", "a2", "b5", "b6", "a3", "a4", "a5", "a6"]
        );
    }

    #[test]
    fn read_after_write_beats_priority() {
        let mut queue = TestQueue::new();
        queue.enqueue(Task::new("t1", 0).writes(vec!["c"]));
        queue.enqueue(Task::new("t2", 5).reads(vec!["c"]));
        assert_eq!(drain_payloads(&mut queue), vec!["t1", "t2"]);
    }

    #[test]
    fn writers_serialize_with_earlier_writers() {
        let mut queue = TestQueue::new();
        queue.enqueue(Task::new("t1", 0).writes(vec!["c"]));
        queue.enqueue(Task::new("t2", 9).writes(vec!["c"]));
        queue.enqueue(Task::new("t3", 0).reads(vec!["c"]));
        // t2 outranks t1 but writes over it, and t3 reads t2's output.
        assert_eq!(drain_payloads(&mut queue), vec!["t1", "t2", "t3"]);
    }

    #[test]
    fn independent_lanes_interleave_by_weight() {
        let mut queue = TestQueue::new();
        queue.enqueue(Task::new("t1", 0));
        queue.enqueue(Task::new("t2", 2));
        queue.enqueue(Task::new("t3", 0));
        queue.enqueue(Task::new("t4", 2));
        assert_eq!(drain_payloads(&mut queue), vec!["t2", "t4", "t1", "t3"]);
    }

    #[test]
    fn is_empty_tracks_readiness_not_pending_work() {
        let mut queue = TestQueue::new();
        queue.enqueue(Task::new("t1", 0).writes(vec!["c"]));
        queue.enqueue(Task::new("t2", 0).reads(vec!["c"]));
        assert!(!queue.is_empty());
        assert_eq!(queue.pending(), 2);
        queue.dequeue();
        // t2 became ready the moment t1 was handed out.
        assert!(!queue.is_empty());
        queue.dequeue();
        assert!(queue.is_empty());
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    fn merge_fuses_writer_and_reader() {
        let mut queue = TestQueue::new();
        queue.register_rewriter(PairRewriter::fusing("t1", "t2", "t12"));
        queue.enqueue(Task::new("t1", 0).writes(vec!["c"]));
        queue.enqueue(Task::new("t2", 0).reads(vec!["c"]));
        assert_eq!(queue.pending(), 1);
        assert_eq!(queue.dequeue().map(|task| *task.payload()), Some("t12"));
        assert!(queue.dequeue().is_none());
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    fn merged_instruction_waits_for_both_ancestors() {
        let mut queue = TestQueue::new();
        queue.register_rewriter(PairRewriter::fusing("t1", "t2", "t12"));
        queue.enqueue(Task::new("t0", 0).writes(vec!["a"]));
        queue.enqueue(Task::new("t1", 0).reads(vec!["a"]).writes(vec!["b"]));
        queue.enqueue(Task::new("t2", 0).reads(vec!["b"]));
        // The fusion inherits t1's dependency on t0.
        assert_eq!(drain_payloads(&mut queue), vec!["t0", "t12"]);
    }

    #[test]
    fn merge_redirects_later_readers_to_the_fusion() {
        let mut queue = TestQueue::new();
        queue.register_rewriter(PairRewriter::fusing("t1", "t2", "t12"));
        queue.enqueue(Task::new("t1", 0).writes(vec!["c"]));
        queue.enqueue(Task::new("t2", 0).reads(vec!["c"]));
        queue.enqueue(Task::new("t3", 0).reads(vec!["c"]));
        assert_eq!(drain_payloads(&mut queue), vec!["t12", "t3"]);
    }

    #[test]
    fn no_merge_when_a_bystander_reads_the_fusions_writes() {
        let mut queue = TestQueue::new();
        queue.register_rewriter(PairRewriter::fusing("t1", "t3", "t13"));
        queue.enqueue(Task::new("t1", 0).writes(vec!["c"]));
        queue.enqueue(Task::new("t2", 0).reads(vec!["c", "e"]));
        queue.enqueue(Task::new("t3", 0).reads(vec!["c"]).writes(vec!["e"]));
        let drained = drain_payloads(&mut queue);
        assert_eq!(drained.len(), 3);
        assert_eq!(drained[0], "t1");
        assert!(!drained.contains(&"t13"));
    }

    #[test]
    fn no_merge_when_the_reader_depends_on_a_bystander() {
        let mut queue = TestQueue::new();
        queue.register_rewriter(PairRewriter::fusing("t1", "t3", "t13"));
        queue.enqueue(Task::new("t1", 0).writes(vec!["c"]));
        queue.enqueue(Task::new("t2", 0).reads(vec!["c"]).writes(vec!["d"]));
        queue.enqueue(Task::new("t3", 0).reads(vec!["c", "d"]));
        assert_eq!(drain_payloads(&mut queue), vec!["t1", "t2", "t3"]);
    }

    #[test]
    fn no_merge_when_the_reader_transitively_depends_on_a_bystander() {
        let mut queue = TestQueue::new();
        queue.register_rewriter(PairRewriter::fusing("t1", "t4", "t14"));
        queue.enqueue(Task::new("t1", 0).writes(vec!["c"]));
        queue.enqueue(Task::new("t2", 0).reads(vec!["c"]).writes(vec!["w"]));
        queue.enqueue(Task::new("t3", 0).writes(vec!["w"]));
        queue.enqueue(Task::new("t4", 0).reads(vec!["c"]).writes(vec!["w"]));
        // t4 reaches t2 through t3; fusing t1 and t4 would deadlock t2.
        assert_eq!(drain_payloads(&mut queue), vec!["t1", "t2", "t3", "t4"]);
    }

    #[test]
    fn rewriter_may_decline_a_safe_pair() {
        let mut queue = TestQueue::new();
        queue.register_rewriter(PairRewriter {
            first: "t1",
            second: "t2",
            fused: "t12",
            decline: true,
        });
        queue.enqueue(Task::new("t1", 0).writes(vec!["c"]));
        queue.enqueue(Task::new("t2", 0).reads(vec!["c"]));
        assert_eq!(drain_payloads(&mut queue), vec!["t1", "t2"]);
    }

    #[test]
    fn display_dumps_the_graph_deterministically() {
        let mut queue = TestQueue::new();
        queue.enqueue(Task::new("t1", 0).writes(vec!["c"]));
        queue.enqueue(Task::new("t2", 5).reads(vec!["c"]));
        assert_eq!(
            queue.to_string(),
            r#"TaskQueue{
  [0] priority=0 reads={} writes={"c"} deps=[]
  [1] priority=5 reads={"c"} writes={} deps=[0]
 ready: [0]
}"#
        );
    }

    #[test]
    fn checker_accepts_a_live_queue() {
        let mut queue = TestQueue::new();
        queue.enqueue(Task::new("t1", 0).writes(vec!["c"]));
        queue.enqueue(Task::new("t2", 3).reads(vec!["c"]).writes(vec!["d"]));
        queue.dequeue();
        assert!(queue.check_invariants().is_ok());
    }

    #[test]
    fn checker_reports_a_stale_writer() {
        let mut queue = TestQueue::new();
        queue.enqueue(Task::new("t1", 0).writes(vec!["c"]));
        queue
            .latest_writer
            .insert("z", NodeIndex::new(7));
        let violation = queue.check_invariants().unwrap_err();
        assert_display_snapshot!(violation, @r###"latest-writer entry for "z" does not name a live writer of it"###);
    }

    #[test]
    fn checker_reports_a_missing_ready_entry() {
        let mut queue = TestQueue::new();
        queue.enqueue(Task::new("t1", 0));
        queue.ready.pop();
        assert!(matches!(
            queue.check_invariants(),
            Err(InvariantViolation::EligibleNotReady(_))
        ));
    }

    #[derive(Error, Debug)]
    #[error("refused {0}")]
    struct Refused(&'static str);

    struct Collector {
        seen: Vec<&'static str>,
        refuse: Option<&'static str>,
    }

    #[async_trait(?Send)]
    impl Execute<&'static str, &'static str> for Collector {
        type Error = Refused;

        async fn execute(&mut self, task: TestTask) -> Result<(), Refused> {
            let payload = *task.payload();
            if self.refuse == Some(payload) {
                return Err(Refused(payload));
            }
            self.seen.push(payload);
            Ok(())
        }
    }

    #[test]
    fn drain_executes_everything_in_dequeue_order() {
        let mut queue = TestQueue::new();
        queue.enqueue(Task::new("t1", 0).writes(vec!["c"]));
        queue.enqueue(Task::new("t2", 4).reads(vec!["c"]));
        queue.enqueue(Task::new("t3", 0));
        let mut collector = Collector {
            seen: Vec::new(),
            refuse: None,
        };
        let completed = block_on(drain(&mut queue, &mut collector)).unwrap();
        assert_eq!(completed, 3);
        assert_eq!(collector.seen[0], "t1");
        assert!(queue.is_empty());
    }

    #[test]
    fn drain_stops_at_the_first_executor_error() {
        let mut queue = TestQueue::new();
        queue.enqueue(Task::new("t1", 0));
        queue.enqueue(Task::new("boom", 0));
        queue.enqueue(Task::new("t3", 0));
        let mut collector = Collector {
            seen: Vec::new(),
            refuse: Some("boom"),
        };
        let result = block_on(drain(&mut queue, &mut collector));
        assert!(result.is_err());
        assert_eq!(collector.seen, vec!["t1"]);
        // The failing task was already handed over; the rest stays queued.
        assert_eq!(queue.pending(), 1);
        assert_eq!(queue.dequeue().map(|task| *task.payload()), Some("t3"));
    }
}
