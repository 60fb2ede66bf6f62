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

use async_trait::async_trait;
use core::fmt::Debug;
use scoreboard_tasks::{Component, Task};

/// Fuses pairs of tasks into single equivalent tasks.
///
/// Both methods must be pure: same arguments, same answer, no side effects.
/// `maybe_rewrite` receives the writer first and the reader second and must
/// only return a task whose execution is indistinguishable from executing
/// the pair in that order; the scheduler has no way to police this, so the
/// soundness obligation sits with the rewriter author.
pub trait Rewriter<C, P>
where
    C: Component,
{
    fn is_of_interest(&self, task: &Task<C, P>) -> bool;
    fn maybe_rewrite(&self, first: &Task<C, P>, second: &Task<C, P>) -> Option<Task<C, P>>;
}

impl<C, P> Debug for dyn Rewriter<C, P>
where
    C: Component,
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Rewriter{{}}")
    }
}

/// Runs dequeued tasks. The scheduler hands over ownership and never looks
/// back; an error stops the drain loop with the remaining work still queued.
#[async_trait(?Send)]
pub trait Execute<C, P>
where
    C: Component,
{
    type Error;

    async fn execute(&mut self, task: Task<C, P>) -> Result<(), Self::Error>;
}
