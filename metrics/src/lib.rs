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

//! Opt-in instrumentation for hot scheduler operations. Sites register lazily
//! the first time they are hit, record into a thread-local table, and cost a
//! single atomic load when disabled.

use std::{
    cell::RefCell,
    fmt,
    sync::atomic::{AtomicBool, Ordering},
    thread_local,
    time::{Duration, Instant},
};

#[derive(Debug, Default)]
struct Site {
    name: &'static str,
    hits: usize,
    micros: u128,
}

#[derive(Debug, Default)]
struct Registry {
    sites: Vec<Site>,
}

impl Registry {
    fn register(&mut self, name: &'static str) -> usize {
        self.sites.push(Site {
            name,
            ..Default::default()
        });
        self.sites.len() - 1
    }

    fn bump(&mut self, site: usize) {
        self.sites[site].hits += 1;
    }

    fn record(&mut self, site: usize, elapsed: Duration) {
        let site = &mut self.sites[site];
        site.hits += 1;
        site.micros += elapsed.as_micros();
    }
}

impl fmt::Display for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut sites: Vec<&Site> = self.sites.iter().collect();
        sites.sort_by_key(|site| site.name);

        let mut name_width = 5; // To fit "site ".
        for site in &sites {
            name_width = std::cmp::max(name_width, site.name.len());
        }
        writeln!(
            f,
            "{:name_width$} {:>6} {:>9} {:>11}",
            "site ",
            "hits",
            "avg (us)",
            "total (us)",
            name_width = name_width
        )?;
        for site in sites {
            if site.micros == 0 {
                writeln!(
                    f,
                    "{:name_width$} {:>6} {:>9} {:>11}",
                    site.name,
                    site.hits,
                    "-",
                    "-",
                    name_width = name_width
                )?;
            } else {
                writeln!(
                    f,
                    "{:name_width$} {:>6} {:>9.3} {:>11}",
                    site.name,
                    site.hits,
                    site.micros as f64 / site.hits as f64,
                    site.micros,
                    name_width = name_width
                )?;
            }
        }
        Ok(())
    }
}

thread_local! {
    static REGISTRY: RefCell<Registry> = RefCell::new(Registry::default());
}
static ENABLED: AtomicBool = AtomicBool::new(false);

pub fn enable() {
    ENABLED.store(true, Ordering::Relaxed);
}

pub fn is_enabled() -> bool {
    ENABLED.load(Ordering::Relaxed)
}

pub fn register_site(name: &'static str) -> usize {
    REGISTRY.with(|registry| registry.borrow_mut().register(name))
}

pub fn bump(site: usize) {
    REGISTRY.with(|registry| registry.borrow_mut().bump(site))
}

pub fn report() -> String {
    REGISTRY.with(|registry| registry.borrow().to_string())
}

pub fn dump() {
    eprintln!("{}", report());
}

/// Accumulates elapsed time into its site when dropped.
pub struct TimerGuard {
    site: usize,
    start: Instant,
}

impl TimerGuard {
    pub fn new(site: usize) -> Self {
        TimerGuard {
            site,
            start: Instant::now(),
        }
    }
}

impl Drop for TimerGuard {
    fn drop(&mut self) {
        REGISTRY.with(|registry| {
            registry
                .borrow_mut()
                .record(self.site, self.start.elapsed())
        });
    }
}

/// Times the rest of the enclosing scope under the given site name.
#[macro_export]
macro_rules! time_scope {
    ($name:literal) => {
        let _time_scope_guard = if $crate::is_enabled() {
            thread_local! {
                static SITE: usize = $crate::register_site($name);
            }
            ::core::option::Option::Some($crate::TimerGuard::new(SITE.with(|site| *site)))
        } else {
            ::core::option::Option::None
        };
    };
}

/// Counts one occurrence of the given site name.
#[macro_export]
macro_rules! count_event {
    ($name:literal) => {
        if $crate::is_enabled() {
            thread_local! {
                static SITE: usize = $crate::register_site($name);
            }
            SITE.with(|site| $crate::bump(*site));
        }
    };
}
