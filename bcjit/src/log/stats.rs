//! Statistics about the JIT. Durations are wall-clock time and so only approximate where time
//! actually went.

use parking_lot::Mutex;
#[cfg(not(test))]
use std::env;
use std::{
    cell::Cell,
    fs,
    time::{Duration, Instant},
};
use strum::{Display, EnumCount, EnumIter, IntoEnumIterator};

/// Record statistics if enabled. Outside tests this is only enabled if the user defines
/// `BCJIT_LOG_STATS`; in tests it is always enabled.
#[derive(Debug)]
pub(crate) struct Stats {
    // Most runs won't record statistics, so the common check is a cheap `None` test: only if
    // stats are being recorded is the `Mutex` locked.
    inner: Option<Mutex<StatsInner>>,
}

#[derive(Debug)]
struct StatsInner {
    /// The path to write output. If exactly equal to `-`, output will be written to stderr.
    output_path: String,
    /// How many functions were translated successfully?
    functions_translated_ok: u64,
    /// How many functions failed to translate?
    functions_translated_err: u64,
    /// How many times has translated code been entered (including re-entries after a
    /// generator resumes)?
    native_executions: u64,
    /// How many times has translated code handed a frame back to the interpreter?
    bailouts: u64,
    /// How many translated functions were discarded because a type they depend on changed?
    invalidations: u64,
    /// How many conditional branches had an arm replaced by a bailout?
    elided_branches: u64,
    /// The time spent in each [TimingState].
    durations: [Duration; TimingState::COUNT],
}

impl Stats {
    #[cfg(not(test))]
    pub(crate) fn new() -> Self {
        Self {
            inner: env::var("BCJIT_LOG_STATS")
                .ok()
                .map(|p| Mutex::new(StatsInner::new(p))),
        }
    }

    #[cfg(test)]
    pub(crate) fn new() -> Self {
        Self {
            inner: Some(Mutex::new(StatsInner::new("-".to_string()))),
        }
    }

    /// If statistics are being recorded, update them by running `f`; otherwise return
    /// immediately without calling `f`.
    fn update_with<F>(&self, f: F)
    where
        F: FnOnce(&mut StatsInner),
    {
        if let Some(mtx) = &self.inner {
            f(&mut *mtx.lock());
        }
    }

    pub(crate) fn function_translated_ok(&self, elided_branches: usize) {
        self.update_with(|inner| {
            inner.functions_translated_ok += 1;
            inner.elided_branches += elided_branches as u64;
        });
    }

    pub(crate) fn function_translated_err(&self) {
        self.update_with(|inner| inner.functions_translated_err += 1);
    }

    pub(crate) fn native_executed(&self) {
        self.update_with(|inner| inner.native_executions += 1);
    }

    pub(crate) fn bailout(&self) {
        self.update_with(|inner| inner.bailouts += 1);
    }

    pub(crate) fn invalidated(&self) {
        self.update_with(|inner| inner.invalidations += 1);
    }

    /// Change the [TimingState] the current thread is in.
    pub(crate) fn timing_state(&self, new_state: TimingState) {
        self.update_with(|inner| {
            let now = Instant::now();
            let (prev_state, then) = VM_STATE.replace((new_state, now));
            let d = now.saturating_duration_since(then);
            inner.durations[prev_state as usize] =
                inner.durations[prev_state as usize].saturating_add(d);
        });
    }

    /// Output these statistics to the appropriate output path.
    pub(crate) fn output(&self) {
        self.update_with(|inner| inner.output());
    }

    /// The counters (not the durations) as `(name, value)` pairs.
    #[cfg(test)]
    pub(crate) fn counters(&self) -> Vec<(&'static str, u64)> {
        match &self.inner {
            Some(mtx) => mtx.lock().counters(),
            None => Vec::new(),
        }
    }
}

impl StatsInner {
    fn new(output_path: String) -> Self {
        Self {
            output_path,
            functions_translated_ok: 0,
            functions_translated_err: 0,
            native_executions: 0,
            bailouts: 0,
            invalidations: 0,
            elided_branches: 0,
            durations: [Duration::new(0, 0); TimingState::COUNT],
        }
    }

    fn counters(&self) -> Vec<(&'static str, u64)> {
        vec![
            ("functions_translated_ok", self.functions_translated_ok),
            ("functions_translated_err", self.functions_translated_err),
            ("native_executions", self.native_executions),
            ("bailouts", self.bailouts),
            ("invalidations", self.invalidations),
            ("elided_branches", self.elided_branches),
        ]
    }

    fn output(&self) {
        let json = self.to_json();
        if self.output_path == "-" {
            eprintln!("{json}");
        } else {
            fs::write(&self.output_path, json).ok();
        }
    }

    /// Turn these statistics into JSON. The fields are sorted by name so that the output can be
    /// matched textually (e.g. in lang_tester).
    fn to_json(&self) -> String {
        fn fmt_duration(d: Duration) -> String {
            format!("{}.{:03}", d.as_secs(), d.subsec_millis())
        }

        let mut fields = self
            .counters()
            .into_iter()
            .map(|(k, v)| (k.to_owned(), v.to_string()))
            .collect::<Vec<_>>();
        for v in TimingState::iter() {
            let s = v.to_string();
            if !s.is_empty() {
                fields.push((s, fmt_duration(self.durations[v as usize])));
            }
        }
        fields.sort_unstable_by(|(k1, _), (k2, _)| k1.cmp(k2));
        format!(
            r#"{{
    {}
}}"#,
            fields
                .iter()
                .map(|(x, y)| format!(r#""{x}": {y}"#))
                .collect::<Vec<_>>()
                .join(",\n    ")
        )
    }
}

/// The different timing states a thread can be in.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Display, EnumCount, EnumIter)]
// New states:
//   1. must keep `TimingState` convertible with `as usize` without loss of information;
//   2. must not assign explicit discriminants: the variants range over `0..TimingState::COUNT`;
//   3. need a `strum` `to_string` naming their JSON key. An empty name is not output.
pub(crate) enum TimingState {
    /// Time spent in this state is not counted towards anything and is not displayed.
    #[strum(to_string = "")]
    None,
    #[strum(to_string = "duration_interpreting")]
    Interpreting,
    #[strum(to_string = "duration_translating")]
    Translating,
    #[strum(to_string = "duration_native_executing")]
    NativeExecuting,
}

thread_local! {
    static VM_STATE: Cell<(TimingState, Instant)> = Cell::new((TimingState::Interpreting, Instant::now()));
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn json_is_sorted() {
        let s = Stats::new();
        s.function_translated_ok(2);
        s.bailout();
        s.bailout();
        let json = match &s.inner {
            Some(mtx) => mtx.lock().to_json(),
            None => panic!(),
        };
        let keys = json
            .lines()
            .filter_map(|l| l.trim().strip_prefix('"'))
            .filter_map(|l| l.split('"').next())
            .collect::<Vec<_>>();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
        assert!(json.contains(r#""bailouts": 2,"#));
        assert!(json.contains(r#""elided_branches": 2,"#));
        assert!(json.contains(r#""duration_translating": "#));
    }
}
