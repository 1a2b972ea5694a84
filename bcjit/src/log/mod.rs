//! The implementation of the `BCJIT_LOG*` environment variables.

use std::{env, error::Error, fs::File, io::Write, path::PathBuf};
use strum::{EnumCount, FromRepr};

pub(crate) mod stats;

/// How verbose should bcjit's normal logging be?
#[repr(u8)]
#[derive(Copy, Clone, Debug, EnumCount, FromRepr, PartialEq, PartialOrd)]
pub enum Verbosity {
    /// Disable logging entirely.
    Disabled,
    /// Log errors.
    Error,
    /// Log warnings (e.g. a function that could not be translated).
    Warning,
    /// Log JIT events (e.g. translations, bailouts, invalidations).
    JITEvent,
}

#[derive(Debug)]
pub struct Log {
    /// The requested [Verbosity] level for logging.
    level: Verbosity,
    /// The path to write to. `None` means stderr.
    path: Option<PathBuf>,
}

impl Log {
    /// Configure logging from `BCJIT_LOG`.
    pub fn new() -> Result<Self, Box<dyn Error>> {
        match env::var("BCJIT_LOG") {
            Ok(s) => Self::parse(&s),
            Err(_) => Ok(Self {
                path: None,
                level: Verbosity::Error,
            }),
        }
    }

    fn parse(s: &str) -> Result<Self, Box<dyn Error>> {
        let (path, level) = match s.split(':').collect::<Vec<_>>()[..] {
            [path, level] => {
                if path == "-" {
                    (None, level)
                } else {
                    let path = PathBuf::from(path);
                    // Truncate any existing log so that later appends don't extend a previous
                    // run's log.
                    File::create(&path).ok();
                    (Some(path), level)
                }
            }
            [level] => (None, level),
            [..] => return Err("BCJIT_LOG must be of the format `[<path|->:]<level>`".into()),
        };
        let level = level
            .parse::<u8>()
            .map_err(|e| format!("Invalid BCJIT_LOG level '{s}': {e}"))?;
        let max_level = Verbosity::COUNT - 1;
        let level = Verbosity::from_repr(level)
            .ok_or_else(|| format!("BCJIT_LOG level {level} exceeds maximum {max_level}"))?;
        Ok(Self { path, level })
    }

    /// A log which records nothing.
    pub fn disabled() -> Self {
        Self {
            path: None,
            level: Verbosity::Disabled,
        }
    }

    /// Log `msg` with the [Verbosity] level `level`.
    ///
    /// # Panics
    ///
    /// If `level == Verbosity::Disabled`.
    pub fn log(&self, level: Verbosity, msg: &str) {
        if level <= self.level {
            let prefix = match level {
                Verbosity::Disabled => panic!(),
                Verbosity::Error => "bcjit-error",
                Verbosity::Warning => "bcjit-warning",
                Verbosity::JITEvent => "bcjit-jit-event",
            };
            match &self.path {
                Some(p) => {
                    let s = format!("{prefix}: {msg}\n");
                    File::options()
                        .append(true)
                        .open(p)
                        .map(|mut x| x.write(s.as_bytes()))
                        .ok();
                }
                None => {
                    eprintln!("{prefix}: {msg}");
                }
            }
        }
    }
}

#[derive(Debug, Eq, Hash, PartialEq)]
pub enum IRPhase {
    /// The disassembled bytecode of a function about to be translated.
    Bytecode,
    /// The translated IR function.
    IR,
}

mod internals {
    use super::IRPhase;
    use std::{collections::HashSet, env, error::Error, fs::File, io::Write, sync::LazyLock};

    static LOG_IR: LazyLock<Option<(String, HashSet<IRPhase>)>> = LazyLock::new(|| {
        let x = env::var("BCJIT_LOG_IR").ok()?;
        let (path, phases) = match x.split(':').collect::<Vec<_>>().as_slice() {
            [path, phases] => (*path, *phases),
            [phases] => ("-", *phases),
            _ => panic!("BCJIT_LOG_IR must be of the format '[<path>:]<phase_1>[,...,<phase_n>]'"),
        };
        let mut log_phases = HashSet::new();
        for x in phases.split(',') {
            match IRPhase::from_str(x) {
                Ok(p) => {
                    log_phases.insert(p);
                }
                Err(e) => panic!("{e}"),
            }
        }
        if path != "-" {
            // Truncate any existing log so that later appends don't extend a previous run's
            // log.
            File::create(path).ok();
        }
        Some((path.to_string(), log_phases))
    });

    impl IRPhase {
        pub(super) fn from_str(s: &str) -> Result<Self, Box<dyn Error>> {
            match s {
                "bytecode" => Ok(Self::Bytecode),
                "ir" => Ok(Self::IR),
                _ => Err(format!("Invalid BCJIT_LOG_IR value: {s}").into()),
            }
        }
    }

    pub(crate) fn should_log_ir(phase: IRPhase) -> bool {
        matches!(
            LOG_IR.as_ref().map(|(_, phases)| phases.contains(&phase)),
            Some(true)
        )
    }

    pub(crate) fn log_ir(s: &str) {
        match LOG_IR.as_ref().map(|(p, _)| p.as_str()) {
            Some("-") => eprint!("{s}"),
            Some(x) => {
                File::options()
                    .append(true)
                    .open(x)
                    .map(|mut x| x.write(s.as_bytes()))
                    .ok();
            }
            None => (),
        }
    }
}

pub(crate) use internals::{log_ir, should_log_ir};

#[cfg(test)]
mod test {
    use super::*;
    use std::fs;
    use tempfile::NamedTempFile;

    #[test]
    fn parse_levels() {
        assert_eq!(Log::parse("3").unwrap().level, Verbosity::JITEvent);
        assert_eq!(Log::parse("-:1").unwrap().level, Verbosity::Error);
        assert_eq!(
            Log::parse("4").unwrap_err().to_string(),
            "BCJIT_LOG level 4 exceeds maximum 3"
        );
        assert!(Log::parse("a:b:c").is_err());
        assert!(Log::parse("x").is_err());
    }

    #[test]
    fn log_to_file() {
        let f = NamedTempFile::new().unwrap();
        let p = f.path().to_str().unwrap();
        let log = Log::parse(&format!("{p}:2")).unwrap();
        log.log(Verbosity::Warning, "w");
        log.log(Verbosity::JITEvent, "hidden");
        log.log(Verbosity::Error, "e");
        assert_eq!(
            fs::read_to_string(f.path()).unwrap(),
            "bcjit-warning: w\nbcjit-error: e\n"
        );
    }

    #[test]
    fn phases() {
        assert_eq!(IRPhase::from_str("ir").unwrap(), IRPhase::IR);
        assert!(IRPhase::from_str("asm").is_err());
    }
}
