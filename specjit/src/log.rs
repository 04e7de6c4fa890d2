//! Logging controlled by the `SPECJIT_LOG` and `SPECJIT_LOG_IR` environment variables.
//!
//! `SPECJIT_LOG=[<path>:]<level>` reports compile events to stderr (or appends them to `path`).
//! `SPECJIT_LOG_IR=[<path>:]<phase>[,...]` dumps the graph and generated code of every compile,
//! but only when built with the `sjd` feature: otherwise the IR functions are no-ops.

use std::{
    env,
    error::Error,
    fs::File,
    io::Write,
    path::{Path, PathBuf},
    str::FromStr,
};
use strum::{Display, EnumString};

/// Which compile events are logged. Each level includes those before it.
#[derive(Copy, Clone, Debug, Display, EnumString, PartialEq, PartialOrd)]
#[strum(serialize_all = "kebab-case")]
pub(crate) enum LogLevel {
    Off,
    /// Compiles abandoned because of a bug in the backend.
    Bug,
    /// Compiles abandoned for routine reasons: a malformed graph or exhausted code memory.
    Abandoned,
    /// The start and end of every compile.
    Compiles,
}

#[derive(Clone, Debug)]
pub(crate) struct Log {
    level: LogLevel,
    /// `None` means stderr.
    path: Option<PathBuf>,
}

impl Default for Log {
    fn default() -> Self {
        Self {
            level: LogLevel::Bug,
            path: None,
        }
    }
}

/// Append `s` to the file at `path`. Logging never fails a compile, so errors are dropped.
fn append(path: &Path, s: &str) {
    File::options()
        .append(true)
        .open(path)
        .map(|mut f| f.write_all(s.as_bytes()))
        .ok();
}

impl Log {
    pub(crate) fn new() -> Result<Self, Box<dyn Error>> {
        let Ok(s) = env::var("SPECJIT_LOG") else {
            return Ok(Self::default());
        };
        let log = Self::parse(&s)?;
        if let Some(p) = &log.path {
            // Each run starts a fresh log.
            File::create(p)?;
        }
        Ok(log)
    }

    fn parse(s: &str) -> Result<Self, Box<dyn Error>> {
        let (path, level) = match s.rsplit_once(':') {
            Some(("-", level)) => (None, level),
            Some((path, level)) => (Some(PathBuf::from(path)), level),
            None => (None, s),
        };
        let level = LogLevel::from_str(level).map_err(|_| {
            format!("SPECJIT_LOG must be `[<path|->:]<off|bug|abandoned|compiles>`, not '{s}'")
        })?;
        Ok(Self { level, path })
    }

    pub(crate) fn enabled(&self, level: LogLevel) -> bool {
        level != LogLevel::Off && level <= self.level
    }

    pub(crate) fn log(&self, level: LogLevel, msg: &str) {
        if !self.enabled(level) {
            return;
        }
        match &self.path {
            Some(p) => append(p, &format!("specjit-{level}: {msg}\n")),
            None => eprintln!("specjit-{level}: {msg}"),
        }
    }
}

/// The stages of a compile whose IR can be dumped.
#[derive(Debug, EnumString, Eq, Hash, PartialEq)]
#[strum(serialize_all = "kebab-case")]
pub(crate) enum IRPhase {
    /// The dataflow graph handed to the backend.
    Graph,
    /// The generated code.
    Asm,
    /// The generated code with instruction offsets and the OSR exit table.
    AsmFull,
}

#[cfg(not(feature = "sjd"))]
mod internals {
    use super::IRPhase;

    pub(crate) fn should_log_ir(_: IRPhase) -> bool {
        false
    }

    pub(crate) fn log_ir(_: &str) {}
}

#[cfg(feature = "sjd")]
mod internals {
    use super::{IRPhase, append};
    use std::{collections::HashSet, env, fs::File, path::Path, str::FromStr, sync::LazyLock};

    static LOG_IR: LazyLock<Option<(String, HashSet<IRPhase>)>> = LazyLock::new(|| {
        let x = env::var("SPECJIT_LOG_IR").ok()?;
        let (path, phases) = x.rsplit_once(':').unwrap_or(("-", x.as_str()));
        let mut log_phases = HashSet::new();
        for p in phases.split(',') {
            match IRPhase::from_str(p) {
                Ok(p) => {
                    log_phases.insert(p);
                }
                Err(_) => eprintln!("specjit-bug: ignoring unknown SPECJIT_LOG_IR phase '{p}'"),
            }
        }
        if path != "-" {
            File::create(path).ok();
        }
        Some((path.to_owned(), log_phases))
    });

    pub(crate) fn should_log_ir(phase: IRPhase) -> bool {
        LOG_IR
            .as_ref()
            .is_some_and(|(_, phases)| phases.contains(&phase))
    }

    pub(crate) fn log_ir(s: &str) {
        match LOG_IR.as_ref().map(|(p, _)| p.as_str()) {
            Some("-") => eprint!("{s}"),
            Some(p) => append(Path::new(p), s),
            None => (),
        }
    }
}

pub(crate) use internals::{log_ir, should_log_ir};

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_levels() {
        let l = Log::parse("compiles").unwrap();
        assert_eq!(l.level, LogLevel::Compiles);
        assert!(l.path.is_none());
        assert!(l.enabled(LogLevel::Bug) && l.enabled(LogLevel::Abandoned));

        let l = Log::parse("-:abandoned").unwrap();
        assert!(l.path.is_none());
        assert!(!l.enabled(LogLevel::Compiles));

        let l = Log::parse("/tmp/jit.log:off").unwrap();
        assert_eq!(l.path, Some(PathBuf::from("/tmp/jit.log")));
        assert!(!l.enabled(LogLevel::Bug));
        assert!(!l.enabled(LogLevel::Off));

        assert!(Log::parse("3").is_err());
        assert!(Log::parse("a:b:verbose").is_err());
        assert!(!Log::default().enabled(LogLevel::Abandoned));
        assert_eq!(LogLevel::Abandoned.to_string(), "abandoned");
    }
}
