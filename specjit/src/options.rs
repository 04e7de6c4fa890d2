//! Run-time configuration of the JIT backend.
//!
//! Options are normally read once from the environment with [JitOptions::from_env]; tests build
//! them directly.

use crate::log::Log;
use std::{cmp, env, error::Error, str::FromStr};

/// The default number of failures of a single OSR exit after which a recompile is recommended.
const DEFAULT_EXIT_THRESHOLD: u32 = 100;
/// The default upper bound on the size of a single compiled code buffer.
const DEFAULT_CODE_LIMIT: usize = 16 * 1024 * 1024;

#[derive(Clone, Debug)]
pub struct JitOptions {
    /// Check ledger / register bank consistency after every node is lowered.
    pub assert_state: bool,
    /// Emit a breakpoint at the start of blocks that upstream analysis proved unreachable.
    pub breakpoint_unreachable: bool,
    /// How many times may a single OSR exit fire before we recommend recompiling?
    pub exit_threshold: u32,
    /// The largest code buffer we are prepared to allocate. A compile whose output exceeds this
    /// fails in the same way as one whose code buffer could not be mapped.
    pub code_buffer_limit: usize,
    /// The number of worker threads used by [crate::compile::CompileQueue].
    pub jobs: usize,
    pub(crate) log: Log,
}

impl Default for JitOptions {
    fn default() -> Self {
        Self {
            assert_state: cfg!(debug_assertions),
            breakpoint_unreachable: cfg!(debug_assertions),
            exit_threshold: DEFAULT_EXIT_THRESHOLD,
            code_buffer_limit: DEFAULT_CODE_LIMIT,
            jobs: cmp::max(1, num_cpus::get().saturating_sub(1)),
            log: Log::default(),
        }
    }
}

impl JitOptions {
    /// Build a [JitOptions] from the `SPECJIT_*` environment variables, using defaults for any
    /// which are not set.
    pub fn from_env() -> Result<Self, Box<dyn Error>> {
        let mut opts = Self {
            log: Log::new()?,
            ..Self::default()
        };
        if let Some(x) = env_parse::<u8>("SPECJIT_ASSERT_STATE")? {
            opts.assert_state = x != 0;
        }
        if let Some(x) = env_parse::<u32>("SPECJIT_EXIT_THRESHOLD")? {
            opts.exit_threshold = x;
        }
        if let Some(x) = env_parse::<usize>("SPECJIT_CODE_LIMIT")? {
            opts.code_buffer_limit = x;
        }
        if let Some(x) = env_parse::<usize>("SPECJIT_JOBS")? {
            opts.jobs = cmp::max(1, x);
        }
        Ok(opts)
    }
}

fn env_parse<T: FromStr>(name: &str) -> Result<Option<T>, Box<dyn Error>>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(x) => x
            .parse::<T>()
            .map(Some)
            .map_err(|e| format!("Invalid value for {name} '{x}': {e}").into()),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults() {
        let opts = JitOptions::default();
        assert_eq!(opts.exit_threshold, DEFAULT_EXIT_THRESHOLD);
        assert_eq!(opts.code_buffer_limit, DEFAULT_CODE_LIMIT);
        assert!(opts.jobs >= 1);
    }

    #[test]
    fn parse_errors() {
        // Use a variable name nothing else reads so that tests can run in parallel.
        unsafe { env::set_var("SPECJIT_TEST_PARSE", "abc") };
        assert!(env_parse::<u32>("SPECJIT_TEST_PARSE").is_err());
        unsafe { env::set_var("SPECJIT_TEST_PARSE", "12") };
        assert_eq!(env_parse::<u32>("SPECJIT_TEST_PARSE").unwrap(), Some(12));
        unsafe { env::remove_var("SPECJIT_TEST_PARSE") };
        assert_eq!(env_parse::<u32>("SPECJIT_TEST_PARSE").unwrap(), None);
    }
}
