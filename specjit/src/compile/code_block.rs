//! The code block being compiled: the lower tier's description of a function, including the
//! switch jump tables that optimised code shares with it.

use parking_lot::{Mutex, MutexGuard};
use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// A dense table for switches over small integers: entry `i` is the code address for the case
/// `min + i`.
#[derive(Clone, Debug, Default)]
pub struct SimpleJumpTable {
    pub min: i32,
    pub len: usize,
    /// Empty until linked.
    pub ctis: Vec<u64>,
    /// The code address for values outside the table. Zero until linked.
    pub default: u64,
}

/// A sparse table for switches over strings.
#[derive(Clone, Debug, Default)]
pub struct StringJumpTable {
    /// Keys are owned by the lower tier; only their targets are ever rewritten.
    pub entries: HashMap<Arc<str>, u64>,
    pub default: u64,
}

#[derive(Debug, Default)]
pub struct JumpTables {
    pub imm: Vec<SimpleJumpTable>,
    pub string: Vec<StringJumpTable>,
}

#[derive(Debug)]
pub struct CodeBlock {
    pub name: String,
    pub id: u64,
    /// The number of declared parameters, including `this`.
    pub num_parameters: usize,
    tables: Mutex<JumpTables>,
}

impl CodeBlock {
    pub fn new(name: &str, num_parameters: usize) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_owned(),
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            num_parameters,
            tables: Mutex::new(JumpTables::default()),
        })
    }

    /// Add a dense jump table covering `min..min + len`, returning its index.
    pub fn add_imm_switch_table(&self, min: i32, len: usize) -> usize {
        let mut t = self.tables.lock();
        t.imm.push(SimpleJumpTable {
            min,
            len,
            ctis: Vec::new(),
            default: 0,
        });
        t.imm.len() - 1
    }

    /// Add a sparse jump table over `keys`, returning its index.
    pub fn add_string_switch_table(&self, keys: &[&str]) -> usize {
        let mut t = self.tables.lock();
        t.string.push(StringJumpTable {
            entries: keys.iter().map(|k| (Arc::from(*k), 0)).collect(),
            default: 0,
        });
        t.string.len() - 1
    }

    pub fn tables(&self) -> MutexGuard<'_, JumpTables> {
        self.tables.lock()
    }

    /// The code address for `value` in dense table `table`, or `None` if the table is not linked
    /// or `value` is out of its range.
    pub fn imm_target(&self, table: usize, value: i32) -> Option<u64> {
        let t = self.tables.lock();
        let jt = t.imm.get(table)?;
        let i = usize::try_from(i64::from(value) - i64::from(jt.min)).ok()?;
        jt.ctis.get(i).copied()
    }

    /// The code address for `key` in sparse table `table`, falling back to the table's default.
    pub fn string_target(&self, table: usize, key: &str) -> Option<u64> {
        let t = self.tables.lock();
        let jt = t.string.get(table)?;
        Some(jt.entries.get(key).copied().unwrap_or(jt.default))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn tables() {
        let cb = CodeBlock::new("f", 1);
        let t = cb.add_imm_switch_table(-1, 3);
        assert_eq!(cb.imm_target(t, 0), None);
        cb.tables().imm[t].ctis = vec![10, 20, 30];
        assert_eq!(cb.imm_target(t, -1), Some(10));
        assert_eq!(cb.imm_target(t, 1), Some(30));
        assert_eq!(cb.imm_target(t, 2), None);
        assert_eq!(cb.imm_target(t, -2), None);

        let s = cb.add_string_switch_table(&["a", "b"]);
        cb.tables().string[s].default = 5;
        *cb.tables().string[s].entries.get_mut("a").unwrap() = 7;
        assert_eq!(cb.string_target(s, "a"), Some(7));
        assert_eq!(cb.string_target(s, "zz"), Some(5));
        assert!(CodeBlock::new("g", 1).id != cb.id);
    }
}
