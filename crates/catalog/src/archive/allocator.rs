//! Archive subdirectory allocation.
//!
//! Every archived file takes one slot in an archive subdirectory, and no
//! subdirectory holds more than [`FILES_PER_DIR`] of them. Directories that
//! already exist are filled up first; after that new ids are synthesized from
//! a counter, shallow while the archive is small and one level deeper for
//! every factor of a hundred.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::ops::Deref;
use std::sync::{Mutex, MutexGuard, PoisonError};

pub const FILES_PER_DIR: u32 = 100;

/// Map a counter value to its hierarchical directory id: `7` is `07`, `100`
/// is `00/01`, `10000` is `00/00/01`.
pub fn dir_id(n: u64) -> String {
    let id = format!("{:02}", n % 100);
    match n / 100 {
        0 => id,
        rest => format!("{id}/{}", dir_id(rest)),
    }
}

#[derive(Debug)]
enum Phase {
    /// Topping up directories that were already in use.
    DrainingExisting,
    /// Handing out a freshly synthesized directory.
    Synthesizing { dir: String, remaining: u32 },
}

/// The never-ending sequence of archive directory ids, one per slot.
///
/// Single consumer; [`ArchiveDirsToUse`] shares it between threads.
#[derive(Debug)]
pub struct DirSequence {
    phase: Phase,
    /// Free capacity left in each pre-existing directory, in id order.
    existing: VecDeque<(String, u32)>,
    /// Every pre-existing id, so synthesis never hands one out twice.
    known: HashSet<String>,
    counter: u64,
}

impl DirSequence {
    pub fn new(initial_usage: impl IntoIterator<Item = (String, u32)>) -> Self {
        let usage: BTreeMap<String, u32> = initial_usage.into_iter().collect();
        let known = usage.keys().cloned().collect();
        let existing = usage
            .into_iter()
            .map(|(dir, used)| (dir, FILES_PER_DIR.saturating_sub(used)))
            .collect();
        Self {
            phase: Phase::DrainingExisting,
            existing,
            known,
            counter: 0,
        }
    }

    /// Next slot. Never runs out.
    pub fn advance(&mut self) -> String {
        loop {
            if let Some(dir) = self.take() {
                return dir;
            }
            let dir = self.next_synthetic();
            self.phase = Phase::Synthesizing {
                dir,
                remaining: FILES_PER_DIR,
            };
        }
    }

    fn take(&mut self) -> Option<String> {
        match &mut self.phase {
            Phase::DrainingExisting => {
                while let Some((dir, remaining)) = self.existing.front_mut() {
                    if *remaining > 0 {
                        *remaining -= 1;
                        return Some(dir.clone());
                    }
                    self.existing.pop_front();
                }
                None
            },
            Phase::Synthesizing { dir, remaining } => {
                if *remaining == 0 {
                    return None;
                }
                *remaining -= 1;
                Some(dir.clone())
            },
        }
    }

    fn next_synthetic(&mut self) -> String {
        loop {
            let dir = dir_id(self.counter);
            self.counter += 1;
            if !self.known.contains(&dir) {
                tracing::debug!(dir = %dir, "Starting new archive directory");
                return dir;
            }
        }
    }
}

impl Iterator for DirSequence {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        Some(self.advance())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Thread-safe source of archive directory slots.
///
/// Slots handed back by a failed operation are reused, oldest first, before
/// the sequence advances.
#[derive(Debug)]
pub struct ArchiveDirsToUse {
    sequence: Mutex<DirSequence>,
    returned: Mutex<VecDeque<String>>,
}

impl ArchiveDirsToUse {
    pub fn new(initial_usage: impl IntoIterator<Item = (String, u32)>) -> Self {
        Self {
            sequence: Mutex::new(DirSequence::new(initial_usage)),
            returned: Mutex::new(VecDeque::new()),
        }
    }

    pub fn get(&self) -> String {
        let returned = lock(&self.returned).pop_front();
        match returned {
            Some(dir) => dir,
            None => lock(&self.sequence).advance(),
        }
    }

    /// A slot that goes back to the pool when dropped, unless
    /// [consumed](ReturnableDir::consume).
    pub fn get_returnable(&self) -> ReturnableDir<'_> {
        ReturnableDir {
            dirs: self,
            dir: Some(self.get()),
        }
    }

    /// Run `f` with a slot, keeping it only if `f` succeeds.
    pub fn with_returnable<T, E>(&self, f: impl FnOnce(&str) -> Result<T, E>) -> Result<T, E> {
        let slot = self.get_returnable();
        let value = f(&slot)?;
        slot.consume();
        Ok(value)
    }

    fn give_back(&self, dir: String) {
        lock(&self.returned).push_back(dir);
    }
}

/// An archive slot on loan from [`ArchiveDirsToUse`].
#[derive(Debug)]
pub struct ReturnableDir<'a> {
    dirs: &'a ArchiveDirsToUse,
    dir: Option<String>,
}

impl ReturnableDir<'_> {
    /// Keep the slot for good.
    pub fn consume(mut self) -> String {
        self.dir.take().unwrap_or_default()
    }
}

impl Deref for ReturnableDir<'_> {
    type Target = str;

    fn deref(&self) -> &str {
        self.dir.as_deref().unwrap_or_default()
    }
}

impl Drop for ReturnableDir<'_> {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take() {
            tracing::debug!(dir = %dir, "Returning unused archive slot");
            self.dirs.give_back(dir);
        }
    }
}
