use crate::completion::CallTag;

use super::Call;

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryError {
    #[error("tag {0} resolves to no live call")]
    Unknown(CallTag),
    #[error("call {0} is already being advanced")]
    Busy(CallTag),
}

struct Entry {
    generation: u32,
    live: bool,
    call: Option<Call>,
}

/// Slot table owning every in-flight call.
///
/// A call is checked out while it is advanced and checked back in afterwards,
/// so the table lock is never held across business logic. Releasing a call
/// bumps the generation of its slot; tags of released calls never resolve
/// again.
#[derive(Default)]
pub struct CallRegistry {
    entries: Vec<Entry>,
    free: Vec<u32>,
    len: usize,
}

impl CallRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a tag and store the call built for it.
    pub fn insert_with<F>(&mut self, f: F) -> CallTag
    where
        F: FnOnce(CallTag) -> Call,
    {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.entries.push(Entry {
                    generation: 0,
                    live: false,
                    call: None,
                });
                (self.entries.len() - 1) as u32
            }
        };
        let entry = &mut self.entries[index as usize];
        let tag = CallTag {
            index,
            generation: entry.generation,
        };
        entry.live = true;
        entry.call = Some(f(tag));
        self.len += 1;
        tag
    }

    fn entry_mut(&mut self, tag: CallTag) -> Result<&mut Entry, RegistryError> {
        match self.entries.get_mut(tag.index as usize) {
            Some(entry) if entry.live && entry.generation == tag.generation => Ok(entry),
            _ => Err(RegistryError::Unknown(tag)),
        }
    }

    /// Take the call out for advancing.
    pub fn checkout(&mut self, tag: CallTag) -> Result<Call, RegistryError> {
        self.entry_mut(tag)?
            .call
            .take()
            .ok_or(RegistryError::Busy(tag))
    }

    /// Return a checked-out call.
    pub fn checkin(&mut self, tag: CallTag, call: Call) -> Result<(), RegistryError> {
        let entry = self.entry_mut(tag)?;
        if entry.call.is_some() {
            return Err(RegistryError::Busy(tag));
        }
        entry.call = Some(call);
        Ok(())
    }

    /// Destroy a call. Any checked-out instance must be dropped by the caller.
    pub fn release(&mut self, tag: CallTag) -> Result<(), RegistryError> {
        let entry = self.entry_mut(tag)?;
        entry.live = false;
        entry.call = None;
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(tag.index);
        self.len -= 1;
        Ok(())
    }

    pub fn contains(&self, tag: CallTag) -> bool {
        matches!(
            self.entries.get(tag.index as usize),
            Some(entry) if entry.live && entry.generation == tag.generation
        )
    }

    /// Number of live calls, checked out or not.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
