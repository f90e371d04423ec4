//! The environment arena.
//!
//! A fixed pool of records plus a singly linked free list threaded through
//! the records themselves. Slots leave the list at the head and return at
//! the tail, so freed slots are reused in the order they were freed.

use super::{Env, EnvId, EnvStatus};
use crate::{error::KernelError, memlayout::ENVGENSHIFT};
use abyss::MAX_CPU;
use alloc::vec::Vec;

/// Every environment record, and which one each processor runs.
pub struct EnvTable {
    envs: Vec<Env>,
    free_head: Option<usize>,
    free_tail: Option<usize>,
    index_mask: usize,
    curenv: [Option<usize>; MAX_CPU],
}

impl EnvTable {
    /// Build `capacity` free records linked in index order.
    pub fn new(capacity: usize) -> Self {
        assert!(
            capacity > 0 && capacity <= 1 << ENVGENSHIFT,
            "environment capacity {} out of range",
            capacity
        );
        let mut envs: Vec<Env> = (0..capacity).map(|_| Env::empty()).collect();
        for (idx, env) in envs.iter_mut().enumerate() {
            env.link = if idx + 1 < capacity { Some(idx + 1) } else { None };
        }
        Self {
            envs,
            free_head: Some(0),
            free_tail: Some(capacity - 1),
            index_mask: capacity.next_power_of_two() - 1,
            curenv: [None; MAX_CPU],
        }
    }

    pub fn capacity(&self) -> usize {
        self.envs.len()
    }

    /// Slot the next allocation will take.
    pub(crate) fn free_head(&self) -> Option<usize> {
        self.free_head
    }

    /// Unlink the head of the free list.
    pub(crate) fn pop_free(&mut self) -> Option<usize> {
        let idx = self.free_head?;
        self.free_head = self.envs[idx].link.take();
        if self.free_head.is_none() {
            self.free_tail = None;
        }
        Some(idx)
    }

    /// Append `idx` to the tail of the free list.
    pub(crate) fn push_free(&mut self, idx: usize) {
        debug_assert_eq!(self.envs[idx].status, EnvStatus::Free);
        self.envs[idx].link = None;
        match self.free_tail {
            Some(tail) => self.envs[tail].link = Some(idx),
            None => self.free_head = Some(idx),
        }
        self.free_tail = Some(idx);
    }

    /// Number of slots on the free list.
    pub fn free_count(&self) -> usize {
        let mut count = 0;
        let mut cursor = self.free_head;
        while let Some(idx) = cursor {
            count += 1;
            cursor = self.envs[idx].link;
        }
        count
    }

    /// Identity for the next occupancy of slot `idx`.
    pub(crate) fn next_id(&self, idx: usize) -> EnvId {
        let mut generation =
            self.envs[idx].id.into_raw().wrapping_add(1 << ENVGENSHIFT) & !(self.index_mask as i32);
        if generation <= 0 {
            generation = 1 << ENVGENSHIFT;
        }
        EnvId::from_raw(generation | idx as i32)
    }

    pub fn get(&self, idx: usize) -> &Env {
        &self.envs[idx]
    }

    pub fn get_mut(&mut self, idx: usize) -> &mut Env {
        &mut self.envs[idx]
    }

    /// Slot running on processor `cpu`.
    pub fn current(&self, cpu: usize) -> Option<usize> {
        self.curenv[cpu]
    }

    pub(crate) fn set_current(&mut self, cpu: usize, idx: Option<usize>) {
        self.curenv[cpu] = idx;
    }

    /// Processor whose current environment is slot `idx`.
    pub fn running_on(&self, idx: usize) -> Option<usize> {
        self.curenv.iter().position(|cur| *cur == Some(idx))
    }

    /// First live slot matching `pred`.
    pub fn find(&self, mut pred: impl FnMut(&Env) -> bool) -> Option<usize> {
        self.envs
            .iter()
            .position(|env| env.status != EnvStatus::Free && pred(env))
    }

    /// Resolve `id` to a slot on behalf of the environment in slot `caller`.
    ///
    /// [`EnvId::CALLER`] names the caller itself. Any other identity must
    /// match the current occupant of its slot. With `require_related`, the
    /// target must further be the caller or one of its immediate children;
    /// kernel context (no caller) passes that check.
    pub fn lookup(
        &self,
        id: EnvId,
        caller: Option<usize>,
        require_related: bool,
    ) -> Result<usize, KernelError> {
        if id == EnvId::CALLER {
            return caller.ok_or(KernelError::BadEnv);
        }
        let idx = id.slot(self.index_mask);
        let env = self.envs.get(idx).ok_or(KernelError::BadEnv)?;
        if env.status == EnvStatus::Free || env.id != id {
            return Err(KernelError::BadEnv);
        }
        if let (true, Some(caller)) = (require_related, caller) {
            if idx != caller && env.parent != Some(self.envs[caller].id) {
                return Err(KernelError::BadEnv);
            }
        }
        Ok(idx)
    }
}
