//! Conflict-free allocation of application slots.
//!
//! Concurrent callers asking for "the next free app number" must never
//! collide. Allocation is therefore a single atomic insert relying on the
//! `UNIQUE(model, app_number, version)` constraint, retried with the next
//! candidate on conflict, never a read-then-write sequence guarded by
//! application logic. Version lineage operations span multiple statements
//! and serialize through a named file lock instead.

use std::path::PathBuf;
use std::time::Duration;

use crate::db::{Db, DbHandle};
use crate::errors::ReservationError;
use crate::lock::NamedLock;
use crate::models::ApplicationSlot;

/// Attempts before giving up on finding a free number. Only reachable when
/// a pathological number of allocators race on one model.
const MAX_ALLOCATION_ATTEMPTS: u32 = 64;

#[derive(Clone)]
pub struct ReservationStore {
    db: DbHandle,
    lock_dir: PathBuf,
    lock_timeout: Duration,
}

impl ReservationStore {
    pub fn new(db: DbHandle, lock_dir: PathBuf, lock_timeout: Duration) -> Self {
        Self {
            db,
            lock_dir,
            lock_timeout,
        }
    }

    /// Allocate a slot for `model`.
    ///
    /// With no explicit number, the next free app number is claimed; the set
    /// of numbers handed to concurrent callers is disjoint and contiguous.
    /// With an explicit number, that exact slot is claimed or
    /// `NumberTaken` is returned.
    pub async fn allocate(
        &self,
        model: &str,
        requested_app_number: Option<u32>,
    ) -> Result<ApplicationSlot, ReservationError> {
        let model = model.to_string();
        self.db
            .call(move |db| Ok(allocate_blocking(db, &model, requested_app_number)))
            .await
            .map_err(ReservationError::Database)?
    }

    /// Create the next version in a slot's lineage.
    ///
    /// Lineages are linear: branching from anything but the latest version is
    /// rejected by re-reading the latest version under the lineage lock, not
    /// by trusting the caller's idea of the version number.
    pub async fn create_version(
        &self,
        parent_slot_id: i64,
    ) -> Result<ApplicationSlot, ReservationError> {
        let lock_dir = self.lock_dir.clone();
        let lock_timeout = self.lock_timeout;
        self.db
            .call(move |db| {
                Ok(create_version_blocking(
                    db,
                    parent_slot_id,
                    &lock_dir,
                    lock_timeout,
                ))
            })
            .await
            .map_err(ReservationError::Database)?
    }
}

fn allocate_blocking(
    db: &Db,
    model: &str,
    requested: Option<u32>,
) -> Result<ApplicationSlot, ReservationError> {
    if let Some(app_number) = requested {
        return match db
            .try_insert_slot(model, app_number, 1, None)
            .map_err(ReservationError::Database)?
        {
            Some(slot) => Ok(slot),
            None => Err(ReservationError::NumberTaken {
                model: model.to_string(),
                app_number,
            }),
        };
    }

    for _ in 0..MAX_ALLOCATION_ATTEMPTS {
        // Re-read the high-water mark every attempt; a conflict means a
        // concurrent allocator won this number and the next one is free.
        let candidate = db
            .max_app_number(model)
            .map_err(ReservationError::Database)?
            .map(|n| n + 1)
            .unwrap_or(1);
        if let Some(slot) = db
            .try_insert_slot(model, candidate, 1, None)
            .map_err(ReservationError::Database)?
        {
            return Ok(slot);
        }
    }
    Err(ReservationError::Exhausted {
        model: model.to_string(),
        attempts: MAX_ALLOCATION_ATTEMPTS,
    })
}

fn create_version_blocking(
    db: &Db,
    parent_slot_id: i64,
    lock_dir: &std::path::Path,
    lock_timeout: Duration,
) -> Result<ApplicationSlot, ReservationError> {
    let parent = db
        .get_slot(parent_slot_id)
        .map_err(ReservationError::Database)?
        .ok_or(ReservationError::SlotNotFound {
            slot_id: parent_slot_id,
        })?;

    let lock_name = lineage_lock_name(&parent.model, parent.app_number);
    let _lock = NamedLock::acquire(lock_dir, &lock_name, lock_timeout)?;

    let latest = db
        .latest_version(&parent.model, parent.app_number)
        .map_err(ReservationError::Database)?
        .ok_or(ReservationError::SlotNotFound {
            slot_id: parent_slot_id,
        })?;

    if latest.id != parent.id {
        return Err(ReservationError::StaleParent {
            slot_id: parent.id,
            model: parent.model,
            app_number: parent.app_number,
            version: parent.version,
            latest: latest.version,
        });
    }

    match db
        .try_insert_slot(
            &parent.model,
            parent.app_number,
            latest.version + 1,
            Some(parent.id),
        )
        .map_err(ReservationError::Database)?
    {
        Some(slot) => Ok(slot),
        // A conflict under the lock means a writer outside the lock
        // protocol won the version; the caller's parent is stale now.
        None => Err(ReservationError::StaleParent {
            slot_id: parent.id,
            model: parent.model,
            app_number: parent.app_number,
            version: parent.version,
            latest: latest.version + 1,
        }),
    }
}

fn lineage_lock_name(model: &str, app_number: u32) -> String {
    let safe: String = model
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect();
    format!("lineage_{}_{}", safe, app_number)
}
