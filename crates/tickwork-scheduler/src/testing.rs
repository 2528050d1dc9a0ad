//! Test doubles shared by the unit tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::db::SqliteMirror;
use crate::error::{Result, SchedulerError};
use crate::mirror::JobMirror;
use crate::types::{FieldUpdate, JobRecord, Millis};

/// Delegates to an in-memory SQLite mirror until told to fail writes.
pub(crate) struct FlakyMirror {
    inner: SqliteMirror,
    pub fail_puts: AtomicBool,
    pub fail_updates: AtomicBool,
    pub fail_deletes: AtomicBool,
    /// Panic once on the next `update_fields` for this id.
    panic_on_update: Mutex<Option<String>>,
}

impl FlakyMirror {
    pub fn new() -> Self {
        Self {
            inner: SqliteMirror::open_in_memory().unwrap(),
            fail_puts: AtomicBool::new(false),
            fail_updates: AtomicBool::new(false),
            fail_deletes: AtomicBool::new(false),
            panic_on_update: Mutex::new(None),
        }
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
        self.fail_updates.store(fail, Ordering::SeqCst);
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    pub fn panic_once_on_update(&self, id: &str) {
        *self.panic_on_update.lock().unwrap() = Some(id.to_string());
    }

    fn check(flag: &AtomicBool) -> Result<()> {
        if flag.load(Ordering::SeqCst) {
            return Err(SchedulerError::Persistence("disk on fire".into()));
        }
        Ok(())
    }
}

impl JobMirror for FlakyMirror {
    fn put(&self, record: &JobRecord) -> Result<()> {
        Self::check(&self.fail_puts)?;
        self.inner.put(record)
    }

    fn get_all(&self) -> Result<Vec<JobRecord>> {
        self.inner.get_all()
    }

    fn get_due(&self, upto: Millis) -> Result<Vec<JobRecord>> {
        self.inner.get_due(upto)
    }

    fn update_fields(&self, id: &str, fields: &FieldUpdate) -> Result<()> {
        let armed = {
            let mut target = self.panic_on_update.lock().unwrap();
            if target.as_deref() == Some(id) {
                target.take()
            } else {
                None
            }
        };
        if armed.is_some() {
            panic!("mirror driver bug on {id}");
        }
        Self::check(&self.fail_updates)?;
        self.inner.update_fields(id, fields)
    }

    fn delete(&self, id: &str) -> Result<()> {
        Self::check(&self.fail_deletes)?;
        self.inner.delete(id)
    }

    fn close(&self) -> Result<()> {
        self.inner.close()
    }
}
