use std::panic::Location;
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[track_caller]
fn report(context: &'static str, err: &dyn std::fmt::Display) {
    let loc = Location::caller();
    tracing::error!(
        target: "relay.rpc",
        context,
        file = loc.file(),
        line = loc.line(),
        column = loc.column(),
        error = %err,
        "lock poisoned; continuing with recovered guard"
    );
}

#[track_caller]
pub(crate) fn lock<'a, T>(mutex: &'a Mutex<T>, context: &'static str) -> MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(err) => {
            report(context, &err);
            err.into_inner()
        }
    }
}

#[track_caller]
pub(crate) fn read<'a, T>(lock: &'a RwLock<T>, context: &'static str) -> RwLockReadGuard<'a, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(err) => {
            report(context, &err);
            err.into_inner()
        }
    }
}

#[track_caller]
pub(crate) fn write<'a, T>(lock: &'a RwLock<T>, context: &'static str) -> RwLockWriteGuard<'a, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(err) => {
            report(context, &err);
            err.into_inner()
        }
    }
}
