//! Build-time registration of worker functions.
//!
//! A worker process is a fresh copy of the host executable; it shares no
//! in-memory state with the process that created the pool, so it cannot be
//! handed a closure. Instead, [`register_worker_fn!`](crate::register_worker_fn)
//! records a type-erased entry point under a stable name at load time
//! (mirroring how the pack's engine crate registers lock-ordering descriptors
//! with `inventory::submit!`), and a worker looks its function up by that name.

use std::collections::HashMap;
use std::sync::OnceLock;

/// A type-erased worker function: decode the argument payload, run the
/// function, encode the result. Produced by [`register_worker_fn!`](crate::register_worker_fn).
pub struct WorkerFnDescriptor {
    pub name: &'static str,
    pub invoke: fn(&[u8]) -> Result<Vec<u8>, String>,
}

inventory::collect!(WorkerFnDescriptor);

fn directory() -> &'static HashMap<&'static str, &'static WorkerFnDescriptor> {
    static DIRECTORY: OnceLock<HashMap<&'static str, &'static WorkerFnDescriptor>> =
        OnceLock::new();
    DIRECTORY.get_or_init(|| {
        let mut map = HashMap::new();
        for descriptor in inventory::iter::<WorkerFnDescriptor> {
            if map.insert(descriptor.name, descriptor).is_some() {
                panic!(
                    "duplicate worker function registered under name {:?}",
                    descriptor.name
                );
            }
        }
        map
    })
}

pub(crate) fn lookup(name: &str) -> Result<&'static WorkerFnDescriptor, String> {
    directory()
        .get(name)
        .copied()
        .ok_or_else(|| format!("no worker function registered under name {name:?}"))
}

/// Registers a [`crate::task::MapFn`] implementation under its [`MapFn::NAME`](crate::task::MapFn::NAME).
///
/// Call this once per implementation, at module scope, in the same binary
/// whose `main` calls [`crate::init`]. Requires `inventory` as a dependency
/// is not necessary: the macro reaches `inventory::submit!` through
/// `$crate`, i.e. through this crate's own re-export.
#[macro_export]
macro_rules! register_worker_fn {
    ($ty:ty) => {
        $crate::inventory::submit! {
            $crate::registry::WorkerFnDescriptor {
                name: <$ty as $crate::task::MapFn>::NAME,
                invoke: |payload: &[u8]| -> ::std::result::Result<::std::vec::Vec<u8>, ::std::string::String> {
                    let args: <$ty as $crate::task::MapFn>::Args = $crate::wire::decode(payload)?;
                    let output = <$ty as $crate::task::MapFn>::call(args)?;
                    $crate::wire::encode(&output)
                },
            }
        }
    };
}
