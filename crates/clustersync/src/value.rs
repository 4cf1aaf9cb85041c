//! Double-buffered replicated values.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use bytes::{BufMut, BytesMut};
use parking_lot::Mutex;

use crate::codec::{Cbor, SyncCodec};
use crate::data_sync::{DataSync, SyncData};
use crate::error::{ProtocolError, Result};

#[derive(Debug)]
struct Buffers<T> {
    /// What readers see.
    front: T,
    /// Latest written or received value.
    back: T,
}

struct Binding {
    sync: Weak<DataSync>,
    idx: u8,
}

/// A value written on the primary node and readable everywhere.
///
/// [`get`](Self::get) returns the front value, which only changes on
/// [`DataSync::update`]. [`set`](Self::set) on the primary stores the back
/// value and broadcasts it; on any other node it fails with
/// [`ProtocolError::NotPrimary`].
pub struct SyncValue<T: SyncCodec> {
    buffers: Mutex<Buffers<T>>,
    binding: OnceLock<Binding>,
    warned_unbound: AtomicBool,
}

impl<T: SyncCodec> SyncValue<T> {
    pub fn new(initial: T) -> Self {
        Self {
            buffers: Mutex::new(Buffers {
                front: initial.clone(),
                back: initial,
            }),
            binding: OnceLock::new(),
            warned_unbound: AtomicBool::new(false),
        }
    }

    /// The visible value.
    pub fn get(&self) -> T {
        self.buffers.lock().front.clone()
    }

    /// Read the visible value in place.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.buffers.lock().front)
    }

    /// Index assigned by the owning [`DataSync`], if bound.
    pub fn index(&self) -> Option<u8> {
        self.binding.get().map(|b| b.idx)
    }

    /// Write a new value. Readers see it after the next update.
    pub fn set(&self, value: T) -> Result<()> {
        let bound = self
            .binding
            .get()
            .and_then(|binding| binding.sync.upgrade().map(|sync| (sync, binding.idx)));

        let Some((sync, idx)) = bound else {
            if !self.warned_unbound.swap(true, Ordering::Relaxed) {
                tracing::warn!("value is not bound to any live data synchronizer; keeping it local");
            }
            self.buffers.lock().back = value;
            return Ok(());
        };

        let Some(node) = sync.writer()? else {
            self.buffers.lock().back = value;
            return Ok(());
        };

        let mut payload = BytesMut::new();
        payload.put_u8(idx);
        value.encode(&mut payload)?;

        self.buffers.lock().back = value;
        tracing::trace!(idx, len = payload.len(), "sending data");
        DataSync::send(node, payload.freeze());
        Ok(())
    }
}

impl<T: SyncCodec + Default> Default for SyncValue<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: SyncCodec> SyncData for SyncValue<T> {
    fn bind(&self, sync: Weak<DataSync>, idx: u8) -> Result<()> {
        self.binding
            .set(Binding { sync, idx })
            .map_err(|_| ProtocolError::AlreadyBound)
    }

    fn decode(&self, bytes: &[u8]) -> Result<()> {
        let value = T::decode(bytes)?;
        self.buffers.lock().back = value;
        Ok(())
    }

    fn update(&self) {
        let mut buffers = self.buffers.lock();
        buffers.front = buffers.back.clone();
    }
}

impl<T: SyncCodec + std::fmt::Debug> std::fmt::Debug for SyncValue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let buffers = self.buffers.lock();
        f.debug_struct("SyncValue")
            .field("front", &buffers.front)
            .field("back", &buffers.back)
            .field("index", &self.index())
            .finish()
    }
}

pub type SyncBool = SyncValue<bool>;
pub type SyncInt32 = SyncValue<i32>;
pub type SyncInt64 = SyncValue<i64>;
pub type SyncFloat32 = SyncValue<f32>;
pub type SyncFloat64 = SyncValue<f64>;

pub type SyncBoolVec = SyncValue<Vec<bool>>;
pub type SyncInt32Vec = SyncValue<Vec<i32>>;
pub type SyncInt64Vec = SyncValue<Vec<i64>>;
pub type SyncFloat32Vec = SyncValue<Vec<f32>>;
pub type SyncFloat64Vec = SyncValue<Vec<f64>>;

/// Any serde type, replicated as CBOR.
pub type SyncCbor<T> = SyncValue<Cbor<T>>;

/// Register `value` with `sync` and return it, for one-line setup.
pub fn synced<T: SyncCodec>(sync: &Arc<DataSync>, value: T) -> Result<Arc<SyncValue<T>>> {
    let value = Arc::new(SyncValue::new(value));
    sync.add_data(Arc::clone(&value) as Arc<dyn SyncData>)?;
    Ok(value)
}
