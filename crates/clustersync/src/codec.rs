//! Encodings of replicated values.
//!
//! Scalars are fixed width and big-endian. A vector is its elements back
//! to back; the element count follows from the payload length. Anything
//! serde can handle is available through [`Cbor`].

use bytes::{Buf, BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{ProtocolError, Result};

/// A value that can be carried by a [`SyncValue`](crate::SyncValue).
pub trait SyncCodec: Clone + Send + Sync + 'static {
    fn encode(&self, buf: &mut BytesMut) -> Result<()>;
    fn decode(bytes: &[u8]) -> Result<Self>;
}

/// A scalar with a fixed encoded width.
pub trait FixedWidth: Copy + Send + Sync + 'static {
    const WIDTH: usize;
    const NAME: &'static str;

    fn put(self, buf: &mut BytesMut);
    /// `bytes` is exactly `WIDTH` long.
    fn get(bytes: &[u8]) -> Self;
}

macro_rules! fixed_width {
    ($ty:ty, $width:expr, $put:ident, $get:ident) => {
        impl FixedWidth for $ty {
            const WIDTH: usize = $width;
            const NAME: &'static str = stringify!($ty);

            fn put(self, buf: &mut BytesMut) {
                buf.$put(self);
            }

            fn get(mut bytes: &[u8]) -> Self {
                bytes.$get()
            }
        }

        impl SyncCodec for $ty {
            fn encode(&self, buf: &mut BytesMut) -> Result<()> {
                self.put(buf);
                Ok(())
            }

            fn decode(bytes: &[u8]) -> Result<Self> {
                if bytes.len() != Self::WIDTH {
                    return Err(ProtocolError::Decode {
                        what: Self::NAME,
                        reason: format!("expected {} bytes, got {}", Self::WIDTH, bytes.len()),
                    });
                }
                Ok(Self::get(bytes))
            }
        }
    };
}

fixed_width!(i32, 4, put_i32, get_i32);
fixed_width!(i64, 8, put_i64, get_i64);
fixed_width!(f32, 4, put_f32, get_f32);
fixed_width!(f64, 8, put_f64, get_f64);

impl FixedWidth for bool {
    const WIDTH: usize = 1;
    const NAME: &'static str = "bool";

    fn put(self, buf: &mut BytesMut) {
        buf.put_u8(u8::from(self));
    }

    fn get(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }
}

impl SyncCodec for bool {
    fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        self.put(buf);
        Ok(())
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        match bytes {
            [b] => Ok(*b != 0),
            _ => Err(ProtocolError::Decode {
                what: "bool",
                reason: format!("expected 1 byte, got {}", bytes.len()),
            }),
        }
    }
}

impl<T: FixedWidth> SyncCodec for Vec<T> {
    fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        buf.reserve(self.len() * T::WIDTH);
        for item in self {
            item.put(buf);
        }
        Ok(())
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() % T::WIDTH != 0 {
            return Err(ProtocolError::Decode {
                what: T::NAME,
                reason: format!(
                    "vector payload of {} bytes is not a multiple of {}",
                    bytes.len(),
                    T::WIDTH
                ),
            });
        }
        Ok(bytes.chunks_exact(T::WIDTH).map(T::get).collect())
    }
}

/// Wrapper replicating any serde type, encoded as CBOR.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Cbor<T>(pub T);

impl<T> SyncCodec for Cbor<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        ciborium::into_writer(&self.0, buf.writer()).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        ciborium::from_reader(bytes)
            .map(Cbor)
            .map_err(|e| ProtocolError::Decode {
                what: "cbor value",
                reason: e.to_string(),
            })
    }
}
