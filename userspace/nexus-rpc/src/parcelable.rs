// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Typed encoding on top of [`Parcel`].

use crate::error::{Result, RpcError};
use crate::object::RemoteObject;
use crate::parcel::Parcel;

/// Values that know their own positional encoding.
pub trait Parcelable: Sized {
    /// Appends `self` to `parcel`.
    fn write_to(&self, parcel: &mut Parcel) -> Result<()>;

    /// Reads a value from the current cursor.
    fn read_from(parcel: &mut Parcel) -> Result<Self>;
}

macro_rules! primitive_parcelable {
    ($($ty:ty => $write:ident, $read:ident;)*) => {
        $(
            impl Parcelable for $ty {
                fn write_to(&self, parcel: &mut Parcel) -> Result<()> {
                    parcel.$write(*self)
                }

                fn read_from(parcel: &mut Parcel) -> Result<Self> {
                    parcel.$read()
                }
            }
        )*
    };
}

primitive_parcelable! {
    bool => write_bool, read_bool;
    i8 => write_i8, read_i8;
    u8 => write_u8, read_u8;
    i16 => write_i16, read_i16;
    u16 => write_u16, read_u16;
    i32 => write_i32, read_i32;
    u32 => write_u32, read_u32;
    i64 => write_i64, read_i64;
    u64 => write_u64, read_u64;
    f32 => write_f32, read_f32;
    f64 => write_f64, read_f64;
}

impl Parcelable for String {
    fn write_to(&self, parcel: &mut Parcel) -> Result<()> {
        parcel.write_string(self)
    }

    fn read_from(parcel: &mut Parcel) -> Result<Self> {
        parcel.read_string()
    }
}

/// String field encoded as UTF-16 on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Utf16String(pub String);

impl From<&str> for Utf16String {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl Parcelable for Utf16String {
    fn write_to(&self, parcel: &mut Parcel) -> Result<()> {
        parcel.write_string16(&self.0)
    }

    fn read_from(parcel: &mut Parcel) -> Result<Self> {
        parcel.read_string16().map(Self)
    }
}

impl<T: Parcelable> Parcelable for Option<T> {
    fn write_to(&self, parcel: &mut Parcel) -> Result<()> {
        match self {
            Some(value) => {
                parcel.write_bool(true)?;
                value.write_to(parcel)
            }
            None => parcel.write_bool(false),
        }
    }

    fn read_from(parcel: &mut Parcel) -> Result<Self> {
        if parcel.read_bool()? {
            T::read_from(parcel).map(Some)
        } else {
            Ok(None)
        }
    }
}

/// Every encoded element occupies at least one word, which bounds how many
/// elements a truthful count can announce.
impl<T: Parcelable> Parcelable for Vec<T> {
    fn write_to(&self, parcel: &mut Parcel) -> Result<()> {
        let len = u32::try_from(self.len()).map_err(|_| RpcError::OutOfMemory)?;
        parcel.write_u32(len)?;
        self.iter().try_for_each(|item| item.write_to(parcel))
    }

    fn read_from(parcel: &mut Parcel) -> Result<Self> {
        let len = parcel.read_u32()? as usize;
        if len > parcel.data_available() / 4 {
            return Err(parcel.poison());
        }
        (0..len).map(|_| T::read_from(parcel)).collect()
    }
}

impl Parcelable for RemoteObject {
    fn write_to(&self, parcel: &mut Parcel) -> Result<()> {
        parcel.write_remote_object(self)
    }

    fn read_from(parcel: &mut Parcel) -> Result<Self> {
        parcel.read_remote_object()
    }
}
