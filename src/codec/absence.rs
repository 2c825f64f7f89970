//! Top-level `None` detection for serde values.
//!
//! Only `Option::None` (directly or through newtype wrappers) is absent.
//! Unit structs, `()` and `serde_json::Value::Null` also encode as JSON
//! `null` but are real messages.

use std::fmt;

use serde::ser::{self, Impossible, Serialize, Serializer};

/// Whether `value` serializes as a top-level `None`.
pub(crate) fn is_none<T: ?Sized + Serialize>(value: &T) -> bool {
    matches!(value.serialize(NoneDetector), Ok(true))
}

/// Error that stops the walk at the first compound value; such values are
/// never absent.
#[derive(Debug)]
struct Present;

impl fmt::Display for Present {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("value is present")
    }
}

impl std::error::Error for Present {}

impl ser::Error for Present {
    fn custom<M: fmt::Display>(_msg: M) -> Self {
        Present
    }
}

struct NoneDetector;

macro_rules! present {
    ($($method:ident($ty:ty)),* $(,)?) => {
        $(
            fn $method(self, _value: $ty) -> Result<bool, Present> {
                Ok(false)
            }
        )*
    };
}

impl Serializer for NoneDetector {
    type Ok = bool;
    type Error = Present;

    type SerializeSeq = Impossible<bool, Present>;
    type SerializeTuple = Impossible<bool, Present>;
    type SerializeTupleStruct = Impossible<bool, Present>;
    type SerializeTupleVariant = Impossible<bool, Present>;
    type SerializeMap = Impossible<bool, Present>;
    type SerializeStruct = Impossible<bool, Present>;
    type SerializeStructVariant = Impossible<bool, Present>;

    present! {
        serialize_bool(bool),
        serialize_i8(i8),
        serialize_i16(i16),
        serialize_i32(i32),
        serialize_i64(i64),
        serialize_u8(u8),
        serialize_u16(u16),
        serialize_u32(u32),
        serialize_u64(u64),
        serialize_f32(f32),
        serialize_f64(f64),
        serialize_char(char),
        serialize_str(&str),
        serialize_bytes(&[u8]),
        serialize_unit_struct(&'static str),
    }

    fn serialize_none(self) -> Result<bool, Present> {
        Ok(true)
    }

    fn serialize_some<T: ?Sized + Serialize>(self, _value: &T) -> Result<bool, Present> {
        Ok(false)
    }

    fn serialize_unit(self) -> Result<bool, Present> {
        Ok(false)
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
    ) -> Result<bool, Present> {
        Ok(false)
    }

    fn serialize_newtype_struct<T: ?Sized + Serialize>(
        self,
        _name: &'static str,
        value: &T,
    ) -> Result<bool, Present> {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T: ?Sized + Serialize>(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _value: &T,
    ) -> Result<bool, Present> {
        Ok(false)
    }

    fn serialize_seq(self, _len: Option<usize>) -> Result<Self::SerializeSeq, Present> {
        Err(Present)
    }

    fn serialize_tuple(self, _len: usize) -> Result<Self::SerializeTuple, Present> {
        Err(Present)
    }

    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleStruct, Present> {
        Err(Present)
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleVariant, Present> {
        Err(Present)
    }

    fn serialize_map(self, _len: Option<usize>) -> Result<Self::SerializeMap, Present> {
        Err(Present)
    }

    fn serialize_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeStruct, Present> {
        Err(Present)
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeStructVariant, Present> {
        Err(Present)
    }
}
