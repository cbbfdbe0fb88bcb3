//! Message envelope: typed payloads to flat field records and back
//!
//! Entries carry a flat record of named string fields rather than an opaque
//! blob, so generic tooling (`XRANGE`, dashboards) can read them. A [`Codec`]
//! converts one payload type to and from such a record.
//!
//! - [`FlatCodec`] maps each top-level struct field onto a record field.
//!   Strings are stored verbatim, other scalars in their textual form, nested
//!   structures and sequences as one JSON-encoded field, `None` is omitted.
//!   Decoding is type-directed, so a `String` field holding `"42"` stays a
//!   string.
//!
//!   Two kinds of value do not survive a round trip. Non-finite floats
//!   serialize as JSON null and are omitted like `None`, so a plain `f64`
//!   field holding NaN fails to decode as missing. Self-describing targets
//!   such as `serde_json::Value` have no type to direct them, so numeric or
//!   boolean text comes back as a number or boolean. Use [`JsonCodec`] for
//!   such payloads.
//! - [`JsonCodec`] stores the whole payload as JSON under a single `data` field.
//!
//! Field names starting with `__` are reserved for the envelope itself.

use serde::de::value::{Error as ValueError, MapAccessDeserializer, MapDeserializer};
use serde::de::{self, DeserializeOwned, IntoDeserializer, Visitor};
use serde::{Deserializer, Serialize};
use std::collections::BTreeMap;

use crate::error::{QueueError, QueueResult};

/// Flat wire record of an entry
pub type Fields = BTreeMap<String, String>;

/// Prefix of envelope-owned field names
pub const RESERVED_PREFIX: &str = "__";

pub(crate) const PRIORITY_FIELD: &str = "__priority";
pub(crate) const CORRELATION_FIELD: &str = "__correlation_id";
pub(crate) const SOURCE_ID_FIELD: &str = "__source_id";
pub(crate) const DELIVERIES_FIELD: &str = "__deliveries";
pub(crate) const REASON_FIELD: &str = "__reason";
/// Set by a log backend on an entry whose raw fields could not be read as text
pub(crate) const MALFORMED_FIELD: &str = "__malformed";

/// Converts payloads of type `T` to and from flat field records
pub trait Codec<T>: Send + Sync + 'static {
    fn encode(&self, payload: &T) -> QueueResult<Fields>;

    /// Decode a record. Reserved envelope fields have already been removed.
    fn decode(&self, fields: &Fields) -> Result<T, String>;
}

/// One record field per top-level payload field
#[derive(Debug, Clone, Copy, Default)]
pub struct FlatCodec;

impl<T> Codec<T> for FlatCodec
where
    T: Serialize + DeserializeOwned,
{
    fn encode(&self, payload: &T) -> QueueResult<Fields> {
        let value = serde_json::to_value(payload)?;
        let serde_json::Value::Object(map) = value else {
            return Err(QueueError::EncodeFailed(
                "payload must serialize to a struct or map of named fields".to_string(),
            ));
        };

        let mut fields = Fields::new();
        for (name, value) in map {
            if name.starts_with(RESERVED_PREFIX) {
                return Err(QueueError::EncodeFailed(format!(
                    "field name '{}' uses the reserved prefix '{}'",
                    name, RESERVED_PREFIX
                )));
            }
            let raw = match value {
                serde_json::Value::Null => continue,
                serde_json::Value::String(s) => s,
                serde_json::Value::Bool(b) => b.to_string(),
                serde_json::Value::Number(n) => n.to_string(),
                nested @ (serde_json::Value::Array(_) | serde_json::Value::Object(_)) => {
                    serde_json::to_string(&nested)?
                }
            };
            fields.insert(name, raw);
        }
        Ok(fields)
    }

    fn decode(&self, fields: &Fields) -> Result<T, String> {
        let pairs = fields
            .iter()
            .map(|(name, raw)| (name.as_str(), FieldValue(raw.as_str())));
        let mut map = MapDeserializer::<_, ValueError>::new(pairs);
        let value =
            T::deserialize(MapAccessDeserializer::new(&mut map)).map_err(|e| e.to_string())?;
        map.end().map_err(|e| e.to_string())?;
        Ok(value)
    }
}

/// Whole payload as JSON in a single `data` field
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl JsonCodec {
    pub const FIELD: &'static str = "data";
}

impl<T> Codec<T> for JsonCodec
where
    T: Serialize + DeserializeOwned,
{
    fn encode(&self, payload: &T) -> QueueResult<Fields> {
        let json = serde_json::to_string(payload)?;
        Ok(Fields::from([(Self::FIELD.to_string(), json)]))
    }

    fn decode(&self, fields: &Fields) -> Result<T, String> {
        let raw = fields
            .get(Self::FIELD)
            .ok_or_else(|| format!("missing field `{}`", Self::FIELD))?;
        serde_json::from_str(raw).map_err(|e| e.to_string())
    }
}

/// Split a raw record into its envelope fields and payload fields
pub(crate) fn split_envelope(fields: &Fields) -> (Fields, Fields) {
    fields
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .partition(|(k, _)| k.starts_with(RESERVED_PREFIX))
}

/// Deserializer over one textual record field, guided by the target type
#[derive(Debug, Clone, Copy)]
struct FieldValue<'a>(&'a str);

impl FieldValue<'_> {
    fn parse<T: std::str::FromStr>(&self, what: &str) -> Result<T, ValueError> {
        self.0
            .parse()
            .map_err(|_| de::Error::custom(format!("invalid {} '{}'", what, self.0)))
    }

    fn json(&self) -> Result<serde_json::Value, ValueError> {
        serde_json::from_str(self.0).map_err(de::Error::custom)
    }
}

impl<'de> IntoDeserializer<'de, ValueError> for FieldValue<'_> {
    type Deserializer = Self;

    fn into_deserializer(self) -> Self {
        self
    }
}

macro_rules! parse_scalar {
    ($($method:ident => $visit:ident : $ty:ty),* $(,)?) => {
        $(
            fn $method<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
                visitor.$visit(self.parse::<$ty>(stringify!($ty))?)
            }
        )*
    };
}

impl<'de> Deserializer<'de> for FieldValue<'_> {
    type Error = ValueError;

    fn deserialize_any<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        match serde_json::from_str::<serde_json::Value>(self.0) {
            Ok(serde_json::Value::String(_)) | Err(_) => visitor.visit_str(self.0),
            Ok(value) => value.deserialize_any(visitor).map_err(de::Error::custom),
        }
    }

    parse_scalar! {
        deserialize_bool => visit_bool: bool,
        deserialize_i8 => visit_i8: i8,
        deserialize_i16 => visit_i16: i16,
        deserialize_i32 => visit_i32: i32,
        deserialize_i64 => visit_i64: i64,
        deserialize_i128 => visit_i128: i128,
        deserialize_u8 => visit_u8: u8,
        deserialize_u16 => visit_u16: u16,
        deserialize_u32 => visit_u32: u32,
        deserialize_u64 => visit_u64: u64,
        deserialize_u128 => visit_u128: u128,
        deserialize_f32 => visit_f32: f32,
        deserialize_f64 => visit_f64: f64,
        deserialize_char => visit_char: char,
    }

    fn deserialize_str<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        visitor.visit_str(self.0)
    }

    fn deserialize_string<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        visitor.visit_string(self.0.to_string())
    }

    fn deserialize_identifier<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        visitor.visit_str(self.0)
    }

    fn deserialize_bytes<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        self.json()?
            .deserialize_bytes(visitor)
            .map_err(de::Error::custom)
    }

    fn deserialize_byte_buf<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        self.json()?
            .deserialize_byte_buf(visitor)
            .map_err(de::Error::custom)
    }

    fn deserialize_option<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        // Absent fields decode to None before reaching here.
        visitor.visit_some(self)
    }

    fn deserialize_unit<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        visitor.visit_unit()
    }

    fn deserialize_unit_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> Result<V::Value, Self::Error> {
        visitor.visit_unit()
    }

    fn deserialize_newtype_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> Result<V::Value, Self::Error> {
        visitor.visit_newtype_struct(self)
    }

    fn deserialize_seq<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        self.json()?.deserialize_seq(visitor).map_err(de::Error::custom)
    }

    fn deserialize_tuple<V: Visitor<'de>>(
        self,
        len: usize,
        visitor: V,
    ) -> Result<V::Value, Self::Error> {
        self.json()?
            .deserialize_tuple(len, visitor)
            .map_err(de::Error::custom)
    }

    fn deserialize_tuple_struct<V: Visitor<'de>>(
        self,
        name: &'static str,
        len: usize,
        visitor: V,
    ) -> Result<V::Value, Self::Error> {
        self.json()?
            .deserialize_tuple_struct(name, len, visitor)
            .map_err(de::Error::custom)
    }

    fn deserialize_map<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        self.json()?.deserialize_map(visitor).map_err(de::Error::custom)
    }

    fn deserialize_struct<V: Visitor<'de>>(
        self,
        name: &'static str,
        fields: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, Self::Error> {
        self.json()?
            .deserialize_struct(name, fields, visitor)
            .map_err(de::Error::custom)
    }

    fn deserialize_enum<V: Visitor<'de>>(
        self,
        name: &'static str,
        variants: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, Self::Error> {
        match self.json() {
            Ok(value @ serde_json::Value::Object(_)) => value
                .deserialize_enum(name, variants, visitor)
                .map_err(de::Error::custom),
            _ => visitor.visit_enum(IntoDeserializer::<'de, ValueError>::into_deserializer(
                self.0,
            )),
        }
    }

    fn deserialize_ignored_any<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        visitor.visit_unit()
    }
}
