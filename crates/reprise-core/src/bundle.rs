//! The external state bundle and the encoders that move slot values in and
//! out of it.
//!
//! A [`Bundle`] only stores primitives. Types with no primitive encoding need
//! an explicit [`Saver`]; [`JsonSaver`] packs any serde type into a string.

use std::any::{Any, TypeId, type_name};
use std::collections::BTreeMap;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::Result;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum BundleValue {
    Bool(bool),
    Int(i64),
    Float(#[serde(with = "float_repr")] f64),
    Str(String),
}

// JSON has no NaN or infinities; those travel as strings.
mod float_repr {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &f64, s: S) -> Result<S::Ok, S::Error> {
        if v.is_nan() {
            s.serialize_str("NaN")
        } else if *v == f64::INFINITY {
            s.serialize_str("inf")
        } else if *v == f64::NEG_INFINITY {
            s.serialize_str("-inf")
        } else {
            s.serialize_f64(*v)
        }
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Num(f64),
        Text(String),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
        match Repr::deserialize(d)? {
            Repr::Num(v) => Ok(v),
            Repr::Text(t) => match t.as_str() {
                "NaN" => Ok(f64::NAN),
                "inf" => Ok(f64::INFINITY),
                "-inf" => Ok(f64::NEG_INFINITY),
                other => Err(serde::de::Error::custom(format!(
                    "`{other}` is not a float"
                ))),
            },
        }
    }
}

/// Primitive key/value store the host keeps across process recreation.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Bundle {
    entries: BTreeMap<String, BundleValue>,
}

impl Bundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&BundleValue> {
        self.entries.get(key)
    }

    pub fn put(&mut self, key: impl Into<String>, value: BundleValue) {
        self.entries.insert(key.into(), value);
    }

    pub fn remove(&mut self, key: &str) -> Option<BundleValue> {
        self.entries.remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Encoder/decoder pair for a persistent slot.
pub trait Saver<T>: 'static {
    fn save(&self, value: &T) -> Option<BundleValue>;
    fn restore(&self, saved: &BundleValue) -> Option<T>;
}

/// Saver for the built-in primitive kinds.
pub struct PrimitiveSaver<T>(PhantomData<fn() -> T>);

impl<T> Default for PrimitiveSaver<T> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<T: 'static> Saver<T> for PrimitiveSaver<T> {
    fn save(&self, value: &T) -> Option<BundleValue> {
        encode_primitive(value)
    }

    fn restore(&self, saved: &BundleValue) -> Option<T> {
        decode_primitive(saved)
    }
}

/// Stores any serde type as a JSON string entry.
pub struct JsonSaver<T>(PhantomData<fn() -> T>);

impl<T> Default for JsonSaver<T> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<T: Serialize + DeserializeOwned + 'static> Saver<T> for JsonSaver<T> {
    fn save(&self, value: &T) -> Option<BundleValue> {
        match serde_json::to_string(value) {
            Ok(s) => Some(BundleValue::Str(s)),
            Err(e) => {
                log::warn!("JsonSaver: cannot encode {}: {e}", type_name::<T>());
                None
            }
        }
    }

    fn restore(&self, saved: &BundleValue) -> Option<T> {
        match saved {
            BundleValue::Str(s) => serde_json::from_str(s).ok(),
            _ => None,
        }
    }
}

/// Saver built from a pair of closures.
pub struct FnSaver<S, R> {
    save: S,
    restore: R,
}

pub fn saver<T, S, R>(save: S, restore: R) -> FnSaver<S, R>
where
    S: Fn(&T) -> Option<BundleValue> + 'static,
    R: Fn(&BundleValue) -> Option<T> + 'static,
{
    FnSaver { save, restore }
}

impl<T, S, R> Saver<T> for FnSaver<S, R>
where
    S: Fn(&T) -> Option<BundleValue> + 'static,
    R: Fn(&BundleValue) -> Option<T> + 'static,
{
    fn save(&self, value: &T) -> Option<BundleValue> {
        (self.save)(value)
    }

    fn restore(&self, saved: &BundleValue) -> Option<T> {
        (self.restore)(saved)
    }
}

macro_rules! int_kinds {
    ($($t:ty),*) => {
        const INT_KINDS: &[fn() -> TypeId] = &[$(TypeId::of::<$t>),*];

        fn encode_int(v: &dyn Any) -> Option<BundleValue> {
            $(
                if let Some(i) = v.downcast_ref::<$t>() {
                    return i64::try_from(*i).ok().map(BundleValue::Int);
                }
            )*
            None
        }

        fn decode_int<T: 'static>(i: i64) -> Option<T> {
            $(
                if TypeId::of::<T>() == TypeId::of::<$t>() {
                    let v: Box<dyn Any> = Box::new(<$t>::try_from(i).ok()?);
                    return v.downcast::<T>().ok().map(|b| *b);
                }
            )*
            None
        }
    };
}

int_kinds!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize);

/// Whether `T` can live in a bundle without an explicit saver.
pub fn is_primitive<T: 'static>() -> bool {
    let id = TypeId::of::<T>();
    id == TypeId::of::<bool>()
        || id == TypeId::of::<f32>()
        || id == TypeId::of::<f64>()
        || id == TypeId::of::<String>()
        || INT_KINDS.iter().any(|k| k() == id)
}

pub(crate) fn encode_primitive<T: 'static>(value: &T) -> Option<BundleValue> {
    let v = value as &dyn Any;
    if let Some(b) = v.downcast_ref::<bool>() {
        return Some(BundleValue::Bool(*b));
    }
    if let Some(f) = v.downcast_ref::<f32>() {
        return Some(BundleValue::Float(f64::from(*f)));
    }
    if let Some(f) = v.downcast_ref::<f64>() {
        return Some(BundleValue::Float(*f));
    }
    if let Some(s) = v.downcast_ref::<String>() {
        return Some(BundleValue::Str(s.clone()));
    }
    encode_int(v)
}

pub(crate) fn decode_primitive<T: 'static>(saved: &BundleValue) -> Option<T> {
    let boxed: Box<dyn Any> = match saved {
        BundleValue::Bool(b) => Box::new(*b),
        BundleValue::Str(s) => Box::new(s.clone()),
        BundleValue::Float(f) if TypeId::of::<T>() == TypeId::of::<f32>() => Box::new(*f as f32),
        BundleValue::Float(f) => Box::new(*f),
        BundleValue::Int(i) => return decode_int::<T>(*i),
    };
    boxed.downcast::<T>().ok().map(|b| *b)
}
