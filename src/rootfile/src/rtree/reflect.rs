//! Type descriptions of the Rust values bound to leaves.
//!
//! Scalars, strings, fixed arrays, vectors and `Value` implement [`Reflect`]
//! out of the box. Structs opt in with [`impl_record!`](crate::impl_record),
//! which lists their members in declaration order together with an optional
//! shape annotation:
//!
//! ```ignore
//! #[derive(Default)]
//! struct Event {
//!     n: i32,
//!     xs: Vec<f32>,
//!     grid: [[f64; 3]; 2],
//! }
//!
//! rootfile::impl_record!(Event {
//!     n: i32,
//!     xs: Vec<f32> => "xs[n]",
//!     grid: [[f64; 3]; 2] => "grid[2][3]",
//! });
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use regex::Regex;

use crate::error::{Error, Result};
use crate::streamer::{BasicType, Record, StreamerInfo, Value};

/// StreamersFn lists the layouts of a record class and of the records it embeds.
pub type StreamersFn = fn() -> Result<Vec<StreamerInfo>>;

/// TypeDesc describes the Rust type of a bound value.
#[derive(Debug, Clone)]
pub enum TypeDesc {
    Basic(BasicType),
    Str,
    /// `[T; len]`
    Array { elem: Box<TypeDesc>, len: usize },
    /// `Vec<T>`
    Seq(Box<TypeDesc>),
    Record { class: String, streamers: StreamersFn },
    /// `Value`, accepting any leaf.
    Dynamic,
    /// A type that cannot be bound, with its name.
    Unsupported(String),
}

impl TypeDesc {
    /// name is the Rust spelling of the type, used in error messages.
    pub fn name(&self) -> String {
        match self {
            Self::Basic(t) => rust_name(*t).to_string(),
            Self::Str => "String".to_string(),
            Self::Array { elem, len } => format!("[{}; {}]", elem.name(), len),
            Self::Seq(elem) => format!("Vec<{}>", elem.name()),
            Self::Record { class, .. } => class.clone(),
            Self::Dynamic => "Value".to_string(),
            Self::Unsupported(name) => name.clone(),
        }
    }

    /// flatten returns the element type and dimensions of a (nested) array.
    pub fn flatten(&self) -> Option<(&TypeDesc, Vec<usize>)> {
        let mut dims = Vec::new();
        let mut cur = self;
        while let Self::Array { elem, len } = cur {
            dims.push(*len);
            cur = elem;
        }
        if dims.is_empty() {
            None
        } else {
            Some((cur, dims))
        }
    }

    pub fn is_integer(&self) -> bool {
        matches!(self, Self::Basic(t) if t.is_integer())
    }
}

pub(crate) fn rust_name(t: BasicType) -> &'static str {
    match t {
        BasicType::Bool => "bool",
        BasicType::I8 => "i8",
        BasicType::I16 => "i16",
        BasicType::I32 => "i32",
        BasicType::I64 => "i64",
        BasicType::U8 => "u8",
        BasicType::U16 => "u16",
        BasicType::U32 => "u32",
        BasicType::U64 => "u64",
        BasicType::F32 => "f32",
        BasicType::F64 => "f64",
    }
}

lazy_static! {
    static ref TYPE_PATH: Regex = Regex::new(r"[A-Za-z_][A-Za-z0-9_]*::").unwrap();
}

/// short_type_name strips module paths from a type name.
pub(crate) fn short_type_name<T: ?Sized>() -> String {
    TYPE_PATH
        .replace_all(std::any::type_name::<T>(), "")
        .into_owned()
}

/// FieldSpec describes one member of a record type.
pub struct FieldSpec<T> {
    /// member name in the Rust type.
    pub member: &'static str,
    /// shape annotation, `-` to skip the member.
    pub tag: Option<&'static str>,
    pub desc: TypeDesc,
    pub get: fn(&T) -> Value,
    pub set: fn(&mut T, Value) -> Result<()>,
}

impl<T> Clone for FieldSpec<T> {
    fn clone(&self) -> Self {
        Self {
            member: self.member,
            tag: self.tag,
            desc: self.desc.clone(),
            get: self.get,
            set: self.set,
        }
    }
}

/// Reflect converts a Rust value to and from decoded values.
pub trait Reflect: Send + 'static {
    fn type_desc() -> TypeDesc
    where
        Self: Sized;

    fn to_value(&self) -> Value;

    /// set_value stores a decoded value, resizing sequences as needed.
    fn set_value(&mut self, v: Value) -> Result<()>;

    /// record_fields lists the members of record types.
    fn record_fields() -> Option<Vec<FieldSpec<Self>>>
    where
        Self: Sized,
    {
        None
    }
}

fn mismatch<T: ?Sized>(v: &Value) -> Error {
    Error::binding(format!(
        "cannot store {} value into {}",
        v.kind_name(),
        short_type_name::<T>()
    ))
}

macro_rules! impl_basic {
    ($ty:ty, $basic:ident) => {
        impl Reflect for $ty {
            fn type_desc() -> TypeDesc {
                TypeDesc::Basic(BasicType::$basic)
            }

            fn to_value(&self) -> Value {
                Value::$basic(*self)
            }

            fn set_value(&mut self, v: Value) -> Result<()> {
                match v {
                    Value::$basic(v) => {
                        *self = v;
                        Ok(())
                    }
                    v => Err(mismatch::<$ty>(&v)),
                }
            }
        }
    };
}

impl_basic!(bool, Bool);
impl_basic!(i8, I8);
impl_basic!(i16, I16);
impl_basic!(i32, I32);
impl_basic!(i64, I64);
impl_basic!(u8, U8);
impl_basic!(u16, U16);
impl_basic!(u32, U32);
impl_basic!(u64, U64);
impl_basic!(f32, F32);
impl_basic!(f64, F64);

macro_rules! impl_unsupported {
    ($ty:ty) => {
        impl Reflect for $ty {
            fn type_desc() -> TypeDesc {
                TypeDesc::Unsupported(short_type_name::<$ty>())
            }

            fn to_value(&self) -> Value {
                Value::Array(Vec::new())
            }

            fn set_value(&mut self, v: Value) -> Result<()> {
                Err(mismatch::<$ty>(&v))
            }
        }
    };
}

impl_unsupported!(isize);
impl_unsupported!(usize);

impl<K: Send + 'static, V: Send + 'static> Reflect for HashMap<K, V> {
    fn type_desc() -> TypeDesc {
        TypeDesc::Unsupported(short_type_name::<Self>())
    }

    fn to_value(&self) -> Value {
        Value::Array(Vec::new())
    }

    fn set_value(&mut self, v: Value) -> Result<()> {
        Err(mismatch::<Self>(&v))
    }
}

impl<K: Send + 'static, V: Send + 'static> Reflect for BTreeMap<K, V> {
    fn type_desc() -> TypeDesc {
        TypeDesc::Unsupported(short_type_name::<Self>())
    }

    fn to_value(&self) -> Value {
        Value::Array(Vec::new())
    }

    fn set_value(&mut self, v: Value) -> Result<()> {
        Err(mismatch::<Self>(&v))
    }
}

impl Reflect for String {
    fn type_desc() -> TypeDesc {
        TypeDesc::Str
    }

    fn to_value(&self) -> Value {
        Value::Str(self.clone())
    }

    fn set_value(&mut self, v: Value) -> Result<()> {
        match v {
            Value::Str(s) => {
                *self = s;
                Ok(())
            }
            v => Err(mismatch::<String>(&v)),
        }
    }
}

impl Reflect for Value {
    fn type_desc() -> TypeDesc {
        TypeDesc::Dynamic
    }

    fn to_value(&self) -> Value {
        self.clone()
    }

    fn set_value(&mut self, v: Value) -> Result<()> {
        *self = v;
        Ok(())
    }
}

/// Arrays are exchanged as flat sequences of their basic elements, so nested
/// arrays reshape a flat value of the right length.
impl<T: Reflect, const N: usize> Reflect for [T; N] {
    fn type_desc() -> TypeDesc {
        TypeDesc::Array {
            elem: Box::new(T::type_desc()),
            len: N,
        }
    }

    fn to_value(&self) -> Value {
        let mut items = Vec::with_capacity(N);
        for x in self.iter() {
            match x.to_value() {
                Value::Array(inner) if matches!(T::type_desc(), TypeDesc::Array { .. }) => {
                    items.extend(inner)
                }
                v => items.push(v),
            }
        }
        Value::Array(items)
    }

    fn set_value(&mut self, v: Value) -> Result<()> {
        let items = match v {
            Value::Array(items) => items,
            v => return Err(mismatch::<Self>(&v)),
        };
        if N == 0 {
            return if items.is_empty() {
                Ok(())
            } else {
                Err(Error::binding(format!(
                    "cannot store {} elements into {}",
                    items.len(),
                    short_type_name::<Self>()
                )))
            };
        }
        if items.len() % N != 0 || (items.len() != N && !matches!(T::type_desc(), TypeDesc::Array { .. })) {
            return Err(Error::binding(format!(
                "cannot store {} elements into {}",
                items.len(),
                short_type_name::<Self>()
            )));
        }

        let chunk = items.len() / N;
        let mut items = items.into_iter();
        for slot in self.iter_mut() {
            let v = if matches!(T::type_desc(), TypeDesc::Array { .. }) {
                Value::Array(items.by_ref().take(chunk).collect())
            } else {
                match items.next() {
                    Some(v) => v,
                    None => break,
                }
            };
            slot.set_value(v)?;
        }
        Ok(())
    }
}

impl<T: Reflect + Default> Reflect for Vec<T> {
    fn type_desc() -> TypeDesc {
        TypeDesc::Seq(Box::new(T::type_desc()))
    }

    fn to_value(&self) -> Value {
        Value::Array(self.iter().map(|x| x.to_value()).collect())
    }

    fn set_value(&mut self, v: Value) -> Result<()> {
        let items = match v {
            Value::Array(items) => items,
            v => return Err(mismatch::<Self>(&v)),
        };
        self.resize_with(items.len(), T::default);
        for (slot, v) in self.iter_mut().zip(items) {
            slot.set_value(v)?;
        }
        Ok(())
    }
}

/// record_to_value converts a record type into a `Record` value whose fields
/// are named after the leaves they bind to.
pub fn record_to_value<T: Reflect>(x: &T) -> Value {
    let class = match T::type_desc() {
        TypeDesc::Record { class, .. } => class,
        other => other.name(),
    };
    let mut rec = Record::new(class, RECORD_VERSION);
    for spec in T::record_fields().unwrap_or_default() {
        if let Some(name) = crate::rtree::binder::leaf_name(&spec) {
            rec.fields.push((name, (spec.get)(x)));
        }
    }
    Value::Record(rec)
}

/// record_set_value stores a `Record` value into a record type. Fields
/// missing from the value keep their current content.
pub fn record_set_value<T: Reflect>(x: &mut T, v: Value) -> Result<()> {
    let rec = match v {
        Value::Record(rec) => rec,
        v => return Err(mismatch::<T>(&v)),
    };
    for spec in T::record_fields().unwrap_or_default() {
        let name = match crate::rtree::binder::leaf_name(&spec) {
            Some(name) => name,
            None => continue,
        };
        if let Some(v) = rec.get(&name) {
            (spec.set)(x, v.clone())?;
        }
    }
    Ok(())
}

/// Version of the layouts derived from record types.
pub const RECORD_VERSION: i16 = 1;

/// impl_record implements [`Reflect`](crate::rtree::Reflect) for a struct by
/// listing its members, each optionally followed by `=> "shape"`.
#[macro_export]
macro_rules! impl_record {
    ($ty:ident { $($field:ident : $fty:ty $(=> $tag:literal)?),* $(,)? }) => {
        impl $crate::rtree::Reflect for $ty {
            fn type_desc() -> $crate::rtree::TypeDesc {
                $crate::rtree::TypeDesc::Record {
                    class: stringify!($ty).to_string(),
                    streamers: $crate::rtree::record_streamers::<$ty>,
                }
            }

            fn to_value(&self) -> $crate::streamer::Value {
                $crate::rtree::record_to_value(self)
            }

            fn set_value(&mut self, v: $crate::streamer::Value) -> $crate::Result<()> {
                $crate::rtree::record_set_value(self, v)
            }

            fn record_fields() -> Option<Vec<$crate::rtree::FieldSpec<Self>>> {
                Some(vec![$(
                    $crate::rtree::FieldSpec {
                        member: stringify!($field),
                        tag: $crate::impl_record!(@tag $($tag)?),
                        desc: <$fty as $crate::rtree::Reflect>::type_desc(),
                        get: |x: &$ty| $crate::rtree::Reflect::to_value(&x.$field),
                        set: |x: &mut $ty, v| $crate::rtree::Reflect::set_value(&mut x.$field, v),
                    },
                )*])
            }
        }
    };
    (@tag) => { None };
    (@tag $tag:literal) => { Some($tag) };
}

/// Slot is a value shared between its owner and a reader or writer.
pub struct Slot<T>(Arc<Mutex<T>>);

impl<T> Clone for Slot<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Slot<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Slot").field(&*self.0.lock()).finish()
    }
}

impl<T: Default> Default for Slot<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> Slot<T> {
    pub fn new(v: T) -> Self {
        Self(Arc::new(Mutex::new(v)))
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.0.lock()
    }

    pub fn set(&self, v: T) {
        *self.0.lock() = v;
    }
}

impl<T: Clone> Slot<T> {
    pub fn get(&self) -> T {
        self.0.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use crate::rtree::{Reflect, TypeDesc};
    use crate::streamer::{BasicType, Value};

    #[derive(Debug, Default, PartialEq)]
    struct Hit {
        n: i32,
        xs: Vec<f32>,
        grid: [[i16; 3]; 2],
        label: String,
    }

    crate::impl_record!(Hit {
        n: i32,
        xs: Vec<f32> => "Xs[n]",
        grid: [[i16; 3]; 2],
        label: String,
    });

    #[test]
    fn test_type_desc() {
        assert!(matches!(i32::type_desc(), TypeDesc::Basic(BasicType::I32)));
        assert_eq!(<[[f32; 3]; 2]>::type_desc().name(), "[[f32; 3]; 2]");
        let desc = <[[f32; 3]; 2]>::type_desc();
        let (elem, dims) = desc.flatten().unwrap();
        assert!(matches!(elem, TypeDesc::Basic(BasicType::F32)));
        assert_eq!(dims, vec![2, 3]);
        assert_eq!(isize::type_desc().name(), "isize");
        assert_eq!(HashMap::<String, i32>::type_desc().name(), "HashMap<String, i32>");
        assert_eq!(Hit::type_desc().name(), "Hit");
    }

    #[test]
    fn test_array_reshape() {
        let mut grid = [[0_i16; 3]; 2];
        let flat: Vec<Value> = (1..=6).map(Value::I16).collect();
        grid.set_value(Value::Array(flat.clone())).unwrap();
        assert_eq!(grid, [[1, 2, 3], [4, 5, 6]]);
        assert_eq!(grid.to_value(), Value::Array(flat));
        assert!(grid.set_value(Value::Array(vec![Value::I16(1)])).is_err());
        assert!(grid.set_value(Value::I16(1)).is_err());
    }

    #[test]
    fn test_vec_resize() {
        let mut xs = vec![1.0_f32; 5];
        xs.set_value(Value::Array(vec![Value::F32(2.5), Value::F32(3.5)]))
            .unwrap();
        assert_eq!(xs, vec![2.5, 3.5]);
        assert!(xs.set_value(Value::Array(vec![Value::I32(1)])).is_err());
    }

    #[test]
    fn test_record_value() {
        let hit = Hit {
            n: 2,
            xs: vec![1.5, 2.5],
            grid: [[1, 2, 3], [4, 5, 6]],
            label: "h".to_string(),
        };
        let v = hit.to_value();
        let rec = v.as_record().unwrap();
        assert_eq!(rec.class, "Hit");
        assert_eq!(rec.get("Xs"), Some(&Value::Array(vec![Value::F32(1.5), Value::F32(2.5)])));

        let mut back = Hit::default();
        back.set_value(v).unwrap();
        assert_eq!(back, hit);
    }
}
