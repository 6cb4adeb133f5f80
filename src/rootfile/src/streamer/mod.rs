//! Versioned class layouts ("streamers") and the codec that walks them.

mod codec;
mod info_io;
mod registry;
mod value;

use std::fmt::{Display, Formatter};

pub use codec::{read_record, read_value, write_record, write_value};
pub use info_io::{read_streamer_info, write_streamer_info};
pub use registry::StreamerRegistry;
pub use value::{Record, Value};

use crate::error::{Error, Result};
use crate::rbytes::{RBuffer, WBuffer};

/// Element type codes shared by streamer elements and leaves.
pub mod codes {
    pub const CHAR: i32 = 1;
    pub const SHORT: i32 = 2;
    pub const INT: i32 = 3;
    pub const LONG: i32 = 4;
    pub const FLOAT: i32 = 5;
    pub const COUNTER: i32 = 6;
    pub const DOUBLE: i32 = 8;
    pub const UCHAR: i32 = 11;
    pub const USHORT: i32 = 12;
    pub const UINT: i32 = 13;
    pub const ULONG: i32 = 14;
    pub const BITS: i32 = 15;
    pub const LONG64: i32 = 16;
    pub const ULONG64: i32 = 17;
    pub const BOOL: i32 = 18;

    /// Added to a basic code for fixed-size arrays.
    pub const OFFSET_L: i32 = 20;
    /// Added to a basic code for arrays counted by another member.
    pub const OFFSET_P: i32 = 40;

    pub const OBJECT: i32 = 61;
    pub const ANY: i32 = 62;
    pub const OBJECT_P: i32 = 63;
    pub const OBJECT_PP: i32 = 64;
    pub const TSTRING: i32 = 65;
    pub const ANY_P: i32 = 67;
    pub const STL: i32 = 300;
    pub const STL_STRING: i32 = 365;
    pub const STREAMER: i32 = 500;

    pub const STL_VECTOR: i32 = 1;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BasicType {
    Bool,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
}

impl BasicType {
    pub fn size(&self) -> usize {
        match self {
            Self::Bool | Self::I8 | Self::U8 => 1,
            Self::I16 | Self::U16 => 2,
            Self::I32 | Self::U32 | Self::F32 => 4,
            Self::I64 | Self::U64 | Self::F64 => 8,
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            Self::Bool => codes::BOOL,
            Self::I8 => codes::CHAR,
            Self::I16 => codes::SHORT,
            Self::I32 => codes::INT,
            Self::I64 => codes::LONG64,
            Self::U8 => codes::UCHAR,
            Self::U16 => codes::USHORT,
            Self::U32 => codes::UINT,
            Self::U64 => codes::ULONG64,
            Self::F32 => codes::FLOAT,
            Self::F64 => codes::DOUBLE,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        let t = match code {
            codes::BOOL => Self::Bool,
            codes::CHAR => Self::I8,
            codes::SHORT => Self::I16,
            codes::INT | codes::COUNTER => Self::I32,
            codes::LONG | codes::LONG64 => Self::I64,
            codes::UCHAR => Self::U8,
            codes::USHORT => Self::U16,
            codes::UINT | codes::BITS => Self::U32,
            codes::ULONG | codes::ULONG64 => Self::U64,
            codes::FLOAT => Self::F32,
            codes::DOUBLE => Self::F64,
            _ => return None,
        };
        Some(t)
    }

    pub fn is_integer(&self) -> bool {
        !matches!(self, Self::Bool | Self::F32 | Self::F64)
    }

    pub fn is_unsigned(&self) -> bool {
        matches!(self, Self::U8 | Self::U16 | Self::U32 | Self::U64)
    }

    /// type_name is the name used in streamer elements.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Bool => "Bool_t",
            Self::I8 => "Char_t",
            Self::I16 => "Short_t",
            Self::I32 => "Int_t",
            Self::I64 => "Long64_t",
            Self::U8 => "UChar_t",
            Self::U16 => "UShort_t",
            Self::U32 => "UInt_t",
            Self::U64 => "ULong64_t",
            Self::F32 => "Float_t",
            Self::F64 => "Double_t",
        }
    }

    /// cxx_name is the name used inside container type names.
    pub fn cxx_name(&self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::I8 => "char",
            Self::I16 => "short",
            Self::I32 => "int",
            Self::I64 => "Long64_t",
            Self::U8 => "unsigned char",
            Self::U16 => "unsigned short",
            Self::U32 => "unsigned int",
            Self::U64 => "ULong64_t",
            Self::F32 => "float",
            Self::F64 => "double",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let t = match name {
            "bool" | "Bool_t" => Self::Bool,
            "char" | "Char_t" | "int8_t" => Self::I8,
            "short" | "Short_t" | "int16_t" => Self::I16,
            "int" | "Int_t" | "int32_t" => Self::I32,
            "long" | "Long_t" | "Long64_t" | "long long" | "int64_t" => Self::I64,
            "unsigned char" | "UChar_t" | "uint8_t" => Self::U8,
            "unsigned short" | "UShort_t" | "uint16_t" => Self::U16,
            "unsigned int" | "UInt_t" | "uint32_t" => Self::U32,
            "unsigned long" | "ULong_t" | "ULong64_t" | "unsigned long long" | "uint64_t" => {
                Self::U64
            }
            "float" | "Float_t" => Self::F32,
            "double" | "Double_t" => Self::F64,
            _ => return None,
        };
        Some(t)
    }

    pub fn read(&self, r: &mut RBuffer) -> Result<Value> {
        let v = match self {
            Self::Bool => Value::Bool(r.read_bool()?),
            Self::I8 => Value::I8(r.read_i8()?),
            Self::I16 => Value::I16(r.read_i16()?),
            Self::I32 => Value::I32(r.read_i32()?),
            Self::I64 => Value::I64(r.read_i64()?),
            Self::U8 => Value::U8(r.read_u8()?),
            Self::U16 => Value::U16(r.read_u16()?),
            Self::U32 => Value::U32(r.read_u32()?),
            Self::U64 => Value::U64(r.read_u64()?),
            Self::F32 => Value::F32(r.read_f32()?),
            Self::F64 => Value::F64(r.read_f64()?),
        };
        Ok(v)
    }

    pub fn write(&self, w: &mut WBuffer, v: &Value) -> Result<()> {
        match (self, v) {
            (Self::Bool, Value::Bool(v)) => w.write_bool(*v),
            (Self::I8, Value::I8(v)) => w.write_i8(*v),
            (Self::I16, Value::I16(v)) => w.write_i16(*v),
            (Self::I32, Value::I32(v)) => w.write_i32(*v),
            (Self::I64, Value::I64(v)) => w.write_i64(*v),
            (Self::U8, Value::U8(v)) => w.write_u8(*v),
            (Self::U16, Value::U16(v)) => w.write_u16(*v),
            (Self::U32, Value::U32(v)) => w.write_u32(*v),
            (Self::U64, Value::U64(v)) => w.write_u64(*v),
            (Self::F32, Value::F32(v)) => w.write_f32(*v),
            (Self::F64, Value::F64(v)) => w.write_f64(*v),
            (t, v) => {
                return Err(Error::binding(format!(
                    "cannot write {} value as {}",
                    v.kind_name(),
                    t.type_name()
                )))
            }
        }
        Ok(())
    }

    pub fn zero(&self) -> Value {
        match self {
            Self::Bool => Value::Bool(false),
            Self::I8 => Value::I8(0),
            Self::I16 => Value::I16(0),
            Self::I32 => Value::I32(0),
            Self::I64 => Value::I64(0),
            Self::U8 => Value::U8(0),
            Self::U16 => Value::U16(0),
            Self::U32 => Value::U32(0),
            Self::U64 => Value::U64(0),
            Self::F32 => Value::F32(0.0),
            Self::F64 => Value::F64(0.0),
        }
    }
}

/// MAX_ARRAY_LEN bounds the number of elements of a fixed array.
pub const MAX_ARRAY_LEN: usize = 1 << 20;

/// ElementKind describes the shape of a record field or of a tree leaf.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ElementKind {
    Basic(BasicType),
    /// A fixed-size, possibly multi-dimensional, array of a basic type.
    FixedArray { elem: BasicType, dims: Vec<usize> },
    /// An array whose length is the current value of the named count field.
    Counted { elem: BasicType, count: String },
    String,
    Record { class: String },
    /// A length-prefixed sequence.
    Vector(Box<ElementKind>),
}

impl ElementKind {
    pub fn type_name(&self) -> String {
        match self {
            Self::Basic(t) | Self::FixedArray { elem: t, .. } => t.type_name().to_string(),
            Self::Counted { elem, .. } => format!("{}*", elem.type_name()),
            Self::String => "TString".to_string(),
            Self::Record { class } => class.clone(),
            Self::Vector(elem) => {
                let inner = match elem.as_ref() {
                    Self::Basic(t) => t.cxx_name().to_string(),
                    Self::String => "string".to_string(),
                    other => other.type_name(),
                };
                if inner.ends_with('>') {
                    format!("vector<{} >", inner)
                } else {
                    format!("vector<{}>", inner)
                }
            }
        }
    }

    /// from_type_name parses a container element type name.
    pub fn from_type_name(name: &str) -> Self {
        let name = name.trim();
        if let Some(inner) = name
            .strip_prefix("vector<")
            .and_then(|s| s.strip_suffix('>'))
        {
            return Self::Vector(Box::new(Self::from_type_name(inner)));
        }
        match name {
            "string" | "TString" | "std::string" => Self::String,
            _ => match BasicType::from_name(name) {
                Some(t) => Self::Basic(t),
                None => Self::Record {
                    class: name.to_string(),
                },
            },
        }
    }

    /// array_len is the number of basic elements of a fixed array, or None
    /// when it exceeds MAX_ARRAY_LEN.
    pub fn array_len(dims: &[usize]) -> Option<usize> {
        dims.iter()
            .try_fold(1_usize, |n, d| n.checked_mul(*d))
            .filter(|n| *n <= MAX_ARRAY_LEN)
    }

    /// check_dims validates array dimensions decoded from a file.
    pub(crate) fn check_dims(dims: &[usize]) -> Result<usize> {
        Self::array_len(dims)
            .ok_or_else(|| Error::corrupted(format!("invalid array dimensions {:?}", dims)))
    }

    pub fn zero(&self) -> Value {
        match self {
            Self::Basic(t) => t.zero(),
            Self::FixedArray { elem, dims } => {
                Value::Array(vec![elem.zero(); Self::array_len(dims).unwrap_or(0)])
            }
            Self::Counted { .. } | Self::Vector(_) => Value::Array(Vec::new()),
            Self::String => Value::Str(String::new()),
            Self::Record { class } => Value::Record(Record::new(class, 0)),
        }
    }
}

impl Display for ElementKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FixedArray { elem, dims } => {
                write!(f, "{}", elem.type_name())?;
                for d in dims {
                    write!(f, "[{}]", d)?;
                }
                Ok(())
            }
            Self::Counted { elem, count } => write!(f, "{}[{}]", elem.type_name(), count),
            other => write!(f, "{}", other.type_name()),
        }
    }
}

/// FieldDesc is one member of a class layout.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldDesc {
    pub name: String,
    pub kind: ElementKind,
}

impl FieldDesc {
    pub fn new(name: impl Into<String>, kind: ElementKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// StreamerInfo is the layout of one version of a class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamerInfo {
    pub class: String,
    pub version: i16,
    pub checksum: u32,
    pub fields: Vec<FieldDesc>,
}

impl StreamerInfo {
    pub fn new(class: impl Into<String>, version: i16, fields: Vec<FieldDesc>) -> Self {
        let class = class.into();
        let checksum = Self::compute_checksum(&class, &fields);
        Self {
            class,
            version,
            checksum,
            fields,
        }
    }

    fn compute_checksum(class: &str, fields: &[FieldDesc]) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(class.as_bytes());
        for f in fields {
            hasher.update(f.name.as_bytes());
            hasher.update(f.kind.to_string().as_bytes());
        }
        hasher.finalize()
    }

    pub fn field(&self, name: &str) -> Option<&FieldDesc> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// same_layout reports whether both describe the same fields, ignoring the checksum.
    pub fn same_layout(&self, other: &StreamerInfo) -> bool {
        self.class == other.class && self.version == other.version && self.fields == other.fields
    }
}
